//! Stimulus sets and their cursors.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{GustavError, Result};
use crate::range::OrderPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StimKind {
    /// Files enumerated from `path`; advanced by the runner every trial.
    #[default]
    Soundfiles,
    /// Tokens advanced by user hooks only.
    Manual,
}

fn default_mask() -> String {
    "*.wav;*.WAV".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimSetConfig {
    pub name: String,
    #[serde(default)]
    pub kind: StimKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Semicolon-delimited glob masks.
    #[serde(default = "default_mask")]
    pub mask: String,
    /// Per-token metadata, one `<stem> <keywords> <text...>` line each.
    #[serde(default)]
    pub text: Option<PathBuf>,
    /// Explicit tokens for manual sets.
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default)]
    pub order: OrderPolicy,
    #[serde(default)]
    pub repeat: bool,
}

impl StimSetConfig {
    pub fn new(name: impl Into<String>, kind: StimKind) -> Self {
        Self {
            name: name.into(),
            kind,
            path: None,
            mask: default_mask(),
            text: None,
            tokens: Vec::new(),
            order: OrderPolicy::Natural,
            repeat: false,
        }
    }
}

/// One stimulus as seen by hooks and templates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Token {
    pub path: Option<PathBuf>,
    pub basename: String,
    pub stem: String,
    pub text: String,
    pub keywords: usize,
    /// Position in the enumerated token list.
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextEntry {
    pub stem: String,
    pub keywords: usize,
    pub text: String,
}

/// Parses a stimulus text file, keeping file order.
pub fn parse_text_file(contents: &str) -> Vec<TextEntry> {
    let mut entries = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(stem) = parts.next() else { continue };
        let rest: Vec<&str> = parts.collect();
        let (keywords, text) = match rest.first().and_then(|s| s.parse::<usize>().ok()) {
            Some(n) => (n, rest[1..].join(" ")),
            None => (0, rest.join(" ")),
        };
        entries.push(TextEntry {
            stem: stem.to_string(),
            keywords,
            text,
        });
    }
    entries
}

fn build_mask(mask: &str) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    let mut any = false;
    for pattern in mask.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let glob = Glob::new(pattern)
            .map_err(|err| GustavError::config(format!("bad glob '{}': {}", pattern, err)))?;
        builder.add(glob);
        any = true;
    }
    if !any {
        builder.add(Glob::new("*").map_err(|err| GustavError::config(err.to_string()))?);
    }
    builder
        .build()
        .map_err(|err| GustavError::config(format!("bad glob mask '{}': {}", mask, err)))
}

/// Lists files directly inside `dir` whose names match `mask`, sorted by name.
pub fn enumerate_files(dir: &Path, mask: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(GustavError::config(format!(
            "stimulus path {} is not a directory",
            dir.display()
        )));
    }
    let globset = build_mask(mask)?;
    let mut files = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
    {
        let entry = entry.map_err(|err| {
            GustavError::io(
                dir,
                err.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if globset.is_match(entry.file_name()) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn read_text_entries(config: &StimSetConfig) -> Result<Vec<TextEntry>> {
    let Some(text) = &config.text else {
        return Ok(Vec::new());
    };
    let path = match (&config.path, text.is_absolute()) {
        (Some(base), false) => base.join(text),
        _ => text.clone(),
    };
    let contents = fs::read_to_string(&path).map_err(|err| GustavError::io(&path, err))?;
    Ok(parse_text_file(&contents))
}

/// Iteration state over one stimulus set.
#[derive(Debug, Clone)]
pub struct StimCursor {
    pub name: String,
    pub kind: StimKind,
    tokens: Vec<Token>,
    policy: OrderPolicy,
    repeat: bool,
    order: Vec<usize>,
    pos: usize,
    current: Option<Token>,
    rng: StdRng,
}

impl StimCursor {
    /// Resolves the set's tokens and the initial traversal order.
    pub fn from_config(config: &StimSetConfig, seed: u64) -> Result<Self> {
        let entries = read_text_entries(config)?;
        let by_stem: BTreeMap<&str, &TextEntry> =
            entries.iter().map(|e| (e.stem.as_str(), e)).collect();

        let tokens: Vec<Token> = match config.kind {
            StimKind::Soundfiles => {
                let dir = config.path.as_ref().ok_or_else(|| {
                    GustavError::config(format!("stimulus set '{}' has no path", config.name))
                })?;
                let files = enumerate_files(dir, &config.mask)?;
                if files.is_empty() {
                    return Err(GustavError::config(format!(
                        "stimulus set '{}': no files in {} match '{}'",
                        config.name,
                        dir.display(),
                        config.mask
                    )));
                }
                files
                    .into_iter()
                    .enumerate()
                    .map(|(index, path)| {
                        let basename = path
                            .file_name()
                            .map(|s| s.to_string_lossy().to_string())
                            .unwrap_or_default();
                        let stem = path
                            .file_stem()
                            .map(|s| s.to_string_lossy().to_string())
                            .unwrap_or_default();
                        let (text, keywords) = by_stem
                            .get(stem.as_str())
                            .map(|e| (e.text.clone(), e.keywords))
                            .unwrap_or_default();
                        Token {
                            path: Some(path),
                            basename,
                            stem,
                            text,
                            keywords,
                            index,
                        }
                    })
                    .collect()
            }
            StimKind::Manual if !config.tokens.is_empty() => config
                .tokens
                .iter()
                .enumerate()
                .map(|(index, name)| {
                    let (text, keywords) = by_stem
                        .get(name.as_str())
                        .map(|e| (e.text.clone(), e.keywords))
                        .unwrap_or_default();
                    Token {
                        path: config.path.as_ref().map(|p| p.join(name)),
                        basename: name.clone(),
                        stem: name.clone(),
                        text,
                        keywords,
                        index,
                    }
                })
                .collect(),
            StimKind::Manual => entries
                .iter()
                .enumerate()
                .map(|(index, e)| Token {
                    path: None,
                    basename: e.stem.clone(),
                    stem: e.stem.clone(),
                    text: e.text.clone(),
                    keywords: e.keywords,
                    index,
                })
                .collect(),
        };

        let cursor = Self::from_tokens(
            &config.name,
            config.kind,
            tokens,
            config.order.clone(),
            config.repeat,
            seed,
        )?;
        debug!(set = %cursor.name, tokens = cursor.len(), order = %cursor.policy, "stimulus set ready");
        Ok(cursor)
    }

    pub fn from_tokens(
        name: &str,
        kind: StimKind,
        tokens: Vec<Token>,
        policy: OrderPolicy,
        repeat: bool,
        seed: u64,
    ) -> Result<Self> {
        if policy.is_interactive() {
            return Err(GustavError::config(format!(
                "stimulus set '{}': order '{}' is only valid for variables",
                name, policy
            )));
        }
        if let OrderPolicy::Explicit(range) = &policy {
            if let Some(max) = range.max_index() {
                if max >= tokens.len() {
                    return Err(GustavError::config(format!(
                        "stimulus set '{}': order references token {} but only {} exist",
                        name,
                        max + 1,
                        tokens.len()
                    )));
                }
            }
        }
        let mut cursor = Self {
            name: name.to_string(),
            kind,
            tokens,
            policy,
            repeat,
            order: Vec::new(),
            pos: 0,
            current: None,
            rng: StdRng::seed_from_u64(seed),
        };
        cursor.reset();
        Ok(cursor)
    }

    /// Re-resolves the traversal order and rewinds to the first token.
    pub fn reset(&mut self) {
        self.order = match &self.policy {
            OrderPolicy::Random => {
                let mut order: Vec<usize> = (0..self.tokens.len()).collect();
                order.shuffle(&mut self.rng);
                order
            }
            OrderPolicy::Explicit(range) => range.resolve(&mut self.rng),
            _ => (0..self.tokens.len()).collect(),
        };
        self.pos = 0;
    }

    /// Advances to the next token, wrapping when the set repeats.
    pub fn next(&mut self) -> Result<&Token> {
        if self.pos >= self.order.len() {
            if !self.repeat || self.order.is_empty() {
                return Err(GustavError::StimulusExhausted {
                    set: self.name.clone(),
                    count: self.order.len(),
                });
            }
            debug!(set = %self.name, "stimulus set wrapped");
            self.reset();
        }
        let token = self.tokens[self.order[self.pos]].clone();
        self.pos += 1;
        Ok(self.current.insert(token))
    }

    pub fn current(&self) -> Option<&Token> {
        self.current.as_ref()
    }

    /// Traversal order of the current pass.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Tokens left before the cursor wraps or is exhausted.
    pub fn remaining(&self) -> usize {
        self.order.len().saturating_sub(self.pos)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gustav_stim_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    fn named_tokens(names: &[&str]) -> Vec<Token> {
        names
            .iter()
            .enumerate()
            .map(|(index, n)| Token {
                basename: n.to_string(),
                stem: n.to_string(),
                index,
                ..Token::default()
            })
            .collect()
    }

    #[test]
    fn natural_non_repeating_cursor_exhausts() {
        let mut cursor = StimCursor::from_tokens(
            "s",
            StimKind::Manual,
            named_tokens(&["a", "b"]),
            OrderPolicy::Natural,
            false,
            1,
        )
        .expect("cursor");
        assert_eq!(cursor.next().expect("first").stem, "a");
        assert_eq!(cursor.next().expect("second").stem, "b");
        match cursor.next() {
            Err(GustavError::StimulusExhausted { set, count }) => {
                assert_eq!(set, "s");
                assert_eq!(count, 2);
            }
            other => panic!("expected exhaustion, got {:?}", other.map(|t| t.clone())),
        }
        assert_eq!(cursor.current().expect("current kept").stem, "b");
    }

    #[test]
    fn repeating_random_cursor_wraps_with_fresh_order() {
        let mut cursor = StimCursor::from_tokens(
            "s",
            StimKind::Soundfiles,
            named_tokens(&["a", "b", "c", "d"]),
            OrderPolicy::Random,
            true,
            99,
        )
        .expect("cursor");
        let mut seen: Vec<String> = Vec::new();
        for _ in 0..4 {
            seen.push(cursor.next().expect("token").stem.clone());
        }
        assert_eq!(cursor.remaining(), 0);
        seen.push(cursor.next().expect("wrap").stem.clone());
        assert_eq!(cursor.remaining(), 3);
        for _ in 0..3 {
            seen.push(cursor.next().expect("token").stem.clone());
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "a", "b", "b", "c", "c", "d", "d"]);
    }

    #[test]
    fn repeated_resets_give_permutations_of_the_same_tokens() {
        let names: Vec<String> = (0..12).map(|i| format!("t{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut cursor = StimCursor::from_tokens(
            "s",
            StimKind::Manual,
            named_tokens(&refs),
            OrderPolicy::Random,
            false,
            5,
        )
        .expect("cursor");
        let first = cursor.order().to_vec();
        let mut distinct = false;
        for _ in 0..5 {
            cursor.reset();
            let mut sorted = cursor.order().to_vec();
            if sorted != first {
                distinct = true;
            }
            sorted.sort_unstable();
            assert_eq!(sorted, (0..12).collect::<Vec<_>>());
        }
        assert!(distinct, "reshuffles should not all repeat the first order");
    }

    #[test]
    fn explicit_order_selects_tokens_and_is_bounds_checked() {
        let order: OrderPolicy = "3,1".parse().expect("order");
        let mut cursor = StimCursor::from_tokens(
            "s",
            StimKind::Manual,
            named_tokens(&["a", "b", "c"]),
            order,
            false,
            1,
        )
        .expect("cursor");
        assert_eq!(cursor.next().expect("first").stem, "c");
        assert_eq!(cursor.next().expect("second").stem, "a");
        assert!(cursor.next().is_err());

        let order: OrderPolicy = "4".parse().expect("order");
        assert!(StimCursor::from_tokens(
            "s",
            StimKind::Manual,
            named_tokens(&["a", "b", "c"]),
            order,
            false,
            1
        )
        .is_err());
    }

    #[test]
    fn prompt_order_is_rejected_for_stimuli() {
        let err = StimCursor::from_tokens(
            "s",
            StimKind::Manual,
            named_tokens(&["a"]),
            OrderPolicy::Prompt,
            false,
            1,
        )
        .expect_err("prompt is not a stimulus order");
        assert!(err.is_config());
    }

    #[test]
    fn text_file_lines_carry_keywords_and_text() {
        let entries = parse_text_file("# sentences\ns01 4 the boy fell from the window\n\ns02 hello there\n");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].stem, "s01");
        assert_eq!(entries[0].keywords, 4);
        assert_eq!(entries[0].text, "the boy fell from the window");
        assert_eq!(entries[1].keywords, 0);
        assert_eq!(entries[1].text, "hello there");
    }

    #[test]
    fn soundfile_set_enumerates_matching_files_with_text() {
        let dir = scratch_dir("files");
        for name in ["b.wav", "a.wav", "c.WAV", "notes.txt"] {
            fs::write(dir.join(name), b"x").expect("write stim");
        }
        fs::write(dir.join("list.txt"), "a 2 red apple\nc 1 blue\n").expect("write text");
        let mut config = StimSetConfig::new("sent", StimKind::Soundfiles);
        config.path = Some(dir.clone());
        config.text = Some(PathBuf::from("list.txt"));
        let mut cursor = StimCursor::from_config(&config, 3).expect("cursor");
        assert_eq!(cursor.len(), 3);
        let first = cursor.next().expect("first").clone();
        assert_eq!(first.basename, "a.wav");
        assert_eq!(first.text, "red apple");
        assert_eq!(first.keywords, 2);
        assert_eq!(cursor.next().expect("second").basename, "b.wav");
        assert_eq!(cursor.next().expect("third").text, "blue");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn soundfile_set_without_path_is_a_config_error() {
        let config = StimSetConfig::new("sent", StimKind::Soundfiles);
        let err = StimCursor::from_config(&config, 1).expect_err("missing path");
        assert!(err.is_config());
    }

    #[test]
    fn manual_set_uses_explicit_tokens() {
        let mut config = StimSetConfig::new("words", StimKind::Manual);
        config.tokens = vec!["ba".to_string(), "da".to_string()];
        let mut cursor = StimCursor::from_config(&config, 1).expect("cursor");
        assert_eq!(cursor.next().expect("token").stem, "ba");
    }
}
