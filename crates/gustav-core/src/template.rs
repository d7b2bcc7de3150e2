//! `$token` substitution for log, data and path strings.
//!
//! `$name` style tokens expand to values, `$var[x]` style tokens take a
//! bracketed argument (optionally quoted), and the `@` sigil is the header
//! form that emits keys instead of values. Token names are matched by
//! longest prefix, so `$name_$subj` expands both tokens.

use serde::{Deserialize, Serialize};

use crate::error::{GustavError, Result};

/// What to do with `$tokens` that are not recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateMode {
    #[default]
    Strict,
    Passthrough,
}

/// Tokens that never take an argument.
const SCALARS: &[&str] = &[
    "name",
    "note",
    "comment",
    "host",
    "subj",
    "date",
    "time",
    "block",
    "blocks",
    "trial",
    "trial_block",
    "condition",
    "conditions",
    "response",
];

/// Tokens with a bracketed argument. `currentvars*` default to `,`.
const BRACKETED: &[&str] = &[
    "var",
    "currentvars",
    "currentvarsvals",
    "stim_file",
    "stim_text",
    "stim_kw",
    "stim_ind",
    "user",
    "dynamic",
];

const HEADER: &[&str] = &["var", "currentvars", "currentvarsvals", "user", "dynamic"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sigil {
    Value,
    Key,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece<'a> {
    Literal(&'a str),
    Token {
        sigil: Sigil,
        name: &'static str,
        arg: Option<String>,
        raw: &'a str,
    },
    /// A `$identifier` that matched no known token.
    Unknown(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    Sigil,
}

/// Values a template can refer to.
pub trait TemplateSource {
    /// `$name`, `$subj`, `$block`, ... (see [`SCALARS`]).
    fn scalar(&self, name: &str) -> Option<String>;
    /// Current level of a variable.
    fn var(&self, name: &str) -> Option<String>;
    /// `(name, level)` pairs of the current condition, in declaration order.
    fn current_vars(&self) -> Vec<(String, String)>;
    /// `field` is one of `file`, `text`, `kw`, `ind`.
    fn stim(&self, set: &str, field: &str) -> Option<String>;
    fn user(&self, key: &str) -> Option<String>;
    fn dynamic(&self, key: &str) -> Option<String>;
}

fn longest_match(rest: &str, names: &[&'static str]) -> Option<&'static str> {
    names
        .iter()
        .copied()
        .filter(|name| rest.starts_with(name))
        .max_by_key(|name| name.len())
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

/// Splits `[arg]` off the front of `rest`. Returns the argument and the
/// number of bytes consumed.
fn bracket_arg(rest: &str) -> Option<(String, usize)> {
    let inner = rest.strip_prefix('[')?;
    let quote = inner.chars().next().filter(|c| *c == '\'' || *c == '"');
    match quote {
        Some(q) => {
            let body = &inner[1..];
            let close = body.find(q)?;
            let after = &body[close + 1..];
            if !after.starts_with(']') {
                return None;
            }
            Some((body[..close].to_string(), 1 + 1 + close + 1 + 1))
        }
        None => {
            let close = inner.find(']')?;
            Some((inner[..close].to_string(), close + 2))
        }
    }
}

/// Tokenizes a template into literals and tokens.
pub fn tokenize(template: &str) -> Vec<Piece<'_>> {
    let mut pieces = Vec::new();
    let mut state = State::Text;
    let mut literal_start = 0;
    let mut i = 0;
    while i < template.len() {
        let c = match template[i..].chars().next() {
            Some(c) => c,
            None => break,
        };
        match state {
            State::Text => {
                if c == '$' || c == '@' {
                    state = State::Sigil;
                    continue;
                }
                i += c.len_utf8();
            }
            State::Sigil => {
                state = State::Text;
                let sigil = if c == '$' { Sigil::Value } else { Sigil::Key };
                let rest = &template[i + 1..];
                let starts_ident = rest.chars().next().map(is_ident_start).unwrap_or(false);
                if !starts_ident {
                    i += 1;
                    continue;
                }
                let names: Vec<&'static str> = match sigil {
                    Sigil::Value => SCALARS.iter().chain(BRACKETED.iter()).copied().collect(),
                    Sigil::Key => HEADER.to_vec(),
                };
                let matched = longest_match(rest, &names);
                let token = matched.and_then(|name| {
                    let after = &rest[name.len()..];
                    if SCALARS.contains(&name) && sigil == Sigil::Value {
                        return Some((name, None, name.len()));
                    }
                    match bracket_arg(after) {
                        Some((arg, used)) => Some((name, Some(arg), name.len() + used)),
                        None if name.starts_with("currentvars") => Some((name, None, name.len())),
                        None => None,
                    }
                });
                match token {
                    Some((name, arg, used)) => {
                        if literal_start < i {
                            pieces.push(Piece::Literal(&template[literal_start..i]));
                        }
                        let end = i + 1 + used;
                        pieces.push(Piece::Token {
                            sigil,
                            name,
                            arg,
                            raw: &template[i..end],
                        });
                        i = end;
                        literal_start = end;
                    }
                    None if sigil == Sigil::Value => {
                        if literal_start < i {
                            pieces.push(Piece::Literal(&template[literal_start..i]));
                        }
                        let ident_len = rest
                            .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
                            .unwrap_or(rest.len());
                        let mut end = i + 1 + ident_len;
                        if let Some((_, used)) = bracket_arg(&template[end..]) {
                            end += used;
                        }
                        pieces.push(Piece::Unknown(&template[i..end]));
                        i = end;
                        literal_start = end;
                    }
                    // `@` in ordinary text (addresses, decorations) stays literal.
                    None => i += 1,
                }
            }
        }
    }
    if literal_start < template.len() {
        pieces.push(Piece::Literal(&template[literal_start..]));
    }
    pieces
}

fn expand<S: TemplateSource + ?Sized>(
    source: &S,
    sigil: Sigil,
    name: &str,
    arg: Option<&str>,
) -> Option<String> {
    let sep = arg.unwrap_or(",");
    match (sigil, name) {
        (Sigil::Value, "var") => source.var(arg?),
        (Sigil::Value, "currentvars") => Some(
            source
                .current_vars()
                .into_iter()
                .map(|(_, level)| level)
                .collect::<Vec<_>>()
                .join(sep),
        ),
        (Sigil::Value, "currentvarsvals") => Some(
            source
                .current_vars()
                .into_iter()
                .map(|(name, level)| format!("{} = {}", name, level))
                .collect::<Vec<_>>()
                .join(sep),
        ),
        (Sigil::Value, "stim_file") => source.stim(arg?, "file"),
        (Sigil::Value, "stim_text") => source.stim(arg?, "text"),
        (Sigil::Value, "stim_kw") => source.stim(arg?, "kw"),
        (Sigil::Value, "stim_ind") => source.stim(arg?, "ind"),
        (Sigil::Value, "user") => source.user(arg?),
        (Sigil::Value, "dynamic") => source.dynamic(arg?),
        (Sigil::Value, scalar) => source.scalar(scalar),
        (Sigil::Key, "currentvars") | (Sigil::Key, "currentvarsvals") => Some(
            source
                .current_vars()
                .into_iter()
                .map(|(name, _)| name)
                .collect::<Vec<_>>()
                .join(sep),
        ),
        (Sigil::Key, _) => arg.map(str::to_string),
    }
}

/// Renders a template against `source`.
pub fn render<S: TemplateSource + ?Sized>(
    template: &str,
    source: &S,
    mode: TemplateMode,
) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    for piece in tokenize(template) {
        match piece {
            Piece::Literal(text) => out.push_str(text),
            Piece::Token {
                sigil,
                name,
                arg,
                raw,
            } => match expand(source, sigil, name, arg.as_deref()) {
                Some(value) => out.push_str(&value),
                None if mode == TemplateMode::Passthrough => out.push_str(raw),
                None => {
                    return Err(GustavError::config(format!(
                        "template token '{}' has no value",
                        raw
                    )))
                }
            },
            Piece::Unknown(raw) => {
                if mode == TemplateMode::Strict {
                    return Err(GustavError::config(format!(
                        "unknown template token '{}'",
                        raw
                    )));
                }
                out.push_str(raw);
            }
        }
    }
    Ok(out)
}
