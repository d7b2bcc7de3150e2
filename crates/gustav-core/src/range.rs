//! Range strings and ordering policies.
//!
//! A range string lists 1-based indices, e.g. `1:5, 20, 22` or `r,1:3`:
//!
//! ```text
//! range := token ("," token)*
//! token := INT | INT ":" INT | INT "-" INT | "r" | "random" | "rand"
//! ```
//!
//! Parsed indices are stored 0-based.

use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{GustavError, Result};

/// Parsed range string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSpec {
    /// 0-based indices in the order they were written.
    pub indices: Vec<usize>,
    /// Set when the string carried an `r`/`rand`/`random` token.
    pub randomize: bool,
}

impl RangeSpec {
    /// Returns the index list, shuffled when the range asked for it.
    pub fn resolve<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<usize> {
        let mut out = self.indices.clone();
        if self.randomize {
            out.shuffle(rng);
        }
        out
    }

    /// Largest index referenced, if any.
    pub fn max_index(&self) -> Option<usize> {
        self.indices.iter().copied().max()
    }
}

fn is_random_token(token: &str) -> bool {
    matches!(token, "r" | "rand" | "random")
}

fn parse_index(raw: &str, source: &str) -> Result<usize> {
    let value: usize = raw.trim().parse().map_err(|_| {
        GustavError::config(format!("malformed range '{}': '{}' is not an index", source, raw))
    })?;
    if value == 0 {
        return Err(GustavError::config(format!(
            "malformed range '{}': indices are 1-based",
            source
        )));
    }
    Ok(value - 1)
}

/// Parses a 1-based range string into 0-based indices.
pub fn parse_range(source: &str) -> Result<RangeSpec> {
    let mut indices = Vec::new();
    let mut randomize = false;
    if source.trim().is_empty() {
        return Err(GustavError::config("malformed range: empty string"));
    }
    for token in source.split(',') {
        let token = token.trim();
        if token.is_empty() {
            return Err(GustavError::config(format!(
                "malformed range '{}': empty token",
                source
            )));
        }
        if is_random_token(&token.to_ascii_lowercase()) {
            randomize = true;
            continue;
        }
        let bounds = token.split_once(':').or_else(|| token.split_once('-'));
        match bounds {
            Some((lo, hi)) => {
                let lo = parse_index(lo, source)?;
                let hi = parse_index(hi, source)?;
                if lo <= hi {
                    indices.extend(lo..=hi);
                } else {
                    indices.extend((hi..=lo).rev());
                }
            }
            None => indices.push(parse_index(token, source)?),
        }
    }
    Ok(RangeSpec { indices, randomize })
}

/// Renders 0-based indices back into the 1-based grammar, folding runs of
/// consecutive values into `a:b`.
pub fn unparse_range(indices: &[usize]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut i = 0;
    while i < indices.len() {
        let start = indices[i];
        let mut end = start;
        while i + 1 < indices.len() && indices[i + 1] == end + 1 {
            end += 1;
            i += 1;
        }
        if end > start {
            parts.push(format!("{}:{}", start + 1, end + 1));
        } else {
            parts.push(format!("{}", start + 1));
        }
        i += 1;
    }
    parts.join(",")
}

/// How conditions or stimulus tokens are ordered.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OrderPolicy {
    #[default]
    Natural,
    Random,
    /// The operator chooses the condition before every block.
    Prompt,
    /// The operator builds the whole order once, before the first block.
    Menu,
    Explicit(RangeSpec),
}

impl OrderPolicy {
    pub fn is_interactive(&self) -> bool {
        matches!(self, OrderPolicy::Prompt | OrderPolicy::Menu)
    }
}

impl FromStr for OrderPolicy {
    type Err = GustavError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "natural" => Ok(OrderPolicy::Natural),
            "random" | "rand" | "r" => Ok(OrderPolicy::Random),
            "prompt" => Ok(OrderPolicy::Prompt),
            "menu" => Ok(OrderPolicy::Menu),
            _ => parse_range(s).map(OrderPolicy::Explicit),
        }
    }
}

impl TryFrom<String> for OrderPolicy {
    type Error = GustavError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl fmt::Display for OrderPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderPolicy::Natural => write!(f, "natural"),
            OrderPolicy::Random => write!(f, "random"),
            OrderPolicy::Prompt => write!(f, "prompt"),
            OrderPolicy::Menu => write!(f, "menu"),
            OrderPolicy::Explicit(spec) => {
                if spec.randomize {
                    write!(f, "random,")?;
                }
                let parts: Vec<String> =
                    spec.indices.iter().map(|i| (i + 1).to_string()).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

impl From<OrderPolicy> for String {
    fn from(value: OrderPolicy) -> Self {
        value.to_string()
    }
}
