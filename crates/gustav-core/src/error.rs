use std::path::PathBuf;

use thiserror::Error;

use crate::hooks::HookPoint;

/// Failure kinds surfaced by the experiment core.
#[derive(Debug, Error)]
pub enum GustavError {
    /// Missing or inconsistent settings, malformed range strings, unknown
    /// template tokens and similar problems detected before or while running.
    #[error("config error: {0}")]
    Config(String),
    /// A non-repeating stimulus cursor ran out of tokens.
    #[error("stimulus set '{set}' is exhausted after {count} tokens")]
    StimulusExhausted { set: String, count: usize },
    /// The frontend returned a token outside the valid and quit keys.
    #[error("invalid response '{0}'")]
    ResponseInvalid(String),
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("hook '{name}' failed during {point}: {source}")]
    Hook {
        name: String,
        point: HookPoint,
        #[source]
        source: anyhow::Error,
    },
}

impl GustavError {
    pub fn config(message: impl Into<String>) -> Self {
        GustavError::Config(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        GustavError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for errors caused by the settings rather than by the run itself.
    pub fn is_config(&self) -> bool {
        matches!(self, GustavError::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, GustavError>;
