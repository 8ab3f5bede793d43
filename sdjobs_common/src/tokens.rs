use std::{env, fmt, fs, path::PathBuf, str::FromStr};

use anyhow::Result;
use thiserror::Error;
use tracing::warn;

/// Environment variable read by `env` without a name.
pub const DEFAULT_TOKEN_VAR: &str = "HUGGING_FACE_HUB_TOKEN";

/// Where the Hugging Face token comes from.
///
/// Written on the command line as `literal:<token>`, `env[:<var>]`, `path:<file>`, `cache` or `none`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    Literal(String),
    EnvVar(String),
    Path(PathBuf),
    /// `~/.cache/huggingface/token`, as written by `huggingface-cli login`.
    CacheToken,
    None,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseTokenSourceError {
    #[error("token source `{0}` needs a value, e.g. `{0}:<value>`")]
    MissingValue(&'static str),
    #[error("unknown token source `{0}`, expected one of literal, env, path, cache or none")]
    Unknown(String),
}

#[derive(Debug, Error)]
enum TokenError {
    #[error("no home directory to find the cached Hugging Face token in")]
    NoHome,
}

impl FromStr for TokenSource {
    type Err = ParseTokenSourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = match s.split_once(':') {
            Some((kind, value)) => (kind, Some(value)),
            None => (s, None),
        };
        let required = |kind: &'static str| value.ok_or(ParseTokenSourceError::MissingValue(kind));
        match kind {
            "literal" => Ok(Self::Literal(required("literal")?.to_string())),
            "env" => Ok(Self::EnvVar(value.unwrap_or(DEFAULT_TOKEN_VAR).to_string())),
            "path" => Ok(Self::Path(required("path")?.into())),
            "cache" => Ok(Self::CacheToken),
            "none" => Ok(Self::None),
            other => Err(ParseTokenSourceError::Unknown(other.to_string())),
        }
    }
}

impl fmt::Display for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => write!(f, "literal:{value}"),
            Self::EnvVar(var) => write!(f, "env:{var}"),
            Self::Path(path) => write!(f, "path:{}", path.display()),
            Self::CacheToken => write!(f, "cache"),
            Self::None => write!(f, "none"),
        }
    }
}

impl TokenSource {
    /// Raw token text, or `None` when the source is unset or unreadable.
    fn read(&self) -> Result<Option<String>> {
        let read_file = |path: &PathBuf| match fs::read_to_string(path) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("could not read HF token from {}: {e}", path.display());
                None
            }
        };
        Ok(match self {
            Self::Literal(token) => Some(token.clone()),
            Self::EnvVar(var) => match env::var(var) {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!("could not read HF token from ${var}: {e}");
                    None
                }
            },
            Self::Path(path) => read_file(path),
            Self::CacheToken => {
                let home = dirs::home_dir().ok_or(TokenError::NoHome)?;
                read_file(&home.join(".cache").join("huggingface").join("token"))
            }
            Self::None => None,
        })
    }
}

/// Resolve the token for `source`, trimmed. Unreadable or blank tokens are logged and no token
/// is used.
pub fn get_token(source: &TokenSource) -> Result<Option<String>> {
    Ok(source
        .read()?
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty()))
}
