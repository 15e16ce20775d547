use thiserror::Error;

use crate::application::repos::RepoError;

/// A collection read failed. Cloneable so every single-flight joiner gets
/// the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("backend read of `{table}` failed: {message}")]
    Backend { table: String, message: String },
    #[error("failed to decode `{table}` rows: {message}")]
    Decode { table: String, message: String },
    #[error("invalid page request: {0}")]
    InvalidPage(String),
    #[error("cached payload for `{key}` has an unexpected type")]
    TypeMismatch { key: String },
    #[error("fetch task for `{key}` aborted: {message}")]
    Aborted { key: String, message: String },
}

impl FetchError {
    pub fn backend(table: &str, error: &RepoError) -> Self {
        Self::Backend {
            table: table.to_string(),
            message: error.to_string(),
        }
    }

    pub fn decode(table: &str, error: impl std::fmt::Display) -> Self {
        Self::Decode {
            table: table.to_string(),
            message: error.to_string(),
        }
    }
}

/// The change feed could not be opened, dropped, or delivered garbage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("change feed is not supported by this backend: {0}")]
    Unsupported(String),
    #[error("failed to open change feed: {0}")]
    Connect(String),
    #[error("change feed skipped {0} events")]
    Lagged(u64),
    #[error("malformed change payload: {0}")]
    Payload(String),
}

impl SubscriptionError {
    pub fn payload(message: impl Into<String>) -> Self {
        Self::Payload(message.into())
    }
}
