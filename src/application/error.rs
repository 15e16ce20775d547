use thiserror::Error;

use crate::{
    application::repos::RepoError, cache::FetchError, domain::error::DomainError,
    infra::error::InfraError,
};

/// A create, update or delete did not go through. The cache is left exactly
/// as it was before the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("daily transaction limit reached")]
    LimitReached,
    #[error("{operation} on `{table}` failed: {message}")]
    Backend {
        table: &'static str,
        operation: &'static str,
        message: String,
    },
    #[error("rpc `{name}` failed: {message}")]
    Rpc { name: String, message: String },
    #[error("failed to decode `{table}` row: {message}")]
    Decode { table: &'static str, message: String },
}

impl MutationError {
    pub fn backend(table: &'static str, operation: &'static str, error: &RepoError) -> Self {
        Self::Backend {
            table,
            operation,
            message: error.to_string(),
        }
    }

    pub fn rpc(name: &str, message: impl Into<String>) -> Self {
        Self::Rpc {
            name: name.to_string(),
            message: message.into(),
        }
    }

    pub fn decode(table: &'static str, error: impl std::fmt::Display) -> Self {
        Self::Decode {
            table,
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
