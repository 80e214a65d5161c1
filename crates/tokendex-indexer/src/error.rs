//! Query boundary errors.
//!
//! Every error served to a client carries a stable code, a message and the
//! user/internal distinction: user errors are client-correctable and never
//! logged as faults, internal errors indicate an indexer-side problem.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error_code}: {msg}")]
pub struct QueryError {
    pub error_code: &'static str,
    pub msg: String,
    pub is_user_error: bool,
}

impl QueryError {
    pub fn user(error_code: &'static str, msg: impl Into<String>) -> Self {
        QueryError {
            error_code,
            msg: msg.into(),
            is_user_error: true,
        }
    }

    pub fn internal(error_code: &'static str, msg: impl Into<String>) -> Self {
        QueryError {
            error_code,
            msg: msg.into(),
            is_user_error: false,
        }
    }
}

impl From<tokendex_store::Error> for QueryError {
    fn from(err: tokendex_store::Error) -> Self {
        QueryError::internal("internal-server-error", err.to_string())
    }
}
