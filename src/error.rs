use std::path::PathBuf;

use thiserror::Error;

use crate::ledger::{Amount, Identity};

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Canonical error type for every ledger operation.
///
/// A failed mutation never leaves partial state behind: the ledger it targeted
/// is exactly as it was before the call.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// `initialize` was called on a deployment that already has a battery bank.
    #[error("battery bank already initialized")]
    AlreadyInitialized,

    /// A ledger operation ran before `initialize`.
    #[error("battery bank not initialized")]
    NotInitialized,

    #[error("invalid storage fee: {reason}")]
    InvalidFee { reason: String },

    #[error("invalid amount: {reason}")]
    InvalidAmount { reason: String },

    /// Caller identity does not hold the role the operation requires.
    #[error("{caller} is not authorized to act as {required}")]
    Unauthorized { caller: Identity, required: Identity },

    #[error("no ledger for producer {producer}")]
    LedgerNotFound { producer: Identity },

    #[error("producer {producer} has {available} available, {requested} requested")]
    InsufficientBalance {
        producer: Identity,
        available: Amount,
        requested: Amount,
    },

    #[error("arithmetic overflow while computing {context}")]
    ArithmeticOverflow { context: &'static str },

    /// Another mutation holds the same ledger or state file. Safe to retry.
    #[error("concurrent mutation in flight for {resource}")]
    Conflict { resource: String },

    #[error("ledger for producer {producer} is full ({limit} transactions)")]
    LedgerFull { producer: Identity, limit: usize },

    #[error("snapshot rejected: {0}")]
    CorruptSnapshot(String),

    #[error("state file error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl LedgerError {
    /// Only serialization conflicts may be retried by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Conflict { .. })
    }

    /// True for errors caused by the request itself rather than the environment.
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            LedgerError::Io { .. } | LedgerError::Codec(_) | LedgerError::CorruptSnapshot(_)
        )
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LedgerError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_retryable() {
        let conflict = LedgerError::Conflict {
            resource: "producer p".into(),
        };
        assert!(conflict.is_retryable());
        assert!(!LedgerError::AlreadyInitialized.is_retryable());
        assert!(!LedgerError::InsufficientBalance {
            producer: Identity::from("p"),
            available: 0,
            requested: 1,
        }
        .is_retryable());
    }

    #[test]
    fn messages_name_the_producer() {
        let err = LedgerError::LedgerNotFound {
            producer: Identity::from("alice"),
        };
        assert_eq!(err.to_string(), "no ledger for producer alice");
    }
}
