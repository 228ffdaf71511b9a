//! Domain error taxonomy.
//!
//! Business failures travel as a [`TransactionError`] inside `anyhow::Error`;
//! the transaction runtime recovers them by downcast and never retries them.
//! Transient database failures are recognized by SQLSTATE and retried.

use sqlx::Error as SqlxError;
use thiserror::Error;
use tracing::debug;

/// Typed business error. Stable `kind` strings and status codes form the
/// user-visible error surface; monetary variants name the figure at fault.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Validation(String),

    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: i64, available: i64 },

    #[error("insufficient shares: required {required}, available {available}")]
    InsufficientShares { required: i64, available: i64 },

    #[error("slippage exceeded: actual {actual} is over the bound {bound}")]
    SlippageExceeded { actual: i64, bound: i64 },

    #[error("market is not open for trading")]
    MarketNotOpen,

    #[error("option already resolved")]
    OptionAlreadyResolved,

    #[error("liquidity is locked until resolution")]
    LockedUntilResolution,

    #[error("dispute deadline passed")]
    DisputeDeadlinePassed,

    #[error("operation timed out after {0}ms waiting in the market queue")]
    QueueTimeout(u64),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl TransactionError {
    /// HTTP-ish status code reported to callers.
    pub fn status_code(&self) -> u16 {
        match self {
            TransactionError::Unauthorized(_) => 403,
            TransactionError::NotFound(_) => 404,
            TransactionError::Validation(_) => 400,
            TransactionError::InsufficientBalance { .. } => 402,
            TransactionError::InsufficientShares { .. } => 400,
            TransactionError::SlippageExceeded { .. } => 409,
            TransactionError::MarketNotOpen => 400,
            TransactionError::OptionAlreadyResolved => 400,
            TransactionError::LockedUntilResolution => 400,
            TransactionError::DisputeDeadlinePassed => 400,
            TransactionError::QueueTimeout(_) => 408,
            TransactionError::Conflict(_) => 409,
        }
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            TransactionError::Unauthorized(_) => "Unauthorized",
            TransactionError::NotFound(_) => "NotFound",
            TransactionError::Validation(_) => "Validation",
            TransactionError::InsufficientBalance { .. } => "InsufficientBalance",
            TransactionError::InsufficientShares { .. } => "InsufficientShares",
            TransactionError::SlippageExceeded { .. } => "SlippageExceeded",
            TransactionError::MarketNotOpen => "MarketNotOpen",
            TransactionError::OptionAlreadyResolved => "OptionAlreadyResolved",
            TransactionError::LockedUntilResolution => "LockedUntilResolution",
            TransactionError::DisputeDeadlinePassed => "DisputeDeadlinePassed",
            TransactionError::QueueTimeout(_) => "QueueTimeout",
            TransactionError::Conflict(_) => "Conflict",
        }
    }

    pub fn validation(msg: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(TransactionError::Validation(msg.into()))
    }
}

/// Extract the business error from an anyhow chain, if any.
pub fn as_transaction_error(error: &anyhow::Error) -> Option<&TransactionError> {
    let mut current: &dyn std::error::Error = error.as_ref();
    loop {
        if let Some(te) = current.downcast_ref::<TransactionError>() {
            return Some(te);
        }
        match current.source() {
            Some(source) => current = source,
            None => return None,
        }
    }
}

/// PostgreSQL SQLSTATE codes for retryable errors.
/// Reference: https://www.postgresql.org/docs/current/errcodes-appendix.html
mod pg_error_codes {
    // Class 40 — Transaction Rollback
    pub const SERIALIZATION_FAILURE: &str = "40001";
    pub const DEADLOCK_DETECTED: &str = "40P01";

    // Class 25 — Invalid Transaction State
    pub const ACTIVE_SQL_TRANSACTION: &str = "25001";

    // Class 23 — Integrity Constraint Violation (concurrent upserts)
    pub const UNIQUE_VIOLATION: &str = "23505";
}

/// Whether a failed transaction may be re-run. Business errors never retry;
/// only SQLSTATE codes that signal transient serialization trouble do.
pub fn is_retryable_error(error: &anyhow::Error) -> bool {
    if as_transaction_error(error).is_some() {
        return false;
    }

    let mut current: &dyn std::error::Error = error.as_ref();
    loop {
        if let Some(sqlx_error) = current.downcast_ref::<SqlxError>() {
            return match sqlx_error {
                SqlxError::Database(db_error) => {
                    if let Some(sqlstate) = db_error.code() {
                        let sqlstate = sqlstate.as_ref();
                        let retryable = matches!(
                            sqlstate,
                            pg_error_codes::SERIALIZATION_FAILURE
                                | pg_error_codes::DEADLOCK_DETECTED
                                | pg_error_codes::ACTIVE_SQL_TRANSACTION
                                | pg_error_codes::UNIQUE_VIOLATION
                        );
                        if retryable {
                            debug!(
                                sqlstate,
                                message = db_error.message(),
                                "detected retryable database error"
                            );
                        }
                        retryable
                    } else {
                        false
                    }
                }
                _ => false,
            };
        }
        match current.source() {
            Some(source) => current = source,
            None => break,
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn business_errors_are_never_retryable() {
        let err = anyhow::Error::new(TransactionError::MarketNotOpen);
        assert!(!is_retryable_error(&err));
        assert!(as_transaction_error(&err).is_some());
    }

    #[test]
    fn downcast_survives_context() {
        let err = anyhow::Error::new(TransactionError::InsufficientBalance {
            required: 1_000_000,
            available: 250_000,
        })
        .context("while buying shares");
        let te = as_transaction_error(&err).expect("should downcast through context");
        assert_eq!(te.kind(), "InsufficientBalance");
        assert_eq!(te.status_code(), 402);
    }

    #[test]
    fn opaque_errors_are_not_retryable() {
        let err = anyhow!("some unrelated failure");
        assert!(!is_retryable_error(&err));
        assert!(as_transaction_error(&err).is_none());
    }

    #[test]
    fn status_codes_are_stable() {
        assert_eq!(TransactionError::Unauthorized("x".into()).status_code(), 403);
        assert_eq!(TransactionError::NotFound("market").status_code(), 404);
        assert_eq!(TransactionError::QueueTimeout(30_000).status_code(), 408);
        assert_eq!(TransactionError::Conflict("retries exhausted".into()).status_code(), 409);
    }

    #[test]
    fn messages_name_the_figures_at_fault() {
        let msg = TransactionError::InsufficientBalance {
            required: 500_000,
            available: 10_000,
        }
        .to_string();
        assert!(msg.contains("500000") && msg.contains("10000"));
    }
}
