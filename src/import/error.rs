//! Error types for the import pipeline.
//!
//! - [`StoreError`]: failures reported by a store adapter
//! - [`UnitFailure`]: why a single transactional unit did not commit
//! - [`ImportError`]: the outcome of a failed import call

use crate::import::domain::DomainKey;
use crate::import::result::ImportResult;
use rocket_db_pools::sqlx;
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by an [`crate::store::ImportStore`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Connection dropped, reset or could not be acquired.
    #[error("store connection lost: {0}")]
    ConnectionLost(String),
    /// A statement exceeded its statement timeout.
    #[error("statement timed out: {0}")]
    StatementTimeout(String),
    /// Unique, foreign key or check constraint rejected a row.
    #[error("constraint violation on {target}: {message}")]
    ConstraintViolation { target: String, message: String },
    #[error("store query failed: {0}")]
    Query(String),
}

impl StoreError {
    /// True when retrying the whole call is plausible.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionLost(_) | StoreError::StatementTimeout(_)
        )
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::ConnectionLost(err.to_string()),
            sqlx::Error::Database(ref db_err) => {
                let code = db_err.code().map(|code| code.into_owned());
                match code.as_deref() {
                    // query_canceled: raised when statement_timeout fires
                    Some("57014") => StoreError::StatementTimeout(db_err.message().to_string()),
                    // admin_shutdown, crash_shutdown, cannot_connect_now
                    Some("57P01") | Some("57P02") | Some("57P03") => {
                        StoreError::ConnectionLost(db_err.message().to_string())
                    }
                    Some(code) if code.starts_with("23") => StoreError::ConstraintViolation {
                        target: db_err.table().unwrap_or("unknown").to_string(),
                        message: db_err.message().to_string(),
                    },
                    _ => StoreError::Query(err.to_string()),
                }
            }
            other => StoreError::Query(other.to_string()),
        }
    }
}

/// Cause of a transactional unit failing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UnitFailure {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unit exceeded timeout of {0:?}")]
    Timeout(Duration),
    #[error("unit task panicked: {0}")]
    Panicked(String),
}

impl UnitFailure {
    pub fn is_transient(&self) -> bool {
        match self {
            UnitFailure::Store(err) => err.is_transient(),
            UnitFailure::Timeout(_) => true,
            UnitFailure::Panicked(_) => false,
        }
    }
}

/// A unit failure tagged with where it happened.
#[derive(Debug, Clone, Error)]
#[error("unit {position} of stage {stage} failed: {failure}")]
pub struct UnitError {
    pub stage: &'static str,
    /// Submission position of the unit inside its stage-group.
    pub position: usize,
    pub failure: UnitFailure,
}

/// A single problem found while validating a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct RecordError {
    /// Position of the offending record; absent for domain-wide problems.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl RecordError {
    pub fn domain(message: impl Into<String>) -> Self {
        Self {
            index: None,
            field: None,
            message: message.into(),
        }
    }

    pub fn option(name: &str, message: impl Into<String>) -> Self {
        Self {
            index: None,
            field: Some(name.to_string()),
            message: message.into(),
        }
    }

    pub fn field(index: usize, field: &str, message: impl Into<String>) -> Self {
        Self {
            index: Some(index),
            field: Some(field.to_string()),
            message: message.into(),
        }
    }
}

/// Every validation problem of one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct DomainErrors {
    pub domain: DomainKey,
    pub errors: Vec<RecordError>,
}

/// Rejected option names, keyed by domain name. Unregistered domain names
/// are listed under [`UNKNOWN_DOMAINS_KEY`].
pub type UnknownOptions = BTreeMap<String, BTreeSet<String>>;

pub const UNKNOWN_DOMAINS_KEY: &str = "domains";

/// Failure outcome of an import call.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("validation failed for {} domain(s)", .0.len())]
    ValidationError(Vec<DomainErrors>),
    #[error("unknown options: {0:?}")]
    UnknownOptions(UnknownOptions),
    #[error("missing required params for: {0:?}")]
    MissingParams(Vec<DomainKey>),
    #[error("import timed out")]
    Timeout,
    #[error("stage group {stage_index} failed in stage {stage}: {cause}")]
    TransactionFailure {
        stage_index: usize,
        stage: &'static str,
        /// Results already committed by earlier stage-groups.
        partial: ImportResult,
        cause: UnitFailure,
    },
}

impl ImportError {
    /// Classify a failed stage-group.
    pub fn from_unit_error(stage_index: usize, partial: ImportResult, err: UnitError) -> Self {
        if err.failure.is_transient() {
            ImportError::Timeout
        } else {
            ImportError::TransactionFailure {
                stage_index,
                stage: err.stage,
                partial,
                cause: err.failure,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeouts_are_transient() {
        let err = StoreError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, StoreError::ConnectionLost(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn row_not_found_is_not_transient() {
        let err = StoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, StoreError::Query(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn transient_unit_failures_become_timeouts() {
        let unit_error = UnitError {
            stage: "logs",
            position: 0,
            failure: UnitFailure::Store(StoreError::ConnectionLost("reset by peer".into())),
        };
        let err = ImportError::from_unit_error(2, ImportResult::default(), unit_error);
        assert!(matches!(err, ImportError::Timeout));
    }

    #[test]
    fn data_failures_keep_stage_and_cause() {
        let unit_error = UnitError {
            stage: "main",
            position: 0,
            failure: UnitFailure::Panicked("boom".into()),
        };
        let err = ImportError::from_unit_error(1, ImportResult::default(), unit_error);
        match err {
            ImportError::TransactionFailure {
                stage_index,
                stage,
                cause,
                ..
            } => {
                assert_eq!(stage_index, 1);
                assert_eq!(stage, "main");
                assert_eq!(cause, UnitFailure::Panicked("boom".into()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
