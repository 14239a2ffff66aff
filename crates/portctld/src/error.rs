//! Error types for the portctl engine.
//!
//! [`ActivationError`] is the per-job failure taxonomy recorded on jobs and
//! in the audit log. [`EngineError`] is what the public API returns.

use crate::model::{BatchId, JobId};
use crate::state::JobState;
use portctl_driver::DriverError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Why a job (or an intent, before it became a job) failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivationError {
    /// Malformed or out-of-policy intent. Never retried; no job is created.
    #[error("validation failed on {field}: {reason}")]
    Validation { field: String, reason: String },

    /// The actor lacks permission or scope. Never retried.
    #[error("authorization denied: {reason}")]
    Authorization { reason: String },

    /// Timeout, network problem or open breaker. Retried with backoff.
    #[error("transient driver failure: {message}")]
    TransientDriver { message: String },

    /// The device rejected the change, or verification disagreed.
    #[error("permanent driver failure: {message}")]
    PermanentDriver { message: String },

    /// The port lease did not become available in time.
    #[error("lock contention on {key}: {message}")]
    LockContention { key: String, message: String },

    /// Infrastructure fault such as an unavailable store.
    #[error("system error: {message}")]
    System { message: String },

    /// The batch was cancelled while the job was in flight.
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },
}

impl ActivationError {
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ActivationError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn authorization(reason: impl Into<String>) -> Self {
        ActivationError::Authorization {
            reason: reason.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ActivationError::PermanentDriver {
            message: message.into(),
        }
    }

    pub fn contention(key: impl ToString, message: impl Into<String>) -> Self {
        ActivationError::LockContention {
            key: key.to_string(),
            message: message.into(),
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        ActivationError::System {
            message: message.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        ActivationError::Cancelled {
            reason: reason.into(),
        }
    }

    /// Returns true if the job may be retried after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ActivationError::TransientDriver { .. })
    }

    /// Short machine-readable kind, used in audit details and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ActivationError::Validation { .. } => "validation",
            ActivationError::Authorization { .. } => "authorization",
            ActivationError::TransientDriver { .. } => "transient_driver",
            ActivationError::PermanentDriver { .. } => "permanent_driver",
            ActivationError::LockContention { .. } => "lock_contention",
            ActivationError::System { .. } => "system",
            ActivationError::Cancelled { .. } => "cancelled",
        }
    }
}

impl From<DriverError> for ActivationError {
    fn from(err: DriverError) -> Self {
        if err.is_transient() {
            ActivationError::TransientDriver {
                message: err.to_string(),
            }
        } else {
            ActivationError::PermanentDriver {
                message: err.to_string(),
            }
        }
    }
}

/// One rejected intent of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// Position of the intent in the request.
    pub index: usize,
    pub error: ActivationError,
}

/// Store failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Audit sink failures.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A sink write failed earlier; the trail has a gap.
    #[error("audit trail incomplete: {0}")]
    Incomplete(String),
}

/// Configuration, inventory, policy and request-file loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    #[error("fabric context '{context}' not found in {what}")]
    MissingContext { context: String, what: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn parse(what: impl Into<String>, message: impl ToString) -> Self {
        ConfigError::Parse {
            what: what.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid(message.into())
    }
}

/// Errors returned by the engine API.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Some intents failed validation or authorization; nothing was created.
    #[error("request rejected: {} intent(s) refused, first: {}", .0.len(), first_reason(.0))]
    Rejected(Vec<Rejection>),

    #[error("unknown batch {0}")]
    UnknownBatch(BatchId),

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("job {job} is {state}; only jobs requiring manual intervention can be resolved")]
    NotResolvable { job: JobId, state: JobState },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error("engine is not running")]
    Stopped,
}

fn first_reason(rejections: &[Rejection]) -> String {
    rejections
        .first()
        .map(|r| format!("#{} {}", r.index, r.error))
        .unwrap_or_default()
}

impl EngineError {
    /// The per-intent rejections, if this is a rejection.
    pub fn rejections(&self) -> &[Rejection] {
        match self {
            EngineError::Rejected(r) => r,
            _ => &[],
        }
    }
}
