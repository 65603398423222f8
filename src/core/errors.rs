// src/core/errors.rs

//! Defines the primary error type for the entire crate.

use serde_json::Value;
use thiserror::Error;

/// JSON-RPC error code a child returns when a call requires the user to
/// complete an elicitation flow in a browser before the call can proceed.
/// Decoded responses carrying it surface as `ProcmuxError::Protocol` instead
/// of a result payload.
pub const CODE_URL_ELICITATION_REQUIRED: i64 = -32011;

/// The main error enum, representing all possible failures within the core.
/// Using `thiserror` allows for clean error definitions and automatic `From`
/// trait implementations.
#[derive(Error, Debug)]
pub enum ProcmuxError {
    /// The spec key is not in the installed registry and no pool survives
    /// for it.
    #[error("unknown spec key '{0}'")]
    UnknownSpecKey(String),

    /// Transient: the pool cannot place the request right now.
    #[error("no capacity available for spec '{0}'")]
    NoCapacity(String),

    /// Transient: the sticky-bound instance is at its concurrency ceiling.
    #[error("sticky instance busy for routing key '{0}'")]
    StickyBusy(String),

    /// No routable instance exists and starting one was not permitted.
    #[error("no ready instance for spec '{0}'")]
    NoReadyInstance(String),

    /// The child does not implement the requested list method.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// A lifecycle start failed. Counts toward the circuit breaker.
    #[error("start instance failed for spec '{spec_key}': {message}")]
    StartFailed { spec_key: String, message: String },

    /// A lifecycle stop failed. Logged and metricized; pool state advances
    /// regardless.
    #[error("stop instance failed for instance '{instance_id}': {message}")]
    StopFailed {
        instance_id: String,
        message: String,
    },

    /// A typed JSON-RPC error decoded from a child response.
    #[error("protocol error {code}: {message}")]
    Protocol {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// The caller's cancellation token fired. Never wrapped with an
    /// operation tag.
    #[error("operation canceled")]
    Canceled,

    /// A routing or fetch deadline elapsed. Never wrapped with an operation
    /// tag.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The named catalog entry does not resolve to any server.
    #[error("unknown catalog entry '{0}'")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// A library-internal error wrapped with the operation that observed it.
    #[error("{op}: {source}")]
    Tagged {
        op: &'static str,
        #[source]
        source: Box<ProcmuxError>,
    },
}

/// Coarse classification errors carry across the core boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unavailable,
    InvalidArgument,
    Canceled,
    DeadlineExceeded,
    NotFound,
    Internal,
}

impl ProcmuxError {
    /// Wraps the error with an operation tag. Cancellations and deadline
    /// expirations pass through untouched so callers can still match on
    /// them directly.
    pub fn with_op(self, op: &'static str) -> Self {
        match self {
            ProcmuxError::Canceled | ProcmuxError::DeadlineExceeded => self,
            other => ProcmuxError::Tagged {
                op,
                source: Box::new(other),
            },
        }
    }

    /// The coarse code for this error, unwrapping operation tags.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProcmuxError::UnknownSpecKey(_)
            | ProcmuxError::NoCapacity(_)
            | ProcmuxError::StickyBusy(_)
            | ProcmuxError::NoReadyInstance(_) => ErrorCode::Unavailable,
            ProcmuxError::MethodNotAllowed(_) | ProcmuxError::InvalidRequest(_) => {
                ErrorCode::InvalidArgument
            }
            ProcmuxError::Canceled => ErrorCode::Canceled,
            ProcmuxError::DeadlineExceeded => ErrorCode::DeadlineExceeded,
            ProcmuxError::NotFound(_) => ErrorCode::NotFound,
            ProcmuxError::StartFailed { .. }
            | ProcmuxError::StopFailed { .. }
            | ProcmuxError::Protocol { .. }
            | ProcmuxError::Internal(_) => ErrorCode::Internal,
            ProcmuxError::Tagged { source, .. } => source.code(),
        }
    }

    /// Strips operation tags down to the root error.
    pub fn root(&self) -> &ProcmuxError {
        match self {
            ProcmuxError::Tagged { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when retrying later could succeed without reconfiguration.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.root(),
            ProcmuxError::NoCapacity(_)
                | ProcmuxError::StickyBusy(_)
                | ProcmuxError::NoReadyInstance(_)
        )
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for ProcmuxError {
    fn from(e: std::io::Error) -> Self {
        ProcmuxError::Internal(format!("IO error: {e}"))
    }
}

impl From<serde_json::Error> for ProcmuxError {
    fn from(e: serde_json::Error) -> Self {
        ProcmuxError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for ProcmuxError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProcmuxError::DeadlineExceeded
    }
}
