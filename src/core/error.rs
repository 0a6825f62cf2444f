use http::Method;
use thiserror::Error;

use crate::session::SessionId;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse failure taxonomy shared by every policy and the session layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// Admission denied before the operation ran.
    Rejected,
    /// A deadline owned by a timeout policy fired.
    DeadlineExceeded,
    /// The caller's own cancellation token fired.
    Cancelled,
    /// The wrapped operation failed, possibly after retries.
    OperationFailed,
    /// Programmer or configuration error. Never retried.
    InvariantViolation,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Rejected => "rejected",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::OperationFailed => "operation_failed",
            Self::InvariantViolation => "invariant_violation",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    RateLimited,
    CircuitOpen,
    DeadlineExceeded,
    Cancelled,
    Operation,
    Transport,
    Authentication,
    RetriesExhausted,
    SessionDisposed,
    DuplicateSession,
    InvalidPolicyConfig,
    RuntimeUnavailable,
    RegistryDisposed,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::CircuitOpen => "circuit_open",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Cancelled => "cancelled",
            Self::Operation => "operation",
            Self::Transport => "transport",
            Self::Authentication => "authentication",
            Self::RetriesExhausted => "retries_exhausted",
            Self::SessionDisposed => "session_disposed",
            Self::DuplicateSession => "duplicate_session",
            Self::InvalidPolicyConfig => "invalid_policy_config",
            Self::RuntimeUnavailable => "runtime_unavailable",
            Self::RegistryDisposed => "registry_disposed",
        }
    }

    pub const fn kind(self) -> ErrorKind {
        match self {
            Self::RateLimited | Self::CircuitOpen => ErrorKind::Rejected,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Operation
            | Self::Transport
            | Self::Authentication
            | Self::RetriesExhausted
            | Self::SessionDisposed => ErrorKind::OperationFailed,
            Self::DuplicateSession
            | Self::InvalidPolicyConfig
            | Self::RuntimeUnavailable
            | Self::RegistryDisposed => ErrorKind::InvariantViolation,
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("rate limiter rejected the call (queue limit {queue_limit})")]
    RateLimited { queue_limit: usize },
    #[error("circuit breaker is open; retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u128 },
    #[error("deadline exceeded after {timeout_ms}ms")]
    DeadlineExceeded { timeout_ms: u128 },
    #[error("operation cancelled by caller")]
    Cancelled,
    #[error("operation failed: {source}")]
    Operation {
        #[source]
        source: BoxError,
    },
    #[error("http transport error for {method} {uri}: {source}")]
    Transport {
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("failed to authenticate request: {source}")]
    Authentication {
        #[source]
        source: BoxError,
    },
    #[error("operation failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: Box<Error>,
    },
    #[error("session {id} is disposed")]
    SessionDisposed { id: SessionId },
    #[error("session identity {id} is already registered")]
    DuplicateSession { id: SessionId },
    #[error("invalid {policy} configuration: {message}")]
    InvalidPolicyConfig {
        policy: &'static str,
        message: String,
    },
    #[error("{component} requires a running tokio runtime")]
    RuntimeUnavailable { component: &'static str },
    #[error("session registry is disposed")]
    RegistryDisposed,
}

impl Error {
    /// Wraps an arbitrary failure of the guarded operation.
    pub fn operation(source: impl Into<BoxError>) -> Self {
        Self::Operation {
            source: source.into(),
        }
    }

    pub fn authentication(source: impl Into<BoxError>) -> Self {
        Self::Authentication {
            source: source.into(),
        }
    }

    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Self::DeadlineExceeded { .. } => ErrorCode::DeadlineExceeded,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Operation { .. } => ErrorCode::Operation,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Authentication { .. } => ErrorCode::Authentication,
            Self::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
            Self::SessionDisposed { .. } => ErrorCode::SessionDisposed,
            Self::DuplicateSession { .. } => ErrorCode::DuplicateSession,
            Self::InvalidPolicyConfig { .. } => ErrorCode::InvalidPolicyConfig,
            Self::RuntimeUnavailable { .. } => ErrorCode::RuntimeUnavailable,
            Self::RegistryDisposed => ErrorCode::RegistryDisposed,
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        self.code().kind()
    }

    /// Failures a retry or circuit breaker handles when no predicate is configured.
    ///
    /// Only genuine operation failures qualify. Rejections, deadlines and
    /// cancellations must be opted into explicitly.
    pub fn is_operation_failure(&self) -> bool {
        matches!(
            self,
            Self::Operation { .. } | Self::Transport { .. } | Self::Authentication { .. }
        )
    }

    /// The error produced by the final attempt, looking through `RetriesExhausted`.
    pub fn last_attempt_error(&self) -> &Error {
        match self {
            Self::RetriesExhausted { source, .. } => source.last_attempt_error(),
            other => other,
        }
    }
}

pub(crate) fn invalid_config(policy: &'static str, message: impl Into<String>) -> Error {
    Error::InvalidPolicyConfig {
        policy,
        message: message.into(),
    }
}
