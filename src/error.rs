//! Error types for the subscription engine.
//!
//! Errors are grouped by concern and folded into [`BrokerError`]. Per-unit
//! failures during an update cycle are reported as diagnostics and never
//! surface through this type to unrelated subscribers.

use thiserror::Error;

use crate::subscription::{GateId, SubscriptionId};

/// Input validation errors, raised before any state is touched.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Query text cannot be empty")]
    EmptyQuery,

    #[error("Invalid graph IRI: {iri}")]
    InvalidGraphIri {
        iri: String,
    },

    #[error("Gate id cannot be empty")]
    InvalidGateId,

    #[error("Invalid subscription id: {value}")]
    InvalidSubscriptionId {
        value: String,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Errors raised while executing engine operations.
#[allow(missing_docs)]
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("Query execution failed: {message}")]
    QueryExecution {
        message: String,
    },

    #[error("Update execution failed: {message}")]
    UpdateExecution {
        message: String,
    },

    #[error("Subscription not found: {id}")]
    SubscriptionNotFound {
        id: SubscriptionId,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Failed to spawn worker: {message}")]
    WorkerSpawn {
        message: String,
    },
}

impl ExecutionError {
    pub(crate) fn timeout(duration: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Credential errors on the client side.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("Credential expired")]
    CredentialExpired,

    #[error("Credential refresh failed: {message}")]
    RefreshFailed {
        message: String,
    },
}

/// Transport errors between clients, gates and the engine.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Gate unreachable: {gate}")]
    GateUnreachable {
        gate: GateId,
    },

    #[error("Failed to send request: {message}")]
    SendFailed {
        message: String,
    },

    #[error("Connection broken: {message}")]
    ConnectionBroken {
        message: String,
    },

    #[error("Server error ({status} {error}): {description}")]
    ServerError {
        status: u16,
        error: String,
        description: String,
    },
}

/// Top-level error type.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl BrokerError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true for an unknown subscription id.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::SubscriptionNotFound { .. }))
    }

    /// Returns true if the operation hit its deadline.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Timeout { .. }))
    }

    /// Returns true if the request was rejected for an expired credential.
    #[must_use]
    pub const fn is_credential_expired(&self) -> bool {
        matches!(self, Self::Security(SecurityError::CredentialExpired))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Internal { .. } => false,
            Self::Execution(e) => matches!(e, ExecutionError::Timeout { .. }),
            Self::Security(e) => matches!(e, SecurityError::CredentialExpired),
            Self::Transport(e) => match e {
                TransportError::SendFailed { .. } => true,
                TransportError::ServerError { status, .. } => *status >= 500,
                _ => false,
            },
        }
    }
}

/// Result type alias for engine operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

pub(crate) fn lock_poisoned(context: &'static str) -> BrokerError {
    BrokerError::internal(format!("poisoned lock: {context}"))
}
