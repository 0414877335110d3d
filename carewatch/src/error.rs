//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
///
/// Delivery faults (transient, permanent, timeout) are not errors: they are recorded on
/// the delivery attempt and absorbed by the escalation policy. Only validation failures
/// and exhaustion ever leave the engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Notification {notification_id} already has an open delivery attempt")]
    AttemptInProgress { notification_id: String },

    #[error("Escalation link rejected: {0}")]
    EscalationLinkRejected(String),

    #[error("All contacts exhausted for risk event {risk_event_id} (batch {batch_id})")]
    Exhausted {
        batch_id: String,
        risk_event_id: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        Self::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Whether this error is one the caller is expected to act on
    /// (as opposed to an internal storage or runtime failure).
    pub fn is_caller_facing(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::Exhausted { .. })
    }
}
