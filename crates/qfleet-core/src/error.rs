//! Error types for QFleet

use thiserror::Error;

/// Main error type for QFleet
#[derive(Error, Debug)]
pub enum QFleetError {
    #[error("Invalid context for agent kind '{agent_kind}': {reason}")]
    InvalidContext { agent_kind: String, reason: String },

    #[error("Action space is empty")]
    EmptyActionSpace,

    #[error("Concurrent update conflict on {agent_kind}/{state_hash}/{action} after {attempts} attempts")]
    ConcurrentUpdateConflict {
        agent_kind: String,
        state_hash: String,
        action: String,
        attempts: u32,
    },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QFleetError {
    /// Shorthand for an `InvalidContext` error
    pub fn invalid_context(agent_kind: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidContext {
            agent_kind: agent_kind.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may keep operating from memory after this error.
    ///
    /// Storage-path failures are recoverable; input, configuration and schema
    /// failures are not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_)
                | Self::ConcurrentUpdateConflict { .. }
                | Self::Timeout(_)
                | Self::Database(_)
        )
    }
}

/// Result type alias for QFleet operations
pub type Result<T> = std::result::Result<T, QFleetError>;
