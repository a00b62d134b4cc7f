//! Error types for the runloop domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each collaborator has its own error enum; [`Error`] unifies them.

use thiserror::Error;

/// The top-level error type for all runloop operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Chat completion errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Persistence errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Whether a failed call may be retried.
    ///
    /// Only explicit timeout, rate-limit, and server-error codes qualify.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RateLimited { .. } => true,
            Self::ApiError { status_code, .. } => {
                matches!(status_code, 408 | 429) || (500..600).contains(status_code)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Illegal run transition: {from} -> {to}")]
    IllegalTransition {
        from: crate::run::RunStatus,
        to: crate::run::RunStatus,
    },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn run_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "run",
            id: id.into(),
        }
    }

    pub fn conversation_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "conversation",
            id: id.into(),
        }
    }
}
