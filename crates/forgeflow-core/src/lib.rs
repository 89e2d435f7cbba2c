//! Core types and error definitions for the Forgeflow build orchestrator.
//!
//! This crate provides the foundational pieces shared by every Forgeflow
//! crate: the unified error enum and a couple of small text helpers.
//!
//! # Main types
//!
//! - [`ForgeflowError`] — Unified error enum for all Forgeflow subsystems.
//! - [`ForgeflowResult`] — Convenience alias for `Result<T, ForgeflowError>`.

// --- Error types ---

/// Top-level error type for the Forgeflow orchestrator.
///
/// Each variant corresponds to a subsystem that can produce errors. Variants
/// for which [`ForgeflowError::is_structural`] returns `true` indicate a
/// corrupt or misconfigured input and are never recovered from.
#[derive(Debug, thiserror::Error)]
pub enum ForgeflowError {
    /// An error originating from an agent or model backend.
    #[error("Agent error: {0}")]
    Agent(String),

    /// An error from an outbound HTTP request (model provider or sandbox).
    #[error("HTTP error: {0}")]
    Http(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error raised while talking to the execution sandbox.
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// The work-item store is malformed (duplicate ids, dangling deps, cycles).
    #[error("PRD error: {0}")]
    Prd(String),

    /// A status transition the task state machine does not allow.
    #[error("Invalid transition for task '{task}': {from} -> {to}")]
    InvalidTransition {
        /// Task identifier.
        task: String,
        /// Status the task was in.
        from: String,
        /// Status that was requested.
        to: String,
    },

    /// A task id that is not present in the store.
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// An agent key that is not present in the agent registry.
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// Every backend in a fallback chain failed or returned degenerate output.
    #[error("All backends failed (tried {tried}); primary '{primary}' failed with: {reason}")]
    FallbackExhausted {
        /// Name of the first backend that was tried.
        primary: String,
        /// Failure reported by the primary backend.
        reason: String,
        /// Number of backends attempted in total.
        tried: usize,
    },

    /// An error from the orchestration loop itself.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForgeflowError {
    /// Whether this error is a structural/configuration error that must abort
    /// the process instead of being recorded against a task.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ForgeflowError::Config(_)
                | ForgeflowError::Prd(_)
                | ForgeflowError::InvalidTransition { .. }
                | ForgeflowError::UnknownTask(_)
                | ForgeflowError::UnknownAgent(_)
                | ForgeflowError::Json(_)
        )
    }
}

/// A convenience `Result` alias using [`ForgeflowError`].
pub type ForgeflowResult<T> = Result<T, ForgeflowError>;

// --- Text helpers ---

/// Rough token estimate used for cost accounting (about four characters per token).
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Truncate `text` to at most `max_chars` characters, appending a marker when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("\n…[truncated]");
    out
}
