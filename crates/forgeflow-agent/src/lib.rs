//! Model routing for Forgeflow.
//!
//! Selects a backend model per task complexity and cost tier, executes the
//! call, and walks a multi-provider fallback chain when the primary backend
//! fails or returns degenerate output.
//!
//! # Main types
//!
//! - [`ModelRouter`] — Selects and calls backends, with fallback.
//! - [`RouterConfig`] — Static catalog, selection table and fallback chains.
//! - [`LlmBackend`] — Trait implemented by every provider backend.
//! - [`CallSink`] — Side channel that records timing/outcome of each call.

/// Provider backends (OpenAI-compatible, Claude).
pub mod backends;
/// Model catalog, tiers and router configuration.
pub mod config;
/// Backend selection and fallback traversal.
pub mod router;
/// JSON extraction and schema validation of model responses.
pub mod structured;
/// Call-recording decorator and sinks.
pub mod telemetry;

pub use backends::{CompletionRequest, LlmBackend};
pub use config::{Complexity, LlmProvider, ModelConfig, RouterConfig, Tier, TierTable};
pub use router::{CallOptions, ModelRouter, RoutedCompletion};
pub use structured::{
    extract_json, parse_structured, FieldKind, OutputSchema, StructuredOutput, StructuredStatus,
};
pub use telemetry::{CallRecord, CallSink, JsonlSink, TracingSink};
