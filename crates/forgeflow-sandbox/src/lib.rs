//! Sandboxed code execution for Forgeflow quality gates.
//!
//! A thin, stateless HTTP wrapper around a Piston-compatible execution
//! service. Execution never fails from the caller's point of view: transport
//! errors, non-2xx responses and timeouts all come back as an
//! [`ExecutionResult`] with `exit_code == -1` and the reason in `stderr`.
//! A process the service killed (time limit, segfault) is a real run and
//! carries `128 + signo` plus the signal name.

/// HTTP client for the execution service.
pub mod client;
/// Supported languages and the file names the service expects.
pub mod languages;

pub use client::{ExecutionClient, ExecutionConfig, ExecutionResult, Runtime, TIMED_OUT};
pub use languages::{file_name_for, normalize_language, LanguageSpec, LANGUAGES};
