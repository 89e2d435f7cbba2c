//! The Forgeflow orchestration engine.
//!
//! Schedules a dependency graph of agent tasks, dispatches ready work to the
//! model router, checks every response with a pipeline of quality gates and
//! drives each task through its retry / done / blocked state machine.
//!
//! # Main types
//!
//! - [`Orchestrator`] — The control loop.
//! - [`Prd`] / [`PrdStore`] — The work-item store and its file binding.
//! - [`GatePipeline`] — Ordered quality gates, including sandboxed execution.
//! - [`ParallelRunner`] — Bounded-concurrency batch executor with timeouts.
//! - [`AgentRegistry`] — Agent key to profile lookup.

/// Todo checklist policy for complex tasks.
pub mod checklist;
/// The orchestration loop.
pub mod engine;
/// Quality gates and diagnostics parsing.
pub mod gates;
/// PRD generation from a free-text description.
pub mod generate;
/// Per-agent metrics.
pub mod monitor;
/// Work-item store and persistence.
pub mod prd;
/// Built-in agent profiles and the registry.
pub mod profiles;
/// Parallel task runner.
pub mod runner;
/// Shared task types.
pub mod types;

pub use checklist::TodoPolicy;
pub use engine::{Orchestrator, OrchestratorConfig, RunOutcome};
pub use gates::{Gate, GateContext, GatePipeline, GateReport, GateSettings};
pub use generate::{LlmPrdGenerator, PrdGenerator};
pub use monitor::{AgentMetrics, AgentMonitor};
pub use prd::{Prd, PrdStore, StatusReport};
pub use profiles::{default_registry, AgentProfile, AgentRegistry, Capability};
pub use runner::{independent_subset, ParallelRunner, TaskOutcome, TaskResult};
pub use types::{
    Diagnostic, GateResult, PrdMeta, Task, TaskStatus, TodoItem, TodoStatus, MAX_ATTEMPTS,
};
