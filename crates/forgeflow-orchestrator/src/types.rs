use chrono::{DateTime, Utc};
use forgeflow_agent::Complexity;
use serde::{Deserialize, Serialize};

/// Hard cap on attempts per task before it is blocked.
pub const MAX_ATTEMPTS: u32 = 2;

/// Status of a task in the work-item store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Done,
    Failed,
    /// Retry budget exhausted; only a manual reset leaves this state.
    Blocked,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::Running,
        TaskStatus::Done,
        TaskStatus::Failed,
        TaskStatus::Blocked,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Blocked)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Blocked => write!(f, "blocked"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

/// A progress sub-step of a complex task. Display only, never gates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub title: String,
    pub status: TodoStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verification_criteria: Vec<String>,
}

impl TodoItem {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            status: TodoStatus::Pending,
            verification_criteria: Vec::new(),
        }
    }

    pub fn with_criteria(mut self, criteria: Vec<String>) -> Self {
        self.verification_criteria = criteria;
        self
    }
}

/// A unit of work owned by one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Key into the agent registry.
    pub agent: String,
    #[serde(default = "default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Lower phases unlock first.
    #[serde(default)]
    pub phase: u32,
    #[serde(default)]
    pub attempts: u32,
    /// Overrides the agent's default complexity for model selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
    /// Explicit backend name, bypassing the selection table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Path of the accepted artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// Last failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub todos: Vec<TodoItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_status() -> TaskStatus {
    TaskStatus::Pending
}

impl Task {
    pub fn new(id: impl Into<String>, agent: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            description: description.into(),
            agent: agent.into(),
            status: TaskStatus::Pending,
            dependencies: Vec::new(),
            phase: 0,
            attempts: 0,
            complexity: None,
            model: None,
            output: None,
            error: None,
            todos: Vec::new(),
            completed_at: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_phase(mut self, phase: u32) -> Self {
        self.phase = phase;
        self
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| (*d).to_string()).collect();
        self
    }

    /// Status a task starts in before anything has run.
    pub fn initial_status(&self) -> TaskStatus {
        if self.phase == 0 && self.dependencies.is_empty() {
            TaskStatus::Ready
        } else {
            TaskStatus::Pending
        }
    }

    /// Title if set, otherwise the id.
    pub fn label(&self) -> &str {
        if self.title.is_empty() {
            &self.id
        } else {
            &self.title
        }
    }

    /// Move the todo at `index` to in-progress, completing any other
    /// in-progress item. Returns false for an out-of-range index.
    pub fn start_todo(&mut self, index: usize) -> bool {
        if index >= self.todos.len() {
            return false;
        }
        for (i, todo) in self.todos.iter_mut().enumerate() {
            if i != index && todo.status == TodoStatus::InProgress {
                todo.status = TodoStatus::Completed;
            }
        }
        self.todos[index].status = TodoStatus::InProgress;
        true
    }

    pub fn complete_todos(&mut self) {
        for todo in &mut self.todos {
            todo.status = TodoStatus::Completed;
        }
    }

    pub fn reset_todos(&mut self) {
        for todo in &mut self.todos {
            todo.status = TodoStatus::Pending;
        }
    }

    pub fn active_todo(&self) -> Option<&TodoItem> {
        self.todos
            .iter()
            .find(|t| t.status == TodoStatus::InProgress)
    }

    /// Clear everything a previous run left behind.
    pub(crate) fn clear_progress(&mut self) {
        self.attempts = 0;
        self.output = None;
        self.error = None;
        self.completed_at = None;
        self.reset_todos();
        self.status = self.initial_status();
    }
}

/// Work-item store metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrdMeta {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl PrdMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            created_at: Utc::now(),
        }
    }
}

/// A structured compiler or runtime diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(code) = &self.code {
            write!(f, "[{code}] ")?;
        }
        write!(f, "{}", self.message)?;
        if let Some(location) = &self.location {
            write!(f, " at {location}")?;
        }
        Ok(())
    }
}

/// Verdict of one gate on one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub passed: bool,
    pub message: String,
    /// Passed because the gate's preconditions were not met.
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

impl GateResult {
    pub fn pass(gate: &str, message: impl Into<String>) -> Self {
        Self {
            gate: gate.to_string(),
            passed: true,
            message: message.into(),
            skipped: false,
            diagnostics: Vec::new(),
        }
    }

    pub fn skip(gate: &str, reason: impl Into<String>) -> Self {
        Self {
            skipped: true,
            ..Self::pass(gate, format!("skipped: {}", reason.into()))
        }
    }

    pub fn fail(gate: &str, message: impl Into<String>) -> Self {
        Self {
            gate: gate.to_string(),
            passed: false,
            message: message.into(),
            skipped: false,
            diagnostics: Vec::new(),
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}
