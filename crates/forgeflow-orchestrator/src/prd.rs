use crate::types::{PrdMeta, Task, TaskStatus, TodoItem, MAX_ATTEMPTS};
use chrono::Utc;
use forgeflow_core::{ForgeflowError, ForgeflowResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Ordered collection of tasks with dependency resolution.
///
/// Every status change goes through one of the `mark_*` methods, which
/// reject transitions the task state machine does not allow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prd {
    pub meta: PrdMeta,
    pub tasks: Vec<Task>,
}

/// Counts and ready set for the `status` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub total: usize,
    pub by_status: BTreeMap<TaskStatus, usize>,
    pub by_phase: BTreeMap<u32, BTreeMap<TaskStatus, usize>>,
    pub ready: Vec<String>,
    /// `(task id, last error)` for every blocked task.
    pub blocked: Vec<(String, String)>,
}

impl Prd {
    /// Build and validate a store from tasks. Every task starts in its
    /// initial state.
    pub fn from_tasks(meta: PrdMeta, tasks: Vec<Task>) -> ForgeflowResult<Self> {
        let mut prd = Self { meta, tasks };
        for task in &mut prd.tasks {
            task.clear_progress();
        }
        prd.validate()?;
        Ok(prd)
    }

    /// Parse and validate a persisted store.
    ///
    /// Tasks without a `status` field get their initial state. Tasks left
    /// `running` or `failed` by an interrupted run are settled before use.
    pub fn from_json(json: &str) -> ForgeflowResult<Self> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let explicit: Vec<bool> = value
            .get("tasks")
            .and_then(|t| t.as_array())
            .map(|tasks| tasks.iter().map(|t| t.get("status").is_some()).collect())
            .unwrap_or_default();

        let mut prd: Prd = serde_json::from_value(value)?;
        for (task, has_status) in prd.tasks.iter_mut().zip(explicit) {
            if !has_status {
                task.status = task.initial_status();
            }
        }
        prd.validate()?;
        prd.recover_interrupted();
        Ok(prd)
    }

    pub fn to_json(&self) -> ForgeflowResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject duplicate ids, dangling dependencies and cycles.
    pub fn validate(&self) -> ForgeflowResult<()> {
        let mut ids = HashSet::new();
        for task in &self.tasks {
            if !ids.insert(task.id.as_str()) {
                return Err(ForgeflowError::Prd(format!("Duplicate task id '{}'", task.id)));
            }
        }
        for task in &self.tasks {
            for dep in &task.dependencies {
                if !ids.contains(dep.as_str()) {
                    return Err(ForgeflowError::Prd(format!(
                        "Task '{}' depends on unknown task '{dep}'",
                        task.id
                    )));
                }
                if dep == &task.id {
                    return Err(ForgeflowError::Prd(format!(
                        "Task '{}' depends on itself",
                        task.id
                    )));
                }
            }
        }
        if self.has_cycle() {
            return Err(ForgeflowError::Prd(
                "Dependency cycle detected in task graph".to_string(),
            ));
        }
        Ok(())
    }

    /// Check for cycles in the dependency graph.
    pub fn has_cycle(&self) -> bool {
        let index: HashMap<&str, &Task> = self.tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let mut visited = HashMap::new();
        self.tasks
            .iter()
            .any(|t| dfs_cycle(&index, t.id.as_str(), &mut visited))
    }

    fn recover_interrupted(&mut self) {
        let done = self.done_ids();
        for task in &mut self.tasks {
            match task.status {
                TaskStatus::Running => {
                    debug!(task_id = %task.id, "Re-queueing task interrupted mid-run");
                    task.status = if task.dependencies.iter().all(|d| done.contains(d)) {
                        TaskStatus::Ready
                    } else {
                        TaskStatus::Pending
                    };
                }
                TaskStatus::Failed if task.attempts >= MAX_ATTEMPTS => {
                    task.status = TaskStatus::Blocked;
                }
                TaskStatus::Failed => task.status = TaskStatus::Ready,
                _ => {}
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    fn get_mut(&mut self, id: &str) -> ForgeflowResult<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| ForgeflowError::UnknownTask(id.to_string()))
    }

    fn done_ids(&self) -> HashSet<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Whether every dependency of `task` is done.
    pub fn dependencies_done(&self, task: &Task) -> bool {
        task.dependencies
            .iter()
            .all(|d| self.get(d).is_some_and(|t| t.status == TaskStatus::Done))
    }

    /// Pending or ready tasks whose dependencies are all done, ordered by
    /// phase then declaration order.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let mut ready: Vec<&Task> = self
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
            .filter(|t| self.dependencies_done(t))
            .collect();
        ready.sort_by_key(|t| t.phase);
        ready
    }

    /// Move pending tasks whose dependencies are done to ready.
    pub fn promote_ready(&mut self) -> Vec<String> {
        let done = self.done_ids();
        let mut promoted = Vec::new();
        for task in &mut self.tasks {
            if task.status == TaskStatus::Pending
                && task.dependencies.iter().all(|d| done.contains(d))
            {
                task.status = TaskStatus::Ready;
                promoted.push(task.id.clone());
            }
        }
        promoted
    }

    pub fn mark_running(&mut self, id: &str) -> ForgeflowResult<()> {
        let ready = {
            let task = self
                .get(id)
                .ok_or_else(|| ForgeflowError::UnknownTask(id.to_string()))?;
            task.status == TaskStatus::Ready && self.dependencies_done(task)
        };
        let task = self.get_mut(id)?;
        if !ready {
            return Err(invalid(task, TaskStatus::Running));
        }
        task.status = TaskStatus::Running;
        Ok(())
    }

    pub fn mark_done(&mut self, id: &str, output: Option<String>) -> ForgeflowResult<()> {
        let task = self.get_mut(id)?;
        if task.status != TaskStatus::Running {
            return Err(invalid(task, TaskStatus::Done));
        }
        task.status = TaskStatus::Done;
        task.output = output;
        task.error = None;
        task.completed_at = Some(Utc::now());
        task.complete_todos();
        Ok(())
    }

    /// Record a failed attempt, then re-queue the task or block it once the
    /// retry budget is spent. Returns the resulting status.
    pub fn mark_failed(&mut self, id: &str, reason: &str) -> ForgeflowResult<TaskStatus> {
        let task = self.get_mut(id)?;
        if task.status != TaskStatus::Running {
            return Err(invalid(task, TaskStatus::Failed));
        }
        task.status = TaskStatus::Failed;
        task.attempts += 1;
        task.error = Some(reason.to_string());

        if task.attempts >= MAX_ATTEMPTS {
            self.mark_blocked(id, reason)?;
            Ok(TaskStatus::Blocked)
        } else {
            task.status = TaskStatus::Ready;
            task.reset_todos();
            Ok(TaskStatus::Ready)
        }
    }

    pub fn mark_blocked(&mut self, id: &str, reason: &str) -> ForgeflowResult<()> {
        let task = self.get_mut(id)?;
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Running) {
            return Err(invalid(task, TaskStatus::Blocked));
        }
        task.status = TaskStatus::Blocked;
        task.error = Some(reason.to_string());
        Ok(())
    }

    /// Manually release a blocked task for another round of attempts.
    pub fn reset_task(&mut self, id: &str) -> ForgeflowResult<()> {
        let task = self.get_mut(id)?;
        if task.status != TaskStatus::Blocked {
            return Err(invalid(task, TaskStatus::Ready));
        }
        task.attempts = 0;
        task.error = None;
        task.reset_todos();
        task.status = TaskStatus::Pending;
        self.promote_ready();
        info!(task_id = %id, "Blocked task reset");
        Ok(())
    }

    /// Revert every task to its initial state for a build from scratch.
    pub fn reset_all(&mut self) {
        for task in &mut self.tasks {
            task.clear_progress();
        }
    }

    pub fn set_todos(&mut self, id: &str, todos: Vec<TodoItem>) -> ForgeflowResult<()> {
        self.get_mut(id)?.todos = todos;
        Ok(())
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// No task is pending, ready, running or failed.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// Pending tasks that can never become ready because a dependency is
    /// blocked (directly or through another stalled task).
    pub fn stalled(&self) -> Vec<String> {
        let mut dead: HashSet<&str> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Blocked)
            .map(|t| t.id.as_str())
            .collect();
        loop {
            let before = dead.len();
            for task in &self.tasks {
                if task.status == TaskStatus::Pending
                    && task.dependencies.iter().any(|d| dead.contains(d.as_str()))
                {
                    dead.insert(task.id.as_str());
                }
            }
            if dead.len() == before {
                break;
            }
        }
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && dead.contains(t.id.as_str()))
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn summary(&self) -> StatusReport {
        let mut report = StatusReport {
            total: self.tasks.len(),
            ready: self.ready_tasks().iter().map(|t| t.id.clone()).collect(),
            ..StatusReport::default()
        };
        for task in &self.tasks {
            *report.by_status.entry(task.status).or_default() += 1;
            *report
                .by_phase
                .entry(task.phase)
                .or_default()
                .entry(task.status)
                .or_default() += 1;
            if task.status == TaskStatus::Blocked {
                report
                    .blocked
                    .push((task.id.clone(), task.error.clone().unwrap_or_default()));
            }
        }
        report
    }
}

fn invalid(task: &Task, to: TaskStatus) -> ForgeflowError {
    ForgeflowError::InvalidTransition {
        task: task.id.clone(),
        from: task.status.to_string(),
        to: to.to_string(),
    }
}

fn dfs_cycle<'a>(
    index: &HashMap<&'a str, &'a Task>,
    id: &'a str,
    visited: &mut HashMap<&'a str, u8>,
) -> bool {
    match visited.get(id) {
        Some(1) => return true,  // back edge
        Some(2) => return false, // finished
        _ => {}
    }
    visited.insert(id, 1);
    if let Some(task) = index.get(id) {
        for dep in &task.dependencies {
            if dfs_cycle(index, dep.as_str(), visited) {
                return true;
            }
        }
    }
    visited.insert(id, 2);
    false
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// A [`Prd`] bound to the file it was loaded from.
pub struct PrdStore {
    path: PathBuf,
    prd: Prd,
    last_written: Option<String>,
}

impl PrdStore {
    pub fn new(path: impl Into<PathBuf>, prd: Prd) -> Self {
        Self {
            path: path.into(),
            prd,
            last_written: None,
        }
    }

    pub async fn load(path: impl AsRef<Path>) -> ForgeflowResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            ForgeflowError::Prd(format!("Cannot read PRD file {}: {e}", path.display()))
        })?;
        let prd = Prd::from_json(&content)?;
        debug!(path = %path.display(), tasks = prd.tasks.len(), "PRD loaded");
        Ok(Self {
            path: path.to_path_buf(),
            prd,
            last_written: Some(content),
        })
    }

    /// Rewrite the whole file (temp file, then rename).
    pub async fn persist(&mut self) -> ForgeflowResult<()> {
        let json = self.prd.to_json()?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        self.last_written = Some(json);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn prd(&self) -> &Prd {
        &self.prd
    }

    pub fn prd_mut(&mut self) -> &mut Prd {
        &mut self.prd
    }

    /// Content of the last load or persist, used to recognise our own writes.
    pub fn last_written(&self) -> Option<&str> {
        self.last_written.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn abc() -> Prd {
        Prd::from_tasks(
            PrdMeta::new("demo"),
            vec![
                Task::new("A", "backend", "a"),
                Task::new("B", "frontend", "b"),
                Task::new("C", "tester", "c")
                    .with_phase(1)
                    .with_dependencies(&["A", "B"]),
            ],
        )
        .unwrap()
    }

    fn finish(prd: &mut Prd, id: &str) {
        prd.mark_running(id).unwrap();
        prd.mark_done(id, None).unwrap();
    }

    fn ids(tasks: Vec<&Task>) -> Vec<&str> {
        tasks.into_iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn test_initial_states() {
        let prd = abc();
        assert_eq!(prd.get("A").unwrap().status, TaskStatus::Ready);
        assert_eq!(prd.get("C").unwrap().status, TaskStatus::Pending);
        assert_eq!(ids(prd.ready_tasks()), vec!["A", "B"]);
    }

    #[test]
    fn test_dependents_ready_after_deps_done() {
        let mut prd = abc();
        finish(&mut prd, "A");
        assert_eq!(ids(prd.ready_tasks()), vec!["B"]);
        finish(&mut prd, "B");
        assert_eq!(ids(prd.ready_tasks()), vec!["C"]);
        assert_eq!(prd.promote_ready(), vec!["C".to_string()]);
        assert_eq!(prd.get("C").unwrap().status, TaskStatus::Ready);
    }

    #[test]
    fn test_ready_tasks_ordered_by_phase_then_declaration() {
        let prd = Prd::from_tasks(
            PrdMeta::new("order"),
            vec![
                Task::new("late", "docs", "").with_phase(2),
                Task::new("first", "backend", ""),
                Task::new("mid", "tester", "").with_phase(1),
                Task::new("second", "frontend", ""),
            ],
        )
        .unwrap();
        assert_eq!(ids(prd.ready_tasks()), vec!["first", "second", "mid", "late"]);
    }

    #[test]
    fn test_pending_never_runs_before_deps() {
        let mut prd = abc();
        prd.get_mut("C").unwrap().status = TaskStatus::Ready;
        assert!(matches!(
            prd.mark_running("C"),
            Err(ForgeflowError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_failed_requeues_then_blocks() {
        let mut prd = abc();
        prd.mark_running("A").unwrap();
        assert_eq!(prd.mark_failed("A", "first").unwrap(), TaskStatus::Ready);
        assert_eq!(prd.get("A").unwrap().attempts, 1);

        prd.mark_running("A").unwrap();
        assert_eq!(prd.mark_failed("A", "second").unwrap(), TaskStatus::Blocked);
        let a = prd.get("A").unwrap();
        assert_eq!(a.attempts, MAX_ATTEMPTS);
        assert_eq!(a.error.as_deref(), Some("second"));

        assert!(prd.mark_running("A").is_err());
        assert!(prd.mark_failed("A", "third").is_err());
        assert_eq!(prd.get("A").unwrap().attempts, MAX_ATTEMPTS);
    }

    #[test]
    fn test_done_is_terminal() {
        let mut prd = abc();
        finish(&mut prd, "A");
        assert!(prd.mark_running("A").is_err());
        assert!(prd.mark_failed("A", "x").is_err());
        assert!(prd.mark_blocked("A", "x").is_err());
        assert!(prd.reset_task("A").is_err());
    }

    #[test]
    fn test_reset_task_only_from_blocked() {
        let mut prd = abc();
        for _ in 0..MAX_ATTEMPTS {
            prd.mark_running("A").unwrap();
            prd.mark_failed("A", "boom").unwrap();
        }
        prd.reset_task("A").unwrap();
        let a = prd.get("A").unwrap();
        assert_eq!(a.status, TaskStatus::Ready);
        assert_eq!(a.attempts, 0);
        assert!(a.error.is_none());
    }

    #[test]
    fn test_reset_all_restores_initial_state() {
        let mut prd = Prd::from_tasks(
            PrdMeta::new("reset"),
            vec![
                Task::new("A", "backend", ""),
                Task::new("B", "tester", "").with_phase(1),
            ],
        )
        .unwrap();
        finish(&mut prd, "A");
        prd.promote_ready();
        for _ in 0..MAX_ATTEMPTS {
            prd.mark_running("B").unwrap();
            prd.mark_failed("B", "boom").unwrap();
        }
        assert_eq!(prd.get("B").unwrap().status, TaskStatus::Blocked);

        prd.reset_all();
        let (a, b) = (prd.get("A").unwrap(), prd.get("B").unwrap());
        assert_eq!(a.status, TaskStatus::Ready);
        assert_eq!(b.status, TaskStatus::Pending);
        assert_eq!((a.attempts, b.attempts), (0, 0));
        assert!(a.error.is_none() && b.error.is_none());
        assert!(a.output.is_none());
    }

    #[test]
    fn test_stalled_through_blocked_chain() {
        let mut prd = Prd::from_tasks(
            PrdMeta::new("stall"),
            vec![
                Task::new("A", "backend", ""),
                Task::new("B", "tester", "").with_dependencies(&["A"]),
                Task::new("C", "docs", "").with_dependencies(&["B"]),
            ],
        )
        .unwrap();
        for _ in 0..MAX_ATTEMPTS {
            prd.mark_running("A").unwrap();
            prd.mark_failed("A", "boom").unwrap();
        }
        assert!(prd.ready_tasks().is_empty());
        assert_eq!(prd.stalled(), vec!["B".to_string(), "C".to_string()]);
        assert!(!prd.is_finished());
    }

    #[test]
    fn test_from_json_rejects_dangling_dependency() {
        let json = r#"{"meta":{"name":"x"},"tasks":[
            {"id":"a","agent":"backend","dependencies":["ghost"]}
        ]}"#;
        let err = Prd::from_json(json).unwrap_err();
        assert!(matches!(err, ForgeflowError::Prd(ref m) if m.contains("ghost")));
        assert!(err.is_structural());
    }

    #[test]
    fn test_from_json_rejects_duplicate_ids() {
        let json = r#"{"meta":{"name":"x"},"tasks":[
            {"id":"a","agent":"backend"},
            {"id":"a","agent":"tester"}
        ]}"#;
        assert!(matches!(Prd::from_json(json), Err(ForgeflowError::Prd(_))));
    }

    #[test]
    fn test_from_json_rejects_cycle() {
        let json = r#"{"meta":{"name":"x"},"tasks":[
            {"id":"a","agent":"backend","dependencies":["b"]},
            {"id":"b","agent":"tester","dependencies":["a"]}
        ]}"#;
        let err = Prd::from_json(json).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_from_json_applies_initial_and_recovers_running() {
        let json = r#"{"meta":{"name":"x","version":"2","createdAt":"2026-01-01T00:00:00Z"},"tasks":[
            {"id":"a","agent":"backend","status":"done"},
            {"id":"b","agent":"tester","phase":1,"dependencies":["a"],"status":"running"},
            {"id":"c","agent":"docs","phase":1}
        ]}"#;
        let prd = Prd::from_json(json).unwrap();
        assert_eq!(prd.meta.version, "2");
        assert_eq!(prd.get("b").unwrap().status, TaskStatus::Ready);
        assert_eq!(prd.get("c").unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn test_summary() {
        let mut prd = abc();
        finish(&mut prd, "A");
        let report = prd.summary();
        assert_eq!(report.total, 3);
        assert_eq!(report.by_status.get(&TaskStatus::Done), Some(&1));
        assert_eq!(report.by_phase.get(&1).and_then(|p| p.get(&TaskStatus::Pending)), Some(&1));
        assert_eq!(report.ready, vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn test_store_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prd.json");
        let mut store = PrdStore::new(&path, abc());
        store.prd_mut().mark_running("A").unwrap();
        store.prd_mut().mark_done("A", Some("out/A.md".into())).unwrap();
        store.persist().await.unwrap();
        assert!(!dir.path().join("prd.json.tmp").exists());

        let reloaded = PrdStore::load(&path).await.unwrap();
        let a = reloaded.prd().get("A").unwrap();
        assert_eq!(a.status, TaskStatus::Done);
        assert_eq!(a.output.as_deref(), Some("out/A.md"));
        assert_eq!(reloaded.last_written(), store.last_written());
    }

    #[tokio::test]
    async fn test_store_load_missing_file_is_structural() {
        let err = PrdStore::load("/definitely/not/here.json")
            .await
            .err()
            .unwrap();
        assert!(err.is_structural());
    }
}
