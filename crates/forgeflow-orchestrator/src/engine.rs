use crate::checklist::TodoPolicy;
use crate::gates::{GatePipeline, GateReport};
use crate::monitor::{AgentMetrics, AgentMonitor, AttemptKind};
use crate::prd::{Prd, PrdStore};
use crate::profiles::{AgentProfile, AgentRegistry};
use crate::runner::{independent_subset, ParallelRunner, TaskOutcome, TaskResult};
use crate::types::{Task, TaskStatus, TodoStatus};
use forgeflow_agent::{CallOptions, ModelRouter, RoutedCompletion};
use forgeflow_core::{truncate_chars, ForgeflowError, ForgeflowResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Loop settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Tasks per parallel batch.
    pub concurrency: usize,
    pub task_timeout: Duration,
    /// Dispatch independent ready tasks together instead of one by one.
    pub parallel: bool,
    /// Where accepted outputs are written. `None` = `.forgeflow/artifacts`
    /// next to the PRD file.
    pub artifacts_dir: Option<PathBuf>,
    pub todo_policy: TodoPolicy,
    pub max_iterations: usize,
    /// Per-dependency cap on context appended to prompts.
    pub context_chars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            task_timeout: Duration::from_secs(300),
            parallel: true,
            artifacts_dir: None,
            todo_policy: TodoPolicy::default(),
            max_iterations: 1000,
            context_chars: 4000,
        }
    }
}

/// Result of driving a PRD to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub iterations: usize,
    pub done: Vec<String>,
    pub blocked: Vec<String>,
    /// Pending tasks that can never run because a dependency is blocked.
    pub stalled: Vec<String>,
    pub metrics: BTreeMap<String, AgentMetrics>,
    pub aggregate: AgentMetrics,
    pub duration_ms: u64,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.blocked.is_empty() && self.stalled.is_empty()
    }
}

/// One model call plus its gate verdicts.
struct Attempt {
    task: Task,
    completion: RoutedCompletion,
    report: GateReport,
}

/// The orchestration loop.
///
/// Repeatedly selects ready tasks, dispatches them to the model router,
/// runs the responses through the gate pipeline and applies the resulting
/// transition. The store is only mutated here, after a dispatched task's
/// model call and gates have resolved.
pub struct Orchestrator {
    router: Arc<ModelRouter>,
    gates: Arc<GatePipeline>,
    registry: AgentRegistry,
    config: OrchestratorConfig,
    monitor: Arc<AgentMonitor>,
}

impl Orchestrator {
    pub fn new(
        router: Arc<ModelRouter>,
        gates: Arc<GatePipeline>,
        registry: AgentRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            router,
            gates,
            registry,
            config,
            monitor: Arc::new(AgentMonitor::new()),
        }
    }

    /// Get a reference to the monitor.
    pub fn monitor(&self) -> &Arc<AgentMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Drive `store` until no task is ready. Structural errors abort the run;
    /// everything else is recorded on the owning task.
    ///
    /// Metrics in the outcome cover this run only.
    pub async fn run(&self, store: &mut PrdStore) -> ForgeflowResult<RunOutcome> {
        let start = Instant::now();
        let run_id = Uuid::new_v4();
        let profiles = self
            .registry
            .resolve_all(store.prd().tasks.iter().map(|t| t.agent.as_str()))?;
        self.monitor.reset().await;
        let artifacts_dir = self.artifacts_dir(store.path());
        let runner = ParallelRunner::new(
            if self.config.parallel {
                self.config.concurrency
            } else {
                1
            },
            self.config.task_timeout,
        );

        info!(
            %run_id,
            prd = %store.prd().meta.name,
            tasks = store.prd().tasks.len(),
            concurrency = runner.concurrency(),
            "Orchestration started"
        );

        let mut iterations = 0;
        loop {
            if iterations >= self.config.max_iterations {
                return Err(ForgeflowError::Orchestrator(format!(
                    "Exceeded {} loop iterations",
                    self.config.max_iterations
                )));
            }
            iterations += 1;

            let promoted = store.prd_mut().promote_ready();
            if !promoted.is_empty() {
                debug!(tasks = ?promoted, "Promoted tasks to ready");
                store.persist().await?;
            }

            let ready: Vec<Task> = store.prd().ready_tasks().into_iter().cloned().collect();
            if ready.is_empty() {
                break;
            }

            let (batch, sequential): (Vec<Task>, Vec<Task>) = if self.config.parallel {
                let refs: Vec<&Task> = ready.iter().collect();
                let independent: HashSet<String> = independent_subset(&refs)
                    .into_iter()
                    .map(|t| t.id.clone())
                    .collect();
                ready
                    .into_iter()
                    .partition(|t| independent.contains(&t.id))
            } else {
                (Vec::new(), ready)
            };

            if !batch.is_empty() {
                self.dispatch(store, batch, &profiles, &runner, &artifacts_dir)
                    .await?;
            }
            for task in sequential {
                let still_ready = store
                    .prd()
                    .get(&task.id)
                    .is_some_and(|t| t.status == TaskStatus::Ready && store.prd().dependencies_done(t));
                if still_ready {
                    self.dispatch(store, vec![task], &profiles, &runner, &artifacts_dir)
                        .await?;
                }
            }
        }

        let outcome = self.outcome(store.prd(), run_id, iterations, start).await;
        if !outcome.stalled.is_empty() {
            warn!(stalled = ?outcome.stalled, "Tasks cannot run: a dependency is blocked");
        }
        info!(
            %run_id,
            done = outcome.done.len(),
            blocked = outcome.blocked.len(),
            stalled = outcome.stalled.len(),
            duration_ms = outcome.duration_ms,
            "Orchestration finished"
        );
        Ok(outcome)
    }

    /// Mark `tasks` running, execute them through the runner and apply each
    /// result in input order.
    async fn dispatch(
        &self,
        store: &mut PrdStore,
        tasks: Vec<Task>,
        profiles: &HashMap<String, AgentProfile>,
        runner: &ParallelRunner,
        artifacts_dir: &Path,
    ) -> ForgeflowResult<()> {
        let mut prepared = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            let profile = profiles
                .get(&task.agent)
                .cloned()
                .ok_or_else(|| ForgeflowError::UnknownAgent(task.agent.clone()))?;

            if task.todos.is_empty() && self.config.todo_policy.needs_checklist(&task, &profile) {
                let todos = self.config.todo_policy.build_checklist(&task, &profile);
                store.prd_mut().set_todos(&task.id, todos.clone())?;
                task.todos = todos;
            }
            store.prd_mut().mark_running(&task.id)?;
            task.status = TaskStatus::Running;

            let context = self.dependency_context(store.prd(), &task).await;
            info!(
                task_id = %task.id,
                agent = %task.agent,
                attempt = task.attempts + 1,
                "Dispatching task"
            );
            prepared.push((task, profile, context));
        }
        store.persist().await?;

        let keys: Vec<(String, String)> = prepared
            .iter()
            .map(|(t, _, _)| (t.id.clone(), t.agent.clone()))
            .collect();
        let results = runner
            .run(prepared, |(task, profile, context)| {
                self.attempt(task, profile, context)
            })
            .await;

        let mut fatal = None;
        for ((id, agent), result) in keys.into_iter().zip(results) {
            if let Err(e) = self.apply(store, &id, &agent, result, artifacts_dir).await {
                if fatal.is_none() {
                    fatal = Some(e);
                }
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Model call and gates for one task. Works on a copy of the task; the
    /// loop writes the result back.
    async fn attempt(
        &self,
        mut task: Task,
        profile: AgentProfile,
        context: String,
    ) -> ForgeflowResult<Attempt> {
        task.start_todo(0);
        let prompt = build_prompt(&task, &context);

        task.start_todo(1);
        let mut options = CallOptions::new(task.complexity.unwrap_or(profile.default_complexity))
            .with_system(profile.system_prompt.clone());
        if let Some(model) = &task.model {
            options = options.with_model(model.clone());
        }
        if let Some(schema) = &profile.output_schema {
            options = options.with_schema(schema.to_json_schema());
        }
        let completion = self.router.call(&prompt, &options).await?;
        debug!(
            task_id = %task.id,
            model = %completion.model,
            fallbacks = completion.fallbacks_used,
            tokens = completion.tokens,
            "Model call finished"
        );

        task.start_todo(2);
        let report = self.gates.run(&completion.text, &task, &profile).await;
        Ok(Attempt {
            task,
            completion,
            report,
        })
    }

    async fn apply(
        &self,
        store: &mut PrdStore,
        id: &str,
        agent: &str,
        result: TaskResult<Attempt>,
        artifacts_dir: &Path,
    ) -> ForgeflowResult<()> {
        let duration_ms = result.duration.as_millis() as u64;
        match result.outcome {
            TaskOutcome::Completed(attempt) => {
                self.monitor
                    .record_usage(agent, attempt.completion.tokens, attempt.completion.estimated_cost)
                    .await;
                store.prd_mut().set_todos(id, attempt.task.todos.clone())?;

                if let Some(failed) = attempt.report.first_failure() {
                    let message = failed.message.clone();
                    self.fail(store, id, agent, &message, AttemptKind::Failure, duration_ms)
                        .await?;
                } else {
                    match write_artifact(artifacts_dir, &attempt.task, &attempt.completion.text).await
                    {
                        Ok(path) => {
                            store.prd_mut().mark_done(id, Some(path.clone()))?;
                            self.monitor
                                .record_attempt(agent, AttemptKind::Success, duration_ms)
                                .await;
                            info!(task_id = %id, %agent, output = %path, duration_ms, "Task done");
                        }
                        Err(e) => {
                            let message = format!("Failed to write artifact: {e}");
                            self.fail(store, id, agent, &message, AttemptKind::Failure, duration_ms)
                                .await?;
                        }
                    }
                }
            }
            TaskOutcome::Failed(e) if e.is_structural() => {
                error!(task_id = %id, error = %e, "Structural error, aborting run");
                return Err(e);
            }
            TaskOutcome::Failed(e) => {
                self.fail(store, id, agent, &e.to_string(), AttemptKind::Failure, duration_ms)
                    .await?;
            }
            TaskOutcome::TimedOut => {
                let message = format!(
                    "Task timed out after {}s",
                    self.config.task_timeout.as_secs()
                );
                self.fail(store, id, agent, &message, AttemptKind::Timeout, duration_ms)
                    .await?;
            }
        }
        store.persist().await
    }

    async fn fail(
        &self,
        store: &mut PrdStore,
        id: &str,
        agent: &str,
        message: &str,
        kind: AttemptKind,
        duration_ms: u64,
    ) -> ForgeflowResult<()> {
        let status = store.prd_mut().mark_failed(id, message)?;
        self.monitor.record_attempt(agent, kind, duration_ms).await;
        if status == TaskStatus::Blocked {
            error!(task_id = %id, %agent, error = %message, "Task blocked after exhausting attempts");
        } else {
            warn!(task_id = %id, %agent, error = %message, "Task attempt failed, re-queued");
        }
        Ok(())
    }

    /// Outputs of completed dependencies, truncated, for the prompt.
    async fn dependency_context(&self, prd: &Prd, task: &Task) -> String {
        let mut sections = Vec::new();
        for dep in task.dependencies.iter().filter_map(|d| prd.get(d)) {
            let Some(path) = &dep.output else {
                continue;
            };
            match tokio::fs::read_to_string(path).await {
                Ok(content) => sections.push(format!(
                    "### {} ({})\n{}",
                    dep.label(),
                    dep.id,
                    truncate_chars(&content, self.config.context_chars)
                )),
                Err(e) => debug!(task_id = %task.id, dep = %dep.id, error = %e, "Dependency output unreadable"),
            }
        }
        sections.join("\n\n")
    }

    fn artifacts_dir(&self, prd_path: &Path) -> PathBuf {
        self.config.artifacts_dir.clone().unwrap_or_else(|| {
            prd_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(".forgeflow")
                .join("artifacts")
        })
    }

    async fn outcome(&self, prd: &Prd, run_id: Uuid, iterations: usize, start: Instant) -> RunOutcome {
        let with_status = |status: TaskStatus| -> Vec<String> {
            prd.tasks
                .iter()
                .filter(|t| t.status == status)
                .map(|t| t.id.clone())
                .collect()
        };
        RunOutcome {
            run_id,
            iterations,
            done: with_status(TaskStatus::Done),
            blocked: with_status(TaskStatus::Blocked),
            stalled: prd.stalled(),
            metrics: self.monitor.snapshot().await,
            aggregate: self.monitor.aggregate().await,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

fn build_prompt(task: &Task, context: &str) -> String {
    let mut prompt = format!("# Task {}: {}\n\n{}\n", task.id, task.label(), task.description);

    if !task.todos.is_empty() {
        prompt.push_str("\n## Checklist\n");
        for todo in &task.todos {
            let mark = if todo.status == TodoStatus::Completed { "x" } else { " " };
            prompt.push_str(&format!("- [{mark}] {}\n", todo.title));
            for criterion in &todo.verification_criteria {
                prompt.push_str(&format!("  - {criterion}\n"));
            }
        }
    }
    if !context.is_empty() {
        prompt.push_str("\n## Output of completed dependencies\n\n");
        prompt.push_str(context);
        prompt.push('\n');
    }
    if let Some(error) = task.error.as_deref().filter(|_| task.attempts > 0) {
        prompt.push_str("\n## Previous attempt was rejected\n\n");
        prompt.push_str(error);
        prompt.push_str("\n\nFix these problems in this attempt.\n");
    }
    prompt
}

async fn write_artifact(dir: &Path, task: &Task, text: &str) -> ForgeflowResult<String> {
    tokio::fs::create_dir_all(dir).await?;
    let file_name: String = task
        .id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let path = dir.join(format!("{file_name}.md"));
    tokio::fs::write(&path, text).await?;
    Ok(path.display().to_string())
}
