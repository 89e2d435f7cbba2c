use crate::types::Task;
use forgeflow_core::ForgeflowError;
use futures_util::future::join_all;
use std::collections::HashSet;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How one dispatched item ended.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed(T),
    Failed(ForgeflowError),
    /// The per-task timeout elapsed first.
    TimedOut,
}

#[derive(Debug)]
pub struct TaskResult<T> {
    pub outcome: TaskOutcome<T>,
    pub duration: Duration,
}

/// Executes items in fixed-size batches with a per-item timeout.
///
/// Each batch is awaited in full before the next starts. One item failing
/// or timing out never cancels its siblings.
#[derive(Debug, Clone)]
pub struct ParallelRunner {
    concurrency: usize,
    timeout: Duration,
}

impl ParallelRunner {
    pub fn new(concurrency: usize, timeout: Duration) -> Self {
        Self {
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run every item through `executor`. Results come back in input order.
    pub async fn run<I, T, F, Fut>(&self, items: Vec<I>, executor: F) -> Vec<TaskResult<T>>
    where
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T, ForgeflowError>>,
    {
        let total = items.len();
        let mut results = Vec::with_capacity(total);
        let mut items = items.into_iter().peekable();
        let mut batch_no = 0;

        while items.peek().is_some() {
            batch_no += 1;
            let batch: Vec<I> = items.by_ref().take(self.concurrency).collect();
            debug!(batch = batch_no, size = batch.len(), total, "Dispatching batch");

            let timeout = self.timeout;
            let futures = batch.into_iter().map(|item| {
                let fut = executor(item);
                async move {
                    let start = Instant::now();
                    let outcome = match tokio::time::timeout(timeout, fut).await {
                        Ok(Ok(value)) => TaskOutcome::Completed(value),
                        Ok(Err(e)) => TaskOutcome::Failed(e),
                        Err(_) => {
                            warn!(timeout_secs = timeout.as_secs(), "Task timed out");
                            TaskOutcome::TimedOut
                        }
                    };
                    TaskResult {
                        outcome,
                        duration: start.elapsed(),
                    }
                }
            });
            results.extend(join_all(futures).await);
        }
        results
    }
}

/// Greedy maximal subset of `tasks` with no dependency edge between two
/// members. Keeps input order.
pub fn independent_subset<'a>(tasks: &[&'a Task]) -> Vec<&'a Task> {
    let mut chosen: Vec<&'a Task> = Vec::new();
    let mut chosen_ids: HashSet<&str> = HashSet::new();
    for &task in tasks {
        let depends_on_chosen = task
            .dependencies
            .iter()
            .any(|d| chosen_ids.contains(d.as_str()));
        let chosen_depends_on_it = chosen
            .iter()
            .any(|c| c.dependencies.iter().any(|d| d == &task.id));
        if !depends_on_chosen && !chosen_depends_on_it {
            chosen_ids.insert(task.id.as_str());
            chosen.push(task);
        }
    }
    chosen
}
