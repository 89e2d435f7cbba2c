use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Metrics accumulated per agent over a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
    pub timeouts: u32,
    pub duration_ms: u64,
    pub tokens: u64,
    pub cost_usd: f64,
}

impl AgentMetrics {
    fn absorb(&mut self, other: &AgentMetrics) {
        self.attempts += other.attempts;
        self.successes += other.successes;
        self.failures += other.failures;
        self.timeouts += other.timeouts;
        self.duration_ms += other.duration_ms;
        self.tokens += other.tokens;
        self.cost_usd += other.cost_usd;
    }
}

/// How an attempt ended, from the monitor's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    Success,
    Failure,
    Timeout,
}

/// Tracks metrics for every agent that ran during an orchestration.
pub struct AgentMonitor {
    metrics: Arc<RwLock<HashMap<String, AgentMetrics>>>,
}

impl AgentMonitor {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record one finished attempt.
    pub async fn record_attempt(&self, agent: &str, kind: AttemptKind, duration_ms: u64) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(agent.to_string()).or_default();
        entry.attempts += 1;
        entry.duration_ms += duration_ms;
        match kind {
            AttemptKind::Success => entry.successes += 1,
            AttemptKind::Failure => entry.failures += 1,
            AttemptKind::Timeout => {
                entry.failures += 1;
                entry.timeouts += 1;
            }
        }
    }

    /// Record model usage for an agent.
    pub async fn record_usage(&self, agent: &str, tokens: u64, cost_usd: f64) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics.entry(agent.to_string()).or_default();
        entry.tokens += tokens;
        entry.cost_usd += cost_usd;
    }

    /// Get the metrics of a specific agent.
    pub async fn get(&self, agent: &str) -> Option<AgentMetrics> {
        self.metrics.read().await.get(agent).cloned()
    }

    /// Snapshot of every agent's metrics, sorted by agent key.
    pub async fn snapshot(&self) -> BTreeMap<String, AgentMetrics> {
        self.metrics
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Totals across all agents.
    pub async fn aggregate(&self) -> AgentMetrics {
        let metrics = self.metrics.read().await;
        let mut total = AgentMetrics::default();
        for m in metrics.values() {
            total.absorb(m);
        }
        total
    }

    /// Forget everything recorded so far.
    pub async fn reset(&self) {
        self.metrics.write().await.clear();
    }

    pub async fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "agents": self.snapshot().await,
            "aggregate": self.aggregate().await,
        })
    }
}

impl Default for AgentMonitor {
    fn default() -> Self {
        Self::new()
    }
}
