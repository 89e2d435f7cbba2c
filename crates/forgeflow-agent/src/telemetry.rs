use crate::config::ModelConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forgeflow_core::{estimate_tokens, ForgeflowResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Timing and outcome of one backend call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub model: String,
    pub provider: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub prompt_tokens: u64,
    pub response_tokens: u64,
    pub estimated_cost: f64,
}

/// Side channel receiving a [`CallRecord`] per call.
///
/// Implementations may fail; [`recorded`] swallows those failures.
#[async_trait]
pub trait CallSink: Send + Sync {
    async fn record(&self, record: &CallRecord) -> ForgeflowResult<()>;
}

/// Logs each call as a structured tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl CallSink for TracingSink {
    async fn record(&self, record: &CallRecord) -> ForgeflowResult<()> {
        if record.success {
            info!(
                model = %record.model,
                provider = %record.provider,
                duration_ms = record.duration_ms,
                response_tokens = record.response_tokens,
                cost = record.estimated_cost,
                "Model call succeeded"
            );
        } else {
            warn!(
                model = %record.model,
                provider = %record.provider,
                duration_ms = record.duration_ms,
                error = record.error.as_deref().unwrap_or_default(),
                "Model call failed"
            );
        }
        Ok(())
    }
}

/// Appends one JSON line per call to a local file.
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CallSink for JsonlSink {
    async fn record(&self, record: &CallRecord) -> ForgeflowResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

/// Run `call` against `model`, then report its timing and outcome to `sink`.
///
/// The call's own result is returned untouched; a failing sink is logged
/// and ignored.
pub async fn recorded<F>(
    sink: &dyn CallSink,
    model: &ModelConfig,
    prompt: &str,
    call: F,
) -> ForgeflowResult<String>
where
    F: Future<Output = ForgeflowResult<String>>,
{
    let started_at = Utc::now();
    let start = Instant::now();
    let result = call.await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let prompt_tokens = estimate_tokens(prompt);
    let response_tokens = result.as_deref().map(estimate_tokens).unwrap_or(0);
    let record = CallRecord {
        model: model.name.clone(),
        provider: model.provider.to_string(),
        started_at,
        duration_ms,
        success: result.is_ok(),
        error: result.as_ref().err().map(ToString::to_string),
        prompt_tokens,
        response_tokens,
        estimated_cost: model.estimate_cost(prompt_tokens + response_tokens),
    };

    if let Err(e) = sink.record(&record).await {
        warn!(model = %model.name, error = %e, "Call sink failed; record dropped");
    } else {
        debug!(model = %model.name, "Call recorded");
    }

    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::{LlmProvider, Tier};
    use forgeflow_core::ForgeflowError;

    struct BrokenSink;

    #[async_trait]
    impl CallSink for BrokenSink {
        async fn record(&self, _record: &CallRecord) -> ForgeflowResult<()> {
            Err(ForgeflowError::Io(std::io::Error::other("disk full")))
        }
    }

    fn model() -> ModelConfig {
        ModelConfig::new("gpt-4o", LlmProvider::OpenAi, "gpt-4o", Tier::Paid).with_cost(0.0025)
    }

    #[tokio::test]
    async fn test_broken_sink_does_not_change_success() {
        let result = recorded(&BrokenSink, &model(), "prompt", async {
            Ok("the answer".to_string())
        })
        .await;
        assert_eq!(result.unwrap(), "the answer");
    }

    #[tokio::test]
    async fn test_broken_sink_does_not_change_failure() {
        let result = recorded(&BrokenSink, &model(), "prompt", async {
            Err(ForgeflowError::Http("503 Service Unavailable".into()))
        })
        .await;
        assert!(result.unwrap_err().to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_records() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("calls.jsonl");
        let sink = JsonlSink::new(&path);

        for _ in 0..2 {
            recorded(&sink, &model(), "some prompt text", async {
                Ok("response".to_string())
            })
            .await
            .unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let record: CallRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record.model, "gpt-4o");
        assert!(record.success);
        assert!(record.estimated_cost > 0.0);
    }
}
