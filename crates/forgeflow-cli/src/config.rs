//! `forgeflow.toml` loading and environment overrides.
//!
//! Every section is optional; a missing file yields the built-in defaults.
//! Environment variables are applied after the file so that a `.env` or a
//! shell export always wins.

use forgeflow_agent::{ModelConfig, RouterConfig, Tier};
use forgeflow_core::{ForgeflowError, ForgeflowResult};
use forgeflow_orchestrator::{GateSettings, OrchestratorConfig, TodoPolicy};
use forgeflow_sandbox::ExecutionConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the execution service URL from the config file.
pub const SANDBOX_URL_ENV: &str = "FORGEFLOW_SANDBOX_URL";

#[derive(Debug, Default, Deserialize)]
pub struct ForgeflowConfig {
    #[serde(default)]
    pub router: RouterSection,
    #[serde(default)]
    pub sandbox: SandboxSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub todo: TodoPolicy,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Default, Deserialize)]
pub struct RouterSection {
    pub tier: Option<Tier>,
    pub default_model: Option<String>,
    pub min_response_chars: Option<usize>,
    /// Added to the built-in catalog, replacing entries with the same name.
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Deserialize)]
pub struct SandboxSection {
    /// When false no execution client is built and both execution gates skip.
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub url: Option<String>,
    #[serde(default = "default_stage_timeout_ms")]
    pub compile_timeout_ms: u64,
    #[serde(default = "default_stage_timeout_ms")]
    pub run_timeout_ms: u64,
    pub memory_limit_bytes: Option<i64>,
    #[serde(default = "default_min_output_chars")]
    pub min_output_chars: usize,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            compile_timeout_ms: default_stage_timeout_ms(),
            run_timeout_ms: default_stage_timeout_ms(),
            memory_limit_bytes: None,
            min_output_chars: default_min_output_chars(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub parallel: bool,
    pub artifacts_dir: Option<PathBuf>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_context_chars")]
    pub context_chars: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            task_timeout_secs: default_task_timeout_secs(),
            parallel: true,
            artifacts_dir: None,
            max_iterations: default_max_iterations(),
            context_chars: default_context_chars(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TelemetrySection {
    /// Append one JSON line per model call to this file.
    pub calls_log: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}
fn default_stage_timeout_ms() -> u64 {
    10_000
}
fn default_min_output_chars() -> usize {
    20
}
fn default_concurrency() -> usize {
    3
}
fn default_task_timeout_secs() -> u64 {
    300
}
fn default_max_iterations() -> usize {
    1000
}
fn default_context_chars() -> usize {
    4000
}

/// Everything the commands need, after file and environment are merged.
#[derive(Debug, Clone)]
pub struct Settings {
    pub router: RouterConfig,
    /// `None` when the sandbox is disabled.
    pub execution: Option<ExecutionConfig>,
    pub gates: GateSettings,
    pub orchestrator: OrchestratorConfig,
    pub calls_log: Option<PathBuf>,
}

impl ForgeflowConfig {
    /// Read `path`, or return defaults when it does not exist.
    pub fn load(path: &Path) -> ForgeflowResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            ForgeflowError::Config(format!("Failed to read config '{}': {e}", path.display()))
        })?;
        Self::parse(&content).map_err(|e| {
            ForgeflowError::Config(format!("Failed to parse config '{}': {e}", path.display()))
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Merge with the process environment.
    pub fn resolve(self) -> ForgeflowResult<Settings> {
        self.resolve_with(|key| std::env::var(key).ok())
    }

    /// Same as [`ForgeflowConfig::resolve`] with an injectable lookup.
    pub fn resolve_with<F>(self, lookup: F) -> ForgeflowResult<Settings>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut router = RouterConfig::default();
        if let Some(tier) = self.router.tier {
            router.tier = tier;
        }
        if self.router.default_model.is_some() {
            router.default_model = self.router.default_model;
        }
        if let Some(min) = self.router.min_response_chars {
            router.min_response_chars = min;
        }
        for model in self.router.models {
            router.upsert_model(model);
        }
        router.apply_env_from(&lookup)?;
        router.validate()?;

        let execution = if self.sandbox.enabled {
            let mut execution = ExecutionConfig::default();
            if let Some(url) = self.sandbox.url {
                execution.base_url = url;
            }
            if let Some(url) = lookup(SANDBOX_URL_ENV).filter(|v| !v.trim().is_empty()) {
                execution.base_url = url.trim().to_string();
            }
            if let Some(limit) = self.sandbox.memory_limit_bytes {
                execution.memory_limit_bytes = limit;
            }
            Some(execution)
        } else {
            None
        };

        let gates = GateSettings {
            min_output_chars: self.sandbox.min_output_chars,
            compile_timeout: Duration::from_millis(self.sandbox.compile_timeout_ms),
            run_timeout: Duration::from_millis(self.sandbox.run_timeout_ms),
        };

        if self.orchestrator.concurrency == 0 {
            return Err(ForgeflowError::Config(
                "orchestrator.concurrency must be at least 1".into(),
            ));
        }
        let orchestrator = OrchestratorConfig {
            concurrency: self.orchestrator.concurrency,
            task_timeout: Duration::from_secs(self.orchestrator.task_timeout_secs),
            parallel: self.orchestrator.parallel,
            artifacts_dir: self.orchestrator.artifacts_dir,
            todo_policy: self.todo,
            max_iterations: self.orchestrator.max_iterations,
            context_chars: self.orchestrator.context_chars,
        };

        Ok(Settings {
            router,
            execution,
            gates,
            orchestrator,
            calls_log: self.telemetry.calls_log,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = ForgeflowConfig::load(Path::new("/nonexistent/forgeflow.toml")).unwrap();
        let settings = config.resolve_with(env(&[])).unwrap();
        assert_eq!(settings.router.tier, Tier::Free);
        assert_eq!(settings.orchestrator.concurrency, 3);
        assert!(settings.orchestrator.parallel);
        assert_eq!(
            settings.execution.unwrap().base_url,
            ExecutionConfig::default().base_url
        );
        assert!(settings.calls_log.is_none());
    }

    #[test]
    fn test_all_sections_parse() {
        let config = ForgeflowConfig::parse(
            r#"
[router]
tier = "paid"
min_response_chars = 40

[[router.models]]
name = "local-big"
provider = "ollama"
model_id = "qwen2.5-coder:32b"
tier = "free"

[sandbox]
url = "http://piston:2000"
compile_timeout_ms = 5000
memory_limit_bytes = 268435456

[orchestrator]
concurrency = 5
task_timeout_secs = 60
parallel = false
artifacts_dir = "out"

[todo]
min_description_chars = 100
keywords = ["wire up"]

[telemetry]
calls_log = "calls.jsonl"
"#,
        )
        .unwrap();
        let settings = config.resolve_with(env(&[])).unwrap();
        assert_eq!(settings.router.tier, Tier::Paid);
        assert_eq!(settings.router.min_response_chars, 40);
        assert_eq!(
            settings.router.model("local-big").unwrap().model_id,
            "qwen2.5-coder:32b"
        );
        let execution = settings.execution.unwrap();
        assert_eq!(execution.base_url, "http://piston:2000");
        assert_eq!(execution.memory_limit_bytes, 268_435_456);
        assert_eq!(settings.gates.compile_timeout, Duration::from_secs(5));
        assert_eq!(settings.gates.run_timeout, Duration::from_secs(10));
        assert_eq!(settings.orchestrator.concurrency, 5);
        assert_eq!(settings.orchestrator.task_timeout, Duration::from_secs(60));
        assert!(!settings.orchestrator.parallel);
        assert_eq!(settings.orchestrator.artifacts_dir, Some(PathBuf::from("out")));
        assert_eq!(settings.orchestrator.todo_policy.min_description_chars, 100);
        assert_eq!(settings.orchestrator.todo_policy.keywords, vec!["wire up"]);
        assert_eq!(settings.calls_log, Some(PathBuf::from("calls.jsonl")));
    }

    #[test]
    fn test_environment_overrides_file() {
        let config = ForgeflowConfig::parse(
            "[router]\ntier = \"paid\"\n\n[sandbox]\nurl = \"http://file:2000\"\n",
        )
        .unwrap();
        let settings = config
            .resolve_with(env(&[
                ("FORGEFLOW_TIER", "hybrid"),
                ("FORGEFLOW_SANDBOX_URL", "http://env:2000"),
            ]))
            .unwrap();
        assert_eq!(settings.router.tier, Tier::Hybrid);
        assert_eq!(settings.execution.unwrap().base_url, "http://env:2000");
    }

    #[test]
    fn test_invalid_tier_in_environment_is_rejected() {
        let err = ForgeflowConfig::default()
            .resolve_with(env(&[("FORGEFLOW_TIER", "platinum")]))
            .unwrap_err();
        assert!(matches!(err, ForgeflowError::Config(_)));
    }

    #[test]
    fn test_unknown_default_model_is_rejected() {
        let config = ForgeflowConfig::parse("[router]\ndefault_model = \"nope\"\n").unwrap();
        let err = config.resolve_with(env(&[])).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_disabled_sandbox_has_no_execution_config() {
        let config = ForgeflowConfig::parse("[sandbox]\nenabled = false\n").unwrap();
        let settings = config
            .resolve_with(env(&[("FORGEFLOW_SANDBOX_URL", "http://ignored:2000")]))
            .unwrap();
        assert!(settings.execution.is_none());
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let config = ForgeflowConfig::parse("[orchestrator]\nconcurrency = 0\n").unwrap();
        assert!(config.resolve_with(env(&[])).is_err());
    }

    #[test]
    fn test_example_config_resolves() {
        let config =
            ForgeflowConfig::parse(include_str!("../../../forgeflow.example.toml")).unwrap();
        let settings = config.resolve_with(env(&[])).unwrap();
        assert_eq!(settings.router.tier, Tier::Free);
        assert!(settings.execution.is_some());
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp.as_file_mut(), "{{{{invalid toml!!!!").unwrap();
        let err = ForgeflowConfig::load(tmp.path()).unwrap_err();
        assert!(
            err.to_string().contains("Failed to parse config"),
            "unexpected error: {err}"
        );
    }
}
