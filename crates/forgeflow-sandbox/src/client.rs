use crate::languages::{file_name_for, normalize_language};
use forgeflow_core::{ForgeflowError, ForgeflowResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// `stderr` contents of a run that exceeded its time bound.
pub const TIMED_OUT: &str = "Execution timed out";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connection settings for the execution service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Base URL of the service (default: "http://localhost:2000").
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Memory limit in bytes for compile and run phases (-1 = service default).
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: i64,

    /// Extra time allowed on top of the execution bound for the HTTP round trip.
    #[serde(default = "default_network_grace_ms")]
    pub network_grace_ms: u64,

    /// Timeout for availability probes.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_base_url() -> String {
    "http://localhost:2000".to_string()
}

fn default_memory_limit() -> i64 {
    -1
}

fn default_network_grace_ms() -> u64 {
    2_000
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            memory_limit_bytes: default_memory_limit(),
            network_grace_ms: default_network_grace_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of executing one snippet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code; -1 when the service could not run the code at all,
    /// `128 + signo` when the process was killed by a signal.
    pub exit_code: i32,
    /// Signal that terminated the process, as reported by the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

impl ExecutionResult {
    /// A result describing a failure to reach or use the service.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: reason.into(),
            exit_code: -1,
            signal: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// True when the service never ran the code (transport failure or a
    /// response that outlived the client-side bound). A process the service
    /// killed did run and is not an infrastructure failure.
    pub fn is_infrastructure_failure(&self) -> bool {
        self.exit_code == -1
    }

    /// The client gave up waiting for the service.
    pub fn timed_out(&self) -> bool {
        self.exit_code == -1 && self.stderr == TIMED_OUT
    }

    pub fn killed_by_signal(&self) -> bool {
        self.signal.is_some()
    }

    /// One-line reason for a signal death, `None` for normal exits.
    pub fn signal_reason(&self) -> Option<String> {
        self.signal.as_deref().map(|signal| match signal {
            "SIGKILL" => "timed out or killed by SIGKILL".to_string(),
            other => format!("terminated by {other}"),
        })
    }
}

/// Conventional shell exit status for a process killed by `signal`.
fn signal_exit_code(signal: &str) -> i32 {
    let signo = match signal {
        "SIGHUP" => 1,
        "SIGINT" => 2,
        "SIGQUIT" => 3,
        "SIGILL" => 4,
        "SIGTRAP" => 5,
        "SIGABRT" => 6,
        "SIGBUS" => 7,
        "SIGFPE" => 8,
        "SIGKILL" => 9,
        "SIGSEGV" => 11,
        "SIGPIPE" => 13,
        "SIGALRM" => 14,
        "SIGTERM" => 15,
        "SIGXCPU" => 24,
        "SIGXFSZ" => 25,
        _ => 0,
    };
    128 + signo
}

/// An installed language runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runtime {
    pub language: String,
    pub version: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Runtime {
    /// Whether this runtime serves `language` (service id or alias).
    pub fn serves(&self, language: &str) -> bool {
        self.language == language || self.aliases.iter().any(|a| a == language)
    }
}

#[derive(Debug, Deserialize)]
struct StageResult {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    code: Option<i32>,
    signal: Option<String>,
}

impl StageResult {
    fn failed(&self) -> bool {
        self.code != Some(0)
    }

    fn into_result(self) -> ExecutionResult {
        match (self.code, self.signal) {
            (Some(code), _) => ExecutionResult {
                stdout: self.stdout,
                stderr: self.stderr,
                exit_code: code,
                signal: None,
            },
            (None, signal) => {
                // A stage with neither code nor signal still ran; report it as killed.
                let signal = signal.unwrap_or_else(|| "SIGKILL".to_string());
                let stderr = if self.stderr.trim().is_empty() {
                    format!("terminated by signal {signal}")
                } else {
                    format!("{}\nterminated by signal {signal}", self.stderr)
                };
                ExecutionResult {
                    stdout: self.stdout,
                    stderr,
                    exit_code: signal_exit_code(&signal),
                    signal: Some(signal),
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExecuteResponse {
    run: Option<StageResult>,
    compile: Option<StageResult>,
    message: Option<String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Stateless client for the execution service.
pub struct ExecutionClient {
    config: ExecutionConfig,
    http: reqwest::Client,
}

impl ExecutionClient {
    pub fn new(config: ExecutionConfig) -> ForgeflowResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ForgeflowError::Config(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    fn url(&self, endpoint: &str) -> String {
        format!(
            "{}/api/v2/{endpoint}",
            self.config.base_url.trim_end_matches('/')
        )
    }

    /// Run `code` and always resolve; failures are folded into the result.
    pub async fn execute(&self, language: &str, code: &str, timeout: Duration) -> ExecutionResult {
        match self.try_execute(language, code, timeout).await {
            Ok(result) => result,
            Err(e) => {
                warn!(language, error = %e, "Sandboxed execution failed");
                ExecutionResult::unavailable(e.to_string())
            }
        }
    }

    /// Run `code`, surfacing transport and protocol failures as errors.
    ///
    /// A run that exceeds `timeout` resolves to a [`TIMED_OUT`] result.
    pub async fn try_execute(
        &self,
        language: &str,
        code: &str,
        timeout: Duration,
    ) -> ForgeflowResult<ExecutionResult> {
        let lang = normalize_language(language)
            .ok_or_else(|| ForgeflowError::Sandbox(format!("Unsupported language '{language}'")))?;
        let file_name = file_name_for(lang).unwrap_or("main");
        let timeout_ms = timeout.as_millis() as u64;

        let body = serde_json::json!({
            "language": lang,
            "version": "*",
            "files": [{ "name": file_name, "content": code }],
            "compile_timeout": timeout_ms,
            "run_timeout": timeout_ms,
            "compile_memory_limit": self.config.memory_limit_bytes,
            "run_memory_limit": self.config.memory_limit_bytes,
        });

        debug!(language = lang, bytes = code.len(), timeout_ms, "Submitting code to sandbox");

        let bound = timeout + Duration::from_millis(self.config.network_grace_ms);
        let request = async {
            let resp = self
                .http
                .post(self.url("execute"))
                .json(&body)
                .send()
                .await
                .map_err(|e| ForgeflowError::Http(e.to_string()))?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(ForgeflowError::Http(format!(
                    "Execution service returned {status}: {text}"
                )));
            }
            resp.json::<ExecuteResponse>()
                .await
                .map_err(|e| ForgeflowError::Http(e.to_string()))
        };

        let parsed = match tokio::time::timeout(bound, request).await {
            Ok(result) => result?,
            Err(_) => return Ok(ExecutionResult::unavailable(TIMED_OUT)),
        };

        // A failed compile phase wins over whatever the run phase reported.
        match (parsed.compile, parsed.run) {
            (Some(compile), _) if compile.failed() => Ok(compile.into_result()),
            (_, Some(run)) => Ok(run.into_result()),
            (Some(compile), None) => Ok(compile.into_result()),
            (None, None) => Err(ForgeflowError::Sandbox(
                parsed
                    .message
                    .unwrap_or_else(|| "Execution service returned no result".to_string()),
            )),
        }
    }

    /// Whether the service answers its runtime listing.
    pub async fn is_available(&self) -> bool {
        self.try_list_runtimes().await.is_ok()
    }

    /// Installed runtimes; empty when the service is unreachable.
    pub async fn list_runtimes(&self) -> Vec<Runtime> {
        self.try_list_runtimes().await.unwrap_or_default()
    }

    pub async fn try_list_runtimes(&self) -> ForgeflowResult<Vec<Runtime>> {
        let probe = Duration::from_millis(self.config.probe_timeout_ms);
        let resp = self
            .http
            .get(self.url("runtimes"))
            .timeout(probe)
            .send()
            .await
            .map_err(|e| ForgeflowError::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ForgeflowError::Http(format!(
                "Execution service returned {status}"
            )));
        }
        resp.json()
            .await
            .map_err(|e| ForgeflowError::Http(e.to_string()))
    }
}
