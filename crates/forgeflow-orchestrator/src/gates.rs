//! Quality gates applied to an agent's output before it is accepted.
//!
//! Gates run in a fixed order and all of them run on every attempt, so the
//! report always carries the complete picture. A gate whose preconditions
//! are not met (wrong agent role, no code, execution service down, runtime
//! not installed) passes with `skipped = true`.

use crate::profiles::{AgentProfile, Capability};
use crate::types::{Diagnostic, GateResult, Task};
use async_trait::async_trait;
use forgeflow_agent::{parse_structured, StructuredStatus};
use forgeflow_sandbox::{normalize_language, ExecutionClient, Runtime};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Printed by smoke harnesses once the wrapped code finished without raising.
pub const SMOKE_SENTINEL: &str = "__FORGEFLOW_SMOKE_OK__";

/// What a gate looks at.
pub struct GateContext<'a> {
    pub output: &'a str,
    pub task: &'a Task,
    pub profile: &'a AgentProfile,
}

#[async_trait]
pub trait Gate: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self, ctx: &GateContext<'_>) -> GateResult;
}

/// Tunables for the standard pipeline.
#[derive(Debug, Clone)]
pub struct GateSettings {
    pub min_output_chars: usize,
    pub compile_timeout: Duration,
    pub run_timeout: Duration,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            min_output_chars: 20,
            compile_timeout: Duration::from_secs(10),
            run_timeout: Duration::from_secs(10),
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Results of every gate for one attempt, in pipeline order.
#[derive(Debug, Clone, Default)]
pub struct GateReport {
    pub results: Vec<GateResult>,
}

impl GateReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn first_failure(&self) -> Option<&GateResult> {
        self.results.iter().find(|r| !r.passed)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &GateResult> {
        self.results.iter().filter(|r| r.skipped)
    }
}

pub struct GatePipeline {
    gates: Vec<Box<dyn Gate>>,
}

impl GatePipeline {
    pub fn new(gates: Vec<Box<dyn Gate>>) -> Self {
        Self { gates }
    }

    /// The five standard gates. Without a client both execution gates skip.
    pub fn standard(client: Option<Arc<ExecutionClient>>, settings: &GateSettings) -> Self {
        Self::new(vec![
            Box::new(OutputPresentGate {
                min_chars: settings.min_output_chars,
            }),
            Box::new(FencesBalancedGate),
            Box::new(StructuredOutputGate),
            Box::new(CompilationGate {
                client: client.clone(),
                timeout: settings.compile_timeout,
            }),
            Box::new(SmokeTestGate {
                client,
                timeout: settings.run_timeout,
            }),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.gates.iter().map(|g| g.name()).collect()
    }

    pub async fn run(&self, output: &str, task: &Task, profile: &AgentProfile) -> GateReport {
        let ctx = GateContext {
            output,
            task,
            profile,
        };
        let mut results = Vec::with_capacity(self.gates.len());
        for gate in &self.gates {
            let result = gate.check(&ctx).await;
            if result.passed {
                debug!(
                    task_id = %task.id,
                    gate = gate.name(),
                    skipped = result.skipped,
                    message = %result.message,
                    "Gate passed"
                );
            } else {
                warn!(task_id = %task.id, gate = gate.name(), message = %result.message, "Gate failed");
            }
            results.push(result);
        }
        GateReport { results }
    }
}

// ---------------------------------------------------------------------------
// Content gates
// ---------------------------------------------------------------------------

pub struct OutputPresentGate {
    pub min_chars: usize,
}

#[async_trait]
impl Gate for OutputPresentGate {
    fn name(&self) -> &'static str {
        "output_present"
    }

    async fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        let chars = ctx.output.trim().chars().count();
        if chars == 0 {
            GateResult::fail(self.name(), "Output is empty")
        } else if chars < self.min_chars {
            GateResult::fail(
                self.name(),
                format!("Output too short ({chars} chars, need {})", self.min_chars),
            )
        } else {
            GateResult::pass(self.name(), format!("{chars} chars"))
        }
    }
}

/// An odd number of fence lines means the response was cut off mid-block.
pub struct FencesBalancedGate;

#[async_trait]
impl Gate for FencesBalancedGate {
    fn name(&self) -> &'static str {
        "fences_balanced"
    }

    async fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        let fences = ctx
            .output
            .lines()
            .filter(|l| l.trim_start().starts_with("```"))
            .count();
        if fences % 2 == 0 {
            GateResult::pass(self.name(), format!("{} fenced block(s)", fences / 2))
        } else {
            GateResult::fail(
                self.name(),
                "Unterminated code fence; output looks truncated",
            )
        }
    }
}

pub struct StructuredOutputGate;

#[async_trait]
impl Gate for StructuredOutputGate {
    fn name(&self) -> &'static str {
        "structured_output"
    }

    async fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        let Some(schema) = &ctx.profile.output_schema else {
            return GateResult::skip(self.name(), "agent has no output schema");
        };
        match parse_structured(ctx.output, schema).status {
            StructuredStatus::Valid => GateResult::pass(self.name(), "matches schema"),
            StructuredStatus::Invalid { errors } => GateResult::fail(
                self.name(),
                format!("Structured output invalid: {}", errors.join("; ")),
            ),
            StructuredStatus::Unparsed => GateResult::fail(self.name(), "No JSON object in output"),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution gates
// ---------------------------------------------------------------------------

/// A fenced block tagged with a language the execution service knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    /// Normalized language id.
    pub language: &'static str,
    pub code: String,
}

fn fence_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```([A-Za-z0-9_+.#-]*)[^\n]*\n(.*?)```").ok())
        .as_ref()
}

/// Fenced blocks whose tag maps to a supported language, in order.
pub fn extract_code_blocks(text: &str) -> Vec<CodeBlock> {
    let Some(re) = fence_regex() else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|cap| {
            let language = normalize_language(cap.get(1)?.as_str())?;
            let code = cap.get(2)?.as_str().to_string();
            (!code.trim().is_empty()).then_some(CodeBlock { language, code })
        })
        .collect()
}

/// Skip verdict when an execution gate has nothing it can run, otherwise
/// the client and the blocks with an installed runtime.
async fn runnable_blocks<'c>(
    gate: &str,
    client: Option<&'c ExecutionClient>,
    ctx: &GateContext<'_>,
) -> Result<(&'c ExecutionClient, Vec<CodeBlock>), GateResult> {
    if !ctx.profile.has(Capability::EmitsCode) {
        return Err(GateResult::skip(gate, "agent does not emit executable code"));
    }
    let blocks = extract_code_blocks(ctx.output);
    if blocks.is_empty() {
        return Err(GateResult::skip(gate, "no code blocks in a supported language"));
    }
    let Some(client) = client else {
        return Err(GateResult::skip(gate, "execution service not configured"));
    };
    let runtimes: Vec<Runtime> = match client.try_list_runtimes().await {
        Ok(runtimes) => runtimes,
        Err(e) => {
            info!(gate, error = %e, "Execution service unavailable, skipping gate");
            return Err(GateResult::skip(gate, "execution service unavailable"));
        }
    };
    let (installed, missing): (Vec<CodeBlock>, Vec<CodeBlock>) = blocks
        .into_iter()
        .partition(|b| runtimes.iter().any(|r| r.serves(b.language)));
    if installed.is_empty() {
        let mut languages: Vec<&str> = missing.iter().map(|b| b.language).collect();
        languages.sort_unstable();
        languages.dedup();
        return Err(GateResult::skip(
            gate,
            format!("no runtime installed for {}", languages.join(", ")),
        ));
    }
    Ok((client, installed))
}

/// Submits every code block to the execution service and fails on any
/// non-zero exit, carrying the parsed diagnostics.
pub struct CompilationGate {
    pub client: Option<Arc<ExecutionClient>>,
    pub timeout: Duration,
}

#[async_trait]
impl Gate for CompilationGate {
    fn name(&self) -> &'static str {
        "compilation"
    }

    async fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        let (client, blocks) = match runnable_blocks(self.name(), self.client.as_deref(), ctx).await
        {
            Ok(found) => found,
            Err(skip) => return skip,
        };

        let mut failures = Vec::new();
        let mut diagnostics = Vec::new();
        let mut ran = 0;
        for (i, block) in blocks.iter().enumerate() {
            let result = client.execute(block.language, &block.code, self.timeout).await;
            if result.is_infrastructure_failure() {
                debug!(language = block.language, stderr = %result.stderr, "Block not executed");
                continue;
            }
            ran += 1;
            if !result.succeeded() {
                let stream = if result.stderr.trim().is_empty() {
                    &result.stdout
                } else {
                    &result.stderr
                };
                let parsed = parse_diagnostics(stream);
                let first = parsed
                    .first()
                    .map(ToString::to_string)
                    .or_else(|| result.signal_reason())
                    .unwrap_or_else(|| format!("exit code {}", result.exit_code));
                failures.push(format!("{} block {} failed: {first}", block.language, i + 1));
                diagnostics.extend(parsed);
            }
        }

        if !failures.is_empty() {
            GateResult::fail(self.name(), failures.join("; ")).with_diagnostics(diagnostics)
        } else if ran == 0 {
            GateResult::skip(self.name(), "execution service could not run any block")
        } else {
            GateResult::pass(self.name(), format!("{ran} block(s) compiled"))
        }
    }
}

/// Runs each block inside a harness that prints [`SMOKE_SENTINEL`] when the
/// code completes, and fails when the sentinel is missing.
pub struct SmokeTestGate {
    pub client: Option<Arc<ExecutionClient>>,
    pub timeout: Duration,
}

#[async_trait]
impl Gate for SmokeTestGate {
    fn name(&self) -> &'static str {
        "smoke_test"
    }

    async fn check(&self, ctx: &GateContext<'_>) -> GateResult {
        let (client, blocks) = match runnable_blocks(self.name(), self.client.as_deref(), ctx).await
        {
            Ok(found) => found,
            Err(skip) => return skip,
        };

        let mut failures = Vec::new();
        let mut ran = 0;
        for (i, block) in blocks.iter().enumerate() {
            let Some(harness) = smoke_harness(block.language, &block.code) else {
                continue;
            };
            let result = client.execute(block.language, &harness, self.timeout).await;
            if result.is_infrastructure_failure() {
                continue;
            }
            ran += 1;
            if let Some(reason) = result.signal_reason() {
                failures.push(format!("{} block {} {reason}", block.language, i + 1));
            } else if !result.succeeded() {
                let detail = parse_diagnostics(&result.stderr)
                    .first()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                failures.push(format!(
                    "{} block {} exited with code {}: {detail}",
                    block.language,
                    i + 1,
                    result.exit_code
                ));
            } else if !result.stdout.contains(SMOKE_SENTINEL) {
                failures.push(format!(
                    "{} block {} did not run to completion",
                    block.language,
                    i + 1
                ));
            }
        }

        if !failures.is_empty() {
            GateResult::fail(self.name(), failures.join("; "))
        } else if ran == 0 {
            GateResult::skip(self.name(), "no block with a smoke harness could run")
        } else {
            GateResult::pass(self.name(), format!("{ran} block(s) ran to completion"))
        }
    }
}

/// Wrap `code` so it prints [`SMOKE_SENTINEL`] after running. `None` for
/// languages without a harness.
pub fn smoke_harness(language: &str, code: &str) -> Option<String> {
    let harness = match language {
        "python" => format!("{code}\n\nprint(\"{SMOKE_SENTINEL}\")\n"),
        "javascript" | "typescript" => format!("{code}\n;console.log(\"{SMOKE_SENTINEL}\");\n"),
        "bash" => format!("set -e\n{code}\necho \"{SMOKE_SENTINEL}\"\n"),
        "ruby" => format!("{code}\nputs \"{SMOKE_SENTINEL}\"\n"),
        _ => return None,
    };
    Some(harness)
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

struct DiagnosticPatterns {
    rustc: Regex,
    rustc_location: Regex,
    tsc: Regex,
    python_error: Regex,
    python_location: Regex,
    java: Regex,
    file_line_col: Regex,
}

impl DiagnosticPatterns {
    fn compile() -> Option<Self> {
        Some(Self {
            rustc: Regex::new(r"^error(?:\[(E\d{4})\])?: (.+)$").ok()?,
            rustc_location: Regex::new(r"^\s*--> (\S+)").ok()?,
            tsc: Regex::new(r"^(.+?)\((\d+),(\d+)\): error (TS\d+): (.+)$").ok()?,
            python_error: Regex::new(r"^([A-Za-z_][\w.]*(?:Error|Exception)): ?(.*)$").ok()?,
            python_location: Regex::new(r#"^\s*File "(.+?)", line (\d+)"#).ok()?,
            java: Regex::new(r"^(\S+\.java):(\d+): error: (.+)$").ok()?,
            file_line_col: Regex::new(r"^(\S+?):(\d+):(\d+): (?:(?:fatal )?error: )?(.+)$").ok()?,
        })
    }
}

fn patterns() -> Option<&'static DiagnosticPatterns> {
    static PATTERNS: OnceLock<Option<DiagnosticPatterns>> = OnceLock::new();
    PATTERNS.get_or_init(DiagnosticPatterns::compile).as_ref()
}

/// Parse compiler or runtime output into diagnostics.
///
/// Recognizes rustc, tsc, Python tracebacks, javac and `file:line:col:`
/// compilers (gcc, clang, go). Falls back to the first non-empty line.
pub fn parse_diagnostics(stderr: &str) -> Vec<Diagnostic> {
    let Some(p) = patterns() else {
        return fallback_diagnostic(stderr);
    };
    let lines: Vec<&str> = stderr.lines().collect();

    let parsers: [fn(&DiagnosticPatterns, &[&str]) -> Vec<Diagnostic>; 5] =
        [parse_rustc, parse_tsc, parse_python, parse_java, parse_file_line_col];
    for parser in parsers {
        let found = parser(p, &lines);
        if !found.is_empty() {
            return found;
        }
    }
    fallback_diagnostic(stderr)
}

fn parse_rustc(p: &DiagnosticPatterns, lines: &[&str]) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        let Some(cap) = p.rustc.captures(line) else {
            continue;
        };
        let message = cap[2].to_string();
        if message.starts_with("aborting due to") || message.starts_with("could not compile") {
            continue;
        }
        let location = lines
            .iter()
            .skip(i + 1)
            .take(3)
            .find_map(|l| p.rustc_location.captures(l).map(|c| c[1].to_string()));
        out.push(Diagnostic {
            code: cap.get(1).map(|m| m.as_str().to_string()),
            message,
            location,
        });
    }
    out
}

fn parse_tsc(p: &DiagnosticPatterns, lines: &[&str]) -> Vec<Diagnostic> {
    lines
        .iter()
        .filter_map(|l| p.tsc.captures(l))
        .map(|cap| Diagnostic {
            code: Some(cap[4].to_string()),
            message: cap[5].to_string(),
            location: Some(format!("{}:{}:{}", &cap[1], &cap[2], &cap[3])),
        })
        .collect()
}

fn parse_python(p: &DiagnosticPatterns, lines: &[&str]) -> Vec<Diagnostic> {
    let Some(cap) = lines
        .iter()
        .rev()
        .find_map(|l| p.python_error.captures(l.trim_end()))
    else {
        return Vec::new();
    };
    let location = lines
        .iter()
        .rev()
        .find_map(|l| p.python_location.captures(l))
        .map(|c| format!("{}:{}", &c[1], &c[2]));
    vec![Diagnostic {
        code: Some(cap[1].to_string()),
        message: cap[2].to_string(),
        location,
    }]
}

fn parse_java(p: &DiagnosticPatterns, lines: &[&str]) -> Vec<Diagnostic> {
    lines
        .iter()
        .filter_map(|l| p.java.captures(l))
        .map(|cap| Diagnostic {
            code: None,
            message: cap[3].to_string(),
            location: Some(format!("{}:{}", &cap[1], &cap[2])),
        })
        .collect()
}

fn parse_file_line_col(p: &DiagnosticPatterns, lines: &[&str]) -> Vec<Diagnostic> {
    lines
        .iter()
        .filter_map(|l| p.file_line_col.captures(l))
        .filter(|cap| !cap[4].starts_with("warning:") && !cap[4].starts_with("note:"))
        .map(|cap| Diagnostic {
            code: None,
            message: cap[4].to_string(),
            location: Some(format!("{}:{}:{}", &cap[1], &cap[2], &cap[3])),
        })
        .collect()
}

fn fallback_diagnostic(stderr: &str) -> Vec<Diagnostic> {
    stderr
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|line| {
            vec![Diagnostic {
                code: None,
                message: line.to_string(),
                location: None,
            }]
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::default_registry;
    use forgeflow_sandbox::ExecutionConfig;

    fn unreachable_client() -> Arc<ExecutionClient> {
        Arc::new(
            ExecutionClient::new(ExecutionConfig {
                base_url: "http://127.0.0.1:9".to_string(),
                probe_timeout_ms: 500,
                ..ExecutionConfig::default()
            })
            .unwrap(),
        )
    }

    const BACKEND_OUTPUT: &str = "Here is the server:\n\n```python\nprint('hello')\n```\n";

    #[test]
    fn test_extract_code_blocks_skips_unknown_tags() {
        let text = "```py\nx = 1\n```\n```mermaid\ngraph TD\n```\n```\nplain\n```\n```rust\nfn main() {}\n```";
        let blocks = extract_code_blocks(text);
        let langs: Vec<&str> = blocks.iter().map(|b| b.language).collect();
        assert_eq!(langs, vec!["python", "rust"]);
        assert_eq!(blocks[0].code, "x = 1\n");
    }

    #[test]
    fn test_parse_rustc_diagnostic() {
        let stderr = "error[E0425]: cannot find value `x` in this scope\n --> main.rs:2:5\n  |\n2 |     x;\n\nerror: aborting due to 1 previous error\n";
        let d = parse_diagnostics(stderr);
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].code.as_deref(), Some("E0425"));
        assert_eq!(d[0].location.as_deref(), Some("main.rs:2:5"));
    }

    #[test]
    fn test_parse_tsc_diagnostic() {
        let d = parse_diagnostics("main.ts(3,7): error TS2322: Type 'string' is not assignable to type 'number'.");
        assert_eq!(d[0].code.as_deref(), Some("TS2322"));
        assert_eq!(d[0].location.as_deref(), Some("main.ts:3:7"));
    }

    #[test]
    fn test_parse_python_traceback() {
        let stderr = "Traceback (most recent call last):\n  File \"/piston/jobs/x/main.py\", line 4, in <module>\n    foo()\nNameError: name 'foo' is not defined\n";
        let d = parse_diagnostics(stderr);
        assert_eq!(d[0].code.as_deref(), Some("NameError"));
        assert_eq!(d[0].message, "name 'foo' is not defined");
        assert_eq!(d[0].location.as_deref(), Some("/piston/jobs/x/main.py:4"));
    }

    #[test]
    fn test_parse_gcc_and_go_diagnostics() {
        let gcc = parse_diagnostics("main.c:3:5: error: expected ';' before 'return'\nmain.c:1:1: warning: unused");
        assert_eq!(gcc.len(), 1);
        assert_eq!(gcc[0].message, "expected ';' before 'return'");

        let go = parse_diagnostics("./main.go:5:2: undefined: fmt.Printl");
        assert_eq!(go[0].location.as_deref(), Some("./main.go:5:2"));
    }

    #[test]
    fn test_parse_fallback_first_line() {
        let d = parse_diagnostics("\n  Segmentation fault\nmore");
        assert_eq!(d[0].message, "Segmentation fault");
        assert!(parse_diagnostics("").is_empty());
    }

    #[test]
    fn test_smoke_harness_languages() {
        assert!(smoke_harness("python", "x = 1").unwrap().ends_with(&format!("print(\"{SMOKE_SENTINEL}\")\n")));
        assert!(smoke_harness("bash", "ls").unwrap().starts_with("set -e"));
        assert!(smoke_harness("rust", "fn main() {}").is_none());
    }

    #[tokio::test]
    async fn test_execution_gates_skip_when_service_unavailable() {
        let registry = default_registry();
        let profile = registry.resolve("backend").unwrap();
        let task = Task::new("api", "backend", "Build the API");
        let pipeline = GatePipeline::standard(Some(unreachable_client()), &GateSettings::default());

        let report = pipeline.run(BACKEND_OUTPUT, &task, profile).await;
        assert!(report.passed());
        let skipped: Vec<&str> = report.skipped().map(|r| r.gate.as_str()).collect();
        assert!(skipped.contains(&"compilation"));
        assert!(skipped.contains(&"smoke_test"));
        for result in report.results.iter().filter(|r| r.gate == "compilation" || r.gate == "smoke_test") {
            assert!(result.message.contains("unavailable"));
        }
    }

    #[tokio::test]
    async fn test_non_code_agent_skips_execution_gates() {
        let registry = default_registry();
        let profile = registry.resolve("docs").unwrap();
        let task = Task::new("readme", "docs", "Write docs");
        let pipeline = GatePipeline::standard(None, &GateSettings::default());
        let report = pipeline.run(BACKEND_OUTPUT, &task, profile).await;
        assert!(report.passed());
        assert_eq!(report.skipped().count(), 3);
    }

    #[tokio::test]
    async fn test_all_gates_run_after_a_failure() {
        let registry = default_registry();
        let profile = registry.resolve("reviewer").unwrap();
        let task = Task::new("review", "reviewer", "Review");
        let pipeline = GatePipeline::standard(None, &GateSettings::default());

        let report = pipeline
            .run("Looks fine overall to me.\n```json\n{\"approved\": true}\n", &task, profile)
            .await;
        assert_eq!(report.results.len(), pipeline.names().len());
        assert!(!report.passed());
        assert_eq!(report.first_failure().map(|r| r.gate.as_str()), Some("fences_balanced"));
        let structured = report.results.iter().find(|r| r.gate == "structured_output").unwrap();
        assert!(!structured.passed);
    }

    #[tokio::test]
    async fn test_structured_gate_reports_missing_fields() {
        let registry = default_registry();
        let profile = registry.resolve("reviewer").unwrap();
        let task = Task::new("review", "reviewer", "Review");
        let gate = StructuredOutputGate;
        let ctx = GateContext {
            output: "```json\n{\"approved\": false}\n```",
            task: &task,
            profile,
        };
        let result = gate.check(&ctx).await;
        assert!(!result.passed);
        assert!(result.message.contains("issues"));
    }

    #[tokio::test]
    async fn test_output_present_gate() {
        let registry = default_registry();
        let profile = registry.resolve("docs").unwrap();
        let task = Task::new("d", "docs", "");
        let gate = OutputPresentGate { min_chars: 10 };
        let short = gate
            .check(&GateContext { output: "  ok ", task: &task, profile })
            .await;
        assert!(!short.passed);
        let empty = gate
            .check(&GateContext { output: "   ", task: &task, profile })
            .await;
        assert_eq!(empty.message, "Output is empty");
    }
}
