//! Execution gates against a mock execution service.

use forgeflow_orchestrator::gates::SMOKE_SENTINEL;
use forgeflow_orchestrator::{default_registry, GatePipeline, GateSettings, Task};
use forgeflow_sandbox::{ExecutionClient, ExecutionConfig};
use std::sync::Arc;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn sandbox_with(runtimes: serde_json::Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/runtimes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(runtimes))
        .mount(&server)
        .await;
    server
}

fn pipeline(server: &MockServer) -> GatePipeline {
    let client = ExecutionClient::new(ExecutionConfig {
        base_url: server.uri(),
        ..ExecutionConfig::default()
    })
    .unwrap();
    GatePipeline::standard(Some(Arc::new(client)), &GateSettings::default())
}

const OUTPUT: &str = "The script:\n\n```python\nprint('ready')\n```\n";

#[tokio::test]
async fn test_missing_runtime_skips_execution_gates() {
    let server = sandbox_with(serde_json::json!([
        {"language": "rust", "version": "1.68.2", "aliases": ["rs"]}
    ]))
    .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let registry = default_registry();
    let task = Task::new("s", "devops", "Write a script");
    let report = pipeline(&server)
        .run(OUTPUT, &task, registry.resolve("devops").unwrap())
        .await;

    assert!(report.passed());
    let compile = report.results.iter().find(|r| r.gate == "compilation").unwrap();
    assert!(compile.skipped);
    assert!(compile.message.contains("no runtime installed for python"));
}

#[tokio::test]
async fn test_working_code_passes_compile_and_smoke() {
    let server = sandbox_with(serde_json::json!([
        {"language": "python", "version": "3.10.0", "aliases": ["py"]}
    ]))
    .await;
    Mock::given(method("POST"))
        .and(path("/api/v2/execute"))
        .and(body_string_contains(SMOKE_SENTINEL))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "run": {"stdout": format!("ready\n{SMOKE_SENTINEL}\n"), "stderr": "", "code": 0, "signal": null}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v2/execute"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "run": {"stdout": "ready\n", "stderr": "", "code": 0, "signal": null}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let registry = default_registry();
    let task = Task::new("s", "devops", "Write a script");
    let report = pipeline(&server)
        .run(OUTPUT, &task, registry.resolve("devops").unwrap())
        .await;

    assert!(report.passed(), "{:?}", report.results);
    assert_eq!(report.skipped().count(), 1); // structured_output only
}

#[tokio::test]
async fn test_missing_sentinel_fails_smoke_test() {
    let server = sandbox_with(serde_json::json!([
        {"language": "python", "version": "3.10.0", "aliases": []}
    ]))
    .await;
    // Exits cleanly without printing the sentinel, e.g. `sys.exit(0)` mid-script.
    Mock::given(method("POST"))
        .and(path("/api/v2/execute"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "run": {"stdout": "", "stderr": "", "code": 0, "signal": null}
        })))
        .mount(&server)
        .await;

    let registry = default_registry();
    let task = Task::new("s", "tester", "Write tests");
    let report = pipeline(&server)
        .run(OUTPUT, &task, registry.resolve("tester").unwrap())
        .await;

    assert!(!report.passed());
    let failure = report.first_failure().unwrap();
    assert_eq!(failure.gate, "smoke_test");
    assert!(failure.message.contains("did not run to completion"));
}

#[tokio::test]
async fn test_hung_code_killed_by_service_fails_both_execution_gates() {
    let server = sandbox_with(serde_json::json!([
        {"language": "python", "version": "3.10.0", "aliases": []}
    ]))
    .await;
    Mock::given(method("POST"))
        .and(path("/api/v2/execute"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "run": {"stdout": "", "stderr": "", "code": null, "signal": "SIGKILL"}
        })))
        .mount(&server)
        .await;

    let registry = default_registry();
    let task = Task::new("s", "backend", "Long-running server");
    let output = "```python\nwhile True:\n    pass\n```\n";
    let report = pipeline(&server)
        .run(output, &task, registry.resolve("backend").unwrap())
        .await;

    assert!(!report.passed());
    let compile = report.results.iter().find(|r| r.gate == "compilation").unwrap();
    assert!(!compile.passed && !compile.skipped);
    assert!(compile.message.contains("timed out or killed by SIGKILL"), "{}", compile.message);
    let smoke = report.results.iter().find(|r| r.gate == "smoke_test").unwrap();
    assert!(!smoke.passed && !smoke.skipped);
    assert!(smoke.message.contains("SIGKILL"));
}

#[tokio::test]
async fn test_segfault_fails_compilation() {
    let server = sandbox_with(serde_json::json!([
        {"language": "c", "version": "10.2.0", "aliases": ["gcc"]}
    ]))
    .await;
    Mock::given(method("POST"))
        .and(path("/api/v2/execute"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "compile": {"stdout": "", "stderr": "", "code": 0, "signal": null},
            "run": {"stdout": "", "stderr": "", "code": null, "signal": "SIGSEGV"}
        })))
        .mount(&server)
        .await;

    let registry = default_registry();
    let task = Task::new("s", "backend", "Parse the buffer");
    let output = "```c\nint main(void) { int *p = 0; return *p; }\n```\n";
    let report = pipeline(&server)
        .run(output, &task, registry.resolve("backend").unwrap())
        .await;

    assert!(!report.passed());
    let failure = report.first_failure().unwrap();
    assert_eq!(failure.gate, "compilation");
    assert!(failure.message.contains("terminated by SIGSEGV"), "{}", failure.message);
}

#[tokio::test]
async fn test_unreachable_execute_degrades_to_skip() {
    let server = sandbox_with(serde_json::json!([
        {"language": "python", "version": "3.10.0", "aliases": []}
    ]))
    .await;
    Mock::given(method("POST"))
        .and(path("/api/v2/execute"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let registry = default_registry();
    let task = Task::new("s", "backend", "Long-running server");
    let report = pipeline(&server)
        .run(OUTPUT, &task, registry.resolve("backend").unwrap())
        .await;

    assert!(report.passed());
    assert_eq!(report.skipped().count(), 3);
}
