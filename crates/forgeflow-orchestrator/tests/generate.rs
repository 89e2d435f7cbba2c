use async_trait::async_trait;
use forgeflow_agent::{
    CompletionRequest, LlmBackend, LlmProvider, ModelConfig, ModelRouter, RouterConfig, Tier,
    TierTable,
};
use forgeflow_core::{ForgeflowError, ForgeflowResult};
use forgeflow_orchestrator::{default_registry, LlmPrdGenerator, PrdGenerator, TaskStatus};
use std::collections::HashMap;
use std::sync::Arc;

struct PlanBackend(String);

#[async_trait]
impl LlmBackend for PlanBackend {
    async fn complete(&self, request: &CompletionRequest) -> ForgeflowResult<String> {
        assert!(request.schema.is_some());
        Ok(self.0.clone())
    }
}

fn generator(reply: &str) -> LlmPrdGenerator {
    let config = RouterConfig {
        tier: Tier::Paid,
        default_model: None,
        min_response_chars: 2,
        models: vec![ModelConfig::new("planner", LlmProvider::OpenAi, "gpt-4o", Tier::Paid)],
        selection: HashMap::from([(Tier::Paid, TierTable::new("planner", "planner", "planner"))]),
        fallback_chains: HashMap::new(),
    };
    let backend: Arc<dyn LlmBackend> = Arc::new(PlanBackend(reply.to_string()));
    let router = ModelRouter::with_backends(config, HashMap::from([("planner".to_string(), backend)]))
        .unwrap();
    LlmPrdGenerator::new(Arc::new(router), default_registry())
}

#[tokio::test]
async fn test_generates_validated_prd() {
    let reply = r#"Here is the plan:
```json
{
  "name": "todo-app",
  "tasks": [
    {"id": "design", "title": "Design", "description": "Plan components", "agent": "architect", "phase": 0},
    {"id": "api", "title": "API", "description": "Build endpoints", "agent": "backend", "phase": 1, "dependencies": ["design"]}
  ]
}
```"#;
    let prd = generator(reply).generate("A todo app").await.unwrap();
    assert_eq!(prd.meta.name, "todo-app");
    assert_eq!(prd.tasks.len(), 2);
    assert_eq!(prd.get("design").unwrap().status, TaskStatus::Ready);
    assert_eq!(prd.get("api").unwrap().status, TaskStatus::Pending);
}

#[tokio::test]
async fn test_unknown_agent_in_plan_is_rejected() {
    let reply = r#"{"name": "x", "tasks": [{"id": "a", "agent": "astrologer"}]}"#;
    let err = generator(reply).generate("x").await.unwrap_err();
    assert!(matches!(err, ForgeflowError::UnknownAgent(_)));
}

#[tokio::test]
async fn test_dangling_dependency_in_plan_is_rejected() {
    let reply = r#"{"name": "x", "tasks": [{"id": "a", "agent": "docs", "dependencies": ["nope"]}]}"#;
    let err = generator(reply).generate("x").await.unwrap_err();
    assert!(matches!(err, ForgeflowError::Prd(_)));
}

#[tokio::test]
async fn test_reply_without_json_is_rejected() {
    let err = generator("I cannot help with that.")
        .generate("x")
        .await
        .unwrap_err();
    assert!(matches!(err, ForgeflowError::Prd(ref m) if m.contains("no JSON")));
}
