use crate::prd::Prd;
use crate::profiles::AgentRegistry;
use crate::types::{PrdMeta, Task};
use async_trait::async_trait;
use forgeflow_agent::{CallOptions, Complexity, FieldKind, ModelRouter, OutputSchema, StructuredStatus};
use forgeflow_core::{ForgeflowError, ForgeflowResult};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Produces a fresh work-item store from a free-text description.
#[async_trait]
pub trait PrdGenerator: Send + Sync {
    async fn generate(&self, description: &str) -> ForgeflowResult<Prd>;
}

#[derive(Debug, Deserialize)]
struct GeneratedPrd {
    name: String,
    tasks: Vec<GeneratedTask>,
}

#[derive(Debug, Deserialize)]
struct GeneratedTask {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    agent: String,
    #[serde(default)]
    phase: u32,
    #[serde(default)]
    dependencies: Vec<String>,
}

/// Asks the model router to plan the task graph.
pub struct LlmPrdGenerator {
    router: Arc<ModelRouter>,
    registry: AgentRegistry,
}

impl LlmPrdGenerator {
    pub fn new(router: Arc<ModelRouter>, registry: AgentRegistry) -> Self {
        Self { router, registry }
    }

    fn schema() -> OutputSchema {
        OutputSchema::new()
            .field("name", FieldKind::String)
            .field("tasks", FieldKind::Array)
    }

    fn system_prompt(&self) -> String {
        let agents: Vec<&str> = self.registry.keys().into_iter().collect();
        format!(
            "You are the planning agent in Forgeflow. Break the user's project into \
             tasks for these agents: {}.\n\
             Respond with a single JSON object {{\"name\", \"tasks\"}} where each task has \
             \"id\", \"title\", \"description\", \"agent\", \"phase\" (0 = first) and \
             \"dependencies\" (ids of earlier tasks).",
            agents.join(", ")
        )
    }
}

#[async_trait]
impl PrdGenerator for LlmPrdGenerator {
    async fn generate(&self, description: &str) -> ForgeflowResult<Prd> {
        let options = CallOptions::new(Complexity::Complex).with_system(self.system_prompt());
        let (completion, structured) = self
            .router
            .call_structured(description, &options, &Self::schema())
            .await?;

        match &structured.status {
            StructuredStatus::Valid => {}
            StructuredStatus::Invalid { errors } => {
                warn!(errors = ?errors, "Generated plan does not match schema, trying anyway");
            }
            StructuredStatus::Unparsed => {
                return Err(ForgeflowError::Prd(format!(
                    "Model '{}' returned no JSON plan",
                    completion.model
                )));
            }
        }

        let plan: GeneratedPrd = serde_json::from_value(structured.value)
            .map_err(|e| ForgeflowError::Prd(format!("Generated plan is malformed: {e}")))?;

        let mut tasks = Vec::with_capacity(plan.tasks.len());
        for generated in plan.tasks {
            self.registry.resolve(&generated.agent)?;
            let mut task = Task::new(generated.id, generated.agent, generated.description)
                .with_title(generated.title)
                .with_phase(generated.phase);
            task.dependencies = generated.dependencies;
            tasks.push(task);
        }

        let prd = Prd::from_tasks(PrdMeta::new(plan.name), tasks)?;
        info!(
            name = %prd.meta.name,
            tasks = prd.tasks.len(),
            model = %completion.model,
            "PRD generated"
        );
        Ok(prd)
    }
}
