pub mod claude;
pub mod openai;

use crate::config::{LlmProvider, ModelConfig};
use async_trait::async_trait;
use forgeflow_core::ForgeflowResult;
use std::sync::Arc;

/// A single prompt sent to a model backend.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system_prompt: Option<String>,
    pub prompt: String,
    /// JSON schema hint for structured output.
    pub schema: Option<serde_json::Value>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: None,
            prompt: prompt.into(),
            schema: None,
        }
    }

    pub fn with_system(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// System prompt with the schema hint appended, if any.
    pub fn effective_system_prompt(&self) -> Option<String> {
        match (&self.system_prompt, &self.schema) {
            (sys, None) => sys.clone(),
            (sys, Some(schema)) => {
                let hint = format!(
                    "Respond with a single JSON object matching this schema:\n{schema}"
                );
                Some(match sys {
                    Some(s) => format!("{s}\n\n{hint}"),
                    None => hint,
                })
            }
        }
    }
}

/// Trait for LLM provider backends.
///
/// Each provider implements this trait to handle API communication. Errors
/// are returned, never panicked; the router decides whether to fall back.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Non-streaming completion returning the response text.
    async fn complete(&self, request: &CompletionRequest) -> ForgeflowResult<String>;
}

/// Build the backend matching a catalog entry's provider.
pub fn backend_for(config: &ModelConfig, http: reqwest::Client) -> Arc<dyn LlmBackend> {
    match config.provider {
        LlmProvider::Claude => Arc::new(claude::ClaudeBackend::new(config.clone(), http)),
        LlmProvider::OpenAi | LlmProvider::OpenRouter | LlmProvider::Groq | LlmProvider::Ollama => {
            Arc::new(openai::OpenAiBackend::new(config.clone(), http))
        }
    }
}
