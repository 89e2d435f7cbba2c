use super::{CompletionRequest, LlmBackend};
use crate::config::{LlmProvider, ModelConfig};
use async_trait::async_trait;
use forgeflow_core::{ForgeflowError, ForgeflowResult};

/// OpenAI-compatible API backend.
///
/// Works with OpenAI, OpenRouter, Groq, Ollama, and any other provider
/// that implements the OpenAI chat completions API.
pub struct OpenAiBackend {
    config: ModelConfig,
    http: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(config: ModelConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn build_messages(&self, request: &CompletionRequest) -> Vec<serde_json::Value> {
        let mut api_messages: Vec<serde_json::Value> = Vec::new();

        if let Some(sys) = request.effective_system_prompt() {
            api_messages.push(serde_json::json!({
                "role": "system",
                "content": sys
            }));
        }

        api_messages.push(serde_json::json!({
            "role": "user",
            "content": request.prompt
        }));

        api_messages
    }

    fn add_provider_headers(
        &self,
        request: reqwest::RequestBuilder,
    ) -> ForgeflowResult<reqwest::RequestBuilder> {
        let request = request.header("Content-Type", "application/json");

        let request = match (&self.config.api_key, self.config.provider) {
            (Some(key), _) => request.header("Authorization", format!("Bearer {key}")),
            (None, LlmProvider::Ollama) => request,
            (None, provider) => {
                return Err(ForgeflowError::Config(format!(
                    "No API key configured for {provider} model '{}'",
                    self.config.name
                )));
            }
        };

        // OpenRouter requires extra headers
        if matches!(self.config.provider, LlmProvider::OpenRouter) {
            Ok(request
                .header("HTTP-Referer", "https://github.com/forgeflow/forgeflow")
                .header("X-Title", "Forgeflow"))
        } else {
            Ok(request)
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn complete(&self, request: &CompletionRequest) -> ForgeflowResult<String> {
        let url = format!("{}/v1/chat/completions", self.config.base_url());

        let mut body = serde_json::json!({
            "model": self.config.model_id,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": self.build_messages(request),
        });

        if request.schema.is_some() {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }

        let resp = self
            .add_provider_headers(self.http.post(&url))?
            .json(&body)
            .send()
            .await
            .map_err(|e| ForgeflowError::Http(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ForgeflowError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(ForgeflowError::Http(format!(
                "{} API error {}: {}",
                self.config.provider, status, text
            )));
        }

        let resp_body: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| ForgeflowError::Agent(format!("Malformed response body: {e}")))?;
        parse_openai_response(&resp_body)
    }
}

pub fn parse_openai_response(body: &serde_json::Value) -> ForgeflowResult<String> {
    let choice = &body["choices"][0];
    if choice.is_null() {
        return Err(ForgeflowError::Agent(format!(
            "Response has no choices: {body}"
        )));
    }
    Ok(choice["message"]["content"]
        .as_str()
        .unwrap_or_default()
        .to_string())
}
