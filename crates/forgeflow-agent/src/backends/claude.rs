use super::{CompletionRequest, LlmBackend};
use crate::config::ModelConfig;
use async_trait::async_trait;
use forgeflow_core::{ForgeflowError, ForgeflowResult};

/// Claude (Anthropic) API backend.
pub struct ClaudeBackend {
    config: ModelConfig,
    http: reqwest::Client,
}

impl ClaudeBackend {
    pub fn new(config: ModelConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }
}

#[async_trait]
impl LlmBackend for ClaudeBackend {
    async fn complete(&self, request: &CompletionRequest) -> ForgeflowResult<String> {
        let url = format!("{}/v1/messages", self.config.base_url());

        let api_key = self.config.api_key.as_deref().ok_or_else(|| {
            ForgeflowError::Config(format!(
                "No API key configured for claude model '{}'",
                self.config.name
            ))
        })?;

        let mut body = serde_json::json!({
            "model": self.config.model_id,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": [{ "role": "user", "content": request.prompt }],
        });

        if let Some(sys) = request.effective_system_prompt() {
            body["system"] = serde_json::json!(sys);
        }

        let resp = self
            .http
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
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
                "Claude API error {status}: {text}"
            )));
        }

        let resp_body: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| ForgeflowError::Agent(format!("Malformed Claude response: {e}")))?;

        parse_claude_response(&resp_body)
    }
}

/// Concatenate every `text` content block of a messages-API response.
pub fn parse_claude_response(body: &serde_json::Value) -> ForgeflowResult<String> {
    let blocks = body["content"].as_array().ok_or_else(|| {
        ForgeflowError::Agent(format!("Claude response has no content: {body}"))
    })?;

    let text = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect::<Vec<_>>()
        .join("");

    Ok(text)
}
