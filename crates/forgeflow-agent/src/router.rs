use crate::backends::{backend_for, CompletionRequest, LlmBackend};
use crate::config::{Complexity, ModelConfig, RouterConfig};
use crate::structured::{parse_structured, OutputSchema, StructuredOutput};
use crate::telemetry::{recorded, CallSink, TracingSink};
use forgeflow_core::{estimate_tokens, ForgeflowError, ForgeflowResult};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(180);

/// Per-call routing options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub complexity: Complexity,
    /// Use this catalog entry instead of the selection table.
    pub explicit_model: Option<String>,
    pub system_prompt: Option<String>,
    pub schema: Option<serde_json::Value>,
}

impl CallOptions {
    pub fn new(complexity: Complexity) -> Self {
        Self {
            complexity,
            ..Self::default()
        }
    }

    pub fn with_model(mut self, name: impl Into<String>) -> Self {
        self.explicit_model = Some(name.into());
        self
    }

    pub fn with_system(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }
}

/// A usable response and where it came from.
#[derive(Debug, Clone)]
pub struct RoutedCompletion {
    pub text: String,
    /// Catalog name of the backend that produced `text`.
    pub model: String,
    /// How many backends failed before this one answered.
    pub fallbacks_used: usize,
    pub tokens: u64,
    pub estimated_cost: f64,
}

/// Selects a backend per complexity and tier, and walks the tier's fallback
/// chain when the selected backend fails or answers with degenerate output.
pub struct ModelRouter {
    config: RouterConfig,
    backends: HashMap<String, Arc<dyn LlmBackend>>,
    sink: Arc<dyn CallSink>,
}

impl ModelRouter {
    /// Build a router with a network backend for every catalog entry.
    pub fn new(config: RouterConfig) -> ForgeflowResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| ForgeflowError::Config(format!("Failed to build HTTP client: {e}")))?;
        let backends = config
            .models
            .iter()
            .map(|m| (m.name.clone(), backend_for(m, http.clone())))
            .collect();
        Self::with_backends(config, backends)
    }

    /// Build a router from pre-built backends keyed by catalog name.
    pub fn with_backends(
        config: RouterConfig,
        backends: HashMap<String, Arc<dyn LlmBackend>>,
    ) -> ForgeflowResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            backends,
            sink: Arc::new(TracingSink),
        })
    }

    /// Replace the call-recording sink.
    pub fn with_sink(mut self, sink: Arc<dyn CallSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Resolve the backend for a call.
    pub fn select(
        &self,
        complexity: Complexity,
        explicit_model: Option<&str>,
    ) -> ForgeflowResult<&ModelConfig> {
        let name = match (explicit_model, &self.config.default_model) {
            (Some(name), _) => name,
            (None, Some(default)) => default.as_str(),
            (None, None) => self
                .config
                .selection
                .get(&self.config.tier)
                .map(|table| table.pick(complexity))
                .ok_or_else(|| {
                    ForgeflowError::Config(format!(
                        "No selection table for tier {}",
                        self.config.tier
                    ))
                })?,
        };
        self.config
            .model(name)
            .ok_or_else(|| ForgeflowError::Config(format!("Unknown model '{name}'")))
    }

    /// Estimated USD cost of `tokens` on the named backend.
    pub fn estimate_cost(&self, model: &str, tokens: u64) -> f64 {
        self.config
            .model(model)
            .map(|m| m.estimate_cost(tokens))
            .unwrap_or(0.0)
    }

    /// Call the selected backend, falling back along the tier's chain.
    pub async fn call(
        &self,
        prompt: &str,
        options: &CallOptions,
    ) -> ForgeflowResult<RoutedCompletion> {
        let primary = self.select(options.complexity, options.explicit_model.as_deref())?;
        let request = CompletionRequest {
            system_prompt: options.system_prompt.clone(),
            prompt: prompt.to_string(),
            schema: options.schema.clone(),
        };

        let primary_err = match self.try_model(primary, &request).await {
            Ok(text) => return Ok(self.completion(primary, prompt, text, 0)),
            Err(e) => e,
        };

        warn!(
            model = %primary.name,
            error = %primary_err,
            "Primary backend failed, walking fallback chain"
        );

        let mut tried = HashSet::from([primary.name.as_str()]);
        for name in self.config.chain() {
            if !tried.insert(name.as_str()) {
                continue;
            }
            let Some(model) = self.config.model(name) else {
                continue;
            };
            match self.try_model(model, &request).await {
                Ok(text) => {
                    info!(
                        primary = %primary.name,
                        model = %model.name,
                        fallbacks = tried.len() - 1,
                        "Fallback backend succeeded"
                    );
                    return Ok(self.completion(model, prompt, text, tried.len() - 1));
                }
                Err(e) => {
                    warn!(model = %model.name, error = %e, "Fallback backend failed");
                }
            }
        }

        Err(ForgeflowError::FallbackExhausted {
            primary: primary.name.clone(),
            reason: primary_err.to_string(),
            tried: tried.len(),
        })
    }

    /// [`ModelRouter::call`] followed by JSON extraction and validation.
    ///
    /// Validation failures are reported in the returned status, not as errors.
    pub async fn call_structured(
        &self,
        prompt: &str,
        options: &CallOptions,
        schema: &OutputSchema,
    ) -> ForgeflowResult<(RoutedCompletion, StructuredOutput)> {
        let mut options = options.clone();
        if options.schema.is_none() {
            options.schema = Some(schema.to_json_schema());
        }
        let completion = self.call(prompt, &options).await?;
        let structured = parse_structured(&completion.text, schema);
        Ok((completion, structured))
    }

    async fn try_model(
        &self,
        model: &ModelConfig,
        request: &CompletionRequest,
    ) -> ForgeflowResult<String> {
        let backend = self.backends.get(&model.name).ok_or_else(|| {
            ForgeflowError::Agent(format!("No backend registered for '{}'", model.name))
        })?;

        let text = recorded(
            self.sink.as_ref(),
            model,
            &request.prompt,
            backend.complete(request),
        )
        .await?;

        let len = text.trim().chars().count();
        if len < self.config.min_response_chars {
            return Err(ForgeflowError::Agent(format!(
                "Degenerate response from '{}' ({len} chars)",
                model.name
            )));
        }
        Ok(text)
    }

    fn completion(
        &self,
        model: &ModelConfig,
        prompt: &str,
        text: String,
        fallbacks_used: usize,
    ) -> RoutedCompletion {
        let tokens = estimate_tokens(prompt) + estimate_tokens(&text);
        RoutedCompletion {
            estimated_cost: model.estimate_cost(tokens),
            text,
            model: model.name.clone(),
            fallbacks_used,
            tokens,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
