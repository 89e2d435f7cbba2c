use forgeflow_core::{ForgeflowError, ForgeflowResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Environment variable selecting the active tier.
pub const TIER_ENV: &str = "FORGEFLOW_TIER";
/// Environment variable naming an explicit default backend.
pub const MODEL_ENV: &str = "FORGEFLOW_MODEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// Locally hosted Ollama daemon (OpenAI-compatible endpoint).
    Ollama,
    OpenAi,
    /// Anthropic messages API.
    Claude,
    /// Groq cloud inference, OpenAI-compatible; free tier is rate limited.
    Groq,
    OpenRouter,
}

impl LlmProvider {
    /// Name of the environment variable holding this provider's API key.
    pub fn api_key_env(&self) -> Option<&'static str> {
        match self {
            LlmProvider::Ollama => None,
            LlmProvider::OpenAi => Some("OPENAI_API_KEY"),
            LlmProvider::Claude => Some("ANTHROPIC_API_KEY"),
            LlmProvider::Groq => Some("GROQ_API_KEY"),
            LlmProvider::OpenRouter => Some("OPENROUTER_API_KEY"),
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmProvider::Ollama => write!(f, "ollama"),
            LlmProvider::OpenAi => write!(f, "openai"),
            LlmProvider::Claude => write!(f, "claude"),
            LlmProvider::Groq => write!(f, "groq"),
            LlmProvider::OpenRouter => write!(f, "openrouter"),
        }
    }
}

/// Cost/quality class of model backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Local or free-of-charge backends.
    #[default]
    Free,
    /// Paid cloud backends.
    Paid,
    /// Local for simple work, cloud for complex work.
    Hybrid,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::Paid => write!(f, "paid"),
            Tier::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl FromStr for Tier {
    type Err = ForgeflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" | "local" => Ok(Tier::Free),
            "paid" | "cloud" => Ok(Tier::Paid),
            "hybrid" => Ok(Tier::Hybrid),
            other => Err(ForgeflowError::Config(format!(
                "Unknown tier '{other}' (expected free, paid or hybrid)"
            ))),
        }
    }
}

/// How demanding a request is; keys the per-tier selection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    #[default]
    Medium,
    Complex,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Complexity::Simple => write!(f, "simple"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::Complex => write!(f, "complex"),
        }
    }
}

/// A named backend model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Catalog name used by selection tables and fallback chains.
    pub name: String,
    pub provider: LlmProvider,
    pub model_id: String,
    pub tier: Tier,
    /// USD per 1000 tokens.
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
    #[serde(default = "default_context_window")]
    pub context_window: u32,
    /// Locally hosted backends never incur cost. Unset means "Ollama is local".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<bool>,
    #[serde(default)]
    pub api_key: Option<String>,
    pub api_base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_context_window() -> u32 {
    8192
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    4096
}

impl ModelConfig {
    pub fn new(
        name: impl Into<String>,
        provider: LlmProvider,
        model_id: impl Into<String>,
        tier: Tier,
    ) -> Self {
        Self {
            name: name.into(),
            provider,
            model_id: model_id.into(),
            tier,
            cost_per_1k_tokens: 0.0,
            context_window: default_context_window(),
            local: None,
            api_key: None,
            api_base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }

    pub fn with_cost(mut self, cost_per_1k_tokens: f64) -> Self {
        self.cost_per_1k_tokens = cost_per_1k_tokens;
        self
    }

    pub fn with_context_window(mut self, context_window: u32) -> Self {
        self.context_window = context_window;
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = Some(url.into());
        self
    }

    pub fn is_local(&self) -> bool {
        self.local.unwrap_or(matches!(self.provider, LlmProvider::Ollama))
    }

    pub fn base_url(&self) -> &str {
        if let Some(url) = &self.api_base_url {
            url
        } else {
            match self.provider {
                LlmProvider::Ollama => "http://localhost:11434",
                LlmProvider::OpenAi => "https://api.openai.com",
                LlmProvider::Claude => "https://api.anthropic.com",
                LlmProvider::Groq => "https://api.groq.com/openai",
                LlmProvider::OpenRouter => "https://openrouter.ai/api",
            }
        }
    }

    /// Estimated USD cost of `tokens` on this backend.
    pub fn estimate_cost(&self, tokens: u64) -> f64 {
        if self.is_local() {
            return 0.0;
        }
        tokens as f64 / 1000.0 * self.cost_per_1k_tokens
    }
}

/// Backend name per complexity for a single tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTable {
    pub simple: String,
    pub medium: String,
    pub complex: String,
}

impl TierTable {
    pub fn new(simple: &str, medium: &str, complex: &str) -> Self {
        Self {
            simple: simple.to_string(),
            medium: medium.to_string(),
            complex: complex.to_string(),
        }
    }

    pub fn pick(&self, complexity: Complexity) -> &str {
        match complexity {
            Complexity::Simple => &self.simple,
            Complexity::Medium => &self.medium,
            Complexity::Complex => &self.complex,
        }
    }
}

/// Static router configuration: catalog, selection and fallback chains.
///
/// Passed explicitly into the router and the orchestration loop; nothing here
/// is mutated after startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub tier: Tier,
    /// Backend used for every call unless the call names one explicitly.
    #[serde(default)]
    pub default_model: Option<String>,
    /// Responses with fewer trimmed characters are treated as malformed.
    #[serde(default = "default_min_response_chars")]
    pub min_response_chars: usize,
    pub models: Vec<ModelConfig>,
    pub selection: HashMap<Tier, TierTable>,
    pub fallback_chains: HashMap<Tier, Vec<String>>,
}

fn default_min_response_chars() -> usize {
    20
}

impl Default for RouterConfig {
    fn default() -> Self {
        let models = vec![
            ModelConfig::new("ollama-llama3", LlmProvider::Ollama, "llama3.1:8b", Tier::Free)
                .with_context_window(131_072),
            ModelConfig::new(
                "ollama-qwen-coder",
                LlmProvider::Ollama,
                "qwen2.5-coder:7b",
                Tier::Free,
            )
            .with_context_window(32_768),
            ModelConfig::new(
                "groq-llama-70b",
                LlmProvider::Groq,
                "llama-3.3-70b-versatile",
                Tier::Free,
            )
            .with_context_window(131_072),
            ModelConfig::new(
                "openrouter-deepseek",
                LlmProvider::OpenRouter,
                "deepseek/deepseek-chat-v3-0324:free",
                Tier::Free,
            )
            .with_context_window(64_000),
            ModelConfig::new("gpt-4o-mini", LlmProvider::OpenAi, "gpt-4o-mini", Tier::Paid)
                .with_cost(0.00015)
                .with_context_window(128_000),
            ModelConfig::new("gpt-4o", LlmProvider::OpenAi, "gpt-4o", Tier::Paid)
                .with_cost(0.0025)
                .with_context_window(128_000),
            ModelConfig::new(
                "claude-haiku",
                LlmProvider::Claude,
                "claude-3-5-haiku-latest",
                Tier::Paid,
            )
            .with_cost(0.0008)
            .with_context_window(200_000),
            ModelConfig::new(
                "claude-sonnet",
                LlmProvider::Claude,
                "claude-sonnet-4-20250514",
                Tier::Paid,
            )
            .with_cost(0.003)
            .with_context_window(200_000),
        ];

        let selection = HashMap::from([
            (
                Tier::Free,
                TierTable::new("ollama-llama3", "ollama-qwen-coder", "groq-llama-70b"),
            ),
            (
                Tier::Paid,
                TierTable::new("gpt-4o-mini", "claude-haiku", "claude-sonnet"),
            ),
            (
                Tier::Hybrid,
                TierTable::new("ollama-llama3", "gpt-4o-mini", "claude-sonnet"),
            ),
        ]);

        // Every chain crosses providers so one outage cannot exhaust it.
        let fallback_chains = HashMap::from([
            (
                Tier::Free,
                names(&[
                    "ollama-qwen-coder",
                    "groq-llama-70b",
                    "openrouter-deepseek",
                    "ollama-llama3",
                ]),
            ),
            (
                Tier::Paid,
                names(&["claude-sonnet", "gpt-4o", "claude-haiku", "gpt-4o-mini"]),
            ),
            (
                Tier::Hybrid,
                names(&[
                    "claude-sonnet",
                    "gpt-4o-mini",
                    "groq-llama-70b",
                    "ollama-qwen-coder",
                ]),
            ),
        ]);

        Self {
            tier: Tier::Free,
            default_model: None,
            min_response_chars: default_min_response_chars(),
            models,
            selection,
            fallback_chains,
        }
    }
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

impl RouterConfig {
    /// Look up a backend by catalog name.
    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.name == name)
    }

    /// Fallback chain for the active tier (empty when none is configured).
    pub fn chain(&self) -> &[String] {
        self.fallback_chains
            .get(&self.tier)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Add or replace a catalog entry by name.
    pub fn upsert_model(&mut self, model: ModelConfig) {
        if let Some(existing) = self.models.iter_mut().find(|m| m.name == model.name) {
            *existing = model;
        } else {
            self.models.push(model);
        }
    }

    /// Check that every name referenced by a table, chain or default exists
    /// in the catalog and that the active tier has a selection table.
    pub fn validate(&self) -> ForgeflowResult<()> {
        let mut seen = HashSet::new();
        for model in &self.models {
            if !seen.insert(model.name.as_str()) {
                return Err(ForgeflowError::Config(format!(
                    "Duplicate model name '{}'",
                    model.name
                )));
            }
        }

        let check = |name: &str, origin: &str| -> ForgeflowResult<()> {
            if seen.contains(name) {
                Ok(())
            } else {
                Err(ForgeflowError::Config(format!(
                    "{origin} references unknown model '{name}'"
                )))
            }
        };

        for (tier, table) in &self.selection {
            for name in [&table.simple, &table.medium, &table.complex] {
                check(name, &format!("Selection table for tier {tier}"))?;
            }
        }
        for (tier, chain) in &self.fallback_chains {
            for name in chain {
                check(name, &format!("Fallback chain for tier {tier}"))?;
            }
        }
        if let Some(name) = &self.default_model {
            check(name, "Default model")?;
        }
        if !self.selection.contains_key(&self.tier) && self.default_model.is_none() {
            return Err(ForgeflowError::Config(format!(
                "No selection table for active tier {}",
                self.tier
            )));
        }
        Ok(())
    }

    /// Apply process environment overrides (tier, default model, API keys,
    /// Ollama host).
    pub fn apply_env(&mut self) -> ForgeflowResult<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Same as [`RouterConfig::apply_env`] with an injectable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> ForgeflowResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(tier) = lookup(TIER_ENV).filter(|v| !v.trim().is_empty()) {
            self.tier = tier.parse()?;
        }
        if let Some(model) = lookup(MODEL_ENV).filter(|v| !v.trim().is_empty()) {
            self.default_model = Some(model.trim().to_string());
        }
        let ollama_host = lookup("OLLAMA_HOST").filter(|v| !v.trim().is_empty());
        for model in &mut self.models {
            if model.api_key.is_none() {
                if let Some(env) = model.provider.api_key_env() {
                    model.api_key = lookup(env).filter(|v| !v.is_empty());
                }
            }
            if model.provider == LlmProvider::Ollama && model.api_base_url.is_none() {
                if let Some(host) = &ollama_host {
                    let host = host.trim_end_matches('/');
                    model.api_base_url = Some(if host.starts_with("http") {
                        host.to_string()
                    } else {
                        format!("http://{host}")
                    });
                }
            }
        }
        Ok(())
    }
}
