use forgeflow_agent::{Complexity, FieldKind, OutputSchema};
use forgeflow_core::{ForgeflowError, ForgeflowResult};
use std::collections::{BTreeSet, HashMap};

/// What an agent's output is expected to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Fenced, executable code blocks (compilation and smoke gates apply).
    EmitsCode,
    /// Output usually spans several files.
    MultiFile,
    /// A JSON object matching the profile's output schema.
    Structured,
}

/// Configuration for a specialist agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentProfile {
    pub key: String,
    pub system_prompt: String,
    pub capabilities: Vec<Capability>,
    pub output_schema: Option<OutputSchema>,
    pub default_complexity: Complexity,
    /// Shown on the verify step of generated checklists.
    pub verification_criteria: Vec<String>,
}

impl AgentProfile {
    pub fn new(key: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            system_prompt: system_prompt.into(),
            capabilities: Vec::new(),
            output_schema: None,
            default_complexity: Complexity::Medium,
            verification_criteria: Vec::new(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    pub fn with_schema(mut self, schema: OutputSchema) -> Self {
        self.output_schema = Some(schema);
        self.with_capability(Capability::Structured)
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.default_complexity = complexity;
        self
    }

    pub fn with_criteria(mut self, criteria: &[&str]) -> Self {
        self.verification_criteria = criteria.iter().map(|c| (*c).to_string()).collect();
        self
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Agent key to profile lookup, resolved once per run.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    profiles: HashMap<String, AgentProfile>,
}

impl AgentRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn register(&mut self, profile: AgentProfile) {
        self.profiles.insert(profile.key.clone(), profile);
    }

    pub fn get(&self, key: &str) -> Option<&AgentProfile> {
        self.profiles.get(key)
    }

    pub fn resolve(&self, key: &str) -> ForgeflowResult<&AgentProfile> {
        self.get(key)
            .ok_or_else(|| ForgeflowError::UnknownAgent(key.to_string()))
    }

    /// Resolve every agent key, failing on the first unknown one.
    pub fn resolve_all<'a, I>(&self, keys: I) -> ForgeflowResult<HashMap<String, AgentProfile>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        keys.into_iter()
            .map(|key| self.resolve(key).map(|p| (key.to_string(), p.clone())))
            .collect()
    }

    pub fn keys(&self) -> BTreeSet<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }
}

/// Registry with the built-in specialists.
pub fn default_registry() -> AgentRegistry {
    let mut registry = AgentRegistry::empty();
    for profile in default_profiles() {
        registry.register(profile);
    }
    registry
}

/// The built-in specialist profiles.
pub fn default_profiles() -> Vec<AgentProfile> {
    vec![
        architect_profile(),
        AgentProfile::new("backend", BACKEND_PROMPT)
            .with_capability(Capability::EmitsCode)
            .with_capability(Capability::MultiFile)
            .with_complexity(Complexity::Complex)
            .with_criteria(&[
                "Every endpoint validates its input",
                "Errors are returned, not swallowed",
                "Code compiles without warnings",
            ]),
        AgentProfile::new("frontend", FRONTEND_PROMPT)
            .with_capability(Capability::EmitsCode)
            .with_capability(Capability::MultiFile)
            .with_criteria(&[
                "Components render without runtime errors",
                "Interactive elements are keyboard accessible",
            ]),
        AgentProfile::new("database", DATABASE_PROMPT)
            .with_capability(Capability::EmitsCode)
            .with_criteria(&["Migrations are reversible", "Foreign keys are indexed"]),
        AgentProfile::new("tester", TESTER_PROMPT)
            .with_capability(Capability::EmitsCode)
            .with_criteria(&[
                "Happy path and error paths are covered",
                "Tests are deterministic",
            ]),
        AgentProfile::new("devops", DEVOPS_PROMPT)
            .with_capability(Capability::EmitsCode)
            .with_complexity(Complexity::Simple)
            .with_criteria(&["Secrets come from the environment"]),
        AgentProfile::new("docs", DOCS_PROMPT).with_complexity(Complexity::Simple),
        reviewer_profile(),
    ]
}

fn architect_profile() -> AgentProfile {
    AgentProfile::new("architect", ARCHITECT_PROMPT)
        .with_schema(
            OutputSchema::new()
                .field("summary", FieldKind::String)
                .field("components", FieldKind::Array)
                .field("decisions", FieldKind::Array),
        )
        .with_complexity(Complexity::Complex)
        .with_criteria(&[
            "Each component has a single responsibility",
            "Interfaces between components are explicit",
        ])
}

fn reviewer_profile() -> AgentProfile {
    AgentProfile::new("reviewer", REVIEWER_PROMPT)
        .with_schema(
            OutputSchema::new()
                .field("approved", FieldKind::Bool)
                .field("issues", FieldKind::Array),
        )
        .with_criteria(&["Every issue names a file and a fix"])
}

const ARCHITECT_PROMPT: &str = "\
You are the Architect agent in Forgeflow. You turn requirements into a \
component design that other agents will implement.

Rules:
1. Name every component and its responsibility.
2. Define the interfaces and data contracts between components.
3. Record each significant decision with its trade-off.
4. Respond with a single JSON object: {\"summary\", \"components\", \"decisions\"}.
";

const BACKEND_PROMPT: &str = "\
You are the Backend agent in Forgeflow. You write server-side code that \
follows the design produced by the Architect.

Rules:
1. Put each file in its own fenced code block tagged with its language.
2. Start every block with a comment naming the file path.
3. Validate inputs and return explicit errors.
4. Keep code runnable as-is: no placeholders, no elided sections.
";

const FRONTEND_PROMPT: &str = "\
You are the Frontend agent in Forgeflow. You build user-facing components.

Rules:
1. Put each file in its own fenced code block tagged with its language.
2. Keep components small and composable.
3. Handle loading and error states explicitly.
";

const DATABASE_PROMPT: &str = "\
You are the Database agent in Forgeflow. You design schemas and write \
migrations and queries.

Rules:
1. Use fenced code blocks tagged with their language.
2. Every migration has a matching rollback.
3. Index columns used in joins and filters.
";

const TESTER_PROMPT: &str = "\
You are the Tester agent in Forgeflow. You write tests for the code produced \
by other agents.

Rules:
1. Cover happy paths, edge cases, and error conditions.
2. Tests must be deterministic and self-contained.
3. Use fenced code blocks tagged with their language.
";

const DEVOPS_PROMPT: &str = "\
You are the DevOps agent in Forgeflow. You write build, container and \
deployment configuration.

Rules:
1. Prefer small shell scripts and declarative config.
2. Read secrets from the environment, never inline them.
3. Use fenced code blocks tagged with their language.
";

const DOCS_PROMPT: &str = "\
You are the Docs agent in Forgeflow. You write concise developer \
documentation in Markdown for what the other agents built.
";

const REVIEWER_PROMPT: &str = "\
You are the Reviewer agent in Forgeflow. You review the artifacts of other \
agents for correctness, security and maintainability.

Respond with a single JSON object: {\"approved\": bool, \"issues\": [..]} \
where each issue names the file, the problem and the fix.
";
