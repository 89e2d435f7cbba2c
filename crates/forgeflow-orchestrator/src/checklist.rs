use crate::profiles::{AgentProfile, Capability};
use crate::types::{Task, TodoItem};
use serde::{Deserialize, Serialize};

/// Decides which tasks get an analyze / implement / verify checklist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoPolicy {
    #[serde(default = "default_min_description_chars")]
    pub min_description_chars: usize,
    /// Agents that always get a checklist. Empty means "profiles with
    /// [`Capability::MultiFile`]".
    #[serde(default)]
    pub multi_file_agents: Vec<String>,
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
}

fn default_min_description_chars() -> usize {
    280
}

fn default_keywords() -> Vec<String> {
    ["integrate", "refactor", "migrate", "end-to-end", "multiple files"]
        .iter()
        .map(|k| (*k).to_string())
        .collect()
}

impl Default for TodoPolicy {
    fn default() -> Self {
        Self {
            min_description_chars: default_min_description_chars(),
            multi_file_agents: Vec::new(),
            keywords: default_keywords(),
        }
    }
}

impl TodoPolicy {
    pub fn needs_checklist(&self, task: &Task, profile: &AgentProfile) -> bool {
        if task.description.chars().count() >= self.min_description_chars {
            return true;
        }
        let multi_file = if self.multi_file_agents.is_empty() {
            profile.has(Capability::MultiFile)
        } else {
            self.multi_file_agents.iter().any(|a| a == &task.agent)
        };
        if multi_file {
            return true;
        }
        let text = format!("{} {}", task.title, task.description).to_lowercase();
        self.keywords
            .iter()
            .any(|k| text.contains(&k.to_lowercase()))
    }

    pub fn build_checklist(&self, task: &Task, profile: &AgentProfile) -> Vec<TodoItem> {
        vec![
            TodoItem::new(format!("Analyze requirements for {}", task.label())),
            TodoItem::new(format!("Implement {}", task.label())),
            TodoItem::new(format!("Verify {}", task.label()))
                .with_criteria(profile.verification_criteria.clone()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::default_registry;

    #[test]
    fn test_short_task_for_single_file_agent_has_no_checklist() {
        let registry = default_registry();
        let task = Task::new("d", "docs", "Write the README");
        assert!(!TodoPolicy::default().needs_checklist(&task, registry.resolve("docs").unwrap()));
    }

    #[test]
    fn test_multi_file_agent_gets_checklist() {
        let registry = default_registry();
        let task = Task::new("b", "backend", "Add a health endpoint");
        assert!(TodoPolicy::default().needs_checklist(&task, registry.resolve("backend").unwrap()));
    }

    #[test]
    fn test_keyword_and_length_triggers() {
        let registry = default_registry();
        let docs = registry.resolve("docs").unwrap();
        let policy = TodoPolicy::default();

        let keyword = Task::new("k", "docs", "Migrate the docs site to mdBook");
        assert!(policy.needs_checklist(&keyword, docs));

        let long = Task::new("l", "docs", "x".repeat(300));
        assert!(policy.needs_checklist(&long, docs));
    }

    #[test]
    fn test_configured_agents_override_capabilities() {
        let registry = default_registry();
        let policy = TodoPolicy {
            multi_file_agents: vec!["docs".to_string()],
            ..TodoPolicy::default()
        };
        let docs_task = Task::new("d", "docs", "Write the README");
        let backend_task = Task::new("b", "backend", "Add a health endpoint");
        assert!(policy.needs_checklist(&docs_task, registry.resolve("docs").unwrap()));
        assert!(!policy.needs_checklist(&backend_task, registry.resolve("backend").unwrap()));
    }

    #[test]
    fn test_checklist_carries_verification_criteria() {
        let registry = default_registry();
        let profile = registry.resolve("backend").unwrap();
        let task = Task::new("api", "backend", "Build API").with_title("REST API");
        let todos = TodoPolicy::default().build_checklist(&task, profile);
        assert_eq!(todos.len(), 3);
        assert_eq!(todos[1].title, "Implement REST API");
        assert_eq!(todos[2].verification_criteria, profile.verification_criteria);
    }
}
