//! Static catalogue of worker types.
//!
//! The registry is loaded once at startup (from config, or the built-in
//! catalogue) and only read afterwards. Order matters: it is the tie-breaker
//! when two worker types score the same for a task.

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::{clog_debug, Error, Result};

/// A worker type and the capability tags it declares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentType {
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Narrower specialization tags, scored the same way as capabilities.
    #[serde(default)]
    pub specializations: Vec<String>,
}

impl AgentType {
    pub fn new(name: &str, capabilities: &[&str], specializations: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
            specializations: specializations.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// All tags, lowercased.
    pub fn tags(&self) -> impl Iterator<Item = String> + '_ {
        self.capabilities
            .iter()
            .chain(self.specializations.iter())
            .map(|t| t.to_lowercase())
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        let tag = tag.to_lowercase();
        self.tags().any(|t| t == tag)
    }

    /// Whether this type is meant for system design work.
    pub fn is_architecture_oriented(&self) -> bool {
        self.has_tag("architecture") || self.has_tag("design")
    }
}

#[derive(Debug, Clone)]
pub struct AgentRegistry {
    types: Vec<AgentType>,
}

impl AgentRegistry {
    /// Build a registry, rejecting duplicate or empty names.
    pub fn new(types: Vec<AgentType>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for agent_type in &types {
            if agent_type.name.trim().is_empty() {
                return Err(Error::Validation("agent type with empty name".to_string()));
            }
            if !seen.insert(agent_type.name.clone()) {
                return Err(Error::Validation(format!(
                    "duplicate agent type: {}",
                    agent_type.name
                )));
            }
        }
        Ok(Self { types })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        if config.agents.is_empty() {
            clog_debug!("AgentRegistry: using built-in catalogue");
            return Ok(Self::builtin());
        }
        clog_debug!("AgentRegistry: {} types from config", config.agents.len());
        Self::new(config.agents.clone())
    }

    pub fn builtin() -> Self {
        Self {
            types: vec![
                AgentType::new(
                    "system-architect",
                    &["architecture", "design", "planning"],
                    &["system", "scalability", "integration"],
                ),
                AgentType::new(
                    "backend-developer",
                    &["backend", "api", "database"],
                    &["server", "endpoint", "authentication", "rest"],
                ),
                AgentType::new(
                    "frontend-developer",
                    &["frontend", "ui", "components"],
                    &["react", "css", "form", "page", "layout"],
                ),
                AgentType::new(
                    "test-engineer",
                    &["testing", "verification", "qa"],
                    &["coverage", "unit", "integration", "e2e"],
                ),
                AgentType::new(
                    "debugger",
                    &["debugging", "analysis", "fix"],
                    &["bug", "crash", "error", "performance"],
                ),
                AgentType::new(
                    "researcher",
                    &["research", "analysis", "documentation"],
                    &["investigate", "summary"],
                ),
                AgentType::new("general-purpose", &["general"], &[]),
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<&AgentType> {
        self.types.iter().find(|t| t.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Types in registration order.
    pub fn types(&self) -> &[AgentType] {
        &self.types
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
