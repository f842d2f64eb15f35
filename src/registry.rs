use std::collections::{BTreeMap, HashSet};

use thiserror::Error;

use crate::agent::Agent;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate agent name: {0}")]
    DuplicateAgent(String),
    #[error("agent '{from}' hands off to unknown agent '{to}'")]
    UnknownHandoff { from: String, to: String },
    #[error("agent registry is empty")]
    Empty,
}

// ---------------------------------------------------------------------------
// AgentRegistryBuilder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct AgentRegistryBuilder {
    agents: BTreeMap<String, Agent>,
    duplicate: Option<String>,
}

impl AgentRegistryBuilder {
    pub fn register(mut self, agent: Agent) -> Self {
        let name = agent.name().to_string();
        if self.agents.contains_key(&name) && self.duplicate.is_none() {
            self.duplicate = Some(name.clone());
        }
        self.agents.insert(name, agent);
        self
    }

    pub fn build(self) -> Result<AgentRegistry, RegistryError> {
        if let Some(name) = self.duplicate {
            return Err(RegistryError::DuplicateAgent(name));
        }
        if self.agents.is_empty() {
            return Err(RegistryError::Empty);
        }

        // Every static handoff must land on a registered agent.
        for agent in self.agents.values() {
            if let Some(target) = agent.handoff_target()
                && !self.agents.contains_key(target)
            {
                return Err(RegistryError::UnknownHandoff {
                    from: agent.name().to_string(),
                    to: target.to_string(),
                });
            }
        }

        Ok(AgentRegistry {
            agents: self.agents,
        })
    }
}

// ---------------------------------------------------------------------------
// AgentRegistry (validated, only constructed via build())
// ---------------------------------------------------------------------------

/// Name → [`Agent`] map, built once per process and shared read-only.
#[derive(Debug)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Agent>,
}

impl AgentRegistry {
    pub fn builder() -> AgentRegistryBuilder {
        AgentRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Agent> {
        self.agents.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// The static handoff chain starting at `start`, stopping before the
    /// first revisited agent.
    pub fn chain_from(&self, start: &str) -> Vec<&str> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.agents.get(start);
        while let Some(agent) = current {
            if !seen.insert(agent.name()) {
                break;
            }
            chain.push(agent.name());
            current = agent.handoff_target().and_then(|t| self.agents.get(t));
        }
        chain
    }
}
