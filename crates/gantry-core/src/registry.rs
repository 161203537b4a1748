//! Per-repo agent registry: the ordered set of names the dispatcher will
//! start workflows for, plus the reviewer triggers that seed PR queues.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentTier {
    /// Light LLM call, no container.
    Light,
    /// Full sandboxed coding runtime.
    Sandbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Implementer,
    Reviewer,
    Planner,
    Security,
    Product,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub tier: AgentTier,
    pub role: AgentRole,
}

#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Vec<AgentSpec>,
    /// Known human handles: assignments to these are valid but never
    /// trigger a workflow.
    humans: Vec<String>,
    /// Forge event (e.g. "pull_request.opened") → reviewer names.
    reviewer_triggers: HashMap<String, Vec<String>>,
}

fn parse_tier(raw: &str) -> AgentTier {
    match raw {
        "light" => AgentTier::Light,
        _ => AgentTier::Sandbox,
    }
}

fn parse_role(raw: &str) -> AgentRole {
    match raw {
        "reviewer" => AgentRole::Reviewer,
        "planner" => AgentRole::Planner,
        "security" => AgentRole::Security,
        "product" => AgentRole::Product,
        _ => AgentRole::Implementer,
    }
}

impl AgentRegistry {
    /// Parse from config strings.
    ///
    /// `agents_raw`: comma-separated `name:tier:role` entries, e.g.
    /// `cody:sandbox:implementer,quinn:light:reviewer`; tier and role are
    /// optional (`cody` alone is a sandbox implementer).
    /// `humans_raw`: comma-separated handles.
    /// `triggers_raw`: semicolon-separated `event=name[,name…]` entries,
    /// e.g. `pull_request.opened=quinn`.
    pub fn parse(agents_raw: &str, humans_raw: &str, triggers_raw: &str) -> Self {
        let mut agents = Vec::new();
        for entry in agents_raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let mut parts = entry.splitn(3, ':');
            let name = parts.next().unwrap_or("").trim().to_string();
            if name.is_empty() {
                continue;
            }
            let tier = parse_tier(parts.next().unwrap_or("sandbox").trim());
            let role = parse_role(parts.next().unwrap_or("implementer").trim());
            agents.push(AgentSpec { name, tier, role });
        }

        let humans = humans_raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let mut reviewer_triggers = HashMap::new();
        for entry in triggers_raw.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if let Some((event, names)) = entry.split_once('=') {
                let names: Vec<String> = names
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                if !names.is_empty() {
                    reviewer_triggers.insert(event.trim().to_string(), names);
                }
            }
        }

        Self { agents, humans, reviewer_triggers }
    }

    pub fn get(&self, name: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn is_agent(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_known_human(&self, name: &str) -> bool {
        self.humans.iter().any(|h| h == name)
    }

    pub fn agents(&self) -> &[AgentSpec] {
        &self.agents
    }

    pub fn reviewers_for(&self, event: &str) -> Vec<String> {
        self.reviewer_triggers
            .get(event)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_registry() {
        let reg = AgentRegistry::parse(
            "cody:sandbox:implementer, tom:sandbox, quinn:light:reviewer",
            "alice,bob",
            "pull_request.opened=quinn;pull_request.labeled=sam,priya",
        );
        assert_eq!(reg.agents().len(), 3);
        assert!(reg.is_agent("cody"));
        assert_eq!(reg.get("quinn").map(|a| a.tier), Some(AgentTier::Light));
        assert_eq!(reg.get("quinn").map(|a| a.role), Some(AgentRole::Reviewer));
        assert_eq!(reg.get("tom").map(|a| a.role), Some(AgentRole::Implementer));
        assert!(reg.is_known_human("alice"));
        assert!(!reg.is_agent("alice"));
        assert_eq!(reg.reviewers_for("pull_request.opened"), vec!["quinn"]);
        assert_eq!(
            reg.reviewers_for("pull_request.labeled"),
            vec!["sam", "priya"]
        );
        assert!(reg.reviewers_for("unknown.event").is_empty());
    }

    #[test]
    fn empty_config_is_empty_registry() {
        let reg = AgentRegistry::parse("", "", "");
        assert!(reg.agents().is_empty());
        assert!(!reg.is_agent("cody"));
    }
}
