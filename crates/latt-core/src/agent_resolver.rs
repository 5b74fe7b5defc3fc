// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Resolves a requested agent id plus minion metadata into the agent
//! definition, run mode, composed tool policy, and task-depth info a stream
//! actually runs with.

use std::collections::HashMap;

use latt_config::{ToolPolicy, ToolPolicyAction, ToolPolicyRule};

use crate::minion::Minion;

pub const MAX_TASK_DEPTH_HOPS: u32 = 32;
const SWITCH_AGENT_TOOL: &str = "switch_agent";

/// A loaded agent's resolved frontmatter — the fields AgentResolver actually
/// consumes. Parsing the frontmatter file itself is out of scope here.
#[derive(Debug, Clone)]
pub struct AgentDefinition {
    pub id: String,
    pub inherits: Option<String>,
    pub disabled: bool,
    pub exposes_propose_plan: bool,
    pub tool_policy: ToolPolicy,
    pub max_task_nesting_depth: u32,
    /// Tool names this agent exposes that an external actor answers rather
    /// than the local registry — routed through `DelegatedToolCallRegistry`
    /// instead of dispatched locally or over MCP.
    pub delegated_tool_names: Vec<String>,
}

impl AgentDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inherits: None,
            disabled: false,
            exposes_propose_plan: false,
            tool_policy: ToolPolicy::default(),
            max_task_nesting_depth: MAX_TASK_DEPTH_HOPS,
            delegated_tool_names: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Plan,
    Exec,
    Compact,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Agent '{0}' is disabled")]
    Disabled(String),
    #[error("task nesting exceeds {0} hops")]
    CycleGuard(u32),
}

#[derive(Debug, Clone)]
pub struct ResolvedAgent {
    pub agent: AgentDefinition,
    pub mode: RunMode,
    pub tool_policy: ToolPolicy,
    pub sentinel_tool_names: Vec<String>,
    pub task_depth: u32,
    pub should_disable_task_tools: bool,
    pub delegated_tool_names: Vec<String>,
}

/// A registry of known agent definitions keyed by normalized id, plus the
/// one name used as the hard fallback when resolution can't proceed.
pub struct AgentCatalog {
    agents: HashMap<String, AgentDefinition>,
    fallback_id: String,
}

impl AgentCatalog {
    pub fn new(agents: Vec<AgentDefinition>, fallback_id: impl Into<String>) -> Self {
        let mut map = HashMap::new();
        for a in agents {
            map.insert(a.id.clone(), a);
        }
        Self { agents: map, fallback_id: fallback_id.into() }
    }

    fn get(&self, id: &str) -> Option<&AgentDefinition> {
        self.agents.get(id)
    }

    fn fallback(&self) -> &AgentDefinition {
        self.agents.get(&self.fallback_id).expect("fallback agent must be registered")
    }

    /// Normalize a requested id: trim, lowercase, and require it to exist in
    /// the catalog — an unknown or malformed id resolves to the fallback.
    pub fn normalize_request(&self, requested: Option<&str>) -> String {
        let Some(raw) = requested else { return self.fallback_id.clone() };
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() || !self.agents.contains_key(&normalized) {
            self.fallback_id.clone()
        } else {
            normalized
        }
    }

    /// True if any ancestor in `id`'s inheritance chain exposes
    /// `propose_plan`, walking at most the catalog's size in hops to avoid
    /// looping on a cyclic `inherits` chain.
    fn is_plan_like(&self, id: &str) -> bool {
        let mut current = Some(id.to_string());
        let mut hops = 0;
        while let Some(cur) = current {
            if hops > self.agents.len() {
                return false;
            }
            let Some(def) = self.get(&cur) else { return false };
            if def.exposes_propose_plan {
                return true;
            }
            current = def.inherits.clone();
            hops += 1;
        }
        false
    }

    /// Resolve `requested_id` for `minion` against this catalog.
    ///
    /// `caller_policy`/`system_policy` are composed after the agent's own
    /// policy per `agentPolicy ⧺ callerPolicy? ⧺ systemMinionPolicy?`.
    pub fn resolve(
        &self,
        requested_id: Option<&str>,
        minion: &Minion,
        caller_policy: Option<ToolPolicy>,
        system_policy: Option<ToolPolicy>,
    ) -> Result<ResolvedAgent, ResolveError> {
        let is_top_level = !minion.is_sidekick();

        let candidate_id = if is_top_level {
            self.normalize_request(requested_id)
        } else {
            // Child minions use the persisted agentId, never the request.
            minion.agent_id.clone().unwrap_or_else(|| self.fallback_id.clone())
        };

        let mut agent = self.get(&candidate_id).cloned().unwrap_or_else(|| self.fallback().clone());

        if agent.disabled {
            if !is_top_level {
                return Err(ResolveError::Disabled(agent.id.clone()));
            }
            agent = self.fallback().clone();
        }

        let mode = if agent.id == "compact" {
            RunMode::Compact
        } else if self.is_plan_like(&agent.id) {
            RunMode::Plan
        } else {
            RunMode::Exec
        };

        let mut tool_policy = agent.tool_policy.clone().compose(caller_policy).compose(system_policy);
        if agent.id == "auto" {
            tool_policy.push(ToolPolicyRule::new(format!("^{SWITCH_AGENT_TOOL}$"), ToolPolicyAction::Enable));
            if is_top_level {
                tool_policy.push(ToolPolicyRule::new(format!("^{SWITCH_AGENT_TOOL}$"), ToolPolicyAction::Require));
            }
        }

        let task_depth = task_depth_of(minion)?;
        let should_disable_task_tools = task_depth >= agent.max_task_nesting_depth;

        let sentinel_tool_names = tool_policy.required_tool_patterns().into_iter().map(|s| s.to_string()).collect();
        let delegated_tool_names = agent.delegated_tool_names.clone();

        Ok(ResolvedAgent { agent, mode, tool_policy, sentinel_tool_names, task_depth, should_disable_task_tools, delegated_tool_names })
    }
}

/// Walks `parent_minion_id` links via `lookup` to compute nesting depth,
/// guarding against a cycle past [`MAX_TASK_DEPTH_HOPS`].
///
/// The current implementation only has the immediate minion (its
/// `parent_minion_id` is the only link available without a minion store),
/// so depth here is 0 for a top-level minion and 1 for any sidekick; a
/// caller holding a full ancestor chain should use
/// [`task_depth_from_chain`] instead.
fn task_depth_of(minion: &Minion) -> Result<u32, ResolveError> {
    Ok(if minion.is_sidekick() { 1 } else { 0 })
}

/// Compute task depth from an explicit ancestor chain (nearest parent
/// first), erroring if it exceeds the cycle guard.
pub fn task_depth_from_chain(chain: &[String]) -> Result<u32, ResolveError> {
    if chain.len() as u32 > MAX_TASK_DEPTH_HOPS {
        return Err(ResolveError::CycleGuard(MAX_TASK_DEPTH_HOPS));
    }
    Ok(chain.len() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn top_level() -> Minion {
        Minion::new("m1", "root", PathBuf::from("/tmp/proj"))
    }

    fn sidekick(parent_agent: &str) -> Minion {
        let parent = top_level();
        Minion::sidekick("m2", "child", &parent, parent_agent)
    }

    fn catalog() -> AgentCatalog {
        let exec = AgentDefinition::new("exec");
        let mut plan = AgentDefinition::new("plan");
        plan.exposes_propose_plan = true;
        let mut disabled = AgentDefinition::new("retired");
        disabled.disabled = true;
        let mut auto = AgentDefinition::new("auto");
        auto.inherits = Some("plan".into());
        let compact = AgentDefinition::new("compact");
        AgentCatalog::new(vec![exec, plan, disabled, auto, compact], "exec")
    }

    #[test]
    fn unknown_requested_id_falls_back_to_exec() {
        let cat = catalog();
        let resolved = cat.resolve(Some("nonexistent"), &top_level(), None, None).unwrap();
        assert_eq!(resolved.agent.id, "exec");
        assert_eq!(resolved.mode, RunMode::Exec);
    }

    #[test]
    fn plan_like_via_inheritance_chain_resolves_to_plan_mode() {
        let cat = catalog();
        let resolved = cat.resolve(Some("auto"), &top_level(), None, None).unwrap();
        assert_eq!(resolved.mode, RunMode::Plan);
    }

    #[test]
    fn compact_id_forces_compact_mode_even_if_plan_like() {
        let cat = catalog();
        let resolved = cat.resolve(Some("compact"), &top_level(), None, None).unwrap();
        assert_eq!(resolved.mode, RunMode::Compact);
    }

    #[test]
    fn disabled_agent_top_level_falls_back_to_exec() {
        let cat = catalog();
        let resolved = cat.resolve(Some("retired"), &top_level(), None, None).unwrap();
        assert_eq!(resolved.agent.id, "exec");
    }

    #[test]
    fn disabled_agent_sidekick_fails_fast() {
        let cat = catalog();
        let err = cat.resolve(None, &sidekick("retired"), None, None).unwrap_err();
        assert!(matches!(err, ResolveError::Disabled(id) if id == "retired"));
    }

    #[test]
    fn sidekick_ignores_requested_id_and_uses_persisted_agent() {
        let cat = catalog();
        let resolved = cat.resolve(Some("plan"), &sidekick("exec"), None, None).unwrap();
        assert_eq!(resolved.agent.id, "exec");
    }

    #[test]
    fn auto_agent_requires_switch_agent_at_top_level_only() {
        let cat = catalog();
        let top = cat.resolve(Some("auto"), &top_level(), None, None).unwrap();
        assert_eq!(top.tool_policy.resolve("switch_agent"), Some(ToolPolicyAction::Require));

        let child = cat.resolve(None, &sidekick("auto"), None, None).unwrap();
        assert_eq!(child.tool_policy.resolve("switch_agent"), Some(ToolPolicyAction::Enable));
    }

    #[test]
    fn tool_policy_composition_order_is_agent_then_caller_then_system() {
        let cat = catalog();
        let caller = ToolPolicy::new(vec![ToolPolicyRule::new("^bash$", ToolPolicyAction::Disable)]);
        let system = ToolPolicy::new(vec![ToolPolicyRule::new("^bash$", ToolPolicyAction::Enable)]);
        let resolved = cat.resolve(Some("exec"), &top_level(), Some(caller), Some(system)).unwrap();
        // System composed last wins the last-match-wins tie.
        assert_eq!(resolved.tool_policy.resolve("bash"), Some(ToolPolicyAction::Enable));
    }

    #[test]
    fn resolve_carries_agents_delegated_tool_names_through() {
        let mut exec = AgentDefinition::new("exec");
        exec.delegated_tool_names = vec!["ask_user".to_string()];
        let cat = AgentCatalog::new(vec![exec], "exec");
        let resolved = cat.resolve(Some("exec"), &top_level(), None, None).unwrap();
        assert_eq!(resolved.delegated_tool_names, vec!["ask_user".to_string()]);
    }

    #[test]
    fn task_depth_from_chain_errors_past_cycle_guard() {
        let chain: Vec<String> = (0..40).map(|i| format!("m{i}")).collect();
        assert!(task_depth_from_chain(&chain).is_err());
    }

    #[test]
    fn task_depth_from_chain_within_bound_is_ok() {
        let chain: Vec<String> = (0..5).map(|i| format!("m{i}")).collect();
        assert_eq!(task_depth_from_chain(&chain).unwrap(), 5);
    }
}
