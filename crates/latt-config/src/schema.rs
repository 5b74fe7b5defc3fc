// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// Top-level configuration merged from `/etc`, XDG, and project layers.
///
/// See [`crate::load`] for the search order; later layers win on conflicts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentDefaults,
    #[serde(default)]
    pub mcp: McpGlobalConfig,
    /// Legacy per-project MCP overrides, keyed by absolute project path.
    /// Present only in config files written before `mcp.local.json` existed.
    /// Migrated into the project file on first read and then dropped — see
    /// [`crate::migrate_legacy_mcp_overrides`].
    #[serde(default, rename = "mcpLocalOverrides")]
    pub legacy_mcp_local_overrides: HashMap<String, ProjectMcpOverrides>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub name: String,
    pub api_key_env: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "mock".into(),
            name: "mock-model".into(),
            api_key_env: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
        }
    }
}

/// Defaults consulted by `AgentResolver` when a minion or caller does not
/// override a value explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    /// Identifier of the agent used when the requested id fails normalization.
    #[serde(default = "AgentDefaults::default_fallback_agent")]
    pub fallback_agent_id: String,
    /// Depth at which `shouldDisableTaskToolsForDepth` becomes true.
    #[serde(default = "AgentDefaults::default_max_task_nesting_depth")]
    pub max_task_nesting_depth: u32,
    /// Cycle guard when walking `parentMinionId` chains.
    #[serde(default = "AgentDefaults::default_max_ancestor_hops")]
    pub max_ancestor_hops: u32,
}

impl AgentDefaults {
    fn default_fallback_agent() -> String {
        "exec".into()
    }
    fn default_max_task_nesting_depth() -> u32 {
        4
    }
    fn default_max_ancestor_hops() -> u32 {
        32
    }
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            fallback_agent_id: Self::default_fallback_agent(),
            max_task_nesting_depth: Self::default_max_task_nesting_depth(),
            max_ancestor_hops: Self::default_max_ancestor_hops(),
        }
    }
}

/// Global MCP pool tuning — idle-GC sweep cadence and threshold (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpGlobalConfig {
    #[serde(default = "McpGlobalConfig::default_sweep_secs")]
    pub idle_sweep_interval_secs: u64,
    #[serde(default = "McpGlobalConfig::default_idle_threshold_secs")]
    pub idle_threshold_secs: u64,
}

impl McpGlobalConfig {
    fn default_sweep_secs() -> u64 {
        60
    }
    fn default_idle_threshold_secs() -> u64 {
        600
    }
}

impl Default for McpGlobalConfig {
    fn default() -> Self {
        Self {
            idle_sweep_interval_secs: Self::default_sweep_secs(),
            idle_threshold_secs: Self::default_idle_threshold_secs(),
        }
    }
}

// ─── Tool policy (§3 ToolPolicy) ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPolicyAction {
    Enable,
    Disable,
    Require,
}

/// One rule in a tool policy: a regex matched against tool names, last-match-wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPolicyRule {
    pub regex_match: String,
    pub action: ToolPolicyAction,
}

impl ToolPolicyRule {
    pub fn new(regex_match: impl Into<String>, action: ToolPolicyAction) -> Self {
        Self {
            regex_match: regex_match.into(),
            action,
        }
    }
}

/// An ordered sequence of [`ToolPolicyRule`]s. Composition concatenates rule
/// lists so later segments' rules win ties at equal specificity — the
/// concatenation order IS the precedence order per §4.6:
/// `agentPolicy ⧺ callerPolicy? ⧺ systemMinionPolicy?`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPolicy(pub Vec<ToolPolicyRule>);

impl ToolPolicy {
    pub fn new(rules: Vec<ToolPolicyRule>) -> Self {
        Self(rules)
    }

    pub fn compose(mut self, other: Option<ToolPolicy>) -> Self {
        if let Some(other) = other {
            self.0.extend(other.0);
        }
        self
    }

    /// Evaluate last-match-wins over `tool_name`. Invalid regexes are skipped
    /// (logged by the caller) rather than treated as a match.
    pub fn resolve(&self, tool_name: &str) -> Option<ToolPolicyAction> {
        let mut result = None;
        for rule in &self.0 {
            let Ok(re) = regex::Regex::new(&rule.regex_match) else {
                continue;
            };
            if re.is_match(tool_name) {
                result = Some(rule.action);
            }
        }
        result
    }

    /// Tool names with an explicit `require` rule — used to force-enable
    /// mandatory tools such as `switch_agent` for the `auto` agent.
    pub fn required_tool_patterns(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter(|r| r.action == ToolPolicyAction::Require)
            .map(|r| r.regex_match.as_str())
            .collect()
    }

    pub fn push(&mut self, rule: ToolPolicyRule) {
        self.0.push(rule);
    }
}

// ─── Plugins manifest (§6) ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    #[serde(default)]
    pub enabled_packs: HashMap<String, bool>,
}

impl PluginsConfig {
    /// Merge a project-level manifest over the global one; project entries
    /// win per-key, keys absent from the project manifest are inherited.
    pub fn merge(global: PluginsConfig, project: Option<PluginsConfig>) -> PluginsConfig {
        let mut merged = global;
        if let Some(project) = project {
            for (k, v) in project.enabled_packs {
                merged.enabled_packs.insert(k, v);
            }
        }
        merged
    }

    pub fn is_enabled(&self, pack: &str) -> bool {
        self.enabled_packs.get(pack).copied().unwrap_or(false)
    }
}

// ─── Minion-local MCP overrides (§6, mcp.local.json[c]) ────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectMcpOverrides {
    #[serde(default)]
    pub disabled_servers: Vec<String>,
    #[serde(default)]
    pub enabled_servers: Vec<String>,
    #[serde(default)]
    pub tool_allowlist: HashMap<String, Vec<String>>,
}

// ─── MCP server start configuration (§4.5 configSignature inputs) ─────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum McpTransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        has_oauth_tokens: bool,
    },
    Sse {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        has_oauth_tokens: bool,
    },
}

impl McpTransportConfig {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Http { .. } => "http",
            Self::Sse { .. } => "sse",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub transport: McpTransportConfig,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_model_provider_is_mock() {
        let c = Config::default();
        assert_eq!(c.model.provider, "mock");
    }

    #[test]
    fn config_default_fallback_agent_is_exec() {
        let c = Config::default();
        assert_eq!(c.agent.fallback_agent_id, "exec");
    }

    #[test]
    fn tool_policy_resolve_last_match_wins() {
        let policy = ToolPolicy::new(vec![
            ToolPolicyRule::new("^file_.*", ToolPolicyAction::Enable),
            ToolPolicyRule::new("^file_edit_danger$", ToolPolicyAction::Disable),
        ]);
        assert_eq!(
            policy.resolve("file_edit_danger"),
            Some(ToolPolicyAction::Disable)
        );
        assert_eq!(
            policy.resolve("file_read"),
            Some(ToolPolicyAction::Enable)
        );
        assert_eq!(policy.resolve("bash"), None);
    }

    #[test]
    fn tool_policy_compose_concatenates_in_order() {
        let agent = ToolPolicy::new(vec![ToolPolicyRule::new(".*", ToolPolicyAction::Disable)]);
        let caller = ToolPolicy::new(vec![ToolPolicyRule::new("^bash$", ToolPolicyAction::Enable)]);
        let composed = agent.compose(Some(caller));
        assert_eq!(composed.resolve("bash"), Some(ToolPolicyAction::Enable));
        assert_eq!(composed.resolve("other"), Some(ToolPolicyAction::Disable));
    }

    #[test]
    fn tool_policy_compose_none_is_identity() {
        let agent = ToolPolicy::new(vec![ToolPolicyRule::new(".*", ToolPolicyAction::Enable)]);
        let composed = agent.clone().compose(None);
        assert_eq!(composed.resolve("x"), agent.resolve("x"));
    }

    #[test]
    fn tool_policy_invalid_regex_is_skipped_not_matched() {
        let policy = ToolPolicy::new(vec![ToolPolicyRule::new("(unterminated", ToolPolicyAction::Enable)]);
        assert_eq!(policy.resolve("anything"), None);
    }

    #[test]
    fn plugins_merge_project_overrides_global() {
        let mut global = PluginsConfig::default();
        global.enabled_packs.insert("a".into(), true);
        global.enabled_packs.insert("b".into(), false);
        let mut project = PluginsConfig::default();
        project.enabled_packs.insert("b".into(), true);
        let merged = PluginsConfig::merge(global, Some(project));
        assert!(merged.is_enabled("a"));
        assert!(merged.is_enabled("b"));
    }

    #[test]
    fn plugins_merge_none_project_keeps_global() {
        let mut global = PluginsConfig::default();
        global.enabled_packs.insert("a".into(), true);
        let merged = PluginsConfig::merge(global, None);
        assert!(merged.is_enabled("a"));
    }

    #[test]
    fn required_tool_patterns_collects_only_require_rules() {
        let policy = ToolPolicy::new(vec![
            ToolPolicyRule::new("^switch_agent$", ToolPolicyAction::Require),
            ToolPolicyRule::new("^bash$", ToolPolicyAction::Enable),
        ]);
        assert_eq!(policy.required_tool_patterns(), vec!["^switch_agent$"]);
    }
}
