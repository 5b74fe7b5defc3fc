// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use latt_config::{ToolPolicy, ToolPolicyAction};

use crate::{Tool, ToolCall, ToolOutput};

/// A tool schema — mirrors `latt_model::ToolSchema` but keeps this crate
/// independent of the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Central registry holding every tool known to a minion.
///
/// Registration is a one-time setup step; the policy decision of *which*
/// tools a given agent/caller may see happens per request via
/// [`ToolRegistry::schemas_for_policy`], since the same registry is shared
/// across minions running different agents.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

// SAFETY: Sync because HashMap<String, Arc<dyn Tool>> is Sync when Tool is
// Send + Sync (required by the trait bound), and no interior mutability
// exists after construction — all methods take &self.
unsafe impl Sync for ToolRegistry {}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Schemas for every registered tool, policy-unfiltered.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema { name: t.name().to_string(), description: t.description().to_string(), parameters: t.parameters_schema() })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Schemas for tools a composed policy resolves to `enable` or
    /// `require`. A tool with no matching rule is excluded — policies must
    /// explicitly enable what they want visible.
    pub fn schemas_for_policy(&self, policy: &ToolPolicy) -> Vec<ToolSchema> {
        let mut names: Vec<&String> = self.tools.keys().filter(|name| policy_allows(policy, name)).collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let t = &self.tools[name];
                ToolSchema { name: t.name().to_string(), description: t.description().to_string(), parameters: t.parameters_schema() }
            })
            .collect()
    }

    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call).await,
            None => ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
        }
    }

    /// Execute only if the composed policy allows it; otherwise return a
    /// `policy_denied`-flavored error without invoking the tool.
    pub async fn execute_with_policy(&self, call: &ToolCall, policy: &ToolPolicy) -> ToolOutput {
        if !policy_allows(policy, &call.name) {
            return ToolOutput::err(&call.id, format!("tool '{}' is denied by policy", call.name));
        }
        self.execute(call).await
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn names_for_policy(&self, policy: &ToolPolicy) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().filter(|name| policy_allows(policy, name)).cloned().collect();
        names.sort();
        names
    }
}

fn policy_allows(policy: &ToolPolicy, tool_name: &str) -> bool {
    matches!(policy.resolve(tool_name), Some(ToolPolicyAction::Enable) | Some(ToolPolicyAction::Require))
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use latt_config::ToolPolicyRule;
    use serde_json::{json, Value};

    use super::*;
    use crate::tool::{Tool, ToolCall, ToolOutput};

    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, call: &ToolCall) -> ToolOutput {
            ToolOutput::ok(&call.id, format!("echo:{}", call.args))
        }
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        assert!(reg.get("echo").is_some());
    }

    #[test]
    fn get_unknown_returns_none() {
        let reg = ToolRegistry::new();
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn names_returns_all_registered() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "a" });
        reg.register(EchoTool { name: "b" });
        let mut names = reg.names();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn schemas_contains_registered_tool() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "my_tool" });
        let schemas = reg.schemas();
        assert!(schemas.iter().any(|s| s.name == "my_tool"));
    }

    #[tokio::test]
    async fn execute_known_tool_succeeds() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        let call = ToolCall { id: "1".into(), name: "echo".into(), args: json!({"x":1}) };
        let out = reg.execute(&call).await;
        assert!(!out.is_error);
        assert!(out.content.starts_with("echo:"));
    }

    #[tokio::test]
    async fn execute_unknown_tool_returns_error() {
        let reg = ToolRegistry::new();
        let call = ToolCall { id: "x".into(), name: "missing".into(), args: json!({}) };
        let out = reg.execute(&call).await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown tool"));
    }

    #[test]
    fn registering_same_name_twice_overwrites() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "t" });
        reg.register(EchoTool { name: "t" });
        assert_eq!(reg.names().len(), 1);
    }

    // ── Policy-gated dispatch ─────────────────────────────────────────────────

    fn registry_with(names: &[&'static str]) -> ToolRegistry {
        let mut reg = ToolRegistry::new();
        for n in names {
            reg.register(EchoTool { name: n });
        }
        reg
    }

    #[test]
    fn schemas_for_policy_excludes_unmatched_tools() {
        let reg = registry_with(&["bash", "file_read"]);
        let policy = ToolPolicy::new(vec![ToolPolicyRule::new("^file_.*", latt_config::ToolPolicyAction::Enable)]);
        let schemas = reg.schemas_for_policy(&policy);
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "file_read");
    }

    #[test]
    fn schemas_for_policy_empty_policy_allows_nothing() {
        let reg = registry_with(&["bash"]);
        let schemas = reg.schemas_for_policy(&ToolPolicy::default());
        assert!(schemas.is_empty());
    }

    #[tokio::test]
    async fn execute_with_policy_denies_when_disabled() {
        let reg = registry_with(&["bash"]);
        let policy = ToolPolicy::new(vec![ToolPolicyRule::new("^bash$", latt_config::ToolPolicyAction::Disable)]);
        let call = ToolCall { id: "1".into(), name: "bash".into(), args: json!({}) };
        let out = reg.execute_with_policy(&call, &policy).await;
        assert!(out.is_error);
        assert!(out.content.contains("denied by policy"));
    }

    #[tokio::test]
    async fn execute_with_policy_allows_when_required() {
        let reg = registry_with(&["switch_agent"]);
        let policy = ToolPolicy::new(vec![ToolPolicyRule::new("^switch_agent$", latt_config::ToolPolicyAction::Require)]);
        let call = ToolCall { id: "1".into(), name: "switch_agent".into(), args: json!({}) };
        let out = reg.execute_with_policy(&call, &policy).await;
        assert!(!out.is_error);
    }
}
