// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The minion-facing view of MCP tools: resolves which servers are enabled
//! for a minion, normalizes/deduplicates their tool names, and hands out
//! owned leases so a stream can hold a server open across an `await`
//! without racing the idle sweep or a config-change restart.
//!
//! Builds on [`latt_mcp_client`]'s per-instance signature/lease/backoff
//! machinery; this module owns only the policy-aware resolution in front of
//! it (§4.5 of the tool-surface contract: `ProjectServers ⊕
//! MinionOverrides`, filtered by tool policy).

use std::sync::Arc;
use std::time::Duration;

use latt_config::{McpGlobalConfig, McpServerConfig};
use latt_mcp_client::{dedupe_tool_names, namespaced_tool_name, McpServerInstance, McpServerPoolRegistry, TransportError};
use serde_json::Value;

/// One tool as seen by a minion, after namespacing/dedup — what the tool
/// registry and the provider-facing schema builder consume.
#[derive(Debug, Clone)]
pub struct ResolvedMcpTool {
    pub namespaced_name: String,
    pub server: String,
    pub raw_name: String,
    pub description: String,
    pub input_schema: Value,
}

/// RAII handle keeping a server instance ineligible for idle GC / deferred
/// restart while held, independent of any borrow on the owning pool.
pub struct McpLease {
    instance: Arc<McpServerInstance>,
}

impl Drop for McpLease {
    fn drop(&mut self) {
        self.instance.release();
    }
}

pub struct McpServerPool {
    registry: McpServerPoolRegistry,
    idle_sweep_interval: Duration,
    idle_threshold: Duration,
}

impl McpServerPool {
    pub fn new(global: &McpGlobalConfig) -> Self {
        Self {
            registry: McpServerPoolRegistry::new(),
            idle_sweep_interval: Duration::from_secs(global.idle_sweep_interval_secs),
            idle_threshold: Duration::from_secs(global.idle_threshold_secs),
        }
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        self.idle_sweep_interval
    }

    /// Resolve `enabled_servers` (already the caller's `ProjectServers ⊕
    /// MinionOverrides`, policy-filtered) into the namespaced tool set for
    /// `minion_id`. Individual server failures are logged and skipped so one
    /// dead server never blocks the others (§7: "MCP startup failures for
    /// individual servers (log + continue)").
    pub async fn get_tools_for_minion(&self, minion_id: &str, enabled_servers: Vec<McpServerConfig>) -> Vec<ResolvedMcpTool> {
        let cache = self.registry.cache_for(minion_id).await;
        let instances = cache.sync_enabled(enabled_servers).await;
        let mut per_server = Vec::new();
        for instance in instances {
            let server_name = instance.config.name.clone();
            instance.acquire();
            let result = instance.list_tools().await;
            instance.release();
            match result {
                Ok(tools) => per_server.push((server_name, tools)),
                Err(e) => tracing::warn!(server = %server_name, error = %e, "mcp server tool listing failed, skipping"),
            }
        }

        let name_pairs: Vec<(String, String)> =
            per_server.iter().flat_map(|(server, tools)| tools.iter().map(move |t| (server.clone(), namespaced_tool_name(server, &t.name)))).collect();
        let namespaced = dedupe_tool_names(name_pairs);

        let mut resolved = Vec::with_capacity(namespaced.len());
        let mut cursor = 0usize;
        for (server, tools) in per_server {
            for tool in tools {
                resolved.push(ResolvedMcpTool {
                    namespaced_name: namespaced[cursor].clone(),
                    server: server.clone(),
                    raw_name: tool.name,
                    description: tool.description,
                    input_schema: tool.input_schema,
                });
                cursor += 1;
            }
        }
        resolved
    }

    /// Execute `tool` on `server` for `minion_id`, acquiring and releasing a
    /// lease around the call so the instance cannot be swept or restarted
    /// mid-flight, and counting the activity even if the call fails.
    pub async fn call_tool(&self, minion_id: &str, server: &str, tool: &str, arguments: Value) -> Result<Value, TransportError> {
        let cache = self.registry.cache_for(minion_id).await;
        let Some(instance) = cache.get(server).await else {
            return Err(TransportError::Rpc { code: -32601, message: format!("unknown mcp server '{server}'") });
        };
        instance.acquire();
        let result = instance.call_tool(tool, arguments).await;
        instance.release();
        result
    }

    /// Acquire a lease that outlives this call — used by a stream that will
    /// reference the server's tools across its own lifetime.
    pub async fn acquire_lease(&self, minion_id: &str, server: &str) -> Option<McpLease> {
        let cache = self.registry.cache_for(minion_id).await;
        let instance = cache.get(server).await?;
        instance.acquire();
        Some(McpLease { instance })
    }

    pub async fn sweep_idle(&self) {
        self.registry.sweep_all_idle(self.idle_threshold).await;
    }

    pub async fn remove_minion(&self, minion_id: &str) {
        self.registry.remove(minion_id).await;
    }
}
