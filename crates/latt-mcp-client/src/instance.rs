// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! A single managed MCP server connection: transport plus restart backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use latt_config::McpServerConfig;

use crate::transport::{RawMcpTool, Transport, TransportError};

const RESTART_BACKOFF_INITIAL_MS: u64 = 200;
const RESTART_BACKOFF_MAX_MS: u64 = 30_000;

/// Normalize a raw MCP tool name into the namespaced form exposed to a
/// minion's tool registry: `{server}_{tool}`, lowercase, non
/// alphanumeric runs collapsed to a single underscore.
pub fn namespaced_tool_name(server: &str, tool: &str) -> String {
    let mut out = String::with_capacity(server.len() + tool.len() + 1);
    out.push_str(&normalize_segment(server));
    out.push('_');
    out.push_str(&normalize_segment(tool));
    out
}

fn normalize_segment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_sep = false;
    for ch in s.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    out.trim_matches('_').to_string()
}

/// Resolve name collisions across servers by appending a short hash suffix
/// of the owning server name to every name past the first claimant.
pub fn dedupe_tool_names(names: Vec<(String, String)>) -> Vec<String> {
    use std::collections::HashMap;
    let mut seen: HashMap<String, u32> = HashMap::new();
    let mut result = Vec::with_capacity(names.len());
    for (server, candidate) in names {
        let count = seen.entry(candidate.clone()).or_insert(0);
        if *count == 0 {
            result.push(candidate.clone());
        } else {
            let mut hasher = Sha256::new();
            hasher.update(server.as_bytes());
            let digest = hasher.finalize();
            let suffix = hex::encode(&digest[..3]);
            result.push(format!("{candidate}_{suffix}"));
        }
        *count += 1;
    }
    result
}

/// Fold the fields that determine whether a running server must be
/// restarted when config is reloaded (command/args/env/url/headers) into
/// `hasher`, keyed by `name` so the aggregate signature can't collide two
/// servers with identical transports under different names.
fn hash_transport(hasher: &mut Sha256, name: &str, transport: &latt_config::McpTransportConfig) {
    hasher.update(name.as_bytes());
    match transport {
        latt_config::McpTransportConfig::Stdio { command, args, env } => {
            hasher.update(b"stdio");
            hasher.update(command.as_bytes());
            for a in args {
                hasher.update(a.as_bytes());
            }
            let mut env_pairs: Vec<_> = env.iter().collect();
            env_pairs.sort();
            for (k, v) in env_pairs {
                hasher.update(k.as_bytes());
                hasher.update(v.as_bytes());
            }
        }
        latt_config::McpTransportConfig::Http { url, headers, .. } | latt_config::McpTransportConfig::Sse { url, headers, .. } => {
            hasher.update(transport.label().as_bytes());
            hasher.update(url.as_bytes());
            let mut header_keys: Vec<_> = headers.keys().collect();
            header_keys.sort();
            for k in header_keys {
                hasher.update(k.as_bytes());
            }
        }
    }
}

/// SHA-256 of the fields that determine whether a running server must be
/// restarted when config is reloaded.
pub fn config_signature(config: &McpServerConfig) -> String {
    let mut hasher = Sha256::new();
    hash_transport(&mut hasher, &config.name, &config.transport);
    hex::encode(hasher.finalize())
}

/// One aggregate signature over the sorted set of *enabled* servers for a
/// minion (§4.5's `MinionMCPCache.configSignature`) — order-independent, and
/// changes iff an enabled server is added, removed, or has its start config
/// changed. Callers get `enabled` from
/// [`latt_config::enabled_server_signature_inputs`].
pub fn aggregate_config_signature(enabled: &HashMap<String, latt_config::McpTransportConfig>) -> String {
    let mut names: Vec<&String> = enabled.keys().collect();
    names.sort();
    let mut hasher = Sha256::new();
    for name in names {
        hash_transport(&mut hasher, name, &enabled[name]);
    }
    hex::encode(hasher.finalize())
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// A single server's connection, lease count and restart state.
///
/// Held behind an `Arc` inside a pool; `transport` is behind a `Mutex`
/// because calls are serialized per server (one request in flight at a
/// time), while lease/usage counters use atomics so `lease()`/`release()`
/// never block a concurrent `call_tool`.
pub struct McpServerInstance {
    pub config: McpServerConfig,
    pub signature: String,
    transport: Mutex<Option<Transport>>,
    leases: AtomicU32,
    last_used_secs: AtomicU64,
    restart_backoff_ms: AtomicU64,
    /// Set once both the first attempt and the one restart-and-retry in
    /// [`McpServerInstance::call_with_retry`] fail — the pool's partial
    /// restart (§4.5 step 4) replaces instances in this state instead of
    /// reusing them.
    closed: AtomicBool,
}

impl McpServerInstance {
    pub fn new(config: McpServerConfig) -> Self {
        let signature = config_signature(&config);
        Self {
            config,
            signature,
            transport: Mutex::new(None),
            leases: AtomicU32::new(0),
            last_used_secs: AtomicU64::new(now_secs()),
            restart_backoff_ms: AtomicU64::new(RESTART_BACKOFF_INITIAL_MS),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Force this instance into the closed state — used by the pool's
    /// partial-restart path and by tests simulating a dead connection
    /// detected out-of-band (e.g. a subprocess exit).
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn lease(&self) -> LeaseGuard<'_> {
        self.leases.fetch_add(1, Ordering::SeqCst);
        self.last_used_secs.store(now_secs(), Ordering::Relaxed);
        LeaseGuard { instance: self }
    }

    /// Increment the lease count without borrowing `self` for the lease's
    /// lifetime — for callers holding an `Arc<McpServerInstance>` across an
    /// `await` who release explicitly via [`McpServerInstance::release`]
    /// rather than through [`LeaseGuard`]'s `Drop`.
    pub fn acquire(&self) {
        self.leases.fetch_add(1, Ordering::SeqCst);
        self.last_used_secs.store(now_secs(), Ordering::Relaxed);
    }

    pub fn release(&self) {
        self.leases.fetch_sub(1, Ordering::SeqCst);
        self.last_used_secs.store(now_secs(), Ordering::Relaxed);
    }

    pub fn lease_count(&self) -> u32 {
        self.leases.load(Ordering::SeqCst)
    }

    pub fn is_idle_for(&self, threshold: Duration) -> bool {
        if self.lease_count() > 0 {
            return false;
        }
        now_secs().saturating_sub(self.last_used_secs.load(Ordering::Relaxed)) >= threshold.as_secs()
    }

    async fn ensure_connected(&self) -> Result<(), TransportError> {
        let mut guard = self.transport.lock().await;
        if guard.is_none() {
            *guard = Some(Transport::connect(&self.config.transport).await?);
            self.restart_backoff_ms.store(RESTART_BACKOFF_INITIAL_MS, Ordering::Relaxed);
        }
        Ok(())
    }

    pub async fn list_tools(&self) -> Result<Vec<RawMcpTool>, TransportError> {
        self.call_with_retry(|t| Box::pin(t.list_tools())).await
    }

    pub async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> Result<serde_json::Value, TransportError> {
        let name = name.to_string();
        self.call_with_retry(move |t| {
            let name = name.clone();
            let arguments = arguments.clone();
            Box::pin(async move { t.call_tool(&name, arguments).await })
        }).await
    }

    /// Run `f` against the transport, restarting once with exponential
    /// backoff if the first attempt fails.
    async fn call_with_retry<T, F>(&self, f: F) -> Result<T, TransportError>
    where
        F: Fn(&mut Transport) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, TransportError>> + Send + '_>>,
    {
        if let Err(e) = self.ensure_connected().await {
            self.closed.store(true, Ordering::SeqCst);
            return Err(e);
        }
        {
            let mut guard = self.transport.lock().await;
            let transport = guard.as_mut().expect("just ensured connected");
            if let Ok(v) = f(transport).await {
                self.closed.store(false, Ordering::SeqCst);
                return Ok(v);
            }
        }

        // First attempt failed for a transport reason — back off, restart,
        // and try exactly once more.
        let backoff = self.restart_backoff_ms.load(Ordering::Relaxed);
        tracing::warn!(server = %self.config.name, backoff_ms = backoff, "mcp server call failed, restarting");
        tokio::time::sleep(Duration::from_millis(backoff)).await;
        self.restart_backoff_ms.store((backoff * 2).min(RESTART_BACKOFF_MAX_MS), Ordering::Relaxed);

        {
            let mut guard = self.transport.lock().await;
            *guard = None;
        }
        if let Err(e) = self.ensure_connected().await {
            self.closed.store(true, Ordering::SeqCst);
            return Err(e);
        }
        let result = {
            let mut guard = self.transport.lock().await;
            let transport = guard.as_mut().expect("just ensured connected");
            f(transport).await
        };
        self.closed.store(result.is_err(), Ordering::SeqCst);
        result
    }

    pub async fn shutdown(&self) {
        let mut guard = self.transport.lock().await;
        if let Some(t) = guard.take() {
            t.shutdown().await;
        }
    }
}

/// RAII handle returned by [`McpServerInstance::lease`]. Dropping it
/// releases the lease, making the server eligible for idle GC again once
/// the threshold elapses.
pub struct LeaseGuard<'a> {
    instance: &'a McpServerInstance,
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        self.instance.leases.fetch_sub(1, Ordering::SeqCst);
        self.instance.last_used_secs.store(now_secs(), Ordering::Relaxed);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use latt_config::{McpServerConfig, McpTransportConfig};

    use super::*;

    fn stdio_config(name: &str, command: &str) -> McpServerConfig {
        McpServerConfig {
            name: name.into(),
            transport: McpTransportConfig::Stdio { command: command.into(), args: vec![], env: HashMap::new() },
            enabled: true,
        }
    }

    #[test]
    fn namespaced_tool_name_joins_and_lowercases() {
        assert_eq!(namespaced_tool_name("GitHub", "Search Issues"), "github_search_issues");
    }

    #[test]
    fn namespaced_tool_name_collapses_separators() {
        assert_eq!(namespaced_tool_name("my--server", "do__thing"), "my_server_do_thing");
    }

    #[test]
    fn dedupe_tool_names_keeps_first_claimant_unsuffixed() {
        let names = vec![("server-a".to_string(), "search".to_string()), ("server-b".to_string(), "search".to_string())];
        let result = dedupe_tool_names(names);
        assert_eq!(result[0], "search");
        assert_ne!(result[1], "search");
        assert!(result[1].starts_with("search_"));
    }

    #[test]
    fn dedupe_tool_names_no_collision_is_identity() {
        let names = vec![("a".to_string(), "x".to_string()), ("b".to_string(), "y".to_string())];
        assert_eq!(dedupe_tool_names(names), vec!["x", "y"]);
    }

    #[test]
    fn config_signature_changes_with_command() {
        let a = config_signature(&stdio_config("s", "cmd-a"));
        let b = config_signature(&stdio_config("s", "cmd-b"));
        assert_ne!(a, b);
    }

    #[test]
    fn config_signature_stable_for_identical_config() {
        let a = config_signature(&stdio_config("s", "cmd"));
        let b = config_signature(&stdio_config("s", "cmd"));
        assert_eq!(a, b);
    }

    #[test]
    fn lease_guard_decrements_on_drop() {
        let instance = McpServerInstance::new(stdio_config("s", "cmd"));
        assert_eq!(instance.lease_count(), 0);
        {
            let _g = instance.lease();
            assert_eq!(instance.lease_count(), 1);
        }
        assert_eq!(instance.lease_count(), 0);
    }

    #[test]
    fn idle_for_false_while_leased() {
        let instance = McpServerInstance::new(stdio_config("s", "cmd"));
        let _g = instance.lease();
        assert!(!instance.is_idle_for(Duration::from_secs(0)));
    }

    #[test]
    fn acquire_and_release_mirror_lease_guard_counting() {
        let instance = McpServerInstance::new(stdio_config("s", "cmd"));
        instance.acquire();
        instance.acquire();
        assert_eq!(instance.lease_count(), 2);
        instance.release();
        assert_eq!(instance.lease_count(), 1);
        instance.release();
        assert_eq!(instance.lease_count(), 0);
    }

    #[test]
    fn idle_for_true_once_released_and_threshold_zero() {
        let instance = McpServerInstance::new(stdio_config("s", "cmd"));
        {
            let _g = instance.lease();
        }
        assert!(instance.is_idle_for(Duration::from_secs(0)));
    }

    #[test]
    fn fresh_instance_is_not_closed() {
        let instance = McpServerInstance::new(stdio_config("s", "cmd"));
        assert!(!instance.is_closed());
    }

    #[test]
    fn mark_closed_is_observable() {
        let instance = McpServerInstance::new(stdio_config("s", "cmd"));
        instance.mark_closed();
        assert!(instance.is_closed());
    }

    #[test]
    fn aggregate_config_signature_is_order_independent() {
        let mut a = HashMap::new();
        a.insert("x".to_string(), stdio_config("x", "cmd-x").transport);
        a.insert("y".to_string(), stdio_config("y", "cmd-y").transport);
        let mut b = HashMap::new();
        b.insert("y".to_string(), stdio_config("y", "cmd-y").transport);
        b.insert("x".to_string(), stdio_config("x", "cmd-x").transport);
        assert_eq!(aggregate_config_signature(&a), aggregate_config_signature(&b));
    }

    #[test]
    fn aggregate_config_signature_changes_with_membership() {
        let mut a = HashMap::new();
        a.insert("x".to_string(), stdio_config("x", "cmd-x").transport);
        let mut b = a.clone();
        b.insert("y".to_string(), stdio_config("y", "cmd-y").transport);
        assert_ne!(aggregate_config_signature(&a), aggregate_config_signature(&b));
    }

    #[test]
    fn aggregate_config_signature_changes_with_member_transport() {
        let mut a = HashMap::new();
        a.insert("x".to_string(), stdio_config("x", "cmd-a").transport);
        let mut b = HashMap::new();
        b.insert("x".to_string(), stdio_config("x", "cmd-b").transport);
        assert_ne!(aggregate_config_signature(&a), aggregate_config_signature(&b));
    }
}
