// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-minion MCP server cache, and the global registry of those caches
//! that the idle-GC sweep walks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use latt_config::{McpServerConfig, ProjectMcpOverrides};

use crate::instance::{aggregate_config_signature, McpServerInstance};
use crate::transport::TransportError;

/// The set of MCP servers one minion has started, keyed by server name.
///
/// Restarting a server here never affects another minion's cache even if
/// both reference a server with the same name — each minion owns its own
/// process/connection, matching the per-minion file-lock isolation the rest
/// of the runtime uses.
#[derive(Default)]
pub struct MinionMcpCache {
    servers: RwLock<HashMap<String, Arc<McpServerInstance>>>,
    /// The minion-level aggregate signature last applied, compared against
    /// on the next [`MinionMcpCache::sync_enabled`] call (§4.5 step 2).
    signature: RwLock<Option<String>>,
}

impl MinionMcpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile the running server set against `configs` — the caller's
    /// `ProjectServers ⊕ MinionOverrides`, already policy-filtered — using
    /// one aggregate signature over the whole enabled set rather than a
    /// per-server comparison (§4.5 `getToolsForMinion` steps 2-5):
    ///
    /// 2. signature unchanged and nothing closed: return the running
    ///    instances as-is.
    /// 3. signature changed but a lease is held: defer — leave the running
    ///    set untouched, surface only instances whose names remain enabled,
    ///    close nothing; the full reconciliation happens on the next call
    ///    made with zero leases.
    /// 4. signature unchanged but something is closed, and a lease is held:
    ///    partial restart — replace only the closed instances.
    /// 5. otherwise: stop everything and start the full required set.
    pub async fn sync_enabled(&self, configs: Vec<McpServerConfig>) -> Vec<Arc<McpServerInstance>> {
        let enabled = latt_config::enabled_server_signature_inputs(&configs, &ProjectMcpOverrides::default());
        let new_signature = aggregate_config_signature(&enabled);

        let (signature_matches, leased, any_closed) = {
            let current = self.signature.read().await;
            let servers = self.servers.read().await;
            (current.as_deref() == Some(new_signature.as_str()), servers.values().any(|i| i.lease_count() > 0), servers.values().any(|i| i.is_closed()))
        };

        if signature_matches && !any_closed {
            let servers = self.servers.read().await;
            return configs.iter().filter_map(|c| servers.get(&c.name).cloned()).collect();
        }

        if !signature_matches && leased {
            // Deferred restart: the full reconciliation waits for the next
            // call made with zero leases. Don't touch the running set — just
            // surface tools for names that remain enabled.
            let servers = self.servers.read().await;
            return configs.iter().filter_map(|c| servers.get(&c.name).cloned()).collect();
        }

        if signature_matches && any_closed && leased {
            let mut servers = self.servers.write().await;
            let mut result = Vec::with_capacity(configs.len());
            for config in &configs {
                let dead = servers.get(&config.name).map_or(true, |i| i.is_closed());
                if dead {
                    if let Some(old) = servers.remove(&config.name) {
                        old.shutdown().await;
                    }
                    let fresh = Arc::new(McpServerInstance::new(config.clone()));
                    servers.insert(config.name.clone(), fresh.clone());
                    result.push(fresh);
                } else {
                    result.push(servers.get(&config.name).expect("checked above").clone());
                }
            }
            *self.signature.write().await = Some(new_signature);
            return result;
        }

        // Otherwise: stop all, start all required servers.
        let drained: Vec<Arc<McpServerInstance>> = self.servers.write().await.drain().map(|(_, v)| v).collect();
        for inst in drained {
            inst.shutdown().await;
        }
        let mut servers = self.servers.write().await;
        let mut result = Vec::with_capacity(configs.len());
        for config in &configs {
            let fresh = Arc::new(McpServerInstance::new(config.clone()));
            servers.insert(config.name.clone(), fresh.clone());
            result.push(fresh);
        }
        *self.signature.write().await = Some(new_signature);
        result
    }

    pub async fn get(&self, name: &str) -> Option<Arc<McpServerInstance>> {
        self.servers.read().await.get(name).cloned()
    }

    pub async fn server_names(&self) -> Vec<String> {
        self.servers.read().await.keys().cloned().collect()
    }

    /// Remove and shut down every server in this cache whose lease count is
    /// zero and has been idle at least `threshold`.
    pub async fn sweep_idle(&self, threshold: Duration) {
        let idle_names: Vec<String> = {
            let servers = self.servers.read().await;
            servers.iter().filter(|(_, inst)| inst.is_idle_for(threshold)).map(|(name, _)| name.clone()).collect()
        };
        for name in idle_names {
            let removed = self.servers.write().await.remove(&name);
            if let Some(inst) = removed {
                tracing::debug!(server = %name, "shutting down idle mcp server");
                inst.shutdown().await;
            }
        }
    }

    /// Shut down every server regardless of lease/idle state — used when the
    /// owning minion itself is torn down.
    pub async fn shutdown_all(&self) {
        let drained: Vec<Arc<McpServerInstance>> = self.servers.write().await.drain().map(|(_, v)| v).collect();
        for inst in drained {
            inst.shutdown().await;
        }
    }
}

/// Holds one [`MinionMcpCache`] per minion and runs the periodic idle sweep
/// across all of them, per the global `idle_sweep_interval_secs` /
/// `idle_threshold_secs` tuning.
#[derive(Default)]
pub struct McpServerPoolRegistry {
    caches: RwLock<HashMap<String, Arc<MinionMcpCache>>>,
}

impl McpServerPoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn cache_for(&self, minion_id: &str) -> Arc<MinionMcpCache> {
        {
            let caches = self.caches.read().await;
            if let Some(c) = caches.get(minion_id) {
                return c.clone();
            }
        }
        let mut caches = self.caches.write().await;
        caches.entry(minion_id.to_string()).or_insert_with(|| Arc::new(MinionMcpCache::new())).clone()
    }

    /// Drop and shut down the cache for one minion, e.g. on hard restart.
    pub async fn remove(&self, minion_id: &str) {
        let removed = self.caches.write().await.remove(minion_id);
        if let Some(cache) = removed {
            cache.shutdown_all().await;
        }
    }

    pub async fn sweep_all_idle(&self, threshold: Duration) {
        let caches: Vec<Arc<MinionMcpCache>> = self.caches.read().await.values().cloned().collect();
        for cache in caches {
            cache.sweep_idle(threshold).await;
        }
    }

    pub async fn minion_count(&self) -> usize {
        self.caches.read().await.len()
    }
}

pub type PoolResult<T> = Result<T, TransportError>;

// ─── Unit tests ──────────────────────────────────────────────────────────────
