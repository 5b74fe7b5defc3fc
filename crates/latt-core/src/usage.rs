// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-minion cumulative token/cost ledger, with idempotent child→parent
//! roll-up: costs only ever add, so deleting a message never reduces a
//! minion's recorded spend.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use latt_model::{Message, Usage};
use serde::{Deserialize, Serialize};

use crate::event_store::EventStore;
use crate::lock::MinionFileLocks;
use crate::minion::session_dir;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UsageDisplay {
    pub usage: Usage,
    pub request_count: u32,
    pub cost: f64,
}

fn add_usage(a: Usage, b: Usage) -> Usage {
    Usage {
        input_tokens: a.input_tokens + b.input_tokens,
        output_tokens: a.output_tokens + b.output_tokens,
        cache_read_tokens: a.cache_read_tokens + b.cache_read_tokens,
        cache_write_tokens: a.cache_write_tokens + b.cache_write_tokens,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionUsage {
    pub version: u32,
    pub by_model: HashMap<String, UsageDisplay>,
    pub last_request: Option<DateTime<Utc>>,
    pub rolled_up_from: HashSet<String>,
    #[serde(default)]
    pub token_stats_cache: Option<serde_json::Value>,
}

impl Default for SessionUsage {
    fn default() -> Self {
        Self { version: 1, by_model: HashMap::new(), last_request: None, rolled_up_from: HashSet::new(), token_stats_cache: None }
    }
}

impl SessionUsage {
    /// Sum across all models — `Σ per-model usage`.
    pub fn total_usage(&self) -> Usage {
        self.by_model.values().fold(Usage::default(), |acc, d| add_usage(acc, d.usage))
    }

    /// `Σ getTotalCost(per-model)`.
    pub fn total_cost(&self) -> f64 {
        self.by_model.values().map(|d| d.cost).sum()
    }
}

fn usage_path(root: &PathBuf, minion_id: &str) -> PathBuf {
    session_dir(root, minion_id).join("session-usage.json")
}

pub struct SessionUsageLedger {
    root: PathBuf,
    locks: Arc<MinionFileLocks>,
    store: EventStore<SessionUsage>,
}

impl SessionUsageLedger {
    pub fn new(root: PathBuf, locks: Arc<MinionFileLocks>) -> Self {
        Self { root, locks, store: EventStore::new() }
    }

    async fn loaded(&self, minion_id: &str) -> Result<SessionUsage> {
        if let Some(u) = self.store.get(minion_id).await {
            return Ok(u);
        }
        let path = usage_path(&self.root, minion_id);
        let loaded = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionUsage::default(),
            Err(e) => return Err(e.into()),
        };
        self.store.put(minion_id, loaded.clone()).await;
        Ok(loaded)
    }

    async fn persist(&self, minion_id: &str, usage: &SessionUsage) -> Result<()> {
        let path = usage_path(&self.root, minion_id);
        self.store.persist(&path, usage, || true).await
    }

    pub async fn get_session_usage(&self, minion_id: &str) -> Result<SessionUsage> {
        self.loaded(minion_id).await
    }

    /// Record one turn's usage against `model`. Always additive.
    pub async fn record_usage(&self, minion_id: &str, model: &str, usage: Usage, cost: f64) -> Result<()> {
        let root = self.root.clone();
        let minion_id_owned = minion_id.to_string();
        let model = model.to_string();
        let store = &self.store;
        self.locks
            .with_lock(minion_id, move || async move {
                let path = usage_path(&root, &minion_id_owned);
                let mut current = match store.get(&minion_id_owned).await {
                    Some(u) => u,
                    None => match tokio::fs::read_to_string(&path).await {
                        Ok(contents) => serde_json::from_str(&contents)?,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionUsage::default(),
                        Err(e) => return Err(e.into()),
                    },
                };
                let entry = current.by_model.entry(model).or_default();
                entry.usage = add_usage(entry.usage, usage);
                entry.request_count += 1;
                entry.cost += cost;
                current.last_request = Some(Utc::now());
                store.persist(&path, &current, || true).await?;
                store.put(&minion_id_owned, current).await;
                Ok(())
            })
            .await
    }

    /// Fold `child`'s per-model usage into `parent`'s ledger exactly once —
    /// repeat invocations for the same `(parent, child)` pair are no-ops
    /// once `child_id` appears in `rolled_up_from`.
    pub async fn roll_up_usage_into_parent(&self, parent_id: &str, child_id: &str, child_usage: &SessionUsage) -> Result<()> {
        let root = self.root.clone();
        let parent_id_owned = parent_id.to_string();
        let child_id_owned = child_id.to_string();
        let child_usage = child_usage.clone();
        let store = &self.store;
        self.locks
            .with_lock(parent_id, move || async move {
                let path = usage_path(&root, &parent_id_owned);
                let mut parent = match store.get(&parent_id_owned).await {
                    Some(u) => u,
                    None => match tokio::fs::read_to_string(&path).await {
                        Ok(contents) => serde_json::from_str(&contents)?,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionUsage::default(),
                        Err(e) => return Err(e.into()),
                    },
                };
                if parent.rolled_up_from.contains(&child_id_owned) {
                    return Ok(());
                }
                for (model, display) in child_usage.by_model {
                    let entry = parent.by_model.entry(model).or_default();
                    entry.usage = add_usage(entry.usage, display.usage);
                    entry.request_count += display.request_count;
                    entry.cost += display.cost;
                }
                parent.rolled_up_from.insert(child_id_owned);
                store.persist(&path, &parent, || true).await?;
                store.put(&parent_id_owned, parent).await;
                Ok(())
            })
            .await
    }

    /// Recompute a minion's usage purely from its message history — a pure
    /// function of `messages`, so two calls over the same history always
    /// agree regardless of what was previously recorded.
    pub fn compute_from_messages(messages: &[Message]) -> SessionUsage {
        let mut by_model: HashMap<String, UsageDisplay> = HashMap::new();
        let mut last_request = None;
        for m in messages {
            if let Some(ts) = m.metadata.timestamp {
                last_request = Some(ts);
            }
            if let (Some(model), Some(usage)) = (&m.metadata.model, &m.metadata.usage) {
                let entry = by_model.entry(model.clone()).or_default();
                entry.usage = add_usage(entry.usage, *usage);
                entry.request_count += 1;
            }
        }
        SessionUsage { version: 1, by_model, last_request, rolled_up_from: HashSet::new(), token_stats_cache: None }
    }

    pub async fn rebuild_from_messages(&self, minion_id: &str, messages: &[Message]) -> Result<SessionUsage> {
        let usage = Self::compute_from_messages(messages);
        self.persist(minion_id, &usage).await?;
        self.store.put(minion_id, usage.clone()).await;
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latt_model::MessageMetadata;

    fn ledger() -> (SessionUsageLedger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (SessionUsageLedger::new(dir.path().to_path_buf(), Arc::new(MinionFileLocks::new())), dir)
    }

    fn usage(input: u32, output: u32) -> Usage {
        Usage { input_tokens: input, output_tokens: output, cache_read_tokens: 0, cache_write_tokens: 0 }
    }

    #[tokio::test]
    async fn record_usage_accumulates_per_model() {
        let (ledger, _dir) = ledger();
        ledger.record_usage("m1", "gpt-4o", usage(10, 5), 0.01).await.unwrap();
        ledger.record_usage("m1", "gpt-4o", usage(20, 10), 0.02).await.unwrap();
        let got = ledger.get_session_usage("m1").await.unwrap();
        let entry = &got.by_model["gpt-4o"];
        assert_eq!(entry.usage.input_tokens, 30);
        assert_eq!(entry.usage.output_tokens, 15);
        assert_eq!(entry.request_count, 2);
        assert!((entry.cost - 0.03).abs() < 1e-9);
    }

    #[tokio::test]
    async fn roll_up_is_idempotent_across_repeated_calls() {
        let (ledger, _dir) = ledger();
        let mut child = SessionUsage::default();
        child.by_model.insert("gpt-4o".to_string(), UsageDisplay { usage: usage(100, 50), request_count: 1, cost: 0.5 });

        ledger.roll_up_usage_into_parent("parent", "child-1", &child).await.unwrap();
        ledger.roll_up_usage_into_parent("parent", "child-1", &child).await.unwrap();
        ledger.roll_up_usage_into_parent("parent", "child-1", &child).await.unwrap();

        let parent = ledger.get_session_usage("parent").await.unwrap();
        assert_eq!(parent.by_model["gpt-4o"].usage.input_tokens, 100, "usage must be added at most once");
        assert_eq!(parent.rolled_up_from.len(), 1);
    }

    #[tokio::test]
    async fn roll_up_from_distinct_children_both_apply() {
        let (ledger, _dir) = ledger();
        let mut child_a = SessionUsage::default();
        child_a.by_model.insert("gpt-4o".to_string(), UsageDisplay { usage: usage(10, 0), request_count: 1, cost: 0.1 });
        let mut child_b = SessionUsage::default();
        child_b.by_model.insert("gpt-4o".to_string(), UsageDisplay { usage: usage(20, 0), request_count: 1, cost: 0.2 });

        ledger.roll_up_usage_into_parent("parent", "child-a", &child_a).await.unwrap();
        ledger.roll_up_usage_into_parent("parent", "child-b", &child_b).await.unwrap();

        let parent = ledger.get_session_usage("parent").await.unwrap();
        assert_eq!(parent.by_model["gpt-4o"].usage.input_tokens, 30);
    }

    #[tokio::test]
    async fn total_cost_never_decreases_after_message_deletion_semantics() {
        let (ledger, _dir) = ledger();
        ledger.record_usage("m1", "gpt-4o", usage(100, 100), 1.0).await.unwrap();
        let before = ledger.get_session_usage("m1").await.unwrap().total_cost();
        // Deletion is modeled elsewhere (HistoryStore) and never subtracts
        // from the ledger — recording more usage can only add.
        ledger.record_usage("m1", "gpt-4o", usage(1, 1), 0.001).await.unwrap();
        let after = ledger.get_session_usage("m1").await.unwrap().total_cost();
        assert!(after >= before);
    }

    #[tokio::test]
    async fn rebuild_from_messages_is_a_pure_function_of_the_messages() {
        let (ledger, _dir) = ledger();
        let messages = vec![
            Message::assistant("hi").with_metadata(MessageMetadata { model: Some("gpt-4o".into()), usage: Some(usage(5, 5)), ..Default::default() }),
            Message::assistant("again").with_metadata(MessageMetadata { model: Some("gpt-4o".into()), usage: Some(usage(3, 3)), ..Default::default() }),
        ];
        let a = ledger.rebuild_from_messages("m1", &messages).await.unwrap();
        let b = SessionUsageLedger::compute_from_messages(&messages);
        assert_eq!(a.by_model["gpt-4o"].usage.input_tokens, b.by_model["gpt-4o"].usage.input_tokens);
        assert_eq!(a.by_model["gpt-4o"].request_count, b.by_model["gpt-4o"].request_count);
    }

    #[tokio::test]
    async fn rebuild_from_messages_overwrites_rather_than_accumulates() {
        let (ledger, _dir) = ledger();
        ledger.record_usage("m1", "gpt-4o", usage(999, 999), 9.0).await.unwrap();
        let messages = vec![Message::assistant("hi").with_metadata(MessageMetadata {
            model: Some("gpt-4o".into()),
            usage: Some(usage(1, 1)),
            ..Default::default()
        })];
        let rebuilt = ledger.rebuild_from_messages("m1", &messages).await.unwrap();
        assert_eq!(rebuilt.by_model["gpt-4o"].usage.input_tokens, 1);
    }
}
