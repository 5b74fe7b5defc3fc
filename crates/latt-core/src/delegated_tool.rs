// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Process-wide registry of tool calls answered out-of-band by an external
//! client rather than executed locally.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;

#[derive(Debug, thiserror::Error)]
pub enum DelegatedToolError {
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("pending registration dropped without a resolution")]
    Dropped,
}

struct Pending {
    tool_name: String,
    created_at: DateTime<Utc>,
    tx: Option<oneshot::Sender<Result<Value, DelegatedToolError>>>,
}

/// `registerPending` hands back a receiver the caller awaits; `answer` /
/// `cancel` are called by whatever external actor owns the result.
#[derive(Default)]
pub struct DelegatedToolCallRegistry {
    pending: Mutex<HashMap<(String, String), Pending>>,
}

impl DelegatedToolCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `(minion_id, tool_call_id)` as pending and returns the
    /// receiver resolved by `answer`/`cancel`. Duplicate registration for
    /// the same key is a contract violation — it panics rather than
    /// silently overwriting an in-flight call.
    pub fn register_pending(&self, minion_id: &str, tool_call_id: &str, tool_name: &str) -> oneshot::Receiver<Result<Value, DelegatedToolError>> {
        let (tx, rx) = oneshot::channel();
        let key = (minion_id.to_string(), tool_call_id.to_string());
        let mut pending = self.pending.lock().unwrap();
        assert!(
            !pending.contains_key(&key),
            "duplicate pending registration for minion {minion_id} tool_call {tool_call_id}"
        );
        pending.insert(key, Pending { tool_name: tool_name.to_string(), created_at: Utc::now(), tx: Some(tx) });
        rx
    }

    pub fn answer(&self, minion_id: &str, tool_call_id: &str, result: Value) -> bool {
        self.resolve(minion_id, tool_call_id, Ok(result))
    }

    pub fn cancel(&self, minion_id: &str, tool_call_id: &str, reason: &str) -> bool {
        self.resolve(minion_id, tool_call_id, Err(DelegatedToolError::Cancelled(reason.to_string())))
    }

    fn resolve(&self, minion_id: &str, tool_call_id: &str, outcome: Result<Value, DelegatedToolError>) -> bool {
        let key = (minion_id.to_string(), tool_call_id.to_string());
        let mut pending = self.pending.lock().unwrap();
        let Some(mut entry) = pending.remove(&key) else { return false };
        if let Some(tx) = entry.tx.take() {
            let _ = tx.send(outcome);
        }
        true
    }

    /// Fails every outstanding entry for `minion_id` with `reason`.
    pub fn cancel_all(&self, minion_id: &str, reason: &str) {
        let mut pending = self.pending.lock().unwrap();
        let keys: Vec<(String, String)> = pending.keys().filter(|(m, _)| m == minion_id).cloned().collect();
        for key in keys {
            if let Some(mut entry) = pending.remove(&key) {
                if let Some(tx) = entry.tx.take() {
                    let _ = tx.send(Err(DelegatedToolError::Cancelled(reason.to_string())));
                }
            }
        }
    }

    /// The newest pending registration for `minion_id`, by `created_at`.
    pub fn get_latest_pending(&self, minion_id: &str) -> Option<(String, String)> {
        let pending = self.pending.lock().unwrap();
        pending
            .iter()
            .filter(|((m, _), _)| m == minion_id)
            .max_by_key(|(_, entry)| entry.created_at)
            .map(|((_, tool_call_id), entry)| (tool_call_id.clone(), entry.tool_name.clone()))
    }

    pub fn pending_count(&self, minion_id: &str) -> usize {
        self.pending.lock().unwrap().keys().filter(|(m, _)| m == minion_id).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answer_resolves_registered_receiver() {
        let registry = DelegatedToolCallRegistry::new();
        let rx = registry.register_pending("m1", "call-1", "ask_question");
        assert!(registry.answer("m1", "call-1", serde_json::json!({"ok": true})));
        let result = rx.await.unwrap().unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
    }

    #[tokio::test]
    async fn cancel_resolves_receiver_with_error() {
        let registry = DelegatedToolCallRegistry::new();
        let rx = registry.register_pending("m1", "call-1", "ask_question");
        assert!(registry.cancel("m1", "call-1", "Interrupted"));
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, DelegatedToolError::Cancelled(reason) if reason == "Interrupted"));
    }

    #[tokio::test]
    async fn answer_on_unknown_key_returns_false() {
        let registry = DelegatedToolCallRegistry::new();
        assert!(!registry.answer("m1", "missing", serde_json::json!(null)));
    }

    #[test]
    #[should_panic(expected = "duplicate pending registration")]
    fn duplicate_registration_panics() {
        let registry = DelegatedToolCallRegistry::new();
        let _a = registry.register_pending("m1", "call-1", "t");
        let _b = registry.register_pending("m1", "call-1", "t");
    }

    #[tokio::test]
    async fn cancel_all_fulfills_every_pending_entry_for_minion() {
        let registry = DelegatedToolCallRegistry::new();
        let rx1 = registry.register_pending("m1", "call-1", "t1");
        let rx2 = registry.register_pending("m1", "call-2", "t2");
        let rx_other = registry.register_pending("m2", "call-3", "t3");

        registry.cancel_all("m1", "session ended");

        assert!(rx1.await.unwrap().is_err());
        assert!(rx2.await.unwrap().is_err());
        assert_eq!(registry.pending_count("m1"), 0);
        assert_eq!(registry.pending_count("m2"), 1);
        drop(rx_other);
    }

    #[tokio::test]
    async fn get_latest_pending_returns_newest_by_created_at() {
        let registry = DelegatedToolCallRegistry::new();
        let _rx1 = registry.register_pending("m1", "call-1", "t1");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let _rx2 = registry.register_pending("m1", "call-2", "t2");
        let (id, name) = registry.get_latest_pending("m1").unwrap();
        assert_eq!(id, "call-2");
        assert_eq!(name, "t2");
    }
}
