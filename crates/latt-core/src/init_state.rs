// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Lifecycle of a minion's init hook: runtime setup, then the hook itself,
//! with output capture, replay, and a bounded wait with a cooperative
//! timeout that never propagates as an error.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};

use crate::abort::AbortSignal;
use crate::event_store::EventStore;
use crate::lock::MinionFileLocks;
use crate::minion::session_dir;

/// Hook output is ring-buffered: past this many lines, the oldest is
/// dropped and `truncated_lines` counts how many were lost.
const MAX_LINES: usize = 500;
const HOOK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitStatusKind {
    Running,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitPhase {
    RuntimeSetup,
    InitHook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitOutputLine {
    pub line: String,
    pub is_error: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitStatus {
    pub status: InitStatusKind,
    pub phase: InitPhase,
    pub hook_path: String,
    pub start_time: DateTime<Utc>,
    pub hook_start_time: Option<DateTime<Utc>>,
    pub lines: Vec<InitOutputLine>,
    pub truncated_lines: u32,
    pub exit_code: Option<i32>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum InitEvent {
    Start { minion_id: String, hook_path: String, timestamp: DateTime<Utc> },
    Output { minion_id: String, line: String, is_error: bool, timestamp: DateTime<Utc> },
    End { minion_id: String, exit_code: i32, truncated_lines: Option<u32>, timestamp: DateTime<Utc> },
}

fn events_for(minion_id: &str, status: &InitStatus) -> Vec<InitEvent> {
    let mut events = vec![InitEvent::Start { minion_id: minion_id.to_string(), hook_path: status.hook_path.clone(), timestamp: status.start_time }];
    for line in &status.lines {
        events.push(InitEvent::Output { minion_id: minion_id.to_string(), line: line.line.clone(), is_error: line.is_error, timestamp: line.timestamp });
    }
    if status.status != InitStatusKind::Running {
        events.push(InitEvent::End {
            minion_id: minion_id.to_string(),
            exit_code: status.exit_code.unwrap_or(-1),
            truncated_lines: (status.truncated_lines > 0).then_some(status.truncated_lines),
            timestamp: status.end_time.unwrap_or(status.start_time),
        });
    }
    events
}

/// The liveness bookkeeping a running init carries in addition to the
/// persisted `InitStatus`: the two watch channels `waitForInit` races and
/// the monotonic clock anchor for the 5-minute hook budget.
struct Waiter {
    completion_tx: watch::Sender<bool>,
    completion_rx: watch::Receiver<bool>,
    hook_phase_tx: watch::Sender<bool>,
    hook_phase_rx: watch::Receiver<bool>,
    hook_start_instant: Option<tokio::time::Instant>,
}

impl Waiter {
    fn new() -> Self {
        let (completion_tx, completion_rx) = watch::channel(false);
        let (hook_phase_tx, hook_phase_rx) = watch::channel(false);
        Self { completion_tx, completion_rx, hook_phase_tx, hook_phase_rx, hook_start_instant: None }
    }
}

pub struct InitStateManager {
    root: PathBuf,
    locks: Arc<MinionFileLocks>,
    store: EventStore<InitStatus>,
    waiters: Mutex<HashMap<String, Waiter>>,
}

fn status_path(root: &PathBuf, minion_id: &str) -> PathBuf {
    session_dir(root, minion_id).join("init-status.json")
}

impl InitStateManager {
    pub fn new(root: PathBuf, locks: Arc<MinionFileLocks>) -> Self {
        Self { root, locks, store: EventStore::new(), waiters: Mutex::new(HashMap::new()) }
    }

    pub async fn start_init(&self, minion_id: &str, hook_path: &str) {
        let status = InitStatus {
            status: InitStatusKind::Running,
            phase: InitPhase::RuntimeSetup,
            hook_path: hook_path.to_string(),
            start_time: Utc::now(),
            hook_start_time: None,
            lines: Vec::new(),
            truncated_lines: 0,
            exit_code: None,
            end_time: None,
        };
        self.waiters.lock().await.insert(minion_id.to_string(), Waiter::new());
        self.store.put(minion_id, status.clone()).await;
        let path = status_path(&self.root, minion_id);
        let store = &self.store;
        self.locks.with_lock(minion_id, move || async move { let _ = store.persist(&path, &status, || true).await; }).await;
    }

    pub async fn append_output(&self, minion_id: &str, line: &str, is_error: bool) {
        let Some(mut status) = self.store.get(minion_id).await else { return };
        status.lines.push(InitOutputLine { line: line.to_string(), is_error, timestamp: Utc::now() });
        if status.lines.len() > MAX_LINES {
            status.lines.remove(0);
            status.truncated_lines += 1;
        }
        self.store.put(minion_id, status.clone()).await;
        let path = status_path(&self.root, minion_id);
        let store = &self.store;
        self.locks.with_lock(minion_id, move || async move { let _ = store.persist(&path, &status, || true).await; }).await;
    }

    pub async fn enter_hook_phase(&self, minion_id: &str) {
        let Some(mut status) = self.store.get(minion_id).await else { return };
        status.phase = InitPhase::InitHook;
        let now = Utc::now();
        status.hook_start_time = Some(now);
        self.store.put(minion_id, status.clone()).await;

        if let Some(waiter) = self.waiters.lock().await.get_mut(minion_id) {
            waiter.hook_start_instant = Some(tokio::time::Instant::now());
            let _ = waiter.hook_phase_tx.send(true);
        }

        let path = status_path(&self.root, minion_id);
        let store = &self.store;
        self.locks.with_lock(minion_id, move || async move { let _ = store.persist(&path, &status, || true).await; }).await;
    }

    /// Persist first (so a visible `init-end` implies the file exists on
    /// disk), then mutate memory, then resolve `completion`.
    pub async fn end_init(&self, minion_id: &str, exit_code: i32) {
        let Some(mut status) = self.store.get(minion_id).await else { return };
        status.status = if exit_code == 0 { InitStatusKind::Success } else { InitStatusKind::Error };
        status.exit_code = Some(exit_code);
        status.end_time = Some(Utc::now());

        let path = status_path(&self.root, minion_id);
        let status_for_disk = status.clone();
        let store = &self.store;
        self.locks.with_lock(minion_id, move || async move { let _ = store.persist(&path, &status_for_disk, || true).await; }).await;

        self.store.put(minion_id, status).await;

        if let Some(waiter) = self.waiters.lock().await.get(minion_id) {
            let _ = waiter.completion_tx.send(true);
        }
    }

    /// Never throws. Returns immediately if there is no tracked state, the
    /// init already completed, or `abort` is already cancelled. Otherwise
    /// waits for completion, a 5-minute budget measured from
    /// `hook_start_time` (started only once the hook phase begins), or
    /// abort — whichever comes first. A timeout does not propagate.
    pub async fn wait_for_init(&self, minion_id: &str, mut abort: Option<AbortSignal>) {
        if let Some(status) = self.store.get(minion_id).await {
            if status.status != InitStatusKind::Running {
                return;
            }
        } else {
            return;
        }
        if let Some(a) = &abort {
            if a.is_cancelled() {
                return;
            }
        }

        let (mut completion_rx, mut hook_phase_rx) = {
            let waiters = self.waiters.lock().await;
            let Some(w) = waiters.get(minion_id) else { return };
            (w.completion_rx.clone(), w.hook_phase_rx.clone())
        };

        loop {
            if *completion_rx.borrow() {
                return;
            }
            if *hook_phase_rx.borrow() {
                break;
            }
            tokio::select! {
                r = completion_rx.changed() => { if r.is_err() || *completion_rx.borrow() { return; } }
                r = hook_phase_rx.changed() => { if r.is_err() { return; } }
                _ = Self::abort_future(&mut abort) => return,
            }
        }

        let hook_start_instant = {
            let waiters = self.waiters.lock().await;
            waiters.get(minion_id).and_then(|w| w.hook_start_instant)
        };
        let deadline = hook_start_instant.map(|t| t + HOOK_TIMEOUT);

        tokio::select! {
            _ = completion_rx.changed() => {}
            _ = Self::sleep_until_or_pending(deadline) => {}
            _ = Self::abort_future(&mut abort) => {}
        }
    }

    async fn abort_future(abort: &mut Option<AbortSignal>) {
        match abort {
            Some(a) => a.cancelled().await,
            None => std::future::pending::<()>().await,
        }
    }

    async fn sleep_until_or_pending(deadline: Option<tokio::time::Instant>) {
        match deadline {
            Some(d) => tokio::time::sleep_until(d).await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Unblocks any current waiter without marking completion on disk —
    /// disk state is untouched, only the in-memory liveness entry is
    /// dropped.
    pub async fn clear_in_memory_state(&self, minion_id: &str) {
        if let Some(waiter) = self.waiters.lock().await.remove(minion_id) {
            let _ = waiter.completion_tx.send(true);
            let _ = waiter.hook_phase_tx.send(true);
        }
    }

    /// Emits `start -> outputs -> end` (if completed), preferring in-memory
    /// state and falling back to `init-status.json`.
    pub async fn replay(&self, minion_id: &str, mut emit: impl FnMut(InitEvent)) -> anyhow::Result<()> {
        let path = status_path(&self.root, minion_id);
        let minion_id_owned = minion_id.to_string();
        self.store
            .replay(minion_id, &path, move |status| events_for(&minion_id_owned, status), |event| emit(event))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn manager() -> (InitStateManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (InitStateManager::new(dir.path().to_path_buf(), Arc::new(MinionFileLocks::new())), dir)
    }

    #[tokio::test]
    async fn start_init_creates_running_state() {
        let (mgr, _dir) = manager();
        mgr.start_init("m1", "/hooks/init.sh").await;
        let status = mgr.store.get("m1").await.unwrap();
        assert_eq!(status.status, InitStatusKind::Running);
        assert_eq!(status.phase, InitPhase::RuntimeSetup);
    }

    #[tokio::test]
    async fn append_output_ring_buffers_past_max_lines() {
        let (mgr, _dir) = manager();
        mgr.start_init("m1", "/hooks/init.sh").await;
        for i in 0..(MAX_LINES + 10) {
            mgr.append_output("m1", &format!("line {i}"), false).await;
        }
        let status = mgr.store.get("m1").await.unwrap();
        assert_eq!(status.lines.len(), MAX_LINES);
        assert_eq!(status.truncated_lines, 10);
        assert_eq!(status.lines[0].line, "line 10");
    }

    #[tokio::test]
    async fn enter_hook_phase_transitions_and_sets_hook_start_time() {
        let (mgr, _dir) = manager();
        mgr.start_init("m1", "/hooks/init.sh").await;
        mgr.enter_hook_phase("m1").await;
        let status = mgr.store.get("m1").await.unwrap();
        assert_eq!(status.phase, InitPhase::InitHook);
        assert!(status.hook_start_time.is_some());
    }

    #[tokio::test]
    async fn end_init_persists_before_being_visible_in_memory_as_completed() {
        let (mgr, dir) = manager();
        mgr.start_init("m1", "/hooks/init.sh").await;
        mgr.end_init("m1", 0).await;
        let status = mgr.store.get("m1").await.unwrap();
        assert_eq!(status.status, InitStatusKind::Success);
        let on_disk = dir.path().join("m1/init-status.json");
        assert!(on_disk.exists(), "end_init must have persisted to disk");
    }

    #[tokio::test]
    async fn end_init_nonzero_exit_marks_error() {
        let (mgr, _dir) = manager();
        mgr.start_init("m1", "/hooks/init.sh").await;
        mgr.end_init("m1", 1).await;
        assert_eq!(mgr.store.get("m1").await.unwrap().status, InitStatusKind::Error);
    }

    #[tokio::test]
    async fn wait_for_init_returns_immediately_when_no_state() {
        let (mgr, _dir) = manager();
        tokio::time::timeout(Duration::from_millis(200), mgr.wait_for_init("nope", None)).await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_init_returns_immediately_when_already_completed() {
        let (mgr, _dir) = manager();
        mgr.start_init("m1", "/hooks/init.sh").await;
        mgr.end_init("m1", 0).await;
        tokio::time::timeout(Duration::from_millis(200), mgr.wait_for_init("m1", None)).await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_init_unblocks_on_end_init() {
        let mgr = Arc::new(manager().0);
        mgr.start_init("m1", "/hooks/init.sh").await;
        mgr.enter_hook_phase("m1").await;
        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.wait_for_init("m1", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.end_init("m1", 0).await;
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn clear_in_memory_state_unblocks_waiters_without_touching_disk() {
        let mgr = Arc::new(manager().0);
        mgr.start_init("m1", "/hooks/init.sh").await;
        mgr.enter_hook_phase("m1").await;
        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.wait_for_init("m1", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.clear_in_memory_state("m1").await;
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        // disk state (if any had been written) would still say "running" — untouched.
        let status = mgr.store.get("m1").await.unwrap();
        assert_eq!(status.status, InitStatusKind::Running);
    }

    #[tokio::test]
    async fn replay_emits_start_outputs_and_end_in_order() {
        let (mgr, _dir) = manager();
        mgr.start_init("m1", "/hooks/init.sh").await;
        mgr.append_output("m1", "building", false).await;
        mgr.append_output("m1", "warning: x", true).await;
        mgr.end_init("m1", 0).await;

        let mut kinds = Vec::new();
        mgr.replay("m1", |event| {
            kinds.push(match event {
                InitEvent::Start { .. } => "start",
                InitEvent::Output { .. } => "output",
                InitEvent::End { .. } => "end",
            });
        })
        .await
        .unwrap();
        assert_eq!(kinds, vec!["start", "output", "output", "end"]);
    }

    #[tokio::test]
    async fn replay_of_incomplete_init_has_no_end_event() {
        let (mgr, _dir) = manager();
        mgr.start_init("m1", "/hooks/init.sh").await;
        let mut saw_end = false;
        mgr.replay("m1", |event| {
            if matches!(event, InitEvent::End { .. }) {
                saw_end = true;
            }
        })
        .await
        .unwrap();
        assert!(!saw_end);
    }
}
