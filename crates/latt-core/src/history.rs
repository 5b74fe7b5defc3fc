// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Append-only per-minion message log plus the mutable partial slot.
//!
//! `chat.jsonl` holds one JSON message per line; `partial.json` holds the
//! single in-flight assistant message, if any. Both are rewritten via
//! write-to-temp-then-rename so a reader never observes a half-written file.

use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use latt_model::Message;
use tokio::sync::Mutex;

use crate::lock::MinionFileLocks;
use crate::minion::session_dir;

pub struct HistoryStore {
    root: PathBuf,
    locks: Arc<MinionFileLocks>,
}

fn chat_path(root: &Path, minion_id: &str) -> PathBuf {
    session_dir(root, minion_id).join("chat.jsonl")
}

fn partial_path(root: &Path, minion_id: &str) -> PathBuf {
    session_dir(root, minion_id).join("partial.json")
}

async fn read_jsonl(path: &Path) -> Result<Vec<Message>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str::<Message>(l).map(upgrade_legacy).with_context(|| format!("parsing {}", path.display())))
            .collect(),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

async fn write_jsonl_atomic(path: &Path, messages: &[Message]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut buf = String::new();
    for m in messages {
        buf.push_str(&serde_json::to_string(m)?);
        buf.push('\n');
    }
    let tmp = path.with_extension("jsonl.tmp");
    tokio::fs::write(&tmp, buf).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Rewrite fields from an older on-disk shape into the current one. There is
/// no prior wire format in this runtime yet, so this is currently the
/// identity function — kept as the single seam `read_jsonl`/`read_partial`
/// funnel through so a future rename only needs one edit.
fn upgrade_legacy(m: Message) -> Message {
    m
}

impl HistoryStore {
    pub fn new(root: PathBuf, locks: Arc<MinionFileLocks>) -> Self {
        Self { root, locks }
    }

    /// Assigns `metadata.history_sequence = maxPrior + 1` and returns it.
    pub async fn append(&self, minion_id: &str, mut msg: Message) -> Result<u64> {
        let root = self.root.clone();
        let minion_id_owned = minion_id.to_string();
        self.locks
            .with_lock(minion_id, move || async move {
                let path = chat_path(&root, &minion_id_owned);
                let mut all = read_jsonl(&path).await?;
                let next = all.last().and_then(|m| m.metadata.history_sequence).unwrap_or(0) + 1;
                msg.metadata.history_sequence = Some(next);
                all.push(msg);
                write_jsonl_atomic(&path, &all).await?;
                Ok(next)
            })
            .await
    }

    /// Replace the entry with the same `id`, preserving `history_sequence`.
    pub async fn update(&self, minion_id: &str, msg: Message) -> Result<()> {
        let root = self.root.clone();
        let minion_id_owned = minion_id.to_string();
        self.locks
            .with_lock(minion_id, move || async move {
                let path = chat_path(&root, &minion_id_owned);
                let mut all = read_jsonl(&path).await?;
                let Some(slot) = all.iter_mut().find(|m| m.id == msg.id) else {
                    bail!("not-found: message {} in minion {}", msg.id, minion_id_owned);
                };
                let preserved_seq = slot.metadata.history_sequence;
                *slot = msg;
                slot.metadata.history_sequence = preserved_seq;
                write_jsonl_atomic(&path, &all).await
            })
            .await
    }

    /// Remove the exact message `id`; tolerates absence.
    pub async fn delete_message(&self, minion_id: &str, id: &str) -> Result<()> {
        let root = self.root.clone();
        let minion_id_owned = minion_id.to_string();
        let id = id.to_string();
        self.locks
            .with_lock(minion_id, move || async move {
                let path = chat_path(&root, &minion_id_owned);
                let mut all = read_jsonl(&path).await?;
                all.retain(|m| m.id != id);
                write_jsonl_atomic(&path, &all).await
            })
            .await
    }

    /// Remove every entry strictly after `id`; `id` itself is retained.
    pub async fn truncate_after_message(&self, minion_id: &str, id: &str) -> Result<()> {
        let root = self.root.clone();
        let minion_id_owned = minion_id.to_string();
        let id = id.to_string();
        self.locks
            .with_lock(minion_id, move || async move {
                let path = chat_path(&root, &minion_id_owned);
                let mut all = read_jsonl(&path).await?;
                if let Some(idx) = all.iter().position(|m| m.id == id) {
                    all.truncate(idx + 1);
                }
                write_jsonl_atomic(&path, &all).await
            })
            .await
    }

    pub async fn full_history(&self, minion_id: &str) -> Result<Vec<Message>> {
        read_jsonl(&chat_path(&self.root, minion_id)).await
    }

    /// Discard every message for `minion_id`. Used when a turn gives up on
    /// recovering the current conversation (repeated context-window
    /// exhaustion) and must restart from a seeded summary instead.
    pub async fn clear(&self, minion_id: &str) -> Result<()> {
        let root = self.root.clone();
        let minion_id_owned = minion_id.to_string();
        self.locks
            .with_lock(minion_id, move || async move { write_jsonl_atomic(&chat_path(&root, &minion_id_owned), &[]).await })
            .await
    }

    /// The slice starting at the latest durable compaction boundary
    /// (`compaction_boundary=true ∧ compaction_epoch≥1`), or the full
    /// history if no durable boundary exists. A boundary with
    /// `compaction_epoch=0` is malformed and is ignored (§8 boundary law).
    pub async fn get_history_from_latest_boundary(&self, minion_id: &str) -> Result<Vec<Message>> {
        let all = self.full_history(minion_id).await?;
        let boundary_idx = all
            .iter()
            .enumerate()
            .rev()
            .find(|(_, m)| m.metadata.compaction_boundary == Some(true) && m.metadata.compaction_epoch.unwrap_or(0) >= 1)
            .map(|(idx, _)| idx);
        Ok(match boundary_idx {
            Some(idx) => all[idx..].to_vec(),
            None => all,
        })
    }

    /// Streaming read in chunks for rebuilds; `chunk_fn` is called once per
    /// chunk in the requested direction.
    pub async fn iterate_full_history<F>(&self, minion_id: &str, forward: bool, chunk_size: usize, mut chunk_fn: F) -> Result<()>
    where
        F: FnMut(&[Message]),
    {
        let mut all = self.full_history(minion_id).await?;
        if !forward {
            all.reverse();
        }
        for chunk in all.chunks(chunk_size.max(1)) {
            chunk_fn(chunk);
        }
        Ok(())
    }

    /// Writes go through the same per-minion lock as `chat.jsonl` mutations
    /// so a `commit_partial` merge and a concurrent progress write can never
    /// interleave and silently lose one side.
    pub async fn write_partial(&self, minion_id: &str, msg: &Message) -> Result<()> {
        let msg = msg.clone();
        let root = self.root.clone();
        let minion_id_owned = minion_id.to_string();
        self.locks.with_lock(minion_id, move || async move { write_partial_unlocked(&root, &minion_id_owned, &msg).await }).await
    }

    pub async fn read_partial(&self, minion_id: &str) -> Result<Option<Message>> {
        let root = self.root.clone();
        let minion_id_owned = minion_id.to_string();
        self.locks.with_lock(minion_id, move || async move { read_partial_unlocked(&root, &minion_id_owned).await }).await
    }

    pub async fn delete_partial(&self, minion_id: &str) -> Result<()> {
        let root = self.root.clone();
        let minion_id_owned = minion_id.to_string();
        self.locks.with_lock(minion_id, move || async move { delete_partial_unlocked(&root, &minion_id_owned).await }).await
    }

    /// Commit the partial slot atomically: if a placeholder with the same
    /// `id` already exists in history it is updated in place (preserving
    /// `history_sequence`); otherwise it is appended. An empty-content
    /// commit still deletes `partial.json` but is not written to history
    /// (§8 invariant 3: a committed message is present exactly once only
    /// when its content is non-empty).
    ///
    /// The read, the `chat.jsonl` merge and the final delete all run inside
    /// one lock acquisition — a concurrent `write_partial` (e.g. the
    /// streamer's own progress writer) can never land in the gap between
    /// reading the partial here and deleting it, which would otherwise drop
    /// that write on the floor without it ever reaching `chat.jsonl`.
    pub async fn commit_partial(&self, minion_id: &str) -> Result<Option<u64>> {
        let root = self.root.clone();
        let minion_id_owned = minion_id.to_string();
        self.locks
            .with_lock(minion_id, move || async move {
                let Some(partial) = read_partial_unlocked(&root, &minion_id_owned).await? else {
                    return Ok(None);
                };
                let is_empty = partial.parts.is_empty() || partial.parts.iter().all(|p| p.as_text().map(str::is_empty).unwrap_or(false));

                let seq = if is_empty {
                    None
                } else {
                    let path = chat_path(&root, &minion_id_owned);
                    let mut all = read_jsonl(&path).await?;
                    let seq = if let Some(slot) = all.iter_mut().find(|m| m.id == partial.id) {
                        let preserved = slot.metadata.history_sequence;
                        *slot = partial;
                        slot.metadata.history_sequence = preserved;
                        preserved.unwrap_or(0)
                    } else {
                        let next = all.last().and_then(|m| m.metadata.history_sequence).unwrap_or(0) + 1;
                        let mut partial = partial;
                        partial.metadata.history_sequence = Some(next);
                        all.push(partial);
                        next
                    };
                    write_jsonl_atomic(&path, &all).await?;
                    Some(seq)
                };
                delete_partial_unlocked(&root, &minion_id_owned).await?;
                Ok(seq)
            })
            .await
    }
}

async fn write_partial_unlocked(root: &Path, minion_id: &str, msg: &Message) -> Result<()> {
    let path = partial_path(root, minion_id);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_string(msg)?).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

async fn read_partial_unlocked(root: &Path, minion_id: &str) -> Result<Option<Message>> {
    let path = partial_path(root, minion_id);
    match tokio::fs::read_to_string(&path).await {
        Ok(contents) => Ok(Some(upgrade_legacy(serde_json::from_str(&contents)?))),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn delete_partial_unlocked(root: &Path, minion_id: &str) -> Result<()> {
    let path = partial_path(root, minion_id);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub type MinionId = String;

/// In-process cache of loaded histories, used by components that want to
/// avoid re-reading disk on every event (e.g. `MessagePipeline`). Not
/// required for correctness — `HistoryStore` itself is always authoritative.
#[derive(Default)]
pub struct HistoryCache {
    entries: Mutex<HashMap<MinionId, Vec<Message>>>,
}

impl HistoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_load<F, Fut>(&self, minion_id: &str, load: F) -> Result<Vec<Message>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<Message>>>,
    {
        let mut entries = self.entries.lock().await;
        if let Some(cached) = entries.get(minion_id) {
            return Ok(cached.clone());
        }
        let loaded = load().await?;
        entries.insert(minion_id.to_string(), loaded.clone());
        Ok(loaded)
    }

    pub async fn invalidate(&self, minion_id: &str) {
        self.entries.lock().await.remove(minion_id);
    }
}
