// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Generic in-memory-plus-disk replayable event buffer.
//!
//! Holds one `State` per key and a pure `State -> Event[]` serializer.
//! [`InitStateManager`](crate::init_state::InitStateManager) and the stream
//! replay path both build on this rather than rolling their own
//! load-then-emit logic.

use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;

pub struct EventStore<S> {
    states: Mutex<HashMap<String, S>>,
}

impl<S> Default for EventStore<S> {
    fn default() -> Self {
        Self { states: Mutex::new(HashMap::new()) }
    }
}

impl<S> EventStore<S>
where
    S: Clone + Serialize + DeserializeOwned,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<S> {
        self.states.lock().await.get(key).cloned()
    }

    pub async fn put(&self, key: &str, state: S) {
        self.states.lock().await.insert(key.to_string(), state);
    }

    pub async fn remove(&self, key: &str) {
        self.states.lock().await.remove(key);
    }

    /// Persist `state` to `path` unless `should_write` returns `false` — used
    /// to avoid recreating a session directory that was deleted out from
    /// under a queued write.
    pub async fn persist(&self, path: &PathBuf, state: &S, should_write: impl FnOnce() -> bool) -> Result<()> {
        if !should_write() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string(state)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn load_from_disk(&self, path: &PathBuf) -> Result<Option<S>> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Prefer the in-memory state; fall back to `path` on disk. Either way,
    /// run `serializer` over the resolved state and hand each produced event
    /// to `emit`, in order.
    pub async fn replay<E>(&self, key: &str, path: &PathBuf, serializer: impl Fn(&S) -> Vec<E>, mut emit: impl FnMut(E)) -> Result<()> {
        let state = match self.get(key).await {
            Some(s) => Some(s),
            None => self.load_from_disk(path).await?,
        };
        if let Some(state) = state {
            for event in serializer(&state) {
                emit(event);
            }
        }
        Ok(())
    }
}
