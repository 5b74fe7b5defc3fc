// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-minion conversation lifecycle: appending/editing user turns, driving
//! [`AIService`] through a turn with context-window recovery, resuming an
//! interrupted stream, and tearing everything down once on dispose.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use latt_config::{McpServerConfig, ToolPolicy};
use latt_model::{ErrorKind, Message, MessageMetadata, MessagePart, ModelProvider};
use tokio::sync::Mutex;

use crate::ai_service::{AIService, TurnError, TurnRequest};
use crate::history::HistoryStore;
use crate::message_pipeline::{Attachment, PipelineOptions};
use crate::minion::Minion;
use crate::stream_manager::{StreamEvent, StreamOutcome};
use crate::stream_sim::SimulationHooks;

const CONTINUATION_NOTICE_TEXT: &str =
    "The previous conversation exceeded the model's context window twice in a row and was restarted. Continue from the task description and any seed messages below.";

fn synthetic_continuation_notice() -> Message {
    Message::system(CONTINUATION_NOTICE_TEXT).with_metadata(MessageMetadata { synthetic: Some(true), ui_visible: Some(true), ..Default::default() })
}

/// Owns one minion's conversation: the message log, the in-flight turn, and
/// whatever file-change attachments a completed tool call queued for the
/// next payload build.
pub struct AgentSession {
    minion: Minion,
    ai: Arc<AIService>,
    history: Arc<HistoryStore>,
    disposed: AtomicBool,
    context_exceeded_in_turn: AtomicU32,
    pending_file_changes: Mutex<Vec<Attachment>>,
    pending_post_compaction_attachment: Mutex<Option<Attachment>>,
}

impl AgentSession {
    pub fn new(minion: Minion, ai: Arc<AIService>, history: Arc<HistoryStore>) -> Self {
        Self {
            minion,
            ai,
            history,
            disposed: AtomicBool::new(false),
            context_exceeded_in_turn: AtomicU32::new(0),
            pending_file_changes: Mutex::new(Vec::new()),
            pending_post_compaction_attachment: Mutex::new(None),
        }
    }

    pub fn minion_id(&self) -> &str {
        &self.minion.id
    }

    fn ensure_not_disposed(&self) -> Result<(), TurnError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(TurnError::Other(anyhow!("session for minion {} has been disposed", self.minion.id)));
        }
        Ok(())
    }

    /// Append a new user turn.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<u64, TurnError> {
        self.ensure_not_disposed()?;
        Ok(self.history.append(&self.minion.id, Message::user(text)).await?)
    }

    /// Replace everything after `anchor_message_id` with a new user turn,
    /// optionally carrying forward prior image/file attachments (pass an
    /// empty vec to drop them).
    pub async fn edit_message(&self, anchor_message_id: &str, text: impl Into<String>, carried_attachments: Vec<MessagePart>) -> Result<u64, TurnError> {
        self.ensure_not_disposed()?;
        self.history.truncate_after_message(&self.minion.id, anchor_message_id).await?;
        let mut msg = Message::user(text);
        msg.parts.extend(carried_attachments.into_iter().filter(|p| matches!(p, MessagePart::File { .. })));
        Ok(self.history.append(&self.minion.id, msg).await?)
    }

    /// Queue a file-change notice to be injected as a synthetic attachment on
    /// the next payload build. Invoked by the caller when a `ToolCallEnd`
    /// event's tool name matches the file-editing tool family — `StreamEvent`
    /// only carries the tool call id, so the caller (which already tracks
    /// id→name from `ToolCallStart`) is responsible for this match.
    pub async fn note_tool_call_end(&self, tool_name: &str, change_summary: impl Into<String>) {
        if tool_name.starts_with("file_edit_") {
            self.pending_file_changes.lock().await.push(Attachment { text: change_summary.into() });
        }
    }

    pub async fn set_post_compaction_attachment(&self, attachment: Attachment) {
        *self.pending_post_compaction_attachment.lock().await = Some(attachment);
    }

    /// Run one turn, handling context-window exhaustion per occurrence:
    /// retry once with the post-compaction attachment dropped if one was
    /// present on the failed attempt; otherwise, for a sidekick that hasn't
    /// already been hard-restarted this turn, reset its history behind a
    /// continuation notice and retry with that notice carried as a one-shot
    /// system instruction; otherwise give up and surface the error.
    pub async fn run_turn(
        &self,
        requested_agent_id: Option<&str>,
        caller_policy: Option<ToolPolicy>,
        system_policy: Option<ToolPolicy>,
        enabled_mcp_servers: Vec<McpServerConfig>,
        provider: &dyn ModelProvider,
        mut emit: impl FnMut(StreamEvent),
    ) -> Result<StreamOutcome, TurnError> {
        self.ensure_not_disposed()?;
        self.context_exceeded_in_turn.store(0, Ordering::SeqCst);

        let mut hard_restart_done = false;
        let mut additional_system_instructions: Option<String> = None;

        loop {
            let post_compaction_attachment = self.pending_post_compaction_attachment.lock().await.take();
            let had_post_compaction_attachment = post_compaction_attachment.is_some();
            let pipeline_opts = PipelineOptions {
                post_compaction_attachment,
                file_change_attachments: std::mem::take(&mut *self.pending_file_changes.lock().await),
                additional_system_instructions: additional_system_instructions.take(),
                ..Default::default()
            };

            let req = TurnRequest {
                minion: &self.minion,
                requested_agent_id,
                caller_policy: caller_policy.clone(),
                system_policy: system_policy.clone(),
                enabled_mcp_servers: enabled_mcp_servers.clone(),
                pipeline_opts,
                hooks: SimulationHooks::default(),
            };
            let outcome = self.ai.run_turn(req, provider, &mut emit).await?;

            let StreamOutcome::Errored { kind: ErrorKind::ContextExceeded } = outcome else {
                return Ok(outcome);
            };

            self.discard_latest_partial().await?;
            self.context_exceeded_in_turn.fetch_add(1, Ordering::SeqCst);

            if had_post_compaction_attachment {
                // The just-discarded partial already dropped the attachment
                // itself; retry once with a clean payload.
                continue;
            }

            if !hard_restart_done && self.minion.is_sidekick() {
                // Assumed stuck in a runaway loop with no compaction
                // attachment to fall back on: reset history behind a
                // continuation notice, preserving the seed messages after it,
                // and retry once with the same notice as a system
                // instruction. Only ever taken once per turn.
                hard_restart_done = true;
                let preserved = self.history.full_history(&self.minion.id).await?;
                self.history.clear(&self.minion.id).await?;
                self.history.append(&self.minion.id, synthetic_continuation_notice()).await?;
                for msg in preserved {
                    self.history.append(&self.minion.id, msg).await?;
                }
                additional_system_instructions = Some(CONTINUATION_NOTICE_TEXT.to_string());
                continue;
            }

            // Neither condition applies (no attachment to drop and either
            // not a sidekick or already hard-restarted this turn): give up.
            return Ok(outcome);
        }
    }

    /// Resume a stream left partial by a crash or abort. Errors if there is
    /// no partial to resume — `run_turn` already injects the `[CONTINUE]`
    /// sentinel for a partial message surviving in the boundary slice, so
    /// resuming is just running another turn.
    pub async fn resume_stream(
        &self,
        requested_agent_id: Option<&str>,
        caller_policy: Option<ToolPolicy>,
        system_policy: Option<ToolPolicy>,
        enabled_mcp_servers: Vec<McpServerConfig>,
        provider: &dyn ModelProvider,
        emit: impl FnMut(StreamEvent),
    ) -> Result<StreamOutcome, TurnError> {
        self.ensure_not_disposed()?;
        if self.history.read_partial(&self.minion.id).await?.is_none() {
            return Err(TurnError::Other(anyhow!("history is empty")));
        }
        self.run_turn(requested_agent_id, caller_policy, system_policy, enabled_mcp_servers, provider, emit).await
    }

    async fn discard_latest_partial(&self) -> Result<(), TurnError> {
        if let Some(partial) = self.history.read_partial(&self.minion.id).await? {
            self.history.delete_partial(&self.minion.id).await?;
            self.history.delete_message(&self.minion.id, &partial.id).await?;
        }
        Ok(())
    }

    /// Stop any in-flight stream, cancel outstanding delegated tool calls,
    /// and mark the session unusable. Safe to call more than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ai.stop_turn(&self.minion.id, true, "session disposed").await;
        self.ai.cancel_all_delegated_tool_calls(&self.minion.id, "session disposed");
    }
}
