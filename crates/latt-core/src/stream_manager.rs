// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The per-minion streaming state machine: owns at most one active stream,
//! assigns the placeholder's history position before any provider I/O, and
//! keeps `partial.json` and `chat.jsonl` consistent across normal
//! completion, provider errors, and cooperative abort.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use latt_model::{CompletionRequest, ErrorKind, Message, MessageMetadata, MessagePart, ModelProvider, ProviderEvent, Usage};
use tokio::sync::Mutex;

use crate::abort::{AbortController, AbortSignal};
use crate::history::HistoryStore;

#[derive(Debug, Clone)]
pub enum StreamEvent {
    StreamStart { message_id: String },
    StreamDelta { message_id: String, text: String },
    ToolCallStart { message_id: String, tool_call_id: String, name: String },
    ToolCallDelta { message_id: String, tool_call_id: String, arguments_fragment: String },
    ToolCallEnd { message_id: String, tool_call_id: String },
    ReasoningDelta { message_id: String, text: String },
    ReasoningEnd { message_id: String },
    UsageDelta { message_id: String, usage: Usage },
    StreamEnd { message_id: String, history_sequence: Option<u64> },
    StreamAbort { message_id: String, reason: String },
    Error { message_id: String, kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed { history_sequence: Option<u64> },
    Errored { kind: ErrorKind },
    Aborted { reason: String },
}

/// Classify a raw provider error string into the closed error taxonomy.
/// Real provider adapters are out of scope here; this only recognizes the
/// substrings the mock/test providers and error-path tests produce.
fn classify_error(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("context_length") || lower.contains("context window") || lower.contains("too many tokens") {
        ErrorKind::ContextExceeded
    } else if lower.contains("oauth") || lower.contains("not connected") {
        ErrorKind::OauthNotConnected
    } else if lower.contains("runtime not ready") {
        ErrorKind::RuntimeNotReady
    } else if lower.contains("runtime start") {
        ErrorKind::RuntimeStartFailed
    } else if lower.contains("policy_denied") || lower.contains("denied by policy") {
        ErrorKind::PolicyDenied
    } else {
        ErrorKind::Unknown
    }
}

/// Decide whether a previously recorded `previous_response_id` must be
/// treated as lost — i.e. the provider's own bookkeeping and the last
/// assistant message's recorded response id disagree, so resuming via
/// `previous_response_id` would silently desync history. Ties (both absent)
/// are "not lost": there is nothing to resume from either way.
pub fn is_response_id_lost(expected: Option<&str>, actual: Option<&str>) -> bool {
    match (expected, actual) {
        (None, None) => false,
        (Some(a), Some(b)) => a != b,
        _ => true,
    }
}

fn add_usage(a: Usage, b: Usage) -> Usage {
    Usage {
        input_tokens: a.input_tokens + b.input_tokens,
        output_tokens: a.output_tokens + b.output_tokens,
        cache_read_tokens: a.cache_read_tokens + b.cache_read_tokens,
        cache_write_tokens: a.cache_write_tokens + b.cache_write_tokens,
    }
}

struct ActiveStream {
    controller: AbortController,
    abandon_partial: AtomicBool,
}

pub struct StreamManager {
    history: Arc<HistoryStore>,
    active: Mutex<HashMap<String, ActiveStream>>,
}

impl StreamManager {
    pub fn new(history: Arc<HistoryStore>) -> Self {
        Self { history, active: Mutex::new(HashMap::new()) }
    }

    pub async fn is_active(&self, minion_id: &str) -> bool {
        self.active.lock().await.contains_key(minion_id)
    }

    /// Signal the active stream for `minion_id` (no-op if none). When
    /// `abandon_partial` is set, the in-flight placeholder and
    /// `partial.json` are discarded on abort rather than left for a later
    /// `resumeStream`.
    pub async fn stop_stream(&self, minion_id: &str, abandon_partial: bool, reason: &str) {
        if let Some(entry) = self.active.lock().await.get(minion_id) {
            entry.abandon_partial.store(abandon_partial, Ordering::SeqCst);
            entry.controller.abort();
        }
        let _ = reason;
    }

    /// Run one turn against `provider` for `minion_id`, emitting
    /// [`StreamEvent`]s to `emit` as they occur. Returns once the stream
    /// completes, errors, or is aborted.
    pub async fn run_stream(
        &self,
        minion_id: &str,
        provider: &dyn ModelProvider,
        request: CompletionRequest,
        mut emit: impl FnMut(StreamEvent),
    ) -> Result<StreamOutcome> {
        {
            let mut active = self.active.lock().await;
            if active.contains_key(minion_id) {
                return Err(anyhow!("stream already active for minion {minion_id}"));
            }
            active.insert(minion_id.to_string(), ActiveStream { controller: AbortController::new(), abandon_partial: AtomicBool::new(false) });
        }

        let mut abort_signal = {
            let active = self.active.lock().await;
            active.get(minion_id).expect("just inserted").controller.signal()
        };

        let placeholder = Message::assistant("").with_metadata(MessageMetadata { partial: Some(true), ..Default::default() });
        let message_id = placeholder.id.clone();

        // History position is assigned before any provider I/O (§4.8).
        self.history.append(minion_id, placeholder.clone()).await?;
        self.history.write_partial(minion_id, &placeholder).await?;
        emit(StreamEvent::StreamStart { message_id: message_id.clone() });

        let outcome = self.drive(minion_id, &message_id, provider, request, &mut abort_signal, &mut emit).await;

        self.active.lock().await.remove(minion_id);
        outcome
    }

    async fn drive(
        &self,
        minion_id: &str,
        message_id: &str,
        provider: &dyn ModelProvider,
        request: CompletionRequest,
        abort_signal: &mut AbortSignal,
        emit: &mut impl FnMut(StreamEvent),
    ) -> Result<StreamOutcome> {
        let mut response_stream = match provider.complete(request).await {
            Ok(s) => s,
            Err(e) => return self.fail(minion_id, message_id, "", "", &e.to_string(), emit).await,
        };

        let mut text = String::new();
        let mut reasoning = String::new();
        let mut usage_total = Usage::default();

        loop {
            tokio::select! {
                biased;
                _ = abort_signal.cancelled() => {
                    return self.abandon_or_keep(minion_id, message_id, emit).await;
                }
                next = response_stream.next() => {
                    let Some(item) = next else {
                        // Stream ended without an explicit `Done` — treat as
                        // completion of whatever was accumulated.
                        return self.finish(minion_id, message_id, &text, &reasoning, usage_total, emit).await;
                    };
                    match item {
                        Ok(ProviderEvent::TextDelta(chunk)) => {
                            text.push_str(&chunk);
                            emit(StreamEvent::StreamDelta { message_id: message_id.to_string(), text: chunk });
                            self.write_progress(minion_id, message_id, &text, &reasoning).await?;
                        }
                        Ok(ProviderEvent::ReasoningDelta(chunk)) => {
                            reasoning.push_str(&chunk);
                            emit(StreamEvent::ReasoningDelta { message_id: message_id.to_string(), text: chunk });
                        }
                        Ok(ProviderEvent::ReasoningEnd) => {
                            emit(StreamEvent::ReasoningEnd { message_id: message_id.to_string() });
                        }
                        Ok(ProviderEvent::ToolCallStart { id, name }) => {
                            emit(StreamEvent::ToolCallStart { message_id: message_id.to_string(), tool_call_id: id, name });
                        }
                        Ok(ProviderEvent::ToolCallDelta { id, arguments_fragment }) => {
                            emit(StreamEvent::ToolCallDelta { message_id: message_id.to_string(), tool_call_id: id, arguments_fragment });
                        }
                        Ok(ProviderEvent::ToolCallEnd { id }) => {
                            emit(StreamEvent::ToolCallEnd { message_id: message_id.to_string(), tool_call_id: id });
                        }
                        Ok(ProviderEvent::Usage(u)) => {
                            usage_total = add_usage(usage_total, u);
                            emit(StreamEvent::UsageDelta { message_id: message_id.to_string(), usage: u });
                        }
                        Ok(ProviderEvent::ResponseId(_)) => {}
                        Ok(ProviderEvent::Done) => {
                            return self.finish(minion_id, message_id, &text, &reasoning, usage_total, emit).await;
                        }
                        Ok(ProviderEvent::Error(msg)) => {
                            return self.fail(minion_id, message_id, &text, &reasoning, &msg, emit).await;
                        }
                        Err(e) => {
                            return self.fail(minion_id, message_id, &text, &reasoning, &e.to_string(), emit).await;
                        }
                    }
                }
            }
        }
    }

    async fn write_progress(&self, minion_id: &str, message_id: &str, text: &str, reasoning: &str) -> Result<()> {
        let mut parts = Vec::new();
        if !reasoning.is_empty() {
            parts.push(MessagePart::Reasoning { text: reasoning.to_string() });
        }
        parts.push(MessagePart::text(text));
        let mut partial = Message::assistant("");
        partial.id = message_id.to_string();
        partial.parts = parts;
        partial.metadata.partial = Some(true);
        self.history.write_partial(minion_id, &partial).await
    }

    /// Stream completed normally: finalize the placeholder content, then
    /// commit it (updates the history row in place, deletes `partial.json`).
    async fn finish(
        &self,
        minion_id: &str,
        message_id: &str,
        text: &str,
        reasoning: &str,
        usage: Usage,
        emit: &mut impl FnMut(StreamEvent),
    ) -> Result<StreamOutcome> {
        let mut parts = Vec::new();
        if !reasoning.is_empty() {
            parts.push(MessagePart::Reasoning { text: reasoning.to_string() });
        }
        parts.push(MessagePart::text(text));
        let mut finalized = Message::assistant("");
        finalized.id = message_id.to_string();
        finalized.parts = parts;
        finalized.metadata.usage = Some(usage);
        self.history.write_partial(minion_id, &finalized).await?;
        let seq = self.history.commit_partial(minion_id).await?;
        emit(StreamEvent::UsageDelta { message_id: message_id.to_string(), usage });
        emit(StreamEvent::StreamEnd { message_id: message_id.to_string(), history_sequence: seq });
        Ok(StreamOutcome::Completed { history_sequence: seq })
    }

    /// Provider-level failure: the placeholder is updated in place with
    /// whatever text/reasoning had accumulated plus `partial:true` and
    /// `error`/`error_type` metadata, so a crash or a later `resumeStream`
    /// has something to recover from rather than a placeholder with no
    /// record of why the stream stopped (§7).
    async fn fail(&self, minion_id: &str, message_id: &str, text: &str, reasoning: &str, message: &str, emit: &mut impl FnMut(StreamEvent)) -> Result<StreamOutcome> {
        let kind = classify_error(message);

        let mut parts = Vec::new();
        if !reasoning.is_empty() {
            parts.push(MessagePart::Reasoning { text: reasoning.to_string() });
        }
        parts.push(MessagePart::text(text));
        let mut partial = Message::assistant("");
        partial.id = message_id.to_string();
        partial.parts = parts;
        partial.metadata.partial = Some(true);
        partial.metadata.error = Some(message.to_string());
        partial.metadata.error_type = Some(kind);
        self.history.write_partial(minion_id, &partial).await?;

        emit(StreamEvent::Error { message_id: message_id.to_string(), kind, message: message.to_string() });
        Ok(StreamOutcome::Errored { kind })
    }

    async fn abandon_or_keep(&self, minion_id: &str, message_id: &str, emit: &mut impl FnMut(StreamEvent)) -> Result<StreamOutcome> {
        let abandon = {
            let active = self.active.lock().await;
            active.get(minion_id).map(|a| a.abandon_partial.load(Ordering::SeqCst)).unwrap_or(false)
        };
        if abandon {
            self.history.delete_partial(minion_id).await?;
            self.history.delete_message(minion_id, message_id).await?;
        }
        emit(StreamEvent::StreamAbort { message_id: message_id.to_string(), reason: "abort".to_string() });
        Ok(StreamOutcome::Aborted { reason: "abort".to_string() })
    }
}
