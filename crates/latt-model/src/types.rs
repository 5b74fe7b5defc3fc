// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

// ─── Roles ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

// ─── Message parts ──────────────────────────────────────────────────────────

/// One segment of a message's content.
///
/// A message is a sequence of parts rather than a single string so that a
/// single assistant turn can carry interleaved text, reasoning, and tool
/// calls, and a tool-call part can later be mutated in place once its result
/// lands (see [`MessagePart::DynamicTool`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    /// Extended-thinking / reasoning content. Collapsed by default in UIs.
    Reasoning {
        text: String,
    },
    /// A tool invocation whose result may not have arrived yet. `result` is
    /// `None` while the call is pending — e.g. waiting on a delegated tool
    /// call answered out of band.
    DynamicTool {
        tool_call_id: String,
        tool_name: String,
        /// JSON-encoded argument object.
        arguments_json: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    File {
        path: String,
        mime_type: String,
        /// Base64-encoded bytes, or `None` when only a path reference is kept.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Approximate token count used for context management (4 chars/token).
    pub fn approx_tokens(&self) -> usize {
        let chars = match self {
            Self::Text { text } => text.len(),
            Self::Reasoning { text } => text.len(),
            Self::DynamicTool { tool_name, arguments_json, result, .. } => {
                tool_name.len() + arguments_json.len() + result.as_deref().map(str::len).unwrap_or(0)
            }
            Self::File { path, .. } => path.len(),
        };
        (chars / 4).max(1)
    }
}

// ─── Error taxonomy ─────────────────────────────────────────────────────────

/// The closed set of failure categories a turn can end in.
///
/// Mirrors the taxonomy consulted by retry/restart logic: only
/// `ContextExceeded` triggers the automatic compact-and-retry path, only
/// `RuntimeNotReady` / `RuntimeStartFailed` trigger a sidekick hard-restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unknown,
    ContextExceeded,
    OauthNotConnected,
    RuntimeNotReady,
    RuntimeStartFailed,
    PolicyDenied,
    Abort,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ContextExceeded | Self::RuntimeNotReady | Self::RuntimeStartFailed)
    }
}

/// Whether a compaction boundary message was produced by an explicit user
/// action or by the automatic context-exceeded retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactedKind {
    User,
    Auto,
}

// ─── Message metadata ───────────────────────────────────────────────────────

/// Out-of-band bookkeeping carried alongside a message's content.
///
/// Every field is optional: a freshly constructed user message has none of
/// them set, and most are populated only as the message moves through the
/// pipeline (sequence assignment on append, usage/compaction flags on
/// finalize).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// Monotonic position assigned atomically on append to a history store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// `true` while this message is the single in-flight assistant slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted: Option<CompactedKind>,
    /// Marks this message as a durable compaction boundary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction_boundary: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction_epoch: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Injected by the pipeline rather than produced by the model or user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic: Option<bool>,
    /// `false` hides a message from rendering while keeping it in history
    /// (e.g. sentinel/system bookkeeping messages).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_visible: Option<bool>,
}

// ─── Message ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<MessagePart>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    fn new(role: Role, parts: Vec<MessagePart>) -> Self {
        Self { id: uuid::Uuid::new_v4().to_string(), role, parts, metadata: MessageMetadata::default() }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![MessagePart::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![MessagePart::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![MessagePart::text(text)])
    }

    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Return the plain text of this message if it has exactly one text part.
    pub fn as_text(&self) -> Option<&str> {
        match self.parts.as_slice() {
            [MessagePart::Text { text }] => Some(text),
            _ => None,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.metadata.partial.unwrap_or(false)
    }

    pub fn is_compaction_boundary(&self) -> bool {
        self.metadata.compaction_boundary.unwrap_or(false)
    }

    /// Approximate token count across all parts, used for context management.
    pub fn approx_tokens(&self) -> usize {
        self.parts.iter().map(MessagePart::approx_tokens).sum::<usize>().max(1)
    }
}

// ─── Tool schema ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
}

// ─── Completion request / usage ─────────────────────────────────────────────

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub stream: bool,
    /// Dynamic context (git/CI notes, etc.) appended outside the cached
    /// portion of the system prompt.
    pub system_dynamic_suffix: Option<String>,
    /// Provider-assigned id of a prior response, threaded through so stateful
    /// providers can resume without resending full history.
    pub previous_response_id: Option<String>,
    /// Stable key used to steer provider-side prompt caching across turns of
    /// the same minion.
    pub prompt_cache_key: Option<String>,
}

/// Token usage from one turn.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Tokens served from the provider's prompt cache (read hit).
    pub cache_read_tokens: u32,
    /// Tokens written into the provider's prompt cache (write/creation).
    pub cache_write_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u64 {
        (self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_write_tokens) as u64
    }
}

// ─── Provider-level streamed events ─────────────────────────────────────────

/// A single event streamed from a [`crate::ModelProvider`].
///
/// Lower-level than the minion-scoped stream events a runtime publishes to
/// clients: this carries no minion or message identity, only what the
/// provider itself emitted during one `complete()` call.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    TextDelta(String),
    ReasoningDelta(String),
    ReasoningEnd,
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, arguments_fragment: String },
    ToolCallEnd { id: String },
    Usage(Usage),
    /// Provider-assigned id for this response, used as the next turn's
    /// `previous_response_id`.
    ResponseId(String),
    Done,
    Error(String),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
