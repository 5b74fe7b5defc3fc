// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub args: Value,
}

/// A single content item in a rich tool output.
#[derive(Debug, Clone)]
pub enum ToolOutputPart {
    Text(String),
    /// Base64 data URL: `data:<mime>;base64,<b64>`.
    Image(String),
}

/// The result of executing a tool.
///
/// `content` is always the plain-text representation of the output (the
/// concatenation of all `Text` parts), so callers that only care about text
/// never need to match on `parts`.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    pub parts: Vec<ToolOutputPart>,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let text = content.into();
        Self { call_id: call_id.into(), content: text.clone(), parts: vec![ToolOutputPart::Text(text)], is_error: false }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        let text = msg.into();
        Self { call_id: call_id.into(), content: text.clone(), parts: vec![ToolOutputPart::Text(text)], is_error: true }
    }

    /// Result with arbitrary parts (text and/or images). `content` is set to
    /// the concatenation of all Text parts.
    pub fn with_parts(call_id: impl Into<String>, parts: Vec<ToolOutputPart>) -> Self {
        let text = parts
            .iter()
            .filter_map(|p| match p {
                ToolOutputPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self { call_id: call_id.into(), content: text, parts, is_error: false }
    }

    pub fn has_images(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, ToolOutputPart::Image(_)))
    }
}

/// Describes the shape of a tool's text output for context-aware truncation.
///
/// When a tool result exceeds the configured token cap, the compaction
/// layer uses this category to pick the right extraction strategy rather
/// than hard-coding tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Keep the first 60 + last 40 lines so both the command preamble and
    /// the final result survive truncation. Suitable for process output.
    HeadTail,
    /// Keep the leading matches so the model sees the highest-relevance
    /// results first. Suitable for ordered match lists.
    MatchList,
    /// Keep a head and tail window with a separator. Suitable for file
    /// content, where both the top (imports/declarations) and the bottom
    /// (recent edits) matter.
    FileContent,
    /// Hard-truncate at the character boundary.
    #[default]
    Generic,
}

/// Trait that every tool exposed to a minion must implement.
///
/// Concrete tools (filesystem access, shell execution, web search, ...) are
/// supplied by the embedding application; this crate only defines the seam
/// and the dispatch/policy machinery around it.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters.
    fn parameters_schema(&self) -> Value;
    /// Describes the shape of this tool's output for context-aware
    /// truncation. Default is [`OutputCategory::Generic`].
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    /// Execute the tool. Errors should be wrapped in [`ToolOutput::err`]
    /// rather than propagated, so a failing tool call becomes a message in
    /// history instead of aborting the turn.
    async fn execute(&self, call: &ToolCall) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
