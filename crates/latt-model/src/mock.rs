// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{catalog::InputModality, provider::ResponseStream, CompletionRequest, ProviderEvent, Usage};

/// Deterministic mock provider for tests. Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::Role::User))
            .and_then(|m| m.as_text())
            .unwrap_or("[no input]")
            .to_string();

        let events: Vec<anyhow::Result<ProviderEvent>> = vec![
            Ok(ProviderEvent::TextDelta(format!("MOCK: {reply}"))),
            Ok(ProviderEvent::Usage(Usage { input_tokens: 10, output_tokens: 10, ..Default::default() })),
            Ok(ProviderEvent::Done),
        ];
        Ok(Box::pin(stream::iter(events)))
    }
}

/// A pre-scripted mock provider. Each call to `complete` pops the next
/// response script from the front of the queue. This lets tests drive exact
/// event sequences — including tool calls and mid-stream errors — without
/// network access, which is how the runtime's context-exceeded retry and
/// sidekick-restart paths are exercised in tests.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<Vec<ProviderEvent>>>>,
    name: String,
    modalities: Vec<InputModality>,
    /// The last `CompletionRequest` seen by this provider, so tests can
    /// inspect what the pipeline actually sent (sentinel injection, boundary
    /// slicing, etc).
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
    pub call_count: Arc<Mutex<u32>>,
}

impl ScriptedMockProvider {
    pub fn new(scripts: Vec<Vec<ProviderEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            name: "scripted-mock".into(),
            modalities: vec![InputModality::Text],
            last_request: Arc::new(Mutex::new(None)),
            call_count: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_vision(mut self) -> Self {
        self.modalities = vec![InputModality::Text, InputModality::Image];
        self
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![vec![
            ProviderEvent::TextDelta(r),
            ProviderEvent::Usage(Usage { input_tokens: 5, output_tokens: 5, ..Default::default() }),
            ProviderEvent::Done,
        ]])
    }

    /// Convenience: provider whose first call fails with a context-window
    /// error, and whose second call (after compaction) succeeds.
    pub fn context_exceeded_then_text(final_text: impl Into<String>) -> Self {
        Self::new(vec![
            vec![ProviderEvent::Error("context_length_exceeded".into())],
            vec![ProviderEvent::TextDelta(final_text.into()), ProviderEvent::Done],
        ])
    }

    /// Convenience: provider that returns a tool call followed by a text reply.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        let id = tool_id.into();
        Self::new(vec![
            vec![
                ProviderEvent::ToolCallStart { id: id.clone(), name: tool_name.into() },
                ProviderEvent::ToolCallDelta { id: id.clone(), arguments_fragment: args_json.into() },
                ProviderEvent::ToolCallEnd { id },
                ProviderEvent::Done,
            ],
            vec![ProviderEvent::TextDelta(final_text.into()), ProviderEvent::Done],
        ])
    }
}

#[async_trait]
impl crate::ModelProvider for ScriptedMockProvider {
    fn name(&self) -> &str {
        &self.name
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    fn input_modalities(&self) -> Vec<InputModality> {
        self.modalities.clone()
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        *self.last_request.lock().unwrap() = Some(req);
        *self.call_count.lock().unwrap() += 1;
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                vec![ProviderEvent::TextDelta("[no more scripts]".into()), ProviderEvent::Done]
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<ProviderEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
