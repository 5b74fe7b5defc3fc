// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Pure functions turning a minion's boundary-sliced history into the
//! payload a provider actually sees. No I/O, no mutation of history — every
//! function here takes messages in and returns messages (or a derived value)
//! out, so `AgentSession` and the provider-options builder can run it twice
//! on the same input and get the same answer.

use std::collections::HashSet;

use latt_model::{Message, MessageMetadata, MessagePart, Role};

pub const CONTINUE_SENTINEL: &str = "[CONTINUE]";

/// Which provider family is receiving the payload — changes a handful of
/// shape decisions (reasoning-part retention, cache-TTL hints).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFamily {
    Anthropic,
    OpenAi,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingMode {
    Off,
    Low,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunModeTransition {
    None,
    PlanToExec,
}

/// A file-change or post-compaction attachment injected as a synthetic
/// system message ahead of the live payload.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub text: String,
}

#[derive(Debug, Default)]
pub struct PipelineOptions {
    pub provider: Option<ProviderFamily>,
    pub thinking: ThinkingMode,
    pub transition: RunModeTransition,
    pub post_compaction_attachment: Option<Attachment>,
    pub file_change_attachments: Vec<Attachment>,
    /// One-shot system instruction for this payload only — e.g. the sidekick
    /// hard-restart notice accompanying the retry that follows it.
    pub additional_system_instructions: Option<String>,
}

impl Default for ThinkingMode {
    fn default() -> Self {
        ThinkingMode::Off
    }
}

impl Default for RunModeTransition {
    fn default() -> Self {
        RunModeTransition::None
    }
}

/// Drop empty assistant messages, keeping reasoning-only assistant turns
/// only for Anthropic with thinking enabled (step 1).
fn drop_empty_assistant(messages: Vec<Message>, provider: Option<ProviderFamily>, thinking: ThinkingMode) -> Vec<Message> {
    let preserve_reasoning_only = matches!(provider, Some(ProviderFamily::Anthropic)) && thinking != ThinkingMode::Off;
    messages
        .into_iter()
        .filter(|m| {
            if m.role != Role::Assistant {
                return true;
            }
            let has_text = m.parts.iter().any(|p| matches!(p, MessagePart::Text { text } if !text.is_empty()));
            let has_reasoning = m.parts.iter().any(|p| matches!(p, MessagePart::Reasoning { text } if !text.is_empty()));
            let has_tool_call = m.parts.iter().any(|p| matches!(p, MessagePart::DynamicTool { .. }));
            if has_text || has_tool_call {
                return true;
            }
            has_reasoning && preserve_reasoning_only
        })
        .collect()
}

/// Step 3: for OpenAI, reasoning parts are kept (the provider reconstructs
/// chain-of-thought via `previous_response_id`); other providers drop them
/// from the outgoing payload since they resend full history each turn.
fn strip_reasoning_unless_openai(messages: Vec<Message>, provider: Option<ProviderFamily>) -> Vec<Message> {
    if provider == Some(ProviderFamily::OpenAi) {
        return messages;
    }
    messages
        .into_iter()
        .map(|mut m| {
            m.parts.retain(|p| !matches!(p, MessagePart::Reasoning { .. }));
            m
        })
        .collect()
}

/// Step 4: a message still marked `partial` in the slice (a crash-recovered
/// in-flight turn) gets a `[CONTINUE]` sentinel appended so the provider is
/// told to resume rather than restart the thought.
fn inject_continue_sentinel(mut messages: Vec<Message>) -> Vec<Message> {
    for m in messages.iter_mut() {
        if m.metadata.partial == Some(true) {
            m.parts.push(MessagePart::text(CONTINUE_SENTINEL));
        }
    }
    messages
}

/// Step 5: a plan→exec transition needs an explicit instruction so the model
/// doesn't keep proposing instead of acting.
fn inject_plan_transition(mut messages: Vec<Message>, transition: RunModeTransition) -> Vec<Message> {
    if transition == RunModeTransition::PlanToExec {
        messages.push(synthetic_system("The plan has been approved. Execute it now instead of proposing further plans."));
    }
    messages
}

fn synthetic_system(text: &str) -> Message {
    Message::system(text).with_metadata(MessageMetadata { synthetic: Some(true), ui_visible: Some(false), ..Default::default() })
}

/// Step 6: append attachments (post-compaction summary first, then
/// file-change notices) as synthetic, hidden system messages.
fn inject_attachments(mut messages: Vec<Message>, post_compaction: Option<&Attachment>, file_changes: &[Attachment]) -> Vec<Message> {
    if let Some(a) = post_compaction {
        messages.push(synthetic_system(&a.text));
    }
    for a in file_changes {
        messages.push(synthetic_system(&a.text));
    }
    messages
}

/// Step 6b: a one-shot system instruction tacked on for this payload only —
/// appended after attachments since it speaks to the current retry, not the
/// conversation state the attachments describe.
fn inject_additional_system_instructions(mut messages: Vec<Message>, instructions: Option<&str>) -> Vec<Message> {
    if let Some(text) = instructions {
        messages.push(synthetic_system(text));
    }
    messages
}

/// Step 7: the set of tool names the pipeline itself injected meaning into
/// (sentinel content) — used downstream to detect an agent-transition turn
/// without re-deriving it from raw text.
fn sentinel_tool_names(agent_policy_required: &[String]) -> HashSet<String> {
    agent_policy_required.iter().cloned().collect()
}

/// Run the full seven-step pipeline against a boundary-sliced `messages`
/// (the caller is responsible for slicing via
/// [`crate::history::HistoryStore::get_history_from_latest_boundary`] BEFORE
/// calling this — the ordering is contractual, not enforced here, so both
/// this function and a `previous_response_id` lookup over the same slice
/// see identical input).
pub fn build_payload(messages: Vec<Message>, opts: &PipelineOptions, required_tool_names: &[String]) -> (Vec<Message>, HashSet<String>) {
    let messages = drop_empty_assistant(messages, opts.provider, opts.thinking);
    let messages = strip_reasoning_unless_openai(messages, opts.provider);
    let messages = inject_continue_sentinel(messages);
    let messages = inject_plan_transition(messages, opts.transition);
    let messages = inject_attachments(messages, opts.post_compaction_attachment.as_ref(), &opts.file_change_attachments);
    let messages = inject_additional_system_instructions(messages, opts.additional_system_instructions.as_deref());
    let sentinels = sentinel_tool_names(required_tool_names);
    (messages, sentinels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use latt_model::MessageMetadata;

    fn empty_assistant() -> Message {
        Message::assistant("")
    }

    fn with_parts(role: Role, parts: Vec<MessagePart>) -> Message {
        let mut m = Message::user("");
        m.role = role;
        m.parts = parts;
        m
    }

    fn reasoning_only_assistant() -> Message {
        with_parts(Role::Assistant, vec![MessagePart::Reasoning { text: "thinking...".into() }])
    }

    #[test]
    fn drop_empty_assistant_removes_truly_empty_messages() {
        let messages = vec![Message::user("hi"), empty_assistant()];
        let out = drop_empty_assistant(messages, None, ThinkingMode::Off);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn drop_empty_assistant_keeps_reasoning_only_for_anthropic_with_thinking() {
        let messages = vec![reasoning_only_assistant()];
        let out = drop_empty_assistant(messages, Some(ProviderFamily::Anthropic), ThinkingMode::High);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn drop_empty_assistant_discards_reasoning_only_without_anthropic_thinking() {
        let messages = vec![reasoning_only_assistant()];
        let out = drop_empty_assistant(messages, Some(ProviderFamily::OpenAi), ThinkingMode::High);
        assert!(out.is_empty());
    }

    #[test]
    fn strip_reasoning_keeps_parts_for_openai_only() {
        let m = with_parts(Role::Assistant, vec![MessagePart::Reasoning { text: "x".into() }, MessagePart::text("y")]);
        let openai = strip_reasoning_unless_openai(vec![m.clone()], Some(ProviderFamily::OpenAi));
        assert_eq!(openai[0].parts.len(), 2);

        let anthropic = strip_reasoning_unless_openai(vec![m], Some(ProviderFamily::Anthropic));
        assert_eq!(anthropic[0].parts.len(), 1);
    }

    #[test]
    fn inject_continue_sentinel_only_touches_partial_messages() {
        let partial = Message::assistant("streaming").with_metadata(MessageMetadata { partial: Some(true), ..Default::default() });
        let done = Message::assistant("final");
        let out = inject_continue_sentinel(vec![partial, done]);
        assert!(out[0].parts.iter().any(|p| p.as_text() == Some(CONTINUE_SENTINEL)));
        assert!(!out[1].parts.iter().any(|p| p.as_text() == Some(CONTINUE_SENTINEL)));
    }

    #[test]
    fn inject_plan_transition_appends_instruction_on_plan_to_exec() {
        let out = inject_plan_transition(vec![Message::user("go")], RunModeTransition::PlanToExec);
        assert_eq!(out.len(), 2);
        assert_eq!(out.last().unwrap().metadata.synthetic, Some(true));
    }

    #[test]
    fn inject_plan_transition_noop_without_transition() {
        let out = inject_plan_transition(vec![Message::user("go")], RunModeTransition::None);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn inject_attachments_orders_post_compaction_before_file_changes() {
        let post = Attachment { text: "compacted summary".into() };
        let changes = vec![Attachment { text: "edited foo.rs".into() }];
        let out = inject_attachments(vec![Message::user("go")], Some(&post), &changes);
        assert_eq!(out[1].as_text(), Some("compacted summary"));
        assert_eq!(out[2].as_text(), Some("edited foo.rs"));
    }

    #[test]
    fn inject_additional_system_instructions_appends_when_present() {
        let out = inject_additional_system_instructions(vec![Message::user("go")], Some("restart notice"));
        assert_eq!(out.last().unwrap().as_text(), Some("restart notice"));
        assert_eq!(out.last().unwrap().metadata.synthetic, Some(true));
    }

    #[test]
    fn inject_additional_system_instructions_noop_without_instructions() {
        let out = inject_additional_system_instructions(vec![Message::user("go")], None);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn build_payload_runs_all_steps_in_order() {
        let partial = Message::assistant("partial reply").with_metadata(MessageMetadata { partial: Some(true), ..Default::default() });
        let opts = PipelineOptions {
            provider: Some(ProviderFamily::Anthropic),
            thinking: ThinkingMode::Off,
            transition: RunModeTransition::PlanToExec,
            post_compaction_attachment: None,
            file_change_attachments: vec![],
            additional_system_instructions: None,
        };
        let (messages, sentinels) = build_payload(vec![Message::user("hi"), partial], &opts, &["switch_agent".to_string()]);
        assert!(messages.iter().any(|m| m.parts.iter().any(|p| p.as_text() == Some(CONTINUE_SENTINEL))));
        assert!(messages.iter().any(|m| m.metadata.synthetic == Some(true)));
        assert!(sentinels.contains("switch_agent"));
    }
}
