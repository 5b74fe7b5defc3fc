// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Synthetic event sequences used to exercise failure paths deterministically
//! in tests, without depending on a real provider's actual context limits or
//! tool-policy evaluation order.

use latt_model::{ProviderEvent, Usage};

/// Test hooks consulted before a real provider call is made. Either hook
/// short-circuits the call entirely — these take precedence over whatever
/// the provider would actually have returned.
#[derive(Debug, Clone, Default)]
pub struct SimulationHooks {
    /// Force the next stream to fail as if the provider rejected the request
    /// for exceeding its context window.
    pub force_context_limit_error: bool,
    /// Force the tool-policy evaluation for the next turn to resolve every
    /// tool to a no-op `disable`, regardless of the agent's actual policy.
    pub simulate_tool_policy_noop: bool,
}

/// The events `StreamManager` should emit in place of a real provider call
/// when a [`SimulationHooks`] flag is set, or `None` if no hook applies.
pub fn scripted_events(hooks: &SimulationHooks) -> Option<Vec<ProviderEvent>> {
    if hooks.force_context_limit_error {
        return Some(vec![ProviderEvent::Error("context_length_exceeded".into())]);
    }
    if hooks.simulate_tool_policy_noop {
        return Some(vec![
            ProviderEvent::TextDelta("[tool policy simulation: no tools invoked]".into()),
            ProviderEvent::Usage(Usage::default()),
            ProviderEvent::Done,
        ]);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_hooks_set_yields_no_scripted_events() {
        assert!(scripted_events(&SimulationHooks::default()).is_none());
    }

    #[test]
    fn force_context_limit_error_takes_precedence() {
        let hooks = SimulationHooks { force_context_limit_error: true, simulate_tool_policy_noop: true };
        let events = scripted_events(&hooks).unwrap();
        assert!(matches!(events.as_slice(), [ProviderEvent::Error(msg)] if msg.contains("context_length")));
    }

    #[test]
    fn tool_policy_noop_produces_a_textual_turn_with_no_tool_calls() {
        let hooks = SimulationHooks { force_context_limit_error: false, simulate_tool_policy_noop: true };
        let events = scripted_events(&hooks).unwrap();
        assert!(!events.iter().any(|e| matches!(e, ProviderEvent::ToolCallStart { .. })));
        assert!(matches!(events.last(), Some(ProviderEvent::Done)));
    }
}
