// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod abort;
mod agent_resolver;
mod agent_session;
mod ai_service;
mod delegated_tool;
mod event_store;
mod history;
mod init_state;
mod lock;
mod mcp_pool;
mod message_pipeline;
mod minion;
mod stream_manager;
mod stream_sim;
mod usage;

pub use abort::{AbortController, AbortSignal};
pub use agent_resolver::{AgentCatalog, AgentDefinition, ResolveError, ResolvedAgent, RunMode, MAX_TASK_DEPTH_HOPS};
pub use agent_session::AgentSession;
pub use ai_service::{AIService, AlwaysReady, RuntimeReadiness, TurnError, TurnRequest};
pub use delegated_tool::{DelegatedToolCallRegistry, DelegatedToolError};
pub use event_store::EventStore;
pub use history::{HistoryCache, HistoryStore, MinionId};
pub use init_state::{InitEvent, InitOutputLine, InitPhase, InitStateManager, InitStatus, InitStatusKind};
pub use lock::MinionFileLocks;
pub use mcp_pool::{McpLease, McpServerPool, ResolvedMcpTool};
pub use message_pipeline::{build_payload, Attachment, PipelineOptions, ProviderFamily, RunModeTransition, ThinkingMode, CONTINUE_SENTINEL};
pub use minion::{session_dir, Minion, RuntimeConfig};
pub use stream_manager::{is_response_id_lost, StreamEvent, StreamManager, StreamOutcome};
pub use stream_sim::{scripted_events, SimulationHooks};
pub use usage::{SessionUsage, SessionUsageLedger, UsageDisplay};
