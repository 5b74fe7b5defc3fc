// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Facade wiring agent resolution, MCP tool surfacing, payload construction
//! and streaming into the single entry point a caller drives a turn through.
//! `AgentSession` owns the per-minion conversation lifecycle; this module
//! owns the mechanics of turning one resolved turn into a provider call.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream;
use latt_config::{McpServerConfig, ToolPolicy, ToolPolicyAction};
use latt_model::{CompletionRequest, ModelProvider, ProviderEvent, ResponseStream, ToolSchema};
use latt_tools::{ToolCall, ToolOutput, ToolRegistry};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::abort::AbortSignal;
use crate::agent_resolver::{AgentCatalog, ResolveError, ResolvedAgent};
use crate::delegated_tool::{DelegatedToolCallRegistry, DelegatedToolError};
use crate::history::HistoryStore;
use crate::mcp_pool::{McpServerPool, ResolvedMcpTool};
use crate::message_pipeline::{build_payload, PipelineOptions};
use crate::minion::Minion;
use crate::stream_manager::{StreamEvent, StreamManager, StreamOutcome};
use crate::stream_sim::{scripted_events, SimulationHooks};

/// Out-of-scope in this crate: whatever concrete sandbox/container/remote
/// adapter backs a minion's `RuntimeConfig`. Callers that have one plug it in
/// here; callers that don't get the default, always-ready implementation.
#[async_trait]
pub trait RuntimeReadiness: Send + Sync {
    async fn is_ready(&self, minion: &Minion) -> bool;
}

/// Always reports ready — the default when no runtime adapter is wired in.
pub struct AlwaysReady;

#[async_trait]
impl RuntimeReadiness for AlwaysReady {
    async fn is_ready(&self, _minion: &Minion) -> bool {
        true
    }
}

/// Everything the caller must supply for one turn. Borrowed fields live only
/// as long as the call; owned fields (policies, servers, options) are
/// consumed.
pub struct TurnRequest<'a> {
    pub minion: &'a Minion,
    pub requested_agent_id: Option<&'a str>,
    pub caller_policy: Option<ToolPolicy>,
    pub system_policy: Option<ToolPolicy>,
    pub enabled_mcp_servers: Vec<McpServerConfig>,
    pub pipeline_opts: PipelineOptions,
    pub hooks: SimulationHooks,
}

/// Bookkeeping kept for a turn in flight, surfaced for introspection/tests —
/// the streaming machinery itself lives in [`StreamManager`].
#[derive(Debug, Clone)]
struct PendingStreamStart {
    started_at: DateTime<Utc>,
    acp_prompt_id: Option<String>,
}

/// One-shot provider that replays a fixed event list rather than making a
/// real call — the vehicle [`SimulationHooks`] short-circuits through,
/// before any real provider I/O happens.
struct ScriptedProvider {
    events: Mutex<Option<Vec<ProviderEvent>>>,
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "simulated"
    }
    fn model_name(&self) -> &str {
        "simulated"
    }
    async fn complete(&self, _req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let events = self.events.lock().await.take().unwrap_or_default();
        let wrapped: Vec<anyhow::Result<ProviderEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("runtime not ready for minion {0}")]
    RuntimeNotReady(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct AIService {
    agents: Arc<AgentCatalog>,
    history: Arc<HistoryStore>,
    streams: Arc<StreamManager>,
    mcp: Arc<McpServerPool>,
    delegated_tools: Arc<DelegatedToolCallRegistry>,
    runtime: Arc<dyn RuntimeReadiness>,
    tools: Option<Arc<ToolRegistry>>,
    /// Namespaced MCP tool name → resolved tool, refreshed each turn so a
    /// tool call that arrives after the fact can be routed back to its
    /// `(server, raw_name)` without re-deriving it from the (lossy, hashed)
    /// namespaced name.
    mcp_tool_index: Mutex<HashMap<String, HashMap<String, ResolvedMcpTool>>>,
    /// Tool names the resolved agent routes through `DelegatedToolCallRegistry`
    /// rather than local/MCP dispatch, refreshed each turn alongside
    /// `mcp_tool_index`.
    delegated_tool_names: Mutex<HashMap<String, Vec<String>>>,
    pending: Mutex<HashMap<String, PendingStreamStart>>,
    last_llm_request: Mutex<Option<CompletionRequest>>,
}

impl AIService {
    pub fn new(
        agents: Arc<AgentCatalog>,
        history: Arc<HistoryStore>,
        streams: Arc<StreamManager>,
        mcp: Arc<McpServerPool>,
        delegated_tools: Arc<DelegatedToolCallRegistry>,
    ) -> Self {
        Self {
            agents,
            history,
            streams,
            mcp,
            delegated_tools,
            runtime: Arc::new(AlwaysReady),
            tools: None,
            mcp_tool_index: Mutex::new(HashMap::new()),
            delegated_tool_names: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            last_llm_request: Mutex::new(None),
        }
    }

    pub fn with_runtime_readiness(mut self, runtime: Arc<dyn RuntimeReadiness>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_tool_registry(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// The most recent `CompletionRequest` actually built for a provider
    /// call (or a simulated one), kept for debugging/test introspection.
    pub async fn last_llm_request(&self) -> Option<CompletionRequest> {
        self.last_llm_request.lock().await.clone()
    }

    pub async fn is_turn_pending(&self, minion_id: &str) -> bool {
        self.pending.lock().await.contains_key(minion_id)
    }

    pub async fn stop_turn(&self, minion_id: &str, abandon_partial: bool, reason: &str) {
        self.streams.stop_stream(minion_id, abandon_partial, reason).await;
    }

    pub fn cancel_all_delegated_tool_calls(&self, minion_id: &str, reason: &str) {
        self.delegated_tools.cancel_all(minion_id, reason);
    }

    /// Resolve the agent, surface its tools, build the provider payload and
    /// run one turn, emitting [`StreamEvent`]s as they occur.
    ///
    /// Any partial left over from a prior, uncommitted turn is committed
    /// first (a no-op if none is pending) so a crash mid-stream never blocks
    /// the next turn from starting.
    pub async fn run_turn(
        &self,
        req: TurnRequest<'_>,
        provider: &dyn ModelProvider,
        mut emit: impl FnMut(StreamEvent),
    ) -> Result<StreamOutcome, TurnError> {
        let minion_id = req.minion.id.clone();
        self.history.commit_partial(&minion_id).await?;

        if !self.runtime.is_ready(req.minion).await {
            return Err(TurnError::RuntimeNotReady(minion_id));
        }

        let resolved = self.agents.resolve(req.requested_agent_id, req.minion, req.caller_policy, req.system_policy)?;

        self.pending.lock().await.insert(minion_id.clone(), PendingStreamStart { started_at: Utc::now(), acp_prompt_id: None });

        let outcome = self.run_resolved_turn(&minion_id, &resolved, req.enabled_mcp_servers, req.pipeline_opts, req.hooks, provider, &mut emit).await;

        self.pending.lock().await.remove(&minion_id);
        outcome
    }

    async fn run_resolved_turn(
        &self,
        minion_id: &str,
        resolved: &ResolvedAgent,
        enabled_mcp_servers: Vec<McpServerConfig>,
        pipeline_opts: PipelineOptions,
        hooks: SimulationHooks,
        provider: &dyn ModelProvider,
        emit: &mut impl FnMut(StreamEvent),
    ) -> Result<StreamOutcome, TurnError> {
        let mcp_tools = self.mcp.get_tools_for_minion(minion_id, enabled_mcp_servers).await;
        let index: HashMap<String, ResolvedMcpTool> = mcp_tools.iter().map(|t| (t.namespaced_name.clone(), t.clone())).collect();
        self.mcp_tool_index.lock().await.insert(minion_id.to_string(), index);
        self.delegated_tool_names.lock().await.insert(minion_id.to_string(), resolved.delegated_tool_names.clone());

        let mut tools = tool_schemas_for_policy(&mcp_tools, &resolved.tool_policy);
        if let Some(registry) = &self.tools {
            tools.extend(
                registry
                    .schemas_for_policy(&resolved.tool_policy)
                    .into_iter()
                    .map(|s| ToolSchema { name: s.name, description: s.description, parameters: s.parameters }),
            );
        }

        let history_slice = self.history.get_history_from_latest_boundary(minion_id).await?;
        let (messages, _sentinels) = build_payload(history_slice, &pipeline_opts, &resolved.sentinel_tool_names);

        let request = CompletionRequest { messages, tools, stream: true, ..Default::default() };
        *self.last_llm_request.lock().await = Some(request.clone());

        if let Some(events) = scripted_events(&hooks) {
            let scripted = ScriptedProvider { events: Mutex::new(Some(events)) };
            return Ok(self.streams.run_stream(minion_id, &scripted, request, emit).await?);
        }

        Ok(self.streams.run_stream(minion_id, provider, request, emit).await?)
    }

    /// Register `tool_call_id` as delegated to an external client and wait
    /// for it to be answered, racing the turn's own abort signal so an
    /// interrupted stream doesn't leave the registration dangling forever.
    pub async fn await_delegated_tool_call(
        &self,
        minion_id: &str,
        tool_call_id: &str,
        tool_name: &str,
        abort: &mut AbortSignal,
    ) -> Result<Value, DelegatedToolError> {
        let rx = self.delegated_tools.register_pending(minion_id, tool_call_id, tool_name);
        tokio::select! {
            biased;
            _ = abort.cancelled() => {
                self.delegated_tools.cancel(minion_id, tool_call_id, "stream aborted");
                Err(DelegatedToolError::Cancelled("stream aborted".to_string()))
            }
            resolved = rx => resolved.unwrap_or(Err(DelegatedToolError::Dropped)),
        }
    }

    /// Dispatch a completed tool call: a name the resolved agent listed in
    /// `delegatedToolNames` is wrapped through `DelegatedToolCallRegistry`
    /// and raced against `abort` before anything else is consulted; failing
    /// that, locally registered tools take priority, falling back to the
    /// namespaced MCP tool surfaced on the most recent turn for `minion_id`.
    /// `policy` gates every path the same way a direct [`ToolRegistry`]
    /// caller would.
    pub async fn execute_tool_call(&self, minion_id: &str, call: &ToolCall, policy: &ToolPolicy, abort: &mut AbortSignal) -> ToolOutput {
        let is_delegated = self.delegated_tool_names.lock().await.get(minion_id).is_some_and(|names| names.iter().any(|n| n == &call.name));
        if is_delegated {
            if !matches!(policy.resolve(&call.name), Some(ToolPolicyAction::Enable) | Some(ToolPolicyAction::Require)) {
                return ToolOutput::err(&call.id, format!("tool '{}' is denied by policy", call.name));
            }
            return match self.await_delegated_tool_call(minion_id, &call.id, &call.name, abort).await {
                Ok(value) => ToolOutput::ok(&call.id, value.to_string()),
                Err(e) => ToolOutput::err(&call.id, e.to_string()),
            };
        }

        if let Some(registry) = &self.tools {
            if registry.get(&call.name).is_some() {
                return registry.execute_with_policy(call, policy).await;
            }
        }

        let mcp_tool = self.mcp_tool_index.lock().await.get(minion_id).and_then(|idx| idx.get(&call.name).cloned());
        let Some(mcp_tool) = mcp_tool else {
            return ToolOutput::err(&call.id, format!("unknown tool: {}", call.name));
        };
        if !matches!(policy.resolve(&call.name), Some(ToolPolicyAction::Enable) | Some(ToolPolicyAction::Require)) {
            return ToolOutput::err(&call.id, format!("tool '{}' is denied by policy", call.name));
        }
        match self.mcp.call_tool(minion_id, &mcp_tool.server, &mcp_tool.raw_name, call.args.clone()).await {
            Ok(value) => ToolOutput::ok(&call.id, value.to_string()),
            Err(e) => ToolOutput::err(&call.id, e.to_string()),
        }
    }
}

fn tool_schemas_for_policy(tools: &[ResolvedMcpTool], policy: &ToolPolicy) -> Vec<ToolSchema> {
    tools
        .iter()
        .filter(|t| matches!(policy.resolve(&t.namespaced_name), Some(ToolPolicyAction::Enable) | Some(ToolPolicyAction::Require)))
        .map(|t| ToolSchema { name: t.namespaced_name.clone(), description: t.description.clone(), parameters: t.input_schema.clone() })
        .collect()
}
