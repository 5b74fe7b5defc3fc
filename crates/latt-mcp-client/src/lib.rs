// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Client-side connection pooling for external MCP servers: per-minion
//! instance caches, config-signature-driven restart, idle GC, and tool-name
//! normalization. The MCP wire protocol itself is treated as a thin
//! JSON-RPC shim — see [`transport`] — not reimplemented in full.

pub mod instance;
pub mod pool;
pub mod transport;

pub use instance::{aggregate_config_signature, config_signature, dedupe_tool_names, namespaced_tool_name, LeaseGuard, McpServerInstance};
pub use pool::{McpServerPoolRegistry, MinionMcpCache, PoolResult};
pub use transport::{RawMcpTool, Transport, TransportError};
