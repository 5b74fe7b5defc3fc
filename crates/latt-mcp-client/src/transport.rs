// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wire-level connection seam for a single MCP server.
//!
//! The MCP wire protocol itself — stdio JSON-RPC framing, the HTTP/SSE
//! client, OAuth challenge parsing, `test(options)` connectivity probes — is
//! an external collaborator out of scope for this implementation (see
//! Non-goals, DESIGN.md). `Transport` models only the *kind* a server config
//! selects, so [`crate::instance::McpServerInstance`] has something to hold
//! its signature/lease/restart-backoff bookkeeping against; every call
//! returns [`TransportError::NotImplemented`] until a real adapter is wired
//! in behind this seam.

use serde::Deserialize;
use serde_json::Value;

use latt_config::McpTransportConfig;

/// A tool advertised by an MCP server's `tools/list` response.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMcpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema", rename = "inputSchema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("server returned JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("mcp wire transport not implemented")]
    NotImplemented,
}

/// Which wire kind a server config selects. Carries no connection: calls
/// always fail with [`TransportError::NotImplemented`].
pub enum Transport {
    Stdio,
    Http,
    Sse,
}

impl Transport {
    pub async fn connect(config: &McpTransportConfig) -> Result<Self, TransportError> {
        Ok(match config {
            McpTransportConfig::Stdio { .. } => Transport::Stdio,
            McpTransportConfig::Http { .. } => Transport::Http,
            McpTransportConfig::Sse { .. } => Transport::Sse,
        })
    }

    pub async fn list_tools(&mut self) -> Result<Vec<RawMcpTool>, TransportError> {
        Err(TransportError::NotImplemented)
    }

    pub async fn call_tool(&mut self, _name: &str, _arguments: Value) -> Result<Value, TransportError> {
        Err(TransportError::NotImplemented)
    }

    pub async fn shutdown(self) {}
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
