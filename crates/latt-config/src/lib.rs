// SPDX-License-Identifier: Apache-2.0
//! Configuration loading for the lattice runtime: layered global config,
//! project-local MCP overrides (`mcp.local.json[c]`), and plugin manifests.
mod loader;
mod schema;

pub use loader::{
    enabled_server_signature_inputs, load, load_mcp_local_overrides, load_plugins_config,
    mcp_local_override_path, strip_jsonc_comments, write_mcp_local_overrides,
};
pub use schema::*;
