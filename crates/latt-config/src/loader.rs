// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use crate::{Config, PluginsConfig, ProjectMcpOverrides};

/// Ordered list of global config file locations, lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    paths.push(PathBuf::from("/etc/lattice/config.json"));
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("lattice/config.json"));
    }
    paths.push(PathBuf::from(".lattice/config.json"));
    paths
}

/// Load configuration by deep-merging every discovered JSON layer, then an
/// optional explicit override path (e.g. a `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_json::Value::Object(serde_json::Map::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let layer = read_json(&path)?;
            merge_json(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let layer = read_json(p)?;
        merge_json(&mut merged, layer);
    }

    let config: Config = if matches!(merged, serde_json::Value::Object(ref m) if m.is_empty()) {
        Config::default()
    } else {
        serde_json::from_value(merged).unwrap_or_default()
    };
    Ok(config)
}

fn read_json(path: &Path) -> anyhow::Result<serde_json::Value> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn merge_json(dst: &mut serde_json::Value, src: serde_json::Value) {
    match (dst, src) {
        (serde_json::Value::Object(d), serde_json::Value::Object(s)) => {
            for (k, v) in s {
                let entry = d.entry(k).or_insert(serde_json::Value::Null);
                if entry.is_null() {
                    *entry = v;
                } else {
                    merge_json(entry, v);
                }
            }
        }
        (dst, src) => *dst = src,
    }
}

/// Strip `//` line comments and `/* */` block comments from JSONC text,
/// respecting string literals so a `//` inside a quoted string is preserved.
/// This is a best-effort lexer, not a full JSON tokenizer — it assumes
/// well-formed input beyond comment handling.
pub fn strip_jsonc_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escape = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                for c2 in chars.by_ref() {
                    if c2 == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c2 in chars.by_ref() {
                    if prev == '*' && c2 == '/' {
                        break;
                    }
                    prev = c2;
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Path preferred for minion-local MCP overrides: `mcp.local.jsonc` if
/// present, else `mcp.local.json`, else `None`.
pub fn mcp_local_override_path(project_path: &Path) -> Option<PathBuf> {
    let jsonc = project_path.join(".lattice").join("mcp.local.jsonc");
    if jsonc.is_file() {
        return Some(jsonc);
    }
    let json = project_path.join(".lattice").join("mcp.local.json");
    if json.is_file() {
        return Some(json);
    }
    None
}

/// Read a minion's local MCP overrides, migrating any legacy entry found
/// under the global config's `mcpLocalOverrides` map on first read.
/// Migration failures are logged and the legacy values are kept in memory
/// (§7: legacy-config migration failures → keep using legacy values).
pub fn load_mcp_local_overrides(
    project_path: &Path,
    global: &mut Config,
) -> ProjectMcpOverrides {
    if let Some(path) = mcp_local_override_path(project_path) {
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let stripped = strip_jsonc_comments(&text);
                match serde_json::from_str(&stripped) {
                    Ok(parsed) => return parsed,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to parse mcp.local overrides, using defaults");
                        return ProjectMcpOverrides::default();
                    }
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read mcp.local overrides");
            }
        }
    }

    let key = project_path.to_string_lossy().to_string();
    if let Some(legacy) = global.legacy_mcp_local_overrides.remove(&key) {
        if let Err(e) = write_mcp_local_overrides(project_path, &legacy) {
            warn!(error = %e, "failed to migrate legacy mcp overrides; keeping legacy values in memory");
            global.legacy_mcp_local_overrides.insert(key, legacy.clone());
        }
        return legacy;
    }

    ProjectMcpOverrides::default()
}

pub fn write_mcp_local_overrides(
    project_path: &Path,
    overrides: &ProjectMcpOverrides,
) -> anyhow::Result<()> {
    let dir = project_path.join(".lattice");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("mcp.local.json");
    std::fs::write(&path, serde_json::to_string_pretty(overrides)?)?;
    add_to_git_exclude_best_effort(project_path, ".lattice/mcp.local.json");
    Ok(())
}

/// Best-effort: append the path to `.git/info/exclude` so minion-local
/// overrides never get committed. Failures are swallowed — this is a
/// convenience, not a correctness requirement.
fn add_to_git_exclude_best_effort(project_path: &Path, rel_path: &str) {
    let exclude_path = project_path.join(".git").join("info").join("exclude");
    let Some(parent) = exclude_path.parent() else {
        return;
    };
    if !parent.is_dir() {
        return;
    }
    let existing = std::fs::read_to_string(&exclude_path).unwrap_or_default();
    if existing.lines().any(|l| l.trim() == rel_path) {
        return;
    }
    use std::io::Write;
    if let Ok(mut f) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&exclude_path)
    {
        let _ = writeln!(f, "{rel_path}");
    }
}

/// Merge the global plugin manifest (`<root>/plugins.json`) with a
/// project-level override (`<project>/.lattice/plugins.json`).
pub fn load_plugins_config(global_root: &Path, project_path: &Path) -> PluginsConfig {
    let global = read_plugins_file(&global_root.join("plugins.json")).unwrap_or_default();
    let project = read_plugins_file(&project_path.join(".lattice").join("plugins.json"));
    PluginsConfig::merge(global, project)
}

fn read_plugins_file(path: &Path) -> Option<PluginsConfig> {
    let text = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&text) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to parse plugins manifest");
            None
        }
    }
}

/// Compute the sorted, stable signature inputs for the enabled server set —
/// used by `MCPServerPool::configSignature` (§4.5). Tool allowlists are
/// deliberately excluded from the returned map.
pub fn enabled_server_signature_inputs(
    servers: &[crate::McpServerConfig],
    overrides: &ProjectMcpOverrides,
) -> HashMap<String, crate::McpTransportConfig> {
    let mut enabled: HashMap<String, crate::McpTransportConfig> = HashMap::new();
    for server in servers {
        let disabled = overrides.disabled_servers.iter().any(|n| n == &server.name);
        let force_enabled = overrides.enabled_servers.iter().any(|n| n == &server.name);
        if server.enabled && !disabled || force_enabled {
            enabled.insert(server.name.clone(), server.transport.clone());
        }
    }
    enabled
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{McpTransportConfig, McpServerConfig};

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst: serde_json::Value = serde_json::json!({"x": 1});
        let src = serde_json::json!({"x": 2});
        merge_json(&mut dst, src);
        assert_eq!(dst["x"], 2);
    }

    #[test]
    fn merge_nested_tables() {
        let mut dst = serde_json::json!({"model": {"provider": "openai", "name": "gpt-4o"}});
        let src = serde_json::json!({"model": {"name": "gpt-4o-mini"}});
        merge_json(&mut dst, src);
        assert_eq!(dst["model"]["provider"], "openai");
        assert_eq!(dst["model"]["name"], "gpt-4o-mini");
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/lattice_nonexistent_config_xyz.json")));
        assert!(result.is_err());
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, r#"{{"model": {{"provider": "anthropic", "name": "test-model"}}}}"#).unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.model.provider, "anthropic");
        assert_eq!(cfg.model.name, "test-model");
    }

    #[test]
    fn strip_jsonc_removes_line_comments_but_not_in_strings() {
        let input = "{\n  // a comment\n  \"a\": \"http://x\"\n}";
        let stripped = strip_jsonc_comments(input);
        let parsed: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(parsed["a"], "http://x");
    }

    #[test]
    fn strip_jsonc_removes_block_comments() {
        let input = "{ /* block \n comment */ \"a\": 1 }";
        let stripped = strip_jsonc_comments(input);
        let parsed: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(parsed["a"], 1);
    }

    #[test]
    fn mcp_local_prefers_jsonc_over_json() {
        let dir = tempfile::tempdir().unwrap();
        let lattice_dir = dir.path().join(".lattice");
        std::fs::create_dir_all(&lattice_dir).unwrap();
        std::fs::write(lattice_dir.join("mcp.local.json"), "{}").unwrap();
        std::fs::write(lattice_dir.join("mcp.local.jsonc"), "{}").unwrap();
        let path = mcp_local_override_path(dir.path()).unwrap();
        assert!(path.ends_with("mcp.local.jsonc"));
    }

    #[test]
    fn load_mcp_local_overrides_migrates_legacy_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut global = Config::default();
        let key = dir.path().to_string_lossy().to_string();
        let mut legacy = ProjectMcpOverrides::default();
        legacy.disabled_servers.push("old-server".into());
        global.legacy_mcp_local_overrides.insert(key, legacy);

        let result = load_mcp_local_overrides(dir.path(), &mut global);
        assert_eq!(result.disabled_servers, vec!["old-server".to_string()]);
        assert!(global.legacy_mcp_local_overrides.is_empty());
        assert!(mcp_local_override_path(dir.path()).is_some());
    }

    #[test]
    fn load_mcp_local_overrides_defaults_when_nothing_present() {
        let dir = tempfile::tempdir().unwrap();
        let mut global = Config::default();
        let result = load_mcp_local_overrides(dir.path(), &mut global);
        assert!(result.disabled_servers.is_empty());
    }

    #[test]
    fn plugins_config_merges_global_and_project_files() {
        let global_root = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        std::fs::write(
            global_root.path().join("plugins.json"),
            r#"{"enabled_packs": {"a": true, "b": false}}"#,
        )
        .unwrap();
        std::fs::create_dir_all(project.path().join(".lattice")).unwrap();
        std::fs::write(
            project.path().join(".lattice").join("plugins.json"),
            r#"{"enabled_packs": {"b": true}}"#,
        )
        .unwrap();
        let merged = load_plugins_config(global_root.path(), project.path());
        assert!(merged.is_enabled("a"));
        assert!(merged.is_enabled("b"));
    }

    #[test]
    fn enabled_server_signature_excludes_disabled_and_tool_allowlist() {
        let servers = vec![
            McpServerConfig {
                name: "a".into(),
                transport: McpTransportConfig::Stdio {
                    command: "cmd-a".into(),
                    args: vec![],
                    env: HashMap::new(),
                },
                enabled: true,
            },
            McpServerConfig {
                name: "b".into(),
                transport: McpTransportConfig::Stdio {
                    command: "cmd-b".into(),
                    args: vec![],
                    env: HashMap::new(),
                },
                enabled: true,
            },
        ];
        let mut overrides = ProjectMcpOverrides::default();
        overrides.disabled_servers.push("b".into());
        let sig = enabled_server_signature_inputs(&servers, &overrides);
        assert!(sig.contains_key("a"));
        assert!(!sig.contains_key("b"));
    }

    #[test]
    fn enabled_server_signature_honors_force_enable_override() {
        let servers = vec![McpServerConfig {
            name: "c".into(),
            transport: McpTransportConfig::Stdio {
                command: "cmd-c".into(),
                args: vec![],
                env: HashMap::new(),
            },
            enabled: false,
        }];
        let mut overrides = ProjectMcpOverrides::default();
        overrides.enabled_servers.push("c".into());
        let sig = enabled_server_signature_inputs(&servers, &overrides);
        assert!(sig.contains_key("c"));
    }
}
