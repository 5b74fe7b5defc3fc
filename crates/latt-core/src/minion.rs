// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Minion identity and the on-disk layout of its session directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A durable, named session bound to a project path and a runtime.
///
/// Minions form a parent/child tree: `parent_minion_id` is set on a
/// sidekick spawned to execute a subtask of its parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Minion {
    pub id: String,
    pub name: String,
    pub project_path: PathBuf,
    pub project_name: String,
    pub runtime_config: RuntimeConfig,
    pub parent_minion_id: Option<String>,
    pub agent_id: Option<String>,
    pub agent_switching_enabled: Option<bool>,
}

/// Where a minion's runtime actually executes. Out of scope: the concrete
/// remote/container adapters; this only carries enough to distinguish them
/// for readiness checks in `AIService`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuntimeConfig {
    Local,
    Container { image: String },
    Remote { host: String },
}

impl Minion {
    pub fn new(id: impl Into<String>, name: impl Into<String>, project_path: PathBuf) -> Self {
        let project_name = project_path.file_name().and_then(|s| s.to_str()).unwrap_or("project").to_string();
        Self {
            id: id.into(),
            name: name.into(),
            project_path,
            project_name,
            runtime_config: RuntimeConfig::Local,
            parent_minion_id: None,
            agent_id: None,
            agent_switching_enabled: None,
        }
    }

    pub fn sidekick(id: impl Into<String>, name: impl Into<String>, parent: &Minion, agent_id: impl Into<String>) -> Self {
        let mut m = Self::new(id, name, parent.project_path.clone());
        m.parent_minion_id = Some(parent.id.clone());
        m.agent_id = Some(agent_id.into());
        m
    }

    pub fn is_sidekick(&self) -> bool {
        self.parent_minion_id.is_some()
    }
}

/// The on-disk session directory `S(id)` a minion's stateful components
/// each own a file under.
pub fn session_dir(root: &Path, minion_id: &str) -> PathBuf {
    root.join(minion_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_minion_derives_project_name_from_path() {
        let m = Minion::new("m1", "work", PathBuf::from("/home/user/my-project"));
        assert_eq!(m.project_name, "my-project");
        assert!(!m.is_sidekick());
    }

    #[test]
    fn sidekick_inherits_parent_project_path_and_sets_parent_id() {
        let parent = Minion::new("parent", "p", PathBuf::from("/repo"));
        let child = Minion::sidekick("child", "c", &parent, "exec");
        assert_eq!(child.project_path, parent.project_path);
        assert_eq!(child.parent_minion_id.as_deref(), Some("parent"));
        assert_eq!(child.agent_id.as_deref(), Some("exec"));
        assert!(child.is_sidekick());
    }

    #[test]
    fn session_dir_joins_root_and_id() {
        let p = session_dir(Path::new("/var/lattice"), "abc-123");
        assert_eq!(p, PathBuf::from("/var/lattice/abc-123"));
    }
}
