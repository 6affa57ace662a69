//! Engine configuration: which backend to run and how it is parameterized.
//!
//! Loaded from a JSON file. Every field has a default so an empty object
//! (or a missing file handled by the caller) yields a local-only engine.

use std::path::Path;

use serde::{Deserialize, Serialize};

use sluice_cluster::HostResources;
use sluice_types::{Result, SluiceError};

/// Which execution backend the engine runs tasks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Local,
    Ssh,
    Cluster,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Ssh => write!(f, "ssh"),
            BackendKind::Cluster => write!(f, "cluster"),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Backend to run tasks on.
    pub backend: BackendKind,

    /// Remote nodes for the ssh backend. Accepts a JSON list or a single
    /// comma-separated string (`"node1,node2"`).
    #[serde(deserialize_with = "nodes_or_string")]
    pub ssh_nodes: Vec<String>,

    /// Resource budget assumed for each ssh node until a probe refreshes it.
    pub ssh_host: HostResources,

    /// Submit command template for the cluster backend. Placeholders:
    /// `{program}` (script path), `{queue}` (task queue name, may be empty),
    /// `{cpus}`, `{mem}`, `{timeout}`. The command must block until the job
    /// finishes (e.g. `srun`, `qsub -sync y`).
    pub cluster_submit: Vec<String>,

    /// Cancel command template for the cluster backend. Placeholder: `{pid}`.
    pub cluster_cancel: Vec<String>,

    /// Status command template for the cluster backend, used with
    /// non-blocking submit commands: it must exit zero while the job is still
    /// known to the scheduler. Placeholder: `{pid}`.
    pub cluster_status: Vec<String>,

    /// Seconds between liveness probes of ssh cluster hosts.
    pub host_info_interval_secs: u64,

    /// Milliseconds to wait after each task completes before reusing its
    /// resources. Lets shared filesystems settle.
    pub wait_after_task_run_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            ssh_nodes: Vec::new(),
            ssh_host: HostResources::default(),
            cluster_submit: Vec::new(),
            cluster_cancel: Vec::new(),
            cluster_status: Vec::new(),
            host_info_interval_secs: 60,
            wait_after_task_run_ms: 0,
        }
    }
}

/// Accept `"node1,node2"` or `["node1", "node2"]`.
fn nodes_or_string<'de, D: serde::Deserializer<'de>>(
    de: D,
) -> std::result::Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Nodes {
        List(Vec<String>),
        Joined(String),
    }
    Ok(match Nodes::deserialize(de)? {
        Nodes::List(list) => list,
        Nodes::Joined(joined) => joined
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
    })
}

impl EngineConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&text)
            .map_err(|e| SluiceError::ConfigError(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the selected backend has the parameters it needs.
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            BackendKind::Local => Ok(()),
            BackendKind::Ssh => {
                if self.ssh_nodes.is_empty() {
                    return Err(SluiceError::ConfigError(
                        "ssh backend requires at least one entry in ssh_nodes".into(),
                    ));
                }
                Ok(())
            }
            BackendKind::Cluster => {
                if self.cluster_submit.is_empty() {
                    return Err(SluiceError::ConfigError(
                        "cluster backend requires a cluster_submit command".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_local() {
        let config = EngineConfig::default();
        assert_eq!(config.backend, BackendKind::Local);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_json_object_uses_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.backend, BackendKind::Local);
        assert_eq!(config.host_info_interval_secs, 60);
    }

    #[test]
    fn loads_ssh_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(
            &path,
            r#"{"backend": "ssh", "ssh_nodes": ["node1", "user@node2"], "host_info_interval_secs": 5}"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.backend, BackendKind::Ssh);
        assert_eq!(config.ssh_nodes, vec!["node1", "user@node2"]);
        assert_eq!(config.host_info_interval_secs, 5);
    }

    #[test]
    fn ssh_nodes_accepts_a_comma_separated_string() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"backend": "ssh", "ssh_nodes": "node1, node2,,node3"}"#)
                .unwrap();
        assert_eq!(config.ssh_nodes, vec!["node1", "node2", "node3"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn ssh_without_nodes_is_rejected() {
        let config: EngineConfig = serde_json::from_str(r#"{"backend": "ssh"}"#).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SluiceError::ConfigError(_)));
    }

    #[test]
    fn cluster_without_submit_command_is_rejected() {
        let config: EngineConfig = serde_json::from_str(r#"{"backend": "cluster"}"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = EngineConfig::load(&path).unwrap_err();
        assert!(matches!(err, SluiceError::ConfigError(_)));
    }
}
