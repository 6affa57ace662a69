//! Local backend: runs task scripts as child processes on this machine.

use sluice_cluster::{Cluster, Host, HostResources};
use sluice_task::Task;
use sluice_types::Result;

use crate::backend::{Backend, CmdSpec};

/// Runs tasks directly on the local machine.
///
/// Without a cpu limit, dispatch is unthrottled. With one, the backend models
/// the machine as a single-host cluster so the executioner queues tasks once
/// the limit is reached.
pub struct LocalBackend {
    cluster: Option<Cluster>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self { cluster: None }
    }

    /// Throttle concurrent tasks to `cpus` total requested cpus.
    pub fn with_max_cpus(cpus: u32) -> Self {
        let cluster = Cluster::new();
        cluster.add(std::sync::Arc::new(Host::new(
            "localhost",
            HostResources::new(cpus, 0, 0),
        )));
        Self {
            cluster: Some(cluster),
        }
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn cluster(&self) -> Option<&Cluster> {
        self.cluster.as_ref()
    }

    fn command(&self, task: &Task, _host: Option<&Host>) -> Result<CmdSpec> {
        // The program file carries its own shebang and exec bit.
        Ok(CmdSpec::new(task.program_file()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unthrottled_backend_has_no_cluster() {
        let backend = LocalBackend::new();
        assert!(backend.cluster().is_none());
    }

    #[test]
    fn throttled_backend_exposes_single_host() {
        let backend = LocalBackend::with_max_cpus(4);
        let cluster = backend.cluster().unwrap();
        let hosts = cluster.hosts();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].name(), "localhost");
        assert_eq!(hosts[0].total().cpus, 4);
    }
}
