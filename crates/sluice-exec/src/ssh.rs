//! Ssh backend: runs task scripts on remote hosts over ssh.
//!
//! Each configured node becomes a cluster host. A task's script is copied to
//! its selected host with `scp`, then executed there with `ssh`. Liveness
//! probes run while the executioner is active so unreachable nodes drop out
//! of selection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use sluice_cluster::{Cluster, Host, HostResources, SshProbe};
use sluice_task::Task;
use sluice_types::{Result, SluiceError};

use crate::backend::{Backend, CmdSpec};

const SSH_OPTS: [&str; 2] = ["-o", "BatchMode=yes"];

/// Runs tasks on a pool of ssh-reachable nodes.
pub struct SshBackend {
    cluster: Cluster,
    probe_interval: Duration,
}

impl SshBackend {
    /// Build a backend from node names (`node` or `user@node`). Every node
    /// starts with the given per-host budget.
    pub fn new(nodes: &[String], per_host: HostResources, probe_interval: Duration) -> Self {
        let cluster = Cluster::new();
        for node in nodes {
            let name = node.trim();
            if name.is_empty() {
                continue;
            }
            cluster.add(Arc::new(Host::new(name, per_host.clone())));
        }
        Self {
            cluster,
            probe_interval,
        }
    }

    /// The file name the script gets on the remote host.
    fn remote_file(task: &Task) -> String {
        std::path::Path::new(task.program_file())
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.sh", task.id()))
    }

    fn host_or_err<'h>(&self, task: &Task, host: Option<&'h Host>) -> Result<&'h Host> {
        host.ok_or_else(|| SluiceError::BackendError {
            backend: "ssh".into(),
            task: task.id().to_string(),
            message: "no host selected".into(),
        })
    }
}

#[async_trait]
impl Backend for SshBackend {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn cluster(&self) -> Option<&Cluster> {
        Some(&self.cluster)
    }

    /// Write the script locally, then copy it to the selected host.
    async fn prepare(&self, task: &Task, host: Option<&Host>) -> Result<()> {
        let host = self.host_or_err(task, host)?;
        task.create_program_file()?;

        let remote = format!("{}:{}", host.name(), Self::remote_file(task));
        let status = tokio::process::Command::new("scp")
            .args(SSH_OPTS)
            .arg(task.program_file())
            .arg(&remote)
            .status()
            .await?;
        if !status.success() {
            return Err(SluiceError::BackendError {
                backend: "ssh".into(),
                task: task.id().to_string(),
                message: format!("scp to {} failed with {}", remote, status),
            });
        }
        Ok(())
    }

    fn command(&self, task: &Task, host: Option<&Host>) -> Result<CmdSpec> {
        let host = self.host_or_err(task, host)?;
        Ok(CmdSpec::new("ssh")
            .arg(SSH_OPTS[0])
            .arg(SSH_OPTS[1])
            .arg(host.name())
            .arg("/bin/sh")
            .arg("-e")
            .arg(Self::remote_file(task)))
    }

    // kill_command stays None: killing the local ssh client disconnects the
    // session but cannot guarantee the remote shell dies. A remote kill needs
    // the remote pid, which this backend does not track.

    async fn on_run_start(&self) -> Result<()> {
        self.cluster
            .start_host_info_updaters(Arc::new(SshProbe::default()), self.probe_interval)
            .await;
        Ok(())
    }

    async fn on_run_end(&self) {
        self.cluster.stop_host_info_updaters().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_task::TaskSpec;

    fn backend() -> SshBackend {
        SshBackend::new(
            &["node1".to_string(), " user@node2 ".to_string(), "".to_string()],
            HostResources::new(4, 0, 0),
            Duration::from_secs(60),
        )
    }

    fn task_with_program_file(path: &str) -> Task {
        Task::new(TaskSpec {
            id: Some("t1".into()),
            program: "echo hi".into(),
            program_file: Some(path.into()),
            ..TaskSpec::default()
        })
    }

    #[test]
    fn nodes_become_hosts_and_blanks_are_dropped() {
        let cluster_hosts = backend().cluster.hosts();
        let names: Vec<_> = cluster_hosts.iter().map(|h| h.name().to_string()).collect();
        assert_eq!(names, vec!["node1", "user@node2"]);
    }

    #[test]
    fn command_executes_remote_base_name() {
        let backend = backend();
        let task = task_with_program_file("/tmp/run/t1.sh");
        let host = backend.cluster.host("node1").unwrap();

        let cmd = backend.command(&task, Some(&host)).unwrap();
        assert_eq!(cmd.program, "ssh");
        assert_eq!(
            cmd.args,
            vec!["-o", "BatchMode=yes", "node1", "/bin/sh", "-e", "t1.sh"]
        );
    }

    #[test]
    fn command_without_host_is_an_error() {
        let backend = backend();
        let task = task_with_program_file("/tmp/run/t1.sh");
        let err = backend.command(&task, None).unwrap_err();
        assert!(matches!(err, SluiceError::BackendError { .. }));
    }

    #[test]
    fn kill_command_is_not_available() {
        let backend = backend();
        let task = task_with_program_file("/tmp/run/t1.sh");
        assert!(backend.kill_command(&task).is_none());
    }
}
