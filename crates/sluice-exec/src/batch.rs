//! Generic cluster backend: delegates execution to an external scheduler's
//! command-line clients (srun, qsub, bsub, ...).
//!
//! With a blocking submit template (`srun`, `qsub -sync y`) the local child's
//! exit code is the job's exit code. With a non-blocking one, a status
//! template lets the executioner poll until the scheduler forgets the job.
//! Cancellation goes through the cancel template instead of a local signal.

use sluice_cluster::Host;
use sluice_task::Task;
use sluice_types::Result;

use crate::backend::{Backend, CmdSpec};

/// Runs tasks by shelling out to a batch scheduler.
pub struct BatchBackend {
    submit: Vec<String>,
    cancel: Vec<String>,
    status: Vec<String>,
}

impl BatchBackend {
    pub fn new(submit: Vec<String>, cancel: Vec<String>, status: Vec<String>) -> Self {
        Self {
            submit,
            cancel,
            status,
        }
    }

    fn vars(task: &Task) -> Vec<(&'static str, String)> {
        let res = task.resources();
        vec![
            ("program", task.program_file().to_string()),
            ("queue", task.queue().unwrap_or_default().to_string()),
            ("cpus", res.cpus.to_string()),
            ("mem", res.mem_bytes.to_string()),
            ("timeout", res.timeout_secs.to_string()),
            ("pid", task.pid().unwrap_or_default()),
        ]
    }
}

#[async_trait::async_trait]
impl Backend for BatchBackend {
    fn name(&self) -> &'static str {
        "cluster"
    }

    fn command(&self, task: &Task, _host: Option<&Host>) -> Result<CmdSpec> {
        let vars = Self::vars(task);
        let refs: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
        Ok(CmdSpec::from_template(&self.submit, &refs))
    }

    fn kill_command(&self, task: &Task) -> Option<CmdSpec> {
        if self.cancel.is_empty() {
            return None;
        }
        let vars = Self::vars(task);
        let refs: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
        Some(CmdSpec::from_template(&self.cancel, &refs))
    }

    fn status_command(&self, task: &Task) -> Option<CmdSpec> {
        if self.status.is_empty() {
            return None;
        }
        let vars = Self::vars(task);
        let refs: Vec<(&str, &str)> = vars.iter().map(|(k, v)| (*k, v.as_str())).collect();
        Some(CmdSpec::from_template(&self.status, &refs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_cluster::HostResources;
    use sluice_task::TaskSpec;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn task() -> Task {
        Task::new(TaskSpec {
            id: Some("t1".into()),
            program: "echo hi".into(),
            program_file: Some("/tmp/t1.sh".into()),
            queue: Some("long".into()),
            resources: HostResources::new(4, 1024, 0),
            ..TaskSpec::default()
        })
    }

    #[test]
    fn submit_command_fills_task_fields() {
        let backend = BatchBackend::new(
            strs(&["srun", "--cpus-per-task={cpus}", "-p", "{queue}", "{program}"]),
            strs(&["scancel", "{pid}"]),
            Vec::new(),
        );
        let cmd = backend.command(&task(), None).unwrap();
        assert_eq!(cmd.program, "srun");
        assert_eq!(
            cmd.args,
            vec!["--cpus-per-task=4", "-p", "long", "/tmp/t1.sh"]
        );
    }

    #[test]
    fn cancel_command_uses_recorded_pid() {
        let backend = BatchBackend::new(
            strs(&["srun", "{program}"]),
            strs(&["scancel", "{pid}"]),
            Vec::new(),
        );
        let t = task();
        t.set_pid("12345");
        let kill = backend.kill_command(&t).unwrap();
        assert_eq!(kill.program, "scancel");
        assert_eq!(kill.args, vec!["12345"]);
    }

    #[test]
    fn no_cancel_template_means_no_kill_command() {
        let backend = BatchBackend::new(strs(&["srun", "{program}"]), Vec::new(), Vec::new());
        assert!(backend.kill_command(&task()).is_none());
    }

    #[test]
    fn status_command_tracks_the_submitted_job() {
        let backend = BatchBackend::new(
            strs(&["qsub", "{program}"]),
            Vec::new(),
            strs(&["qstat", "-j", "{pid}"]),
        );
        let t = task();
        t.set_pid("987");
        let status = backend.status_command(&t).unwrap();
        assert_eq!(status.program, "qstat");
        assert_eq!(status.args, vec!["-j", "987"]);
    }
}
