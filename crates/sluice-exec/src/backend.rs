//! The backend capability seam: how a task becomes a running process.
//!
//! The executioner loop is backend-agnostic. A [`Backend`] tells it which
//! cluster (if any) to allocate hosts from, how to stage a task onto its
//! host, and which command line actually runs it. Backends that cannot
//! signal their processes directly supply an explicit kill command.

use std::process::Stdio;

use async_trait::async_trait;

use sluice_cluster::{Cluster, Host};
use sluice_task::Task;
use sluice_types::Result;

// ---------------------------------------------------------------------------
// CmdSpec
// ---------------------------------------------------------------------------

/// A fully resolved command line, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CmdSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Build a spec from a command template, substituting `{placeholder}`
    /// occurrences in each element. An empty template is a caller bug caught
    /// earlier by config validation.
    pub fn from_template(template: &[String], vars: &[(&str, &str)]) -> Self {
        let expand = |s: &String| {
            let mut out = s.clone();
            for (key, value) in vars {
                out = out.replace(&format!("{{{}}}", key), value);
            }
            out
        };
        let mut parts = template.iter().map(expand);
        let program = parts.next().unwrap_or_default();
        Self {
            program,
            args: parts.collect(),
        }
    }

    /// Convert into a spawnable [`tokio::process::Command`] with stdout and
    /// stderr redirected to the given files (or discarded when absent).
    pub fn to_command(
        &self,
        stdout_file: Option<&str>,
        stderr_file: Option<&str>,
    ) -> Result<tokio::process::Command> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(match stdout_file {
            Some(path) => Stdio::from(std::fs::File::create(path)?),
            None => Stdio::null(),
        });
        cmd.stderr(match stderr_file {
            Some(path) => Stdio::from(std::fs::File::create(path)?),
            None => Stdio::null(),
        });
        Ok(cmd)
    }
}

impl std::fmt::Display for CmdSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Capabilities a concrete execution backend provides to the executioner.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short backend name used in logs and events.
    fn name(&self) -> &'static str;

    /// The cluster this backend allocates hosts from. `None` means the
    /// backend manages capacity itself and tasks are dispatched unthrottled.
    fn cluster(&self) -> Option<&Cluster> {
        None
    }

    /// Stage a task for execution: write its program file and, for remote
    /// backends, copy it to the selected host.
    async fn prepare(&self, task: &Task, host: Option<&Host>) -> Result<()> {
        let _ = host;
        task.create_program_file()
    }

    /// The command line that runs the task's program file.
    fn command(&self, task: &Task, host: Option<&Host>) -> Result<CmdSpec>;

    /// An out-of-band kill command for backends whose local child process is
    /// only a launcher (e.g. a scheduler submit client). `None` means the
    /// executioner signals the local process group instead.
    fn kill_command(&self, task: &Task) -> Option<CmdSpec> {
        let _ = task;
        None
    }

    /// A status probe for backends with non-blocking submission. The command
    /// must exit zero while the job is still known to the scheduler; the
    /// executioner polls it until the job disappears. `None` means the local
    /// child's exit is the job's exit.
    fn status_command(&self, task: &Task) -> Option<CmdSpec> {
        let _ = task;
        None
    }

    /// Called once before the executioner starts draining its queue.
    async fn on_run_start(&self) -> Result<()> {
        Ok(())
    }

    /// Called once after the executioner's queue is drained.
    async fn on_run_end(&self) {}
}
