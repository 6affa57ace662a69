//! The executioner: drains a queue of tasks and runs each on its backend.
//!
//! One service loop owns all bookkeeping. Per-task supervision runs in a
//! spawned worker that launches the process, watches for completion, timeout
//! or a kill request, and reports back over a completion channel. The loop
//! applies the resulting state transition, releases the task's host
//! allocation and re-offers tasks parked for capacity or dependencies.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use sluice_cluster::Host;
use sluice_task::{
    DependencyState, Task, TaskState, EXITCODE_ERROR, EXITCODE_KILLED, EXITCODE_TIMEOUT,
};
use sluice_types::{Result, SluiceError};

use crate::backend::{Backend, CmdSpec};
use crate::batch::BatchBackend;
use crate::config::{BackendKind, EngineConfig};
use crate::events::{EngineEvent, EventEmitter};
use crate::local::LocalBackend;
use crate::ssh::SshBackend;

/// Grace period between a polite SIGTERM and a hard kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How often a non-blocking batch submission is checked against the
/// scheduler's status command.
const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Tally of a completed executioner run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Tasks that reached `FINISHED` with valid outputs.
    pub finished: usize,
    /// Tasks that ended in `ERROR`, `ERROR_TIMEOUT`, `KILLED` or
    /// `START_FAILED`, or finished with missing outputs.
    pub failed: usize,
    /// Tasks that never ran because their dependencies failed or their
    /// resource request cannot be satisfied.
    pub skipped: usize,
}

/// Build the backend selected by an [`EngineConfig`].
pub fn backend_from_config(config: &EngineConfig) -> Result<Arc<dyn Backend>> {
    config.validate()?;
    Ok(match config.backend {
        BackendKind::Local => Arc::new(LocalBackend::new()),
        BackendKind::Ssh => Arc::new(SshBackend::new(
            &config.ssh_nodes,
            config.ssh_host.clone(),
            Duration::from_secs(config.host_info_interval_secs),
        )),
        BackendKind::Cluster => Arc::new(BatchBackend::new(
            config.cluster_submit.clone(),
            config.cluster_cancel.clone(),
            config.cluster_status.clone(),
        )),
    })
}

/// Runs queued tasks on a backend until the queue closes or a kill arrives.
pub struct Executioner {
    backend: Arc<dyn Backend>,
    events: EventEmitter,
    kill_tx: watch::Sender<bool>,
    queue_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<Arc<Task>>>>,
    queue_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Arc<Task>>>>,
    wait_after_task: Duration,
}

// ---------------------------------------------------------------------------
// Completion plumbing
// ---------------------------------------------------------------------------

/// What a supervision worker reports back to the service loop.
struct Completion {
    task: Arc<Task>,
    host: Option<Arc<Host>>,
    state: TaskState,
    exit_code: i32,
    error: Option<String>,
}

/// Everything a supervision worker needs, cloned out of the loop.
struct Supervise {
    backend: Arc<dyn Backend>,
    events: EventEmitter,
    task: Arc<Task>,
    host: Option<Arc<Host>>,
    kill_rx: watch::Receiver<bool>,
    done_tx: mpsc::UnboundedSender<Completion>,
    wait_after_task: Duration,
}

impl Executioner {
    pub fn new(backend: Arc<dyn Backend>, config: &EngineConfig) -> Self {
        let (kill_tx, _) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            events: EventEmitter::default(),
            kill_tx,
            queue_tx: std::sync::Mutex::new(Some(queue_tx)),
            queue_rx: std::sync::Mutex::new(Some(queue_rx)),
            wait_after_task: Duration::from_millis(config.wait_after_task_run_ms),
        }
    }

    /// Build an executioner straight from a config file's settings.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Ok(Self::new(backend_from_config(config)?, config))
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Queue a task for execution. Fails once the queue has been closed.
    pub fn submit(&self, task: Arc<Task>) -> Result<()> {
        let guard = self.queue_tx.lock().map_err(|_| poisoned())?;
        let sender = guard
            .as_ref()
            .ok_or_else(|| SluiceError::Other("task queue is closed".into()))?;
        self.events.emit(EngineEvent::TaskQueued {
            task_id: task.id().to_string(),
        });
        sender
            .send(task)
            .map_err(|_| SluiceError::Other("task queue is closed".into()))
    }

    /// Close the queue. [`run`](Self::run) returns once everything already
    /// queued has completed.
    pub fn close_queue(&self) {
        if let Ok(mut guard) = self.queue_tx.lock() {
            guard.take();
        }
    }

    /// Request termination: intake closes, queued tasks go straight to
    /// `KILLED`, running tasks are signalled and awaited.
    pub fn kill(&self) {
        self.events.emit(EngineEvent::KillRequested);
        self.close_queue();
        // send_replace stores the flag even before run() has subscribed.
        self.kill_tx.send_replace(true);
    }

    /// Drain the queue, executing tasks subject to resource availability.
    /// Returns when the queue is closed and no task is in flight, or after a
    /// kill request has been fully honored. May only be called once.
    pub async fn run(&self) -> Result<RunSummary> {
        let mut queue_rx = self
            .queue_rx
            .lock()
            .map_err(|_| poisoned())?
            .take()
            .ok_or_else(|| SluiceError::Other("executioner is already running".into()))?;

        self.backend.on_run_start().await?;
        self.events.emit(EngineEvent::ExecutionerStarted {
            backend: self.backend.name().to_string(),
        });
        tracing::info!(backend = self.backend.name(), "executioner started");

        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let mut kill_rx = self.kill_tx.subscribe();
        let mut parked: Vec<Arc<Task>> = Vec::new();
        let mut in_flight: usize = 0;
        let mut summary = RunSummary::default();
        let mut queue_open = true;
        let mut killed = *kill_rx.borrow();

        if killed {
            queue_open = false;
            self.drain_queue_killed(&mut queue_rx, &mut summary);
        }

        let result = 'serve: loop {
            if !queue_open && in_flight == 0 {
                // Give parked tasks a last chance: capacity is all free now.
                let stuck = std::mem::take(&mut parked);
                for task in stuck {
                    if let Err(e) =
                        self.offer(task, &mut parked, &mut in_flight, &done_tx, &mut summary)
                    {
                        break 'serve Err(e);
                    }
                }
                if in_flight == 0 {
                    for task in parked.drain(..) {
                        self.skip(&task, "task can never run: unresolved dependencies or a request no host can satisfy");
                        summary.skipped += 1;
                    }
                    break 'serve Ok(summary);
                }
            }

            tokio::select! {
                received = queue_rx.recv(), if queue_open => match received {
                    Some(task) => {
                        if let Err(e) =
                            self.offer(task, &mut parked, &mut in_flight, &done_tx, &mut summary)
                        {
                            break 'serve Err(e);
                        }
                    }
                    None => queue_open = false,
                },
                Some(done) = done_rx.recv() => {
                    in_flight -= 1;
                    self.finish(done, &mut summary);
                    let retry = std::mem::take(&mut parked);
                    for task in retry {
                        if killed {
                            self.kill_queued(&task, &mut summary);
                        } else if let Err(e) =
                            self.offer(task, &mut parked, &mut in_flight, &done_tx, &mut summary)
                        {
                            break 'serve Err(e);
                        }
                    }
                }
                changed = kill_rx.changed(), if !killed => {
                    if changed.is_err() || *kill_rx.borrow() {
                        killed = true;
                        queue_open = false;
                        self.drain_queue_killed(&mut queue_rx, &mut summary);
                        for task in parked.drain(..) {
                            self.kill_queued(&task, &mut summary);
                        }
                        // Running tasks observe the same watch and wind down
                        // on their own; their completions drain above.
                    }
                }
            }
        };

        self.backend.on_run_end().await;
        self.events.emit(EngineEvent::ExecutionerStopped {
            backend: self.backend.name().to_string(),
            finished: summary.finished,
            failed: summary.failed,
        });
        tracing::info!(
            backend = self.backend.name(),
            finished = summary.finished,
            failed = summary.failed,
            skipped = summary.skipped,
            "executioner stopped"
        );
        result
    }

    // --- loop internals ---

    /// Dispatch a task if it is ready and a host is available; otherwise park
    /// it. Dependency failures skip the task without aborting its siblings.
    fn offer(
        &self,
        task: Arc<Task>,
        parked: &mut Vec<Arc<Task>>,
        in_flight: &mut usize,
        done_tx: &mpsc::UnboundedSender<Completion>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        match task.dependency_state()? {
            DependencyState::Wait => {
                parked.push(task);
                return Ok(());
            }
            DependencyState::Error => {
                self.skip(&task, "a dependency failed");
                summary.skipped += 1;
                return Ok(());
            }
            DependencyState::Ok => {}
        }

        let host = match self.backend.cluster() {
            Some(cluster) => {
                if cluster.is_empty() {
                    None
                } else {
                    match cluster.select_host(task.resources(), task.node()) {
                        Some(host) => Some(host),
                        None => {
                            tracing::debug!(task = task.id(), "no host available, task parked");
                            parked.push(task);
                            return Ok(());
                        }
                    }
                }
            }
            None => None,
        };

        *in_flight += 1;
        tokio::spawn(supervise(Supervise {
            backend: self.backend.clone(),
            events: self.events.clone(),
            task,
            host,
            kill_rx: self.kill_tx.subscribe(),
            done_tx: done_tx.clone(),
            wait_after_task: self.wait_after_task,
        }));
        Ok(())
    }

    /// Apply a completion: final state, exit code file, host release, events.
    fn finish(&self, done: Completion, summary: &mut RunSummary) {
        let task = &done.task;
        if let Err(e) = task.set_state(done.state) {
            tracing::error!(task = task.id(), error = %e, "inconsistent completion state");
        }
        task.set_exit_code(done.exit_code);
        if let Some(msg) = &done.error {
            task.set_error_msg(msg.clone());
        }
        if let Some(path) = task.exit_code_file() {
            if let Err(e) = std::fs::write(&path, format!("{}\n", done.exit_code)) {
                tracing::warn!(task = task.id(), error = %e, "could not write exit code file");
            }
        }
        if let Some(host) = &done.host {
            host.release(task.resources());
        }

        match done.state {
            TaskState::Finished => {
                let check = task.check_output_files();
                if check.is_empty() {
                    summary.finished += 1;
                } else {
                    tracing::warn!(task = task.id(), "{}", check.trim_end());
                    summary.failed += 1;
                }
                self.events.emit(EngineEvent::TaskFinished {
                    task_id: task.id().to_string(),
                    state: done.state.to_string(),
                    exit_code: done.exit_code,
                });
            }
            TaskState::Killed => {
                summary.failed += 1;
                self.events.emit(EngineEvent::TaskKilled {
                    task_id: task.id().to_string(),
                });
            }
            TaskState::StartFailed => {
                summary.failed += 1;
                self.events.emit(EngineEvent::TaskStartFailed {
                    task_id: task.id().to_string(),
                    error: done.error.unwrap_or_default(),
                });
            }
            _ => {
                summary.failed += 1;
                self.events.emit(EngineEvent::TaskFinished {
                    task_id: task.id().to_string(),
                    state: done.state.to_string(),
                    exit_code: done.exit_code,
                });
            }
        }
    }

    /// Move a task that never started straight to `KILLED`.
    fn kill_queued(&self, task: &Arc<Task>, summary: &mut RunSummary) {
        if let Err(e) = task.set_state(TaskState::Killed) {
            tracing::error!(task = task.id(), error = %e, "could not kill queued task");
            return;
        }
        task.set_exit_code(EXITCODE_KILLED);
        summary.failed += 1;
        self.events.emit(EngineEvent::TaskKilled {
            task_id: task.id().to_string(),
        });
    }

    fn drain_queue_killed(
        &self,
        queue_rx: &mut mpsc::UnboundedReceiver<Arc<Task>>,
        summary: &mut RunSummary,
    ) {
        while let Ok(task) = queue_rx.try_recv() {
            self.kill_queued(&task, summary);
        }
    }

    fn skip(&self, task: &Arc<Task>, reason: &str) {
        tracing::warn!(task = task.id(), reason, "task skipped");
        task.set_error_msg(reason);
        self.events.emit(EngineEvent::TaskSkipped {
            task_id: task.id().to_string(),
            reason: reason.to_string(),
        });
    }
}

fn poisoned() -> SluiceError {
    SluiceError::Other("executioner queue lock poisoned".into())
}

// ---------------------------------------------------------------------------
// Per-task supervision
// ---------------------------------------------------------------------------

/// Launch one task and watch it to completion. Always sends exactly one
/// [`Completion`] back to the service loop.
async fn supervise(ctx: Supervise) {
    let (state, exit_code, error) = run_one(&ctx).await;
    if ctx.wait_after_task > Duration::ZERO {
        tokio::time::sleep(ctx.wait_after_task).await;
    }
    let _ = ctx.done_tx.send(Completion {
        task: ctx.task.clone(),
        host: ctx.host.clone(),
        state,
        exit_code,
        error,
    });
}

async fn run_one(ctx: &Supervise) -> (TaskState, i32, Option<String>) {
    let task = &ctx.task;

    let start_failed = |msg: String| {
        tracing::warn!(task = task.id(), "start failed: {msg}");
        if let Err(e) = task.set_state(TaskState::StartFailed) {
            tracing::error!(task = task.id(), error = %e, "bad start-failure transition");
        }
        (TaskState::StartFailed, EXITCODE_ERROR, Some(msg))
    };

    if let Err(e) = ctx.backend.prepare(task, ctx.host.as_deref()).await {
        return start_failed(format!("could not stage task: {e}"));
    }
    let spec = match ctx.backend.command(task, ctx.host.as_deref()) {
        Ok(spec) => spec,
        Err(e) => return start_failed(format!("could not build command: {e}")),
    };
    let mut cmd = match spec.to_command(
        task.stdout_file().as_deref(),
        task.stderr_file().as_deref(),
    ) {
        Ok(cmd) => cmd,
        Err(e) => return start_failed(format!("could not open output files: {e}")),
    };
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let err = SluiceError::SpawnFailed {
                task: task.id().to_string(),
                message: format!("{spec}: {e}"),
            };
            return start_failed(err.to_string());
        }
    };

    for state in [TaskState::Started, TaskState::Running] {
        if let Err(e) = task.set_state(state) {
            tracing::error!(task = task.id(), error = %e, "bad launch transition");
        }
    }
    if let Some(pid) = child.id() {
        task.set_pid(pid.to_string());
    }
    ctx.events.emit(EngineEvent::TaskStarted {
        task_id: task.id().to_string(),
        host: ctx.host.as_ref().map(|h| h.name().to_string()),
        pid: child.id(),
    });
    tracing::debug!(task = task.id(), pid = child.id(), "task running");

    let timeout_secs = task.resources().timeout_secs;
    let timeout = tokio::time::sleep(Duration::from_secs(timeout_secs.max(1)));
    tokio::pin!(timeout);
    let mut kill_rx = ctx.kill_rx.clone();
    let mut kill_armed = true;
    let status_spec = ctx.backend.status_command(task);
    let mut status_poll = tokio::time::interval(STATUS_POLL_INTERVAL);
    status_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Only polled once a non-blocking submit client has returned.
    let mut submitted = false;

    if *kill_rx.borrow() {
        terminate(ctx, &mut child).await;
        return (TaskState::Killed, EXITCODE_KILLED, None);
    }

    loop {
        tokio::select! {
            status = child.wait(), if !submitted => {
                let code = match status {
                    Ok(status) => match status.code() {
                        Some(code) => code,
                        // Killed by an external signal.
                        None => return (TaskState::Error, EXITCODE_ERROR, Some("terminated by signal".into())),
                    },
                    Err(e) => return (TaskState::Error, EXITCODE_ERROR, Some(format!("wait failed: {e}"))),
                };
                match (&status_spec, code) {
                    // Submit client accepted the job; track it via status polls.
                    (Some(_), 0) => {
                        submitted = true;
                        status_poll.reset();
                    }
                    _ => return (TaskState::from_exit_code(code), code, None),
                }
            }
            _ = status_poll.tick(), if submitted => {
                if let Some(spec) = &status_spec {
                    if !job_still_queued(ctx, spec).await {
                        let code = read_exit_code_file(task);
                        return (TaskState::from_exit_code(code), code, None);
                    }
                }
            }
            _ = &mut timeout, if timeout_secs > 0 => {
                tracing::warn!(task = task.id(), timeout_secs, "task timed out");
                terminate(ctx, &mut child).await;
                return (TaskState::ErrorTimeout, EXITCODE_TIMEOUT, Some("timeout exceeded".into()));
            }
            changed = kill_rx.changed(), if kill_armed => {
                match changed {
                    Ok(()) if *kill_rx.borrow() => {
                        terminate(ctx, &mut child).await;
                        return (TaskState::Killed, EXITCODE_KILLED, None);
                    }
                    Ok(()) => {}
                    Err(_) => kill_armed = false,
                }
            }
        }
    }
}

/// Run the scheduler's status command; zero exit means the job is still
/// queued or running.
async fn job_still_queued(ctx: &Supervise, spec: &CmdSpec) -> bool {
    match spec.to_command(None, None) {
        Ok(mut cmd) => match cmd.status().await {
            Ok(status) => status.success(),
            Err(e) => {
                tracing::warn!(task = ctx.task.id(), %spec, error = %e, "status command failed");
                false
            }
        },
        Err(e) => {
            tracing::warn!(task = ctx.task.id(), %spec, error = %e, "status command failed");
            false
        }
    }
}

/// Exit code left behind by the job's wrapper script, zero when unreadable.
fn read_exit_code_file(task: &Task) -> i32 {
    task.exit_code_file()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|text| text.trim().parse().ok())
        .unwrap_or(0)
}

/// Stop a running task: backend cancel command if it has one, SIGTERM to the
/// local process group, then a hard kill after the grace period.
async fn terminate(ctx: &Supervise, child: &mut tokio::process::Child) {
    if let Some(spec) = ctx.backend.kill_command(&ctx.task) {
        run_kill_command(ctx, &spec).await;
    }
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        tracing::warn!(task = ctx.task.id(), "task ignored SIGTERM, killing");
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
        let _ = child.kill().await;
    }
}

async fn run_kill_command(ctx: &Supervise, spec: &CmdSpec) {
    match spec.to_command(None, None) {
        Ok(mut cmd) => match cmd.status().await {
            Ok(status) if status.success() => {}
            Ok(status) => {
                tracing::warn!(task = ctx.task.id(), %spec, %status, "cancel command failed");
            }
            Err(e) => {
                tracing::warn!(task = ctx.task.id(), %spec, error = %e, "cancel command failed");
            }
        },
        Err(e) => {
            tracing::warn!(task = ctx.task.id(), %spec, error = %e, "cancel command failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_task::TaskSpec;

    fn local_executioner() -> Executioner {
        Executioner::new(Arc::new(LocalBackend::new()), &EngineConfig::default())
    }

    fn shell_task(dir: &std::path::Path, id: &str, program: &str) -> Arc<Task> {
        Arc::new(Task::new(TaskSpec {
            id: Some(id.into()),
            program: program.into(),
            program_file: Some(dir.join(format!("{id}.sh")).to_string_lossy().into_owned()),
            ..TaskSpec::default()
        }))
    }

    #[tokio::test]
    async fn runs_a_task_to_finished() {
        let dir = tempfile::tempdir().unwrap();
        let exec = local_executioner();
        let task = shell_task(dir.path(), "t1", "echo hello");

        exec.submit(task.clone()).unwrap();
        exec.close_queue();
        let summary = exec.run().await.unwrap();

        assert_eq!(task.state(), TaskState::Finished);
        assert_eq!(task.exit_code(), 0);
        assert_eq!(summary.finished, 1);
        assert_eq!(summary.failed, 0);

        let stdout = std::fs::read_to_string(task.stdout_file().unwrap()).unwrap();
        assert_eq!(stdout.trim(), "hello");
        let exit = std::fs::read_to_string(task.exit_code_file().unwrap()).unwrap();
        assert_eq!(exit.trim(), "0");
    }

    #[tokio::test]
    async fn failing_task_does_not_abort_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let exec = local_executioner();
        let bad = shell_task(dir.path(), "bad", "exit 1");
        let good = shell_task(dir.path(), "good", "true");

        exec.submit(bad.clone()).unwrap();
        exec.submit(good.clone()).unwrap();
        exec.close_queue();
        let summary = exec.run().await.unwrap();

        assert_eq!(bad.state(), TaskState::Error);
        assert_eq!(bad.exit_code(), 1);
        assert_eq!(good.state(), TaskState::Finished);
        assert_eq!(summary.finished, 1);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn downstream_task_waits_for_its_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let exec = local_executioner();
        let first = shell_task(dir.path(), "first", "true");
        let second = shell_task(dir.path(), "second", "true");
        second.add_dependency(first.clone());

        // Queue the dependent one first so it has to be parked.
        exec.submit(second.clone()).unwrap();
        exec.submit(first.clone()).unwrap();
        exec.close_queue();
        let summary = exec.run().await.unwrap();

        assert_eq!(first.state(), TaskState::Finished);
        assert_eq!(second.state(), TaskState::Finished);
        assert_eq!(summary.finished, 2);
    }

    #[tokio::test]
    async fn dependency_failure_skips_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let exec = local_executioner();
        let first = shell_task(dir.path(), "first", "exit 1");
        let second = shell_task(dir.path(), "second", "true");
        second.add_dependency(first.clone());

        exec.submit(second.clone()).unwrap();
        exec.submit(first.clone()).unwrap();
        exec.close_queue();
        let summary = exec.run().await.unwrap();

        assert_eq!(first.state(), TaskState::Error);
        assert_eq!(second.state(), TaskState::None);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn tolerated_failure_unblocks_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let exec = local_executioner();
        let first = Arc::new(Task::new(TaskSpec {
            id: Some("first".into()),
            program: "exit 1".into(),
            program_file: Some(dir.path().join("first.sh").to_string_lossy().into_owned()),
            can_fail: true,
            ..TaskSpec::default()
        }));
        let second = shell_task(dir.path(), "second", "true");
        second.add_dependency(first.clone());

        exec.submit(second.clone()).unwrap();
        exec.submit(first.clone()).unwrap();
        exec.close_queue();
        exec.run().await.unwrap();

        assert_eq!(first.state(), TaskState::Error);
        assert_eq!(second.state(), TaskState::Finished);
    }

    #[tokio::test]
    async fn kill_terminates_running_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Arc::new(local_executioner());
        let task = shell_task(dir.path(), "sleeper", "sleep 30");
        let mut events = exec.events().subscribe();

        exec.submit(task.clone()).unwrap();
        exec.close_queue();

        let runner = {
            let exec = exec.clone();
            tokio::spawn(async move { exec.run().await })
        };
        loop {
            match events.recv().await.unwrap() {
                EngineEvent::TaskStarted { .. } => break,
                _ => {}
            }
        }
        exec.kill();
        let summary = runner.await.unwrap().unwrap();

        assert_eq!(task.state(), TaskState::Killed);
        assert_eq!(task.exit_code(), EXITCODE_KILLED);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn kill_before_run_kills_queued_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let exec = local_executioner();
        let task = shell_task(dir.path(), "queued", "true");

        exec.submit(task.clone()).unwrap();
        exec.close_queue();
        exec.kill();
        exec.kill(); // repeated requests are harmless
        let summary = exec.run().await.unwrap();

        assert_eq!(task.state(), TaskState::Killed);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn kill_closes_the_intake_queue() {
        let dir = tempfile::tempdir().unwrap();
        let exec = local_executioner();
        let queued = shell_task(dir.path(), "queued", "true");
        let late = shell_task(dir.path(), "late", "true");

        exec.submit(queued.clone()).unwrap();
        exec.kill();

        assert!(exec.submit(late.clone()).is_err());
        let summary = exec.run().await.unwrap();

        assert_eq!(queued.state(), TaskState::Killed);
        assert_eq!(late.state(), TaskState::None);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn timeout_maps_to_error_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let exec = local_executioner();
        let task = Arc::new(Task::new(TaskSpec {
            id: Some("slow".into()),
            program: "sleep 30".into(),
            program_file: Some(dir.path().join("slow.sh").to_string_lossy().into_owned()),
            resources: sluice_cluster::HostResources {
                timeout_secs: 1,
                ..sluice_cluster::HostResources::default()
            },
            ..TaskSpec::default()
        }));

        exec.submit(task.clone()).unwrap();
        exec.close_queue();
        let summary = exec.run().await.unwrap();

        assert_eq!(task.state(), TaskState::ErrorTimeout);
        assert_eq!(task.exit_code(), EXITCODE_TIMEOUT);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn unlaunchable_task_is_start_failed() {
        let dir = tempfile::tempdir().unwrap();
        // Parent of the program file is a regular file, so staging fails.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let exec = local_executioner();
        let task = Arc::new(Task::new(TaskSpec {
            id: Some("t1".into()),
            program: "true".into(),
            program_file: Some(blocker.join("t1.sh").to_string_lossy().into_owned()),
            ..TaskSpec::default()
        }));

        exec.submit(task.clone()).unwrap();
        exec.close_queue();
        let summary = exec.run().await.unwrap();

        assert_eq!(task.state(), TaskState::StartFailed);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn throttled_backend_still_runs_everything() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Executioner::new(
            Arc::new(LocalBackend::with_max_cpus(1)),
            &EngineConfig::default(),
        );
        let mut tasks = Vec::new();
        for i in 0..3 {
            let task = shell_task(dir.path(), &format!("t{i}"), "sleep 0.1");
            exec.submit(task.clone()).unwrap();
            tasks.push(task);
        }
        exec.close_queue();
        let summary = exec.run().await.unwrap();

        assert_eq!(summary.finished, 3);
        for task in tasks {
            assert_eq!(task.state(), TaskState::Finished);
        }
    }

    #[tokio::test]
    async fn oversized_request_is_skipped_not_hung() {
        let dir = tempfile::tempdir().unwrap();
        let exec = Executioner::new(
            Arc::new(LocalBackend::with_max_cpus(2)),
            &EngineConfig::default(),
        );
        let task = Arc::new(Task::new(TaskSpec {
            id: Some("huge".into()),
            program: "true".into(),
            program_file: Some(dir.path().join("huge.sh").to_string_lossy().into_owned()),
            resources: sluice_cluster::HostResources::new(64, 0, 0),
            ..TaskSpec::default()
        }));

        exec.submit(task.clone()).unwrap();
        exec.close_queue();
        let summary = exec.run().await.unwrap();

        assert_eq!(task.state(), TaskState::None);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let exec = local_executioner();
        exec.close_queue();
        exec.run().await.unwrap();
        assert!(exec.run().await.is_err());
    }

    #[test]
    fn backend_factory_honors_config() {
        let local = backend_from_config(&EngineConfig::default()).unwrap();
        assert_eq!(local.name(), "local");

        let ssh_config = EngineConfig {
            backend: BackendKind::Ssh,
            ssh_nodes: vec!["node1".into()],
            ..EngineConfig::default()
        };
        assert_eq!(backend_from_config(&ssh_config).unwrap().name(), "ssh");

        let bad = EngineConfig {
            backend: BackendKind::Cluster,
            ..EngineConfig::default()
        };
        assert!(backend_from_config(&bad).is_err());
    }
}
