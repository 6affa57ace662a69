//! The task unit of work and its execution-state machine.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sluice_cluster::HostResources;
use sluice_types::{Result, SluiceError};

/// Shebang prepended to every generated program file. `-e` stops the script
/// after the first failing command.
pub const SHEBANG: &str = "#!/bin/sh -e\n\n";

/// Reserved exit codes reported by backend processes.
pub const EXITCODE_OK: i32 = 0;
pub const EXITCODE_ERROR: i32 = 1;
pub const EXITCODE_TIMEOUT: i32 = 2;
pub const EXITCODE_KILLED: i32 = 3;

/// Number of stdout/stderr lines shown in failure reports.
const REPORT_TAIL_LINES: usize = 10;

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

/// Execution lifecycle state. Legal transitions:
///
/// ```text
/// NONE -> STARTED -> RUNNING -> {FINISHED | ERROR | ERROR_TIMEOUT | KILLED}
/// NONE -> START_FAILED
/// {NONE, STARTED, RUNNING} -> KILLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    None,
    Started,
    StartFailed,
    Running,
    Error,
    ErrorTimeout,
    Killed,
    Finished,
}

impl TaskState {
    /// Map a backend-reported exit code to a terminal state. Total: unknown
    /// codes map to `Error`.
    pub fn from_exit_code(exit_code: i32) -> TaskState {
        match exit_code {
            EXITCODE_OK => TaskState::Finished,
            EXITCODE_ERROR => TaskState::Error,
            EXITCODE_TIMEOUT => TaskState::ErrorTimeout,
            EXITCODE_KILLED => TaskState::Killed,
            _ => TaskState::Error,
        }
    }

    /// Checkpoint record name for this state.
    pub fn name(&self) -> &'static str {
        match self {
            TaskState::None => "NONE",
            TaskState::Started => "STARTED",
            TaskState::StartFailed => "START_FAILED",
            TaskState::Running => "RUNNING",
            TaskState::Error => "ERROR",
            TaskState::ErrorTimeout => "ERROR_TIMEOUT",
            TaskState::Killed => "KILLED",
            TaskState::Finished => "FINISHED",
        }
    }

    pub fn parse(name: &str) -> Option<TaskState> {
        Some(match name {
            "NONE" => TaskState::None,
            "STARTED" => TaskState::Started,
            "START_FAILED" => TaskState::StartFailed,
            "RUNNING" => TaskState::Running,
            "ERROR" => TaskState::Error,
            "ERROR_TIMEOUT" => TaskState::ErrorTimeout,
            "KILLED" => TaskState::Killed,
            "FINISHED" => TaskState::Finished,
            _ => return None,
        })
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// DependencyState
// ---------------------------------------------------------------------------

/// Readiness verdict for a task with upstream dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyState {
    /// All dependencies finished successfully; the task may run now.
    Ok,
    /// A dependency is still pending or running.
    Wait,
    /// A dependency failed and does not tolerate failure.
    Error,
}

// ---------------------------------------------------------------------------
// TaskSpec
// ---------------------------------------------------------------------------

/// Descriptor handed over by the front-end (or a manifest entry) to build a
/// [`Task`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task id; generated when absent.
    pub id: Option<String>,
    /// Program text to run.
    pub program: String,
    /// Path where the program file is materialized; derived from the id and
    /// the system temp dir when absent.
    pub program_file: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub resources: HostResources,
    /// Ids of upstream tasks that must finish first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub can_fail: bool,
    /// Tolerate zero-length output files.
    #[serde(default)]
    pub allow_empty: bool,
    /// Preferred execution node.
    pub node: Option<String>,
    /// Preferred execution queue.
    pub queue: Option<String>,
    /// Source file of the statement that created this task.
    pub src_file: Option<String>,
    #[serde(default)]
    pub src_line: u32,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Mutable runtime fields, all behind one lock so the task's externally
/// visible state is always consistent.
#[derive(Debug)]
struct Runtime {
    state: TaskState,
    exit_code: i32,
    pid: Option<String>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    /// Memoized output-file validation errors, computed at most once after
    /// the task finishes.
    output_check: Option<String>,
    stdout_file: Option<String>,
    stderr_file: Option<String>,
    exit_code_file: Option<String>,
    error_msg: Option<String>,
}

/// A unit of schedulable work.
///
/// The immutable description (id, program, file lists, resource request) is
/// plain fields; everything that changes during execution lives in a single
/// mutex. Tasks are shared as `Arc<Task>` between the front-end, the
/// registry, the resolver and the executioner, and are never destroyed
/// during a run.
pub struct Task {
    id: String,
    src_file: String,
    src_line: u32,
    program_txt: String,
    program_file: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    resources: HostResources,
    node: Option<String>,
    queue: Option<String>,
    can_fail: bool,
    allow_empty: bool,
    depends_on: Vec<String>,
    dependencies: Mutex<Vec<Arc<Task>>>,
    runtime: Mutex<Runtime>,
}

impl Task {
    pub fn new(spec: TaskSpec) -> Self {
        let id = spec
            .id
            .unwrap_or_else(|| format!("task-{}", uuid::Uuid::new_v4()));
        let program_file = spec.program_file.unwrap_or_else(|| {
            std::env::temp_dir()
                .join("sluice")
                .join(format!("{id}.sh"))
                .to_string_lossy()
                .into_owned()
        });
        Self {
            id,
            src_file: spec.src_file.unwrap_or_default(),
            src_line: spec.src_line,
            program_txt: spec.program,
            program_file,
            inputs: spec.inputs,
            outputs: spec.outputs,
            resources: spec.resources,
            node: spec.node,
            queue: spec.queue,
            can_fail: spec.can_fail,
            allow_empty: spec.allow_empty,
            depends_on: spec.depends_on,
            dependencies: Mutex::new(Vec::new()),
            runtime: Mutex::new(Runtime {
                state: TaskState::None,
                exit_code: 0,
                pid: None,
                started_at: None,
                ended_at: None,
                output_check: None,
                stdout_file: None,
                stderr_file: None,
                exit_code_file: None,
                error_msg: None,
            }),
        }
    }

    // --- immutable accessors ---

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn src_file(&self) -> &str {
        &self.src_file
    }

    pub fn src_line(&self) -> u32 {
        self.src_line
    }

    pub fn program_txt(&self) -> &str {
        &self.program_txt
    }

    pub fn program_file(&self) -> &str {
        &self.program_file
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn resources(&self) -> &HostResources {
        &self.resources
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn can_fail(&self) -> bool {
        self.can_fail
    }

    pub fn allow_empty(&self) -> bool {
        self.allow_empty
    }

    // --- dependencies ---

    /// Ids the front-end declared in `depends_on`, before resolution to
    /// actual task references.
    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    /// Add an upstream task that must finish before this one starts.
    pub fn add_dependency(&self, upstream: Arc<Task>) {
        self.dependencies.lock().unwrap().push(upstream);
    }

    pub fn dependencies(&self) -> Vec<Arc<Task>> {
        self.dependencies.lock().unwrap().clone()
    }

    /// Drop upstream links that no longer gate this task, e.g. dependencies
    /// already satisfied by a previous run.
    pub fn retain_dependencies<F: FnMut(&Arc<Task>) -> bool>(&self, f: F) {
        self.dependencies.lock().unwrap().retain(f);
    }

    pub fn dependency_ids(&self) -> Vec<String> {
        self.dependencies
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.id.clone())
            .collect()
    }

    // --- state machine ---

    pub fn state(&self) -> TaskState {
        self.runtime.lock().unwrap().state
    }

    /// Request a state transition. Illegal transitions indicate a scheduler
    /// bug: they return a fatal error and leave the state unchanged.
    ///
    /// A no-op transition (`new_state` equals the current state) is allowed,
    /// and `StartFailed` requested while `Killed` is idempotent.
    pub fn set_state(&self, new_state: TaskState) -> Result<()> {
        let mut rt = self.runtime.lock().unwrap();
        if new_state == rt.state {
            return Ok(());
        }

        let illegal = |rt: &Runtime| SluiceError::IllegalTransition {
            task: self.id.clone(),
            from: rt.state.name().into(),
            to: new_state.name().into(),
        };

        match new_state {
            TaskState::Started => {
                if rt.state != TaskState::None {
                    return Err(illegal(&rt));
                }
                rt.state = new_state;
            }
            TaskState::StartFailed => match rt.state {
                TaskState::None => {
                    rt.state = new_state;
                    let now = Utc::now();
                    rt.started_at = Some(now);
                    rt.ended_at = Some(now);
                }
                TaskState::Killed => {} // already killed, keep it
                _ => return Err(illegal(&rt)),
            },
            TaskState::Running => {
                if rt.state != TaskState::Started {
                    return Err(illegal(&rt));
                }
                rt.state = new_state;
                rt.started_at = Some(Utc::now());
            }
            TaskState::Finished | TaskState::Error | TaskState::ErrorTimeout => {
                if rt.state != TaskState::Running {
                    return Err(illegal(&rt));
                }
                rt.state = new_state;
                rt.ended_at = Some(Utc::now());
            }
            TaskState::Killed => match rt.state {
                TaskState::Running | TaskState::Started | TaskState::None => {
                    rt.state = new_state;
                    rt.ended_at = Some(Utc::now());
                }
                _ => return Err(illegal(&rt)),
            },
            TaskState::None => return Err(illegal(&rt)),
        }
        Ok(())
    }

    /// Allow the task to be re-executed (used when resuming a run with
    /// unfinished tasks in the checkpoint).
    pub fn reset(&self) {
        let mut rt = self.runtime.lock().unwrap();
        rt.state = TaskState::None;
        rt.exit_code = 0;
        rt.pid = None;
        rt.started_at = None;
        rt.ended_at = None;
        rt.output_check = None;
        rt.error_msg = None;
    }

    /// Restore state from a checkpoint record without transition checks.
    pub(crate) fn restore(&self, state: TaskState, exit_code: i32) {
        let mut rt = self.runtime.lock().unwrap();
        rt.state = state;
        rt.exit_code = exit_code;
    }

    // --- exit code / pid ---

    pub fn exit_code(&self) -> i32 {
        self.runtime.lock().unwrap().exit_code
    }

    pub fn set_exit_code(&self, exit_code: i32) {
        self.runtime.lock().unwrap().exit_code = exit_code;
    }

    /// Exit code with output validation folded in: a finished task whose
    /// outputs failed validation reports failure even if the process exited
    /// zero.
    pub fn effective_exit_code(&self) -> i32 {
        if !self.check_output_files().is_empty() {
            return EXITCODE_ERROR;
        }
        self.exit_code()
    }

    pub fn pid(&self) -> Option<String> {
        self.runtime.lock().unwrap().pid.clone()
    }

    pub fn set_pid(&self, pid: impl Into<String>) {
        self.runtime.lock().unwrap().pid = Some(pid.into());
    }

    pub fn set_error_msg(&self, msg: impl Into<String>) {
        self.runtime.lock().unwrap().error_msg = Some(msg.into());
    }

    // --- derived predicates ---

    pub fn is_started(&self) -> bool {
        self.state() != TaskState::None
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self.state(),
            TaskState::StartFailed | TaskState::Error | TaskState::ErrorTimeout | TaskState::Killed
        )
    }

    /// Finished, either successfully or with an error.
    pub fn is_done(&self) -> bool {
        self.is_error() || self.state() == TaskState::Finished
    }

    /// Finished, exit code zero, and every declared output passed validation.
    pub fn is_done_ok(&self) -> bool {
        self.state() == TaskState::Finished
            && self.exit_code() == 0
            && self.check_output_files().is_empty()
    }

    /// Error state, non-zero exit code, or failed output validation.
    pub fn is_failed(&self) -> bool {
        self.is_error() || self.exit_code() != 0 || !self.check_output_files().is_empty()
    }

    pub fn can_run(&self) -> bool {
        self.state() == TaskState::None
    }

    /// Seconds this task has been executing. `None` until it starts running.
    pub fn elapsed_secs(&self) -> Option<i64> {
        let rt = self.runtime.lock().unwrap();
        let start = rt.started_at?;
        let end = rt.ended_at.unwrap_or_else(Utc::now);
        Some((end - start).num_seconds())
    }

    /// Has the task exceeded its declared timeout? Only meaningful once
    /// started; a zero timeout means unlimited.
    pub fn is_timed_out(&self) -> bool {
        if self.resources.timeout_secs == 0 {
            return false;
        }
        match self.elapsed_secs() {
            Some(elapsed) => elapsed > self.resources.timeout_secs as i64,
            None => false,
        }
    }

    // --- output validation ---

    /// Validate declared output files: each must exist, and unless
    /// `allow_empty` is set, be non-empty (a directory counts as present only
    /// when non-empty). Only evaluated once the task is `Finished`; the
    /// result is memoized.
    pub fn check_output_files(&self) -> String {
        let mut rt = self.runtime.lock().unwrap();
        if let Some(memo) = &rt.output_check {
            return memo.clone();
        }
        if rt.state != TaskState::Finished || self.outputs.is_empty() {
            return String::new();
        }

        let mut errors = String::new();
        for file_name in &self.outputs {
            if let Some(err) = check_output_file(file_name, self.allow_empty) {
                errors.push_str(&err);
            }
        }

        if !errors.is_empty() {
            tracing::warn!(task = %self.id, "{}", errors.trim_end());
        }
        rt.output_check = Some(errors.clone());
        errors
    }

    // --- readiness resolver ---

    /// Decide whether this task may run now, given its upstream
    /// dependencies. A dependency cycle is a fatal configuration error.
    pub fn dependency_state(&self) -> Result<DependencyState> {
        let mut visit = Visit::default();
        self.dependency_state_visit(&mut visit)
    }

    fn dependency_state_visit(&self, visit: &mut Visit) -> Result<DependencyState> {
        if self.is_done() {
            if self.can_fail || self.is_done_ok() {
                return Ok(DependencyState::Ok);
            }
            return Ok(DependencyState::Error);
        }
        // Already started but not finished: never restart a started task.
        if self.is_started() {
            return Ok(DependencyState::Wait);
        }
        let dependencies = self.dependencies();
        if dependencies.is_empty() {
            return Ok(DependencyState::Ok);
        }

        // A task reachable twice via different paths (diamond) re-uses the
        // memoized verdict; a task reachable from itself is a cycle.
        if let Some(state) = visit.resolved.get(&self.id) {
            return Ok(*state);
        }
        if !visit.on_path.insert(self.id.clone()) {
            return Err(SluiceError::CircularDependency {
                task: self.id.clone(),
            });
        }

        let mut verdict = DependencyState::Ok;
        for upstream in &dependencies {
            let state = upstream.dependency_state_visit(visit)?;
            if state != DependencyState::Ok {
                verdict = state;
                break;
            }
            if !upstream.is_done() {
                verdict = DependencyState::Wait;
                break;
            }
        }

        visit.on_path.remove(&self.id);
        visit.resolved.insert(self.id.clone(), verdict);
        Ok(verdict)
    }

    // --- program file ---

    /// Materialize the program file: shebang plus program text, executable,
    /// with parent directories created. Also derives the default stdout,
    /// stderr and exit-code file paths next to the program file.
    pub fn create_program_file(&self) -> Result<()> {
        tracing::debug!(task = %self.id, file = %self.program_file, "writing program file");

        let path = Path::new(&self.program_file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, format!("{SHEBANG}{}", self.program_txt))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
        }

        let base = self
            .program_file
            .strip_suffix(".sh")
            .unwrap_or(&self.program_file);
        let mut rt = self.runtime.lock().unwrap();
        if rt.stdout_file.is_none() {
            rt.stdout_file = Some(format!("{base}.stdout"));
        }
        if rt.stderr_file.is_none() {
            rt.stderr_file = Some(format!("{base}.stderr"));
        }
        if rt.exit_code_file.is_none() {
            rt.exit_code_file = Some(format!("{base}.exitcode"));
        }
        Ok(())
    }

    pub fn stdout_file(&self) -> Option<String> {
        self.runtime.lock().unwrap().stdout_file.clone()
    }

    pub fn stderr_file(&self) -> Option<String> {
        self.runtime.lock().unwrap().stderr_file.clone()
    }

    pub fn exit_code_file(&self) -> Option<String> {
        self.runtime.lock().unwrap().exit_code_file.clone()
    }

    pub(crate) fn set_std_files(
        &self,
        stdout: Option<String>,
        stderr: Option<String>,
        exit_code: Option<String>,
    ) {
        let mut rt = self.runtime.lock().unwrap();
        rt.stdout_file = stdout;
        rt.stderr_file = stderr;
        rt.exit_code_file = exit_code;
    }

    // --- reporting ---

    /// Human-readable report. With `verbose`, includes state, dependencies,
    /// output validation errors and stdout/stderr tails; `show_code` appends
    /// the program text.
    pub fn report(&self, verbose: bool, show_code: bool) -> String {
        if !verbose {
            return format!("'{}', line {}", self.src_file, self.src_line);
        }

        let mut out = String::new();
        out.push_str(&format!(
            "\tProgram & line     : '{}', line {}\n",
            self.src_file, self.src_line
        ));
        out.push_str(&format!("\tTask ID            : '{}'\n", self.id));
        out.push_str(&format!("\tTask state         : '{}'\n", self.state()));
        out.push_str(&format!("\tInput files        : {:?}\n", self.inputs));
        out.push_str(&format!("\tOutput files       : {:?}\n", self.outputs));

        let dep_ids = self.dependency_ids();
        if !dep_ids.is_empty() {
            out.push_str(&format!("\tTask dependencies  : {dep_ids:?}\n"));
        }

        out.push_str(&format!("\tScript file        : '{}'\n", self.program_file));
        if let Some(msg) = &self.runtime.lock().unwrap().error_msg {
            out.push_str(&format!("\tError message      : '{msg}'\n"));
        }
        out.push_str(&format!("\tExit status        : '{}'\n", self.exit_code()));

        let check = self.check_output_files();
        if !check.is_empty() {
            out.push_str("\tOutput file errors :\n");
            out.push_str(&prepend_each_line("\t\t", &check));
        }

        if let Some(tail) = self.stderr_file().and_then(|f| tail_file(&f, REPORT_TAIL_LINES)) {
            out.push_str("\tStdErr (10 lines)  :\n");
            out.push_str(&prepend_each_line("\t\t", &tail));
        }
        if let Some(tail) = self.stdout_file().and_then(|f| tail_file(&f, REPORT_TAIL_LINES)) {
            out.push_str("\tStdOut (10 lines)  :\n");
            out.push_str(&prepend_each_line("\t\t", &tail));
        }

        if show_code {
            out.push_str("\tTask raw code:\n");
            out.push_str(&format!("{}\n", self.program_txt));
        }
        out
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("exit_code", &self.exit_code())
            .finish()
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}', line {}", self.src_file, self.src_line)
    }
}

/// Per-query traversal state for the readiness resolver: an owned value, so
/// concurrent top-level queries never share mutable state.
#[derive(Default)]
struct Visit {
    on_path: HashSet<String>,
    resolved: HashMap<String, DependencyState>,
}

/// Validate one output file; `None` means it passed.
fn check_output_file(file_name: &str, allow_empty: bool) -> Option<String> {
    let path = Path::new(file_name);
    let Ok(meta) = std::fs::metadata(path) else {
        return Some(format!("Error: Output file '{file_name}' does not exist.\n"));
    };
    if meta.is_dir() {
        let empty = std::fs::read_dir(path)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true);
        if empty && !allow_empty {
            return Some(format!("Error: Output file '{file_name}' has zero length.\n"));
        }
    } else if meta.len() == 0 && !allow_empty {
        return Some(format!("Error: Output file '{file_name}' has zero length.\n"));
    }
    None
}

/// Last `n` lines of a file, or `None` if it is missing or empty.
fn tail_file(file_name: &str, n: usize) -> Option<String> {
    let content = std::fs::read_to_string(file_name).ok()?;
    if content.is_empty() {
        return None;
    }
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    Some(lines[start..].join("\n"))
}

fn prepend_each_line(prefix: &str, text: &str) -> String {
    text.lines()
        .map(|line| format!("{prefix}{line}\n"))
        .collect()
}
