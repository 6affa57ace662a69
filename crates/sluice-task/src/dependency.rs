//! File-level dependency records and the staleness check behind the `<-`
//! operator.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::registry::TaskRegistry;
use crate::task::Task;

/// The dependency record attached to a task or a standalone dependency
/// expression: output files on the left-hand side, input files on the right,
/// plus upstream tasks referenced by id.
pub struct TaskDependency {
    outputs: Vec<String>,
    inputs: Vec<String>,
    tasks: Vec<Arc<Task>>,
    /// Memoized output validation errors.
    output_check: Mutex<Option<String>>,
}

impl TaskDependency {
    pub fn new() -> Self {
        Self {
            outputs: Vec::new(),
            inputs: Vec::new(),
            tasks: Vec::new(),
            output_check: Mutex::new(None),
        }
    }

    /// Add an upstream task reference.
    pub fn add_task(&mut self, task: Arc<Task>) {
        self.tasks.push(task);
    }

    /// Merge all dependencies from `other` into this record.
    pub fn merge(&mut self, other: &TaskDependency, registry: &TaskRegistry) {
        for input in &other.inputs {
            self.add_input(input, registry);
        }
        self.outputs.extend(other.outputs.iter().cloned());
        self.tasks.extend(other.tasks.iter().cloned());
    }

    /// Add a right-hand side entry. A string matching a registered task id is
    /// a task dependency; anything else is a plain input file.
    pub fn add_input(&mut self, input: &str, registry: &TaskRegistry) {
        match registry.task(input) {
            Some(task) => self.tasks.push(task),
            None => self.inputs.push(input.to_string()),
        }
    }

    /// Add a left-hand side output file.
    pub fn add_output(&mut self, output: impl Into<String>) {
        self.outputs.push(output.into());
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn tasks(&self) -> &[Arc<Task>] {
        &self.tasks
    }

    pub fn has_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Decide whether the outputs are stale and must be (re)produced.
    ///
    /// Classic incremental-build semantics extended with pending-producer
    /// awareness: an input that is the registered output of a task that has
    /// not finished yet makes the dependency stale regardless of timestamps,
    /// because the input's future modification time is unknown.
    pub fn is_stale(&self, registry: &TaskRegistry) -> bool {
        // Empty dependency is trivially satisfied.
        if self.outputs.is_empty() && self.inputs.is_empty() {
            return false;
        }

        // Left-hand side: every output must exist and be non-empty; track the
        // earliest modification time.
        let mut min_modified_left = SystemTime::now();
        let mut have_left = false;
        for file_name in &self.outputs {
            let Some(modified) = existing_mtime(file_name) else {
                tracing::debug!(file = %file_name, "output missing or empty, stale");
                return true;
            };
            if !have_left || modified < min_modified_left {
                min_modified_left = modified;
                have_left = true;
            }
        }

        // Right-hand side: latest modification time among ready inputs.
        let mut max_modified_right: Option<SystemTime> = None;
        for file_name in &self.inputs {
            // Scheduled to be (re)written by a pending task? Its future mtime
            // is unknown, treat as "in the future".
            if let Some(producer) = registry.task_by_output(file_name) {
                if !producer.is_done() {
                    tracing::debug!(
                        file = %file_name,
                        producer = %producer.id(),
                        "input produced by unfinished task, stale"
                    );
                    return true;
                }
            }

            match std::fs::metadata(file_name).and_then(|m| m.modified()) {
                Ok(modified) => {
                    if max_modified_right.map_or(true, |max| modified > max) {
                        max_modified_right = Some(modified);
                    }
                }
                Err(_) => {
                    // Presumably pending production by some other task.
                    tracing::debug!(file = %file_name, "input does not exist, stale");
                    return true;
                }
            }
        }

        // Stale when the oldest output predates the newest ready input.
        match max_modified_right {
            Some(max_right) => have_left && min_modified_left < max_right,
            None => false,
        }
    }

    /// Validate the declared output files for `task`, memoized. Semantics
    /// mirror [`Task::check_output_files`].
    pub fn check_output_files(&self, task: &Task) -> String {
        let mut memo = self.output_check.lock().unwrap();
        if let Some(check) = &*memo {
            return check.clone();
        }
        if task.state() != crate::task::TaskState::Finished || self.outputs.is_empty() {
            return String::new();
        }

        let mut errors = String::new();
        for file_name in &self.outputs {
            match std::fs::metadata(file_name) {
                Err(_) => {
                    errors.push_str(&format!("Error: Output file '{file_name}' does not exist.\n"))
                }
                Ok(meta) if !task.allow_empty() && meta.len() == 0 && meta.is_file() => {
                    errors.push_str(&format!("Error: Output file '{file_name}' has zero length.\n"))
                }
                Ok(_) => {}
            }
        }
        *memo = Some(errors.clone());
        errors
    }
}

impl Default for TaskDependency {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "( {} <- {} )",
            self.outputs.join(", "),
            self.inputs.join(", ")
        )
    }
}

/// Modification time of a file that exists and is non-empty (a directory
/// counts only when it has entries). `None` otherwise.
fn existing_mtime(file_name: &str) -> Option<SystemTime> {
    let path = Path::new(file_name);
    let meta = std::fs::metadata(path).ok()?;
    if meta.is_dir() {
        let mut entries = std::fs::read_dir(path).ok()?;
        entries.next()?.ok()?;
    } else if meta.len() == 0 {
        return None;
    }
    meta.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskSpec, TaskState};
    use std::time::Duration;

    fn write_with_mtime(path: &Path, content: &str, age: Duration) {
        std::fs::write(path, content).unwrap();
        let mtime = SystemTime::now() - age;
        let file = std::fs::File::open(path).unwrap();
        file.set_modified(mtime).unwrap();
    }

    #[test]
    fn empty_dependency_is_never_stale() {
        let registry = TaskRegistry::new();
        let dep = TaskDependency::new();
        assert!(!dep.is_stale(&registry));
    }

    #[test]
    fn missing_output_is_stale() {
        let registry = TaskRegistry::new();
        let mut dep = TaskDependency::new();
        dep.add_output("/nonexistent/out.txt");
        assert!(dep.is_stale(&registry));
    }

    #[test]
    fn empty_output_is_stale_regardless_of_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("o.txt");
        std::fs::write(&out, "").unwrap();

        let registry = TaskRegistry::new();
        let mut dep = TaskDependency::new();
        dep.add_output(out.to_string_lossy());
        assert!(dep.is_stale(&registry));
    }

    #[test]
    fn fresh_output_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("o.txt");
        let input = dir.path().join("i.txt");
        // Output newer than input.
        write_with_mtime(&input, "input", Duration::from_secs(100));
        write_with_mtime(&out, "output", Duration::from_secs(10));

        let registry = TaskRegistry::new();
        let mut dep = TaskDependency::new();
        dep.add_output(out.to_string_lossy());
        dep.add_input(&input.to_string_lossy(), &registry);
        assert!(!dep.is_stale(&registry));
    }

    #[test]
    fn older_output_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("o.txt");
        let input = dir.path().join("i.txt");
        write_with_mtime(&out, "output", Duration::from_secs(100));
        write_with_mtime(&input, "input", Duration::from_secs(10));

        let registry = TaskRegistry::new();
        let mut dep = TaskDependency::new();
        dep.add_output(out.to_string_lossy());
        dep.add_input(&input.to_string_lossy(), &registry);
        assert!(dep.is_stale(&registry));
    }

    #[test]
    fn missing_input_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("o.txt");
        std::fs::write(&out, "output").unwrap();

        let registry = TaskRegistry::new();
        let mut dep = TaskDependency::new();
        dep.add_output(out.to_string_lossy());
        dep.add_input("/nonexistent/i.txt", &registry);
        assert!(dep.is_stale(&registry));
    }

    #[test]
    fn input_from_unfinished_producer_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("o.txt");
        let input = dir.path().join("i.txt");
        // Timestamps alone would say "up to date".
        write_with_mtime(&input, "input", Duration::from_secs(100));
        write_with_mtime(&out, "output", Duration::from_secs(10));
        let input_path = input.to_string_lossy().into_owned();

        let registry = TaskRegistry::new();
        let producer = Arc::new(Task::new(TaskSpec {
            id: Some("producer".into()),
            program: "true".into(),
            outputs: vec![input_path.clone()],
            ..TaskSpec::default()
        }));
        registry.add(producer.clone()).unwrap();

        let mut dep = TaskDependency::new();
        dep.add_output(out.to_string_lossy());
        dep.add_input(&input_path, &registry);

        // Producer has not run: stale despite timestamps.
        assert!(dep.is_stale(&registry));

        // Once the producer finishes, timestamps rule again.
        producer.set_state(TaskState::Started).unwrap();
        producer.set_state(TaskState::Running).unwrap();
        producer.set_state(TaskState::Finished).unwrap();
        assert!(!dep.is_stale(&registry));
    }

    #[test]
    fn no_inputs_and_outputs_present_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("o.txt");
        std::fs::write(&out, "data").unwrap();

        let registry = TaskRegistry::new();
        let mut dep = TaskDependency::new();
        dep.add_output(out.to_string_lossy());
        assert!(!dep.is_stale(&registry));
    }

    #[test]
    fn input_matching_task_id_becomes_task_reference() {
        let registry = TaskRegistry::new();
        let upstream = Arc::new(Task::new(TaskSpec {
            id: Some("upstream".into()),
            program: "true".into(),
            ..TaskSpec::default()
        }));
        registry.add(upstream).unwrap();

        let mut dep = TaskDependency::new();
        dep.add_input("upstream", &registry);
        dep.add_input("plain-file.txt", &registry);

        assert!(dep.has_tasks());
        assert_eq!(dep.tasks().len(), 1);
        assert_eq!(dep.inputs(), &["plain-file.txt".to_string()]);
    }

    #[test]
    fn display_shows_the_operator_shape() {
        let registry = TaskRegistry::new();
        let mut dep = TaskDependency::new();
        dep.add_output("out.txt");
        dep.add_input("in.txt", &registry);
        assert_eq!(dep.to_string(), "( out.txt <- in.txt )");
    }
}
