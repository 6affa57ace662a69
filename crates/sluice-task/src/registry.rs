//! Index from task id and from output-file path to the owning task.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use sluice_types::{Result, SluiceError};

use crate::task::Task;

/// Run-scoped task index.
///
/// Owned explicitly by whoever drives the run and passed to every component
/// that needs lookup, so independent runs (and tests) stay isolated. Both
/// maps are safe under concurrent registration and concurrent lookup.
///
/// A path maps to at most one producing task; registering a second producer
/// for the same output is a configuration error and is rejected eagerly.
#[derive(Default)]
pub struct TaskRegistry {
    by_id: RwLock<HashMap<String, Arc<Task>>>,
    by_output: RwLock<HashMap<String, Arc<Task>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task under its id and under every output file it declares.
    pub fn add(&self, task: Arc<Task>) -> Result<()> {
        {
            let mut by_id = self.by_id.write().unwrap();
            if by_id.contains_key(task.id()) {
                return Err(SluiceError::DuplicateTaskId {
                    id: task.id().to_string(),
                });
            }
            by_id.insert(task.id().to_string(), task.clone());
        }

        let mut by_output = self.by_output.write().unwrap();
        for output in task.outputs() {
            if let Some(existing) = by_output.get(output) {
                if existing.id() != task.id() {
                    // Roll back the id registration so a rejected task leaves
                    // no trace.
                    self.by_id.write().unwrap().remove(task.id());
                    return Err(SluiceError::DuplicateOutput {
                        path: output.clone(),
                        task: task.id().to_string(),
                        registered: existing.id().to_string(),
                    });
                }
            }
        }
        for output in task.outputs() {
            by_output.insert(output.clone(), task.clone());
        }
        Ok(())
    }

    pub fn task(&self, id: &str) -> Option<Arc<Task>> {
        self.by_id.read().unwrap().get(id).cloned()
    }

    pub fn has_task(&self, id: &str) -> bool {
        self.by_id.read().unwrap().contains_key(id)
    }

    /// The task that produces `path` as one of its declared outputs.
    pub fn task_by_output(&self, path: &str) -> Option<Arc<Task>> {
        self.by_output.read().unwrap().get(path).cloned()
    }

    /// All registered tasks, ordered by id for deterministic iteration.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        let mut tasks: Vec<Arc<Task>> = self.by_id.read().unwrap().values().cloned().collect();
        tasks.sort_by(|a, b| a.id().cmp(b.id()));
        tasks
    }

    pub fn len(&self) -> usize {
        self.by_id.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.read().unwrap().is_empty()
    }

    /// Reset between independent runs.
    pub fn clear(&self) {
        self.by_id.write().unwrap().clear();
        self.by_output.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;

    fn task_with_outputs(id: &str, outputs: &[&str]) -> Arc<Task> {
        Arc::new(Task::new(TaskSpec {
            id: Some(id.into()),
            program: "true".into(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            ..TaskSpec::default()
        }))
    }

    #[test]
    fn lookup_by_id_and_output() {
        let registry = TaskRegistry::new();
        let t = task_with_outputs("a", &["out1.txt", "out2.txt"]);
        registry.add(t.clone()).unwrap();

        assert!(registry.has_task("a"));
        assert_eq!(registry.task("a").unwrap().id(), "a");
        assert_eq!(registry.task_by_output("out1.txt").unwrap().id(), "a");
        assert_eq!(registry.task_by_output("out2.txt").unwrap().id(), "a");
        assert!(registry.task_by_output("other.txt").is_none());
    }

    #[test]
    fn duplicate_id_rejected() {
        let registry = TaskRegistry::new();
        registry.add(task_with_outputs("a", &[])).unwrap();
        let err = registry.add(task_with_outputs("a", &[])).unwrap_err();
        assert!(matches!(err, SluiceError::DuplicateTaskId { .. }));
    }

    #[test]
    fn duplicate_output_rejected_eagerly() {
        let registry = TaskRegistry::new();
        registry.add(task_with_outputs("a", &["shared.txt"])).unwrap();

        let err = registry
            .add(task_with_outputs("b", &["shared.txt"]))
            .unwrap_err();
        assert!(matches!(err, SluiceError::DuplicateOutput { .. }));

        // The rejected task must leave no trace.
        assert!(!registry.has_task("b"));
        assert_eq!(registry.task_by_output("shared.txt").unwrap().id(), "a");
    }

    #[test]
    fn clear_resets_both_maps() {
        let registry = TaskRegistry::new();
        registry.add(task_with_outputs("a", &["out.txt"])).unwrap();

        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.task_by_output("out.txt").is_none());
    }

    #[test]
    fn tasks_are_ordered_by_id() {
        let registry = TaskRegistry::new();
        registry.add(task_with_outputs("b", &[])).unwrap();
        registry.add(task_with_outputs("a", &[])).unwrap();
        registry.add(task_with_outputs("c", &[])).unwrap();

        let ids: Vec<String> = registry.tasks().iter().map(|t| t.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
