//! Line-oriented checkpoint records for resumable runs.
//!
//! One line per entity, tab-separated fields, first field is the entity type
//! tag. A resumed run reconstructs equivalent tasks, state included, so work
//! that already finished is never re-executed.

use std::path::Path;
use std::sync::Arc;

use sluice_cluster::HostResources;
use sluice_types::{fields, Result, SluiceError};

use crate::registry::TaskRegistry;
use crate::task::{Task, TaskSpec, TaskState};

const TASK_TAG: &str = "Task";

/// Fixed fields before the nested resource record.
const TASK_FIELDS: usize = 16;

/// Serialize one task as a checkpoint line (without trailing newline).
pub fn task_to_record(task: &Task) -> String {
    let opt = |value: Option<String>| fields::encode(value.as_deref().unwrap_or(""));
    [
        TASK_TAG.to_string(),
        fields::encode(task.id()),
        fields::encode(task.src_file()),
        task.src_line().to_string(),
        task.can_fail().to_string(),
        task.state().name().to_string(),
        task.exit_code().to_string(),
        fields::encode(task.node().unwrap_or("")),
        fields::encode(task.queue().unwrap_or("")),
        fields::encode(task.program_file()),
        fields::encode(task.program_txt()),
        opt(task.stdout_file()),
        opt(task.stderr_file()),
        opt(task.exit_code_file()),
        fields::encode_list(task.inputs()),
        fields::encode_list(task.outputs()),
        task.resources().to_record(),
    ]
    .join("\t")
}

/// Parse one checkpoint line back into a task.
pub fn task_from_record(line: &str, line_no: usize) -> Result<Task> {
    let raw = fields::split_record(line);
    if raw.len() != TASK_FIELDS + HostResources::RECORD_FIELDS || raw[0] != TASK_TAG {
        return Err(SluiceError::RecordError {
            line: line_no,
            message: format!("expected a {TASK_TAG} record with {} fields, got {}",
                TASK_FIELDS + HostResources::RECORD_FIELDS,
                raw.len()
            ),
        });
    }

    let parse_num = |field: &str, what: &str| -> Result<i64> {
        field.parse().map_err(|_| SluiceError::RecordError {
            line: line_no,
            message: format!("invalid {what}: '{field}'"),
        })
    };
    let opt = |field: &str| -> Option<String> {
        if field.is_empty() {
            None
        } else {
            Some(fields::decode(field))
        }
    };

    let state_name = fields::decode(raw[5]);
    let state = TaskState::parse(&state_name).ok_or_else(|| SluiceError::RecordError {
        line: line_no,
        message: format!("unknown task state: '{state_name}'"),
    })?;
    let exit_code = parse_num(raw[6], "exit code")? as i32;
    let resources = HostResources::from_record_fields(&raw[TASK_FIELDS..], line_no)?;

    let task = Task::new(TaskSpec {
        id: Some(fields::decode(raw[1])),
        src_file: Some(fields::decode(raw[2])),
        src_line: parse_num(raw[3], "line number")? as u32,
        can_fail: raw[4] == "true",
        node: opt(raw[7]),
        queue: opt(raw[8]),
        program_file: Some(fields::decode(raw[9])),
        program: fields::decode(raw[10]),
        inputs: fields::decode_list(raw[14]),
        outputs: fields::decode_list(raw[15]),
        resources,
        ..TaskSpec::default()
    });
    task.set_std_files(opt(raw[11]), opt(raw[12]), opt(raw[13]));
    task.restore(state, exit_code);
    Ok(task)
}

/// Write all registered tasks to a checkpoint file, one record per line.
pub fn save_checkpoint(registry: &TaskRegistry, path: &Path) -> Result<()> {
    let mut out = String::new();
    for task in registry.tasks() {
        out.push_str(&task_to_record(&task));
        out.push('\n');
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, out)?;
    tracing::debug!(path = %path.display(), "checkpoint saved");
    Ok(())
}

/// Read a checkpoint file back into tasks, registering each (ids and output
/// paths) in `registry`.
pub fn load_checkpoint(path: &Path, registry: &TaskRegistry) -> Result<Vec<Arc<Task>>> {
    let content = std::fs::read_to_string(path)?;
    let mut tasks = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        let task = Arc::new(task_from_record(line, idx + 1)?);
        registry.add(task.clone())?;
        tasks.push(task);
    }
    tracing::debug!(path = %path.display(), count = tasks.len(), "checkpoint loaded");
    Ok(tasks)
}
