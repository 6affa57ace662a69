//! Task state machine, dependency resolver and checkpoint records.
//!
//! A [`Task`] is a unit of work: a generated program, its expected input and
//! output files, a resource request and a strict execution-state machine.
//! [`TaskDependency`] implements the staleness check behind the `<-`
//! operator; [`TaskRegistry`] indexes tasks by id and by the output files
//! they produce so dependency expressions can resolve a file path to the
//! task that creates it.

pub mod checkpoint;
pub mod dependency;
pub mod registry;
pub mod task;

pub use checkpoint::{load_checkpoint, save_checkpoint};
pub use dependency::TaskDependency;
pub use registry::TaskRegistry;
pub use task::{
    DependencyState, Task, TaskSpec, TaskState, EXITCODE_ERROR, EXITCODE_KILLED, EXITCODE_OK,
    EXITCODE_TIMEOUT,
};
