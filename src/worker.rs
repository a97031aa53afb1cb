//! Worker module split across focused submodules:
//! - `types`: tasks, outcomes and the per-task error taxonomy
//! - `shared`: liveness and in-flight state shared with the pool
//! - `process`: worker struct plus the per-account remote sequence
//! - `tests`: worker unit tests and the scripted service used by pool tests

mod process;
mod shared;
mod types;


pub(crate) use process::Worker;
pub use shared::{Liveness, WorkerState};
pub(crate) use types::{task_channel, TaskEnvelope, TaskSender};
pub use types::{ErrorKind, Outcome, Task, TaskError, TaskReport};
