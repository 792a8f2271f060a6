//! The execution core: cooperatively cancellable tasks driven by an
//! execution queue on top of the shared tokio runtime.
//!
//! A [`Task`] is a state machine, not an OS thread; the queue starts tasks up
//! to its concurrency cap and delivers completed tasks back to callers. When
//! a task terminates the queue polls its [`Task::continuation`]; a returned
//! successor keeps running under the original [`TaskHandle`], so waiters
//! observe only the terminal outcome of the whole chain.

mod control_token;
mod queue;
mod task;

pub use control_token::ControlToken;
pub use queue::{ExecutionQueue, FlushOptions, QueueMode};
pub use task::{FnTask, Task, TaskContext, TaskHandle, TaskState};
