//! The task contract and the observable task handle.

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use courier_errors::{Error, Result};
use tokio::sync::Notify;

use crate::ControlToken;

/// Task lifecycle states. Transitions are monotone:
/// Created → Running → PendingCompletion → Completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskState {
    Created,
    Running,
    PendingCompletion,
    Completed,
}

/// Cancellation context handed to a running task.
///
/// Combines the owning queue's token with the task's own token; a task is
/// canceled when either is.
#[derive(Debug, Clone)]
pub struct TaskContext {
    queue_token: ControlToken,
    task_token: ControlToken,
}

impl TaskContext {
    pub(crate) fn new(queue_token: ControlToken, task_token: ControlToken) -> Self {
        TaskContext {
            queue_token,
            task_token,
        }
    }

    /// Standalone context for driving a task outside any queue (tests,
    /// sub-tasks awaited inline).
    pub fn standalone(token: ControlToken) -> Self {
        TaskContext {
            queue_token: token.clone(),
            task_token: token,
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.queue_token.is_canceled() || self.task_token.is_canceled()
    }

    /// `Err(canceled)` when cancellation has been requested on either token.
    pub fn check_cancel(&self) -> Result<()> {
        self.queue_token.check()?;
        self.task_token.check()
    }

    /// The queue-level token, for threading into child components.
    pub fn token(&self) -> &ControlToken {
        &self.queue_token
    }
}

/// An addressable unit of work.
#[async_trait]
pub trait Task: Send + 'static {
    /// Diagnostic name.
    fn name(&self) -> &str {
        "task"
    }

    /// Execute the task. Implementations check `cx` at their yield points
    /// and return the cancellation error when asked to stop.
    async fn run(&mut self, cx: &TaskContext) -> Result<()>;

    /// Polled by the queue when the task terminates. A returned successor is
    /// enqueued as the continuation of the original waiter.
    fn continuation(&mut self) -> Option<Box<dyn Task>> {
        None
    }
}

impl std::fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("name", &self.name()).finish()
    }
}

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type TaskFn = Box<dyn FnOnce(TaskContext) -> TaskFuture + Send>;
type ContinuationFn = Box<dyn FnOnce() -> Option<Box<dyn Task>> + Send>;

/// Closure-backed [`Task`], the workhorse for one-shot work items.
pub struct FnTask {
    name: String,
    body: Option<TaskFn>,
    continuation: Option<ContinuationFn>,
}

impl FnTask {
    pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        FnTask {
            name: name.into(),
            body: Some(Box::new(move |cx| Box::pin(body(cx)))),
            continuation: None,
        }
    }

    /// A synchronous body; runs inline on the driving worker.
    pub fn sync<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(&TaskContext) -> Result<()> + Send + 'static,
    {
        FnTask::new(name, move |cx| async move { body(&cx) })
    }

    /// Attach a continuation evaluated when this task terminates.
    pub fn with_continuation<F>(mut self, continuation: F) -> Self
    where
        F: FnOnce() -> Option<Box<dyn Task>> + Send + 'static,
    {
        self.continuation = Some(Box::new(continuation));
        self
    }
}

#[async_trait]
impl Task for FnTask {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&mut self, cx: &TaskContext) -> Result<()> {
        let body = self
            .body
            .take()
            .ok_or_else(|| Error::unexpected("task body already consumed"))?;
        body(cx.clone()).await
    }

    fn continuation(&mut self) -> Option<Box<dyn Task>> {
        self.continuation.take().and_then(|f| f())
    }
}

// ── Task handle ───────────────────────────────────────────────────────────────

#[derive(Debug)]
struct HandleInner {
    name: String,
    state: Mutex<(TaskState, Option<Error>)>,
    done: Notify,
    cancel: ControlToken,
}

/// Shared observable state of a submitted task.
///
/// The handle outlives the task object itself; waiters park on it and the
/// queue records the terminal outcome exactly once.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    inner: Arc<HandleInner>,
}

impl TaskHandle {
    pub(crate) fn new(name: String) -> Self {
        TaskHandle {
            inner: Arc::new(HandleInner {
                name,
                state: Mutex::new((TaskState::Created, None)),
                done: Notify::new(),
                cancel: ControlToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> TaskState {
        self.inner.state.lock().unwrap().0
    }

    /// The captured error, if the task failed.
    pub fn error(&self) -> Option<Error> {
        self.inner.state.lock().unwrap().1.clone()
    }

    pub fn is_failed(&self) -> bool {
        let guard = self.inner.state.lock().unwrap();
        guard.0 == TaskState::Completed && guard.1.is_some()
    }

    /// Request cooperative cancellation of this task.
    pub fn request_cancel(&self) {
        self.inner.cancel.request_cancel();
    }

    pub(crate) fn cancel_token(&self) -> &ControlToken {
        &self.inner.cancel
    }

    pub(crate) fn same_as(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Wait until the task reaches Completed.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.done.notified();
            if self.state() == TaskState::Completed {
                return;
            }
            notified.await;
        }
    }

    /// Wait for completion; the first captured error is returned.
    pub async fn wait_for_success(&self) -> Result<()> {
        self.wait().await;
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn mark_running(&self) {
        let mut guard = self.inner.state.lock().unwrap();
        if guard.0 < TaskState::Running {
            guard.0 = TaskState::Running;
        }
    }

    /// Record the terminal outcome. The error is recorded at most once and
    /// never after the task has completed; a cancellation racing a normal
    /// completion keeps whichever outcome was recorded first.
    pub(crate) fn complete(&self, outcome: Option<Error>) {
        {
            let mut guard = self.inner.state.lock().unwrap();
            if guard.0 == TaskState::Completed {
                return;
            }
            guard.0 = TaskState::PendingCompletion;
            if guard.1.is_none() {
                guard.1 = outcome;
            }
            guard.0 = TaskState::Completed;
        }
        self.inner.done.notify_waiters();
    }
}
