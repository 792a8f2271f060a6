//! The execution queue: pending → executing → ready.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use courier_errors::{Error, Result};
use tokio::sync::Notify;
use tracing::trace;

use crate::{
    task::{Task, TaskContext, TaskHandle},
    ControlToken,
};

/// What happens to tasks once they complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Completed tasks are buffered in the ready set until popped.
    KeepAll,
    /// Completed tasks are discarded after waiters are notified.
    KeepNone,
}

/// Flush behavior knobs; the default waits for everything to drain and
/// reports the first failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushOptions {
    /// Complete pending (not yet started) tasks as canceled instead of
    /// running them.
    pub discard_pending: bool,
    /// Swallow task failures instead of returning the first one.
    pub nothrow_if_failed: bool,
    /// Clear the ready set when done.
    pub discard_ready: bool,
    /// Request cooperative cancellation of executing tasks.
    pub cancel_executing: bool,
}

const DEFAULT_CONCURRENCY: usize = 16;

struct Entry {
    task: Box<dyn Task>,
    handle: TaskHandle,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Entry>,
    executing: Vec<TaskHandle>,
    ready: VecDeque<TaskHandle>,
    first_error: Option<Error>,
}

struct QueueInner {
    cap: usize,
    mode: Mutex<QueueMode>,
    token: ControlToken,
    disposed: AtomicBool,
    state: Mutex<QueueState>,
    ready_notify: Notify,
    idle_notify: Notify,
}

/// Owns and drives tasks on the shared tokio runtime.
///
/// At most `cap` tasks execute concurrently; excess submissions queue up in
/// the pending set. Completed tasks either buffer in the ready set
/// ([`QueueMode::KeepAll`]) or are dropped after waiter notification
/// ([`QueueMode::KeepNone`]).
#[derive(Clone)]
pub struct ExecutionQueue {
    inner: Arc<QueueInner>,
}

impl ExecutionQueue {
    pub fn new(mode: QueueMode) -> Self {
        Self::with_capacity(mode, DEFAULT_CONCURRENCY)
    }

    pub fn with_capacity(mode: QueueMode, cap: usize) -> Self {
        ExecutionQueue {
            inner: Arc::new(QueueInner {
                cap: cap.max(1),
                mode: Mutex::new(mode),
                token: ControlToken::new(),
                disposed: AtomicBool::new(false),
                state: Mutex::new(QueueState::default()),
                ready_notify: Notify::new(),
                idle_notify: Notify::new(),
            }),
        }
    }

    /// The queue-level cancellation token shared with every task it runs.
    pub fn control_token(&self) -> &ControlToken {
        &self.inner.token
    }

    pub fn mode(&self) -> QueueMode {
        *self.inner.mode.lock().unwrap()
    }

    /// Change the retention mode. Switching to KeepNone drops the buffered
    /// ready set.
    pub fn set_mode(&self, mode: QueueMode) {
        *self.inner.mode.lock().unwrap() = mode;
        if mode == QueueMode::KeepNone {
            self.inner.state.lock().unwrap().ready.clear();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().unwrap().pending.len()
    }

    pub fn executing_count(&self) -> usize {
        self.inner.state.lock().unwrap().executing.len()
    }

    pub fn ready_count(&self) -> usize {
        self.inner.state.lock().unwrap().ready.len()
    }

    /// Submit a task and start it as soon as a concurrency slot frees up.
    pub fn push_back(&self, task: Box<dyn Task>) -> Result<TaskHandle> {
        self.push_task(task, false)
    }

    /// Submit without kicking the scheduler; the task starts when a later
    /// completion or submission drains the pending set.
    pub fn push_back_unscheduled(&self, task: Box<dyn Task>) -> Result<TaskHandle> {
        self.push_task(task, true)
    }

    fn push_task(&self, task: Box<dyn Task>, dont_schedule: bool) -> Result<TaskHandle> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(Error::disposed("execution queue"));
        }

        let handle = TaskHandle::new(task.name().to_owned());
        {
            let mut state = self.inner.state.lock().unwrap();
            state.pending.push_back(Entry {
                task,
                handle: handle.clone(),
            });
            if !dont_schedule {
                Self::schedule_locked(&self.inner, &mut state);
            }
        }
        Ok(handle)
    }

    /// Peek the oldest ready task, optionally waiting for one to appear.
    pub async fn top(&self, wait: bool) -> Option<TaskHandle> {
        loop {
            let notified = self.inner.ready_notify.notified();
            if let Some(handle) = self.inner.state.lock().unwrap().ready.front().cloned() {
                return Some(handle);
            }
            if !wait {
                return None;
            }
            notified.await;
        }
    }

    /// Pop the oldest ready task, optionally waiting for one to appear.
    pub async fn pop(&self, wait: bool) -> Option<TaskHandle> {
        loop {
            let notified = self.inner.ready_notify.notified();
            if let Some(handle) = self.inner.state.lock().unwrap().ready.pop_front() {
                return Some(handle);
            }
            if !wait {
                return None;
            }
            notified.await;
        }
    }

    /// Wait until the given task completes.
    pub async fn wait(&self, handle: &TaskHandle) {
        handle.wait().await;
    }

    /// Wait until the given task completes; its captured error is returned.
    pub async fn wait_for_success(&self, handle: &TaskHandle) -> Result<()> {
        handle.wait_for_success().await
    }

    /// Cancel everything currently in the queue: pending tasks complete
    /// immediately with the canceled error, executing tasks get a
    /// cooperative cancellation request. The queue remains usable.
    pub async fn cancel_all(&self, wait: bool) {
        {
            let mut state = self.inner.state.lock().unwrap();
            let keep_all = self.mode() == QueueMode::KeepAll;
            while let Some(entry) = state.pending.pop_front() {
                entry.handle.complete(Some(Error::canceled()));
                if keep_all {
                    state.ready.push_back(entry.handle);
                }
            }
            for handle in &state.executing {
                handle.request_cancel();
            }
        }
        self.inner.ready_notify.notify_waiters();
        if wait {
            self.wait_idle().await;
        }
    }

    /// FIFO flush: drain pending and executing per `options`, then report
    /// the first captured failure unless `nothrow_if_failed`.
    pub async fn flush(&self, options: FlushOptions) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if options.discard_pending {
                let keep_all = self.mode() == QueueMode::KeepAll && !options.discard_ready;
                while let Some(entry) = state.pending.pop_front() {
                    entry.handle.complete(Some(Error::canceled()));
                    if keep_all {
                        state.ready.push_back(entry.handle);
                    }
                }
            } else {
                // Everything pending still has to run.
                Self::schedule_locked(&self.inner, &mut state);
            }
            if options.cancel_executing {
                for handle in &state.executing {
                    handle.request_cancel();
                }
            }
        }

        self.wait_idle().await;

        let mut state = self.inner.state.lock().unwrap();
        if options.discard_ready {
            state.ready.clear();
        }
        let first_error = state.first_error.take();
        drop(state);

        match first_error {
            Some(err) if !options.nothrow_if_failed => Err(err),
            _ => Ok(()),
        }
    }

    /// Terminate all active tasks and release resources without reporting
    /// errors. Leaves the queue's control token canceled; meant for
    /// shutdown paths.
    pub async fn force_flush_no_throw(&self) {
        self.inner.token.request_cancel();
        let _ = self
            .flush(FlushOptions {
                discard_pending: true,
                nothrow_if_failed: true,
                discard_ready: true,
                cancel_executing: true,
            })
            .await;
    }

    /// Shut the queue down. Idempotent; subsequent submissions fail with an
    /// ObjectDisconnected error.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.force_flush_no_throw().await;
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle_notify.notified();
            {
                let state = self.inner.state.lock().unwrap();
                if state.pending.is_empty() && state.executing.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Move pending entries into execution while slots are available.
    /// Caller holds the state lock.
    fn schedule_locked(inner: &Arc<QueueInner>, state: &mut QueueState) {
        while state.executing.len() < inner.cap {
            let Some(entry) = state.pending.pop_front() else {
                break;
            };
            state.executing.push(entry.handle.clone());
            let inner = Arc::clone(inner);
            tokio::spawn(drive(inner, entry));
        }
    }
}

/// Run one task chain to completion and do the queue bookkeeping.
async fn drive(inner: Arc<QueueInner>, entry: Entry) {
    let Entry { task, handle } = entry;

    let cx = TaskContext::new(inner.token.clone(), handle.cancel_token().clone());

    let outcome = if cx.is_canceled() {
        // Canceled before starting: complete immediately.
        Some(Error::canceled())
    } else {
        handle.mark_running();
        let mut current: Box<dyn Task> = task;
        loop {
            let outcome = current.run(&cx).await.err();
            match current.continuation() {
                Some(next) if !cx.is_canceled() => {
                    trace!(task = handle.name(), next = next.name(), "task continuation");
                    current = next;
                }
                Some(_) => break Some(Error::canceled()),
                None => break outcome,
            }
        }
    };

    if let Some(err) = &outcome {
        trace!(task = handle.name(), error = %err, "task failed");
    }
    handle.complete(outcome);

    let mut state = inner.state.lock().unwrap();
    state.executing.retain(|h| !h.same_as(&handle));
    if let Some(err) = handle.error() {
        if state.first_error.is_none() && !err.is_cancellation() {
            state.first_error = Some(err);
        }
    }
    if *inner.mode.lock().unwrap() == QueueMode::KeepAll {
        state.ready.push_back(handle);
    }
    ExecutionQueue::schedule_locked(&inner, &mut state);
    let idle = state.pending.is_empty() && state.executing.is_empty();
    drop(state);

    inner.ready_notify.notify_waiters();
    if idle {
        inner.idle_notify.notify_waiters();
    }
}
