//! Execution-queue behavior: scheduling, continuations, cancellation,
//! flushing and disposal.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use courier_errors::{Error, ErrorKind};
use courier_tasks::{ExecutionQueue, FlushOptions, FnTask, QueueMode, TaskState};

#[tokio::test(flavor = "multi_thread")]
async fn wait_for_success_observes_completed_state() {
    let queue = ExecutionQueue::new(QueueMode::KeepAll);

    let handle = queue
        .push_back(Box::new(FnTask::new("ok", |_cx| async { Ok(()) })))
        .expect("push");

    queue.wait_for_success(&handle).await.expect("success");
    assert_eq!(handle.state(), TaskState::Completed);
    assert!(handle.error().is_none());

    queue.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_for_success_rethrows_the_captured_error() {
    let queue = ExecutionQueue::new(QueueMode::KeepAll);

    let handle = queue
        .push_back(Box::new(FnTask::new("boom", |_cx| async {
            Err(Error::unexpected("task failed on purpose"))
        })))
        .expect("push");

    let err = queue.wait_for_success(&handle).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unexpected);
    assert_eq!(handle.state(), TaskState::Completed);
    assert!(handle.is_failed());

    // The error stays available; a second wait sees the same outcome.
    let err = handle.wait_for_success().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unexpected);

    queue.force_flush_no_throw().await;
    queue.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrency_cap_is_never_exceeded() {
    const CAP: usize = 3;
    const TASKS: usize = 24;

    let queue = ExecutionQueue::with_capacity(QueueMode::KeepNone, CAP);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..TASKS {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let handle = queue
            .push_back(Box::new(FnTask::new(format!("task-{i}"), move |_cx| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })))
            .expect("push");
        assert!(queue.executing_count() <= CAP);
        handles.push(handle);
    }

    for handle in &handles {
        queue.wait_for_success(handle).await.expect("success");
    }
    assert!(peak.load(Ordering::SeqCst) <= CAP);

    queue.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn continuation_chain_runs_under_the_original_handle() {
    let queue = ExecutionQueue::new(QueueMode::KeepAll);
    let trace = Arc::new(AtomicUsize::new(0));

    let second = {
        let trace = Arc::clone(&trace);
        FnTask::new("second", move |_cx| async move {
            trace.fetch_add(10, Ordering::SeqCst);
            Ok(())
        })
    };
    let first = {
        let trace = Arc::clone(&trace);
        FnTask::new("first", move |_cx| async move {
            trace.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .with_continuation(move || Some(Box::new(second) as _))
    };

    let handle = queue.push_back(Box::new(first)).expect("push");
    queue.wait_for_success(&handle).await.expect("chain success");

    // Both stages ran, and exactly one ready entry exists for the chain.
    assert_eq!(trace.load(Ordering::SeqCst), 11);
    assert_eq!(queue.ready_count(), 1);

    queue.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn continuation_outcome_replaces_the_original_failure() {
    let queue = ExecutionQueue::new(QueueMode::KeepNone);

    let recovery = FnTask::new("recovery", |_cx| async { Ok(()) });
    let failing = FnTask::new("failing", |_cx| async {
        Err(Error::unexpected("stage one failed"))
    })
    .with_continuation(move || Some(Box::new(recovery) as _));

    let handle = queue.push_back(Box::new(failing)).expect("push");

    // Waiters observe only the terminal outcome of the chain.
    queue.wait_for_success(&handle).await.expect("recovered");

    queue.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn keep_all_buffers_ready_tasks_for_pop() {
    let queue = ExecutionQueue::new(QueueMode::KeepAll);

    for i in 0..3 {
        queue
            .push_back(Box::new(FnTask::new(format!("t{i}"), |_cx| async { Ok(()) })))
            .expect("push");
    }
    queue
        .flush(FlushOptions::default())
        .await
        .expect("flush clean");

    assert_eq!(queue.ready_count(), 3);
    let top = queue.top(false).await.expect("top");
    let popped = queue.pop(false).await.expect("pop");
    assert_eq!(top.name(), popped.name());
    assert_eq!(queue.ready_count(), 2);

    queue.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn keep_none_discards_ready_tasks() {
    let queue = ExecutionQueue::new(QueueMode::KeepNone);

    let handle = queue
        .push_back(Box::new(FnTask::new("fire-and-forget", |_cx| async { Ok(()) })))
        .expect("push");
    queue.wait(&handle).await;

    assert_eq!(queue.ready_count(), 0);
    assert!(queue.pop(false).await.is_none());

    queue.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_all_cancels_pending_and_running() {
    let queue = ExecutionQueue::with_capacity(QueueMode::KeepNone, 1);

    // The runner parks until its token is canceled.
    let runner = queue
        .push_back(Box::new(FnTask::new("runner", |cx| async move {
            loop {
                cx.check_cancel()?;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })))
        .expect("push");

    // With cap 1 this one never starts.
    let parked = queue
        .push_back(Box::new(FnTask::new("parked", |_cx| async { Ok(()) })))
        .expect("push");

    queue.cancel_all(true).await;

    let runner_err = queue.wait_for_success(&runner).await.unwrap_err();
    let parked_err = queue.wait_for_success(&parked).await.unwrap_err();
    assert!(runner_err.is_cancellation());
    assert!(parked_err.is_cancellation());

    queue.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn flush_reports_the_first_failure_unless_nothrow() {
    let queue = ExecutionQueue::new(QueueMode::KeepNone);

    queue
        .push_back(Box::new(FnTask::new("bad", |_cx| async {
            Err(Error::unexpected("flush should see this"))
        })))
        .expect("push");

    let err = queue.flush(FlushOptions::default()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unexpected);

    queue
        .push_back(Box::new(FnTask::new("bad-again", |_cx| async {
            Err(Error::unexpected("swallowed"))
        })))
        .expect("push");

    queue
        .flush(FlushOptions {
            nothrow_if_failed: true,
            ..FlushOptions::default()
        })
        .await
        .expect("nothrow flush");

    queue.dispose().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn push_after_dispose_fails_with_disposed_kind() {
    let queue = ExecutionQueue::new(QueueMode::KeepAll);
    queue.dispose().await;
    queue.dispose().await; // idempotent

    let err = queue
        .push_back(Box::new(FnTask::new("late", |_cx| async { Ok(()) })))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ObjectDisconnected);
}

#[tokio::test(flavor = "multi_thread")]
async fn unscheduled_push_starts_on_the_next_scheduling_event() {
    let queue = ExecutionQueue::with_capacity(QueueMode::KeepNone, 2);

    let held = queue
        .push_back_unscheduled(Box::new(FnTask::new("held", |_cx| async { Ok(()) })))
        .expect("push");
    assert_eq!(queue.executing_count(), 0);
    assert_eq!(queue.pending_count(), 1);

    // A scheduled push drains the pending set, held task included.
    let trigger = queue
        .push_back(Box::new(FnTask::new("trigger", |_cx| async { Ok(()) })))
        .expect("push");

    queue.wait_for_success(&trigger).await.expect("trigger");
    queue.wait_for_success(&held).await.expect("held");

    queue.dispose().await;
}
