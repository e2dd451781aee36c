//! End-to-end lifecycle scenarios against the in-memory backends.

use drover::core::{
    AttemptCompletion, AttemptStatus, EnvironmentType, ExecutionStatus, RunEnvironment, RunError,
    RunErrorCode, RunStatus, WaitpointStatus,
};
use drover::delayed::DelayedJob;
use drover::engine::{delayed_job_worker, EngineConfig, RunEngine, StallTimeouts, TriggerRequest};
use drover::runner::{Runner, RunnerConfig, TaskOutcome, TaskRegistry, WarmStartConfig};
use drover::supervisor::{PlatformClient, Supervisor};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn env() -> RunEnvironment {
    RunEnvironment::new("org_1", "proj_1", "env_1", EnvironmentType::Production)
}

fn engine() -> Arc<RunEngine> {
    Arc::new(RunEngine::in_memory())
}

fn master(engine: &RunEngine) -> String {
    engine.master_queue_key(&env(), Some("m"))
}

fn request(task: &str) -> TriggerRequest {
    TriggerRequest::new(task, "{\"x\":1}", env()).with_master_queue("m")
}

/// Snapshot history must be a legal transition path; spot-check the spine.
fn assert_snapshot_path(actual: &[ExecutionStatus], expected: &[ExecutionStatus]) {
    assert_eq!(actual, expected, "snapshot path mismatch");
}

#[tokio::test]
async fn s1_simple_run_lifecycle() {
    let engine = engine();
    let run = engine.trigger(request("hello")).await.unwrap();
    assert_eq!(run.status, RunStatus::Pending);

    let dequeued = engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dequeued.message.run_id, run.id);

    let execution = engine
        .start_attempt(run.id, dequeued.snapshot_id, "c1", false)
        .await
        .unwrap();
    assert_eq!(execution.attempt_number, 1);
    assert_eq!(execution.payload, "{\"x\":1}");

    let result = engine
        .complete_attempt(
            run.id,
            execution.snapshot_id,
            AttemptCompletion::succeeded("\"hi\""),
        )
        .await
        .unwrap();
    assert_eq!(result.attempt_status, AttemptStatus::RunFinished);

    let (run, latest) = engine.run_view(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::CompletedSuccessfully);
    assert_eq!(run.output.as_deref(), Some("\"hi\""));
    assert_eq!(latest.execution_status, ExecutionStatus::Finished);

    // The run's associated waitpoint completed with the output.
    let waitpoint = engine
        .store()
        .get_waitpoint(run.associated_waitpoint_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(waitpoint.status, WaitpointStatus::Completed);
    assert_eq!(waitpoint.output.as_deref(), Some("\"hi\""));
    assert!(!waitpoint.output_is_error);

    // Invariant: snapshots form the expected path.
    let statuses: Vec<_> = engine
        .store()
        .snapshots_for_run(run.id)
        .await
        .unwrap()
        .iter()
        .map(|s| s.execution_status)
        .collect();
    assert_snapshot_path(
        &statuses,
        &[
            ExecutionStatus::RunCreated,
            ExecutionStatus::Queued,
            ExecutionStatus::DequeuedForExecution,
            ExecutionStatus::Executing,
            ExecutionStatus::Finished,
        ],
    );

    // Invariant: terminal runs hold no queue entry and no blocking rows.
    assert!(engine.queue().read_message(run.id).await.unwrap().is_none());
    assert!(engine
        .store()
        .waitpoints_blocking_run(run.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn s2_trigger_and_wait_unblocks_parent() {
    let engine = engine();

    // Parent reaches EXECUTING.
    let parent = engine.trigger(request("parent")).await.unwrap();
    let dequeued = engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .unwrap();
    let parent_execution = engine
        .start_attempt(parent.id, dequeued.snapshot_id, "c1", false)
        .await
        .unwrap();

    // Parent triggers a child and blocks on its completion.
    let child = engine
        .trigger(request("child").with_parent(parent.id, true))
        .await
        .unwrap();
    assert_eq!(child.depth, 1);
    assert_eq!(child.root_run_id, Some(parent.id));

    let (parent_row, parent_snapshot) = engine.run_view(parent.id).await.unwrap();
    assert_eq!(parent_row.status, RunStatus::WaitingToResume);
    assert_eq!(
        parent_snapshot.execution_status,
        ExecutionStatus::ExecutingWithWaitpoints
    );
    let blocking = engine
        .store()
        .waitpoints_blocking_run(parent.id)
        .await
        .unwrap();
    assert_eq!(blocking.len(), 1);
    assert_eq!(
        Some(blocking[0].waitpoint_id),
        child.associated_waitpoint_id
    );

    // Child runs to completion.
    let child_dequeued = engine
        .dequeue_from_master_queue("c2", &master(&engine))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child_dequeued.message.run_id, child.id);
    let child_execution = engine
        .start_attempt(child.id, child_dequeued.snapshot_id, "c2", false)
        .await
        .unwrap();
    engine
        .complete_attempt(
            child.id,
            child_execution.snapshot_id,
            AttemptCompletion::succeeded("\"child output\""),
        )
        .await
        .unwrap();

    // Parent is unblocked: ready to continue with the child's waitpoint.
    let (parent_row, parent_snapshot) = engine.run_view(parent.id).await.unwrap();
    assert_eq!(
        parent_snapshot.execution_status,
        ExecutionStatus::PendingExecuting
    );
    assert!(parent_snapshot
        .completed_waitpoint_ids
        .contains(&child.associated_waitpoint_id.unwrap()));
    assert!(engine
        .store()
        .waitpoints_blocking_run(parent.id)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(parent_row.status, RunStatus::WaitingToResume);

    // The runner continues and receives the child's output.
    let continued = engine
        .continue_run_execution(parent.id, parent_snapshot.id)
        .await
        .unwrap();
    assert_eq!(continued.execution_status, ExecutionStatus::Executing);
    let delivered = engine
        .store()
        .get_waitpoints(&continued.completed_waitpoint_ids)
        .await
        .unwrap();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].output.as_deref(), Some("\"child output\""));

    // Parent finishes normally.
    engine
        .complete_attempt(
            parent.id,
            continued.id,
            AttemptCompletion::succeeded("\"parent done\""),
        )
        .await
        .unwrap();
    let (parent_row, _) = engine.run_view(parent.id).await.unwrap();
    assert_eq!(parent_row.status, RunStatus::CompletedSuccessfully);
    let _ = parent_execution;
}

#[tokio::test]
async fn s3_datetime_wait_suspends_and_resumes() {
    let engine = engine();
    let worker = delayed_job_worker(Arc::clone(&engine), Arc::clone(engine.delayed_jobs()))
        .with_poll_interval(Duration::from_millis(20));
    let worker_handle = worker.start();

    let run = engine.trigger(request("sleeper")).await.unwrap();
    let dequeued = engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .unwrap();
    let execution = engine
        .start_attempt(run.id, dequeued.snapshot_id, "c1", false)
        .await
        .unwrap();

    // Runner asks to wait 150ms.
    let waitpoint = engine
        .wait_for_duration(
            run.id,
            execution.snapshot_id,
            chrono::Utc::now() + chrono::Duration::milliseconds(150),
        )
        .await
        .unwrap();
    let (run_row, snapshot) = engine.run_view(run.id).await.unwrap();
    assert_eq!(run_row.status, RunStatus::WaitingToResume);
    assert_eq!(
        snapshot.execution_status,
        ExecutionStatus::ExecutingWithWaitpoints
    );

    // Runner requests suspension and detaches.
    let outcome = engine.suspend(run.id, snapshot.id).await.unwrap();
    assert!(outcome.suspended);
    assert_eq!(
        outcome.snapshot.execution_status,
        ExecutionStatus::Suspended
    );

    // The delayed job fires, completes the waitpoint and re-enqueues.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let completed = engine
        .store()
        .get_waitpoint(waitpoint.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(completed.status, WaitpointStatus::Completed);

    let resumed = engine
        .dequeue_from_master_queue("c2", &master(&engine))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resumed.message.run_id, run.id);
    let execution = engine
        .start_attempt(run.id, resumed.snapshot_id, "c2", true)
        .await
        .unwrap();
    assert!(execution
        .completed_waitpoints
        .iter()
        .any(|w| w.id == waitpoint.id));

    engine
        .complete_attempt(run.id, execution.snapshot_id, AttemptCompletion::succeeded("\"ok\""))
        .await
        .unwrap();
    worker_handle.shutdown().await;
}

#[tokio::test]
async fn s4_queue_concurrency_cap() {
    let engine = engine();
    let serial = || {
        request("serial-task")
            .with_queue("serial")
            .with_queue_concurrency_limit(1)
    };
    let first = engine.trigger(serial()).await.unwrap();
    let second = engine.trigger(serial()).await.unwrap();

    let held = engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(held.message.run_id, first.id);

    // Second run stays queued while the first holds the only slot.
    assert!(engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .is_none());

    let execution = engine
        .start_attempt(first.id, held.snapshot_id, "c1", false)
        .await
        .unwrap();
    engine
        .complete_attempt(first.id, execution.snapshot_id, AttemptCompletion::succeeded("\"1\""))
        .await
        .unwrap();

    let next = engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next.message.run_id, second.id);
}

#[tokio::test]
async fn s5_stalled_attempt_crashes_without_retry_budget() {
    let engine = engine();
    let run = engine.trigger(request("stall")).await.unwrap();
    let dequeued = engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .unwrap();
    let execution = engine
        .start_attempt(run.id, dequeued.snapshot_id, "c1", false)
        .await
        .unwrap();

    // The stall-check fires on the EXECUTING snapshot, still the latest:
    // the runner is presumed dead. max_attempts=1 leaves no retry budget.
    engine
        .handle_delayed_job(DelayedJob::HeartbeatSnapshot {
            run_id: run.id,
            snapshot_id: execution.snapshot_id,
        })
        .await
        .unwrap();

    let (run_row, latest) = engine.run_view(run.id).await.unwrap();
    assert_eq!(run_row.status, RunStatus::Crashed);
    assert_eq!(latest.execution_status, ExecutionStatus::Finished);
    assert_eq!(
        run_row.error.as_ref().map(|e| e.code),
        Some(RunErrorCode::TaskRunStalledExecuting)
    );
}

#[tokio::test]
async fn s5b_stalled_attempt_requeues_with_budget() {
    let engine = Arc::new(RunEngine::in_memory());
    let run = engine
        .trigger(request("stall-retry").with_max_attempts(2))
        .await
        .unwrap();
    let dequeued = engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .unwrap();
    let execution = engine
        .start_attempt(run.id, dequeued.snapshot_id, "c1", false)
        .await
        .unwrap();

    engine
        .handle_delayed_job(DelayedJob::HeartbeatSnapshot {
            run_id: run.id,
            snapshot_id: execution.snapshot_id,
        })
        .await
        .unwrap();

    let (run_row, latest) = engine.run_view(run.id).await.unwrap();
    assert_eq!(run_row.status, RunStatus::Pending);
    assert_eq!(latest.execution_status, ExecutionStatus::Queued);

    // Stale timer for the old snapshot is dropped silently.
    engine
        .handle_delayed_job(DelayedJob::HeartbeatSnapshot {
            run_id: run.id,
            snapshot_id: execution.snapshot_id,
        })
        .await
        .unwrap();
    let (_, still_latest) = engine.run_view(run.id).await.unwrap();
    assert_eq!(still_latest.id, latest.id);
}

#[tokio::test]
async fn s6_ttl_expires_undequeued_run() {
    let engine = engine();
    let run = engine
        .trigger(request("expiring").with_ttl(Duration::from_secs(30)))
        .await
        .unwrap();

    engine
        .handle_delayed_job(DelayedJob::ExpireRun { run_id: run.id })
        .await
        .unwrap();

    let (run_row, latest) = engine.run_view(run.id).await.unwrap();
    assert_eq!(run_row.status, RunStatus::Expired);
    assert_eq!(latest.execution_status, ExecutionStatus::Finished);
    assert_eq!(
        run_row.error.as_ref().map(|e| e.code),
        Some(RunErrorCode::TaskRunExpired)
    );

    // Removed from the queue entirely.
    assert!(engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .is_none());
    assert!(engine.queue().read_message(run.id).await.unwrap().is_none());

    let waitpoint = engine
        .store()
        .get_waitpoint(run_row.associated_waitpoint_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(waitpoint.output_is_error);
}

#[tokio::test]
async fn ttl_does_not_expire_started_run() {
    let engine = engine();
    let run = engine
        .trigger(request("fast").with_ttl(Duration::from_secs(30)))
        .await
        .unwrap();
    let dequeued = engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .unwrap();
    engine
        .start_attempt(run.id, dequeued.snapshot_id, "c1", false)
        .await
        .unwrap();

    engine
        .handle_delayed_job(DelayedJob::ExpireRun { run_id: run.id })
        .await
        .unwrap();
    let (run_row, _) = engine.run_view(run.id).await.unwrap();
    assert_eq!(run_row.status, RunStatus::Executing);
}

#[tokio::test]
async fn trigger_idempotency_key_returns_existing_run() {
    let engine = engine();
    let first = engine
        .trigger(request("dedupe").with_idempotency_key("once"))
        .await
        .unwrap();
    let second = engine
        .trigger(request("dedupe").with_idempotency_key("once"))
        .await
        .unwrap();
    assert_eq!(first.id, second.id);

    // Exactly one run was created: one RUN_CREATED + one QUEUED snapshot.
    let snapshots = engine.store().snapshots_for_run(first.id).await.unwrap();
    assert_eq!(snapshots.len(), 2);

    // And exactly one queue entry exists.
    engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .unwrap();
    assert!(engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn delayed_trigger_blocks_until_datetime() {
    let engine = engine();
    let worker = delayed_job_worker(Arc::clone(&engine), Arc::clone(engine.delayed_jobs()))
        .with_poll_interval(Duration::from_millis(20));
    let worker_handle = worker.start();

    let run = engine
        .trigger(
            request("delayed")
                .with_delay_until(chrono::Utc::now() + chrono::Duration::milliseconds(150)),
        )
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Delayed);

    // Not dequeueable before the delay elapses.
    assert!(engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .is_none());

    tokio::time::sleep(Duration::from_millis(400)).await;
    let dequeued = engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(dequeued.message.run_id, run.id);
    worker_handle.shutdown().await;
}

#[tokio::test]
async fn cancel_executing_run_round_trips_through_runner() {
    let engine = engine();
    let run = engine.trigger(request("cancellable")).await.unwrap();
    let dequeued = engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .unwrap();
    let execution = engine
        .start_attempt(run.id, dequeued.snapshot_id, "c1", false)
        .await
        .unwrap();

    let snapshot = engine.cancel(run.id).await.unwrap();
    assert_eq!(snapshot.execution_status, ExecutionStatus::PendingCancel);

    // The runner observes PENDING_CANCEL and submits an aborted completion.
    let result = engine
        .complete_attempt(
            run.id,
            snapshot.id,
            AttemptCompletion::failed(RunError::aborted()),
        )
        .await
        .unwrap();
    assert_eq!(result.attempt_status, AttemptStatus::RunPendingCancel);

    let (run_row, _) = engine.run_view(run.id).await.unwrap();
    assert_eq!(run_row.status, RunStatus::Canceled);
    let _ = execution;
}

#[tokio::test]
async fn cancel_queued_run_finishes_immediately() {
    let engine = engine();
    let run = engine.trigger(request("cancellable")).await.unwrap();
    let snapshot = engine.cancel(run.id).await.unwrap();
    assert_eq!(snapshot.execution_status, ExecutionStatus::Finished);
    let (run_row, _) = engine.run_view(run.id).await.unwrap();
    assert_eq!(run_row.status, RunStatus::Canceled);
    assert!(engine.queue().read_message(run.id).await.unwrap().is_none());
}

#[tokio::test]
async fn retry_queued_after_failure_with_delay() {
    let engine = engine();
    let run = engine
        .trigger(request("flaky").with_max_attempts(3))
        .await
        .unwrap();
    let dequeued = engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .unwrap();
    let execution = engine
        .start_attempt(run.id, dequeued.snapshot_id, "c1", false)
        .await
        .unwrap();

    let result = engine
        .complete_attempt(
            run.id,
            execution.snapshot_id,
            AttemptCompletion::failed_with_retry(
                RunError::new(RunErrorCode::TaskRunFailed, "transient"),
                Duration::from_secs(30),
            ),
        )
        .await
        .unwrap();
    assert_eq!(result.attempt_status, AttemptStatus::RetryQueued);

    let (run_row, latest) = engine.run_view(run.id).await.unwrap();
    assert_eq!(run_row.status, RunStatus::Pending);
    assert_eq!(latest.execution_status, ExecutionStatus::Queued);

    // Not yet visible: availability is 30s out.
    assert!(engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn retry_immediately_stays_with_runner() {
    let engine = engine();
    let run = engine
        .trigger(request("flaky").with_max_attempts(2))
        .await
        .unwrap();
    let dequeued = engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .unwrap();
    let execution = engine
        .start_attempt(run.id, dequeued.snapshot_id, "c1", false)
        .await
        .unwrap();

    let result = engine
        .complete_attempt(
            run.id,
            execution.snapshot_id,
            AttemptCompletion::failed_with_retry(
                RunError::new(RunErrorCode::TaskRunFailed, "blip"),
                Duration::from_millis(100),
            ),
        )
        .await
        .unwrap();
    assert_eq!(result.attempt_status, AttemptStatus::RetryImmediately);

    // The runner starts the next attempt against the returned snapshot.
    let execution = engine
        .start_attempt(run.id, result.snapshot.id, "c1", true)
        .await
        .unwrap();
    assert_eq!(execution.attempt_number, 2);
    let final_result = engine
        .complete_attempt(run.id, execution.snapshot_id, AttemptCompletion::succeeded("\"ok\""))
        .await
        .unwrap();
    assert_eq!(final_result.attempt_status, AttemptStatus::RunFinished);
}

#[tokio::test]
async fn stale_snapshot_is_rejected_with_conflict() {
    let engine = engine();
    let run = engine.trigger(request("hello")).await.unwrap();
    let dequeued = engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .unwrap();

    let err = engine
        .start_attempt(run.id, Uuid::new_v4(), "c1", false)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 409);

    // The real snapshot still works afterwards.
    engine
        .start_attempt(run.id, dequeued.snapshot_id, "c1", false)
        .await
        .unwrap();
}

#[tokio::test]
async fn lost_wakeup_scanner_continues_stranded_run() {
    let engine = Arc::new(
        RunEngine::builder()
            .store(Arc::new(drover::store::InMemoryRunStore::new()))
            .queue(Arc::new(drover::queue::InMemoryRunQueue::default()))
            .delayed_jobs(Arc::new(drover::delayed::InMemoryDelayedJobQueue::new()))
            .locks(Arc::new(drover::engine::InMemoryRunLockManager::default()))
            .notifier(Arc::new(drover::notify::InProcessNotifier::new()))
            .config(EngineConfig {
                waiting_to_resume_scan_age: Duration::from_millis(0),
                stall_timeouts: StallTimeouts::default(),
                ..EngineConfig::default()
            })
            .build()
            .unwrap(),
    );

    let run = engine.trigger(request("stranded")).await.unwrap();
    let dequeued = engine
        .dequeue_from_master_queue("c1", &master(&engine))
        .await
        .unwrap()
        .unwrap();
    let execution = engine
        .start_attempt(run.id, dequeued.snapshot_id, "c1", false)
        .await
        .unwrap();

    // Block the run on a manual waitpoint, then complete the waitpoint
    // directly in the store — simulating a wakeup lost between the
    // completion and continue_run.
    let waitpoint = engine
        .create_manual_waitpoint("proj_1", None)
        .await
        .unwrap();
    engine.block_run(run.id, &waitpoint).await.unwrap();
    engine
        .store()
        .complete_waitpoint(waitpoint.id, None, false)
        .await
        .unwrap();
    // The store-level completion already dropped the blocking row, but no
    // continue ran; the run is stranded WAITING_TO_RESUME.
    let (run_row, _) = engine.run_view(run.id).await.unwrap();
    assert_eq!(run_row.status, RunStatus::WaitingToResume);

    let continued = engine.scan_stalled_waiting_runs().await.unwrap();
    assert_eq!(continued, 1);
    // The worker is still attached, so the scanner hands execution back via
    // PENDING_EXECUTING; the runner's continue call finishes the resume.
    let (_, latest) = engine.run_view(run.id).await.unwrap();
    assert_eq!(latest.execution_status, ExecutionStatus::PendingExecuting);
    let _ = execution;
}

#[tokio::test]
async fn runner_executes_run_end_to_end() {
    let engine = engine();
    let master_key = master(&engine);
    let supervisor = Arc::new(
        Supervisor::new(Arc::clone(&engine), "consumer-1", master_key).with_config(
            drover::supervisor::SupervisorConfig {
                connection_timeout: Duration::from_millis(200),
                poll_interval: Duration::from_millis(20),
            },
        ),
    );

    let mut registry = TaskRegistry::new();
    registry.register("greet", |ctx| async move {
        let name: serde_json::Value =
            serde_json::from_str(&ctx.execution.payload).unwrap_or_default();
        TaskOutcome::Success(format!("\"hello {}\"", name["x"]))
    });

    let runner = Runner::new(
        supervisor as Arc<dyn PlatformClient>,
        Arc::new(registry),
        "runner-1",
    )
    .with_config(RunnerConfig {
        heartbeat_interval: Duration::from_millis(100),
        snapshot_poll_interval: Duration::from_millis(50),
        warm_start: WarmStartConfig {
            connection_timeout: Duration::from_millis(200),
            total_duration: Duration::from_millis(600),
        },
    });

    let run = engine.trigger(request("greet")).await.unwrap();
    let handled = runner.run().await.unwrap();
    assert_eq!(handled, 1);

    let (run_row, _) = engine.run_view(run.id).await.unwrap();
    assert_eq!(run_row.status, RunStatus::CompletedSuccessfully);
    assert_eq!(run_row.output.as_deref(), Some("\"hello 1\""));
}

#[tokio::test]
async fn runner_retries_immediately_and_succeeds() {
    let engine = engine();
    let master_key = master(&engine);
    let supervisor = Arc::new(
        Supervisor::new(Arc::clone(&engine), "consumer-1", master_key).with_config(
            drover::supervisor::SupervisorConfig {
                connection_timeout: Duration::from_millis(200),
                poll_interval: Duration::from_millis(20),
            },
        ),
    );

    let mut registry = TaskRegistry::new();
    registry.register("flaky", |ctx| async move {
        if ctx.execution.attempt_number == 1 {
            TaskOutcome::Failure {
                error: RunError::new(RunErrorCode::TaskRunFailed, "first try fails"),
                retry_delay: Some(Duration::from_millis(50)),
            }
        } else {
            TaskOutcome::Success("\"second try\"".to_string())
        }
    });

    let runner = Runner::new(
        supervisor as Arc<dyn PlatformClient>,
        Arc::new(registry),
        "runner-1",
    )
    .with_config(RunnerConfig {
        heartbeat_interval: Duration::from_millis(100),
        snapshot_poll_interval: Duration::from_millis(50),
        warm_start: WarmStartConfig {
            connection_timeout: Duration::from_millis(200),
            total_duration: Duration::from_millis(800),
        },
    });

    let run = engine
        .trigger(request("flaky").with_max_attempts(2))
        .await
        .unwrap();
    runner.run().await.unwrap();

    let (run_row, _) = engine.run_view(run.id).await.unwrap();
    assert_eq!(run_row.status, RunStatus::CompletedSuccessfully);
    assert_eq!(run_row.output.as_deref(), Some("\"second try\""));
    assert_eq!(run_row.attempt_count, 2);
}
