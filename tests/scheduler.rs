//! Stage Scheduler Integration Tests
//!
//! Tests for snapshot dispatch, failure isolation, the concurrency bound
//! and the ledger rows written per attempt.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{seed, temp_db, FakeExecutor, GatedExecutor, WrongStageExecutor};
use podcast_agent::adapters::StageExecutor;
use podcast_agent::core::{ItemRegistry, JobLedger, SchedulerError, StageScheduler};
use podcast_agent::domain::{FailureKind, JobStatus, StageKind};
use tokio_test::{assert_err, assert_ok};

fn scheduler(db: &podcast_agent::core::Database) -> (ItemRegistry, JobLedger, StageScheduler) {
    let registry = ItemRegistry::new(db.clone());
    let ledger = JobLedger::new(db.clone(), 3);
    let scheduler = StageScheduler::new(registry.clone(), ledger.clone());
    (registry, ledger, scheduler)
}

#[tokio::test]
async fn test_second_run_attempts_nothing() {
    let (_temp, db) = temp_db();
    let (registry, _ledger, scheduler) = scheduler(&db);
    seed(&registry, 3);

    let executor = Arc::new(FakeExecutor::new(StageKind::Download));
    let first = scheduler
        .run_stage(StageKind::Download, executor.clone(), 2)
        .await
        .unwrap();
    assert_eq!(first.attempted, 3);
    assert_eq!(first.succeeded, 3);

    let second = scheduler
        .run_stage(StageKind::Download, executor.clone(), 2)
        .await
        .unwrap();
    assert_eq!(second.attempted, 0);
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.failed, 0);
    assert_eq!(executor.calls(), 3);
}

#[tokio::test]
async fn test_one_failure_does_not_affect_the_rest() {
    let (_temp, db) = temp_db();
    let (registry, _ledger, scheduler) = scheduler(&db);
    let ids = seed(&registry, 5);
    let bad = ids[2];

    let executor = Arc::new(FakeExecutor::new(StageKind::Download).failing(bad));
    let summary = scheduler
        .run_stage(StageKind::Download, executor, 3)
        .await
        .unwrap();

    assert_eq!(summary.attempted, 5);
    assert_eq!(summary.succeeded, 4);
    assert_eq!(summary.failed, 1);

    for id in &ids {
        let item = registry.get(*id).unwrap().unwrap();
        if *id == bad {
            assert!(!item.downloaded);
            assert!(item.audio_file_path.is_none());
            assert!(item.last_error.as_deref().unwrap().contains("unreachable"));
            assert_eq!(item.retry_count, 1);
        } else {
            assert!(item.downloaded);
            assert!(item.audio_file_path.is_some());
            assert!(item.last_error.is_none());
        }
    }

    // The failed item stays eligible; the others move on to transcription
    let retry = registry.eligible_for(StageKind::Download, None).unwrap();
    assert_eq!(retry.len(), 1);
    assert_eq!(retry[0].id, bad);
    assert_eq!(
        registry
            .eligible_for(StageKind::Transcription, None)
            .unwrap()
            .len(),
        4
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_never_exceeds_limit() {
    let (_temp, db) = temp_db();
    let (registry, _ledger, scheduler) = scheduler(&db);
    seed(&registry, 6);

    let executor = Arc::new(GatedExecutor::new(StageKind::Download));
    let run = tokio::spawn({
        let scheduler = scheduler.clone();
        let executor: Arc<dyn StageExecutor> = executor.clone();
        async move { scheduler.run_stage(StageKind::Download, executor, 2).await }
    });

    // Exactly two calls enter while every call is held
    assert!(executor.wait_until(|e| e.in_flight() == 2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(executor.in_flight(), 2);

    // Each release frees one slot, which the next queued item takes
    for done in 1..=4 {
        executor.release(1);
        assert!(executor.wait_until(|e| e.finished() == done).await);
        assert!(executor.wait_until(|e| e.in_flight() == 2).await);
    }

    executor.release(2);
    let summary = run.await.unwrap().unwrap();

    assert_eq!(summary.attempted, 6);
    assert_eq!(summary.succeeded, 6);
    assert_eq!(executor.peak(), 2);
    assert_eq!(registry.eligible_for(StageKind::Download, None).unwrap().len(), 0);
}

#[tokio::test]
async fn test_rejected_commit_is_recorded_on_the_item() {
    let (_temp, db) = temp_db();
    let (registry, ledger, scheduler) = scheduler(&db);
    let ids = seed(&registry, 1);

    // Never downloaded, so a transcription result has no predecessor
    let stale = registry.get(ids[0]).unwrap().unwrap();
    let summary = scheduler
        .dispatch(
            StageKind::Transcription,
            vec![stale],
            Arc::new(FakeExecutor::new(StageKind::Transcription)),
            1,
        )
        .await
        .unwrap();

    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.failed, 1);

    let item = registry.get(ids[0]).unwrap().unwrap();
    assert!(!item.transcribed);
    assert!(item.transcript_file_path.is_none());
    assert_eq!(item.retry_count, 1);
    let error = item.last_error.unwrap();
    assert!(error.contains("failed to record output"), "{}", error);

    let jobs = ledger.jobs_for_item(ids[0]).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(jobs[0].error_kind, Some(FailureKind::Permanent));
}

#[tokio::test]
async fn test_empty_snapshot_is_not_an_error() {
    let (_temp, db) = temp_db();
    let (_registry, _ledger, scheduler) = scheduler(&db);

    let summary = assert_ok!(
        scheduler
            .run_stage(
                StageKind::Summarization,
                Arc::new(FakeExecutor::new(StageKind::Summarization)),
                2,
            )
            .await
    );

    assert_eq!(summary.attempted, 0);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(summary.failed, 0);
}

#[tokio::test]
async fn test_zero_concurrency_is_rejected() {
    let (_temp, db) = temp_db();
    let (registry, _ledger, scheduler) = scheduler(&db);
    seed(&registry, 1);

    let result = scheduler
        .run_stage(
            StageKind::Download,
            Arc::new(FakeExecutor::new(StageKind::Download)),
            0,
        )
        .await;
    let err = assert_err!(result);
    assert!(matches!(err, SchedulerError::InvalidConcurrency));
}

#[tokio::test]
async fn test_executor_panic_is_recorded_as_failure() {
    let (_temp, db) = temp_db();
    let (registry, ledger, scheduler) = scheduler(&db);
    let ids = seed(&registry, 3);

    let executor = Arc::new(FakeExecutor::new(StageKind::Download).panicking(ids[0]));
    let summary = scheduler
        .run_stage(StageKind::Download, executor, 2)
        .await
        .unwrap();

    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);

    let item = registry.get(ids[0]).unwrap().unwrap();
    assert!(!item.downloaded);
    assert_eq!(item.retry_count, 1);
    assert!(item.last_error.is_some());

    let jobs = ledger.jobs_for_item(ids[0]).unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert_eq!(jobs[0].error_kind, Some(FailureKind::Executor));
}

#[tokio::test]
async fn test_wrong_stage_output_is_permanent_failure() {
    let (_temp, db) = temp_db();
    let (registry, ledger, scheduler) = scheduler(&db);
    let ids = seed(&registry, 1);

    let summary = scheduler
        .run_stage(StageKind::Download, Arc::new(WrongStageExecutor), 1)
        .await
        .unwrap();
    assert_eq!(summary.failed, 1);

    let item = registry.get(ids[0]).unwrap().unwrap();
    assert!(!item.downloaded);
    assert!(item.summary_file_path.is_none());

    let jobs = ledger.jobs_for_item(ids[0]).unwrap();
    assert_eq!(jobs[0].error_kind, Some(FailureKind::Permanent));
}

#[tokio::test]
async fn test_ledger_rows_match_registry_outcomes() {
    let (_temp, db) = temp_db();
    let (registry, ledger, scheduler) = scheduler(&db);
    let ids = seed(&registry, 3);

    let executor = Arc::new(FakeExecutor::new(StageKind::Download).failing(ids[1]));
    scheduler
        .run_stage(StageKind::Download, executor, 3)
        .await
        .unwrap();

    for id in &ids {
        let jobs = ledger.jobs_for_item(*id).unwrap();
        assert_eq!(jobs.len(), 1, "one row per attempt");
        let job = &jobs[0];
        assert_eq!(job.stage, StageKind::Download);
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
        assert!(job.started_at <= job.completed_at);

        let item = registry.get(*id).unwrap().unwrap();
        if item.downloaded {
            assert_eq!(job.status, JobStatus::Completed);
            assert!(job.error_kind.is_none());
        } else {
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.error_kind, Some(FailureKind::Transient));
        }
    }

    let counts = ledger.count_by_status().unwrap();
    assert_eq!(counts.get("completed"), Some(&2));
    assert_eq!(counts.get("failed"), Some(&1));
}

#[tokio::test]
async fn test_batch_limit_caps_snapshot() {
    let (_temp, db) = temp_db();
    let (registry, _ledger, scheduler) = scheduler(&db);
    let ids = seed(&registry, 5);

    let summary = scheduler
        .run_stage_limited(
            StageKind::Download,
            Arc::new(FakeExecutor::new(StageKind::Download)),
            2,
            Some(2),
        )
        .await
        .unwrap();
    assert_eq!(summary.attempted, 2);

    // Oldest published first
    assert!(registry.get(ids[0]).unwrap().unwrap().downloaded);
    assert!(registry.get(ids[1]).unwrap().unwrap().downloaded);
    assert!(!registry.get(ids[2]).unwrap().unwrap().downloaded);
}

#[tokio::test]
async fn test_stages_chain_through_registry() {
    let (_temp, db) = temp_db();
    let (registry, _ledger, scheduler) = scheduler(&db);
    let ids = seed(&registry, 2);

    for stage in StageKind::ALL {
        let summary = scheduler
            .run_stage(stage, Arc::new(FakeExecutor::new(stage)), 2)
            .await
            .unwrap();
        assert_eq!(summary.succeeded, 2, "{} stage", stage);
    }

    for id in ids {
        let item = registry.get(id).unwrap().unwrap();
        assert!(item.downloaded && item.transcribed && item.summarized);
        assert_eq!(item.transcript_word_count, Some(1500));
        let summary = registry.summary_for(id).unwrap().unwrap();
        assert_eq!(summary.key_points, vec!["First point"]);
    }
}
