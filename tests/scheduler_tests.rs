
use std::time::Duration;

use migration_scheduler::driver::SimulatedDriver;
use migration_scheduler::error::MigrationError;
use migration_scheduler::inventory::TaskState;
use migration_scheduler::scheduler::JobState;
use test_harness::{assert_eventually, test_config, TestScheduler, SRC};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[tokio::test]
async fn test_capacity_one_queues_second_migration() {
    let sched = TestScheduler::new(test_config(1));
    sched.driver.hold().await;

    let (a, instance_a) = sched.migrate_new("dest-a").await;
    let (b, instance_b) = sched.migrate_new("dest-b").await;

    assert_eq!(sched.state(a).await, JobState::Running);
    assert_eq!(sched.state(b).await, JobState::Queued);

    // Both instances are marked as migrating from submission onwards
    assert_eq!(sched.instance(instance_a).await.task_state, TaskState::Migrating);
    assert_eq!(sched.instance(instance_b).await.task_state, TaskState::Migrating);

    let stats = sched.service.stats().await;
    assert_eq!(stats.slots_in_use, 1);
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.capacity, 1);
}

#[tokio::test]
async fn test_job_creation_timestamps() {
    let sched = TestScheduler::new(test_config(1));
    sched.driver.hold().await;

    let (a, _) = sched.migrate_new("dest-a").await;
    let (b, _) = sched.migrate_new("dest-b").await;

    let job_a = sched.job(a).await;
    let job_b = sched.job(b).await;
    assert!(job_a.started_at.is_some());
    assert!(job_a.ended_at.is_none());
    assert!(job_b.started_at.is_none());
    assert!(job_a.created_at <= job_b.created_at);
    assert_eq!(job_a.source_host, SRC);
    assert_eq!(job_a.dest_host, "dest-a");
}

#[tokio::test]
async fn test_completion_admits_next_in_fifo_order() {
    let sched = TestScheduler::new(test_config(1));
    sched.driver.hold().await;

    let (a, _) = sched.migrate_new("dest-a").await;
    let (b, _) = sched.migrate_new("dest-b").await;
    let (c, _) = sched.migrate_new("dest-c").await;
    sched.wait_for_handle(a).await;

    sched.driver.complete(a).await;
    sched.service.poll_once().await;

    assert_eq!(sched.state(a).await, JobState::Completed);
    assert_eq!(sched.state(b).await, JobState::Running);
    assert_eq!(sched.state(c).await, JobState::Queued);

    sched.wait_for_handle(b).await;
    sched.driver.complete(b).await;
    sched.service.poll_once().await;

    assert_eq!(sched.state(b).await, JobState::Completed);
    assert_eq!(sched.state(c).await, JobState::Running);
}

#[tokio::test]
async fn test_next_job_admitted_within_poll_interval() {
    let sched = TestScheduler::new(test_config(1));
    sched.driver.hold().await;

    let (a, instance_a) = sched.migrate_new("dest-a").await;
    let (b, _) = sched.migrate_new("dest-b").await;

    let shutdown = CancellationToken::new();
    let monitor = sched.service.spawn_monitor(shutdown.clone());

    sched.driver.release().await;
    assert!(
        sched
            .wait_for_state(a, JobState::Completed, Duration::from_secs(2))
            .await,
        "first migration should complete once released"
    );
    assert!(
        sched
            .wait_for_state(b, JobState::Running, Duration::from_millis(100))
            .await
            || sched.state(b).await == JobState::Completed,
        "second migration should be admitted right after the first finishes"
    );

    let instance = sched.instance(instance_a).await;
    assert_eq!(instance.host, "dest-a");
    assert_eq!(instance.task_state, TaskState::None);

    shutdown.cancel();
    monitor.await.unwrap();
}

#[tokio::test]
async fn test_capacity_two_runs_two_at_once() {
    let sched = TestScheduler::new(test_config(2));
    sched.driver.hold().await;

    let (a, _) = sched.migrate_new("dest-a").await;
    let (b, _) = sched.migrate_new("dest-b").await;
    let (c, _) = sched.migrate_new("dest-c").await;

    assert_eq!(sched.state(a).await, JobState::Running);
    assert_eq!(sched.state(b).await, JobState::Running);
    assert_eq!(sched.state(c).await, JobState::Queued);
    assert_eq!(sched.service.stats().await.slots_in_use, 2);
}

#[tokio::test]
async fn test_slots_never_exceed_capacity() {
    let driver = SimulatedDriver::with_completion_polls(1, 4);
    let sched = TestScheduler::with_driver(test_config(2), driver);

    let mut jobs = Vec::new();
    for n in 0..6 {
        let (job, _) = sched.migrate_new(&format!("dest-{}", n)).await;
        jobs.push(job);
    }

    let shutdown = CancellationToken::new();
    let monitor = sched.service.spawn_monitor(shutdown.clone());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = sched.service.stats().await;
        assert!(stats.slots_in_use <= 2, "slots in use: {}", stats.slots_in_use);

        let all_done = sched
            .service
            .list_migrations(None)
            .await
            .iter()
            .all(|job| job.state == JobState::Completed);
        if all_done {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "migrations did not finish");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(sched.service.stats().await.slots_in_use, 0);
    assert_eq!(sched.driver.initiated().await, 6);

    shutdown.cancel();
    monitor.await.unwrap();
}

#[tokio::test]
async fn test_duplicate_submission_rejected() {
    let sched = TestScheduler::new(test_config(1));
    sched.driver.hold().await;

    let (a, instance) = sched.migrate_new("dest-a").await;
    let err = sched
        .service
        .submit_migration(instance, SRC, "dest-b")
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::InvalidRequest(_)));

    // Only one job exists for the instance
    assert_eq!(sched.service.list_migrations(Some(instance)).await.len(), 1);
    assert_eq!(sched.state(a).await, JobState::Running);
}

#[tokio::test]
async fn test_resubmit_after_terminal_job() {
    let sched = TestScheduler::new(test_config(1));
    sched.driver.hold().await;

    let (a, instance) = sched.migrate_new("dest-a").await;
    sched.wait_for_handle(a).await;
    sched.driver.fail(a, "destination refused connection").await;
    sched.service.poll_once().await;
    assert_eq!(sched.state(a).await, JobState::Failed);

    let b = sched
        .service
        .submit_migration(instance, SRC, "dest-b")
        .await
        .unwrap();
    assert_eq!(sched.state(b).await, JobState::Running);
    assert_eq!(sched.service.list_migrations(Some(instance)).await.len(), 2);
}

#[tokio::test]
async fn test_invalid_requests() {
    let sched = TestScheduler::new(test_config(1));
    let instance = sched.create_instance().await;

    let same_host = sched.service.submit_migration(instance, SRC, SRC).await;
    assert!(matches!(same_host, Err(MigrationError::InvalidRequest(_))));

    let empty = sched.service.submit_migration(instance, SRC, "").await;
    assert!(matches!(empty, Err(MigrationError::InvalidRequest(_))));

    let unknown = sched
        .service
        .submit_migration(Uuid::new_v4(), SRC, "dest")
        .await;
    assert!(matches!(unknown, Err(MigrationError::InvalidRequest(_))));

    let wrong_source = sched
        .service
        .submit_migration(instance, "elsewhere", "dest")
        .await;
    assert!(matches!(wrong_source, Err(MigrationError::InvalidRequest(_))));

    // Nothing was queued and the instance was never touched
    assert!(sched.service.list_migrations(None).await.is_empty());
    assert_eq!(sched.instance(instance).await.task_state, TaskState::None);
}

#[tokio::test]
async fn test_status_of_unknown_job() {
    let sched = TestScheduler::new(test_config(1));
    let err = sched
        .service
        .get_migration_status(Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::NotFound(_)));
}

#[tokio::test]
async fn test_list_migrations_filter() {
    let sched = TestScheduler::new(test_config(1));
    sched.driver.hold().await;

    let (a, instance_a) = sched.migrate_new("dest-a").await;
    let (b, _) = sched.migrate_new("dest-b").await;

    let all: Vec<Uuid> = sched
        .service
        .list_migrations(None)
        .await
        .iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(all, vec![a, b]);

    let only_a = sched.service.list_migrations(Some(instance_a)).await;
    assert_eq!(only_a.len(), 1);
    assert_eq!(only_a[0].id, a);

    assert!(sched
        .service
        .list_migrations(Some(Uuid::new_v4()))
        .await
        .is_empty());
}

#[tokio::test]
async fn test_start_failure_fails_job_and_admits_next() {
    let sched = TestScheduler::new(test_config(1));
    sched.driver.hold().await;
    sched.driver.fail_next_initiate("libvirt connection refused").await;

    let (a, instance_a) = sched.migrate_new("dest-a").await;
    let (b, _) = sched.migrate_new("dest-b").await;

    assert_eventually(
        || async { sched.state(a).await == JobState::Failed },
        Duration::from_secs(2),
        "migration should fail when the driver refuses to start it",
    )
    .await;

    let job = sched.job(a).await;
    assert!(job.error.unwrap().contains("libvirt connection refused"));
    assert!(!job.needs_attention);

    // Instance never left the source and is usable again
    let instance = sched.instance(instance_a).await;
    assert_eq!(instance.host, SRC);
    assert_eq!(instance.task_state, TaskState::None);

    assert_eventually(
        || async { sched.state(b).await == JobState::Running },
        Duration::from_secs(2),
        "second migration should take the freed slot",
    )
    .await;
}

#[tokio::test]
async fn test_history_limit_prunes_oldest_finished() {
    let config = test_config(1).with_history_limit(2);
    let sched = TestScheduler::new(config);

    let mut jobs = Vec::new();
    for n in 0..3 {
        let (job, _) = sched.migrate_new(&format!("dest-{}", n)).await;
        sched.wait_for_handle(job).await;
        sched.service.poll_once().await;
        assert_eq!(sched.state(job).await, JobState::Completed);
        jobs.push(job);
    }

    let remaining: Vec<Uuid> = sched
        .service
        .list_migrations(None)
        .await
        .iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(remaining, vec![jobs[1], jobs[2]]);
}
