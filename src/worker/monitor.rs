use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::driver::{JobPhase, JobStats, MigrationDriver};
use crate::error::DriverError;
use crate::scheduler::job::JobState;
use crate::scheduler::queue::ActiveJob;
use crate::scheduler::SharedQueue;
use crate::worker::runner::{JobRunner, Outcome};

/// Polls the hypervisor for every running or aborting migration and turns
/// the reported phase into a job transition.
///
/// One loop serves all jobs. The queue lock is never held while waiting on
/// the driver.
pub struct HypervisorJobMonitor {
    queue: SharedQueue,
    driver: Arc<dyn MigrationDriver>,
    runner: JobRunner,
    poll_interval: Duration,
    max_poll_failures: u32,
    completion_timeout: Option<Duration>,
}

impl HypervisorJobMonitor {
    pub fn new(
        queue: SharedQueue,
        driver: Arc<dyn MigrationDriver>,
        runner: JobRunner,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            queue,
            driver,
            runner,
            poll_interval: config.poll_interval(),
            max_poll_failures: config.max_poll_failures,
            completion_timeout: config.completion_timeout(),
        }
    }

    /// Poll on a fixed interval until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_ms = self.poll_interval.as_millis() as u64, "Migration monitor started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Migration monitor stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }

    /// Run one polling pass over all active jobs.
    pub async fn poll_once(&self) {
        let active = self.queue.lock().await.monitored();
        if !active.is_empty() {
            tracing::debug!(count = active.len(), "Polling active migrations");
        }
        for job in active {
            self.check(job).await;
        }
    }

    async fn check(&self, job: ActiveJob) {
        if job.abort_pending {
            self.retry_abort(job.id).await;
        } else if job.state == JobState::Running && self.overdue(&job) {
            self.abort_overdue(job.id).await;
        }

        match self.driver.poll_job_stats(&job.handle).await {
            Ok(stats) => self.observe(job.id, stats).await,
            Err(e) => self.poll_failed(job.id, e).await,
        }
    }

    fn overdue(&self, job: &ActiveJob) -> bool {
        let (Some(timeout), Some(started_at)) = (self.completion_timeout, job.started_at) else {
            return false;
        };
        let elapsed = Utc::now().signed_duration_since(started_at);
        elapsed.to_std().map(|e| e >= timeout).unwrap_or(false)
    }

    async fn retry_abort(&self, id: Uuid) {
        let handle = self.queue.lock().await.claim_pending_abort(&id);
        if let Some(handle) = handle {
            tracing::info!(job_id = %id, "Retrying abort");
            self.runner.send_abort(id, handle).await;
        }
    }

    async fn abort_overdue(&self, id: Uuid) {
        let owed = {
            let mut queue = self.queue.lock().await;
            match queue.get_job(&id).map(|j| j.state) {
                Some(JobState::Running) => queue.begin_abort(&id),
                _ => return,
            }
        };
        match owed {
            Ok(Some(handle)) => {
                tracing::warn!(job_id = %id, "Migration exceeded completion timeout, aborting");
                self.runner.send_abort(id, handle).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Could not abort overdue migration");
            }
        }
    }

    async fn observe(&self, id: Uuid, stats: JobStats) {
        let settled = {
            let mut queue = self.queue.lock().await;
            let state = match queue.get_job(&id) {
                Some(job) if !job.is_terminal() => job.state,
                _ => return,
            };
            queue.record_progress(&id, stats.progress);

            match Self::interpret(state, &stats) {
                Some(outcome) => {
                    JobRunner::settle(&mut queue, id, &outcome).map(|job| (job, outcome))
                }
                None => {
                    tracing::debug!(
                        job_id = %id,
                        state = %state,
                        percent = stats.progress.percent(),
                        "Migration in progress"
                    );
                    None
                }
            }
        };

        if let Some((job, outcome)) = settled {
            self.runner.conclude(&job, &outcome).await;
        }
    }

    /// Map a reported phase onto an outcome for a job in `state`.
    pub fn interpret(state: JobState, stats: &JobStats) -> Option<Outcome> {
        let message = || stats.message.clone();
        match (state, stats.phase) {
            (_, JobPhase::Running) => None,
            (JobState::Running | JobState::Aborting, JobPhase::Completed) => {
                if state == JobState::Aborting {
                    tracing::warn!("Migration completed before abort took effect");
                }
                Some(Outcome::Completed)
            }
            (JobState::Running, JobPhase::Failed) => Some(Outcome::Failed(
                message().unwrap_or_else(|| "migration failed on hypervisor".to_string()),
            )),
            (JobState::Running, JobPhase::Aborted) => Some(Outcome::Failed(
                message().unwrap_or_else(|| "migration aborted by hypervisor".to_string()),
            )),
            (JobState::Aborting, JobPhase::Aborted) => Some(Outcome::Reverted),
            (JobState::Aborting, JobPhase::Failed) => Some(Outcome::Indeterminate(
                message().unwrap_or_else(|| "abort could not be completed".to_string()),
            )),
            _ => None,
        }
    }

    async fn poll_failed(&self, id: Uuid, error: DriverError) {
        let settled = {
            let mut queue = self.queue.lock().await;
            match queue.get_job(&id) {
                Some(job) if !job.is_terminal() => {}
                _ => return,
            }

            let outcome = if error.is_transient() {
                let failures = queue.record_poll_failure(&id);
                if failures < self.max_poll_failures {
                    tracing::warn!(
                        job_id = %id,
                        error = %error,
                        failures,
                        max = self.max_poll_failures,
                        "Failed to poll migration status"
                    );
                    return;
                }
                Outcome::Indeterminate(format!(
                    "lost track of migration after {} failed polls: {}",
                    failures, error
                ))
            } else {
                tracing::error!(job_id = %id, error = %error, "Hypervisor lost the migration");
                Outcome::Indeterminate(format!("lost track of migration: {}", error))
            };
            JobRunner::settle(&mut queue, id, &outcome).map(|job| (job, outcome))
        };

        if let Some((job, outcome)) = settled {
            self.runner.conclude(&job, &outcome).await;
        }
    }
}
