use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::driver::{
    JobPhase, JobStats, MigrationDriver, MigrationHandle, MigrationProgress, MigrationRequest,
};
use crate::error::DriverError;

const SIMULATED_GUEST_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// How the simulated hypervisor reacts to an abort request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortBehavior {
    /// The migration unwinds and reports `aborted` on the next poll.
    Honor,
    /// The abort call succeeds but the unwind fails; the next poll reports
    /// `failed`.
    FailUnwind,
    /// The abort call itself is rejected with a fatal error.
    Reject,
    /// The abort is accepted and then ignored.
    Ignore,
}

#[derive(Debug)]
struct SimMigration {
    request: MigrationRequest,
    phase: JobPhase,
    polls: u32,
    complete_after: u32,
    abort_requested: bool,
    message: Option<String>,
}

impl SimMigration {
    fn progress(&self) -> MigrationProgress {
        let processed = if self.phase == JobPhase::Completed {
            SIMULATED_GUEST_BYTES
        } else {
            SIMULATED_GUEST_BYTES / u64::from(self.complete_after.max(1))
                * u64::from(self.polls.min(self.complete_after))
        };
        MigrationProgress {
            data_total: SIMULATED_GUEST_BYTES,
            data_processed: processed,
            data_remaining: SIMULATED_GUEST_BYTES - processed,
        }
    }
}

#[derive(Debug)]
struct SimState {
    migrations: HashMap<MigrationHandle, SimMigration>,
    by_job: HashMap<Uuid, MigrationHandle>,
    held: bool,
    min_polls: u32,
    max_polls: u32,
    unavailable_polls: u32,
    unavailable_aborts: u32,
    abort_behavior: AbortBehavior,
    initiate_failure: Option<String>,
    stall_initiate: bool,
    abort_calls: usize,
    next_id: u64,
}

/// In-process hypervisor that migrates nothing but reports like a real one.
///
/// Migrations complete after a number of polls unless the driver is held,
/// in which case they stay `running` until released. Tests use the control
/// methods to force outcomes and inject faults.
#[derive(Debug, Clone)]
pub struct SimulatedDriver {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDriver {
    /// Migrations complete on their first poll.
    pub fn new() -> Self {
        Self::with_completion_polls(1, 1)
    }

    /// Each migration completes after a random number of polls in
    /// `min..=max`.
    pub fn with_completion_polls(min: u32, max: u32) -> Self {
        let min = min.max(1);
        Self {
            state: Arc::new(Mutex::new(SimState {
                migrations: HashMap::new(),
                by_job: HashMap::new(),
                held: false,
                min_polls: min,
                max_polls: max.max(min),
                unavailable_polls: 0,
                unavailable_aborts: 0,
                abort_behavior: AbortBehavior::Honor,
                initiate_failure: None,
                stall_initiate: false,
                abort_calls: 0,
                next_id: 1,
            })),
        }
    }

    /// Keep every migration in `running` until [`release`](Self::release).
    pub async fn hold(&self) {
        self.state.lock().await.held = true;
    }

    pub async fn release(&self) {
        self.state.lock().await.held = false;
    }

    pub async fn set_abort_behavior(&self, behavior: AbortBehavior) {
        self.state.lock().await.abort_behavior = behavior;
    }

    /// Fail the next `polls` calls to `poll_job_stats` as unreachable.
    pub async fn set_unavailable_for(&self, polls: u32) {
        self.state.lock().await.unavailable_polls = polls;
    }

    /// Fail the next `aborts` calls to `request_abort` as unreachable.
    pub async fn set_abort_unavailable_for(&self, aborts: u32) {
        self.state.lock().await.unavailable_aborts = aborts;
    }

    /// Reject the next initiation with a fatal error.
    pub async fn fail_next_initiate(&self, reason: impl Into<String>) {
        self.state.lock().await.initiate_failure = Some(reason.into());
    }

    /// Make the next initiation hang without ever returning a handle.
    pub async fn stall_next_initiate(&self) {
        self.state.lock().await.stall_initiate = true;
    }

    /// Force the migration for `job_id` to report success.
    pub async fn complete(&self, job_id: Uuid) -> bool {
        self.force_phase(job_id, JobPhase::Completed, None).await
    }

    /// Force the migration for `job_id` to report failure.
    pub async fn fail(&self, job_id: Uuid, reason: impl Into<String>) -> bool {
        self.force_phase(job_id, JobPhase::Failed, Some(reason.into()))
            .await
    }

    /// Drop the migration for `job_id` as if the hypervisor lost the domain.
    /// Later calls with its handle fail with `UnknownHandle`.
    pub async fn forget(&self, job_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        match state.by_job.get(&job_id).cloned() {
            Some(handle) => state.migrations.remove(&handle).is_some(),
            None => false,
        }
    }

    async fn force_phase(&self, job_id: Uuid, phase: JobPhase, message: Option<String>) -> bool {
        let mut state = self.state.lock().await;
        let Some(handle) = state.by_job.get(&job_id).cloned() else {
            return false;
        };
        match state.migrations.get_mut(&handle) {
            Some(m) => {
                m.phase = phase;
                m.message = message;
                true
            }
            None => false,
        }
    }

    /// Number of abort requests received, including rejected ones.
    pub async fn abort_requests(&self) -> usize {
        self.state.lock().await.abort_calls
    }

    /// Number of migrations ever started on this driver.
    pub async fn initiated(&self) -> usize {
        self.state.lock().await.by_job.len()
    }

    pub async fn was_initiated(&self, job_id: Uuid) -> bool {
        self.state.lock().await.by_job.contains_key(&job_id)
    }
}

#[async_trait]
impl MigrationDriver for SimulatedDriver {
    async fn initiate_migration(
        &self,
        request: &MigrationRequest,
    ) -> Result<MigrationHandle, DriverError> {
        let mut state = self.state.lock().await;
        if std::mem::take(&mut state.stall_initiate) {
            drop(state);
            tracing::debug!(job_id = %request.job_id, "Simulated initiation stalled");
            return std::future::pending().await;
        }
        if let Some(reason) = state.initiate_failure.take() {
            return Err(DriverError::Fatal(reason));
        }

        let handle = MigrationHandle::new(format!("sim-{}", state.next_id));
        state.next_id += 1;

        let complete_after = if state.min_polls == state.max_polls {
            state.min_polls
        } else {
            rand::thread_rng().gen_range(state.min_polls..=state.max_polls)
        };

        tracing::debug!(
            job_id = %request.job_id,
            handle = %handle,
            source = %request.source_host,
            dest = %request.dest_host,
            complete_after,
            "Simulated migration started"
        );

        state.by_job.insert(request.job_id, handle.clone());
        state.migrations.insert(
            handle.clone(),
            SimMigration {
                request: request.clone(),
                phase: JobPhase::Running,
                polls: 0,
                complete_after,
                abort_requested: false,
                message: None,
            },
        );
        Ok(handle)
    }

    async fn request_abort(&self, handle: &MigrationHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;
        state.abort_calls += 1;
        if state.unavailable_aborts > 0 {
            state.unavailable_aborts -= 1;
            return Err(DriverError::Unavailable(
                "simulated hypervisor connection lost".to_string(),
            ));
        }
        let behavior = state.abort_behavior;
        let migration = state
            .migrations
            .get_mut(handle)
            .ok_or_else(|| DriverError::UnknownHandle(handle.to_string()))?;

        if behavior == AbortBehavior::Reject {
            return Err(DriverError::Fatal(format!(
                "migration {} cannot be aborted",
                migration.request.job_id
            )));
        }
        migration.abort_requested = true;
        Ok(())
    }

    async fn poll_job_stats(&self, handle: &MigrationHandle) -> Result<JobStats, DriverError> {
        let mut state = self.state.lock().await;
        if state.unavailable_polls > 0 {
            state.unavailable_polls -= 1;
            return Err(DriverError::Unavailable(
                "simulated hypervisor connection lost".to_string(),
            ));
        }

        let held = state.held;
        let behavior = state.abort_behavior;
        let migration = state
            .migrations
            .get_mut(handle)
            .ok_or_else(|| DriverError::UnknownHandle(handle.to_string()))?;

        if migration.phase == JobPhase::Running {
            if migration.abort_requested && behavior == AbortBehavior::Honor {
                migration.phase = JobPhase::Aborted;
            } else if migration.abort_requested && behavior == AbortBehavior::FailUnwind {
                migration.phase = JobPhase::Failed;
                migration.message = Some("abort unwind failed".to_string());
            } else if !held {
                migration.polls += 1;
                if migration.polls >= migration.complete_after {
                    migration.phase = JobPhase::Completed;
                }
            }
        }

        Ok(JobStats {
            phase: migration.phase,
            progress: migration.progress(),
            message: migration.message.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> MigrationRequest {
        MigrationRequest {
            job_id: Uuid::new_v4(),
            instance_id: Uuid::new_v4(),
            source_host: "src".to_string(),
            dest_host: "dest".to_string(),
        }
    }

    #[tokio::test]
    async fn completes_after_configured_polls() {
        let driver = SimulatedDriver::with_completion_polls(3, 3);
        let handle = driver.initiate_migration(&request()).await.unwrap();

        let first = driver.poll_job_stats(&handle).await.unwrap();
        assert_eq!(first.phase, JobPhase::Running);
        assert!(first.progress.data_processed > 0);
        driver.poll_job_stats(&handle).await.unwrap();
        let last = driver.poll_job_stats(&handle).await.unwrap();
        assert_eq!(last.phase, JobPhase::Completed);
        assert_eq!(last.progress.data_remaining, 0);
    }

    #[tokio::test]
    async fn hold_keeps_migration_running() {
        let driver = SimulatedDriver::new();
        driver.hold().await;
        let handle = driver.initiate_migration(&request()).await.unwrap();
        for _ in 0..5 {
            let stats = driver.poll_job_stats(&handle).await.unwrap();
            assert_eq!(stats.phase, JobPhase::Running);
        }
        driver.release().await;
        let stats = driver.poll_job_stats(&handle).await.unwrap();
        assert_eq!(stats.phase, JobPhase::Completed);
    }

    #[tokio::test]
    async fn honored_abort_reports_aborted() {
        let driver = SimulatedDriver::new();
        driver.hold().await;
        let handle = driver.initiate_migration(&request()).await.unwrap();
        driver.request_abort(&handle).await.unwrap();
        let stats = driver.poll_job_stats(&handle).await.unwrap();
        assert_eq!(stats.phase, JobPhase::Aborted);
        assert_eq!(driver.abort_requests().await, 1);
    }

    #[tokio::test]
    async fn rejected_abort_is_fatal() {
        let driver = SimulatedDriver::new();
        driver.set_abort_behavior(AbortBehavior::Reject).await;
        let handle = driver.initiate_migration(&request()).await.unwrap();
        let err = driver.request_abort(&handle).await.unwrap_err();
        assert!(matches!(err, DriverError::Fatal(_)));
    }

    #[tokio::test]
    async fn unavailable_polls_then_recovers() {
        let driver = SimulatedDriver::new();
        let handle = driver.initiate_migration(&request()).await.unwrap();
        driver.set_unavailable_for(2).await;
        assert!(driver.poll_job_stats(&handle).await.unwrap_err().is_transient());
        assert!(driver.poll_job_stats(&handle).await.unwrap_err().is_transient());
        assert!(driver.poll_job_stats(&handle).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_handle_is_reported() {
        let driver = SimulatedDriver::new();
        let err = driver
            .poll_job_stats(&MigrationHandle::new("missing"))
            .await
            .unwrap_err();
        assert_eq!(err, DriverError::UnknownHandle("missing".to_string()));
    }

    #[tokio::test]
    async fn initiate_failure_is_one_shot() {
        let driver = SimulatedDriver::new();
        driver.fail_next_initiate("no route to dest").await;
        assert!(driver.initiate_migration(&request()).await.is_err());
        assert!(driver.initiate_migration(&request()).await.is_ok());
        assert_eq!(driver.initiated().await, 1);
    }

    #[tokio::test]
    async fn stalled_initiate_never_returns() {
        let driver = SimulatedDriver::new();
        driver.stall_next_initiate().await;
        let stalled = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            driver.initiate_migration(&request()),
        )
        .await;
        assert!(stalled.is_err());
        // One-shot, and the state lock was not held while stalled
        assert!(driver.initiate_migration(&request()).await.is_ok());
    }
}
