use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::DEFAULT_INITIATE_TIMEOUT_MS;
use crate::driver::{MigrationDriver, MigrationHandle, MigrationRequest};
use crate::error::Result;
use crate::inventory::{InstanceInventory, TaskState};
use crate::scheduler::job::{JobState, MigrationJob};
use crate::scheduler::queue::MigrationQueue;
use crate::scheduler::SharedQueue;

/// How a slot-holding migration ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Instance now lives on the destination.
    Completed,
    /// Migration failed; instance remains on the source.
    Failed(String),
    /// Abort confirmed; instance is back on the source.
    Reverted,
    /// Migration ended but the instance's placement is unknown.
    Indeterminate(String),
}

impl Outcome {
    fn state(&self) -> JobState {
        match self {
            Outcome::Completed => JobState::Completed,
            Outcome::Failed(_) | Outcome::Indeterminate(_) => JobState::Failed,
            Outcome::Reverted => JobState::Reverted,
        }
    }
}

/// Starts admitted migrations on the driver and applies their terminal
/// transitions.
///
/// Every terminal transition releases the job's slot and is followed by an
/// admission attempt, so free capacity never sits idle while jobs are queued.
#[derive(Clone)]
pub struct JobRunner {
    queue: SharedQueue,
    driver: Arc<dyn MigrationDriver>,
    inventory: Arc<dyn InstanceInventory>,
    initiate_timeout: Duration,
}

impl JobRunner {
    pub fn new(
        queue: SharedQueue,
        driver: Arc<dyn MigrationDriver>,
        inventory: Arc<dyn InstanceInventory>,
    ) -> Self {
        Self {
            queue,
            driver,
            inventory,
            initiate_timeout: Duration::from_millis(DEFAULT_INITIATE_TIMEOUT_MS),
        }
    }

    /// Bound on how long the driver may take to hand back a migration handle.
    pub fn with_initiate_timeout(mut self, timeout: Duration) -> Self {
        self.initiate_timeout = timeout;
        self
    }

    /// Pop every queued job that fits in a free slot. Must be called with the
    /// queue lock held; the caller starts the returned jobs once it is
    /// released.
    pub fn drain_admissions(queue: &mut MigrationQueue) -> Vec<MigrationJob> {
        let mut admitted = Vec::new();
        while let Some(job) = queue.admit_next() {
            tracing::info!(
                job_id = %job.id,
                instance_id = %job.instance_id,
                slots_in_use = queue.slots_in_use(),
                "Migration admitted"
            );
            admitted.push(job);
        }
        admitted
    }

    /// Admit and start as many queued jobs as there are free slots.
    pub async fn admit_pending(&self) -> Vec<Uuid> {
        let admitted = {
            let mut queue = self.queue.lock().await;
            Self::drain_admissions(&mut queue)
        };
        admitted
            .into_iter()
            .map(|job| {
                let id = job.id;
                self.start(job);
                id
            })
            .collect()
    }

    /// Hand an admitted job to the driver on a separate task.
    pub fn start(&self, job: MigrationJob) -> JoinHandle<()> {
        let runner = self.clone();
        tokio::spawn(async move { runner.initiate(job).await })
    }

    async fn initiate(self, job: MigrationJob) {
        let request = MigrationRequest::from(&job);
        tracing::info!(
            job_id = %job.id,
            instance_id = %job.instance_id,
            source = %job.source_host,
            dest = %job.dest_host,
            "Starting live migration"
        );

        let initiated =
            tokio::time::timeout(self.initiate_timeout, self.driver.initiate_migration(&request))
                .await;
        let handle = match initiated {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                tracing::error!(job_id = %job.id, error = %e, "Migration failed to start");
                self.finish(job.id, Outcome::Failed(format!("failed to start: {}", e)))
                    .await;
                return;
            }
            Err(_) => {
                // The hypervisor may or may not have started copying.
                let reason = format!(
                    "hypervisor did not acknowledge the migration within {}ms",
                    self.initiate_timeout.as_millis()
                );
                tracing::error!(job_id = %job.id, "Migration initiation timed out");
                self.finish(job.id, Outcome::Indeterminate(reason)).await;
                return;
            }
        };

        let owed_abort = {
            let mut queue = self.queue.lock().await;
            queue.attach_handle(&job.id, handle.clone())
        };
        match owed_abort {
            Ok(Some(handle)) => {
                tracing::info!(job_id = %job.id, "Cancel arrived during initiation, aborting");
                self.send_abort(job.id, handle).await;
            }
            Ok(None) => {
                tracing::debug!(job_id = %job.id, handle = %handle, "Migration handed to hypervisor");
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, handle = %handle, error = %e, "Could not attach migration handle");
            }
        }
    }

    /// Deliver an abort to the driver. A transient failure leaves the abort
    /// owed so the monitor retries it; any other failure means the migration
    /// can't be unwound.
    pub async fn send_abort(&self, id: Uuid, handle: MigrationHandle) {
        match self.driver.request_abort(&handle).await {
            Ok(()) => {
                tracing::info!(job_id = %id, handle = %handle, "Abort requested");
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(job_id = %id, error = %e, "Abort not delivered, will retry");
                self.queue.lock().await.abort_not_delivered(&id);
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Abort rejected by hypervisor");
                self.finish(id, Outcome::Indeterminate(format!("abort failed: {}", e)))
                    .await;
            }
        }
    }

    /// Apply a terminal outcome, update the instance and admit the next
    /// queued job.
    pub async fn finish(&self, id: Uuid, outcome: Outcome) -> Option<MigrationJob> {
        let job = {
            let mut queue = self.queue.lock().await;
            Self::settle(&mut queue, id, &outcome)
        }?;
        self.conclude(&job, &outcome).await;
        Some(job)
    }

    /// Move the job to its terminal state and free its slot. Runs under the
    /// queue lock; returns `None` if the job had already finished. A `Some`
    /// must be followed by [`conclude`](Self::conclude) once the lock is
    /// released.
    pub fn settle(queue: &mut MigrationQueue, id: Uuid, outcome: &Outcome) -> Option<MigrationJob> {
        let (error, needs_attention) = match outcome {
            Outcome::Completed | Outcome::Reverted => (None, false),
            Outcome::Failed(reason) => (Some(reason.clone()), false),
            Outcome::Indeterminate(reason) => (Some(reason.clone()), true),
        };

        match queue.finish(&id, outcome.state(), error, needs_attention) {
            Ok(job) => Some(job),
            Err(e) => {
                tracing::debug!(job_id = %id, error = %e, "Ignoring outcome for finished migration");
                None
            }
        }
    }

    /// Bring the instance record in line with a settled job, then admit the
    /// next queued job. Must be called without the queue lock held.
    pub async fn conclude(&self, job: &MigrationJob, outcome: &Outcome) {
        let inventory_result = match outcome {
            Outcome::Completed => self.release_instance(job, Some(&job.dest_host)).await,
            Outcome::Failed(_) | Outcome::Reverted => self.release_instance(job, None).await,
            Outcome::Indeterminate(_) => Ok(()),
        };
        if let Err(e) = inventory_result {
            tracing::warn!(
                job_id = %job.id,
                instance_id = %job.instance_id,
                error = %e,
                "Failed to update instance after migration"
            );
        }

        if job.needs_attention {
            tracing::error!(
                job_id = %job.id,
                instance_id = %job.instance_id,
                error = ?job.error,
                "Migration failed with instance in unknown state, operator attention required"
            );
        } else {
            tracing::info!(
                job_id = %job.id,
                instance_id = %job.instance_id,
                state = %job.state,
                error = ?job.error,
                "Migration finished"
            );
        }

        self.admit_pending().await;
    }

    /// Clear the instance's task state, moving it to `new_host` first if the
    /// migration landed.
    async fn release_instance(&self, job: &MigrationJob, new_host: Option<&str>) -> Result<()> {
        if let Some(host) = new_host {
            self.inventory.set_host(&job.instance_id, host).await?;
        }
        self.inventory
            .set_task_state(&job.instance_id, TaskState::None)
            .await
    }
}
