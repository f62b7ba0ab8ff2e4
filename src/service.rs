use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::driver::MigrationDriver;
use crate::error::{MigrationError, Result};
use crate::inventory::{InstanceInventory, TaskState};
use crate::scheduler::{
    CancelAck, CancellationController, MigrationJob, MigrationQueue, SharedQueue,
};
use crate::worker::{HypervisorJobMonitor, JobRunner};

/// Point-in-time counts for the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub slots_in_use: usize,
    pub capacity: usize,
    pub tracked: usize,
}

/// Live-migration scheduler wiring the queue, runner, monitor and
/// cancellation controller together.
pub struct MigrationService {
    config: SchedulerConfig,
    queue: SharedQueue,
    inventory: Arc<dyn InstanceInventory>,
    runner: JobRunner,
    canceller: CancellationController,
    monitor: Arc<HypervisorJobMonitor>,
}

impl MigrationService {
    pub fn new(
        config: SchedulerConfig,
        driver: Arc<dyn MigrationDriver>,
        inventory: Arc<dyn InstanceInventory>,
    ) -> Result<Self> {
        config.validate()?;

        let queue: SharedQueue = Arc::new(Mutex::new(MigrationQueue::with_history_limit(
            config.max_concurrent_migrations,
            config.history_limit,
        )));
        let runner = JobRunner::new(queue.clone(), driver.clone(), inventory.clone())
            .with_initiate_timeout(config.initiate_timeout());
        let canceller = CancellationController::new(
            queue.clone(),
            runner.clone(),
            inventory.clone(),
            config.revert_task_state_on_queued_cancel,
        );
        let monitor = Arc::new(HypervisorJobMonitor::new(
            queue.clone(),
            driver,
            runner.clone(),
            &config,
        ));

        Ok(Self {
            config,
            queue,
            inventory,
            runner,
            canceller,
            monitor,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Queue a live migration and admit it straight away if a slot is free.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if the hosts are empty or equal, the instance is
    /// unknown or not on `source_host`, or it still has a migration or task
    /// state from an earlier one.
    pub async fn submit_migration(
        &self,
        instance_id: Uuid,
        source_host: &str,
        dest_host: &str,
    ) -> Result<Uuid> {
        if source_host.is_empty() || dest_host.is_empty() {
            return Err(MigrationError::InvalidRequest(
                "source and destination hosts are required".to_string(),
            ));
        }
        if source_host == dest_host {
            return Err(MigrationError::InvalidRequest(format!(
                "source and destination are both {}",
                source_host
            )));
        }

        let (job_id, admitted) = {
            let mut queue = self.queue.lock().await;

            let instance = self
                .inventory
                .get_instance(&instance_id)
                .await?
                .ok_or_else(|| {
                    MigrationError::InvalidRequest(format!("unknown instance {}", instance_id))
                })?;
            if instance.host != source_host {
                return Err(MigrationError::InvalidRequest(format!(
                    "instance {} is on {}, not {}",
                    instance_id, instance.host, source_host
                )));
            }
            if queue.has_active_job(&instance_id) {
                return Err(MigrationError::InvalidRequest(format!(
                    "instance {} already has a migration in progress",
                    instance_id
                )));
            }
            if instance.task_state != TaskState::None {
                return Err(MigrationError::InvalidRequest(format!(
                    "instance {} is busy with task {}",
                    instance_id, instance.task_state
                )));
            }

            self.inventory
                .set_task_state(&instance_id, TaskState::Migrating)
                .await?;
            let job = MigrationJob::new(instance_id, source_host.to_string(), dest_host.to_string());
            let job_id = queue.submit(job)?;
            tracing::info!(
                job_id = %job_id,
                instance_id = %instance_id,
                source = source_host,
                dest = dest_host,
                "Migration queued"
            );

            (job_id, JobRunner::drain_admissions(&mut queue))
        };

        for job in admitted {
            self.runner.start(job);
        }
        Ok(job_id)
    }

    pub async fn get_migration_status(&self, job_id: Uuid) -> Result<MigrationJob> {
        self.queue
            .lock()
            .await
            .get_job(&job_id)
            .cloned()
            .ok_or(MigrationError::NotFound(job_id))
    }

    /// All known migrations in submission order, optionally for one instance.
    pub async fn list_migrations(&self, instance_id: Option<Uuid>) -> Vec<MigrationJob> {
        self.queue
            .lock()
            .await
            .all_jobs(instance_id.as_ref())
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn cancel_migration(&self, job_id: Uuid) -> Result<CancelAck> {
        self.canceller.cancel(job_id).await
    }

    pub async fn stats(&self) -> SchedulerStats {
        let queue = self.queue.lock().await;
        SchedulerStats {
            queued: queue.queued_len(),
            slots_in_use: queue.slots_in_use(),
            capacity: queue.capacity(),
            tracked: queue.len(),
        }
    }

    /// Start the polling loop. It runs until `shutdown` is cancelled.
    pub fn spawn_monitor(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = self.monitor.clone();
        tokio::spawn(async move {
            monitor.run(shutdown).await;
        })
    }

    /// Run a single monitor pass without waiting for the next tick.
    pub async fn poll_once(&self) {
        self.monitor.poll_once().await;
    }
}
