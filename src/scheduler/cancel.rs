use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MigrationError, Result};
use crate::inventory::{InstanceInventory, TaskState};
use crate::scheduler::job::JobState;
use crate::scheduler::SharedQueue;
use crate::worker::runner::JobRunner;

/// Acknowledgement for an accepted cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelAck {
    /// The job was still queued and is now `cancelled`.
    Cancelled,
    /// The job was running; it is now `aborting` and the hypervisor has been
    /// (or will be, once initiation returns) asked to abort.
    AbortRequested,
    /// An abort was already in progress. Nothing was sent.
    AlreadyAborting,
}

/// Entry point for cancel requests.
///
/// The decision between "remove from queue" and "abort the running
/// migration" is taken under the queue lock, the same lock admission uses,
/// so a job is never both cancelled and admitted.
pub struct CancellationController {
    queue: SharedQueue,
    runner: JobRunner,
    inventory: Arc<dyn InstanceInventory>,
    revert_task_state_on_queued_cancel: bool,
}

impl CancellationController {
    pub fn new(
        queue: SharedQueue,
        runner: JobRunner,
        inventory: Arc<dyn InstanceInventory>,
        revert_task_state_on_queued_cancel: bool,
    ) -> Self {
        Self {
            queue,
            runner,
            inventory,
            revert_task_state_on_queued_cancel,
        }
    }

    pub async fn cancel(&self, id: Uuid) -> Result<CancelAck> {
        let mut queue = self.queue.lock().await;
        let state = queue
            .get_job(&id)
            .map(|job| job.state)
            .ok_or(MigrationError::NotFound(id))?;

        match state {
            JobState::Queued => {
                let job = queue.remove_queued(&id)?;
                drop(queue);

                if self.revert_task_state_on_queued_cancel {
                    if let Err(e) = self
                        .inventory
                        .set_task_state(&job.instance_id, TaskState::None)
                        .await
                    {
                        tracing::warn!(job_id = %id, error = %e, "Failed to clear task state");
                    }
                } else {
                    tracing::debug!(
                        job_id = %id,
                        instance_id = %job.instance_id,
                        "Instance task state left as migrating"
                    );
                }
                tracing::info!(job_id = %id, instance_id = %job.instance_id, "Queued migration cancelled");
                Ok(CancelAck::Cancelled)
            }
            JobState::Running => {
                let owed = queue.begin_abort(&id)?;
                drop(queue);

                tracing::info!(job_id = %id, "Cancel requested for running migration");
                if let Some(handle) = owed {
                    self.runner.send_abort(id, handle).await;
                }
                Ok(CancelAck::AbortRequested)
            }
            JobState::Aborting => {
                tracing::debug!(job_id = %id, "Abort already in progress");
                Ok(CancelAck::AlreadyAborting)
            }
            terminal => Err(MigrationError::AlreadyTerminal {
                id,
                state: terminal,
            }),
        }
    }
}
