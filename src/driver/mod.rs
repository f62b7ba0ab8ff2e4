//! Hypervisor driver boundary.
//!
//! The scheduler never performs a migration itself. It asks a
//! [`MigrationDriver`] to start one, polls it for progress and asks it to
//! abort. The driver call that starts a migration must hand back a
//! [`MigrationHandle`] promptly; the transfer itself continues on the
//! hypervisor and is only observed through [`MigrationDriver::poll_job_stats`].
//!
//! [`SimulatedDriver`] is an in-process hypervisor used by the CLI and tests.

pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DriverError;
use crate::scheduler::job::MigrationJob;

pub use simulated::{AbortBehavior, SimulatedDriver};

/// Opaque identifier for a migration running on the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MigrationHandle(String);

impl MigrationHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MigrationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the driver needs to start a migration.
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub job_id: Uuid,
    pub instance_id: Uuid,
    pub source_host: String,
    pub dest_host: String,
}

impl From<&MigrationJob> for MigrationRequest {
    fn from(job: &MigrationJob) -> Self {
        Self {
            job_id: job.id,
            instance_id: job.instance_id,
            source_host: job.source_host.clone(),
            dest_host: job.dest_host.clone(),
        }
    }
}

/// Phase of a migration as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Running,
    Completed,
    Failed,
    Aborted,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Running => write!(f, "running"),
            JobPhase::Completed => write!(f, "completed"),
            JobPhase::Failed => write!(f, "failed"),
            JobPhase::Aborted => write!(f, "aborted"),
        }
    }
}

/// Transfer counters in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub data_total: u64,
    pub data_processed: u64,
    pub data_remaining: u64,
}

impl MigrationProgress {
    pub fn percent(&self) -> u8 {
        if self.data_total == 0 {
            return 0;
        }
        let processed = u128::from(self.data_processed.min(self.data_total));
        (processed * 100 / u128::from(self.data_total)) as u8
    }
}

/// One poll result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStats {
    pub phase: JobPhase,
    pub progress: MigrationProgress,
    /// Reason supplied by the hypervisor for a failed phase.
    pub message: Option<String>,
}

impl JobStats {
    pub fn running(progress: MigrationProgress) -> Self {
        Self {
            phase: JobPhase::Running,
            progress,
            message: None,
        }
    }
}

#[async_trait]
pub trait MigrationDriver: Send + Sync {
    /// Start the migration and return without waiting for it to finish.
    async fn initiate_migration(
        &self,
        request: &MigrationRequest,
    ) -> Result<MigrationHandle, DriverError>;

    /// Ask the hypervisor to unwind an in-flight migration. Completion is
    /// reported later through [`poll_job_stats`](Self::poll_job_stats).
    async fn request_abort(&self, handle: &MigrationHandle) -> Result<(), DriverError>;

    async fn poll_job_stats(&self, handle: &MigrationHandle) -> Result<JobStats, DriverError>;
}
