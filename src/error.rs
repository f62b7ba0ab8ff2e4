use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::job::JobState;

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Invalid migration request: {0}")]
    InvalidRequest(String),

    #[error("Migration not found: {0}")]
    NotFound(Uuid),

    #[error("Migration {id} already finished as {state}")]
    AlreadyTerminal { id: Uuid, state: JobState },

    #[error("Invalid transition for migration {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobState,
        to: JobState,
    },

    #[error("Instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors reported by a hypervisor driver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The hypervisor could not be reached; the call may succeed later.
    #[error("hypervisor unavailable: {0}")]
    Unavailable(String),

    #[error("unknown migration handle: {0}")]
    UnknownHandle(String),

    /// The operation failed and cannot be retried or unwound.
    #[error("fatal driver error: {0}")]
    Fatal(String),
}

impl DriverError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DriverError::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;
