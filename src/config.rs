use std::time::Duration;

use crate::error::{MigrationError, Result};

pub const DEFAULT_INITIATE_TIMEOUT_MS: u64 = 60_000;

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of migrations allowed to execute at once. A value of 1
    /// serializes all migrations.
    pub max_concurrent_migrations: usize,

    /// Interval between monitor polls of the hypervisor.
    pub poll_interval_ms: u64,

    /// Consecutive failed polls after which a migration is declared failed.
    pub max_poll_failures: u32,

    /// How long the hypervisor may take to acknowledge a new migration.
    /// A migration that isn't acknowledged in time is failed and flagged.
    pub initiate_timeout_ms: u64,

    /// Abort migrations that have been running longer than this.
    /// `None` lets them run indefinitely.
    pub completion_timeout_ms: Option<u64>,

    /// Clear the instance's `migrating` task state when a still-queued
    /// migration is cancelled. Off by default: the instance keeps the task
    /// state until an external reconciliation clears it.
    pub revert_task_state_on_queued_cancel: bool,

    /// Finished migrations retained for status queries.
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_migrations: 1,
            poll_interval_ms: 500,
            max_poll_failures: 5,
            initiate_timeout_ms: DEFAULT_INITIATE_TIMEOUT_MS,
            completion_timeout_ms: None,
            revert_task_state_on_queued_cancel: false,
            history_limit: 10_000,
        }
    }
}

impl SchedulerConfig {
    pub fn new(max_concurrent_migrations: usize) -> Self {
        Self {
            max_concurrent_migrations,
            ..Default::default()
        }
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_max_poll_failures(mut self, failures: u32) -> Self {
        self.max_poll_failures = failures;
        self
    }

    pub fn with_initiate_timeout_ms(mut self, ms: u64) -> Self {
        self.initiate_timeout_ms = ms;
        self
    }

    pub fn with_completion_timeout_ms(mut self, ms: u64) -> Self {
        self.completion_timeout_ms = Some(ms);
        self
    }

    pub fn with_revert_on_queued_cancel(mut self, revert: bool) -> Self {
        self.revert_task_state_on_queued_cancel = revert;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn initiate_timeout(&self) -> Duration {
        Duration::from_millis(self.initiate_timeout_ms)
    }

    pub fn completion_timeout(&self) -> Option<Duration> {
        self.completion_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_migrations == 0 {
            return Err(MigrationError::Config(
                "max_concurrent_migrations must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(MigrationError::Config(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.max_poll_failures == 0 {
            return Err(MigrationError::Config(
                "max_poll_failures must be at least 1".to_string(),
            ));
        }
        if self.initiate_timeout_ms == 0 {
            return Err(MigrationError::Config(
                "initiate_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
