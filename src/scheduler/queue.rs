use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::driver::{MigrationHandle, MigrationProgress};
use crate::error::{MigrationError, Result};
use crate::scheduler::job::{JobState, MigrationJob};
use crate::scheduler::slots::SlotPool;

const DEFAULT_HISTORY_LIMIT: usize = 10_000;

/// A job plus the bookkeeping the runner and monitor need but callers don't.
#[derive(Debug)]
pub(crate) struct JobRecord {
    pub job: MigrationJob,
    /// An abort signal has been handed to the driver for this job.
    pub abort_sent: bool,
    pub poll_failures: u32,
}

/// A job the monitor should poll on its next tick.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub id: Uuid,
    pub state: JobState,
    pub handle: MigrationHandle,
    pub started_at: Option<DateTime<Utc>>,
    /// Cancel was requested but no abort has reached the driver yet.
    pub abort_pending: bool,
}

/// Pending migrations, the job table and the concurrency slots.
///
/// Everything that decides admission or cancellation lives here so a single
/// lock around the queue covers both.
#[derive(Debug)]
pub struct MigrationQueue {
    jobs: HashMap<Uuid, JobRecord>,
    pending: VecDeque<Uuid>,
    order: Vec<Uuid>,
    slots: SlotPool,
    history_limit: usize,
}

impl Default for MigrationQueue {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MigrationQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self::with_history_limit(max_concurrent, DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(max_concurrent: usize, history_limit: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            pending: VecDeque::new(),
            order: Vec::new(),
            slots: SlotPool::new(max_concurrent),
            history_limit,
        }
    }

    /// Append a queued job at the tail. Rejects a second live job for the
    /// same instance.
    pub fn submit(&mut self, job: MigrationJob) -> Result<Uuid> {
        if job.state != JobState::Queued {
            return Err(MigrationError::InvalidRequest(format!(
                "new migration must be queued, got {}",
                job.state
            )));
        }
        if self.has_active_job(&job.instance_id) {
            return Err(MigrationError::InvalidRequest(format!(
                "instance {} already has a migration in progress",
                job.instance_id
            )));
        }

        let id = job.id;
        self.pending.push_back(id);
        self.order.push(id);
        self.jobs.insert(
            id,
            JobRecord {
                job,
                abort_sent: false,
                poll_failures: 0,
            },
        );
        Ok(id)
    }

    /// Pop the oldest queued job if a slot is free, moving it to `running`.
    pub fn admit_next(&mut self) -> Option<MigrationJob> {
        if self.pending.is_empty() || !self.slots.try_acquire() {
            return None;
        }

        while let Some(id) = self.pending.pop_front() {
            let Some(record) = self.jobs.get_mut(&id) else {
                continue;
            };
            match record.job.transition(JobState::Running) {
                Ok(()) => return Some(record.job.clone()),
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "Skipping non-queued job in pending list");
                }
            }
        }

        self.slots.release();
        None
    }

    /// Take a still-queued job out of the pending list and mark it cancelled.
    /// No slot is involved.
    pub fn remove_queued(&mut self, id: &Uuid) -> Result<MigrationJob> {
        let record = self.jobs.get_mut(id).ok_or(MigrationError::NotFound(*id))?;
        if record.job.state != JobState::Queued {
            return Err(MigrationError::InvalidTransition {
                id: *id,
                from: record.job.state,
                to: JobState::Cancelled,
            });
        }

        record.job.request_cancel();
        record.job.transition(JobState::Cancelled)?;
        let job = record.job.clone();
        self.pending.retain(|pending| pending != id);
        self.prune_history();
        Ok(job)
    }

    /// Move a running job to `aborting`. Returns the handle to abort if the
    /// driver has already handed one out; otherwise the abort is sent when the
    /// handle is attached.
    pub fn begin_abort(&mut self, id: &Uuid) -> Result<Option<MigrationHandle>> {
        let record = self.jobs.get_mut(id).ok_or(MigrationError::NotFound(*id))?;
        record.job.transition(JobState::Aborting)?;
        record.job.request_cancel();
        Ok(Self::claim_abort(record))
    }

    /// Record the driver handle for a running job. Returns the handle back if
    /// a cancel arrived while initiation was in flight.
    pub fn attach_handle(
        &mut self,
        id: &Uuid,
        handle: MigrationHandle,
    ) -> Result<Option<MigrationHandle>> {
        let record = self.jobs.get_mut(id).ok_or(MigrationError::NotFound(*id))?;
        if !record.job.state.holds_slot() {
            return Err(MigrationError::Internal(format!(
                "handle attached to migration {} in state {}",
                id, record.job.state
            )));
        }
        record.job.handle = Some(handle);
        Ok(Self::claim_abort(record))
    }

    /// Mark the pending abort for `id` as sent, if one is owed.
    pub fn claim_pending_abort(&mut self, id: &Uuid) -> Option<MigrationHandle> {
        self.jobs.get_mut(id).and_then(Self::claim_abort)
    }

    /// Forget that an abort was sent so the next monitor tick retries it.
    pub fn abort_not_delivered(&mut self, id: &Uuid) {
        if let Some(record) = self.jobs.get_mut(id) {
            record.abort_sent = false;
        }
    }

    fn claim_abort(record: &mut JobRecord) -> Option<MigrationHandle> {
        if record.job.state != JobState::Aborting || record.abort_sent {
            return None;
        }
        let handle = record.job.handle.clone()?;
        record.abort_sent = true;
        Some(handle)
    }

    /// Apply a terminal transition. The slot is released exactly once, when
    /// the job leaves a slot-holding state.
    pub fn finish(
        &mut self,
        id: &Uuid,
        next: JobState,
        error: Option<String>,
        needs_attention: bool,
    ) -> Result<MigrationJob> {
        if !next.is_terminal() {
            return Err(MigrationError::Internal(format!(
                "finish called with non-terminal state {}",
                next
            )));
        }

        let record = self.jobs.get_mut(id).ok_or(MigrationError::NotFound(*id))?;
        let held_slot = record.job.state.holds_slot();
        record.job.transition(next)?;
        record.job.error = error;
        record.job.needs_attention = needs_attention;
        let job = record.job.clone();

        if held_slot {
            self.slots.release();
        }
        self.pending.retain(|pending| pending != id);
        self.prune_history();
        Ok(job)
    }

    /// Store the latest progress and reset the consecutive failure count.
    pub fn record_progress(&mut self, id: &Uuid, progress: MigrationProgress) {
        if let Some(record) = self.jobs.get_mut(id) {
            record.poll_failures = 0;
            record.job.progress = Some(progress);
        }
    }

    /// Count a failed poll. Returns the consecutive failure count.
    pub fn record_poll_failure(&mut self, id: &Uuid) -> u32 {
        match self.jobs.get_mut(id) {
            Some(record) => {
                record.poll_failures += 1;
                record.poll_failures
            }
            None => 0,
        }
    }

    /// Jobs in `running` or `aborting` that the driver has a handle for.
    pub fn monitored(&self) -> Vec<ActiveJob> {
        self.order
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .filter(|r| r.job.state.holds_slot())
            .filter_map(|r| {
                r.job.handle.clone().map(|handle| ActiveJob {
                    id: r.job.id,
                    state: r.job.state,
                    handle,
                    started_at: r.job.started_at,
                    abort_pending: r.job.state == JobState::Aborting && !r.abort_sent,
                })
            })
            .collect()
    }

    pub fn get_job(&self, id: &Uuid) -> Option<&MigrationJob> {
        self.jobs.get(id).map(|r| &r.job)
    }

    pub(crate) fn record(&self, id: &Uuid) -> Option<&JobRecord> {
        self.jobs.get(id)
    }

    pub fn has_active_job(&self, instance_id: &Uuid) -> bool {
        self.jobs
            .values()
            .any(|r| r.job.instance_id == *instance_id && !r.job.is_terminal())
    }

    /// All jobs in submission order, optionally for one instance.
    pub fn all_jobs(&self, instance_id: Option<&Uuid>) -> Vec<&MigrationJob> {
        self.order
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .map(|r| &r.job)
            .filter(|job| instance_id.map_or(true, |i| job.instance_id == *i))
            .collect()
    }

    /// Drop the oldest terminal jobs beyond the history limit. Returns the
    /// number of jobs removed.
    pub fn prune_history(&mut self) -> usize {
        let finished = self.jobs.values().filter(|r| r.job.is_terminal()).count();
        let mut excess = finished.saturating_sub(self.history_limit);
        if excess == 0 {
            return 0;
        }

        let mut removed = 0;
        let jobs = &mut self.jobs;
        self.order.retain(|id| {
            if excess == 0 {
                return true;
            }
            match jobs.get(id) {
                Some(r) if r.job.is_terminal() => {
                    jobs.remove(id);
                    excess -= 1;
                    removed += 1;
                    false
                }
                _ => true,
            }
        });
        removed
    }

    pub fn queued_len(&self) -> usize {
        self.pending.len()
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots.in_use()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
