use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::driver::{MigrationHandle, MigrationProgress};
use crate::error::{MigrationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Aborting,
    Completed,
    Failed,
    Cancelled,
    Reverted,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::Reverted
        )
    }

    /// States in which the job owns a concurrency slot.
    pub fn holds_slot(self) -> bool {
        matches!(self, JobState::Running | JobState::Aborting)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Aborting)
                | (Aborting, Reverted)
                | (Aborting, Failed)
                | (Aborting, Completed)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Aborting => write!(f, "aborting"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
            JobState::Reverted => write!(f, "reverted"),
        }
    }
}

/// One live-migration attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub source_host: String,
    pub dest_host: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    /// Cause of a `failed` outcome.
    pub error: Option<String>,
    /// Set when the instance's placement could not be determined after the
    /// job ended. The instance keeps its task state until an operator acts.
    pub needs_attention: bool,
    pub progress: Option<MigrationProgress>,
    pub handle: Option<MigrationHandle>,
}

impl MigrationJob {
    pub fn new(instance_id: Uuid, source_host: String, dest_host: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            source_host,
            dest_host,
            state: JobState::Queued,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            cancel_requested: false,
            error: None,
            needs_attention: false,
            progress: None,
            handle: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move the job to `next`, stamping `started_at` on admission and
    /// `ended_at` on any terminal state.
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(MigrationError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: next,
            });
        }

        let now = Utc::now();
        if next == JobState::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        self.state = next;
        Ok(())
    }

    /// Latch the cancel request. Returns false if it was already set.
    pub fn request_cancel(&mut self) -> bool {
        if self.cancel_requested {
            return false;
        }
        self.cancel_requested = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> MigrationJob {
        MigrationJob::new(Uuid::new_v4(), "src".to_string(), "dest".to_string())
    }

    #[test]
    fn new_job_is_queued() {
        let job = job();
        assert_eq!(job.state, JobState::Queued);
        assert!(job.started_at.is_none());
        assert!(job.ended_at.is_none());
        assert!(!job.cancel_requested);
    }

    #[test]
    fn admission_stamps_started_at() {
        let mut job = job();
        job.transition(JobState::Running).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert!(job.started_at.is_some());
        assert!(job.ended_at.is_none());
    }

    #[test]
    fn terminal_transition_stamps_ended_at() {
        let mut job = job();
        job.transition(JobState::Running).unwrap();
        job.transition(JobState::Aborting).unwrap();
        job.transition(JobState::Reverted).unwrap();
        assert!(job.is_terminal());
        assert!(job.ended_at.is_some());
    }

    #[test]
    fn queued_job_cannot_complete() {
        let mut job = job();
        let err = job.transition(JobState::Completed).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::InvalidTransition {
                from: JobState::Queued,
                to: JobState::Completed,
                ..
            }
        ));
        assert_eq!(job.state, JobState::Queued);
    }

    #[test]
    fn terminal_states_accept_nothing() {
        let all = [
            JobState::Queued,
            JobState::Running,
            JobState::Aborting,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
            JobState::Reverted,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn running_cannot_be_cancelled_directly() {
        assert!(!JobState::Running.can_transition_to(JobState::Cancelled));
        assert!(!JobState::Running.can_transition_to(JobState::Reverted));
        assert!(!JobState::Aborting.can_transition_to(JobState::Running));
    }

    #[test]
    fn cancel_latch_is_set_once() {
        let mut job = job();
        assert!(job.request_cancel());
        assert!(!job.request_cancel());
        assert!(job.cancel_requested);
    }

    #[test]
    fn state_serializes_lowercase() {
        let json = serde_json::to_string(&JobState::Aborting).unwrap();
        assert_eq!(json, "\"aborting\"");
    }
}
