use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {event} job from state {from}")]
pub struct JobTransitionError {
    pub event: JobEvent,
    pub from: JobState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Initializing,
    Ready,
    Running,
    Paused,
    Canceled,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobEvent {
    InitializationDone,
    Start,
    Pause,
    Resume,
    Cancel,
    CompleteJob,
}

/// Result of applying an event that is permitted from the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTransition {
    Changed(JobState),
    /// Idempotent event fired from the state it would produce.
    Unchanged,
}

impl JobState {
    /// States a job can be canceled from.
    pub const PROCESSING: &'static [JobState] = &[JobState::Running, JobState::Paused];

    pub fn is_processing(self) -> bool {
        Self::PROCESSING.contains(&self)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Complete | JobState::Canceled)
    }

    /// State a job takes when reloaded after a restart. Only finished states
    /// survive; a job cannot pick up motion it lost with the process.
    pub fn restored(prior: JobState) -> JobState {
        match prior {
            JobState::Complete | JobState::Canceled => prior,
            _ => JobState::Canceled,
        }
    }

    pub fn apply(self, event: JobEvent) -> Result<JobTransition, JobTransitionError> {
        use JobEvent as E;
        use JobState as S;
        let next = match (self, event) {
            (S::Initializing, E::InitializationDone) => S::Ready,
            (S::Ready, E::Start) => S::Running,
            (S::Running, E::Pause) => S::Paused,
            (S::Paused, E::Pause) => return Ok(JobTransition::Unchanged),
            (S::Paused, E::Resume) => S::Running,
            (S::Running, E::Resume) => return Ok(JobTransition::Unchanged),
            (s, E::Cancel) if s.is_processing() => S::Canceled,
            (S::Running, E::CompleteJob) => S::Complete,
            (from, event) => return Err(JobTransitionError { event, from }),
        };
        Ok(JobTransition::Changed(next))
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Initializing => "initializing",
            JobState::Ready => "ready",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Canceled => "canceled",
            JobState::Complete => "complete",
        };
        f.write_str(name)
    }
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobEvent::InitializationDone => "initializationDone",
            JobEvent::Start => "start",
            JobEvent::Pause => "pause",
            JobEvent::Resume => "resume",
            JobEvent::Cancel => "cancel",
            JobEvent::CompleteJob => "completeJob",
        };
        f.write_str(name)
    }
}

/// Persisted and broadcast view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub device_id: String,
    pub state: JobState,
    pub file: String,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
    pub percent_complete: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_and_resume_are_idempotent() {
        assert_eq!(JobState::Paused.apply(JobEvent::Pause), Ok(JobTransition::Unchanged));
        assert_eq!(JobState::Running.apply(JobEvent::Resume), Ok(JobTransition::Unchanged));
        assert_eq!(
            JobState::Running.apply(JobEvent::Pause),
            Ok(JobTransition::Changed(JobState::Paused))
        );
    }

    #[test]
    fn cancel_only_from_processing_states() {
        for state in [JobState::Running, JobState::Paused] {
            assert_eq!(state.apply(JobEvent::Cancel), Ok(JobTransition::Changed(JobState::Canceled)));
        }
        let err = JobState::Complete.apply(JobEvent::Cancel).unwrap_err();
        assert_eq!(err.to_string(), "cannot cancel job from state complete");
    }

    #[test]
    fn restore_forces_unfinished_jobs_to_canceled() {
        assert_eq!(JobState::restored(JobState::Complete), JobState::Complete);
        assert_eq!(JobState::restored(JobState::Canceled), JobState::Canceled);
        assert_eq!(JobState::restored(JobState::Running), JobState::Canceled);
        assert_eq!(JobState::restored(JobState::Ready), JobState::Canceled);
    }
}
