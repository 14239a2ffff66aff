//! Job lifecycle graph and batch status aggregation.

use crate::model::BatchPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an activation job.
///
/// ```text
/// Received -> Validated -> Authorized -> Queued -> Dispatching -> Applied -> Verified -> Completed
///                          Authorized -> Completed                      (no-op)
/// Queued | Dispatching | Applied -> Failed
/// Failed -> Retrying -> Queued
/// Failed | Retrying -> RollingBack -> RolledBack | RequiresManualIntervention
/// Received | Validated | Authorized | Queued -> Aborted
/// ```
///
/// `Failed` is terminal when it rests there. A single report may carry a
/// job through `Failed` into `Retrying` or `RollingBack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Received,
    Validated,
    Authorized,
    Queued,
    Dispatching,
    Applied,
    Verified,
    Completed,
    Failed,
    Retrying,
    RollingBack,
    RolledBack,
    RequiresManualIntervention,
    Aborted,
}

impl JobState {
    pub const ALL: [JobState; 14] = [
        JobState::Received,
        JobState::Validated,
        JobState::Authorized,
        JobState::Queued,
        JobState::Dispatching,
        JobState::Applied,
        JobState::Verified,
        JobState::Completed,
        JobState::Failed,
        JobState::Retrying,
        JobState::RollingBack,
        JobState::RolledBack,
        JobState::RequiresManualIntervention,
        JobState::Aborted,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            JobState::Received => "received",
            JobState::Validated => "validated",
            JobState::Authorized => "authorized",
            JobState::Queued => "queued",
            JobState::Dispatching => "dispatching",
            JobState::Applied => "applied",
            JobState::Verified => "verified",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Retrying => "retrying",
            JobState::RollingBack => "rolling_back",
            JobState::RolledBack => "rolled_back",
            JobState::RequiresManualIntervention => "requires_manual_intervention",
            JobState::Aborted => "aborted",
        }
    }

    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, target),
            (Received, Validated)
                | (Validated, Authorized)
                | (Authorized, Queued)
                | (Authorized, Completed)
                | (Queued, Dispatching)
                | (Dispatching, Applied)
                | (Applied, Verified)
                | (Verified, Completed)
                | (Queued | Dispatching | Applied, Failed)
                | (Failed, Retrying)
                | (Retrying, Queued)
                | (Failed | Retrying, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBack, RequiresManualIntervention)
                | (Received | Validated | Authorized | Queued, Aborted)
        )
    }

    /// States a job may rest in forever.
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed
                | JobState::Failed
                | JobState::RolledBack
                | JobState::RequiresManualIntervention
                | JobState::Aborted
        )
    }

    /// Terminal states where the intent did not take effect.
    pub const fn is_failure(&self) -> bool {
        matches!(
            self,
            JobState::Failed | JobState::RolledBack | JobState::RequiresManualIntervention
        )
    }

    /// States before the first driver call.
    pub const fn is_pre_dispatch(&self) -> bool {
        matches!(
            self,
            JobState::Received | JobState::Validated | JobState::Authorized | JobState::Queued
        )
    }

    /// States a runner is actively working through.
    pub const fn is_in_flight(&self) -> bool {
        matches!(
            self,
            JobState::Dispatching
                | JobState::Applied
                | JobState::Verified
                | JobState::Retrying
                | JobState::RollingBack
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate status of a batch, derived from its jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    InProgress,
    Completed,
    PartialSuccess,
    Failed,
    Cancelled,
}

impl BatchStatus {
    /// Returns true once no job of the batch will change again.
    pub const fn is_final(&self) -> bool {
        !matches!(self, BatchStatus::Pending | BatchStatus::InProgress)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::Pending => "pending",
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Completed => "completed",
            BatchStatus::PartialSuccess => "partial_success",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Derives a batch status from its jobs' states.
///
/// Under fail-fast the batch is `Failed` as soon as any job fails, even
/// while others are still running.
pub fn aggregate(policy: BatchPolicy, states: &[JobState]) -> BatchStatus {
    let any_failed = states.iter().any(JobState::is_failure);
    if policy == BatchPolicy::FailFast && any_failed {
        return BatchStatus::Failed;
    }
    if !states.iter().all(JobState::is_terminal) {
        return if states.iter().all(JobState::is_pre_dispatch) {
            BatchStatus::Pending
        } else {
            BatchStatus::InProgress
        };
    }

    let completed = states.iter().filter(|s| **s == JobState::Completed).count();
    let aborted = states.iter().filter(|s| **s == JobState::Aborted).count();
    if completed == states.len() {
        BatchStatus::Completed
    } else if !any_failed && aborted > 0 {
        BatchStatus::Cancelled
    } else if completed == 0 {
        BatchStatus::Failed
    } else {
        BatchStatus::PartialSuccess
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use JobState::*;

    #[test]
    fn test_happy_path_edges() {
        let path = [Received, Validated, Authorized, Queued, Dispatching, Applied, Verified, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_no_skipping() {
        assert!(!Queued.can_transition_to(Applied));
        assert!(!Dispatching.can_transition_to(Completed));
        assert!(!Received.can_transition_to(Queued));
        assert!(!Applied.can_transition_to(Completed));
    }

    #[test]
    fn test_terminal_states_are_closed() {
        for from in [Completed, RolledBack, RequiresManualIntervention, Aborted] {
            for to in JobState::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_failed_continues_only_to_retry_or_rollback() {
        let next: Vec<_> = JobState::ALL
            .into_iter()
            .filter(|s| Failed.can_transition_to(*s))
            .collect();
        assert_eq!(next, vec![Retrying, RollingBack]);
    }

    #[test]
    fn test_dispatched_jobs_cannot_abort() {
        for from in [Dispatching, Applied, Verified, Retrying, RollingBack] {
            assert!(!from.can_transition_to(Aborted));
        }
    }

    #[test]
    fn test_aggregate() {
        let bp = BatchPolicy::BestEffort;
        assert_eq!(aggregate(bp, &[Queued, Queued]), BatchStatus::Pending);
        assert_eq!(aggregate(bp, &[Completed, Dispatching]), BatchStatus::InProgress);
        assert_eq!(aggregate(bp, &[Completed, Completed]), BatchStatus::Completed);
        assert_eq!(aggregate(bp, &[Completed, Failed]), BatchStatus::PartialSuccess);
        assert_eq!(aggregate(bp, &[Completed, RolledBack]), BatchStatus::PartialSuccess);
        assert_eq!(aggregate(bp, &[Failed, RolledBack]), BatchStatus::Failed);
        assert_eq!(aggregate(bp, &[Completed, Aborted]), BatchStatus::Cancelled);
        assert_eq!(aggregate(bp, &[Failed, Queued]), BatchStatus::InProgress);
        assert_eq!(aggregate(bp, &[]), BatchStatus::Completed);
    }

    #[test]
    fn test_aggregate_fail_fast() {
        let ff = BatchPolicy::FailFast;
        assert_eq!(aggregate(ff, &[Failed, Queued, Dispatching]), BatchStatus::Failed);
        assert_eq!(aggregate(ff, &[Completed, Aborted, Failed]), BatchStatus::Failed);
        assert_eq!(aggregate(ff, &[Completed, Completed]), BatchStatus::Completed);
    }
}
