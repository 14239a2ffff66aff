//! Verification helpers for engine scenarios
//!
//! Checks that hold for every run regardless of faults: per-port calls never
//! overlap, jobs only take legal edges, and the audit log mirrors every
//! transition.

use portctl_driver::SimulatedTransport;
use portctl_types::{PortConfig, PortKey};
use portctld::audit::{AuditCategory, AuditRecord};
use portctld::model::{ActivationJob, JobId};
use portctld::state::JobState;
use std::collections::HashMap;
use thiserror::Error;

/// Verification error types
#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("calls on {key} overlap: one ended after the next started")]
    Overlap { key: PortKey },

    #[error("job {job} took illegal edge {from} -> {to}")]
    IllegalTransition { job: JobId, from: JobState, to: JobState },

    #[error("job {job} has {expected} transitions but {actual} audit records")]
    AuditGap { job: JobId, expected: usize, actual: usize },

    #[error("port {key}: expected {expected}, found {actual:?}")]
    PortMismatch {
        key: PortKey,
        expected: PortConfig,
        actual: Option<PortConfig>,
    },
}

/// Result type for verification operations
pub type VerifyResult<T> = Result<T, VerificationError>;

/// No two driver calls on the same port were in flight together.
pub fn assert_no_overlap(sim: &SimulatedTransport) -> VerifyResult<()> {
    let mut by_key: HashMap<PortKey, Vec<_>> = HashMap::new();
    for call in sim.calls() {
        by_key.entry(call.key.clone()).or_default().push(call);
    }
    for (key, mut calls) in by_key {
        calls.sort_by_key(|c| c.started);
        if calls.windows(2).any(|w| w[0].finished > w[1].started) {
            return Err(VerificationError::Overlap { key });
        }
    }
    Ok(())
}

/// Every recorded transition is an edge of the lifecycle graph.
pub fn assert_legal_transitions(job: &ActivationJob) -> VerifyResult<()> {
    for t in &job.transitions {
        if let Some(from) = t.from {
            if !from.can_transition_to(t.to) {
                return Err(VerificationError::IllegalTransition {
                    job: job.id,
                    from,
                    to: t.to,
                });
            }
        }
    }
    Ok(())
}

/// One `JobTransition` audit record per state the job entered.
pub fn assert_transitions_audited(job: &ActivationJob, records: &[AuditRecord]) -> VerifyResult<()> {
    let actual = records
        .iter()
        .filter(|r| r.category == AuditCategory::JobTransition && r.job_id == Some(job.id))
        .count();
    if actual != job.transitions.len() {
        return Err(VerificationError::AuditGap {
            job: job.id,
            expected: job.transitions.len(),
            actual,
        });
    }
    Ok(())
}

pub fn assert_port(sim: &SimulatedTransport, key: &PortKey, expected: PortConfig) -> VerifyResult<()> {
    let actual = sim.port(key);
    if actual != Some(expected) {
        return Err(VerificationError::PortMismatch {
            key: key.clone(),
            expected,
            actual,
        });
    }
    Ok(())
}
