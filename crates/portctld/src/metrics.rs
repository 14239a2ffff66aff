//! Success metrics derived from the audit log.
//!
//! Nothing here reads engine state: the same numbers can be recomputed
//! later from an exported JSON-lines audit file.

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::model::JobId;
use crate::state::JobState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Activation latency over completed jobs, first record to `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub min: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub max: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuccessMetrics {
    pub jobs: usize,
    pub completed: usize,
    /// Failed, rolled back or awaiting manual intervention.
    pub failed: usize,
    pub aborted: usize,
    /// completed / (completed + failed); 1.0 when nothing finished.
    pub success_rate: f64,
    pub driver_calls: usize,
    pub driver_failures: usize,
    /// driver_failures / driver_calls; 0.0 without calls.
    pub error_rate: f64,
    pub latency: Option<LatencySummary>,
}

impl fmt::Display for SuccessMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "jobs={} completed={} failed={} aborted={} success_rate={:.3} driver_calls={} error_rate={:.3}",
            self.jobs,
            self.completed,
            self.failed,
            self.aborted,
            self.success_rate,
            self.driver_calls,
            self.error_rate
        )?;
        if let Some(l) = &self.latency {
            write!(f, " latency_p50={:?} latency_p95={:?} latency_max={:?}", l.p50, l.p95, l.max)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct JobTrace {
    first: Option<DateTime<Utc>>,
    last_state: Option<JobState>,
    completed_at: Option<DateTime<Utc>>,
}

fn parse_state(name: &str) -> Option<JobState> {
    JobState::ALL.into_iter().find(|s| s.as_str() == name)
}

/// Computes the success metrics of every job that appears in `records`.
pub fn summarize(records: &[AuditRecord]) -> SuccessMetrics {
    let mut traces: HashMap<JobId, JobTrace> = HashMap::new();
    let mut driver_calls = 0;
    let mut driver_failures = 0;

    for record in records {
        if matches!(record.category, AuditCategory::DriverCall | AuditCategory::Compensation) {
            driver_calls += 1;
            if record.outcome == AuditOutcome::Failure {
                driver_failures += 1;
            }
        }
        let Some(job) = record.job_id else {
            continue;
        };
        let trace = traces.entry(job).or_default();
        trace.first = Some(trace.first.map_or(record.timestamp, |t| t.min(record.timestamp)));
        if record.category == AuditCategory::JobTransition {
            if let Some(state) = record.detail("to").and_then(parse_state) {
                trace.last_state = Some(state);
                if state == JobState::Completed {
                    trace.completed_at = Some(record.timestamp);
                }
            }
        }
    }

    let mut completed = 0;
    let mut failed = 0;
    let mut aborted = 0;
    let mut latencies = Vec::new();
    for trace in traces.values() {
        match trace.last_state {
            Some(JobState::Completed) => {
                completed += 1;
                if let (Some(first), Some(done)) = (trace.first, trace.completed_at) {
                    latencies.push((done - first).to_std().unwrap_or_default());
                }
            }
            Some(state) if state.is_failure() => failed += 1,
            Some(JobState::Aborted) => aborted += 1,
            _ => {}
        }
    }

    let finished = completed + failed;
    SuccessMetrics {
        jobs: traces.len(),
        completed,
        failed,
        aborted,
        success_rate: if finished == 0 {
            1.0
        } else {
            completed as f64 / finished as f64
        },
        driver_calls,
        driver_failures,
        error_rate: if driver_calls == 0 {
            0.0
        } else {
            driver_failures as f64 / driver_calls as f64
        },
        latency: latency_summary(latencies),
    }
}

fn latency_summary(mut samples: Vec<Duration>) -> Option<LatencySummary> {
    if samples.is_empty() {
        return None;
    }
    samples.sort();
    Some(LatencySummary {
        min: samples[0],
        p50: percentile(&samples, 0.50),
        p95: percentile(&samples, 0.95),
        max: samples[samples.len() - 1],
    })
}

/// Nearest-rank percentile of sorted, non-empty samples.
fn percentile(sorted: &[Duration], p: f64) -> Duration {
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BatchId;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn transition(job: JobId, to: JobState, ms: i64) -> AuditRecord {
        let mut record = AuditRecord::new(AuditCategory::JobTransition, "orchestrator", "transition")
            .with_job(job)
            .with_batch(BatchId::new())
            .with_details(serde_json::json!({ "to": to.as_str() }));
        record.timestamp = at(ms);
        record
    }

    fn call(job: JobId, ok: bool, ms: i64) -> AuditRecord {
        let record = AuditRecord::new(AuditCategory::DriverCall, "dispatcher", "activate").with_job(job);
        let mut record = if ok {
            record.with_outcome(AuditOutcome::Success)
        } else {
            record.with_error("timeout")
        };
        record.timestamp = at(ms);
        record
    }

    #[test]
    fn test_summarize() {
        let (a, b, c) = (JobId::new(), JobId::new(), JobId::new());
        let records = vec![
            transition(a, JobState::Received, 0),
            transition(b, JobState::Received, 0),
            transition(c, JobState::Received, 0),
            call(a, true, 10),
            call(b, false, 20),
            call(b, false, 40),
            transition(a, JobState::Completed, 100),
            transition(b, JobState::Failed, 60),
            transition(c, JobState::Aborted, 5),
        ];
        let m = summarize(&records);
        assert_eq!((m.jobs, m.completed, m.failed, m.aborted), (3, 1, 1, 1));
        assert_eq!(m.success_rate, 0.5);
        assert_eq!(m.driver_calls, 3);
        assert_eq!(m.driver_failures, 2);
        let latency = m.latency.unwrap();
        assert_eq!(latency.p50, Duration::from_millis(100));
        assert_eq!(latency.min, latency.max);
    }

    #[test]
    fn test_percentiles() {
        let samples: Vec<Duration> = (1..=100).map(Duration::from_millis).collect();
        let summary = latency_summary(samples).unwrap();
        assert_eq!(summary.p50, Duration::from_millis(50));
        assert_eq!(summary.p95, Duration::from_millis(95));
        assert_eq!(summary.max, Duration::from_millis(100));
    }

    #[test]
    fn test_empty_log() {
        let m = summarize(&[]);
        assert_eq!(m.jobs, 0);
        assert_eq!(m.success_rate, 1.0);
        assert_eq!(m.error_rate, 0.0);
        assert!(m.latency.is_none());
    }
}
