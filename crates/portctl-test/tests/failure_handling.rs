//! Retry, compensation and escalation scenarios.

use portctl_driver::{DriverKind, Fault, SimulatedTransport};
use portctl_test::{
    access_config, access_port, assert_legal_transitions, bring_up, fast_config, key, request, states, Fleet, Harness,
};
use portctl_types::{Operation, PortConfig};
use portctld::audit::AuditCategory;
use portctld::error::{ActivationError, EngineError};
use portctld::state::{BatchStatus, JobState};
use portctld::store::MemoryStore;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

/// A port that always fails transiently is attempted exactly
/// `max_attempts` times, then fails without compensation.
#[tokio::test]
async fn test_retries_stop_at_max_attempts() {
    let fleet = Fleet::new(1, 4);
    let leaf = fleet.device(0).clone();
    let mut config = fast_config();
    config.retry.max_attempts = 4;
    fleet.sim.inject(key(&leaf, 1), Fault::transient_forever());
    let h = Harness::start(&fleet, config);

    let receipt = h.engine.submit(request([bring_up(&leaf, 1)])).await.unwrap();
    let view = h.engine.wait(receipt.batch).await.unwrap();
    assert_eq!(view.status, BatchStatus::Failed);

    let job = h.job(receipt.jobs[0]).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 4);
    assert!(matches!(job.last_error, Some(ActivationError::TransientDriver { .. })));
    assert_eq!(states(&job).iter().filter(|s| **s == JobState::Retrying).count(), 3);
    assert_legal_transitions(&job).unwrap();

    let activations = h
        .sim
        .calls_for(&key(&leaf, 1))
        .iter()
        .filter(|c| c.operation == Operation::Activate)
        .count();
    assert_eq!(activations, 4);
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    let fleet = Fleet::new(1, 4);
    let leaf = fleet.device(0).clone();
    fleet.sim.inject(key(&leaf, 2), Fault::transient(2));
    let h = Harness::start(&fleet, fast_config());

    let receipt = h.engine.submit(request([access_port(&leaf, 2, 40)])).await.unwrap();
    let view = h.engine.wait(receipt.batch).await.unwrap();
    assert_eq!(view.status, BatchStatus::Completed);

    let job = h.job(receipt.jobs[0]).await;
    assert_eq!(job.attempts, 3);
    assert_eq!(job.snapshot, Some(PortConfig::default()));
    assert_eq!(h.sim.port(&key(&leaf, 2)), Some(access_config(40)));
}

/// The change lands but the commit reports failure; the port is restored to
/// its snapshot and the job ends `RolledBack`.
#[tokio::test]
async fn test_partial_apply_is_compensated() {
    let fleet = Fleet::new(1, 4);
    let leaf = fleet.device(0).clone();
    fleet.sim.inject(key(&leaf, 3), Fault::partial_apply(Operation::Activate));
    let h = Harness::start(&fleet, fast_config());

    let receipt = h.engine.submit(request([access_port(&leaf, 3, 50)])).await.unwrap();
    let view = h.engine.wait(receipt.batch).await.unwrap();
    assert_eq!(view.status, BatchStatus::Failed);

    let job = h.job(receipt.jobs[0]).await;
    assert_eq!(job.state, JobState::RolledBack);
    assert!(matches!(job.last_error, Some(ActivationError::PermanentDriver { .. })));
    assert!(job.compensation_attempts >= 1);
    assert_eq!(h.sim.port(&key(&leaf, 3)), Some(PortConfig::default()));
    assert_eq!(
        &states(&job)[3..],
        &[
            JobState::Queued,
            JobState::Dispatching,
            JobState::Failed,
            JobState::RollingBack,
            JobState::RolledBack
        ]
    );
    assert!(h
        .sim
        .calls_for(&key(&leaf, 3))
        .iter()
        .any(|c| c.operation == Operation::Rollback));
}

/// The change goes through but reading it back disagrees with the intent.
/// The job fails and the port is restored to its snapshot.
#[tokio::test]
async fn test_verification_mismatch_is_compensated() {
    let fleet = Fleet::new(1, 4);
    let leaf = fleet.device(0).clone();
    let port = key(&leaf, 2);
    // The snapshot read is honest, the read-back after the change is not.
    fleet
        .sim
        .inject(port.clone(), Fault::verify_drift(access_config(99)).after(1));
    let h = Harness::start(&fleet, fast_config());

    let receipt = h.engine.submit(request([access_port(&leaf, 2, 40)])).await.unwrap();
    let view = h.engine.wait(receipt.batch).await.unwrap();
    assert_eq!(view.status, BatchStatus::Failed);

    let job = h.job(receipt.jobs[0]).await;
    assert_eq!(job.state, JobState::RolledBack);
    assert_eq!(job.attempts, 1);
    match &job.last_error {
        Some(ActivationError::PermanentDriver { message }) => assert!(message.contains("verification mismatch")),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(
        &states(&job)[3..],
        &[
            JobState::Queued,
            JobState::Dispatching,
            JobState::Applied,
            JobState::Failed,
            JobState::RollingBack,
            JobState::RolledBack
        ]
    );
    assert_legal_transitions(&job).unwrap();
    assert_eq!(h.sim.port(&port), Some(PortConfig::default()));
    assert!(h.sim.calls_for(&port).iter().any(|c| c.operation == Operation::Rollback));
}

/// A job that waits longer than the lease timeout for its port fails with
/// a contention error and never reaches the device.
#[tokio::test]
async fn test_lease_wait_timeout_fails_job() {
    let fleet = Fleet::new(1, 4);
    let leaf = fleet.device(0).clone();
    let port = key(&leaf, 1);
    fleet.sim.inject(
        port.clone(),
        Fault::hang(Duration::from_millis(300)).on(Operation::Verify).times(1),
    );
    let mut config = fast_config();
    config.lease.acquire_timeout_ms = 100;
    let h = Harness::start(&fleet, config);

    let holder = h.engine.submit(request([access_port(&leaf, 1, 10)])).await.unwrap();
    let waiter = h.engine.submit(request([access_port(&leaf, 1, 20)])).await.unwrap();

    let view = h.engine.wait(waiter.batch).await.unwrap();
    assert_eq!(view.status, BatchStatus::Failed);
    let job = h.job(waiter.jobs[0]).await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 0);
    assert!(matches!(job.last_error, Some(ActivationError::LockContention { .. })));
    assert_eq!(
        &states(&job)[3..],
        &[JobState::Queued, JobState::Failed]
    );

    let held = h.engine.wait(holder.batch).await.unwrap();
    assert_eq!(held.status, BatchStatus::Completed);
    assert_eq!(h.sim.port(&port), Some(access_config(10)));
}

/// Compensation that cannot restore the port leaves the job awaiting an
/// operator, who can then sign it off.
#[tokio::test]
async fn test_failed_compensation_requires_operator() {
    let fleet = Fleet::new(1, 4);
    let leaf = fleet.device(0).clone();
    let port = key(&leaf, 4);
    fleet.sim.inject(port.clone(), Fault::partial_apply(Operation::Activate));
    fleet.sim.inject(port.clone(), Fault::reject(Operation::Rollback));
    let h = Harness::start(&fleet, fast_config());

    let receipt = h.engine.submit(request([access_port(&leaf, 4, 60)])).await.unwrap();
    h.engine.wait(receipt.batch).await.unwrap();

    let job = h.job(receipt.jobs[0]).await;
    assert_eq!(job.state, JobState::RequiresManualIntervention);
    assert!(job.resolution.is_none());

    let resolved = h
        .engine
        .resolve(job.id, "noc-oncall", "restored by hand")
        .await
        .unwrap();
    assert_eq!(resolved.state, JobState::RequiresManualIntervention);
    let resolution = resolved.resolution.unwrap();
    assert_eq!(resolution.operator, "noc-oncall");
    assert_eq!(resolution.note, "restored by hand");

    assert!(h.records().iter().any(|r| r.category == AuditCategory::OperatorAction
        && r.action == "resolve"
        && r.job_id == Some(job.id)
        && r.actor == "noc-oncall"));
}

/// The store goes away mid-flight: the job is failed with a system error
/// instead of carrying on unrecorded.
#[tokio::test]
async fn test_store_outage_fails_job() {
    let fleet = Fleet::with_sim(1, 4, SimulatedTransport::new().with_latency(Duration::from_millis(50)));
    let leaf = fleet.device(0).clone();
    let store = Arc::new(MemoryStore::new());
    let h = Harness::with_store(&fleet, fast_config(), store.clone());

    let receipt = h.engine.submit(request([bring_up(&leaf, 1)])).await.unwrap();
    store.set_available(false);

    let view = h.engine.wait(receipt.batch).await.unwrap();
    assert_eq!(view.status, BatchStatus::Failed);
    let job = h.job(receipt.jobs[0]).await;
    assert_eq!(job.state, JobState::Failed);
    assert!(matches!(job.last_error, Some(ActivationError::System { .. })));

    // And nothing new is admitted while it is down.
    let refused = h.engine.submit(request([bring_up(&leaf, 2)])).await;
    assert!(matches!(refused, Err(EngineError::Store(_))));
}

/// SNMP switches cannot set the switchport mode; the job fails before any
/// change is sent.
#[tokio::test]
async fn test_unsupported_operation_fails_permanently() {
    let fleet = Fleet::new(1, 4).with_kind(DriverKind::Snmp);
    let leaf = fleet.device(0).clone();
    let h = Harness::start(&fleet, fast_config());

    let receipt = h.engine.submit(request([access_port(&leaf, 1, 10)])).await.unwrap();
    h.engine.wait(receipt.batch).await.unwrap();

    let job = h.job(receipt.jobs[0]).await;
    assert_eq!(job.state, JobState::Failed);
    assert!(matches!(job.last_error, Some(ActivationError::PermanentDriver { .. })));
    assert!(h.sim.calls().iter().all(|c| !c.operation.is_mutating()));
}
