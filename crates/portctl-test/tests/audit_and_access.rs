//! Audit trail completeness, access control and metrics.

use portctl_driver::{Fault, SimulatedTransport};
use portctl_test::{
    access_port, admin_role, assert_transitions_audited, bring_up, fast_config, key, request, Fleet, Harness,
};
use portctl_types::{Operation, PortConfig};
use portctld::audit::{AuditCategory, AuditOutcome, AuditRecord, AuditSink};
use portctld::authorizer::{Role, Scope, StaticPolicyStore};
use portctld::error::{ActivationError, AuditError, EngineError};
use portctld::metrics::summarize;
use portctld::model::{ActivationRequest, Channel};
use portctld::state::{BatchStatus, JobState};
use portctld::PlanDecision;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A sink that starts failing once `broken` is set.
#[derive(Default)]
struct BreakableSink {
    broken: AtomicBool,
}

impl AuditSink for BreakableSink {
    fn write(&self, _record: &AuditRecord) -> Result<(), AuditError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(AuditError::Io(std::io::Error::other("disk full")));
        }
        Ok(())
    }
}

/// Operators scoped to ports 1-2 that may only flip admin state.
fn restricted_policy() -> Arc<StaticPolicyStore> {
    let toggler = Role {
        name: "port-toggler".to_string(),
        operations: [Operation::Activate, Operation::Deactivate, Operation::Verify, Operation::Rollback]
            .into_iter()
            .collect(),
        scope: Scope {
            groups: ["leaf".to_string()].into_iter().collect(),
            ports: Some([1, 2].into_iter().collect()),
            ..Scope::default()
        },
    };
    Arc::new(
        StaticPolicyStore::new()
            .with_role(admin_role())
            .with_role(toggler)
            .bind("alice", "admin")
            .bind("bob", "port-toggler"),
    )
}

/// Every job leaves one transition record per state, driver calls carry
/// the submitting actor, and intake and authorization are recorded.
#[tokio::test]
async fn test_audit_trail_is_complete() {
    let fleet = Fleet::new(2, 4);
    let (a, b) = (fleet.device(0).clone(), fleet.device(1).clone());
    fleet.sim.inject(key(&a, 2), Fault::transient(1));
    fleet.sim.inject(key(&b, 3), Fault::partial_apply(Operation::Activate));
    let h = Harness::start(&fleet, fast_config());

    let receipt = h
        .engine
        .submit(request([
            access_port(&a, 1, 10),
            access_port(&a, 2, 10),
            access_port(&b, 3, 10),
        ]))
        .await
        .unwrap();
    let view = h.engine.wait(receipt.batch).await.unwrap();
    assert_eq!(view.status, BatchStatus::PartialSuccess);

    let records = h.records();
    for id in &receipt.jobs {
        let job = h.job(*id).await;
        assert_transitions_audited(&job, &records).unwrap();
        let calls: Vec<_> = records
            .iter()
            .filter(|r| r.job_id == Some(job.id) && r.category == AuditCategory::DriverCall)
            .collect();
        assert!(!calls.is_empty());
        assert!(calls.iter().all(|r| r.actor == "alice"));
    }

    assert!(records
        .iter()
        .any(|r| r.category == AuditCategory::Compensation && r.outcome == AuditOutcome::Success));
    assert_eq!(
        records
            .iter()
            .filter(|r| r.category == AuditCategory::Authorization && r.outcome == AuditOutcome::Success)
            .count(),
        3
    );
    assert!(records
        .iter()
        .any(|r| r.category == AuditCategory::Intake && r.batch_id == Some(receipt.batch)));

    let metrics = summarize(&records);
    assert_eq!(metrics.jobs, 3);
    assert_eq!(metrics.completed, 2);
    assert_eq!(metrics.failed, 1);
    assert!(metrics.driver_failures >= 2);
    assert!(metrics.latency.is_some());
}

/// One out-of-scope intent refuses the whole request and nothing reaches
/// the switches.
#[tokio::test]
async fn test_out_of_scope_request_is_refused() {
    let fleet = Fleet::new(1, 4);
    let leaf = fleet.device(0).clone();
    let h = Harness::with_policy(&fleet, fast_config(), restricted_policy());

    let err = h
        .engine
        .submit(
            ActivationRequest::new("bob", Channel::Ui)
                .with_intent(bring_up(&leaf, 1))
                .with_intent(bring_up(&leaf, 3))
                .with_intent(access_port(&leaf, 2, 10)),
        )
        .await
        .unwrap_err();

    let refused: Vec<usize> = err.rejections().iter().map(|r| r.index).collect();
    assert_eq!(refused, vec![1, 2]);
    assert!(err
        .rejections()
        .iter()
        .all(|r| matches!(r.error, ActivationError::Authorization { .. })));
    assert_eq!(h.sim.call_count(), 0);
    assert!(h
        .records()
        .iter()
        .all(|r| r.category != AuditCategory::JobTransition));
    assert_eq!(
        h.records()
            .iter()
            .filter(|r| r.category == AuditCategory::Authorization && r.outcome == AuditOutcome::Denied)
            .count(),
        2
    );

    let ok = h
        .engine
        .submit(ActivationRequest::new("bob", Channel::Ui).with_intent(bring_up(&leaf, 2)))
        .await
        .unwrap();
    assert_eq!(h.engine.wait(ok.batch).await.unwrap().status, BatchStatus::Completed);
}

#[tokio::test]
async fn test_unknown_actor_is_refused() {
    let fleet = Fleet::new(1, 2);
    let leaf = fleet.device(0).clone();
    let h = Harness::with_policy(&fleet, fast_config(), restricted_policy());

    let result = h
        .engine
        .submit(ActivationRequest::new("mallory", Channel::Api).with_intent(bring_up(&leaf, 1)))
        .await;
    assert!(matches!(result, Err(EngineError::Rejected(ref r)) if r.len() == 1));
}

/// The dry-run plan shows each intent's verdict without creating jobs.
#[tokio::test]
async fn test_plan_reports_per_intent_decisions() {
    let fleet = Fleet::new(1, 4);
    let leaf = fleet.device(0).clone();
    let h = Harness::with_policy(&fleet, fast_config(), restricted_policy());

    let rows = h.engine.plan(
        &ActivationRequest::new("bob", Channel::Cli)
            .with_intent(bring_up(&leaf, 1))
            .with_intent(bring_up(&leaf, 4))
            .with_intent(bring_up(&leaf, 9)),
    );
    assert_eq!(rows.len(), 3);
    assert!(matches!(rows[0].decision, PlanDecision::Allow { ref role } if role == "port-toggler"));
    assert!(matches!(rows[1].decision, PlanDecision::Deny { .. }));
    assert!(matches!(rows[2].decision, PlanDecision::Invalid { .. }));
    assert_eq!(h.sim.call_count(), 0);
}

/// Once a sink write is lost, the in-flight job stops before changing the
/// port and new requests are refused.
#[tokio::test]
async fn test_lost_audit_write_stops_dispatch() {
    let fleet = Fleet::with_sim(1, 2, SimulatedTransport::new().with_latency(Duration::from_millis(100)));
    let leaf = fleet.device(0).clone();
    let sink = Arc::new(BreakableSink::default());
    let h = Harness::with_audit_sink(&fleet, fast_config(), sink.clone());

    let receipt = h.engine.submit(request([access_port(&leaf, 1, 10)])).await.unwrap();
    sink.broken.store(true, Ordering::SeqCst);

    let view = h.engine.wait(receipt.batch).await.unwrap();
    assert_eq!(view.status, BatchStatus::Failed);
    let job = h.job(receipt.jobs[0]).await;
    assert_eq!(job.state, JobState::Failed);
    match &job.last_error {
        Some(ActivationError::System { message }) => assert!(message.contains("disk full"), "{}", message),
        other => panic!("expected a system error, got {:?}", other),
    }
    assert_eq!(h.sim.port(&key(&leaf, 1)), Some(PortConfig::default()));
    assert!(h.sim.calls_for(&key(&leaf, 1)).iter().all(|c| !c.operation.is_mutating()));
    assert!(h.engine.audit().failed_writes() > 0);

    let refused = h.engine.submit(request([access_port(&leaf, 2, 10)])).await;
    assert!(matches!(refused, Err(EngineError::Audit(AuditError::Incomplete(_)))));
    assert!(h.sim.calls_for(&key(&leaf, 2)).is_empty());
}
