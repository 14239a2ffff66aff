//! Fleet-scale batches
//!
//! A thousand ports across twenty switches, with and without a handful of
//! unresponsive ports.

use portctl_driver::Fault;
use portctl_test::{access_config, access_port, assert_no_overlap, assert_port, fast_config, request, Fleet, Harness};
use portctld::error::ActivationError;
use portctld::state::{BatchStatus, JobState};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::time::Duration;

const DEVICES: usize = 20;
const PORTS: u32 = 50;

fn thousand_port_request(fleet: &Fleet) -> portctld::model::ActivationRequest {
    request(
        fleet
            .devices
            .iter()
            .flat_map(|d| (1..=PORTS).map(move |p| access_port(d, p, 100))),
    )
}

/// 1000 ports configured in one batch, within the dispatch limits.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thousand_ports_complete() {
    let fleet = Fleet::new(DEVICES, PORTS);
    let config = fast_config();
    let per_device = config.dispatch.per_device_concurrency;
    let global = config.dispatch.global_concurrency;
    let h = Harness::start(&fleet, config);

    let receipt = h.engine.submit(thousand_port_request(&fleet)).await.unwrap();
    assert_eq!(receipt.jobs.len(), 1000);

    let view = tokio::time::timeout(Duration::from_secs(60), h.engine.wait(receipt.batch))
        .await
        .expect("batch settles")
        .unwrap();
    assert_eq!(view.status, BatchStatus::Completed);
    assert_eq!(view.count(JobState::Completed), 1000);

    for key in fleet.keys() {
        assert_port(&h.sim, &key, access_config(100)).unwrap();
    }
    for device in &fleet.devices {
        assert!(h.sim.peak_in_flight_for(device) <= per_device);
    }
    assert!(h.sim.peak_in_flight() <= global);
    assert_no_overlap(&h.sim).unwrap();
}

/// Five ports that never answer end `Failed` after the configured attempts;
/// the other 995 complete and the batch is a partial success.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_five_timeouts_partial_success() {
    let fleet = Fleet::new(DEVICES, PORTS);
    let mut config = fast_config();
    config.dispatch.call_deadline_ms = 50;
    let max_attempts = config.retry.max_attempts;

    let stuck: Vec<_> = (0..5).map(|i| portctl_test::key(fleet.device(i * 4), 7)).collect();
    for key in &stuck {
        fleet.sim.inject(key.clone(), Fault::hang(Duration::from_secs(60)));
    }
    let h = Harness::start(&fleet, config);

    let receipt = h.engine.submit(thousand_port_request(&fleet)).await.unwrap();
    let view = tokio::time::timeout(Duration::from_secs(60), h.engine.wait(receipt.batch))
        .await
        .expect("batch settles")
        .unwrap();

    assert_eq!(view.status, BatchStatus::PartialSuccess);
    assert_eq!(view.count(JobState::Completed), 995);
    assert_eq!(view.count(JobState::Failed), 5);

    let stuck: HashSet<_> = stuck.into_iter().collect();
    for job in view.jobs.iter().filter(|j| j.state == JobState::Failed) {
        assert!(stuck.contains(&job.key), "unexpected failure on {}", job.key);
        assert_eq!(job.attempts, max_attempts);
        assert!(matches!(job.last_error, Some(ActivationError::TransientDriver { .. })));

        let mutating = h
            .sim
            .calls_for(&job.key)
            .iter()
            .filter(|c| c.operation.is_mutating())
            .count();
        assert_eq!(mutating, max_attempts as usize);
        assert_port(&h.sim, &job.key, Default::default()).unwrap();
    }
}
