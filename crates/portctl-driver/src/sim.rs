//! In-memory device fleet with fault injection.
//!
//! Stands in for real switches in simulation mode and in tests. Every call
//! is logged with its start and end time so tests can check ordering and
//! non-overlap per port, and peak concurrency is tracked per device.

use crate::{DeviceRequest, DeviceTransport, DriverError, DriverResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use portctl_types::{DeviceId, Operation, PortConfig, PortId, PortKey};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
enum FaultKind {
    Transient,
    Hang(Duration),
    Reject,
    PartialApply,
    VerifyDrift(PortConfig),
}

/// A fault armed on one port.
///
/// Unless narrowed with [`Fault::on`], faults hit every mutating operation.
/// Drift faults hit `verify` only.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    kind: FaultKind,
    operation: Option<Operation>,
    remaining: Option<u32>,
    skip: u32,
}

impl Fault {
    fn new(kind: FaultKind, remaining: Option<u32>) -> Self {
        Self {
            kind,
            operation: None,
            remaining,
            skip: 0,
        }
    }

    /// Transient failure for the next `times` matching calls.
    pub fn transient(times: u32) -> Self {
        Self::new(FaultKind::Transient, Some(times))
    }

    /// Transient failure on every matching call.
    pub fn transient_forever() -> Self {
        Self::new(FaultKind::Transient, None)
    }

    /// Matching calls hang for `duration` and then fail.
    pub fn hang(duration: Duration) -> Self {
        Self::new(FaultKind::Hang(duration), None)
    }

    /// The device rejects `operation` permanently.
    pub fn reject(operation: Operation) -> Self {
        Self::new(FaultKind::Reject, None).on(operation)
    }

    /// `operation` takes effect but the device reports a failure, once.
    pub fn partial_apply(operation: Operation) -> Self {
        Self::new(FaultKind::PartialApply, Some(1)).on(operation)
    }

    /// The next `verify` reports `observed` instead of the real state.
    pub fn verify_drift(observed: PortConfig) -> Self {
        Self::new(FaultKind::VerifyDrift(observed), Some(1)).on(Operation::Verify)
    }

    /// Restricts the fault to one operation.
    pub fn on(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Lets the next `n` matching calls through before the fault applies.
    pub fn after(mut self, n: u32) -> Self {
        self.skip = n;
        self
    }

    /// Limits the fault to the next `n` matching calls.
    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, operation: Operation) -> bool {
        if self.remaining == Some(0) {
            return false;
        }
        match self.operation {
            Some(op) => op == operation,
            None => operation.is_mutating(),
        }
    }
}

/// One logged call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub key: PortKey,
    pub operation: Operation,
    pub payload: String,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug, Default)]
struct Load {
    current: usize,
    peak: usize,
    per_device: HashMap<DeviceId, (usize, usize)>,
}

/// Simulated switches behind the [`DeviceTransport`] seam.
#[derive(Debug, Default)]
pub struct SimulatedTransport {
    ports: Mutex<HashMap<PortKey, PortConfig>>,
    faults: Mutex<HashMap<PortKey, Vec<Fault>>>,
    calls: Mutex<Vec<CallRecord>>,
    load: Mutex<Load>,
    latency: Duration,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fixed latency to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Creates (or overwrites) a port.
    pub fn seed(&self, key: PortKey, config: PortConfig) {
        self.ports.lock().insert(key, config);
    }

    /// Creates a run of ports on one device.
    pub fn seed_device(
        &self,
        device: &DeviceId,
        ports: impl IntoIterator<Item = PortId>,
        config: PortConfig,
    ) {
        let mut table = self.ports.lock();
        for port in ports {
            table.insert(PortKey::new(device.clone(), port), config);
        }
    }

    /// Actual state of a port, ignoring any armed drift.
    pub fn port(&self, key: &PortKey) -> Option<PortConfig> {
        self.ports.lock().get(key).copied()
    }

    pub fn inject(&self, key: PortKey, fault: Fault) {
        self.faults.lock().entry(key).or_default().push(fault);
    }

    pub fn clear_faults(&self, key: &PortKey) {
        self.faults.lock().remove(key);
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, key: &PortKey) -> Vec<CallRecord> {
        self.calls
            .lock()
            .iter()
            .filter(|c| &c.key == key)
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Highest number of simultaneous calls seen across all devices.
    pub fn peak_in_flight(&self) -> usize {
        self.load.lock().peak
    }

    /// Highest number of simultaneous calls seen on one device.
    pub fn peak_in_flight_for(&self, device: &DeviceId) -> usize {
        self.load
            .lock()
            .per_device
            .get(device)
            .map_or(0, |(_, peak)| *peak)
    }

    fn begin(&self, key: PortKey, operation: Operation, payload: &str) -> CallGuard<'_> {
        let mut load = self.load.lock();
        load.current += 1;
        load.peak = load.peak.max(load.current);
        let entry = load.per_device.entry(key.device.clone()).or_default();
        entry.0 += 1;
        entry.1 = entry.1.max(entry.0);
        CallGuard {
            sim: self,
            key,
            operation,
            payload: payload.to_string(),
            started: Instant::now(),
        }
    }

    fn take_fault(&self, key: &PortKey, operation: Operation) -> Option<FaultKind> {
        let mut faults = self.faults.lock();
        let fault = faults.get_mut(key)?.iter_mut().find(|f| f.matches(operation))?;
        if fault.skip > 0 {
            fault.skip -= 1;
            return None;
        }
        if let Some(n) = fault.remaining.as_mut() {
            *n -= 1;
        }
        Some(fault.kind.clone())
    }

    fn apply(&self, key: &PortKey, request: &DeviceRequest) -> DriverResult<PortConfig> {
        let mut ports = self.ports.lock();
        let current = ports.get(key).copied().ok_or_else(|| {
            DriverError::rejected(&key.device, request.change.operation(), "no such port")
        })?;
        let next = request.change.apply_to(current);
        ports.insert(key.clone(), next);
        Ok(next)
    }
}

struct CallGuard<'a> {
    sim: &'a SimulatedTransport,
    key: PortKey,
    operation: Operation,
    payload: String,
    started: Instant,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        {
            let mut load = self.sim.load.lock();
            load.current = load.current.saturating_sub(1);
            if let Some(entry) = load.per_device.get_mut(&self.key.device) {
                entry.0 = entry.0.saturating_sub(1);
            }
        }
        self.sim.calls.lock().push(CallRecord {
            key: self.key.clone(),
            operation: self.operation,
            payload: std::mem::take(&mut self.payload),
            started: self.started,
            finished: Instant::now(),
        });
    }
}

#[async_trait]
impl DeviceTransport for SimulatedTransport {
    async fn send(&self, device: &DeviceId, request: &DeviceRequest) -> DriverResult<PortConfig> {
        let key = PortKey::new(device.clone(), request.port.clone());
        let operation = request.change.operation();
        let _guard = self.begin(key.clone(), operation, &request.payload);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.take_fault(&key, operation) {
            Some(FaultKind::Transient) => {
                Err(DriverError::transient(device, operation, "connection reset by peer"))
            }
            Some(FaultKind::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                Err(DriverError::transient(device, operation, "no response"))
            }
            Some(FaultKind::Reject) => Err(DriverError::rejected(
                device,
                operation,
                "configuration rejected by device",
            )),
            Some(FaultKind::PartialApply) => {
                self.apply(&key, request)?;
                Err(DriverError::rejected(
                    device,
                    operation,
                    "commit failed after partial apply",
                ))
            }
            Some(FaultKind::VerifyDrift(_)) | None => self.apply(&key, request),
        }
    }

    async fn fetch(&self, device: &DeviceId, port: &PortId, payload: &str) -> DriverResult<PortConfig> {
        let key = PortKey::new(device.clone(), port.clone());
        let _guard = self.begin(key.clone(), Operation::Verify, payload);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let actual = self.port(&key).ok_or_else(|| {
            DriverError::rejected(device, Operation::Verify, "no such port")
        });
        match self.take_fault(&key, Operation::Verify) {
            Some(FaultKind::VerifyDrift(observed)) => Ok(observed),
            Some(FaultKind::Transient) => Err(DriverError::transient(
                device,
                Operation::Verify,
                "connection reset by peer",
            )),
            Some(FaultKind::Hang(duration)) => {
                tokio::time::sleep(duration).await;
                Err(DriverError::transient(device, Operation::Verify, "no response"))
            }
            Some(FaultKind::Reject) | Some(FaultKind::PartialApply) => Err(DriverError::rejected(
                device,
                Operation::Verify,
                "read rejected by device",
            )),
            None => actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DriverKind, PortChange};
    use portctl_types::{AdminState, VlanId};
    use pretty_assertions::assert_eq;

    fn key() -> PortKey {
        PortKey::new(DeviceId::new("leaf1").unwrap(), PortId::numbered("Ethernet", 1))
    }

    fn request(change: PortChange) -> DeviceRequest {
        DeviceRequest {
            kind: DriverKind::VendorApi,
            port: key().port,
            change,
            payload: String::new(),
        }
    }

    #[tokio::test]
    async fn test_transient_budget() {
        let sim = SimulatedTransport::new();
        sim.seed(key(), PortConfig::default());
        sim.inject(key(), Fault::transient(2));

        let k = key();
        for _ in 0..2 {
            let err = sim.send(&k.device, &request(PortChange::Activate)).await.unwrap_err();
            assert!(err.is_transient());
        }
        let ok = sim.send(&k.device, &request(PortChange::Activate)).await.unwrap();
        assert_eq!(ok.admin, AdminState::Up);
        assert_eq!(sim.calls_for(&k).len(), 3);
    }

    #[tokio::test]
    async fn test_partial_apply_changes_state() {
        let sim = SimulatedTransport::new();
        sim.seed(key(), PortConfig::default());
        sim.inject(key(), Fault::partial_apply(Operation::SetVlan));

        let k = key();
        let vlan = VlanId::new(30).unwrap();
        let err = sim.send(&k.device, &request(PortChange::SetVlan(vlan))).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(sim.port(&k).and_then(|c| c.vlan), Some(vlan));
    }

    #[tokio::test]
    async fn test_verify_drift_once() {
        let sim = SimulatedTransport::new();
        sim.seed(key(), PortConfig::default());
        let lie = PortConfig::new(AdminState::Up);
        sim.inject(key(), Fault::verify_drift(lie));

        let k = key();
        assert_eq!(sim.fetch(&k.device, &k.port, "").await.unwrap(), lie);
        assert_eq!(sim.fetch(&k.device, &k.port, "").await.unwrap(), PortConfig::default());
    }

    #[tokio::test]
    async fn test_drift_after_first_read() {
        let sim = SimulatedTransport::new();
        sim.seed(key(), PortConfig::default());
        let lie = PortConfig::new(AdminState::Up);
        sim.inject(key(), Fault::verify_drift(lie).after(1));

        let k = key();
        assert_eq!(sim.fetch(&k.device, &k.port, "").await.unwrap(), PortConfig::default());
        assert_eq!(sim.fetch(&k.device, &k.port, "").await.unwrap(), lie);
        assert_eq!(sim.fetch(&k.device, &k.port, "").await.unwrap(), PortConfig::default());
    }

    #[tokio::test]
    async fn test_unknown_port_rejected() {
        let sim = SimulatedTransport::new();
        let k = key();
        let err = sim.fetch(&k.device, &k.port, "").await.unwrap_err();
        assert!(matches!(err, DriverError::Rejected { .. }));
    }
}
