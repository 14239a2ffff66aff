//! The port driver capability interface and its switch implementation.

use crate::{DeviceRequest, DeviceTransport, DriverError, DriverKind, DriverResult, PortChange, SwitchEndpoint};
use async_trait::async_trait;
use portctl_types::{DeviceId, Operation, PortConfig, PortId, PortMode, VlanId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Uniform operations on the ports of one switch.
///
/// Every mutating call returns the configuration the device reports after
/// the change. Failures are typed; see [`DriverError::is_transient`].
#[async_trait]
pub trait PortDriver: Send + Sync {
    fn device(&self) -> &DeviceId;

    fn kind(&self) -> DriverKind;

    fn supports(&self, operation: Operation) -> bool;

    async fn activate(&self, port: &PortId) -> DriverResult<PortConfig>;

    async fn deactivate(&self, port: &PortId) -> DriverResult<PortConfig>;

    async fn set_vlan(&self, port: &PortId, vlan: VlanId) -> DriverResult<PortConfig>;

    async fn set_mode(&self, port: &PortId, mode: PortMode) -> DriverResult<PortConfig>;

    async fn verify(&self, port: &PortId) -> DriverResult<PortConfig>;

    async fn rollback(&self, port: &PortId, snapshot: &PortConfig) -> DriverResult<PortConfig>;

    /// Applies one change through the matching operation.
    async fn apply(&self, port: &PortId, change: &PortChange) -> DriverResult<PortConfig> {
        match *change {
            PortChange::Activate => self.activate(port).await,
            PortChange::Deactivate => self.deactivate(port).await,
            PortChange::SetVlan(vlan) => self.set_vlan(port, vlan).await,
            PortChange::SetMode(mode) => self.set_mode(port, mode).await,
            PortChange::Rollback(snapshot) => self.rollback(port, &snapshot).await,
        }
    }
}

/// Driver for one [`SwitchEndpoint`] over a [`DeviceTransport`].
pub struct SwitchDriver {
    endpoint: Arc<SwitchEndpoint>,
    transport: Arc<dyn DeviceTransport>,
    deadline: Duration,
}

impl SwitchDriver {
    pub fn new(endpoint: Arc<SwitchEndpoint>, transport: Arc<dyn DeviceTransport>) -> Self {
        Self {
            endpoint,
            transport,
            deadline: Duration::from_secs(5),
        }
    }

    /// Sets the per-call deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn endpoint(&self) -> &SwitchEndpoint {
        &self.endpoint
    }

    fn admit(&self, operation: Operation) -> DriverResult<()> {
        if !self.endpoint.capabilities.supports(operation) {
            return Err(DriverError::unsupported(&self.endpoint.device, operation));
        }
        if !self.endpoint.breaker().allow() {
            return Err(DriverError::CircuitOpen {
                device: self.endpoint.device.clone(),
            });
        }
        Ok(())
    }

    fn settle(&self, result: &DriverResult<PortConfig>) {
        match result {
            Err(e) if e.trips_breaker() => self.endpoint.breaker().record_failure(),
            _ => self.endpoint.breaker().record_success(),
        }
    }

    async fn with_deadline_of<F>(&self, operation: Operation, call: F) -> DriverResult<PortConfig>
    where
        F: std::future::Future<Output = DriverResult<PortConfig>> + Send,
    {
        match tokio::time::timeout(self.deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout {
                device: self.endpoint.device.clone(),
                operation,
                after: self.deadline,
            }),
        }
    }

    #[instrument(skip(self), fields(device = %self.endpoint.device, kind = %self.endpoint.kind))]
    async fn send(&self, port: &PortId, change: PortChange) -> DriverResult<PortConfig> {
        let operation = change.operation();
        let payload = self
            .endpoint
            .kind
            .render(port, &change)
            .ok_or_else(|| DriverError::unsupported(&self.endpoint.device, operation))?;
        self.admit(operation)?;

        let request = DeviceRequest {
            kind: self.endpoint.kind,
            port: port.clone(),
            change,
            payload,
        };
        debug!(payload = %request.payload, "sending request");
        let result = self
            .with_deadline_of(operation, self.transport.send(&self.endpoint.device, &request))
            .await;
        self.settle(&result);
        result
    }
}

#[async_trait]
impl PortDriver for SwitchDriver {
    fn device(&self) -> &DeviceId {
        &self.endpoint.device
    }

    fn kind(&self) -> DriverKind {
        self.endpoint.kind
    }

    fn supports(&self, operation: Operation) -> bool {
        self.endpoint.capabilities.supports(operation)
    }

    async fn activate(&self, port: &PortId) -> DriverResult<PortConfig> {
        self.send(port, PortChange::Activate).await
    }

    async fn deactivate(&self, port: &PortId) -> DriverResult<PortConfig> {
        self.send(port, PortChange::Deactivate).await
    }

    async fn set_vlan(&self, port: &PortId, vlan: VlanId) -> DriverResult<PortConfig> {
        self.send(port, PortChange::SetVlan(vlan)).await
    }

    async fn set_mode(&self, port: &PortId, mode: PortMode) -> DriverResult<PortConfig> {
        self.send(port, PortChange::SetMode(mode)).await
    }

    #[instrument(skip(self), fields(device = %self.endpoint.device))]
    async fn verify(&self, port: &PortId) -> DriverResult<PortConfig> {
        self.admit(Operation::Verify)?;
        let payload = self.endpoint.kind.render_read(port);
        let result = self
            .with_deadline_of(
                Operation::Verify,
                self.transport.fetch(&self.endpoint.device, port, &payload),
            )
            .await;
        self.settle(&result);
        result
    }

    async fn rollback(&self, port: &PortId, snapshot: &PortConfig) -> DriverResult<PortConfig> {
        self.send(port, PortChange::Rollback(*snapshot)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EndpointHealth, Fault, SimulatedTransport};
    use portctl_types::{AdminState, PortKey};
    use pretty_assertions::assert_eq;

    fn setup(kind: DriverKind) -> (Arc<SimulatedTransport>, SwitchDriver, PortId) {
        let device = DeviceId::new("leaf101").unwrap();
        let port = PortId::numbered("Ethernet", 1);
        let sim = Arc::new(SimulatedTransport::new());
        sim.seed(PortKey::new(device.clone(), port.clone()), PortConfig::default());
        let endpoint = Arc::new(
            SwitchEndpoint::new(device, kind, "cred").with_breaker(2, Duration::from_secs(60)),
        );
        let driver = SwitchDriver::new(endpoint, sim.clone()).with_deadline(Duration::from_millis(50));
        (sim, driver, port)
    }

    #[tokio::test]
    async fn test_apply_and_verify() {
        let (sim, driver, port) = setup(DriverKind::Netconf);
        driver.activate(&port).await.unwrap();
        let observed = driver.set_vlan(&port, VlanId::new(10).unwrap()).await.unwrap();
        assert_eq!(observed.vlan, Some(VlanId::new(10).unwrap()));
        assert_eq!(driver.verify(&port).await.unwrap(), observed);

        let calls = sim.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[1].payload.contains("<access-vlan>10</access-vlan>"));
    }

    #[tokio::test]
    async fn test_unsupported_operation_not_sent() {
        let (sim, driver, port) = setup(DriverKind::Snmp);
        let err = driver.set_mode(&port, PortMode::Trunk).await.unwrap_err();
        assert!(matches!(err, DriverError::Unsupported { operation: Operation::SetMode, .. }));
        assert_eq!(sim.call_count(), 0);
    }

    #[tokio::test]
    async fn test_deadline_is_transient_and_trips_breaker() {
        let (sim, driver, port) = setup(DriverKind::VendorApi);
        let key = PortKey::new(driver.device().clone(), port.clone());
        sim.inject(key, Fault::hang(Duration::from_secs(10)));

        for _ in 0..2 {
            let err = driver.activate(&port).await.unwrap_err();
            assert!(matches!(err, DriverError::Timeout { .. }));
            assert!(err.is_transient());
        }
        assert_eq!(driver.endpoint().health(), EndpointHealth::Unreachable);

        let calls_before = sim.call_count();
        let err = driver.activate(&port).await.unwrap_err();
        assert!(matches!(err, DriverError::CircuitOpen { .. }));
        assert_eq!(sim.call_count(), calls_before);
    }

    #[tokio::test]
    async fn test_rejection_keeps_breaker_closed() {
        let (sim, driver, port) = setup(DriverKind::Netconf);
        let key = PortKey::new(driver.device().clone(), port.clone());
        sim.inject(key, Fault::reject(Operation::SetMode));
        for _ in 0..3 {
            let err = driver.set_mode(&port, PortMode::Routed).await.unwrap_err();
            assert!(!err.is_transient());
        }
        assert_eq!(driver.endpoint().health(), EndpointHealth::Healthy);
    }

    #[tokio::test]
    async fn test_rollback_restores_snapshot() {
        let (_sim, driver, port) = setup(DriverKind::Netconf);
        let snapshot = driver.verify(&port).await.unwrap();
        driver.activate(&port).await.unwrap();
        driver.set_mode(&port, PortMode::Trunk).await.unwrap();
        let restored = driver.rollback(&port, &snapshot).await.unwrap();
        assert_eq!(restored, snapshot);
        assert_eq!(driver.verify(&port).await.unwrap().admin, AdminState::Down);
    }
}
