//! Transport seam between drivers and devices.

use crate::{DriverKind, DriverResult, PortChange};
use async_trait::async_trait;
use portctl_types::{DeviceId, PortConfig, PortId};

/// A rendered request for one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    pub kind: DriverKind,
    pub port: PortId,
    pub change: PortChange,
    /// Protocol payload produced by [`DriverKind::render`].
    pub payload: String,
}

/// Carries rendered requests to devices.
///
/// Implementations own sessions and credentials. A real deployment plugs in
/// NETCONF/SNMP/HTTP clients here; the simulation plugs in an in-memory
/// fleet.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Sends a mutating request and returns the configuration the device
    /// reports afterwards.
    async fn send(&self, device: &DeviceId, request: &DeviceRequest) -> DriverResult<PortConfig>;

    /// Reads the current configuration of a port.
    async fn fetch(&self, device: &DeviceId, port: &PortId, payload: &str) -> DriverResult<PortConfig>;
}
