//! Managed switch endpoints.

use crate::{BreakerState, CapabilitySet, CircuitBreaker, DriverKind};
use portctl_types::DeviceId;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Reachability of an endpoint, derived from its breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointHealth {
    Healthy,
    Degraded,
    Unreachable,
}

impl fmt::Display for EndpointHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointHealth::Healthy => "healthy",
            EndpointHealth::Degraded => "degraded",
            EndpointHealth::Unreachable => "unreachable",
        };
        f.write_str(s)
    }
}

/// A switch the engine may change, with its protocol and breaker.
#[derive(Debug)]
pub struct SwitchEndpoint {
    pub device: DeviceId,
    pub kind: DriverKind,
    /// Name of the credential in the external secret store.
    pub credential_ref: String,
    pub capabilities: CapabilitySet,
    /// Device groups used by RBAC scopes.
    pub groups: Vec<String>,
    breaker: CircuitBreaker,
}

impl SwitchEndpoint {
    /// Creates an endpoint with its kind's default capabilities.
    pub fn new(device: DeviceId, kind: DriverKind, credential_ref: impl Into<String>) -> Self {
        Self {
            device,
            kind,
            credential_ref: credential_ref.into(),
            capabilities: kind.default_capabilities(),
            groups: Vec::new(),
            breaker: CircuitBreaker::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.breaker = CircuitBreaker::new(threshold, cooldown);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }

    pub fn health(&self) -> EndpointHealth {
        let snap = self.breaker.snapshot();
        match snap.state {
            BreakerState::Open => EndpointHealth::Unreachable,
            BreakerState::HalfOpen => EndpointHealth::Degraded,
            BreakerState::Closed if snap.consecutive_failures > 0 => EndpointHealth::Degraded,
            BreakerState::Closed => EndpointHealth::Healthy,
        }
    }
}
