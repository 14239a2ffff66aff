//! Bulk request files.
//!
//! A request file names the submitting actor and a list of intent templates.
//! Each template fans out over a hostname range and a port range:
//!
//! ```yaml
//! actor: alice
//! policy: fail_fast
//! intents:
//!   - devices: leaf[101-104]
//!     ports: "[1-4]"
//!     state: up
//!     vlan: 10
//!     mode: access
//!   - devices: spine1
//!     ports: Ethernet8, Ethernet12
//!     state: down
//! ```
//!
//! Numeric ports stay bare (`"4"`) and are completed with the device's port
//! prefix during validation.

use crate::error::ConfigError;
use crate::model::{ActivationRequest, BatchPolicy, Channel, PortChangeIntent};
use portctl_types::{expand_hostname_range, parse_port_range, AdminState, DeviceId, PortId, PortMode, VlanId};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

fn default_channel() -> Channel {
    Channel::Bulk
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntentTemplate {
    /// A hostname or hostname range such as `leaf[101-104]`.
    pub devices: String,
    /// A port range such as `[1,3,5-8]`, or comma separated port names.
    pub ports: String,
    #[serde(alias = "admin")]
    pub state: AdminState,
    #[serde(default)]
    pub vlan: Option<VlanId>,
    #[serde(default)]
    pub mode: Option<PortMode>,
}

impl IntentTemplate {
    fn ports(&self) -> Result<Vec<PortId>, ConfigError> {
        let looks_numeric = self
            .ports
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '[' | ']' | ',' | '-' | ' '));
        if looks_numeric {
            let numbers = parse_port_range(&self.ports)
                .map_err(|e| ConfigError::parse(format!("ports of '{}'", self.devices), e))?;
            return numbers
                .into_iter()
                .map(|n| PortId::new(n.to_string()).map_err(|e| ConfigError::parse("port", e)))
                .collect();
        }
        self.ports
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|name| PortId::new(name).map_err(|e| ConfigError::parse("port", e)))
            .collect()
    }

    /// Expands the template, devices outer and ports inner.
    pub fn expand(&self) -> Result<Vec<PortChangeIntent>, ConfigError> {
        let hostnames = expand_hostname_range(&self.devices)
            .map_err(|e| ConfigError::parse("request hostname", e))?;
        let ports = self.ports()?;
        if ports.is_empty() {
            return Err(ConfigError::invalid(format!(
                "intent for '{}' selects no ports",
                self.devices
            )));
        }

        let mut intents = Vec::with_capacity(hostnames.len() * ports.len());
        for hostname in hostnames {
            let device = DeviceId::new(&hostname).map_err(|e| ConfigError::parse("request hostname", e))?;
            for port in &ports {
                let mut intent = PortChangeIntent::new(device.clone(), port.clone(), self.state);
                intent.vlan = self.vlan;
                intent.mode = self.mode;
                intents.push(intent);
            }
        }
        Ok(intents)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestFile {
    pub actor: String,
    #[serde(default = "default_channel")]
    pub channel: Channel,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub policy: Option<BatchPolicy>,
    pub intents: Vec<IntentTemplate>,
}

impl RequestFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file = Self::from_yaml(&content)?;
        info!(
            path = %path.display(),
            actor = %file.actor,
            templates = file.intents.len(),
            "request file loaded"
        );
        Ok(file)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::parse("request file", e))
    }

    /// Builds the activation request, keeping template order.
    pub fn into_request(self) -> Result<ActivationRequest, ConfigError> {
        let mut request = ActivationRequest::new(self.actor, self.channel).with_priority(self.priority);
        if let Some(policy) = self.policy {
            request = request.with_policy(policy);
        }
        for template in &self.intents {
            let intents = template.expand()?;
            debug!(devices = %template.devices, ports = %template.ports, count = intents.len(), "template expanded");
            request = request.with_intents(intents);
        }
        Ok(request)
    }
}
