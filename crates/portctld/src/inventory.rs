//! Managed switch inventory.
//!
//! An inventory file is a YAML mapping from fabric context (site) to the
//! devices of that context:
//!
//! ```yaml
//! nj01:
//!   devices:
//!     - hostname: "leaf[101-104]"
//!       driver: netconf
//!       credential: netconf-admin
//!       groups: [leaf, pod1]
//!       port_prefix: Ethernet
//!       ports: "[1-48]"
//!     - hostname: oob-sw01
//!       driver: snmp
//!       credential: snmp-rw
//!       ports: "[1-24]"
//!       capabilities: [activate, deactivate, set_vlan, verify]
//! ```

use crate::config::BreakerConfig;
use crate::error::ConfigError;
use portctl_driver::{CapabilitySet, DriverKind, SwitchEndpoint};
use portctl_types::{expand_hostname_range, parse_port_range, DeviceId, PortId, PortKey};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeviceSpec {
    hostname: String,
    driver: DriverKind,
    credential: String,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default = "default_port_prefix")]
    port_prefix: String,
    ports: String,
    #[serde(default)]
    capabilities: Option<CapabilitySet>,
}

fn default_port_prefix() -> String {
    "Ethernet".to_string()
}

#[derive(Debug, Deserialize)]
struct ContextSpec {
    #[serde(default)]
    devices: Vec<DeviceSpec>,
}

/// One managed device and its ports.
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub endpoint: Arc<SwitchEndpoint>,
    pub port_prefix: String,
    pub ports: BTreeSet<PortId>,
}

impl DeviceEntry {
    pub fn new(endpoint: SwitchEndpoint, port_prefix: impl Into<String>, numbers: impl IntoIterator<Item = u32>) -> Self {
        let port_prefix = port_prefix.into();
        let ports = numbers
            .into_iter()
            .map(|n| PortId::numbered(&port_prefix, n))
            .collect();
        Self {
            endpoint: Arc::new(endpoint),
            port_prefix,
            ports,
        }
    }

    pub fn device(&self) -> &DeviceId {
        &self.endpoint.device
    }

    /// Resolves a port name or bare number to a port of this device.
    pub fn canonical_port(&self, port: &PortId) -> Option<PortId> {
        let candidate = if port.as_str().chars().all(|c| c.is_ascii_digit()) {
            let n = port.as_str().parse().ok()?;
            PortId::numbered(&self.port_prefix, n)
        } else {
            port.clone()
        };
        self.ports.contains(&candidate).then_some(candidate)
    }
}

/// The devices of one fabric context.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    context: String,
    devices: BTreeMap<DeviceId, DeviceEntry>,
}

impl Inventory {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            devices: BTreeMap::new(),
        }
    }

    /// Adds a device. Fails if the hostname is already present.
    pub fn insert(&mut self, entry: DeviceEntry) -> Result<(), ConfigError> {
        let id = entry.device().clone();
        if self.devices.contains_key(&id) {
            return Err(ConfigError::invalid(format!(
                "duplicate hostname '{}' in context '{}'",
                id, self.context
            )));
        }
        self.devices.insert(id, entry);
        Ok(())
    }

    pub fn with_device(mut self, entry: DeviceEntry) -> Result<Self, ConfigError> {
        self.insert(entry)?;
        Ok(self)
    }

    /// Loads the devices of `context` from an inventory file.
    pub fn load(path: impl AsRef<Path>, context: &str, breaker: &BreakerConfig) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let inventory = Self::from_yaml(&content, context, breaker)?;
        info!(
            path = %path.display(),
            context,
            devices = inventory.len(),
            ports = inventory.port_count(),
            "inventory loaded"
        );
        Ok(inventory)
    }

    pub fn from_yaml(content: &str, context: &str, breaker: &BreakerConfig) -> Result<Self, ConfigError> {
        let root: serde_yaml::Value =
            serde_yaml::from_str(content).map_err(|e| ConfigError::parse("inventory", e))?;
        let section = root.get(context).ok_or_else(|| ConfigError::MissingContext {
            context: context.to_string(),
            what: "inventory".to_string(),
        })?;
        if !section.is_mapping() {
            return Err(ConfigError::invalid(format!(
                "inventory context '{}' must be a mapping",
                context
            )));
        }
        let spec: ContextSpec = serde_yaml::from_value(section.clone())
            .map_err(|e| ConfigError::parse(format!("inventory context '{}'", context), e))?;

        let cooldown = Duration::from_millis(breaker.cooldown_ms);
        let mut inventory = Self::new(context);
        for device in spec.devices {
            let hostnames = expand_hostname_range(&device.hostname)
                .map_err(|e| ConfigError::parse("inventory hostname", e))?;
            let numbers = parse_port_range(&device.ports)
                .map_err(|e| ConfigError::parse(format!("ports of '{}'", device.hostname), e))?;

            for hostname in hostnames {
                let id = DeviceId::new(&hostname).map_err(|e| ConfigError::parse("inventory hostname", e))?;
                let mut endpoint = SwitchEndpoint::new(id, device.driver, device.credential.clone())
                    .with_groups(device.groups.iter().cloned())
                    .with_breaker(breaker.failure_threshold, cooldown);
                if let Some(caps) = &device.capabilities {
                    endpoint = endpoint.with_capabilities(caps.clone());
                }
                inventory.insert(DeviceEntry::new(endpoint, device.port_prefix.clone(), numbers.iter().copied()))?;
            }
        }
        Ok(inventory)
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn device(&self, id: &DeviceId) -> Option<&DeviceEntry> {
        self.devices.get(id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceEntry> {
        self.devices.values()
    }

    /// Every port of every device, in device then port order.
    pub fn port_keys(&self) -> impl Iterator<Item = PortKey> + '_ {
        self.devices.values().flat_map(|entry| {
            entry
                .ports
                .iter()
                .map(move |port| PortKey::new(entry.device().clone(), port.clone()))
        })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn port_count(&self) -> usize {
        self.devices.values().map(|d| d.ports.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portctl_types::Operation;
    use pretty_assertions::assert_eq;

    const INVENTORY: &str = r#"
nj01:
  devices:
    - hostname: "leaf[101-102]"
      driver: netconf
      credential: netconf-admin
      groups: [leaf, pod1]
      ports: "[1-4]"
    - hostname: oob-sw01
      driver: snmp
      credential: snmp-rw
      port_prefix: ge-0/0/
      ports: "[1,2]"
sf02:
  devices: []
broken: "not a mapping"
"#;

    fn load(context: &str) -> Result<Inventory, ConfigError> {
        Inventory::from_yaml(INVENTORY, context, &BreakerConfig::default())
    }

    #[test]
    fn test_load_context() {
        let inv = load("nj01").unwrap();
        assert_eq!(inv.len(), 3);
        assert_eq!(inv.port_count(), 10);

        let leaf = inv.device(&DeviceId::new("leaf101").unwrap()).unwrap();
        assert_eq!(leaf.endpoint.kind, DriverKind::Netconf);
        assert!(leaf.endpoint.in_group("pod1"));
        assert_eq!(leaf.ports.len(), 4);

        let oob = inv.device(&DeviceId::new("oob-sw01").unwrap()).unwrap();
        assert!(!oob.endpoint.capabilities.supports(Operation::SetMode));
        assert!(oob.ports.contains(&PortId::new("ge-0/0/2").unwrap()));
    }

    #[test]
    fn test_missing_context() {
        let err = load("tx03").unwrap_err();
        assert!(matches!(err, ConfigError::MissingContext { .. }));
    }

    #[test]
    fn test_context_not_mapping() {
        assert!(matches!(load("broken").unwrap_err(), ConfigError::Invalid(_)));
    }

    #[test]
    fn test_empty_context() {
        assert!(load("sf02").unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_hostname_rejected() {
        let yaml = r#"
nj01:
  devices:
    - hostname: "leaf[101-102]"
      driver: netconf
      credential: c
      ports: "1"
    - hostname: leaf102
      driver: snmp
      credential: c
      ports: "1"
"#;
        let err = Inventory::from_yaml(yaml, "nj01", &BreakerConfig::default()).unwrap_err();
        assert!(err.to_string().contains("duplicate hostname 'leaf102'"));
    }

    #[test]
    fn test_canonical_port() {
        let inv = load("nj01").unwrap();
        let leaf = inv.device(&DeviceId::new("leaf102").unwrap()).unwrap();
        assert_eq!(
            leaf.canonical_port(&PortId::new("3").unwrap()),
            Some(PortId::new("Ethernet3").unwrap())
        );
        assert_eq!(
            leaf.canonical_port(&PortId::new("Ethernet4").unwrap()),
            Some(PortId::new("Ethernet4").unwrap())
        );
        assert_eq!(leaf.canonical_port(&PortId::new("Ethernet9").unwrap()), None);
        assert_eq!(leaf.canonical_port(&PortId::new("99").unwrap()), None);
    }

    #[test]
    fn test_capability_override() {
        let yaml = r#"
lab:
  devices:
    - hostname: sw1
      driver: vendor_api
      credential: api
      ports: "1"
      capabilities: [activate, deactivate, verify]
"#;
        let inv = Inventory::from_yaml(yaml, "lab", &BreakerConfig::default()).unwrap();
        let sw = inv.device(&DeviceId::new("sw1").unwrap()).unwrap();
        assert!(!sw.endpoint.capabilities.supports(Operation::Rollback));
        assert!(sw.endpoint.capabilities.supports(Operation::Verify));
    }
}
