//! Port identity and configuration types.

use crate::{ParseError, VlanId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a managed switch (its hostname in the inventory).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a device identifier, trimming surrounding whitespace.
    pub fn new(id: impl AsRef<str>) -> Result<Self, ParseError> {
        let id = id.as_ref().trim();
        if id.is_empty() {
            return Err(ParseError::InvalidIdentifier("empty device id".to_string()));
        }
        Ok(DeviceId(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceId::new(s)
    }
}

/// Identifier of a physical port on a device (e.g. `Ethernet4`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(String);

impl PortId {
    /// Creates a port identifier, trimming surrounding whitespace.
    pub fn new(id: impl AsRef<str>) -> Result<Self, ParseError> {
        let id = id.as_ref().trim();
        if id.is_empty() {
            return Err(ParseError::InvalidIdentifier("empty port id".to_string()));
        }
        Ok(PortId(id.to_string()))
    }

    /// Builds a port name from a prefix and a port number (`Ethernet` + 4).
    pub fn numbered(prefix: &str, number: u32) -> Self {
        PortId(format!("{}{}", prefix, number))
    }

    /// Returns the trailing port number, if the name ends in digits.
    pub fn number(&self) -> Option<u32> {
        let digits: String = self
            .0
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        digits.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PortId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PortId::new(s)
    }
}

/// The (device, port) key that leases and ordering are scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortKey {
    pub device: DeviceId,
    pub port: PortId,
}

impl PortKey {
    pub fn new(device: DeviceId, port: PortId) -> Self {
        Self { device, port }
    }
}

impl fmt::Display for PortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.device, self.port)
    }
}

/// Administrative state of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminState {
    /// Port is administratively down (default for new ports).
    #[default]
    #[serde(alias = "disabled")]
    Down,
    /// Port is administratively up.
    #[serde(alias = "enabled")]
    Up,
}

impl AdminState {
    /// Returns true if the port is administratively up.
    pub const fn is_up(&self) -> bool {
        matches!(self, AdminState::Up)
    }

    /// Returns true if the port is administratively down.
    pub const fn is_down(&self) -> bool {
        matches!(self, AdminState::Down)
    }
}

impl fmt::Display for AdminState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminState::Up => write!(f, "up"),
            AdminState::Down => write!(f, "down"),
        }
    }
}

impl FromStr for AdminState {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "up" | "enabled" | "enable" => Ok(AdminState::Up),
            "down" | "disabled" | "disable" => Ok(AdminState::Down),
            _ => Err(ParseError::InvalidAdminState(s.to_string())),
        }
    }
}

/// Switchport mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortMode {
    /// Untagged member of a single VLAN.
    Access,
    /// Tagged member of several VLANs; the port VLAN is the native VLAN.
    Trunk,
    /// Layer-3 port; carries no VLAN membership.
    Routed,
}

impl PortMode {
    /// Returns true if a port in this mode may carry a VLAN assignment.
    pub const fn carries_vlan(&self) -> bool {
        matches!(self, PortMode::Access | PortMode::Trunk)
    }
}

impl fmt::Display for PortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PortMode::Access => "access",
            PortMode::Trunk => "trunk",
            PortMode::Routed => "routed",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for PortMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "access" => Ok(PortMode::Access),
            "trunk" => Ok(PortMode::Trunk),
            "routed" => Ok(PortMode::Routed),
            _ => Err(ParseError::InvalidPortMode(s.to_string())),
        }
    }
}

/// Observed (or snapshotted) configuration of a single port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PortConfig {
    pub admin: AdminState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<VlanId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<PortMode>,
}

impl PortConfig {
    pub fn new(admin: AdminState) -> Self {
        Self {
            admin,
            vlan: None,
            mode: None,
        }
    }

    pub fn with_vlan(mut self, vlan: VlanId) -> Self {
        self.vlan = Some(vlan);
        self
    }

    pub fn with_mode(mut self, mode: PortMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

impl fmt::Display for PortConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "admin={}", self.admin)?;
        if let Some(vlan) = self.vlan {
            write!(f, " vlan={}", vlan)?;
        }
        if let Some(mode) = self.mode {
            write!(f, " mode={}", mode)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_port_key_display() {
        let key = PortKey::new(
            DeviceId::new("leaf101").unwrap(),
            PortId::new("Ethernet4").unwrap(),
        );
        assert_eq!(key.to_string(), "leaf101|Ethernet4");
    }

    #[test]
    fn test_empty_identifiers_rejected() {
        assert!(DeviceId::new("  ").is_err());
        assert!(PortId::new("").is_err());
    }

    #[test]
    fn test_port_number() {
        assert_eq!(PortId::new("Ethernet48").unwrap().number(), Some(48));
        assert_eq!(PortId::numbered("Ethernet", 7).as_str(), "Ethernet7");
        assert_eq!(PortId::new("mgmt").unwrap().number(), None);
    }

    #[test]
    fn test_admin_state_aliases() {
        assert_eq!("enabled".parse::<AdminState>().unwrap(), AdminState::Up);
        assert_eq!("DOWN".parse::<AdminState>().unwrap(), AdminState::Down);
        let state: AdminState = serde_json::from_str("\"disabled\"").unwrap();
        assert_eq!(state, AdminState::Down);
        assert!("sideways".parse::<AdminState>().is_err());
    }

    #[test]
    fn test_port_mode() {
        assert!(PortMode::Access.carries_vlan());
        assert!(PortMode::Trunk.carries_vlan());
        assert!(!PortMode::Routed.carries_vlan());
        assert_eq!("Trunk".parse::<PortMode>().unwrap(), PortMode::Trunk);
    }

    #[test]
    fn test_port_config_display() {
        let cfg = PortConfig::new(AdminState::Up)
            .with_vlan(VlanId::new(10).unwrap())
            .with_mode(PortMode::Access);
        assert_eq!(cfg.to_string(), "admin=up vlan=10 mode=access");
        assert_eq!(PortConfig::default().to_string(), "admin=down");
    }
}
