//! Single-step port changes.

use portctl_types::{AdminState, Operation, PortConfig, PortMode, VlanId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One mutating driver step against a single port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "arg", rename_all = "snake_case")]
pub enum PortChange {
    Activate,
    Deactivate,
    SetVlan(VlanId),
    SetMode(PortMode),
    /// Restore a full snapshot in one step.
    Rollback(PortConfig),
}

impl PortChange {
    pub fn operation(&self) -> Operation {
        match self {
            PortChange::Activate => Operation::Activate,
            PortChange::Deactivate => Operation::Deactivate,
            PortChange::SetVlan(_) => Operation::SetVlan,
            PortChange::SetMode(_) => Operation::SetMode,
            PortChange::Rollback(_) => Operation::Rollback,
        }
    }

    /// The admin-state step that reaches `admin`.
    pub fn for_admin(admin: AdminState) -> Self {
        match admin {
            AdminState::Up => PortChange::Activate,
            AdminState::Down => PortChange::Deactivate,
        }
    }

    /// The configuration a device ends up with after applying this step.
    ///
    /// A routed port carries no VLAN, so switching to routed clears it.
    pub fn apply_to(&self, current: PortConfig) -> PortConfig {
        match *self {
            PortChange::Activate => PortConfig {
                admin: AdminState::Up,
                ..current
            },
            PortChange::Deactivate => PortConfig {
                admin: AdminState::Down,
                ..current
            },
            PortChange::SetVlan(vlan) => PortConfig {
                vlan: Some(vlan),
                ..current
            },
            PortChange::SetMode(mode) => PortConfig {
                mode: Some(mode),
                vlan: if mode.carries_vlan() { current.vlan } else { None },
                ..current
            },
            PortChange::Rollback(snapshot) => snapshot,
        }
    }
}

impl fmt::Display for PortChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortChange::Activate | PortChange::Deactivate => write!(f, "{}", self.operation()),
            PortChange::SetVlan(vlan) => write!(f, "set_vlan({})", vlan),
            PortChange::SetMode(mode) => write!(f, "set_mode({})", mode),
            PortChange::Rollback(snapshot) => write!(f, "rollback({})", snapshot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_apply_to() {
        let base = PortConfig::new(AdminState::Down)
            .with_vlan(VlanId::new(10).unwrap())
            .with_mode(PortMode::Access);

        assert!(PortChange::Activate.apply_to(base).admin.is_up());
        assert_eq!(
            PortChange::SetVlan(VlanId::new(20).unwrap()).apply_to(base).vlan,
            Some(VlanId::new(20).unwrap())
        );

        let routed = PortChange::SetMode(PortMode::Routed).apply_to(base);
        assert_eq!(routed.mode, Some(PortMode::Routed));
        assert_eq!(routed.vlan, None);

        let restored = PortChange::Rollback(base).apply_to(routed);
        assert_eq!(restored, base);
    }

    #[test]
    fn test_display() {
        assert_eq!(PortChange::Activate.to_string(), "activate");
        assert_eq!(
            PortChange::SetVlan(VlanId::new(5).unwrap()).to_string(),
            "set_vlan(5)"
        );
    }
}
