//! Common types for switch port change orchestration.
//!
//! This crate provides type-safe representations of the primitives shared by
//! every portctl crate:
//!
//! - [`DeviceId`], [`PortId`], [`PortKey`]: identity of a physical port
//! - [`VlanId`]: IEEE 802.1Q VLAN identifiers
//! - [`AdminState`], [`PortMode`], [`PortConfig`]: port configuration snapshot
//! - [`Operation`]: the verbs a switch driver may support
//! - [`range`]: flexible port range (`[1,3,5-10]`) and hostname range
//!   (`leaf[101-104]`) expansion

mod operation;
mod port;
pub mod range;
mod vlan;

pub use operation::Operation;
pub use port::{AdminState, DeviceId, PortConfig, PortId, PortKey, PortMode};
pub use range::{expand_hostname_range, parse_port_range};
pub use vlan::VlanId;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid VLAN ID: {0} (must be 1-4094)")]
    InvalidVlanId(u16),

    #[error("invalid admin state: {0}")]
    InvalidAdminState(String),

    #[error("invalid port mode: {0}")]
    InvalidPortMode(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("invalid range {input}: {reason}")]
    InvalidRange { input: String, reason: String },
}

impl ParseError {
    pub(crate) fn range(input: impl Into<String>, reason: impl Into<String>) -> Self {
        ParseError::InvalidRange {
            input: input.into(),
            reason: reason.into(),
        }
    }
}
