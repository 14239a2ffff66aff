//! Driver operation verbs.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An operation a switch driver can perform on a port.
///
/// The same vocabulary is used for endpoint capability sets and for RBAC
/// action grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Activate,
    Deactivate,
    SetVlan,
    SetMode,
    Verify,
    Rollback,
}

impl Operation {
    /// All operations, in declaration order.
    pub const ALL: [Operation; 6] = [
        Operation::Activate,
        Operation::Deactivate,
        Operation::SetVlan,
        Operation::SetMode,
        Operation::Verify,
        Operation::Rollback,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Operation::Activate => "activate",
            Operation::Deactivate => "deactivate",
            Operation::SetVlan => "set_vlan",
            Operation::SetMode => "set_mode",
            Operation::Verify => "verify",
            Operation::Rollback => "rollback",
        }
    }

    /// Returns true if the operation changes device state.
    pub const fn is_mutating(&self) -> bool {
        !matches!(self, Operation::Verify)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Operation::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == normalized || op.as_str().replace('_', "") == normalized)
            .ok_or_else(|| ParseError::InvalidOperation(s.to_string()))
    }
}
