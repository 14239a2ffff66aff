//! Access VLAN identifier.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An 802.1Q VLAN a port can be placed in, 1 through 4094.
///
/// Request and inventory files carry VLANs as plain integers; serde goes
/// through [`VlanId::new`], so an out-of-range value fails to load.
///
/// ```
/// use portctl_types::VlanId;
///
/// assert_eq!(VlanId::new(210).unwrap().as_u16(), 210);
/// assert!(VlanId::new(4095).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct VlanId(u16);

impl VlanId {
    pub const MIN: u16 = 1;
    pub const MAX: u16 = 4094;

    pub const fn new(id: u16) -> Result<Self, ParseError> {
        if id >= Self::MIN && id <= Self::MAX {
            Ok(VlanId(id))
        } else {
            Err(ParseError::InvalidVlanId(id))
        }
    }

    pub const fn as_u16(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u16> for VlanId {
    type Error = ParseError;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        VlanId::new(id)
    }
}

impl From<VlanId> for u16 {
    fn from(vlan: VlanId) -> u16 {
        vlan.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_range_bounds() {
        assert_eq!(VlanId::new(VlanId::MIN).unwrap().as_u16(), 1);
        assert_eq!(VlanId::new(VlanId::MAX).unwrap().as_u16(), 4094);
        assert_eq!(VlanId::new(0), Err(ParseError::InvalidVlanId(0)));
        assert_eq!(VlanId::new(4095), Err(ParseError::InvalidVlanId(4095)));
    }

    #[test]
    fn test_serde_rejects_out_of_range() {
        let ok: VlanId = serde_json::from_str("10").unwrap();
        assert_eq!(ok.as_u16(), 10);
        assert_eq!(serde_json::to_string(&ok).unwrap(), "10");
        assert!(serde_json::from_str::<VlanId>("4095").is_err());
    }
}
