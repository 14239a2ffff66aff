//! Operation capability sets advertised by endpoints.

use portctl_types::Operation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The set of operations an endpoint supports.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Operation>);

impl CapabilitySet {
    /// Every operation.
    pub fn all() -> Self {
        Operation::ALL.into_iter().collect()
    }

    pub fn supports(&self, operation: Operation) -> bool {
        self.0.contains(&operation)
    }

    /// Operations from `needed` that this set lacks, in order.
    pub fn missing(&self, needed: impl IntoIterator<Item = Operation>) -> Vec<Operation> {
        needed.into_iter().filter(|op| !self.supports(*op)).collect()
    }

    pub fn without(mut self, operation: Operation) -> Self {
        self.0.remove(&operation);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = Operation> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Operation> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Operation>>(iter: I) -> Self {
        CapabilitySet(iter.into_iter().collect())
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(|op| op.as_str()).collect();
        write!(f, "[{}]", names.join(","))
    }
}
