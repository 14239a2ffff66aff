//! Intent validation.
//!
//! Checks every intent of a request against the inventory and the
//! configured VLAN policy, and canonicalises port names. Validation is pure:
//! it never touches devices and never creates jobs.

use crate::config::EngineConfig;
use crate::error::{ActivationError, ConfigError, Rejection};
use crate::inventory::Inventory;
use crate::model::{ActivationRequest, CanonicalIntent, PortChangeIntent};
use portctl_types::{PortKey, PortMode, VlanId};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Validator {
    inventory: Arc<Inventory>,
    vlan_min: u16,
    vlan_max: u16,
    reserved: BTreeSet<u16>,
    max_batch_size: usize,
}

impl Validator {
    pub fn new(config: &EngineConfig, inventory: Arc<Inventory>) -> Result<Self, ConfigError> {
        Ok(Self {
            inventory,
            vlan_min: config.validation.vlan_min,
            vlan_max: config.validation.vlan_max,
            reserved: config.reserved_vlans()?,
            max_batch_size: config.validation.max_batch_size,
        })
    }

    /// Validates one intent and resolves its port.
    pub fn validate(&self, intent: &PortChangeIntent) -> Result<CanonicalIntent, ActivationError> {
        let entry = self.inventory.device(&intent.device).ok_or_else(|| {
            ActivationError::validation(
                "device",
                format!(
                    "unknown device '{}' in context '{}'",
                    intent.device,
                    self.inventory.context()
                ),
            )
        })?;
        let port = entry.canonical_port(&intent.port).ok_or_else(|| {
            ActivationError::validation(
                "port",
                format!("device '{}' has no port '{}'", intent.device, intent.port),
            )
        })?;

        if let Some(vlan) = intent.vlan {
            self.check_vlan(vlan)?;
        }
        if intent.mode == Some(PortMode::Routed) && intent.vlan.is_some() {
            return Err(ActivationError::validation(
                "mode",
                "a routed port cannot carry an access VLAN",
            ));
        }

        Ok(CanonicalIntent::new(
            PortKey::new(intent.device.clone(), port),
            intent.admin,
            intent.vlan,
            intent.mode,
        ))
    }

    fn check_vlan(&self, vlan: VlanId) -> Result<(), ActivationError> {
        let id = vlan.as_u16();
        if id < self.vlan_min || id > self.vlan_max {
            return Err(ActivationError::validation(
                "vlan",
                format!("VLAN {} outside allowed range {}-{}", id, self.vlan_min, self.vlan_max),
            ));
        }
        if self.reserved.contains(&id) {
            return Err(ActivationError::validation(
                "vlan",
                format!("VLAN {} is reserved", id),
            ));
        }
        Ok(())
    }

    /// Validates every intent of a request.
    ///
    /// All failures are collected so the caller sees every bad intent at
    /// once.
    pub fn validate_request(&self, request: &ActivationRequest) -> Result<Vec<CanonicalIntent>, Vec<Rejection>> {
        if request.actor.trim().is_empty() {
            return Err(vec![Rejection {
                index: 0,
                error: ActivationError::validation("actor", "actor must not be empty"),
            }]);
        }
        if request.intents.is_empty() {
            return Err(vec![Rejection {
                index: 0,
                error: ActivationError::validation("intents", "request has no intents"),
            }]);
        }
        if request.intents.len() > self.max_batch_size {
            return Err(vec![Rejection {
                index: 0,
                error: ActivationError::validation(
                    "intents",
                    format!(
                        "batch of {} intents exceeds maximum of {}",
                        request.intents.len(),
                        self.max_batch_size
                    ),
                ),
            }]);
        }

        let mut accepted = Vec::with_capacity(request.intents.len());
        let mut rejected = Vec::new();
        for (index, intent) in request.intents.iter().enumerate() {
            match self.validate(intent) {
                Ok(canonical) => accepted.push(canonical),
                Err(error) => rejected.push(Rejection { index, error }),
            }
        }
        if rejected.is_empty() {
            Ok(accepted)
        } else {
            Err(rejected)
        }
    }
}
