//! Role-based authorization of port changes.
//!
//! A policy document binds actors to roles; a role grants a set of
//! operations within a scope of device groups, device ids and optionally a
//! port-number range:
//!
//! ```yaml
//! roles:
//!   leaf-operator:
//!     operations: [activate, deactivate, set_vlan]
//!     scope:
//!       groups: [leaf]
//!       ports: "[1-48]"
//!   noc-admin:
//!     operations: [activate, deactivate, set_vlan, set_mode]
//!     scope:
//!       groups: ["*"]
//! bindings:
//!   alice: [leaf-operator]
//!   noc: [noc-admin]
//! ```
//!
//! Authorization fails closed: an unknown actor, an unresolvable role or a
//! failing policy lookup all deny. Every decision is audited.

use crate::audit::{AuditCategory, AuditLog, AuditOutcome, AuditRecord};
use crate::error::{ActivationError, ConfigError};
use crate::model::CanonicalIntent;
use portctl_driver::SwitchEndpoint;
use portctl_types::{parse_port_range, DeviceId, Operation};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Matches every device group.
pub const ANY_GROUP: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("role '{role}' bound to '{actor}' is not defined")]
    UnknownRole { actor: String, role: String },

    #[error("policy store unavailable: {0}")]
    Unavailable(String),
}

/// Where a role applies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    pub groups: BTreeSet<String>,
    pub devices: BTreeSet<DeviceId>,
    /// Allowed port numbers; `None` allows every port.
    pub ports: Option<BTreeSet<u32>>,
}

impl Scope {
    pub fn covers(&self, endpoint: &SwitchEndpoint, port_number: Option<u32>) -> bool {
        let device_ok = self.devices.contains(&endpoint.device)
            || self.groups.contains(ANY_GROUP)
            || endpoint.groups.iter().any(|g| self.groups.contains(g));
        let port_ok = match &self.ports {
            None => true,
            Some(allowed) => port_number.is_some_and(|n| allowed.contains(&n)),
        };
        device_ok && port_ok
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    pub operations: BTreeSet<Operation>,
    pub scope: Scope,
}

impl Role {
    fn grants(&self, operations: &BTreeSet<Operation>) -> bool {
        operations.is_subset(&self.operations)
    }
}

/// Source of role bindings.
///
/// Lookups are synchronous and may fail; callers deny on failure.
pub trait PolicyStore: Send + Sync {
    fn roles_for(&self, actor: &str) -> Result<Vec<Role>, PolicyError>;
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScopeSpec {
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    devices: Vec<DeviceId>,
    #[serde(default)]
    ports: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RoleSpec {
    operations: Vec<Operation>,
    scope: ScopeSpec,
}

#[derive(Debug, Deserialize)]
struct PolicyDocument {
    #[serde(default)]
    roles: BTreeMap<String, RoleSpec>,
    #[serde(default)]
    bindings: BTreeMap<String, Vec<String>>,
}

/// A policy document loaded once from YAML.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicyStore {
    roles: BTreeMap<String, Role>,
    bindings: BTreeMap<String, Vec<String>>,
}

impl StaticPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let doc: PolicyDocument =
            serde_yaml::from_str(content).map_err(|e| ConfigError::parse("policy", e))?;
        let mut store = Self::new();
        for (name, spec) in doc.roles {
            let ports = spec
                .scope
                .ports
                .as_deref()
                .map(parse_port_range)
                .transpose()
                .map_err(|e| ConfigError::parse(format!("ports of role '{}'", name), e))?
                .map(|ports| ports.into_iter().collect());
            let role = Role {
                name: name.clone(),
                operations: spec.operations.into_iter().collect(),
                scope: Scope {
                    groups: spec.scope.groups.into_iter().collect(),
                    devices: spec.scope.devices.into_iter().collect(),
                    ports,
                },
            };
            store.roles.insert(name, role);
        }
        store.bindings = doc.bindings;
        Ok(store)
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.insert(role.name.clone(), role);
        self
    }

    pub fn bind(mut self, actor: impl Into<String>, role: impl Into<String>) -> Self {
        self.bindings.entry(actor.into()).or_default().push(role.into());
        self
    }
}

impl PolicyStore for StaticPolicyStore {
    fn roles_for(&self, actor: &str) -> Result<Vec<Role>, PolicyError> {
        let Some(names) = self.bindings.get(actor) else {
            return Ok(Vec::new());
        };
        names
            .iter()
            .map(|name| {
                self.roles.get(name).cloned().ok_or_else(|| PolicyError::UnknownRole {
                    actor: actor.to_string(),
                    role: name.clone(),
                })
            })
            .collect()
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow { role: String },
    Deny { reason: String },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    pub fn into_result(self) -> Result<String, ActivationError> {
        match self {
            Decision::Allow { role } => Ok(role),
            Decision::Deny { reason } => Err(ActivationError::authorization(reason)),
        }
    }
}

pub struct Authorizer {
    store: Arc<dyn PolicyStore>,
    audit: Arc<AuditLog>,
}

impl Authorizer {
    pub fn new(store: Arc<dyn PolicyStore>, audit: Arc<AuditLog>) -> Self {
        Self { store, audit }
    }

    /// Decides whether `actor` may apply `intent` on `endpoint`.
    pub fn authorize(&self, actor: &str, intent: &CanonicalIntent, endpoint: &SwitchEndpoint) -> Decision {
        let decision = self.decide(actor, intent, endpoint);
        self.record(actor, intent, &decision);
        decision
    }

    fn decide(&self, actor: &str, intent: &CanonicalIntent, endpoint: &SwitchEndpoint) -> Decision {
        let roles = match self.store.roles_for(actor) {
            Ok(roles) => roles,
            Err(e) => {
                return Decision::Deny {
                    reason: format!("policy lookup failed: {}", e),
                }
            }
        };
        if roles.is_empty() {
            return Decision::Deny {
                reason: format!("actor '{}' has no roles", actor),
            };
        }

        let needed = intent.mutating_operations();
        let port_number = intent.key.port.number();
        let granting = roles
            .iter()
            .find(|role| role.grants(&needed) && role.scope.covers(endpoint, port_number));
        match granting {
            Some(role) => Decision::Allow {
                role: role.name.clone(),
            },
            None => {
                let ops: Vec<&str> = needed.iter().map(|op| op.as_str()).collect();
                Decision::Deny {
                    reason: format!(
                        "no role of '{}' grants [{}] on {}",
                        actor,
                        ops.join(","),
                        intent.key
                    ),
                }
            }
        }
    }

    fn record(&self, actor: &str, intent: &CanonicalIntent, decision: &Decision) {
        let base = AuditRecord::new(AuditCategory::Authorization, "authorizer", "authorize")
            .with_actor(actor)
            .with_port(&intent.key);
        match decision {
            Decision::Allow { role } => {
                self.audit.append(
                    base.with_outcome(AuditOutcome::Success)
                        .with_details(serde_json::json!({ "role": role })),
                );
            }
            Decision::Deny { reason } => {
                let mut denied = base.with_error(reason.clone());
                denied.outcome = AuditOutcome::Denied;
                let stamped = self.audit.append(denied);
                crate::security_audit!(&stamped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portctl_driver::DriverKind;
    use portctl_types::{AdminState, PortId, PortKey, PortMode, VlanId};
    use pretty_assertions::assert_eq;

    const POLICY: &str = r#"
roles:
  leaf-operator:
    operations: [activate, deactivate, set_vlan]
    scope:
      groups: [leaf]
      ports: "[1-24]"
  noc-admin:
    operations: [activate, deactivate, set_vlan, set_mode]
    scope:
      groups: ["*"]
  oob-only:
    operations: [activate]
    scope:
      devices: [oob1]
bindings:
  alice: [leaf-operator]
  noc: [noc-admin]
  carol: [oob-only]
  mallory: [ghost-role]
"#;

    struct DownStore;

    impl PolicyStore for DownStore {
        fn roles_for(&self, _actor: &str) -> Result<Vec<Role>, PolicyError> {
            Err(PolicyError::Unavailable("ldap timeout".to_string()))
        }
    }

    fn leaf() -> SwitchEndpoint {
        SwitchEndpoint::new(DeviceId::new("leaf1").unwrap(), DriverKind::Netconf, "c").with_groups(["leaf"])
    }

    fn intent(device: &str, port: u32) -> CanonicalIntent {
        CanonicalIntent::new(
            PortKey::new(DeviceId::new(device).unwrap(), PortId::numbered("Ethernet", port)),
            AdminState::Up,
            Some(VlanId::new(10).unwrap()),
            None,
        )
    }

    fn authorizer(store: Arc<dyn PolicyStore>) -> (Authorizer, Arc<crate::audit::MemoryAuditSink>) {
        let (log, sink) = AuditLog::in_memory();
        (Authorizer::new(store, log), sink)
    }

    fn static_store() -> Arc<dyn PolicyStore> {
        Arc::new(StaticPolicyStore::from_yaml(POLICY).unwrap())
    }

    #[test]
    fn test_allow_within_scope() {
        let (authz, sink) = authorizer(static_store());
        let decision = authz.authorize("alice", &intent("leaf1", 4), &leaf());
        assert_eq!(
            decision,
            Decision::Allow {
                role: "leaf-operator".to_string()
            }
        );
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AuditOutcome::Success);
    }

    #[test]
    fn test_port_outside_scope_denied() {
        let (authz, sink) = authorizer(static_store());
        let decision = authz.authorize("alice", &intent("leaf1", 30), &leaf());
        assert!(!decision.is_allowed());
        assert_eq!(sink.records()[0].outcome, AuditOutcome::Denied);
    }

    #[test]
    fn test_missing_operation_denied() {
        let (authz, _) = authorizer(static_store());
        let mut wants_mode = intent("leaf1", 4);
        wants_mode.desired.mode = Some(PortMode::Trunk);
        assert!(!authz.authorize("alice", &wants_mode, &leaf()).is_allowed());
        assert!(authz.authorize("noc", &wants_mode, &leaf()).is_allowed());
    }

    #[test]
    fn test_device_scope() {
        let (authz, _) = authorizer(static_store());
        let oob = SwitchEndpoint::new(DeviceId::new("oob1").unwrap(), DriverKind::Snmp, "c");
        let activate_only = CanonicalIntent::new(
            PortKey::new(DeviceId::new("oob1").unwrap(), PortId::numbered("Ethernet", 1)),
            AdminState::Up,
            None,
            None,
        );
        assert!(authz.authorize("carol", &activate_only, &oob).is_allowed());
        assert!(!authz.authorize("carol", &activate_only, &leaf()).is_allowed());
    }

    #[test]
    fn test_fail_closed() {
        let (authz, _) = authorizer(static_store());
        assert!(!authz.authorize("nobody", &intent("leaf1", 1), &leaf()).is_allowed());

        let decision = authz.authorize("mallory", &intent("leaf1", 1), &leaf());
        let err = decision.into_result().unwrap_err();
        assert!(err.to_string().contains("ghost-role"));

        let (down, _) = authorizer(Arc::new(DownStore));
        let decision = down.authorize("noc", &intent("leaf1", 1), &leaf());
        assert!(matches!(decision, Decision::Deny { reason } if reason.contains("ldap timeout")));
    }

    #[test]
    fn test_builder_store() {
        let store = StaticPolicyStore::new()
            .with_role(Role {
                name: "ops".to_string(),
                operations: Operation::ALL.into_iter().collect(),
                scope: Scope {
                    groups: BTreeSet::from([ANY_GROUP.to_string()]),
                    ..Scope::default()
                },
            })
            .bind("ops-bot", "ops");
        assert_eq!(store.roles_for("ops-bot").unwrap().len(), 1);
        assert!(store.roles_for("stranger").unwrap().is_empty());
    }
}
