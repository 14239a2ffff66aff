//! Requests, intents, jobs and batches.

use crate::error::ActivationError;
use crate::state::JobState;
use chrono::{DateTime, Utc};
use portctl_driver::{DriverKind, PortChange};
use portctl_types::{AdminState, DeviceId, Operation, PortConfig, PortId, PortKey, PortMode, VlanId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Identifies a batch (one submitted request).
    BatchId
);
uuid_id!(
    /// Identifies one job (one port change).
    JobId
);

/// Where a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Ui,
    #[default]
    Api,
    Cli,
    Bulk,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Channel::Ui => "ui",
            Channel::Api => "api",
            Channel::Cli => "cli",
            Channel::Bulk => "bulk",
        };
        f.write_str(s)
    }
}

/// How a batch reacts to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchPolicy {
    /// Keep going; the batch ends as partial success.
    #[default]
    BestEffort,
    /// Abort jobs that have not been dispatched yet.
    FailFast,
}

impl fmt::Display for BatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchPolicy::BestEffort => f.write_str("best_effort"),
            BatchPolicy::FailFast => f.write_str("fail_fast"),
        }
    }
}

/// The desired end state of one port, as submitted.
///
/// The port may be a bare number (`"4"`), which validation expands with the
/// device's port prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortChangeIntent {
    pub device: DeviceId,
    pub port: PortId,
    pub admin: AdminState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<VlanId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<PortMode>,
}

impl PortChangeIntent {
    pub fn new(device: DeviceId, port: PortId, admin: AdminState) -> Self {
        Self {
            device,
            port,
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

/// A request for one or more port changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationRequest {
    pub actor: String,
    pub channel: Channel,
    pub intents: Vec<PortChangeIntent>,
    /// Recorded for reporting. Per-port order stays first-come first-served.
    #[serde(default)]
    pub priority: u8,
    /// Overrides the configured default when set.
    #[serde(default)]
    pub policy: Option<BatchPolicy>,
    pub created_at: DateTime<Utc>,
}

impl ActivationRequest {
    pub fn new(actor: impl Into<String>, channel: Channel) -> Self {
        Self {
            actor: actor.into(),
            channel,
            intents: Vec::new(),
            priority: 0,
            policy: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_intent(mut self, intent: PortChangeIntent) -> Self {
        self.intents.push(intent);
        self
    }

    pub fn with_intents(mut self, intents: impl IntoIterator<Item = PortChangeIntent>) -> Self {
        self.intents.extend(intents);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_policy(mut self, policy: BatchPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// A validated intent against a canonical port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    pub admin: AdminState,
    pub vlan: Option<VlanId>,
    pub mode: Option<PortMode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalIntent {
    pub key: PortKey,
    pub desired: DesiredState,
}

impl CanonicalIntent {
    pub fn new(key: PortKey, admin: AdminState, vlan: Option<VlanId>, mode: Option<PortMode>) -> Self {
        Self {
            key,
            desired: DesiredState { admin, vlan, mode },
        }
    }

    /// Fields left unset in the intent match anything.
    pub fn satisfied_by(&self, config: &PortConfig) -> bool {
        let d = &self.desired;
        config.admin == d.admin
            && d.vlan.map_or(true, |v| config.vlan == Some(v))
            && d.mode.map_or(true, |m| config.mode == Some(m))
    }

    /// Mutating operations this intent may need, plus `Verify`.
    ///
    /// Independent of the current port state, so it can be checked before
    /// a lease is taken.
    pub fn required_operations(&self) -> BTreeSet<Operation> {
        let mut ops = BTreeSet::from([Operation::Verify]);
        ops.insert(PortChange::for_admin(self.desired.admin).operation());
        if self.desired.vlan.is_some() {
            ops.insert(Operation::SetVlan);
        }
        if self.desired.mode.is_some() {
            ops.insert(Operation::SetMode);
        }
        ops
    }

    /// Mutating operations an actor must be allowed to perform.
    pub fn mutating_operations(&self) -> BTreeSet<Operation> {
        self.required_operations()
            .into_iter()
            .filter(Operation::is_mutating)
            .collect()
    }

    /// Driver steps that take `current` to the desired state.
    ///
    /// A port going down is shut before reconfiguration; a port coming up
    /// is enabled last.
    pub fn plan(&self, current: &PortConfig) -> Vec<PortChange> {
        let d = &self.desired;
        let mut steps = Vec::new();
        let mut cursor = *current;

        if d.admin.is_down() && cursor.admin.is_up() {
            steps.push(PortChange::Deactivate);
        }
        if let Some(mode) = d.mode {
            if cursor.mode != Some(mode) {
                let step = PortChange::SetMode(mode);
                cursor = step.apply_to(cursor);
                steps.push(step);
            }
        }
        if let Some(vlan) = d.vlan {
            if cursor.vlan != Some(vlan) {
                steps.push(PortChange::SetVlan(vlan));
            }
        }
        if d.admin.is_up() && cursor.admin.is_down() {
            steps.push(PortChange::Activate);
        }
        steps
    }

    /// The configuration `current` ends up with once the plan is applied.
    pub fn expected(&self, current: &PortConfig) -> PortConfig {
        self.plan(current)
            .iter()
            .fold(*current, |cfg, step| step.apply_to(cfg))
    }
}

impl fmt::Display for CanonicalIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} admin={}", self.key, self.desired.admin)?;
        if let Some(vlan) = self.desired.vlan {
            write!(f, " vlan={}", vlan)?;
        }
        if let Some(mode) = self.desired.mode {
            write!(f, " mode={}", mode)?;
        }
        Ok(())
    }
}

/// One entry of a job's state history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: Option<JobState>,
    pub to: JobState,
    pub at: DateTime<Utc>,
}

/// Operator sign-off on a job that required manual intervention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub operator: String,
    pub note: String,
    pub at: DateTime<Utc>,
}

/// One port change moving through the lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationJob {
    pub id: JobId,
    pub batch: BatchId,
    /// Global submission order, used to rebuild lease queues on recovery.
    pub order: u64,
    pub intent: CanonicalIntent,
    pub actor: String,
    pub priority: u8,
    pub state: JobState,
    pub attempts: u32,
    pub compensation_attempts: u32,
    pub last_error: Option<ActivationError>,
    pub driver: Option<DriverKind>,
    /// Port configuration read before the first dispatch.
    pub snapshot: Option<PortConfig>,
    /// Latest configuration reported by the device.
    pub observed: Option<PortConfig>,
    pub cancel_requested: bool,
    pub resolution: Option<Resolution>,
    pub transitions: Vec<Transition>,
}

impl ActivationJob {
    pub fn new(batch: BatchId, order: u64, intent: CanonicalIntent, actor: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            batch,
            order,
            intent,
            actor: actor.into(),
            priority: 0,
            state: JobState::Received,
            attempts: 0,
            compensation_attempts: 0,
            last_error: None,
            driver: None,
            snapshot: None,
            observed: None,
            cancel_requested: false,
            resolution: None,
            transitions: vec![Transition {
                from: None,
                to: JobState::Received,
                at: Utc::now(),
            }],
        }
    }

    pub fn key(&self) -> &PortKey {
        &self.intent.key
    }

    /// Records a transition. The caller checks the edge is legal.
    pub(crate) fn advance(&mut self, to: JobState) -> JobState {
        let from = self.state;
        self.state = to;
        self.transitions.push(Transition {
            from: Some(from),
            to,
            at: Utc::now(),
        });
        from
    }
}

/// A submitted request and the jobs it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub actor: String,
    pub channel: Channel,
    pub priority: u8,
    pub policy: BatchPolicy,
    pub created_at: DateTime<Utc>,
    pub jobs: Vec<JobId>,
    pub cancel_requested: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key() -> PortKey {
        PortKey::new(DeviceId::new("leaf1").unwrap(), PortId::numbered("Ethernet", 4))
    }

    fn vlan(id: u16) -> VlanId {
        VlanId::new(id).unwrap()
    }

    #[test]
    fn test_plan_bring_up() {
        let intent = CanonicalIntent::new(key(), AdminState::Up, Some(vlan(10)), Some(PortMode::Access));
        let steps = intent.plan(&PortConfig::default());
        assert_eq!(
            steps,
            vec![
                PortChange::SetMode(PortMode::Access),
                PortChange::SetVlan(vlan(10)),
                PortChange::Activate,
            ]
        );
        let expected = intent.expected(&PortConfig::default());
        assert!(intent.satisfied_by(&expected));
    }

    #[test]
    fn test_plan_shut_down_first() {
        let current = PortConfig::new(AdminState::Up).with_vlan(vlan(10));
        let intent = CanonicalIntent::new(key(), AdminState::Down, Some(vlan(20)), None);
        assert_eq!(
            intent.plan(&current),
            vec![PortChange::Deactivate, PortChange::SetVlan(vlan(20))]
        );
    }

    #[test]
    fn test_plan_empty_when_satisfied() {
        let current = PortConfig::new(AdminState::Up)
            .with_vlan(vlan(10))
            .with_mode(PortMode::Access);
        let intent = CanonicalIntent::new(key(), AdminState::Up, Some(vlan(10)), None);
        assert!(intent.satisfied_by(&current));
        assert!(intent.plan(&current).is_empty());
    }

    #[test]
    fn test_required_operations() {
        let intent = CanonicalIntent::new(key(), AdminState::Up, Some(vlan(10)), None);
        let ops: Vec<_> = intent.required_operations().into_iter().collect();
        assert_eq!(ops, vec![Operation::Activate, Operation::SetVlan, Operation::Verify]);
        assert!(!intent.mutating_operations().contains(&Operation::Verify));
    }

    #[test]
    fn test_job_advance_records_history() {
        let intent = CanonicalIntent::new(key(), AdminState::Up, None, None);
        let mut job = ActivationJob::new(BatchId::new(), 0, intent, "alice");
        assert_eq!(job.advance(JobState::Validated), JobState::Received);
        assert_eq!(job.state, JobState::Validated);
        assert_eq!(job.transitions.len(), 2);
        assert_eq!(job.transitions[1].from, Some(JobState::Received));
    }
}
