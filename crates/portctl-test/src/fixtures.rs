//! Test fixtures for engine scenarios
//!
//! A [`Fleet`] describes simulated switches; a [`Harness`] runs an engine
//! against it with an in-memory audit sink.

use portctl_driver::{DriverKind, SimulatedTransport, SwitchEndpoint};
use portctl_types::{AdminState, DeviceId, Operation, PortConfig, PortId, PortKey, PortMode, VlanId};
use portctld::audit::{AuditRecord, AuditSink, MemoryAuditSink};
use portctld::authorizer::{PolicyStore, Role, Scope, StaticPolicyStore, ANY_GROUP};
use portctld::config::EngineConfig;
use portctld::inventory::{DeviceEntry, Inventory};
use portctld::model::{ActivationJob, ActivationRequest, Channel, JobId, PortChangeIntent};
use portctld::state::JobState;
use portctld::store::JobStore;
use portctld::Engine;
use std::sync::Arc;
use std::time::Duration;

/// Actor bound to the unrestricted role in [`admin_policy`].
pub const OPERATOR: &str = "alice";

pub const PORT_PREFIX: &str = "Ethernet";

/// Installs a test subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Engine settings that keep scenarios fast: millisecond backoff without
/// jitter, short deadlines and a breaker that never opens.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 10;
    config.retry.jitter = 0.0;
    config.dispatch.call_deadline_ms = 500;
    config.breaker.failure_threshold = 10_000;
    config.lease.acquire_timeout_ms = 30_000;
    config
}

/// Simulated switches, all seeded admin down with no VLAN.
pub struct Fleet {
    pub sim: Arc<SimulatedTransport>,
    pub devices: Vec<DeviceId>,
    ports: u32,
    kind: DriverKind,
    groups: Vec<String>,
}

impl Fleet {
    /// `devices` switches named `leaf001..` with ports `Ethernet1..=ports`.
    pub fn new(devices: usize, ports: u32) -> Self {
        Self::with_sim(devices, ports, SimulatedTransport::new())
    }

    pub fn with_sim(devices: usize, ports: u32, sim: SimulatedTransport) -> Self {
        let devices: Vec<DeviceId> = (1..=devices)
            .map(|i| DeviceId::new(format!("leaf{:03}", i)).expect("fixture hostname"))
            .collect();
        let sim = Arc::new(sim);
        for device in &devices {
            sim.seed_device(
                device,
                (1..=ports).map(|n| PortId::numbered(PORT_PREFIX, n)),
                PortConfig::default(),
            );
        }
        Self {
            sim,
            devices,
            ports,
            kind: DriverKind::Netconf,
            groups: vec!["leaf".to_string()],
        }
    }

    pub fn with_kind(mut self, kind: DriverKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn device(&self, index: usize) -> &DeviceId {
        &self.devices[index]
    }

    pub fn port_count(&self) -> usize {
        self.devices.len() * self.ports as usize
    }

    /// A fresh inventory over the same switches.
    pub fn inventory(&self, config: &EngineConfig) -> Inventory {
        let cooldown = Duration::from_millis(config.breaker.cooldown_ms);
        let mut inventory = Inventory::new("lab");
        for device in &self.devices {
            let endpoint = SwitchEndpoint::new(device.clone(), self.kind, "lab-secret")
                .with_groups(self.groups.iter().cloned())
                .with_breaker(config.breaker.failure_threshold, cooldown);
            inventory
                .insert(DeviceEntry::new(endpoint, PORT_PREFIX, 1..=self.ports))
                .expect("fixture devices are unique");
        }
        inventory
    }

    /// Every (device, port) key, device-major.
    pub fn keys(&self) -> Vec<PortKey> {
        self.devices
            .iter()
            .flat_map(|d| (1..=self.ports).map(move |n| key(d, n)))
            .collect()
    }
}

pub fn key(device: &DeviceId, port: u32) -> PortKey {
    PortKey::new(device.clone(), PortId::numbered(PORT_PREFIX, port))
}

pub fn vlan(id: u16) -> VlanId {
    VlanId::new(id).expect("fixture vlan")
}

/// Admin up on an access port in `vlan_id`.
pub fn access_port(device: &DeviceId, port: u32, vlan_id: u16) -> PortChangeIntent {
    PortChangeIntent::new(device.clone(), PortId::numbered(PORT_PREFIX, port), AdminState::Up)
        .with_vlan(vlan(vlan_id))
        .with_mode(PortMode::Access)
}

pub fn bring_up(device: &DeviceId, port: u32) -> PortChangeIntent {
    PortChangeIntent::new(device.clone(), PortId::numbered(PORT_PREFIX, port), AdminState::Up)
}

/// The configuration [`access_port`] converges to.
pub fn access_config(vlan_id: u16) -> PortConfig {
    PortConfig::new(AdminState::Up)
        .with_vlan(vlan(vlan_id))
        .with_mode(PortMode::Access)
}

pub fn request(intents: impl IntoIterator<Item = PortChangeIntent>) -> ActivationRequest {
    ActivationRequest::new(OPERATOR, Channel::Api).with_intents(intents)
}

/// `alice` may do anything anywhere.
pub fn admin_role() -> Role {
    Role {
        name: "admin".to_string(),
        operations: Operation::ALL.into_iter().collect(),
        scope: Scope {
            groups: [ANY_GROUP.to_string()].into_iter().collect(),
            ..Scope::default()
        },
    }
}

pub fn admin_policy() -> StaticPolicyStore {
    StaticPolicyStore::new()
        .with_role(admin_role())
        .bind(OPERATOR, "admin")
}

/// A running engine plus the handles tests inspect.
pub struct Harness {
    pub engine: Engine,
    pub sim: Arc<SimulatedTransport>,
    pub audit: Arc<MemoryAuditSink>,
}

impl Harness {
    pub fn start(fleet: &Fleet, config: EngineConfig) -> Self {
        Self::build(fleet, config, Arc::new(admin_policy()), None, None)
    }

    pub fn with_store(fleet: &Fleet, config: EngineConfig, store: Arc<dyn JobStore>) -> Self {
        Self::build(fleet, config, Arc::new(admin_policy()), Some(store), None)
    }

    pub fn with_policy(fleet: &Fleet, config: EngineConfig, policy: Arc<dyn PolicyStore>) -> Self {
        Self::build(fleet, config, policy, None, None)
    }

    /// Adds `sink` next to the in-memory one.
    pub fn with_audit_sink(fleet: &Fleet, config: EngineConfig, sink: Arc<dyn AuditSink>) -> Self {
        Self::build(fleet, config, Arc::new(admin_policy()), None, Some(sink))
    }

    fn build(
        fleet: &Fleet,
        config: EngineConfig,
        policy: Arc<dyn PolicyStore>,
        store: Option<Arc<dyn JobStore>>,
        sink: Option<Arc<dyn AuditSink>>,
    ) -> Self {
        init_tracing();
        let audit = Arc::new(MemoryAuditSink::new());
        let inventory = fleet.inventory(&config);
        let mut builder = Engine::builder(config, inventory, policy, fleet.sim.clone())
            .with_audit_sink(audit.clone());
        if let Some(store) = store {
            builder = builder.with_store(store);
        }
        if let Some(sink) = sink {
            builder = builder.with_audit_sink(sink);
        }
        let engine = builder.start().expect("engine starts");
        Self {
            engine,
            sim: fleet.sim.clone(),
            audit,
        }
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.audit.records()
    }

    pub async fn job(&self, id: JobId) -> ActivationJob {
        self.engine.job(id).await.expect("job exists")
    }

    /// Polls until the job rests in `state`. Panics after `timeout`.
    pub async fn wait_for_state(&self, id: JobId, state: JobState, timeout: Duration) -> ActivationJob {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let job = self.job(id).await;
            if job.state == state {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {} still {} after {:?}, wanted {}",
                id,
                job.state,
                timeout,
                state
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// States a job passed through, in order.
pub fn states(job: &ActivationJob) -> Vec<JobState> {
    job.transitions.iter().map(|t| t.to).collect()
}
