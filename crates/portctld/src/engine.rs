//! The engine facade.
//!
//! [`Engine`] wires validator, authorizer, dispatcher, compensator and the
//! orchestrator actor together and exposes the inbound interface: submit,
//! query, cancel, wait, resolve and recover.

use crate::audit::{AuditCategory, AuditLog, AuditOutcome, AuditRecord, AuditSink};
use crate::authorizer::{Authorizer, Decision, PolicyStore};
use crate::compensation::Compensator;
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{ActivationError, EngineError, Rejection};
use crate::inventory::Inventory;
use crate::model::{ActivationJob, ActivationRequest, BatchId, BatchPolicy, JobId};
use crate::orchestrator::{
    Admitted, BatchView, CancelReport, Command, Handle, Orchestrator, RecoveryReport, RunnerContext, SubmitReceipt,
    COMMAND_BUFFER,
};
use crate::store::{JobStore, MemoryStore};
use crate::validator::Validator;
use portctl_driver::{DeviceTransport, EndpointHealth};
use portctl_orch_common::LeaseTable;
use portctl_types::{AdminState, DeviceId, PortId, PortMode, VlanId};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// Outcome of checking one intent without dispatching it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PlanDecision {
    Allow { role: String },
    Deny { reason: String },
    Invalid { reason: String },
}

impl fmt::Display for PlanDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanDecision::Allow { role } => write!(f, "allow ({})", role),
            PlanDecision::Deny { reason } => write!(f, "deny: {}", reason),
            PlanDecision::Invalid { reason } => write!(f, "invalid: {}", reason),
        }
    }
}

/// One row of a dry-run plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanRow {
    pub index: usize,
    pub device: DeviceId,
    /// Canonical port name when the intent is valid.
    pub port: PortId,
    pub admin: AdminState,
    pub vlan: Option<VlanId>,
    pub mode: Option<PortMode>,
    pub decision: PlanDecision,
}

pub struct EngineBuilder {
    config: EngineConfig,
    inventory: Inventory,
    policy: Arc<dyn PolicyStore>,
    transport: Arc<dyn DeviceTransport>,
    sinks: Vec<Arc<dyn AuditSink>>,
    store: Option<Arc<dyn JobStore>>,
}

impl EngineBuilder {
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Persists jobs in `store`. Defaults to a private [`MemoryStore`].
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validates the configuration and starts the orchestrator.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(self) -> Result<Engine, EngineError> {
        let config = self.config;
        config.validate()?;

        let inventory = Arc::new(self.inventory);
        let audit = Arc::new(AuditLog::new(self.sinks));
        let validator = Validator::new(&config, inventory.clone())?;
        let authorizer = Authorizer::new(self.policy, audit.clone());
        let dispatcher = Arc::new(Dispatcher::for_inventory(
            &config,
            &inventory,
            self.transport,
            audit.clone(),
        ));

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = Handle::new(tx);
        let ctx = Arc::new(RunnerContext {
            handle: handle.clone(),
            leases: Arc::new(LeaseTable::new(config.lease_ttl())),
            dispatcher: dispatcher.clone(),
            compensator: Compensator::new(dispatcher, config.retry_policy()),
            retry: config.retry_policy(),
            lease_timeout: config.lease_timeout(),
        });
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let task = tokio::spawn(Orchestrator::new(rx, ctx, store, audit.clone()).run());

        audit.append(
            AuditRecord::new(AuditCategory::SystemLifecycle, "engine", "start")
                .with_outcome(AuditOutcome::Success)
                .with_details(json!({
                    "context": inventory.context(),
                    "devices": inventory.len(),
                    "ports": inventory.port_count(),
                    "global_concurrency": config.dispatch.global_concurrency,
                    "per_device_concurrency": config.dispatch.per_device_concurrency,
                })),
        );
        info!(
            context = inventory.context(),
            devices = inventory.len(),
            "engine started"
        );

        Ok(Engine {
            handle,
            task: Some(task),
            validator,
            authorizer,
            inventory,
            audit,
            default_policy: config.batch.default_policy,
        })
    }
}

pub struct Engine {
    handle: Handle,
    task: Option<JoinHandle<()>>,
    validator: Validator,
    authorizer: Authorizer,
    inventory: Arc<Inventory>,
    audit: Arc<AuditLog>,
    default_policy: BatchPolicy,
}

impl Engine {
    pub fn builder(
        config: EngineConfig,
        inventory: Inventory,
        policy: Arc<dyn PolicyStore>,
        transport: Arc<dyn DeviceTransport>,
    ) -> EngineBuilder {
        EngineBuilder {
            config,
            inventory,
            policy,
            transport,
            sinks: Vec::new(),
            store: None,
        }
    }

    /// Validates and authorizes every intent, then creates one job per
    /// intent.
    ///
    /// A request is admitted whole or not at all: if any intent is invalid
    /// or denied, no job is created and every refusal is returned. Nothing
    /// is admitted once an audit sink write has failed.
    #[instrument(skip(self, request), fields(actor = %request.actor, intents = request.intents.len()))]
    pub async fn submit(&self, request: ActivationRequest) -> Result<SubmitReceipt, EngineError> {
        if let Err(e) = self.audit.check() {
            warn!(error = %e, "refusing request while the audit trail is incomplete");
            return Err(e.into());
        }
        let intents = match self.validator.validate_request(&request) {
            Ok(intents) => intents,
            Err(rejections) => return Err(self.reject(&request, rejections)),
        };

        let mut denied = Vec::new();
        for (index, intent) in intents.iter().enumerate() {
            let Some(entry) = self.inventory.device(&intent.key.device) else {
                continue;
            };
            if let Decision::Deny { reason } = self.authorizer.authorize(&request.actor, intent, &entry.endpoint) {
                denied.push(Rejection {
                    index,
                    error: ActivationError::authorization(reason),
                });
            }
        }
        if !denied.is_empty() {
            return Err(self.reject(&request, denied));
        }

        let admitted = Admitted {
            policy: request.policy.unwrap_or(self.default_policy),
            actor: request.actor,
            channel: request.channel,
            priority: request.priority,
            created_at: request.created_at,
            intents,
        };
        self.handle
            .call(|reply| Command::Submit { admitted, reply })
            .await?
    }

    fn reject(&self, request: &ActivationRequest, rejections: Vec<Rejection>) -> EngineError {
        let kinds: Vec<&str> = rejections.iter().map(|r| r.error.kind()).collect();
        let error = EngineError::Rejected(rejections);
        warn!(error = %error, "request rejected");
        self.audit.append(
            AuditRecord::new(AuditCategory::Intake, "engine", "submit")
                .with_actor(request.actor.clone())
                .with_error(error.to_string())
                .with_details(json!({
                    "channel": request.channel.to_string(),
                    "intents": request.intents.len(),
                    "refused": kinds,
                })),
        );
        error
    }

    /// Current aggregate and per-job state of a batch.
    pub async fn batch(&self, id: BatchId) -> Result<BatchView, EngineError> {
        self.handle
            .call(|reply| Command::Batch { id, reply })
            .await?
            .ok_or(EngineError::UnknownBatch(id))
    }

    pub async fn job(&self, id: JobId) -> Result<ActivationJob, EngineError> {
        self.handle
            .call(|reply| Command::Job { id, reply })
            .await?
            .ok_or(EngineError::UnknownJob(id))
    }

    /// Aborts the batch's undispatched jobs and marks in-flight ones for
    /// compensation.
    pub async fn cancel(&self, id: BatchId, actor: &str) -> Result<CancelReport, EngineError> {
        let actor = actor.to_string();
        self.handle
            .call(|reply| Command::Cancel { id, actor, reply })
            .await?
    }

    /// Waits until every job of the batch is terminal.
    pub async fn wait(&self, id: BatchId) -> Result<BatchView, EngineError> {
        self.handle.call(|reply| Command::Wait { id, reply }).await?
    }

    /// Records an operator's resolution of a job that requires manual
    /// intervention. The job stays terminal.
    pub async fn resolve(&self, id: JobId, operator: &str, note: &str) -> Result<ActivationJob, EngineError> {
        let operator = operator.to_string();
        let note = note.to_string();
        self.handle
            .call(|reply| Command::Resolve {
                id,
                operator,
                note,
                reply,
            })
            .await?
    }

    /// Reloads unfinished jobs from the store and resumes them.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        self.handle.call(|reply| Command::Recover { reply }).await?
    }

    /// Validates and authorizes a request without creating jobs.
    pub fn plan(&self, request: &ActivationRequest) -> Vec<PlanRow> {
        request
            .intents
            .iter()
            .enumerate()
            .map(|(index, intent)| {
                let (port, decision) = match self.validator.validate(intent) {
                    Err(e) => (
                        intent.port.clone(),
                        PlanDecision::Invalid {
                            reason: e.to_string(),
                        },
                    ),
                    Ok(canonical) => {
                        let decision = match self.inventory.device(&canonical.key.device) {
                            Some(entry) => {
                                match self.authorizer.authorize(&request.actor, &canonical, &entry.endpoint) {
                                    Decision::Allow { role } => PlanDecision::Allow { role },
                                    Decision::Deny { reason } => PlanDecision::Deny { reason },
                                }
                            }
                            None => PlanDecision::Invalid {
                                reason: format!("unknown device '{}'", canonical.key.device),
                            },
                        };
                        (canonical.key.port, decision)
                    }
                };
                PlanRow {
                    index,
                    device: intent.device.clone(),
                    port,
                    admin: intent.admin,
                    vlan: intent.vlan,
                    mode: intent.mode,
                    decision,
                }
            })
            .collect()
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// Breaker-derived health of every endpoint.
    pub fn endpoint_health(&self) -> Vec<(DeviceId, EndpointHealth)> {
        self.inventory
            .devices()
            .map(|entry| (entry.device().clone(), entry.endpoint.health()))
            .collect()
    }

    /// Stops the orchestrator and every runner. Unfinished jobs stay in the
    /// store for [`Engine::recover`].
    pub async fn shutdown(mut self) {
        let _ = self.handle.call(|reply| Command::Shutdown { reply }).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        let audit = self.audit.clone();
        match tokio::task::spawn_blocking(move || audit.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "audit flush failed"),
            Err(e) => error!(error = %e, "audit flush task failed"),
        }
        info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
