//! Execution dispatcher.
//!
//! Issues driver calls under a global and a per-device concurrency cap and
//! audits every call with the configuration before and after. Deadlines
//! and circuit breaking live in the driver itself
//! ([`portctl_driver::SwitchDriver`]).

use crate::audit::{AuditCategory, AuditLog, AuditOutcome, AuditRecord};
use crate::config::EngineConfig;
use crate::inventory::Inventory;
use crate::model::{BatchId, JobId};
use dashmap::DashMap;
use portctl_driver::{DeviceTransport, DriverError, DriverResult, PortChange, PortDriver, SwitchDriver};
use portctl_types::{DeviceId, Operation, PortConfig, PortKey};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument};

/// Identity a driver call is made and audited under.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub job: JobId,
    pub batch: BatchId,
    pub actor: String,
    pub key: PortKey,
    pub category: AuditCategory,
}

impl CallContext {
    pub fn new(job: JobId, batch: BatchId, actor: impl Into<String>, key: PortKey) -> Self {
        Self {
            job,
            batch,
            actor: actor.into(),
            key,
            category: AuditCategory::DriverCall,
        }
    }

    /// The same identity, audited as compensation.
    pub fn for_compensation(&self) -> Self {
        Self {
            category: AuditCategory::Compensation,
            ..self.clone()
        }
    }
}

pub struct Dispatcher {
    drivers: HashMap<DeviceId, Arc<dyn PortDriver>>,
    global: Arc<Semaphore>,
    per_device: DashMap<DeviceId, Arc<Semaphore>>,
    per_device_limit: usize,
    audit: Arc<AuditLog>,
}

impl Dispatcher {
    /// Creates a dispatcher with no drivers.
    pub fn new(config: &EngineConfig, audit: Arc<AuditLog>) -> Self {
        Self {
            drivers: HashMap::new(),
            global: Arc::new(Semaphore::new(config.dispatch.global_concurrency)),
            per_device: DashMap::new(),
            per_device_limit: config.dispatch.per_device_concurrency,
            audit,
        }
    }

    /// Creates a dispatcher with one [`SwitchDriver`] per inventory device.
    pub fn for_inventory(
        config: &EngineConfig,
        inventory: &Inventory,
        transport: Arc<dyn DeviceTransport>,
        audit: Arc<AuditLog>,
    ) -> Self {
        let mut dispatcher = Self::new(config, audit);
        for entry in inventory.devices() {
            let driver = SwitchDriver::new(entry.endpoint.clone(), transport.clone())
                .with_deadline(config.call_deadline());
            dispatcher = dispatcher.with_driver(Arc::new(driver));
        }
        dispatcher
    }

    pub fn with_driver(mut self, driver: Arc<dyn PortDriver>) -> Self {
        self.drivers.insert(driver.device().clone(), driver);
        self
    }

    pub fn driver(&self, device: &DeviceId) -> Option<Arc<dyn PortDriver>> {
        self.drivers.get(device).cloned()
    }

    /// Free permits of the global cap.
    pub fn available_permits(&self) -> usize {
        self.global.available_permits()
    }

    async fn admit(&self, device: &DeviceId, operation: Operation) -> DriverResult<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
        let closed = || DriverError::transient(device, operation, "dispatcher shut down");
        let device_sem = self
            .per_device
            .entry(device.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_device_limit)))
            .clone();
        // Device first, so a call waiting on a busy device holds no global permit.
        let device_permit = device_sem.acquire_owned().await.map_err(|_| closed())?;
        let global_permit = self.global.clone().acquire_owned().await.map_err(|_| closed())?;
        Ok((device_permit, global_permit))
    }

    fn lookup(&self, ctx: &CallContext, operation: Operation) -> DriverResult<Arc<dyn PortDriver>> {
        self.driver(&ctx.key.device)
            .ok_or_else(|| DriverError::rejected(&ctx.key.device, operation, "no driver for device"))
    }

    /// Applies one change to the context's port.
    #[instrument(skip(self, ctx, before), fields(job = %ctx.job, port = %ctx.key))]
    pub async fn apply(&self, ctx: &CallContext, change: PortChange, before: Option<PortConfig>) -> DriverResult<PortConfig> {
        let operation = change.operation();
        let driver = self.lookup(ctx, operation)?;
        let result = {
            let _permits = self.admit(&ctx.key.device, operation).await?;
            driver.apply(&ctx.key.port, &change).await
        };
        debug!(%change, ok = result.is_ok(), "driver call finished");
        self.record(ctx, &change.to_string(), before, &result);
        result
    }

    /// Reads the context's port.
    #[instrument(skip(self, ctx), fields(job = %ctx.job, port = %ctx.key))]
    pub async fn verify(&self, ctx: &CallContext) -> DriverResult<PortConfig> {
        let driver = self.lookup(ctx, Operation::Verify)?;
        let result = {
            let _permits = self.admit(&ctx.key.device, Operation::Verify).await?;
            driver.verify(&ctx.key.port).await
        };
        self.record(ctx, Operation::Verify.as_str(), None, &result);
        result
    }

    fn record(&self, ctx: &CallContext, action: &str, before: Option<PortConfig>, result: &DriverResult<PortConfig>) {
        let record = AuditRecord::new(ctx.category, "dispatcher", action)
            .with_actor(ctx.actor.clone())
            .with_batch(ctx.batch)
            .with_job(ctx.job)
            .with_port(&ctx.key)
            .with_before(before);
        let record = match result {
            Ok(after) => record
                .with_after(Some(*after))
                .with_outcome(AuditOutcome::Success),
            Err(e) => record
                .with_error(e.to_string())
                .with_details(serde_json::json!({ "transient": e.is_transient() })),
        };
        self.audit.append(record);
    }
}
