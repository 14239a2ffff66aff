//! Compensation manager.
//!
//! Restores a port to its pre-change snapshot. Endpoints with native
//! rollback get a single `rollback` call; others get the inverse
//! activate/deactivate/set_vlan/set_mode steps they support. Each attempt
//! starts and ends with a `verify`, and transient failures are retried with
//! the same policy as forward changes. No change is sent once the caller's
//! port lease is gone.

use crate::dispatcher::{CallContext, Dispatcher};
use crate::error::ActivationError;
use portctl_driver::{PortChange, PortDriver};
use portctl_orch_common::RetryPolicy;
use portctl_types::{Operation, PortConfig};
use std::sync::Arc;
use tracing::{info, warn};

/// Steps that take `current` to `target` without native rollback.
///
/// Returns `None` when the target cannot be expressed as forward steps,
/// i.e. it has no VLAN or mode where the current config has one.
pub fn restore_plan(current: &PortConfig, target: &PortConfig) -> Option<Vec<PortChange>> {
    let mut steps = Vec::new();
    let mut cursor = *current;
    let mut push = |step: PortChange, cursor: &mut PortConfig| {
        *cursor = step.apply_to(*cursor);
        steps.push(step);
    };

    if target.admin.is_down() && cursor.admin.is_up() {
        push(PortChange::Deactivate, &mut cursor);
    }
    if target.mode != cursor.mode {
        push(PortChange::SetMode(target.mode?), &mut cursor);
    }
    if target.vlan != cursor.vlan {
        push(PortChange::SetVlan(target.vlan?), &mut cursor);
    }
    if target.admin.is_up() && cursor.admin.is_down() {
        push(PortChange::Activate, &mut cursor);
    }
    Some(steps)
}

/// Result of a compensation run.
#[derive(Debug, Clone, PartialEq)]
pub struct CompensationOutcome {
    pub result: Result<PortConfig, ActivationError>,
    pub attempts: u32,
}

pub struct Compensator {
    dispatcher: Arc<Dispatcher>,
    retry: RetryPolicy,
}

impl Compensator {
    pub fn new(dispatcher: Arc<Dispatcher>, retry: RetryPolicy) -> Self {
        Self { dispatcher, retry }
    }

    /// Restores the context's port to `snapshot`. `held` reports whether the
    /// caller still holds the port lease and is checked before every change.
    pub async fn restore(
        &self,
        ctx: &CallContext,
        snapshot: PortConfig,
        held: &(dyn Fn() -> bool + Sync),
    ) -> CompensationOutcome {
        let ctx = ctx.for_compensation();
        let Some(driver) = self.dispatcher.driver(&ctx.key.device) else {
            return CompensationOutcome {
                result: Err(ActivationError::system(format!(
                    "no driver for {}",
                    ctx.key.device
                ))),
                attempts: 0,
            };
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.attempt(&ctx, driver.as_ref(), &snapshot, held).await {
                Ok(observed) => {
                    info!(job = %ctx.job, port = %ctx.key, attempts, "port restored to snapshot");
                    return CompensationOutcome {
                        result: Ok(observed),
                        attempts,
                    };
                }
                Err(e) if e.is_retryable() && self.retry.should_retry(attempts) => {
                    let delay = self.retry.backoff(attempts);
                    warn!(job = %ctx.job, attempts, error = %e, ?delay, "compensation attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(job = %ctx.job, port = %ctx.key, attempts, error = %e, "compensation failed");
                    return CompensationOutcome {
                        result: Err(e),
                        attempts,
                    };
                }
            }
        }
    }

    async fn attempt(
        &self,
        ctx: &CallContext,
        driver: &dyn PortDriver,
        snapshot: &PortConfig,
        held: &(dyn Fn() -> bool + Sync),
    ) -> Result<PortConfig, ActivationError> {
        let current = self.dispatcher.verify(ctx).await?;
        if current == *snapshot {
            return Ok(current);
        }
        let lost = || ActivationError::contention(&ctx.key, "port lease lost during compensation");

        if driver.supports(Operation::Rollback) {
            if !held() {
                return Err(lost());
            }
            self.dispatcher
                .apply(ctx, PortChange::Rollback(*snapshot), Some(current))
                .await?;
        } else {
            let steps = restore_plan(&current, snapshot).ok_or_else(|| {
                ActivationError::permanent(format!(
                    "no native rollback and {} cannot be restored from {} by inverse steps",
                    snapshot, current
                ))
            })?;
            if let Some(step) = steps.iter().find(|s| !driver.supports(s.operation())) {
                return Err(ActivationError::permanent(format!(
                    "no native rollback and inverse step {} is unsupported",
                    step
                )));
            }
            let mut cursor = current;
            for step in steps {
                if !held() {
                    return Err(lost());
                }
                cursor = self.dispatcher.apply(ctx, step, Some(cursor)).await?;
            }
        }

        let observed = self.dispatcher.verify(ctx).await?;
        if observed == *snapshot {
            Ok(observed)
        } else {
            Err(ActivationError::permanent(format!(
                "restore verification mismatch: expected {}, observed {}",
                snapshot, observed
            )))
        }
    }
}
