//! Per-job runner.
//!
//! A runner does the device work for one job: capability check, port
//! lease, snapshot, dispatch, verify, retry and compensation. The lease is
//! renewed in the background for as long as the runner holds it, and no
//! change is sent once it is gone. A runner never writes job state; each
//! step is reported to the actor, and the returned [`Directive`] decides
//! whether the runner carries on.

use super::{Command, Directive, Handle, JobUpdate, PortGuard};
use crate::compensation::Compensator;
use crate::dispatcher::{CallContext, Dispatcher};
use crate::error::ActivationError;
use crate::model::{ActivationJob, CanonicalIntent, JobId};
use crate::state::JobState;
use portctl_driver::{DriverError, DriverKind};
use portctl_orch_common::{LeaseError, LeaseTable, RetryPolicy};
use portctl_types::{Operation, PortConfig, PortKey};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Shared by every runner of one engine.
pub(crate) struct RunnerContext {
    pub handle: Handle,
    pub leases: Arc<LeaseTable<PortKey, JobId>>,
    pub dispatcher: Arc<Dispatcher>,
    pub compensator: Compensator,
    pub retry: RetryPolicy,
    pub lease_timeout: Duration,
}

/// Where a runner picks the job up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Entry {
    /// Queued, possibly with attempts already made.
    Fresh,
    /// Recovered while backing off between attempts.
    Retry,
    /// Recovered mid-dispatch; the device decides what happened.
    Reconcile,
    /// Recovered while rolling back.
    Compensate,
}

#[derive(Debug, Clone)]
pub(crate) struct Seed {
    call: CallContext,
    intent: CanonicalIntent,
    state: JobState,
    attempts: u32,
    snapshot: Option<PortConfig>,
    entry: Entry,
}

impl Seed {
    pub(crate) fn from_job(job: &ActivationJob, entry: Entry) -> Self {
        Self {
            call: CallContext::new(job.id, job.batch, job.actor.clone(), job.key().clone()),
            intent: job.intent.clone(),
            state: job.state,
            attempts: job.attempts,
            snapshot: job.snapshot,
            entry,
        }
    }
}

/// Why an attempt ended early.
enum Interrupt {
    Error(ActivationError),
    Compensate,
    Stopped,
}

impl From<ActivationError> for Interrupt {
    fn from(error: ActivationError) -> Self {
        Interrupt::Error(error)
    }
}

impl From<DriverError> for Interrupt {
    fn from(error: DriverError) -> Self {
        Interrupt::Error(error.into())
    }
}

struct Runner {
    ctx: Arc<RunnerContext>,
    call: CallContext,
    intent: CanonicalIntent,
    attempts: u32,
    snapshot: Option<PortConfig>,
    observed: Option<PortConfig>,
    kind: Option<DriverKind>,
    lease: Option<PortGuard>,
}

#[instrument(skip_all, fields(job = %seed.call.job, port = %seed.call.key, entry = ?seed.entry))]
pub(crate) async fn run(ctx: Arc<RunnerContext>, seed: Seed) {
    let mut runner = Runner {
        ctx,
        call: seed.call,
        intent: seed.intent,
        attempts: seed.attempts,
        snapshot: seed.snapshot,
        observed: None,
        kind: None,
        lease: None,
    };
    match seed.entry {
        Entry::Fresh => runner.fresh().await,
        Entry::Retry => runner.resume_retry().await,
        Entry::Reconcile => runner.reconcile(seed.state).await,
        Entry::Compensate => runner.compensate().await,
    }
    debug!("runner finished");
}

impl Runner {
    /// Reports `path` with `update`. Any lease the runner holds rides along
    /// so the actor can release it when the job ends.
    async fn report(&mut self, path: &[JobState], mut update: JobUpdate) -> Directive {
        update.lease = self.lease.as_ref().map(|guard| guard.lease().clone());
        let job = self.call.job;
        let path = path.to_vec();
        self.ctx
            .handle
            .call(|reply| Command::Report {
                job,
                path,
                update,
                reply,
            })
            .await
            .unwrap_or(Directive::Stop)
    }

    async fn step(&mut self, path: &[JobState], update: JobUpdate) -> Result<(), Interrupt> {
        match self.report(path, update).await {
            Directive::Continue => Ok(()),
            Directive::Compensate => Err(Interrupt::Compensate),
            Directive::Stop => Err(Interrupt::Stopped),
        }
    }

    async fn fresh(&mut self) {
        if let Err(error) = self.check_capabilities() {
            warn!(error = %error, "endpoint cannot carry out the change");
            self.report(&[JobState::Failed], JobUpdate::failure(error)).await;
            return;
        }
        if self.acquire_or_fail().await {
            self.attempt_loop().await;
        }
    }

    async fn resume_retry(&mut self) {
        let delay = self.ctx.retry.backoff(self.attempts.max(1));
        if self.requeue(delay).await && self.acquire_or_fail().await {
            self.attempt_loop().await;
        }
    }

    fn check_capabilities(&mut self) -> Result<(), ActivationError> {
        let device = &self.call.key.device;
        let driver = self
            .ctx
            .dispatcher
            .driver(device)
            .ok_or_else(|| ActivationError::system(format!("no driver for {}", device)))?;
        self.kind = Some(driver.kind());

        let missing: Vec<&str> = self
            .intent
            .required_operations()
            .into_iter()
            .filter(|op| !driver.supports(*op))
            .map(|op: Operation| op.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ActivationError::permanent(format!(
                "{} endpoint {} does not support {}",
                driver.kind(),
                device,
                missing.join(", ")
            )))
        }
    }

    async fn acquire(&mut self) -> Result<(), LeaseError> {
        if self.lease.is_some() {
            return Ok(());
        }
        let lease = self
            .ctx
            .leases
            .acquire(&self.call.key, &self.call.job, self.ctx.lease_timeout)
            .await?;
        debug!(token = lease.token, "port lease acquired");
        self.lease = Some(self.ctx.leases.keep_alive(lease));
        Ok(())
    }

    /// Fails unless the runner still holds the port lease.
    fn hold(&mut self) -> Result<(), ActivationError> {
        if self.lease.as_ref().is_some_and(PortGuard::is_held) {
            return Ok(());
        }
        self.lease = None;
        warn!("port lease lost");
        Err(ActivationError::contention(&self.call.key, "port lease lost"))
    }

    /// Takes the lease for a queued job. Returns false if the job is done.
    async fn acquire_or_fail(&mut self) -> bool {
        match self.acquire().await {
            Ok(()) => true,
            Err(LeaseError::NotReserved { .. }) => {
                debug!("reservation withdrawn");
                false
            }
            Err(e) => {
                warn!(error = %e, "port lease not acquired");
                let error = ActivationError::contention(&self.call.key, e.to_string());
                self.report(&[JobState::Failed], JobUpdate::failure(error)).await;
                false
            }
        }
    }

    async fn attempt_loop(&mut self) {
        loop {
            self.attempts += 1;
            let mut applied = false;
            let interrupt = match self.attempt(&mut applied).await {
                Ok(()) => return,
                Err(interrupt) => interrupt,
            };
            match interrupt {
                Interrupt::Stopped => return,
                Interrupt::Compensate => return self.compensate().await,
                Interrupt::Error(error) => {
                    if !self.handle_failure(error, applied).await {
                        return;
                    }
                }
            }
        }
    }

    /// One pass of snapshot, dispatch, apply and verify.
    async fn attempt(&mut self, applied: &mut bool) -> Result<(), Interrupt> {
        self.hold()?;
        let current = self.ctx.dispatcher.verify(&self.call).await?;
        if self.snapshot.is_none() {
            self.snapshot = Some(current);
        }

        self.step(
            &[JobState::Dispatching],
            JobUpdate {
                attempts: Some(self.attempts),
                snapshot: self.snapshot,
                driver: self.kind,
                ..JobUpdate::default()
            },
        )
        .await?;

        let mut cursor = current;
        for change in self.intent.plan(&current) {
            self.hold()?;
            cursor = self.ctx.dispatcher.apply(&self.call, change, Some(cursor)).await?;
            *applied = true;
        }
        self.step(&[JobState::Applied], JobUpdate::observed(cursor)).await?;

        let observed = self.ctx.dispatcher.verify(&self.call).await?;
        self.observed = Some(observed);
        if !self.intent.satisfied_by(&observed) {
            return Err(ActivationError::permanent(format!(
                "verification mismatch: expected {}, observed {}",
                self.intent, observed
            ))
            .into());
        }
        info!(attempts = self.attempts, "port change verified");
        match self
            .report(&[JobState::Verified, JobState::Completed], JobUpdate::observed(observed))
            .await
        {
            Directive::Compensate => Err(Interrupt::Compensate),
            _ => Ok(()),
        }
    }

    /// Retries, compensates or fails the job. Returns true to try again.
    async fn handle_failure(&mut self, error: ActivationError, applied: bool) -> bool {
        let update = JobUpdate {
            attempts: Some(self.attempts),
            error: Some(error.clone()),
            observed: self.observed,
            ..JobUpdate::default()
        };

        if error.is_retryable() && self.ctx.retry.should_retry(self.attempts) {
            let delay = self.ctx.retry.backoff(self.attempts);
            warn!(attempts = self.attempts, error = %error, ?delay, "attempt failed, retrying");
            return match self.report(&[JobState::Failed, JobState::Retrying], update).await {
                Directive::Continue => self.requeue(delay).await,
                Directive::Compensate => {
                    self.compensate().await;
                    false
                }
                Directive::Stop => false,
            };
        }

        warn!(attempts = self.attempts, error = %error, "job failed");
        if applied || self.drifted().await {
            let update = JobUpdate {
                observed: self.observed,
                ..update
            };
            if self
                .report(&[JobState::Failed, JobState::RollingBack], update)
                .await
                == Directive::Compensate
            {
                self.compensate().await;
            }
        } else {
            self.report(&[JobState::Failed], update).await;
        }
        false
    }

    /// Backs off, then returns the job to `Queued`.
    async fn requeue(&mut self, delay: Duration) -> bool {
        tokio::time::sleep(delay).await;
        match self.report(&[JobState::Queued], JobUpdate::default()).await {
            Directive::Continue => true,
            Directive::Compensate => {
                self.compensate().await;
                false
            }
            Directive::Stop => false,
        }
    }

    /// True if the port no longer matches the snapshot. An unreadable port
    /// counts as changed.
    async fn drifted(&mut self) -> bool {
        let Some(snapshot) = self.snapshot else {
            return false;
        };
        match self.ctx.dispatcher.verify(&self.call).await {
            Ok(observed) => {
                self.observed = Some(observed);
                observed != snapshot
            }
            Err(e) => {
                warn!(error = %e, "port unreadable after failure");
                true
            }
        }
    }

    async fn compensate(&mut self) {
        let Some(snapshot) = self.snapshot else {
            info!("nothing was dispatched, nothing to restore");
            self.report(&[JobState::RolledBack], JobUpdate::default()).await;
            return;
        };
        if let Err(e) = self.acquire().await {
            let error = ActivationError::contention(&self.call.key, format!("compensation could not take the port lease: {}", e));
            self.report(&[JobState::RequiresManualIntervention], JobUpdate::failure(error))
                .await;
            return;
        }
        let lease = self.lease.as_ref();
        let held = || lease.is_some_and(PortGuard::is_held);
        let outcome = self.ctx.compensator.restore(&self.call, snapshot, &held).await;
        let update = JobUpdate {
            compensation_attempts: Some(outcome.attempts),
            ..JobUpdate::default()
        };
        match outcome.result {
            Ok(observed) => {
                self.report(
                    &[JobState::RolledBack],
                    JobUpdate {
                        observed: Some(observed),
                        ..update
                    },
                )
                .await;
            }
            Err(error) => {
                warn!(error = %error, "compensation failed, manual intervention required");
                self.report(
                    &[JobState::RequiresManualIntervention],
                    JobUpdate {
                        error: Some(error),
                        ..update
                    },
                )
                .await;
            }
        }
    }

    /// Settles a job recovered in `Dispatching`, `Applied` or `Verified`.
    async fn reconcile(&mut self, state: JobState) {
        if state == JobState::Verified {
            self.report(&[JobState::Completed], JobUpdate::default()).await;
            return;
        }
        match self.acquire().await {
            Ok(()) => {}
            Err(LeaseError::NotReserved { .. }) => return,
            Err(e) => {
                let error = ActivationError::contention(&self.call.key, e.to_string());
                self.report(&[JobState::Failed], JobUpdate::failure(error)).await;
                return;
            }
        }

        let error = match self.ctx.dispatcher.verify(&self.call).await {
            Ok(observed) if self.intent.satisfied_by(&observed) => {
                info!("interrupted change is in place");
                let path: &[JobState] = if state == JobState::Dispatching {
                    &[JobState::Applied, JobState::Verified, JobState::Completed]
                } else {
                    &[JobState::Verified, JobState::Completed]
                };
                if self.report(path, JobUpdate::observed(observed)).await == Directive::Compensate {
                    self.compensate().await;
                }
                return;
            }
            Ok(observed) => {
                self.observed = Some(observed);
                ActivationError::permanent(format!(
                    "interrupted change left {}, expected {}",
                    observed, self.intent
                ))
            }
            Err(e) => e.into(),
        };
        warn!(error = %error, "interrupted change not in place, rolling back");
        let update = JobUpdate {
            error: Some(error),
            observed: self.observed,
            ..JobUpdate::default()
        };
        if self
            .report(&[JobState::Failed, JobState::RollingBack], update)
            .await
            == Directive::Compensate
        {
            self.compensate().await;
        }
    }
}
