//! The orchestrator actor: sole writer of job and batch state.

use super::runner::{self, Entry, RunnerContext, Seed};
use super::{
    Admitted, BatchView, CancelReport, Command, Directive, JobSummary, JobUpdate, PortLease, RecoveryReport,
    SubmitReceipt,
};
use crate::audit::{AuditCategory, AuditLog, AuditOutcome, AuditRecord};
use crate::error::{ActivationError, EngineError};
use crate::model::{ActivationJob, Batch, BatchId, BatchPolicy, JobId, Resolution};
use crate::state::{aggregate, JobState};
use crate::store::JobStore;
use chrono::Utc;
use portctl_types::{PortConfig, PortKey};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const SOURCE: &str = "orchestrator";

type Waiter = oneshot::Sender<Result<BatchView, EngineError>>;

pub(crate) struct Orchestrator {
    rx: mpsc::Receiver<Command>,
    ctx: Arc<RunnerContext>,
    store: Arc<dyn JobStore>,
    audit: Arc<AuditLog>,
    jobs: HashMap<JobId, ActivationJob>,
    batches: HashMap<BatchId, Batch>,
    /// Leases granted to runners, released when the job ends.
    held: HashMap<JobId, PortLease>,
    /// Non-terminal queued jobs per port.
    active: HashMap<PortKey, HashSet<JobId>>,
    /// Last configuration a finished job left on each port.
    last_known: HashMap<PortKey, PortConfig>,
    waiters: HashMap<BatchId, Vec<Waiter>>,
    /// Jobs whose latest write to the store failed.
    faulted: HashMap<JobId, String>,
    runners: JoinSet<()>,
    next_order: u64,
}

impl Orchestrator {
    pub(crate) fn new(
        rx: mpsc::Receiver<Command>,
        ctx: Arc<RunnerContext>,
        store: Arc<dyn JobStore>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            rx,
            ctx,
            store,
            audit,
            jobs: HashMap::new(),
            batches: HashMap::new(),
            held: HashMap::new(),
            active: HashMap::new(),
            last_known: HashMap::new(),
            waiters: HashMap::new(),
            faulted: HashMap::new(),
            runners: JoinSet::new(),
            next_order: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("orchestrator started");
        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(joined) = self.runners.join_next(), if !self.runners.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "job runner panicked");
                        }
                    }
                }
            }
        }
        info!("orchestrator stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit { admitted, reply } => {
                let _ = reply.send(self.submit(admitted));
            }
            Command::Report {
                job,
                path,
                update,
                reply,
            } => {
                let directive = self.on_report(job, path, update);
                let _ = reply.send(directive);
            }
            Command::Batch { id, reply } => {
                let _ = reply.send(self.view(id));
            }
            Command::Job { id, reply } => {
                let _ = reply.send(self.jobs.get(&id).cloned());
            }
            Command::Cancel { id, actor, reply } => {
                let _ = reply.send(self.cancel(id, &actor));
            }
            Command::Wait { id, reply } => self.wait(id, reply),
            Command::Resolve {
                id,
                operator,
                note,
                reply,
            } => {
                let _ = reply.send(self.resolve(id, operator, note));
            }
            Command::Recover { reply } => {
                let _ = reply.send(self.recover());
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn shutdown(&mut self) {
        let in_flight = self.jobs.values().filter(|j| !j.state.is_terminal()).count();
        self.runners.abort_all();
        self.audit.append(
            AuditRecord::new(AuditCategory::SystemLifecycle, SOURCE, "shutdown")
                .with_outcome(AuditOutcome::Success)
                .with_details(json!({ "in_flight": in_flight })),
        );
        info!(in_flight, "orchestrator shutting down");
    }

    fn submit(&mut self, admitted: Admitted) -> Result<SubmitReceipt, EngineError> {
        let batch_id = BatchId::new();
        let mut jobs = Vec::with_capacity(admitted.intents.len());
        for intent in admitted.intents {
            let mut job = ActivationJob::new(batch_id, self.next_order, intent, admitted.actor.clone());
            job.priority = admitted.priority;
            self.next_order += 1;
            jobs.push(job);
        }
        let ids: Vec<JobId> = jobs.iter().map(|j| j.id).collect();
        let batch = Batch {
            id: batch_id,
            actor: admitted.actor,
            channel: admitted.channel,
            priority: admitted.priority,
            policy: admitted.policy,
            created_at: admitted.created_at,
            jobs: ids.clone(),
            cancel_requested: false,
        };
        self.store.save_batch(&batch)?;

        self.audit.append(
            AuditRecord::new(AuditCategory::Intake, SOURCE, "submit")
                .with_actor(batch.actor.clone())
                .with_batch(batch_id)
                .with_outcome(AuditOutcome::Success)
                .with_details(json!({
                    "channel": batch.channel.to_string(),
                    "priority": batch.priority,
                    "policy": batch.policy.to_string(),
                    "jobs": ids.len(),
                })),
        );
        info!(batch = %batch_id, jobs = ids.len(), actor = %batch.actor, policy = %batch.policy, "batch accepted");
        self.batches.insert(batch_id, batch);

        for job in jobs {
            let id = job.id;
            self.jobs.insert(id, job);
            self.record_transition(id, None, JobState::Received);
            self.persist(id);
        }
        for &id in &ids {
            self.admit(id);
        }
        Ok(SubmitReceipt {
            batch: batch_id,
            jobs: ids,
        })
    }

    /// Moves a received job to `Queued` (or straight to `Completed` when the
    /// port already holds the desired state) and starts its runner.
    fn admit(&mut self, id: JobId) {
        if self.jobs.get(&id).map_or(true, |j| j.state.is_terminal()) {
            return;
        }
        self.advance(id, JobState::Validated);
        self.advance(id, JobState::Authorized);

        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        let key = job.key().clone();
        let idle = self.active.get(&key).map_or(true, HashSet::is_empty);
        let known = self.last_known.get(&key).copied();
        if let Some(current) = known.filter(|c| idle && job.intent.satisfied_by(c)) {
            job.observed = Some(current);
            debug!(job = %id, port = %key, "intent already satisfied, no dispatch");
            self.advance(id, JobState::Completed);
            self.finish(id);
            return;
        }

        self.active.entry(key.clone()).or_default().insert(id);
        self.advance(id, JobState::Queued);
        if self.escalate(id) || self.refuse_unaudited(id).is_some() {
            return;
        }
        self.ctx.leases.enqueue(key, id);
        self.spawn(id, Entry::Fresh);
    }

    fn spawn(&mut self, id: JobId, entry: Entry) {
        let Some(job) = self.jobs.get(&id) else {
            return;
        };
        let seed = Seed::from_job(job, entry);
        self.runners.spawn(runner::run(self.ctx.clone(), seed));
    }

    fn on_report(&mut self, id: JobId, path: Vec<JobState>, update: JobUpdate) -> Directive {
        let Some(job) = self.jobs.get_mut(&id) else {
            if let Some(lease) = &update.lease {
                self.ctx.leases.release(lease);
            }
            return Directive::Stop;
        };
        if job.state.is_terminal() {
            // Aborted while the runner was between reports.
            if let Some(lease) = &update.lease {
                self.ctx.leases.release(lease);
            }
            return Directive::Stop;
        }

        let JobUpdate {
            attempts,
            compensation_attempts,
            error,
            driver,
            snapshot,
            observed,
            lease,
        } = update;
        if let Some(n) = attempts {
            job.attempts = n;
        }
        if let Some(n) = compensation_attempts {
            job.compensation_attempts = n;
        }
        if let Some(error) = error {
            job.last_error = Some(error);
        }
        if driver.is_some() {
            job.driver = driver;
        }
        if job.snapshot.is_none() {
            job.snapshot = snapshot;
        }
        if observed.is_some() {
            job.observed = observed;
        }
        let path = if job.cancel_requested {
            redirect_cancelled(job, path)
        } else {
            path
        };
        if let Some(lease) = lease {
            self.held.insert(id, lease);
        }

        for to in path {
            if !self.advance(id, to) {
                self.force_end(id);
                break;
            }
        }
        if self.escalate(id) {
            return Directive::Stop;
        }
        if let Some(directive) = self.refuse_unaudited(id) {
            return directive;
        }

        match self.jobs.get(&id).map(|j| j.state) {
            Some(state) if state.is_terminal() => {
                self.finish(id);
                Directive::Stop
            }
            Some(JobState::RollingBack) => Directive::Compensate,
            Some(_) => Directive::Continue,
            None => Directive::Stop,
        }
    }

    /// Ends a job whose runner reported an impossible path.
    fn force_end(&mut self, id: JobId) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        let target = [JobState::Failed, JobState::RequiresManualIntervention]
            .into_iter()
            .find(|to| job.state.can_transition_to(*to));
        if let Some(to) = target {
            job.last_error = Some(ActivationError::system(format!(
                "runner reported an impossible transition from {}",
                job.state
            )));
            self.advance(id, to);
        }
    }

    /// Checks `from -> to`, records it on the job, audits and persists it.
    fn advance(&mut self, id: JobId, to: JobState) -> bool {
        let Some(job) = self.jobs.get_mut(&id) else {
            return false;
        };
        let from = job.state;
        if !from.can_transition_to(to) {
            error!(job = %id, %from, %to, "illegal transition refused");
            self.audit.append(
                AuditRecord::new(AuditCategory::ErrorCondition, SOURCE, "illegal_transition")
                    .with_actor(job.actor.clone())
                    .with_batch(job.batch)
                    .with_job(id)
                    .with_port(job.key())
                    .with_error(format!("{} -> {}", from, to)),
            );
            return false;
        }
        job.advance(to);
        self.record_transition(id, Some(from), to);
        self.persist(id);
        true
    }

    fn record_transition(&self, id: JobId, from: Option<JobState>, to: JobState) {
        let Some(job) = self.jobs.get(&id) else {
            return;
        };
        let mut record = AuditRecord::new(AuditCategory::JobTransition, SOURCE, "transition")
            .with_actor(job.actor.clone())
            .with_batch(job.batch)
            .with_job(id)
            .with_port(job.key())
            .with_details(json!({
                "from": from.map(|s| s.as_str()),
                "to": to.as_str(),
                "attempts": job.attempts,
            }));
        if to.is_terminal() {
            record = record.with_before(job.snapshot).with_after(job.observed);
        }
        record = match (&job.last_error, to.is_failure()) {
            (Some(e), true) => record.with_error(e.to_string()),
            (None, true) => record.with_outcome(AuditOutcome::Failure),
            (_, false) if to.is_terminal() => record.with_outcome(AuditOutcome::Success),
            _ => record,
        };
        debug!(job = %id, from = ?from, %to, "job transition");
        self.audit.append(record);
    }

    fn persist(&mut self, id: JobId) {
        let Some(job) = self.jobs.get(&id) else {
            return;
        };
        if let Err(e) = self.store.save_job(job) {
            error!(job = %id, error = %e, "failed to persist job");
            self.audit.append(
                AuditRecord::new(AuditCategory::ErrorCondition, SOURCE, "persist_job")
                    .with_batch(job.batch)
                    .with_job(id)
                    .with_port(job.key())
                    .with_error(e.to_string()),
            );
            self.faulted.insert(id, e.to_string());
        }
    }

    /// Fails a job whose state could not be persisted. Returns true if the
    /// job ended.
    fn escalate(&mut self, id: JobId) -> bool {
        let Some(reason) = self.faulted.remove(&id) else {
            return false;
        };
        let Some(job) = self.jobs.get_mut(&id) else {
            return false;
        };
        if !job.state.can_transition_to(JobState::Failed) {
            warn!(job = %id, state = %job.state, "store fault while job cannot fail; continuing");
            return false;
        }
        job.last_error = Some(ActivationError::system(format!("job store unavailable: {}", reason)));
        self.advance(id, JobState::Failed);
        self.finish(id);
        true
    }

    /// Stops a job about to be dispatched once an audit write has been
    /// lost. A job whose earlier attempt may have changed the port is
    /// compensated; any other ends `Failed`.
    fn refuse_unaudited(&mut self, id: JobId) -> Option<Directive> {
        let Err(fault) = self.audit.check() else {
            return None;
        };
        let job = self.jobs.get_mut(&id)?;
        let earlier = match job.state {
            JobState::Queued => job.attempts,
            JobState::Dispatching => job.attempts.saturating_sub(1),
            _ => return None,
        };
        warn!(job = %id, error = %fault, "audit trail incomplete, job not dispatched");
        job.last_error = Some(ActivationError::system(fault.to_string()));
        let compensate = earlier > 0 && job.snapshot.is_some();
        self.advance(id, JobState::Failed);
        if compensate && self.advance(id, JobState::RollingBack) {
            return Some(Directive::Compensate);
        }
        self.finish(id);
        Some(Directive::Stop)
    }

    /// Bookkeeping once a job is terminal.
    fn finish(&mut self, id: JobId) {
        let Some(job) = self.jobs.get(&id) else {
            return;
        };
        let key = job.key().clone();
        let state = job.state;
        let batch = job.batch;
        let observed = job.observed;

        self.faulted.remove(&id);
        if let Some(lease) = self.held.remove(&id) {
            self.ctx.leases.release(&lease);
        }
        self.ctx.leases.withdraw(&key, &id);
        if let Some(set) = self.active.get_mut(&key) {
            set.remove(&id);
            if set.is_empty() {
                self.active.remove(&key);
            }
        }
        match state {
            JobState::Completed | JobState::RolledBack => {
                if let Some(config) = observed {
                    self.last_known.insert(key.clone(), config);
                }
            }
            JobState::Failed | JobState::RequiresManualIntervention => {
                self.last_known.remove(&key);
            }
            _ => {}
        }
        info!(job = %id, port = %key, %state, "job finished");

        let fail_fast = self
            .batches
            .get(&batch)
            .is_some_and(|b| b.policy == BatchPolicy::FailFast);
        if state.is_failure() && fail_fast {
            let aborted = self.abort_pending(batch, "batch failed under fail-fast policy");
            if aborted > 0 {
                warn!(batch = %batch, aborted, "fail-fast: pending jobs aborted");
            }
        }
        self.notify_if_settled(batch);
    }

    /// Aborts every job of `batch` that has not been dispatched yet.
    fn abort_pending(&mut self, batch: BatchId, reason: &str) -> usize {
        let Some(ids) = self.batches.get(&batch).map(|b| b.jobs.clone()) else {
            return 0;
        };
        let mut aborted = 0;
        for id in ids {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if !(job.state.is_pre_dispatch() && job.attempts == 0) {
                continue;
            }
            job.last_error = Some(ActivationError::cancelled(reason));
            if self.advance(id, JobState::Aborted) {
                self.finish(id);
                aborted += 1;
            }
        }
        aborted
    }

    fn is_settled(&self, batch: &Batch) -> bool {
        batch
            .jobs
            .iter()
            .all(|id| self.jobs.get(id).map_or(true, |j| j.state.is_terminal()))
    }

    fn notify_if_settled(&mut self, id: BatchId) {
        let settled = self.batches.get(&id).is_some_and(|b| self.is_settled(b));
        if !settled {
            return;
        }
        let Some(view) = self.view(id) else {
            return;
        };
        info!(batch = %id, status = %view.status, "batch settled");
        for waiter in self.waiters.remove(&id).unwrap_or_default() {
            let _ = waiter.send(Ok(view.clone()));
        }
    }

    fn view(&self, id: BatchId) -> Option<BatchView> {
        let batch = self.batches.get(&id)?;
        let jobs: Vec<JobSummary> = batch
            .jobs
            .iter()
            .filter_map(|job| self.jobs.get(job))
            .map(JobSummary::from)
            .collect();
        let states: Vec<JobState> = jobs.iter().map(|j| j.state).collect();
        Some(BatchView {
            id,
            actor: batch.actor.clone(),
            policy: batch.policy,
            status: aggregate(batch.policy, &states),
            cancel_requested: batch.cancel_requested,
            jobs,
        })
    }

    fn wait(&mut self, id: BatchId, reply: Waiter) {
        let Some(batch) = self.batches.get(&id) else {
            let _ = reply.send(Err(EngineError::UnknownBatch(id)));
            return;
        };
        if self.is_settled(batch) {
            let _ = reply.send(self.view(id).ok_or(EngineError::UnknownBatch(id)));
        } else {
            self.waiters.entry(id).or_default().push(reply);
        }
    }

    fn cancel(&mut self, id: BatchId, actor: &str) -> Result<CancelReport, EngineError> {
        let batch = self.batches.get_mut(&id).ok_or(EngineError::UnknownBatch(id))?;
        batch.cancel_requested = true;
        let ids = batch.jobs.clone();
        if let Err(e) = self.store.save_batch(batch) {
            warn!(batch = %id, error = %e, "failed to persist batch cancellation");
        }

        let mut report = CancelReport::default();
        for job_id in ids {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.state.is_terminal() {
                continue;
            }
            if job.state.is_pre_dispatch() && job.attempts == 0 {
                job.last_error = Some(ActivationError::cancelled(format!("batch cancelled by {}", actor)));
                if self.advance(job_id, JobState::Aborted) {
                    self.finish(job_id);
                    report.aborted += 1;
                }
            } else {
                job.cancel_requested = true;
                self.persist(job_id);
                report.marked += 1;
            }
        }

        self.audit.append(
            AuditRecord::new(AuditCategory::OperatorAction, SOURCE, "cancel_batch")
                .with_actor(actor)
                .with_batch(id)
                .with_outcome(AuditOutcome::Success)
                .with_details(json!({ "aborted": report.aborted, "marked": report.marked })),
        );
        info!(batch = %id, aborted = report.aborted, marked = report.marked, "batch cancellation requested");
        Ok(report)
    }

    fn resolve(&mut self, id: JobId, operator: String, note: String) -> Result<ActivationJob, EngineError> {
        let job = self.jobs.get_mut(&id).ok_or(EngineError::UnknownJob(id))?;
        if job.state != JobState::RequiresManualIntervention {
            return Err(EngineError::NotResolvable { job: id, state: job.state });
        }
        job.resolution = Some(Resolution {
            operator: operator.clone(),
            note: note.clone(),
            at: Utc::now(),
        });
        let resolved = job.clone();
        self.audit.append(
            AuditRecord::new(AuditCategory::OperatorAction, SOURCE, "resolve")
                .with_actor(operator)
                .with_batch(resolved.batch)
                .with_job(id)
                .with_port(resolved.key())
                .with_after(resolved.observed)
                .with_outcome(AuditOutcome::Success)
                .with_details(json!({ "note": note })),
        );
        self.persist(id);
        Ok(resolved)
    }

    /// Reloads persisted work and hands every unfinished job to a runner.
    fn recover(&mut self) -> Result<RecoveryReport, EngineError> {
        let batches = self.store.load_batches()?;
        let jobs = self.store.load_jobs()?;
        let mut report = RecoveryReport::default();

        for batch in batches {
            if !self.batches.contains_key(&batch.id) {
                report.batches += 1;
                self.batches.insert(batch.id, batch);
            }
        }

        for job in jobs {
            self.next_order = self.next_order.max(job.order + 1);
            if self.jobs.contains_key(&job.id) {
                continue;
            }
            let id = job.id;
            let key = job.key().clone();
            let state = job.state;
            match state {
                JobState::Completed | JobState::RolledBack => {
                    if let Some(config) = job.observed {
                        self.last_known.insert(key.clone(), config);
                    }
                }
                JobState::Failed | JobState::RequiresManualIntervention => {
                    self.last_known.remove(&key);
                }
                _ => {}
            }
            self.jobs.insert(id, job);
            report.jobs += 1;

            let entry = match state {
                JobState::Received | JobState::Validated | JobState::Authorized => {
                    for to in [JobState::Validated, JobState::Authorized, JobState::Queued] {
                        if self.jobs.get(&id).is_some_and(|j| j.state.can_transition_to(to)) {
                            self.advance(id, to);
                        }
                    }
                    report.requeued += 1;
                    Entry::Fresh
                }
                JobState::Queued => {
                    report.requeued += 1;
                    Entry::Fresh
                }
                JobState::Dispatching | JobState::Applied | JobState::Verified => {
                    report.reconciling += 1;
                    Entry::Reconcile
                }
                JobState::Retrying => {
                    report.retrying += 1;
                    Entry::Retry
                }
                JobState::RollingBack => {
                    report.compensating += 1;
                    Entry::Compensate
                }
                _ => continue,
            };
            self.active.entry(key.clone()).or_default().insert(id);
            self.ctx.leases.enqueue(key, id);
            self.spawn(id, entry);
        }

        self.audit.append(
            AuditRecord::new(AuditCategory::SystemLifecycle, SOURCE, "recover")
                .with_outcome(AuditOutcome::Success)
                .with_details(json!(report)),
        );
        info!(
            jobs = report.jobs,
            resumed = report.resumed(),
            reconciling = report.reconciling,
            "recovery complete"
        );
        Ok(report)
    }
}

/// Rewrites a runner's forward path into compensation once the batch has
/// been cancelled.
fn redirect_cancelled(job: &mut ActivationJob, path: Vec<JobState>) -> Vec<JobState> {
    use JobState::*;

    let redirected = match (job.state, path.first().copied()) {
        (Queued, Some(Dispatching)) | (Applied, Some(Verified)) => Some(vec![Failed, RollingBack]),
        (Dispatching, Some(Applied)) => Some(vec![Applied, Failed, RollingBack]),
        (Retrying, Some(Queued)) => Some(vec![RollingBack]),
        _ if path.last() == Some(&Retrying) => {
            let mut rewritten = path.clone();
            rewritten.pop();
            rewritten.push(RollingBack);
            Some(rewritten)
        }
        _ => None,
    };
    match redirected {
        Some(rewritten) => {
            job.last_error = Some(ActivationError::cancelled("batch cancelled while the job was in flight"));
            rewritten
        }
        None => path,
    }
}
