//! Workflow orchestrator.
//!
//! One actor task owns every job and batch and is the only place job state
//! changes. A runner task per job does the device work and hands each state
//! change back to the actor as a [`Command::Report`]; the actor answers with
//! a [`Directive`]. The actor also issues the port lease reservations, in
//! submission order, so jobs on the same port are served FIFO.

mod actor;
mod runner;

pub(crate) use actor::Orchestrator;
pub(crate) use runner::RunnerContext;

use crate::error::{ActivationError, EngineError};
use crate::model::{ActivationJob, BatchId, BatchPolicy, CanonicalIntent, Channel, JobId};
use crate::state::{BatchStatus, JobState};
use chrono::{DateTime, Utc};
use portctl_driver::DriverKind;
use portctl_orch_common::{Lease, LeaseGuard};
use portctl_types::{PortConfig, PortKey};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

pub(crate) type PortLease = Lease<PortKey, JobId>;
pub(crate) type PortGuard = LeaseGuard<PortKey, JobId>;

/// Depth of the command queue between the API, the runners and the actor.
pub(crate) const COMMAND_BUFFER: usize = 1024;

/// A validated and authorized request, ready to become a batch.
#[derive(Debug)]
pub(crate) struct Admitted {
    pub actor: String,
    pub channel: Channel,
    pub priority: u8,
    pub policy: BatchPolicy,
    pub created_at: DateTime<Utc>,
    pub intents: Vec<CanonicalIntent>,
}

/// Returned by [`crate::Engine::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub batch: BatchId,
    /// One job per intent, in request order.
    pub jobs: Vec<JobId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: JobId,
    pub key: PortKey,
    pub state: JobState,
    pub attempts: u32,
    pub last_error: Option<ActivationError>,
}

impl From<&ActivationJob> for JobSummary {
    fn from(job: &ActivationJob) -> Self {
        Self {
            id: job.id,
            key: job.key().clone(),
            state: job.state,
            attempts: job.attempts,
            last_error: job.last_error.clone(),
        }
    }
}

/// Aggregate and per-job state of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchView {
    pub id: BatchId,
    pub actor: String,
    pub policy: BatchPolicy,
    pub status: BatchStatus,
    pub cancel_requested: bool,
    pub jobs: Vec<JobSummary>,
}

impl BatchView {
    /// Number of jobs resting in `state`.
    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }

    /// True once every job is terminal.
    pub fn is_settled(&self) -> bool {
        self.jobs.iter().all(|j| j.state.is_terminal())
    }

    pub fn job(&self, id: JobId) -> Option<&JobSummary> {
        self.jobs.iter().find(|j| j.id == id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CancelReport {
    /// Jobs that had not been dispatched and are now `Aborted`.
    pub aborted: usize,
    /// In-flight jobs marked for compensation once their call returns.
    pub marked: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RecoveryReport {
    pub batches: usize,
    pub jobs: usize,
    pub requeued: usize,
    pub reconciling: usize,
    pub retrying: usize,
    pub compensating: usize,
}

impl RecoveryReport {
    /// Jobs handed back to runners.
    pub fn resumed(&self) -> usize {
        self.requeued + self.reconciling + self.retrying + self.compensating
    }
}

/// Facts a runner reports alongside a state path.
#[derive(Debug, Default)]
pub(crate) struct JobUpdate {
    pub attempts: Option<u32>,
    pub compensation_attempts: Option<u32>,
    pub error: Option<ActivationError>,
    pub driver: Option<DriverKind>,
    pub snapshot: Option<PortConfig>,
    pub observed: Option<PortConfig>,
    pub lease: Option<PortLease>,
}

impl JobUpdate {
    pub(crate) fn failure(error: ActivationError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub(crate) fn observed(config: PortConfig) -> Self {
        Self {
            observed: Some(config),
            ..Self::default()
        }
    }
}

/// The actor's answer to a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Directive {
    Continue,
    /// The job is now `RollingBack`; restore the snapshot.
    Compensate,
    Stop,
}

pub(crate) enum Command {
    Submit {
        admitted: Admitted,
        reply: oneshot::Sender<Result<SubmitReceipt, EngineError>>,
    },
    Report {
        job: JobId,
        path: Vec<JobState>,
        update: JobUpdate,
        reply: oneshot::Sender<Directive>,
    },
    Batch {
        id: BatchId,
        reply: oneshot::Sender<Option<BatchView>>,
    },
    Job {
        id: JobId,
        reply: oneshot::Sender<Option<ActivationJob>>,
    },
    Cancel {
        id: BatchId,
        actor: String,
        reply: oneshot::Sender<Result<CancelReport, EngineError>>,
    },
    Wait {
        id: BatchId,
        reply: oneshot::Sender<Result<BatchView, EngineError>>,
    },
    Resolve {
        id: JobId,
        operator: String,
        note: String,
        reply: oneshot::Sender<Result<ActivationJob, EngineError>>,
    },
    Recover {
        reply: oneshot::Sender<Result<RecoveryReport, EngineError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Sending side of the actor's command queue.
#[derive(Debug, Clone)]
pub(crate) struct Handle {
    tx: mpsc::Sender<Command>,
}

impl Handle {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    /// Sends a command and waits for its reply.
    pub(crate) async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }
}
