//! Append-only audit log.
//!
//! Every submission, authorization decision, job transition, driver call,
//! compensation step and operator action produces one [`AuditRecord`].
//! Records are stamped by [`AuditLog::append`] with a strictly increasing
//! sequence number and a non-decreasing UTC timestamp, then handed to every
//! configured [`AuditSink`] and emitted on the `audit` tracing target.
//!
//! Records carry the acting principal, the affected port, and the port
//! configuration before and after the change where one is known, which is
//! enough to reconstruct any job's history and to derive the success
//! metrics in [`crate::metrics`].

use crate::error::AuditError;
use crate::model::{BatchId, JobId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use portctl_types::{PortConfig, PortKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use tracing::error;

/// Audit event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    /// Request intake and validation
    Intake,
    /// RBAC decisions
    Authorization,
    /// Job state changes
    JobTransition,
    /// Calls to switch drivers
    DriverCall,
    /// Compensation (rollback) steps
    Compensation,
    /// Cancellations and manual resolutions
    OperatorAction,
    /// Engine startup, recovery and shutdown
    SystemLifecycle,
    /// Infrastructure faults
    ErrorCondition,
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditCategory::Intake => write!(f, "INTAKE"),
            AuditCategory::Authorization => write!(f, "AUTHORIZATION"),
            AuditCategory::JobTransition => write!(f, "JOB_TRANSITION"),
            AuditCategory::DriverCall => write!(f, "DRIVER_CALL"),
            AuditCategory::Compensation => write!(f, "COMPENSATION"),
            AuditCategory::OperatorAction => write!(f, "OPERATOR_ACTION"),
            AuditCategory::SystemLifecycle => write!(f, "SYSTEM_LIFECYCLE"),
            AuditCategory::ErrorCondition => write!(f, "ERROR_CONDITION"),
        }
    }
}

/// Outcome of an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    InProgress,
    Denied,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => write!(f, "success"),
            AuditOutcome::Failure => write!(f, "failure"),
            AuditOutcome::InProgress => write!(f, "in_progress"),
            AuditOutcome::Denied => write!(f, "denied"),
        }
    }
}

/// One audit entry.
///
/// `seq` and `timestamp` are assigned by [`AuditLog::append`]; values set
/// before that are overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,

    pub timestamp: DateTime<Utc>,

    pub category: AuditCategory,

    /// Component that produced the record
    pub source: String,

    /// Principal the action is attributed to
    pub actor: String,

    pub action: String,

    pub outcome: AuditOutcome,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,

    /// Affected port, as `device|port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<PortConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<PortConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl AuditRecord {
    /// Creates a record attributed to the engine itself.
    pub fn new(category: AuditCategory, source: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            category,
            source: source.into(),
            actor: "system".to_string(),
            action: action.into(),
            outcome: AuditOutcome::InProgress,
            batch_id: None,
            job_id: None,
            object_id: None,
            before: None,
            after: None,
            details: None,
            error: None,
            correlation_id: None,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_batch(mut self, batch: BatchId) -> Self {
        self.batch_id = Some(batch);
        self
    }

    pub fn with_job(mut self, job: JobId) -> Self {
        self.job_id = Some(job);
        self
    }

    pub fn with_port(mut self, key: &PortKey) -> Self {
        self.object_id = Some(key.to_string());
        self
    }

    pub fn with_before(mut self, config: Option<PortConfig>) -> Self {
        self.before = config;
        self
    }

    pub fn with_after(mut self, config: Option<PortConfig>) -> Self {
        self.after = config;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Sets the error message and marks the outcome as failure.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.outcome = AuditOutcome::Failure;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Value of a string field in `details`.
    pub fn detail(&self, field: &str) -> Option<&str> {
        self.details.as_ref()?.get(field)?.as_str()
    }

    /// Convert to JSON string for logging.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|e| format!(r#"{{"error":"serialization_failed","message":"{}"}}"#, e))
    }
}

/// Emits an audit record on the `audit` tracing target.
///
/// Success is logged at info, in-progress at debug, failure and denial at
/// warn.
#[macro_export]
macro_rules! audit_log {
    ($record:expr) => {
        let record = $record;
        match record.outcome {
            $crate::audit::AuditOutcome::Success => {
                tracing::info!(
                    target: "audit",
                    seq = record.seq,
                    category = %record.category,
                    actor = %record.actor,
                    action = %record.action,
                    outcome = %record.outcome,
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
            $crate::audit::AuditOutcome::InProgress => {
                tracing::debug!(
                    target: "audit",
                    seq = record.seq,
                    category = %record.category,
                    actor = %record.actor,
                    action = %record.action,
                    outcome = %record.outcome,
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
            $crate::audit::AuditOutcome::Failure | $crate::audit::AuditOutcome::Denied => {
                tracing::warn!(
                    target: "audit",
                    seq = record.seq,
                    category = %record.category,
                    actor = %record.actor,
                    action = %record.action,
                    outcome = %record.outcome,
                    error = record.error.as_deref().unwrap_or(""),
                    audit_json = %record.to_json(),
                    "AUDIT: {} - {} - {}",
                    record.category,
                    record.action,
                    record.outcome
                );
            }
        }
    };
}

/// Emits a security-relevant record (authorization denial) on the
/// `security_audit` target.
#[macro_export]
macro_rules! security_audit {
    ($record:expr) => {
        let record = $record;
        tracing::warn!(
            target: "security_audit",
            seq = record.seq,
            category = %record.category,
            actor = %record.actor,
            action = %record.action,
            outcome = %record.outcome,
            error = record.error.as_deref().unwrap_or(""),
            audit_json = %record.to_json(),
            "SECURITY_AUDIT: {} - {} - {}",
            record.category,
            record.action,
            record.outcome
        );
    };
}

/// Destination for stamped audit records.
///
/// Sinks only ever append.
pub trait AuditSink: Send + Sync {
    fn write(&self, record: &AuditRecord) -> Result<(), AuditError>;

    /// Blocks until every accepted record is durable.
    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: RwLock<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.read().clone()
    }

    pub fn for_job(&self, job: JobId) -> Vec<AuditRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.job_id == Some(job))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.records.write().push(record.clone());
        Ok(())
    }
}

enum Line {
    Record(Vec<u8>),
    Flush(mpsc::SyncSender<Option<String>>),
}

/// Appends one JSON document per line to a file.
///
/// Records are serialized by the caller and written by an `audit-writer`
/// thread, so appending never blocks on disk. A write error on that thread
/// is returned by every later [`AuditSink::write`] and [`AuditSink::flush`].
/// Dropping the sink drains and flushes the queue.
pub struct JsonlAuditSink {
    tx: Option<mpsc::Sender<Line>>,
    writer: Option<JoinHandle<()>>,
    fault: Arc<Mutex<Option<String>>>,
}

impl JsonlAuditSink {
    /// Opens `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (tx, rx) = mpsc::channel();
        let fault = Arc::new(Mutex::new(None));
        let writer = thread::Builder::new()
            .name("audit-writer".to_string())
            .spawn({
                let fault = fault.clone();
                move || write_lines(BufWriter::new(file), rx, fault)
            })?;
        Ok(Self {
            tx: Some(tx),
            writer: Some(writer),
            fault,
        })
    }

    /// Reads back every record in a JSON-lines audit file.
    pub fn read(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>, AuditError> {
        let reader = BufReader::new(File::open(path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    fn send(&self, line: Line) -> Result<(), AuditError> {
        if let Some(reason) = self.fault.lock().clone() {
            return Err(AuditError::Incomplete(reason));
        }
        self.tx
            .as_ref()
            .ok_or_else(|| AuditError::Incomplete("audit writer stopped".to_string()))?
            .send(line)
            .map_err(|_| AuditError::Incomplete("audit writer stopped".to_string()))
    }
}

impl AuditSink for JsonlAuditSink {
    fn write(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.send(Line::Record(line))
    }

    fn flush(&self) -> Result<(), AuditError> {
        let (done, wait) = mpsc::sync_channel(1);
        self.send(Line::Flush(done))?;
        match wait.recv() {
            Ok(None) => Ok(()),
            Ok(Some(reason)) => Err(AuditError::Incomplete(reason)),
            Err(_) => Err(AuditError::Incomplete("audit writer stopped".to_string())),
        }
    }
}

impl Drop for JsonlAuditSink {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

impl fmt::Debug for JsonlAuditSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlAuditSink")
            .field("fault", &*self.fault.lock())
            .finish()
    }
}

/// Body of the `audit-writer` thread. Flushes whenever the queue runs dry.
fn write_lines(mut out: BufWriter<File>, rx: mpsc::Receiver<Line>, fault: Arc<Mutex<Option<String>>>) {
    let latch = |e: std::io::Error| {
        error!(error = %e, "audit file write failed");
        fault.lock().get_or_insert_with(|| e.to_string());
    };
    while let Ok(first) = rx.recv() {
        let mut next = Some(first);
        while let Some(line) = next.take() {
            match line {
                Line::Record(bytes) => {
                    if let Err(e) = out.write_all(&bytes) {
                        latch(e);
                    }
                }
                Line::Flush(done) => {
                    if let Err(e) = out.flush() {
                        latch(e);
                    }
                    let _ = done.send(fault.lock().clone());
                }
            }
            next = rx.try_recv().ok();
        }
        if let Err(e) = out.flush() {
            latch(e);
        }
    }
}

#[derive(Debug, Default)]
struct Stamp {
    next_seq: u64,
    last: Option<DateTime<Utc>>,
}

/// Stamps records and fans them out to sinks.
///
/// The first failed sink write is kept; from then on [`AuditLog::check`]
/// fails and the engine admits no new work.
pub struct AuditLog {
    stamp: Mutex<Stamp>,
    sinks: Vec<Arc<dyn AuditSink>>,
    failed_writes: AtomicU64,
    fault: Mutex<Option<String>>,
}

impl AuditLog {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self {
            stamp: Mutex::new(Stamp {
                next_seq: 1,
                last: None,
            }),
            sinks,
            failed_writes: AtomicU64::new(0),
            fault: Mutex::new(None),
        }
    }

    /// A log backed by a single in-memory sink.
    pub fn in_memory() -> (Arc<Self>, Arc<MemoryAuditSink>) {
        let sink = Arc::new(MemoryAuditSink::new());
        (Arc::new(Self::new(vec![sink.clone()])), sink)
    }

    /// Stamps `record`, writes it to every sink and returns the stamped copy.
    ///
    /// Sinks are written while the stamp lock is held, so every sink sees
    /// records in sequence order.
    pub fn append(&self, mut record: AuditRecord) -> AuditRecord {
        {
            let mut stamp = self.stamp.lock();
            record.seq = stamp.next_seq;
            stamp.next_seq += 1;
            let now = Utc::now();
            record.timestamp = match stamp.last {
                Some(last) if last > now => last,
                _ => now,
            };
            stamp.last = Some(record.timestamp);

            for sink in &self.sinks {
                if let Err(e) = sink.write(&record) {
                    error!(seq = record.seq, error = %e, "audit sink write failed");
                    self.latch(e);
                }
            }
        }
        audit_log!(&record);
        record
    }

    /// Number of records appended so far.
    pub fn len(&self) -> u64 {
        self.stamp.lock().next_seq - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sink writes that failed.
    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }

    /// Fails with the first sink error, if any write has been lost.
    pub fn check(&self) -> Result<(), AuditError> {
        match &*self.fault.lock() {
            Some(reason) => Err(AuditError::Incomplete(reason.clone())),
            None => Ok(()),
        }
    }

    /// Flushes every sink. Blocks on sink I/O.
    pub fn flush(&self) -> Result<(), AuditError> {
        let mut failed = false;
        for sink in &self.sinks {
            if let Err(e) = sink.flush() {
                error!(error = %e, "audit sink flush failed");
                self.latch(e);
                failed = true;
            }
        }
        if failed {
            self.check()
        } else {
            Ok(())
        }
    }

    fn latch(&self, error: AuditError) {
        self.failed_writes.fetch_add(1, Ordering::Relaxed);
        let reason = match error {
            AuditError::Incomplete(reason) => reason,
            other => other.to_string(),
        };
        self.fault.lock().get_or_insert(reason);
    }
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog")
            .field("sinks", &self.sinks.len())
            .field("len", &self.len())
            .finish()
    }
}

/// Initialize JSON structured logging.
///
/// `RUST_LOG` overrides `log_level` when set.
pub fn init_logging(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .json(),
        )
        .init();
}

/// Initialize human-readable logging for interactive use.
pub fn init_logging_pretty(log_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true)
                .pretty(),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use portctl_types::{AdminState, DeviceId, PortId};
    use pretty_assertions::assert_eq;

    struct FailingSink;

    impl AuditSink for FailingSink {
        fn write(&self, _record: &AuditRecord) -> Result<(), AuditError> {
            Err(AuditError::Io(std::io::Error::other("disk full")))
        }
    }

    fn key() -> PortKey {
        PortKey::new(DeviceId::new("leaf1").unwrap(), PortId::numbered("Ethernet", 1))
    }

    #[test]
    fn test_audit_record_creation() {
        let job = JobId::new();
        let record = AuditRecord::new(AuditCategory::DriverCall, "dispatcher", "activate")
            .with_actor("alice")
            .with_outcome(AuditOutcome::Success)
            .with_job(job)
            .with_port(&key())
            .with_after(Some(PortConfig::new(AdminState::Up)));

        assert_eq!(record.category, AuditCategory::DriverCall);
        assert_eq!(record.actor, "alice");
        assert_eq!(record.job_id, Some(job));
        assert_eq!(record.object_id.as_deref(), Some("leaf1|Ethernet1"));
    }

    #[test]
    fn test_audit_record_with_error() {
        let record = AuditRecord::new(AuditCategory::DriverCall, "dispatcher", "set_vlan")
            .with_error("device rejected");
        assert_eq!(record.outcome, AuditOutcome::Failure);
        assert_eq!(record.error.as_deref(), Some("device rejected"));
    }

    #[test]
    fn test_json_serialization() {
        let record = AuditRecord::new(AuditCategory::JobTransition, "orchestrator", "transition")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({"from": "queued", "to": "dispatching"}));
        let json = record.to_json();
        assert!(json.contains("JOB_TRANSITION"));
        assert!(json.contains("\"to\":\"dispatching\""));
        assert_eq!(record.detail("to"), Some("dispatching"));
    }

    #[test]
    fn test_append_assigns_sequence() {
        let (log, sink) = AuditLog::in_memory();
        for i in 0..5 {
            log.append(AuditRecord::new(AuditCategory::Intake, "test", format!("a{}", i)));
        }
        let records = sink.records();
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert!(records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(log.len(), 5);
    }

    #[test]
    fn test_failing_sink_does_not_block_others() {
        let memory = Arc::new(MemoryAuditSink::new());
        let log = AuditLog::new(vec![Arc::new(FailingSink), memory.clone()]);
        log.append(AuditRecord::new(AuditCategory::Intake, "test", "submit"));
        assert_eq!(memory.len(), 1);
        assert_eq!(log.failed_writes(), 1);
    }

    #[test]
    fn test_failed_write_is_kept() {
        let log = AuditLog::new(vec![Arc::new(FailingSink)]);
        assert!(log.check().is_ok());
        log.append(AuditRecord::new(AuditCategory::Intake, "test", "submit"));
        log.append(AuditRecord::new(AuditCategory::Intake, "test", "submit"));

        let err = log.check().unwrap_err();
        assert_eq!(err.to_string(), "audit trail incomplete: audit I/O error: disk full");
        assert_eq!(log.failed_writes(), 2);
    }

    #[test]
    fn test_jsonl_flush_makes_records_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = Arc::new(JsonlAuditSink::open(&path).unwrap());
        let log = AuditLog::new(vec![sink.clone()]);
        for i in 0..20 {
            log.append(AuditRecord::new(AuditCategory::DriverCall, "dispatcher", format!("call{}", i)));
        }
        log.flush().unwrap();

        let records = JsonlAuditSink::read(&path).unwrap();
        assert_eq!(records.len(), 20);
        assert_eq!(records[19].action, "call19");
        assert!(log.check().is_ok());
    }

    #[test]
    fn test_jsonl_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let sink = Arc::new(JsonlAuditSink::open(&path).unwrap());
            let log = AuditLog::new(vec![sink]);
            log.append(AuditRecord::new(AuditCategory::SystemLifecycle, "engine", "start"));
            log.append(
                AuditRecord::new(AuditCategory::OperatorAction, "engine", "cancel")
                    .with_actor("bob")
                    .with_outcome(AuditOutcome::Success),
            );
        }
        let records = JsonlAuditSink::read(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].actor, "bob");
        assert_eq!(records[1].seq, 2);
    }
}
