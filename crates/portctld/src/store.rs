//! Durable job state.
//!
//! The orchestrator persists every batch and every job transition through a
//! [`JobStore`] so that [`crate::Engine::recover`] can resume after a crash.

use crate::error::StoreError;
use crate::model::{ActivationJob, Batch, BatchId, JobId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};

pub trait JobStore: Send + Sync {
    fn save_batch(&self, batch: &Batch) -> Result<(), StoreError>;

    fn save_job(&self, job: &ActivationJob) -> Result<(), StoreError>;

    fn load_batches(&self) -> Result<Vec<Batch>, StoreError>;

    /// Jobs in submission order.
    fn load_jobs(&self) -> Result<Vec<ActivationJob>, StoreError>;
}

/// In-process store. Survives an engine restart as long as it is shared.
#[derive(Debug)]
pub struct MemoryStore {
    batches: DashMap<BatchId, Batch>,
    jobs: DashMap<JobId, ActivationJob>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            batches: DashMap::new(),
            jobs: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: writes fail until availability is restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn job(&self, id: JobId) -> Option<ActivationJob> {
        self.jobs.get(&id).map(|j| j.clone())
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        }
    }
}

impl JobStore for MemoryStore {
    fn save_batch(&self, batch: &Batch) -> Result<(), StoreError> {
        self.check()?;
        self.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    fn save_job(&self, job: &ActivationJob) -> Result<(), StoreError> {
        self.check()?;
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn load_batches(&self) -> Result<Vec<Batch>, StoreError> {
        self.check()?;
        let mut batches: Vec<Batch> = self.batches.iter().map(|b| b.value().clone()).collect();
        batches.sort_by_key(|b| b.created_at);
        Ok(batches)
    }

    fn load_jobs(&self) -> Result<Vec<ActivationJob>, StoreError> {
        self.check()?;
        let mut jobs: Vec<ActivationJob> = self.jobs.iter().map(|j| j.value().clone()).collect();
        jobs.sort_by_key(|j| j.order);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CanonicalIntent;
    use portctl_types::{AdminState, DeviceId, PortId, PortKey};
    use pretty_assertions::assert_eq;

    fn job(order: u64) -> ActivationJob {
        let key = PortKey::new(DeviceId::new("leaf1").unwrap(), PortId::numbered("Ethernet", 1));
        ActivationJob::new(
            BatchId::new(),
            order,
            CanonicalIntent::new(key, AdminState::Up, None, None),
            "alice",
        )
    }

    #[test]
    fn test_jobs_load_in_submission_order() {
        let store = MemoryStore::new();
        for order in [3, 1, 2] {
            store.save_job(&job(order)).unwrap();
        }
        let orders: Vec<u64> = store.load_jobs().unwrap().iter().map(|j| j.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[test]
    fn test_save_overwrites() {
        let store = MemoryStore::new();
        let mut j = job(0);
        store.save_job(&j).unwrap();
        j.attempts = 2;
        store.save_job(&j).unwrap();
        assert_eq!(store.job(j.id).map(|j| j.attempts), Some(2));
        assert_eq!(store.load_jobs().unwrap().len(), 1);
    }

    #[test]
    fn test_outage() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(store.save_job(&job(0)), Err(StoreError::Unavailable(_))));
        store.set_available(true);
        assert!(store.save_job(&job(0)).is_ok());
    }
}
