//! Keyed, FIFO-ordered, time-bounded exclusive leases.
//!
//! The table is an arena of slots plus a key index. Each slot holds the
//! current lease holder (if any) and a queue of owners waiting for the key,
//! in the order they were [`enqueue`](LeaseTable::enqueue)d.
//!
//! An owner must be enqueued before it can [`acquire`](LeaseTable::acquire).
//! Acquisition succeeds only when the owner is at the head of the queue and
//! the key has no live holder. A holder whose TTL lapsed (a crashed worker)
//! is reclaimed by the next waiter, so a dead owner delays its successors by
//! at most one TTL.
//!
//! Slots are recycled once they have neither a holder nor waiters, so the
//! table stays proportional to the number of keys in flight.
//!
//! A live owner keeps its lease with [`LeaseTable::keep_alive`], which renews
//! it every third of a TTL until the returned [`LeaseGuard`] is dropped. Only
//! an owner that stops running loses the key to expiry.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A held lease renewed in the background until dropped.
///
/// Renewal stops on its own once the lease is released or lost, so callers
/// check [`LeaseGuard::is_held`] before acting on the key.
pub struct LeaseGuard<K, O>
where
    K: Eq + Hash + Clone + Display,
    O: Eq + Clone + Display,
{
    table: Arc<LeaseTable<K, O>>,
    lease: Lease<K, O>,
    renewer: JoinHandle<()>,
}

impl<K, O> LeaseGuard<K, O>
where
    K: Eq + Hash + Clone + Display,
    O: Eq + Clone + Display,
{
    pub fn lease(&self) -> &Lease<K, O> {
        &self.lease
    }

    /// Returns true while the lease is still the live holder of its key.
    pub fn is_held(&self) -> bool {
        self.table.is_held(&self.lease)
    }
}

impl<K, O> Debug for LeaseGuard<K, O>
where
    K: Eq + Hash + Clone + Display + Debug,
    O: Eq + Clone + Display + Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard").field("lease", &self.lease).finish()
    }
}

impl<K, O> Drop for LeaseGuard<K, O>
where
    K: Eq + Hash + Clone + Display,
    O: Eq + Clone + Display,
{
    fn drop(&mut self) {
        self.renewer.abort();
    }
}

/// Errors returned by [`LeaseTable`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseError {
    /// The lease did not become available within the acquisition timeout.
    #[error("timed out after {waited:?} waiting for lease on {key} (held by {holder:?})")]
    Timeout {
        key: String,
        waited: Duration,
        holder: Option<String>,
    },

    /// The owner has no reservation on the key (never enqueued, or withdrawn).
    #[error("{owner} has no reservation on {key}")]
    NotReserved { key: String, owner: String },
}

impl LeaseError {
    /// Returns true if waiting again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LeaseError::Timeout { .. })
    }
}

/// A granted lease. Valid until `expires_at` unless renewed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease<K, O> {
    pub key: K,
    pub owner: O,
    pub token: u64,
    pub acquired_at: Instant,
    pub expires_at: Instant,
}

impl<K, O> Lease<K, O> {
    /// Returns true if the lease TTL has lapsed.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

struct Slot<K, O> {
    key: K,
    holder: Option<Lease<K, O>>,
    waiters: VecDeque<O>,
    notify: Arc<Notify>,
}

struct Inner<K, O> {
    slots: Vec<Option<Slot<K, O>>>,
    index: HashMap<K, usize>,
    free: Vec<usize>,
    next_token: u64,
}

enum Attempt<K, O> {
    Granted(Lease<K, O>),
    Wait(Option<Instant>),
}

/// Keyed lease table.
pub struct LeaseTable<K, O> {
    inner: Mutex<Inner<K, O>>,
    ttl: Duration,
}

impl<K, O> Debug for LeaseTable<K, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LeaseTable")
            .field("ttl", &self.ttl)
            .field("keys", &inner.index.len())
            .finish()
    }
}

impl<K, O> LeaseTable<K, O>
where
    K: Eq + Hash + Clone + Display,
    O: Eq + Clone + Display,
{
    /// Creates an empty table whose leases live for `ttl` unless renewed.
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                index: HashMap::new(),
                free: Vec::new(),
                next_token: 1,
            }),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of keys with a holder or waiters.
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserves a place for `owner` at the back of the queue for `key`.
    ///
    /// Returns the owner's queue position (0 = next in line).
    pub fn enqueue(&self, key: K, owner: O) -> usize {
        let mut inner = self.inner.lock();
        let idx = inner.slot_for(key);
        let slot = inner.slot_mut(idx);
        slot.waiters.push_back(owner);
        slot.waiters.len() - 1
    }

    /// Waits until `owner` holds the lease on `key`, or `timeout` elapses.
    ///
    /// On timeout the reservation is withdrawn so successors are not held up.
    pub async fn acquire(
        &self,
        key: &K,
        owner: &O,
        timeout: Duration,
    ) -> Result<Lease<K, O>, LeaseError> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let notify = self.notify_for(key).ok_or_else(|| LeaseError::NotReserved {
                key: key.to_string(),
                owner: owner.to_string(),
            })?;
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let expiry = match self.try_acquire(key, owner)? {
                Attempt::Granted(lease) => return Ok(lease),
                Attempt::Wait(expiry) => expiry,
            };

            if Instant::now() >= deadline {
                let holder = self.holder(key).map(|l| l.owner.to_string());
                self.withdraw(key, owner);
                debug!(key = %key, owner = %owner, "lease acquisition timed out");
                return Err(LeaseError::Timeout {
                    key: key.to_string(),
                    waited: started.elapsed(),
                    holder,
                });
            }

            let wake_at = expiry.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    /// Extends a held lease by one TTL. Returns false if the lease was lost.
    pub fn renew(&self, lease: &mut Lease<K, O>) -> bool {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.index.get(&lease.key) else {
            return false;
        };
        let now = Instant::now();
        let ttl = self.ttl;
        match inner.slot_mut(idx).holder.as_mut() {
            Some(held) if held.token == lease.token && !held.is_expired(now) => {
                held.expires_at = now + ttl;
                lease.expires_at = held.expires_at;
                true
            }
            _ => false,
        }
    }

    /// Returns true if `lease` is the live holder of its key.
    pub fn is_held(&self, lease: &Lease<K, O>) -> bool {
        self.holder(&lease.key)
            .is_some_and(|held| held.token == lease.token)
    }

    /// Renews `lease` every third of a TTL until the guard is dropped or the
    /// lease is released or reclaimed.
    pub fn keep_alive(self: &Arc<Self>, lease: Lease<K, O>) -> LeaseGuard<K, O>
    where
        K: Send + Sync + 'static,
        O: Send + Sync + 'static,
    {
        let table = Arc::clone(self);
        let period = (self.ttl / 3).max(Duration::from_millis(1));
        let mut renewed = lease.clone();
        let renewer = tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if !table.renew(&mut renewed) {
                    debug!(key = %renewed.key, owner = %renewed.owner, "lease no longer held, renewal stopped");
                    break;
                }
            }
        });
        LeaseGuard {
            table: Arc::clone(self),
            lease,
            renewer,
        }
    }

    /// Releases a held lease. Returns false if it had already been lost.
    pub fn release(&self, lease: &Lease<K, O>) -> bool {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.index.get(&lease.key) else {
            return false;
        };
        let slot = inner.slot_mut(idx);
        if !slot.holder.as_ref().is_some_and(|held| held.token == lease.token) {
            return false;
        }
        slot.holder = None;
        slot.notify.notify_waiters();
        inner.collect(idx);
        true
    }

    /// Removes `owner`'s reservation on `key`. Returns false if it had none.
    pub fn withdraw(&self, key: &K, owner: &O) -> bool {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.index.get(key) else {
            return false;
        };
        let slot = inner.slot_mut(idx);
        let Some(pos) = slot.waiters.iter().position(|w| w == owner) else {
            return false;
        };
        slot.waiters.remove(pos);
        slot.notify.notify_waiters();
        inner.collect(idx);
        true
    }

    /// Returns the live holder of `key`, ignoring expired leases.
    pub fn holder(&self, key: &K) -> Option<Lease<K, O>> {
        let inner = self.inner.lock();
        let idx = *inner.index.get(key)?;
        let now = Instant::now();
        inner.slots[idx]
            .as_ref()?
            .holder
            .as_ref()
            .filter(|l| !l.is_expired(now))
            .cloned()
    }

    /// Number of owners queued behind the holder of `key`.
    pub fn waiting(&self, key: &K) -> usize {
        let inner = self.inner.lock();
        inner
            .index
            .get(key)
            .and_then(|&idx| inner.slots[idx].as_ref())
            .map_or(0, |slot| slot.waiters.len())
    }

    fn notify_for(&self, key: &K) -> Option<Arc<Notify>> {
        let inner = self.inner.lock();
        let idx = *inner.index.get(key)?;
        inner.slots[idx].as_ref().map(|slot| slot.notify.clone())
    }

    fn try_acquire(&self, key: &K, owner: &O) -> Result<Attempt<K, O>, LeaseError> {
        let mut inner = self.inner.lock();
        let not_reserved = || LeaseError::NotReserved {
            key: key.to_string(),
            owner: owner.to_string(),
        };
        let &idx = inner.index.get(key).ok_or_else(not_reserved)?;
        let now = Instant::now();
        let token = inner.next_token;
        let ttl = self.ttl;
        let slot = inner.slot_mut(idx);

        if !slot.waiters.contains(owner) {
            return Err(not_reserved());
        }

        let expired = match &slot.holder {
            Some(held) if !held.is_expired(now) => {
                return Ok(Attempt::Wait(Some(held.expires_at)));
            }
            Some(held) => Some(held.owner.to_string()),
            None => None,
        };
        if let Some(previous) = expired {
            warn!(key = %key, holder = %previous, "reclaiming expired lease");
            slot.holder = None;
        }

        if slot.waiters.front() != Some(owner) {
            return Ok(Attempt::Wait(None));
        }
        slot.waiters.pop_front();
        let lease = Lease {
            key: slot.key.clone(),
            owner: owner.clone(),
            token,
            acquired_at: now,
            expires_at: now + ttl,
        };
        slot.holder = Some(lease.clone());
        inner.next_token += 1;
        Ok(Attempt::Granted(lease))
    }
}

impl<K, O> Inner<K, O>
where
    K: Eq + Hash + Clone,
{
    fn slot_for(&mut self, key: K) -> usize {
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let slot = Slot {
            key: key.clone(),
            holder: None,
            waiters: VecDeque::new(),
            notify: Arc::new(Notify::new()),
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        idx
    }

    fn slot_mut(&mut self, idx: usize) -> &mut Slot<K, O> {
        // Indices come from `index`, which only points at occupied slots.
        match self.slots[idx].as_mut() {
            Some(slot) => slot,
            None => unreachable!("lease index points at a vacant slot"),
        }
    }

    fn collect(&mut self, idx: usize) {
        let vacant = self.slots[idx]
            .as_ref()
            .is_some_and(|slot| slot.holder.is_none() && slot.waiters.is_empty());
        if vacant {
            if let Some(slot) = self.slots[idx].take() {
                self.index.remove(&slot.key);
                self.free.push(idx);
            }
        }
    }
}
