//! Common orchestration primitives for portctl.
//!
//! - [`LeaseTable`]: keyed, FIFO-ordered, time-bounded exclusive leases.
//!   One lease per key at any instant; waiters are served strictly in the
//!   order they were enqueued; a lease whose TTL lapsed is reclaimable by
//!   the next waiter. [`LeaseGuard`] keeps a live owner's lease renewed.
//! - [`RetryPolicy`]: bounded attempts with exponential backoff and jitter.

mod lease;
mod retry;

pub use lease::{Lease, LeaseError, LeaseGuard, LeaseTable};
pub use retry::{RetryPolicy, RetryPolicyError};
