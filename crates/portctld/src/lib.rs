//! portctld - Port Activation Engine
//!
//! Turns requests to change port state (admin up/down, access VLAN, mode)
//! into validated, authorized and audited operations against a fleet of
//! switches reached through heterogeneous drivers.
//!
//! # Architecture
//!
//! ```text
//! [ActivationRequest] ──> [Validator] ──> [Authorizer] ──> [Orchestrator]
//!                                                               │
//!                                   [LeaseTable] <── runner ────┤
//!                                                               ↓
//!                                   [Dispatcher] ──> [PortDriver] ──> switch
//!                                                               │
//!                                   [JobStore] <─ [AuditLog] <──┘
//! ```
//!
//! # Key Components
//!
//! - [`engine::Engine`]: submission API, batch queries, cancel, recovery
//! - [`validator`]: request validation against the inventory
//! - [`authorizer`]: role based access per operation and port scope
//! - [`dispatcher`]: driver selection, deadlines, bounded concurrency
//! - [`compensation`]: snapshot restore after partial failure
//! - [`audit`]: structured audit records and sinks
//! - [`metrics`]: success metrics recomputed from audit records

pub mod audit;
pub mod authorizer;
pub mod compensation;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod intake;
pub mod inventory;
pub mod metrics;
pub mod model;
mod orchestrator;
pub mod state;
pub mod store;
pub mod validator;

pub use engine::{Engine, EngineBuilder, PlanDecision, PlanRow};
pub use error::{ActivationError, ConfigError, EngineError};
pub use orchestrator::{BatchView, CancelReport, JobSummary, RecoveryReport, SubmitReceipt};
