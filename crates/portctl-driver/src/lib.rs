//! Switch driver abstraction for portctl.
//!
//! Every managed switch is reached through one [`PortDriver`] interface.
//! Vendor and protocol differences are a closed set of [`DriverKind`]
//! variants that render the same [`PortChange`] into their own request
//! format; the bytes then travel over a [`DeviceTransport`].
//!
//! [`SwitchDriver`] binds a [`SwitchEndpoint`] to a transport and adds the
//! cross-cutting behaviour every variant shares:
//!
//! - capability checks against the endpoint's advertised [`CapabilitySet`]
//! - a per-call deadline (expiry is a transient failure)
//! - the endpoint's [`CircuitBreaker`]
//!
//! [`SimulatedTransport`] is an in-memory device fleet with fault injection,
//! used by the daemon's simulation mode and by tests.

mod breaker;
mod capability;
mod change;
mod driver;
mod endpoint;
mod error;
mod kind;
mod sim;
mod transport;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use capability::CapabilitySet;
pub use change::PortChange;
pub use driver::{PortDriver, SwitchDriver};
pub use endpoint::{EndpointHealth, SwitchEndpoint};
pub use error::{DriverError, DriverResult};
pub use kind::DriverKind;
pub use sim::{CallRecord, Fault, SimulatedTransport};
pub use transport::{DeviceRequest, DeviceTransport};
