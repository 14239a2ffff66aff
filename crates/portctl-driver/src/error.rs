//! Driver error types.
//!
//! Every driver call either returns the observed port configuration or one
//! of these typed failures. The split that matters to callers is
//! [`DriverError::is_transient`]: transient failures are retried with
//! backoff, everything else is final for the current execution path.

use portctl_types::{DeviceId, Operation};
use std::time::Duration;
use thiserror::Error;

/// Result type for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Error type for driver operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Network or session problem; the device may not have seen the request.
    #[error("transient failure on {device} during {operation}: {message}")]
    Transient {
        device: DeviceId,
        operation: Operation,
        message: String,
    },

    /// The call exceeded its deadline.
    #[error("{operation} on {device} timed out after {after:?}")]
    Timeout {
        device: DeviceId,
        operation: Operation,
        after: Duration,
    },

    /// The device rejected the change as invalid.
    #[error("{device} rejected {operation}: {message}")]
    Rejected {
        device: DeviceId,
        operation: Operation,
        message: String,
    },

    /// The endpoint does not advertise the operation, or its protocol
    /// cannot express it.
    #[error("{device} does not support {operation}")]
    Unsupported {
        device: DeviceId,
        operation: Operation,
    },

    /// The endpoint's circuit breaker is open; the device was not contacted.
    #[error("circuit breaker open for {device}")]
    CircuitOpen { device: DeviceId },
}

impl DriverError {
    pub fn transient(device: &DeviceId, operation: Operation, message: impl Into<String>) -> Self {
        DriverError::Transient {
            device: device.clone(),
            operation,
            message: message.into(),
        }
    }

    pub fn rejected(device: &DeviceId, operation: Operation, message: impl Into<String>) -> Self {
        DriverError::Rejected {
            device: device.clone(),
            operation,
            message: message.into(),
        }
    }

    pub fn unsupported(device: &DeviceId, operation: Operation) -> Self {
        DriverError::Unsupported {
            device: device.clone(),
            operation,
        }
    }

    /// Returns true if retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DriverError::Transient { .. } | DriverError::Timeout { .. } | DriverError::CircuitOpen { .. }
        )
    }

    /// Returns true if the failure says the device is unreachable.
    ///
    /// A rejection proves the device answered, so it does not count.
    pub fn trips_breaker(&self) -> bool {
        matches!(self, DriverError::Transient { .. } | DriverError::Timeout { .. })
    }

    /// The device the failure concerns.
    pub fn device(&self) -> &DeviceId {
        match self {
            DriverError::Transient { device, .. }
            | DriverError::Timeout { device, .. }
            | DriverError::Rejected { device, .. }
            | DriverError::Unsupported { device, .. }
            | DriverError::CircuitOpen { device } => device,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let dev = DeviceId::new("leaf101").unwrap();
        assert!(DriverError::transient(&dev, Operation::SetVlan, "reset").is_transient());
        assert!(DriverError::CircuitOpen { device: dev.clone() }.is_transient());
        assert!(!DriverError::CircuitOpen { device: dev.clone() }.trips_breaker());

        let rejected = DriverError::rejected(&dev, Operation::SetMode, "bad mode");
        assert!(!rejected.is_transient());
        assert!(!rejected.trips_breaker());
        assert_eq!(rejected.device(), &dev);
        assert_eq!(
            rejected.to_string(),
            "leaf101 rejected set_mode: bad mode"
        );
    }
}
