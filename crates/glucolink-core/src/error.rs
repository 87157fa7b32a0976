//! Error types for glucolink-core.
//!
//! The taxonomy follows the link's recovery policy rather than its call
//! graph:
//!
//! - **Transport** ([`Error::Radio`]): a native radio failure, wrapped.
//!   Surfaced to the owner; never halts scanning or retry.
//! - **Protocol state** ([`Error::NotReady`], [`Error::InvalidConfiguration`],
//!   [`Error::UnknownCharacteristic`]): the command was issued against a
//!   link that cannot take it.
//! - **Timing** ([`Error::Timeout`]): the awaited callback never arrived
//!   within the bound.
//! - **Domain** ([`Error::Protocol`]): an authentication/control/observation
//!   failure with a human-readable description, distinguishing "could not
//!   parse a response" from "radio link problem".
//!
//! Decode failures are deliberately *not* errors: malformed or short frames
//! are routine over BLE and decode to `None` with a diagnostic log. Errors
//! from a single command never abort the session; the engine keeps retrying
//! while enabled.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Native failure reported by a radio backend.
///
/// Backends stringify their own error types into [`RadioError::Backend`] so
/// the value stays `Clone`able across the callback channel. A disconnect the
/// peripheral initiated itself is the one case callers must be able to
/// distinguish structurally, so it gets its own variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum RadioError {
    /// The peripheral ended the connection itself.
    #[error("peripheral disconnected")]
    PeripheralDisconnected,

    /// The radio is not powered on or otherwise unavailable.
    #[error("radio unavailable: {0}")]
    Unavailable(String),

    /// Any other backend failure, stringified.
    #[error("{0}")]
    Backend(String),
}

impl From<btleplug::Error> for RadioError {
    fn from(err: btleplug::Error) -> Self {
        RadioError::Backend(err.to_string())
    }
}

/// Errors produced by the sensor link engine.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants in
/// future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Native radio failure, wrapped.
    #[error("radio error: {0}")]
    Radio(#[from] RadioError),

    /// The radio or peripheral is not in a connected, powered state.
    #[error("link not ready: {0}")]
    NotReady(&'static str),

    /// A command was issued while another command was already pending.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Configuration references a characteristic discovery never found.
    #[error("unknown characteristic: {uuid}")]
    UnknownCharacteristic {
        /// The characteristic UUID that was not discovered.
        uuid: Uuid,
    },

    /// The command's callback never arrived within the bound.
    #[error("operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Authentication, control or observation failure.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a protocol error with a description.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Create an unknown characteristic error.
    pub fn unknown_characteristic(uuid: Uuid) -> Self {
        Self::UnknownCharacteristic { uuid }
    }

    /// Create a reentrancy error for a command issued while another is
    /// pending.
    pub fn command_pending(operation: &str) -> Self {
        Self::InvalidConfiguration(format!(
            "command '{operation}' issued while another command is pending"
        ))
    }

    /// Short machine-readable tag for the error class, used when reporting
    /// errors to the delegate.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Radio(_) => "radio",
            Error::NotReady(_) => "not_ready",
            Error::InvalidConfiguration(_) => "invalid_configuration",
            Error::UnknownCharacteristic { .. } => "unknown_characteristic",
            Error::Timeout { .. } => "timeout",
            Error::Protocol(_) => "protocol",
        }
    }
}

/// Result type alias using glucolink-core's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::timeout("enable notify", Duration::from_secs(2));
        assert!(err.to_string().contains("enable notify"));
        assert!(err.to_string().contains("2s"));

        let err = Error::NotReady("peripheral not connected");
        assert!(err.to_string().contains("peripheral not connected"));

        let err = Error::command_pending("discover services");
        assert!(err.to_string().contains("discover services"));
    }

    #[test]
    fn test_remote_disconnect_is_structural() {
        let err = RadioError::PeripheralDisconnected;
        assert_eq!(err, RadioError::PeripheralDisconnected);
        assert_ne!(err, RadioError::Backend("peripheral disconnected".into()));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::Radio(RadioError::PeripheralDisconnected).kind(),
            "radio"
        );
        assert_eq!(Error::protocol("bad frame").kind(), "protocol");
        assert_eq!(
            Error::timeout("x", Duration::from_millis(50)).kind(),
            "timeout"
        );
    }
}
