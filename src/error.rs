//! Error types for the fleet core.
//!
//! `FleetError` is the single error type returned by sessions, controller
//! interfaces and the fleet orchestrator. It mirrors the failure taxonomy the
//! reconciliation protocol relies on:
//!
//! - **Validation**: a configuration item or action argument is malformed. Rejected
//!   per item; never aborts the surrounding batch.
//! - **NotReady**: the session is not connected or not configured for the requested
//!   operation. Recoverable by reconnecting.
//! - **Hardware / Timeout**: the driver failed (wrong serial number, absent device,
//!   communication failure) or did not answer in time. Always carries the controller key.
//! - **Routing** (`UnknownIdentifier`, `UnknownConfiguration`, `UnknownFamily`,
//!   `MalformedIdentifier`): the caller addressed something that does not exist or could
//!   not be decoded. Raised immediately, never swallowed.
//! - **Wiring** (`UndeclaredEvent`, `DuplicateInterface`): programming mistakes made while
//!   composing buses and interfaces.
//!
//! `FleetError` is `Clone` so that a single per-controller failure in a bulk command can
//! be reported against every identifier that was routed to that controller. Errors that
//! wrap non-clonable sources (file I/O, JSON, figment) live in
//! [`crate::settings::SettingsError`] and [`crate::config::ConfigError`].

use crate::events::EventKind;
use thiserror::Error;

/// Convenience alias for results using the fleet error type.
pub type FleetResult<T> = std::result::Result<T, FleetError>;

/// Every failure the fleet core can report.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FleetError {
    /// Malformed configuration item or action argument.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The session cannot perform the operation in its current state.
    #[error("Controller {key} not ready: {message}")]
    NotReady {
        /// Controller key
        key: i64,
        /// What could not be done
        message: String,
    },

    /// The driver failed.
    #[error("Hardware error on controller {key}: {message}")]
    Hardware {
        /// Controller key
        key: i64,
        /// Driver message
        message: String,
    },

    /// The driver did not answer before the deadline.
    #[error("Controller {key} did not answer within {timeout_ms} ms")]
    Timeout {
        /// Controller key
        key: i64,
        /// Deadline that elapsed
        timeout_ms: u64,
    },

    /// No interface knows this device identifier.
    #[error("Device {0} not found")]
    UnknownIdentifier(i64),

    /// No interface tracks this configuration key.
    #[error("Configuration {0} not found")]
    UnknownConfiguration(i64),

    /// No interface is registered for this `controller_type`.
    #[error("Controller interface for {0} not found")]
    UnknownFamily(String),

    /// The identifier does not decode under the owning family's addressing.
    #[error("Malformed identifier {identifier}: {reason}")]
    MalformedIdentifier {
        /// Offending identifier
        identifier: i64,
        /// Why it does not decode
        reason: String,
    },

    /// Subscribing to or publishing a kind the bus does not serve.
    #[error("Event type {kind:?} is not served by {host}")]
    UndeclaredEvent {
        /// Name of the bus
        host: String,
        /// Requested kind
        kind: EventKind,
    },

    /// A configuration would share its key or an identifier with another family's.
    #[error("Configuration {key} collides with {family} configuration {other_key}")]
    ConfigurationCollision {
        /// Key of the rejected configuration
        key: i64,
        /// Family already holding the conflicting configuration
        family: String,
        /// Key of the conflicting configuration
        other_key: i64,
    },

    /// More than one interface claims the same identifier.
    #[error("Identifier {identifier} is claimed by more than one interface: {families:?}")]
    AmbiguousIdentifier {
        /// Contested identifier
        identifier: i64,
        /// Every family claiming it
        families: Vec<String>,
    },

    /// An interface with this family name is already registered.
    #[error("Controller interface {0} has already been added")]
    DuplicateInterface(String),

    /// The device does not offer this action.
    #[error("Action {action:?} not recognized for device {identifier}")]
    UnknownAction {
        /// Target device
        identifier: i64,
        /// Requested action name
        action: String,
    },

    /// The session was closed and accepts no further calls.
    #[error("Session for controller {0} has been closed")]
    SessionClosed(i64),

    /// A broken internal invariant.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Returns true for the per-item conditions a client can fix by retrying
    /// (reconnecting hardware, resubmitting a corrected item).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FleetError::Validation(_)
                | FleetError::NotReady { .. }
                | FleetError::Hardware { .. }
                | FleetError::Timeout { .. }
                | FleetError::ConfigurationCollision { .. }
        )
    }

    /// Returns true when the caller addressed something that does not exist.
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            FleetError::UnknownIdentifier(_)
                | FleetError::UnknownConfiguration(_)
                | FleetError::UnknownFamily(_)
                | FleetError::MalformedIdentifier { .. }
                | FleetError::AmbiguousIdentifier { .. }
        )
    }
}
