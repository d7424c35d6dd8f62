//! Hardware families.
//!
//! A family knows how to validate its configurations, how its devices are addressed
//! and how to open a session for one controller. Everything else (the session map,
//! reconciliation, batching) is generic and lives in [`crate::interface`].

pub mod pi;
pub mod standa;
pub mod virtual_stage;

pub use pi::{PiDriverFactory, PiFamily, PiSession};
pub use standa::{StandaFamily, StandaSession, XimcDriverFactory};
pub use virtual_stage::{VirtualFamily, VirtualSession};

use crate::error::{FleetError, FleetResult};
use crate::model::{Addressing, Configuration};
use crate::session::ControllerSession;

/// One hardware family: addressing scheme, validation and session construction.
pub trait ControllerFamily: Send + Sync + 'static {
    /// Session type this family opens, one per configuration.
    type Session: ControllerSession;

    /// Family name, matching the `controller_type` tag of its configurations.
    fn name(&self) -> &'static str;

    /// How `(key, channel)` maps onto fleet identifiers.
    fn addressing(&self) -> Addressing;

    /// Reject items that belong to another family or are internally inconsistent.
    fn validate(&self, configuration: &Configuration) -> FleetResult<()> {
        if configuration.family() != self.name() {
            return Err(FleetError::Validation(format!(
                "{} configuration sent to the {} interface",
                configuration.family(),
                self.name()
            )));
        }
        configuration.validate()
    }

    /// Build an idle session for a configuration key seen for the first time.
    ///
    /// No hardware I/O happens here; the first `apply_configuration` connects.
    fn open_session(&self, configuration: &Configuration) -> FleetResult<Self::Session>;
}

/// Host name of a session's event bus.
pub(crate) fn session_host(family: &str, key: i64) -> String {
    format!("{family} session {key}")
}
