//! Hardware driver clients.
//!
//! Controller sessions talk to hardware through the blocking driver traits defined
//! here. Vendor libraries are synchronous, so every call is shipped to tokio's blocking
//! pool by [`BlockingDriver`], which also enforces a per-call deadline and turns driver
//! failures into [`FleetError`]s tagged with the controller key.
//!
//! # Available drivers
//!
//! - [`PiDriver`] - multi-axis PI GCS controllers (C-884 and friends)
//! - [`XimcDriver`] - single-axis Standa XIMC controllers
//!
//! Simulated implementations of both live in [`mock`].

pub mod mock;

use crate::error::{FleetError, FleetResult};
use crate::model::ConfigurationId;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Failure reported by a driver call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    /// No open connection to the controller.
    #[error("controller not connected")]
    NotConnected,

    /// The controller or stage was not found.
    #[error("device not found: {0}")]
    NotFound(String),

    /// Channel number outside what the controller has.
    #[error("channel {0} does not exist")]
    InvalidChannel(u8),

    /// The controller refused the command.
    #[error("command rejected: {0}")]
    Rejected(String),

    /// Transport-level failure.
    #[error("communication failure: {0}")]
    Communication(String),

    /// The driver does not implement this call.
    #[error("{0} not supported by this driver")]
    Unsupported(&'static str),
}

/// Result of a driver call.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Blocking client for one PI GCS controller.
///
/// Per-channel reads return every channel in one round trip, keyed by 1-based channel.
pub trait PiDriver: Send + 'static {
    /// Descriptions of the controllers visible on USB; the serial is the last word.
    fn enumerate_usb(&mut self) -> DriverResult<Vec<String>>;

    /// Connect over USB to the controller with this serial.
    fn connect_usb(&mut self, serial: ConfigurationId) -> DriverResult<()>;

    /// Connect over a serial port.
    fn connect_rs232(&mut self, comport: u32, baud_rate: u32) -> DriverResult<()>;

    /// Connect over TCP. Unsupported unless a driver overrides it.
    fn connect_network(&mut self, _serial: ConfigurationId) -> DriverResult<()> {
        Err(DriverError::Unsupported("network connection"))
    }

    /// `*IDN?` answer: vendor, model, serial and firmware separated by commas.
    fn identification(&mut self) -> DriverResult<String>;

    /// Drop the connection.
    fn close(&mut self) -> DriverResult<()>;

    /// Whether a connection is open.
    fn is_connected(&self) -> bool;

    /// Number of channels the controller drives.
    fn channel_amount(&mut self) -> DriverResult<u8>;

    /// Stage model loaded per channel (`CST?`).
    fn stages(&mut self) -> DriverResult<BTreeMap<u8, String>>;

    /// Load stage models (`CST`) and persist them in the controller (`WPA`).
    fn assign_stages(&mut self, assignment: &BTreeMap<u8, String>) -> DriverResult<()>;

    /// Closed-loop state per channel.
    fn servo(&mut self) -> DriverResult<BTreeMap<u8, bool>>;

    /// Switch closed loop for the channels in `request`.
    fn set_servo(&mut self, request: &BTreeMap<u8, bool>) -> DriverResult<()>;

    /// Whether each channel has found its reference.
    fn referenced(&mut self) -> DriverResult<BTreeMap<u8, bool>>;

    /// Start a reference move (`FRF`); returns before the move finishes.
    fn start_reference(&mut self, channels: &[u8]) -> DriverResult<()>;

    /// Current position per channel.
    fn positions(&mut self) -> DriverResult<BTreeMap<u8, f64>>;

    /// Whether each channel reached its target.
    fn on_target(&mut self) -> DriverResult<BTreeMap<u8, bool>>;

    /// Soft travel limits per channel (`TMN?` / `TMX?`).
    fn travel_range(&mut self) -> DriverResult<BTreeMap<u8, [f64; 2]>>;

    /// Start an absolute move.
    fn move_to(&mut self, channel: u8, position: f64) -> DriverResult<()>;

    /// Start a relative move.
    fn step_by(&mut self, channel: u8, delta: f64) -> DriverResult<()>;

    /// Stop all motion immediately.
    fn halt(&mut self) -> DriverResult<()>;

    /// Last error reported by the controller, empty if none. Reading clears it.
    fn last_error(&mut self) -> DriverResult<String>;
}

/// Live state of a XIMC axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XimcStatus {
    /// Whether the axis found its home position
    pub homed: bool,
    /// Whether a move or homing is under way
    pub moving: bool,
    /// Calibrated position (mm or degrees)
    pub position: f64,
}

/// Blocking client for one single-axis Standa XIMC controller.
pub trait XimcDriver: Send + 'static {
    /// Serial numbers of the controllers found by a probing enumeration.
    fn enumerate(&mut self) -> DriverResult<Vec<ConfigurationId>>;

    /// Open the controller with this serial.
    fn open(&mut self, serial: ConfigurationId) -> DriverResult<()>;

    /// Release the controller.
    fn close(&mut self) -> DriverResult<()>;

    /// Whether the controller is open.
    fn is_open(&self) -> bool;

    /// Units per motor step used by the calibrated commands.
    fn set_calibration(&mut self, units_per_step: f64);

    /// Read the axis state.
    fn status(&mut self) -> DriverResult<XimcStatus>;

    /// Start homing.
    fn home(&mut self) -> DriverResult<()>;

    /// Start an absolute move in calibrated units.
    fn move_to(&mut self, position: f64) -> DriverResult<()>;

    /// Start a relative move in calibrated units.
    fn step_by(&mut self, delta: f64) -> DriverResult<()>;

    /// Stop the axis.
    fn stop(&mut self) -> DriverResult<()>;
}

/// A driver shared between a session and the blocking pool.
///
/// Calls are serialized by the driver mutex. A call that overruns the deadline is
/// reported as [`FleetError::Timeout`]; it keeps running on the blocking pool and
/// the next call waits for it to release the driver.
pub struct BlockingDriver<D: ?Sized> {
    driver: Arc<Mutex<Box<D>>>,
    key: ConfigurationId,
    timeout: Duration,
}

impl<D: ?Sized> Clone for BlockingDriver<D> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            key: self.key,
            timeout: self.timeout,
        }
    }
}

impl<D: ?Sized + Send + 'static> BlockingDriver<D> {
    /// Wrap `driver` for controller `key`; every call gets `timeout`.
    pub fn new(driver: Box<D>, key: ConfigurationId, timeout: Duration) -> Self {
        Self {
            driver: Arc::new(Mutex::new(driver)),
            key,
            timeout,
        }
    }

    /// Controller this driver talks to.
    pub fn key(&self) -> ConfigurationId {
        self.key
    }

    /// Run `op` against the driver on the blocking pool.
    pub async fn call<T, F>(&self, name: &'static str, op: F) -> FleetResult<T>
    where
        F: FnOnce(&mut D) -> DriverResult<T> + Send + 'static,
        T: Send + 'static,
    {
        debug!(key = self.key, call = name, "driver call");
        let driver = Arc::clone(&self.driver);
        let task = tokio::task::spawn_blocking(move || {
            let mut guard = driver.lock();
            op(&mut **guard)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => Err(FleetError::Timeout {
                key: self.key,
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            Ok(Err(join)) => Err(FleetError::Internal(format!(
                "driver call {name} on {} aborted: {join}",
                self.key
            ))),
            Ok(Ok(result)) => result.map_err(|e| FleetError::Hardware {
                key: self.key,
                message: format!("{name}: {e}"),
            }),
        }
    }

    /// Read a field that needs no I/O (e.g. a cached connection flag).
    pub fn peek<T>(&self, op: impl FnOnce(&D) -> T) -> T {
        let guard = self.driver.lock();
        op(&**guard)
    }
}
