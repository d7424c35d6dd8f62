//! Mock Hardware Implementations
//!
//! Simulated controllers for running the fleet without physical hardware. Both drivers
//! keep all state in memory and model settle time with wall-clock deadlines, so motion
//! and referencing finish "later" exactly like real hardware does and the convergence
//! path gets exercised.
//!
//! # Available Mocks
//!
//! - `SimulatedPiDriver` - multi-channel PI controller (C-884 behaviour)
//! - `SimulatedXimcDriver` - single-axis Standa controller
//!
//! # Timing
//!
//! Motion, referencing and homing complete `settle` after they were commanded
//! (default 50 ms). Positions jump to the target once the deadline has passed.
//!
//! # Command log
//!
//! `with_log` hands a driver a shared [`CommandLog`]; motion, halt and close commands
//! are appended to it in the order the driver received them. `close` only drops the
//! link, like a vendor client does, so stopping motion first is the caller's job.

use crate::hardware::{DriverError, DriverResult, PiDriver, XimcDriver, XimcStatus};
use crate::model::{ConfigurationId, NO_STAGE};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_SETTLE: Duration = Duration::from_millis(50);
const DEFAULT_TRAVEL: [f64; 2] = [0.0, 500.0];

/// Commands a simulated driver received, oldest first.
pub type CommandLog = Arc<Mutex<Vec<&'static str>>>;

// =============================================================================
// SimulatedPiDriver - Simulated PI Controller
// =============================================================================

#[derive(Debug, Clone)]
struct SimulatedAxis {
    stage: String,
    servo: bool,
    referenced: bool,
    reference_deadline: Option<Instant>,
    position: f64,
    target: f64,
    motion_deadline: Option<Instant>,
    travel: [f64; 2],
}

impl SimulatedAxis {
    fn empty() -> Self {
        Self {
            stage: NO_STAGE.to_string(),
            servo: false,
            referenced: false,
            reference_deadline: None,
            position: 0.0,
            target: 0.0,
            motion_deadline: None,
            travel: DEFAULT_TRAVEL,
        }
    }

    fn has_stage(&self) -> bool {
        self.stage != NO_STAGE
    }

    /// Apply every deadline that has passed.
    fn advance(&mut self, now: Instant) {
        if self.reference_deadline.is_some_and(|d| d <= now) {
            self.reference_deadline = None;
            self.referenced = true;
            self.position = self.travel[0];
            self.target = self.position;
        }
        if self.motion_deadline.is_some_and(|d| d <= now) {
            self.motion_deadline = None;
            self.position = self.target;
        }
    }

    fn on_target(&self) -> bool {
        self.motion_deadline.is_none() && self.reference_deadline.is_none()
    }
}

/// Mock PI controller with per-channel stages, servo and referencing state.
///
/// # Example
///
/// ```rust,ignore
/// let mut pi = SimulatedPiDriver::new(118012345, 4);
/// pi.connect_usb(118012345)?;
/// pi.assign_stages(&[(1, "L-406.20DD10".to_string())].into())?;
/// ```
#[derive(Debug)]
pub struct SimulatedPiDriver {
    serial: ConfigurationId,
    usb_devices: Vec<String>,
    connected: bool,
    axes: Vec<SimulatedAxis>,
    settle: Duration,
    last_error: String,
    log: CommandLog,
}

impl SimulatedPiDriver {
    /// Controller `serial` with `channels` empty channels, visible on USB.
    pub fn new(serial: ConfigurationId, channels: u8) -> Self {
        Self {
            serial,
            usb_devices: vec![format!("PI C-884 Simulated SN {serial}")],
            connected: false,
            axes: vec![SimulatedAxis::empty(); usize::from(channels)],
            settle: DEFAULT_SETTLE,
            last_error: String::new(),
            log: CommandLog::default(),
        }
    }

    /// Time a move or reference takes to finish.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Record commands into `log`.
    pub fn with_log(mut self, log: CommandLog) -> Self {
        self.log = log;
        self
    }

    /// Replace what USB enumeration reports; an empty list simulates an unplugged controller.
    pub fn with_usb_devices(mut self, devices: Vec<String>) -> Self {
        self.usb_devices = devices;
        self
    }

    fn reject(&mut self, message: String) -> DriverError {
        self.last_error = message.clone();
        DriverError::Rejected(message)
    }

    fn require_connected(&mut self) -> DriverResult<Instant> {
        if !self.connected {
            return Err(DriverError::NotConnected);
        }
        let now = Instant::now();
        for axis in &mut self.axes {
            axis.advance(now);
        }
        Ok(now)
    }

    fn axis(&mut self, channel: u8) -> DriverResult<&mut SimulatedAxis> {
        let index = usize::from(channel)
            .checked_sub(1)
            .ok_or(DriverError::InvalidChannel(channel))?;
        self.axes
            .get_mut(index)
            .ok_or(DriverError::InvalidChannel(channel))
    }

    fn per_channel<T>(&self, read: impl Fn(&SimulatedAxis) -> T) -> BTreeMap<u8, T> {
        (1_u8..)
            .zip(&self.axes)
            .map(|(channel, axis)| (channel, read(axis)))
            .collect()
    }

    fn command_motion(&mut self, channel: u8, target: f64) -> DriverResult<()> {
        self.require_connected()?;
        let settle = self.settle;
        let axis = self.axis(channel)?;
        let problem = if !axis.has_stage() {
            Some(format!("no stage on channel {channel}"))
        } else if !axis.servo {
            Some(format!("servo is off on channel {channel}"))
        } else if !axis.referenced {
            Some(format!("channel {channel} is not referenced"))
        } else if target < axis.travel[0] || target > axis.travel[1] {
            Some(format!(
                "target {target} outside travel range {:?} on channel {channel}",
                axis.travel
            ))
        } else {
            None
        };
        if let Some(message) = problem {
            return Err(self.reject(message));
        }
        axis.target = target;
        axis.motion_deadline = Some(Instant::now() + settle);
        debug!(serial = self.serial, channel, target, "simulated move");
        Ok(())
    }
}

impl PiDriver for SimulatedPiDriver {
    fn enumerate_usb(&mut self) -> DriverResult<Vec<String>> {
        Ok(self.usb_devices.clone())
    }

    fn connect_usb(&mut self, serial: ConfigurationId) -> DriverResult<()> {
        let visible = self
            .usb_devices
            .iter()
            .any(|entry| entry.ends_with(&format!(" {serial}")));
        if !visible {
            return Err(DriverError::NotFound(format!("USB controller SN {serial}")));
        }
        self.connected = true;
        Ok(())
    }

    fn connect_rs232(&mut self, comport: u32, baud_rate: u32) -> DriverResult<()> {
        debug!(serial = self.serial, comport, baud_rate, "simulated RS-232 connect");
        self.connected = true;
        Ok(())
    }

    fn identification(&mut self) -> DriverResult<String> {
        self.require_connected()?;
        Ok(format!(
            "(c)2015 Physik Instrumente (PI) GmbH & Co. KG, C-884.4DC, {}, 1.1.2",
            self.serial
        ))
    }

    fn close(&mut self) -> DriverResult<()> {
        self.log.lock().push("close");
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn channel_amount(&mut self) -> DriverResult<u8> {
        self.require_connected()?;
        u8::try_from(self.axes.len()).map_err(|_| DriverError::Communication("too many axes".into()))
    }

    fn stages(&mut self) -> DriverResult<BTreeMap<u8, String>> {
        self.require_connected()?;
        Ok(self.per_channel(|axis| axis.stage.clone()))
    }

    fn assign_stages(&mut self, assignment: &BTreeMap<u8, String>) -> DriverResult<()> {
        self.require_connected()?;
        for (&channel, stage) in assignment {
            let axis = self.axis(channel)?;
            if axis.stage != *stage {
                *axis = SimulatedAxis {
                    stage: stage.clone(),
                    ..SimulatedAxis::empty()
                };
            }
        }
        Ok(())
    }

    fn servo(&mut self) -> DriverResult<BTreeMap<u8, bool>> {
        self.require_connected()?;
        Ok(self.per_channel(|axis| axis.servo))
    }

    fn set_servo(&mut self, request: &BTreeMap<u8, bool>) -> DriverResult<()> {
        self.require_connected()?;
        for (&channel, &on) in request {
            let axis = self.axis(channel)?;
            if on && !axis.has_stage() {
                return Err(self.reject(format!("no stage on channel {channel}")));
            }
            axis.servo = on;
        }
        Ok(())
    }

    fn referenced(&mut self) -> DriverResult<BTreeMap<u8, bool>> {
        self.require_connected()?;
        Ok(self.per_channel(|axis| axis.referenced))
    }

    fn start_reference(&mut self, channels: &[u8]) -> DriverResult<()> {
        self.log.lock().push("start_reference");
        let now = self.require_connected()?;
        let settle = self.settle;
        for &channel in channels {
            let axis = self.axis(channel)?;
            if !axis.has_stage() || !axis.servo {
                return Err(self.reject(format!(
                    "cannot reference channel {channel} without stage and servo"
                )));
            }
            axis.referenced = false;
            axis.motion_deadline = None;
            axis.reference_deadline = Some(now + settle);
        }
        Ok(())
    }

    fn positions(&mut self) -> DriverResult<BTreeMap<u8, f64>> {
        self.require_connected()?;
        Ok(self.per_channel(|axis| axis.position))
    }

    fn on_target(&mut self) -> DriverResult<BTreeMap<u8, bool>> {
        self.require_connected()?;
        Ok(self.per_channel(SimulatedAxis::on_target))
    }

    fn travel_range(&mut self) -> DriverResult<BTreeMap<u8, [f64; 2]>> {
        self.require_connected()?;
        Ok(self.per_channel(|axis| axis.travel))
    }

    fn move_to(&mut self, channel: u8, position: f64) -> DriverResult<()> {
        self.log.lock().push("move_to");
        self.command_motion(channel, position)
    }

    fn step_by(&mut self, channel: u8, delta: f64) -> DriverResult<()> {
        self.log.lock().push("step_by");
        self.require_connected()?;
        let target = self.axis(channel)?.position + delta;
        self.command_motion(channel, target)
    }

    fn halt(&mut self) -> DriverResult<()> {
        self.log.lock().push("halt");
        self.require_connected()?;
        for axis in &mut self.axes {
            axis.motion_deadline = None;
            axis.reference_deadline = None;
            axis.target = axis.position;
        }
        Ok(())
    }

    fn last_error(&mut self) -> DriverResult<String> {
        self.require_connected()?;
        Ok(std::mem::take(&mut self.last_error))
    }
}

// =============================================================================
// SimulatedXimcDriver - Simulated Standa Controller
// =============================================================================

/// Mock single-axis XIMC controller.
#[derive(Debug)]
pub struct SimulatedXimcDriver {
    serial: ConfigurationId,
    present: bool,
    open: bool,
    homed: bool,
    home_deadline: Option<Instant>,
    position: f64,
    target: f64,
    motion_deadline: Option<Instant>,
    units_per_step: f64,
    settle: Duration,
    log: CommandLog,
}

impl SimulatedXimcDriver {
    /// A present, closed, unhomed axis.
    pub fn new(serial: ConfigurationId) -> Self {
        Self {
            serial,
            present: true,
            open: false,
            homed: false,
            home_deadline: None,
            position: 0.0,
            target: 0.0,
            motion_deadline: None,
            units_per_step: 1.0,
            settle: DEFAULT_SETTLE,
            log: CommandLog::default(),
        }
    }

    /// Time a move or homing takes to finish.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Record commands into `log`.
    pub fn with_log(mut self, log: CommandLog) -> Self {
        self.log = log;
        self
    }

    /// A controller that does not show up in enumeration.
    pub fn absent(mut self) -> Self {
        self.present = false;
        self
    }

    /// Calibration last set by the session.
    pub fn units_per_step(&self) -> f64 {
        self.units_per_step
    }

    fn advance(&mut self) -> DriverResult<()> {
        if !self.open {
            return Err(DriverError::NotConnected);
        }
        let now = Instant::now();
        if self.home_deadline.is_some_and(|d| d <= now) {
            self.home_deadline = None;
            self.homed = true;
            self.position = 0.0;
            self.target = 0.0;
        }
        if self.motion_deadline.is_some_and(|d| d <= now) {
            self.motion_deadline = None;
            self.position = self.target;
        }
        Ok(())
    }
}

impl XimcDriver for SimulatedXimcDriver {
    fn enumerate(&mut self) -> DriverResult<Vec<ConfigurationId>> {
        Ok(if self.present {
            vec![self.serial]
        } else {
            Vec::new()
        })
    }

    fn open(&mut self, serial: ConfigurationId) -> DriverResult<()> {
        if !self.present || serial != self.serial {
            return Err(DriverError::NotFound(format!("XIMC controller SN {serial}")));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> DriverResult<()> {
        self.log.lock().push("close");
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn set_calibration(&mut self, units_per_step: f64) {
        self.units_per_step = units_per_step;
    }

    fn status(&mut self) -> DriverResult<XimcStatus> {
        self.advance()?;
        Ok(XimcStatus {
            homed: self.homed,
            moving: self.motion_deadline.is_some() || self.home_deadline.is_some(),
            position: self.position,
        })
    }

    fn home(&mut self) -> DriverResult<()> {
        self.log.lock().push("home");
        self.advance()?;
        self.motion_deadline = None;
        self.home_deadline = Some(Instant::now() + self.settle);
        Ok(())
    }

    fn move_to(&mut self, position: f64) -> DriverResult<()> {
        self.log.lock().push("move_to");
        self.advance()?;
        self.target = position;
        self.motion_deadline = Some(Instant::now() + self.settle);
        Ok(())
    }

    fn step_by(&mut self, delta: f64) -> DriverResult<()> {
        self.log.lock().push("step_by");
        self.advance()?;
        self.target = self.position + delta;
        self.motion_deadline = Some(Instant::now() + self.settle);
        Ok(())
    }

    fn stop(&mut self) -> DriverResult<()> {
        self.log.lock().push("stop");
        self.advance()?;
        self.motion_deadline = None;
        self.home_deadline = None;
        self.target = self.position;
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SN: ConfigurationId = 118_012_345;

    fn connected_pi() -> SimulatedPiDriver {
        let mut pi = SimulatedPiDriver::new(SN, 4).with_settle(Duration::from_millis(10));
        pi.connect_usb(SN).unwrap();
        pi
    }

    fn ready_channel(pi: &mut SimulatedPiDriver, channel: u8) {
        pi.assign_stages(&[(channel, "L-406.20DD10".to_string())].into())
            .unwrap();
        pi.set_servo(&[(channel, true)].into()).unwrap();
        pi.start_reference(&[channel]).unwrap();
        std::thread::sleep(Duration::from_millis(20));
    }

    #[test]
    fn test_usb_connect_requires_enumeration() {
        let mut pi = SimulatedPiDriver::new(SN, 4).with_usb_devices(Vec::new());
        assert!(matches!(pi.connect_usb(SN), Err(DriverError::NotFound(_))));
        assert!(!pi.is_connected());
        assert_eq!(pi.positions(), Err(DriverError::NotConnected));
    }

    #[test]
    fn test_identification_carries_serial() {
        let mut pi = SimulatedPiDriver::new(SN, 4);
        pi.connect_rs232(15, 115_200).unwrap();
        let idn = pi.identification().unwrap();
        assert_eq!(idn.split(',').nth(2).map(str::trim), Some("118012345"));
    }

    #[test]
    fn test_empty_channels_report_nostage() {
        let mut pi = connected_pi();
        let stages = pi.stages().unwrap();
        assert_eq!(stages.len(), 4);
        assert!(stages.values().all(|s| s == NO_STAGE));
        assert!(pi.set_servo(&[(2, true)].into()).is_err());
        assert!(!pi.last_error().unwrap().is_empty());
        assert!(pi.last_error().unwrap().is_empty());
    }

    #[test]
    fn test_reference_completes_after_settle() {
        let mut pi = connected_pi();
        pi.assign_stages(&[(1, "L-406.20DD10".to_string())].into())
            .unwrap();
        pi.set_servo(&[(1, true)].into()).unwrap();
        pi.start_reference(&[1]).unwrap();
        assert!(!pi.referenced().unwrap()[&1]);
        assert!(!pi.on_target().unwrap()[&1]);

        std::thread::sleep(Duration::from_millis(20));
        assert!(pi.referenced().unwrap()[&1]);
        assert!(pi.on_target().unwrap()[&1]);
    }

    #[test]
    fn test_move_needs_servo_and_reference() {
        let mut pi = connected_pi();
        pi.assign_stages(&[(1, "L-406.20DD10".to_string())].into())
            .unwrap();
        assert!(pi.move_to(1, 5.0).is_err());
        pi.set_servo(&[(1, true)].into()).unwrap();
        assert!(pi.move_to(1, 5.0).is_err());
    }

    #[test]
    fn test_absolute_and_relative_move() {
        let mut pi = connected_pi();
        ready_channel(&mut pi, 2);

        pi.move_to(2, 10.0).unwrap();
        assert!(!pi.on_target().unwrap()[&2]);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(pi.positions().unwrap()[&2], 10.0);

        pi.step_by(2, -3.0).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(pi.positions().unwrap()[&2], 7.0);
        assert!(pi.on_target().unwrap()[&2]);

        assert!(pi.move_to(2, 900.0).is_err());
        assert!(matches!(
            pi.move_to(7, 1.0),
            Err(DriverError::InvalidChannel(7))
        ));
    }

    #[test]
    fn test_halt_keeps_position() {
        let mut pi = connected_pi();
        ready_channel(&mut pi, 1);
        pi.move_to(1, 50.0).unwrap();
        pi.halt().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(pi.positions().unwrap()[&1], 0.0);
    }

    #[test]
    fn test_reassigning_stage_resets_channel() {
        let mut pi = connected_pi();
        ready_channel(&mut pi, 1);
        pi.assign_stages(&[(1, "M-060.DG".to_string())].into())
            .unwrap();
        assert!(!pi.servo().unwrap()[&1]);
        assert!(!pi.referenced().unwrap()[&1]);
    }

    #[test]
    fn test_ximc_open_and_home() {
        let mut axis = SimulatedXimcDriver::new(7).with_settle(Duration::from_millis(10));
        assert!(axis.status().is_err());
        assert!(axis.open(8).is_err());
        axis.open(7).unwrap();

        axis.home().unwrap();
        assert!(axis.status().unwrap().moving);
        std::thread::sleep(Duration::from_millis(20));
        let status = axis.status().unwrap();
        assert!(status.homed);
        assert!(!status.moving);

        axis.move_to(3.5).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(axis.status().unwrap().position, 3.5);
    }

    #[test]
    fn test_ximc_absent_controller() {
        let mut axis = SimulatedXimcDriver::new(7).absent();
        assert!(axis.enumerate().unwrap().is_empty());
        assert!(axis.open(7).is_err());
    }
}
