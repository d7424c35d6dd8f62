//! Controller session capability contract.
//!
//! A session owns exactly one physical (or simulated) connection. It answers "make it
//! so" through [`ControllerSession::apply_configuration`] and the motion calls, and
//! "what is it now" through the refresh calls plus a cheap [`SessionSnapshot`].
//!
//! # Lifecycle
//!
//! ```text
//! Unconfigured -> Connecting -> Connected { ready } -> ... -> Closed
//! ```
//!
//! Mutations loop back to `Connected`. `Closed` is terminal: every operation except
//! [`ControllerSession::snapshot`] fails with [`FleetError::SessionClosed`], and the
//! snapshot reports every stage as disconnected.

use crate::error::{FleetError, FleetResult};
use crate::events::{DeviceUpdate, EventBus, StageRemoved};
use crate::model::{
    Configuration, ConfigurationId, Device, DeviceInfo, Identifier, LinearStage,
    RotationalStage, StageInfo, StageKind, StageStatus,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Opened, never applied
    Unconfigured,
    /// First apply in progress
    Connecting,
    /// Hardware link up; `ready` once motion commands are accepted
    Connected { ready: bool },
    /// Terminal
    Closed,
}

impl SessionState {
    /// Link up, ready or not.
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected { .. })
    }

    /// Link up and accepting motion commands.
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Connected { ready: true })
    }

    /// Fails once the session has been closed.
    pub fn ensure_open(&self, key: ConfigurationId) -> FleetResult<()> {
        match self {
            SessionState::Closed => Err(FleetError::SessionClosed(key)),
            _ => Ok(()),
        }
    }

    /// Fails unless the session is connected and ready.
    pub fn ensure_ready(&self, key: ConfigurationId, what: &str) -> FleetResult<()> {
        self.ensure_open(key)?;
        if self.is_ready() {
            Ok(())
        } else {
            Err(FleetError::NotReady {
                key,
                message: format!("Cannot {what}."),
            })
        }
    }
}

/// One stage as seen by its session.
#[derive(Debug, Clone, PartialEq)]
pub struct StageView {
    /// Static description
    pub info: StageInfo,
    /// Last read status
    pub status: StageStatus,
    /// Reference move completed
    pub referenced: bool,
}

impl StageView {
    /// The device clients see for this stage.
    pub fn device(&self, configuration_id: ConfigurationId) -> Device {
        let mut info = DeviceInfo::new(self.info.identifier, configuration_id);
        info.connected = self.status.connected;
        info.description = self.info.model.clone();
        info.finished = self.status.on_target;
        match self.info.kind {
            StageKind::Linear => Device::StageLinear(LinearStage {
                info,
                on_target: self.status.on_target,
                referenced: self.referenced,
                position: self.status.position,
                maximum: self.info.maximum.unwrap_or_default(),
            }),
            StageKind::Rotational => Device::StageRotational(RotationalStage {
                info,
                on_target: self.status.on_target,
                referenced: self.referenced,
                angle: self.status.position,
            }),
        }
    }
}

/// Point-in-time state of a session, readable without touching hardware.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Configuration key
    pub key: ConfigurationId,
    /// Lifecycle state at snapshot time
    pub state: SessionState,
    /// Last known configuration, with read-only fields filled in
    pub configuration: Option<Configuration>,
    /// Stages by channel
    pub stages: BTreeMap<u8, StageView>,
}

impl SessionSnapshot {
    /// Empty, unconfigured snapshot.
    pub fn new(key: ConfigurationId) -> Self {
        Self {
            key,
            state: SessionState::Unconfigured,
            configuration: None,
            stages: BTreeMap::new(),
        }
    }

    /// The snapshot of a closed session: same stages, all disconnected.
    pub fn closed(mut self) -> Self {
        self.state = SessionState::Closed;
        for stage in self.stages.values_mut() {
            stage.status = StageStatus::disconnected(stage.info.identifier);
        }
        self
    }

    /// Identifiers of every stage, by channel.
    pub fn identifiers(&self) -> Vec<Identifier> {
        self.stages.values().map(|s| s.info.identifier).collect()
    }

    /// Client-facing devices, one per stage.
    pub fn devices(&self) -> Vec<Device> {
        self.stages
            .values()
            .map(|stage| stage.device(self.key))
            .collect()
    }

    /// Status per channel.
    pub fn stage_status(&self) -> BTreeMap<u8, StageStatus> {
        self.stages
            .iter()
            .map(|(channel, stage)| (*channel, stage.status))
            .collect()
    }

    /// Static stage descriptions.
    pub fn stage_info(&self) -> Vec<StageInfo> {
        self.stages.values().map(|s| s.info.clone()).collect()
    }
}

/// Capability interface implemented once per hardware family.
///
/// Channels are the family's 1-based channel numbers; the owning interface maps
/// fleet identifiers onto them.
#[async_trait]
pub trait ControllerSession: Send + 'static {
    /// Configuration key this session serves.
    fn key(&self) -> ConfigurationId;

    /// Current lifecycle state.
    fn state(&self) -> SessionState;

    /// Bus this session publishes its events on.
    fn events(&self) -> &EventBus;

    /// Drive the hardware towards `desired`.
    ///
    /// Steps run in the order connect, assign stages, closed loop, reference, and
    /// only where the desired state differs from the last known one. A failing step
    /// stops the sequence; what was applied so far stays applied and shows up in
    /// the next status read.
    async fn apply_configuration(&mut self, desired: &Configuration) -> FleetResult<()>;

    /// Re-read fast-changing fields (position, on-target) of every stage.
    ///
    /// A disconnected session answers with `connected: false` statuses instead of failing.
    async fn refresh_status(&mut self) -> FleetResult<BTreeMap<u8, StageStatus>>;

    /// Re-read everything, including stage assignment, closed loop and error state.
    async fn refresh_full(&mut self) -> FleetResult<()>;

    /// Start an absolute move. Returns before the motion completes.
    async fn move_to(&mut self, channel: u8, position: f64) -> FleetResult<()>;

    /// Start a relative move. Returns before the motion completes.
    async fn step_by(&mut self, channel: u8, delta: f64) -> FleetResult<()>;

    /// Start referencing one channel.
    async fn reference(&mut self, channel: u8) -> FleetResult<()>;

    /// Whether the last mutating request has fully taken effect in hardware.
    async fn is_configuration_converged(&mut self) -> FleetResult<bool> {
        Ok(true)
    }

    /// Stop motion and release the connection. The session is unusable afterwards.
    async fn close(&mut self) -> FleetResult<()>;

    /// Copy of the state the interface caches between calls.
    fn snapshot(&self) -> SessionSnapshot;
}

/// Publish a `DeviceUpdate` for every stage whose view changed between two snapshots,
/// and a `StageRemoved` for every stage that disappeared.
pub fn publish_changes(bus: &EventBus, before: &SessionSnapshot, after: &SessionSnapshot) {
    for (channel, stage) in &before.stages {
        let still_there = after
            .stages
            .get(channel)
            .is_some_and(|s| s.info.identifier == stage.info.identifier);
        if !still_there {
            bus.publish(StageRemoved {
                identifier: stage.info.identifier,
            });
        }
    }
    for (channel, stage) in &after.stages {
        if before.stages.get(channel) != Some(stage) {
            bus.publish(DeviceUpdate::from(stage.device(after.key)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn view(identifier: Identifier, position: f64) -> StageView {
        StageView {
            info: StageInfo {
                identifier,
                model: "Virtual".into(),
                kind: StageKind::Linear,
                minimum: Some(0.0),
                maximum: Some(10.0),
            },
            status: StageStatus::new(identifier, true, true, position, true),
            referenced: true,
        }
    }

    #[test]
    fn test_state_guards() {
        assert!(SessionState::Connected { ready: true }
            .ensure_ready(1, "move axis")
            .is_ok());
        assert!(matches!(
            SessionState::Connected { ready: false }.ensure_ready(1, "move axis"),
            Err(FleetError::NotReady { key: 1, .. })
        ));
        assert_eq!(
            SessionState::Closed.ensure_ready(1, "move axis"),
            Err(FleetError::SessionClosed(1))
        );
    }

    #[test]
    fn test_closed_snapshot_reports_disconnected() {
        let mut snapshot = SessionSnapshot::new(1);
        snapshot.state = SessionState::Connected { ready: true };
        snapshot.stages.insert(1, view(1, 7.0));
        let closed = snapshot.closed();
        assert_eq!(closed.state, SessionState::Closed);
        let status = closed.stage_status()[&1];
        assert!(!status.connected);
        assert!(!status.ready);
        assert_eq!(closed.identifiers(), vec![1]);
    }

    #[test]
    fn test_device_from_view() {
        match view(11, 4.0).device(1) {
            Device::StageLinear(stage) => {
                assert_eq!(stage.info.configuration_id, 1);
                assert_eq!(stage.position, 4.0);
                assert_eq!(stage.maximum, 10.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_publish_changes() {
        let bus = EventBus::new("session", &EventKind::SESSION);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = bus
            .subscribe(&[EventKind::DeviceUpdate, EventKind::StageRemoved])
            .unwrap();
        for kind in [EventKind::DeviceUpdate, EventKind::StageRemoved] {
            let seen = Arc::clone(&seen);
            sub.on(kind, move |e| seen.lock().push(e.kind())).unwrap();
        }

        let mut before = SessionSnapshot::new(1);
        before.stages.insert(1, view(11, 0.0));
        before.stages.insert(2, view(12, 0.0));
        let mut after = SessionSnapshot::new(1);
        after.stages.insert(1, view(11, 5.0));

        publish_changes(&bus, &before, &after);
        assert_eq!(
            *seen.lock(),
            vec![EventKind::StageRemoved, EventKind::DeviceUpdate]
        );

        seen.lock().clear();
        publish_changes(&bus, &after, &after);
        assert!(seen.lock().is_empty());
    }
}
