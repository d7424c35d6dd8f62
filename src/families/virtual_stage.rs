//! Simulated linear stages with no hardware behind them.
//!
//! A virtual stage is its own device: the identifier is the configuration ID.
//! Moves land instantly; only a configuration change takes `settle` to converge,
//! which gives clients something to wait for during demos and tests.

use super::{session_host, ControllerFamily};
use crate::config::Settings;
use crate::error::{FleetError, FleetResult};
use crate::events::{ConfigurationUpdate, EventBus, EventKind, StageRemoved};
use crate::model::{
    Addressing, Configuration, ConfigurationId, StageInfo, StageKind, StageStatus,
    VirtualStageConfig, VIRTUAL_FAMILY,
};
use crate::session::{publish_changes, ControllerSession, SessionSnapshot, SessionState, StageView};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::debug;

const CHANNEL: u8 = Addressing::DIRECT_CHANNEL;

/// Simulated linear stages; identifier and configuration ID coincide.
#[derive(Debug, Clone)]
pub struct VirtualFamily {
    settle: Duration,
}

impl VirtualFamily {
    /// Stages that settle `settle` after every change.
    pub fn new(settle: Duration) -> Self {
        Self { settle }
    }

    /// Settle time from `[simulation]`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.simulation.settle())
    }
}

impl ControllerFamily for VirtualFamily {
    type Session = VirtualSession;

    fn name(&self) -> &'static str {
        VIRTUAL_FAMILY
    }

    fn addressing(&self) -> Addressing {
        Addressing::Direct
    }

    fn open_session(&self, configuration: &Configuration) -> FleetResult<VirtualSession> {
        self.validate(configuration)?;
        Ok(VirtualSession::new(configuration.id(), self.settle))
    }
}

/// One simulated stage.
pub struct VirtualSession {
    key: ConfigurationId,
    settle: Duration,
    events: EventBus,
    state: SessionState,
    maximum: f64,
    position: f64,
    settled_at: Option<Instant>,
    snapshot: SessionSnapshot,
}

impl VirtualSession {
    /// An unconfigured stage with zero travel.
    pub fn new(key: ConfigurationId, settle: Duration) -> Self {
        Self {
            key,
            settle,
            events: EventBus::new(session_host(VIRTUAL_FAMILY, key), &EventKind::SESSION),
            state: SessionState::Unconfigured,
            maximum: 0.0,
            position: 0.0,
            settled_at: None,
            snapshot: SessionSnapshot::new(key),
        }
    }

    fn configuration(&self) -> Configuration {
        Configuration::Virtual(VirtualStageConfig::new(self.key, self.maximum))
    }

    fn rebuild_snapshot(&mut self) {
        let mut stages = BTreeMap::new();
        stages.insert(
            CHANNEL,
            StageView {
                info: StageInfo {
                    identifier: self.key,
                    model: VIRTUAL_FAMILY.to_string(),
                    kind: StageKind::Linear,
                    minimum: Some(0.0),
                    maximum: Some(self.maximum),
                },
                status: StageStatus::new(self.key, true, true, self.position, true),
                referenced: true,
            },
        );
        let after = SessionSnapshot {
            key: self.key,
            state: self.state,
            configuration: Some(self.configuration()),
            stages,
        };
        publish_changes(&self.events, &self.snapshot, &after);
        self.snapshot = after;
    }

    fn check_channel(&self, channel: u8) -> FleetResult<()> {
        if channel == CHANNEL {
            Ok(())
        } else {
            Err(FleetError::UnknownIdentifier(self.key))
        }
    }

    fn go_to(&mut self, target: f64) -> FleetResult<()> {
        if !(0.0..=self.maximum).contains(&target) {
            return Err(FleetError::Validation(format!(
                "position {target} outside [0, {}] of virtual stage {}",
                self.maximum, self.key
            )));
        }
        debug!(key = self.key, target, "virtual move");
        self.position = target;
        self.rebuild_snapshot();
        Ok(())
    }
}

#[async_trait]
impl ControllerSession for VirtualSession {
    fn key(&self) -> ConfigurationId {
        self.key
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    async fn apply_configuration(&mut self, desired: &Configuration) -> FleetResult<()> {
        self.state.ensure_open(self.key)?;
        let Configuration::Virtual(desired) = desired else {
            return Err(FleetError::Validation(format!(
                "{} configuration sent to virtual stage {}",
                desired.family(),
                self.key
            )));
        };
        desired.validate()?;
        self.maximum = desired.maximum;
        self.position = self.position.clamp(0.0, self.maximum);
        self.settled_at = Some(Instant::now() + self.settle);
        self.state = SessionState::Connected { ready: true };
        self.rebuild_snapshot();
        self.events.publish(
            ConfigurationUpdate::progress(self.key, "Virtual stage configured")
                .with_configuration(self.configuration()),
        );
        Ok(())
    }

    async fn refresh_status(&mut self) -> FleetResult<BTreeMap<u8, StageStatus>> {
        self.state.ensure_open(self.key)?;
        Ok(self.snapshot.stage_status())
    }

    async fn refresh_full(&mut self) -> FleetResult<()> {
        self.state.ensure_open(self.key)
    }

    async fn move_to(&mut self, channel: u8, position: f64) -> FleetResult<()> {
        self.state.ensure_ready(self.key, "move virtual stage")?;
        self.check_channel(channel)?;
        self.go_to(position)
    }

    async fn step_by(&mut self, channel: u8, delta: f64) -> FleetResult<()> {
        self.state.ensure_ready(self.key, "step virtual stage")?;
        self.check_channel(channel)?;
        self.go_to(self.position + delta)
    }

    async fn reference(&mut self, channel: u8) -> FleetResult<()> {
        self.state.ensure_ready(self.key, "reference virtual stage")?;
        self.check_channel(channel)
    }

    async fn is_configuration_converged(&mut self) -> FleetResult<bool> {
        match self.settled_at {
            Some(deadline) if Instant::now() < deadline => Ok(false),
            Some(_) => {
                self.settled_at = None;
                self.events.publish(
                    ConfigurationUpdate::done(self.key, "Virtual stage settled")
                        .with_configuration(self.configuration()),
                );
                Ok(true)
            }
            None => Ok(true),
        }
    }

    async fn close(&mut self) -> FleetResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        self.settled_at = None;
        let closed = self.snapshot.clone().closed();
        for identifier in closed.identifiers() {
            self.events.publish(StageRemoved { identifier });
        }
        self.snapshot = closed;
        Ok(())
    }

    fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured(maximum: f64) -> Configuration {
        Configuration::Virtual(VirtualStageConfig::new(1, maximum))
    }

    #[tokio::test]
    async fn test_move_lands_immediately() {
        let mut session = VirtualFamily::new(Duration::ZERO)
            .open_session(&configured(10.0))
            .unwrap();
        session.apply_configuration(&configured(10.0)).await.unwrap();
        session.move_to(1, 7.0).await.unwrap();
        let status = session.refresh_status().await.unwrap()[&1];
        assert_eq!(status.identifier, 1);
        assert_eq!(status.position, 7.0);
        assert!(status.on_target);
        assert!(status.ready);

        session.step_by(1, -2.5).await.unwrap();
        assert_eq!(session.snapshot().stage_status()[&1].position, 4.5);
    }

    #[tokio::test]
    async fn test_out_of_range_rejected() {
        let mut session = VirtualSession::new(1, Duration::ZERO);
        assert!(matches!(
            session.move_to(1, 1.0).await,
            Err(FleetError::NotReady { .. })
        ));
        session.apply_configuration(&configured(10.0)).await.unwrap();
        assert!(matches!(
            session.move_to(1, 11.0).await,
            Err(FleetError::Validation(_))
        ));
        assert!(matches!(
            session.step_by(1, -1.0).await,
            Err(FleetError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_converges_after_settle() {
        let mut session = VirtualSession::new(1, Duration::from_millis(30));
        session.apply_configuration(&configured(10.0)).await.unwrap();
        assert!(!session.is_configuration_converged().await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.is_configuration_converged().await.unwrap());
    }

    #[tokio::test]
    async fn test_shrinking_maximum_clamps_position() {
        let mut session = VirtualSession::new(1, Duration::ZERO);
        session.apply_configuration(&configured(10.0)).await.unwrap();
        session.move_to(1, 9.0).await.unwrap();
        session.apply_configuration(&configured(5.0)).await.unwrap();
        assert_eq!(session.snapshot().stage_status()[&1].position, 5.0);
    }
}
