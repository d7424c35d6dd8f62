//! Standa single-axis controllers driven through XIMC.
//!
//! One controller carries one stage, so the only valid channel is 1 and the device
//! identifier is `serial * 10 + 1`. Calibration and travel range come from the
//! `StandaStages` catalog, falling back to whatever the configuration carries.

use super::{session_host, ControllerFamily};
use crate::config::Settings;
use crate::error::{FleetError, FleetResult};
use crate::events::{ConfigurationUpdate, EventBus, EventKind, StageRemoved};
use crate::hardware::mock::SimulatedXimcDriver;
use crate::hardware::{BlockingDriver, XimcDriver, XimcStatus};
use crate::model::{
    Addressing, Configuration, ConfigurationId, StageInfo, StageStatus, StandaConfiguration,
    STANDA_FAMILY,
};
use crate::session::{publish_changes, ControllerSession, SessionSnapshot, SessionState, StageView};
use crate::settings::StageCatalog;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const CHANNEL: u8 = 1;

/// Builds the driver for one Standa configuration.
pub type XimcDriverFactory =
    Arc<dyn Fn(&StandaConfiguration) -> FleetResult<Box<dyn XimcDriver>> + Send + Sync>;

/// The Standa family: one XIMC driver per controller, calibrated from the stage catalog.
#[derive(Clone)]
pub struct StandaFamily {
    factory: XimcDriverFactory,
    catalog: Arc<StageCatalog>,
    driver_timeout: Duration,
}

impl std::fmt::Debug for StandaFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandaFamily")
            .field("catalog", &self.catalog.len())
            .finish()
    }
}

impl StandaFamily {
    /// Family with a custom driver factory.
    pub fn new(factory: XimcDriverFactory, catalog: Arc<StageCatalog>, driver_timeout: Duration) -> Self {
        Self {
            factory,
            catalog,
            driver_timeout,
        }
    }

    /// Every configured serial number is served by a [`SimulatedXimcDriver`].
    pub fn with_simulation(catalog: Arc<StageCatalog>, settings: &Settings) -> Self {
        let settle = settings.simulation.settle();
        Self::new(
            Arc::new(move |config: &StandaConfiguration| {
                Ok(Box::new(SimulatedXimcDriver::new(config.id).with_settle(settle))
                    as Box<dyn XimcDriver>)
            }),
            catalog,
            settings.hardware.driver_timeout(),
        )
    }
}

impl ControllerFamily for StandaFamily {
    type Session = StandaSession;

    fn name(&self) -> &'static str {
        STANDA_FAMILY
    }

    fn addressing(&self) -> Addressing {
        Addressing::Compound {
            first: CHANNEL,
            last: CHANNEL,
        }
    }

    fn open_session(&self, configuration: &Configuration) -> FleetResult<StandaSession> {
        self.validate(configuration)?;
        let Configuration::Standa(config) = configuration else {
            return Err(FleetError::Internal("validated Standa configuration".into()));
        };
        let driver = BlockingDriver::new((self.factory)(config)?, config.id, self.driver_timeout);
        Ok(StandaSession::new(
            config,
            driver,
            Arc::clone(&self.catalog),
            self.addressing(),
        ))
    }
}

/// Session for one single-axis Standa controller.
pub struct StandaSession {
    key: ConfigurationId,
    driver: BlockingDriver<dyn XimcDriver>,
    catalog: Arc<StageCatalog>,
    addressing: Addressing,
    events: EventBus,
    state: SessionState,
    config: StandaConfiguration,
    /// Homing started by the last apply and not yet seen to finish
    homing: bool,
    snapshot: SessionSnapshot,
}

impl StandaSession {
    /// Session for controller `desired.id`; the device is opened on the first apply.
    pub fn new(
        desired: &StandaConfiguration,
        driver: BlockingDriver<dyn XimcDriver>,
        catalog: Arc<StageCatalog>,
        addressing: Addressing,
    ) -> Self {
        let config = StandaConfiguration::new(desired.id, desired.model.clone());
        let mut snapshot = SessionSnapshot::new(desired.id);
        snapshot.configuration = Some(Configuration::Standa(config.clone()));
        Self {
            key: desired.id,
            driver,
            catalog,
            addressing,
            events: EventBus::new(session_host(STANDA_FAMILY, desired.id), &EventKind::SESSION),
            state: SessionState::Unconfigured,
            config,
            homing: false,
            snapshot,
        }
    }

    fn rebuild_snapshot(&mut self) {
        let mut stages = BTreeMap::new();
        if self.config.connected {
            match self.addressing.encode(self.key, CHANNEL) {
                Ok(identifier) => {
                    let [minimum, maximum] = match self.config.min_max {
                        Some([min, max]) => [Some(min), Some(max)],
                        None => [None, None],
                    };
                    stages.insert(
                        CHANNEL,
                        StageView {
                            info: StageInfo {
                                identifier,
                                model: self.config.model.clone(),
                                kind: self.config.kind,
                                minimum,
                                maximum,
                            },
                            status: StageStatus::new(
                                identifier,
                                true,
                                self.config.homed,
                                self.config.position,
                                self.config.on_target,
                            ),
                            referenced: self.config.homed,
                        },
                    );
                }
                Err(e) => warn!(key = self.key, "skipping stage: {e}"),
            }
        }
        let after = SessionSnapshot {
            key: self.key,
            state: self.state,
            configuration: Some(Configuration::Standa(self.config.clone())),
            stages,
        };
        publish_changes(&self.events, &self.snapshot, &after);
        self.snapshot = after;
    }

    fn absorb(&mut self, status: XimcStatus) {
        self.config.homed = status.homed;
        self.config.position = status.position;
        self.config.on_target = !status.moving;
        self.state = SessionState::Connected {
            ready: status.homed,
        };
    }

    async fn open(&mut self) -> FleetResult<()> {
        let key = self.key;
        self.state = SessionState::Connecting;
        let listed = self.driver.call("enumerate", |d| d.enumerate()).await?;
        if !listed.contains(&key) {
            return Err(FleetError::Hardware {
                key,
                message: format!("Standa controller with SN {key} not connected"),
            });
        }
        self.driver.call("open", move |d| d.open(key)).await?;
        self.config.connected = true;
        info!(key, "Standa controller opened");
        Ok(())
    }

    async fn apply_steps(&mut self, desired: &StandaConfiguration) -> FleetResult<()> {
        if !self.driver.peek(|d| d.is_open()) {
            self.events
                .publish(ConfigurationUpdate::progress(self.key, "Connecting"));
            self.open().await?;
        }

        let entry = self.catalog.get(&desired.model).cloned();
        let calibration = entry.as_ref().and_then(|e| e.calibration);
        self.config.model = desired.model.clone();
        self.config.kind = entry.as_ref().map_or(desired.kind, |e| e.kind);
        self.config.min_max = entry.and_then(|e| e.min_max).or(desired.min_max);
        match calibration {
            Some(units_per_step) => {
                self.driver
                    .call("set_calibration", move |d| {
                        d.set_calibration(units_per_step);
                        Ok(())
                    })
                    .await?;
            }
            None => warn!(
                key = self.key,
                model = %desired.model,
                "no calibration for stage model, using raw steps"
            ),
        }

        let status = self.driver.call("status", |d| d.status()).await?;
        self.absorb(status);
        if desired.homed && !status.homed && !status.moving {
            debug!(key = self.key, "homing");
            self.driver.call("home", |d| d.home()).await?;
            self.homing = true;
            self.config.on_target = false;
        }
        self.rebuild_snapshot();
        Ok(())
    }

    fn check_range(&self, target: f64) -> FleetResult<()> {
        if let Some([min, max]) = self.config.min_max {
            if target < min || target > max {
                return Err(FleetError::Validation(format!(
                    "position {target} outside travel range [{min}, {max}] of controller {}",
                    self.key
                )));
            }
        }
        Ok(())
    }

    fn check_channel(&self, channel: u8) -> FleetResult<()> {
        if channel == CHANNEL {
            Ok(())
        } else {
            Err(FleetError::NotReady {
                key: self.key,
                message: format!("No stage on channel {channel}."),
            })
        }
    }
}

#[async_trait]
impl ControllerSession for StandaSession {
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
        let Configuration::Standa(desired) = desired else {
            return Err(FleetError::Validation(format!(
                "{} configuration sent to Standa controller {}",
                desired.family(),
                self.key
            )));
        };
        match self.apply_steps(desired).await {
            Ok(()) => {
                let mut update = ConfigurationUpdate::progress(
                    self.key,
                    if self.homing {
                        "Configuration applied, homing"
                    } else {
                        "Configuration applied"
                    },
                )
                .with_configuration(Configuration::Standa(self.config.clone()));
                update.finished = !self.homing;
                self.events.publish(update);
                Ok(())
            }
            Err(e) => {
                warn!(key = self.key, "applying configuration failed: {e}");
                if !self.driver.peek(|d| d.is_open()) {
                    self.config.connected = false;
                    self.state = SessionState::Unconfigured;
                }
                self.homing = false;
                self.rebuild_snapshot();
                self.events.publish(
                    ConfigurationUpdate::done(self.key, e.to_string())
                        .with_configuration(Configuration::Standa(self.config.clone()))
                        .with_error(),
                );
                Err(e)
            }
        }
    }

    async fn refresh_status(&mut self) -> FleetResult<BTreeMap<u8, StageStatus>> {
        self.state.ensure_open(self.key)?;
        if !self.driver.peek(|d| d.is_open()) {
            self.config.connected = false;
            self.state = SessionState::Unconfigured;
            self.rebuild_snapshot();
            return Ok(self.snapshot.stage_status());
        }
        let status = self.driver.call("status", |d| d.status()).await?;
        self.absorb(status);
        self.rebuild_snapshot();
        Ok(self.snapshot.stage_status())
    }

    async fn refresh_full(&mut self) -> FleetResult<()> {
        self.refresh_status().await.map(|_| ())
    }

    async fn move_to(&mut self, channel: u8, position: f64) -> FleetResult<()> {
        self.state.ensure_ready(self.key, "move axis")?;
        self.check_channel(channel)?;
        self.check_range(position)?;
        self.driver
            .call("move_to", move |d| d.move_to(position))
            .await?;
        self.config.on_target = false;
        self.rebuild_snapshot();
        Ok(())
    }

    async fn step_by(&mut self, channel: u8, delta: f64) -> FleetResult<()> {
        self.state.ensure_ready(self.key, "step axis")?;
        self.check_channel(channel)?;
        self.check_range(self.config.position + delta)?;
        self.driver.call("step_by", move |d| d.step_by(delta)).await?;
        self.config.on_target = false;
        self.rebuild_snapshot();
        Ok(())
    }

    /// Homing is the Standa counterpart of referencing; it is allowed before the axis is homed.
    async fn reference(&mut self, channel: u8) -> FleetResult<()> {
        self.state.ensure_open(self.key)?;
        if !self.state.is_connected() {
            return Err(FleetError::NotReady {
                key: self.key,
                message: "Cannot home axis.".into(),
            });
        }
        self.check_channel(channel)?;
        self.driver.call("home", |d| d.home()).await?;
        self.homing = true;
        self.config.on_target = false;
        self.rebuild_snapshot();
        Ok(())
    }

    async fn is_configuration_converged(&mut self) -> FleetResult<bool> {
        if !self.homing {
            return Ok(true);
        }
        let status = match self.driver.call("status", |d| d.status()).await {
            Ok(status) => status,
            Err(e) => {
                self.homing = false;
                self.events
                    .publish(ConfigurationUpdate::done(self.key, e.to_string()).with_error());
                return Ok(true);
            }
        };
        self.absorb(status);
        self.rebuild_snapshot();
        if status.moving {
            return Ok(false);
        }
        self.homing = false;
        let message = if status.homed {
            "Homing finished"
        } else {
            "Homing stopped before reaching home"
        };
        let mut update = ConfigurationUpdate::done(self.key, message)
            .with_configuration(Configuration::Standa(self.config.clone()));
        update.error = !status.homed;
        self.events.publish(update);
        Ok(true)
    }

    async fn close(&mut self) -> FleetResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        if self.driver.peek(|d| d.is_open()) {
            if let Err(e) = self.driver.call("stop", |d| d.stop()).await {
                warn!(key = self.key, "motion not stopped before close: {e}");
            }
            self.driver.call("close", |d| d.close()).await?;
        }
        info!(key = self.key, "Standa controller closed");
        self.state = SessionState::Closed;
        self.homing = false;
        self.config.connected = false;
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
    use crate::hardware::mock::CommandLog;
    use crate::settings::CatalogEntry;
    use crate::model::StageKind;

    const SN: ConfigurationId = 21_007;

    fn family(driver: SimulatedXimcDriver) -> StandaFamily {
        let catalog = StageCatalog::new([(
            "8MR151".to_string(),
            CatalogEntry {
                kind: StageKind::Rotational,
                calibration: Some(0.01),
                min_max: Some([0.0, 360.0]),
            },
        )]);
        let driver = parking_lot::Mutex::new(Some(driver));
        StandaFamily::new(
            Arc::new(move |_config: &StandaConfiguration| {
                driver
                    .lock()
                    .take()
                    .map(|d| Box::new(d) as Box<dyn XimcDriver>)
                    .ok_or_else(|| FleetError::Internal("driver already taken".into()))
            }),
            Arc::new(catalog),
            Duration::from_secs(1),
        )
    }

    fn homed(model: &str) -> Configuration {
        let mut config = StandaConfiguration::new(SN, model);
        config.homed = true;
        Configuration::Standa(config)
    }

    #[tokio::test]
    async fn test_close_stops_the_axis_first() {
        let log = CommandLog::default();
        let driver = SimulatedXimcDriver::new(SN)
            .with_settle(Duration::from_millis(5))
            .with_log(Arc::clone(&log));
        let family = family(driver);
        let mut session = family.open_session(&homed("8MR151")).unwrap();
        session.apply_configuration(&homed("8MR151")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.is_configuration_converged().await.unwrap());
        session.move_to(1, 90.0).await.unwrap();

        session.close().await.unwrap();
        assert_eq!(*log.lock(), ["home", "move_to", "stop", "close"]);
    }

    #[tokio::test]
    async fn test_apply_homes_and_converges() {
        let family = family(SimulatedXimcDriver::new(SN).with_settle(Duration::from_millis(20)));
        let mut session = family.open_session(&homed("8MR151")).unwrap();
        session.apply_configuration(&homed("8MR151")).await.unwrap();
        assert!(!session.state().is_ready());
        assert!(!session.is_configuration_converged().await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(session.is_configuration_converged().await.unwrap());
        assert!(session.state().is_ready());

        let snapshot = session.snapshot();
        let stage = &snapshot.stages[&1];
        assert_eq!(stage.info.identifier, SN * 10 + 1);
        assert_eq!(stage.info.kind, StageKind::Rotational);
        assert_eq!(stage.info.maximum, Some(360.0));
    }

    #[tokio::test]
    async fn test_missing_controller() {
        let family = family(SimulatedXimcDriver::new(SN).absent());
        let mut session = family.open_session(&homed("8MR151")).unwrap();
        let err = session.apply_configuration(&homed("8MR151")).await.unwrap_err();
        assert!(matches!(err, FleetError::Hardware { key: SN, .. }));
        assert!(session.snapshot().stages.is_empty());
    }

    #[tokio::test]
    async fn test_move_checks_range_and_homing() {
        let family = family(SimulatedXimcDriver::new(SN).with_settle(Duration::from_millis(5)));
        let unhomed = Configuration::Standa(StandaConfiguration::new(SN, "8MR151"));
        let mut session = family.open_session(&unhomed).unwrap();
        session.apply_configuration(&unhomed).await.unwrap();
        assert!(matches!(
            session.move_to(1, 10.0).await,
            Err(FleetError::NotReady { .. })
        ));

        session.reference(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.is_configuration_converged().await.unwrap());
        assert!(matches!(
            session.move_to(1, 400.0).await,
            Err(FleetError::Validation(_))
        ));
        session.move_to(1, 90.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let status = session.refresh_status().await.unwrap();
        assert_eq!(status[&1].position, 90.0);
        assert!(status[&1].on_target);
    }
}
