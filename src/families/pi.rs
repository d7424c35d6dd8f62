//! PI multi-channel controllers (C-884 and the simulated stand-in).
//!
//! Devices are addressed as `serial * 10 + channel` with 1-based channels. A
//! configuration is applied in the controller's own setup order:
//!
//! 1. connect (USB needs the serial in the USB enumeration, RS-232 checks `*IDN?`)
//! 2. load stage models onto the channels (`CST`)
//! 3. switch closed-loop operation (`SVO`)
//! 4. start referencing (`FRF`)
//!
//! Referencing runs on after `apply_configuration` returns; the session remembers
//! which channels it started and [`ControllerSession::is_configuration_converged`]
//! reports when they are done.

use super::{session_host, ControllerFamily};
use crate::config::Settings;
use crate::error::{FleetError, FleetResult};
use crate::events::{ConfigurationUpdate, EventBus, EventKind, StageRemoved};
use crate::hardware::mock::SimulatedPiDriver;
use crate::hardware::{BlockingDriver, PiDriver};
use crate::model::{
    Addressing, Configuration, ConfigurationId, PiConfiguration, PiConnectionType,
    PiControllerModel, PiStage, StageInfo, StageStatus, NO_STAGE, PI_FAMILY,
};
use crate::session::{publish_changes, ControllerSession, SessionSnapshot, SessionState, StageView};
use crate::settings::StageCatalog;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Builds the driver for one controller.
pub type PiDriverFactory =
    Arc<dyn Fn(&PiConfiguration) -> FleetResult<Box<dyn PiDriver>> + Send + Sync>;

/// The PI family: a driver factory per controller model plus the PI stage catalog.
#[derive(Clone)]
pub struct PiFamily {
    factories: HashMap<PiControllerModel, PiDriverFactory>,
    catalog: Arc<StageCatalog>,
    driver_timeout: Duration,
}

impl std::fmt::Debug for PiFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PiFamily")
            .field("models", &self.factories.keys().collect::<Vec<_>>())
            .field("catalog", &self.catalog.len())
            .finish()
    }
}

impl PiFamily {
    /// A family with no drivers registered.
    pub fn new(catalog: Arc<StageCatalog>, driver_timeout: Duration) -> Self {
        Self {
            factories: HashMap::new(),
            catalog,
            driver_timeout,
        }
    }

    /// A family that serves `Simulated` controllers from [`SimulatedPiDriver`].
    pub fn with_simulation(catalog: Arc<StageCatalog>, settings: &Settings) -> Self {
        let mut family = Self::new(catalog, settings.hardware.driver_timeout());
        let channels = settings.simulation.pi_channels;
        let settle = settings.simulation.settle();
        family.register_factory(
            PiControllerModel::Simulated,
            Arc::new(move |config: &PiConfiguration| {
                Ok(Box::new(SimulatedPiDriver::new(config.id, channels).with_settle(settle))
                    as Box<dyn PiDriver>)
            }),
        );
        family
    }

    /// Serve controllers of `model` with drivers built by `factory`.
    pub fn register_factory(&mut self, model: PiControllerModel, factory: PiDriverFactory) {
        self.factories.insert(model, factory);
    }
}

impl ControllerFamily for PiFamily {
    type Session = PiSession;

    fn name(&self) -> &'static str {
        PI_FAMILY
    }

    fn addressing(&self) -> Addressing {
        Addressing::one_based()
    }

    fn validate(&self, configuration: &Configuration) -> FleetResult<()> {
        let Configuration::Pi(config) = configuration else {
            return Err(FleetError::Validation(format!(
                "{} configuration sent to the {PI_FAMILY} interface",
                configuration.family()
            )));
        };
        config.validate()?;
        if !self.factories.contains_key(&config.model) {
            return Err(FleetError::Validation(format!(
                "no driver available for PI model {:?}",
                config.model
            )));
        }
        Ok(())
    }

    fn open_session(&self, configuration: &Configuration) -> FleetResult<PiSession> {
        self.validate(configuration)?;
        let Configuration::Pi(config) = configuration else {
            return Err(FleetError::Internal("validated PI configuration".into()));
        };
        let factory = self.factories.get(&config.model).ok_or_else(|| {
            FleetError::Validation(format!("no driver available for PI model {:?}", config.model))
        })?;
        let driver = BlockingDriver::new(factory(config)?, config.id, self.driver_timeout);
        Ok(PiSession::new(
            config,
            driver,
            Arc::clone(&self.catalog),
            self.addressing(),
        ))
    }
}

/// Everything a full refresh reads, gathered in one blocking call.
struct FullStatus {
    stages: BTreeMap<u8, String>,
    servo: BTreeMap<u8, bool>,
    referenced: BTreeMap<u8, bool>,
    positions: BTreeMap<u8, f64>,
    on_target: BTreeMap<u8, bool>,
    travel: BTreeMap<u8, [f64; 2]>,
    error: String,
}

/// Serial number reported in a `*IDN?` answer (third comma-separated field).
fn idn_serial(idn: &str) -> Option<ConfigurationId> {
    idn.split(',').nth(2)?.trim().parse().ok()
}

/// Whether a USB enumeration lists `serial` (the last word of each entry).
fn usb_lists(entries: &[String], serial: ConfigurationId) -> bool {
    entries.iter().any(|entry| {
        entry
            .split_whitespace()
            .last()
            .and_then(|word| word.parse::<ConfigurationId>().ok())
            == Some(serial)
    })
}

/// Session for one PI controller.
pub struct PiSession {
    key: ConfigurationId,
    driver: BlockingDriver<dyn PiDriver>,
    catalog: Arc<StageCatalog>,
    addressing: Addressing,
    events: EventBus,
    state: SessionState,
    /// Last known state of the controller
    config: PiConfiguration,
    /// Channels we started referencing and have not seen finish
    being_referenced: BTreeSet<u8>,
    snapshot: SessionSnapshot,
}

impl PiSession {
    /// Session for controller `desired.id`; nothing is connected until the first apply.
    pub fn new(
        desired: &PiConfiguration,
        driver: BlockingDriver<dyn PiDriver>,
        catalog: Arc<StageCatalog>,
        addressing: Addressing,
    ) -> Self {
        let mut config = PiConfiguration::new(desired.id, desired.model, desired.connection_type);
        config.comport = desired.comport;
        config.baud_rate = desired.baud_rate;
        let mut snapshot = SessionSnapshot::new(desired.id);
        snapshot.configuration = Some(Configuration::Pi(config.clone()));
        Self {
            key: desired.id,
            driver,
            catalog,
            addressing,
            events: EventBus::new(session_host(PI_FAMILY, desired.id), &EventKind::SESSION),
            state: SessionState::Unconfigured,
            config,
            being_referenced: BTreeSet::new(),
            snapshot,
        }
    }

    /// Channels with a reference move in flight.
    pub fn being_referenced(&self) -> &BTreeSet<u8> {
        &self.being_referenced
    }

    fn update(&self, message: impl Into<String>) -> ConfigurationUpdate {
        ConfigurationUpdate::progress(self.key, message)
    }

    fn not_ready(&self, message: String) -> FleetError {
        FleetError::NotReady {
            key: self.key,
            message,
        }
    }

    fn connection_changed(&self, desired: &PiConfiguration) -> bool {
        self.config.connection_type != desired.connection_type
            || self.config.comport != desired.comport
            || self.config.baud_rate != desired.baud_rate
    }

    /// Rebuild the snapshot from `self.config` and publish what changed.
    fn rebuild_snapshot(&mut self) {
        self.config.normalize();
        let mut stages = BTreeMap::new();
        for stage in self.config.stages.values() {
            let identifier = match self.addressing.encode(self.key, stage.channel) {
                Ok(identifier) => identifier,
                Err(e) => {
                    warn!(key = self.key, channel = stage.channel, "skipping stage: {e}");
                    continue;
                }
            };
            let ready = stage.clo && stage.referenced;
            stages.insert(
                stage.channel,
                StageView {
                    info: StageInfo {
                        identifier,
                        model: stage.device.clone(),
                        kind: stage.kind,
                        minimum: Some(stage.min_max[0]),
                        maximum: Some(stage.min_max[1]),
                    },
                    status: StageStatus::new(
                        identifier,
                        self.config.connected,
                        ready,
                        stage.position,
                        stage.on_target,
                    ),
                    referenced: stage.referenced,
                },
            );
        }
        let after = SessionSnapshot {
            key: self.key,
            state: self.state,
            configuration: Some(Configuration::Pi(self.config.clone())),
            stages,
        };
        publish_changes(&self.events, &self.snapshot, &after);
        self.snapshot = after;
    }

    /// The link went away underneath us.
    fn mark_disconnected(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Unconfigured;
        }
        self.config.connected = false;
        self.rebuild_snapshot();
    }

    fn link_up(&self) -> bool {
        self.state.is_connected() && self.driver.peek(|d| d.is_connected())
    }

    async fn connect(&mut self, desired: &PiConfiguration) -> FleetResult<()> {
        if self.link_up() {
            debug!(key = self.key, "connection parameters changed, reconnecting");
            self.driver.call("close", |d| d.close()).await?;
        }
        self.state = SessionState::Connecting;
        let key = self.key;
        match desired.connection_type {
            PiConnectionType::Usb => {
                let listed = self.driver.call("enumerate_usb", |d| d.enumerate_usb()).await?;
                if !usb_lists(&listed, key) {
                    return Err(FleetError::Hardware {
                        key,
                        message: format!("USB controller with SN {key} not connected"),
                    });
                }
                self.driver.call("connect_usb", move |d| d.connect_usb(key)).await?;
            }
            PiConnectionType::Rs232 => {
                let comport = desired.comport.ok_or_else(|| {
                    FleetError::Validation("Comport must be specified for an RS232 connection".into())
                })?;
                let baud_rate = desired.baud_rate;
                self.driver
                    .call("connect_rs232", move |d| d.connect_rs232(comport, baud_rate))
                    .await?;
                let idn = self.driver.call("identification", |d| d.identification()).await?;
                let reported = idn_serial(&idn);
                if reported != Some(key) {
                    self.driver.call("close", |d| d.close()).await?;
                    return Err(FleetError::Hardware {
                        key,
                        message: format!(
                            "controller on COM{comport} reports SN {}, expected {key}",
                            reported.map_or_else(|| "?".to_string(), |sn| sn.to_string())
                        ),
                    });
                }
            }
            PiConnectionType::Network => {
                self.driver
                    .call("connect_network", move |d| d.connect_network(key))
                    .await?;
            }
        }

        let channel_amount = self.driver.call("channel_amount", |d| d.channel_amount()).await?;
        self.config.connection_type = desired.connection_type;
        self.config.comport = desired.comport;
        self.config.baud_rate = desired.baud_rate;
        self.config.channel_amount = channel_amount;
        self.config.connected = true;
        self.config.ready = true;
        self.state = SessionState::Connected { ready: true };
        info!(key, connection = ?desired.connection_type, channel_amount, "PI controller connected");
        Ok(())
    }

    async fn load_stages(&mut self, desired: &PiConfiguration) -> FleetResult<()> {
        let mut request: BTreeMap<u8, String> = (1..=self.config.channel_amount)
            .map(|channel| (channel, NO_STAGE.to_string()))
            .collect();
        for stage in desired.stages.values() {
            if stage.channel > self.config.channel_amount {
                return Err(FleetError::Validation(format!(
                    "channel {} exceeds the controller's {} channels",
                    stage.channel, self.config.channel_amount
                )));
            }
            request.insert(stage.channel, stage.device.clone());
        }
        let current: BTreeMap<u8, String> = (1..=self.config.channel_amount)
            .map(|channel| {
                let device = self
                    .config
                    .stages
                    .get(&channel)
                    .map_or_else(|| NO_STAGE.to_string(), |s| s.device.clone());
                (channel, device)
            })
            .collect();
        if request == current {
            return Ok(());
        }
        debug!(key = self.key, ?request, "loading stages");
        self.driver
            .call("assign_stages", move |d| d.assign_stages(&request))
            .await?;
        // Refresh so the closed-loop diff below compares against what the controller now has.
        self.refresh_full().await
    }

    async fn set_servo(&mut self, desired: &PiConfiguration) -> FleetResult<()> {
        let request: BTreeMap<u8, bool> = desired
            .stages
            .values()
            .filter(|stage| !stage.is_empty())
            .filter(|stage| self.config.stages.get(&stage.channel).map(|s| s.clo) != Some(stage.clo))
            .map(|stage| (stage.channel, stage.clo))
            .collect();
        if request.is_empty() {
            return Ok(());
        }
        debug!(key = self.key, ?request, "setting closed loop");
        self.driver.call("set_servo", move |d| d.set_servo(&request)).await?;
        for (channel, stage) in self.config.stages.iter_mut() {
            if let Some(clo) = desired.stages.get(channel).map(|s| s.clo) {
                stage.clo = clo;
            }
        }
        Ok(())
    }

    async fn start_referencing(&mut self, desired: &PiConfiguration) -> FleetResult<()> {
        self.being_referenced.clear();
        let already = self.driver.call("referenced", |d| d.referenced()).await?;
        let request: Vec<u8> = desired
            .stages
            .values()
            .filter(|stage| stage.referenced)
            .filter(|stage| !already.get(&stage.channel).copied().unwrap_or(false))
            .map(|stage| stage.channel)
            .collect();
        if request.is_empty() {
            return Ok(());
        }
        debug!(key = self.key, ?request, "referencing");
        self.being_referenced.extend(request.iter().copied());
        self.driver
            .call("start_reference", move |d| d.start_reference(&request))
            .await
    }

    async fn apply_steps(&mut self, desired: &PiConfiguration) -> FleetResult<()> {
        if !self.link_up() || self.connection_changed(desired) {
            self.events.publish(self.update("Connecting"));
            if let Err(e) = self.connect(desired).await {
                self.config.connected = false;
                if self.state != SessionState::Closed {
                    self.state = SessionState::Unconfigured;
                }
                return Err(e);
            }
        }
        self.events.publish(self.update("New configuration received"));

        // Without stages we only read what the controller already has.
        if desired.stages.is_empty() {
            return self.refresh_full().await;
        }
        self.load_stages(desired).await?;
        self.set_servo(desired).await?;
        self.start_referencing(desired).await?;
        self.refresh_full().await
    }

    async fn full_status(&self) -> FleetResult<FullStatus> {
        self.driver
            .call("full_status", |d| {
                Ok(FullStatus {
                    stages: d.stages()?,
                    servo: d.servo()?,
                    referenced: d.referenced()?,
                    positions: d.positions()?,
                    on_target: d.on_target()?,
                    travel: d.travel_range()?,
                    error: d.last_error()?,
                })
            })
            .await
    }

    fn channel_stage(&self, channel: u8) -> FleetResult<&PiStage> {
        self.config
            .stages
            .get(&channel)
            .ok_or_else(|| self.not_ready(format!("No stage on channel {channel}.")))
    }
}

#[async_trait]
impl ControllerSession for PiSession {
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
        let Configuration::Pi(desired) = desired else {
            return Err(FleetError::Validation(format!(
                "{} configuration sent to PI controller {}",
                desired.family(),
                self.key
            )));
        };
        if desired.id != self.key {
            return Err(FleetError::Internal(format!(
                "configuration {} routed to PI session {}",
                desired.id, self.key
            )));
        }

        match self.apply_steps(desired).await {
            Ok(()) => {
                self.config.error.clear();
                let finished = self.being_referenced.is_empty();
                let message = if finished {
                    "Configuration applied"
                } else {
                    "Configuration applied, referencing"
                };
                let mut update = self
                    .update(message)
                    .with_configuration(Configuration::Pi(self.config.clone()));
                update.finished = finished;
                self.events.publish(update);
                Ok(())
            }
            Err(e) => {
                warn!(key = self.key, "applying configuration failed: {e}");
                self.config.error = e.to_string();
                self.being_referenced.clear();
                // Best effort: show what did get applied.
                if self.link_up() {
                    if let Err(refresh) = self.refresh_full().await {
                        debug!(key = self.key, "refresh after failure: {refresh}");
                    }
                    self.config.error = e.to_string();
                }
                self.rebuild_snapshot();
                self.events.publish(
                    ConfigurationUpdate::done(self.key, e.to_string())
                        .with_configuration(Configuration::Pi(self.config.clone()))
                        .with_error(),
                );
                Err(e)
            }
        }
    }

    async fn refresh_status(&mut self) -> FleetResult<BTreeMap<u8, StageStatus>> {
        self.state.ensure_open(self.key)?;
        if !self.link_up() {
            self.mark_disconnected();
            return Ok(self.snapshot.stage_status());
        }
        let read = self
            .driver
            .call("positions", |d| Ok((d.positions()?, d.on_target()?)))
            .await;
        let (positions, on_target) = match read {
            Ok(values) => values,
            Err(e) if !self.driver.peek(|d| d.is_connected()) => {
                warn!(key = self.key, "connection lost: {e}");
                self.mark_disconnected();
                return Ok(self.snapshot.stage_status());
            }
            Err(e) => return Err(e),
        };
        for (channel, stage) in self.config.stages.iter_mut() {
            if let Some(position) = positions.get(channel) {
                stage.position = *position;
            }
            if let Some(on_target) = on_target.get(channel) {
                stage.on_target = *on_target;
            }
        }
        self.rebuild_snapshot();
        Ok(self.snapshot.stage_status())
    }

    async fn refresh_full(&mut self) -> FleetResult<()> {
        self.state.ensure_open(self.key)?;
        if !self.link_up() {
            self.mark_disconnected();
            return Ok(());
        }
        let status = self.full_status().await?;
        let mut stages = BTreeMap::new();
        for (channel, device) in status.stages {
            if device == NO_STAGE {
                continue;
            }
            let kind = self.catalog.classify(&device).kind;
            stages.insert(
                channel,
                PiStage {
                    channel,
                    clo: status.servo.get(&channel).copied().unwrap_or(false),
                    referenced: status.referenced.get(&channel).copied().unwrap_or(false),
                    min_max: status.travel.get(&channel).copied().unwrap_or([0.0, 0.0]),
                    on_target: status.on_target.get(&channel).copied().unwrap_or(false),
                    position: status.positions.get(&channel).copied().unwrap_or(0.0),
                    kind,
                    device,
                },
            );
        }
        self.config.stages = stages;
        self.config.connected = true;
        self.config.ready = true;
        self.config.error = status.error;
        self.state = SessionState::Connected { ready: true };
        self.rebuild_snapshot();
        Ok(())
    }

    async fn move_to(&mut self, channel: u8, position: f64) -> FleetResult<()> {
        self.state.ensure_ready(self.key, "move axis")?;
        let stage = self.channel_stage(channel)?;
        if !stage.clo {
            return Err(self.not_ready(format!(
                "Cannot move axis: channel {channel} is not in closed-loop operation."
            )));
        }
        if !stage.referenced {
            return Err(self.not_ready(format!(
                "Cannot move axis: channel {channel} is not referenced."
            )));
        }
        self.driver
            .call("move_to", move |d| d.move_to(channel, position))
            .await?;
        if let Some(stage) = self.config.stages.get_mut(&channel) {
            stage.on_target = false;
        }
        self.rebuild_snapshot();
        Ok(())
    }

    async fn step_by(&mut self, channel: u8, delta: f64) -> FleetResult<()> {
        self.state.ensure_ready(self.key, "step axis")?;
        let stage = self.channel_stage(channel)?;
        if !stage.clo {
            return Err(self.not_ready(format!(
                "Cannot step axis: channel {channel} is not in closed-loop operation."
            )));
        }
        if !stage.referenced {
            return Err(self.not_ready(format!(
                "Cannot step axis: channel {channel} is not referenced."
            )));
        }
        self.driver
            .call("step_by", move |d| d.step_by(channel, delta))
            .await?;
        if let Some(stage) = self.config.stages.get_mut(&channel) {
            stage.on_target = false;
        }
        self.rebuild_snapshot();
        Ok(())
    }

    async fn reference(&mut self, channel: u8) -> FleetResult<()> {
        self.state.ensure_ready(self.key, "reference axis")?;
        let stage = self.channel_stage(channel)?;
        if !stage.clo {
            return Err(self.not_ready(format!(
                "Cannot reference axis: channel {channel} is not in closed-loop operation."
            )));
        }
        self.driver
            .call("start_reference", move |d| d.start_reference(&[channel]))
            .await?;
        self.being_referenced.insert(channel);
        self.events
            .publish(self.update(format!("Referencing channel {channel}")));
        Ok(())
    }

    async fn is_configuration_converged(&mut self) -> FleetResult<bool> {
        if self.being_referenced.is_empty() {
            return Ok(true);
        }
        if !self.link_up() {
            self.being_referenced.clear();
            self.events.publish(
                ConfigurationUpdate::done(self.key, "Connection lost while referencing").with_error(),
            );
            return Ok(true);
        }

        let referenced = match self.driver.call("referenced", |d| d.referenced()).await {
            Ok(referenced) => referenced,
            Err(e) => {
                warn!(key = self.key, "reading reference state failed: {e}");
                self.being_referenced.clear();
                self.config.error = e.to_string();
                self.events
                    .publish(ConfigurationUpdate::done(self.key, e.to_string()).with_error());
                return Ok(true);
            }
        };

        let mut vanished = Vec::new();
        self.being_referenced.retain(|channel| match referenced.get(channel) {
            Some(true) => false,
            Some(false) => true,
            None => {
                vanished.push(*channel);
                false
            }
        });
        for channel in vanished {
            self.events.publish(
                self.update(format!("Channel {channel} disappeared while referencing"))
                    .with_error(),
            );
        }
        if !self.being_referenced.is_empty() {
            return Ok(false);
        }

        self.refresh_full().await?;
        self.events.publish(
            ConfigurationUpdate::done(self.key, "Referencing finished")
                .with_configuration(Configuration::Pi(self.config.clone())),
        );
        Ok(true)
    }

    async fn close(&mut self) -> FleetResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        if self.driver.peek(|d| d.is_connected()) {
            if let Err(e) = self.driver.call("halt", |d| d.halt()).await {
                warn!(key = self.key, "motion not stopped before close: {e}");
            }
            self.driver.call("close", |d| d.close()).await?;
        }
        info!(key = self.key, "PI controller closed");
        self.state = SessionState::Closed;
        self.being_referenced.clear();
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
    use crate::events::FleetEvent;
    use parking_lot::Mutex;
    use std::time::Duration;

    const SN: ConfigurationId = 118_012_345;

    fn family() -> PiFamily {
        let mut settings = Settings::default();
        settings.simulation.settle_ms = 20;
        PiFamily::with_simulation(Arc::new(StageCatalog::default()), &settings)
    }

    fn desired() -> PiConfiguration {
        let mut stage = PiStage::new(1, "L-406.20DD10");
        stage.clo = true;
        stage.referenced = true;
        PiConfiguration::new(SN, PiControllerModel::Simulated, PiConnectionType::Usb).with_stage(stage)
    }

    fn record(session: &PiSession) -> Arc<Mutex<Vec<FleetEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = session.events().subscribe(&EventKind::SESSION).unwrap();
        for kind in EventKind::SESSION {
            let seen = Arc::clone(&seen);
            sub.on(kind, move |e| seen.lock().push(e.clone())).unwrap();
        }
        seen
    }

    #[test]
    fn test_idn_and_usb_parsing() {
        assert_eq!(
            idn_serial("(c)2015 Physik Instrumente (PI) GmbH & Co. KG, C-884.4DC, 118012345, 1.1.2"),
            Some(SN)
        );
        assert_eq!(idn_serial("garbage"), None);
        assert!(usb_lists(&["PI C-884 SN 118012345".to_string()], SN));
        assert!(!usb_lists(&["PI C-884 SN 118012346".to_string()], SN));
    }

    #[test]
    fn test_validate_requires_driver() {
        let family = PiFamily::new(Arc::new(StageCatalog::default()), Duration::from_secs(1));
        let config = Configuration::Pi(desired());
        assert!(matches!(family.validate(&config), Err(FleetError::Validation(_))));
        assert!(self::family().validate(&config).is_ok());
    }

    #[tokio::test]
    async fn test_apply_references_then_converges() {
        let mut session = family().open_session(&Configuration::Pi(desired())).unwrap();
        let seen = record(&session);
        session
            .apply_configuration(&Configuration::Pi(desired()))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Connected { ready: true });
        assert_eq!(session.being_referenced().len(), 1);
        assert!(!session.is_configuration_converged().await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(session.is_configuration_converged().await.unwrap());
        let snapshot = session.snapshot();
        let stage = &snapshot.stages[&1];
        assert_eq!(stage.info.identifier, SN * 10 + 1);
        assert!(stage.status.ready);

        let finished = seen.lock().iter().any(|e| {
            matches!(e, FleetEvent::ConfigurationUpdate(u) if u.finished && !u.error)
        });
        assert!(finished);
    }

    #[tokio::test]
    async fn test_absent_usb_controller_fails_with_serial() {
        let mut family = family();
        family.register_factory(
            PiControllerModel::Simulated,
            Arc::new(|config: &PiConfiguration| {
                Ok(Box::new(SimulatedPiDriver::new(config.id, 4).with_usb_devices(Vec::new()))
                    as Box<dyn PiDriver>)
            }),
        );
        let mut session = family.open_session(&Configuration::Pi(desired())).unwrap();
        let err = session
            .apply_configuration(&Configuration::Pi(desired()))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::Hardware { key: SN, .. }));
        assert_eq!(session.state(), SessionState::Unconfigured);
        match session.snapshot().configuration {
            Some(Configuration::Pi(config)) => {
                assert!(!config.connected);
                assert!(!config.error.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_move_requires_closed_loop() {
        let mut open_loop = desired();
        if let Some(stage) = open_loop.stages.get_mut(&1) {
            stage.clo = false;
            stage.referenced = false;
        }
        let mut session = family().open_session(&Configuration::Pi(open_loop.clone())).unwrap();
        session
            .apply_configuration(&Configuration::Pi(open_loop))
            .await
            .unwrap();
        assert!(matches!(
            session.move_to(1, 5.0).await,
            Err(FleetError::NotReady { key: SN, .. })
        ));
        assert!(matches!(
            session.move_to(3, 5.0).await,
            Err(FleetError::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn test_move_and_refresh() {
        let mut session = family().open_session(&Configuration::Pi(desired())).unwrap();
        session
            .apply_configuration(&Configuration::Pi(desired()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(session.is_configuration_converged().await.unwrap());

        session.move_to(1, 12.0).await.unwrap();
        assert!(!session.snapshot().stages[&1].status.on_target);
        tokio::time::sleep(Duration::from_millis(40)).await;
        let status = session.refresh_status().await.unwrap();
        assert_eq!(status[&1].position, 12.0);
        assert!(status[&1].on_target);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let mut session = family().open_session(&Configuration::Pi(desired())).unwrap();
        session
            .apply_configuration(&Configuration::Pi(desired()))
            .await
            .unwrap();
        let seen = record(&session);
        session.close().await.unwrap();

        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.snapshot().stages.values().all(|s| !s.status.connected));
        assert_eq!(
            session.move_to(1, 1.0).await,
            Err(FleetError::SessionClosed(SN))
        );
        assert!(seen
            .lock()
            .iter()
            .any(|e| matches!(e, FleetEvent::StageRemoved(r) if r.identifier == SN * 10 + 1)));
    }

    #[tokio::test]
    async fn test_close_halts_motion_first() {
        let log = CommandLog::default();
        let mut family = PiFamily::new(Arc::new(StageCatalog::default()), Duration::from_secs(1));
        let shared = Arc::clone(&log);
        family.register_factory(
            PiControllerModel::Simulated,
            Arc::new(move |config: &PiConfiguration| {
                Ok(Box::new(
                    SimulatedPiDriver::new(config.id, 4)
                        .with_settle(Duration::from_millis(5))
                        .with_log(Arc::clone(&shared)),
                ) as Box<dyn PiDriver>)
            }),
        );
        let mut session = family.open_session(&Configuration::Pi(desired())).unwrap();
        session
            .apply_configuration(&Configuration::Pi(desired()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.is_configuration_converged().await.unwrap());
        session.move_to(1, 100.0).await.unwrap();

        session.close().await.unwrap();
        let log = log.lock();
        assert_eq!(log[log.len() - 2..], ["halt", "close"]);
    }

    #[tokio::test]
    async fn test_reapply_skips_unchanged_steps() {
        let mut session = family().open_session(&Configuration::Pi(desired())).unwrap();
        session
            .apply_configuration(&Configuration::Pi(desired()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(session.is_configuration_converged().await.unwrap());

        // Already referenced: nothing new to wait for.
        session
            .apply_configuration(&Configuration::Pi(desired()))
            .await
            .unwrap();
        assert!(session.being_referenced().is_empty());
        assert!(session.is_configuration_converged().await.unwrap());
    }
}
