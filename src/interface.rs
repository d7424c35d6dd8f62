//! Controller interfaces: one per hardware family.
//!
//! [`SessionInterface`] owns the sessions of one family keyed by configuration ID and
//! implements everything that is the same for every family:
//!
//! - reconciliation of submitted configurations, one [`UpdateResponse`] per item
//! - removal that closes the hardware before the entry disappears
//! - the convergence query consumed by the scheduler
//! - bulk commands batched to one call per physical controller
//!
//! # Concurrency
//!
//! Each session sits behind its own async mutex, so requests for one controller are
//! serialized while unrelated controllers proceed independently. The session map and
//! the snapshot caches use short synchronous locks that are never held across an
//! `.await`.

use crate::error::{FleetError, FleetResult};
use crate::events::{EventBus, EventKind, Notice, Subscription, UpdateResponse};
use crate::families::ControllerFamily;
use crate::model::{
    ActionRequest, Addressing, CompoundId, Configuration, ConfigurationId, Device, Identifier,
    StageStatus, MOVE_TO, REFERENCE, STEP_BY, UNPARSED_IDENTIFIER,
};
use crate::session::{ControllerSession, SessionSnapshot, SessionState};
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Family-independent surface of a controller interface, as used by the fleet.
#[async_trait]
pub trait ControllerInterface: Send + Sync {
    /// Family name, matching the `controller_type` of its configurations.
    fn name(&self) -> &str;

    /// Bus re-publishing every session's events.
    fn events(&self) -> &EventBus;

    /// Identifier scheme of the family.
    fn addressing(&self) -> Addressing;

    /// Configuration keys currently tracked.
    fn keys(&self) -> Vec<ConfigurationId>;

    /// Every device identifier currently known.
    fn identifiers(&self) -> Vec<Identifier>;

    /// Whether `identifier` decodes to a tracked key and a known channel.
    fn owns(&self, identifier: Identifier) -> bool;

    /// Whether configuration `key` is tracked.
    fn owns_configuration(&self, key: ConfigurationId) -> bool;

    /// Reconcile raw configuration items. Returns one response per item, in order.
    async fn configuration_change_request(&self, items: Vec<Value>) -> Vec<UpdateResponse>;

    /// Close the session for `key` and forget it. False if unknown or if closing failed.
    async fn remove_configuration(&self, key: ConfigurationId) -> bool;

    /// The subset of `keys` whose last change has not fully taken effect yet.
    async fn is_configuration_configured(&self, keys: &[ConfigurationId]) -> Vec<ConfigurationId>;

    /// Live status per identifier, in input order.
    async fn stage_status(
        &self,
        identifiers: &[Identifier],
    ) -> FleetResult<Vec<FleetResult<StageStatus>>>;

    /// Refresh and return the devices behind `identifiers`, in input order.
    async fn refresh_devices(&self, identifiers: &[Identifier])
        -> FleetResult<Vec<FleetResult<Device>>>;

    /// Full re-read of the given configurations (all when `None`).
    async fn refresh_configurations(
        &self,
        keys: Option<Vec<ConfigurationId>>,
    ) -> Vec<FleetResult<Configuration>>;

    /// Run one action against the device it names.
    async fn execute_action(&self, request: &ActionRequest) -> FleetResult<()>;

    /// The subset of `identifiers` still moving.
    async fn on_target_pending(&self, identifiers: &[Identifier]) -> FleetResult<Vec<Identifier>>;

    /// Last known configurations, without touching hardware.
    fn current_configurations(&self) -> Vec<Configuration>;

    /// Last known devices, without touching hardware.
    fn devices(&self) -> Vec<Device>;

    /// Close every session.
    async fn close_all(&self);
}

/// A session plus what the interface keeps next to it.
struct SessionSlot<S> {
    session: tokio::sync::Mutex<S>,
    /// Refreshed after every session call
    snapshot: RwLock<SessionSnapshot>,
    /// Session bus -> interface bus
    forward: Mutex<Option<Subscription>>,
}

impl<S: ControllerSession> SessionSlot<S> {
    fn new(session: S, forward: Subscription) -> Self {
        let snapshot = session.snapshot();
        Self {
            session: tokio::sync::Mutex::new(session),
            snapshot: RwLock::new(snapshot),
            forward: Mutex::new(Some(forward)),
        }
    }

    fn store(&self, session: &S) {
        *self.snapshot.write() = session.snapshot();
    }

    fn detach(&self) {
        if let Some(forward) = self.forward.lock().take() {
            forward.unsubscribe();
        }
    }
}

/// Generic controller interface over one family's sessions.
pub struct SessionInterface<F: ControllerFamily> {
    family: F,
    addressing: Addressing,
    events: EventBus,
    sessions: RwLock<BTreeMap<ConfigurationId, Arc<SessionSlot<F::Session>>>>,
}

impl<F: ControllerFamily> std::fmt::Debug for SessionInterface<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionInterface")
            .field("family", &self.family.name())
            .field("sessions", &self.sessions.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<F: ControllerFamily> SessionInterface<F> {
    /// Interface with no sessions yet.
    pub fn new(family: F) -> Self {
        let addressing = family.addressing();
        let events = EventBus::new(format!("{} interface", family.name()), &EventKind::SESSION);
        Self {
            family,
            addressing,
            events,
            sessions: RwLock::new(BTreeMap::new()),
        }
    }

    /// The family this interface drives.
    pub fn family(&self) -> &F {
        &self.family
    }

    fn slot(&self, key: ConfigurationId) -> Option<Arc<SessionSlot<F::Session>>> {
        self.sessions.read().get(&key).cloned()
    }

    fn slots(&self) -> Vec<(ConfigurationId, Arc<SessionSlot<F::Session>>)> {
        self.sessions
            .read()
            .iter()
            .map(|(key, slot)| (*key, Arc::clone(slot)))
            .collect()
    }

    /// The slot for `configuration`, creating an idle session for unknown keys.
    fn slot_for(
        &self,
        configuration: &Configuration,
    ) -> FleetResult<(Arc<SessionSlot<F::Session>>, bool)> {
        let key = configuration.id();
        let mut sessions = self.sessions.write();
        if let Some(slot) = sessions.get(&key) {
            return Ok((Arc::clone(slot), false));
        }
        let session = self.family.open_session(configuration)?;
        let forward = self.events.forward(&EventKind::SESSION, session.events())?;
        let slot = Arc::new(SessionSlot::new(session, forward));
        sessions.insert(key, Arc::clone(&slot));
        info!(family = self.family.name(), key, "new session");
        Ok((slot, true))
    }

    /// Drop `slot` from the map if it is still the one registered for `key`.
    fn forget(&self, key: ConfigurationId, slot: &Arc<SessionSlot<F::Session>>) {
        let mut sessions = self.sessions.write();
        if sessions.get(&key).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            sessions.remove(&key);
        }
    }

    async fn apply(&self, configuration: &Configuration) -> FleetResult<()> {
        let key = configuration.id();
        loop {
            let (slot, created) = self.slot_for(configuration)?;
            let mut session = slot.session.lock().await;
            if session.state() == SessionState::Closed {
                // Removed while we were waiting; look the key up again.
                drop(session);
                tokio::task::yield_now().await;
                continue;
            }
            let result = session.apply_configuration(configuration).await;
            slot.store(&session);
            if result.is_err() && created {
                debug!(key, "first configuration failed, dropping the new session");
                if let Err(e) = session.close().await {
                    warn!(key, "closing failed session: {e}");
                }
                slot.store(&session);
                self.forget(key, &slot);
                slot.detach();
            }
            return result;
        }
    }

    async fn apply_item(&self, item: Value) -> UpdateResponse {
        let (id, parsed) = Configuration::parse(&item);
        let identifier = id.unwrap_or(UNPARSED_IDENTIFIER);
        let configuration = match parsed.and_then(|c| self.family.validate(&c).map(|()| c)) {
            Ok(configuration) => configuration,
            Err(e) => {
                warn!(family = self.family.name(), identifier, "rejected configuration: {e}");
                return UpdateResponse::failed(identifier, e);
            }
        };
        match self.apply(&configuration).await {
            Ok(()) => UpdateResponse::ok(configuration.id()),
            Err(e) => {
                warn!(family = self.family.name(), key = configuration.id(), "configuration failed: {e}");
                UpdateResponse::failed(configuration.id(), e)
            }
        }
    }

    /// Run `op` once per controller named in `identifiers` and scatter the per-channel
    /// results back in input order.
    ///
    /// A malformed identifier fails the whole call before any hardware is touched.
    /// An identifier on an unknown controller, or on a channel `op` did not answer
    /// for, gets [`FleetError::UnknownIdentifier`]. A failing controller's error is
    /// copied to each of its identifiers.
    pub async fn bulk_command<R, Op>(
        &self,
        identifiers: &[Identifier],
        op: Op,
    ) -> FleetResult<Vec<FleetResult<R>>>
    where
        R: Clone + Send,
        Op: for<'a> Fn(&'a mut F::Session, Vec<u8>) -> BoxFuture<'a, FleetResult<BTreeMap<u8, R>>>
            + Sync,
    {
        let decoded = identifiers
            .iter()
            .map(|id| self.addressing.decode(*id))
            .collect::<FleetResult<Vec<CompoundId>>>()?;

        let mut groups: BTreeMap<ConfigurationId, Vec<u8>> = BTreeMap::new();
        for id in &decoded {
            let channels = groups.entry(id.key).or_default();
            if !channels.contains(&id.channel) {
                channels.push(id.channel);
            }
        }

        let op = &op;
        let calls = groups.into_iter().filter_map(|(key, channels)| {
            let slot = self.slot(key)?;
            Some(async move {
                let mut session = slot.session.lock().await;
                let result = op(&mut *session, channels).await;
                slot.store(&session);
                (key, result)
            })
        });
        let results: HashMap<ConfigurationId, FleetResult<BTreeMap<u8, R>>> =
            join_all(calls).await.into_iter().collect();

        Ok(identifiers
            .iter()
            .zip(decoded)
            .map(|(identifier, id)| match results.get(&id.key) {
                Some(Ok(by_channel)) => by_channel
                    .get(&id.channel)
                    .cloned()
                    .ok_or(FleetError::UnknownIdentifier(*identifier)),
                Some(Err(e)) => Err(e.clone()),
                None => Err(FleetError::UnknownIdentifier(*identifier)),
            })
            .collect())
    }
}

#[async_trait]
impl<F: ControllerFamily> ControllerInterface for SessionInterface<F> {
    fn name(&self) -> &str {
        self.family.name()
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    fn addressing(&self) -> Addressing {
        self.addressing
    }

    fn keys(&self) -> Vec<ConfigurationId> {
        self.sessions.read().keys().copied().collect()
    }

    fn identifiers(&self) -> Vec<Identifier> {
        self.slots()
            .into_iter()
            .flat_map(|(_, slot)| slot.snapshot.read().identifiers())
            .collect()
    }

    fn owns(&self, identifier: Identifier) -> bool {
        let Ok(id) = self.addressing.decode(identifier) else {
            return false;
        };
        self.slot(id.key).is_some_and(|slot| {
            slot.snapshot
                .read()
                .stages
                .get(&id.channel)
                .is_some_and(|stage| stage.info.identifier == identifier)
        })
    }

    fn owns_configuration(&self, key: ConfigurationId) -> bool {
        self.sessions.read().contains_key(&key)
    }

    async fn configuration_change_request(&self, items: Vec<Value>) -> Vec<UpdateResponse> {
        join_all(items.into_iter().map(|item| self.apply_item(item))).await
    }

    async fn remove_configuration(&self, key: ConfigurationId) -> bool {
        let Some(slot) = self.slot(key) else {
            debug!(family = self.family.name(), key, "remove: unknown configuration");
            return false;
        };
        let mut session = slot.session.lock().await;
        if session.state() == SessionState::Closed {
            return false;
        }
        match session.close().await {
            Ok(()) => {
                slot.store(&session);
                self.forget(key, &slot);
                drop(session);
                slot.detach();
                info!(family = self.family.name(), key, "configuration removed");
                true
            }
            Err(e) => {
                warn!(family = self.family.name(), key, "closing session failed: {e}");
                slot.store(&session);
                self.events.publish(Notice::new(
                    None,
                    format!("Could not remove configuration {key}: {e}"),
                ));
                false
            }
        }
    }

    async fn is_configuration_configured(&self, keys: &[ConfigurationId]) -> Vec<ConfigurationId> {
        let checks = keys.iter().filter_map(|key| {
            let slot = self.slot(*key)?;
            Some(async move {
                let mut session = slot.session.lock().await;
                let converged = match session.is_configuration_converged().await {
                    Ok(converged) => converged,
                    Err(e) => {
                        warn!(key = *key, "convergence check failed: {e}");
                        true
                    }
                };
                slot.store(&session);
                (!converged).then_some(*key)
            })
        });
        join_all(checks).await.into_iter().flatten().collect()
    }

    async fn stage_status(
        &self,
        identifiers: &[Identifier],
    ) -> FleetResult<Vec<FleetResult<StageStatus>>> {
        self.bulk_command(identifiers, |session, _channels| session.refresh_status())
            .await
    }

    async fn refresh_devices(
        &self,
        identifiers: &[Identifier],
    ) -> FleetResult<Vec<FleetResult<Device>>> {
        self.bulk_command(identifiers, |session, _channels| {
            Box::pin(async move {
                session.refresh_status().await?;
                let snapshot = session.snapshot();
                let devices: BTreeMap<u8, Device> = snapshot
                    .stages
                    .iter()
                    .map(|(channel, stage)| (*channel, stage.device(snapshot.key)))
                    .collect();
                Ok::<_, FleetError>(devices)
            })
        })
        .await
    }

    async fn refresh_configurations(
        &self,
        keys: Option<Vec<ConfigurationId>>,
    ) -> Vec<FleetResult<Configuration>> {
        let keys = keys.unwrap_or_else(|| self.keys());
        let refreshes = keys.into_iter().map(|key| async move {
            let slot = self
                .slot(key)
                .ok_or(FleetError::UnknownConfiguration(key))?;
            let mut session = slot.session.lock().await;
            let result = session.refresh_full().await;
            slot.store(&session);
            result?;
            session
                .snapshot()
                .configuration
                .ok_or(FleetError::UnknownConfiguration(key))
        });
        join_all(refreshes).await
    }

    async fn execute_action(&self, request: &ActionRequest) -> FleetResult<()> {
        let id = self.addressing.decode(request.device_id)?;
        let slot = self
            .slot(id.key)
            .ok_or(FleetError::UnknownIdentifier(request.device_id))?;
        let device = slot
            .snapshot
            .read()
            .stages
            .get(&id.channel)
            .map(|stage| stage.device(id.key))
            .ok_or(FleetError::UnknownIdentifier(request.device_id))?;
        let action = device.resolve_action(request)?;
        let value = request.value.and_then(|v| v.as_f64());
        let missing = || FleetError::Validation(format!("action {:?} needs a value", action.name));

        let mut session = slot.session.lock().await;
        debug!(identifier = request.device_id, action = action.name, ?value, "action");
        let result = match action.name {
            MOVE_TO => match value {
                Some(position) => session.move_to(id.channel, position).await,
                None => Err(missing()),
            },
            STEP_BY => match value {
                Some(delta) => session.step_by(id.channel, delta).await,
                None => Err(missing()),
            },
            REFERENCE => session.reference(id.channel).await,
            other => Err(FleetError::UnknownAction {
                identifier: request.device_id,
                action: other.to_string(),
            }),
        };
        slot.store(&session);
        result
    }

    async fn on_target_pending(&self, identifiers: &[Identifier]) -> FleetResult<Vec<Identifier>> {
        let statuses = self.stage_status(identifiers).await?;
        Ok(identifiers
            .iter()
            .zip(statuses)
            .filter_map(|(identifier, status)| match status {
                Ok(status) => (!status.on_target && status.connected).then_some(*identifier),
                Err(e) => {
                    debug!(identifier, "dropping from motion check: {e}");
                    None
                }
            })
            .collect())
    }

    fn current_configurations(&self) -> Vec<Configuration> {
        self.slots()
            .into_iter()
            .filter_map(|(_, slot)| slot.snapshot.read().configuration.clone())
            .collect()
    }

    fn devices(&self) -> Vec<Device> {
        self.slots()
            .into_iter()
            .flat_map(|(_, slot)| slot.snapshot.read().devices())
            .collect()
    }

    async fn close_all(&self) {
        for key in self.keys() {
            self.remove_configuration(key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::families::{PiFamily, VirtualFamily};
    use crate::settings::StageCatalog;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn virtual_interface() -> SessionInterface<VirtualFamily> {
        SessionInterface::new(VirtualFamily::new(Duration::ZERO))
    }

    fn pi_interface() -> SessionInterface<PiFamily> {
        let mut settings = Settings::default();
        settings.simulation.settle_ms = 10;
        SessionInterface::new(PiFamily::with_simulation(
            Arc::new(StageCatalog::default()),
            &settings,
        ))
    }

    fn pi_item(id: i64, channels: &[u8]) -> Value {
        let stages: Vec<Value> = channels
            .iter()
            .map(|c| json!({ "channel": c, "device": "L-406.20DD10" }))
            .collect();
        json!({
            "controller_type": "PI",
            "id": id,
            "model": "Simulated",
            "connection_type": "usb",
            "stages": stages,
        })
    }

    fn virtual_item(id: i64, maximum: f64) -> Value {
        json!({ "controller_type": "Virtual", "id": id, "maximum": maximum })
    }

    #[tokio::test]
    async fn test_responses_keep_order_and_isolate_failures() {
        let interface = virtual_interface();
        let responses = interface
            .configuration_change_request(vec![
                virtual_item(1, 10.0),
                json!({ "controller_type": "Virtual", "id": 2, "maximum": "far" }),
                json!({ "nonsense": true }),
                virtual_item(3, 5.0),
            ])
            .await;
        assert_eq!(responses.len(), 4);
        assert_eq!(responses[0], UpdateResponse::ok(1));
        assert!(!responses[1].success);
        assert_eq!(responses[1].identifier, 2);
        assert_eq!(responses[2].identifier, UNPARSED_IDENTIFIER);
        assert_eq!(responses[3], UpdateResponse::ok(3));
        assert_eq!(interface.keys(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_wrong_family_rejected() {
        let interface = virtual_interface();
        let responses = interface
            .configuration_change_request(vec![pi_item(7, &[1])])
            .await;
        assert!(!responses[0].success);
        assert!(interface.keys().is_empty());
    }

    #[tokio::test]
    async fn test_failed_first_apply_leaves_no_entry() {
        let interface = pi_interface();
        let mut item = pi_item(42, &[1]);
        item["connection_type"] = json!("rs232");
        item["comport"] = json!(3);
        let ok = interface.configuration_change_request(vec![item]).await;
        assert!(ok[0].success);

        // The simulated controller has four channels.
        let failed = interface
            .configuration_change_request(vec![pi_item(43, &[9])])
            .await;
        assert!(!failed[0].success);
        assert!(!interface.owns_configuration(43));
        assert!(interface.owns_configuration(42));
    }

    #[tokio::test]
    async fn test_remove_configuration() {
        let interface = virtual_interface();
        assert!(!interface.remove_configuration(1).await);
        interface
            .configuration_change_request(vec![virtual_item(1, 10.0)])
            .await;
        assert!(interface.owns(1));
        assert!(interface.remove_configuration(1).await);
        assert!(!interface.owns(1));
        assert!(interface.is_configuration_configured(&[1]).await.is_empty());
        assert_eq!(
            interface.stage_status(&[1]).await.unwrap(),
            vec![Err(FleetError::UnknownIdentifier(1))]
        );
    }

    #[tokio::test]
    async fn test_bulk_batches_per_controller() {
        let interface = pi_interface();
        let responses = interface
            .configuration_change_request(vec![pi_item(5, &[1, 2, 3])])
            .await;
        assert!(responses[0].success);

        let calls = AtomicUsize::new(0);
        let results = interface
            .bulk_command(&[53, 51, 52], |session, _channels| {
                calls.fetch_add(1, Ordering::SeqCst);
                session.refresh_status()
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let order: Vec<Identifier> = results
            .iter()
            .map(|r| r.as_ref().unwrap().identifier)
            .collect();
        assert_eq!(order, vec![53, 51, 52]);
    }

    #[tokio::test]
    async fn test_bulk_one_call_per_distinct_controller() {
        let interface = virtual_interface();
        interface
            .configuration_change_request(vec![
                virtual_item(1, 10.0),
                virtual_item(2, 10.0),
                virtual_item(3, 10.0),
            ])
            .await;

        let calls = AtomicUsize::new(0);
        let results = interface
            .bulk_command(&[3, 1, 2, 9], |session, _channels| {
                calls.fetch_add(1, Ordering::SeqCst);
                session.refresh_status()
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].as_ref().unwrap().identifier, 3);
        assert_eq!(results[3], Err(FleetError::UnknownIdentifier(9)));
    }

    #[tokio::test]
    async fn test_malformed_identifier_fails_loudly() {
        let interface = pi_interface();
        interface
            .configuration_change_request(vec![pi_item(5, &[1])])
            .await;
        let err = interface.stage_status(&[51, 50]).await.unwrap_err();
        assert!(matches!(err, FleetError::MalformedIdentifier { identifier: 50, .. }));
    }

    #[tokio::test]
    async fn test_actions_route_to_session() {
        let interface = virtual_interface();
        interface
            .configuration_change_request(vec![virtual_item(1, 10.0)])
            .await;
        interface
            .execute_action(&ActionRequest::move_to(1, 7.0))
            .await
            .unwrap();
        let status = interface.stage_status(&[1]).await.unwrap().remove(0).unwrap();
        assert_eq!(status.position, 7.0);
        assert!(status.on_target);

        let unknown = ActionRequest::new(1, "Dance", None);
        assert!(matches!(
            interface.execute_action(&unknown).await,
            Err(FleetError::UnknownAction { identifier: 1, .. })
        ));
        assert!(matches!(
            interface.execute_action(&ActionRequest::move_to(4, 1.0)).await,
            Err(FleetError::UnknownIdentifier(4))
        ));
    }

    #[tokio::test]
    async fn test_session_events_reach_interface_bus() {
        let interface = virtual_interface();
        let (_subscription, mut rx) = interface.events().channel(&[EventKind::DeviceUpdate]).unwrap();
        interface
            .configuration_change_request(vec![virtual_item(1, 10.0)])
            .await;
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind(), EventKind::DeviceUpdate);
    }
}
