//! Fleet orchestrator.
//!
//! [`Fleet`] is the single entry point for hosts: it knows every controller interface,
//! routes identifier-addressed requests to the interface that owns them and re-publishes
//! every interface's events on its own bus. It is an explicitly constructed value; hosts
//! share it behind an `Arc`.
//!
//! ```rust,ignore
//! let fleet = Arc::new(Fleet::new());
//! fleet.add_interface(Arc::new(SessionInterface::new(VirtualFamily::new(settle))))?;
//! let responses = fleet.update_configurations(items).await?;
//! ```

use crate::error::{FleetError, FleetResult};
use crate::events::{EventBus, EventKind, UpdateResponse};
use crate::interface::ControllerInterface;
use crate::model::{
    ActionRequest, Addressing, Configuration, ConfigurationId, Device, Identifier, StageStatus,
    UNPARSED_IDENTIFIER,
};
use crate::settings::{ConfigurationSets, MemorySettingsStore, SettingsResult};
use futures::future::{join_all, BoxFuture};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type Interface = Arc<dyn ControllerInterface>;

/// A configuration key routed to a family but not yet answered.
#[derive(Debug, Clone)]
struct Claim {
    family: String,
    addressing: Addressing,
    key: ConfigurationId,
}

/// Claims held by one `update_configurations` call; released on drop.
struct Reservation<'a> {
    in_flight: &'a Mutex<Vec<Claim>>,
    held: Vec<Claim>,
}

impl<'a> Reservation<'a> {
    fn new(in_flight: &'a Mutex<Vec<Claim>>) -> Self {
        Self {
            in_flight,
            held: Vec::new(),
        }
    }

    /// Check and register under one lock so concurrent batches see each other.
    fn claim(&mut self, check: impl FnOnce(&[Claim]) -> FleetResult<Claim>) -> FleetResult<()> {
        let mut in_flight = self.in_flight.lock();
        let claim = check(&in_flight)?;
        in_flight.push(claim.clone());
        self.held.push(claim);
        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        for claim in self.held.drain(..) {
            if let Some(pos) = in_flight
                .iter()
                .position(|c| c.family == claim.family && c.key == claim.key)
            {
                in_flight.swap_remove(pos);
            }
        }
    }
}

/// Composes all controller interfaces.
pub struct Fleet {
    events: EventBus,
    interfaces: RwLock<Vec<Interface>>,
    in_flight: Mutex<Vec<Claim>>,
    sets: ConfigurationSets,
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .interfaces
            .read()
            .iter()
            .map(|i| i.name().to_string())
            .collect();
        f.debug_struct("Fleet").field("interfaces", &names).finish()
    }
}

impl Default for Fleet {
    fn default() -> Self {
        Self::new()
    }
}

impl Fleet {
    /// A fleet without interfaces whose saved sets live in memory.
    pub fn new() -> Self {
        Self::with_sets(ConfigurationSets::new(Arc::new(MemorySettingsStore::new())))
    }

    /// A fleet without interfaces whose saved sets live in `sets`.
    pub fn with_sets(sets: ConfigurationSets) -> Self {
        Self {
            events: EventBus::new("fleet", &EventKind::ALL),
            interfaces: RwLock::new(Vec::new()),
            in_flight: Mutex::new(Vec::new()),
            sets,
        }
    }

    /// Bus carrying every interface's events plus `UpdateResponse`s.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register `interface` under its family name and start re-publishing its events.
    pub fn add_interface(&self, interface: Interface) -> FleetResult<()> {
        let mut interfaces = self.interfaces.write();
        if interfaces.iter().any(|i| i.name() == interface.name()) {
            return Err(FleetError::DuplicateInterface(interface.name().to_string()));
        }
        // The subscription stays registered for the fleet's lifetime.
        let _forward = self
            .events
            .forward(interface.events().declared(), interface.events())?;
        info!(family = interface.name(), "controller interface added");
        interfaces.push(interface);
        Ok(())
    }

    /// The interface registered for family `name`.
    pub fn interface(&self, name: &str) -> Option<Interface> {
        self.interfaces
            .read()
            .iter()
            .find(|i| i.name() == name)
            .cloned()
    }

    /// Family names in registration order.
    pub fn interface_names(&self) -> Vec<String> {
        self.interfaces
            .read()
            .iter()
            .map(|i| i.name().to_string())
            .collect()
    }

    fn interfaces(&self) -> Vec<Interface> {
        self.interfaces.read().clone()
    }

    /// The interface that knows device `identifier`.
    pub fn resolve_owner(&self, identifier: Identifier) -> FleetResult<Interface> {
        self.single_owner(identifier, |i| i.owns(identifier))?
            .ok_or(FleetError::UnknownIdentifier(identifier))
    }

    /// The interface tracking configuration `key`.
    pub fn resolve_configuration_owner(&self, key: ConfigurationId) -> FleetResult<Interface> {
        self.single_owner(key, |i| i.owns_configuration(key))?
            .ok_or(FleetError::UnknownConfiguration(key))
    }

    fn single_owner(
        &self,
        identifier: Identifier,
        claims: impl Fn(&Interface) -> bool,
    ) -> FleetResult<Option<Interface>> {
        let owners: Vec<Interface> = self
            .interfaces
            .read()
            .iter()
            .filter(|i| claims(i))
            .cloned()
            .collect();
        match owners.len() {
            0 | 1 => Ok(owners.into_iter().next()),
            _ => {
                let families = owners.iter().map(|i| i.name().to_string()).collect();
                error!(identifier, ?families, "identifier claimed by several interfaces");
                Err(FleetError::AmbiguousIdentifier {
                    identifier,
                    families,
                })
            }
        }
    }

    /// Check that configuration `key` of `interface` shares neither its key nor any
    /// identifier with a configuration of another family, tracked or in flight.
    fn check_collision(
        &self,
        interface: &Interface,
        key: ConfigurationId,
        in_flight: &[Claim],
    ) -> FleetResult<()> {
        let addressing = interface.addressing();
        let tracked = self
            .interfaces()
            .into_iter()
            .filter(|other| other.name() != interface.name())
            .flat_map(|other| {
                let family = other.name().to_string();
                let other_addressing = other.addressing();
                other.keys().into_iter().map(move |other_key| Claim {
                    family: family.clone(),
                    addressing: other_addressing,
                    key: other_key,
                })
            })
            .collect::<Vec<_>>();
        let conflict = tracked
            .iter()
            .chain(in_flight.iter().filter(|c| c.family != interface.name()))
            .find(|c| addressing.collides(key, c.addressing, c.key));
        match conflict {
            Some(claim) => Err(FleetError::ConfigurationCollision {
                key,
                family: claim.family.clone(),
                other_key: claim.key,
            }),
            None => Ok(()),
        }
    }

    /// Run every request concurrently; each outcome is independent of the others.
    pub async fn execute_actions(&self, requests: Vec<ActionRequest>) -> Vec<FleetResult<()>> {
        join_all(requests.into_iter().map(|request| async move {
            let owner = self.resolve_owner(request.device_id)?;
            let result = owner.execute_action(&request).await;
            if let Err(e) = &result {
                warn!(identifier = request.device_id, action = %request.action, "action failed: {e}");
            }
            result
        }))
        .await
    }

    /// Reconcile raw configuration items across all families.
    ///
    /// Items are routed by their `controller_type`. The result holds exactly one
    /// response per item, in submission order; each is also published as an
    /// `UpdateResponse` event. An item whose key or identifiers would collide with a
    /// configuration of another family is rejected without touching hardware.
    ///
    /// Per-item failures never abort the batch. An interface that does not answer
    /// every item it was given fails the whole call with `Internal`.
    pub async fn update_configurations(&self, items: Vec<Value>) -> FleetResult<Vec<UpdateResponse>> {
        let mut responses: Vec<Option<UpdateResponse>> = vec![None; items.len()];
        let mut batches: BTreeMap<String, (Interface, Vec<usize>, Vec<Value>)> = BTreeMap::new();
        let mut reservation = Reservation::new(&self.in_flight);

        for (index, item) in items.into_iter().enumerate() {
            let family = item
                .get("controller_type")
                .and_then(Value::as_str)
                .map(str::to_string);
            let key = Configuration::raw_id(&item);
            let Some(interface) = family.as_deref().and_then(|name| self.interface(name)) else {
                let identifier = key.unwrap_or(UNPARSED_IDENTIFIER);
                let family = family.unwrap_or_else(|| "<missing controller_type>".to_string());
                warn!(identifier, %family, "no interface for configuration");
                responses[index] = Some(UpdateResponse::failed(
                    identifier,
                    FleetError::UnknownFamily(family),
                ));
                continue;
            };
            if let Some(key) = key {
                if let Err(e) = reservation.claim(|in_flight| {
                    self.check_collision(&interface, key, in_flight)?;
                    Ok(Claim {
                        family: interface.name().to_string(),
                        addressing: interface.addressing(),
                        key,
                    })
                }) {
                    warn!(key, family = interface.name(), "configuration rejected: {e}");
                    responses[index] = Some(UpdateResponse::failed(key, e));
                    continue;
                }
            }
            let batch = batches
                .entry(interface.name().to_string())
                .or_insert_with(|| (interface, Vec::new(), Vec::new()));
            batch.1.push(index);
            batch.2.push(item);
        }

        let outcomes = join_all(batches.into_values().map(|(interface, indices, items)| async move {
            let answered = interface.configuration_change_request(items).await;
            (interface, indices, answered)
        }))
        .await;
        drop(reservation);

        for (interface, indices, answered) in outcomes {
            if answered.len() != indices.len() {
                error!(
                    family = interface.name(),
                    expected = indices.len(),
                    answered = answered.len(),
                    "interface answered the wrong number of items"
                );
                return Err(FleetError::Internal(format!(
                    "{} answered {} of {} configuration items",
                    interface.name(),
                    answered.len(),
                    indices.len()
                )));
            }
            for (index, response) in indices.into_iter().zip(answered) {
                responses[index] = Some(response);
            }
        }

        let responses = responses
            .into_iter()
            .collect::<Option<Vec<UpdateResponse>>>()
            .ok_or_else(|| FleetError::Internal("configuration item lost during routing".into()))?;
        for response in &responses {
            self.events.publish(response.clone());
        }
        Ok(responses)
    }

    /// Full re-read of the given configurations, or of every configuration when `None`.
    pub async fn refresh_configurations(
        &self,
        keys: Option<Vec<ConfigurationId>>,
    ) -> Vec<FleetResult<Configuration>> {
        match keys {
            None => join_all(
                self.interfaces()
                    .into_iter()
                    .map(|interface| async move { interface.refresh_configurations(None).await }),
            )
            .await
            .into_iter()
            .flatten()
            .collect(),
            Some(keys) => {
                join_all(keys.into_iter().map(|key| async move {
                    let owner = self.resolve_configuration_owner(key)?;
                    owner
                        .refresh_configurations(Some(vec![key]))
                        .await
                        .pop()
                        .unwrap_or(Err(FleetError::UnknownConfiguration(key)))
                }))
                .await
            }
        }
    }

    /// Split `identifiers` by owning interface, run `call` once per interface and put
    /// the results back in input order. Unclaimed identifiers get `UnknownIdentifier`.
    async fn route<R, C>(&self, identifiers: &[Identifier], call: C) -> FleetResult<Vec<FleetResult<R>>>
    where
        C: Fn(Interface, Vec<Identifier>) -> BoxFuture<'static, FleetResult<Vec<FleetResult<R>>>>,
    {
        let mut results: Vec<Option<FleetResult<R>>> = identifiers.iter().map(|_| None).collect();
        let mut groups: BTreeMap<String, (Interface, Vec<usize>, Vec<Identifier>)> = BTreeMap::new();
        for (index, identifier) in identifiers.iter().enumerate() {
            match self.resolve_owner(*identifier) {
                Ok(owner) => {
                    let group = groups
                        .entry(owner.name().to_string())
                        .or_insert_with(|| (owner, Vec::new(), Vec::new()));
                    group.1.push(index);
                    group.2.push(*identifier);
                }
                Err(e) => results[index] = Some(Err(e)),
            }
        }

        let calls = groups.into_values().map(|(owner, indices, ids)| {
            let call = call(owner, ids);
            async move { (indices, call.await) }
        });
        for (indices, outcome) in join_all(calls).await {
            for (index, result) in indices.into_iter().zip(outcome?) {
                results[index] = Some(result);
            }
        }

        Ok(identifiers
            .iter()
            .zip(results)
            .map(|(identifier, result)| {
                result.unwrap_or(Err(FleetError::UnknownIdentifier(*identifier)))
            })
            .collect())
    }

    /// Refresh and return devices, in input order (every device when `None`).
    pub async fn refresh_devices(
        &self,
        identifiers: Option<Vec<Identifier>>,
    ) -> FleetResult<Vec<FleetResult<Device>>> {
        let identifiers = identifiers.unwrap_or_else(|| self.identifiers());
        self.route(&identifiers, |owner, ids| {
            Box::pin(async move { owner.refresh_devices(&ids).await })
        })
        .await
    }

    /// Live stage status per identifier, in input order.
    pub async fn stage_status(
        &self,
        identifiers: &[Identifier],
    ) -> FleetResult<Vec<FleetResult<StageStatus>>> {
        self.route(identifiers, |owner, ids| {
            Box::pin(async move { owner.stage_status(&ids).await })
        })
        .await
    }

    /// Close and forget configuration `key`. False when unknown or when closing failed.
    pub async fn remove_configuration(&self, key: ConfigurationId) -> bool {
        match self.resolve_configuration_owner(key) {
            Ok(owner) => owner.remove_configuration(key).await,
            Err(e) => {
                debug!("remove: {e}");
                false
            }
        }
    }

    /// The subset of `keys` that has not converged yet. Unknown keys count as converged.
    pub async fn is_configuration_configured(&self, keys: &[ConfigurationId]) -> Vec<ConfigurationId> {
        let interfaces = self.interfaces();
        let checks = interfaces.iter().map(|interface| {
            let owned: Vec<ConfigurationId> = keys
                .iter()
                .copied()
                .filter(|key| interface.owns_configuration(*key))
                .collect();
            async move {
                if owned.is_empty() {
                    Vec::new()
                } else {
                    interface.is_configuration_configured(&owned).await
                }
            }
        });
        let pending: Vec<ConfigurationId> = join_all(checks).await.into_iter().flatten().collect();
        keys.iter().copied().filter(|key| pending.contains(key)).collect()
    }

    /// The subset of `identifiers` still moving. Unknown identifiers count as settled.
    pub async fn on_target_pending(&self, identifiers: &[Identifier]) -> Vec<Identifier> {
        let statuses = match self.stage_status(identifiers).await {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!("motion check failed: {e}");
                return Vec::new();
            }
        };
        identifiers
            .iter()
            .zip(statuses)
            .filter_map(|(identifier, status)| match status {
                Ok(status) if status.connected && !status.on_target => Some(*identifier),
                _ => None,
            })
            .collect()
    }

    /// Every known device identifier.
    pub fn identifiers(&self) -> Vec<Identifier> {
        self.interfaces()
            .iter()
            .flat_map(|i| i.identifiers())
            .collect()
    }

    /// Last known configuration of every tracked key.
    pub fn current_configurations(&self) -> Vec<Configuration> {
        self.interfaces()
            .iter()
            .flat_map(|i| i.current_configurations())
            .collect()
    }

    /// Last known state of every device.
    pub fn devices(&self) -> Vec<Device> {
        self.interfaces().iter().flat_map(|i| i.devices()).collect()
    }

    // =========================================================================
    // Saved configuration sets
    // =========================================================================

    /// Saved configuration sets.
    pub fn sets(&self) -> &ConfigurationSets {
        &self.sets
    }

    /// Save every current configuration as set `name`. Returns how many were saved.
    pub async fn save_current_set(&self, name: &str) -> SettingsResult<usize> {
        let configurations = self.current_configurations();
        self.sets.save(name, &configurations).await?;
        info!(set = name, count = configurations.len(), "configuration set saved");
        Ok(configurations.len())
    }

    /// Re-submit set `name`; `None` if no such set exists.
    pub async fn load_set(&self, name: &str) -> anyhow::Result<Option<Vec<UpdateResponse>>> {
        let Some(items) = self.sets.get(name).await? else {
            return Ok(None);
        };
        info!(set = name, count = items.len(), "restoring configuration set");
        Ok(Some(self.update_configurations(items).await?))
    }

    /// Delete saved set `name`. False if it did not exist.
    pub async fn remove_set(&self, name: &str) -> SettingsResult<bool> {
        self.sets.remove(name).await
    }

    /// Names of the saved sets.
    pub async fn list_sets(&self) -> SettingsResult<Vec<String>> {
        self.sets.names().await
    }

    /// Close every session of every interface.
    pub async fn shutdown(&self) {
        for interface in self.interfaces() {
            interface.close_all().await;
        }
        info!("fleet shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FleetEvent;
    use crate::families::VirtualFamily;
    use crate::interface::SessionInterface;
    use serde_json::json;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn fleet() -> Fleet {
        let fleet = Fleet::new();
        fleet
            .add_interface(Arc::new(SessionInterface::new(VirtualFamily::new(
                Duration::ZERO,
            ))))
            .unwrap();
        fleet
    }

    #[test]
    fn test_duplicate_interface_rejected() {
        let fleet = fleet();
        let again = fleet.add_interface(Arc::new(SessionInterface::new(VirtualFamily::new(
            Duration::ZERO,
        ))));
        assert_eq!(again, Err(FleetError::DuplicateInterface("Virtual".into())));
    }

    #[tokio::test]
    async fn test_unknown_family_gets_a_response() {
        let fleet = fleet();
        let responses = fleet
            .update_configurations(vec![
                json!({ "controller_type": "Zaber", "id": 4 }),
                json!({ "controller_type": "Virtual", "id": 1, "maximum": 10.0 }),
                json!({ "id": 5 }),
            ])
            .await
            .unwrap();
        assert_eq!(responses.len(), 3);
        assert!(!responses[0].success);
        assert_eq!(responses[0].identifier, 4);
        assert_eq!(responses[1], UpdateResponse::ok(1));
        assert_eq!(responses[2].identifier, 5);
    }

    #[tokio::test]
    async fn test_resolve_owner() {
        let fleet = fleet();
        assert!(matches!(
            fleet.resolve_owner(1),
            Err(FleetError::UnknownIdentifier(1))
        ));
        fleet
            .update_configurations(vec![json!({ "controller_type": "Virtual", "id": 1, "maximum": 10.0 })])
            .await
            .unwrap();
        assert_eq!(fleet.resolve_owner(1).unwrap().name(), "Virtual");
    }

    #[tokio::test]
    async fn test_actions_are_isolated() {
        let fleet = fleet();
        fleet
            .update_configurations(vec![json!({ "controller_type": "Virtual", "id": 1, "maximum": 10.0 })])
            .await
            .unwrap();
        let results = fleet
            .execute_actions(vec![
                ActionRequest::move_to(1, 50.0),
                ActionRequest::move_to(2, 1.0),
                ActionRequest::move_to(1, 3.0),
            ])
            .await;
        assert!(matches!(results[0], Err(FleetError::Validation(_))));
        assert_eq!(results[1], Err(FleetError::UnknownIdentifier(2)));
        assert_eq!(results[2], Ok(()));
    }

    #[tokio::test]
    async fn test_update_responses_published() {
        let fleet = fleet();
        let (_subscription, mut rx) = fleet.events().channel(&[EventKind::UpdateResponse]).unwrap();
        fleet
            .update_configurations(vec![json!({ "controller_type": "Virtual", "id": 1, "maximum": 10.0 })])
            .await
            .unwrap();
        match rx.try_recv().unwrap() {
            FleetEvent::UpdateResponse(response) => assert!(response.success),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_saved_set_round_trip() {
        let fleet = fleet();
        fleet
            .update_configurations(vec![json!({ "controller_type": "Virtual", "id": 1, "maximum": 10.0 })])
            .await
            .unwrap();
        assert_eq!(fleet.save_current_set("bench").await.unwrap(), 1);
        assert!(fleet.remove_configuration(1).await);
        assert!(fleet.current_configurations().is_empty());

        let responses = fleet.load_set("bench").await.unwrap().unwrap();
        assert_eq!(responses, vec![UpdateResponse::ok(1)]);
        assert_eq!(fleet.list_sets().await.unwrap(), vec!["bench".to_string()]);
        assert!(fleet.load_set("other").await.unwrap().is_none());
    }

    /// Answers only the first item of every batch and claims every identifier.
    struct Lossy {
        name: &'static str,
        events: EventBus,
    }

    impl Lossy {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                events: EventBus::new(name, &EventKind::SESSION),
            })
        }
    }

    #[async_trait::async_trait]
    impl ControllerInterface for Lossy {
        fn name(&self) -> &str {
            self.name
        }
        fn events(&self) -> &EventBus {
            &self.events
        }
        fn addressing(&self) -> Addressing {
            Addressing::Direct
        }
        fn keys(&self) -> Vec<ConfigurationId> {
            Vec::new()
        }
        fn identifiers(&self) -> Vec<Identifier> {
            Vec::new()
        }
        fn owns(&self, _identifier: Identifier) -> bool {
            true
        }
        fn owns_configuration(&self, _key: ConfigurationId) -> bool {
            false
        }
        async fn configuration_change_request(&self, items: Vec<Value>) -> Vec<UpdateResponse> {
            items
                .iter()
                .take(1)
                .map(|item| UpdateResponse::ok(Configuration::raw_id(item).unwrap_or(UNPARSED_IDENTIFIER)))
                .collect()
        }
        async fn remove_configuration(&self, _key: ConfigurationId) -> bool {
            false
        }
        async fn is_configuration_configured(&self, _keys: &[ConfigurationId]) -> Vec<ConfigurationId> {
            Vec::new()
        }
        async fn stage_status(
            &self,
            identifiers: &[Identifier],
        ) -> FleetResult<Vec<FleetResult<StageStatus>>> {
            Ok(identifiers.iter().map(|i| Err(FleetError::UnknownIdentifier(*i))).collect())
        }
        async fn refresh_devices(
            &self,
            identifiers: &[Identifier],
        ) -> FleetResult<Vec<FleetResult<Device>>> {
            Ok(identifiers.iter().map(|i| Err(FleetError::UnknownIdentifier(*i))).collect())
        }
        async fn refresh_configurations(
            &self,
            _keys: Option<Vec<ConfigurationId>>,
        ) -> Vec<FleetResult<Configuration>> {
            Vec::new()
        }
        async fn execute_action(&self, request: &ActionRequest) -> FleetResult<()> {
            Err(FleetError::UnknownIdentifier(request.device_id))
        }
        async fn on_target_pending(&self, _identifiers: &[Identifier]) -> FleetResult<Vec<Identifier>> {
            Ok(Vec::new())
        }
        fn current_configurations(&self) -> Vec<Configuration> {
            Vec::new()
        }
        fn devices(&self) -> Vec<Device> {
            Vec::new()
        }
        async fn close_all(&self) {}
    }

    #[tokio::test]
    async fn test_short_answer_fails_the_whole_batch() {
        let fleet = fleet();
        fleet.add_interface(Lossy::new("Lossy")).unwrap();
        let (_subscription, mut rx) = fleet.events().channel(&[EventKind::UpdateResponse]).unwrap();

        let result = fleet
            .update_configurations(vec![
                json!({ "controller_type": "Virtual", "id": 1, "maximum": 10.0 }),
                json!({ "controller_type": "Lossy", "id": 20 }),
                json!({ "controller_type": "Lossy", "id": 21 }),
            ])
            .await;
        assert!(matches!(result, Err(FleetError::Internal(_))));
        // No partial responses escape
        assert!(rx.try_recv().is_err());

        let answered = fleet
            .update_configurations(vec![json!({ "controller_type": "Lossy", "id": 22 })])
            .await
            .unwrap();
        assert_eq!(answered, vec![UpdateResponse::ok(22)]);
    }

    #[tokio::test]
    async fn test_ambiguous_identifier_fails_loudly() {
        let fleet = Fleet::new();
        fleet.add_interface(Lossy::new("Left")).unwrap();
        fleet.add_interface(Lossy::new("Right")).unwrap();
        match fleet.resolve_owner(7) {
            Err(FleetError::AmbiguousIdentifier { identifier, families }) => {
                assert_eq!(identifier, 7);
                assert_eq!(families, vec!["Left".to_string(), "Right".to_string()]);
            }
            Err(other) => panic!("unexpected {other:?}"),
            Ok(owner) => panic!("resolved to {}", owner.name()),
        }
        let results = fleet.execute_actions(vec![ActionRequest::move_to(7, 1.0)]).await;
        assert!(matches!(results[0], Err(FleetError::AmbiguousIdentifier { .. })));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unknown_family_is_logged() {
        let fleet = fleet();
        let responses = fleet
            .update_configurations(vec![json!({ "controller_type": "Zaber", "id": 3 })])
            .await
            .unwrap();
        assert!(!responses[0].success);
        assert!(logs_contain("no interface for configuration"));
    }
}
