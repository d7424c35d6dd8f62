//! Typed publish/subscribe event bus.
//!
//! Producers publish [`FleetEvent`]s without knowing who listens. A bus is created
//! with a closed set of [`EventKind`]s it may ever emit; subscribers pick a subset of
//! those kinds and register one or more sinks per kind.
//!
//! # Delivery
//!
//! `publish` is synchronous: before it returns, every sink registered for the event's
//! kind has been called, in subscription-registration order. Events nobody listens for
//! are dropped silently; that is the steady state for most kinds, not an error.
//!
//! # Hierarchy
//!
//! [`EventBus::forward`] makes one bus re-publish another bus's events. The fleet uses
//! it to chain session → controller interface → fleet → transport, so the top level
//! sees every device's events without any device knowing about the top level.
//!
//! ```text
//! Session bus --forward--> Interface bus --forward--> Fleet bus --channel--> transport
//! ```

mod types;

pub use types::{
    ConfigurationUpdate, DeviceUpdate, EventKind, FleetEvent, Notice, StageRemoved,
    UpdateResponse,
};

use crate::error::{FleetError, FleetResult};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{error, trace};

/// Destination of delivered events.
pub type Sink = Arc<dyn Fn(&FleetEvent) + Send + Sync>;

struct BusInner {
    /// Who hosts this bus, for diagnostics
    host: String,
    declared: Vec<EventKind>,
    subscriptions: RwLock<Vec<Arc<SubscriptionInner>>>,
    next_subscription: AtomicU64,
}

struct SubscriptionInner {
    id: u64,
    kinds: Vec<EventKind>,
    deliveries: Mutex<HashMap<EventKind, Vec<Sink>>>,
}

/// Handle to a publish/subscribe hub. Cloning shares the same hub.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("host", &self.inner.host)
            .field("declared", &self.inner.declared)
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl EventBus {
    /// Create a bus that may emit exactly the `declared` kinds.
    pub fn new(host: impl Into<String>, declared: &[EventKind]) -> Self {
        let mut kinds = declared.to_vec();
        kinds.sort();
        kinds.dedup();
        Self {
            inner: Arc::new(BusInner {
                host: host.into(),
                declared: kinds,
                subscriptions: RwLock::new(Vec::new()),
                next_subscription: AtomicU64::new(0),
            }),
        }
    }

    /// Name of the component that owns this bus.
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Kinds this bus may publish.
    pub fn declared(&self) -> &[EventKind] {
        &self.inner.declared
    }

    /// Whether `kind` is among the declared kinds.
    pub fn declares(&self, kind: EventKind) -> bool {
        self.inner.declared.contains(&kind)
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    fn check_declared(&self, kinds: &[EventKind]) -> FleetResult<()> {
        match kinds.iter().find(|kind| !self.declares(**kind)) {
            Some(kind) => Err(FleetError::UndeclaredEvent {
                host: self.inner.host.clone(),
                kind: *kind,
            }),
            None => Ok(()),
        }
    }

    /// Subscribe to a subset of the declared kinds.
    ///
    /// Fails with [`FleetError::UndeclaredEvent`] if any requested kind is not served
    /// here; that is a wiring mistake.
    pub fn subscribe(&self, kinds: &[EventKind]) -> FleetResult<Subscription> {
        self.check_declared(kinds)?;
        let inner = Arc::new(SubscriptionInner {
            id: self.inner.next_subscription.fetch_add(1, Ordering::Relaxed),
            kinds: kinds.to_vec(),
            deliveries: Mutex::new(HashMap::new()),
        });
        self.inner.subscriptions.write().push(Arc::clone(&inner));
        trace!(host = %self.inner.host, subscription = inner.id, ?kinds, "subscribed");
        Ok(Subscription {
            inner,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Deliver `event` to every sink registered for its kind.
    ///
    /// Publishing a kind this bus did not declare is a programming error: it trips a
    /// debug assertion and is logged and dropped in release builds.
    pub fn publish(&self, event: impl Into<FleetEvent>) {
        let event = event.into();
        self.dispatch(&event);
    }

    fn dispatch(&self, event: &FleetEvent) {
        let kind = event.kind();
        if !self.declares(kind) {
            error!(host = %self.inner.host, ?kind, "event type is not declared on this bus");
            debug_assert!(false, "{kind:?} published on {} without being declared", self.inner.host);
            return;
        }

        // Snapshot first so sinks may subscribe or publish without deadlocking.
        let subscriptions: Vec<Arc<SubscriptionInner>> = self.inner.subscriptions.read().clone();
        for subscription in subscriptions {
            if !subscription.kinds.contains(&kind) {
                continue;
            }
            let sinks = subscription
                .deliveries
                .lock()
                .get(&kind)
                .cloned()
                .unwrap_or_default();
            for sink in sinks {
                sink(event);
            }
        }
    }

    /// Re-publish `kinds` emitted on `from` through this bus.
    ///
    /// Only events emitted on `from` after this call are forwarded.
    pub fn forward(&self, kinds: &[EventKind], from: &EventBus) -> FleetResult<Subscription> {
        self.check_declared(kinds)?;
        let subscription = from.subscribe(kinds)?;
        let target = Arc::downgrade(&self.inner);
        let sink: Sink = Arc::new(move |event: &FleetEvent| {
            if let Some(inner) = target.upgrade() {
                EventBus { inner }.dispatch(event);
            }
        });
        for kind in kinds {
            subscription.deliver_to(*kind, Arc::clone(&sink))?;
        }
        Ok(subscription)
    }

    /// Bridge `kinds` into an unbounded tokio channel, for transports that push
    /// events to remote listeners from their own task.
    pub fn channel(
        &self,
        kinds: &[EventKind],
    ) -> FleetResult<(Subscription, mpsc::UnboundedReceiver<FleetEvent>)> {
        let subscription = self.subscribe(kinds)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: Sink = Arc::new(move |event: &FleetEvent| {
            // A closed receiver just means the listener went away.
            let _ = tx.send(event.clone());
        });
        for kind in kinds {
            subscription.deliver_to(*kind, Arc::clone(&sink))?;
        }
        Ok((subscription, rx))
    }
}

/// A subscriber's registration on one bus.
///
/// Dropping the handle keeps the registration alive; call [`Subscription::unsubscribe`]
/// to stop deliveries.
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
    bus: Weak<BusInner>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("kinds", &self.inner.kinds)
            .finish()
    }
}

impl Subscription {
    /// Kinds this subscription listens to.
    pub fn kinds(&self) -> &[EventKind] {
        &self.inner.kinds
    }

    /// Register `sink` for events of `kind`.
    ///
    /// Registering the same sink twice for the same kind is a no-op.
    pub fn deliver_to(&self, kind: EventKind, sink: Sink) -> FleetResult<()> {
        if !self.inner.kinds.contains(&kind) {
            let host = self
                .bus
                .upgrade()
                .map(|bus| bus.host.clone())
                .unwrap_or_default();
            return Err(FleetError::UndeclaredEvent { host, kind });
        }
        let mut deliveries = self.inner.deliveries.lock();
        let sinks = deliveries.entry(kind).or_default();
        if sinks.iter().any(|existing| Arc::ptr_eq(existing, &sink)) {
            trace!(?kind, "sink already registered");
            return Ok(());
        }
        sinks.push(sink);
        Ok(())
    }

    /// Convenience: register a closure as the sink for `kind`.
    pub fn on<F>(&self, kind: EventKind, sink: F) -> FleetResult<()>
    where
        F: Fn(&FleetEvent) + Send + Sync + 'static,
    {
        self.deliver_to(kind, Arc::new(sink))
    }

    /// Remove this subscription from its bus.
    pub fn unsubscribe(self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscriptions
                .write()
                .retain(|sub| !Arc::ptr_eq(sub, &self.inner));
        }
    }
}
