//! Event envelope carried by every [`EventBus`](super::EventBus).

use crate::model::{Configuration, ConfigurationId, Device, Identifier};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminant of [`FleetEvent`]; buses declare the closed set of kinds they emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    /// See [`ConfigurationUpdate`].
    ConfigurationUpdate,
    /// See [`DeviceUpdate`].
    DeviceUpdate,
    /// See [`Notice`].
    Notice,
    /// See [`StageRemoved`].
    StageRemoved,
    /// See [`UpdateResponse`].
    UpdateResponse,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: [EventKind; 5] = [
        EventKind::ConfigurationUpdate,
        EventKind::DeviceUpdate,
        EventKind::Notice,
        EventKind::StageRemoved,
        EventKind::UpdateResponse,
    ];

    /// Kinds a controller session emits.
    pub const SESSION: [EventKind; 4] = [
        EventKind::ConfigurationUpdate,
        EventKind::DeviceUpdate,
        EventKind::Notice,
        EventKind::StageRemoved,
    ];
}

/// Progress of a configuration change, shown to the user while hardware settles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationUpdate {
    /// Configuration the update is about
    pub id: ConfigurationId,
    /// Description that can be displayed to the user
    pub message: String,
    /// Configuration as it stands after this step, if known
    #[serde(default)]
    pub configuration: Option<Configuration>,
    /// False while another update for this ID is still expected
    #[serde(default)]
    pub finished: bool,
    /// This update heralds bad news
    #[serde(default)]
    pub error: bool,
}

impl ConfigurationUpdate {
    /// An intermediate update; more will follow.
    pub fn progress(id: ConfigurationId, message: impl Into<String>) -> Self {
        Self {
            id,
            message: message.into(),
            configuration: None,
            finished: false,
            error: false,
        }
    }

    /// The last update for this round of changes.
    pub fn done(id: ConfigurationId, message: impl Into<String>) -> Self {
        Self {
            finished: true,
            ..Self::progress(id, message)
        }
    }

    /// Attach the current configuration.
    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = Some(configuration);
        self
    }

    /// Mark the update as a failure.
    pub fn with_error(mut self) -> Self {
        self.error = true;
        self
    }
}

/// New state of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdate {
    /// Device that changed
    pub identifier: Identifier,
    /// Its full state
    pub state: Device,
}

impl From<Device> for DeviceUpdate {
    fn from(state: Device) -> Self {
        Self {
            identifier: state.identifier(),
            state,
        }
    }
}

/// Free-form message sent up the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    /// Device this refers to, `None` if it does not pertain to a single device
    #[serde(default)]
    pub identifier: Option<Identifier>,
    /// Text shown to the user
    pub message: String,
}

impl Notice {
    /// A notice about `identifier`, or about the fleet when `None`.
    pub fn new(identifier: Option<Identifier>, message: impl Into<String>) -> Self {
        Self {
            identifier,
            message: message.into(),
        }
    }
}

/// A stage disappeared together with its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRemoved {
    /// Stage that went away
    pub identifier: Identifier,
}

/// Outcome of one reconciliation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResponse {
    /// Configuration or device the attempt was for
    pub identifier: Identifier,
    /// Whether the item was applied
    pub success: bool,
    /// Why it failed; `None` on success
    #[serde(default)]
    pub error: Option<String>,
}

impl UpdateResponse {
    /// A successful attempt.
    pub fn ok(identifier: Identifier) -> Self {
        Self {
            identifier,
            success: true,
            error: None,
        }
    }

    /// A failed attempt carrying the error text.
    pub fn failed(identifier: Identifier, error: impl fmt::Display) -> Self {
        Self {
            identifier,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// Any event the fleet publishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum FleetEvent {
    /// Progress of a configuration change.
    ConfigurationUpdate(ConfigurationUpdate),
    /// A device changed state.
    DeviceUpdate(DeviceUpdate),
    /// Free-form message.
    Notice(Notice),
    /// A stage disappeared.
    StageRemoved(StageRemoved),
    /// Outcome of one reconciliation.
    UpdateResponse(UpdateResponse),
}

impl FleetEvent {
    /// Discriminant of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            FleetEvent::ConfigurationUpdate(_) => EventKind::ConfigurationUpdate,
            FleetEvent::DeviceUpdate(_) => EventKind::DeviceUpdate,
            FleetEvent::Notice(_) => EventKind::Notice,
            FleetEvent::StageRemoved(_) => EventKind::StageRemoved,
            FleetEvent::UpdateResponse(_) => EventKind::UpdateResponse,
        }
    }
}

impl From<ConfigurationUpdate> for FleetEvent {
    fn from(event: ConfigurationUpdate) -> Self {
        FleetEvent::ConfigurationUpdate(event)
    }
}

impl From<DeviceUpdate> for FleetEvent {
    fn from(event: DeviceUpdate) -> Self {
        FleetEvent::DeviceUpdate(event)
    }
}

impl From<Notice> for FleetEvent {
    fn from(event: Notice) -> Self {
        FleetEvent::Notice(event)
    }
}

impl From<StageRemoved> for FleetEvent {
    fn from(event: StageRemoved) -> Self {
        FleetEvent::StageRemoved(event)
    }
}

impl From<UpdateResponse> for FleetEvent {
    fn from(event: UpdateResponse) -> Self {
        FleetEvent::UpdateResponse(event)
    }
}
