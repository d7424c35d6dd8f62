//! Desired-state records submitted by clients, one per controller or virtual stage.
//!
//! `Configuration` is a sum type tagged by `controller_type`, so a mixed batch of
//! JSON items can be parsed without knowing in advance which family each item is for.

use crate::error::{FleetError, FleetResult};
use crate::model::identifier::ConfigurationId;
use crate::model::stage::StageKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Family name of PI controllers.
pub const PI_FAMILY: &str = "PI";
/// Family name of Standa (XIMC) controllers.
pub const STANDA_FAMILY: &str = "Standa";
/// Family name of simulated virtual stages.
pub const VIRTUAL_FAMILY: &str = "Virtual";

/// Stage name a PI controller reports for an empty channel.
pub const NO_STAGE: &str = "NOSTAGE";

/// Desired state of one controller, tagged by family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "controller_type")]
pub enum Configuration {
    /// A PI multi-channel controller.
    #[serde(rename = "PI")]
    Pi(PiConfiguration),
    /// A Standa single-axis controller.
    #[serde(rename = "Standa")]
    Standa(StandaConfiguration),
    /// A simulated stage.
    #[serde(rename = "Virtual")]
    Virtual(VirtualStageConfig),
}

impl Configuration {
    /// Configuration ID, the controller's key.
    pub fn id(&self) -> ConfigurationId {
        match self {
            Configuration::Pi(c) => c.id,
            Configuration::Standa(c) => c.id,
            Configuration::Virtual(c) => c.id,
        }
    }

    /// Name of the family this configuration belongs to.
    pub fn family(&self) -> &'static str {
        match self {
            Configuration::Pi(_) => PI_FAMILY,
            Configuration::Standa(_) => STANDA_FAMILY,
            Configuration::Virtual(_) => VIRTUAL_FAMILY,
        }
    }

    /// Check the ID and the family's own rules.
    pub fn validate(&self) -> FleetResult<()> {
        if self.id() < 0 {
            return Err(FleetError::Validation(format!(
                "configuration ID {} must not be negative",
                self.id()
            )));
        }
        match self {
            Configuration::Pi(c) => c.validate(),
            Configuration::Standa(c) => c.validate(),
            Configuration::Virtual(c) => c.validate(),
        }
    }

    /// The ID a raw item carries under `id` or `ID`, without parsing the rest.
    pub fn raw_id(item: &serde_json::Value) -> Option<ConfigurationId> {
        ["id", "ID"]
            .iter()
            .find_map(|field| item.get(field).and_then(serde_json::Value::as_i64))
    }

    /// Parse one raw item, returning the ID it carries (if any) alongside the outcome.
    pub fn parse(item: &serde_json::Value) -> (Option<ConfigurationId>, FleetResult<Self>) {
        let id = Self::raw_id(item);
        let parsed = serde_json::from_value::<Configuration>(item.clone())
            .map_err(|e| FleetError::Validation(format!("invalid configuration: {e}")))
            .and_then(|config| {
                config.validate()?;
                Ok(config)
            });
        (id, parsed)
    }
}

// =============================================================================
// PI
// =============================================================================

/// How the host reaches a PI controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PiConnectionType {
    /// USB, addressed by serial number.
    Usb,
    /// Serial port; needs `comport`.
    Rs232,
    /// TCP, addressed by serial number.
    Network,
}

/// PI controller models the fleet can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PiControllerModel {
    /// PI C-884 motion controller.
    C884,
    /// In-memory stand-in for a C-884, used when no hardware is attached.
    Simulated,
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_min_max() -> [f64; 2] {
    [0.0, 500.0]
}

/// One channel of a PI controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiStage {
    /// One-based channel, 1 to 9
    pub channel: u8,
    /// Stage model loaded on this channel, e.g. `L-611.90AD`
    pub device: String,
    /// Closed-loop (servo) operation
    #[serde(default)]
    pub clo: bool,
    /// Whether the channel should be referenced
    #[serde(default)]
    pub referenced: bool,
    /// Read-only: travel range reported by the controller
    #[serde(default = "default_min_max")]
    pub min_max: [f64; 2],
    /// Read-only
    #[serde(default)]
    pub on_target: bool,
    /// Read-only
    #[serde(default)]
    pub position: f64,
    /// Read-only: derived from the stage catalog
    #[serde(default)]
    pub kind: StageKind,
}

impl PiStage {
    /// An unreferenced open-loop stage.
    pub fn new(channel: u8, device: impl Into<String>) -> Self {
        Self {
            channel,
            device: device.into(),
            clo: false,
            referenced: false,
            min_max: default_min_max(),
            on_target: false,
            position: 0.0,
            kind: StageKind::Linear,
        }
    }

    /// Whether the channel holds no stage.
    pub fn is_empty(&self) -> bool {
        self.device == NO_STAGE
    }
}

/// State of a single PI controller. Fields marked read-only are reported, never applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiConfiguration {
    /// Serial number of the controller
    #[serde(alias = "ID")]
    pub id: ConfigurationId,
    /// Controller model
    pub model: PiControllerModel,
    /// How the controller is reached
    pub connection_type: PiConnectionType,
    /// Read-only
    #[serde(default)]
    pub connected: bool,
    /// Read-only: number of channels the controller supports
    #[serde(default)]
    pub channel_amount: u8,
    /// Read-only
    #[serde(default)]
    pub ready: bool,
    /// Stages keyed by channel; serialized as a list.
    #[serde(default, with = "stage_list")]
    pub stages: BTreeMap<u8, PiStage>,
    /// Read-only: last controller error, empty if none
    #[serde(default)]
    pub error: String,
    /// RS-232 only
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// RS-232 only
    #[serde(default)]
    pub comport: Option<u32>,
}

impl PiConfiguration {
    /// A controller with no stages.
    pub fn new(id: ConfigurationId, model: PiControllerModel, connection_type: PiConnectionType) -> Self {
        Self {
            id,
            model,
            connection_type,
            connected: false,
            channel_amount: 0,
            ready: false,
            stages: BTreeMap::new(),
            error: String::new(),
            baud_rate: default_baud_rate(),
            comport: None,
        }
    }

    /// Add or replace the stage on its channel.
    pub fn with_stage(mut self, stage: PiStage) -> Self {
        self.stages.insert(stage.channel, stage);
        self
    }

    /// Check comport and channel bounds.
    pub fn validate(&self) -> FleetResult<()> {
        if self.connection_type == PiConnectionType::Rs232 && self.comport.is_none() {
            return Err(FleetError::Validation(
                "Comport must be specified for an RS232 connection".to_string(),
            ));
        }
        for stage in self.stages.values() {
            if !(1..=9).contains(&stage.channel) {
                return Err(FleetError::Validation(format!(
                    "channel {} outside 1..=9",
                    stage.channel
                )));
            }
            if self.channel_amount != 0 && stage.channel > self.channel_amount {
                return Err(FleetError::Validation(format!(
                    "channel {} exceeds the controller's {} channels",
                    stage.channel, self.channel_amount
                )));
            }
            if stage.min_max[0] > stage.min_max[1] {
                return Err(FleetError::Validation(format!(
                    "channel {}: minimum travel above maximum",
                    stage.channel
                )));
            }
        }
        Ok(())
    }

    /// Apply the one-way rule "never ready while disconnected".
    pub fn normalize(&mut self) {
        if !self.connected {
            self.ready = false;
        }
    }
}

mod stage_list {
    use super::PiStage;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    /// Stages as a list ordered by channel.
    pub fn serialize<S: Serializer>(
        stages: &BTreeMap<u8, PiStage>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let list: Vec<&PiStage> = stages.values().collect();
        list.serialize(serializer)
    }

    /// Rejects a channel listed twice.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<u8, PiStage>, D::Error> {
        let list = Vec::<PiStage>::deserialize(deserializer)?;
        let mut stages = BTreeMap::new();
        for stage in list {
            let channel = stage.channel;
            if stages.insert(channel, stage).is_some() {
                return Err(D::Error::custom(format!("channel {channel} listed twice")));
            }
        }
        Ok(stages)
    }
}

// =============================================================================
// Standa
// =============================================================================

/// State of a single-axis Standa controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandaConfiguration {
    /// Serial number of the controller
    #[serde(alias = "ID")]
    pub id: ConfigurationId,
    /// Stage model, looked up in the Standa stage catalog
    pub model: String,
    /// Whether the axis should be homed
    #[serde(default)]
    pub homed: bool,
    /// Read-only
    #[serde(default)]
    pub connected: bool,
    /// Read-only
    #[serde(default)]
    pub on_target: bool,
    /// Read-only
    #[serde(default)]
    pub position: f64,
    /// Read-only: travel range from the catalog
    #[serde(default)]
    pub min_max: Option<[f64; 2]>,
    /// Read-only
    #[serde(default)]
    pub kind: StageKind,
}

impl StandaConfiguration {
    /// An unhomed controller for stage `model`.
    pub fn new(id: ConfigurationId, model: impl Into<String>) -> Self {
        Self {
            id,
            model: model.into(),
            homed: false,
            connected: false,
            on_target: false,
            position: 0.0,
            min_max: None,
            kind: StageKind::Linear,
        }
    }

    /// Check the model and travel range.
    pub fn validate(&self) -> FleetResult<()> {
        if self.model.trim().is_empty() {
            return Err(FleetError::Validation(
                "Standa configuration needs a stage model".to_string(),
            ));
        }
        if let Some([min, max]) = self.min_max {
            if min > max {
                return Err(FleetError::Validation(
                    "minimum travel above maximum".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Virtual
// =============================================================================

/// A simulated linear stage; one device per configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualStageConfig {
    /// Configuration ID, also the stage's identifier
    #[serde(alias = "ID")]
    pub id: ConfigurationId,
    /// Maximum position, in mm
    #[serde(default)]
    pub maximum: f64,
}

impl VirtualStageConfig {
    /// A stage with range `0..=maximum`.
    pub fn new(id: ConfigurationId, maximum: f64) -> Self {
        Self { id, maximum }
    }

    /// Check the maximum is a non-negative number.
    pub fn validate(&self) -> FleetResult<()> {
        if !self.maximum.is_finite() || self.maximum < 0.0 {
            return Err(FleetError::Validation(format!(
                "maximum {} must be a non-negative number",
                self.maximum
            )));
        }
        Ok(())
    }
}
