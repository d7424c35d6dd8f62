//! Devices: the addressable things a client can see and act upon.
//!
//! Every variant carries the shared [`DeviceInfo`] plus its own live fields. The list
//! of permitted actions belongs to the variant, not to individual instances.

use crate::error::{FleetError, FleetResult};
use crate::model::identifier::{ConfigurationId, Identifier};
use crate::model::stage::StageStatus;
use serde::{Deserialize, Serialize};

/// Action name: absolute move, float argument.
pub const MOVE_TO: &str = "Move To";
/// Action name: relative move, float argument.
pub const STEP_BY: &str = "Step By";
/// Action name: find the reference position, no argument.
pub const REFERENCE: &str = "Reference";
/// Action name: switch a power supply output, bool argument.
pub const ENABLE_OUTPUT: &str = "enable_output";

/// Type of the single argument an action expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionValueType {
    /// A number.
    Float,
    /// A flag.
    Bool,
    /// No argument.
    None,
}

/// An action a device variant supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Action {
    /// Name clients use in an [`ActionRequest`]
    pub name: &'static str,
    /// Human-readable description
    pub description: &'static str,
    /// Argument type
    pub value: ActionValueType,
}

impl Action {
    /// Check that `value` matches what this action expects.
    pub fn check(&self, value: Option<&ActionValue>) -> FleetResult<()> {
        let ok = matches!(
            (self.value, value),
            (ActionValueType::Float, Some(ActionValue::Float(_)))
                | (ActionValueType::Bool, Some(ActionValue::Bool(_)))
                | (ActionValueType::None, None)
        );
        if ok {
            Ok(())
        } else {
            Err(FleetError::Validation(format!(
                "action {:?} expects {:?}, got {:?}",
                self.name, self.value, value
            )))
        }
    }
}

const STAGE_ACTIONS: &[Action] = &[
    Action {
        name: MOVE_TO,
        description: "Move this stage to target",
        value: ActionValueType::Float,
    },
    Action {
        name: STEP_BY,
        description: "Move this stage by the given amount",
        value: ActionValueType::Float,
    },
    Action {
        name: REFERENCE,
        description: "Reference this stage",
        value: ActionValueType::None,
    },
];

const POWER_SUPPLY_ACTIONS: &[Action] = &[Action {
    name: ENABLE_OUTPUT,
    description: "Enable or Disable power output",
    value: ActionValueType::Bool,
}];

/// Argument of an [`ActionRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionValue {
    /// A boolean argument.
    Bool(bool),
    /// A numeric argument.
    Float(f64),
}

impl ActionValue {
    /// The number, if this is one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ActionValue::Float(v) => Some(*v),
            ActionValue::Bool(_) => None,
        }
    }
}

/// A client request to run one action on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Device to act on
    pub device_id: Identifier,
    /// Action name, see the constants in this module
    pub action: String,
    /// Argument, if the action takes one
    #[serde(default)]
    pub value: Option<ActionValue>,
}

impl ActionRequest {
    /// A request for an arbitrary action.
    pub fn new(device_id: Identifier, action: impl Into<String>, value: Option<ActionValue>) -> Self {
        Self {
            device_id,
            action: action.into(),
            value,
        }
    }

    /// Absolute move.
    pub fn move_to(device_id: Identifier, position: f64) -> Self {
        Self::new(device_id, MOVE_TO, Some(ActionValue::Float(position)))
    }

    /// Relative move.
    pub fn step_by(device_id: Identifier, delta: f64) -> Self {
        Self::new(device_id, STEP_BY, Some(ActionValue::Float(delta)))
    }

    /// Find the reference position.
    pub fn reference(device_id: Identifier) -> Self {
        Self::new(device_id, REFERENCE, None)
    }
}

/// Discriminant of [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// [`LinearStage`]
    StageLinear,
    /// [`RotationalStage`]
    StageRotational,
    /// [`Sensor`]
    Sensor,
    /// [`PowerSupply`]
    PowerSupply,
}

/// Fields shared by every device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Unique device identifier
    pub identifier: Identifier,
    /// Configuration the device belongs to
    pub configuration_id: ConfigurationId,
    /// Whether the owning controller is connected
    #[serde(default)]
    pub connected: bool,
    /// Free text, usually the stage model
    #[serde(default)]
    pub description: String,
    /// False while the device is busy (moving, referencing).
    #[serde(default = "default_true")]
    pub finished: bool,
}

fn default_true() -> bool {
    true
}

impl DeviceInfo {
    /// A disconnected, idle device.
    pub fn new(identifier: Identifier, configuration_id: ConfigurationId) -> Self {
        Self {
            identifier,
            configuration_id,
            connected: false,
            description: String::new(),
            finished: true,
        }
    }
}

/// A stage travelling along a line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearStage {
    /// Fields shared by every device
    #[serde(flatten)]
    pub info: DeviceInfo,
    /// Whether the last move finished
    #[serde(default)]
    pub on_target: bool,
    /// Whether the stage knows its reference position
    #[serde(default)]
    pub referenced: bool,
    /// Position in millimeters
    #[serde(default)]
    pub position: f64,
    /// Upper end of the travel range
    pub maximum: f64,
}

/// A stage turning about an axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationalStage {
    /// Fields shared by every device
    #[serde(flatten)]
    pub info: DeviceInfo,
    /// Whether the last move finished
    #[serde(default)]
    pub on_target: bool,
    /// Whether the stage knows its reference position
    #[serde(default)]
    pub referenced: bool,
    /// Angle in degrees
    #[serde(default)]
    pub angle: f64,
}

/// A read-only measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    /// Fields shared by every device
    #[serde(flatten)]
    pub info: DeviceInfo,
    /// Value this sensor last measured
    pub value: serde_json::Value,
    /// Units of `value`
    pub units: String,
}

/// A switchable power output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerSupply {
    /// Fields shared by every device
    #[serde(flatten)]
    pub info: DeviceInfo,
    /// Volts
    pub voltage: f64,
    /// Amperes
    pub current: f64,
    /// Current limit, amperes
    pub max_current: f64,
    /// Watts
    pub power: f64,
    /// Power limit, watts
    pub max_power: f64,
    /// Whether the output is switched on
    #[serde(default)]
    pub output_enabled: bool,
}

/// A device of any supported variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "device_type", rename_all = "snake_case")]
pub enum Device {
    /// A linear stage.
    StageLinear(LinearStage),
    /// A rotational stage.
    StageRotational(RotationalStage),
    /// A sensor.
    Sensor(Sensor),
    /// A power supply.
    PowerSupply(PowerSupply),
}

impl Device {
    /// Fields shared by every variant.
    pub fn info(&self) -> &DeviceInfo {
        match self {
            Device::StageLinear(d) => &d.info,
            Device::StageRotational(d) => &d.info,
            Device::Sensor(d) => &d.info,
            Device::PowerSupply(d) => &d.info,
        }
    }

    /// Shortcut for `info().identifier`.
    pub fn identifier(&self) -> Identifier {
        self.info().identifier
    }

    /// Variant of this device.
    pub fn device_type(&self) -> DeviceType {
        match self {
            Device::StageLinear(_) => DeviceType::StageLinear,
            Device::StageRotational(_) => DeviceType::StageRotational,
            Device::Sensor(_) => DeviceType::Sensor,
            Device::PowerSupply(_) => DeviceType::PowerSupply,
        }
    }

    /// Actions permitted for this device's variant.
    pub fn actions(&self) -> &'static [Action] {
        match self.device_type() {
            DeviceType::StageLinear | DeviceType::StageRotational => STAGE_ACTIONS,
            DeviceType::PowerSupply => POWER_SUPPLY_ACTIONS,
            DeviceType::Sensor => &[],
        }
    }

    /// Look up an action by name, validating its argument.
    pub fn resolve_action(&self, request: &ActionRequest) -> FleetResult<&'static Action> {
        let action = self
            .actions()
            .iter()
            .find(|a| a.name == request.action)
            .ok_or_else(|| FleetError::UnknownAction {
                identifier: self.identifier(),
                action: request.action.clone(),
            })?;
        action.check(request.value.as_ref())?;
        Ok(action)
    }

    /// Live status for stage variants.
    pub fn stage_status(&self) -> Option<StageStatus> {
        // Stage devices are "ready" once referenced; the session owns the finer-grained notion.
        match self {
            Device::StageLinear(d) => Some(StageStatus::new(
                d.info.identifier,
                d.info.connected,
                d.referenced,
                d.position,
                d.on_target,
            )),
            Device::StageRotational(d) => Some(StageStatus::new(
                d.info.identifier,
                d.info.connected,
                d.referenced,
                d.angle,
                d.on_target,
            )),
            Device::Sensor(_) | Device::PowerSupply(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> Device {
        let mut info = DeviceInfo::new(1_180_123_451, 118_012_345);
        info.connected = true;
        Device::StageLinear(LinearStage {
            info,
            on_target: true,
            referenced: true,
            position: 12.5,
            maximum: 200.0,
        })
    }

    #[test]
    fn test_actions_belong_to_variant() {
        let stage = linear();
        let names: Vec<_> = stage.actions().iter().map(|a| a.name).collect();
        assert_eq!(names, vec![MOVE_TO, STEP_BY, REFERENCE]);

        let supply = Device::PowerSupply(PowerSupply {
            info: DeviceInfo::new(7, 7),
            voltage: 0.0,
            current: 0.0,
            max_current: 1.0,
            power: 0.0,
            max_power: 10.0,
            output_enabled: false,
        });
        assert_eq!(supply.actions()[0].name, ENABLE_OUTPUT);
        assert!(supply.stage_status().is_none());
    }

    #[test]
    fn test_resolve_action_checks_value() {
        let stage = linear();
        assert!(stage
            .resolve_action(&ActionRequest::move_to(1_180_123_451, 3.0))
            .is_ok());
        assert!(stage
            .resolve_action(&ActionRequest::new(1_180_123_451, MOVE_TO, None))
            .is_err());
        let err = stage
            .resolve_action(&ActionRequest::new(1_180_123_451, "Dance", None))
            .unwrap_err();
        assert!(matches!(err, FleetError::UnknownAction { .. }));
    }

    #[test]
    fn test_serialized_with_device_type_tag() {
        let json = serde_json::to_value(linear()).unwrap();
        assert_eq!(json["device_type"], "stage_linear");
        assert_eq!(json["identifier"], 1_180_123_451_i64);
        let back: Device = serde_json::from_value(json).unwrap();
        assert_eq!(back, linear());
    }

    #[test]
    fn test_action_value_untagged() {
        let req: ActionRequest = serde_json::from_value(serde_json::json!({
            "device_id": 11, "action": "Move To", "value": 4.5
        }))
        .unwrap();
        assert_eq!(req.value, Some(ActionValue::Float(4.5)));
        let req: ActionRequest = serde_json::from_value(serde_json::json!({
            "device_id": 11, "action": "enable_output", "value": true
        }))
        .unwrap();
        assert_eq!(req.value, Some(ActionValue::Bool(true)));
    }
}
