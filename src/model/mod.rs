//! Device and configuration data model shared by every controller family.

pub mod configuration;
pub mod device;
pub mod identifier;
pub mod stage;

pub use configuration::{
    Configuration, PiConfiguration, PiConnectionType, PiControllerModel, PiStage,
    StandaConfiguration, VirtualStageConfig, NO_STAGE, PI_FAMILY, STANDA_FAMILY, VIRTUAL_FAMILY,
};
pub use device::{
    Action, ActionRequest, ActionValue, ActionValueType, Device, DeviceInfo, DeviceType,
    LinearStage, PowerSupply, RotationalStage, Sensor, ENABLE_OUTPUT, MOVE_TO, REFERENCE, STEP_BY,
};
pub use identifier::{Addressing, CompoundId, ConfigurationId, Identifier, UNPARSED_IDENTIFIER};
pub use stage::{StageInfo, StageKind, StageStatus};
