//! Stage descriptions and live stage state.

use crate::error::{FleetError, FleetResult};
use crate::model::identifier::Identifier;
use serde::{Deserialize, Serialize};

/// Travel geometry of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    /// Travel in millimeters.
    #[default]
    Linear,
    /// Travel in degrees.
    Rotational,
}

/// Static, slow-changing description of a stage: model, kind and travel range (mm).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInfo {
    /// Stage this describes
    pub identifier: Identifier,
    /// Stage model, e.g. `L-406.20DD10`
    pub model: String,
    /// Linear or rotational
    #[serde(default)]
    pub kind: StageKind,
    /// Lower end of travel, if bounded
    #[serde(default)]
    pub minimum: Option<f64>,
    /// Upper end of travel, if bounded
    #[serde(default)]
    pub maximum: Option<f64>,
}

impl StageInfo {
    /// Check the travel range: linear stages need both bounds, bounds are
    /// non-negative and `minimum <= maximum`.
    pub fn validate(&self) -> FleetResult<()> {
        if self.kind == StageKind::Linear && (self.minimum.is_none() || self.maximum.is_none()) {
            return Err(FleetError::Validation(format!(
                "linear stage {} needs minimum and maximum",
                self.identifier
            )));
        }
        for bound in [self.minimum, self.maximum].into_iter().flatten() {
            if !bound.is_finite() || bound < 0.0 {
                return Err(FleetError::Validation(format!(
                    "stage {} has invalid travel bound {bound}",
                    self.identifier
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.minimum, self.maximum) {
            if min > max {
                return Err(FleetError::Validation(format!(
                    "stage {}: minimum position must be smaller or equal to maximum position",
                    self.identifier
                )));
            }
        }
        Ok(())
    }

    /// Whether `position` lies inside the travel range (open ends accept anything).
    pub fn contains(&self, position: f64) -> bool {
        self.minimum.map_or(true, |min| position >= min)
            && self.maximum.map_or(true, |max| position <= max)
    }
}

/// Fast-changing live state of a stage.
///
/// `ready` is never true while `connected` is false; both the constructor and
/// deserialization enforce this.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawStageStatus")]
pub struct StageStatus {
    /// Stage this describes
    pub identifier: Identifier,
    /// Whether the controller answers
    pub connected: bool,
    /// Connected and able to move
    pub ready: bool,
    /// Current position (mm or degrees)
    pub position: f64,
    /// Whether the last move finished
    pub on_target: bool,
}

#[derive(Deserialize)]
struct RawStageStatus {
    identifier: Identifier,
    #[serde(default)]
    connected: bool,
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    position: f64,
    #[serde(default)]
    on_target: bool,
}

impl From<RawStageStatus> for StageStatus {
    fn from(raw: RawStageStatus) -> Self {
        StageStatus::new(
            raw.identifier,
            raw.connected,
            raw.ready,
            raw.position,
            raw.on_target,
        )
    }
}

impl StageStatus {
    /// Build a status; `ready` is forced false when not connected.
    pub fn new(
        identifier: Identifier,
        connected: bool,
        ready: bool,
        position: f64,
        on_target: bool,
    ) -> Self {
        Self {
            identifier,
            connected,
            ready: connected && ready,
            position,
            on_target,
        }
    }

    /// Status reported for a stage whose controller is not connected.
    pub fn disconnected(identifier: Identifier) -> Self {
        Self::new(identifier, false, false, 0.0, false)
    }
}
