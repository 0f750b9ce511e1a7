//! Deck-mounted hardware modules.
//!
//! Modules sit in a slot and raise the labware loaded on them. Their drivers
//! are outside this crate; here each module validates commands against its
//! limits and records the state the robot needs for planning (for example,
//! whether a thermocycler lid blocks access).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RobotError, RobotResult};
use crate::pose::ObjectId;
use crate::types::Point;

pub const TEMPERATURE_RANGE_C: (f64, f64) = (4.0, 95.0);
pub const THERMOCYCLER_BLOCK_RANGE_C: (f64, f64) = (4.0, 99.0);
pub const THERMOCYCLER_LID_RANGE_C: (f64, f64) = (37.0, 110.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModuleModel {
    TemperatureModuleV1,
    TemperatureModuleV2,
    MagneticModuleV1,
    MagneticModuleV2,
    ThermocyclerModuleV1,
}

impl ModuleModel {
    /// Offset from the slot origin to where labware sits on the module.
    pub fn labware_offset(&self) -> Point {
        match self {
            ModuleModel::TemperatureModuleV1 => Point::new(-0.15, -0.15, 80.09),
            ModuleModel::TemperatureModuleV2 => Point::new(-1.45, -0.15, 80.09),
            ModuleModel::MagneticModuleV1 => Point::new(0.125, -0.125, 82.25),
            ModuleModel::MagneticModuleV2 => Point::new(-1.175, -0.125, 82.25),
            ModuleModel::ThermocyclerModuleV1 => Point::new(0.0, 82.56, 97.8),
        }
    }

    /// Highest allowed magnet engage height, in the module's native units.
    pub fn max_engage_height(&self) -> Option<f64> {
        match self {
            // Half-millimetre steps on the first generation
            ModuleModel::MagneticModuleV1 => Some(45.0),
            ModuleModel::MagneticModuleV2 => Some(25.0),
            _ => None,
        }
    }

    pub fn is_thermocycler(&self) -> bool {
        matches!(self, ModuleModel::ThermocyclerModuleV1)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModuleModel::TemperatureModuleV1 => "temperatureModuleV1",
            ModuleModel::TemperatureModuleV2 => "temperatureModuleV2",
            ModuleModel::MagneticModuleV1 => "magneticModuleV1",
            ModuleModel::MagneticModuleV2 => "magneticModuleV2",
            ModuleModel::ThermocyclerModuleV1 => "thermocyclerModuleV1",
        }
    }
}

impl fmt::Display for ModuleModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModuleModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temperatureModuleV1" | "tempdeck" => Ok(ModuleModel::TemperatureModuleV1),
            "temperatureModuleV2" | "temperature module gen2" => {
                Ok(ModuleModel::TemperatureModuleV2)
            }
            "magneticModuleV1" | "magdeck" => Ok(ModuleModel::MagneticModuleV1),
            "magneticModuleV2" | "magnetic module gen2" => Ok(ModuleModel::MagneticModuleV2),
            "thermocyclerModuleV1" | "thermocycler" => Ok(ModuleModel::ThermocyclerModuleV1),
            other => Err(format!("unknown module model '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModuleCommand {
    SetTemperature(f64),
    Engage { height: f64 },
    Disengage,
    OpenLid,
    CloseLid,
    SetBlockTemperature(f64),
    SetLidTemperature(f64),
    Deactivate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModuleState {
    Temperature {
        target: Option<f64>,
    },
    Magnetic {
        engaged_height: Option<f64>,
    },
    Thermocycler {
        lid_open: bool,
        block_target: Option<f64>,
        lid_target: Option<f64>,
    },
}

#[derive(Debug, Clone)]
pub struct DeckModule {
    pub id: ObjectId,
    pub model: ModuleModel,
    pub slot: String,
    pub labware: Option<ObjectId>,
    state: ModuleState,
}

fn check_range(what: &str, value: f64, (min, max): (f64, f64)) -> RobotResult<()> {
    if !(min..=max).contains(&value) {
        return Err(RobotError::OutOfRange {
            what: what.to_string(),
            value,
            min,
            max,
        });
    }
    Ok(())
}

impl DeckModule {
    pub fn new(id: ObjectId, model: ModuleModel, slot: String) -> Self {
        let state = match model {
            ModuleModel::TemperatureModuleV1 | ModuleModel::TemperatureModuleV2 => {
                ModuleState::Temperature { target: None }
            }
            ModuleModel::MagneticModuleV1 | ModuleModel::MagneticModuleV2 => {
                ModuleState::Magnetic {
                    engaged_height: None,
                }
            }
            ModuleModel::ThermocyclerModuleV1 => ModuleState::Thermocycler {
                lid_open: false,
                block_target: None,
                lid_target: None,
            },
        };
        Self {
            id,
            model,
            slot,
            labware: None,
            state,
        }
    }

    pub fn state(&self) -> &ModuleState {
        &self.state
    }

    /// Whether labware on this module can be reached by a pipette.
    pub fn is_accessible(&self) -> bool {
        !matches!(self.state, ModuleState::Thermocycler { lid_open: false, .. })
    }

    /// Validate and apply a command. State is untouched when validation fails.
    pub fn apply(&mut self, command: ModuleCommand) -> RobotResult<()> {
        let model = self.model;
        match (&mut self.state, command) {
            (ModuleState::Temperature { target }, ModuleCommand::SetTemperature(celsius)) => {
                check_range("temperature", celsius, TEMPERATURE_RANGE_C)?;
                *target = Some(celsius);
            }
            (ModuleState::Temperature { target }, ModuleCommand::Deactivate) => *target = None,
            (ModuleState::Magnetic { engaged_height }, ModuleCommand::Engage { height }) => {
                let max = model.max_engage_height().unwrap_or(0.0);
                check_range("engage height", height, (0.0, max))?;
                *engaged_height = Some(height);
            }
            (
                ModuleState::Magnetic { engaged_height },
                ModuleCommand::Disengage | ModuleCommand::Deactivate,
            ) => *engaged_height = None,
            (ModuleState::Thermocycler { lid_open, .. }, ModuleCommand::OpenLid) => {
                *lid_open = true
            }
            (ModuleState::Thermocycler { lid_open, .. }, ModuleCommand::CloseLid) => {
                *lid_open = false
            }
            (
                ModuleState::Thermocycler { block_target, .. },
                ModuleCommand::SetBlockTemperature(celsius),
            ) => {
                check_range("block temperature", celsius, THERMOCYCLER_BLOCK_RANGE_C)?;
                *block_target = Some(celsius);
            }
            (
                ModuleState::Thermocycler { lid_target, .. },
                ModuleCommand::SetLidTemperature(celsius),
            ) => {
                check_range("lid temperature", celsius, THERMOCYCLER_LID_RANGE_C)?;
                *lid_target = Some(celsius);
            }
            (
                ModuleState::Thermocycler {
                    block_target,
                    lid_target,
                    ..
                },
                ModuleCommand::Deactivate,
            ) => {
                *block_target = None;
                *lid_target = None;
            }
            (_, command) => {
                return Err(RobotError::UnsupportedModuleCommand {
                    module: model.to_string(),
                    command: format!("{command:?}"),
                })
            }
        }
        info!("{} in slot {}: {:?}", model, self.slot, command);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::PoseGraph;

    fn module(model: ModuleModel) -> DeckModule {
        let mut graph = PoseGraph::new();
        DeckModule::new(graph.allocate_id(), model, "1".to_string())
    }

    #[test]
    fn test_temperature_range() {
        let mut temp = module(ModuleModel::TemperatureModuleV2);
        temp.apply(ModuleCommand::SetTemperature(37.0)).unwrap();
        assert!(matches!(
            temp.apply(ModuleCommand::SetTemperature(96.0)),
            Err(RobotError::OutOfRange { .. })
        ));
        assert_eq!(temp.state(), &ModuleState::Temperature { target: Some(37.0) });
    }

    #[test]
    fn test_magnet_limits_depend_on_generation() {
        let mut v1 = module(ModuleModel::MagneticModuleV1);
        let mut v2 = module(ModuleModel::MagneticModuleV2);
        v1.apply(ModuleCommand::Engage { height: 40.0 }).unwrap();
        assert!(v2.apply(ModuleCommand::Engage { height: 40.0 }).is_err());
        v2.apply(ModuleCommand::Engage { height: 20.0 }).unwrap();
        v2.apply(ModuleCommand::Disengage).unwrap();
        assert_eq!(v2.state(), &ModuleState::Magnetic { engaged_height: None });
    }

    #[test]
    fn test_thermocycler_lid_and_ranges() {
        let mut tc = module(ModuleModel::ThermocyclerModuleV1);
        assert!(!tc.is_accessible());
        tc.apply(ModuleCommand::OpenLid).unwrap();
        assert!(tc.is_accessible());
        assert!(tc.apply(ModuleCommand::SetLidTemperature(30.0)).is_err());
        tc.apply(ModuleCommand::SetLidTemperature(105.0)).unwrap();
        tc.apply(ModuleCommand::SetBlockTemperature(4.0)).unwrap();
    }

    #[test]
    fn test_unsupported_command() {
        let mut temp = module(ModuleModel::TemperatureModuleV1);
        assert!(matches!(
            temp.apply(ModuleCommand::OpenLid),
            Err(RobotError::UnsupportedModuleCommand { .. })
        ));
        assert_eq!("magdeck".parse::<ModuleModel>().unwrap(), ModuleModel::MagneticModuleV1);
    }
}
