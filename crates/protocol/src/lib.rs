//! The vocabulary shared between the motion controller and whatever talks to
//! the device.
//!
//! The byte-level wire format lives with the transport. This crate only
//! names the calls, so that they can be recorded, logged and replayed.

#![no_std]

use plotter_geom::AxisSteps;
use serde::{Deserialize, Serialize};

/// Drive mode of a single motor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotorMode {
    Disabled,
    Sixteenth,
    Eighth,
    Quarter,
    Half,
    Full,
}

impl MotorMode {
    pub fn is_enabled(self) -> bool {
        self != MotorMode::Disabled
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PenState {
    #[default]
    Up,
    Down,
}

impl PenState {
    pub fn is_down(self) -> bool {
        self == PenState::Down
    }
}

/// Every call the controller can make on a device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Cmd {
    Open,
    Close,
    SetMotorState(MotorMode, MotorMode),
    QueryStepPosition,
    SetPenState(PenState),
    QueryPenState,
    SetServoPosition {
        position: u16,
        channel: u8,
        ramp_rate: u16,
    },
    MoveBothAxes {
        duration_ms: u32,
        steps: AxisSteps,
    },
    EmergencyStop,
    ConfigureAnalogChannel {
        channel: u8,
        enabled: bool,
    },
    ReadAnalogValues,
    ReadMemory(u16),
}
