//! Host-to-driver command record.
use byte_struct::*;

use crate::enum_with_unknown;

enum_with_unknown! {
    /// Control mode requested of the driver firmware.
    ///
    /// Exactly one mode is active per motor at any time. `Open` leaves the
    /// bridge unpowered and is the state every session starts and ends in.
    pub enum ModeDesired(u8) {
        /// Unpowered / idle
        Open = 0,
        /// Phases shorted for passive braking
        Damped = 1,
        /// Closed-loop current control at a fixed setpoint
        Current = 2,
        /// Closed-loop position control
        Position = 3,
        /// Closed-loop torque control
        Torque = 4,
        /// Position and velocity stiffness control
        Impedance = 5,
        /// Closed-loop velocity control
        Velocity = 6,
        /// Current loop excitation used to characterize current-loop bandwidth
        CurrentTuning = 7,
        /// Position loop excitation used to characterize position-loop bandwidth
        PositionTuning = 8,
        /// Open-loop voltage
        Voltage = 9,
    }
}

impl Default for ModeDesired {
    fn default() -> Self {
        Self::Open
    }
}

/// Setpoints for one motor for one write.
///
/// A batch for N motors is `[Command; N]`, index-aligned with the bound motor set.
/// Fields that a mode does not use must be left at zero; the firmware never
/// carries a value over from a previous command.
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq)]
#[byte_struct_le]
pub struct Command {
    /// Write counter stamped by the host, echoed back in `Status::host_timestamp_received`
    pub host_timestamp: u32,

    /// Raw firmware mode code, see [`ModeDesired`]
    pub mode_desired: u8,

    /// Current setpoint [A], or excitation amplitude in `CurrentTuning`
    pub current_desired: f32,

    /// Position setpoint [rad]
    pub position_desired: f32,

    /// Velocity setpoint [rad/s]
    pub velocity_desired: f32,

    /// Torque setpoint [Nm]
    pub torque_desired: f32,

    /// Mode-specific auxiliary parameter.
    /// In `CurrentTuning` this is the excitation sweep rate [Hz/s].
    pub reserved: f32,
}

impl Command {
    /// A command in `mode` with every setpoint zeroed.
    pub fn new(mode: ModeDesired) -> Self {
        Self {
            mode_desired: mode.into(),
            ..Default::default()
        }
    }

    /// The all-zero command, which is `Open` with no setpoints.
    pub fn neutral() -> Self {
        Self::default()
    }

    /// Decoded control mode.
    pub fn mode(&self) -> ModeDesired {
        ModeDesired::from(self.mode_desired)
    }

    /// Whether two commands request the same thing, ignoring the write counter.
    pub fn same_setpoints(&self, other: &Self) -> bool {
        Self {
            host_timestamp: 0,
            ..*self
        } == Self {
            host_timestamp: 0,
            ..*other
        }
    }
}
