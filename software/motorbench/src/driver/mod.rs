//! Command/telemetry interface to a motor driver.
//!
//! A [`MotorDriver`] owns the bound motor set and a staged command batch.
//! Implementations provide binding, dispatch of a whole batch, and telemetry
//! reads; staging, write counting, and batch serialization are shared
//! default methods on top of [`CommandStage`].

pub mod sim;

pub use sim::{SimMotorParams, SimulatedDriver};

use motorbench_shared::{ByteStruct, ByteStructLen, Command, ModeDesired, Status};

use crate::error::DriverError;

/// Staged per-motor commands and the write counter.
#[derive(Debug, Clone, Default)]
pub struct CommandStage {
    commands: Vec<Command>,
    count: u32,
    auto_count: bool,
}

impl CommandStage {
    /// A stage for `n` motors, all neutral.
    pub fn new(n: usize) -> Self {
        Self {
            commands: vec![Command::neutral(); n],
            ..Default::default()
        }
    }

    /// Resize for a new motor set, discarding staged setpoints.
    pub fn reset(&mut self, n: usize) {
        self.commands = vec![Command::neutral(); n];
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn commands_mut(&mut self) -> &mut [Command] {
        &mut self.commands
    }

    /// Number of writes issued so far
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn auto_count(&self) -> bool {
        self.auto_count
    }

    pub fn set_auto_count(&mut self, enable: bool) {
        self.auto_count = enable;
    }

    /// Advance the write counter and, with auto-count on,
    /// stamp it into every command of `batch` and of the stage.
    fn stamp(&mut self, batch: &mut [Command]) {
        self.count = self.count.wrapping_add(1);
        if self.auto_count {
            for c in batch.iter_mut().chain(self.commands.iter_mut()) {
                c.host_timestamp = self.count;
            }
        }
    }

    fn check_len(&self, got: usize) -> Result<(), DriverError> {
        if got != self.commands.len() {
            return Err(DriverError::BatchLength {
                expected: self.commands.len(),
                got,
            });
        }
        Ok(())
    }
}

/// Field names of `Command` in header order
const COMMAND_FIELDS: [&str; 7] = [
    "host_timestamp",
    "mode_desired",
    "current_desired",
    "position_desired",
    "velocity_desired",
    "torque_desired",
    "reserved",
];

/// Field names of `Status` in header order
const STATUS_FIELDS: [&str; 8] = [
    "mcu_timestamp",
    "host_timestamp_received",
    "motor_position",
    "joint_position",
    "iq",
    "torque",
    "motor_encoder",
    "reserved",
];

/// Field-major column names, `<field><motor index>`
fn headers(fields: &[&str], n: usize) -> Vec<String> {
    fields
        .iter()
        .flat_map(|f| (0..n).map(move |i| format!("{f}{i}")))
        .collect()
}

/// Command dispatch and telemetry read-back for a set of motors.
///
/// Every batch and every read is index-aligned with the bound motor set.
pub trait MotorDriver {
    /// Staged batch and write counter
    fn stage(&self) -> &CommandStage;

    /// Mutable access to the staged batch and write counter
    fn stage_mut(&mut self) -> &mut CommandStage;

    /// Bind the motors at `paths`, in that order.
    /// An empty list binds every motor the driver can reach.
    /// Returns the number of bound motors and resets the staged batch.
    fn get_motors_by_path(&mut self, paths: &[String]) -> Result<usize, DriverError>;

    /// Send a complete batch to the bound motors in one operation
    fn transmit(&mut self, batch: &[Command]) -> Result<(), DriverError>;

    /// Latest telemetry, one sample per bound motor
    fn read(&mut self) -> Result<Vec<Status>, DriverError>;

    //
    // Everything below this point is shared staging and bookkeeping

    /// Number of bound motors
    fn motor_count(&self) -> usize {
        self.stage().commands().len()
    }

    /// Currently staged batch
    fn commands(&self) -> &[Command] {
        self.stage().commands()
    }

    /// Stamp each write with an incrementing counter that the driver echoes back
    fn set_auto_count(&mut self) {
        self.stage_mut().set_auto_count(true);
    }

    /// Dispatch `batch`, stamping the write counter first
    fn write(&mut self, batch: &[Command]) -> Result<(), DriverError> {
        self.stage().check_len(batch.len())?;
        let mut batch = batch.to_vec();
        self.stage_mut().stamp(&mut batch);
        self.transmit(&batch)
    }

    /// Dispatch the staged batch
    fn write_saved_commands(&mut self) -> Result<(), DriverError> {
        let batch = self.commands().to_vec();
        self.write(&batch)
    }

    /// Replace the staged batch
    fn set_commands(&mut self, commands: &[Command]) -> Result<(), DriverError> {
        let stage = self.stage_mut();
        stage.check_len(commands.len())?;
        stage.commands_mut().copy_from_slice(commands);
        Ok(())
    }

    /// Stage the same mode for every motor
    fn set_command_mode(&mut self, mode: ModeDesired) {
        for c in self.stage_mut().commands_mut() {
            c.mode_desired = mode.into();
        }
    }

    fn set_command_current(&mut self, values: &[f32]) -> Result<(), DriverError> {
        stage_field(self.stage_mut(), values, |c, v| c.current_desired = v)
    }

    fn set_command_position(&mut self, values: &[f32]) -> Result<(), DriverError> {
        stage_field(self.stage_mut(), values, |c, v| c.position_desired = v)
    }

    fn set_command_velocity(&mut self, values: &[f32]) -> Result<(), DriverError> {
        stage_field(self.stage_mut(), values, |c, v| c.velocity_desired = v)
    }

    fn set_command_torque(&mut self, values: &[f32]) -> Result<(), DriverError> {
        stage_field(self.stage_mut(), values, |c, v| c.torque_desired = v)
    }

    fn set_command_reserved(&mut self, values: &[f32]) -> Result<(), DriverError> {
        stage_field(self.stage_mut(), values, |c, v| c.reserved = v)
    }

    /// Column names for a batch of commands
    fn command_headers(&self) -> Vec<String> {
        headers(&COMMAND_FIELDS, self.motor_count())
    }

    /// Column names for a read of telemetry
    fn status_headers(&self) -> Vec<String> {
        headers(&STATUS_FIELDS, self.motor_count())
    }

    /// Packed staged batch: motor count as little-endian `u32`, then each command
    fn serialize_saved_commands(&self) -> Vec<u8> {
        let commands = self.commands();
        let mut out = vec![0_u8; 4 + commands.len() * Command::BYTE_LEN];
        out[..4].copy_from_slice(&(commands.len() as u32).to_le_bytes());
        for (c, chunk) in commands
            .iter()
            .zip(out[4..].chunks_exact_mut(Command::BYTE_LEN))
        {
            c.write_bytes(chunk);
        }
        out
    }

    /// Restage a batch produced by `serialize_saved_commands`
    fn deserialize_saved_commands(&mut self, data: &[u8]) -> Result<(), DriverError> {
        let Some((len, body)) = data.split_first_chunk::<4>() else {
            return Err(DriverError::Transport(
                "Serialized batch is missing its length prefix".into(),
            ));
        };
        let n = u32::from_le_bytes(*len) as usize;
        self.stage().check_len(n)?;
        if body.len() != n * Command::BYTE_LEN {
            return Err(DriverError::Transport(format!(
                "Serialized batch has {} bytes for {n} commands",
                body.len()
            )));
        }
        let commands: Vec<Command> = body
            .chunks_exact(Command::BYTE_LEN)
            .map(Command::read_bytes)
            .collect();
        self.set_commands(&commands)
    }
}

/// Stage one field per motor from an index-aligned slice
fn stage_field(
    stage: &mut CommandStage,
    values: &[f32],
    set: impl Fn(&mut Command, f32),
) -> Result<(), DriverError> {
    stage.check_len(values.len())?;
    for (c, v) in stage.commands_mut().iter_mut().zip(values) {
        set(c, *v);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn sim(n: usize) -> SimulatedDriver {
        let mut d = SimulatedDriver::new(n, Arc::new(ManualClock::new()));
        d.get_motors_by_path(&[]).unwrap();
        d
    }

    #[test]
    fn read_after_write_is_index_aligned() {
        for n in 1..4 {
            let mut d = sim(n);
            d.set_command_mode(ModeDesired::Open);
            d.write_saved_commands().unwrap();
            assert_eq!(d.read().unwrap().len(), n);
        }
    }

    #[test]
    fn auto_count_is_echoed() {
        let mut d = sim(2);
        d.set_auto_count();
        d.set_command_mode(ModeDesired::Open);
        d.write_saved_commands().unwrap();
        let s = d.read().unwrap();
        assert!(s.iter().all(|s| s.host_timestamp_received == 1));

        d.write_saved_commands().unwrap();
        let s = d.read().unwrap();
        assert!(s.iter().all(|s| s.host_timestamp_received == 2));
        assert_eq!(d.commands()[0].host_timestamp, 2);
    }

    #[test]
    fn without_auto_count_timestamp_is_untouched() {
        let mut d = sim(1);
        d.write_saved_commands().unwrap();
        assert_eq!(d.stage().count(), 1);
        assert_eq!(d.commands()[0].host_timestamp, 0);
    }

    #[test]
    fn staging_checks_batch_length() {
        let mut d = sim(2);
        assert_eq!(
            d.set_command_velocity(&[1.0]),
            Err(DriverError::BatchLength {
                expected: 2,
                got: 1
            })
        );
        assert!(d.write(&[Command::neutral(); 3]).is_err());
        d.set_command_velocity(&[1.0, -1.0]).unwrap();
        assert_eq!(d.commands()[1].velocity_desired, -1.0);
    }

    #[test]
    fn headers_are_field_major() {
        let d = sim(2);
        let h = d.command_headers();
        assert_eq!(h.len(), 14);
        assert_eq!(&h[..3], &["host_timestamp0", "host_timestamp1", "mode_desired0"]);
        let h = d.status_headers();
        assert_eq!(h.len(), 16);
        assert_eq!(h[8], "iq0");
    }

    #[test]
    fn saved_commands_roundtrip() {
        let mut d = sim(2);
        d.set_command_mode(ModeDesired::CurrentTuning);
        d.set_command_current(&[-0.3, -0.3]).unwrap();
        d.set_command_reserved(&[200.0, 200.0]).unwrap();
        let bytes = d.serialize_saved_commands();
        assert_eq!(bytes.len(), 4 + 2 * Command::BYTE_LEN);

        let mut other = sim(2);
        other.deserialize_saved_commands(&bytes).unwrap();
        assert_eq!(other.commands(), d.commands());

        let mut wrong = sim(3);
        assert!(wrong.deserialize_saved_commands(&bytes).is_err());
        assert!(other.deserialize_saved_commands(&bytes[..10]).is_err());
        assert!(other.deserialize_saved_commands(&bytes[..2]).is_err());
    }
}
