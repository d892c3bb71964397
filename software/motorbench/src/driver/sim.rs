//! Software stand-in for a motor driver, for running sessions with no hardware in the loop.
//!
//! Each simulated motor follows the last command it accepted:
//! * `Open` and unrecognized modes leave the bridge off, with zero current.
//! * `Velocity` integrates the velocity setpoint into position.
//! * `Current` tracks the current setpoint through a first-order current loop.
//! * `CurrentTuning` drives a linear chirp of amplitude `current_desired`, sweeping
//!   at `reserved` Hz/s from the moment the mode is entered, through the same
//!   first-order current loop.
//!
//! Telemetry is produced at a fixed period, and each read sleeps on the shared
//! clock for one period. With a [`ManualClock`](crate::clock::ManualClock), time
//! advances only through those sleeps, so the session is deterministic.
//!
//! Faults can be injected to exercise error paths: failing writes, failing reads,
//! and telemetry that stops updating.
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use motorbench_shared::{Command, ModeDesired, Status};
use tracing::debug;

use crate::clock::Clock;
use crate::error::DriverError;

use super::{CommandStage, MotorDriver};

/// Dynamics shared by every simulated motor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimMotorParams {
    /// -3 dB bandwidth of the simulated current loop [Hz]
    pub bandwidth_hz: f64,

    /// Telemetry period
    pub status_period: Duration,

    /// Setpoints expire to zero if not refreshed within this time
    pub setpoint_timeout: Option<Duration>,
}

impl Default for SimMotorParams {
    fn default() -> Self {
        Self {
            bandwidth_hz: 800.0,
            status_period: Duration::from_micros(100),
            setpoint_timeout: None,
        }
    }
}

/// Internal state of one simulated motor
#[derive(Debug, Clone, Default)]
struct SimMotor {
    command: Command,
    accepted_at: Duration,
    mode_entered_at: Duration,
    last_update: Duration,
    transitions: usize,

    position: f64,
    iq: f64,
    mcu_timestamp: u32,
    host_timestamp_received: u32,

    /// Last telemetry frame sent to the host
    reported: Status,
}

impl SimMotor {
    /// Integrate dynamics from the last update to `now`.
    fn advance(&mut self, now: Duration, params: &SimMotorParams) {
        let start = self.last_update;
        if now <= start {
            return;
        }
        self.last_update = now;

        // Setpoints are only in force until they expire
        let active_until = match params.setpoint_timeout {
            Some(timeout) => now.min(self.accepted_at + timeout),
            None => now,
        };
        let active = active_until > start;
        let dt = (now - start).as_secs_f64();

        let target = match (self.command.mode(), active) {
            (ModeDesired::Velocity, true) => {
                let dt_active = (active_until - start).as_secs_f64();
                self.position += f64::from(self.command.velocity_desired) * dt_active;
                0.0
            }
            (ModeDesired::Current, true) => f64::from(self.command.current_desired),
            (ModeDesired::CurrentTuning, true) => {
                let t = now.saturating_sub(self.mode_entered_at).as_secs_f64();
                let rate = f64::from(self.command.reserved);
                f64::from(self.command.current_desired) * (PI * rate * t * t).sin()
            }
            (ModeDesired::Current | ModeDesired::CurrentTuning, false)
            | (ModeDesired::Velocity, false) => 0.0,
            _ => {
                // Bridge is off
                self.iq = 0.0;
                return;
            }
        };

        // Exact discretization of a first-order lag
        let alpha = 1.0 - (-2.0 * PI * params.bandwidth_hz * dt).exp();
        self.iq += alpha * (target - self.iq);
    }

    fn accept(&mut self, command: Command, now: Duration) {
        if command.mode_desired != self.command.mode_desired {
            self.mode_entered_at = now;
            self.transitions += 1;
        }
        self.command = command;
        self.accepted_at = now;
        self.host_timestamp_received = command.host_timestamp;
    }

    fn status(&self) -> Status {
        Status {
            mcu_timestamp: self.mcu_timestamp,
            host_timestamp_received: self.host_timestamp_received,
            motor_position: self.position as f32,
            joint_position: self.position as f32,
            iq: self.iq as f32,
            torque: 0.0,
            motor_encoder: 0,
            reserved: 0.0,
        }
    }
}

/// Injected failures, counted from the moment they are armed
#[derive(Debug, Clone, Copy, Default)]
struct Faults {
    fail_writes_after: Option<usize>,
    fail_reads_after: Option<usize>,
    stall_after: Option<usize>,
    writes: usize,
    reads: usize,
}

/// A simulated driver with `n` reachable motors at paths `sim0`, `sim1`, ...
pub struct SimulatedDriver {
    stage: CommandStage,
    clock: Arc<dyn Clock>,
    params: SimMotorParams,
    available: Vec<String>,
    bound: Vec<usize>,
    motors: Vec<SimMotor>,
    history: Vec<Vec<Command>>,
    faults: Faults,
}

impl core::fmt::Debug for SimulatedDriver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimulatedDriver")
            .field("params", &self.params)
            .field("available", &self.available)
            .field("bound", &self.bound)
            .field("writes", &self.history.len())
            .finish()
    }
}

impl SimulatedDriver {
    pub fn new(n: usize, clock: Arc<dyn Clock>) -> Self {
        Self::with_params(n, clock, SimMotorParams::default())
    }

    pub fn with_params(n: usize, clock: Arc<dyn Clock>, params: SimMotorParams) -> Self {
        Self {
            stage: CommandStage::default(),
            clock,
            params,
            available: (0..n).map(|i| format!("sim{i}")).collect(),
            bound: Vec::new(),
            motors: vec![SimMotor::default(); n],
            history: Vec::new(),
            faults: Faults::default(),
        }
    }

    /// Every batch accepted so far, oldest first
    pub fn history(&self) -> &[Vec<Command>] {
        &self.history
    }

    /// The most recent batch accepted
    pub fn last_batch(&self) -> Option<&[Command]> {
        self.history.last().map(Vec::as_slice)
    }

    /// Mode each bound motor is currently in
    pub fn motor_modes(&self) -> Vec<ModeDesired> {
        self.bound
            .iter()
            .map(|&i| self.motors[i].command.mode())
            .collect()
    }

    /// Number of mode changes each bound motor has seen
    pub fn transitions(&self) -> Vec<usize> {
        self.bound
            .iter()
            .map(|&i| self.motors[i].transitions)
            .collect()
    }

    /// Reject every write after `n` more succeed.
    pub fn fail_writes_after(&mut self, n: usize) {
        self.faults.fail_writes_after = Some(n);
        self.faults.writes = 0;
    }

    /// Reject every read after `n` more succeed.
    pub fn fail_reads_after(&mut self, n: usize) {
        self.faults.fail_reads_after = Some(n);
        self.faults.reads = 0;
    }

    /// Freeze telemetry after `n` more reads.
    pub fn stall_after(&mut self, n: usize) {
        self.faults.stall_after = Some(n);
        self.faults.reads = 0;
    }

    /// Remove all injected faults.
    pub fn clear_faults(&mut self) {
        self.faults = Faults::default();
    }

    fn advance_all(&mut self, now: Duration) {
        for &i in &self.bound {
            self.motors[i].advance(now, &self.params);
        }
    }
}

impl MotorDriver for SimulatedDriver {
    fn stage(&self) -> &CommandStage {
        &self.stage
    }

    fn stage_mut(&mut self) -> &mut CommandStage {
        &mut self.stage
    }

    fn get_motors_by_path(&mut self, paths: &[String]) -> Result<usize, DriverError> {
        let bound = if paths.is_empty() {
            (0..self.available.len()).collect()
        } else {
            paths
                .iter()
                .map(|p| {
                    let mut found = self
                        .available
                        .iter()
                        .enumerate()
                        .filter(|(_, a)| *a == p)
                        .map(|(i, _)| i);
                    match (found.next(), found.next()) {
                        (Some(i), None) => Ok(i),
                        (Some(_), Some(_)) => Err(DriverError::AmbiguousMotor(p.clone())),
                        (None, _) => Err(DriverError::MotorNotFound(p.clone())),
                    }
                })
                .collect::<Result<Vec<usize>, DriverError>>()?
        };

        debug!("Bound simulated motors {bound:?}");
        self.bound = bound;
        self.stage.reset(self.bound.len());
        Ok(self.bound.len())
    }

    fn transmit(&mut self, batch: &[Command]) -> Result<(), DriverError> {
        if self.bound.is_empty() {
            return Err(DriverError::NoMotors);
        }
        if let Some(limit) = self.faults.fail_writes_after {
            if self.faults.writes >= limit {
                return Err(DriverError::Disconnected("simulated write failure".into()));
            }
        }
        self.faults.writes += 1;

        let now = self.clock.now();
        self.advance_all(now);
        for (&i, c) in self.bound.iter().zip(batch) {
            self.motors[i].accept(*c, now);
        }
        self.history.push(batch.to_vec());
        Ok(())
    }

    fn read(&mut self) -> Result<Vec<Status>, DriverError> {
        if self.bound.is_empty() {
            return Err(DriverError::NoMotors);
        }
        if let Some(limit) = self.faults.fail_reads_after {
            if self.faults.reads >= limit {
                return Err(DriverError::Disconnected("simulated read failure".into()));
            }
        }
        let stalled = self
            .faults
            .stall_after
            .is_some_and(|limit| self.faults.reads >= limit);
        self.faults.reads += 1;

        // Block until the next telemetry frame
        self.clock.sleep(self.params.status_period);

        if !stalled {
            let now = self.clock.now();
            self.advance_all(now);
            for &i in &self.bound {
                let m = &mut self.motors[i];
                m.mcu_timestamp = m.mcu_timestamp.wrapping_add(1);
                m.reported = m.status();
            }
        }

        Ok(self
            .bound
            .iter()
            .map(|&i| self.motors[i].reported)
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::clock::ManualClock;

    fn bound(n: usize, params: SimMotorParams) -> (SimulatedDriver, ManualClock) {
        let clock = ManualClock::new();
        let mut d = SimulatedDriver::with_params(n, Arc::new(clock.clone()), params);
        d.get_motors_by_path(&[]).unwrap();
        (d, clock)
    }

    #[test]
    fn binds_by_path_in_order() {
        let mut d = SimulatedDriver::new(3, Arc::new(ManualClock::new()));
        let n = d
            .get_motors_by_path(&["sim2".to_owned(), "sim0".to_owned()])
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(d.motor_count(), 2);
        assert_eq!(d.bound, vec![2, 0]);

        assert_eq!(
            d.get_motors_by_path(&["usb1".to_owned()]),
            Err(DriverError::MotorNotFound("usb1".into()))
        );
    }

    #[test]
    fn unbound_driver_rejects_traffic() {
        let mut d = SimulatedDriver::new(1, Arc::new(ManualClock::new()));
        assert_eq!(d.read(), Err(DriverError::NoMotors));
        assert_eq!(d.transmit(&[]), Err(DriverError::NoMotors));
    }

    #[test]
    fn velocity_integrates_position() {
        let (mut d, clock) = bound(1, SimMotorParams::default());
        d.set_command_mode(ModeDesired::Velocity);
        d.set_command_velocity(&[2.0]).unwrap();
        d.write_saved_commands().unwrap();
        clock.sleep(Duration::from_secs(1));
        let s = d.read().unwrap();
        // One status period elapses inside the read
        assert!((s[0].motor_position - 2.0002).abs() < 1e-4);
    }

    #[test]
    fn setpoints_expire_without_refresh() {
        let params = SimMotorParams {
            setpoint_timeout: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        let (mut d, clock) = bound(1, params);
        d.set_command_mode(ModeDesired::Velocity);
        d.set_command_velocity(&[1.0]).unwrap();
        d.write_saved_commands().unwrap();
        clock.sleep(Duration::from_secs(2));
        let s = d.read().unwrap();
        assert!((s[0].motor_position - 0.5).abs() < 1e-6);

        // Refreshing resumes motion
        d.write_saved_commands().unwrap();
        clock.sleep(Duration::from_millis(200));
        let s = d.read().unwrap();
        assert!((s[0].motor_position - 0.7001).abs() < 1e-4);
    }

    #[test]
    fn identical_batches_do_not_transition() {
        let (mut d, _clock) = bound(2, SimMotorParams::default());
        d.set_command_mode(ModeDesired::Velocity);
        d.write_saved_commands().unwrap();
        d.write_saved_commands().unwrap();
        assert_eq!(d.transitions(), vec![1, 1]);
        assert_eq!(d.motor_modes(), vec![ModeDesired::Velocity; 2]);
        assert_eq!(d.history().len(), 2);
    }

    #[test]
    fn current_loop_settles_to_setpoint() {
        let (mut d, _clock) = bound(1, SimMotorParams::default());
        d.set_command_mode(ModeDesired::Current);
        d.set_command_current(&[0.5]).unwrap();
        d.write_saved_commands().unwrap();
        let mut last = 0.0;
        for _ in 0..100 {
            last = d.read().unwrap()[0].iq;
        }
        assert!((last - 0.5).abs() < 1e-3);

        d.set_command_mode(ModeDesired::Open);
        d.write_saved_commands().unwrap();
        assert_eq!(d.read().unwrap()[0].iq, 0.0);
    }

    #[test]
    fn injected_faults() {
        let (mut d, _clock) = bound(1, SimMotorParams::default());
        d.fail_writes_after(1);
        assert!(d.write_saved_commands().is_ok());
        assert!(matches!(
            d.write_saved_commands(),
            Err(DriverError::Disconnected(_))
        ));
        d.clear_faults();

        d.stall_after(2);
        let a = d.read().unwrap()[0];
        let b = d.read().unwrap()[0];
        let c = d.read().unwrap()[0];
        assert!(b.is_fresh_since(Some(&a)));
        assert!(!c.is_fresh_since(Some(&b)));
        d.clear_faults();

        d.fail_reads_after(0);
        assert!(d.read().is_err());
        assert!(d.write_saved_commands().is_ok());
    }
}
