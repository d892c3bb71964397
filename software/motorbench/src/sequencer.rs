//! Safe mode transitions for a bound motor set.
//!
//! ```text
//!            enter(Velocity)           enter(CurrentTuning)
//!   Open  ------------------>  Velocity  ------------------>  CurrentTuning
//!    ^                            |                                 |
//!    |  release / drop / error    |                                 |
//!    +----------------------------+---------------------------------+
//! ```
//!
//! A [`ModeSequencer`] exclusively borrows the driver for the length of a
//! session. Every transition is an explicit [`ModeSequencer::enter`]; the
//! session starts in `Open` and is returned to `Open` whenever it ends,
//! whether through [`ModeSequencer::finish`], an error, or unwinding.

use std::time::Duration;

use motorbench_shared::{Command, ModeDesired, Status};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{CurrentTuningConfig, SequencerConfig};
use crate::driver::MotorDriver;
use crate::error::{BenchError, Result};

/// Setpoints applied to every motor when entering a mode.
///
/// Anything not set here is sent as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Setpoints {
    pub current: f32,
    pub position: f32,
    pub velocity: f32,
    pub torque: f32,
    pub reserved: f32,
}

impl Setpoints {
    pub fn velocity(velocity: f32) -> Self {
        Self {
            velocity,
            ..Default::default()
        }
    }

    pub fn current_tuning(cfg: &CurrentTuningConfig) -> Self {
        Self {
            current: cfg.current,
            reserved: cfg.reserved,
            ..Default::default()
        }
    }

    /// A full command for `mode` carrying these setpoints
    pub fn command(&self, mode: ModeDesired) -> Command {
        Command {
            current_desired: self.current,
            position_desired: self.position,
            velocity_desired: self.velocity,
            torque_desired: self.torque,
            reserved: self.reserved,
            ..Command::new(mode)
        }
    }
}

/// Single writer for a motor set for the duration of one session.
pub struct ModeSequencer<'a, D: MotorDriver + ?Sized> {
    driver: &'a mut D,
    clock: &'a dyn Clock,
    cfg: SequencerConfig,
    mode: ModeDesired,
    last_batch: Vec<Command>,
    released: bool,
}

impl<'a, D: MotorDriver + ?Sized> ModeSequencer<'a, D> {
    /// Take ownership of an already-bound motor set and put it in `Open`.
    pub fn new(driver: &'a mut D, clock: &'a dyn Clock, cfg: SequencerConfig) -> Result<Self> {
        let n = driver.motor_count();
        if n == 0 {
            return Err(crate::error::DriverError::NoMotors.into());
        }
        driver.set_auto_count();

        let mut seq = Self {
            driver,
            clock,
            cfg,
            mode: ModeDesired::Open,
            last_batch: vec![Command::neutral(); n],
            released: false,
        };
        seq.enter(ModeDesired::Open, Setpoints::default())?;
        Ok(seq)
    }

    /// Mode of the last acknowledged batch
    pub fn mode(&self) -> ModeDesired {
        self.mode
    }

    /// The last batch issued
    pub fn last_batch(&self) -> &[Command] {
        &self.last_batch
    }

    /// Telemetry access while the session holds the motors
    pub fn driver_mut(&mut self) -> &mut D {
        &mut *self.driver
    }

    pub fn clock(&self) -> &'a dyn Clock {
        self.clock
    }

    /// Command every motor into `mode` with `setpoints` and wait for acknowledgement.
    ///
    /// On any failure the motors are forced back to `Open` before the error is returned.
    pub fn enter(&mut self, mode: ModeDesired, setpoints: Setpoints) -> Result<Vec<Status>> {
        if mode != self.mode {
            info!("Entering {mode:?} from {:?}", self.mode);
        }
        let batch = vec![setpoints.command(mode); self.driver.motor_count()];
        self.released = false;
        match self.dispatch(batch, mode) {
            Ok(statuses) => {
                self.mode = mode;
                Ok(statuses)
            }
            Err(e) => {
                error!("Failed to enter {mode:?}: {e}");
                self.force_open();
                Err(e)
            }
        }
    }

    /// Re-issue the last batch unchanged.
    ///
    /// Drivers expire setpoints that are not refreshed, so long holds in
    /// `Velocity` or `CurrentTuning` must call this periodically.
    /// Only the write counter differs from the previous batch.
    pub fn refresh(&mut self) -> Result<Vec<Status>> {
        let mode = self.mode;
        debug!("Refreshing {mode:?} setpoints");
        let batch = self.last_batch.clone();
        match self.dispatch(batch, mode) {
            Ok(statuses) => Ok(statuses),
            Err(e) => {
                error!("Failed to refresh {mode:?}: {e}");
                self.force_open();
                Err(e)
            }
        }
    }

    /// Stay in the current mode for `duration`.
    ///
    /// `during` is handed each stretch of the hold in turn. With a refresh
    /// interval configured, stretches are at most that long and the setpoints
    /// are re-issued between them; otherwise the whole hold is one stretch.
    pub fn hold<F>(&mut self, duration: Duration, mut during: F) -> Result<()>
    where
        F: FnMut(&mut Self, Duration) -> Result<()>,
    {
        let Some(every) = self.cfg.refresh_interval() else {
            return during(self, duration);
        };

        let start = self.clock.now();
        let mut refreshes = 0_usize;
        loop {
            let remaining = duration.saturating_sub(self.clock.since(start));
            if remaining.is_zero() {
                debug!("Held {:?} for {duration:?} with {refreshes} refreshes", self.mode);
                return Ok(());
            }
            during(self, remaining.min(every))?;
            if self.clock.since(start) < duration {
                self.refresh()?;
                refreshes += 1;
            }
        }
    }

    /// End the session, returning the motors to `Open`.
    pub fn finish(mut self) -> Result<()> {
        self.release()
    }

    /// Write a neutral batch, which is `Open` with every setpoint zeroed,
    /// and wait for it to be acknowledged.
    fn release(&mut self) -> Result<()> {
        self.released = true;
        if self.mode != ModeDesired::Open {
            info!("Returning to Open from {:?}", self.mode);
        }
        let neutral = vec![Command::neutral(); self.driver.motor_count()];
        // Whatever happens next, Open is the last thing we tried to send
        self.mode = ModeDesired::Open;
        self.dispatch(neutral, ModeDesired::Open).map(|_| ())
    }

    /// Best-effort return to `Open` on an error path.
    fn force_open(&mut self) {
        if let Err(e) = self.release() {
            error!("Failed to confirm return to Open: {e}");
        }
    }

    /// Stage and write `batch`, then poll until every motor echoes its write counter.
    fn dispatch(&mut self, batch: Vec<Command>, mode: ModeDesired) -> Result<Vec<Status>> {
        self.driver.set_commands(&batch)?;
        self.last_batch = batch;
        self.driver.write_saved_commands()?;
        let count = self.driver.stage().count();

        let start = self.clock.now();
        self.clock.sleep(self.cfg.settle());
        loop {
            let statuses = self.driver.read()?;
            if statuses.len() != self.last_batch.len() {
                return Err(BenchError::ReadLength {
                    expected: self.last_batch.len(),
                    got: statuses.len(),
                });
            }
            if statuses.iter().all(|s| s.host_timestamp_received == count) {
                debug!("{mode:?} batch {count} acknowledged");
                return Ok(statuses);
            }

            let waited = self.clock.since(start);
            if waited >= self.cfg.ack_timeout() {
                warn!("No acknowledgement of batch {count} after {waited:?}");
                return Err(BenchError::AckTimeout { mode, waited });
            }
            self.clock.sleep(self.cfg.poll_interval());
        }
    }
}

impl<D: MotorDriver + ?Sized> Drop for ModeSequencer<'_, D> {
    fn drop(&mut self) {
        if !self.released {
            warn!("Session ended in {:?} without release; forcing Open", self.mode);
            self.force_open();
        }
    }
}

/// Run `f` with exclusive control of the motors, guaranteeing they end in `Open`.
///
/// The closure's error takes precedence over a failure to confirm the return to `Open`,
/// which is logged instead.
pub fn with_session<D, T, F>(
    driver: &mut D,
    clock: &dyn Clock,
    cfg: &SequencerConfig,
    f: F,
) -> Result<T>
where
    D: MotorDriver + ?Sized,
    F: FnOnce(&mut ModeSequencer<'_, D>) -> Result<T>,
{
    let mut seq = ModeSequencer::new(driver, clock, cfg.clone())?;
    match f(&mut seq) {
        Ok(out) => {
            seq.finish()?;
            Ok(out)
        }
        // Dropping the sequencer forces Open
        Err(e) => Err(e),
    }
}
