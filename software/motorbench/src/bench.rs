//! Bench procedures run against a bound motor set.
//!
//! Each procedure is one guarded session: motors start in `Open`, are driven
//! through the procedure's modes, and are back in `Open` when it returns,
//! whether it passed, failed, or hit a transport error.
//!
//! ```text
//! bind ─► basics ─► velocity_tracking ─► current_bandwidth
//!           │              │                     │
//!     first ack = 1   displacement ≈ v·t    envelope crossing ─► Hz ─► verdict
//! ```

use std::sync::Arc;

use motorbench_shared::{ModeDesired, Status};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::{BenchConfig, Expectation};
use crate::driver::MotorDriver;
use crate::error::{BenchError, Result};
use crate::estimator::{BandwidthEstimator, rms_envelope};
use crate::report::{BenchReport, ResultsFile, write_trace_csv};
use crate::sampling::{SamplingLoop, SignalTrace};
use crate::sequencer::{Setpoints, with_session};

/// A driver, a time source, and the settings for running procedures on them.
pub struct Bench<D: MotorDriver> {
    driver: D,
    clock: Arc<dyn Clock>,
    cfg: BenchConfig,
}

impl<D: MotorDriver> Bench<D> {
    pub fn new(driver: D, clock: Arc<dyn Clock>, cfg: BenchConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self { driver, clock, cfg })
    }

    pub fn config(&self) -> &BenchConfig {
        &self.cfg
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    /// Bind the configured motor paths, or every reachable motor if none are configured.
    pub fn bind(&mut self) -> Result<usize> {
        let n = self.driver.get_motors_by_path(&self.cfg.motor_paths)?;
        info!("Bound {n} motors");
        Ok(n)
    }

    /// Command `Open` and check that every motor acknowledged the write.
    ///
    /// On a freshly bound driver this is the first write, echoed back as 1.
    pub fn basics(&mut self) -> Result<Vec<Status>> {
        with_session(
            &mut self.driver,
            self.clock.as_ref(),
            &self.cfg.sequencer,
            |seq| {
                let count = seq.driver_mut().stage().count();
                let statuses = seq.driver_mut().read()?;
                if statuses.len() != seq.last_batch().len() {
                    return Err(BenchError::ReadLength {
                        expected: seq.last_batch().len(),
                        got: statuses.len(),
                    });
                }
                info!("Open acknowledged as write {count}");
                Ok(statuses)
            },
        )
    }

    /// Hold a velocity setpoint and compare the displacement with velocity × duration.
    pub fn velocity_tracking(&mut self) -> Result<BenchReport> {
        let vcfg = self.cfg.velocity.clone();
        let channel = self.cfg.sampling.channel;
        let motors = self.driver.motor_count();
        if channel >= motors {
            return Err(BenchError::ChannelOutOfRange { channel, motors });
        }

        let displacement = with_session(
            &mut self.driver,
            self.clock.as_ref(),
            &self.cfg.sequencer,
            |seq| {
                let start = seq.driver_mut().read()?;
                let Some(p0) = start.get(channel).map(|s| s.motor_position) else {
                    return Err(BenchError::ReadLength {
                        expected: motors,
                        got: start.len(),
                    });
                };

                seq.enter(ModeDesired::Velocity, Setpoints::velocity(vcfg.velocity))?;
                seq.hold(vcfg.duration(), |seq, stretch| {
                    seq.clock().sleep(stretch);
                    Ok(())
                })?;

                // Re-issuing the setpoint also reads back the final position
                let end = seq.refresh()?;
                let p1 = end[channel].motor_position;
                Ok(f64::from(p1 - p0))
            },
        )?;

        let expectation = Expectation {
            expected: f64::from(vcfg.velocity) * vcfg.duration_s,
            tolerance: vcfg.tolerance,
        };
        let report = BenchReport::new("velocity_displacement", displacement, expectation, "rad");
        info!("{report}");
        report.into_result()
    }

    /// Excite the current loop with a chirp and estimate its bandwidth.
    ///
    /// The benchmark line is written to the results file whether or not the
    /// value is inside the expected band. Transport and estimation failures
    /// write nothing.
    pub fn current_bandwidth(&mut self) -> Result<BenchReport> {
        let tuning = Setpoints::current_tuning(&self.cfg.current_tuning);
        let duration = self.cfg.estimator.duration();
        let sampling = self.cfg.sampling.clone();

        let trace = with_session(
            &mut self.driver,
            self.clock.as_ref(),
            &self.cfg.sequencer,
            |seq| {
                seq.enter(ModeDesired::CurrentTuning, tuning)?;
                let sampler = SamplingLoop::new(sampling, seq.clock());
                let mut trace = SignalTrace::new();
                seq.hold(duration, |seq, stretch| {
                    trace.append(sampler.collect(seq.driver_mut(), stretch)?);
                    Ok(())
                })?;
                Ok(trace)
            },
        )?;

        if let Some(rate) = trace.achieved_rate_hz() {
            // Not used to correct the estimate
            info!(
                "Achieved sample rate {rate:.1} Hz, longest gap {:?}",
                trace.max_gap()
            );
        }

        let estimator = BandwidthEstimator::new(self.cfg.estimator.clone());
        if self.cfg.save_trace {
            let envelope = rms_envelope(trace.samples(), self.cfg.estimator.window);
            if let Err(e) = write_trace_csv(&self.cfg.trace_path(), trace.samples(), &envelope) {
                warn!("Failed to save current trace: {e}");
            }
        }
        let estimate = estimator.estimate(trace.samples())?;

        let report = BenchReport::bandwidth(estimate, self.cfg.bandwidth);
        info!("{report}");
        if let Some(path) = &self.cfg.results_file {
            ResultsFile::new(path).append(&report)?;
        }
        report.into_result()
    }

    /// Bind, then run every procedure in order, stopping at the first failure.
    pub fn run(&mut self) -> Result<Vec<BenchReport>> {
        self.bind()?;
        self.basics()?;
        let velocity = self.velocity_tracking()?;
        let bandwidth = self.current_bandwidth()?;
        Ok(vec![velocity, bandwidth])
    }
}
