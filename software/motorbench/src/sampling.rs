//! Telemetry collection over a bounded window.
//!
//! Reads arrive at whatever rate the link delivers them. The loop keeps
//! every fresh sample of one motor's `iq` in arrival order and stops once the
//! window has elapsed, so downstream processing works in sample-index units
//! rather than time.
//!
//! Alongside the samples, the trace keeps rolling statistics of the time
//! between fresh reads, which is the first thing to look at when a link
//! delivers less than its nominal rate.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use motorbench_shared::Status;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::SamplingConfig;
use crate::driver::MotorDriver;
use crate::error::{BenchError, Result};

/// Largest gap between fresh samples, as a multiple of the mean period,
/// before the trace is reported as unevenly sampled
const GAP_WARN_RATIO: f64 = 10.0;

/// Mean, spread and range of the most recent values pushed.
///
/// Running sums keep each push constant-time; min and max scan the window.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingStats {
    size: usize,
    values: VecDeque<f64>,
    sum: f64,
    sum_sq: f64,
}

impl Default for RollingStats {
    fn default() -> Self {
        Self::new(SamplingConfig::default().stats_window)
    }
}

impl RollingStats {
    /// Statistics over the last `size` values; a size of zero is treated as one
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            values: VecDeque::with_capacity(size),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.size {
            if let Some(old) = self.values.pop_front() {
                self.sum -= old;
                self.sum_sq -= old * old;
            }
        }
        self.values.push_back(value);
        self.sum += value;
        self.sum_sq += value * value;
    }

    /// Capacity of the window
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values currently in the window, oldest first
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    pub fn mean(&self) -> Option<f64> {
        (!self.is_empty()).then(|| self.sum / self.values.len() as f64)
    }

    /// Sample standard deviation, zero for a single value
    pub fn stddev(&self) -> Option<f64> {
        let n = self.values.len() as f64;
        match self.values.len() {
            0 => None,
            1 => Some(0.0),
            _ => {
                let var = (self.sum_sq - self.sum * self.sum / n) / (n - 1.0);
                Some(var.max(0.0).sqrt())
            }
        }
    }

    pub fn min(&self) -> Option<f64> {
        self.values().reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.values().reduce(f64::max)
    }
}

impl fmt::Display for RollingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.mean(), self.stddev(), self.min(), self.max()) {
            (Some(mean), Some(sd), Some(min), Some(max)) => write!(
                f,
                "mean {mean:.1} sd {sd:.1} min {min:.1} max {max:.1} over {}",
                self.len()
            ),
            _ => write!(f, "no values"),
        }
    }
}

/// Time-ordered samples of one telemetry channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalTrace {
    samples: Vec<f64>,
    started: Duration,
    elapsed: Duration,
    max_gap: Duration,
    first_at: Option<Duration>,
    last_at: Option<Duration>,
    read_period_us: RollingStats,
}

impl SignalTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty trace whose read-period statistics cover the last `stats_window` reads
    pub fn with_stats_window(stats_window: usize) -> Self {
        Self {
            read_period_us: RollingStats::new(stats_window),
            ..Default::default()
        }
    }

    /// A trace with no timing information, for offline analysis
    pub fn from_samples(samples: Vec<f64>) -> Self {
        Self {
            samples,
            ..Default::default()
        }
    }

    pub fn push(&mut self, value: f64) {
        self.samples.push(value);
    }

    /// Record a fresh sample read at clock time `at`.
    fn push_at(&mut self, value: f64, at: Duration) {
        match self.last_at {
            Some(last) => self.note_gap(at.saturating_sub(last)),
            None => self.first_at = Some(at),
        }
        self.last_at = Some(at);
        self.samples.push(value);
    }

    fn note_gap(&mut self, gap: Duration) {
        self.max_gap = self.max_gap.max(gap);
        self.read_period_us.push(gap.as_nanos() as f64 / 1e3);
    }

    /// Extend with a trace collected later from the same channel.
    ///
    /// The time between this trace's last sample and the next one's first
    /// counts as a read period, so gaps spent between collections show up
    /// in `max_gap` and the read statistics. Appending to an empty trace
    /// takes `other` as it is.
    pub fn append(&mut self, other: SignalTrace) {
        if self.samples.is_empty() && self.last_at.is_none() {
            *self = other;
            return;
        }

        if let (Some(last), Some(first)) = (self.last_at, other.first_at) {
            self.note_gap(first.saturating_sub(last));
        }
        other.read_period_us.values().for_each(|v| self.read_period_us.push(v));
        self.max_gap = self.max_gap.max(other.max_gap);
        self.elapsed = (other.started + other.elapsed).saturating_sub(self.started);
        self.first_at = self.first_at.or(other.first_at);
        self.last_at = other.last_at.or(self.last_at);
        self.samples.extend(other.samples);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Wall-clock length of the collection window
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Longest time between consecutive fresh samples
    pub fn max_gap(&self) -> Duration {
        self.max_gap
    }

    /// Samples per second actually achieved, if any time elapsed
    pub fn achieved_rate_hz(&self) -> Option<f64> {
        let dt = self.elapsed.as_secs_f64();
        (dt > 0.0).then(|| self.samples.len() as f64 / dt)
    }

    /// Time between the most recent fresh reads [us]
    pub fn read_period_us(&self) -> &RollingStats {
        &self.read_period_us
    }
}

/// Pulls telemetry from a driver for a fixed wall-clock duration.
pub struct SamplingLoop<'a> {
    cfg: SamplingConfig,
    clock: &'a dyn Clock,
}

impl<'a> SamplingLoop<'a> {
    pub fn new(cfg: SamplingConfig, clock: &'a dyn Clock) -> Self {
        Self { cfg, clock }
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.cfg
    }

    /// Read until `duration` has elapsed, keeping the configured channel's `iq`.
    ///
    /// Reads that repeat the previous frame are dropped. If no fresh frame
    /// arrives within the read timeout, the link is considered stalled.
    pub fn collect<D: MotorDriver + ?Sized>(
        &self,
        driver: &mut D,
        duration: Duration,
    ) -> Result<SignalTrace> {
        let motors = driver.motor_count();
        let channel = self.cfg.channel;
        if channel >= motors {
            return Err(BenchError::ChannelOutOfRange { channel, motors });
        }

        let read_timeout = self.cfg.read_timeout();
        let stats_window = self.cfg.stats_window.max(1);
        let mut trace = SignalTrace::with_stats_window(stats_window);
        let mut prev: Option<Status> = None;
        let mut stale = 0_usize;

        let start = self.clock.now();
        trace.started = start;
        let mut last_fresh = start;
        debug!("Collecting channel {channel} for {duration:?}");
        while self.clock.since(start) < duration {
            let statuses = driver.read()?;
            if statuses.len() != motors {
                return Err(BenchError::ReadLength {
                    expected: motors,
                    got: statuses.len(),
                });
            }

            let status = statuses[channel];
            let now = self.clock.now();
            if status.is_fresh_since(prev.as_ref()) {
                trace.push_at(f64::from(status.iq), now);
                prev = Some(status);
                last_fresh = now;
                if trace.len() % stats_window == 0 {
                    debug!("Read period [us]: {}", trace.read_period_us);
                }
            } else {
                stale += 1;
                let waited = now.saturating_sub(last_fresh);
                if waited >= read_timeout {
                    warn!("No fresh telemetry for {waited:?} after {} samples", trace.len());
                    return Err(BenchError::StaleTelemetry { waited });
                }
            }
        }
        trace.elapsed = self.clock.since(start);

        let rate = trace.achieved_rate_hz().unwrap_or(0.0);
        info!(
            "Collected {} samples in {:?} ({rate:.1} Hz, {stale} stale reads)",
            trace.len(),
            trace.elapsed
        );
        if !trace.read_period_us.is_empty() {
            info!("Read period [us]: {}", trace.read_period_us);
        }
        if rate > 0.0 && trace.max_gap.as_secs_f64() * rate > GAP_WARN_RATIO {
            warn!(
                "Uneven sampling: longest gap {:?} against a mean period of {:.1} us",
                trace.max_gap,
                1e6 / rate
            );
        }
        Ok(trace)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use motorbench_shared::{Command, ModeDesired};

    use super::*;
    use crate::clock::ManualClock;
    use crate::driver::{CommandStage, SimulatedDriver};
    use crate::error::{DriverError, ErrorKind};

    fn rig(n: usize) -> (SimulatedDriver, ManualClock) {
        let clock = ManualClock::new();
        let mut d = SimulatedDriver::new(n, Arc::new(clock.clone()));
        d.get_motors_by_path(&[]).unwrap();
        d.set_auto_count();
        d.write_saved_commands().unwrap();
        (d, clock)
    }

    #[test]
    fn collects_for_the_whole_window() {
        let (mut d, clock) = rig(2);
        let sampler = SamplingLoop::new(SamplingConfig::default(), &clock);
        let trace = sampler.collect(&mut d, Duration::from_millis(100)).unwrap();

        // One frame per 100 us status period
        assert_eq!(trace.len(), 1000);
        assert!(trace.elapsed() >= Duration::from_millis(100));
        let rate = trace.achieved_rate_hz().unwrap();
        assert!((rate - 10_000.0).abs() < 1.0);
        assert_eq!(trace.max_gap(), Duration::from_micros(100));

        let period = trace.read_period_us();
        assert_eq!(period.len(), 100);
        assert_eq!(period.mean(), Some(100.0));
        assert!(period.stddev().unwrap() < 1e-9);
        assert_eq!((period.min(), period.max()), (Some(100.0), Some(100.0)));
    }

    #[test]
    fn rolling_stats_cover_the_last_window() {
        let mut stats = RollingStats::new(3);
        assert_eq!(stats.mean(), None);
        assert_eq!(stats.stddev(), None);
        assert_eq!(stats.to_string(), "no values");

        stats.push(7.0);
        assert_eq!(stats.stddev(), Some(0.0));

        for x in [1.0, 2.0, 3.0, 4.0] {
            stats.push(x);
        }
        assert_eq!(stats.len(), 3);
        assert_eq!(stats.values().collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
        assert!((stats.mean().unwrap() - 3.0).abs() < 1e-12);
        assert!((stats.stddev().unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(stats.min(), Some(2.0));
        assert_eq!(stats.max(), Some(4.0));
        assert_eq!(stats.to_string(), "mean 3.0 sd 1.0 min 2.0 max 4.0 over 3");

        assert_eq!(RollingStats::new(0).size(), 1);
    }

    #[test]
    fn appended_collections_keep_the_gap_between_them() {
        let (mut d, clock) = rig(1);
        let cfg = SamplingConfig {
            stats_window: 1000,
            ..Default::default()
        };
        let sampler = SamplingLoop::new(cfg, &clock);
        let mut trace = SignalTrace::new();
        trace.append(sampler.collect(&mut d, Duration::from_millis(50)).unwrap());
        assert_eq!(trace.len(), 500);

        // Time spent elsewhere, e.g. re-issuing setpoints
        clock.sleep(Duration::from_millis(5));
        trace.append(sampler.collect(&mut d, Duration::from_millis(50)).unwrap());

        assert_eq!(trace.len(), 1000);
        assert_eq!(trace.elapsed(), Duration::from_millis(105));
        assert_eq!(trace.max_gap(), Duration::from_micros(5100));
        assert_eq!(trace.read_period_us().max(), Some(5100.0));
        assert_eq!(trace.read_period_us().min(), Some(100.0));
        assert_eq!(trace.read_period_us().len(), 999);
    }

    #[test]
    fn records_the_chosen_channel() {
        let (mut d, clock) = rig(2);
        d.set_command_mode(ModeDesired::Current);
        d.set_command_current(&[0.0, 0.5]).unwrap();
        d.write_saved_commands().unwrap();

        let cfg = SamplingConfig {
            channel: 1,
            ..Default::default()
        };
        let trace = SamplingLoop::new(cfg, &clock)
            .collect(&mut d, Duration::from_millis(20))
            .unwrap();
        let last = *trace.samples().last().unwrap();
        assert!((last - 0.5).abs() < 1e-3);
    }

    #[test]
    fn chirp_stays_within_amplitude() {
        let (mut d, clock) = rig(1);
        d.set_command_mode(ModeDesired::CurrentTuning);
        d.set_command_current(&[-0.3]).unwrap();
        d.set_command_reserved(&[200.0]).unwrap();
        d.write_saved_commands().unwrap();

        let trace = SamplingLoop::new(SamplingConfig::default(), &clock)
            .collect(&mut d, Duration::from_millis(200))
            .unwrap();
        assert!(trace.samples().iter().all(|x| x.abs() <= 0.3 + 1e-6));
        assert!(trace.samples().iter().any(|x| x.abs() > 0.1));
    }

    #[test]
    fn channel_out_of_range() {
        let (mut d, clock) = rig(2);
        let cfg = SamplingConfig {
            channel: 2,
            ..Default::default()
        };
        let err = SamplingLoop::new(cfg, &clock)
            .collect(&mut d, Duration::from_millis(1))
            .unwrap_err();
        assert!(matches!(
            err,
            BenchError::ChannelOutOfRange {
                channel: 2,
                motors: 2
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn stalled_telemetry_times_out() {
        let (mut d, clock) = rig(1);
        d.stall_after(5);
        let err = SamplingLoop::new(SamplingConfig::default(), &clock)
            .collect(&mut d, Duration::from_secs(1))
            .unwrap_err();
        match err {
            BenchError::StaleTelemetry { waited } => {
                assert!(waited >= Duration::from_millis(100));
                assert!(waited < Duration::from_millis(101));
            }
            other => panic!("unexpected error {other}"),
        }
        // Gave up well before the window ended
        assert!(clock.now() < Duration::from_millis(200));
    }

    #[test]
    fn failed_read_propagates() {
        let (mut d, clock) = rig(1);
        d.fail_reads_after(3);
        let err = SamplingLoop::new(SamplingConfig::default(), &clock)
            .collect(&mut d, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, BenchError::Driver(DriverError::Disconnected(_))));
    }

    /// A driver whose cycle counter is close to wrapping, read every 100 us
    struct Wrapping {
        stage: CommandStage,
        clock: ManualClock,
        mcu_timestamp: u32,
    }

    impl Wrapping {
        fn new(clock: &ManualClock) -> Self {
            Self {
                stage: CommandStage::new(1),
                clock: clock.clone(),
                mcu_timestamp: u32::MAX - 50,
            }
        }
    }

    impl MotorDriver for Wrapping {
        fn stage(&self) -> &CommandStage {
            &self.stage
        }

        fn stage_mut(&mut self) -> &mut CommandStage {
            &mut self.stage
        }

        fn get_motors_by_path(&mut self, _paths: &[String]) -> core::result::Result<usize, DriverError> {
            Ok(self.motor_count())
        }

        fn transmit(&mut self, _batch: &[Command]) -> core::result::Result<(), DriverError> {
            Ok(())
        }

        fn read(&mut self) -> core::result::Result<Vec<Status>, DriverError> {
            self.clock.sleep(Duration::from_micros(100));
            self.mcu_timestamp = self.mcu_timestamp.wrapping_add(1);
            let status = Status {
                mcu_timestamp: self.mcu_timestamp,
                iq: 0.2,
                ..Default::default()
            };
            Ok(vec![status; self.motor_count()])
        }
    }

    #[test]
    fn collects_across_a_counter_wrap() {
        let clock = ManualClock::new();
        let mut d = Wrapping::new(&clock);
        let sampler = SamplingLoop::new(SamplingConfig::default(), &clock);

        // The single frame that lands on zero is dropped
        let trace = sampler.collect(&mut d, Duration::from_millis(100)).unwrap();
        assert_eq!(trace.len(), 999);
        assert_eq!(trace.max_gap(), Duration::from_micros(200));
        assert!(trace.samples().iter().all(|x| (x - 0.2).abs() < 1e-6));

        let mut d = Wrapping::new(&clock);
        let trace = sampler.collect(&mut d, Duration::from_secs(1)).unwrap();
        assert_eq!(trace.len(), 9999);
    }

    /// A driver that drops a motor from every read
    struct ShortReads {
        stage: CommandStage,
    }

    impl MotorDriver for ShortReads {
        fn stage(&self) -> &CommandStage {
            &self.stage
        }

        fn stage_mut(&mut self) -> &mut CommandStage {
            &mut self.stage
        }

        fn get_motors_by_path(&mut self, _paths: &[String]) -> core::result::Result<usize, DriverError> {
            Ok(self.motor_count())
        }

        fn transmit(&mut self, _batch: &[Command]) -> core::result::Result<(), DriverError> {
            Ok(())
        }

        fn read(&mut self) -> core::result::Result<Vec<Status>, DriverError> {
            Ok(vec![Status::default(); self.motor_count() - 1])
        }
    }

    #[test]
    fn short_read_is_a_transport_error() {
        let clock = ManualClock::new();
        let mut d = ShortReads {
            stage: CommandStage::new(3),
        };
        let err = SamplingLoop::new(SamplingConfig::default(), &clock)
            .collect(&mut d, Duration::from_millis(1))
            .unwrap_err();
        assert!(matches!(err, BenchError::ReadLength { expected: 3, got: 2 }));
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
