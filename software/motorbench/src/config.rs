//! Bench configuration.
//!
//! Every constant the bench depends on lives here with the reference
//! profile as its default. Profiles for other hardware or timing are JSON
//! files that only need to name the fields they change.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BenchError, Result};

/// Parameters of the envelope-threshold bandwidth estimate.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Moving-average window `W` [samples]
    pub window: usize,

    /// Envelope samples `S` excluded as the initial transient [samples]
    pub skip: usize,

    /// Envelope level `T` that marks the bandwidth, in the units of `iq` [A]
    pub threshold: f64,

    /// Nominal length of the collection window [s]
    pub duration_s: f64,

    /// Nominal per-second multiplier [1/s].
    ///
    /// The product with `duration_s` maps the crossing's fractional position
    /// in the envelope to Hz. This assumes the sampling loop achieved the
    /// nominal rate; any deviation biases the estimate proportionally.
    pub rate_multiplier: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            window: 1000,
            skip: 1000,
            threshold: 0.15,
            duration_s: 10.0,
            rate_multiplier: 200.0,
        }
    }
}

impl EstimatorConfig {
    /// Index-to-frequency multiplier [Hz], 2000 for the reference profile
    pub fn multiplier(&self) -> f64 {
        self.rate_multiplier * self.duration_s
    }

    /// Collection window length
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_s)
    }

    /// Shortest trace that leaves at least one envelope sample after the skip
    pub fn min_samples(&self) -> usize {
        self.window + self.skip
    }

    pub fn validate(&self) -> Result<()> {
        if self.window == 0 {
            return Err(BenchError::Config("estimator window must be > 0".into()));
        }
        if !(self.threshold.is_finite() && self.threshold > 0.0) {
            return Err(BenchError::Config(format!(
                "estimator threshold must be positive and finite, got {}",
                self.threshold
            )));
        }
        if !(self.duration_s.is_finite() && self.duration_s > 0.0) {
            return Err(BenchError::Config(format!(
                "estimator duration_s must be positive and finite, got {}",
                self.duration_s
            )));
        }
        if !(self.rate_multiplier.is_finite() && self.rate_multiplier > 0.0) {
            return Err(BenchError::Config(format!(
                "estimator rate_multiplier must be positive and finite, got {}",
                self.rate_multiplier
            )));
        }
        Ok(())
    }
}

/// Telemetry collection settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SamplingConfig {
    /// Index of the motor whose `iq` is recorded
    pub channel: usize,

    /// How long telemetry may go without a fresh sample before the link is declared stalled
    pub read_timeout_ms: u64,

    /// Number of recent read periods summarized by the rolling statistics [samples]
    pub stats_window: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            read_timeout_ms: 100,
            stats_window: 100,
        }
    }
}

impl SamplingConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Command dispatch and acknowledgement timing.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SequencerConfig {
    /// Allotted time for every motor to echo a command's write counter
    pub ack_timeout_ms: u64,

    /// Gap between acknowledgement polls
    pub poll_interval_us: u64,

    /// Pause after a write before the first acknowledgement poll
    pub settle_ms: u64,

    /// Re-issue the active setpoints this often while a mode is held.
    /// `None` holds without re-issuing, relying on the driver's own timeout.
    pub refresh_interval_ms: Option<u64>,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 50,
            poll_interval_us: 100,
            settle_ms: 1,
            refresh_interval_ms: None,
        }
    }
}

impl SequencerConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_ms.map(Duration::from_millis)
    }
}

/// Setpoints for the `CurrentTuning` excitation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CurrentTuningConfig {
    /// Excitation amplitude [A]; the sign selects the initial direction
    pub current: f32,

    /// Sweep rate passed through the command's reserved field [Hz/s]
    pub reserved: f32,
}

impl Default for CurrentTuningConfig {
    fn default() -> Self {
        Self {
            current: -0.3,
            reserved: 200.0,
        }
    }
}

/// Velocity tracking check.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct VelocityConfig {
    /// Velocity setpoint [rad/s]
    pub velocity: f32,

    /// How long to hold the setpoint [s]
    pub duration_s: f64,

    /// Accepted error of the measured displacement [rad]
    pub tolerance: f64,
}

impl Default for VelocityConfig {
    fn default() -> Self {
        Self {
            velocity: 1.0,
            duration_s: 10.0,
            tolerance: 0.1,
        }
    }
}

impl VelocityConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_s)
    }
}

/// Accepted band for a benchmark value.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(default)]
pub struct Expectation {
    pub expected: f64,
    pub tolerance: f64,
}

impl Default for Expectation {
    fn default() -> Self {
        Self {
            expected: 800.0,
            tolerance: 300.0,
        }
    }
}

impl Expectation {
    pub fn contains(&self, value: f64) -> bool {
        (value - self.expected).abs() < self.tolerance
    }
}

/// Everything a bench run needs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BenchConfig {
    /// A name for this run, used for the log file name
    pub op_name: String,

    /// Directory for logs and results
    pub op_dir: PathBuf,

    /// Device paths of the motors to bind, in batch order.
    /// Empty binds every motor the driver reports.
    pub motor_paths: Vec<String>,

    /// File that benchmark lines are appended to, if any
    pub results_file: Option<PathBuf>,

    /// Write the collected current trace to `<op_dir>/<op_name>_iq.csv`
    pub save_trace: bool,

    pub sequencer: SequencerConfig,
    pub sampling: SamplingConfig,
    pub estimator: EstimatorConfig,
    pub current_tuning: CurrentTuningConfig,
    pub velocity: VelocityConfig,

    /// Accepted bandwidth [Hz]
    pub bandwidth: Expectation,
}

impl Default for BenchConfig {
    fn default() -> Self {
        // Use current time with seconds as op name and use working directory as op dir,
        // replacing characters in the name that would be invalid on Windows.
        let op_name = DateTime::<Utc>::from(SystemTime::now())
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
            .replace(":", "");
        Self {
            op_name,
            op_dir: std::fs::canonicalize("./").unwrap_or_default(),
            motor_paths: Vec::new(),
            results_file: None,
            save_trace: false,
            sequencer: SequencerConfig::default(),
            sampling: SamplingConfig::default(),
            estimator: EstimatorConfig::default(),
            current_tuning: CurrentTuningConfig::default(),
            velocity: VelocityConfig::default(),
            bandwidth: Expectation::default(),
        }
    }
}

impl BenchConfig {
    /// Load a profile, filling unspecified fields with defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Where the collected current trace goes when `save_trace` is set
    pub fn trace_path(&self) -> PathBuf {
        self.op_dir.join(format!("{}_iq.csv", self.op_name))
    }

    pub fn validate(&self) -> Result<()> {
        self.estimator.validate()?;
        if self.sequencer.ack_timeout_ms == 0 {
            return Err(BenchError::Config("ack_timeout_ms must be > 0".into()));
        }
        if self.sequencer.poll_interval_us == 0 {
            return Err(BenchError::Config("poll_interval_us must be > 0".into()));
        }
        if self.sequencer.refresh_interval_ms == Some(0) {
            return Err(BenchError::Config("refresh_interval_ms must be > 0 when set".into()));
        }
        if self.sampling.stats_window == 0 {
            return Err(BenchError::Config("stats_window must be > 0".into()));
        }
        if !(self.bandwidth.tolerance.is_finite() && self.bandwidth.tolerance >= 0.0) {
            return Err(BenchError::Config(format!(
                "bandwidth tolerance must be non-negative, got {}",
                self.bandwidth.tolerance
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reference_profile() {
        let cfg = EstimatorConfig::default();
        assert_eq!(cfg.multiplier(), 2000.0);
        assert_eq!(cfg.min_samples(), 2000);
        assert_eq!(cfg.duration(), Duration::from_secs(10));
        assert!(BenchConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_profile_keeps_defaults() {
        let cfg: BenchConfig =
            serde_json::from_str(r#"{"estimator": {"threshold": 0.1}, "motor_paths": ["1-1.2"]}"#)
                .unwrap();
        assert_eq!(cfg.estimator.threshold, 0.1);
        assert_eq!(cfg.estimator.window, 1000);
        assert_eq!(cfg.motor_paths, vec!["1-1.2".to_owned()]);
        assert_eq!(cfg.current_tuning, CurrentTuningConfig::default());
    }

    #[test]
    fn ser_roundtrip() {
        let cfg = BenchConfig::default();
        let serialized = serde_json::to_string(&cfg).unwrap();
        let deserialized: BenchConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(cfg, deserialized);
    }

    #[test]
    fn rejects_bad_values() {
        let mut cfg = BenchConfig::default();
        cfg.estimator.window = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = BenchConfig::default();
        cfg.estimator.threshold = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = BenchConfig::default();
        cfg.sequencer.ack_timeout_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = BenchConfig::default();
        cfg.sequencer.refresh_interval_ms = Some(0);
        assert!(cfg.validate().is_err());

        let mut cfg = BenchConfig::default();
        cfg.sampling.stats_window = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn refresh_is_off_unless_configured() {
        assert_eq!(SequencerConfig::default().refresh_interval(), None);

        let cfg: BenchConfig =
            serde_json::from_str(r#"{"sequencer": {"refresh_interval_ms": 200}}"#).unwrap();
        assert_eq!(
            cfg.sequencer.refresh_interval(),
            Some(Duration::from_millis(200))
        );
        assert_eq!(cfg.sequencer.ack_timeout_ms, 50);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        std::fs::write(&path, r#"{"bandwidth": {"expected": 1200.0}}"#).unwrap();
        let cfg = BenchConfig::from_json_file(&path).unwrap();
        assert_eq!(cfg.bandwidth.expected, 1200.0);
        assert_eq!(cfg.bandwidth.tolerance, 300.0);

        std::fs::write(&path, r#"{"estimator": {"window": 0}}"#).unwrap();
        assert!(BenchConfig::from_json_file(&path).is_err());
    }

    #[test]
    fn expectation_band() {
        let e = Expectation::default();
        assert!(e.contains(800.0));
        assert!(e.contains(1099.0));
        assert!(!e.contains(1100.0));
        assert!(!e.contains(400.0));
    }
}
