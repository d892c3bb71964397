//! Current-loop bandwidth from the response to a linear chirp.
//!
//! While the excitation sweeps upward in frequency at a constant rate, the
//! current loop's response shrinks once the sweep passes the loop bandwidth.
//! The RMS envelope of the response is tracked over a sliding window, and the
//! first point after the initial transient where it falls below a threshold
//! marks the bandwidth. Because the sweep is linear, the crossing's position
//! as a fraction of the envelope maps directly onto frequency.
//!
//! ```text
//!   |iq|
//!    |~~~~~~~~~~~~~~~~~~~~~~~~~~~\
//!    |                            \___
//!  T |- - - - - - - - - - - - - - - - -x- - - - - -
//!    |                                  \_________
//!    +--------+-------------------------+--------> envelope index
//!    0        S                       S + i      n
//! ```

use tracing::{debug, info};

use crate::config::EstimatorConfig;
use crate::error::{BenchError, Result};

/// RMS of `trace` over every full window of `window` samples.
///
/// Entry `k` covers `trace[k..k + window]`, so the result has
/// `trace.len() - window + 1` entries, or none if the trace is shorter than one window.
pub fn rms_envelope(trace: &[f64], window: usize) -> Vec<f64> {
    if window == 0 || trace.len() < window {
        return Vec::new();
    }

    // Prefix sums of energy; window sums are differences of two entries
    let mut prefix = Vec::with_capacity(trace.len() + 1);
    let mut acc = 0.0_f64;
    prefix.push(acc);
    for x in trace {
        acc += x * x;
        prefix.push(acc);
    }

    let w = window as f64;
    prefix
        .iter()
        .zip(&prefix[window..])
        .map(|(lo, hi)| ((hi - lo) / w).max(0.0).sqrt())
        .collect()
}

/// Bandwidth of `trace` with the given settings.
pub fn bandwidth_estimate(trace: &[f64], cfg: &EstimatorConfig) -> Result<BandwidthEstimate> {
    BandwidthEstimator::new(cfg.clone()).estimate(trace)
}

/// Result of a bandwidth estimate, with what it was derived from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandwidthEstimate {
    /// Estimated current-loop bandwidth [Hz]
    pub bandwidth_hz: f64,

    /// Envelope index where the threshold was first crossed
    pub crossing_index: usize,

    /// Number of envelope samples
    pub envelope_len: usize,

    /// Index-to-frequency multiplier used [Hz]
    pub multiplier: f64,
}

/// Envelope-threshold bandwidth estimator.
#[derive(Debug, Clone, Default)]
pub struct BandwidthEstimator {
    cfg: EstimatorConfig,
}

impl BandwidthEstimator {
    pub fn new(cfg: EstimatorConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.cfg
    }

    /// Estimate bandwidth from the raw response trace.
    pub fn estimate(&self, trace: &[f64]) -> Result<BandwidthEstimate> {
        let required = self.cfg.min_samples();
        if trace.len() < required {
            return Err(BenchError::InsufficientSamples {
                got: trace.len(),
                required,
            });
        }
        if let Some(i) = trace.iter().position(|x| !x.is_finite()) {
            return Err(BenchError::NonFiniteSample(i));
        }

        let envelope = rms_envelope(trace, self.cfg.window);
        debug!(
            "Envelope of {} samples from a {}-sample trace",
            envelope.len(),
            trace.len()
        );
        self.estimate_from_envelope(&envelope)
    }

    /// Estimate bandwidth from an already computed envelope.
    pub fn estimate_from_envelope(&self, envelope: &[f64]) -> Result<BandwidthEstimate> {
        let skip = self.cfg.skip;
        let threshold = self.cfg.threshold;
        let n = envelope.len();
        if n <= skip {
            return Err(BenchError::InsufficientSamples {
                got: n,
                required: skip + 1,
            });
        }

        let searched = &envelope[skip..];
        let Some(i) = searched.iter().position(|&b| b < threshold) else {
            return Err(BenchError::NoThresholdCrossing {
                threshold,
                searched: searched.len(),
            });
        };

        let crossing_index = skip + i;
        let multiplier = self.cfg.multiplier();
        let bandwidth_hz = crossing_index as f64 / n as f64 * multiplier;
        info!("Envelope crossed {threshold} at {crossing_index} of {n}: {bandwidth_hz:.1} Hz");

        Ok(BandwidthEstimate {
            bandwidth_hz,
            crossing_index,
            envelope_len: n,
            multiplier,
        })
    }
}
