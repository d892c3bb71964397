//! Error types for driver transport and bench sessions.
//!
//! [`DriverError`] is what a [`MotorDriver`](crate::driver::MotorDriver)
//! implementation raises when the link misbehaves. [`BenchError`] is what a
//! session surfaces to its caller; [`BenchError::kind`] sorts it into the
//! categories that decide how a failure is reported.

use std::time::Duration;

use motorbench_shared::ModeDesired;
use thiserror::Error;

/// Convenience alias for results using the session error type.
pub type Result<T> = core::result::Result<T, BenchError>;

/// Failures of the command/telemetry link itself.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("Driver did not respond within {0:?}")]
    Timeout(Duration),

    #[error("Driver disconnected: {0}")]
    Disconnected(String),

    #[error("Found no motors matching: {0}")]
    MotorNotFound(String),

    #[error("Found too many motors matching: {0}")]
    AmbiguousMotor(String),

    #[error("Command batch has {got} entries but {expected} motors are bound")]
    BatchLength { expected: usize, got: usize },

    #[error("No motors are bound")]
    NoMotors,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Broad failure category, used to decide how a failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Link failed or went silent; fatal for the running test
    Transport,
    /// Inputs do not satisfy what the estimator needs
    Precondition,
    /// The estimator could not derive a value from valid inputs
    Estimation,
    /// A value was computed but is outside the accepted band
    Tolerance,
    /// Configuration, logging, or file setup
    Setup,
}

/// Errors surfaced by a bench session.
#[derive(Error, Debug)]
pub enum BenchError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("Driver did not acknowledge {mode:?} command within {waited:?}")]
    AckTimeout { mode: ModeDesired, waited: Duration },

    #[error("Telemetry stopped updating for {waited:?}")]
    StaleTelemetry { waited: Duration },

    #[error("Read returned {got} samples but {expected} motors are bound")]
    ReadLength { expected: usize, got: usize },

    #[error("Telemetry channel {channel} does not exist; {motors} motors are bound")]
    ChannelOutOfRange { channel: usize, motors: usize },

    #[error("Collected {got} samples but the estimator needs at least {required}")]
    InsufficientSamples { got: usize, required: usize },

    #[error("Envelope never dropped below {threshold} in {searched} samples after skip")]
    NoThresholdCrossing { threshold: f64, searched: usize },

    #[error("Non-finite value in signal trace at sample {0}")]
    NonFiniteSample(usize),

    #[error("{name} = {value:.3} is outside {expected} ± {tolerance}")]
    OutOfTolerance {
        name: String,
        value: f64,
        expected: f64,
        tolerance: f64,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Logging setup error: {0}")]
    Logging(String),
}

impl BenchError {
    /// Failure category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Driver(_)
            | Self::AckTimeout { .. }
            | Self::StaleTelemetry { .. }
            | Self::ReadLength { .. } => ErrorKind::Transport,
            Self::ChannelOutOfRange { .. }
            | Self::InsufficientSamples { .. }
            | Self::NonFiniteSample(_) => ErrorKind::Precondition,
            Self::NoThresholdCrossing { .. } => ErrorKind::Estimation,
            Self::OutOfTolerance { .. } => ErrorKind::Tolerance,
            Self::Config(_) | Self::ConfigParse(_) | Self::Io(_) | Self::Logging(_) => {
                ErrorKind::Setup
            }
        }
    }
}
