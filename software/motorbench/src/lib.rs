//! Mode sequencing and current-loop bandwidth characterization for motor drivers.
//!
//! A [`Bench`] binds a set of motors through a [`MotorDriver`], drives them
//! through guarded mode sessions, and reports benchmark values against their
//! expected bands. Motors are always left in `Open` when a session ends.

pub mod bench;
pub mod clock;
pub mod config;
pub mod driver;
pub mod error;
pub mod estimator;
pub mod logging;
pub mod report;
pub mod sampling;
pub mod sequencer;

pub use bench::Bench;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::BenchConfig;
pub use driver::{MotorDriver, SimulatedDriver};
pub use error::{BenchError, DriverError, ErrorKind};
pub use estimator::{BandwidthEstimate, BandwidthEstimator, bandwidth_estimate};
pub use report::{BenchReport, Verdict};
pub use sampling::{RollingStats, SamplingLoop, SignalTrace};
pub use sequencer::{ModeSequencer, Setpoints, with_session};

pub use motorbench_shared::{Command, ModeDesired, Status};
