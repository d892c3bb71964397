//! Run the full bench against simulated motors.
//!
//! Demonstrated here:
//!   * Loading a bench profile, or using the reference profile
//!   * Logging to the terminal and to a per-run log file
//!   * Running every procedure with no hardware in the loop
//!
//! The simulation runs on a manual clock, so the ten-second collection
//! window takes only as long as the host needs to compute it.
//!
//! Usage: `cargo run --example simulated [profile.json]`

use std::{path::Path, sync::Arc};

use motorbench::{
    Bench, BenchConfig, ManualClock, SimulatedDriver,
    driver::SimMotorParams,
    logging::init_logging,
};

use tracing::{error, info};

fn main() {
    let cfg = match std::env::args().nth(1) {
        Some(path) => BenchConfig::from_json_file(Path::new(&path)).unwrap(),
        None => {
            let mut cfg = BenchConfig::default();
            cfg.op_name = "simulated_example".to_string();
            cfg.results_file = Some(cfg.op_dir.join("output.txt"));
            cfg
        }
    };
    let run_log = init_logging(&cfg).unwrap();

    // Two motors with a slower current loop than the default
    let clock = ManualClock::new();
    let params = SimMotorParams {
        bandwidth_hz: 650.0,
        ..Default::default()
    };
    let driver = SimulatedDriver::with_params(2, Arc::new(clock.clone()), params);

    let mut bench = Bench::new(driver, Arc::new(clock), cfg).unwrap();
    match bench.run() {
        Ok(reports) => {
            for r in reports {
                info!("{r}");
            }
            info!("Run {} logged to {}", run_log.op_name, run_log.path.display());
        }
        Err(e) => {
            error!("Bench failed ({:?}): {e}", e.kind());
            std::process::exit(1);
        }
    }
}
