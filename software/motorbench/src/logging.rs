//! Terminal and per-run file logging for bench runs.
//!
//! Terminal output is installed once per process. Every run logs to its own
//! file, `<op_dir>/logs/<op_name>.log`, which opens with the run's name and
//! the full profile it was started with, so any log can be traced back to
//! the settings that produced it.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tracing::info;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::format::{DefaultFields, Format, Full};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, reload, util::SubscriberInitExt};

use crate::config::BenchConfig;
use crate::error::{BenchError, Result};

type RunFileLayer = fmt::Layer<Registry, DefaultFields, Format<Full, ChronoUtc>, NonBlocking>;

/// Log outputs shared by every run in this process
struct Outputs {
    /// Keeps the terminal writer thread alive
    _terminal: WorkerGuard,

    /// Writer thread of the current run's file; replacing it flushes the previous run
    run_file: Mutex<WorkerGuard>,

    retarget: reload::Handle<RunFileLayer, Registry>,
}

static OUTPUTS: OnceLock<Outputs> = OnceLock::new();

impl Outputs {
    /// Send file output to a new run's writer.
    fn switch_run(&self, writer: NonBlocking, guard: WorkerGuard) -> Result<()> {
        let mut current = self
            .run_file
            .lock()
            .map_err(|_| BenchError::Logging("run file lock poisoned".into()))?;
        self.retarget
            .reload(run_file_layer(writer))
            .map_err(|e| BenchError::Logging(format!("could not switch run file: {e}")))?;
        *current = guard;
        Ok(())
    }
}

/// Where one run is being logged.
#[derive(Debug, Clone, PartialEq)]
pub struct RunLog {
    pub op_name: String,
    pub path: PathBuf,
}

/// Start logging the run described by `cfg`.
///
/// The level defaults to `info` and follows `RUST_LOG` when set. Calling
/// this again for a later run keeps the terminal output and moves the file
/// output to the new run's file.
pub fn init_logging(cfg: &BenchConfig) -> Result<RunLog> {
    let path = run_log_path(cfg);
    let (writer, guard) = tracing_appender::non_blocking(open_for_append(&path)?);
    match OUTPUTS.get() {
        Some(outputs) => outputs.switch_run(writer, guard)?,
        None => install(writer, guard)?,
    }

    let profile = serde_json::to_string(cfg)?;
    info!(op_name = %cfg.op_name, "Starting run {}, logging to {}", cfg.op_name, path.display());
    info!(op_name = %cfg.op_name, "Profile {profile}");

    Ok(RunLog {
        op_name: cfg.op_name.clone(),
        path,
    })
}

/// `<op_dir>/logs/<op_name>.log`
pub fn run_log_path(cfg: &BenchConfig) -> PathBuf {
    cfg.op_dir.join("logs").join(format!("{}.log", cfg.op_name))
}

fn open_for_append(path: &Path) -> Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .map_err(|e| BenchError::Logging(format!("could not create {}: {e}", dir.display())))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| BenchError::Logging(format!("could not open {}: {e}", path.display())))
}

fn run_file_layer(writer: NonBlocking) -> RunFileLayer {
    fmt::layer::<Registry>()
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(writer)
        .with_ansi(false)
}

/// Install the global subscriber with the first run's file.
fn install(writer: NonBlocking, guard: WorkerGuard) -> Result<()> {
    let level = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| BenchError::Logging(format!("bad log filter: {e}")))?;

    let (terminal_writer, terminal_guard) = tracing_appender::non_blocking(std::io::stdout());
    let terminal = fmt::layer()
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(terminal_writer)
        .with_target(false);
    let (run_file, retarget) = reload::Layer::new(run_file_layer(writer));

    tracing_subscriber::registry()
        .with(run_file)
        .with(level)
        .with(terminal)
        .try_init()
        .map_err(|e| BenchError::Logging(format!("could not install subscriber: {e}")))?;

    OUTPUTS
        .set(Outputs {
            _terminal: terminal_guard,
            run_file: Mutex::new(guard),
            retarget,
        })
        .map_err(|_| BenchError::Logging("log outputs installed twice".into()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn each_run_gets_its_own_file_with_its_profile() {
        let dir = tempfile::tempdir().unwrap();
        let run = |name: &str| BenchConfig {
            op_name: name.into(),
            op_dir: dir.path().to_owned(),
            ..Default::default()
        };

        let first = init_logging(&run("first")).unwrap();
        assert_eq!(first.path, dir.path().join("logs").join("first.log"));
        assert_eq!(first.op_name, "first");

        // Moving to the next run flushes the first run's file
        let second = init_logging(&run("second")).unwrap();
        assert_eq!(second.path, run_log_path(&run("second")));
        assert!(second.path.exists());

        let text = std::fs::read_to_string(&first.path).unwrap();
        assert!(text.contains("Starting run first"));
        assert!(text.contains(r#""op_name":"first""#));
        assert!(!text.contains("Starting run second"));
    }
}
