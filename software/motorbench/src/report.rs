//! Benchmark results and the files they are written to.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::Expectation;
use crate::error::{BenchError, Result};
use crate::estimator::BandwidthEstimate;

/// Outcome of comparing a measured value against its expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => write!(f, "PASS"),
            Self::Fail => write!(f, "FAIL"),
        }
    }
}

/// A measured value, the band it was expected in, and how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchReport {
    pub name: String,
    pub value: f64,
    pub expectation: Expectation,
    pub unit: &'static str,

    /// Details of the bandwidth estimate, for bandwidth reports
    pub estimate: Option<BandwidthEstimate>,
}

impl BenchReport {
    pub fn new(name: &str, value: f64, expectation: Expectation, unit: &'static str) -> Self {
        Self {
            name: name.to_owned(),
            value,
            expectation,
            unit,
            estimate: None,
        }
    }

    pub fn bandwidth(estimate: BandwidthEstimate, expectation: Expectation) -> Self {
        Self {
            estimate: Some(estimate),
            ..Self::new("bandwidth", estimate.bandwidth_hz, expectation, "Hz")
        }
    }

    pub fn passed(&self) -> bool {
        self.expectation.contains(self.value)
    }

    pub fn verdict(&self) -> Verdict {
        if self.passed() {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }

    /// The report itself on a pass, a tolerance error on a fail
    pub fn into_result(self) -> Result<Self> {
        if self.passed() {
            return Ok(self);
        }
        Err(BenchError::OutOfTolerance {
            name: self.name,
            value: self.value,
            expected: self.expectation.expected,
            tolerance: self.expectation.tolerance,
        })
    }

    /// One-line summary for a results file, `Benchmark<name> <value> <tolerance> <unit>`.
    ///
    /// The value is rounded to the nearest integer, halves to even.
    pub fn benchmark_line(&self) -> String {
        format!(
            "Benchmark{} {} {} {}",
            self.name,
            self.value.round_ties_even() as i64,
            self.expectation.tolerance,
            self.unit
        )
    }
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} = {:.3} {} (expected {} ± {}): {}",
            self.name,
            self.value,
            self.unit,
            self.expectation.expected,
            self.expectation.tolerance,
            self.verdict()
        )
    }
}

/// Append-only file of benchmark lines shared by every run.
#[derive(Debug, Clone)]
pub struct ResultsFile {
    path: PathBuf,
}

impl ResultsFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_owned(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append the report's benchmark line, creating the file if needed.
    pub fn append(&self, report: &BenchReport) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", report.benchmark_line())?;
        info!("Wrote {} to {:?}", report.name, self.path);
        Ok(())
    }
}

/// Write a collected trace and its envelope as fixed-width CSV.
///
/// Envelope entry `k` covers the window starting at sample `k`, so the last
/// `window - 1` rows have no envelope value and hold NaN.
pub fn write_trace_csv(path: &Path, trace: &[f64], envelope: &[f64]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(csv_header(&["iq", "envelope"]).as_bytes())?;
    for (i, x) in trace.iter().enumerate() {
        let b = envelope.get(i).copied().unwrap_or(f64::NAN);
        writeln!(w, "{},{},{}", fmt_index(i), fmt_f64(*x), fmt_f64(b))?;
    }
    w.flush()?;
    info!("Wrote {} samples to {path:?}", trace.len());
    Ok(())
}

/// Generate CSV header row given some column names
fn csv_header(columns: &[&str]) -> String {
    let mut header = String::from("sample");
    for c in columns {
        header.push(',');
        header.push_str(c);
    }
    header.push('\n');
    header
}

/// Fixed-width formatting of float values
fn fmt_f64(num: f64) -> String {
    let precision = 17;
    let exp_pad = 3;
    let width = precision + exp_pad + 5;

    let prefix = if num.is_sign_positive() { "+" } else { "" };
    let mut numstr = format!("{prefix}{num:.precision$e}");

    // Infinity and NaN carry no exponent
    let Some(e) = numstr.find('e') else {
        return format!("{numstr:>width$}");
    };
    let exp = numstr.split_off(e);
    let (sign, digits) = match exp.strip_prefix("e-") {
        Some(d) => ('-', d),
        None => ('+', &exp[1..]),
    };
    numstr.push_str(&format!("e{sign}{digits:0>exp_pad$}"));

    format!("{numstr:>width$}")
}

/// Fixed-width sample index
fn fmt_index(i: usize) -> String {
    format!("{i:010}")
}
