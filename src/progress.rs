//! Analysis progress reporting and run control.
//!
//! Progress is emitted on **stderr** so stdout remains parseable for
//! scripts. Each analysis run owns a [`RunHandle`] that carries its
//! progress sink and cancellation flag; there is no process-wide progress
//! state.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

/// A single progress event for an analysis run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Phase name: `signatures`, `grouping`, or `completed`.
    pub step: String,
    pub current: u64,
    pub total: u64,
}

/// Receives progress events. Failures are reported to the caller, which
/// decides whether they matter.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent) -> Result<()>;
}

/// Human-friendly progress on stderr: "analyze  grouping  1,234 / 5,000".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &ProgressEvent) -> Result<()> {
        let mut err = std::io::stderr().lock();
        writeln!(
            err,
            "analyze  {}  {} / {}",
            event.step,
            format_number(event.current),
            format_number(event.total)
        )?;
        err.flush()?;
        Ok(())
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &ProgressEvent) -> Result<()> {
        let obj = serde_json::json!({
            "event": "progress",
            "step": event.step,
            "current": event.current,
            "total": event.total
        });
        let line = serde_json::to_string(&obj)?;
        let mut err = std::io::stderr().lock();
        writeln!(err, "{}", line)?;
        err.flush()?;
        Ok(())
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &ProgressEvent) -> Result<()> {
        Ok(())
    }
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

/// Per-run context: progress sink plus cancellation flag.
///
/// Sink failures are logged and swallowed so a broken stderr never aborts
/// an analysis run.
pub struct RunHandle {
    reporter: Box<dyn ProgressReporter>,
    cancelled: AtomicBool,
}

impl RunHandle {
    pub fn new(reporter: Box<dyn ProgressReporter>) -> Self {
        Self {
            reporter,
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn silent() -> Self {
        Self::new(Box::new(NoProgress))
    }

    pub fn report_progress(&self, step: &str, current: u64, total: u64) {
        let event = ProgressEvent {
            step: step.to_string(),
            current,
            total,
        };
        if let Err(err) = self.reporter.report(&event) {
            tracing::warn!(error = %err, step, "progress sink failed");
        }
    }

    pub fn report_completion(&self, total: u64) {
        self.report_progress("completed", total, total);
    }

    /// Request cancellation. Observed at the run's next suspension point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
