//! Terminal summary of a run and the process exit code derived from it.

use crate::resume::ResumeReport;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Last diagnostic of a failed job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureNote {
    pub path: PathBuf,
    pub diagnostic: String,
}

/// Counts and notes for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub resumed: bool,
    /// Outcomes of jobs processed during this invocation.
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Jobs still Pending when the run stopped (interrupted runs only).
    pub pending: u64,
    /// Jobs already terminal before this invocation (resumed or history skips).
    pub carried_over: u64,
    pub bytes_saved: i64,
    pub files_processed: u64,
    pub failures: Vec<FailureNote>,
    pub resume: Option<ResumeReport>,
    pub interrupted: bool,
    pub elapsed_secs: f64,
}

/// How the process should exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every job Completed or Skipped.
    Success,
    /// At least one job Failed.
    PartialFailure,
    /// Startup, configuration or state store error.
    Fatal,
    /// Stopped by the user before the queue drained.
    Interrupted,
}

impl RunOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::Fatal => 1,
            RunOutcome::PartialFailure => 2,
            RunOutcome::Interrupted => 130,
        }
    }
}

impl RunSummary {
    pub fn outcome(&self) -> RunOutcome {
        if self.interrupted {
            RunOutcome::Interrupted
        } else if self.failed > 0 {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::Success
        }
    }

    pub fn record_failure(&mut self, path: PathBuf, diagnostic: impl Into<String>) {
        self.failed += 1;
        self.files_processed += 1;
        self.failures.push(FailureNote {
            path,
            diagnostic: diagnostic.into(),
        });
    }
}

fn human_bytes(bytes: i64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value.abs() >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Run {}{}",
            self.run_id,
            if self.resumed { " (resumed)" } else { "" }
        )?;
        writeln!(f, "  completed: {}", self.completed)?;
        writeln!(f, "  skipped:   {}", self.skipped)?;
        writeln!(f, "  failed:    {}", self.failed)?;
        if self.pending > 0 {
            writeln!(f, "  pending:   {}", self.pending)?;
        }
        if self.carried_over > 0 {
            writeln!(f, "  already done: {}", self.carried_over)?;
        }
        writeln!(f, "  saved:     {}", human_bytes(self.bytes_saved))?;
        writeln!(f, "  elapsed:   {:.1}s", self.elapsed_secs)?;
        if let Some(report) = &self.resume {
            writeln!(
                f,
                "  resume: {} interrupted job(s) reconciled ({} completed, {} discarded, {} requeued), {} new, {} missing",
                report.reconciled,
                report.promoted,
                report.rejected + report.failed,
                report.reset,
                report.added,
                report.missing
            )?;
        }
        for failure in &self.failures {
            let last_line = failure.diagnostic.lines().last().unwrap_or("");
            writeln!(f, "  FAILED {}: {}", failure.path.display(), last_line)?;
        }
        if self.interrupted {
            writeln!(f, "  interrupted before completion; rerun with --resume")?;
        }
        Ok(())
    }
}
