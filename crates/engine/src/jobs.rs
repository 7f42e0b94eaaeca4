//! Job records tracked by the state store.
//!
//! One record exists per source identity. Records move through
//! Pending → InProgress → {Completed, Failed, Skipped}; the allowed moves
//! are enforced by [`JobStatus::can_transition_to`] and checked again by the
//! store on every write.

use crate::media::FileIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker slot.
    Pending,
    /// Admitted and running.
    InProgress,
    /// Output written and accepted.
    Completed,
    /// Failed with a recorded error.
    Failed,
    /// Not converted (already optimal, constraints unmet, size gate, already converted).
    Skipped,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Skipped
        )
    }

    /// Whether a normal write may move a record from `self` to `next`.
    ///
    /// Rewriting the same status is always allowed. Resetting a Completed or
    /// Skipped record goes through the store's force reset, not through here.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Skipped)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Skipped)
                | (InProgress, Pending)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status: {}", s))
    }
}

/// Why a job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The source could not be probed.
    Probe,
    /// The encoder exited nonzero or crashed.
    Encoder,
    /// The encoder succeeded but the output was unusable.
    Output,
    /// Interrupted by shutdown; requeued on resume.
    Cancelled,
    /// Anything else, including a panicked worker.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Probe => "probe",
            ErrorKind::Encoder => "encoder",
            ErrorKind::Output => "output",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Encoder failures are retried; the rest are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Encoder)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "probe" => Ok(ErrorKind::Probe),
            "encoder" => Ok(ErrorKind::Encoder),
            "output" => Ok(ErrorKind::Output),
            "cancelled" => Ok(ErrorKind::Cancelled),
            "internal" => Ok(ErrorKind::Internal),
            other => Err(format!("unknown error kind: {}", other)),
        }
    }
}

/// Persisted state of one source file within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub identity: FileIdentity,
    /// Discovery order; the scheduler admits jobs in ascending `seq`.
    pub seq: i64,
    pub status: JobStatus,
    /// Encode attempts started for this identity.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Advisor verdict of the most recent attempt.
    pub verdict: Option<String>,
    /// Planned (while in progress) or final output path.
    pub output_path: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// A fresh pending record.
    pub fn pending(identity: FileIdentity, seq: i64) -> Self {
        Self {
            identity,
            seq,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            error_kind: None,
            verdict: None,
            output_path: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn key(&self) -> String {
        self.identity.key()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Mark the job admitted: bumps the attempt count and records the planned output.
    pub fn start(&mut self, planned_output: Option<PathBuf>) {
        self.status = JobStatus::InProgress;
        self.attempts += 1;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        self.output_path = planned_output;
    }

    pub fn complete(&mut self, output: PathBuf) {
        self.status = JobStatus::Completed;
        self.output_path = Some(output);
        self.last_error = None;
        self.error_kind = None;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, kind: ErrorKind, reason: &str) {
        self.status = JobStatus::Failed;
        self.error_kind = Some(kind);
        self.last_error = Some(reason.to_string());
        self.finished_at = Some(Utc::now());
    }

    pub fn skip(&mut self, reason: &str) {
        self.status = JobStatus::Skipped;
        self.last_error = Some(reason.to_string());
        self.error_kind = None;
        self.finished_at = Some(Utc::now());
    }

    /// Return the job to the queue, keeping its attempt count and last error.
    pub fn requeue(&mut self) {
        self.status = JobStatus::Pending;
        self.started_at = None;
        self.finished_at = None;
    }

    /// Clear everything but identity and order.
    pub fn reset(&mut self) {
        *self = JobRecord::pending(self.identity.clone(), self.seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record() -> JobRecord {
        JobRecord::pending(FileIdentity::new(PathBuf::from("/media/a.mkv"), 100, 1), 0)
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&JobStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn test_transition_table() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(Pending.can_transition_to(Skipped));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Skipped.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn test_lifecycle_helpers() {
        let mut job = record();
        job.start(Some(PathBuf::from("/out/a.mkv")));
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.attempts, 1);
        assert!(job.started_at.is_some());

        job.fail(ErrorKind::Encoder, "exit 1");
        assert!(job.is_terminal());
        assert_eq!(job.error_kind, Some(ErrorKind::Encoder));

        job.requeue();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("exit 1"));

        job.start(None);
        job.complete(PathBuf::from("/out/a.mkv"));
        assert_eq!(job.attempts, 2);
        assert!(job.last_error.is_none());
        assert!(job.finished_at.is_some());

        job.reset();
        assert_eq!(job, record());
    }

    #[test]
    fn test_only_encoder_failures_retry() {
        assert!(ErrorKind::Encoder.is_retryable());
        assert!(!ErrorKind::Probe.is_retryable());
        assert!(!ErrorKind::Output.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    fn status_strategy() -> impl Strategy<Value = JobStatus> {
        prop::sample::select(JobStatus::ALL.to_vec())
    }

    // Terminal states other than Failed have no normal way out.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_completed_and_skipped_are_sticky(next in status_strategy()) {
            for from in [JobStatus::Completed, JobStatus::Skipped] {
                prop_assert_eq!(from.can_transition_to(next), from == next);
            }
        }
    }
}
