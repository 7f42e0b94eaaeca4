//! batchcode
//!
//! Batch transcoding engine: discovers video files, decides per file whether
//! and how to re-encode, runs ffmpeg under a bounded worker pool and keeps
//! durable per-file state so an interrupted run can be resumed.

pub mod advisor;
pub mod concurrency;
pub mod encode;
pub mod jobs;
pub mod media;
pub mod notify;
pub mod orchestrator;
pub mod probe;
pub mod progress;
pub mod replace;
pub mod resume;
pub mod scan;
pub mod scheduler;
pub mod size_gate;
pub mod startup;
pub mod storage;
pub mod store;
pub mod summary;

pub use batchcode_config as config;
pub use batchcode_config::Config;
pub use tokio_util::sync::CancellationToken;

pub use advisor::{
    recommend, Constraints, EncoderProfile, ProfileEstimate, Recommendation, Verdict,
    PROFILE_TABLE,
};
pub use concurrency::ConcurrencyPlan;
pub use encode::{
    BuildError, CommandBuilder, EncodeCommand, EncodeRunner, ExitOutcome, ProcessExecutor,
};
pub use jobs::{ErrorKind, JobRecord, JobStatus};
pub use media::{FileIdentity, MediaDescriptor};
pub use notify::{Notifier, NotifyError, WebhookNotifier};
pub use orchestrator::{Analysis, Candidate, EngineError, Orchestrator, PlannedJob, RunOptions};
pub use probe::{FfprobeProber, ProbeError, Prober};
pub use progress::{new_shared_progress, sample_system_load, RunProgress, SharedProgress};
pub use replace::{finalize_output, Finalized, OutputPolicy, ReplaceError};
pub use resume::ResumeReport;
pub use scheduler::{Scheduler, SchedulerSettings};
pub use startup::{run_startup_checks, StartupError, ToolReport};
pub use store::{HistoryStats, LedgerEntry, ResultLedger, StateStore, StateStoreError};
pub use summary::{RunOutcome, RunSummary};
