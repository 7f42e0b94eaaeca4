//! Worker pool and scheduler.
//!
//! The scheduler admits Pending jobs in queue order while a worker slot (and,
//! for hardware encodes, a hardware slot) is free. Each admitted job runs on
//! its own task: probe, advise, build, execute, finalize. Outcomes come back
//! over a channel and are written to the state store by the control loop,
//! which is the only writer. Slot permits are released only after that write
//! commits, so the next job is admitted strictly after the previous outcome
//! is durable.

use crate::advisor::{recommend, Constraints, Verdict};
use crate::concurrency::ConcurrencyPlan;
use crate::config::Config;
use crate::encode::{CommandBuilder, EncodeRunner, ExitOutcome, ProgressFn};
use crate::jobs::{ErrorKind, JobRecord};
use crate::media::FileIdentity;
use crate::probe::Prober;
use crate::progress::{new_shared_progress, SharedProgress};
use crate::replace::{finalize_output, Finalized, OutputPolicy};
use crate::store::{LedgerEntry, ResultLedger, StateStore, StateStoreError};
use crate::summary::RunSummary;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Limits the scheduler enforces.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub worker_slots: usize,
    /// 0 when jobs encode in software.
    pub hardware_slots: usize,
    /// Extra attempts after a retryable encoder failure.
    pub max_retries: u32,
    /// How long the head of the queue may wait for a hardware slot before it
    /// is moved to the back.
    pub hardware_slot_timeout: Duration,
    pub output: OutputPolicy,
}

impl SchedulerSettings {
    pub fn from_plan(plan: &ConcurrencyPlan, cfg: &Config) -> Self {
        Self {
            worker_slots: plan.worker_slots.max(1) as usize,
            hardware_slots: plan.hardware_slots as usize,
            max_retries: cfg.concurrency.max_retries,
            hardware_slot_timeout: Duration::from_secs(cfg.concurrency.hardware_slot_timeout_secs),
            output: OutputPolicy::from_config(&cfg.output),
        }
    }
}

/// What one job task produced.
#[derive(Debug, Clone, PartialEq)]
enum JobOutcome {
    Completed {
        output: PathBuf,
        output_bytes: u64,
        source_codec: String,
        target_codec: String,
        profile: String,
        duration_secs: f64,
    },
    Skipped {
        reason: String,
        verdict: Option<Verdict>,
    },
    Failed {
        kind: ErrorKind,
        diagnostic: String,
    },
    Cancelled,
}

/// Everything a job task needs, shared by all tasks of a run.
struct JobContext {
    prober: Arc<dyn Prober>,
    runner: Arc<dyn EncodeRunner>,
    builder: CommandBuilder,
    constraints: Constraints,
    output: OutputPolicy,
}

/// A job holding its slots.
struct Running {
    record: JobRecord,
    _worker: OwnedSemaphorePermit,
    _hardware: Option<OwnedSemaphorePermit>,
}

type Completion = (String, JobOutcome);
type ProgressEvent = (PathBuf, f64);

/// Drives one run's queue to completion.
pub struct Scheduler<'a> {
    store: &'a StateStore,
    ledger: &'a dyn ResultLedger,
    ctx: Arc<JobContext>,
    settings: SchedulerSettings,
    progress: SharedProgress,
    cancel: CancellationToken,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        store: &'a StateStore,
        ledger: &'a dyn ResultLedger,
        prober: Arc<dyn Prober>,
        runner: Arc<dyn EncodeRunner>,
        builder: CommandBuilder,
        constraints: Constraints,
        settings: SchedulerSettings,
    ) -> Self {
        let output = settings.output;
        Self {
            store,
            ledger,
            ctx: Arc::new(JobContext {
                prober,
                runner,
                builder,
                constraints,
                output,
            }),
            settings,
            progress: new_shared_progress(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run `jobs` (Pending records, in order) to completion or cancellation.
    ///
    /// Per-job failures are recorded and counted. A state store error stops
    /// admission, cancels in-flight jobs, waits for them and is returned.
    pub async fn run(&self, jobs: Vec<JobRecord>) -> Result<RunSummary, StateStoreError> {
        let started = Instant::now();
        let mut dispatch = Dispatch::new(self, jobs);

        let result = dispatch.drive().await;
        if result.is_err() {
            dispatch.abort().await;
        }
        let mut summary = result?;
        summary.elapsed_secs = started.elapsed().as_secs_f64();
        Ok(summary)
    }
}

/// Mutable state of one `Scheduler::run` call.
struct Dispatch<'s, 'a> {
    scheduler: &'s Scheduler<'a>,
    queue: VecDeque<JobRecord>,
    running: HashMap<String, Running>,
    workers: Arc<Semaphore>,
    hardware: Option<Arc<Semaphore>>,
    hardware_wait: Option<Instant>,
    jobs_cancel: CancellationToken,
    done_tx: mpsc::UnboundedSender<Completion>,
    done_rx: mpsc::UnboundedReceiver<Completion>,
    progress_tx: mpsc::UnboundedSender<ProgressEvent>,
    progress_rx: mpsc::UnboundedReceiver<ProgressEvent>,
    summary: RunSummary,
}

impl<'s, 'a> Dispatch<'s, 'a> {
    fn new(scheduler: &'s Scheduler<'a>, jobs: Vec<JobRecord>) -> Self {
        let settings = &scheduler.settings;
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        Self {
            scheduler,
            queue: jobs.into(),
            running: HashMap::new(),
            workers: Arc::new(Semaphore::new(settings.worker_slots.max(1))),
            hardware: (settings.hardware_slots > 0)
                .then(|| Arc::new(Semaphore::new(settings.hardware_slots))),
            hardware_wait: None,
            jobs_cancel: scheduler.cancel.child_token(),
            done_tx,
            done_rx,
            progress_tx,
            progress_rx,
            summary: RunSummary::default(),
        }
    }

    async fn drive(&mut self) -> Result<RunSummary, StateStoreError> {
        info!(
            jobs = self.queue.len(),
            workers = self.scheduler.settings.worker_slots,
            hardware_slots = self.scheduler.settings.hardware_slots,
            "scheduler started"
        );
        self.publish_counts().await;

        loop {
            self.admit().await?;

            let stopping = self.jobs_cancel.is_cancelled();
            if self.running.is_empty() && (self.queue.is_empty() || stopping) {
                break;
            }

            let hardware_deadline = self
                .hardware_wait
                .map(|since| since + self.scheduler.settings.hardware_slot_timeout);

            tokio::select! {
                biased;
                Some((key, outcome)) = self.done_rx.recv() => {
                    self.finish(&key, outcome).await?;
                }
                Some((path, percent)) = self.progress_rx.recv() => {
                    debug!(path = %path.display(), percent, "progress");
                    self.scheduler.progress.write().await.job_progress(&path, percent);
                }
                _ = self.jobs_cancel.cancelled(), if !stopping => {
                    info!(in_flight = self.running.len(), "cancellation requested; waiting for running jobs");
                }
                _ = sleep_until_opt(hardware_deadline), if hardware_deadline.is_some() => {
                    self.rotate_starved_head();
                }
            }
        }

        if self.jobs_cancel.is_cancelled() {
            self.summary.interrupted = true;
            self.summary.pending += self.queue.len() as u64;
        }
        self.publish_counts().await;
        info!(
            completed = self.summary.completed,
            skipped = self.summary.skipped,
            failed = self.summary.failed,
            interrupted = self.summary.interrupted,
            "scheduler finished"
        );
        Ok(std::mem::take(&mut self.summary))
    }

    /// Admit jobs from the head of the queue while slots are free.
    async fn admit(&mut self) -> Result<(), StateStoreError> {
        while !self.jobs_cancel.is_cancelled() && !self.queue.is_empty() {
            let Ok(worker) = self.workers.clone().try_acquire_owned() else {
                return Ok(());
            };
            let hardware = match &self.hardware {
                Some(slots) => match slots.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        self.hardware_wait.get_or_insert_with(Instant::now);
                        return Ok(());
                    }
                },
                None => None,
            };
            self.hardware_wait = None;

            let Some(mut record) = self.queue.pop_front() else {
                return Ok(());
            };
            let planned = self
                .scheduler
                .ctx
                .builder
                .output_path_for(&record.identity.path);
            record.start(Some(planned));
            self.scheduler.store.upsert(&record)?;

            info!(job = %record.identity, attempt = record.attempts, "job admitted");
            self.scheduler.progress.write().await.job_started(
                record.identity.path.clone(),
                record.attempts,
                hardware.is_some(),
            );

            self.spawn(record.identity.clone());
            self.running.insert(
                record.key(),
                Running {
                    record,
                    _worker: worker,
                    _hardware: hardware,
                },
            );
            self.publish_counts().await;
        }
        Ok(())
    }

    fn spawn(&self, identity: FileIdentity) {
        let ctx = self.scheduler.ctx.clone();
        let cancel = self.jobs_cancel.clone();
        let progress_tx = self.progress_tx.clone();
        let done_tx = self.done_tx.clone();
        let key = identity.key();

        let job = tokio::spawn(run_job(ctx, identity, progress_tx, cancel));
        tokio::spawn(async move {
            let outcome = match job.await {
                Ok(outcome) => outcome,
                Err(e) => JobOutcome::Failed {
                    kind: ErrorKind::Internal,
                    diagnostic: format!("worker task failed: {}", e),
                },
            };
            let _ = done_tx.send((key, outcome));
        });
    }

    /// Record a job's outcome, then release its slots.
    async fn finish(&mut self, key: &str, outcome: JobOutcome) -> Result<(), StateStoreError> {
        let Some(Running {
            mut record,
            _worker,
            _hardware,
        }) = self.running.remove(key)
        else {
            warn!(key, "completion for unknown job ignored");
            return Ok(());
        };
        let store = self.scheduler.store;
        let path = record.identity.path.clone();

        match outcome {
            JobOutcome::Completed {
                output,
                output_bytes,
                source_codec,
                target_codec,
                profile,
                duration_secs,
            } => {
                record.verdict = Some(Verdict::Convert.as_str().to_string());
                record.complete(output.clone());
                store.upsert(&record)?;
                let entry = LedgerEntry {
                    identity: record.identity.clone(),
                    output_path: output,
                    source_codec: Some(source_codec),
                    target_codec,
                    profile: Some(profile),
                    source_bytes: record.identity.size_bytes,
                    output_bytes,
                    duration_secs,
                    completed_at: Utc::now(),
                };
                self.scheduler.ledger.append(&entry)?;
                self.summary.completed += 1;
                self.summary.files_processed += 1;
                self.summary.bytes_saved += entry.bytes_saved();
                info!(job = %record.identity, saved = entry.bytes_saved(), "job completed");
            }
            JobOutcome::Skipped { reason, verdict } => {
                if let Some(verdict) = verdict {
                    record.verdict = Some(verdict.as_str().to_string());
                }
                record.skip(&reason);
                store.upsert(&record)?;
                self.summary.skipped += 1;
                self.summary.files_processed += 1;
                info!(job = %record.identity, reason = %reason, "job skipped");
            }
            JobOutcome::Failed { kind, diagnostic }
                if kind.is_retryable()
                    && record.attempts <= self.scheduler.settings.max_retries
                    && !self.jobs_cancel.is_cancelled() =>
            {
                warn!(
                    job = %record.identity,
                    attempt = record.attempts,
                    error = %diagnostic,
                    "job failed; requeued at the back of the queue"
                );
                record.error_kind = Some(kind);
                record.last_error = Some(diagnostic);
                record.requeue();
                store.upsert(&record)?;
                self.queue.push_back(record);
            }
            JobOutcome::Failed { kind, diagnostic } => {
                warn!(job = %record.identity, kind = %kind, error = %diagnostic, "job failed");
                record.fail(kind, &diagnostic);
                store.upsert(&record)?;
                self.summary.record_failure(path.clone(), diagnostic);
            }
            JobOutcome::Cancelled => {
                // The interrupted attempt does not count against the retry budget.
                record.attempts = record.attempts.saturating_sub(1);
                record.fail(ErrorKind::Cancelled, "interrupted by shutdown");
                store.upsert(&record)?;
                self.summary.pending += 1;
                info!(job = %record.identity, "job cancelled");
            }
        }

        self.scheduler.progress.write().await.job_finished(&path);
        self.publish_counts().await;
        Ok(())
    }

    /// The head of the queue could not get a hardware slot in time: move it
    /// to the back, still Pending.
    fn rotate_starved_head(&mut self) {
        self.hardware_wait = None;
        if self.queue.len() < 2 {
            return;
        }
        if let Some(record) = self.queue.pop_front() {
            warn!(
                job = %record.identity,
                "no hardware encoder slot within timeout; job moved to the back of the queue"
            );
            self.queue.push_back(record);
        }
    }

    /// Cancel in-flight jobs and wait for all of them to exit.
    async fn abort(&mut self) {
        self.jobs_cancel.cancel();
        while !self.running.is_empty() {
            match self.done_rx.recv().await {
                Some((key, _)) => {
                    self.running.remove(&key);
                }
                None => break,
            }
        }
    }

    async fn publish_counts(&self) {
        let mut progress = self.scheduler.progress.write().await;
        progress.queued = self.queue.len();
        progress.completed = self.summary.completed;
        progress.skipped = self.summary.skipped;
        progress.failed = self.summary.failed;
        progress.bytes_saved = self.summary.bytes_saved;
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

/// One job: probe, advise, build, encode, finalize.
async fn run_job(
    ctx: Arc<JobContext>,
    identity: FileIdentity,
    progress_tx: mpsc::UnboundedSender<ProgressEvent>,
    cancel: CancellationToken,
) -> JobOutcome {
    let path = identity.path.clone();

    let probed = tokio::select! {
        _ = cancel.cancelled() => return JobOutcome::Cancelled,
        probed = ctx.prober.probe(&path) => probed,
    };
    let descriptor = match probed {
        Ok(descriptor) => descriptor,
        Err(e) => {
            return JobOutcome::Failed {
                kind: ErrorKind::Probe,
                diagnostic: e.to_string(),
            }
        }
    };

    let recommendation = recommend(&descriptor, &ctx.constraints);
    if recommendation.verdict != Verdict::Convert {
        return JobOutcome::Skipped {
            reason: recommendation.reason.clone(),
            verdict: Some(recommendation.verdict),
        };
    }
    let profile = match &recommendation.choice {
        Some(choice) => choice.profile.to_string(),
        None => String::new(),
    };

    let command = match ctx.builder.build(&recommendation, recommendation.hardware) {
        Ok(command) => command,
        Err(e) => {
            return JobOutcome::Failed {
                kind: ErrorKind::Internal,
                diagnostic: e.to_string(),
            }
        }
    };
    debug!(job = %identity, command = %command.command_line(), "starting encoder");

    let progress_path = path.clone();
    let on_progress: ProgressFn = Box::new(move |percent| {
        let _ = progress_tx.send((progress_path.clone(), percent));
    });

    match ctx.runner.execute(&command, on_progress, cancel).await {
        ExitOutcome::Success(output) => {
            let policy = ctx.output;
            let source = identity.clone();
            let finalized =
                tokio::task::spawn_blocking(move || finalize_output(&source, &output, &policy)).await;
            let (output, output_bytes) = match finalized {
                Ok(Ok(Finalized::Kept { path, bytes })) => (path, bytes),
                Ok(Ok(Finalized::Rejected { reason })) => {
                    return JobOutcome::Skipped {
                        reason,
                        verdict: None,
                    }
                }
                Ok(Err(e)) => {
                    return JobOutcome::Failed {
                        kind: ErrorKind::Output,
                        diagnostic: e.to_string(),
                    }
                }
                Err(e) => {
                    return JobOutcome::Failed {
                        kind: ErrorKind::Internal,
                        diagnostic: format!("output finalization panicked: {}", e),
                    }
                }
            };
            JobOutcome::Completed {
                output,
                output_bytes,
                source_codec: descriptor.video_codec.clone(),
                target_codec: recommendation.target.to_string(),
                profile,
                duration_secs: descriptor.duration_secs,
            }
        }
        ExitOutcome::Failure {
            exit_code,
            diagnostic,
        } => {
            let kind = if exit_code == Some(0) {
                ErrorKind::Output
            } else {
                ErrorKind::Encoder
            };
            let code = exit_code.map_or("signal".to_string(), |c| c.to_string());
            JobOutcome::Failed {
                kind,
                diagnostic: format!("encoder exit {}: {}", code, diagnostic),
            }
        }
        ExitOutcome::Cancelled => JobOutcome::Cancelled,
    }
}
