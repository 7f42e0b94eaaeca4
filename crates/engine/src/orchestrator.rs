//! Run orchestration
//!
//! Wires configuration, startup checks, discovery, the state store, resume
//! reconciliation, the concurrency plan and the scheduler into the three
//! things the CLI can ask for: a run, a dry run and an analysis.

use crate::advisor::{estimates, recommend, Constraints, ProfileEstimate, Recommendation, Verdict};
use crate::concurrency::ConcurrencyPlan;
use crate::config::{Config, ConfigError};
use crate::encode::{CommandBuilder, EncodeRunner, ProcessExecutor};
use crate::media::FileIdentity;
use crate::notify::{Notifier, WebhookNotifier};
use crate::probe::{FfprobeProber, Prober};
use crate::progress::{new_shared_progress, SharedProgress};
use crate::replace::OutputPolicy;
use crate::resume::{prepare_fresh, reconcile};
use crate::scan::{discover, DiscoverOptions};
use crate::scheduler::{Scheduler, SchedulerSettings};
use crate::startup::{run_startup_checks, StartupError, ToolReport};
use crate::storage::any_on_network_storage;
use crate::store::{CachedProber, StateStore, StateStoreError};
use crate::summary::RunSummary;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("State store error: {0}")]
    StateStore(#[from] StateStoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a run treats earlier state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Reconcile with the previous run instead of starting over.
    pub resume: bool,
    /// Re-encode already-optimal sources and reopen terminal records.
    pub force: bool,
}

/// What a dry run would do with one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedJob {
    pub source: PathBuf,
    /// None when the source could not be probed.
    pub verdict: Option<Verdict>,
    pub reason: String,
    pub output: Option<PathBuf>,
    pub command_line: Option<String>,
}

/// One profile considered by the advisor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub estimate: ProfileEstimate,
    pub eligible: bool,
}

/// Advisor output for one source, with every candidate profile.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub source: PathBuf,
    pub recommendation: Option<Recommendation>,
    pub candidates: Vec<Candidate>,
    pub error: Option<String>,
}

/// The engine entry point.
pub struct Orchestrator {
    config: Config,
    tools: Option<ToolReport>,
    prober: Arc<dyn Prober>,
    runner: Arc<dyn EncodeRunner>,
    notifier: Option<Arc<dyn Notifier>>,
    progress: SharedProgress,
}

impl Orchestrator {
    /// Validate `config`, run the startup checks and wire the ffmpeg-backed
    /// prober and executor.
    pub fn new(config: Config) -> Result<Self, EngineError> {
        config.validate()?;
        let tools = run_startup_checks(&config)?;

        let prober = Arc::new(FfprobeProber::new(
            config.tools.ffprobe_path.clone(),
            Duration::from_secs(config.tools.probe_timeout_secs),
        ));
        let runner = Arc::new(ProcessExecutor::new(Duration::from_millis(
            config.tools.progress_interval_ms,
        )));
        let notifier = config
            .notify
            .webhook_url
            .as_ref()
            .map(|url| Arc::new(WebhookNotifier::new(url.clone())) as Arc<dyn Notifier>);

        Ok(Self {
            config,
            tools: Some(tools),
            prober,
            runner,
            notifier,
            progress: new_shared_progress(),
        })
    }

    /// Build with the given prober and runner, skipping the tool checks.
    ///
    /// Useful for testing or when the tools were checked elsewhere.
    pub fn new_without_checks(
        config: Config,
        prober: Arc<dyn Prober>,
        runner: Arc<dyn EncodeRunner>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            tools: None,
            prober,
            runner,
            notifier: None,
            progress: new_shared_progress(),
        })
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Startup check results; None when built without checks.
    pub fn tools(&self) -> Option<&ToolReport> {
        self.tools.as_ref()
    }

    /// Live progress of the current run.
    pub fn progress(&self) -> SharedProgress {
        self.progress.clone()
    }

    fn discover(&self, paths: &[PathBuf]) -> Vec<FileIdentity> {
        let options = DiscoverOptions {
            suffix: self.config.output.suffix.clone(),
        };
        let found = discover(paths, &options);
        info!(roots = paths.len(), files = found.len(), "discovery finished");
        found
    }

    fn constraints(&self, force: bool) -> Constraints {
        Constraints::from_config(&self.config.quality, self.config.hardware.selected(), force)
    }

    fn plan(&self, paths: &[PathBuf]) -> ConcurrencyPlan {
        let output_dir = self.config.output.directory.as_deref();
        let network = any_on_network_storage(paths.iter().map(PathBuf::as_path).chain(output_dir));
        let plan = ConcurrencyPlan::derive(&self.config, network);
        info!(
            cores = plan.total_cores,
            workers = plan.worker_slots,
            hardware_slots = plan.hardware_slots,
            threads_per_job = plan.threads_per_job,
            network_limited = plan.network_limited,
            "concurrency plan"
        );
        plan
    }

    fn builder(&self, threads: u32) -> CommandBuilder {
        CommandBuilder::new(
            self.config.tools.ffmpeg_path.clone(),
            self.config.output.clone(),
            threads,
        )
    }

    fn open_store(&self) -> Result<Arc<StateStore>, EngineError> {
        let path: &Path = &self.config.state.database_path;
        StateStore::open(path).map(Arc::new).map_err(|e| {
            error!(path = %path.display(), error = %e, "cannot open state store");
            e.into()
        })
    }

    /// Source prober backed by the probe cache in `store`.
    fn cached_prober(&self, store: &Arc<StateStore>) -> Arc<dyn Prober> {
        Arc::new(CachedProber::new(self.prober.clone(), store.clone()))
    }

    /// Convert everything under `paths`.
    ///
    /// Per-file failures are recorded and reported in the summary. Only state
    /// store errors abort the run. Cancelling `cancel` stops admission and
    /// waits for running encodes to terminate.
    pub async fn run(
        &self,
        paths: &[PathBuf],
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunSummary, EngineError> {
        let discovered = self.discover(paths);
        let shared_store = self.open_store()?;
        let store: &StateStore = &shared_store;
        let plan = self.plan(paths);

        let (queue, resume) = if options.resume {
            let policy = OutputPolicy::from_config(&self.config.output);
            let (report, queue) = reconcile(
                store,
                self.prober.as_ref(),
                &discovered,
                options.force,
                &policy,
            )
            .await?;
            (queue, Some(report))
        } else {
            (prepare_fresh(store, &discovered, options.force)?, None)
        };
        let run_id = store.begin_run(options.resume)?;
        let carried_over = discovered.len().saturating_sub(queue.len()) as u64;
        info!(
            run_id = %run_id,
            queued = queue.len(),
            carried_over,
            "run prepared"
        );

        let scheduler = Scheduler::new(
            store,
            store,
            self.cached_prober(&shared_store),
            self.runner.clone(),
            self.builder(plan.threads_per_job),
            self.constraints(options.force),
            SchedulerSettings::from_plan(&plan, &self.config),
        )
        .with_progress(self.progress.clone())
        .with_cancellation(cancel);

        let mut summary = scheduler.run(queue).await.map_err(|e| {
            error!(error = %e, "state store failure; run aborted");
            EngineError::from(e)
        })?;
        summary.run_id = run_id;
        summary.resumed = options.resume;
        summary.resume = resume;
        summary.carried_over = carried_over;

        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify(&summary).await {
                warn!(error = %e, "run summary notification failed");
            }
        }

        Ok(summary)
    }

    /// Probe, advise and build commands without recording or executing anything.
    pub async fn dry_run(&self, paths: &[PathBuf], options: RunOptions) -> Vec<PlannedJob> {
        let plan = self.plan(paths);
        let builder = self.builder(plan.threads_per_job);
        let constraints = self.constraints(options.force);
        let mut planned = Vec::new();

        for identity in self.discover(paths) {
            let source = identity.path.clone();
            let descriptor = match self.prober.probe(&source).await {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    planned.push(PlannedJob {
                        source,
                        verdict: None,
                        reason: e.to_string(),
                        output: None,
                        command_line: None,
                    });
                    continue;
                }
            };

            let rec = recommend(&descriptor, &constraints);
            let job = if rec.verdict == Verdict::Convert {
                match builder.build(&rec, rec.hardware) {
                    Ok(command) => PlannedJob {
                        source,
                        verdict: Some(rec.verdict),
                        reason: rec.reason.clone(),
                        output: Some(command.output.clone()),
                        command_line: Some(command.command_line()),
                    },
                    Err(e) => PlannedJob {
                        source,
                        verdict: Some(rec.verdict),
                        reason: e.to_string(),
                        output: None,
                        command_line: None,
                    },
                }
            } else {
                PlannedJob {
                    source,
                    verdict: Some(rec.verdict),
                    reason: rec.reason.clone(),
                    output: None,
                    command_line: None,
                }
            };
            planned.push(job);
        }
        planned
    }

    /// Run the advisor only, listing every candidate profile for each source.
    ///
    /// Probe results are read from and written to the probe cache when the
    /// state store can be opened.
    pub async fn analyze(&self, paths: &[PathBuf]) -> Vec<Analysis> {
        let constraints = self.constraints(false);
        let prober = match self.open_store() {
            Ok(store) => self.cached_prober(&store),
            Err(e) => {
                warn!(error = %e, "probe cache unavailable; probing every file");
                self.prober.clone()
            }
        };
        let mut out = Vec::new();

        for identity in self.discover(paths) {
            match prober.probe(&identity.path).await {
                Ok(descriptor) => {
                    let rec = recommend(&descriptor, &constraints);
                    let candidates = estimates(
                        &descriptor,
                        constraints.target_codec,
                        rec.hardware,
                        constraints.profile,
                    )
                    .into_iter()
                    .map(|estimate| Candidate {
                        eligible: estimate.satisfies(&constraints),
                        estimate,
                    })
                    .collect();
                    out.push(Analysis {
                        source: identity.path,
                        recommendation: Some(rec),
                        candidates,
                        error: None,
                    });
                }
                Err(e) => out.push(Analysis {
                    source: identity.path,
                    recommendation: None,
                    candidates: Vec::new(),
                    error: Some(e.to_string()),
                }),
            }
        }
        out
    }
}
