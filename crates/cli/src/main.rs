//! CLI entry point for batchcode
//!
//! Parses arguments, applies them over the configuration file and runs the
//! engine. Logs go to stderr; stdout carries command lines, tables and the
//! run summary.

use batchcode::config::{ConfigError, GpuType, ProfileTier, TargetCodec};
use batchcode::{
    run_startup_checks, sample_system_load, CancellationToken, Config, Orchestrator, RunOptions,
    RunOutcome, Verdict, PROFILE_TABLE,
};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};

/// Interval between progress log lines during a run.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// batchcode - batch video transcoding with resumable state
#[derive(Parser, Debug)]
#[command(name = "batchcode")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Files or directories to process
    #[arg(required_unless_present_any = ["list_profiles", "check_deps"])]
    paths: Vec<PathBuf>,

    /// Path to the configuration file
    #[arg(short, long, default_value = "batchcode.toml")]
    config: PathBuf,

    /// Print the encoder commands without running them
    #[arg(long)]
    dry_run: bool,

    /// Continue the previous run
    #[arg(long)]
    resume: bool,

    /// Re-encode already-optimal files and files converted before
    #[arg(long)]
    force: bool,

    /// Show codec recommendations only
    #[arg(long, conflicts_with = "dry_run")]
    analyze: bool,

    /// Check ffmpeg, ffprobe and encoder availability, then exit
    #[arg(long)]
    check_deps: bool,

    /// Print the encoder profile table, then exit
    #[arg(long)]
    list_profiles: bool,

    /// Restrict to one profile tier (quality, balanced, fast, archive)
    #[arg(long)]
    profile: Option<ProfileTier>,

    /// Maximum concurrent jobs
    #[arg(short, long)]
    jobs: Option<u32>,

    /// Use hardware encoding
    #[arg(long)]
    gpu: bool,

    /// GPU vendor (nvidia, amd, intel, videotoolbox); implies --gpu
    #[arg(long)]
    gpu_type: Option<GpuType>,

    /// Target codec (hevc, av1, h264, vp9)
    #[arg(long)]
    codec: Option<TargetCodec>,

    /// Maximum predicted quality loss, percent
    #[arg(long)]
    max_quality_loss: Option<f64>,

    /// Minimum predicted size reduction, percent
    #[arg(long)]
    min_compression: Option<f64>,

    /// Write outputs here instead of beside the sources
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Suffix appended to output file names
    #[arg(long)]
    suffix: Option<String>,

    /// State database path
    #[arg(long)]
    database: Option<PathBuf>,

    /// Swap each verified output into its source's place
    #[arg(long)]
    replace_original: bool,

    /// With --replace-original, delete the source instead of keeping a backup
    #[arg(long, requires = "replace_original")]
    no_backup: bool,

    /// Debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Warnings and errors only
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    /// Apply command line overrides on top of file and environment settings.
    fn apply(&self, config: &mut Config) {
        if let Some(profile) = self.profile {
            config.quality.profile = Some(profile);
        }
        if let Some(jobs) = self.jobs {
            config.concurrency.max_concurrent_jobs = jobs;
        }
        if self.gpu {
            config.hardware.enabled = true;
        }
        if let Some(gpu_type) = self.gpu_type {
            config.hardware.enabled = true;
            config.hardware.gpu_type = gpu_type;
        }
        if let Some(codec) = self.codec {
            config.quality.target_codec = codec;
        }
        if let Some(loss) = self.max_quality_loss {
            config.quality.max_quality_loss = loss;
        }
        if let Some(compression) = self.min_compression {
            config.quality.min_compression = compression;
        }
        if let Some(dir) = &self.output_dir {
            config.output.directory = Some(dir.clone());
        }
        if let Some(suffix) = &self.suffix {
            config.output.suffix = suffix.clone();
        }
        if let Some(db) = &self.database {
            config.state.database_path = db.clone();
        }
        if self.replace_original {
            config.output.replace_original = true;
        }
        if self.no_backup {
            config.output.keep_backup = false;
        }
    }

    fn options(&self) -> RunOptions {
        RunOptions {
            resume: self.resume,
            force: self.force,
        }
    }
}

fn init_logging(args: &Args) {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if args.verbose {
            "batchcode=debug,batchcode_cli=debug".to_string()
        } else if args.quiet {
            "warn".to_string()
        } else {
            "info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = Config::load_or_default(&args.config)?;
    args.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn print_profiles() {
    println!(
        "{:<6} {:<9} {:>7} {:<9} {:>7} {:>12}",
        "codec", "tier", "quality", "preset", "loss %", "compression %"
    );
    for row in PROFILE_TABLE {
        println!(
            "{:<6} {:<9} {:>7} {:<9} {:>7.1} {:>12.0}",
            row.codec.as_str(),
            row.tier.as_str(),
            row.quality,
            row.preset.as_str(),
            row.loss,
            row.compression
        );
    }
}

fn check_deps(config: &Config) -> ExitCode {
    match run_startup_checks(config) {
        Ok(report) => {
            println!("ffmpeg:  {} (major {})", report.ffmpeg_version, report.ffmpeg_major);
            println!("ffprobe: {}", report.ffprobe_version);
            println!("encoder: {} (available)", report.required_encoder);
            let video: Vec<&str> = report
                .encoders
                .iter()
                .map(String::as_str)
                .filter(|e| {
                    ["libx265", "libx264", "libsvtav1", "libvpx-vp9"].contains(e)
                        || e.contains("nvenc")
                        || e.contains("qsv")
                        || e.contains("amf")
                        || e.contains("videotoolbox")
                })
                .collect();
            println!("video encoders: {}", video.join(", "));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Dependency check failed: {}", e);
            ExitCode::from(RunOutcome::Fatal.exit_code())
        }
    }
}

async fn analyze(orchestrator: &Orchestrator, paths: &[PathBuf]) {
    for analysis in orchestrator.analyze(paths).await {
        println!("{}", analysis.source.display());
        if let Some(e) = &analysis.error {
            println!("  cannot analyze: {}", e);
            continue;
        }
        if let Some(rec) = &analysis.recommendation {
            let src = &rec.source;
            println!(
                "  source: {} {}x{} {}-bit{}, {:.0}s",
                src.video_codec,
                src.width,
                src.height,
                src.bit_depth,
                if src.hdr { " HDR" } else { "" },
                src.duration_secs
            );
            println!("  verdict: {} ({})", rec.verdict, rec.reason);
        }
        for candidate in &analysis.candidates {
            println!(
                "    {} {:<40} loss {:>5.2}%  compression {:>5.1}%",
                if candidate.eligible { "*" } else { " " },
                candidate.estimate.profile.to_string(),
                candidate.estimate.predicted_quality_loss,
                candidate.estimate.predicted_compression
            );
        }
    }
}

async fn dry_run(orchestrator: &Orchestrator, paths: &[PathBuf], options: RunOptions) {
    for job in orchestrator.dry_run(paths, options).await {
        match (&job.verdict, &job.command_line) {
            (Some(Verdict::Convert), Some(line)) => println!("{}", line),
            (Some(verdict), _) => println!("# {}: {} ({})", job.source.display(), verdict, job.reason),
            (None, _) => println!("# {}: cannot probe ({})", job.source.display(), job.reason),
        }
    }
}

async fn run(orchestrator: &Orchestrator, paths: &[PathBuf], options: RunOptions) -> ExitCode {
    let cancel = CancellationToken::new();

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupt received; stopping after running jobs terminate");
                interrupt.cancel();
            }
            Err(e) => error!(error = %e, "cannot listen for interrupt"),
        }
    });

    let progress = orchestrator.progress();
    let ticker = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PROGRESS_LOG_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let line = progress.read().await.status_line();
            let load = tokio::task::spawn_blocking(sample_system_load)
                .await
                .unwrap_or_default();
            info!(
                cpu = %format!("{:.0}%", load.cpu_usage_percent),
                mem = %format!("{:.0}%", load.mem_usage_percent),
                "{}",
                line
            );
        }
    });

    let result = orchestrator.run(paths, options, cancel).await;
    ticker.abort();

    match result {
        Ok(summary) => {
            print!("{}", summary);
            ExitCode::from(summary.outcome().exit_code())
        }
        Err(e) => {
            error!(error = %e, "run failed");
            eprintln!("Run failed: {}", e);
            ExitCode::from(RunOutcome::Fatal.exit_code())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    if args.list_profiles {
        print_profiles();
        return ExitCode::SUCCESS;
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(RunOutcome::Fatal.exit_code());
        }
    };

    if args.check_deps {
        return check_deps(&config);
    }

    let orchestrator = match Orchestrator::new(config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            eprintln!("Failed to start: {}", e);
            return ExitCode::from(RunOutcome::Fatal.exit_code());
        }
    };

    if args.analyze {
        analyze(&orchestrator, &args.paths).await;
        ExitCode::SUCCESS
    } else if args.dry_run {
        dry_run(&orchestrator, &args.paths, args.options()).await;
        ExitCode::SUCCESS
    } else {
        run(&orchestrator, &args.paths, args.options()).await
    }
}
