//! Encode executor.
//!
//! Supervises one encoder process: spawns it, reads its `-progress` stream,
//! reports percentages at most once per interval and guarantees that the
//! staging file is removed unless the encode succeeded. The process is killed
//! on cancellation and whenever the supervising future is dropped.

use crate::encode::command::EncodeCommand;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Lines of stderr kept for the failure diagnostic.
const DIAGNOSTIC_LINES: usize = 20;

/// How one encoder invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    /// The output was written and moved into place.
    Success(PathBuf),
    /// Nonzero exit, crash or unusable output. `exit_code` is None when the
    /// process was killed by a signal or never started.
    Failure {
        exit_code: Option<i32>,
        diagnostic: String,
    },
    Cancelled,
}

/// Progress callback, invoked with percent complete in [0, 100].
pub type ProgressFn = Box<dyn FnMut(f64) + Send>;

/// Runs encoder commands.
#[async_trait]
pub trait EncodeRunner: Send + Sync {
    async fn execute(
        &self,
        command: &EncodeCommand,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> ExitOutcome;
}

/// Turns ffmpeg `-progress` key=value lines into throttled percentages.
#[derive(Debug)]
pub struct ProgressParser {
    duration_us: f64,
    interval: Duration,
    latest: Option<f64>,
    last_emit: Option<Instant>,
}

impl ProgressParser {
    pub fn new(duration_secs: f64, interval: Duration) -> Self {
        Self {
            duration_us: duration_secs * 1_000_000.0,
            interval,
            latest: None,
            last_emit: None,
        }
    }

    /// Feed one line; returns a percentage when one is due.
    ///
    /// Timestamps update the pending value, `progress=continue` emits it if the
    /// interval has elapsed, and `progress=end` always emits 100.
    pub fn feed(&mut self, line: &str, now: Instant) -> Option<f64> {
        let (key, value) = line.trim().split_once('=')?;
        match key {
            // ffmpeg reports microseconds under both names.
            "out_time_us" | "out_time_ms" => {
                let micros: f64 = value.trim().parse().ok()?;
                if self.duration_us > 0.0 && micros >= 0.0 {
                    self.latest = Some((micros / self.duration_us * 100.0).clamp(0.0, 100.0));
                }
                None
            }
            "progress" if value.trim() == "end" => {
                self.last_emit = Some(now);
                self.latest = Some(100.0);
                Some(100.0)
            }
            "progress" => {
                let due = self
                    .last_emit
                    .map_or(true, |t| now.duration_since(t) >= self.interval);
                let percent = self.latest?;
                if due {
                    self.last_emit = Some(now);
                    Some(percent)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

/// Removes the staging file on drop unless the encode was committed.
struct StagingGuard {
    path: PathBuf,
    armed: bool,
}

impl StagingGuard {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Keep the tail of a stream for diagnostics.
async fn collect_tail<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(DIAGNOSTIC_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == DIAGNOSTIC_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

/// [`EncodeRunner`] that spawns the command as a child process.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    progress_interval: Duration,
}

impl ProcessExecutor {
    pub fn new(progress_interval: Duration) -> Self {
        Self { progress_interval }
    }
}

#[async_trait]
impl EncodeRunner for ProcessExecutor {
    async fn execute(
        &self,
        command: &EncodeCommand,
        mut on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> ExitOutcome {
        if let Some(parent) = command.staging.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return ExitOutcome::Failure {
                    exit_code: None,
                    diagnostic: format!("cannot create {}: {}", parent.display(), e),
                };
            }
        }

        let mut guard = StagingGuard::new(&command.staging);

        let mut child = match Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return ExitOutcome::Failure {
                    exit_code: None,
                    diagnostic: format!(
                        "failed to start {}: {}",
                        command.program.display(),
                        e
                    ),
                }
            }
        };

        let stderr_task = child.stderr.take().map(|s| tokio::spawn(collect_tail(s)));
        let mut parser = ProgressParser::new(command.duration_secs, self.progress_interval);

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        return ExitOutcome::Cancelled;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Some(percent) = parser.feed(&line, Instant::now()) {
                                on_progress(percent);
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return ExitOutcome::Cancelled;
            }
            status = child.wait() => status,
        };

        let diagnostic = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                return ExitOutcome::Failure {
                    exit_code: None,
                    diagnostic: format!("failed to wait for encoder: {}", e),
                }
            }
        };

        if !status.success() {
            return ExitOutcome::Failure {
                exit_code: status.code(),
                diagnostic,
            };
        }

        match tokio::fs::metadata(&command.staging).await {
            Ok(meta) if meta.len() > 0 => {}
            _ => {
                return ExitOutcome::Failure {
                    exit_code: Some(0),
                    diagnostic: "encoder exited cleanly but produced no output".to_string(),
                }
            }
        }

        if let Err(e) = tokio::fs::rename(&command.staging, &command.output).await {
            return ExitOutcome::Failure {
                exit_code: Some(0),
                diagnostic: format!(
                    "cannot move output into place at {}: {}",
                    command.output.display(),
                    e
                ),
            };
        }
        guard.disarm();

        ExitOutcome::Success(command.output.clone())
    }
}
