//! Live run progress shared between the scheduler and the CLI.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// One job currently holding a worker slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveJob {
    pub path: PathBuf,
    pub attempt: u32,
    /// Percent complete, None until the encoder reports.
    pub percent: Option<f64>,
    pub uses_hardware: bool,
}

/// Host load sampled alongside progress.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemLoad {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
}

/// Snapshot of a running run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunProgress {
    pub active: Vec<ActiveJob>,
    pub queued: usize,
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub bytes_saved: i64,
}

impl RunProgress {
    pub fn job_started(&mut self, path: PathBuf, attempt: u32, uses_hardware: bool) {
        self.active.retain(|j| j.path != path);
        self.active.push(ActiveJob {
            path,
            attempt,
            percent: None,
            uses_hardware,
        });
    }

    pub fn job_progress(&mut self, path: &Path, percent: f64) {
        if let Some(job) = self.active.iter_mut().find(|j| j.path == path) {
            job.percent = Some(percent);
        }
    }

    pub fn job_finished(&mut self, path: &Path) {
        self.active.retain(|j| j.path != path);
    }

    pub fn hardware_in_use(&self) -> usize {
        self.active.iter().filter(|j| j.uses_hardware).count()
    }

    /// One-line status for periodic logging.
    pub fn status_line(&self) -> String {
        let mut line = format!(
            "{} running, {} queued, {} done, {} skipped, {} failed",
            self.active.len(),
            self.queued,
            self.completed,
            self.skipped,
            self.failed
        );
        for job in &self.active {
            let name = job
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match job.percent {
                Some(p) => line.push_str(&format!(" | {} {:.1}%", name, p)),
                None => line.push_str(&format!(" | {} starting", name)),
            }
        }
        line
    }
}

/// Shared progress state
pub type SharedProgress = Arc<RwLock<RunProgress>>;

pub fn new_shared_progress() -> SharedProgress {
    Arc::new(RwLock::new(RunProgress::default()))
}

/// Sample CPU and memory usage using sysinfo.
pub fn sample_system_load() -> SystemLoad {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let mem_usage_percent = if total_memory > 0 {
        (sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    SystemLoad {
        cpu_usage_percent: sys.global_cpu_usage(),
        mem_usage_percent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_lifecycle() {
        let mut progress = RunProgress::default();
        let a = PathBuf::from("/media/a.mkv");
        let b = PathBuf::from("/media/b.mkv");

        progress.job_started(a.clone(), 1, true);
        progress.job_started(b.clone(), 1, false);
        assert_eq!(progress.active.len(), 2);
        assert_eq!(progress.hardware_in_use(), 1);

        progress.job_progress(&a, 42.5);
        assert_eq!(progress.active[0].percent, Some(42.5));
        assert!(progress.status_line().contains("a.mkv 42.5%"));
        assert!(progress.status_line().contains("b.mkv starting"));

        progress.job_finished(&a);
        assert_eq!(progress.active.len(), 1);
        assert_eq!(progress.hardware_in_use(), 0);
    }

    #[test]
    fn test_restart_replaces_entry() {
        let mut progress = RunProgress::default();
        let a = PathBuf::from("/media/a.mkv");
        progress.job_started(a.clone(), 1, false);
        progress.job_progress(&a, 80.0);
        progress.job_started(a, 2, false);
        assert_eq!(progress.active.len(), 1);
        assert_eq!(progress.active[0].attempt, 2);
        assert_eq!(progress.active[0].percent, None);
    }

    #[test]
    fn test_system_load_in_range() {
        let load = sample_system_load();
        assert!(load.mem_usage_percent >= 0.0 && load.mem_usage_percent <= 100.0);
    }

    #[tokio::test]
    async fn test_shared_progress_defaults() {
        let shared = new_shared_progress();
        let snapshot = shared.read().await;
        assert!(snapshot.active.is_empty());
        assert_eq!(snapshot.completed, 0);
    }
}
