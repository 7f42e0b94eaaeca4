//! Concurrency planning.
//!
//! Derives worker slots, hardware encoder slots and encoder threads per job
//! from the core count, configuration and storage type.

use crate::advisor::effective_hardware;
use crate::config::{Config, GpuType};

/// Concurrency plan for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Target number of threads to use based on utilization
    pub target_threads: u32,
    /// Maximum number of encodes running at once
    pub worker_slots: u32,
    /// Concurrent hardware encoder sessions; 0 when encoding in software
    pub hardware_slots: u32,
    /// Encoder threads given to each software job
    pub threads_per_job: u32,
    /// Whether worker slots were capped because of network storage
    pub network_limited: bool,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration.
    ///
    /// - Core count comes from config or `num_cpus`.
    /// - Worker slots: explicit value, else 1 below 8 cores, 2 below 24, 3 otherwise;
    ///   capped at `network_max_jobs` when `network_storage` is set.
    /// - Hardware slots: explicit value, else the vendor's session limit. Zero when the
    ///   target codec has no encoder for the selected GPU.
    /// - `target_cpu_utilization` is clamped to [0.5, 1.0].
    pub fn derive(cfg: &Config, network_storage: bool) -> Self {
        let total_cores = cfg
            .cpu
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32)
            .max(1);

        let utilization = clamp_utilization(cfg.cpu.target_cpu_utilization);
        let target_threads = ((total_cores as f32) * utilization).round().max(1.0) as u32;

        let mut worker_slots = if cfg.concurrency.max_concurrent_jobs > 0 {
            cfg.concurrency.max_concurrent_jobs
        } else {
            derive_worker_slots(total_cores)
        };

        let network_limited =
            network_storage && worker_slots > cfg.concurrency.network_max_jobs.max(1);
        if network_storage {
            worker_slots = worker_slots.min(cfg.concurrency.network_max_jobs.max(1));
        }

        let hardware_slots =
            match effective_hardware(cfg.quality.target_codec, cfg.hardware.selected()) {
                Some(_) if cfg.concurrency.hardware_slots > 0 => cfg.concurrency.hardware_slots,
                Some(gpu) => vendor_session_limit(gpu),
                None => 0,
            };

        let threads_per_job = (target_threads / worker_slots).max(1);

        Self {
            total_cores,
            target_threads,
            worker_slots,
            hardware_slots,
            threads_per_job,
            network_limited,
        }
    }
}

/// 1 worker below 8 cores, 2 below 24, 3 otherwise.
fn derive_worker_slots(cores: u32) -> u32 {
    if cores < 8 {
        1
    } else if cores < 24 {
        2
    } else {
        3
    }
}

/// Concurrent encode sessions a consumer GPU of this vendor accepts.
fn vendor_session_limit(gpu: GpuType) -> u32 {
    match gpu {
        GpuType::Nvidia | GpuType::Intel => 2,
        GpuType::Amd | GpuType::Videotoolbox => 1,
    }
}

/// Clamp utilization to valid range [0.5, 1.0]
fn clamp_utilization(util: f32) -> f32 {
    util.clamp(0.5, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConcurrencyConfig, CpuConfig, HardwareConfig, TargetCodec};
    use proptest::prelude::*;

    fn config(cores: u32) -> Config {
        Config {
            cpu: CpuConfig {
                logical_cores: Some(cores),
                target_cpu_utilization: 0.85,
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_hardware_slots_by_vendor() {
        let mut cfg = config(16);
        assert_eq!(ConcurrencyPlan::derive(&cfg, false).hardware_slots, 0);

        cfg.hardware = HardwareConfig {
            enabled: true,
            gpu_type: GpuType::Nvidia,
        };
        assert_eq!(ConcurrencyPlan::derive(&cfg, false).hardware_slots, 2);

        cfg.hardware.gpu_type = GpuType::Amd;
        assert_eq!(ConcurrencyPlan::derive(&cfg, false).hardware_slots, 1);

        cfg.concurrency.hardware_slots = 4;
        assert_eq!(ConcurrencyPlan::derive(&cfg, false).hardware_slots, 4);
    }

    #[test]
    fn test_no_hardware_slots_without_hardware_encoder() {
        let mut cfg = config(16);
        cfg.quality.target_codec = TargetCodec::Av1;
        cfg.hardware = HardwareConfig {
            enabled: true,
            gpu_type: GpuType::Videotoolbox,
        };
        assert_eq!(ConcurrencyPlan::derive(&cfg, false).hardware_slots, 0);
    }

    #[test]
    fn test_network_storage_caps_workers() {
        let mut cfg = config(32);
        let plan = ConcurrencyPlan::derive(&cfg, true);
        assert_eq!(plan.worker_slots, 1);
        assert!(plan.network_limited);

        cfg.concurrency = ConcurrencyConfig {
            max_concurrent_jobs: 4,
            network_max_jobs: 2,
            ..ConcurrencyConfig::default()
        };
        let plan = ConcurrencyPlan::derive(&cfg, true);
        assert_eq!(plan.worker_slots, 2);

        let plan = ConcurrencyPlan::derive(&cfg, false);
        assert_eq!(plan.worker_slots, 4);
        assert!(!plan.network_limited);
    }

    // Worker slots follow the core-count tiers and threads split evenly.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_worker_slot_derivation(cores in 1u32..256) {
            let plan = ConcurrencyPlan::derive(&config(cores), false);

            prop_assert_eq!(plan.total_cores, cores);
            let expected = if cores < 8 { 1 } else if cores < 24 { 2 } else { 3 };
            prop_assert_eq!(
                plan.worker_slots, expected,
                "For {} cores, expected {} slots but got {}",
                cores, expected, plan.worker_slots
            );
            prop_assert!(plan.threads_per_job >= 1);
            prop_assert!(plan.threads_per_job * plan.worker_slots <= plan.target_threads.max(plan.worker_slots));
        }
    }

    // Explicit job counts are used unchanged on local storage.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_explicit_jobs_override(cores in 1u32..256, jobs in 1u32..16) {
            let mut cfg = config(cores);
            cfg.concurrency.max_concurrent_jobs = jobs;
            prop_assert_eq!(ConcurrencyPlan::derive(&cfg, false).worker_slots, jobs);
        }
    }

    // Utilization is clamped to [0.5, 1.0] before computing target threads.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_utilization_clamping(cores in 1u32..256, raw in -1.0f32..3.0) {
            let mut cfg = config(cores);
            cfg.cpu.target_cpu_utilization = raw;
            let plan = ConcurrencyPlan::derive(&cfg, false);

            let expected = ((cores as f32) * raw.clamp(0.5, 1.0)).round().max(1.0) as u32;
            prop_assert_eq!(plan.target_threads, expected);
            prop_assert!(plan.target_threads <= cores);
        }
    }
}
