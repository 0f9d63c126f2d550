//! Auto-tuning module
//!
//! Detects hardware capabilities and sizes the stage worker pools when the
//! configuration leaves them at 0 (auto).

use sysinfo::System;

use crate::config::StageConfig;

/// Tuned stage sizes based on hardware detection
#[derive(Debug, Clone)]
pub struct TunedConfig {
    /// Workers of the incoming transaction stage
    pub transaction_workers: usize,
    /// Workers of the persistence stage
    pub persistence_workers: usize,
    /// Queue capacity per worker
    pub queue_size: usize,
    /// Detected CPU cores
    pub detected_cores: usize,
    /// Detected RAM in MB
    pub detected_ram_mb: u64,
}

impl Default for TunedConfig {
    fn default() -> Self {
        Self {
            transaction_workers: 2,
            persistence_workers: 1,
            queue_size: 1024,
            detected_cores: 4,
            detected_ram_mb: 8192,
        }
    }
}

/// Detect the number of available CPU cores
pub fn detect_cpu_cores() -> usize {
    let sys = System::new_all();
    sys.cpus().len().max(1)
}

/// Detect total RAM in megabytes
pub fn detect_ram_mb() -> u64 {
    let sys = System::new_all();
    sys.total_memory() / 1024 / 1024
}

/// Size the stages from detected hardware, keeping explicit settings.
///
/// Allocation strategy:
/// - transaction stage gets half the cores (min 1, max 16)
/// - persistence stage gets a quarter (min 1, max 4)
/// - queues grow with RAM up to 16k events per worker
pub fn auto_tune(stages: &StageConfig) -> TunedConfig {
    let cores = detect_cpu_cores();
    let ram_mb = detect_ram_mb();
    tune_for(stages, cores, ram_mb)
}

fn tune_for(stages: &StageConfig, cores: usize, ram_mb: u64) -> TunedConfig {
    let transaction_workers = match stages.transaction_workers {
        0 => (cores / 2).clamp(1, 16),
        n => n,
    };
    let persistence_workers = match stages.persistence_workers {
        0 => (cores / 4).clamp(1, 4),
        n => n,
    };

    // ~1k queued events per GB, never below the configured capacity
    let queue_size = ((ram_mb / 1024) as usize * 1000)
        .clamp(stages.queue_size, 16_384usize.max(stages.queue_size));

    let config = TunedConfig {
        transaction_workers,
        persistence_workers,
        queue_size,
        detected_cores: cores,
        detected_ram_mb: ram_mb,
    };

    tracing::info!(
        cores = cores,
        ram_mb = ram_mb,
        transaction_workers = config.transaction_workers,
        persistence_workers = config.persistence_workers,
        queue_size = config.queue_size,
        "Auto-tuned stages based on hardware"
    );

    config
}

/// Get a human-readable summary of the tuned configuration
pub fn tuning_summary(config: &TunedConfig) -> String {
    format!(
        "Detected: {} cores, {} MB RAM\n\
         Stages: {} transaction workers, {} persistence workers\n\
         Queues: {} events per worker",
        config.detected_cores,
        config.detected_ram_mb,
        config.transaction_workers,
        config.persistence_workers,
        config.queue_size,
    )
}
