// src/utils/system.rs: System functions

use std::time::Duration;

use log::debug;
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::time::sleep;


/// Determines number of cores that can be used for CPU based tasks
///
/// # Arguments
///
/// * `max_threads` - Upper bound requested by the user or settings.
///
/// # Returns
///
/// (usable cores, current cpu usage in percent)
pub async fn detect_cores_and_load(max_threads: usize) -> (usize, f32) {
    let refresh_kind = RefreshKind::nothing().with_cpu(CpuRefreshKind::nothing().with_cpu_usage());
    let mut system = System::new_with_specifics(refresh_kind);
    system.refresh_cpu_usage();
    // usage is a delta between two refreshes
    sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL.max(Duration::from_millis(100))).await;
    system.refresh_cpu_usage();

    let physical_cores = System::physical_core_count().unwrap_or(1).max(1);
    let cpu_load = system.global_cpu_usage();
    debug!("{} physical cores, {:.1}% load", physical_cores, cpu_load);
    (physical_cores.min(max_threads.max(1)), cpu_load)
}


/// Splits the usable cores between concurrent sample workers and threads per tool call.
///
/// # Arguments
///
/// * `cores` - Usable cores from detect_cores_and_load.
/// * `cpu_load` - Current load in percent; above 50% only half the cores are used.
/// * `samples` - Number of samples that will be processed.
///
/// # Returns
///
/// (workers, threads per job)
pub fn compute_sample_workers(cores: usize, cpu_load: f32, samples: usize) -> (usize, usize) {
    let usable = if cpu_load > 50.0 { cores / 2 } else { cores }.max(1);
    let workers = usable.min(samples.max(1));
    let job_threads = (usable / workers).max(1);
    (workers, job_threads)
}
