//! Host load sampling for admission control.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use ae_core::types::LoadSnapshot;
use async_trait::async_trait;
use sysinfo::{Disks, System};
use tokio::process::Command;
use tracing::{debug, warn};

/// How long a GPU query may take before the reading is skipped.
const GPU_QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Source of [`LoadSnapshot`]s.
#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    async fn current_load(&self) -> LoadSnapshot;
}

/// Samples CPU, memory and disk through `sysinfo` and GPU memory through
/// `nvidia-smi` when it is installed.
pub struct SysinfoMonitor {
    system: Mutex<System>,
    disk_path: PathBuf,
    nvidia_smi: Option<String>,
}

impl SysinfoMonitor {
    pub fn new(disk_path: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        // CPU usage is a delta between two refreshes; prime the first one.
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
            disk_path: disk_path.into(),
            nvidia_smi: Some("nvidia-smi".into()),
        }
    }

    /// Skip the GPU reading entirely.
    pub fn without_gpu(mut self) -> Self {
        self.nvidia_smi = None;
        self
    }

    fn sample_host(&self) -> (f64, f64) {
        let mut system = self.system.lock().unwrap_or_else(|poisoned| {
            warn!("system monitor lock poisoned, recovering");
            poisoned.into_inner()
        });
        system.refresh_cpu();
        system.refresh_memory();
        let cpu = f64::from(system.global_cpu_info().cpu_usage());
        let mem = percent(system.used_memory(), system.total_memory());
        (cpu, mem)
    }

    async fn sample_gpu(&self) -> Option<f64> {
        let binary = self.nvidia_smi.as_deref()?;
        let child = Command::new(binary)
            .args([
                "--query-gpu=memory.used,memory.total",
                "--format=csv,noheader,nounits",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(GPU_QUERY_TIMEOUT, child).await {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(_)) | Ok(Err(_)) => return None,
            Err(_) => {
                debug!("gpu query timed out");
                return None;
            }
        };
        parse_gpu_memory(&String::from_utf8_lossy(&output.stdout))
    }
}

#[async_trait]
impl ResourceMonitor for SysinfoMonitor {
    async fn current_load(&self) -> LoadSnapshot {
        let (cpu, mem) = self.sample_host();
        let disk = disk_usage(&self.disk_path);
        let snapshot = LoadSnapshot::new(cpu, mem, disk);
        match self.sample_gpu().await {
            Some(gpu) => snapshot.with_gpu(gpu),
            None => snapshot,
        }
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    used as f64 / total as f64 * 100.0
}

/// Usage of the filesystem holding `path`: the disk with the longest mount
/// point that prefixes it.
fn disk_usage(path: &Path) -> f64 {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| {
            let total = disk.total_space();
            percent(total.saturating_sub(disk.available_space()), total)
        })
        .unwrap_or(0.0)
}

/// Highest memory usage over all GPUs in `nvidia-smi` CSV output
/// (`used, total` per line, MiB).
fn parse_gpu_memory(csv: &str) -> Option<f64> {
    csv.lines()
        .filter_map(|line| {
            let (used, total) = line.split_once(',')?;
            let used: f64 = used.trim().parse().ok()?;
            let total: f64 = total.trim().parse().ok()?;
            (total > 0.0).then(|| used / total * 100.0)
        })
        .reduce(f64::max)
}
