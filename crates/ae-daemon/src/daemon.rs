use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ae_core::config::Config;
use ae_harness::rate_limiter::{QuotaConfig, QuotaLimiter};
use ae_harness::tools::ToolRegistry;
use ae_telemetry::metrics::MetricsCollector;
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::monitor::SysinfoMonitor;
use crate::pipeline::PipelineBuilder;
use crate::registry::TaskRegistry;
use crate::scheduler::{Scheduler, SchedulerParts, SchedulerSettings};
use crate::store::LocalFileStore;

/// Periods of the housekeeping loops.
#[derive(Debug, Clone)]
pub struct DaemonIntervals {
    /// How often queue statistics are logged (default: 300s).
    pub stats_secs: u64,
    /// How often idle rate-limiter entries are dropped (default: 600s).
    pub prune_secs: u64,
}

impl Default for DaemonIntervals {
    fn default() -> Self {
        Self {
            stats_secs: 300,
            prune_secs: 600,
        }
    }
}

/// The engine process: one scheduler plus its housekeeping loops.
///
/// Runs until [`shutdown`](Self::shutdown) is called, then cancels
/// in-flight work and waits for workers to drain.
pub struct Daemon {
    config: Config,
    scheduler: Scheduler,
    intervals: DaemonIntervals,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Wire a daemon around already-built components.
    pub fn with_parts(config: Config, parts: SchedulerParts) -> Self {
        let settings = SchedulerSettings::from_config(&config);
        let intervals = DaemonIntervals {
            stats_secs: config.scheduler.stats_interval_secs.max(1),
            ..DaemonIntervals::default()
        };
        Self {
            scheduler: Scheduler::new(settings, parts),
            config,
            intervals,
            shutdown: CancellationToken::new(),
        }
    }

    /// Build the stock components from configuration: probe the tools,
    /// prepare the storage directories, and sample load through `sysinfo`.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        if config.features.batch_processing {
            warn!("features.batch_processing is not supported and will be ignored");
        }

        for dir in [
            &config.storage.inbox_dir,
            &config.storage.work_dir,
            &config.storage.media_dir,
        ] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create directory {dir}"))?;
        }

        let tools = ToolRegistry::from_config(&config.tools).await;
        if tools.usable().is_empty() {
            warn!("no processing tools available, every request will be rejected");
        }
        let planner = PipelineBuilder::from_config(&config, tools.usable());

        let disk_path = config
            .monitoring
            .disk_path
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(&config.storage.work_dir));
        let disk_path = std::fs::canonicalize(&disk_path).unwrap_or(disk_path);

        let parts = SchedulerParts {
            registry: Arc::new(TaskRegistry::new(config.storage.max_history_size)),
            limiter: Arc::new(QuotaLimiter::new(QuotaConfig::from(&config.rate_limiting))),
            planner,
            tools,
            monitor: Arc::new(SysinfoMonitor::new(disk_path)),
            store: Arc::new(LocalFileStore::from_config(&config.storage)),
            metrics: Arc::new(MetricsCollector::new()),
        };
        Ok(Self::with_parts(config, parts))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run until shutdown is requested. Returns whether every worker
    /// drained within the configured shutdown timeout.
    pub async fn run(&self) -> Result<bool> {
        info!(
            max_concurrent_tasks = self.scheduler.capacity(),
            stats_secs = self.intervals.stats_secs,
            prune_secs = self.intervals.prune_secs,
            "daemon starting"
        );
        let dispatcher = self.scheduler.start();
        let housekeeping = tokio::spawn(housekeeping_loop(
            self.scheduler.clone(),
            self.intervals.clone(),
            self.shutdown.clone(),
        ));

        self.shutdown.cancelled().await;
        info!("daemon shutdown requested");

        let drained = self
            .scheduler
            .shutdown(self.config.scheduler.shutdown_timeout())
            .await;
        if let Err(e) = dispatcher.await {
            warn!(error = %e, "scheduler loop ended abnormally");
        }
        housekeeping
            .await
            .context("housekeeping loop ended abnormally")?;

        info!(
            drained,
            metrics = %self.scheduler.metrics().export_json(),
            "daemon stopped"
        );
        Ok(drained)
    }
}

async fn housekeeping_loop(
    scheduler: Scheduler,
    intervals: DaemonIntervals,
    shutdown: CancellationToken,
) {
    let mut stats_interval = tokio::time::interval(Duration::from_secs(intervals.stats_secs));
    let mut prune_interval = tokio::time::interval(Duration::from_secs(intervals.prune_secs));

    // Consume the first immediate tick so loops don't fire at t=0.
    stats_interval.tick().await;
    prune_interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("housekeeping loop stopping");
                break;
            }
            _ = stats_interval.tick() => {
                let stats = scheduler.stats();
                info!(
                    queued = stats.queued,
                    running = stats.running,
                    paused = stats.paused,
                    available_slots = stats.available_slots,
                    succeeded = stats.succeeded,
                    failed = stats.failed,
                    cancelled = stats.cancelled,
                    completed_last_24h = stats.completed_last_24h,
                    "queue stats"
                );
            }
            _ = prune_interval.tick() => {
                let pruned = scheduler.limiter().prune_idle();
                if pruned > 0 {
                    debug!(pruned, "dropped idle rate-limit entries");
                }
            }
        }
    }
}
