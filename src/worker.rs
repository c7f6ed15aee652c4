// Background status worker: periodic host reports for /ws/status plus baseline housekeeping.

use crate::models::HostStatusReport;
use crate::reporter::Reporter;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant, MissedTickBehavior, interval};
use tracing::Instrument;

/// Rate limit for the "no receivers" message (nobody on /ws/status is the common case).
const NO_RECEIVERS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Reporter, channels and shutdown for the worker.
pub struct WorkerDeps {
    pub reporter: Arc<Reporter>,
    pub tx: broadcast::Sender<HostStatusReport>,
    pub ws_status_connections: Arc<AtomicUsize>,
    pub reports_total: Arc<AtomicU64>,
    pub shutdown_rx: tokio::sync::oneshot::Receiver<()>,
}

/// Stats logging uses its own real-time interval, independent of sample_interval_ms.
pub struct WorkerConfig {
    pub sample_interval_ms: u64,
    pub stats_log_interval_secs: u64,
}

/// One collection pass: evict baselines of vanished VMs, then build a report.
pub async fn collect(reporter: &Reporter) -> Option<HostStatusReport> {
    match reporter.evict_missing().await {
        Ok(0) => {}
        Ok(n) => tracing::debug!(operation = "evict_missing", evicted = n, "stale baselines evicted"),
        Err(e) => tracing::warn!(error = %e, operation = "evict_missing", "baseline eviction failed"),
    }
    match reporter.status_report().await {
        Ok(report) => Some(report),
        Err(e) => {
            tracing::warn!(error = %e, operation = "status_report", "status report failed");
            None
        }
    }
}

pub fn spawn(deps: WorkerDeps, config: WorkerConfig) -> tokio::task::JoinHandle<()> {
    let WorkerDeps {
        reporter,
        tx,
        ws_status_connections,
        reports_total,
        mut shutdown_rx,
    } = deps;
    let WorkerConfig {
        sample_interval_ms,
        stats_log_interval_secs,
    } = config;

    let worker_span = tracing::span!(tracing::Level::DEBUG, "worker", sample_interval_ms);
    tokio::spawn(async move {
        let mut tick = interval(Duration::from_millis(sample_interval_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stats_log_tick = interval(Duration::from_secs(stats_log_interval_secs.max(1)));
        stats_log_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_no_receivers_log: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let Some(report) = collect(&reporter).await else {
                        continue;
                    };
                    reports_total.fetch_add(1, Ordering::Relaxed);
                    if tx.send(report).is_err() {
                        let should_log = last_no_receivers_log
                            .is_none_or(|t| t.elapsed() >= NO_RECEIVERS_LOG_INTERVAL);
                        if should_log {
                            tracing::debug!(
                                operation = "broadcast_report",
                                "No active WebSocket clients; broadcast channel has no receivers"
                            );
                            last_no_receivers_log = Some(Instant::now());
                        }
                    }
                }
                _ = &mut shutdown_rx => {
                    tracing::debug!("Worker shutting down");
                    break;
                }
                _ = stats_log_tick.tick() => {
                    tracing::info!(
                        ws_status_clients = ws_status_connections.load(Ordering::Relaxed),
                        reports_total = reports_total.load(Ordering::Relaxed),
                        tracked_vms = reporter.tracked_vms(),
                        "agent stats"
                    );
                }
            }
        }
    }.instrument(worker_span))
}
