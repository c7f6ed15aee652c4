// Refuse to start a VM on a volume that another host is still writing to

use crate::error::AgentError;
use crate::models::DiskActivitySettings;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

async fn millis_since_modified(path: &Path) -> Result<(u64, u64), AgentError> {
    let meta = tokio::fs::metadata(path).await.map_err(|e| {
        AgentError::operation(format!(
            "unable to check physical disk file {} for activity: {}",
            path.display(),
            e
        ))
    })?;
    let modified = meta.modified().map_err(|e| {
        AgentError::operation(format!("no modification time for {}: {}", path.display(), e))
    })?;
    let since = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    Ok((since.as_millis() as u64, meta.len()))
}

/// Succeeds once the file has been idle for longer than the inactivity threshold.
/// Files under the minimum size are exempt. Gives up after the configured timeout.
pub async fn check_volume_activity(
    path: &Path,
    settings: &DiskActivitySettings,
) -> Result<(), AgentError> {
    check_with_interval(path, settings, POLL_INTERVAL).await
}

pub(crate) async fn check_with_interval(
    path: &Path,
    settings: &DiskActivitySettings,
    poll: Duration,
) -> Result<(), AgentError> {
    let (_, size) = millis_since_modified(path).await?;
    if size < settings.min_file_size_bytes {
        debug!(path = %path.display(), size, "volume below activity check size, skipping");
        return Ok(());
    }
    let deadline = Instant::now() + Duration::from_secs(settings.timeout_secs);
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let (idle_ms, _) = millis_since_modified(path).await?;
        if idle_ms > settings.inactive_threshold_ms {
            debug!(path = %path.display(), idle_ms, "disk activity check cleared");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(AgentError::operation(format!(
                "volume {} was modified {} ms ago (threshold {} ms); it may be in use on another host",
                path.display(),
                idle_ms,
                settings.inactive_threshold_ms
            )));
        }
    }
}
