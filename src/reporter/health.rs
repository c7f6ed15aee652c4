// Host health-check script: tri-state result with a hard timeout

use crate::models::HealthCheckResult;
use crate::script::ScriptRunner;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct HealthChecker {
    script: Option<PathBuf>,
    runner: Arc<dyn ScriptRunner>,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(script: Option<PathBuf>, runner: Arc<dyn ScriptRunner>, timeout: Duration) -> Self {
        Self {
            script,
            runner,
            timeout,
        }
    }

    /// Exit 0 is Success, 1 is Failure. Anything else, including a missing or
    /// non-executable script and a timeout, is Ignore.
    pub async fn check(&self) -> HealthCheckResult {
        let Some(path) = &self.script else {
            return HealthCheckResult::Ignore;
        };
        let meta = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, script = %path.display(), "health check script not accessible");
                return HealthCheckResult::Ignore;
            }
        };
        if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
            debug!(script = %path.display(), "health check script is not an executable file");
            return HealthCheckResult::Ignore;
        }
        let program = path.to_string_lossy().into_owned();
        match self.runner.run(&program, &[], self.timeout).await {
            Ok(out) => match out.status {
                Some(0) => HealthCheckResult::Success,
                Some(1) => HealthCheckResult::Failure,
                status => {
                    debug!(?status, "health check exited with unexpected status");
                    HealthCheckResult::Ignore
                }
            },
            Err(e) => {
                warn!(error = %e, operation = "health_check", "health check script failed to run");
                HealthCheckResult::Ignore
            }
        }
    }
}
