use anyhow::Result;
use hostagent::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(LocalTimer)
        .with_env_filter(filter)
        .init();

    let agent_config = config::AgentConfig::load()?;
    let scripts = agent_config.scripts.resolve()?;
    tracing::info!(
        agent = %version::agent_version(),
        host_id = %agent_config.agent.host_id,
        "starting agent"
    );

    let runner: Arc<dyn script::ScriptRunner> = Arc::new(script::ProcessRunner);
    let hypervisor = agent::hypervisor_for(&agent_config, runner.clone());
    let agent = agent::Agent::assemble(&agent_config, &scripts, hypervisor, runner).await?;

    if let Some(bridge) = &agent_config.network.control_bridge
        && let Err(e) = agent.network.create_control_network(bridge).await
    {
        tracing::warn!(error = %e, operation = "create_control_network", bridge = %bridge, "control network setup failed");
    }

    let (tx, _) =
        broadcast::channel::<models::HostStatusReport>(agent_config.monitoring.broadcast_capacity);
    let ws_status_connections = Arc::new(AtomicUsize::new(0));
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let worker_handle = worker::spawn(
        worker::WorkerDeps {
            reporter: agent.reporter.clone(),
            tx: tx.clone(),
            ws_status_connections: ws_status_connections.clone(),
            reports_total: Arc::new(AtomicU64::new(0)),
            shutdown_rx,
        },
        worker::WorkerConfig {
            sample_interval_ms: agent_config.monitoring.sample_interval_ms,
            stats_log_interval_secs: agent_config.monitoring.stats_log_interval_secs,
        },
    );

    let app = routes::app(agent.app_state(tx, ws_status_connections));
    let addr = format!("{}:{}", agent_config.server.host, agent_config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{}", addr);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(_) => {
                        let _ = tokio::signal::ctrl_c().await;
                        return;
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
        } => {
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(());
            let _ = worker_handle.await;
        }
    }

    Ok(())
}
