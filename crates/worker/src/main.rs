use queuectl::config;
use queuectl::db;
use queuectl::service;
use queuectl::shutdown;
use queuectl::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init("info");

    let cfg = config::Config::from_env()?;

    tracing::info!(
        database_url = %cfg.database_url,
        workers = cfg.worker_count,
        lease_seconds = cfg.lease_seconds,
        poll_interval_ms = cfg.poll_interval_ms,
        reap_interval_ms = cfg.reap_interval_ms,
        admin_addr = cfg.admin_addr.as_deref().unwrap_or("disabled"),
        "queuectl worker starting"
    );

    let pool = db::connect(&cfg.database_url).await?;
    let token = shutdown::install_shutdown_handler();

    let clean = service::run_workers(&cfg, pool, cfg.worker_count, token).await?;
    if clean {
        tracing::info!("all workers stopped");
    } else {
        tracing::warn!("shutdown grace elapsed with jobs still running; their leases will expire");
    }

    Ok(())
}
