//! Long-running worker service shared by `queuectl worker start` and the
//! `queuectl-worker` daemon.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::config::Config;
use crate::jobs::{JobsRepo, ShellExecutor, WorkerPool};
use crate::settings::SettingsRepo;

/// Run `count` workers (plus the admin API when configured) until `shutdown`
/// is cancelled. Returns `true` when every worker stopped within the grace
/// period.
pub async fn run_workers(
    cfg: &Config,
    db: SqlitePool,
    count: usize,
    shutdown: CancellationToken,
) -> anyhow::Result<bool> {
    let jobs = JobsRepo::new(db.clone()).with_lease_seconds(cfg.lease_seconds);
    let settings = SettingsRepo::new(db);

    let mut pool = WorkerPool::new(
        jobs.clone(),
        settings,
        Arc::new(ShellExecutor::default()),
        cfg.pool_config(),
    );
    pool.start(count).await?;

    let api_handle = match cfg.admin_addr.clone() {
        Some(addr) => {
            let app = api::router(ApiState {
                jobs,
                retries: Some(pool.retries().clone()),
                activity: pool.activity(),
            });
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!(%addr, "admin api listening");

            let api_shutdown = shutdown.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { api_shutdown.cancelled().await })
                    .await
            }))
        }
        None => None,
    };

    shutdown.cancelled().await;
    tracing::info!("waiting for workers to finish current jobs");
    let clean = pool.stop().await;

    if let Some(handle) = api_handle {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "admin api exited with error"),
            Err(e) => tracing::warn!(error = %e, "admin api task failed"),
        }
    }

    Ok(clean)
}
