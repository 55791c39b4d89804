use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Fresh migrated store in its own temp directory. Keep the `TempDir` alive
/// for the duration of the test.
pub async fn setup_db() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let url = format!("sqlite://{}", dir.path().join("queue.db").display());

    let pool = queuectl::db::connect(&url)
        .await
        .expect("failed to open test store");

    (pool, dir)
}

/// Pretend the current lease on `job_id` was granted `minutes` ago.
#[allow(dead_code)]
pub async fn backdate_lease(pool: &SqlitePool, job_id: &str, minutes: i64) {
    let at = Utc::now() - chrono::Duration::minutes(minutes);

    sqlx::query("UPDATE jobs SET locked_at = ?1 WHERE id = ?2 AND locked_at IS NOT NULL")
        .bind(at)
        .bind(job_id)
        .execute(pool)
        .await
        .expect("failed to backdate lease");
}

/// Poll `check` every 25ms until it holds, panicking after `timeout`.
#[allow(dead_code)]
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
