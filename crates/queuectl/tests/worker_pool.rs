mod common;

use common::{setup_db, wait_until};

use queuectl::jobs::executor::BoxFuture;
use queuectl::jobs::{
    ExecError, ExecOutput, Executor, JobState, JobsRepo, NewJob, Outcome, PoolConfig,
    RetryScheduler, Worker, WorkerPool,
};
use queuectl::settings::{SettingsRepo, BACKOFF_BASE};
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// `fail...` fails, `sleep-ms N` sleeps N ms then succeeds, anything else succeeds.
struct ScriptedExecutor;

impl Executor for ScriptedExecutor {
    fn execute<'a>(&'a self, command: &'a str) -> BoxFuture<'a, Result<ExecOutput, ExecError>> {
        Box::pin(async move {
            if let Some(ms) = command.strip_prefix("sleep-ms ") {
                let ms: u64 = ms.parse().expect("bad sleep-ms");
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if command.starts_with("fail") {
                return Err(ExecError::new(format!("{command}: scripted failure")));
            }
            Ok(ExecOutput {
                stdout: command.to_string(),
                stderr: String::new(),
            })
        })
    }
}

fn test_worker(jobs: &JobsRepo, settings: &SettingsRepo, retries: &RetryScheduler) -> Worker {
    Worker::new(
        "worker-test",
        jobs.clone(),
        settings.clone(),
        Arc::new(ScriptedExecutor),
        retries.clone(),
        CancellationToken::new(),
    )
}

fn fast_pool_config() -> PoolConfig {
    PoolConfig {
        poll_interval: Duration::from_millis(20),
        reap_interval: Duration::from_millis(200),
        shutdown_grace: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn run_once_without_work_returns_none() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());
    let settings = SettingsRepo::new(pool.clone());
    let retries = RetryScheduler::new(jobs.clone(), CancellationToken::new());

    let worker = test_worker(&jobs, &settings, &retries);
    assert_eq!(worker.run_once().await.unwrap(), None);
}

#[tokio::test]
async fn run_once_completes_successful_job() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());
    let settings = SettingsRepo::new(pool.clone());
    let retries = RetryScheduler::new(jobs.clone(), CancellationToken::new());

    jobs.enqueue(NewJob::command("echo ok").with_id("j1"))
        .await
        .unwrap();

    let worker = test_worker(&jobs, &settings, &retries);
    assert_eq!(worker.run_once().await.unwrap(), Some(Outcome::Completed));

    let job = jobs.get_job("j1").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert!(job.locked_by.is_none());
    assert!(retries.is_empty());
}

#[tokio::test]
async fn run_once_schedules_backoff_for_failure() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());
    let settings = SettingsRepo::new(pool.clone());
    let retries = RetryScheduler::new(jobs.clone(), CancellationToken::new());

    jobs.enqueue(NewJob::command("fail now").with_id("j1"))
        .await
        .unwrap();

    let worker = test_worker(&jobs, &settings, &retries);
    let outcome = worker.run_once().await.unwrap();
    assert_eq!(
        outcome,
        Some(Outcome::Retrying {
            attempts: 1,
            delay: Duration::from_secs(2)
        })
    );

    let job = jobs.get_job("j1").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("fail now: scripted failure"));

    let pending = retries.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].job_id, "j1");

    // not eligible while waiting out the backoff
    assert_eq!(worker.run_once().await.unwrap(), None);

    assert!(retries.cancel("j1"));
    assert!(retries.is_empty());
}

#[tokio::test]
async fn run_once_moves_exhausted_job_to_dlq() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());
    let settings = SettingsRepo::new(pool.clone());
    let retries = RetryScheduler::new(jobs.clone(), CancellationToken::new());

    jobs.enqueue(
        NewJob::command("fail hard")
            .with_id("j1")
            .with_max_retries(1),
    )
    .await
    .unwrap();

    let worker = test_worker(&jobs, &settings, &retries);
    assert_eq!(
        worker.run_once().await.unwrap(),
        Some(Outcome::Dead { attempts: 1 })
    );

    let dlq = jobs.list_dlq().await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].id, "j1");
    assert!(retries.is_empty());
}

#[tokio::test]
async fn scheduler_requeues_after_delay() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());
    let retries = RetryScheduler::new(jobs.clone(), CancellationToken::new());

    jobs.enqueue(NewJob::command("false").with_id("j1"))
        .await
        .unwrap();
    jobs.claim("worker-a").await.unwrap().unwrap();
    jobs.fail("j1", "worker-a", None).await.unwrap();

    retries.schedule("j1", Duration::from_millis(50));
    assert_eq!(retries.len(), 1);

    let repo = jobs.clone();
    wait_until(Duration::from_secs(5), || {
        let repo = repo.clone();
        async move { repo.get_job("j1").await.unwrap().unwrap().state == JobState::Pending }
    })
    .await;

    assert!(retries.is_empty());
}

#[tokio::test]
async fn rescheduling_replaces_the_earlier_entry() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());
    let retries = RetryScheduler::new(jobs.clone(), CancellationToken::new());

    retries.schedule("j1", Duration::from_secs(60));
    retries.schedule("j1", Duration::from_secs(120));

    assert_eq!(retries.len(), 1);
    assert!(retries.cancel("j1"));
    assert!(!retries.cancel("j1"));
}

#[tokio::test]
async fn scheduler_shutdown_cancels_pending_requeues() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());
    let retries = RetryScheduler::new(jobs.clone(), CancellationToken::new());

    jobs.enqueue(NewJob::command("false").with_id("j1"))
        .await
        .unwrap();
    jobs.claim("worker-a").await.unwrap().unwrap();
    jobs.fail("j1", "worker-a", None).await.unwrap();

    retries.schedule("j1", Duration::from_millis(100));
    assert_eq!(retries.shutdown(), 1);
    assert!(retries.is_shut_down());

    // new registrations are refused after shutdown
    retries.schedule("j1", Duration::from_millis(1));
    assert!(retries.is_empty());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let job = jobs.get_job("j1").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed, "cancelled requeue must not fire");
}

#[tokio::test]
async fn recover_reschedules_failed_jobs_from_the_store() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());

    for id in ["a", "b"] {
        jobs.enqueue(NewJob::command("false").with_id(id))
            .await
            .unwrap();
        jobs.claim("worker-a").await.unwrap().unwrap();
        jobs.fail(id, "worker-a", None).await.unwrap();
    }

    // a fresh scheduler, as after a restart
    let retries = RetryScheduler::new(jobs.clone(), CancellationToken::new());
    assert_eq!(retries.recover(2.0).await.unwrap(), 2);

    let ids: Vec<String> = retries.pending().into_iter().map(|r| r.job_id).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(retries.shutdown(), 2);
}

#[tokio::test]
async fn recover_fires_overdue_requeues_immediately() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());

    jobs.enqueue(NewJob::command("false").with_id("overdue"))
        .await
        .unwrap();
    jobs.claim("worker-a").await.unwrap().unwrap();
    jobs.fail("overdue", "worker-a", None).await.unwrap();

    sqlx::query("UPDATE jobs SET updated_at = ?1 WHERE id = 'overdue'")
        .bind(chrono::Utc::now() - chrono::Duration::hours(1))
        .execute(&pool)
        .await
        .unwrap();

    let retries = RetryScheduler::new(jobs.clone(), CancellationToken::new());
    retries.recover(2.0).await.unwrap();

    let repo = jobs.clone();
    wait_until(Duration::from_secs(5), || {
        let repo = repo.clone();
        async move {
            repo.get_job("overdue").await.unwrap().unwrap().state == JobState::Pending
        }
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn pool_drains_queue_and_stops_cleanly() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());
    let settings = SettingsRepo::new(pool.clone());

    for i in 0..10 {
        jobs.enqueue(NewJob::command(format!("echo {i}")))
            .await
            .unwrap();
    }

    let mut workers = WorkerPool::new(
        jobs.clone(),
        settings,
        Arc::new(ScriptedExecutor),
        fast_pool_config(),
    );
    workers.start(3).await.unwrap();

    assert!(workers.is_running());
    assert_eq!(workers.worker_ids().len(), 3);
    assert!(workers.worker_ids()[0].starts_with("worker-1-"));

    let repo = jobs.clone();
    wait_until(Duration::from_secs(10), || {
        let repo = repo.clone();
        async move { repo.stats().await.unwrap().completed == 10 }
    })
    .await;

    assert!(workers.stop().await);
    assert!(!workers.is_running());
    assert_eq!(workers.active_count(), 0);

    let err = workers.start(1).await.unwrap_err();
    assert!(err.is_client_error());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn active_count_tracks_running_commands() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());
    let settings = SettingsRepo::new(pool.clone());

    jobs.enqueue(NewJob::command("sleep-ms 400").with_id("slow"))
        .await
        .unwrap();

    let mut workers = WorkerPool::new(
        jobs.clone(),
        settings,
        Arc::new(ScriptedExecutor),
        fast_pool_config(),
    );
    workers.start(2).await.unwrap();
    assert_eq!(workers.activity().total(), 2);

    let activity = workers.activity();
    wait_until(Duration::from_secs(5), || {
        let activity = activity.clone();
        async move { activity.active() == 1 }
    })
    .await;

    let repo = jobs.clone();
    wait_until(Duration::from_secs(5), || {
        let repo = repo.clone();
        async move { repo.stats().await.unwrap().completed == 1 }
    })
    .await;
    assert_eq!(workers.active_count(), 0);

    assert!(workers.stop().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn stop_lets_in_flight_job_finish() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());
    let settings = SettingsRepo::new(pool.clone());

    jobs.enqueue(NewJob::command("sleep-ms 300").with_id("busy"))
        .await
        .unwrap();

    let mut workers = WorkerPool::new(
        jobs.clone(),
        settings,
        Arc::new(ScriptedExecutor),
        fast_pool_config(),
    );
    workers.start(1).await.unwrap();

    let activity = workers.activity();
    wait_until(Duration::from_secs(5), || {
        let activity = activity.clone();
        async move { activity.active() == 1 }
    })
    .await;

    assert!(workers.stop().await, "job should finish inside the grace period");

    let job = jobs.get_job("busy").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn pool_retries_failures_until_dead() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());
    let settings = SettingsRepo::new(pool.clone());

    // base 1 keeps every backoff at one second
    settings.set(BACKOFF_BASE, "1").await.unwrap();
    jobs.enqueue(
        NewJob::command("fail always")
            .with_id("doomed")
            .with_max_retries(2),
    )
    .await
    .unwrap();

    let mut workers = WorkerPool::new(
        jobs.clone(),
        settings,
        Arc::new(ScriptedExecutor),
        fast_pool_config(),
    );
    workers.start(2).await.unwrap();

    let repo = jobs.clone();
    wait_until(Duration::from_secs(10), || {
        let repo = repo.clone();
        async move { repo.get_job("doomed").await.unwrap().unwrap().state == JobState::Dead }
    })
    .await;

    let job = jobs.get_job("doomed").await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    assert!(workers.retries().is_empty());

    assert!(workers.stop().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn stop_cancels_scheduled_retries() {
    let (pool, _dir) = setup_db().await;
    let jobs = JobsRepo::new(pool.clone());
    let settings = SettingsRepo::new(pool.clone());

    jobs.enqueue(NewJob::command("fail once").with_id("j1"))
        .await
        .unwrap();

    let mut workers = WorkerPool::new(
        jobs.clone(),
        settings,
        Arc::new(ScriptedExecutor),
        fast_pool_config(),
    );
    workers.start(1).await.unwrap();

    let retries = workers.retries().clone();
    wait_until(Duration::from_secs(5), || {
        let retries = retries.clone();
        async move { retries.len() == 1 }
    })
    .await;

    assert!(workers.stop().await);
    assert!(retries.is_empty());

    let job = jobs.get_job("j1").await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
}
