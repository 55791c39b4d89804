use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::jobs::executor::Executor;
use crate::jobs::repo::JobsRepo;
use crate::jobs::scheduler::RetryScheduler;
use crate::jobs::worker::{Worker, DEFAULT_POLL_INTERVAL};
use crate::settings::SettingsRepo;

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Idle sleep between empty claims.
    pub poll_interval: Duration,
    /// How often expired leases are returned to `pending`.
    pub reap_interval: Duration,
    /// How long `stop` waits for in-flight jobs.
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            reap_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Read-only view of which workers are executing a command right now.
#[derive(Clone, Default)]
pub struct ActivityGauge {
    flags: Arc<RwLock<Vec<Arc<AtomicBool>>>>,
}

impl ActivityGauge {
    fn track(&self, flag: Arc<AtomicBool>) {
        self.flags.write().push(flag);
    }

    /// Busy workers. Each flag is read independently, so this is approximate.
    pub fn active(&self) -> usize {
        self.flags
            .read()
            .iter()
            .filter(|f| f.load(Ordering::Relaxed))
            .count()
    }

    pub fn total(&self) -> usize {
        self.flags.read().len()
    }
}

pub struct WorkerPool {
    jobs: JobsRepo,
    settings: SettingsRepo,
    executor: Arc<dyn Executor>,
    config: PoolConfig,
    instance: String,
    shutdown: CancellationToken,
    retries: RetryScheduler,
    activity: ActivityGauge,
    worker_ids: Vec<String>,
    handles: Vec<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        jobs: JobsRepo,
        settings: SettingsRepo,
        executor: Arc<dyn Executor>,
        config: PoolConfig,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let retries = RetryScheduler::new(jobs.clone(), shutdown.child_token());

        // distinguishes this pool's leases from other processes sharing the store
        let mut instance = Uuid::new_v4().simple().to_string();
        instance.truncate(8);

        Self {
            jobs,
            settings,
            executor,
            config,
            instance,
            shutdown,
            retries,
            activity: ActivityGauge::default(),
            worker_ids: Vec::new(),
            handles: Vec::new(),
            reaper: None,
        }
    }

    /// Spawn `count` workers. The first call also starts the lease reaper and
    /// re-registers backoff requeues for jobs a previous run left `failed`.
    pub async fn start(&mut self, count: usize) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(QueueError::Validation(
                "worker pool has been stopped".into(),
            ));
        }

        if self.handles.is_empty() {
            let backoff_base = self.settings.backoff_base().await?;
            let recovered = self.retries.recover(backoff_base).await?;
            if recovered > 0 {
                tracing::info!(recovered, "rescheduled requeues for failed jobs");
            }
            self.reaper = Some(self.spawn_reaper());
        }

        for _ in 0..count {
            let id = format!("worker-{}-{}", self.worker_ids.len() + 1, self.instance);
            let worker = Worker::new(
                id.clone(),
                self.jobs.clone(),
                self.settings.clone(),
                self.executor.clone(),
                self.retries.clone(),
                self.shutdown.clone(),
            )
            .with_poll_interval(self.config.poll_interval);

            self.activity.track(worker.busy_flag());
            self.handles.push(tokio::spawn(worker.run()));
            self.worker_ids.push(id);
        }

        tracing::info!(count, total = self.worker_ids.len(), "workers started");
        Ok(())
    }

    fn spawn_reaper(&self) -> JoinHandle<()> {
        let jobs = self.jobs.clone();
        let shutdown = self.shutdown.clone();
        let every = self.config.reap_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }

                match jobs.reap_expired_leases().await {
                    Ok(n) if n > 0 => tracing::info!(reaped = n, "reclaimed expired leases"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "lease reaper failed"),
                }
            }
        })
    }

    /// Signal every worker to stop after its current job, cancel pending
    /// requeues, and wait up to the grace period. Returns `true` if every loop
    /// exited in time; stragglers keep running detached until they finish.
    pub async fn stop(&mut self) -> bool {
        self.shutdown.cancel();
        let cancelled = self.retries.shutdown();
        tracing::info!(
            workers = self.handles.len(),
            cancelled_requeues = cancelled,
            "stopping workers"
        );

        let handles = std::mem::take(&mut self.handles);
        let reaper = self.reaper.take();

        let joined = async move {
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "worker task panicked");
                }
            }
            if let Some(reaper) = reaper {
                let _ = reaper.await;
            }
        };

        match tokio::time::timeout(self.config.shutdown_grace, joined).await {
            Ok(()) => {
                tracing::info!("all workers stopped");
                true
            }
            Err(_) => {
                tracing::warn!(
                    grace_ms = self.config.shutdown_grace.as_millis() as u64,
                    "grace period elapsed with jobs still in flight"
                );
                false
            }
        }
    }

    /// Workers currently executing a command.
    pub fn active_count(&self) -> usize {
        self.activity.active()
    }

    pub fn activity(&self) -> ActivityGauge {
        self.activity.clone()
    }

    pub fn retries(&self) -> &RetryScheduler {
        &self.retries
    }

    pub fn worker_ids(&self) -> &[String] {
        &self.worker_ids
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.handles.is_empty()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
