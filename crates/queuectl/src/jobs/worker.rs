use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::jobs::executor::{ExecError, Executor};
use crate::jobs::model::Job;
use crate::jobs::repo::JobsRepo;
use crate::jobs::retry::{decide, RetryDecision};
use crate::jobs::scheduler::RetryScheduler;
use crate::settings::{SettingsRepo, DEFAULT_BACKOFF_BASE};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What happened to one claimed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Retrying { attempts: i32, delay: Duration },
    Dead { attempts: i32 },
    /// The store rejected the report (lease lost or storage fault). The job is
    /// left to lease expiry.
    Abandoned,
}

pub struct Worker {
    id: String,
    jobs: JobsRepo,
    settings: SettingsRepo,
    executor: Arc<dyn Executor>,
    retries: RetryScheduler,
    shutdown: CancellationToken,
    busy: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        jobs: JobsRepo,
        settings: SettingsRepo,
        executor: Arc<dyn Executor>,
        retries: RetryScheduler,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id: id.into(),
            jobs,
            settings,
            executor,
            retries,
            shutdown,
            busy: Arc::new(AtomicBool::new(false)),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Set while a command is executing.
    pub fn busy_flag(&self) -> Arc<AtomicBool> {
        self.busy.clone()
    }

    /// Claim → execute → report until the shutdown token is cancelled.
    ///
    /// The token is checked between jobs only; a running command is always
    /// allowed to finish and report.
    pub async fn run(self) {
        tracing::info!(worker_id = %self.id, "worker started");

        while !self.shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(Some(_)) => {}
                Ok(None) => self.idle().await,
                Err(e) => {
                    tracing::warn!(worker_id = %self.id, error = %e, "claim failed");
                    self.idle().await;
                }
            }
        }

        tracing::info!(worker_id = %self.id, "worker stopped");
    }

    /// Claim and fully process at most one job.
    pub async fn run_once(&self) -> Result<Option<Outcome>> {
        let Some(job) = self.jobs.claim(&self.id).await? else {
            return Ok(None);
        };

        self.busy.store(true, Ordering::SeqCst);
        let outcome = self.process(&job).await;
        self.busy.store(false, Ordering::SeqCst);

        Ok(Some(outcome))
    }

    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    async fn process(&self, job: &Job) -> Outcome {
        tracing::info!(
            worker_id = %self.id,
            job_id = %job.id,
            command = %job.command,
            attempt = job.attempts + 1,
            max_retries = job.max_retries,
            "processing job"
        );

        match self.executor.execute(&job.command).await {
            Ok(output) => match self.jobs.complete(&job.id, &self.id).await {
                Ok(_) => {
                    tracing::info!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        stdout_bytes = output.stdout.len(),
                        "job completed"
                    );
                    Outcome::Completed
                }
                Err(e) => {
                    tracing::warn!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        error = %e,
                        "could not record completion"
                    );
                    Outcome::Abandoned
                }
            },
            Err(err) => self.on_failure(job, err).await,
        }
    }

    async fn on_failure(&self, job: &Job, err: ExecError) -> Outcome {
        let failed = match self.jobs.fail(&job.id, &self.id, Some(err.message.as_str())).await {
            Ok(failed) => failed,
            Err(e) => {
                tracing::warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    error = %e,
                    "could not record failure"
                );
                return Outcome::Abandoned;
            }
        };

        let backoff_base = match self.settings.backoff_base().await {
            Ok(base) => base,
            Err(e) => {
                tracing::warn!(error = %e, "backoff-base unreadable, using default");
                DEFAULT_BACKOFF_BASE
            }
        };

        match decide(failed.attempts, failed.max_retries, backoff_base) {
            RetryDecision::Retry { delay } => {
                tracing::info!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    attempt = failed.attempts,
                    max_retries = failed.max_retries,
                    delay_secs = delay.as_secs_f64(),
                    error = %err,
                    "job failed, retry scheduled"
                );
                self.retries.schedule(&job.id, delay);
                Outcome::Retrying {
                    attempts: failed.attempts,
                    delay,
                }
            }
            RetryDecision::Dead => {
                tracing::warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    attempts = failed.attempts,
                    error = %err,
                    "job moved to DLQ"
                );
                Outcome::Dead {
                    attempts: failed.attempts,
                }
            }
        }
    }
}
