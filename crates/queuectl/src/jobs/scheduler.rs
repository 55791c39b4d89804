//! Deferred requeues of failed jobs.
//!
//! Every retry waiting out its backoff is registered here, so the pool can list
//! and cancel them. A cancelled requeue leaves the job `failed`; the next pool
//! start rebuilds the schedule from the store with [`RetryScheduler::recover`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::jobs::model::Transition;
use crate::jobs::repo::JobsRepo;
use crate::jobs::retry::{backoff_delay, MAX_DELAY};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduledRequeue {
    pub job_id: String,
    pub due_at: DateTime<Utc>,
}

struct Entry {
    seq: u64,
    due_at: DateTime<Utc>,
    cancel: CancellationToken,
}

struct Inner {
    jobs: JobsRepo,
    shutdown: CancellationToken,
    pending: Mutex<HashMap<String, Entry>>,
    next_seq: AtomicU64,
}

#[derive(Clone)]
pub struct RetryScheduler {
    inner: Arc<Inner>,
}

impl RetryScheduler {
    /// Cancelling `shutdown` cancels every pending requeue.
    pub fn new(jobs: JobsRepo, shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs,
                shutdown,
                pending: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Requeue `job_id` once `delay` has elapsed. Replaces any earlier
    /// registration for the same job. Must be called inside a tokio runtime.
    pub fn schedule(&self, job_id: &str, delay: Duration) {
        if self.inner.shutdown.is_cancelled() {
            tracing::debug!(job_id, "scheduler stopped, leaving job failed for recovery");
            return;
        }

        let delay = delay.min(MAX_DELAY);
        let due_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let cancel = self.inner.shutdown.child_token();

        let previous = self.inner.pending.lock().insert(
            job_id.to_string(),
            Entry {
                seq,
                due_at,
                cancel: cancel.clone(),
            },
        );
        if let Some(prev) = previous {
            prev.cancel.cancel();
        }

        let inner = self.inner.clone();
        let job_id = job_id.to_string();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            {
                let mut pending = inner.pending.lock();
                if pending.get(&job_id).map(|e| e.seq) == Some(seq) {
                    pending.remove(&job_id);
                }
            }

            match inner.jobs.requeue_failed(&job_id).await {
                Ok(Transition::Applied(_)) => {
                    tracing::info!(job_id = %job_id, "requeued failed job after backoff");
                }
                Ok(Transition::Unchanged(job)) => {
                    tracing::debug!(job_id = %job_id, state = %job.state, "requeue skipped");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "deferred requeue failed");
                }
            }
        });
    }

    /// Drop a pending requeue. Returns whether one was registered.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.inner.pending.lock().remove(job_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Pending requeues, soonest first.
    pub fn pending(&self) -> Vec<ScheduledRequeue> {
        let mut out: Vec<ScheduledRequeue> = self
            .inner
            .pending
            .lock()
            .iter()
            .map(|(job_id, entry)| ScheduledRequeue {
                job_id: job_id.clone(),
                due_at: entry.due_at,
            })
            .collect();
        out.sort_by(|a, b| a.due_at.cmp(&b.due_at).then_with(|| a.job_id.cmp(&b.job_id)));
        out
    }

    pub fn len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-register requeues for jobs left `failed` by a previous run, due at
    /// their last failure plus the backoff for their attempt count.
    pub async fn recover(&self, backoff_base: f64) -> Result<usize> {
        let failed = self.inner.jobs.list_failed().await?;
        let now = Utc::now();

        for job in &failed {
            let backoff = backoff_delay(job.attempts, backoff_base);
            let due_at = job.updated_at
                + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::days(1));
            let remaining = (due_at - now).to_std().unwrap_or(Duration::ZERO);
            self.schedule(&job.id, remaining);
        }

        Ok(failed.len())
    }

    /// Cancel every pending requeue and refuse new ones. Returns how many were
    /// cancelled.
    pub fn shutdown(&self) -> usize {
        self.inner.shutdown.cancel();
        let drained: Vec<Entry> = self.inner.pending.lock().drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.cancel.cancel();
        }
        drained.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}
