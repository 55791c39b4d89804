// crates/queuectl/src/jobs/repo.rs

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sqlx::SqlitePool;

use crate::error::{QueueError, Result};
use crate::jobs::model::{Job, JobState, JobStats, NewJob, Transition};
use crate::settings::SettingsRepo;

/// Default lease: a processing job whose worker has not reported within this
/// window becomes claimable again.
pub const DEFAULT_LEASE_SECONDS: i64 = 5 * 60;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const GENERATED_ID_ATTEMPTS: usize = 5;

#[derive(Clone)]
pub struct JobsRepo {
    pool: SqlitePool,
    settings: SettingsRepo,
    lease: Duration,
}

impl JobsRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            settings: SettingsRepo::new(pool.clone()),
            pool,
            lease: Duration::seconds(DEFAULT_LEASE_SECONDS),
        }
    }

    pub fn with_lease_seconds(mut self, lease_seconds: i64) -> Self {
        self.lease = Duration::seconds(lease_seconds.max(1));
        self
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease
    }

    // ----------------------------
    // Enqueue
    // ----------------------------

    /// Inserts a new `pending` job.
    ///
    /// A missing or blank id is generated; a missing `max_retries` falls back
    /// to the `max-retries` setting.
    pub async fn enqueue(&self, new_job: NewJob) -> Result<Job> {
        let command = match new_job.command {
            Some(c) if !c.trim().is_empty() => c,
            _ => return Err(QueueError::Validation("command is required".into())),
        };

        let max_retries = match new_job.max_retries {
            Some(n) if n >= 1 => n,
            Some(n) => {
                return Err(QueueError::Validation(format!(
                    "max_retries must be >= 1, got {n}"
                )))
            }
            None => self.settings.max_retries().await?,
        };

        let supplied_id = new_job
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        if let Some(id) = supplied_id {
            return match self.insert(&id, &command, max_retries).await {
                Ok(job) => Ok(job),
                Err(e) if is_unique_violation(&e) => Err(QueueError::DuplicateId(id)),
                Err(e) => Err(e.into()),
            };
        }

        let mut last_id = String::new();
        for _ in 0..GENERATED_ID_ATTEMPTS {
            let id = generate_job_id(Utc::now());
            match self.insert(&id, &command, max_retries).await {
                Ok(job) => return Ok(job),
                Err(e) if is_unique_violation(&e) => {
                    tracing::debug!(job_id = %id, "generated job id collided, retrying");
                    last_id = id;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(QueueError::DuplicateId(last_id))
    }

    async fn insert(
        &self,
        id: &str,
        command: &str,
        max_retries: i32,
    ) -> std::result::Result<Job, sqlx::Error> {
        let now = Utc::now();

        sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (id, command, state, attempts, max_retries, created_at, updated_at)
            VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(command)
        .bind(max_retries)
        .bind(now)
        .fetch_one(&self.pool)
        .await
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// All jobs, newest first, optionally filtered by state.
    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let rows = match state {
            Some(st) => {
                sqlx::query_as::<_, Job>(
                    r#"
                    SELECT * FROM jobs
                    WHERE state = ?1
                    ORDER BY created_at DESC, rowid DESC
                    "#,
                )
                .bind(st)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Job>(
                    r#"
                    SELECT * FROM jobs
                    ORDER BY created_at DESC, rowid DESC
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows)
    }

    /// Dead jobs, most recently failed first.
    pub async fn list_dlq(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE state = 'dead'
            ORDER BY updated_at DESC, rowid DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Failed jobs waiting for their backoff, oldest failure first.
    pub async fn list_failed(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, Job>(
            r#"
            SELECT * FROM jobs
            WHERE state = 'failed'
            ORDER BY updated_at ASC, rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn stats(&self) -> Result<JobStats> {
        let rows = sqlx::query_as::<_, (JobState, i64)>(
            "SELECT state, COUNT(*) FROM jobs GROUP BY state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = JobStats::default();
        for (state, count) in rows {
            stats.record(state, count);
        }
        Ok(stats)
    }

    /// Distinct workers currently holding a live lease.
    pub async fn active_lease_holders(&self) -> Result<i64> {
        let stale_before = Utc::now() - self.lease;
        let n: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(DISTINCT locked_by)
            FROM jobs
            WHERE state = 'processing'
              AND locked_at > ?1
            "#,
        )
        .bind(stale_before)
        .fetch_one(&self.pool)
        .await?;

        Ok(n)
    }

    // ----------------------------
    // Leasing
    // ----------------------------

    /// Lease the oldest eligible job to `worker_id`.
    ///
    /// Eligible means `pending`, or `processing` under a lease older than the
    /// lease timeout. Selection and update run as one `UPDATE` statement, which
    /// SQLite executes under its single write lock, so two concurrent claims can
    /// never both win the same job.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<Job>> {
        let now = Utc::now();
        let stale_before = now - self.lease;

        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET state = 'processing',
                locked_by = ?1,
                locked_at = ?2,
                updated_at = ?2
            WHERE id = (
                SELECT id
                FROM jobs
                WHERE state = 'pending'
                   OR (state = 'processing' AND locked_at <= ?3)
                ORDER BY created_at ASC, rowid ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Return every expired lease to `pending`. Returns how many were reclaimed.
    pub async fn reap_expired_leases(&self) -> Result<u64> {
        let now = Utc::now();
        let stale_before = now - self.lease;

        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending',
                locked_by = NULL,
                locked_at = NULL,
                updated_at = ?1
            WHERE state = 'processing'
              AND locked_at <= ?2
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    pub async fn complete(&self, job_id: &str, worker_id: &str) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET state = 'completed',
                locked_by = NULL,
                locked_at = NULL,
                updated_at = ?3
            WHERE id = ?1
              AND state = 'processing'
              AND locked_by = ?2
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => Ok(job),
            None => Err(self.lease_rejection(job_id, worker_id).await),
        }
    }

    /// Record a failed attempt. The returned job carries the new `attempts`
    /// count and is either `failed` or, once the ceiling is reached, `dead`.
    pub async fn fail(&self, job_id: &str, worker_id: &str, error: Option<&str>) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET attempts = attempts + 1,
                state = CASE
                    WHEN attempts + 1 >= max_retries THEN 'dead'
                    ELSE 'failed'
                END,
                last_error = ?3,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = ?4
            WHERE id = ?1
              AND state = 'processing'
              AND locked_by = ?2
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(error)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => Ok(job),
            None => Err(self.lease_rejection(job_id, worker_id).await),
        }
    }

    /// `failed -> pending`; any other state is left untouched.
    pub async fn requeue_failed(&self, job_id: &str) -> Result<Transition> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET state = 'pending',
                locked_by = NULL,
                locked_at = NULL,
                updated_at = ?2
            WHERE id = ?1
              AND state = 'failed'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        self.transition_result(job_id, job).await
    }

    /// `dead -> pending` with the attempt counter reset.
    pub async fn retry_from_dlq(&self, job_id: &str) -> Result<Transition> {
        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET state = 'pending',
                attempts = 0,
                last_error = NULL,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = ?2
            WHERE id = ?1
              AND state = 'dead'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        self.transition_result(job_id, job).await
    }

    async fn transition_result(&self, job_id: &str, updated: Option<Job>) -> Result<Transition> {
        if let Some(job) = updated {
            return Ok(Transition::Applied(job));
        }

        match self.get_job(job_id).await? {
            Some(current) => Ok(Transition::Unchanged(current)),
            None => Err(QueueError::NotFound(job_id.to_string())),
        }
    }

    async fn lease_rejection(&self, job_id: &str, worker_id: &str) -> QueueError {
        match self.get_job(job_id).await {
            Ok(Some(_)) => QueueError::LeaseNotHeld {
                id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            },
            Ok(None) => QueueError::NotFound(job_id.to_string()),
            Err(e) => e,
        }
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// `job-<unix millis>-<9 base36 chars>`
pub fn generate_job_id(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..9)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();

    format!("job-{}-{}", now.timestamp_millis(), suffix)
}
