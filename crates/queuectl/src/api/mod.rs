use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use crate::api::models::{ErrorBody, ListJobsQuery, StatsResponse};
use crate::error::QueueError;
use crate::jobs::model::{Job, JobState, NewJob};
use crate::jobs::pool::ActivityGauge;
use crate::jobs::scheduler::{RetryScheduler, ScheduledRequeue};
use crate::jobs::JobsRepo;

pub mod models;

#[derive(Clone)]
pub struct ApiState {
    pub jobs: JobsRepo,
    pub retries: Option<RetryScheduler>,
    pub activity: ActivityGauge,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).post(enqueue_job))
        .route("/jobs/:id", get(get_job))
        .route("/dlq", get(list_dlq))
        .route("/dlq/:id/retry", post(retry_dlq_job))
        .route("/retries", get(list_retries))
        .route("/stats", get(stats))
        // Metrics
        .route("/metrics/prom", get(metrics_prom))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

pub struct ApiError(QueueError);

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            QueueError::Validation(_) | QueueError::InvalidSetting { .. } => {
                StatusCode::BAD_REQUEST
            }
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueError::DuplicateId(_)
            | QueueError::TransitionConflict { .. }
            | QueueError::LeaseNotHeld { .. } => StatusCode::CONFLICT,
            QueueError::Database(_) | QueueError::Migrate(_) => {
                tracing::error!(error = %self.0, "admin api storage error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub async fn enqueue_job(
    State(state): State<ApiState>,
    Json(body): Json<NewJob>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let job = state.jobs.enqueue(body).await?;
    tracing::info!(job_id = %job.id, "job enqueued via admin api");
    Ok((StatusCode::CREATED, Json(job)))
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(q): Query<ListJobsQuery>,
) -> ApiResult<Json<Vec<Job>>> {
    let filter = match q.state.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Some(raw.parse::<JobState>().map_err(QueueError::Validation)?),
        None => None,
    };

    Ok(Json(state.jobs.list_jobs(filter).await?))
}

pub async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    match state.jobs.get_job(&id).await? {
        Some(job) => Ok(Json(job)),
        None => Err(QueueError::NotFound(id).into()),
    }
}

pub async fn list_dlq(State(state): State<ApiState>) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(state.jobs.list_dlq().await?))
}

pub async fn retry_dlq_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    let job = state
        .jobs
        .retry_from_dlq(&id)
        .await?
        .require_applied(JobState::Pending)?;

    tracing::info!(job_id = %job.id, "dead job moved back to pending");
    Ok(Json(job))
}

pub async fn list_retries(State(state): State<ApiState>) -> Json<Vec<ScheduledRequeue>> {
    Json(
        state
            .retries
            .as_ref()
            .map(RetryScheduler::pending)
            .unwrap_or_default(),
    )
}

pub async fn stats(State(state): State<ApiState>) -> ApiResult<Json<StatsResponse>> {
    let jobs = state.jobs.stats().await?;

    Ok(Json(StatsResponse {
        total: jobs.total(),
        jobs,
        workers: state.activity.total(),
        active_workers: state.activity.active(),
        scheduled_retries: state.retries.as_ref().map_or(0, RetryScheduler::len),
    }))
}

pub async fn metrics_prom(State(state): State<ApiState>) -> ApiResult<Response> {
    let stats = state.jobs.stats().await?;

    let mut body = String::from(concat!(
        "# HELP queuectl_jobs Number of jobs by state\n",
        "# TYPE queuectl_jobs gauge\n",
    ));
    for job_state in JobState::ALL {
        body.push_str(&format!(
            "queuectl_jobs{{state=\"{}\"}} {}\n",
            job_state,
            stats.get(job_state)
        ));
    }
    body.push_str(&format!(
        concat!(
            "# HELP queuectl_active_workers Workers executing a command\n",
            "# TYPE queuectl_active_workers gauge\n",
            "queuectl_active_workers {}\n",
            "# HELP queuectl_scheduled_retries Failed jobs waiting out their backoff\n",
            "# TYPE queuectl_scheduled_retries gauge\n",
            "queuectl_scheduled_retries {}\n"
        ),
        state.activity.active(),
        state.retries.as_ref().map_or(0, RetryScheduler::len),
    ));

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
