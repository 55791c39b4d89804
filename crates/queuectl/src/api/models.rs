// crates/queuectl/src/api/models.rs
use serde::{Deserialize, Serialize};

use crate::jobs::model::JobStats;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub jobs: JobStats,
    pub total: i64,
    pub workers: usize,
    pub active_workers: usize,
    pub scheduled_retries: usize,
}
