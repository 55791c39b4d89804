pub mod executor;
pub mod model;
pub mod pool;
pub mod repo;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use executor::{ExecError, ExecOutput, Executor, ShellExecutor};
pub use model::{Job, JobState, JobStats, NewJob, Transition};
pub use pool::{ActivityGauge, PoolConfig, WorkerPool};
pub use repo::JobsRepo;
pub use scheduler::{RetryScheduler, ScheduledRequeue};
pub use worker::{Outcome, Worker};
