use std::time::Duration;

use crate::jobs::pool::PoolConfig;
use crate::jobs::repo::DEFAULT_LEASE_SECONDS;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://queue.db";

/// Process configuration, loaded from the environment (and `.env`).
///
/// Every key is read as `QUEUECTL_<NAME>` first, then `<NAME>`.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub lease_seconds: i64,
    pub poll_interval_ms: u64,
    pub reap_interval_ms: u64,
    pub shutdown_grace_ms: u64,
    pub worker_count: usize,
    pub admin_addr: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env_or_fallback("QUEUECTL_DATABASE_URL", "DATABASE_URL")
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let lease_seconds = parse_env("QUEUECTL_LEASE_SECONDS", "LEASE_SECONDS")?
            .unwrap_or(DEFAULT_LEASE_SECONDS);
        if lease_seconds < 1 {
            anyhow::bail!("LEASE_SECONDS must be >= 1, got {lease_seconds}");
        }

        let poll_interval_ms =
            parse_env("QUEUECTL_POLL_INTERVAL_MS", "POLL_INTERVAL_MS")?.unwrap_or(1_000);

        let reap_interval_ms =
            parse_env("QUEUECTL_REAP_INTERVAL_MS", "REAP_INTERVAL_MS")?.unwrap_or(30_000);

        let shutdown_grace_ms =
            parse_env("QUEUECTL_SHUTDOWN_GRACE_MS", "SHUTDOWN_GRACE_MS")?.unwrap_or(1_000);

        let worker_count = parse_env("QUEUECTL_WORKER_COUNT", "WORKER_COUNT")?.unwrap_or(1);
        if worker_count == 0 {
            anyhow::bail!("WORKER_COUNT must be >= 1");
        }

        let admin_addr = env_or_fallback("QUEUECTL_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        Ok(Self {
            database_url,
            lease_seconds,
            poll_interval_ms,
            reap_interval_ms,
            shutdown_grace_ms,
            worker_count,
            admin_addr,
        })
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            reap_interval: Duration::from_millis(self.reap_interval_ms.max(1)),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn parse_env<T>(primary: &str, fallback: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_or_fallback(primary, fallback) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{primary} has invalid value '{raw}': {e}")),
        None => Ok(None),
    }
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
