//! Key/value runtime settings stored next to the jobs.
//!
//! Only two keys drive the core (`max-retries`, `backoff-base`); any other key
//! is stored as-is so operators can keep notes alongside them.

use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::BTreeMap;

use crate::error::{QueueError, Result};

pub const MAX_RETRIES: &str = "max-retries";
pub const BACKOFF_BASE: &str = "backoff-base";

pub const DEFAULT_MAX_RETRIES: i32 = 3;
pub const DEFAULT_BACKOFF_BASE: f64 = 2.0;

#[derive(Clone)]
pub struct SettingsRepo {
    pool: SqlitePool,
}

impl SettingsRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    /// Stores `value` under `key`, validating the keys the core understands.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(QueueError::InvalidSetting {
                key: key.to_string(),
                reason: "key must not be empty".into(),
            });
        }

        let value = value.trim();
        validate(key, value)?;

        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE
            SET value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Every effective setting: stored values layered over the defaults.
    pub async fn list(&self) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query_as::<_, (String, String)>("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;

        let mut out = BTreeMap::from([
            (MAX_RETRIES.to_string(), DEFAULT_MAX_RETRIES.to_string()),
            (BACKOFF_BASE.to_string(), format_number(DEFAULT_BACKOFF_BASE)),
        ]);
        out.extend(rows);
        Ok(out)
    }

    pub async fn max_retries(&self) -> Result<i32> {
        match self.get(MAX_RETRIES).await? {
            Some(raw) => parse_max_retries(&raw),
            None => Ok(DEFAULT_MAX_RETRIES),
        }
    }

    pub async fn backoff_base(&self) -> Result<f64> {
        match self.get(BACKOFF_BASE).await? {
            Some(raw) => parse_backoff_base(&raw),
            None => Ok(DEFAULT_BACKOFF_BASE),
        }
    }
}

fn validate(key: &str, value: &str) -> Result<()> {
    match key {
        MAX_RETRIES => parse_max_retries(value).map(|_| ()),
        BACKOFF_BASE => parse_backoff_base(value).map(|_| ()),
        _ => Ok(()),
    }
}

fn parse_max_retries(raw: &str) -> Result<i32> {
    match raw.trim().parse::<i32>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(QueueError::InvalidSetting {
            key: MAX_RETRIES.into(),
            reason: format!("expected a positive integer, got '{raw}'"),
        }),
    }
}

fn parse_backoff_base(raw: &str) -> Result<f64> {
    match raw.trim().parse::<f64>() {
        Ok(n) if n.is_finite() && n >= 1.0 => Ok(n),
        _ => Err(QueueError::InvalidSetting {
            key: BACKOFF_BASE.into(),
            reason: format!("expected a number >= 1, got '{raw}'"),
        }),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}
