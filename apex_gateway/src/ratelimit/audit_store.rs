//! Durable audit tier for rate-limit decisions. Writes never block the
//! request path: in `Async` mode a record is handed off to a background
//! writer task over a bounded channel and dropped (with a log line) if the
//! channel is full; in `Sync` mode the write is awaited inline but still
//! cannot reject the request on failure; `Disabled` is a no-op.

pub use crate::config::AuditMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{error, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitAuditRecord {
  pub identity: String,
  pub window_type: String,
  pub route_path: Option<String>,
  pub window_start: i64,
  pub window_end: i64,
  pub request_count: u64,
  pub allowed: bool,
  pub recorded_at: DateTime<Utc>,
}

enum Sink {
  Disabled,
  Sync(PgPool),
  Async(mpsc::Sender<RateLimitAuditRecord>),
}

pub struct RateLimitAuditStore {
  sink: Sink,
}

const CHANNEL_CAPACITY: usize = 4096;

impl RateLimitAuditStore {
  pub fn disabled() -> Self {
    Self { sink: Sink::Disabled }
  }

  pub fn sync(pool: PgPool) -> Self {
    Self { sink: Sink::Sync(pool) }
  }

  /// Spawn the background writer and return a store that hands records to
  /// it. The returned `JoinHandle` should be tracked in the caller's task
  /// set so it can be drained on shutdown.
  pub fn spawn_async(pool: PgPool) -> (Self, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
      while let Some(record) = rx.recv().await {
        if let Err(e) = write_record(&pool, &record).await {
          error!(error = %e, "failed to persist rate limit audit record");
        }
      }
    });
    (Self { sink: Sink::Async(tx) }, handle)
  }

  pub async fn record(&self, record: RateLimitAuditRecord) {
    match &self.sink {
      Sink::Disabled => {}
      Sink::Sync(pool) => {
        if let Err(e) = write_record(pool, &record).await {
          warn!(error = %e, "synchronous rate limit audit write failed");
        }
      }
      Sink::Async(tx) => {
        if let Err(e) = tx.try_send(record) {
          warn!(error = %e, "rate limit audit channel full, dropping record");
        }
      }
    }
  }
}

/// Upsert keyed on `(identity, window_type, route_path, window_start)` so
/// repeated checks within the same window accumulate a running count
/// instead of inserting one row per request.
/// Spawn a fixed-interval task that deletes rate-limit audit rows older
/// than `retention_days`. Runs once a day; the first pass happens after the
/// same interval rather than immediately at startup, matching the poller
/// shape used for discovery backends.
pub fn spawn_retention_cleanup(pool: PgPool, retention_days: u32) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(86400));
    loop {
      interval.tick().await;
      let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
      match sqlx::query("DELETE FROM rate_limit_records WHERE updated_at < $1").bind(cutoff).execute(&pool).await {
        Ok(result) => tracing::info!(deleted = result.rows_affected(), "rate limit audit retention cleanup ran"),
        Err(e) => tracing::error!(error = %e, "rate limit audit retention cleanup failed"),
      }
    }
  })
}

async fn write_record(pool: &PgPool, record: &RateLimitAuditRecord) -> Result<(), sqlx::Error> {
  sqlx::query(
    "INSERT INTO rate_limit_records \
       (identity, window_type, route_path, window_start, window_end, request_count, allowed, updated_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
     ON CONFLICT (identity, window_type, COALESCE(route_path, ''), window_start) \
     DO UPDATE SET request_count = EXCLUDED.request_count, allowed = EXCLUDED.allowed, updated_at = EXCLUDED.updated_at",
  )
  .bind(&record.identity)
  .bind(&record.window_type)
  .bind(&record.route_path)
  .bind(record.window_start)
  .bind(record.window_end)
  .bind(record.request_count as i64)
  .bind(record.allowed)
  .bind(record.recorded_at)
  .execute(pool)
  .await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn disabled_store_drops_records_without_error() {
    let store = RateLimitAuditStore::disabled();
    store
      .record(RateLimitAuditRecord {
        identity: "u-1".to_string(),
        window_type: "minute".to_string(),
        route_path: Some("/api/v1/widgets".to_string()),
        window_start: 0,
        window_end: 60,
        request_count: 1,
        allowed: true,
        recorded_at: Utc::now(),
      })
      .await;
  }
}
