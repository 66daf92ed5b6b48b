//! Persistence of findings, run summaries and the notification log.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::{Result, ScanError};
use crate::types::{NotificationEvent, ScanResult, ScanRun, Stats};

pub mod embedded;
pub mod postgres;

pub use embedded::EmbeddedStore;
pub use postgres::PostgresStore;

/// Idempotent, dedup-aware storage shared by both backends.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert or refresh a finding keyed by (host, port, protocol).
    ///
    /// Returns `true` on first sight. A repeat keeps the stored `first_seen`,
    /// moves `last_seen` to now and never replaces a non-empty banner or
    /// service with an empty one.
    async fn upsert_result(&self, result: &ScanResult) -> Result<bool>;

    /// All findings, most recently seen first.
    async fn list_results(&self) -> Result<Vec<ScanResult>>;

    /// Record one run summary. Writing the same id again replaces it.
    async fn add_scan_run(&self, run: &ScanRun) -> Result<()>;

    /// Most recent runs first; `limit == 0` returns all.
    async fn list_scan_runs(&self, limit: usize) -> Result<Vec<ScanRun>>;

    async fn get_stats(&self) -> Result<Stats>;

    /// Notification log, when the backend keeps one.
    fn notifications(&self) -> Option<&dyn NotificationSink> {
        None
    }
}

/// Append-only log of novel-port events consumed by a delivery worker.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn list_undelivered(&self, limit: u32) -> Result<Vec<NotificationEvent>>;

    async fn mark_delivered(&self, id: i64) -> Result<()>;
}

/// Open the backend selected in the configuration.
pub async fn open(cfg: &StorageConfig) -> Result<Arc<dyn ResultStore>> {
    match cfg.backend {
        StorageBackend::Embedded => {
            let store = EmbeddedStore::open(&cfg.path).await?;
            Ok(Arc::new(store))
        }
        StorageBackend::Postgres => {
            let url = cfg.database_url.as_deref().ok_or_else(|| {
                ScanError::Storage("storage.database_url is required for the postgres backend".into())
            })?;
            let store = PostgresStore::connect(url).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}
