//! Single-file key-value store on top of SQLite.
//!
//! Two tables act as buckets: `ports` keyed by `host:port` and `scans` keyed by
//! run id, each value a JSON-encoded record. The file is held in SQLite's
//! `EXCLUSIVE` locking mode, so only one process can use it at a time.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::debug;

use super::ResultStore;
use crate::error::{Result, ScanError};
use crate::types::{ScanResult, ScanRun, Stats};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ports (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS scans (
    id    TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

#[derive(Clone, Debug)]
pub struct EmbeddedStore {
    conn: Arc<Mutex<Connection>>,
}

impl EmbeddedStore {
    /// Open (or create) the store file, creating parent directories.
    ///
    /// Fails if another process already holds the file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || open_file(&path))
            .await
            .map_err(|e| ScanError::Internal(format!("storage open task failed: {e}")))??;
        Ok(Self::from_conn(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::from_conn(conn))
    }

    fn from_conn(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| ScanError::Storage("connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| ScanError::Internal(format!("storage task failed: {e}")))?
    }
}

fn open_file(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            ScanError::Storage(format!("failed to create db directory {}: {e}", parent.display()))
        })?;
    }
    let conn = Connection::open(path)?;
    // Contention with another process errors out after this delay.
    conn.busy_timeout(Duration::from_millis(250))?;
    let mode: String = conn.query_row("PRAGMA locking_mode = EXCLUSIVE", [], |row| row.get(0))?;
    debug!(path = %path.display(), %mode, "opened embedded store");
    // The first write takes the file lock, which is then held until close.
    conn.execute_batch(SCHEMA)
        .map_err(|e| ScanError::Storage(format!("{}: {e}", path.display())))?;
    conn.execute_batch("BEGIN EXCLUSIVE; COMMIT;")?;
    Ok(conn)
}

fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

fn load_results(conn: &Connection) -> Result<Vec<ScanResult>> {
    let mut stmt = conn.prepare("SELECT value FROM ports")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut out = Vec::new();
    for raw in rows {
        out.push(decode::<ScanResult>(&raw?)?);
    }
    out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
    Ok(out)
}

#[async_trait]
impl ResultStore for EmbeddedStore {
    async fn upsert_result(&self, result: &ScanResult) -> Result<bool> {
        let mut record = result.clone();
        self.with_conn(move |conn| {
            let key = record.key();
            let now = OffsetDateTime::now_utc();
            let tx = conn.transaction()?;

            let existing: Option<String> = tx
                .query_row("SELECT value FROM ports WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()?;

            let is_new = match existing {
                None => {
                    record.first_seen = now;
                    record.last_seen = now;
                    true
                }
                Some(raw) => {
                    let previous: ScanResult = decode(&raw)?;
                    record.merge_previous(&previous, now);
                    false
                }
            };

            tx.execute(
                "INSERT OR REPLACE INTO ports (key, value) VALUES (?1, ?2)",
                params![key, serde_json::to_string(&record)?],
            )?;
            tx.commit()?;
            Ok(is_new)
        })
        .await
    }

    async fn list_results(&self) -> Result<Vec<ScanResult>> {
        self.with_conn(|conn| load_results(conn)).await
    }

    async fn add_scan_run(&self, run: &ScanRun) -> Result<()> {
        let id = run.id.clone();
        let value = serde_json::to_string(run)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO scans (id, value) VALUES (?1, ?2)",
                params![id, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_scan_runs(&self, limit: usize) -> Result<Vec<ScanRun>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT value FROM scans")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for raw in rows {
                out.push(decode::<ScanRun>(&raw?)?);
            }
            out.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            if limit > 0 {
                out.truncate(limit);
            }
            Ok(out)
        })
        .await
    }

    async fn get_stats(&self) -> Result<Stats> {
        self.with_conn(|conn| {
            let results = load_results(conn)?;
            let hosts: HashSet<&str> = results.iter().map(|r| r.host.as_str()).collect();
            Ok(Stats {
                total_findings: results.len() as u64,
                unique_hosts: hosts.len() as u64,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OpenPortRecord, RunStatus};

    fn finding(host: &str, port: u16, banner: Option<&str>, service: Option<&str>) -> ScanResult {
        ScanResult::observed(
            &OpenPortRecord::tcp(host, port),
            banner.map(str::to_string),
            service.map(str::to_string),
        )
    }

    #[tokio::test]
    async fn second_upsert_keeps_first_seen() {
        let store = EmbeddedStore::open_in_memory().unwrap();
        let r = finding("10.0.0.2", 22, Some("SSH-2.0-dropbear"), Some("ssh"));

        assert!(store.upsert_result(&r).await.unwrap());
        let first = store.list_results().await.unwrap().remove(0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!store.upsert_result(&r).await.unwrap());
        let second = store.list_results().await.unwrap().remove(0);

        assert_eq!(second.first_seen, first.first_seen);
        assert!(second.last_seen > first.last_seen);
        assert_eq!(first.first_seen, first.last_seen);
    }

    #[tokio::test]
    async fn empty_enrichment_does_not_overwrite() {
        let store = EmbeddedStore::open_in_memory().unwrap();
        store
            .upsert_result(&finding("10.0.0.2", 80, Some("HTTP/1.1 200 OK"), Some("http")))
            .await
            .unwrap();
        store.upsert_result(&finding("10.0.0.2", 80, None, Some(""))).await.unwrap();

        let stored = store.list_results().await.unwrap().remove(0);
        assert_eq!(stored.banner.as_deref(), Some("HTTP/1.1 200 OK"));
        assert_eq!(stored.service.as_deref(), Some("http"));
    }

    #[tokio::test]
    async fn protocol_is_part_of_identity() {
        let store = EmbeddedStore::open_in_memory().unwrap();
        let tcp = finding("10.0.0.3", 53, None, None);
        let mut udp = tcp.clone();
        udp.protocol = "udp".into();
        assert!(store.upsert_result(&tcp).await.unwrap());
        assert!(store.upsert_result(&udp).await.unwrap());
        assert_eq!(store.list_results().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn results_listed_most_recent_first_and_stats() {
        let store = EmbeddedStore::open_in_memory().unwrap();
        store.upsert_result(&finding("10.0.0.1", 22, None, None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.upsert_result(&finding("10.0.0.1", 80, None, None)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.upsert_result(&finding("10.0.0.9", 443, None, None)).await.unwrap();

        let ports: Vec<u16> = store.list_results().await.unwrap().iter().map(|r| r.port).collect();
        assert_eq!(ports, vec![443, 80, 22]);

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total_findings, 3);
        assert_eq!(stats.unique_hosts, 2);
    }

    #[tokio::test]
    async fn scan_runs_most_recent_first_with_limit() {
        let store = EmbeddedStore::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let run = ScanRun::begin(&["10.0.0.0/24".into()], "top");
            ids.push(run.id.clone());
            store.add_scan_run(&run).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let runs = store.list_scan_runs(2).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, ids[2]);
        assert_eq!(runs[1].id, ids[1]);
        assert_eq!(store.list_scan_runs(0).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn rewriting_run_replaces_it() {
        let store = EmbeddedStore::open_in_memory().unwrap();
        let mut run = ScanRun::begin(&["10.0.0.1".into()], "22");
        store.add_scan_run(&run).await.unwrap();
        run.status = RunStatus::Completed;
        run.found = 4;
        store.add_scan_run(&run).await.unwrap();

        let runs = store.list_scan_runs(10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(runs[0].found, 4);
    }

    #[tokio::test]
    async fn file_store_persists_and_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ports.db");

        let store = EmbeddedStore::open(&path).await.unwrap();
        store.upsert_result(&finding("192.168.0.4", 8080, None, None)).await.unwrap();
        assert!(EmbeddedStore::open(&path).await.is_err());

        drop(store);
        let reopened = EmbeddedStore::open(&path).await.unwrap();
        assert_eq!(reopened.list_results().await.unwrap().len(), 1);
        assert!(reopened.notifications().is_none());
    }
}
