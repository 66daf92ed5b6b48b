use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use time::OffsetDateTime;
use tracing::info;

use super::{NotificationSink, ResultStore};
use crate::error::{Result, ScanError};
use crate::types::{non_blank, NotificationEvent, RunEngine, RunStatus, ScanResult, ScanRun, Stats};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Event type written when a port is seen for the first time.
pub const NEW_PORT_EVENT: &str = "new_port";

/// Blank enrichment never overwrites a stored service or banner, matching
/// `ScanResult::merge_previous` on the embedded backend.
const UPSERT_PORT: &str = r#"
    INSERT INTO ports (host_id, port, proto, service, banner, first_seen, last_seen)
    VALUES ($1, $2, $3, $4, $5, now(), now())
    ON CONFLICT (host_id, port, proto)
    DO UPDATE SET
        last_seen = now(),
        service = COALESCE(NULLIF(btrim(EXCLUDED.service), ''), ports.service),
        banner  = COALESCE(NULLIF(btrim(EXCLUDED.banner), ''), ports.banner)
    RETURNING (xmax = 0) AS inserted
"#;

/// Cap on rows returned by `list_results`.
const RESULTS_LIMIT: i64 = 1000;

/// Relational backend: hosts, ports, scans and an append-only events log.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| ScanError::Storage(format!("failed to connect to postgres: {e}")))?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| ScanError::Storage(format!("migration failed: {e}")))?;
        info!("postgres migrations applied");
        Ok(())
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn map_result(row: &PgRow) -> Result<ScanResult> {
        let port: i32 = row.try_get("port")?;
        Ok(ScanResult {
            host: row.try_get("ip")?,
            port: u16::try_from(port)
                .map_err(|_| ScanError::Storage(format!("stored port out of range: {port}")))?,
            protocol: row.try_get("proto")?,
            banner: row.try_get("banner")?,
            service: row.try_get("service")?,
            first_seen: row.try_get("first_seen")?,
            last_seen: row.try_get("last_seen")?,
        })
    }

    fn map_run(row: &PgRow) -> Result<ScanRun> {
        let engine: String = row.try_get("engine")?;
        let status: String = row.try_get("status")?;
        let targets: Value = row.try_get("targets")?;
        let targets_count: i32 = row.try_get("targets_count")?;
        let found: i64 = row.try_get("found")?;
        let new_found: i64 = row.try_get("new_found")?;
        Ok(ScanRun {
            id: row.try_get("id")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            engine: RunEngine::parse(&engine)
                .ok_or_else(|| ScanError::Storage(format!("unknown engine label: {engine}")))?,
            targets: serde_json::from_value(targets)?,
            targets_count: targets_count.max(0) as usize,
            ports_spec: row.try_get("ports")?,
            found: found.max(0) as u64,
            new_found: new_found.max(0) as u64,
            status: RunStatus::parse(&status)
                .ok_or_else(|| ScanError::Storage(format!("unknown run status: {status}")))?,
            notes: row.try_get("notes")?,
        })
    }
}

/// Remove the parentheses nmap puts around addresses in report headers.
fn clean_host(host: &str) -> &str {
    host.trim().trim_start_matches('(').trim_end_matches(')')
}

#[async_trait]
impl ResultStore for PostgresStore {
    async fn upsert_result(&self, result: &ScanResult) -> Result<bool> {
        let host = clean_host(&result.host);
        let mut tx = self.pool().begin().await?;

        let host_id: i64 = sqlx::query(
            r#"
            INSERT INTO hosts (ip, first_seen, last_seen)
            VALUES ($1, now(), now())
            ON CONFLICT (ip)
            DO UPDATE SET last_seen = now()
            RETURNING id
            "#,
        )
        .bind(host)
        .fetch_one(&mut *tx)
        .await?
        .try_get("id")?;

        let is_new: bool = sqlx::query(UPSERT_PORT)
            .bind(host_id)
            .bind(i32::from(result.port))
            .bind(result.protocol.to_ascii_lowercase())
            .bind(non_blank(&result.service))
            .bind(non_blank(&result.banner))
            .fetch_one(&mut *tx)
            .await?
            .try_get("inserted")?;

        if is_new {
            sqlx::query("INSERT INTO events (type, payload) VALUES ($1, $2)")
                .bind(NEW_PORT_EVENT)
                .bind(json!({
                    "ip": host,
                    "port": result.port,
                    "proto": result.protocol,
                    "service": result.service,
                }))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(is_new)
    }

    async fn list_results(&self) -> Result<Vec<ScanResult>> {
        let rows = sqlx::query(
            r#"
            SELECT h.ip, p.port, p.proto, p.service, p.banner, p.first_seen, p.last_seen
            FROM ports p
            JOIN hosts h ON h.id = p.host_id
            ORDER BY p.last_seen DESC
            LIMIT $1
            "#,
        )
        .bind(RESULTS_LIMIT)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(Self::map_result).collect()
    }

    async fn add_scan_run(&self, run: &ScanRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scans (
                id, started_at, finished_at, engine, targets, targets_count,
                ports, found, new_found, status, notes
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                finished_at = EXCLUDED.finished_at,
                engine      = EXCLUDED.engine,
                ports       = EXCLUDED.ports,
                found       = EXCLUDED.found,
                new_found   = EXCLUDED.new_found,
                status      = EXCLUDED.status,
                notes       = EXCLUDED.notes
            "#,
        )
        .bind(&run.id)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.engine.as_str())
        .bind(json!(run.targets))
        .bind(i32::try_from(run.targets_count).unwrap_or(i32::MAX))
        .bind(&run.ports_spec)
        .bind(i64::try_from(run.found).unwrap_or(i64::MAX))
        .bind(i64::try_from(run.new_found).unwrap_or(i64::MAX))
        .bind(run.status.as_str())
        .bind(run.notes.as_deref())
        .execute(self.pool())
        .await
        .map_err(|e| ScanError::Storage(format!("failed to record scan run {}: {e}", run.id)))?;
        Ok(())
    }

    async fn list_scan_runs(&self, limit: usize) -> Result<Vec<ScanRun>> {
        let limit = (limit > 0).then(|| i64::try_from(limit).unwrap_or(i64::MAX));
        let rows = sqlx::query(
            r#"
            SELECT id, started_at, finished_at, engine, targets, targets_count,
                   ports, found, new_found, status, notes
            FROM scans
            ORDER BY started_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(Self::map_run).collect()
    }

    async fn get_stats(&self) -> Result<Stats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM ports) AS total_findings,
                (SELECT COUNT(*) FROM hosts) AS unique_hosts
            "#,
        )
        .fetch_one(self.pool())
        .await?;

        let total: i64 = row.try_get("total_findings")?;
        let hosts: i64 = row.try_get("unique_hosts")?;
        Ok(Stats {
            total_findings: total.max(0) as u64,
            unique_hosts: hosts.max(0) as u64,
        })
    }

    fn notifications(&self) -> Option<&dyn NotificationSink> {
        Some(self)
    }
}

#[async_trait]
impl NotificationSink for PostgresStore {
    async fn list_undelivered(&self, limit: u32) -> Result<Vec<NotificationEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, type, payload, created_at, delivered
            FROM events
            WHERE delivered = false
            ORDER BY id
            LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let created_at: OffsetDateTime = row.try_get("created_at")?;
                Ok(NotificationEvent {
                    id: row.try_get("id")?,
                    kind: row.try_get("type")?,
                    payload: row.try_get("payload")?,
                    created_at,
                    delivered: row.try_get("delivered")?,
                })
            })
            .collect()
    }

    async fn mark_delivered(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE events SET delivered = true WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
