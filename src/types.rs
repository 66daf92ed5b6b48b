use std::fmt;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Which external scanner a run is executed with.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Rapid asynchronous sweep (masscan-style), JSON-lines output.
    Fast,
    /// Connect-based verification (nmap-style), text output.
    Verify,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Fast => "fast",
            EngineKind::Verify => "verify",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine label recorded on a finished run. `Mixed` means the fast engine
/// produced nothing and the verify engine was used as a fallback.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunEngine {
    Fast,
    Verify,
    Mixed,
}

impl RunEngine {
    pub fn as_str(self) -> &'static str {
        match self {
            RunEngine::Fast => "fast",
            RunEngine::Verify => "verify",
            RunEngine::Mixed => "mixed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fast" => Some(RunEngine::Fast),
            "verify" => Some(RunEngine::Verify),
            "mixed" => Some(RunEngine::Mixed),
            _ => None,
        }
    }
}

impl From<EngineKind> for RunEngine {
    fn from(kind: EngineKind) -> Self {
        match kind {
            EngineKind::Fast => RunEngine::Fast,
            EngineKind::Verify => RunEngine::Verify,
        }
    }
}

impl fmt::Display for RunEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine selection produced once per run by the decision engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub engine: EngineKind,
    pub reason: String,
    pub wait_seconds: u64,
}

/// Fully resolved parameters of a run. Also served as the decision preview.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanPlan {
    pub targets: Vec<String>,
    pub ports: String,
    pub engine: EngineKind,
    pub interface: Option<String>,
    pub wait_seconds: u64,
    pub reason: String,
}

/// One open port reported by an engine adapter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct OpenPortRecord {
    pub host: String,
    pub port: u16,
    pub protocol: String,
}

impl OpenPortRecord {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: "tcp".into(),
        }
    }
}

/// Persisted finding, unique per (host, port, protocol).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

impl ScanResult {
    /// A fresh observation; the store decides the final `first_seen`.
    pub fn observed(record: &OpenPortRecord, banner: Option<String>, service: Option<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            host: record.host.clone(),
            port: record.port,
            protocol: record.protocol.to_ascii_lowercase(),
            banner,
            service,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Key used by the embedded store. TCP keeps the short `host:port` form.
    pub fn key(&self) -> String {
        if self.protocol == "tcp" {
            format!("{}:{}", self.host, self.port)
        } else {
            format!("{}:{}/{}", self.host, self.port, self.protocol)
        }
    }

    /// Carry `first_seen` and non-empty enrichment over from a stored entry.
    pub fn merge_previous(&mut self, previous: &ScanResult, now: OffsetDateTime) {
        self.first_seen = previous.first_seen;
        self.last_seen = now;
        if is_blank(&self.banner) {
            self.banner = previous.banner.clone();
        }
        if is_blank(&self.service) {
            self.service = previous.service.clone();
        }
    }
}

/// `None` for a missing or whitespace-only enrichment value.
pub(crate) fn non_blank(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.trim().is_empty())
}

fn is_blank(v: &Option<String>) -> bool {
    non_blank(v).is_none()
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "cancelled" => Some(RunStatus::Cancelled),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// Summary of one orchestrator invocation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanRun {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub engine: RunEngine,
    #[serde(default)]
    pub targets: Vec<String>,
    pub targets_count: usize,
    pub ports_spec: String,
    pub found: u64,
    pub new_found: u64,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl ScanRun {
    pub fn begin(targets: &[String], ports_spec: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            started_at: OffsetDateTime::now_utc(),
            finished_at: None,
            engine: RunEngine::Fast,
            targets: targets.to_vec(),
            targets_count: targets.len(),
            ports_spec: ports_spec.to_string(),
            found: 0,
            new_found: 0,
            status: RunStatus::Running,
            notes: None,
        }
    }

    /// Short human form of the target list, e.g. `10.0.0.0/24 (+2)`.
    pub fn targets_summary(&self) -> String {
        match self.targets.split_first() {
            None => String::new(),
            Some((first, [])) => first.clone(),
            Some((first, rest)) => format!("{first} (+{})", rest.len()),
        }
    }
}

/// Live progress notification. Never persisted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub percent: u8,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(percent: u8, message: impl Into<String>) -> Self {
        Self {
            percent: percent.min(100),
            message: message.into(),
        }
    }
}

/// Append-only notification log entry written on novel-port detection.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub id: i64,
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub delivered: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub total_findings: u64,
    pub unique_hosts: u64,
}

/// Snapshot of local network facts for display.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct NetInfo {
    pub interface: Option<String>,
    pub src_ip: Option<String>,
    pub networks: Vec<IpNet>,
}
