use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{locate, process, EngineParams, PortStream, ScanEngine};
use crate::error::{Result, ScanError};
use crate::types::{EngineKind, OpenPortRecord};

/// masscan-style sweeper emitting one JSON object per line.
#[derive(Debug, Clone)]
pub struct FastEngine {
    program: String,
}

impl FastEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn args(params: &EngineParams) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            params.ports.clone(),
            "--rate".into(),
            params.rate.to_string(),
            "--wait".into(),
            params.wait_seconds.to_string(),
            "--output-format".into(),
            "json".into(),
            "--output-filename".into(),
            "-".into(),
        ];
        if let Some(ifc) = params.interface.as_deref().filter(|s| !s.is_empty()) {
            args.push("--interface".into());
            args.push(ifc.to_string());
        }
        args.extend(params.targets.iter().cloned());
        args
    }
}

#[async_trait]
impl ScanEngine for FastEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Fast
    }

    fn ensure_available(&self) -> Result<()> {
        locate(EngineKind::Fast, &self.program).map(|_| ())
    }

    async fn run(&self, params: &EngineParams, cancel: CancellationToken) -> Result<PortStream> {
        let args = Self::args(params);
        info!(program = %self.program, args = %args.join(" "), "running fast engine");
        let mut cmd = Command::new(&self.program);
        cmd.args(&args);
        process::stream_lines(cmd, EngineKind::Fast, cancel, parse_fast_line)
    }
}

#[derive(Deserialize)]
struct Entry {
    ip: String,
    #[serde(default)]
    ports: Vec<EntryPort>,
}

#[derive(Deserialize)]
struct EntryPort {
    port: u16,
    #[serde(default)]
    proto: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// Decode one output line. Array framing (`[`, `]`) and trailing commas are
/// tolerated; blank lines yield nothing.
pub fn parse_fast_line(line: &str) -> Result<Vec<OpenPortRecord>> {
    let line = line.trim().trim_end_matches(',').trim();
    if line.is_empty() || line == "[" || line == "]" {
        return Ok(Vec::new());
    }

    let entry: Entry = serde_json::from_str(line)
        .map_err(|e| ScanError::Parse(format!("{e} (line: {line})")))?;

    Ok(entry
        .ports
        .into_iter()
        .filter(|p| p.status.as_deref().map_or(true, |s| s == "open"))
        .map(|p| OpenPortRecord {
            host: entry.ip.clone(),
            port: p.port,
            protocol: p
                .proto
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "tcp".into())
                .to_ascii_lowercase(),
        })
        .collect())
}
