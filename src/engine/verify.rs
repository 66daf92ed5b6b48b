use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{locate, process, EngineParams, PortStream, ScanEngine};
use crate::error::Result;
use crate::types::{EngineKind, OpenPortRecord};

const REPORT_HEADER: &str = "Nmap scan report for";

/// nmap-style connect scanner with human-readable output.
#[derive(Debug, Clone)]
pub struct VerifyEngine {
    program: String,
}

impl VerifyEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn args(params: &EngineParams) -> Vec<String> {
        let mut args = vec![
            "-Pn".to_string(),
            "-sT".into(),
            "-p".into(),
            params.ports.clone(),
        ];
        args.extend(params.targets.iter().cloned());
        args
    }
}

#[async_trait]
impl ScanEngine for VerifyEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Verify
    }

    fn ensure_available(&self) -> Result<()> {
        locate(EngineKind::Verify, &self.program).map(|_| ())
    }

    async fn run(&self, params: &EngineParams, cancel: CancellationToken) -> Result<PortStream> {
        let args = Self::args(params);
        info!(program = %self.program, args = %args.join(" "), "running verify engine");
        let mut cmd = Command::new(&self.program);
        cmd.args(&args);
        let mut parser = VerifyParser::default();
        process::stream_lines(cmd, EngineKind::Verify, cancel, move |line| {
            Ok(parser.feed(line).into_iter().collect())
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum ParserState {
    #[default]
    AwaitingHost,
    HaveHost(String),
}

/// Line-by-line reader of the verify engine's report.
///
/// A report header switches the current host; `<port>/tcp open` lines under
/// a host become records. Everything else is ignored.
#[derive(Debug, Clone, Default)]
pub struct VerifyParser {
    state: ParserState,
}

impl VerifyParser {
    pub fn feed(&mut self, line: &str) -> Option<OpenPortRecord> {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix(REPORT_HEADER) {
            self.state = match rest.split_whitespace().last() {
                Some(last) => {
                    ParserState::HaveHost(last.trim_start_matches('(').trim_end_matches(')').to_string())
                }
                None => ParserState::AwaitingHost,
            };
            return None;
        }

        let ParserState::HaveHost(host) = &self.state else {
            return None;
        };

        let mut fields = line.split_whitespace();
        let port = fields.next()?.strip_suffix("/tcp")?.parse::<u16>().ok()?;
        if fields.next()? != "open" {
            return None;
        }
        Some(OpenPortRecord::tcp(host.clone(), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(output: &str) -> Vec<OpenPortRecord> {
        let mut p = VerifyParser::default();
        output.lines().filter_map(|l| p.feed(l)).collect()
    }

    #[test]
    fn builds_nmap_arguments() {
        let params = EngineParams {
            targets: vec!["127.0.0.1".into()],
            ports: "22,80".into(),
            rate: 1000,
            wait_seconds: 2,
            interface: Some("lo".into()),
        };
        assert_eq!(VerifyEngine::args(&params).join(" "), "-Pn -sT -p 22,80 127.0.0.1");
    }

    #[test]
    fn parses_report_with_named_host() {
        let out = "\
Starting Nmap 7.94 ( https://nmap.org ) at 2024-05-01 10:00 UTC
Nmap scan report for nas.lan (192.168.1.20)
Host is up (0.00042s latency).
Not shown: 998 closed tcp ports (conn-refused)
PORT    STATE SERVICE
22/tcp  open  ssh
80/tcp  open  http
443/tcp closed https
8080/tcp open|filtered http-proxy

Nmap scan report for 192.168.1.21
PORT   STATE SERVICE
53/tcp open  domain
Nmap done: 2 IP addresses (2 hosts up) scanned in 0.10 seconds
";
        let recs = parse_all(out);
        assert_eq!(
            recs,
            vec![
                OpenPortRecord::tcp("192.168.1.20", 22),
                OpenPortRecord::tcp("192.168.1.20", 80),
                OpenPortRecord::tcp("192.168.1.21", 53),
            ]
        );
    }

    #[test]
    fn port_lines_before_any_header_are_ignored() {
        assert!(parse_all("22/tcp open ssh\n").is_empty());
    }

    #[test]
    fn udp_lines_are_ignored() {
        assert!(parse_all("Nmap scan report for 10.0.0.1\n53/udp open domain\n").is_empty());
    }
}
