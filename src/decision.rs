use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use ipnet::IpNet;
use tracing::{info, warn};

use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::netdetect::{ipv4_to_default_cidr, NetworkFacts};
use crate::ports::{resolve_port_spec, validate_port_spec};
use crate::types::{Decision, EngineKind, ScanPlan};

const VERIFY_WAIT_SECS: u64 = 2;
const FAST_WAIT_SECS: u64 = 5;

/// Picks the scan engine and resolves per-run parameters from local facts.
#[derive(Clone)]
pub struct DecisionEngine {
    facts: Arc<dyn NetworkFacts>,
}

impl DecisionEngine {
    pub fn new(facts: Arc<dyn NetworkFacts>) -> Self {
        Self { facts }
    }

    pub fn facts(&self) -> &dyn NetworkFacts {
        self.facts.as_ref()
    }

    /// Choose an engine for the target set. First matching target wins.
    pub fn decide(&self, targets: &[String]) -> Decision {
        let local = self.facts.local_addrs();

        for t in targets.iter().map(|t| t.trim()) {
            if t == "localhost" {
                return verify("localhost target");
            }
            if let Ok(ip) = t.parse::<IpAddr>() {
                if local.contains(&ip) {
                    return verify("self-scan target (local IP)");
                }
                if matches!(ip, IpAddr::V4(v4) if is_docker_like(v4)) {
                    return verify("docker-like target range");
                }
            } else if let Ok(IpNet::V4(net)) = t.parse::<IpNet>() {
                if net.prefix_len() >= 16 && is_docker_like(net.network()) {
                    return verify("docker-like CIDR range");
                }
            }
        }

        Decision {
            engine: EngineKind::Fast,
            reason: "default".into(),
            wait_seconds: FAST_WAIT_SECS,
        }
    }

    /// Interface of the default route, if one can be found.
    pub fn default_interface(&self) -> Option<String> {
        self.facts.default_interface()
    }

    /// Resolve targets, engine, interface, wait and ports for one run.
    ///
    /// Explicit configuration always wins over detected values.
    pub fn plan(&self, config: &ScanConfig) -> Result<ScanPlan> {
        let mut targets: Vec<String> = config
            .targets
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        if targets.is_empty() && config.auto_targets {
            let src = self.facts.source_addr().ok_or(ScanError::AutoTargets)?;
            let cidr = ipv4_to_default_cidr(src).to_string();
            info!(%cidr, "auto targets enabled");
            targets.push(cidr);
        }
        if targets.is_empty() {
            return Err(ScanError::NoTargets);
        }

        validate_port_spec(&config.ports)?;

        let decision = self.decide(&targets);

        let interface = match config.interface.as_deref().map(str::trim) {
            Some(ifc) if !ifc.is_empty() => Some(ifc.to_string()),
            _ => {
                let detected = self.default_interface();
                match &detected {
                    Some(ifc) => info!(interface = %ifc, "auto-detected interface"),
                    None => warn!("failed to auto-detect interface"),
                }
                detected
            }
        };

        let wait_seconds = if config.wait_seconds > 0 {
            config.wait_seconds
        } else {
            info!(wait = decision.wait_seconds, reason = %decision.reason, "auto wait_seconds");
            decision.wait_seconds
        };

        Ok(ScanPlan {
            ports: resolve_port_spec(&config.ports, decision.engine),
            targets,
            engine: decision.engine,
            interface,
            wait_seconds,
            reason: decision.reason,
        })
    }
}

fn verify(reason: &str) -> Decision {
    Decision {
        engine: EngineKind::Verify,
        reason: reason.into(),
        wait_seconds: VERIFY_WAIT_SECS,
    }
}

/// 172.17.0.0 – 172.31.255.255, where container bridges usually live.
fn is_docker_like(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 172 && (17..=31).contains(&o[1])
}
