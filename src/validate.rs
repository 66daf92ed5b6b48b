//! Scope control for user-supplied targets.
//!
//! Private, loopback and link-local space is always in scope; public space
//! only when it belongs to a network this host is attached to. This stops an
//! accidental internet-wide scan from the UI; it is not a security boundary.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{Result, ScanError};
use crate::netdetect::NetworkFacts;

const MAX_HOSTNAME_LEN: usize = 253;

/// A target string after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Hostname(String),
    Host(IpAddr),
    Network(IpNet),
}

impl Target {
    pub fn parse(raw: &str) -> Result<Self> {
        let t = raw.trim();
        if t.is_empty() {
            return Err(ScanError::Validation("invalid target: empty".into()));
        }
        if let Ok(ip) = t.parse::<IpAddr>() {
            return Ok(Target::Host(ip));
        }
        if t.contains('/') {
            return t
                .parse::<IpNet>()
                .map(Target::Network)
                .map_err(|_| ScanError::Validation(format!("invalid target: {t}")));
        }
        if is_hostname(t) {
            return Ok(Target::Hostname(t.to_string()));
        }
        Err(ScanError::Validation(format!("invalid target: {t}")))
    }

    /// A network whose mask covers exactly one address.
    pub fn is_single_host(&self) -> bool {
        match self {
            Target::Host(_) => true,
            Target::Network(net) => net.prefix_len() == net.max_prefix_len(),
            Target::Hostname(_) => false,
        }
    }
}

/// Reject the request if any target is malformed or out of scope.
pub fn validate_targets(targets: &[String], facts: &dyn NetworkFacts) -> Result<()> {
    if targets.is_empty() {
        return Err(ScanError::Validation("no targets specified".into()));
    }

    // Detection can fail inside containers; an empty list only narrows scope.
    let allowed = facts.local_networks();

    for raw in targets {
        let base = match Target::parse(raw)? {
            Target::Hostname(_) => continue,
            Target::Host(ip) => ip,
            Target::Network(net) => net.network(),
        }
        .to_canonical();
        if is_safe_ip(base) {
            continue;
        }
        if !allowed.iter().any(|n| n.contains(&base)) {
            return Err(ScanError::Validation(format!(
                "target {} is outside allowed networks",
                raw.trim()
            )));
        }
    }
    Ok(())
}

/// Loopback, private (RFC 1918, `fc00::/7`) or link-local. IPv4-mapped
/// IPv6 addresses are judged as their IPv4 form.
pub fn is_safe_ip(ip: IpAddr) -> bool {
    match ip.to_canonical() {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

fn is_hostname(s: &str) -> bool {
    if s.len() > MAX_HOSTNAME_LEN || s.starts_with('-') {
        return false;
    }
    !s.chars()
        .any(|c| c.is_whitespace() || matches!(c, '/' | '\\' | '@' | ':' | '?' | '#'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netdetect::StaticNetworkFacts;

    fn targets(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn no_facts() -> StaticNetworkFacts {
        StaticNetworkFacts::default()
    }

    #[test]
    fn classify_targets() {
        assert_eq!(Target::parse("localhost").unwrap(), Target::Hostname("localhost".into()));
        assert!(matches!(Target::parse("10.0.0.1").unwrap(), Target::Host(_)));
        assert!(matches!(Target::parse("::1").unwrap(), Target::Host(_)));
        assert!(matches!(Target::parse("10.0.0.0/8").unwrap(), Target::Network(_)));
        assert!(Target::parse("10.0.0.1/32").unwrap().is_single_host());
        assert!(!Target::parse("10.0.0.0/31").unwrap().is_single_host());
    }

    #[test]
    fn empty_list_fails() {
        assert!(validate_targets(&[], &no_facts()).is_err());
    }

    #[test]
    fn hostnames_always_accepted() {
        let t = targets(&["localhost", "nas.lan", "printer"]);
        assert!(validate_targets(&t, &no_facts()).is_ok());
    }

    #[test]
    fn safe_addresses_and_networks_accepted() {
        let t = targets(&[
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.0/12",
            "192.168.1.0/24",
            "169.254.10.10",
            "fd00::1",
            "fe80::1/64",
            "::1",
        ]);
        assert!(validate_targets(&t, &no_facts()).is_ok());
    }

    #[test]
    fn public_ip_rejected_without_local_networks() {
        let err = validate_targets(&targets(&["8.8.8.8"]), &no_facts()).unwrap_err();
        assert!(err.to_string().contains("outside allowed networks"));
        assert!(validate_targets(&targets(&["8.8.8.8/32"]), &no_facts()).is_err());
        assert!(validate_targets(&targets(&["8.8.0.0/16"]), &no_facts()).is_err());
    }

    #[test]
    fn public_ip_inside_local_network_accepted() {
        let facts = StaticNetworkFacts {
            networks: vec!["203.0.113.0/24".parse().unwrap()],
            ..Default::default()
        };
        assert!(validate_targets(&targets(&["203.0.113.7"]), &facts).is_ok());
        assert!(validate_targets(&targets(&["203.0.113.7/32"]), &facts).is_ok());
        assert!(validate_targets(&targets(&["203.0.113.0/25"]), &facts).is_ok());
        assert!(validate_targets(&targets(&["198.51.100.1"]), &facts).is_err());
    }

    #[test]
    fn ipv4_mapped_addresses_use_ipv4_rules() {
        assert!(is_safe_ip("::ffff:10.0.0.1".parse().unwrap()));
        assert!(is_safe_ip("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!is_safe_ip("::ffff:8.8.8.8".parse().unwrap()));
        assert!(validate_targets(&targets(&["::ffff:192.168.1.10"]), &no_facts()).is_ok());
        assert!(validate_targets(&targets(&["::ffff:8.8.8.8"]), &no_facts()).is_err());
    }

    #[test]
    fn malformed_targets_rejected() {
        for bad in ["", "  ", "10.0.0.0/40", "http://example.com", "a b", "user@host", "-sV", "host:80"] {
            let err = validate_targets(&targets(&[bad]), &no_facts()).unwrap_err();
            assert!(matches!(err, ScanError::Validation(_)), "{bad}");
        }
        let long = "a".repeat(254);
        assert!(validate_targets(&[long], &no_facts()).is_err());
    }

    #[test]
    fn one_bad_target_fails_whole_list() {
        let t = targets(&["192.168.0.1", "1.1.1.1"]);
        assert!(validate_targets(&t, &no_facts()).is_err());
    }
}
