use anyhow::Result;
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{IpNet, Ipv4Net};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, UdpSocket};

use crate::types::NetInfo;

/// Local network facts consulted by target validation and engine selection.
///
/// Every method fails soft: an unavailable provider reports empty lists and
/// `None`, which callers treat as "nothing detected".
pub trait NetworkFacts: Send + Sync {
    /// Networks directly attached to this host.
    fn local_networks(&self) -> Vec<IpNet>;

    /// Addresses assigned to this host, loopback included.
    fn local_addrs(&self) -> Vec<IpAddr>;

    /// Interface carrying the default route.
    fn default_interface(&self) -> Option<String>;

    /// Source address the host would use for outbound traffic.
    fn source_addr(&self) -> Option<Ipv4Addr>;

    fn net_info(&self) -> NetInfo {
        NetInfo {
            interface: self.default_interface(),
            src_ip: self.source_addr().map(|ip| ip.to_string()),
            networks: self.local_networks(),
        }
    }
}

/// Reads facts from the host's interfaces on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemNetworkFacts;

impl NetworkFacts for SystemNetworkFacts {
    fn local_networks(&self) -> Vec<IpNet> {
        match detect_local_networks() {
            Ok(nets) => nets,
            Err(e) => {
                tracing::warn!("failed to detect local networks: {e}");
                Vec::new()
            }
        }
    }

    fn local_addrs(&self) -> Vec<IpAddr> {
        let mut set: HashSet<IpAddr> = HashSet::new();
        match get_if_addrs() {
            Ok(ifaces) => set.extend(ifaces.iter().map(|i| i.ip())),
            Err(e) => tracing::warn!("failed to list interface addresses: {e}"),
        }
        set.insert(IpAddr::V4(Ipv4Addr::LOCALHOST));
        set.insert(IpAddr::V6(Ipv6Addr::LOCALHOST));
        set.into_iter().collect()
    }

    fn default_interface(&self) -> Option<String> {
        let src = self.source_addr()?;
        let ifaces = get_if_addrs().ok()?;
        ifaces
            .into_iter()
            .find(|i| i.ip() == IpAddr::V4(src))
            .map(|i| i.name)
    }

    fn source_addr(&self) -> Option<Ipv4Addr> {
        // Connecting a UDP socket only selects a route; nothing is sent.
        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
        sock.connect((Ipv4Addr::new(1, 1, 1, 1), 53)).ok()?;
        match sock.local_addr().ok()?.ip() {
            IpAddr::V4(v4) if !v4.is_unspecified() => Some(v4),
            _ => None,
        }
    }
}

/// Fixed facts, for tests and for hosts where detection is not wanted.
#[derive(Debug, Clone, Default)]
pub struct StaticNetworkFacts {
    pub networks: Vec<IpNet>,
    pub addrs: Vec<IpAddr>,
    pub interface: Option<String>,
    pub source: Option<Ipv4Addr>,
}

impl NetworkFacts for StaticNetworkFacts {
    fn local_networks(&self) -> Vec<IpNet> {
        self.networks.clone()
    }

    fn local_addrs(&self) -> Vec<IpAddr> {
        let mut addrs = self.addrs.clone();
        addrs.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
        addrs.push(IpAddr::V6(Ipv6Addr::LOCALHOST));
        addrs
    }

    fn default_interface(&self) -> Option<String> {
        self.interface.clone()
    }

    fn source_addr(&self) -> Option<Ipv4Addr> {
        self.source
    }
}

/// Detect the IPv4 networks attached to non-loopback interfaces.
///
/// Each address is combined with its netmask, so `192.168.1.42/255.255.255.0`
/// becomes `192.168.1.0/24`. Duplicates are removed.
pub fn detect_local_networks() -> Result<Vec<IpNet>> {
    let mut set = HashSet::<Ipv4Net>::new();
    for iface in get_if_addrs()? {
        if let IfAddr::V4(v4) = iface.addr {
            if v4.ip.is_loopback() {
                continue;
            }
            let net = Ipv4Net::with_netmask(v4.ip, v4.netmask)
                .map(|n| n.trunc())
                .unwrap_or_else(|_| ipv4_to_default_cidr(v4.ip));
            set.insert(net);
        }
    }
    let mut nets: Vec<IpNet> = set.into_iter().map(IpNet::V4).collect();
    // Sort for stable output
    nets.sort_by_key(|n| match n {
        IpNet::V4(n4) => (u32::from(n4.network()), n4.prefix_len()),
        IpNet::V6(_) => (0, 0),
    });
    Ok(nets)
}

/// Convert an IPv4 address into its /24 network, e.g. `10.1.2.3` → `10.1.2.0/24`.
pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    Ipv4Net::new(Ipv4Addr::new(o[0], o[1], o[2], 0), 24).expect("/24 is always valid")
}
