use anyhow::{anyhow, Result};
use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{IpNet, Ipv4Net};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};

/// Detect local non-loopback IPv4 addresses and convert each to a default /24 CIDR network.
///
/// For example, an interface IP `192.168.1.42` becomes `192.168.1.0/24`.
/// Duplicates are removed.
pub fn detect_local_cidrs() -> Result<Vec<IpNet>> {
    let mut set = HashSet::<Ipv4Net>::new();
    for iface in get_if_addrs()? {
        if let IfAddr::V4(v4) = iface.addr {
            let ip = v4.ip;
            if ip.is_loopback() {
                continue;
            }
            let cidr = ipv4_to_default_cidr(ip);
            set.insert(cidr);
        }
    }
    let mut cidrs: Vec<IpNet> = set.into_iter().map(IpNet::V4).collect();
    // Sort for stable output
    cidrs.sort_by_key(|n| match n {
        IpNet::V4(n4) => (u32::from(n4.network()), n4.prefix_len()),
        IpNet::V6(_) => (0, 0),
    });
    Ok(cidrs)
}

/// The network to sweep when none is configured: the first detected local /24.
pub fn default_network() -> Result<IpNet> {
    detect_local_cidrs()?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no non-loopback IPv4 interface found"))
}

/// Parse a target that is either a CIDR or a single address (treated as /32).
pub fn parse_target(target: &str) -> Result<IpNet> {
    let t = target.trim();
    if t.contains('/') {
        return t.parse::<IpNet>().map_err(|e| anyhow!("invalid CIDR {t}: {e}"));
    }
    let ip = t.parse::<IpAddr>().map_err(|e| anyhow!("invalid IP {t}: {e}"))?;
    Ok(IpNet::from(ip))
}

/// Identity of the machine running the sweeps.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SystemInfo {
    pub hostname: String,
    pub ip: String,
    pub version: String,
}

/// Hostname, first non-loopback IPv4 and crate version. Lookups that fail
/// degrade to `"unknown"` / `"unavailable"`.
pub fn system_info() -> SystemInfo {
    let hostname = fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| crate::types::UNKNOWN.to_string());

    let ip = get_if_addrs()
        .ok()
        .and_then(|ifaces| {
            ifaces.into_iter().find_map(|iface| match iface.addr {
                IfAddr::V4(v4) if !v4.ip.is_loopback() => Some(v4.ip.to_string()),
                _ => None,
            })
        })
        .unwrap_or_else(|| "unavailable".to_string());

    SystemInfo {
        hostname,
        ip,
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

/// Expand a CIDR into individual IP addresses suitable for host scanning.
///
/// For IPv4, excludes the network and broadcast addresses.
/// IPv6 is not scanned in this project and returns an empty list.
pub fn expand_cidr_to_ips(cidr: IpNet) -> Vec<IpAddr> {
    match cidr {
        IpNet::V4(n4) => expand_ipv4net_hosts(n4)
            .into_iter()
            .map(IpAddr::V4)
            .collect(),
        IpNet::V6(_) => Vec::new(),
    }
}

/// Helper: convert an IPv4 address into its default /24 network.
pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    let net = Ipv4Addr::new(o[0], o[1], o[2], 0);
    Ipv4Net::new(net, 24).unwrap_or_default()
}

fn expand_ipv4net_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    // Use inclusive range of numeric IPs, then skip network and broadcast.
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if net.prefix_len() >= 31 {
        // /31 and /32 have no network/broadcast pair to skip
        return (start..=end).map(Ipv4Addr::from).collect();
    }
    (start + 1..end)
        .map(Ipv4Addr::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_cidr_from_ipv4() {
        let cidr = ipv4_to_default_cidr(Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(cidr.to_string(), "10.1.2.0/24");
    }

    #[test]
    fn expand_small_cidr_excludes_network_and_broadcast() {
        let net = Ipv4Net::new(Ipv4Addr::new(192, 168, 1, 0), 30).unwrap();
        // /30 -> 4 addresses: .0 network, .1 host, .2 host, .3 broadcast
        let hosts = expand_cidr_to_ips(IpNet::V4(net));
        let ips: Vec<Ipv4Addr> = hosts
            .into_iter()
            .filter_map(|ip| match ip { IpAddr::V4(v4) => Some(v4), _ => None })
            .collect();
        assert_eq!(ips, vec![
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(192, 168, 1, 2),
        ]);
    }

    #[test]
    fn single_address_target_is_host_route() {
        let net = parse_target("10.0.0.7").unwrap();
        assert_eq!(net.to_string(), "10.0.0.7/32");
        assert_eq!(expand_cidr_to_ips(net), vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))]);
        assert!(parse_target("10.0.0.0/33").is_err());
    }

    #[test]
    fn system_info_is_never_blank() {
        let info = system_info();
        assert!(!info.hostname.is_empty());
        assert!(!info.ip.is_empty());
        assert_eq!(info.version, env!("CARGO_PKG_VERSION"));
    }
}

