use std::collections::HashMap;

use time::PrimitiveDateTime;
use tracing::warn;

use crate::discovery::{DiscoveredHost, DiscoveredPort};
use crate::services::ServiceTable;
use crate::types::{HostResult, PortResult, ScanResult, UNKNOWN};

/// Merge probe findings and an optional snapshot into one [`ScanResult`].
///
/// Hosts that are not up are dropped; hosts that are up stay even with no
/// open ports. Only ports in the `open` state survive. A host address the
/// probe reports twice is folded into its first occurrence.
pub fn aggregate(
    network: &str,
    discovered: Vec<DiscoveredHost>,
    snapshot: Option<Vec<u8>>,
    started_at: PrimitiveDateTime,
    services: &ServiceTable,
) -> ScanResult {
    let mut hosts: Vec<HostResult> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for host in discovered.into_iter().filter(|h| h.up) {
        let ports: Vec<PortResult> = host
            .ports
            .iter()
            .filter(|p| p.state == "open")
            .map(|p| normalize_port(p, services))
            .collect();

        if let Some(&pos) = index.get(&host.ip) {
            warn!(ip = %host.ip, "probe reported host twice; merging ports");
            let existing = &mut hosts[pos];
            for port in ports {
                let dup = existing
                    .ports
                    .iter()
                    .any(|p| p.port == port.port && p.protocol == port.protocol);
                if !dup {
                    existing.ports.push(port);
                }
            }
            continue;
        }

        index.insert(host.ip.clone(), hosts.len());
        hosts.push(HostResult {
            hostname: host
                .hostname
                .filter(|h| !h.trim().is_empty())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            ip: host.ip,
            ports,
        });
    }

    ScanResult {
        timestamp: started_at,
        network: network.to_string(),
        hosts,
        screenshot: snapshot.filter(|s| !s.is_empty()),
        filename: None,
    }
}

fn normalize_port(p: &DiscoveredPort, services: &ServiceTable) -> PortResult {
    PortResult {
        port: p.port,
        service: service_name(p, services),
        version: p.version.trim().to_string(),
        protocol: p.protocol,
    }
}

/// Probe-reported name, then the local table, then `"unknown"`.
fn service_name(p: &DiscoveredPort, services: &ServiceTable) -> String {
    let reported = p.service.trim();
    if !reported.is_empty() {
        return reported.to_string();
    }
    services
        .lookup(p.port, p.protocol)
        .filter(|name| !name.is_empty())
        .unwrap_or(UNKNOWN)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;
    use time::macros::datetime;

    fn port(port: u16, state: &str, service: &str) -> DiscoveredPort {
        DiscoveredPort {
            port,
            protocol: Protocol::Tcp,
            state: state.into(),
            service: service.into(),
            version: String::new(),
        }
    }

    fn host(ip: &str, up: bool, ports: Vec<DiscoveredPort>) -> DiscoveredHost {
        DiscoveredHost {
            ip: ip.into(),
            hostname: None,
            up,
            ports,
        }
    }

    fn table() -> ServiceTable {
        let mut t = ServiceTable::empty();
        t.insert(80, Protocol::Tcp, "http");
        t
    }

    #[test]
    fn service_fallback_chain() {
        let r = aggregate(
            "10.0.0.0/30",
            vec![host(
                "10.0.0.1",
                true,
                vec![port(22, "open", "ssh"), port(80, "open", ""), port(9999, "open", "")],
            )],
            None,
            datetime!(2024-05-01 10:00:00),
            &table(),
        );
        let services: Vec<&str> = r.hosts()[0].ports.iter().map(|p| p.service.as_str()).collect();
        assert_eq!(services, vec!["ssh", "http", "unknown"]);
    }

    #[test]
    fn host_without_ports_is_kept_and_down_hosts_dropped() {
        let r = aggregate(
            "10.0.0.0/29",
            vec![
                host("10.0.0.1", true, vec![]),
                host("10.0.0.2", false, vec![port(22, "open", "ssh")]),
                host("10.0.0.3", true, vec![port(22, "closed", "ssh"), port(23, "filtered", "")]),
            ],
            None,
            datetime!(2024-05-01 10:00:00),
            &table(),
        );
        let ips: Vec<&str> = r.hosts().iter().map(|h| h.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.3"]);
        assert!(r.hosts().iter().all(|h| h.ports.is_empty()));
        assert!(r.hosts().iter().all(|h| h.hostname == UNKNOWN));
    }

    #[test]
    fn duplicate_hosts_are_merged() {
        let r = aggregate(
            "n",
            vec![
                host("10.0.0.1", true, vec![port(22, "open", "ssh")]),
                host("10.0.0.1", true, vec![port(22, "open", "ssh"), port(80, "open", "")]),
            ],
            None,
            datetime!(2024-05-01 10:00:00),
            &table(),
        );
        assert_eq!(r.hosts().len(), 1);
        let ports: Vec<u16> = r.hosts()[0].ports.iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![22, 80]);
    }

    #[test]
    fn empty_snapshot_becomes_absent() {
        let r = aggregate("n", vec![], Some(Vec::new()), datetime!(2024-05-01 10:00:00), &table());
        assert!(r.screenshot().is_none());
        assert!(r.filename().is_none());
    }
}
