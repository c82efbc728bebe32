//! Host and service discovery.
//!
//! [`NmapProbe`] drives the external `nmap` binary and reads its XML report;
//! [`ConnectProbe`] is a built-in TCP connect sweep for machines without nmap.
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, warn};

use crate::error::ScanError;
use crate::netdetect;
use crate::ports::to_port_arg;
use crate::types::Protocol;
use crate::xml::{self, Element};

/// Per-port finding as reported by a probe, before any normalisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPort {
    pub port: u16,
    pub protocol: Protocol,
    /// Raw state string, e.g. `open`, `closed`, `filtered`, `open|filtered`.
    pub state: String,
    pub service: String,
    pub version: String,
}

/// Per-host finding as reported by a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHost {
    pub ip: String,
    pub hostname: Option<String>,
    pub up: bool,
    pub ports: Vec<DiscoveredPort>,
}

/// Something that can sweep a target range for hosts and open services.
#[async_trait]
pub trait DiscoveryProbe: Send + Sync {
    /// Sweep `target` (CIDR or address) over `ports`.
    ///
    /// An empty vector is a valid "nothing found" answer; `Err` means the
    /// probe itself could not run.
    async fn discover(&self, target: &str, ports: &[u16]) -> Result<Vec<DiscoveredHost>, ScanError>;
}

/// Settings for the nmap-backed probe.
#[derive(Debug, Clone)]
pub struct NmapConfig {
    pub nmap_path: String,
    /// Extra arguments placed before `-p`; timing and rate hints live here.
    pub extra_args: Vec<String>,
    pub timeout: Duration,
}

impl Default for NmapConfig {
    fn default() -> Self {
        Self {
            nmap_path: "nmap".to_string(),
            extra_args: vec!["-T4".into(), "--min-rate".into(), "1000".into()],
            timeout: Duration::from_secs(600),
        }
    }
}

pub struct NmapProbe {
    config: NmapConfig,
}

impl NmapProbe {
    pub fn new(config: NmapConfig) -> Self {
        Self { config }
    }

    fn args(&self, target: &str, ports: &[u16]) -> Vec<String> {
        let mut args = self.config.extra_args.clone();
        args.push(format!("-p{}", to_port_arg(ports)));
        args.push("-oX".into());
        args.push("-".into());
        args.push(target.to_string());
        args
    }
}

#[async_trait]
impl DiscoveryProbe for NmapProbe {
    async fn discover(&self, target: &str, ports: &[u16]) -> Result<Vec<DiscoveredHost>, ScanError> {
        let args = self.args(target, ports);
        debug!(nmap = %self.config.nmap_path, ?args, "executing nmap");

        let mut cmd = Command::new(&self.config.nmap_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match time::timeout(self.config.timeout, cmd.output()).await {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                return Err(ScanError::Probe(format!(
                    "failed to execute {}: {e}",
                    self.config.nmap_path
                )))
            }
            Err(_) => {
                return Err(ScanError::Probe(format!(
                    "nmap did not finish within {}s",
                    self.config.timeout.as_secs()
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ScanError::Probe(format!(
                "nmap exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let hosts = parse_nmap_xml(&String::from_utf8_lossy(&output.stdout))?;
        info!(target, hosts = hosts.len(), "nmap sweep finished");
        Ok(hosts)
    }
}

/// Read an nmap `-oX` report into per-host findings.
pub fn parse_nmap_xml(report: &str) -> Result<Vec<DiscoveredHost>, ScanError> {
    let root = xml::parse(report).map_err(|e| ScanError::Probe(format!("unreadable nmap report: {e}")))?;
    if root.name != "nmaprun" {
        return Err(ScanError::Probe(format!(
            "unexpected nmap report root <{}>",
            root.name
        )));
    }
    Ok(root.children_named("host").filter_map(host_from_element).collect())
}

fn host_from_element(host: &Element) -> Option<DiscoveredHost> {
    let ip = host
        .children_named("address")
        .find(|a| matches!(a.attr("addrtype"), Some("ipv4") | Some("ipv6")))
        .and_then(|a| a.attr("addr"))?
        .to_string();

    let up = host
        .child("status")
        .and_then(|s| s.attr("state"))
        .map(|s| s == "up")
        .unwrap_or(false);

    let hostname = host
        .child("hostnames")
        .and_then(|h| h.child("hostname"))
        .and_then(|h| h.attr("name"))
        .filter(|n| !n.is_empty())
        .map(str::to_string);

    let ports = host
        .child("ports")
        .map(|ports| ports.children_named("port").filter_map(port_from_element).collect())
        .unwrap_or_default();

    Some(DiscoveredHost { ip, hostname, up, ports })
}

fn port_from_element(port: &Element) -> Option<DiscoveredPort> {
    let protocol = port.attr("protocol")?.parse::<Protocol>().ok()?;
    let number = port.attr("portid")?.parse::<u16>().ok().filter(|p| *p != 0)?;
    let state = port
        .child("state")
        .and_then(|s| s.attr("state"))
        .unwrap_or("unknown")
        .to_string();
    let service = port.child("service");
    Some(DiscoveredPort {
        port: number,
        protocol,
        state,
        service: service.and_then(|s| s.attr("name")).unwrap_or("").to_string(),
        version: service.and_then(|s| s.attr("version")).unwrap_or("").to_string(),
    })
}

/// TCP connect sweep over every address of the target range.
///
/// Only hosts with at least one accepting port are reported; service names
/// are left empty for the aggregator to resolve.
pub struct ConnectProbe {
    concurrency: usize,
    timeout: Duration,
}

impl ConnectProbe {
    pub fn new(concurrency: usize, timeout: Duration) -> Self {
        Self {
            concurrency: concurrency.clamp(1, 5_000),
            timeout,
        }
    }
}

#[async_trait]
impl DiscoveryProbe for ConnectProbe {
    async fn discover(&self, target: &str, ports: &[u16]) -> Result<Vec<DiscoveredHost>, ScanError> {
        let net = netdetect::parse_target(target).map_err(|e| ScanError::Probe(e.to_string()))?;
        if matches!(net, IpNet::V6(_)) {
            return Err(ScanError::Probe(
                "IPv6 targets are not supported by the connect probe".into(),
            ));
        }
        let targets = netdetect::expand_cidr_to_ips(net);
        let open = connect_sweep(&targets, ports, self.concurrency, self.timeout).await;

        // Keep the sweep's address order, not completion order.
        let mut hosts: Vec<DiscoveredHost> = Vec::new();
        for ip in &targets {
            let mut found: Vec<u16> = open
                .iter()
                .filter(|(addr, _)| addr == ip)
                .map(|(_, port)| *port)
                .collect();
            if found.is_empty() {
                continue;
            }
            found.sort_unstable();
            hosts.push(DiscoveredHost {
                ip: ip.to_string(),
                hostname: None,
                up: true,
                ports: found
                    .into_iter()
                    .map(|port| DiscoveredPort {
                        port,
                        protocol: Protocol::Tcp,
                        state: "open".into(),
                        service: String::new(),
                        version: String::new(),
                    })
                    .collect(),
            });
        }
        info!(target, hosts = hosts.len(), "connect sweep finished");
        Ok(hosts)
    }
}

/// Concurrent TCP connects bounded by a semaphore; returns the accepting (ip, port) pairs.
async fn connect_sweep(
    targets: &[IpAddr],
    ports: &[u16],
    concurrency: usize,
    timeout: Duration,
) -> Vec<(IpAddr, u16)> {
    let sem = Arc::new(Semaphore::new(concurrency));
    let open = Arc::new(Mutex::new(Vec::new()));
    let mut set = JoinSet::new();

    for &ip in targets {
        for &port in ports {
            let permit = match sem.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let open = open.clone();
            set.spawn(async move {
                let _permit = permit;
                let addr = SocketAddr::new(ip, port);
                if let Ok(Ok(_stream)) = time::timeout(timeout, TcpStream::connect(addr)).await {
                    open.lock().await.push((ip, port));
                }
            });
        }
    }

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            warn!("connect task failed: {e}");
        }
    }

    let mut guard = open.lock().await;
    std::mem::take(&mut *guard)
}
