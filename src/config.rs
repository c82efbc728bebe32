use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::latency;
use crate::netdetect;
use crate::ports;
use crate::store::{Encoding, Precision};

/// Which discovery backend to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Nmap,
    Connect,
}

impl FromStr for ProbeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nmap" => Ok(ProbeKind::Nmap),
            "connect" | "tcp" => Ok(ProbeKind::Connect),
            other => Err(format!("unknown probe {other:?} (expected nmap or connect)")),
        }
    }
}

/// Remote archive settings; archiving is off when absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveConfig {
    /// `host` or `host:port`.
    pub endpoint: String,
    pub remote_dir: String,
    pub timeout: Duration,
}

/// Everything the pipeline needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// CIDR or single address to sweep.
    pub network: String,
    pub ports: Vec<u16>,
    pub probe: ProbeKind,
    pub nmap_path: String,
    pub probe_timeout: Duration,
    pub connect_concurrency: usize,
    pub connect_timeout: Duration,
    /// Screenshot command line; empty disables capture.
    pub capture_command: Vec<String>,
    pub capture_timeout: Duration,
    pub results_dir: PathBuf,
    pub encoding: Encoding,
    pub precision: Precision,
    pub archive: Option<ArchiveConfig>,
    pub latency_target: IpAddr,
    pub latency_timeout: Duration,
    pub latency_interval: Duration,
    pub bind: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: "192.168.1.0/24".into(),
            ports: ports::default_ports(),
            probe: ProbeKind::Nmap,
            nmap_path: "nmap".into(),
            probe_timeout: Duration::from_secs(600),
            connect_concurrency: 1000,
            connect_timeout: Duration::from_millis(400),
            capture_command: vec!["import".into(), "-window".into(), "root".into(), "png:-".into()],
            capture_timeout: Duration::from_secs(10),
            results_dir: PathBuf::from("scan_results"),
            encoding: Encoding::Json,
            precision: Precision::Seconds,
            archive: None,
            latency_target: latency::DEFAULT_TARGET,
            latency_timeout: latency::PROBE_TIMEOUT,
            latency_interval: latency::PROBE_INTERVAL,
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

impl Config {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        netdetect::parse_target(&self.network)?;
        if self.ports.is_empty() {
            bail!("port list is empty");
        }
        for (name, d) in [
            ("probe timeout", self.probe_timeout),
            ("connect timeout", self.connect_timeout),
            ("latency timeout", self.latency_timeout),
            ("latency interval", self.latency_interval),
        ] {
            if d.is_zero() {
                bail!("{name} must be greater than zero");
            }
        }
        if let Some(archive) = &self.archive {
            if archive.endpoint.trim().is_empty() {
                bail!("archive endpoint is empty");
            }
            if archive.timeout.is_zero() {
                bail!("archive timeout must be greater than zero");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_bad_settings() {
        let bad_net = Config {
            network: "300.1.1.0/24".into(),
            ..Config::default()
        };
        assert!(bad_net.validate().is_err());

        let no_ports = Config {
            ports: vec![],
            ..Config::default()
        };
        assert!(no_ports.validate().is_err());

        let zero = Config {
            latency_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(zero.validate().is_err());

        let archive = Config {
            archive: Some(ArchiveConfig {
                endpoint: " ".into(),
                remote_dir: "/scans".into(),
                timeout: Duration::from_secs(10),
            }),
            ..Config::default()
        };
        assert!(archive.validate().is_err());
    }

    #[test]
    fn probe_kind_parsing() {
        assert_eq!("NMAP".parse::<ProbeKind>().unwrap(), ProbeKind::Nmap);
        assert_eq!("tcp".parse::<ProbeKind>().unwrap(), ProbeKind::Connect);
        assert!("masscan".parse::<ProbeKind>().is_err());
    }
}
