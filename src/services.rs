//! Local port/protocol to service-name lookup, the middle tier of service naming.
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::types::Protocol;

/// Default location of the system services database.
pub const SYSTEM_SERVICES_PATH: &str = "/etc/services";

const BUILTIN: &[(u16, Protocol, &str)] = &[
    (20, Protocol::Tcp, "ftp-data"),
    (21, Protocol::Tcp, "ftp"),
    (22, Protocol::Tcp, "ssh"),
    (23, Protocol::Tcp, "telnet"),
    (25, Protocol::Tcp, "smtp"),
    (53, Protocol::Tcp, "domain"),
    (53, Protocol::Udp, "domain"),
    (67, Protocol::Udp, "bootps"),
    (68, Protocol::Udp, "bootpc"),
    (69, Protocol::Udp, "tftp"),
    (80, Protocol::Tcp, "http"),
    (110, Protocol::Tcp, "pop3"),
    (123, Protocol::Udp, "ntp"),
    (137, Protocol::Udp, "netbios-ns"),
    (138, Protocol::Udp, "netbios-dgm"),
    (139, Protocol::Tcp, "netbios-ssn"),
    (143, Protocol::Tcp, "imap2"),
    (161, Protocol::Udp, "snmp"),
    (389, Protocol::Tcp, "ldap"),
    (443, Protocol::Tcp, "https"),
    (445, Protocol::Tcp, "microsoft-ds"),
    (514, Protocol::Udp, "syslog"),
    (587, Protocol::Tcp, "submission"),
    (631, Protocol::Tcp, "ipp"),
    (993, Protocol::Tcp, "imaps"),
    (995, Protocol::Tcp, "pop3s"),
    (1433, Protocol::Tcp, "ms-sql-s"),
    (1883, Protocol::Tcp, "mqtt"),
    (3306, Protocol::Tcp, "mysql"),
    (3389, Protocol::Tcp, "ms-wbt-server"),
    (5432, Protocol::Tcp, "postgresql"),
    (5900, Protocol::Tcp, "rfb"),
    (6379, Protocol::Tcp, "redis"),
    (8080, Protocol::Tcp, "http-alt"),
];

/// Service names keyed by (port, protocol).
#[derive(Debug, Clone, Default)]
pub struct ServiceTable {
    names: HashMap<(u16, Protocol), String>,
}

impl ServiceTable {
    /// An empty table; every lookup misses.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The compiled-in table of well-known ports.
    pub fn builtin() -> Self {
        let names = BUILTIN
            .iter()
            .map(|(port, proto, name)| ((*port, *proto), (*name).to_string()))
            .collect();
        Self { names }
    }

    /// The system services database layered over the built-in table.
    /// A missing or unreadable file leaves just the built-in entries.
    pub fn system() -> Self {
        let mut table = Self::builtin();
        match Self::from_path(SYSTEM_SERVICES_PATH) {
            Ok(sys) => {
                debug!(entries = sys.len(), "loaded system services database");
                table.names.extend(sys.names);
            }
            Err(e) => warn!("using built-in service names only: {e}"),
        }
        table
    }

    pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Parse `/etc/services` syntax: `name port/proto [aliases] [# comment]`.
    /// Lines that do not fit are skipped; the first name for a port wins.
    pub fn parse(content: &str) -> Self {
        let mut names = HashMap::new();
        for raw_line in content.lines() {
            let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
            let mut fields = line.split_whitespace();
            let (Some(name), Some(port_proto)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Some((port, proto)) = port_proto.split_once('/') else {
                continue;
            };
            let (Ok(port), Ok(proto)) = (port.parse::<u16>(), proto.parse::<Protocol>()) else {
                continue;
            };
            if port == 0 {
                continue;
            }
            names
                .entry((port, proto))
                .or_insert_with(|| name.to_string());
        }
        Self { names }
    }

    pub fn insert(&mut self, port: u16, protocol: Protocol, name: impl Into<String>) {
        self.names.insert((port, protocol), name.into());
    }

    pub fn lookup(&self, port: u16, protocol: Protocol) -> Option<&str> {
        self.names.get(&(port, protocol)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
