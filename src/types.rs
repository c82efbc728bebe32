use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::{macros::format_description, OffsetDateTime, PrimitiveDateTime};

use crate::error::ScanError;

/// Sentinel used for hostnames that could not be resolved and for service
/// names nothing could identify.
pub const UNKNOWN: &str = "unknown";

/// Transport protocol of an open port.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unsupported protocol: {other}")),
        }
    }
}

/// One open port on a host. Closed and filtered ports never become a `PortResult`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortResult {
    pub port: u16,
    pub service: String,
    #[serde(default)]
    pub version: String,
    pub protocol: Protocol,
}

/// A host that was reported up, with its open ports in discovery order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HostResult {
    pub ip: String,
    pub hostname: String,
    #[serde(default)]
    pub ports: Vec<PortResult>,
}

/// The combined outcome of one scan run.
///
/// Fields are read through accessors; a value is built either by the
/// aggregator or through [`ScanResult::new`], which checks the host invariants.
/// The filename is set by the record store when the result is written or read back.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    #[serde(with = "scan_timestamp")]
    pub(crate) timestamp: PrimitiveDateTime,
    pub(crate) network: String,
    pub(crate) hosts: Vec<HostResult>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "screenshot_b64"
    )]
    pub(crate) screenshot: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) filename: Option<String>,
}

impl ScanResult {
    /// Build a result from already-normalised hosts.
    ///
    /// Rejects duplicate host addresses, port 0 and empty hostnames.
    pub fn new(
        network: impl Into<String>,
        timestamp: PrimitiveDateTime,
        hosts: Vec<HostResult>,
        screenshot: Option<Vec<u8>>,
    ) -> Result<Self, ScanError> {
        check_hosts(&hosts)?;
        Ok(Self {
            timestamp,
            network: network.into(),
            hosts,
            screenshot: screenshot.filter(|s| !s.is_empty()),
            filename: None,
        })
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub fn timestamp(&self) -> PrimitiveDateTime {
        self.timestamp
    }

    pub fn hosts(&self) -> &[HostResult] {
        &self.hosts
    }

    pub fn screenshot(&self) -> Option<&[u8]> {
        self.screenshot.as_deref()
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// Re-check the host invariants of a value that did not come through
    /// [`ScanResult::new`], e.g. one deserialized from a document.
    pub fn validated(self) -> Result<Self, ScanError> {
        check_hosts(&self.hosts)?;
        Ok(Self {
            screenshot: self.screenshot.filter(|s| !s.is_empty()),
            ..self
        })
    }

    /// Stamp the name of the file this result is stored in. The store calls
    /// this when writing and when reading, so the field always names the
    /// record's actual file.
    pub(crate) fn with_filename(mut self, filename: String) -> Self {
        self.filename = Some(filename);
        self
    }
}

fn check_hosts(hosts: &[HostResult]) -> Result<(), ScanError> {
    let mut seen = HashSet::new();
    for host in hosts {
        if !seen.insert(host.ip.as_str()) {
            return Err(ScanError::InvalidResult(format!(
                "duplicate host address {}",
                host.ip
            )));
        }
        if host.hostname.is_empty() {
            return Err(ScanError::InvalidResult(format!(
                "host {} has an empty hostname",
                host.ip
            )));
        }
        if let Some(p) = host.ports.iter().find(|p| p.port == 0) {
            return Err(ScanError::InvalidResult(format!(
                "host {} reports invalid port {}",
                host.ip, p.port
            )));
        }
    }
    Ok(())
}

/// Summary row for record listings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RecordSummary {
    pub filename: String,
    pub timestamp: String,
    pub host_count: usize,
    pub has_screenshot: bool,
}

/// One latency measurement in milliseconds, or `-1` when the target did not answer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(transparent)]
pub struct LatencySample(f64);

impl LatencySample {
    pub const UNREACHABLE: LatencySample = LatencySample(-1.0);

    /// Milliseconds rounded to two decimal places.
    pub fn from_rtt(rtt: Duration) -> Self {
        let ms = rtt.as_secs_f64() * 1000.0;
        LatencySample((ms * 100.0).round() / 100.0)
    }

    pub fn latency_ms(&self) -> f64 {
        self.0
    }

    pub fn is_unreachable(&self) -> bool {
        self.0 < 0.0
    }
}

/// Current local wall-clock time to the whole second, falling back to UTC
/// when the local offset is unknown.
pub fn now_local() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let time = now.time().replace_nanosecond(0).unwrap_or(now.time());
    PrimitiveDateTime::new(now.date(), time)
}

/// `YYYY-MM-DD HH:MM:SS`, the timestamp form used inside records.
pub fn format_timestamp(ts: PrimitiveDateTime) -> String {
    ts.format(format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second]"
    ))
    .unwrap_or_else(|_| String::from("1970-01-01 00:00:00"))
}

pub fn parse_timestamp(s: &str) -> Result<PrimitiveDateTime, time::error::Parse> {
    PrimitiveDateTime::parse(
        s.trim(),
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    )
}

pub(crate) mod scan_timestamp {
    use super::*;

    pub fn serialize<S: Serializer>(ts: &PrimitiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_timestamp(*ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<PrimitiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod screenshot_b64 {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine};

    pub fn serialize<S: Serializer>(shot: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match shot {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        decode(raw.as_deref().unwrap_or("")).map_err(serde::de::Error::custom)
    }

    /// Empty text means "no screenshot".
    pub fn decode(text: &str) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }
        STANDARD.decode(text).map(Some)
    }

    pub fn encode(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }
}
