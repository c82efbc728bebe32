//! Tagged-markup (XML) encoding of a scan record.
//!
//! ```text
//! <scan>
//!   <metadata><date>2024-05-01 10:00:00</date><network>10.0.0.0/30</network></metadata>
//!   <screenshot>base64…</screenshot>
//!   <hosts>
//!     <host>
//!       <ip>10.0.0.1</ip><hostname>gw.lan</hostname>
//!       <ports>
//!         <port><port>22</port><service>ssh</service><version/><protocol>tcp</protocol></port>
//!       </ports>
//!     </host>
//!   </hosts>
//! </scan>
//! ```
use std::io::Cursor;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::error::StoreError;
use crate::types::{format_timestamp, parse_timestamp, screenshot_b64, HostResult, PortResult, ScanResult};
use crate::xml::{self, Element};

pub const ROOT_TAG: &str = "scan";

fn markup_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Markup(e.to_string())
}

struct MarkupWriter {
    inner: Writer<Cursor<Vec<u8>>>,
}

impl MarkupWriter {
    fn new() -> Self {
        Self {
            inner: Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2),
        }
    }

    fn event(&mut self, event: Event<'_>) -> Result<(), StoreError> {
        self.inner.write_event(event).map_err(markup_err)
    }

    fn open(&mut self, tag: &str) -> Result<(), StoreError> {
        self.event(Event::Start(BytesStart::new(tag)))
    }

    fn close(&mut self, tag: &str) -> Result<(), StoreError> {
        self.event(Event::End(BytesEnd::new(tag)))
    }

    /// `<tag>text</tag>`, or `<tag/>` for empty text.
    fn leaf(&mut self, tag: &str, text: &str) -> Result<(), StoreError> {
        if text.is_empty() {
            return self.event(Event::Empty(BytesStart::new(tag)));
        }
        self.open(tag)?;
        self.event(Event::Text(BytesText::new(text)))?;
        self.close(tag)
    }

    fn finish(self) -> Vec<u8> {
        self.inner.into_inner().into_inner()
    }
}

/// Encode a result as an XML document.
pub fn encode(result: &ScanResult) -> Result<Vec<u8>, StoreError> {
    let mut w = MarkupWriter::new();
    w.event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    w.open(ROOT_TAG)?;

    w.open("metadata")?;
    w.leaf("date", &format_timestamp(result.timestamp()))?;
    w.leaf("network", result.network())?;
    w.close("metadata")?;

    let shot = result.screenshot().map(screenshot_b64::encode).unwrap_or_default();
    w.leaf("screenshot", &shot)?;

    w.open("hosts")?;
    for host in result.hosts() {
        w.open("host")?;
        w.leaf("ip", &host.ip)?;
        w.leaf("hostname", &host.hostname)?;
        w.open("ports")?;
        for port in &host.ports {
            w.open("port")?;
            w.leaf("port", &port.port.to_string())?;
            w.leaf("service", &port.service)?;
            w.leaf("version", &port.version)?;
            w.leaf("protocol", port.protocol.as_str())?;
            w.close("port")?;
        }
        w.close("ports")?;
        w.close("host")?;
    }
    w.close("hosts")?;

    w.close(ROOT_TAG)?;
    let mut bytes = w.finish();
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode an XML document produced by [`encode`]. The filename is left unset.
pub fn decode(bytes: &[u8]) -> Result<ScanResult, StoreError> {
    let text = std::str::from_utf8(bytes).map_err(markup_err)?;
    let root = xml::parse(text).map_err(StoreError::Markup)?;
    if root.name != ROOT_TAG {
        return Err(StoreError::Markup(format!(
            "expected <{ROOT_TAG}> root, found <{}>",
            root.name
        )));
    }

    let meta = root
        .child("metadata")
        .ok_or_else(|| StoreError::Markup("missing <metadata>".into()))?;
    let timestamp = parse_timestamp(meta.child_text("date")).map_err(markup_err)?;
    let network = meta.child_text("network").to_string();
    let screenshot = screenshot_b64::decode(root.child_text("screenshot")).map_err(markup_err)?;

    let hosts = match root.child("hosts") {
        Some(hosts) => hosts
            .children_named("host")
            .map(decode_host)
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };

    ScanResult::new(network, timestamp, hosts, screenshot)
        .map_err(|e| StoreError::Invalid(e.to_string()))
}

fn decode_host(host: &Element) -> Result<HostResult, StoreError> {
    let ports = match host.child("ports") {
        Some(ports) => ports
            .children_named("port")
            .map(decode_port)
            .collect::<Result<Vec<_>, _>>()?,
        None => Vec::new(),
    };
    Ok(HostResult {
        ip: host.child_text("ip").to_string(),
        hostname: host.child_text("hostname").to_string(),
        ports,
    })
}

fn decode_port(port: &Element) -> Result<PortResult, StoreError> {
    let number = port.child_text("port");
    Ok(PortResult {
        port: number
            .parse::<u16>()
            .map_err(|e| StoreError::Markup(format!("bad port number {number:?}: {e}")))?,
        service: port.child_text("service").to_string(),
        version: port.child_text("version").to_string(),
        protocol: port.child_text("protocol").parse().map_err(StoreError::Markup)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;
    use time::macros::datetime;

    fn sample(screenshot: Option<Vec<u8>>) -> ScanResult {
        ScanResult::new(
            "10.0.0.0/30",
            datetime!(2024-05-01 10:00:00),
            vec![
                HostResult {
                    ip: "10.0.0.1".into(),
                    hostname: "gw & co.lan".into(),
                    ports: vec![
                        PortResult {
                            port: 22,
                            service: "ssh".into(),
                            version: "9.6p1".into(),
                            protocol: Protocol::Tcp,
                        },
                        PortResult {
                            port: 53,
                            service: "domain".into(),
                            version: String::new(),
                            protocol: Protocol::Udp,
                        },
                    ],
                },
                HostResult {
                    ip: "10.0.0.2".into(),
                    hostname: "unknown".into(),
                    ports: vec![],
                },
            ],
            screenshot,
        )
        .unwrap()
    }

    #[test]
    fn document_shape() {
        let text = String::from_utf8(encode(&sample(None)).unwrap()).unwrap();
        let root = xml::parse(&text).unwrap();
        assert_eq!(root.name, "scan");
        assert_eq!(root.child("metadata").unwrap().child_text("date"), "2024-05-01 10:00:00");
        let host = root.child("hosts").unwrap().child("host").unwrap();
        let port = host.child("ports").unwrap().child("port").unwrap();
        assert_eq!(port.child_text("port"), "22");
        assert!(text.contains("<version/>"));
        assert!(text.contains("gw &amp; co.lan"));
    }

    #[test]
    fn decode_restores_hosts_and_empty_versions() {
        let original = sample(Some(vec![0x89, b'P', b'N', b'G']));
        let decoded = decode(&encode(&original).unwrap()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.hosts()[0].ports[1].version, "");
        assert!(decoded.hosts()[1].ports.is_empty());
    }

    #[test]
    fn missing_screenshot_stays_absent() {
        let decoded = decode(&encode(&sample(None)).unwrap()).unwrap();
        assert!(decoded.screenshot().is_none());
    }

    #[test]
    fn wrong_root_rejected() {
        assert!(matches!(decode(b"<nmaprun/>"), Err(StoreError::Markup(_))));
        assert!(matches!(decode(b"{\"network\":1}"), Err(StoreError::Markup(_))));
    }
}
