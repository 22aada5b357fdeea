use std::collections::HashMap;
use std::net::IpAddr;

use log::{debug, error, info};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tokio::process::Command;

use crate::models::{OpenPort, PortState, ProbeError, Protocol};

/// Port and service discovery against one target address.
///
/// Drives the external discovery tool (nmap) for TCP and UDP
/// independently and normalizes its XML output into a keyed table of
/// `OpenPort` records. The table is private to one invocation.
pub struct PortScanner {
    target: IpAddr,
    /// Upper bound of the `1-N` TCP range probed with service detection.
    tcp_port_limit: u16,
    /// Explicit UDP port list from policy; empty skips UDP entirely.
    udp_ports: Vec<u16>,
}

impl PortScanner {
    pub fn new(target: IpAddr, tcp_port_limit: u16, udp_ports: Vec<u16>) -> Self {
        Self { target, tcp_port_limit, udp_ports }
    }

    /// Run the TCP and UDP probes concurrently and merge their tables.
    ///
    /// The caller suspends until both probes have finished. A probe that
    /// fails (tool unavailable, non-zero exit, unparseable output) is
    /// logged and contributes an empty table; it never aborts the other
    /// probe or the scan as a whole.
    pub async fn scan(&self) -> HashMap<String, OpenPort> {
        info!("Running port discovery against {}", self.target);

        let tcp = tokio::spawn(scan_tcp(self.target, self.tcp_port_limit));
        let udp = tokio::spawn(scan_udp(self.target, self.udp_ports.clone()));
        let (tcp_table, udp_table) = futures::future::join(tcp, udp).await;

        let tcp_table = tcp_table.unwrap_or_else(|e| {
            error!("TCP scan task failed: {}", e);
            HashMap::new()
        });
        let udp_table = udp_table.unwrap_or_else(|e| {
            error!("UDP scan task failed: {}", e);
            HashMap::new()
        });

        debug!("TCP scan results: {:?}", tcp_table.keys().collect::<Vec<_>>());
        debug!("UDP scan results: {:?}", udp_table.keys().collect::<Vec<_>>());

        merge_results(tcp_table, udp_table)
    }
}

/// TCP results are applied first, then UDP on top. Keys embed the
/// protocol, so the two tables stay disjoint; if a key ever collided
/// the UDP record would win (last write).
pub(crate) fn merge_results(
    tcp: HashMap<String, OpenPort>,
    udp: HashMap<String, OpenPort>,
) -> HashMap<String, OpenPort> {
    let mut merged = tcp;
    merged.extend(udp);
    merged
}

async fn scan_tcp(target: IpAddr, max_port: u16) -> HashMap<String, OpenPort> {
    info!("Running TCP port scan");
    let args = vec![
        "--open".to_string(),
        "-sT".to_string(),
        "-sV".to_string(),
        "-Pn".to_string(),
        "-v".to_string(),
        "-p".to_string(),
        format!("1-{}", max_port),
        "--version-intensity".to_string(),
        "7".to_string(),
        "-T4".to_string(),
        "-oX".to_string(),
        "-".to_string(),
        target.to_string(),
    ];
    match run_nmap(args).await.and_then(|xml| parse_nmap_xml(&xml)) {
        Ok(table) => {
            info!("TCP port scan complete");
            table
        }
        Err(e) => {
            error!("TCP port scan failed: {}", e);
            HashMap::new()
        }
    }
}

async fn scan_udp(target: IpAddr, ports: Vec<u16>) -> HashMap<String, OpenPort> {
    if ports.is_empty() {
        // Not an error: no UDP rules in policy means nothing to probe.
        debug!("No UDP ports configured, skipping UDP scan");
        return HashMap::new();
    }
    let port_list = ports.iter().map(u16::to_string).collect::<Vec<_>>().join(",");
    info!("Running UDP port scan");
    debug!("UDP ports: {}", port_list);

    let args = vec![
        "-sU".to_string(),
        "-sV".to_string(),
        "-p".to_string(),
        port_list,
        "-oX".to_string(),
        "-".to_string(),
        target.to_string(),
    ];
    match run_nmap(args).await.and_then(|xml| parse_nmap_xml(&xml)) {
        Ok(table) => {
            info!("UDP port scan complete");
            table
        }
        Err(e) => {
            error!("UDP port scan failed: {}", e);
            HashMap::new()
        }
    }
}

async fn run_nmap(args: Vec<String>) -> Result<String, ProbeError> {
    let output = Command::new("nmap")
        .args(&args)
        .output()
        .await
        .map_err(|e| ProbeError::Spawn { tool: "nmap", source: e })?;
    if !output.status.success() {
        return Err(ProbeError::ToolFailed {
            tool: "nmap",
            status: output.status.code().unwrap_or(-1),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name)
        .map(|a| String::from_utf8_lossy(&a.value).into_owned())
}

/// Normalize the discovery tool's XML into the keyed port table.
///
/// The document nests host -> ports -> port; a host with one open port
/// carries a single `port` element where a busier host carries many.
/// The event reader visits every `port` element the same way, so both
/// shapes land in the same table.
pub(crate) fn parse_nmap_xml(xml: &str) -> Result<HashMap<String, OpenPort>, ProbeError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut table = HashMap::new();
    let mut current: Option<OpenPort> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"port" => {
                    let protocol = attr(&e, b"protocol").and_then(|p| p.parse::<Protocol>().ok());
                    let number = attr(&e, b"portid").and_then(|p| p.parse::<u16>().ok());
                    current = match (number, protocol) {
                        (Some(number), Some(protocol)) => Some(OpenPort {
                            number,
                            protocol,
                            state: PortState::Unknown,
                            service: String::new(),
                            version: String::new(),
                        }),
                        _ => {
                            debug!("Skipping port element with missing attributes");
                            None
                        }
                    };
                }
                b"state" => {
                    if let Some(port) = current.as_mut() {
                        port.state = attr(&e, b"state")
                            .and_then(|s| s.parse().ok())
                            .unwrap_or(PortState::Unknown);
                    }
                }
                b"service" => {
                    if let Some(port) = current.as_mut() {
                        port.service = attr(&e, b"name").unwrap_or_default();
                        // Missing version or extra info defaults to empty;
                        // when both are present a single space separates them.
                        port.version = match (attr(&e, b"version"), attr(&e, b"extrainfo")) {
                            (Some(version), Some(extra)) => format!("{} {}", version, extra),
                            (Some(version), None) => version,
                            (None, Some(extra)) => extra,
                            (None, None) => String::new(),
                        };
                    }
                }
                _ => {}
            },
            Ok(Event::End(e)) if e.name().as_ref() == b"port" => {
                if let Some(port) = current.take() {
                    table.insert(port.key(), port);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(ProbeError::Unparseable { tool: "nmap", reason: e.to_string() })
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(table)
}
