use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, error, info};
use serde_json::Value;
use tokio::process::Command;
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use crate::models::{CertificateInfo, ClientTlsEvidence, ProbeError, TlsVersion};

/// Certificate evidence key: (peer address, peer port).
pub type Endpoint = (String, u16);

/// Extracts TLS evidence from a set of capture sources.
///
/// Each source is handed to the external packet inspector (tshark) and
/// its frames are filtered down to those sourced from the target
/// hardware address. Sources are visited strictly in the declared
/// order: a later source overwrites earlier certificate evidence for
/// the same endpoint.
pub struct CaptureInspector {
    sources: Vec<PathBuf>,
    target_mac: String,
}

impl CaptureInspector {
    pub fn new(sources: Vec<PathBuf>, target_mac: &str) -> Self {
        Self { sources, target_mac: target_mac.to_lowercase() }
    }

    /// Server certificates presented by the target device, keyed by the
    /// conversation endpoint they were seen on.
    pub async fn extract_certificates(&self) -> HashMap<Endpoint, CertificateInfo> {
        let mut certificates = HashMap::new();
        for source in &self.sources {
            let frames = read_frames(source).await;
            for (endpoint, der) in collect_certificate_frames(&frames, &self.target_mac) {
                match parse_certificate(&der) {
                    Ok(info) => insert_certificate(&mut certificates, endpoint, info),
                    Err(e) => debug!(
                        "Skipping unparseable certificate from {}:{}: {}",
                        endpoint.0, endpoint.1, e
                    ),
                }
            }
        }
        info!("Extracted {} certificate(s) from {} capture source(s)",
              certificates.len(), self.sources.len());
        certificates
    }

    /// Client hello evidence initiated by the target device across all
    /// capture sources.
    pub async fn client_evidence(&self) -> ClientTlsEvidence {
        let mut evidence = ClientTlsEvidence::default();
        for source in &self.sources {
            let frames = read_frames(source).await;
            collect_client_hellos(&frames, &self.target_mac, &mut evidence);
        }
        debug!("Observed {} client hello(s), versions {:?}",
               evidence.hello_count, evidence.versions);
        evidence
    }
}

/// Run the packet inspector over one capture file and return its frame
/// records. A missing or unreadable source is not an error; it simply
/// contributes no frames.
async fn read_frames(path: &Path) -> Vec<Value> {
    if !path.exists() {
        info!("Capture file {} not found, skipping", path.display());
        return Vec::new();
    }

    let output = match Command::new("tshark")
        .arg("-r")
        .arg(path)
        .args(["-Y", "tls", "-T", "json"])
        .output()
        .await
    {
        Ok(output) => output,
        Err(e) => {
            error!("Failed to launch tshark for {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    if !output.status.success() {
        error!(
            "tshark exited with status {} for {}",
            output.status.code().unwrap_or(-1),
            path.display()
        );
        return Vec::new();
    }

    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(Value::Array(frames)) => frames,
        Ok(_) => {
            error!("Unexpected tshark output shape for {}", path.display());
            Vec::new()
        }
        Err(e) => {
            error!("Could not parse tshark output for {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

fn layer<'a>(frame: &'a Value, name: &str) -> Option<&'a Value> {
    frame.get("_source")?.get("layers")?.get(name)
}

fn frame_is_from(frame: &Value, mac: &str) -> bool {
    layer(frame, "eth")
        .and_then(|eth| find_str(eth, "eth.src"))
        .map(|src| src.eq_ignore_ascii_case(mac))
        .unwrap_or(false)
}

/// Depth-first search for the first string value stored under `key`.
/// The inspector nests handshake fields arbitrarily deep inside the
/// TLS layer depending on record layout, so lookups walk the tree.
fn find_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(s)) = map.get(key) {
                return Some(s);
            }
            map.values().find_map(|v| find_str(v, key))
        }
        Value::Array(items) => items.iter().find_map(|v| find_str(v, key)),
        _ => None,
    }
}

/// Collect every string value stored under `key`, including values the
/// inspector folded into an array.
fn find_all<'a>(value: &'a Value, key: &str, out: &mut Vec<&'a str>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                if k == key {
                    match v {
                        Value::String(s) => out.push(s),
                        Value::Array(items) => {
                            out.extend(items.iter().filter_map(|i| i.as_str()))
                        }
                        _ => {}
                    }
                } else {
                    find_all(v, key, out);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                find_all(item, key, out);
            }
        }
        _ => {}
    }
}

/// Source endpoint of a frame; transport port comes from the TCP or UDP
/// layer, whichever is present.
fn source_endpoint(frame: &Value) -> Option<Endpoint> {
    let ip = layer(frame, "ip").and_then(|l| find_str(l, "ip.src"))?;
    let port = layer(frame, "tcp")
        .and_then(|l| find_str(l, "tcp.srcport"))
        .or_else(|| layer(frame, "udp").and_then(|l| find_str(l, "udp.srcport")))?;
    Some((ip.to_string(), port.parse().ok()?))
}

fn destination_endpoint(frame: &Value) -> Option<String> {
    let ip = layer(frame, "ip").and_then(|l| find_str(l, "ip.dst"))?;
    let port = layer(frame, "tcp")
        .and_then(|l| find_str(l, "tcp.dstport"))
        .or_else(|| layer(frame, "udp").and_then(|l| find_str(l, "udp.dstport")))?;
    Some(format!("{}:{}", ip, port))
}

/// Frames carrying a handshake certificate from the target device, in
/// capture order, with the certificate bytes decoded from their
/// colon-separated hex wire form.
pub(crate) fn collect_certificate_frames(frames: &[Value], mac: &str) -> Vec<(Endpoint, Vec<u8>)> {
    let mut collected = Vec::new();
    for frame in frames {
        let Some(tls) = layer(frame, "tls") else { continue };
        if !frame_is_from(frame, mac) {
            continue;
        }
        let Some(cert_hex) = find_str(tls, "tls.handshake.certificate") else { continue };
        let Some(der) = decode_hex(cert_hex) else {
            debug!("Malformed certificate hex in frame, skipping");
            continue;
        };
        let Some(endpoint) = source_endpoint(frame) else { continue };
        collected.push((endpoint, der));
    }
    collected
}

/// Each colon-separated group must hold a whole number of hex octets;
/// anything else (odd group, stray characters, non-ASCII junk) is
/// malformed, not a panic.
pub(crate) fn decode_hex(text: &str) -> Option<Vec<u8>> {
    let mut bytes = Vec::new();
    for group in text.split(':') {
        let group = group.as_bytes();
        if group.is_empty()
            || group.len() % 2 != 0
            || !group.iter().all(u8::is_ascii_hexdigit)
        {
            return None;
        }
        for pair in group.chunks(2) {
            let pair = std::str::from_utf8(pair).ok()?;
            bytes.push(u8::from_str_radix(pair, 16).ok()?);
        }
    }
    Some(bytes)
}

pub(crate) fn parse_certificate(der: &[u8]) -> Result<CertificateInfo, ProbeError> {
    let (_, cert) = parse_x509_certificate(der)
        .map_err(|e| ProbeError::Unparseable { tool: "tshark", reason: e.to_string() })?;

    let public_key_type = match cert.public_key().parsed() {
        Ok(PublicKey::RSA(_)) => "RSA",
        Ok(PublicKey::DSA(_)) => "DSA",
        Ok(PublicKey::EC(_)) => "EC",
        _ => "Unknown",
    };

    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before: cert.validity().not_before.to_string(),
        not_after: cert.validity().not_after.to_string(),
        serial_number: cert.raw_serial_as_string(),
        signature_algorithm: cert.signature_algorithm.algorithm.to_id_string(),
        version: cert.version().0,
        public_key_type: public_key_type.to_string(),
        der_length: der.len(),
        extensions: cert.extensions().iter().map(|e| e.oid.to_id_string()).collect(),
    })
}

/// Last write wins on duplicate endpoints: a certificate from a later
/// capture source replaces whatever an earlier source recorded there.
pub(crate) fn insert_certificate(
    table: &mut HashMap<Endpoint, CertificateInfo>,
    endpoint: Endpoint,
    info: CertificateInfo,
) {
    if let Some(previous) = table.insert(endpoint.clone(), info) {
        debug!(
            "Replacing certificate evidence for {}:{} (was {})",
            endpoint.0, endpoint.1, previous.subject
        );
    }
}

/// Fold client hello frames from the target device into the evidence.
pub(crate) fn collect_client_hellos(frames: &[Value], mac: &str, evidence: &mut ClientTlsEvidence) {
    for frame in frames {
        let Some(tls) = layer(frame, "tls") else { continue };
        if !frame_is_from(frame, mac) {
            continue;
        }
        // Handshake type 1 is a client hello.
        if find_str(tls, "tls.handshake.type") != Some("1") {
            continue;
        }
        evidence.hello_count += 1;

        if let Some(version) = find_str(tls, "tls.handshake.version").and_then(TlsVersion::from_wire)
        {
            evidence.versions.insert(version);
        }
        // A 1.3 hello still advertises 1.2 in the legacy version field;
        // the supported_versions extension carries the real ceiling.
        let mut codes = Vec::new();
        find_all(tls, "tls.handshake.extensions.supported_version", &mut codes);
        for code in codes {
            if let Some(version) = TlsVersion::from_wire(code) {
                evidence.versions.insert(version);
            }
        }

        if let Some(peer) = destination_endpoint(frame) {
            if !evidence.peers.contains(&peer) {
                evidence.peers.push(peer);
            }
        }
    }
}
