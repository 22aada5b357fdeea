use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;

/// Compliance outcome of a single check.
///
/// A check that runs but finds nothing to judge reports `NotDetected`;
/// a check whose probe tooling fails reports `Error`. Neither aborts
/// the surrounding test run.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Compliant,
    #[serde(rename = "Non-Compliant")]
    NonCompliant,
    Error,
    #[serde(rename = "Feature Not Detected")]
    NotDetected,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Compliant => write!(f, "Compliant"),
            Verdict::NonCompliant => write!(f, "Non-Compliant"),
            Verdict::Error => write!(f, "Error"),
            Verdict::NotDetected => write!(f, "Feature Not Detected"),
        }
    }
}

/// Lifecycle state of a test run.
///
/// `Complete`, `Error` and `Cancelled` are terminal; the next admitted
/// run resets the machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Idle,
    #[serde(rename = "Waiting for Device")]
    WaitingForDevice,
    #[serde(rename = "In Progress")]
    InProgress,
    Complete,
    Error,
    Cancelled,
}

impl RunStatus {
    /// Whether the run has reached a state it will never leave on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Complete | RunStatus::Error | RunStatus::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Idle => write!(f, "Idle"),
            RunStatus::WaitingForDevice => write!(f, "Waiting for Device"),
            RunStatus::InProgress => write!(f, "In Progress"),
            RunStatus::Complete => write!(f, "Complete"),
            RunStatus::Error => write!(f, "Error"),
            RunStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Transport protocol of a discovered port.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(format!("Invalid protocol: {}", s)),
        }
    }
}

/// Port state as reported by the discovery tool.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortState {
    Open,
    Closed,
    Filtered,
    Unfiltered,
    OpenFiltered,
    Unknown,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Open => write!(f, "open"),
            PortState::Closed => write!(f, "closed"),
            PortState::Filtered => write!(f, "filtered"),
            PortState::Unfiltered => write!(f, "unfiltered"),
            PortState::OpenFiltered => write!(f, "open|filtered"),
            PortState::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for PortState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The discovery tool occasionally emits states we do not act on;
        // those are kept as Unknown rather than rejected.
        match s.to_lowercase().as_str() {
            "open" => Ok(PortState::Open),
            "closed" => Ok(PortState::Closed),
            "filtered" => Ok(PortState::Filtered),
            "unfiltered" => Ok(PortState::Unfiltered),
            "open|filtered" => Ok(PortState::OpenFiltered),
            _ => Ok(PortState::Unknown),
        }
    }
}

/// One discovered port with its detected service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPort {
    pub number: u16,
    pub protocol: Protocol,
    pub state: PortState,
    pub service: String,
    /// Service version banner; empty when the tool reported none.
    pub version: String,
}

impl OpenPort {
    /// Composite table key, e.g. `"22tcp"`. Later discoveries of the
    /// same key overwrite earlier ones.
    pub fn key(&self) -> String {
        format!("{}{}", self.number, self.protocol)
    }

    /// Violation identifier used in check messages, e.g. `"21/tcp"`.
    pub fn id(&self) -> String {
        format!("{}/{}", self.number, self.protocol)
    }
}

/// Parsed certificate evidence for one conversation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub not_before: String,
    pub not_after: String,
    pub serial_number: String,
    pub signature_algorithm: String,
    pub version: u32,
    /// Public key family: RSA, DSA, EC or Unknown.
    pub public_key_type: String,
    /// Length of the wire (DER) encoding in bytes.
    pub der_length: usize,
    /// Extension OIDs present on the certificate.
    pub extensions: Vec<String>,
}

/// Named, timestamped verdict appended to a test run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub result: Verdict,
    pub message: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

impl CheckResult {
    pub fn new(name: impl Into<String>, result: Verdict, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            result,
            message: message.into(),
            detail: String::new(),
            tags: Vec::new(),
            recorded_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Per-module enable flag as stored in the device registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub enabled: bool,
}

/// A registered target device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub mac_addr: String,
    pub manufacturer: String,
    pub model: String,
    /// Module selection; a module absent from the map runs by default.
    #[serde(default)]
    pub test_modules: HashMap<String, ModuleConfig>,
    /// Firmware label, bound when a run is admitted.
    #[serde(default)]
    pub firmware: String,
}

impl Device {
    pub fn module_enabled(&self, name: &str) -> bool {
        self.test_modules.get(name).map(|m| m.enabled).unwrap_or(true)
    }
}

/// The unit of execution: one compliance evaluation of one device.
#[derive(Debug, Clone, Serialize)]
pub struct TestRun {
    pub status: RunStatus,
    pub device: Option<Device>,
    pub started: Option<DateTime<Utc>>,
    pub results: Vec<CheckResult>,
}

impl TestRun {
    pub fn new() -> Self {
        Self {
            status: RunStatus::Idle,
            device: None,
            started: None,
            results: Vec::new(),
        }
    }

    /// Clear any prior run state. Called on admission of the next run.
    pub fn reset(&mut self) {
        self.status = RunStatus::Idle;
        self.device = None;
        self.started = None;
        self.results.clear();
    }
}

impl Default for TestRun {
    fn default() -> Self {
        Self::new()
    }
}

/// TLS protocol versions the engine can reason about.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TlsVersion {
    V1_0,
    V1_1,
    V1_2,
    V1_3,
}

impl TlsVersion {
    pub const ALL: [TlsVersion; 4] =
        [TlsVersion::V1_0, TlsVersion::V1_1, TlsVersion::V1_2, TlsVersion::V1_3];

    /// Map a handshake wire code (e.g. `"0x0303"`) to a version.
    pub fn from_wire(code: &str) -> Option<Self> {
        match code {
            "0x0301" | "0x00000301" => Some(TlsVersion::V1_0),
            "0x0302" | "0x00000302" => Some(TlsVersion::V1_1),
            "0x0303" | "0x00000303" => Some(TlsVersion::V1_2),
            "0x0304" | "0x00000304" => Some(TlsVersion::V1_3),
            _ => None,
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsVersion::V1_0 => write!(f, "1.0"),
            TlsVersion::V1_1 => write!(f, "1.1"),
            TlsVersion::V1_2 => write!(f, "1.2"),
            TlsVersion::V1_3 => write!(f, "1.3"),
        }
    }
}

/// Client-side TLS evidence aggregated from the capture sources: which
/// handshake versions the device itself initiated, and toward whom.
#[derive(Debug, Clone, Default)]
pub struct ClientTlsEvidence {
    /// Number of client hello frames sourced from the target device.
    pub hello_count: usize,
    pub versions: std::collections::BTreeSet<TlsVersion>,
    /// Destination endpoints of the observed hellos, capture order.
    pub peers: Vec<String>,
}

/// Policy rule for a single port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRule {
    pub number: u16,
    #[serde(rename = "type")]
    pub protocol: Protocol,
    #[serde(default)]
    pub allowed: bool,
}

/// Policy backing one named service check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCheckPolicy {
    /// Check name, e.g. `security.services.ftp`.
    pub name: String,
    /// Display noun used in result messages, e.g. `FTP`.
    pub display: String,
    #[serde(default)]
    pub ports: Vec<PortRule>,
    /// Service names disallowed regardless of port.
    #[serde(default)]
    pub services: Vec<String>,
    /// Expected version substring, only used by version checks.
    #[serde(default)]
    pub expected_version: Option<String>,
}

/// Policy for the TLS module.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsPolicy {
    /// Capture sources inspected in order; later sources overwrite
    /// earlier certificate evidence for the same endpoint.
    #[serde(default)]
    pub captures: Vec<PathBuf>,
}

/// Declarative compliance policy driving the test modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub service_checks: Vec<ServiceCheckPolicy>,
    #[serde(default)]
    pub tls: TlsPolicy,
}

impl Policy {
    /// All UDP port numbers referenced by the policy. The scan executor
    /// probes exactly these; an empty list skips UDP probing entirely.
    pub fn udp_ports(&self) -> Vec<u16> {
        let mut ports = Vec::new();
        for check in &self.service_checks {
            for rule in &check.ports {
                if rule.protocol == Protocol::Udp && !ports.contains(&rule.number) {
                    ports.push(rule.number);
                }
            }
        }
        ports
    }
}

impl Default for Policy {
    fn default() -> Self {
        fn rule(number: u16, protocol: Protocol) -> PortRule {
            PortRule { number, protocol, allowed: false }
        }
        fn check(name: &str, display: &str, ports: Vec<PortRule>, services: &[&str]) -> ServiceCheckPolicy {
            ServiceCheckPolicy {
                name: name.to_string(),
                display: display.to_string(),
                ports,
                services: services.iter().map(|s| s.to_string()).collect(),
                expected_version: None,
            }
        }

        let mut service_checks = vec![
            check("security.services.ftp", "FTP",
                  vec![rule(20, Protocol::Tcp), rule(21, Protocol::Tcp)], &["ftp"]),
            check("security.services.telnet", "telnet",
                  vec![rule(23, Protocol::Tcp)], &["telnet"]),
            check("security.services.smtp", "SMTP",
                  vec![rule(25, Protocol::Tcp), rule(465, Protocol::Tcp), rule(587, Protocol::Tcp)],
                  &["smtp"]),
            check("security.services.http", "HTTP",
                  vec![rule(80, Protocol::Tcp)], &["http"]),
            check("security.services.pop", "POP",
                  vec![rule(109, Protocol::Tcp), rule(110, Protocol::Tcp)], &["pop3"]),
            check("security.services.imap", "IMAP",
                  vec![rule(143, Protocol::Tcp)], &["imap"]),
            check("security.services.snmpv3", "SNMP",
                  vec![rule(161, Protocol::Udp), rule(162, Protocol::Udp)], &["snmp"]),
            check("security.services.vnc", "VNC",
                  vec![rule(5900, Protocol::Tcp)], &["vnc"]),
            check("security.services.tftp", "TFTP",
                  vec![rule(69, Protocol::Udp)], &["tftp"]),
            check("ntp.network.ntp_server", "NTP",
                  vec![rule(123, Protocol::Udp)], &["ntp"]),
        ];
        let mut ssh = check("security.ssh.version", "SSH",
                            vec![PortRule { number: 22, protocol: Protocol::Tcp, allowed: true }],
                            &["ssh"]);
        ssh.expected_version = Some("2.0".to_string());
        service_checks.push(ssh);

        Policy { service_checks, tls: TlsPolicy::default() }
    }
}

/// Reasons a run cannot be admitted. Surfaced synchronously from
/// `start`; nothing past admission is fatal to a run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("a test run is already in progress")]
    AlreadyRunning,

    #[error("a device with MAC address {0} could not be found")]
    UnknownDevice(String),

    #[error("configured network interfaces are not ready for use")]
    NetworkNotReady,
}

/// Failures of an external probe tool. Always recovered locally: the
/// affected probe contributes empty evidence or an `Error` verdict.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{tool} exited with status {status}")]
    ToolFailed { tool: &'static str, status: i32 },

    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: &'static str,
        source: std::io::Error,
    },

    #[error("could not parse {tool} output: {reason}")]
    Unparseable { tool: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_display_matches_report_strings() {
        assert_eq!(Verdict::Compliant.to_string(), "Compliant");
        assert_eq!(Verdict::NonCompliant.to_string(), "Non-Compliant");
        assert_eq!(Verdict::Error.to_string(), "Error");
        assert_eq!(Verdict::NotDetected.to_string(), "Feature Not Detected");
    }

    #[test]
    fn verdict_serializes_to_report_strings() {
        assert_eq!(serde_json::to_string(&Verdict::NonCompliant).unwrap(), "\"Non-Compliant\"");
        assert_eq!(
            serde_json::to_string(&Verdict::NotDetected).unwrap(),
            "\"Feature Not Detected\""
        );
    }

    #[test]
    fn open_port_keys() {
        let port = OpenPort {
            number: 22,
            protocol: Protocol::Tcp,
            state: PortState::Open,
            service: "ssh".to_string(),
            version: String::new(),
        };
        assert_eq!(port.key(), "22tcp");
        assert_eq!(port.id(), "22/tcp");
    }

    #[test]
    fn unknown_port_state_is_kept_not_rejected() {
        assert_eq!("open".parse::<PortState>().unwrap(), PortState::Open);
        assert_eq!("open|filtered".parse::<PortState>().unwrap(), PortState::OpenFiltered);
        assert_eq!("weird".parse::<PortState>().unwrap(), PortState::Unknown);
    }

    #[test]
    fn tls_version_wire_codes() {
        assert_eq!(TlsVersion::from_wire("0x0301"), Some(TlsVersion::V1_0));
        assert_eq!(TlsVersion::from_wire("0x0304"), Some(TlsVersion::V1_3));
        assert_eq!(TlsVersion::from_wire("0x9999"), None);
    }

    #[test]
    fn default_policy_udp_ports_are_deduplicated_policy_order() {
        let policy = Policy::default();
        assert_eq!(policy.udp_ports(), vec![161, 162, 69, 123]);
    }

    #[test]
    fn module_absent_from_selection_runs_by_default() {
        let mut device = Device {
            mac_addr: "aa:bb:cc:dd:ee:ff".to_string(),
            manufacturer: "Acme".to_string(),
            model: "Widget".to_string(),
            test_modules: HashMap::new(),
            firmware: String::new(),
        };
        assert!(device.module_enabled("nmap"));
        device.test_modules.insert("nmap".to_string(), ModuleConfig { enabled: false });
        assert!(!device.module_enabled("nmap"));
    }
}
