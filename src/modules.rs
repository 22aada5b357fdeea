use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info};

use crate::capture::{CaptureInspector, Endpoint};
use crate::checks::{self, TlsProbe};
use crate::models::{
    CertificateInfo, CheckResult, Device, OpenPort, Policy, PortState, ServiceCheckPolicy,
    TlsVersion, Verdict,
};
use crate::scanner::PortScanner;

const IP_UNRESOLVED: &str = "Could not resolve device IP address";

/// Shared collaborators and configuration handed to each test module
/// for the duration of one run.
#[derive(Clone)]
pub struct ModuleContext {
    /// Device IPv4 address resolved at run start; `None` when the
    /// orchestrator never saw the device come up.
    pub device_ip: Option<IpAddr>,
    pub policy: Policy,
    /// Capture sources, in overwrite order.
    pub captures: Vec<PathBuf>,
    pub tls_probe: Arc<dyn TlsProbe>,
    /// Upper bound of the TCP discovery range.
    pub tcp_port_limit: u16,
}

/// One pluggable test module. Modules run their checks to completion
/// and hand back results; a failing probe inside a module becomes an
/// `Error` verdict on the affected check, never a module panic.
#[async_trait]
pub trait TestModule: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, device: &Device, ctx: &ModuleContext) -> Vec<CheckResult>;
}

/// Port/service discovery module backed by the scan executor.
pub struct ScanModule;

#[async_trait]
impl TestModule for ScanModule {
    fn name(&self) -> &'static str {
        "nmap"
    }

    async fn run(&self, _device: &Device, ctx: &ModuleContext) -> Vec<CheckResult> {
        info!("Running scan module");

        let Some(ip) = ctx.device_ip else {
            error!("{}. Skipping", IP_UNRESOLVED);
            return ctx
                .policy
                .service_checks
                .iter()
                .map(|c| CheckResult::new(&c.name, Verdict::Error, IP_UNRESOLVED))
                .collect();
        };

        let table = PortScanner::new(ip, ctx.tcp_port_limit, ctx.policy.udp_ports())
            .scan()
            .await;

        info!("Checking results");
        ctx.policy
            .service_checks
            .iter()
            .map(|policy| service_check(policy, &table))
            .collect()
    }
}

/// Evaluate one named service check against the discovered port table.
pub(crate) fn service_check(
    policy: &ServiceCheckPolicy,
    table: &HashMap<String, OpenPort>,
) -> CheckResult {
    info!("Running {}", policy.name);

    if let Some(expected) = &policy.expected_version {
        return version_check(policy, expected, table);
    }

    let violations = checks::evaluate_ports(table, &policy.ports, &policy.services);
    if violations.is_empty() {
        CheckResult::new(
            &policy.name,
            Verdict::Compliant,
            format!("No {} server found", policy.display),
        )
    } else {
        CheckResult::new(
            &policy.name,
            Verdict::NonCompliant,
            format!(
                "Found {} server running on port {}",
                policy.display,
                violations.join(", ")
            ),
        )
    }
}

/// Version checks judge the detected banner rather than mere presence:
/// an absent server passes, a present one must match the expected
/// version substring.
fn version_check(
    policy: &ServiceCheckPolicy,
    expected: &str,
    table: &HashMap<String, OpenPort>,
) -> CheckResult {
    let server = table.values().find(|p| {
        p.state == PortState::Open
            && (policy
                .ports
                .iter()
                .any(|r| r.number == p.number && r.protocol == p.protocol)
                || policy.services.contains(&p.service))
    });

    match server {
        None => CheckResult::new(
            &policy.name,
            Verdict::Compliant,
            format!("No {} server found", policy.display),
        ),
        Some(port) => {
            let message = format!("{} server found running {}", policy.display, port.version);
            let verdict = if port.version.contains(expected) {
                Verdict::Compliant
            } else {
                Verdict::NonCompliant
            };
            CheckResult::new(&policy.name, verdict, message)
        }
    }
}

/// TLS posture module: server handshake probes plus capture-derived
/// client behavior.
pub struct TlsModule;

#[async_trait]
impl TestModule for TlsModule {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn run(&self, device: &Device, ctx: &ModuleContext) -> Vec<CheckResult> {
        info!("Running TLS module");
        let mut results = Vec::new();

        let inspector = CaptureInspector::new(ctx.captures.clone(), &device.mac_addr);
        let certificates = inspector.extract_certificates().await;
        let cert_summary = summarize_certificates(&certificates);

        match ctx.device_ip {
            Some(ip) => {
                // The 1.2 server check probes 1.2 and 1.3 together; the
                // verdict follows 1.2 and the 1.3 outcome is carried in
                // the detail.
                info!("Running security.tls.v1_2_server");
                let r12 = ctx.tls_probe.validate_tls_server(ip, TlsVersion::V1_2).await;
                let r13 = ctx.tls_probe.validate_tls_server(ip, TlsVersion::V1_3).await;
                let (verdict, message) = checks::evaluate_tls_server(TlsVersion::V1_2, &r12);
                let (_, message_13) = checks::evaluate_tls_server(TlsVersion::V1_3, &r13);
                let detail = format!(
                    "{}\n{} {}\n{}",
                    r12.detail, message_13, r13.detail, cert_summary
                );
                results.push(
                    CheckResult::new("security.tls.v1_2_server", verdict, message)
                        .with_detail(detail),
                );

                info!("Running security.tls.v1_3_server");
                let (verdict, message) = checks::evaluate_tls_server(TlsVersion::V1_3, &r13);
                results.push(
                    CheckResult::new("security.tls.v1_3_server", verdict, message)
                        .with_detail(format!("{}\n{}", r13.detail, cert_summary)),
                );
            }
            None => {
                error!("{}. Skipping server checks", IP_UNRESOLVED);
                for name in ["security.tls.v1_2_server", "security.tls.v1_3_server"] {
                    results.push(CheckResult::new(name, Verdict::Error, IP_UNRESOLVED));
                }
            }
        }

        // Client checks come from capture evidence alone.
        let evidence = inspector.client_evidence().await;

        info!("Running security.tls.v1_0_client");
        let sub = TlsVersion::ALL.map(|v| checks::evaluate_tls_client(&evidence, v, &[]));
        let combined = checks::evaluate_tls_min(&sub);
        results.push(
            CheckResult::new("security.tls.v1_0_client", combined.verdict, combined.message)
                .with_detail(combined.detail)
                .with_tags(combined.tags),
        );

        for (name, version) in [
            ("security.tls.v1_2_client", TlsVersion::V1_2),
            ("security.tls.v1_3_client", TlsVersion::V1_3),
        ] {
            info!("Running {}", name);
            let check = checks::evaluate_tls_client(
                &evidence,
                version,
                &[TlsVersion::V1_0, TlsVersion::V1_1],
            );
            results.push(
                CheckResult::new(name, check.verdict, check.message)
                    .with_detail(check.detail)
                    .with_tags(check.tags),
            );
        }

        results
    }
}

/// Human-readable summary of the certificate evidence, attached to the
/// server checks as supporting detail.
pub(crate) fn summarize_certificates(certificates: &HashMap<Endpoint, CertificateInfo>) -> String {
    if certificates.is_empty() {
        return "No TLS certificates found on the device".to_string();
    }
    let mut endpoints: Vec<&Endpoint> = certificates.keys().collect();
    endpoints.sort();

    let mut lines = vec![format!("{} TLS certificate(s) observed:", certificates.len())];
    for endpoint in endpoints {
        let cert = &certificates[endpoint];
        lines.push(format!(
            "{}:{} subject={} issuer={} expires={} type={} length={}",
            endpoint.0,
            endpoint.1,
            cert.subject,
            cert.issuer,
            cert.not_after,
            cert.public_key_type,
            cert.der_length,
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PortRule, Protocol};

    fn table(ports: Vec<OpenPort>) -> HashMap<String, OpenPort> {
        ports.into_iter().map(|p| (p.key(), p)).collect()
    }

    fn open(number: u16, protocol: Protocol, service: &str, version: &str) -> OpenPort {
        OpenPort {
            number,
            protocol,
            state: PortState::Open,
            service: service.to_string(),
            version: version.to_string(),
        }
    }

    fn ftp_policy() -> ServiceCheckPolicy {
        ServiceCheckPolicy {
            name: "security.services.ftp".to_string(),
            display: "FTP".to_string(),
            ports: vec![PortRule { number: 21, protocol: Protocol::Tcp, allowed: false }],
            services: vec!["ftp".to_string()],
            expected_version: None,
        }
    }

    #[test]
    fn open_ftp_port_fails_the_service_check() {
        let result = service_check(&ftp_policy(), &table(vec![open(21, Protocol::Tcp, "ftp", "")]));
        assert_eq!(result.name, "security.services.ftp");
        assert_eq!(result.result, Verdict::NonCompliant);
        assert_eq!(result.message, "Found FTP server running on port 21/tcp");
    }

    #[test]
    fn no_ftp_server_passes_the_service_check() {
        let result = service_check(&ftp_policy(), &table(vec![open(22, Protocol::Tcp, "ssh", "")]));
        assert_eq!(result.result, Verdict::Compliant);
        assert_eq!(result.message, "No FTP server found");
    }

    fn ssh_policy() -> ServiceCheckPolicy {
        ServiceCheckPolicy {
            name: "security.ssh.version".to_string(),
            display: "SSH".to_string(),
            ports: vec![PortRule { number: 22, protocol: Protocol::Tcp, allowed: true }],
            services: vec!["ssh".to_string()],
            expected_version: Some("2.0".to_string()),
        }
    }

    #[test]
    fn ssh_version_matching_expected_is_compliant() {
        let ports = table(vec![open(22, Protocol::Tcp, "ssh", "OpenSSH 8.2 protocol 2.0")]);
        let result = service_check(&ssh_policy(), &ports);
        assert_eq!(result.result, Verdict::Compliant);
        assert_eq!(result.message, "SSH server found running OpenSSH 8.2 protocol 2.0");
    }

    #[test]
    fn ssh_version_mismatch_is_non_compliant() {
        let ports = table(vec![open(22, Protocol::Tcp, "ssh", "OpenSSH 3.4 protocol 1.5")]);
        let result = service_check(&ssh_policy(), &ports);
        assert_eq!(result.result, Verdict::NonCompliant);
    }

    #[test]
    fn absent_ssh_server_is_compliant() {
        let result = service_check(&ssh_policy(), &HashMap::new());
        assert_eq!(result.result, Verdict::Compliant);
        assert_eq!(result.message, "No SSH server found");
    }

    #[test]
    fn empty_certificate_table_summary() {
        assert_eq!(
            summarize_certificates(&HashMap::new()),
            "No TLS certificates found on the device"
        );
    }

    #[test]
    fn certificate_summary_lists_endpoints_in_order() {
        let cert = CertificateInfo {
            subject: "CN=device".to_string(),
            issuer: "CN=lab-ca".to_string(),
            not_before: String::new(),
            not_after: "2030-01-01".to_string(),
            serial_number: String::new(),
            signature_algorithm: String::new(),
            version: 2,
            public_key_type: "EC".to_string(),
            der_length: 512,
            extensions: Vec::new(),
        };
        let mut certificates = HashMap::new();
        certificates.insert(("10.0.0.5".to_string(), 443u16), cert.clone());
        certificates.insert(("10.0.0.5".to_string(), 8443u16), cert);

        let summary = summarize_certificates(&certificates);
        assert!(summary.starts_with("2 TLS certificate(s) observed:"));
        let lines: Vec<&str> = summary.lines().collect();
        assert!(lines[1].starts_with("10.0.0.5:443 "));
        assert!(lines[2].starts_with("10.0.0.5:8443 "));
    }
}
