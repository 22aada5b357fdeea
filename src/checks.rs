use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use log::debug;

use crate::models::{ClientTlsEvidence, OpenPort, PortRule, PortState, TlsVersion, Verdict};

/// Outcome of a version-pinned server handshake attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Valid,
    Invalid,
    /// The probe could not establish whether the server speaks the
    /// version at all (unreachable, timeout, tool failure).
    Undetermined,
}

/// What the external TLS probe reports back for one handshake attempt.
#[derive(Debug, Clone)]
pub struct ServerProbeResult {
    pub outcome: ProbeOutcome,
    pub detail: String,
}

/// External TLS probe collaborator. Attempts a protocol handshake at a
/// pinned version against the device and reports valid / invalid /
/// undetermined.
#[async_trait]
pub trait TlsProbe: Send + Sync {
    async fn validate_tls_server(&self, ip: IpAddr, version: TlsVersion) -> ServerProbeResult;
}

/// Walk the discovered port table against the policy rules.
///
/// A violation id (`"<port>/<proto>"`) is recorded for every open port
/// matched by a rule not marked allowed, and independently for every
/// open port running a banned service. Each id appears at most once;
/// records are visited in (port, protocol) order so the output is
/// deterministic.
pub fn evaluate_ports(
    open_ports: &HashMap<String, OpenPort>,
    rules: &[PortRule],
    banned_services: &[String],
) -> Vec<String> {
    let mut records: Vec<&OpenPort> = open_ports.values().collect();
    records.sort_by_key(|p| (p.number, p.protocol));

    let mut violations: Vec<String> = Vec::new();
    for record in records {
        if record.state != PortState::Open {
            continue;
        }
        let id = record.id();

        for rule in rules {
            if rule.number == record.number && rule.protocol == record.protocol {
                debug!("Found open port: {} = {}", id, record.state);
                if !rule.allowed && !violations.contains(&id) {
                    violations.push(id.clone());
                }
            }
        }

        if banned_services.contains(&record.service) && !violations.contains(&id) {
            debug!("Found service {} on port {}", record.service, id);
            violations.push(id.clone());
        }
    }
    violations
}

/// Map a server probe outcome onto a verdict with its rationale.
pub fn evaluate_tls_server(version: TlsVersion, result: &ServerProbeResult) -> (Verdict, String) {
    match result.outcome {
        ProbeOutcome::Undetermined => (
            Verdict::Error,
            format!("TLS {} certificate could not be validated", version),
        ),
        ProbeOutcome::Valid => (
            Verdict::Compliant,
            format!("TLS {} certificate is valid", version),
        ),
        ProbeOutcome::Invalid => (
            Verdict::NonCompliant,
            format!("TLS {} certificate is invalid", version),
        ),
    }
}

/// Full result of a client-side TLS check.
#[derive(Debug, Clone)]
pub struct ClientCheck {
    pub verdict: Verdict,
    pub message: String,
    pub detail: String,
    pub tags: Vec<String>,
}

/// Judge the captured client-initiated handshakes for one version.
///
/// No observed outbound hellos at all is not a failure, it is the
/// absence of the feature. Otherwise the device must have initiated a
/// handshake at `version` and at none of the `unsupported` versions.
pub fn evaluate_tls_client(
    evidence: &ClientTlsEvidence,
    version: TlsVersion,
    unsupported: &[TlsVersion],
) -> ClientCheck {
    if evidence.hello_count == 0 {
        return ClientCheck {
            verdict: Verdict::NotDetected,
            message: "No outbound connections were found".to_string(),
            detail: String::new(),
            tags: Vec::new(),
        };
    }

    let observed_versions: Vec<String> =
        evidence.versions.iter().map(|v| v.to_string()).collect();
    let mut detail = format!(
        "TLS {} client check: observed versions [{}] toward [{}]. ",
        version,
        observed_versions.join(", "),
        evidence.peers.join(", "),
    );

    let disallowed: Vec<&TlsVersion> = unsupported
        .iter()
        .filter(|v| evidence.versions.contains(*v))
        .collect();
    if !disallowed.is_empty() {
        let list: Vec<String> = disallowed.iter().map(|v| v.to_string()).collect();
        detail.push_str(&format!("Unsupported versions observed: [{}]. ", list.join(", ")));
    }

    let verdict = if evidence.versions.contains(&version) && disallowed.is_empty() {
        Verdict::Compliant
    } else {
        Verdict::NonCompliant
    };
    let message = match verdict {
        Verdict::Compliant => format!("TLS {} client connections valid", version),
        _ => format!("TLS {} client connections invalid", version),
    };

    ClientCheck { verdict, message, detail, tags: observed_versions }
}

/// Combine the four per-version client checks into the minimum-version
/// verdict. Precedence, first match wins: any `Compliant` passes the
/// whole check; all `NotDetected` stays not detected (message taken
/// from the 1.0 sub-check); all `Error` stays an error; anything else
/// fails.
pub fn evaluate_tls_min(sub: &[ClientCheck; 4]) -> ClientCheck {
    let verdicts: Vec<Verdict> = sub.iter().map(|c| c.verdict).collect();

    let (verdict, message) = if verdicts.contains(&Verdict::Compliant) {
        (Verdict::Compliant, "TLS 1.0 or higher detected".to_string())
    } else if verdicts.iter().all(|v| *v == Verdict::NotDetected) {
        (Verdict::NotDetected, sub[0].message.clone())
    } else if verdicts.iter().all(|v| *v == Verdict::Error) {
        (Verdict::Error, String::new())
    } else {
        (Verdict::NonCompliant, "TLS 1.0 or higher was not detected".to_string())
    };

    // Details concatenate in version order; tags are the deduplicated
    // union across the four sub-checks.
    let detail: String = sub.iter().map(|c| c.detail.as_str()).collect();
    let mut tags: Vec<String> = Vec::new();
    for check in sub {
        for tag in &check.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
    }

    ClientCheck { verdict, message, detail, tags }
}
