use std::net::IpAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use log::{debug, info, warn};
use regex::Regex;

mod capture;
mod checks;
mod controller;
mod models;
mod modules;
mod scanner;

use checks::{ProbeOutcome, ServerProbeResult, TlsProbe};
use controller::{DeviceRegistry, NetworkOrchestrator, RunController};
use models::{Device, Policy, RunStatus, TlsVersion, Verdict};
use modules::{ScanModule, TestModule, TlsModule};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Network compliance test engine", long_about = None)]
struct Args {
    /// MAC address of the device under test
    #[clap(value_parser)]
    device: String,

    /// Firmware label to record with this run
    #[clap(short, long, default_value = "")]
    firmware: String,

    /// Device registry file (JSON array of devices)
    #[clap(short, long, default_value = "devices.json")]
    devices: PathBuf,

    /// Compliance policy file; built-in defaults when omitted
    #[clap(short, long)]
    policy: Option<PathBuf>,

    /// Capture files to mine for TLS evidence, inspected in order
    #[clap(short, long)]
    captures: Vec<PathBuf>,

    /// Upper bound of the TCP discovery range
    #[clap(long, default_value_t = 1000)]
    tcp_ports: u16,

    /// Emit the report as JSON
    #[clap(short = 'j', long)]
    json: bool,

    /// Enable debug-level logging
    #[clap(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", log_level);
    }
    env_logger::Builder::from_default_env()
        .format_timestamp_secs()
        .format_target(false)
        .init();
}

/// Device registry backed by a JSON file.
struct FileDeviceRegistry {
    devices: Vec<Device>,
}

impl FileDeviceRegistry {
    fn load(path: &PathBuf) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read device registry {}", path.display()))?;
        let devices: Vec<Device> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse device registry {}", path.display()))?;
        info!("Loaded {} registered devices from {}", devices.len(), path.display());
        Ok(Self { devices })
    }
}

impl DeviceRegistry for FileDeviceRegistry {
    fn get_device(&self, mac_addr: &str) -> Option<Device> {
        self.devices
            .iter()
            .find(|d| d.mac_addr.eq_ignore_ascii_case(mac_addr))
            .cloned()
    }
}

/// Resolves device addresses from the kernel ARP table.
struct ArpNetworkOrchestrator {
    arp_table: PathBuf,
}

impl ArpNetworkOrchestrator {
    fn new() -> Self {
        Self { arp_table: PathBuf::from("/proc/net/arp") }
    }
}

impl NetworkOrchestrator for ArpNetworkOrchestrator {
    fn check_config(&self) -> bool {
        self.arp_table.exists()
    }

    fn device_address(&self, mac_addr: &str) -> Option<IpAddr> {
        let raw = std::fs::read_to_string(&self.arp_table).ok()?;
        for line in raw.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            // IP address, HW type, Flags, HW address, Mask, Device
            if fields.len() < 4 {
                continue;
            }
            if fields[3].eq_ignore_ascii_case(mac_addr) {
                if let Ok(ip) = fields[0].parse() {
                    return Some(ip);
                }
            }
        }
        None
    }
}

/// TLS server probe that drives `openssl s_client` against the device.
struct OpensslProbe {
    port: u16,
    timeout: Duration,
}

impl OpensslProbe {
    fn new() -> Self {
        Self { port: 443, timeout: Duration::from_secs(10) }
    }

    fn version_flag(version: TlsVersion) -> &'static str {
        match version {
            TlsVersion::V1_0 => "-tls1",
            TlsVersion::V1_1 => "-tls1_1",
            TlsVersion::V1_2 => "-tls1_2",
            TlsVersion::V1_3 => "-tls1_3",
        }
    }

    /// Keep the lines worth reporting: negotiated protocol, cipher and
    /// verification outcome.
    fn summarize(output: &str) -> String {
        output
            .lines()
            .filter(|l| {
                let l = l.trim_start();
                l.starts_with("Protocol")
                    || l.starts_with("Cipher")
                    || l.starts_with("Verification")
                    || l.starts_with("verify error")
            })
            .map(|l| l.trim())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
impl TlsProbe for OpensslProbe {
    async fn validate_tls_server(&self, ip: IpAddr, version: TlsVersion) -> ServerProbeResult {
        let mut command = tokio::process::Command::new("openssl");
        command
            .arg("s_client")
            .arg("-connect")
            .arg(format!("{}:{}", ip, self.port))
            .arg(Self::version_flag(version))
            .arg("-verify_return_error")
            .stdin(std::process::Stdio::null());

        debug!("Probing TLS {} server on {}:{}", version, ip, self.port);
        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("Failed to launch openssl: {}", e);
                return ServerProbeResult {
                    outcome: ProbeOutcome::Undetermined,
                    detail: format!("failed to launch openssl: {}", e),
                };
            }
            Err(_) => {
                warn!("TLS {} probe of {} timed out", version, ip);
                return ServerProbeResult {
                    outcome: ProbeOutcome::Undetermined,
                    detail: format!("handshake timed out after {:?}", self.timeout),
                };
            }
        };

        let combined = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let outcome =
            if output.status.success() { ProbeOutcome::Valid } else { ProbeOutcome::Invalid };
        ServerProbeResult { outcome, detail: Self::summarize(&combined) }
    }
}

fn print_report(run: &models::TestRun) {
    if let Some(device) = &run.device {
        println!(
            "Test run for {} {} ({}) - {}",
            device.manufacturer, device.model, device.mac_addr, run.status
        );
    } else {
        println!("Test run - {}", run.status);
    }
    for result in &run.results {
        println!("  {}: {} - {}", result.name, result.result, result.message);
        if !result.detail.is_empty() {
            for line in result.detail.lines() {
                println!("      {}", line);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose);

    let mac_format = Regex::new(r"^([0-9a-fA-F]{2}:){5}[0-9a-fA-F]{2}$").unwrap();
    if !mac_format.is_match(&args.device) {
        anyhow::bail!("{} is not a valid MAC address", args.device);
    }

    let registry = Arc::new(FileDeviceRegistry::load(&args.devices)?);
    let policy = match &args.policy {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read policy {}", path.display()))?;
            serde_json::from_str::<Policy>(&raw)
                .with_context(|| format!("failed to parse policy {}", path.display()))?
        }
        None => Policy::default(),
    };

    let mut captures = args.captures.clone();
    captures.extend(policy.tls.captures.clone());

    let modules: Vec<Arc<dyn TestModule>> = vec![Arc::new(ScanModule), Arc::new(TlsModule)];
    let controller = Arc::new(
        RunController::new(
            registry,
            Arc::new(ArpNetworkOrchestrator::new()),
            Arc::new(OpensslProbe::new()),
            modules,
            policy,
            captures,
        )
        .with_tcp_port_limit(args.tcp_ports),
    );

    controller.start(&args.device, &args.firmware)?;

    let run = loop {
        let run = controller.status();
        if run.status.is_terminal() {
            break run;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, stopping test run");
                controller.stop();
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_report(&run);
    }

    let non_compliant = run.results.iter().any(|r| r.result == Verdict::NonCompliant);
    if run.status != RunStatus::Complete || non_compliant {
        process::exit(1);
    }
    Ok(())
}
