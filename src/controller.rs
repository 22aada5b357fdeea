use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::checks::TlsProbe;
use crate::models::{AdmissionError, CheckResult, Device, Policy, RunStatus, TestRun, Verdict};
use crate::modules::{ModuleContext, TestModule};

/// Device registry collaborator. Owns device records; the engine only
/// reads them for the duration of a run.
pub trait DeviceRegistry: Send + Sync {
    fn get_device(&self, mac_addr: &str) -> Option<Device>;
}

/// Network orchestrator collaborator: interface readiness and
/// MAC-to-address resolution.
pub trait NetworkOrchestrator: Send + Sync {
    /// Whether the configured interfaces are ready for a run.
    fn check_config(&self) -> bool;
    /// Current IPv4 address of the device with the given MAC, if the
    /// device has been seen on the network.
    fn device_address(&self, mac_addr: &str) -> Option<IpAddr>;
}

/// How long to wait for the bound device to appear on the network
/// before letting the checks run (and error) without an address.
#[derive(Debug, Clone, Copy)]
pub struct DeviceWait {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for DeviceWait {
    fn default() -> Self {
        Self { attempts: 120, interval: Duration::from_secs(1) }
    }
}

/// Owns the test-run state machine.
///
/// Admits at most one live run at a time; `start` gates admission and
/// dispatches module execution onto an independent task, so status
/// polling is the only way callers observe progress. Cancellation is
/// best effort: an in-flight probe finishes, further modules do not
/// start.
pub struct RunController {
    registry: Arc<dyn DeviceRegistry>,
    network: Arc<dyn NetworkOrchestrator>,
    tls_probe: Arc<dyn TlsProbe>,
    modules: Vec<Arc<dyn TestModule>>,
    policy: Policy,
    captures: Vec<PathBuf>,
    tcp_port_limit: u16,
    device_wait: DeviceWait,
    run: Mutex<TestRun>,
    cancel: AtomicBool,
}

impl RunController {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        network: Arc<dyn NetworkOrchestrator>,
        tls_probe: Arc<dyn TlsProbe>,
        modules: Vec<Arc<dyn TestModule>>,
        policy: Policy,
        captures: Vec<PathBuf>,
    ) -> Self {
        Self {
            registry,
            network,
            tls_probe,
            modules,
            policy,
            captures,
            tcp_port_limit: 1000,
            device_wait: DeviceWait::default(),
            run: Mutex::new(TestRun::new()),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn with_tcp_port_limit(mut self, limit: u16) -> Self {
        self.tcp_port_limit = limit;
        self
    }

    pub fn with_device_wait(mut self, wait: DeviceWait) -> Self {
        self.device_wait = wait;
        self
    }

    /// Admit and start a new test run against the registered device.
    ///
    /// Fails synchronously when a run is already active, the device is
    /// unknown, or the network is not ready; in all three cases any
    /// existing run state is left untouched. On success the prior run
    /// is reset, the device is bound with the given firmware label and
    /// module execution is dispatched; the returned snapshot reflects
    /// the freshly admitted run, not its eventual outcome.
    pub fn start(
        self: &Arc<Self>,
        mac_addr: &str,
        firmware: &str,
    ) -> Result<TestRun, AdmissionError> {
        debug!("Received start command for {}", mac_addr);

        let mut run = self.run.lock();
        if matches!(run.status, RunStatus::InProgress | RunStatus::WaitingForDevice) {
            debug!("A test run is already active. Cannot start another");
            return Err(AdmissionError::AlreadyRunning);
        }
        let mut device = self
            .registry
            .get_device(mac_addr)
            .ok_or_else(|| AdmissionError::UnknownDevice(mac_addr.to_string()))?;
        if !self.network.check_config() {
            return Err(AdmissionError::NetworkNotReady);
        }

        device.firmware = firmware.to_string();
        info!(
            "Starting test run with device target {} {} with MAC address {}",
            device.manufacturer, device.model, device.mac_addr
        );

        run.reset();
        run.status = RunStatus::WaitingForDevice;
        run.device = Some(device.clone());
        run.started = Some(Utc::now());
        self.cancel.store(false, Ordering::SeqCst);
        let snapshot = run.clone();
        drop(run);

        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.execute(device).await });

        Ok(snapshot)
    }

    /// Request cancellation of the active run. In-flight probes are
    /// allowed to finish; the run transitions to `Cancelled` once
    /// quiescent. A no-op when nothing is active.
    pub fn stop(&self) {
        let status = self.run.lock().status;
        if matches!(status, RunStatus::WaitingForDevice | RunStatus::InProgress) {
            info!("Received stop command. Stopping test run");
            self.cancel.store(true, Ordering::SeqCst);
        } else {
            debug!("Received stop command with no active run");
        }
    }

    /// Consistent snapshot of the current run: state, bound device and
    /// the results appended so far.
    pub fn status(&self) -> TestRun {
        self.run.lock().clone()
    }

    async fn execute(self: Arc<Self>, device: Device) {
        let device_ip = self.wait_for_device(&device.mac_addr).await;
        if self.cancelled() {
            info!("Test run cancelled while waiting for device");
            self.run.lock().status = RunStatus::Cancelled;
            return;
        }
        self.run.lock().status = RunStatus::InProgress;

        let ctx = ModuleContext {
            device_ip,
            policy: self.policy.clone(),
            captures: self.captures.clone(),
            tls_probe: Arc::clone(&self.tls_probe),
            tcp_port_limit: self.tcp_port_limit,
        };

        for module in &self.modules {
            if self.cancelled() {
                info!("Stop requested; not starting module {}", module.name());
                self.run.lock().status = RunStatus::Cancelled;
                return;
            }
            if !device.module_enabled(module.name()) {
                debug!("Module {} disabled for this device, skipping", module.name());
                continue;
            }

            info!("Running test module {}", module.name());
            let results = self.run_module(Arc::clone(module), &device, &ctx).await;
            let mut run = self.run.lock();
            if run.status == RunStatus::InProgress {
                run.results.extend(results);
            }
        }

        let mut run = self.run.lock();
        run.status = if self.cancelled() { RunStatus::Cancelled } else { RunStatus::Complete };
        info!("Test run finished with status {}", run.status);
    }

    /// Run one module on its own task so a module panic is contained
    /// as an `Error` result instead of stranding the run.
    async fn run_module(
        &self,
        module: Arc<dyn TestModule>,
        device: &Device,
        ctx: &ModuleContext,
    ) -> Vec<CheckResult> {
        let name = module.name();
        let device = device.clone();
        let ctx = ctx.clone();
        match tokio::spawn(async move { module.run(&device, &ctx).await }).await {
            Ok(results) => results,
            Err(e) => {
                error!("Test module {} failed: {}", name, e);
                vec![CheckResult::new(
                    format!("{}.module", name),
                    Verdict::Error,
                    "Test module failed to complete",
                )]
            }
        }
    }

    async fn wait_for_device(&self, mac_addr: &str) -> Option<IpAddr> {
        info!("Waiting for device {} to appear on the network", mac_addr);
        for _ in 0..self.device_wait.attempts {
            if self.cancelled() {
                return None;
            }
            if let Some(ip) = self.network.device_address(mac_addr) {
                info!("Device {} is up with address {}", mac_addr, ip);
                return Some(ip);
            }
            tokio::time::sleep(self.device_wait.interval).await;
        }
        warn!("Device {} never appeared; checks will record errors", mac_addr);
        None
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::{ProbeOutcome, ServerProbeResult};
    use crate::models::TlsVersion;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct StubRegistry(HashMap<String, Device>);

    impl StubRegistry {
        fn with_device(device: Device) -> Self {
            let mut map = HashMap::new();
            map.insert(device.mac_addr.clone(), device);
            Self(map)
        }
    }

    impl DeviceRegistry for StubRegistry {
        fn get_device(&self, mac_addr: &str) -> Option<Device> {
            self.0.get(mac_addr).cloned()
        }
    }

    struct StubNetwork {
        ready: bool,
        address: Option<IpAddr>,
    }

    impl NetworkOrchestrator for StubNetwork {
        fn check_config(&self) -> bool {
            self.ready
        }

        fn device_address(&self, _mac_addr: &str) -> Option<IpAddr> {
            self.address
        }
    }

    struct StubProbe;

    #[async_trait]
    impl TlsProbe for StubProbe {
        async fn validate_tls_server(
            &self,
            _ip: IpAddr,
            _version: TlsVersion,
        ) -> ServerProbeResult {
            ServerProbeResult { outcome: ProbeOutcome::Undetermined, detail: String::new() }
        }
    }

    struct StubModule {
        module_name: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl TestModule for StubModule {
        fn name(&self) -> &'static str {
            self.module_name
        }

        async fn run(&self, _device: &Device, _ctx: &ModuleContext) -> Vec<CheckResult> {
            tokio::time::sleep(self.delay).await;
            vec![CheckResult::new(
                format!("{}.check", self.module_name),
                Verdict::Compliant,
                "ok",
            )]
        }
    }

    fn device(mac: &str) -> Device {
        Device {
            mac_addr: mac.to_string(),
            manufacturer: "Acme".to_string(),
            model: "Widget".to_string(),
            test_modules: HashMap::new(),
            firmware: String::new(),
        }
    }

    const MAC: &str = "aa:bb:cc:dd:ee:ff";

    fn controller(
        network: StubNetwork,
        modules: Vec<Arc<dyn TestModule>>,
    ) -> Arc<RunController> {
        Arc::new(
            RunController::new(
                Arc::new(StubRegistry::with_device(device(MAC))),
                Arc::new(network),
                Arc::new(StubProbe),
                modules,
                Policy { service_checks: Vec::new(), tls: Default::default() },
                Vec::new(),
            )
            .with_device_wait(DeviceWait { attempts: 3, interval: Duration::from_millis(5) }),
        )
    }

    fn ready_network() -> StubNetwork {
        StubNetwork { ready: true, address: Some("192.0.2.10".parse().unwrap()) }
    }

    fn module(name: &'static str, delay_ms: u64) -> Arc<dyn TestModule> {
        Arc::new(StubModule { module_name: name, delay: Duration::from_millis(delay_ms) })
    }

    async fn wait_terminal(controller: &Arc<RunController>) -> TestRun {
        for _ in 0..400 {
            let run = controller.status();
            if run.status.is_terminal() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run did not reach a terminal state");
    }

    #[tokio::test]
    async fn start_returns_snapshot_and_run_completes() {
        let controller = controller(ready_network(), vec![module("alpha", 0)]);

        let snapshot = controller.start(MAC, "1.0.0").unwrap();
        assert_eq!(snapshot.status, RunStatus::WaitingForDevice);
        assert_eq!(snapshot.device.as_ref().unwrap().firmware, "1.0.0");
        assert!(snapshot.results.is_empty());

        let finished = wait_terminal(&controller).await;
        assert_eq!(finished.status, RunStatus::Complete);
        assert_eq!(finished.results.len(), 1);
        assert_eq!(finished.results[0].name, "alpha.check");
    }

    #[tokio::test]
    async fn second_start_while_active_is_rejected_and_leaves_run_untouched() {
        let controller = controller(ready_network(), vec![module("slow", 200)]);

        let first = controller.start(MAC, "fw-a").unwrap();
        let err = controller.start(MAC, "fw-b").unwrap_err();
        assert_eq!(err, AdmissionError::AlreadyRunning);

        let current = controller.status();
        assert_eq!(current.device.as_ref().unwrap().firmware, "fw-a");
        assert_eq!(current.started, first.started);

        controller.stop();
        wait_terminal(&controller).await;
    }

    #[tokio::test]
    async fn unknown_device_is_rejected() {
        let controller = controller(ready_network(), vec![]);
        let err = controller.start("00:00:00:00:00:99", "fw").unwrap_err();
        assert_eq!(err, AdmissionError::UnknownDevice("00:00:00:00:00:99".to_string()));
        assert_eq!(controller.status().status, RunStatus::Idle);
    }

    #[tokio::test]
    async fn unready_network_is_rejected() {
        let controller =
            controller(StubNetwork { ready: false, address: None }, vec![module("alpha", 0)]);
        let err = controller.start(MAC, "fw").unwrap_err();
        assert_eq!(err, AdmissionError::NetworkNotReady);
        assert_eq!(controller.status().status, RunStatus::Idle);
    }

    #[tokio::test]
    async fn stop_cancels_before_the_next_module_starts() {
        let controller =
            controller(ready_network(), vec![module("first", 50), module("second", 0)]);

        controller.start(MAC, "fw").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.stop();

        let finished = wait_terminal(&controller).await;
        assert_eq!(finished.status, RunStatus::Cancelled);
        assert!(finished.results.iter().all(|r| r.name != "second.check"));
    }

    #[tokio::test]
    async fn disabled_module_is_skipped() {
        let mut dev = device(MAC);
        dev.test_modules.insert(
            "skipped".to_string(),
            crate::models::ModuleConfig { enabled: false },
        );
        let controller = Arc::new(
            RunController::new(
                Arc::new(StubRegistry::with_device(dev)),
                Arc::new(ready_network()),
                Arc::new(StubProbe),
                vec![module("skipped", 0), module("kept", 0)],
                Policy { service_checks: Vec::new(), tls: Default::default() },
                Vec::new(),
            )
            .with_device_wait(DeviceWait { attempts: 3, interval: Duration::from_millis(5) }),
        );

        controller.start(MAC, "fw").unwrap();
        let finished = wait_terminal(&controller).await;
        assert_eq!(finished.status, RunStatus::Complete);
        assert_eq!(finished.results.len(), 1);
        assert_eq!(finished.results[0].name, "kept.check");
    }

    #[tokio::test]
    async fn next_admission_resets_prior_results() {
        let controller = controller(ready_network(), vec![module("alpha", 0)]);

        controller.start(MAC, "fw-1").unwrap();
        let first = wait_terminal(&controller).await;
        assert_eq!(first.results.len(), 1);

        let snapshot = controller.start(MAC, "fw-2").unwrap();
        assert!(snapshot.results.is_empty());
        assert_eq!(snapshot.device.as_ref().unwrap().firmware, "fw-2");

        let second = wait_terminal(&controller).await;
        assert_eq!(second.status, RunStatus::Complete);
        assert_eq!(second.results.len(), 1);
    }

    #[tokio::test]
    async fn run_reaches_terminal_state_even_when_device_never_appears() {
        let controller = controller(
            StubNetwork { ready: true, address: None },
            vec![module("alpha", 0)],
        );

        controller.start(MAC, "fw").unwrap();
        let finished = wait_terminal(&controller).await;
        assert_eq!(finished.status, RunStatus::Complete);
    }
}
