// Common test utilities and fixtures
// Remote hosts are simulated in memory; provisioning MUST use the Mock gateway only.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use fleet_common::{
    CloudInstance, FleetError, InstanceState, InstanceTemplate, LoginCredentials, Result,
    TunnelSpec,
};
use fleet_engine::{
    CommandOutput, FleetManager, FleetSettings, RemoteShell, ResourceCatalog, ReverseTunnel,
    ShellConnector, SshTarget, TunnelHandle, TunnelOpener,
};
use fleet_providers::mock::MockGateway;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const PACKAGE_DIR: &str = "fleet/package";
pub const RESOURCE_DIR: &str = "fleet/resources";

fn unquote(word: &str) -> String {
    word.trim()
        .trim_start_matches('\'')
        .trim_end_matches('\'')
        .to_string()
}

/// One simulated machine: a flat file map plus everything that was run on it.
#[derive(Default)]
pub struct FakeHost {
    pub address: String,
    files: Mutex<HashMap<String, Vec<u8>>>,
    execs: Mutex<Vec<String>>,
    uploads: Mutex<Vec<String>>,
    /// Commands containing one of these exit with status 1.
    failing_commands: Mutex<Vec<String>>,
    /// Uploads to paths containing one of these fail.
    failing_uploads: Mutex<Vec<String>>,
    /// Canned stdout for commands starting with a prefix; `{n}` counts matches.
    responses: Mutex<Vec<(String, String)>>,
    responded: AtomicUsize,
    pub refuse_connections: AtomicBool,
    pub connects: AtomicUsize,
}

impl FakeHost {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn fail_commands_containing(&self, needle: &str) {
        self.failing_commands.lock().unwrap().push(needle.to_string());
    }

    pub fn fail_uploads_containing(&self, needle: &str) {
        self.failing_uploads.lock().unwrap().push(needle.to_string());
    }

    pub fn respond_to(&self, prefix: &str, stdout: &str) {
        self.responses
            .lock()
            .unwrap()
            .push((prefix.to_string(), stdout.to_string()));
    }

    pub fn clear_failures(&self) {
        self.failing_commands.lock().unwrap().clear();
        self.failing_uploads.lock().unwrap().clear();
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.files.lock().unwrap().insert(path.to_string(), data.to_vec());
    }

    pub fn execs(&self) -> Vec<String> {
        self.execs.lock().unwrap().clone()
    }

    pub fn execs_containing(&self, needle: &str) -> Vec<String> {
        self.execs().into_iter().filter(|c| c.contains(needle)).collect()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn reset_logs(&self) {
        self.execs.lock().unwrap().clear();
        self.uploads.lock().unwrap().clear();
    }

    fn command_fails(&self, command: &str) -> bool {
        self.failing_commands
            .lock()
            .unwrap()
            .iter()
            .any(|n| command.contains(n.as_str()))
    }

    fn ok(stdout: impl Into<String>) -> CommandOutput {
        CommandOutput {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    fn failed() -> CommandOutput {
        CommandOutput {
            status: 1,
            stdout: String::new(),
            stderr: "injected failure".to_string(),
        }
    }

    /// Interprets the handful of command shapes the engine issues.
    fn run(&self, command: &str) -> CommandOutput {
        if command.contains("fleet-deploy:") {
            return self.run_deploy_batch(command);
        }
        if self.command_fails(command) {
            return Self::failed();
        }
        let canned = self
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, stdout)| stdout.clone());
        if let Some(stdout) = canned {
            let n = self.responded.fetch_add(1, Ordering::SeqCst) + 1;
            return Self::ok(stdout.replace("{n}", &n.to_string()));
        }
        if let Some(rest) = command.strip_prefix("if [ -f ") {
            let path = unquote(rest.split(" ]").next().unwrap_or_default());
            let exists = self.files.lock().unwrap().contains_key(&path);
            return Self::ok(format!("{}\n", exists));
        }
        if let Some(rest) = command.strip_prefix("cat ") {
            return match self.file(&unquote(rest)) {
                Some(body) => Self::ok(String::from_utf8_lossy(&body).to_string()),
                None => Self::failed(),
            };
        }
        if let Some(rest) = command.strip_prefix("rm -rf ") {
            self.files.lock().unwrap().remove(&unquote(rest));
            return Self::ok("");
        }
        Self::ok("")
    }

    fn run_deploy_batch(&self, script: &str) -> CommandOutput {
        let mut stdout = String::new();
        for step in script.split("; fi").filter(|s| s.contains("fleet-deploy:")) {
            let inner = step
                .split("if ( ")
                .nth(1)
                .and_then(|s| s.split(" ) 1>&2").next())
                .unwrap_or_default();
            let name = step
                .split("fleet-deploy:ok:")
                .nth(1)
                .and_then(|s| s.split('\'').next())
                .unwrap_or_default();
            let marker = if self.command_fails(inner) { "fail" } else { "ok" };
            stdout.push_str(&format!("fleet-deploy:{}:{}\n", marker, name));
        }
        Self::ok(stdout)
    }
}

pub struct FakeShell {
    host: Arc<FakeHost>,
}

#[async_trait]
impl RemoteShell for FakeShell {
    fn host(&self) -> &str {
        &self.host.address
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.host.execs.lock().unwrap().push(command.to_string());
        Ok(self.host.run(command))
    }

    async fn upload(&self, data: &[u8], remote_path: &str) -> Result<()> {
        let fails = self
            .host
            .failing_uploads
            .lock()
            .unwrap()
            .iter()
            .any(|n| remote_path.contains(n.as_str()));
        if fails {
            return Err(FleetError::transport(&self.host.address, "connection reset during upload"));
        }
        self.host.uploads.lock().unwrap().push(remote_path.to_string());
        self.host.put_file(remote_path, data);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

impl FakeShell {
    pub fn on(host: Arc<FakeHost>) -> Self {
        Self { host }
    }
}

/// Hands out shells to `FakeHost`s keyed by address.
#[derive(Default)]
pub struct FakeConnector {
    hosts: Mutex<HashMap<String, Arc<FakeHost>>>,
    /// Seeded into every host created after the call.
    failing_commands: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn host(&self, address: &str) -> Arc<FakeHost> {
        self.hosts
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_insert_with(|| {
                let host = FakeHost::new(address);
                for needle in self.failing_commands.lock().unwrap().iter() {
                    host.fail_commands_containing(needle);
                }
                Arc::new(host)
            })
            .clone()
    }

    pub fn fail_commands_on_new_hosts(&self, needle: &str) {
        self.failing_commands.lock().unwrap().push(needle.to_string());
    }
}

#[async_trait]
impl ShellConnector for FakeConnector {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteShell>> {
        let host = self.host(&target.host);
        host.connects.fetch_add(1, Ordering::SeqCst);
        if host.refuse_connections.load(Ordering::SeqCst) {
            return Err(FleetError::transport(&target.host, "connection refused"));
        }
        Ok(Box::new(FakeShell { host }))
    }
}

pub struct FakeTunnel {
    id: Uuid,
    spec: TunnelSpec,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl ReverseTunnel for FakeTunnel {
    fn id(&self) -> Uuid {
        self.id
    }

    fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingOpener {
    pub opens: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    pub refuse: AtomicBool,
    pub specs: Mutex<Vec<(String, TunnelSpec)>>,
}

#[async_trait]
impl TunnelOpener for CountingOpener {
    async fn open(&self, instance_id: &str, _target: &SshTarget, spec: &TunnelSpec) -> Result<TunnelHandle> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(FleetError::tunnel(instance_id, "remote port forwarding failed"));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.specs
            .lock()
            .unwrap()
            .push((instance_id.to_string(), spec.clone()));
        Ok(Arc::new(FakeTunnel {
            id: Uuid::new_v4(),
            spec: spec.clone(),
            closes: self.closes.clone(),
        }))
    }
}

pub fn test_settings() -> FleetSettings {
    FleetSettings {
        wait_delays: vec![Duration::from_millis(1); 5],
        package_dir: PACKAGE_DIR.to_string(),
        remote_resource_dir: RESOURCE_DIR.to_string(),
        ..FleetSettings::default()
    }
}

pub fn credentials() -> LoginCredentials {
    LoginCredentials::key_pair("root", "/keys/fleet")
}

pub fn template() -> InstanceTemplate {
    InstanceTemplate {
        name_prefix: "fleet-test".to_string(),
        zone: Some("fr-par-2".to_string()),
        instance_type: "DEV1-S".to_string(),
        image: "ubuntu_jammy".to_string(),
        credentials: credentials(),
    }
}

/// A pre-existing instance at `203.0.113.<octet>`.
pub fn existing_instance(id: &str, octet: u8, state: InstanceState) -> CloudInstance {
    CloudInstance {
        id: id.to_string(),
        state,
        public_addresses: vec![format!("203.0.113.{}", octet)],
        private_addresses: vec![],
        credentials: credentials(),
        zone: Some("fr-par-2".to_string()),
        instance_type: "DEV1-S".to_string(),
        created_at: Utc::now(),
    }
}

pub fn package_catalog() -> ResourceCatalog {
    ResourceCatalog::new()
        .with_embedded("pkg.zip", b"PK\x03\x04 worker package v1", PACKAGE_DIR, true)
        .unwrap()
        .with_embedded("start.sh", b"#!/bin/sh\nexec ./bin/worker \"$@\"\n", "fleet/bin", false)
        .unwrap()
}

/// Scratch directory under the system temp dir, unique per call.
pub fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("fleet-test-{}", Uuid::new_v4().simple()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub struct TestFleet {
    pub gateway: Arc<MockGateway>,
    pub connector: Arc<FakeConnector>,
    pub opener: Arc<CountingOpener>,
    pub fleet: FleetManager,
}

impl TestFleet {
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    pub fn with_settings(settings: FleetSettings) -> Self {
        fleet_engine::logger::init_for_tests();
        let gateway = Arc::new(MockGateway::with_boot_polls(1));
        let connector = Arc::new(FakeConnector::default());
        let opener = Arc::new(CountingOpener::default());
        let fleet = FleetManager::new(
            settings,
            gateway.clone(),
            connector.clone(),
            opener.clone(),
            package_catalog(),
        );
        Self {
            gateway,
            connector,
            opener,
            fleet,
        }
    }

    /// Host behind an instance the gateway knows about.
    pub async fn host_of(&self, instance_id: &str) -> Arc<FakeHost> {
        use fleet_providers::CloudGateway;
        let instance = self.gateway.get_instance_metadata(instance_id).await.unwrap();
        self.connector.host(instance.primary_address().unwrap())
    }
}
