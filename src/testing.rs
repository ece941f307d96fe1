//! In-memory stand-ins for remote hosts and the build tooling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;

use crate::domain::host::{BaseOs, DesiredState, Host, ManagedFile, OsUpdatePolicy, RolloutPolicy};
use crate::error::FleetError;
use crate::nix::{Builder, Transfer};
use crate::transport::{ExecOutput, RemoteSession, SessionPool, SshTarget};

pub fn host(name: &str, base: BaseOs) -> Host {
    Host {
        name: name.to_string(),
        addr: format!("{name}.test"),
        base,
        ssh_user: "root".to_string(),
        ssh_port: 22,
        identity_file: None,
        rollout: RolloutPolicy::default(),
        os_update: OsUpdatePolicy::default(),
    }
}

pub fn hosts(n: usize, base: BaseOs) -> Vec<Host> {
    (0..n).map(|i| host(&format!("host-{i:02}"), base)).collect()
}

/// A scripted host. Commands are matched against registered rules by
/// substring, most recent rule first; a few commands the engine relies on
/// have built-in behaviour.
pub struct FakeHost {
    target: SshTarget,
    rules: Mutex<Vec<(String, ExecOutput)>>,
    files: Mutex<HashMap<String, String>>,
    log: Mutex<Vec<String>>,
    unreachable: AtomicBool,
    down_for: AtomicUsize,
    reboot_downtime: AtomicUsize,
}

impl FakeHost {
    pub fn new(name: &str) -> Self {
        Self::for_target(SshTarget {
            addr: format!("{name}.test"),
            port: 22,
            user: "root".to_string(),
        })
    }

    pub fn for_target(target: SshTarget) -> Self {
        Self {
            target,
            rules: Mutex::new(Vec::new()),
            files: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            unreachable: AtomicBool::new(false),
            down_for: AtomicUsize::new(0),
            reboot_downtime: AtomicUsize::new(0),
        }
    }

    pub fn respond(&self, pattern: &str, exit_code: i32, stdout: &str) {
        self.rules.lock().unwrap().push((
            pattern.to_string(),
            ExecOutput {
                stdout: stdout.to_string(),
                stderr: if exit_code == 0 {
                    String::new()
                } else {
                    format!("{pattern}: failed")
                },
                exit_code,
            },
        ));
    }

    pub fn put_file(&self, path: &str, body: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), body.to_string());
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of commands that fail with a connection error after `shutdown -r`.
    pub fn set_reboot_downtime(&self, commands: usize) {
        self.reboot_downtime.store(commands, Ordering::SeqCst);
    }

    pub fn executed(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn run(&self, command: &str) -> Result<ExecOutput, FleetError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(FleetError::connection(self.target.addr.clone(), "connection refused"));
        }
        let down = self
            .down_for
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if down {
            return Err(FleetError::connection(self.target.addr.clone(), "host is rebooting"));
        }

        self.log.lock().unwrap().push(command.to_string());

        let matched = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, out)| out.clone());
        if let Some(out) = matched {
            return Ok(out);
        }

        Ok(self.builtin(command))
    }

    fn builtin(&self, command: &str) -> ExecOutput {
        let ok = |stdout: String| ExecOutput {
            stdout,
            stderr: String::new(),
            exit_code: 0,
        };
        let body = command.strip_prefix("sudo ").unwrap_or(command);

        if let Some(rest) = body.strip_prefix("echo ") {
            return ok(format!("{}\n", rest.trim_matches('\'')));
        }

        if body.contains("base64 -d >") {
            let encoded = body
                .split("printf '%s' '")
                .nth(1)
                .and_then(|s| s.split('\'').next())
                .unwrap_or_default();
            let target = body.rsplit(' ').next().unwrap_or_default();
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .unwrap();
            self.put_file(target, &String::from_utf8(decoded).unwrap());
            return ok(String::new());
        }

        if let Some(rest) = body.strip_prefix("cat ") {
            let path = rest.split_whitespace().next().unwrap_or_default();
            return match self.file(path) {
                Some(content) => ok(content),
                None if body.contains("echo '{}'") => ok("{}\n".to_string()),
                None => ok(String::new()),
            };
        }

        // A healthy host: 50 GiB free everywhere, daemon up, nix installed.
        if body.starts_with("df ") {
            return ok("52428800\n".to_string());
        }
        if body.starts_with("systemctl is-active") {
            return ok("active\n".to_string());
        }
        if body.starts_with("nix --version") {
            return ok("nix (Nix) 2.24.9\n".to_string());
        }

        if body.contains("shutdown -r") {
            let downtime = self.reboot_downtime.load(Ordering::SeqCst);
            self.down_for.store(downtime, Ordering::SeqCst);
        }

        ok(String::new())
    }
}

#[async_trait]
impl RemoteSession for FakeHost {
    fn target(&self) -> &SshTarget {
        &self.target
    }

    async fn exec(&self, command: &str) -> Result<ExecOutput, FleetError> {
        self.run(command)
    }

    async fn exec_sudo(&self, command: &str) -> Result<ExecOutput, FleetError> {
        self.run(&format!("sudo {command}"))
    }
}

#[derive(Default)]
pub struct FakePool {
    hosts: Mutex<HashMap<SshTarget, Arc<FakeHost>>>,
    evictions: Mutex<Vec<SshTarget>>,
}

impl FakePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, host: &Host) -> Arc<FakeHost> {
        let fake = Arc::new(FakeHost::for_target(host.target()));
        self.hosts
            .lock()
            .unwrap()
            .insert(host.target(), fake.clone());
        fake
    }

    pub fn get(&self, host: &Host) -> Arc<FakeHost> {
        self.hosts.lock().unwrap()[&host.target()].clone()
    }

    pub fn evictions(&self) -> Vec<SshTarget> {
        self.evictions.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionPool for FakePool {
    async fn session(&self, target: &SshTarget) -> Result<Arc<dyn RemoteSession>, FleetError> {
        let found = self.hosts.lock().unwrap().get(target).cloned();
        match found {
            Some(host) => Ok(host),
            None => Err(FleetError::connection(target.addr.clone(), "no route to host")),
        }
    }

    async fn evict(&self, target: &SshTarget) {
        self.evictions.lock().unwrap().push(target.clone());
    }
}

/// Builds a deterministic artifact per host: `sha256-<name>-<revision>`.
#[derive(Default)]
pub struct FakeBuilder {
    revision: AtomicUsize,
    failing: Mutex<Vec<String>>,
    managed_files: Mutex<Vec<ManagedFile>>,
    builds: Mutex<Vec<String>>,
}

impl FakeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, host: &str) {
        self.failing.lock().unwrap().push(host.to_string());
    }

    /// Change every host's artifact.
    pub fn bump(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    pub fn manage(&self, path: &str) {
        self.managed_files.lock().unwrap().push(ManagedFile {
            path: path.to_string(),
            restart_units: Vec::new(),
        });
    }

    pub fn builds(&self) -> Vec<String> {
        self.builds.lock().unwrap().clone()
    }

    pub fn desired_for(&self, host: &str) -> DesiredState {
        let rev = self.revision.load(Ordering::SeqCst);
        DesiredState {
            store_path: format!("/nix/store/{rev:032}-{host}-system"),
            manifest_hash: format!("sha256-{host}-{rev}"),
            managed_files: self.managed_files.lock().unwrap().clone(),
        }
    }
}

#[async_trait]
impl Builder for FakeBuilder {
    async fn build_host(&self, name: &str, _base: BaseOs) -> Result<DesiredState, FleetError> {
        self.builds.lock().unwrap().push(name.to_string());
        if self.failing.lock().unwrap().iter().any(|h| h == name) {
            return Err(FleetError::Build {
                host: name.to_string(),
                reason: "evaluation error".to_string(),
            });
        }
        Ok(self.desired_for(name))
    }

    async fn closure_size(&self, _store_path: &str) -> Result<u64, FleetError> {
        Ok(1024 * 1024)
    }
}

#[derive(Default)]
pub struct FakeTransfer {
    failing: Mutex<Vec<String>>,
    copies: Mutex<Vec<String>>,
}

impl FakeTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, host: &str) {
        self.failing.lock().unwrap().push(host.to_string());
    }

    pub fn copies(&self) -> Vec<String> {
        self.copies.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transfer for FakeTransfer {
    async fn copy_to_host(&self, _desired: &DesiredState, host: &Host) -> Result<(), FleetError> {
        if self.failing.lock().unwrap().iter().any(|h| h == &host.name) {
            return Err(FleetError::Transfer {
                host: host.name.clone(),
                reason: "connection reset during copy".to_string(),
            });
        }
        self.copies.lock().unwrap().push(host.name.clone());
        Ok(())
    }
}
