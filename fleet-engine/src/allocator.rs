use async_trait::async_trait;
use fleet_common::{FleetError, Result, TunnelSpec};
use std::collections::{BTreeSet, HashMap};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::logger::tail_str;
use crate::shell::{ssh_command, SshTarget};

/// An open reverse tunnel. Closing is idempotent.
#[async_trait]
pub trait ReverseTunnel: Send + Sync {
    fn id(&self) -> Uuid;
    fn spec(&self) -> &TunnelSpec;
    async fn close(&self) -> Result<()>;
}

pub type TunnelHandle = Arc<dyn ReverseTunnel>;

#[async_trait]
pub trait TunnelOpener: Send + Sync {
    async fn open(&self, instance_id: &str, target: &SshTarget, spec: &TunnelSpec) -> Result<TunnelHandle>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Management ports and reverse tunnels per instance.
///
/// Each instance tracks the set of live ports; a new port is one above the
/// highest live one, starting at `base_port + 1` (`base_port` belongs to the
/// coordinator). An instance's record disappears with its last port.
///
/// Tunnels are single-flight per instance: the registry lock only guards the
/// get-or-insert of a per-instance cell, the SSH process is started outside it,
/// and concurrent callers wait on the same cell.
pub struct PortAndTunnelAllocator {
    base_port: u16,
    ports: Mutex<HashMap<String, BTreeSet<u16>>>,
    tunnels: Mutex<HashMap<String, Arc<OnceCell<TunnelHandle>>>>,
    opener: Arc<dyn TunnelOpener>,
}

impl PortAndTunnelAllocator {
    pub fn new(base_port: u16, opener: Arc<dyn TunnelOpener>) -> Self {
        Self {
            base_port,
            ports: Mutex::new(HashMap::new()),
            tunnels: Mutex::new(HashMap::new()),
            opener,
        }
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    pub fn next_management_port(&self, instance_id: &str) -> Result<u16> {
        let mut ports = lock(&self.ports);
        let live = ports.entry(instance_id.to_string()).or_default();
        let highest = live.last().copied().unwrap_or(self.base_port);
        let Some(next) = highest.checked_add(1) else {
            if live.is_empty() {
                ports.remove(instance_id);
            }
            return Err(FleetError::Conflict(format!(
                "management ports exhausted on instance {}",
                instance_id
            )));
        };
        live.insert(next);
        debug!(instance_id = %instance_id, port = next, "management port assigned");
        Ok(next)
    }

    /// Releases one port; returns false if it was not held.
    pub fn release_port(&self, instance_id: &str, port: u16) -> bool {
        let mut ports = lock(&self.ports);
        let Some(live) = ports.get_mut(instance_id) else {
            return false;
        };
        let removed = live.remove(&port);
        if live.is_empty() {
            ports.remove(instance_id);
        }
        removed
    }

    /// Drops every port of an instance that went away.
    pub fn forget_instance(&self, instance_id: &str) {
        lock(&self.ports).remove(instance_id);
    }

    pub fn live_ports(&self, instance_id: &str) -> Vec<u16> {
        lock(&self.ports)
            .get(instance_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_port_record(&self, instance_id: &str) -> bool {
        lock(&self.ports).contains_key(instance_id)
    }

    pub fn port_record_count(&self) -> usize {
        lock(&self.ports).len()
    }

    /// Opens the instance's reverse tunnel, or returns the one already open.
    ///
    /// An instance carries a single forward; asking for a different one while
    /// it is open is a `Conflict`.
    pub async fn open_reverse_tunnel(
        &self,
        instance_id: &str,
        target: &SshTarget,
        spec: &TunnelSpec,
    ) -> Result<TunnelHandle> {
        let cell = lock(&self.tunnels)
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let handle = cell
            .get_or_try_init(|| async {
                let handle = self.opener.open(instance_id, target, spec).await?;
                info!(
                    instance_id = %instance_id,
                    tunnel_id = %handle.id(),
                    forward = %spec.forward_arg(),
                    "reverse tunnel opened"
                );
                Ok::<_, FleetError>(handle)
            })
            .await?
            .clone();

        // A close_tunnel that raced with the open removed the cell; do not leak the process.
        let still_registered = lock(&self.tunnels)
            .get(instance_id)
            .map(|c| Arc::ptr_eq(c, &cell))
            .unwrap_or(false);
        if !still_registered {
            if let Err(e) = handle.close().await {
                warn!(instance_id = %instance_id, error = %e, "failed to close orphaned tunnel");
            }
            return Err(FleetError::tunnel(instance_id, "tunnel closed while opening"));
        }
        if handle.spec() != spec {
            return Err(FleetError::Conflict(format!(
                "instance {} already forwards {}, cannot forward {}",
                instance_id,
                handle.spec().forward_arg(),
                spec.forward_arg()
            )));
        }
        Ok(handle)
    }

    pub fn tunnel(&self, instance_id: &str) -> Option<TunnelHandle> {
        lock(&self.tunnels)
            .get(instance_id)
            .and_then(|cell| cell.get().cloned())
    }

    /// Closes and forgets the instance's tunnel; no-op if none exists.
    pub async fn close_tunnel(&self, instance_id: &str) {
        let cell = lock(&self.tunnels).remove(instance_id);
        let Some(handle) = cell.and_then(|c| c.get().cloned()) else {
            return;
        };
        match handle.close().await {
            Ok(()) => info!(instance_id = %instance_id, tunnel_id = %handle.id(), "reverse tunnel closed"),
            Err(e) => warn!(instance_id = %instance_id, error = %e, "reverse tunnel close failed"),
        }
    }

    pub fn open_tunnel_count(&self) -> usize {
        lock(&self.tunnels)
            .values()
            .filter(|c| c.initialized())
            .count()
    }
}

/// `ssh -N -R <remote>:<host>:<local>` as a child process.
pub struct OpenSshTunnelOpener {
    /// How long the ssh process must stay up before the tunnel counts as open.
    settle: Duration,
}

impl Default for OpenSshTunnelOpener {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(2),
        }
    }
}

impl OpenSshTunnelOpener {
    pub fn new(settle: Duration) -> Self {
        Self { settle }
    }
}

#[async_trait]
impl TunnelOpener for OpenSshTunnelOpener {
    async fn open(&self, instance_id: &str, target: &SshTarget, spec: &TunnelSpec) -> Result<TunnelHandle> {
        let mut child = ssh_command(target)
            .arg("-N")
            .arg("-o")
            .arg("ExitOnForwardFailure=yes")
            .arg("-o")
            .arg("ServerAliveInterval=30")
            .arg("-R")
            .arg(spec.forward_arg())
            .arg(target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FleetError::tunnel(instance_id, format!("ssh spawn failed: {}", e)))?;

        let early_exit = tokio::time::timeout(self.settle, child.wait()).await;
        if let Ok(exit) = early_exit {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            let status = exit
                .map(|s| s.to_string())
                .unwrap_or_else(|e| e.to_string());
            return Err(FleetError::tunnel(
                instance_id,
                format!("ssh exited ({}): {}", status, tail_str(stderr.trim(), 2000)),
            ));
        }

        Ok(Arc::new(SshReverseTunnel {
            id: Uuid::new_v4(),
            spec: spec.clone(),
            child: Mutex::new(Some(child)),
        }))
    }
}

struct SshReverseTunnel {
    id: Uuid,
    spec: TunnelSpec,
    child: Mutex<Option<Child>>,
}

#[async_trait]
impl ReverseTunnel for SshReverseTunnel {
    fn id(&self) -> Uuid {
        self.id
    }

    fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    async fn close(&self) -> Result<()> {
        let child = lock(&self.child).take();
        if let Some(mut child) = child {
            child
                .kill()
                .await
                .map_err(|e| FleetError::tunnel(self.id.to_string(), format!("kill failed: {}", e)))?;
        }
        Ok(())
    }
}
