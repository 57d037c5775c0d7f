//! Logical node table and the add/remove workflows that drive instances,
//! ports, resources and tunnels.
//!
//! Operation bodies run on a bounded pool (see `FleetOperation`). The node
//! table is guarded by a std mutex that is only held for bookkeeping; every
//! cloud call and remote command happens with no lock held.

use fleet_common::{
    CloudInstance, DeploymentStatus, FleetError, InstanceState, InstanceTemplate, LogicalNode,
    NodeType, Result, TunnelSpec,
};
use fleet_providers::{wait_until_running, CloudGateway};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::allocator::{OpenSshTunnelOpener, PortAndTunnelAllocator, TunnelOpener};
use crate::catalog::ResourceCatalog;
use crate::operation::FleetOperation;
use crate::settings::{render_command, FleetSettings};
use crate::shell::{OpenSshConnector, RemoteShell, ShellConnector, SshTarget};
use crate::sync::RemoteResourceSynchronizer;

/// Where a new node should run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// An instance the gateway already knows; resumed if suspended.
    Existing(String),
    New(InstanceTemplate),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_type: NodeType,
    pub placement: Placement,
    /// Required for workers, rejected for coordinators.
    #[serde(default)]
    pub coordinator: Option<Uuid>,
    #[serde(default)]
    pub user_metadata: HashMap<String, String>,
}

impl NodeConfig {
    pub fn coordinator(placement: Placement) -> Self {
        Self {
            node_type: NodeType::Coordinator,
            placement,
            coordinator: None,
            user_metadata: HashMap::new(),
        }
    }

    pub fn worker(placement: Placement, coordinator: Uuid) -> Self {
        Self {
            node_type: NodeType::Worker,
            placement,
            coordinator: Some(coordinator),
            user_metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Default)]
struct NodeTable {
    nodes: HashMap<Uuid, LogicalNode>,
    /// Latest snapshot of every instance hosting at least one node.
    instances: HashMap<String, Arc<CloudInstance>>,
}

impl NodeTable {
    fn on_instance<'a>(&'a self, instance_id: &'a str) -> impl Iterator<Item = &'a LogicalNode> + 'a {
        self.nodes.values().filter(move |n| n.instance_id == instance_id)
    }

    /// The coordinator an instance's nodes belong to, if it hosts any.
    fn served_coordinator(&self, instance_id: &str) -> Option<Uuid> {
        self.on_instance(instance_id).find_map(|n| match n.node_type {
            NodeType::Coordinator => Some(n.id),
            NodeType::Worker => n.coordinator,
        })
    }

    /// Every node on an instance belongs to one coordinator: workers reach it
    /// through the instance's single `localhost:<base>` endpoint.
    fn insert(&mut self, node: LogicalNode, instance: Arc<CloudInstance>) -> Result<()> {
        let serves = match node.node_type {
            NodeType::Coordinator => Some(node.id),
            NodeType::Worker => node.coordinator,
        };
        if let Some(existing) = self.served_coordinator(&node.instance_id) {
            if node.node_type == NodeType::Coordinator
                && self
                    .on_instance(&node.instance_id)
                    .any(|n| n.node_type == NodeType::Coordinator)
            {
                return Err(FleetError::Conflict(format!(
                    "instance {} already hosts coordinator {}",
                    node.instance_id, existing
                )));
            }
            if Some(existing) != serves {
                return Err(FleetError::Conflict(format!(
                    "instance {} already serves coordinator {}",
                    node.instance_id, existing
                )));
            }
        }
        self.instances.insert(instance.id.clone(), instance);
        self.nodes.insert(node.id, node);
        Ok(())
    }

    fn remove(&mut self, node_id: Uuid) -> Option<LogicalNode> {
        let node = self.nodes.remove(&node_id)?;
        if self.on_instance(&node.instance_id).next().is_none() {
            self.instances.remove(&node.instance_id);
        }
        Some(node)
    }

    fn drain_instance(&mut self, instance_id: &str) -> Vec<LogicalNode> {
        let ids: Vec<Uuid> = self.on_instance(instance_id).map(|n| n.id).collect();
        self.instances.remove(instance_id);
        ids.into_iter().filter_map(|id| self.nodes.remove(&id)).collect()
    }

    fn with_instance(&self, node_id: Uuid) -> Option<(LogicalNode, Arc<CloudInstance>)> {
        let node = self.nodes.get(&node_id)?;
        let instance = self.instances.get(&node.instance_id)?;
        Some((node.clone(), instance.clone()))
    }
}

fn lock(m: &Mutex<NodeTable>) -> MutexGuard<'_, NodeTable> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What an add-node attempt has claimed so far, for rollback.
#[derive(Default)]
struct Claimed {
    instance_id: Option<String>,
    created: bool,
    port: Option<u16>,
    registered: bool,
}

type CoordinatorRef = (LogicalNode, Arc<CloudInstance>);

struct FleetInner {
    settings: FleetSettings,
    gateway: Arc<dyn CloudGateway>,
    connector: Arc<dyn ShellConnector>,
    allocator: PortAndTunnelAllocator,
    synchronizer: RemoteResourceSynchronizer,
    catalog: ResourceCatalog,
    table: Mutex<NodeTable>,
    pool: Arc<Semaphore>,
}

/// Owns the node table and runs add/remove operations against one gateway.
///
/// Cloning is cheap and shares the same fleet.
#[derive(Clone)]
pub struct FleetManager {
    inner: Arc<FleetInner>,
}

impl FleetManager {
    pub fn new(
        settings: FleetSettings,
        gateway: Arc<dyn CloudGateway>,
        connector: Arc<dyn ShellConnector>,
        tunnel_opener: Arc<dyn TunnelOpener>,
        catalog: ResourceCatalog,
    ) -> Self {
        let allocator = PortAndTunnelAllocator::new(settings.base_port, tunnel_opener);
        let synchronizer = RemoteResourceSynchronizer::new(settings.remote_resource_dir.clone());
        let pool = Arc::new(Semaphore::new(settings.worker_pool_size.max(1)));
        Self {
            inner: Arc::new(FleetInner {
                settings,
                gateway,
                connector,
                allocator,
                synchronizer,
                catalog,
                table: Mutex::new(NodeTable::default()),
                pool,
            }),
        }
    }

    /// Fleet over the system OpenSSH client.
    pub fn with_openssh(
        settings: FleetSettings,
        gateway: Arc<dyn CloudGateway>,
        catalog: ResourceCatalog,
    ) -> Self {
        Self::new(
            settings,
            gateway,
            Arc::new(OpenSshConnector::default()),
            Arc::new(OpenSshTunnelOpener::default()),
            catalog,
        )
    }

    pub fn settings(&self) -> &FleetSettings {
        &self.inner.settings
    }

    pub fn allocator(&self) -> &PortAndTunnelAllocator {
        &self.inner.allocator
    }

    pub fn add_node(&self, config: NodeConfig) -> FleetOperation<LogicalNode> {
        let inner = self.inner.clone();
        FleetOperation::spawn(self.inner.pool.clone(), "add_node", move || async move {
            inner.add_node(config).await
        })
    }

    pub fn remove_node(&self, node_id: Uuid, desired: InstanceState) -> FleetOperation<()> {
        let inner = self.inner.clone();
        FleetOperation::spawn(self.inner.pool.clone(), "remove_node", move || async move {
            inner.remove_node(node_id, desired).await
        })
    }

    /// Retries the reverse tunnel of a worker; resolves to the new `tunnel_open`.
    pub fn reopen_tunnel(&self, node_id: Uuid) -> FleetOperation<bool> {
        let inner = self.inner.clone();
        FleetOperation::spawn(self.inner.pool.clone(), "reopen_tunnel", move || async move {
            inner.reopen_tunnel(node_id).await
        })
    }

    /// Removes every node, workers before coordinators.
    ///
    /// Keeps going after a failure and returns the first error seen.
    pub async fn shutdown(&self, desired: InstanceState) -> Result<()> {
        let mut nodes = self.get_nodes();
        nodes.sort_by_key(|n| n.node_type == NodeType::Coordinator);
        info!(nodes = nodes.len(), desired = %desired, "fleet shutdown");

        let mut first_err = None;
        for node in nodes {
            // Suspending or terminating an instance drops its co-located nodes.
            if self.get_node(node.id).is_none() {
                continue;
            }
            if let Err(e) = self.remove_node(node.id, desired).await {
                warn!(node_id = %node.id, instance_id = %node.instance_id, error = %e, "node removal failed during shutdown");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Snapshot of the node table.
    pub fn get_nodes(&self) -> Vec<LogicalNode> {
        let mut nodes: Vec<LogicalNode> = lock(&self.inner.table).nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.created_at);
        nodes
    }

    pub fn get_node(&self, node_id: Uuid) -> Option<LogicalNode> {
        lock(&self.inner.table).nodes.get(&node_id).cloned()
    }

    pub fn coordinators(&self) -> Vec<LogicalNode> {
        self.get_nodes()
            .into_iter()
            .filter(|n| n.node_type == NodeType::Coordinator)
            .collect()
    }

    pub fn workers(&self) -> Vec<LogicalNode> {
        self.get_nodes().into_iter().filter(|n| n.is_worker()).collect()
    }

    pub fn nodes_on(&self, instance_id: &str) -> Vec<LogicalNode> {
        lock(&self.inner.table)
            .on_instance(instance_id)
            .cloned()
            .collect()
    }

    pub fn instance(&self, instance_id: &str) -> Option<Arc<CloudInstance>> {
        lock(&self.inner.table).instances.get(instance_id).cloned()
    }
}

impl FleetInner {
    async fn add_node(&self, config: NodeConfig) -> Result<LogicalNode> {
        let node_id = fleet_common::new_node_id();
        let coordinator = self.resolve_coordinator(&config)?;

        let mut claimed = Claimed::default();
        match self.deploy_node(node_id, &config, coordinator.as_ref(), &mut claimed).await {
            Ok(node) => {
                info!(
                    node_id = %node.id,
                    instance_id = %node.instance_id,
                    node_type = node.node_type.as_str(),
                    port = node.management_port,
                    tunnel_open = node.tunnel_open,
                    "node deployed"
                );
                Ok(node)
            }
            Err(e) => {
                error!(
                    node_id = %node_id,
                    instance_id = claimed.instance_id.as_deref().unwrap_or("-"),
                    error = %e,
                    "node deployment failed, rolling back"
                );
                self.roll_back(node_id, &claimed).await;
                Err(e)
            }
        }
    }

    fn resolve_coordinator(&self, config: &NodeConfig) -> Result<Option<CoordinatorRef>> {
        match config.node_type {
            NodeType::Coordinator => {
                if config.coordinator.is_some() {
                    return Err(FleetError::config("a coordinator cannot reference another coordinator"));
                }
                Ok(None)
            }
            NodeType::Worker => {
                let id = config
                    .coordinator
                    .ok_or_else(|| FleetError::config("a worker needs a coordinator"))?;
                let (coordinator, instance) = lock(&self.table)
                    .with_instance(id)
                    .filter(|(n, _)| n.node_type == NodeType::Coordinator)
                    .ok_or(FleetError::NodeNotFound(id))?;
                if !coordinator.is_deployed() {
                    return Err(FleetError::Conflict(format!(
                        "coordinator {} is not deployed yet",
                        id
                    )));
                }
                Ok(Some((coordinator, instance)))
            }
        }
    }

    async fn acquire_instance(&self, node_id: Uuid, config: &NodeConfig, claimed: &mut Claimed) -> Result<String> {
        match &config.placement {
            Placement::Existing(id) => {
                let instance = self.gateway.get_instance_metadata(id).await?;
                claimed.instance_id = Some(id.clone());
                match instance.state {
                    InstanceState::Suspended => {
                        info!(instance_id = %id, "resuming suspended instance");
                        self.gateway.resume_instance(id).await?;
                    }
                    InstanceState::Terminated => return Err(FleetError::InstanceNotFound(id.clone())),
                    InstanceState::Pending | InstanceState::Running => {}
                }
                Ok(id.clone())
            }
            Placement::New(template) => {
                let mut metadata = config.user_metadata.clone();
                metadata.insert("fleet-node-id".to_string(), node_id.to_string());
                metadata.insert("fleet-node-type".to_string(), config.node_type.as_str().to_string());
                let instance = self.gateway.create_instance(template, &metadata).await?;
                info!(
                    instance_id = %instance.id,
                    provider = self.gateway.provider_name(),
                    instance_type = %instance.instance_type,
                    "instance created"
                );
                claimed.instance_id = Some(instance.id.clone());
                claimed.created = true;
                Ok(instance.id)
            }
        }
    }

    async fn deploy_node(
        &self,
        node_id: Uuid,
        config: &NodeConfig,
        coordinator: Option<&CoordinatorRef>,
        claimed: &mut Claimed,
    ) -> Result<LogicalNode> {
        let instance_id = self.acquire_instance(node_id, config, claimed).await?;
        let instance = Arc::new(
            wait_until_running(self.gateway.as_ref(), &instance_id, &self.settings.wait_delays).await?,
        );

        let port = match config.node_type {
            NodeType::Coordinator => self.settings.base_port,
            NodeType::Worker => {
                let port = self.allocator.next_management_port(&instance_id)?;
                claimed.port = Some(port);
                port
            }
        };
        let node = LogicalNode::pending(
            node_id,
            config.node_type,
            port,
            instance_id.clone(),
            coordinator.map(|(c, _)| c.id),
        );
        lock(&self.table).insert(node.clone(), instance.clone())?;
        claimed.registered = true;

        let target = SshTarget::for_instance(&instance, self.settings.ssh_port, self.settings.ssh_connect_timeout)?;
        let shell = self.connector.connect(&target).await?;
        let started = self.install_and_start(shell.as_ref(), &node, coordinator).await;
        if let Err(e) = shell.disconnect().await {
            debug!(instance_id = %instance_id, error = %e, "disconnect failed");
        }
        started?;

        let tunnel_open = match coordinator {
            Some(coordinator) => self.open_worker_tunnel(&node, &target, coordinator).await?,
            None => false,
        };

        let mut table = lock(&self.table);
        let entry = table
            .nodes
            .get_mut(&node_id)
            .ok_or(FleetError::NodeNotFound(node_id))?;
        entry.status = DeploymentStatus::Deployed;
        entry.tunnel_open = tunnel_open;
        Ok(entry.clone())
    }

    async fn install_and_start(
        &self,
        shell: &dyn RemoteShell,
        node: &LogicalNode,
        coordinator: Option<&CoordinatorRef>,
    ) -> Result<()> {
        // Flags are per host; the remote checksum cache still avoids re-sending bodies.
        let mut catalog = self.catalog.fresh();
        let (sync, deploy) = self
            .synchronizer
            .synchronize_and_deploy(&mut catalog, shell)
            .await?;
        debug!(
            node_id = %node.id,
            instance_id = %node.instance_id,
            uploaded = sync.uploaded.len(),
            cache_hits = sync.cache_hits.len(),
            deployed = deploy.deployed.len(),
            "package synchronized"
        );

        let command = self.node_command(&self.settings.start_command, node, coordinator.map(|(c, _)| c));
        shell.exec_checked(&command).await?;
        Ok(())
    }

    fn node_command(&self, template: &str, node: &LogicalNode, coordinator: Option<&LogicalNode>) -> String {
        let node_id = node.id.to_string();
        let port = node.management_port.to_string();
        // Workers reach their coordinator through the reverse tunnel, or directly when co-located.
        let coordinator = coordinator
            .map(|c| format!("localhost:{}", c.management_port))
            .unwrap_or_else(|| "none".to_string());
        render_command(
            template,
            &[
                ("package_dir", self.settings.package_dir.as_str()),
                ("node_type", node.node_type.as_str()),
                ("node_id", node_id.as_str()),
                ("port", port.as_str()),
                ("coordinator", coordinator.as_str()),
            ],
        )
    }

    /// Returns whether a tunnel is now open for the worker's instance.
    ///
    /// Only a `Conflict` (the instance already forwards elsewhere) is an error;
    /// any other tunnel failure leaves the worker deployed without one.
    async fn open_worker_tunnel(
        &self,
        node: &LogicalNode,
        target: &SshTarget,
        coordinator: &CoordinatorRef,
    ) -> Result<bool> {
        let (coordinator, coordinator_instance) = coordinator;
        if coordinator.instance_id == node.instance_id {
            debug!(node_id = %node.id, instance_id = %node.instance_id, "coordinator is co-located, no tunnel");
            return Ok(false);
        }
        let Some(coordinator_host) = coordinator_instance.primary_address() else {
            warn!(node_id = %node.id, coordinator_id = %coordinator.id, "coordinator instance has no address, no tunnel");
            return Ok(false);
        };
        // Remote `localhost:<port>` on the worker's instance reaches the coordinator via the controller.
        let spec = TunnelSpec {
            local_host: coordinator_host.to_string(),
            local_port: coordinator.management_port,
            remote_port: coordinator.management_port,
        };
        match self
            .allocator
            .open_reverse_tunnel(&node.instance_id, target, &spec)
            .await
        {
            Ok(_) => Ok(true),
            Err(e @ FleetError::Conflict(_)) => Err(e),
            Err(e) => {
                warn!(
                    node_id = %node.id,
                    instance_id = %node.instance_id,
                    error = %e,
                    "reverse tunnel failed, node stays deployed"
                );
                Ok(false)
            }
        }
    }

    async fn roll_back(&self, node_id: Uuid, claimed: &Claimed) {
        if claimed.registered {
            lock(&self.table).remove(node_id);
        }
        let Some(instance_id) = claimed.instance_id.as_deref() else {
            return;
        };
        if let Some(port) = claimed.port {
            self.allocator.release_port(instance_id, port);
        }

        if claimed.created {
            let orphans = lock(&self.table).drain_instance(instance_id);
            for orphan in orphans {
                warn!(node_id = %orphan.id, instance_id = %instance_id, "dropping node hosted on rolled-back instance");
            }
            self.allocator.close_tunnel(instance_id).await;
            self.allocator.forget_instance(instance_id);
            match self.gateway.terminate_instance(instance_id).await {
                Ok(()) => info!(instance_id = %instance_id, "terminated instance after failed deployment"),
                Err(e) => error!(instance_id = %instance_id, error = %e, "rollback terminate failed"),
            }
            return;
        }

        let still_hosting = lock(&self.table).on_instance(instance_id).next().is_some();
        if still_hosting {
            debug!(instance_id = %instance_id, "instance still hosts nodes, leaving it running");
            return;
        }
        match self.gateway.suspend_instance(instance_id).await {
            Ok(_) => info!(instance_id = %instance_id, "suspended instance after failed deployment"),
            Err(e) => error!(instance_id = %instance_id, error = %e, "rollback suspend failed"),
        }
    }

    async fn remove_node(&self, node_id: Uuid, desired: InstanceState) -> Result<()> {
        if desired == InstanceState::Pending {
            return Err(FleetError::config("cannot remove a node into the pending state"));
        }
        let (node, instance) = lock(&self.table)
            .with_instance(node_id)
            .ok_or(FleetError::NodeNotFound(node_id))?;
        let instance_id = node.instance_id.as_str();

        self.stop_node(&node, &instance).await;

        // The process is stopped either way; the rest of the instance's
        // bookkeeping waits for the provider to confirm the transition.
        lock(&self.table).remove(node_id);
        if node.is_worker() {
            self.allocator.release_port(instance_id, node.management_port);
        }

        if let Err(e) = self.gateway.transition(instance_id, desired).await {
            warn!(
                node_id = %node_id,
                instance_id = %instance_id,
                desired = %desired,
                error = %e,
                "instance transition failed, co-located nodes kept"
            );
            self.close_tunnel_if_unused(instance_id).await;
            return Err(e);
        }

        match desired {
            InstanceState::Running => self.close_tunnel_if_unused(instance_id).await,
            _ => {
                self.allocator.close_tunnel(instance_id).await;
                let dropped = lock(&self.table).drain_instance(instance_id);
                for other in dropped {
                    warn!(
                        node_id = %other.id,
                        instance_id = %instance_id,
                        desired = %desired,
                        "co-located node dropped with its instance"
                    );
                }
                self.allocator.forget_instance(instance_id);
            }
        }

        info!(node_id = %node_id, instance_id = %instance_id, desired = %desired, "node removed");
        Ok(())
    }

    async fn close_tunnel_if_unused(&self, instance_id: &str) {
        let workers_left = lock(&self.table).on_instance(instance_id).any(|n| n.is_worker());
        if !workers_left {
            self.allocator.close_tunnel(instance_id).await;
        }
    }

    /// Best-effort graceful stop of the node's process.
    async fn stop_node(&self, node: &LogicalNode, instance: &CloudInstance) {
        let coordinator = node
            .coordinator
            .and_then(|id| lock(&self.table).nodes.get(&id).cloned());
        let command = self.node_command(&self.settings.stop_command, node, coordinator.as_ref());

        let result: Result<()> = async {
            let target = SshTarget::for_instance(instance, self.settings.ssh_port, self.settings.ssh_connect_timeout)?;
            let shell = self.connector.connect(&target).await?;
            let out = shell.exec_checked(&command).await;
            if let Err(e) = shell.disconnect().await {
                debug!(instance_id = %instance.id, error = %e, "disconnect failed");
            }
            out.map(|_| ())
        }
        .await;

        if let Err(e) = result {
            warn!(node_id = %node.id, instance_id = %instance.id, error = %e, "graceful stop failed, continuing");
        }
    }

    async fn reopen_tunnel(&self, node_id: Uuid) -> Result<bool> {
        let (node, instance) = lock(&self.table)
            .with_instance(node_id)
            .ok_or(FleetError::NodeNotFound(node_id))?;
        let coordinator_id = node
            .coordinator
            .ok_or_else(|| FleetError::config(format!("node {} is not a worker", node_id)))?;
        let coordinator = lock(&self.table)
            .with_instance(coordinator_id)
            .ok_or(FleetError::NodeNotFound(coordinator_id))?;

        let target = SshTarget::for_instance(&instance, self.settings.ssh_port, self.settings.ssh_connect_timeout)?;
        let open = self.open_worker_tunnel(&node, &target, &coordinator).await?;

        if let Some(entry) = lock(&self.table).nodes.get_mut(&node_id) {
            entry.tunnel_open = open;
        }
        Ok(open)
    }
}
