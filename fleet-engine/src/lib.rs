//! Fleet lifecycle and incremental deployment engine.
//!
//! `FleetManager` provisions instances through a `CloudGateway`, hands out
//! management ports and reverse tunnels per instance, keeps the worker package
//! in sync on each host and tracks which logical nodes run where.

pub mod allocator;
pub mod catalog;
pub mod fleet;
pub mod gateways;
pub mod hpc;
pub mod logger;
pub mod operation;
pub mod settings;
pub mod shell;
pub mod sync;

pub use allocator::{OpenSshTunnelOpener, PortAndTunnelAllocator, ReverseTunnel, TunnelHandle, TunnelOpener};
pub use catalog::{ManagedResource, ResourceCatalog, ResourceSource};
pub use fleet::{FleetManager, NodeConfig, Placement};
pub use hpc::{HpcDeployment, HpcJob};
pub use operation::FleetOperation;
pub use settings::FleetSettings;
pub use shell::{CommandOutput, OpenSshConnector, RemoteShell, ShellConnector, SshTarget};
pub use sync::{DeployReport, RemoteResourceSynchronizer, SyncReport};
