use thiserror::Error;
use uuid::Uuid;

use crate::InstanceState;

/// Error taxonomy shared by gateways, the synchronizer and the fleet manager.
#[derive(Debug, Error)]
pub enum FleetError {
    /// The cloud provider rejected a request (quota, template, API failure).
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("node {0} not found")]
    NodeNotFound(Uuid),

    /// Remote shell connect/exec/upload failed.
    #[error("transport error on {host}: {message}")]
    Transport { host: String, message: String },

    #[error("reverse tunnel to instance {instance_id} failed: {message}")]
    Tunnel { instance_id: String, message: String },

    #[error("resource {name}: {message}")]
    Resource { name: String, message: String },

    #[error("instance {instance_id} cannot go from {from} to {to}")]
    InvalidTransition {
        instance_id: String,
        from: InstanceState,
        to: InstanceState,
    },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FleetError {
    pub fn provisioning(msg: impl Into<String>) -> Self {
        Self::Provisioning(msg.into())
    }

    pub fn transport(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transport {
            host: host.into(),
            message: msg.into(),
        }
    }

    pub fn tunnel(instance_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Tunnel {
            instance_id: instance_id.into(),
            message: msg.into(),
        }
    }

    pub fn resource(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Resource {
            name: name.into(),
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Retryable conditions are logged at a lower severity and never surfaced
    /// as user-facing failures on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FleetError::Transport { .. } | FleetError::Tunnel { .. })
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;
