use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

pub mod error;
pub mod node;

pub use error::{FleetError, Result};
pub use node::{DeploymentStatus, LogicalNode, NodeType};

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Pending,    // Request accepted by provider, not yet booted
    Running,    // Booted and addressable
    Suspended,  // Powered off, resources kept
    Terminated, // Destroyed (absorbing)
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Suspended => "suspended",
            InstanceState::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(InstanceState::Pending),
            "running" => Some(InstanceState::Running),
            "suspended" => Some(InstanceState::Suspended),
            "terminated" => Some(InstanceState::Terminated),
            _ => None,
        }
    }

    /// Lifecycle: PENDING -> RUNNING -> {SUSPENDED <-> RUNNING} -> TERMINATED.
    ///
    /// Self-transitions are accepted as idempotent no-ops, except from
    /// TERMINATED which admits nothing.
    pub fn can_transition_to(self, next: InstanceState) -> bool {
        use InstanceState::*;
        match (self, next) {
            (Terminated, _) => false,
            (a, b) if a == b => true,
            (Pending, Running) => true,
            (Running, Suspended) | (Suspended, Running) => true,
            (_, Terminated) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == InstanceState::Terminated
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Credentials / templates ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Auth {
    KeyPair { private_key_path: PathBuf },
    Password { password: String },
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LoginCredentials {
    pub user: String,
    pub auth: Auth,
}

impl LoginCredentials {
    pub fn key_pair(user: impl Into<String>, private_key_path: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            auth: Auth::KeyPair {
                private_key_path: private_key_path.into(),
            },
        }
    }

    pub fn password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            auth: Auth::Password {
                password: password.into(),
            },
        }
    }
}

/// What to ask the provider for when a node needs a fresh instance.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InstanceTemplate {
    pub name_prefix: String,
    pub zone: Option<String>,
    pub instance_type: String,
    pub image: String,
    pub credentials: LoginCredentials,
}

// --- Entities ---

/// Immutable snapshot of a provider instance. Fresh snapshots come from the gateway;
/// nothing mutates one in place.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CloudInstance {
    pub id: String,
    pub state: InstanceState,
    pub public_addresses: Vec<String>,
    pub private_addresses: Vec<String>,
    pub credentials: LoginCredentials,
    pub zone: Option<String>,
    pub instance_type: String,
    pub created_at: DateTime<Utc>,
}

impl CloudInstance {
    /// Public address first, private as a fallback.
    pub fn primary_address(&self) -> Option<&str> {
        self.public_addresses
            .iter()
            .chain(self.private_addresses.iter())
            .map(|a| a.trim())
            .find(|a| !a.is_empty())
    }

    pub fn is_addressable(&self) -> bool {
        self.primary_address().is_some()
    }

    pub fn with_state(&self, state: InstanceState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}

/// `ssh -R <remote_port>:<local_host>:<local_port>` as seen from the controller.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub local_host: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl TunnelSpec {
    pub fn forward_arg(&self) -> String {
        format!("{}:{}:{}", self.remote_port, self.local_host, self.local_port)
    }
}

/// Generates a node identifier.
pub fn new_node_id() -> Uuid {
    Uuid::new_v4()
}
