use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Coordinator,
    Worker,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Coordinator => "coordinator",
            NodeType::Worker => "worker",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Deployed,
    Failed,
}

/// One deployed worker-package process hosted on a cloud instance.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LogicalNode {
    pub id: Uuid,
    pub node_type: NodeType,
    pub management_port: u16,
    pub instance_id: String,
    /// Set for workers only.
    pub coordinator: Option<Uuid>,
    pub status: DeploymentStatus,
    pub tunnel_open: bool,
    pub created_at: DateTime<Utc>,
}

impl LogicalNode {
    pub fn pending(
        id: Uuid,
        node_type: NodeType,
        management_port: u16,
        instance_id: impl Into<String>,
        coordinator: Option<Uuid>,
    ) -> Self {
        Self {
            id,
            node_type,
            management_port,
            instance_id: instance_id.into(),
            coordinator,
            status: DeploymentStatus::Pending,
            tunnel_open: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_worker(&self) -> bool {
        self.node_type == NodeType::Worker
    }

    pub fn is_deployed(&self) -> bool {
        self.status == DeploymentStatus::Deployed
    }
}
