use fleet_common::{FleetError, Result};
use fleet_providers::{delays_from_millis, DEFAULT_WAIT_DELAYS_MS};
use std::time::Duration;

pub const DEFAULT_BASE_PORT: u16 = 11000;
pub const DEFAULT_WORKER_POOL_SIZE: usize = 8;

pub const DEFAULT_START_COMMAND: &str = "cd {package_dir} && nohup ./bin/start-node.sh --type {node_type} --id {node_id} --port {port} --coordinator {coordinator} > node-{node_id}.log 2>&1 < /dev/null &";
pub const DEFAULT_STOP_COMMAND: &str = "cd {package_dir} && ./bin/stop-node.sh --port {port}";

/// Engine settings.
///
/// Every key is optional; see `from_lookup` for names and defaults.
#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub base_port: u16,
    pub worker_pool_size: usize,
    pub remote_resource_dir: String,
    pub package_dir: String,
    pub ssh_port: u16,
    pub ssh_connect_timeout: Duration,
    pub start_command: String,
    pub stop_command: String,
    pub wait_delays: Vec<Duration>,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_BASE_PORT,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            remote_resource_dir: "fleet/resources".to_string(),
            package_dir: "fleet/package".to_string(),
            ssh_port: 22,
            ssh_connect_timeout: Duration::from_secs(10),
            start_command: DEFAULT_START_COMMAND.to_string(),
            stop_command: DEFAULT_STOP_COMMAND.to_string(),
            wait_delays: delays_from_millis(DEFAULT_WAIT_DELAYS_MS),
        }
    }
}

impl FleetSettings {
    /// Reads settings from the process environment, after loading `.env` if present.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut s = Self::default();

        if let Some(v) = get("FLEET_BASE_PORT") {
            s.base_port = parse_num(&v, "FLEET_BASE_PORT")?;
            if s.base_port == u16::MAX {
                return Err(FleetError::config("FLEET_BASE_PORT leaves no room for workers"));
            }
        }
        if let Some(v) = get("FLEET_WORKER_POOL_SIZE") {
            s.worker_pool_size = parse_num(&v, "FLEET_WORKER_POOL_SIZE")?;
            if s.worker_pool_size == 0 {
                return Err(FleetError::config("FLEET_WORKER_POOL_SIZE must be > 0"));
            }
        }
        if let Some(v) = get("FLEET_REMOTE_RESOURCE_DIR") {
            s.remote_resource_dir = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("FLEET_PACKAGE_DIR") {
            s.package_dir = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("FLEET_SSH_PORT") {
            s.ssh_port = parse_num(&v, "FLEET_SSH_PORT")?;
        }
        if let Some(v) = get("FLEET_SSH_CONNECT_TIMEOUT_S") {
            s.ssh_connect_timeout = Duration::from_secs(parse_num(&v, "FLEET_SSH_CONNECT_TIMEOUT_S")?);
        }
        if let Some(v) = get("FLEET_START_COMMAND") {
            s.start_command = v;
        }
        if let Some(v) = get("FLEET_STOP_COMMAND") {
            s.stop_command = v;
        }
        if let Some(v) = get("FLEET_WAIT_DELAYS_MS") {
            let ms = v
                .split(',')
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .map(|p| parse_num::<u64>(p, "FLEET_WAIT_DELAYS_MS"))
                .collect::<Result<Vec<_>>>()?;
            s.wait_delays = delays_from_millis(&ms);
        }
        Ok(s)
    }
}

fn parse_num<T: std::str::FromStr>(raw: &str, key: &str) -> Result<T> {
    raw.parse::<T>()
        .map_err(|_| FleetError::config(format!("{} must be a number, got '{}'", key, raw)))
}

/// Substitutes `{placeholder}` tokens in a command template.
pub fn render_command(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (k, v) in vars {
        out = out.replace(&format!("{{{}}}", k), v);
    }
    out
}
