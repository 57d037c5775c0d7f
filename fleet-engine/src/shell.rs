use async_trait::async_trait;
use fleet_common::{Auth, CloudInstance, FleetError, LoginCredentials, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::logger::tail_str;

/// Where and as whom to open a remote shell.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub credentials: LoginCredentials,
    pub connect_timeout: Duration,
}

impl SshTarget {
    pub fn for_instance(
        instance: &CloudInstance,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let host = instance.primary_address().ok_or_else(|| {
            FleetError::transport(&instance.id, "instance has no reachable address")
        })?;
        Ok(Self {
            host: host.to_string(),
            port,
            credentials: instance.credentials.clone(),
            connect_timeout,
        })
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.credentials.user, self.host)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Authenticated command execution and file transfer to one host.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    fn host(&self) -> &str;

    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    async fn upload(&self, data: &[u8], remote_path: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// `exec`, with a non-zero exit turned into a `Transport` error.
    async fn exec_checked(&self, command: &str) -> Result<CommandOutput> {
        let out = self.exec(command).await?;
        if !out.success() {
            return Err(FleetError::transport(
                self.host(),
                format!(
                    "command exited with {}: {}",
                    out.status,
                    tail_str(out.stderr.trim(), 2000)
                ),
            ));
        }
        Ok(out)
    }
}

#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteShell>>;
}

/// Single-quotes a word for POSIX sh.
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

/// `ssh` base invocation shared by shells and tunnels.
pub(crate) fn ssh_command(target: &SshTarget) -> Command {
    let mut cmd = match &target.credentials.auth {
        Auth::Password { password } => {
            let mut c = Command::new("sshpass");
            c.arg("-e").arg("ssh").env("SSHPASS", password);
            c
        }
        Auth::KeyPair { private_key_path } => {
            let mut c = Command::new("ssh");
            c.arg("-i").arg(private_key_path);
            c
        }
    };
    cmd.arg("-p")
        .arg(target.port.to_string())
        .arg("-o")
        .arg("StrictHostKeyChecking=no")
        .arg("-o")
        .arg("UserKnownHostsFile=/dev/null")
        .arg("-o")
        .arg(format!("ConnectTimeout={}", target.connect_timeout.as_secs().max(1)))
        .arg("-o")
        .arg("LogLevel=ERROR");
    cmd
}

/// Connects with the system OpenSSH client, one ControlMaster per connection.
pub struct OpenSshConnector {
    control_dir: PathBuf,
}

impl Default for OpenSshConnector {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl OpenSshConnector {
    pub fn new(control_dir: impl Into<PathBuf>) -> Self {
        Self {
            control_dir: control_dir.into(),
        }
    }
}

#[async_trait]
impl ShellConnector for OpenSshConnector {
    async fn connect(&self, target: &SshTarget) -> Result<Box<dyn RemoteShell>> {
        // Keep the socket path short: unix sockets are limited to ~100 bytes.
        let id = Uuid::new_v4().simple().to_string();
        let socket = self.control_dir.join(format!("fleet-{}.sock", &id[..12]));

        let output = ssh_command(target)
            .arg("-M")
            .arg("-S")
            .arg(&socket)
            .arg("-o")
            .arg("ControlPersist=yes")
            .arg("-fN")
            .arg(target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| FleetError::transport(&target.host, format!("ssh spawn failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FleetError::transport(
                &target.host,
                format!("connect failed ({}): {}", output.status, tail_str(stderr.trim(), 2000)),
            ));
        }
        debug!(host = %target.host, socket = %socket.display(), "ssh master connected");
        Ok(Box::new(OpenSshShell {
            target: target.clone(),
            socket,
        }))
    }
}

pub struct OpenSshShell {
    target: SshTarget,
    socket: PathBuf,
}

impl OpenSshShell {
    fn command(&self) -> Command {
        let mut cmd = ssh_command(&self.target);
        cmd.arg("-S").arg(&self.socket).arg(self.target.destination());
        cmd
    }
}

#[async_trait]
impl RemoteShell for OpenSshShell {
    fn host(&self) -> &str {
        &self.target.host
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        debug!(host = %self.target.host, command = %command, "ssh exec");
        let output = self
            .command()
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| FleetError::transport(&self.target.host, format!("ssh exec failed: {}", e)))?;

        // ssh itself reports 255 for connection-level failures.
        let status = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if status == 255 {
            return Err(FleetError::transport(
                &self.target.host,
                format!("ssh connection failed: {}", tail_str(stderr.trim(), 2000)),
            ));
        }
        Ok(CommandOutput {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }

    async fn upload(&self, data: &[u8], remote_path: &str) -> Result<()> {
        let mut child = self
            .command()
            .arg(format!("cat > {}", sh_quote(remote_path)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FleetError::transport(&self.target.host, format!("ssh spawn failed: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(data).await.map_err(|e| {
                FleetError::transport(&self.target.host, format!("upload to {} failed: {}", remote_path, e))
            })?;
            // Dropping stdin sends EOF so the remote `cat` exits.
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| FleetError::transport(&self.target.host, format!("ssh wait failed: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FleetError::transport(
                &self.target.host,
                format!("upload to {} failed: {}", remote_path, tail_str(stderr.trim(), 2000)),
            ));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let output = ssh_command(&self.target)
            .arg("-S")
            .arg(&self.socket)
            .arg("-O")
            .arg("exit")
            .arg(self.target.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| FleetError::transport(&self.target.host, format!("ssh spawn failed: {}", e)))?;
        if !output.status.success() {
            warn!(host = %self.target.host, "ssh master did not exit cleanly");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_common::InstanceState;

    #[test]
    fn quoting() {
        assert_eq!(sh_quote("plain"), "'plain'");
        assert_eq!(sh_quote("it's"), "'it'\"'\"'s'");
        assert_eq!(sh_quote("a b;rm -rf /"), "'a b;rm -rf /'");
    }

    #[test]
    fn target_uses_primary_address() {
        let inst = CloudInstance {
            id: "i-1".to_string(),
            state: InstanceState::Running,
            public_addresses: vec![],
            private_addresses: vec!["10.0.0.9".to_string()],
            credentials: LoginCredentials::key_pair("ubuntu", "/k"),
            zone: None,
            instance_type: "x".to_string(),
            created_at: Utc::now(),
        };
        let t = SshTarget::for_instance(&inst, 22, Duration::from_secs(5)).unwrap();
        assert_eq!(t.destination(), "ubuntu@10.0.0.9");

        let bare = CloudInstance {
            private_addresses: vec![],
            ..inst
        };
        assert!(matches!(
            SshTarget::for_instance(&bare, 22, Duration::from_secs(5)),
            Err(FleetError::Transport { .. })
        ));
    }
}
