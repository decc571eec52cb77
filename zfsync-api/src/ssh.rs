//! Remote command execution over SSH
//!
//! Commands run through OpenSSH connection multiplexing: each endpoint gets
//! a control socket keyed by `user@host:port`, so repeat commands skip the
//! handshake entirely while the master is alive. A dead master is simply
//! rebuilt by the next invocation (`ControlMaster=auto`). Commands to the
//! same host are serialized through a per-key lock unless the endpoint opts
//! into parallel sessions; that lock is the backpressure protecting remote
//! hosts.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};
use zfsync_common::{Error, Node, Result};

/// Default timeout for a single remote command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// One side of a connection: where to run and how to authenticate
#[derive(Debug, Clone)]
pub struct SshEndpoint {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub key_path: String,
    /// Allow concurrent commands to this host
    pub parallel: bool,
}

impl SshEndpoint {
    pub fn key(&self) -> String {
        format!("{}@{}:{}", self.username, self.hostname, self.port)
    }
}

impl From<&Node> for SshEndpoint {
    fn from(node: &Node) -> Self {
        Self {
            hostname: node.hostname.clone(),
            port: node.ssh_port,
            username: node.ssh_user.clone(),
            key_path: node.ssh_key_path.clone(),
            parallel: node.parallel_commands,
        }
    }
}

/// Result of a remote command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
}

impl CommandOutput {
    fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: -1,
            success: false,
        }
    }
}

struct Channel {
    control_path: PathBuf,
    lock: Mutex<()>,
}

/// Pooled SSH command executor
pub struct SshExecutor {
    control_dir: PathBuf,
    control_persist_secs: u32,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

impl SshExecutor {
    pub fn new(control_dir: PathBuf, control_persist_secs: u32) -> Self {
        Self {
            control_dir,
            control_persist_secs,
            channels: RwLock::new(HashMap::new()),
        }
    }

    async fn channel(&self, endpoint: &SshEndpoint) -> Arc<Channel> {
        let key = endpoint.key();

        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(&key) {
                return Arc::clone(channel);
            }
        }

        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let control_path = self.control_dir.join(format!("cm-{:016x}.sock", hasher.finish()));

        let channel = Arc::new(Channel {
            control_path,
            lock: Mutex::new(()),
        });

        let mut channels = self.channels.write().await;
        Arc::clone(channels.entry(key).or_insert(channel))
    }

    /// Drop the pooled channel for an endpoint so the next command starts a
    /// fresh master connection.
    pub async fn invalidate(&self, endpoint: &SshEndpoint) {
        let mut channels = self.channels.write().await;
        channels.remove(&endpoint.key());
    }

    fn ssh_command(&self, endpoint: &SshEndpoint, control_path: &PathBuf, cmd: &str) -> Command {
        let mut ssh = Command::new("ssh");
        ssh.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg("ConnectTimeout=10")
            .arg("-o")
            .arg("ControlMaster=auto")
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg("-o")
            .arg(format!("ControlPersist={}", self.control_persist_secs))
            .arg("-i")
            .arg(&endpoint.key_path)
            .arg("-p")
            .arg(endpoint.port.to_string())
            .arg(format!("{}@{}", endpoint.username, endpoint.hostname))
            .arg("--")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        ssh
    }

    /// Execute a command on a remote host.
    ///
    /// The timeout bounds the command, not the channel; on expiry the
    /// command is killed and the result carries `exit_code = -1`. Never
    /// retries on its own.
    pub async fn run(
        &self,
        endpoint: &SshEndpoint,
        cmd: &str,
        timeout: Duration,
    ) -> CommandOutput {
        if let Err(e) = tokio::fs::create_dir_all(&self.control_dir).await {
            return CommandOutput::failed(format!(
                "Failed to create control directory {:?}: {}",
                self.control_dir, e
            ));
        }

        let channel = self.channel(endpoint).await;

        // One command in flight per host unless tagged for parallel sessions
        let _guard = if endpoint.parallel {
            None
        } else {
            Some(channel.lock.lock().await)
        };

        debug!("ssh {} $ {}", endpoint.key(), cmd);

        let mut command = self.ssh_command(endpoint, &channel.control_path, cmd);
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn ssh for {}: {}", endpoint.key(), e);
                return CommandOutput::failed(format!("Failed to spawn ssh: {}", e));
            }
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let exit_code = output.status.code().unwrap_or(-1);
                CommandOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    exit_code,
                    success: exit_code == 0,
                }
            }
            Ok(Err(e)) => {
                error!("ssh to {} failed: {}", endpoint.key(), e);
                CommandOutput::failed(format!("ssh execution failed: {}", e))
            }
            Err(_) => {
                warn!(
                    "Command on {} timed out after {}s",
                    endpoint.key(),
                    timeout.as_secs()
                );
                CommandOutput::failed(format!(
                    "command timed out after {}s",
                    timeout.as_secs()
                ))
            }
        }
    }

    /// Execute a command and map a non-zero exit into an error.
    pub async fn run_checked(
        &self,
        endpoint: &SshEndpoint,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let output = self.run(endpoint, cmd, timeout).await;
        if output.success {
            Ok(output)
        } else if output.exit_code == -1 && output.stderr.contains("timed out") {
            Err(Error::RemoteTimeout(timeout.as_secs()))
        } else if output.stderr.contains("Permission denied")
            || output.stderr.contains("Host key verification failed")
        {
            Err(Error::RemoteAuth(endpoint.key()))
        } else {
            Err(Error::RemoteExec {
                exit: output.exit_code,
                stderr: output.stderr,
            })
        }
    }

    /// 10-second connectivity probe used by "test connection".
    pub async fn test_connection(&self, endpoint: &SshEndpoint) -> (bool, String) {
        let output = self
            .run(endpoint, "echo 'OK' && hostname", Duration::from_secs(10))
            .await;

        if output.success {
            (true, output.stdout.trim().to_string())
        } else {
            (false, output.stderr.trim().to_string())
        }
    }

    /// Probe presence and version of the replication tool.
    pub async fn check_syncoid(&self, endpoint: &SshEndpoint) -> (bool, Option<String>) {
        let output = self
            .run(
                endpoint,
                "which syncoid && syncoid --version 2>/dev/null || echo 'not found'",
                DEFAULT_COMMAND_TIMEOUT,
            )
            .await;

        if output.success && !output.stdout.contains("not found") {
            let lines: Vec<&str> = output.stdout.trim().lines().collect();
            let version = if lines.len() > 1 {
                lines.last().map(|s| s.to_string())
            } else {
                Some("unknown".to_string())
            };
            (true, version)
        } else {
            (false, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_endpoint() -> SshEndpoint {
        SshEndpoint {
            hostname: "192.168.1.100".to_string(),
            port: 22,
            username: "root".to_string(),
            key_path: "/root/.ssh/id_rsa".to_string(),
            parallel: false,
        }
    }

    #[test]
    fn test_endpoint_key() {
        assert_eq!(test_endpoint().key(), "root@192.168.1.100:22");

        let mut ep = test_endpoint();
        ep.port = 2222;
        assert_eq!(ep.key(), "root@192.168.1.100:2222");
    }

    #[tokio::test]
    async fn test_channel_reuse() {
        let executor = SshExecutor::new(PathBuf::from("/tmp/zfsync-test-cm"), 60);
        let endpoint = test_endpoint();

        let a = executor.channel(&endpoint).await;
        let b = executor.channel(&endpoint).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.control_path, b.control_path);

        executor.invalidate(&endpoint).await;
        let c = executor.channel(&endpoint).await;
        assert!(!Arc::ptr_eq(&a, &c));
        // Same key hashes to the same control path either way
        assert_eq!(a.control_path, c.control_path);
    }

    #[tokio::test]
    async fn test_distinct_endpoints_distinct_channels() {
        let executor = SshExecutor::new(PathBuf::from("/tmp/zfsync-test-cm"), 60);
        let a = executor.channel(&test_endpoint()).await;

        let mut other = test_endpoint();
        other.hostname = "192.168.1.101".to_string();
        let b = executor.channel(&other).await;

        assert_ne!(a.control_path, b.control_path);
    }

    #[test]
    fn test_failed_output_shape() {
        let output = CommandOutput::failed("command timed out after 10s");
        assert!(!output.success);
        assert_eq!(output.exit_code, -1);
        assert!(output.stdout.is_empty());
    }
}
