//! Common types shared between the zfsync service and its consumers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Guest flavor managed by the hypervisor.
///
/// The two variants differ only in the CLI binary, the config file location
/// and the shape of their disk lines; everything else in the registration
/// path is shared.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    Qemu,
    Lxc,
}

impl GuestKind {
    /// Proxmox CLI used to manage guests of this kind.
    pub fn cli(&self) -> &'static str {
        match self {
            GuestKind::Qemu => "qm",
            GuestKind::Lxc => "pct",
        }
    }

    /// Path of the guest config file under the cluster config root.
    pub fn config_path(&self, vmid: u32) -> String {
        match self {
            GuestKind::Qemu => format!("/etc/pve/qemu-server/{}.conf", vmid),
            GuestKind::Lxc => format!("/etc/pve/lxc/{}.conf", vmid),
        }
    }

    /// Regex source matching one disk line of a guest config.
    ///
    /// Captures: (disk name, storage tag, volume name).
    pub fn disk_pattern(&self) -> &'static str {
        match self {
            GuestKind::Qemu => r"(?m)^((?:scsi|sata|virtio|ide)\d+):\s*([^:,\s]+):([^,\s]+)",
            GuestKind::Lxc => r"(?m)^((?:rootfs|mp)\d*):\s*([^:,\s]+):([^,\s]+)",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GuestKind::Qemu => "qemu",
            GuestKind::Lxc => "lxc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "qemu" => Some(GuestKind::Qemu),
            "lxc" => Some(GuestKind::Lxc),
            _ => None,
        }
    }
}

impl std::fmt::Display for GuestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A managed Proxmox node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub name: String,
    pub hostname: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_key_path: String,
    pub api_endpoint: Option<String>,
    pub is_auth_node: bool,
    pub parallel_commands: bool,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub syncoid_installed: bool,
    pub syncoid_version: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A ZFS dataset cached from a node, with its snapshot retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: i64,
    pub node_id: i64,
    pub name: String,
    pub used: Option<String>,
    pub available: Option<String>,
    pub mountpoint: Option<String>,
    pub snapshot_count: i64,
    pub sanoid_enabled: bool,
    pub sanoid_template: Option<String>,
    pub hourly: i64,
    pub daily: i64,
    pub weekly: i64,
    pub monthly: i64,
    pub yearly: i64,
    pub autosnap: bool,
    pub autoprune: bool,
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// Last recorded outcome of a sync job run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(JobStatus::Running),
            "success" => Some(JobStatus::Success),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// A replication job between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: i64,
    pub name: String,
    pub source_node_id: i64,
    pub source_dataset: String,
    pub dest_node_id: i64,
    pub dest_dataset: String,

    pub recursive: bool,
    pub compress: String,
    pub mbuffer_size: String,
    pub no_sync_snap: bool,
    pub force_delete: bool,
    pub extra_args: String,

    pub schedule: String,
    pub is_active: bool,

    pub retry_on_failure: bool,
    pub max_retries: i64,
    pub retry_delay_minutes: i64,

    pub register_vm: bool,
    pub vm_id: Option<u32>,
    pub dest_vm_id: Option<u32>,
    pub vm_type: Option<GuestKind>,
    pub vm_group_id: Option<String>,
    pub source_storage: Option<String>,
    pub dest_storage: Option<String>,

    pub last_run: Option<DateTime<Utc>>,
    pub last_status: Option<JobStatus>,
    pub last_duration: Option<i64>,
    pub last_transferred: Option<String>,
    pub run_count: i64,
    pub error_count: i64,
    pub consecutive_failures: i64,

    pub created_at: DateTime<Utc>,
}

/// State of one job-log row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Started,
    Success,
    Failed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Started => "started",
            LogStatus::Success => "success",
            LogStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(LogStatus::Started),
            "success" => Some(LogStatus::Success),
            "failed" => Some(LogStatus::Failed),
            _ => None,
        }
    }
}

/// One attempt of one job, append-only. Rows without a job id record
/// standalone snapshot operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLog {
    pub id: i64,
    pub job_id: Option<i64>,
    pub job_type: String,
    pub node_name: String,
    pub dataset: String,
    pub status: LogStatus,
    pub message: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration: Option<i64>,
    pub transferred: Option<String>,
    pub attempt_number: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub triggered_by: Option<String>,
}

/// Notification channel settings, a singleton row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationSettings {
    pub smtp_enabled: bool,
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
    pub smtp_from: Option<String>,
    pub smtp_to: Option<String>,
    pub smtp_subject_prefix: String,
    pub smtp_tls: bool,

    pub webhook_enabled: bool,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,

    pub telegram_enabled: bool,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,

    pub notify_on_success: bool,
    pub notify_on_failure: bool,
    pub notify_on_warning: bool,
}

/// One typed system configuration entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfigEntry {
    pub key: String,
    pub value: String,
    pub value_type: String,
    pub category: String,
    pub is_secret: bool,
}

/// A control-plane user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub email: Option<String>,
    pub role: String,
    pub realm: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Service error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Authentication failed")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Remote authentication failed for {0}")]
    RemoteAuth(String),

    #[error("Remote command timed out after {0}s")]
    RemoteTimeout(u64),

    #[error("Remote command failed (exit {exit}): {stderr}")]
    RemoteExec { exit: i32, stderr: String },

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_kind_seams() {
        assert_eq!(GuestKind::Qemu.cli(), "qm");
        assert_eq!(GuestKind::Lxc.cli(), "pct");
        assert_eq!(
            GuestKind::Qemu.config_path(100),
            "/etc/pve/qemu-server/100.conf"
        );
        assert_eq!(GuestKind::Lxc.config_path(200), "/etc/pve/lxc/200.conf");
    }

    #[test]
    fn test_guest_kind_roundtrip() {
        for kind in [GuestKind::Qemu, GuestKind::Lxc] {
            assert_eq!(GuestKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(GuestKind::parse("openvz"), None);
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [JobStatus::Running, JobStatus::Success, JobStatus::Failed] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        for status in [LogStatus::Started, LogStatus::Success, LogStatus::Failed] {
            assert_eq!(LogStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_job_serialization() {
        let job = SyncJob {
            id: 1,
            name: "vm-100".to_string(),
            source_node_id: 1,
            source_dataset: "rpool/data/vm-100-disk-0".to_string(),
            dest_node_id: 2,
            dest_dataset: "rpool/replica/vm-100-disk-0".to_string(),
            recursive: false,
            compress: "lz4".to_string(),
            mbuffer_size: "128M".to_string(),
            no_sync_snap: false,
            force_delete: false,
            extra_args: String::new(),
            schedule: "*/5 * * * *".to_string(),
            is_active: true,
            retry_on_failure: false,
            max_retries: 3,
            retry_delay_minutes: 15,
            register_vm: false,
            vm_id: Some(100),
            dest_vm_id: None,
            vm_type: Some(GuestKind::Qemu),
            vm_group_id: None,
            source_storage: None,
            dest_storage: None,
            last_run: None,
            last_status: None,
            last_duration: None,
            last_transferred: None,
            run_count: 0,
            error_count: 0,
            consecutive_failures: 0,
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&job).unwrap();
        let back: SyncJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, job.name);
        assert_eq!(back.vm_type, Some(GuestKind::Qemu));
    }

    #[test]
    fn test_user_password_hash_not_serialized() {
        let user = User {
            id: "u1".to_string(),
            username: "admin".to_string(),
            password_hash: "$argon2id$secret".to_string(),
            email: None,
            role: "admin".to_string(),
            realm: "local".to_string(),
            enabled: true,
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("argon2id"));
    }
}
