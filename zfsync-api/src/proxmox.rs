//! Proxmox guest operations over SSH
//!
//! The only component that mutates hypervisor state. Guest configs are
//! native Proxmox files; every line we do not recognize is preserved
//! verbatim, and storage-tag rewriting is a literal `"src:" -> "dst:"`
//! replacement.

use crate::ssh::{SshEndpoint, SshExecutor, DEFAULT_COMMAND_TIMEOUT};
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use zfsync_common::{Error, GuestKind, Result};

/// A guest found on a node
#[derive(Debug, Clone, Serialize)]
pub struct Guest {
    pub vmid: u32,
    pub name: String,
    pub status: String,
    pub kind: GuestKind,
}

/// One disk of a guest, resolved down to its ZFS dataset
#[derive(Debug, Clone, Serialize)]
pub struct GuestDisk {
    pub disk_name: String,
    pub storage: String,
    pub volume: String,
    pub dataset: Option<String>,
    pub size: String,
    pub size_bytes: u64,
}

/// Proxmox guest management on remote nodes
pub struct ProxmoxManager {
    executor: Arc<SshExecutor>,
}

impl ProxmoxManager {
    pub fn new(executor: Arc<SshExecutor>) -> Self {
        Self { executor }
    }

    /// Enumerate all guests on a node, full VMs and containers combined.
    pub async fn list_guests(&self, endpoint: &SshEndpoint) -> Result<Vec<Guest>> {
        let mut guests = self.list_qemu(endpoint).await?;
        guests.extend(self.list_lxc(endpoint).await?);
        Ok(guests)
    }

    async fn list_qemu(&self, endpoint: &SshEndpoint) -> Result<Vec<Guest>> {
        let output = self
            .executor
            .run(endpoint, "qm list 2>/dev/null | tail -n +2", DEFAULT_COMMAND_TIMEOUT)
            .await;

        let mut guests = Vec::new();
        if output.success {
            for line in output.stdout.trim().lines() {
                // Format: VMID NAME STATUS MEM BOOTDISK PID
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() >= 3 {
                    if let Ok(vmid) = parts[0].parse() {
                        guests.push(Guest {
                            vmid,
                            name: parts[1].to_string(),
                            status: parts[2].to_string(),
                            kind: GuestKind::Qemu,
                        });
                    }
                }
            }
        }
        Ok(guests)
    }

    async fn list_lxc(&self, endpoint: &SshEndpoint) -> Result<Vec<Guest>> {
        let output = self
            .executor
            .run(endpoint, "pct list 2>/dev/null | tail -n +2", DEFAULT_COMMAND_TIMEOUT)
            .await;

        let mut guests = Vec::new();
        if output.success {
            for line in output.stdout.trim().lines() {
                // Format: VMID STATUS LOCK NAME
                let parts: Vec<&str> = line.split_whitespace().collect();
                if parts.len() >= 2 {
                    if let Ok(vmid) = parts[0].parse::<u32>() {
                        guests.push(Guest {
                            vmid,
                            name: parts
                                .get(3)
                                .map(|s| s.to_string())
                                .unwrap_or_else(|| format!("CT{}", vmid)),
                            status: parts[1].to_string(),
                            kind: GuestKind::Lxc,
                        });
                    }
                }
            }
        }
        Ok(guests)
    }

    /// Read the raw guest config file.
    pub async fn guest_config_file(
        &self,
        endpoint: &SshEndpoint,
        vmid: u32,
        kind: GuestKind,
    ) -> Result<String> {
        let output = self
            .executor
            .run_checked(
                endpoint,
                &format!("cat {}", kind.config_path(vmid)),
                DEFAULT_COMMAND_TIMEOUT,
            )
            .await
            .map_err(|_| Error::NotFound(format!("Config for guest {}", vmid)))?;

        Ok(output.stdout)
    }

    /// Parse the guest's disk lines and resolve each to its ZFS dataset
    /// and size in bytes.
    pub async fn guest_disks(
        &self,
        endpoint: &SshEndpoint,
        vmid: u32,
        kind: GuestKind,
    ) -> Result<Vec<GuestDisk>> {
        let config = self.guest_config_file(endpoint, vmid, kind).await?;

        let pattern = Regex::new(kind.disk_pattern())
            .map_err(|e| Error::Internal(format!("Invalid disk pattern: {}", e)))?;

        let mut disks = Vec::new();
        for captures in pattern.captures_iter(&config) {
            let disk_name = captures[1].to_string();
            let storage = captures[2].to_string();
            let volume = captures[3].to_string();

            // Skip media and cloud-init pseudo-disks
            let lower = volume.to_lowercase();
            if lower.contains("cloudinit") || lower.contains("none") {
                continue;
            }

            let mut disk = GuestDisk {
                disk_name,
                storage: storage.clone(),
                volume: volume.clone(),
                dataset: None,
                size: "N/A".to_string(),
                size_bytes: 0,
            };

            if let Some(dataset) = self.resolve_dataset(endpoint, &storage, &volume).await {
                let size_bytes = self.dataset_size_bytes(endpoint, &dataset).await;
                if size_bytes > 0 {
                    disk.size = format_size(size_bytes);
                    disk.size_bytes = size_bytes;
                }
                disk.dataset = Some(dataset);
            }

            disks.push(disk);
        }

        Ok(disks)
    }

    /// Map `storage:volume` to an on-disk ZFS dataset via the hypervisor's
    /// path-resolution CLI.
    async fn resolve_dataset(
        &self,
        endpoint: &SshEndpoint,
        storage: &str,
        volume: &str,
    ) -> Option<String> {
        let cmd = format!("pvesm path {}:{} 2>/dev/null", storage, volume);
        let output = self.executor.run(endpoint, &cmd, DEFAULT_COMMAND_TIMEOUT).await;

        if !output.success {
            return None;
        }

        let path = output.stdout.trim();
        if path.is_empty() {
            return None;
        }

        // zvols resolve to /dev/zvol/<dataset>, container subvolumes to a
        // mounted path equal to /<dataset>
        if let Some(dataset) = path.strip_prefix("/dev/zvol/") {
            Some(dataset.to_string())
        } else if path.starts_with('/') {
            Some(path.trim_start_matches('/').to_string())
        } else {
            None
        }
    }

    async fn dataset_size_bytes(&self, endpoint: &SshEndpoint, dataset: &str) -> u64 {
        let cmd = format!(
            "zfs get -Hp -o value used,volsize,referenced {} 2>/dev/null | head -1",
            dataset
        );
        let output = self.executor.run(endpoint, &cmd, DEFAULT_COMMAND_TIMEOUT).await;

        if output.success {
            output
                .stdout
                .trim()
                .split_whitespace()
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0)
        } else {
            0
        }
    }

    /// Ensure a ZFS-backed storage tag exists on a node. Idempotent.
    pub async fn ensure_zfs_storage(
        &self,
        endpoint: &SshEndpoint,
        storage_name: &str,
        zfs_pool: &str,
    ) -> Result<()> {
        let check_cmd = format!("pvesm status -storage {} 2>/dev/null", storage_name);
        let output = self.executor.run(endpoint, &check_cmd, DEFAULT_COMMAND_TIMEOUT).await;

        if output.success && output.stdout.contains(storage_name) {
            return Ok(());
        }

        let create_cmd = format!(
            "pvesm add zfspool {} --pool {} --content images,rootdir --sparse 1",
            storage_name, zfs_pool
        );
        let output = self.executor.run(endpoint, &create_cmd, DEFAULT_COMMAND_TIMEOUT).await;

        if output.success || output.stderr.contains("already exists") {
            info!("Storage {} available on {}", storage_name, endpoint.hostname);
            Ok(())
        } else {
            Err(Error::RemoteExec {
                exit: output.exit_code,
                stderr: output.stderr,
            })
        }
    }

    /// Register a replicated guest on a destination node.
    ///
    /// Refuses when the vmid is already present; optionally ensures the
    /// destination storage tag and rewrites storage references before
    /// writing the config file. Verified by a status query afterwards.
    pub async fn register_guest(
        &self,
        endpoint: &SshEndpoint,
        vmid: u32,
        kind: GuestKind,
        config_content: &str,
        source_storage: Option<&str>,
        dest_storage: Option<&str>,
        dest_zfs_pool: Option<&str>,
    ) -> Result<String> {
        let config_path = kind.config_path(vmid);

        // The vmid must be free on the destination
        let check_cmd = format!("qm status {} 2>/dev/null || pct status {} 2>/dev/null", vmid, vmid);
        let output = self.executor.run(endpoint, &check_cmd, DEFAULT_COMMAND_TIMEOUT).await;
        if output.success
            && (output.stdout.contains("status:")
                || output.stdout.contains("running")
                || output.stdout.contains("stopped"))
        {
            return Err(Error::Conflict(format!(
                "VMID {} already in use on {}",
                vmid, endpoint.hostname
            )));
        }

        if let (Some(storage), Some(pool)) = (dest_storage, dest_zfs_pool) {
            self.ensure_zfs_storage(endpoint, storage, pool).await?;
        }

        let config = match (source_storage, dest_storage) {
            (Some(src), Some(dst)) if src != dst => substitute_storage(config_content, src, dst),
            _ => config_content.to_string(),
        };

        let cmd = format!(
            "mkdir -p $(dirname {path})\ncat > {path} << 'VMCONF_EOF'\n{config}\nVMCONF_EOF\necho \"Configuration created\"",
            path = config_path,
            config = config.trim_end_matches('\n'),
        );
        self.executor
            .run_checked(endpoint, &cmd, DEFAULT_COMMAND_TIMEOUT)
            .await?;

        // Verify registration
        let verify_cmd = format!("{} status {}", kind.cli(), vmid);
        let output = self.executor.run(endpoint, &verify_cmd, DEFAULT_COMMAND_TIMEOUT).await;

        if output.success {
            info!("Guest {} registered on {}", vmid, endpoint.hostname);
            Ok(format!("VM {} registered successfully", vmid))
        } else {
            warn!("Guest {} registration verification failed: {}", vmid, output.stderr);
            Err(Error::RemoteExec {
                exit: output.exit_code,
                stderr: output.stderr,
            })
        }
    }

    /// Remove a guest's registration, keeping its data.
    pub async fn unregister_guest(
        &self,
        endpoint: &SshEndpoint,
        vmid: u32,
        kind: GuestKind,
    ) -> Result<String> {
        let output = self
            .executor
            .run(endpoint, &format!("{} status {}", kind.cli(), vmid), DEFAULT_COMMAND_TIMEOUT)
            .await;

        if output.stdout.contains("running") {
            return Err(Error::Invariant(
                "Guest must be stopped before unregistering".to_string(),
            ));
        }

        self.executor
            .run_checked(
                endpoint,
                &format!("rm -f {}", kind.config_path(vmid)),
                DEFAULT_COMMAND_TIMEOUT,
            )
            .await?;

        Ok(format!("VM {} unregistered (data kept)", vmid))
    }

    /// Next free guest id on the cluster, with a list-based fallback.
    pub async fn next_free_vmid(&self, endpoint: &SshEndpoint) -> Result<u32> {
        let output = self
            .executor
            .run(endpoint, "pvesh get /cluster/nextid", DEFAULT_COMMAND_TIMEOUT)
            .await;

        if output.success {
            if let Ok(vmid) = output.stdout.trim().parse() {
                return Ok(vmid);
            }
        }

        let output = self
            .executor
            .run(
                endpoint,
                "(qm list 2>/dev/null; pct list 2>/dev/null) | awk '{print $1}' | sort -n | tail -1",
                DEFAULT_COMMAND_TIMEOUT,
            )
            .await;

        if output.success {
            if let Ok(vmid) = output.stdout.trim().parse::<u32>() {
                return Ok(vmid + 1);
            }
        }

        Ok(100)
    }
}

/// Literal storage-tag substitution in a guest config: every `"src:"`
/// becomes `"dst:"`, all other text untouched.
pub fn substitute_storage(config: &str, source_storage: &str, dest_storage: &str) -> String {
    config.replace(
        &format!("{}:", source_storage),
        &format!("{}:", dest_storage),
    )
}

fn format_size(size_bytes: u64) -> String {
    let mut size = size_bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return format!("{:.1} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.1} PB", size)
}

#[cfg(test)]
mod tests {
    use super::*;

    const QEMU_CONFIG: &str = "\
boot: order=scsi0
cores: 4
memory: 8192
name: web01
net0: virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0
scsi0: local-zfs:vm-100-disk-0,size=32G
scsi1: local-zfs:vm-100-disk-1,discard=on,size=64G
ide2: local:iso/none,media=cdrom
smbios1: uuid=8a1f
";

    const LXC_CONFIG: &str = "\
arch: amd64
cores: 2
hostname: ct01
memory: 2048
rootfs: local-zfs:subvol-200-disk-0,size=8G
mp0: local-zfs:subvol-200-disk-1,mp=/mnt/data,size=16G
";

    #[test]
    fn test_qemu_disk_pattern() {
        let re = Regex::new(GuestKind::Qemu.disk_pattern()).unwrap();
        let disks: Vec<(String, String, String)> = re
            .captures_iter(QEMU_CONFIG)
            .map(|c| (c[1].to_string(), c[2].to_string(), c[3].to_string()))
            .collect();

        assert_eq!(disks.len(), 3);
        assert_eq!(disks[0], ("scsi0".into(), "local-zfs".into(), "vm-100-disk-0".into()));
        assert_eq!(disks[1], ("scsi1".into(), "local-zfs".into(), "vm-100-disk-1".into()));
        // ide2 matches but its volume is filtered out by the caller
        assert_eq!(disks[2].0, "ide2");
    }

    #[test]
    fn test_lxc_disk_pattern() {
        let re = Regex::new(GuestKind::Lxc.disk_pattern()).unwrap();
        let disks: Vec<(String, String, String)> = re
            .captures_iter(LXC_CONFIG)
            .map(|c| (c[1].to_string(), c[2].to_string(), c[3].to_string()))
            .collect();

        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0], ("rootfs".into(), "local-zfs".into(), "subvol-200-disk-0".into()));
        assert_eq!(disks[1], ("mp0".into(), "local-zfs".into(), "subvol-200-disk-1".into()));
    }

    #[test]
    fn test_substitute_storage() {
        let rewritten = substitute_storage(QEMU_CONFIG, "local-zfs", "replica-zfs");

        assert!(rewritten.contains("scsi0: replica-zfs:vm-100-disk-0,size=32G"));
        assert!(rewritten.contains("scsi1: replica-zfs:vm-100-disk-1,discard=on,size=64G"));
        // Unrelated lines preserved verbatim
        assert!(rewritten.contains("net0: virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0"));
        assert!(rewritten.contains("boot: order=scsi0"));
        assert!(rewritten.contains("smbios1: uuid=8a1f"));
        // The `local:` storage is a different tag and stays untouched
        assert!(rewritten.contains("ide2: local:iso/none,media=cdrom"));
    }

    #[test]
    fn test_substitute_storage_noop_when_absent() {
        let rewritten = substitute_storage(LXC_CONFIG, "other-zfs", "replica-zfs");
        assert_eq!(rewritten, LXC_CONFIG);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512.0 B");
        assert_eq!(format_size(34359738368), "32.0 GB");
    }
}
