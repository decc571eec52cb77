//! Typed wrappers around the remote `zfs` CLI
//!
//! All listings are parsed from `-H` tab-separated output.

use crate::ssh::{SshEndpoint, SshExecutor, DEFAULT_COMMAND_TIMEOUT};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use zfsync_common::{Error, Result};

/// One row of `zfs list`
#[derive(Debug, Clone, Serialize)]
pub struct ZfsDataset {
    pub name: String,
    pub used: String,
    pub available: String,
    pub mountpoint: Option<String>,
}

/// One row of `zfs list -t snapshot`
#[derive(Debug, Clone, Serialize)]
pub struct ZfsSnapshot {
    pub full_name: String,
    pub dataset: String,
    pub snapshot: String,
    pub used: String,
    pub creation: String,
}

/// ZFS operations on a remote node
pub struct ZfsManager {
    executor: Arc<SshExecutor>,
}

impl ZfsManager {
    pub fn new(executor: Arc<SshExecutor>) -> Self {
        Self { executor }
    }

    /// List filesystems and volumes with usage figures.
    pub async fn list_datasets(&self, endpoint: &SshEndpoint) -> Result<Vec<ZfsDataset>> {
        let output = self
            .executor
            .run_checked(
                endpoint,
                "zfs list -H -o name,used,avail,mountpoint -t filesystem,volume",
                DEFAULT_COMMAND_TIMEOUT,
            )
            .await?;

        Ok(parse_dataset_listing(&output.stdout))
    }

    /// List snapshots, oldest first, optionally restricted to one dataset.
    pub async fn list_snapshots(
        &self,
        endpoint: &SshEndpoint,
        dataset: Option<&str>,
    ) -> Result<Vec<ZfsSnapshot>> {
        let mut cmd = "zfs list -H -t snapshot -o name,used,creation -s creation".to_string();
        if let Some(ds) = dataset {
            cmd.push_str(&format!(" -r {}", ds));
        }

        let output = self
            .executor
            .run_checked(endpoint, &cmd, DEFAULT_COMMAND_TIMEOUT)
            .await?;

        Ok(parse_snapshot_listing(&output.stdout))
    }

    /// Create a snapshot, optionally recursive over child datasets.
    pub async fn create_snapshot(
        &self,
        endpoint: &SshEndpoint,
        dataset: &str,
        snapshot_name: &str,
        recursive: bool,
    ) -> Result<()> {
        let r_flag = if recursive { "-r " } else { "" };
        let cmd = format!("zfs snapshot {}{}@{}", r_flag, dataset, snapshot_name);

        self.executor
            .run_checked(endpoint, &cmd, DEFAULT_COMMAND_TIMEOUT)
            .await?;

        info!("Created snapshot {}@{} on {}", dataset, snapshot_name, endpoint.hostname);
        Ok(())
    }

    /// Destroy a snapshot by its full `dataset@name`.
    pub async fn destroy_snapshot(&self, endpoint: &SshEndpoint, full_name: &str) -> Result<()> {
        if !full_name.contains('@') {
            return Err(Error::BadRequest(format!(
                "'{}' is not a snapshot name",
                full_name
            )));
        }

        let cmd = format!("zfs destroy {}", full_name);
        self.executor
            .run_checked(endpoint, &cmd, DEFAULT_COMMAND_TIMEOUT)
            .await?;

        info!("Destroyed snapshot {} on {}", full_name, endpoint.hostname);
        Ok(())
    }

    pub async fn dataset_exists(&self, endpoint: &SshEndpoint, dataset: &str) -> bool {
        let cmd = format!("zfs list -H -o name {} 2>/dev/null", dataset);
        let output = self.executor.run(endpoint, &cmd, DEFAULT_COMMAND_TIMEOUT).await;
        output.success && output.stdout.contains(dataset)
    }

    /// Create a dataset; with `parents` missing ancestors are created too.
    pub async fn create_dataset(
        &self,
        endpoint: &SshEndpoint,
        dataset: &str,
        parents: bool,
    ) -> Result<()> {
        let flags = if parents { "-p " } else { "" };
        let cmd = format!("zfs create {}{}", flags, dataset);

        self.executor
            .run_checked(endpoint, &cmd, DEFAULT_COMMAND_TIMEOUT)
            .await?;

        Ok(())
    }
}

fn parse_dataset_listing(stdout: &str) -> Vec<ZfsDataset> {
    let mut datasets = Vec::new();
    for line in stdout.trim().lines() {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() >= 4 {
            datasets.push(ZfsDataset {
                name: parts[0].to_string(),
                used: parts[1].to_string(),
                available: parts[2].to_string(),
                mountpoint: if parts[3] == "-" {
                    None
                } else {
                    Some(parts[3].to_string())
                },
            });
        }
    }
    datasets
}

fn parse_snapshot_listing(stdout: &str) -> Vec<ZfsSnapshot> {
    let mut snapshots = Vec::new();
    for line in stdout.trim().lines() {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() >= 3 {
            let name_parts: Vec<&str> = parts[0].splitn(2, '@').collect();
            snapshots.push(ZfsSnapshot {
                full_name: parts[0].to_string(),
                dataset: name_parts.first().unwrap_or(&"").to_string(),
                snapshot: name_parts.get(1).unwrap_or(&"").to_string(),
                used: parts[1].to_string(),
                creation: parts[2].to_string(),
            });
        }
    }
    snapshots
}

/// Parent of a dataset path, if it has one.
pub fn parent_dataset(dataset: &str) -> Option<&str> {
    dataset.rsplit_once('/').map(|(parent, _)| parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dataset_listing() {
        let stdout = "rpool\t50G\t100G\t/rpool\n\
                      rpool/data\t10G\t100G\t/rpool/data\n\
                      rpool/data/vm-100-disk-0\t8G\t100G\t-\n";

        let datasets = parse_dataset_listing(stdout);
        assert_eq!(datasets.len(), 3);
        assert_eq!(datasets[0].name, "rpool");
        assert_eq!(datasets[1].mountpoint.as_deref(), Some("/rpool/data"));
        assert!(datasets[2].mountpoint.is_none());
    }

    #[test]
    fn test_parse_dataset_listing_skips_malformed() {
        let datasets = parse_dataset_listing("garbage line without tabs\n\n");
        assert!(datasets.is_empty());
    }

    #[test]
    fn test_parse_snapshot_listing() {
        let stdout = "rpool/data@autosnap_2026-07-31_daily\t1M\tThu Jul 31 0:00 2026\n\
                      rpool/data@syncoid_pve1_2026-08-01\t0B\tFri Aug  1 2:00 2026\n";

        let snapshots = parse_snapshot_listing(stdout);
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].dataset, "rpool/data");
        assert_eq!(snapshots[0].snapshot, "autosnap_2026-07-31_daily");
        assert_eq!(snapshots[1].full_name, "rpool/data@syncoid_pve1_2026-08-01");
    }

    #[test]
    fn test_parent_dataset() {
        assert_eq!(parent_dataset("rpool/replica/vm-100-disk-0"), Some("rpool/replica"));
        assert_eq!(parent_dataset("rpool/data"), Some("rpool"));
        assert_eq!(parent_dataset("rpool"), None);
    }
}
