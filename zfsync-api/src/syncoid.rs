//! Syncoid invocation planning and output parsing
//!
//! The command shape is a wire-compatibility point: it must stay
//! byte-identical across versions because it is executed verbatim on the
//! remote hosts. Syncoid addressing:
//!
//! - `syncoid source dest`                      (local -> local)
//! - `syncoid source user@host:dest`            (local -> remote, push)
//! - `syncoid user@host:source dest`            (remote -> local, pull)
//! - `syncoid user@host:source user@host:dest`  (remote -> remote)

use crate::ssh::{SshEndpoint, SshExecutor};
use crate::zfs::parent_dataset;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::info;
use zfsync_common::Result;

/// One side of a replication
#[derive(Debug, Clone)]
pub struct SyncSide {
    /// None when the dataset is local to the executor host
    pub host: Option<String>,
    pub dataset: String,
    pub user: String,
    pub port: u16,
    pub key_path: String,
}

impl SyncSide {
    pub fn local(dataset: impl Into<String>) -> Self {
        Self {
            host: None,
            dataset: dataset.into(),
            user: "root".to_string(),
            port: 22,
            key_path: "/root/.ssh/id_rsa".to_string(),
        }
    }

    pub fn remote(endpoint: &SshEndpoint, dataset: impl Into<String>) -> Self {
        Self {
            host: Some(endpoint.hostname.clone()),
            dataset: dataset.into(),
            user: endpoint.username.clone(),
            port: endpoint.port,
            key_path: endpoint.key_path.clone(),
        }
    }
}

/// Replication options carried by a job
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub recursive: bool,
    pub compress: String,
    pub mbuffer_size: String,
    pub no_sync_snap: bool,
    pub force_delete: bool,
    pub extra_args: String,
}

/// Structured outcome of one syncoid run
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub success: bool,
    pub output: String,
    pub error: String,
    pub duration: i64,
    pub transferred: Option<String>,
    pub command: String,
}

/// Build the syncoid command line. Pure: identical inputs produce
/// identical output.
pub fn build_syncoid_command(source: &SyncSide, dest: &SyncSide, options: &SyncOptions) -> String {
    let mut cmd_parts = vec!["syncoid".to_string()];

    if options.recursive {
        cmd_parts.push("--recursive".to_string());
    }

    if !options.compress.is_empty() && options.compress != "none" {
        cmd_parts.push(format!("--compress={}", options.compress));
    }

    if !options.mbuffer_size.is_empty() {
        cmd_parts.push(format!("--mbuffer-size={}", options.mbuffer_size));
    }

    if options.no_sync_snap {
        cmd_parts.push("--no-sync-snap".to_string());
    }

    if options.force_delete {
        cmd_parts.push("--force-delete".to_string());
    }

    // SSH options come from whichever side is remote; destination wins
    // when both are.
    if dest.host.is_some() {
        cmd_parts.push(format!("--sshkey={}", dest.key_path));
        if dest.port != 22 {
            cmd_parts.push(format!("--sshport={}", dest.port));
        }
    } else if source.host.is_some() {
        cmd_parts.push(format!("--sshkey={}", source.key_path));
        if source.port != 22 {
            cmd_parts.push(format!("--sshport={}", source.port));
        }
    }

    if !options.extra_args.is_empty() {
        cmd_parts.push(options.extra_args.clone());
    }

    cmd_parts.push(match &source.host {
        Some(host) => format!("{}@{}:{}", source.user, host, source.dataset),
        None => source.dataset.clone(),
    });

    cmd_parts.push(match &dest.host {
        Some(host) => format!("{}@{}:{}", dest.user, host, dest.dataset),
        None => dest.dataset.clone(),
    });

    cmd_parts.join(" ")
}

/// Extract the transferred volume from syncoid output.
///
/// The output format varies across syncoid versions; a missing marker
/// yields None without failing the run.
pub fn parse_transferred(output: &str) -> Option<String> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"(?i)(\d+(?:\.\d+)?[KMGT]i?B?)\s+transferred",
            r"(?i)sent\s+(\d+(?:\.\d+)?[KMGT]i?B?)",
            r"(?i)(\d+(?:\.\d+)?[KMGT]i?B?)\s+total",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid transfer pattern"))
        .collect()
    });

    for pattern in patterns {
        if let Some(captures) = pattern.captures(output) {
            return Some(captures[1].to_string());
        }
    }

    None
}

/// Syncoid replication driver
pub struct SyncoidService {
    executor: Arc<SshExecutor>,
}

impl SyncoidService {
    pub fn new(executor: Arc<SshExecutor>) -> Self {
        Self { executor }
    }

    /// Run one replication from the executor host, measuring wall time.
    pub async fn run_sync(
        &self,
        executor_endpoint: &SshEndpoint,
        source: &SyncSide,
        dest: &SyncSide,
        options: &SyncOptions,
        timeout: Duration,
    ) -> SyncOutcome {
        let command = build_syncoid_command(source, dest, options);

        info!("Running syncoid on {}: {}", executor_endpoint.hostname, command);

        let start = std::time::Instant::now();
        let result = self.executor.run(executor_endpoint, &command, timeout).await;
        let duration = start.elapsed().as_secs() as i64;

        let transferred = parse_transferred(&format!("{}{}", result.stdout, result.stderr));

        SyncOutcome {
            success: result.success,
            output: result.stdout,
            error: result.stderr,
            duration,
            transferred,
            command,
        }
    }

    /// Best-effort creation of the destination's parent dataset before
    /// replication. Syncoid can usually create the leaf itself.
    pub async fn ensure_parent_dataset(
        &self,
        endpoint: &SshEndpoint,
        dataset: &str,
    ) -> Result<Option<String>> {
        let Some(parent) = parent_dataset(dataset) else {
            return Ok(None);
        };

        let check = self
            .executor
            .run(
                endpoint,
                &format!("zfs list -H -o name {} 2>/dev/null", parent),
                Duration::from_secs(60),
            )
            .await;

        if check.success && check.stdout.contains(parent) {
            return Ok(None);
        }

        let create = self
            .executor
            .run(endpoint, &format!("zfs create -p {}", parent), Duration::from_secs(60))
            .await;

        if create.success {
            Ok(Some(format!("Created parent dataset {}", parent)))
        } else {
            Ok(Some(format!(
                "Could not create parent dataset {}: {}",
                parent,
                create.stderr.trim()
            )))
        }
    }

    /// Newest snapshot name present on both sides, if any.
    pub async fn last_common_snapshot(
        &self,
        source_endpoint: &SshEndpoint,
        source_dataset: &str,
        dest_endpoint: &SshEndpoint,
        dest_dataset: &str,
    ) -> Option<String> {
        let list_cmd = |ds: &str| format!("zfs list -H -t snapshot -o name -s creation {}", ds);

        let source_result = self
            .executor
            .run(source_endpoint, &list_cmd(source_dataset), Duration::from_secs(120))
            .await;
        if !source_result.success {
            return None;
        }

        let source_snaps: HashSet<&str> = source_result
            .stdout
            .lines()
            .filter_map(|line| line.split('@').nth(1))
            .collect();

        let dest_result = self
            .executor
            .run(dest_endpoint, &list_cmd(dest_dataset), Duration::from_secs(120))
            .await;
        if !dest_result.success {
            return None;
        }

        dest_result
            .stdout
            .lines()
            .filter_map(|line| line.split('@').nth(1))
            .filter(|name| source_snaps.contains(name))
            .last()
            .map(|s| s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(host: &str) -> SshEndpoint {
        SshEndpoint {
            hostname: host.to_string(),
            port: 22,
            username: "root".to_string(),
            key_path: "/root/.ssh/id_rsa".to_string(),
            parallel: false,
        }
    }

    fn default_options() -> SyncOptions {
        SyncOptions {
            recursive: false,
            compress: "lz4".to_string(),
            mbuffer_size: "128M".to_string(),
            no_sync_snap: false,
            force_delete: false,
            extra_args: String::new(),
        }
    }

    #[test]
    fn test_push_command_shape() {
        let source = SyncSide::local("rpool/data/vm-100-disk-0");
        let dest = SyncSide::remote(&endpoint("192.168.1.101"), "rpool/replica/vm-100-disk-0");

        let cmd = build_syncoid_command(&source, &dest, &default_options());
        assert_eq!(
            cmd,
            "syncoid --compress=lz4 --mbuffer-size=128M --sshkey=/root/.ssh/id_rsa \
             rpool/data/vm-100-disk-0 root@192.168.1.101:rpool/replica/vm-100-disk-0"
        );
    }

    #[test]
    fn test_pull_command_shape() {
        let source = SyncSide::remote(&endpoint("192.168.1.100"), "rpool/data");
        let dest = SyncSide::local("rpool/backup");

        let cmd = build_syncoid_command(&source, &dest, &default_options());
        assert_eq!(
            cmd,
            "syncoid --compress=lz4 --mbuffer-size=128M --sshkey=/root/.ssh/id_rsa \
             root@192.168.1.100:rpool/data rpool/backup"
        );
    }

    #[test]
    fn test_local_to_local() {
        let cmd = build_syncoid_command(
            &SyncSide::local("rpool/a"),
            &SyncSide::local("rpool/b"),
            &SyncOptions {
                compress: "none".to_string(),
                mbuffer_size: String::new(),
                ..Default::default()
            },
        );
        assert_eq!(cmd, "syncoid rpool/a rpool/b");
    }

    #[test]
    fn test_all_options() {
        let mut dest_ep = endpoint("10.0.0.2");
        dest_ep.port = 2222;
        dest_ep.key_path = "/etc/zfsync/keys/pve2".to_string();

        let options = SyncOptions {
            recursive: true,
            compress: "zstd-fast".to_string(),
            mbuffer_size: "256M".to_string(),
            no_sync_snap: true,
            force_delete: true,
            extra_args: "--identifier=nightly".to_string(),
        };

        let cmd = build_syncoid_command(
            &SyncSide::local("tank/vm"),
            &SyncSide::remote(&dest_ep, "tank/replica/vm"),
            &options,
        );

        assert_eq!(
            cmd,
            "syncoid --recursive --compress=zstd-fast --mbuffer-size=256M --no-sync-snap \
             --force-delete --sshkey=/etc/zfsync/keys/pve2 --sshport=2222 \
             --identifier=nightly tank/vm root@10.0.0.2:tank/replica/vm"
        );
    }

    #[test]
    fn test_dest_wins_when_both_remote() {
        let mut source_ep = endpoint("10.0.0.1");
        source_ep.key_path = "/keys/src".to_string();
        let mut dest_ep = endpoint("10.0.0.2");
        dest_ep.key_path = "/keys/dst".to_string();

        let cmd = build_syncoid_command(
            &SyncSide::remote(&source_ep, "tank/a"),
            &SyncSide::remote(&dest_ep, "tank/b"),
            &default_options(),
        );

        assert!(cmd.contains("--sshkey=/keys/dst"));
        assert!(!cmd.contains("--sshkey=/keys/src"));
    }

    #[test]
    fn test_command_is_pure() {
        let source = SyncSide::local("rpool/data");
        let dest = SyncSide::remote(&endpoint("h"), "rpool/replica");
        let options = default_options();

        let a = build_syncoid_command(&source, &dest, &options);
        let b = build_syncoid_command(&source, &dest, &options);
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_transferred_variants() {
        assert_eq!(
            parse_transferred("INFO: Sending incremental ...\n1.5GiB transferred in 42s"),
            Some("1.5GiB".to_string())
        );
        assert_eq!(
            parse_transferred("total size is 2.3G  speedup is 1.00\nsent 512MiB bytes"),
            Some("512MiB".to_string())
        );
        assert_eq!(
            parse_transferred("4.2T total estimated size"),
            Some("4.2T".to_string())
        );
        // Case-insensitive
        assert_eq!(
            parse_transferred("128K TRANSFERRED"),
            Some("128K".to_string())
        );
    }

    #[test]
    fn test_parse_transferred_none() {
        assert_eq!(parse_transferred(""), None);
        assert_eq!(parse_transferred("cannot receive: destination busy"), None);
    }

    #[test]
    fn test_parse_transferred_first_match_wins() {
        let output = "700MiB transferred\nsent 1.2GiB";
        assert_eq!(parse_transferred(output), Some("700MiB".to_string()));
    }
}
