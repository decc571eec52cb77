//! Sanoid snapshot-policy management on remote nodes
//!
//! Generates `/etc/sanoid/sanoid.conf` from the stored per-dataset
//! retention policies and drives manual sanoid runs.

use crate::ssh::{SshEndpoint, SshExecutor, DEFAULT_COMMAND_TIMEOUT};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use zfsync_common::{Dataset, Result};

const SANOID_CONF_PATH: &str = "/etc/sanoid/sanoid.conf";

/// Builtin retention template
#[derive(Debug, Clone, Serialize)]
pub struct SanoidTemplate {
    pub name: &'static str,
    pub hourly: i64,
    pub daily: i64,
    pub weekly: i64,
    pub monthly: i64,
    pub yearly: i64,
    pub autosnap: bool,
    pub autoprune: bool,
}

pub const DEFAULT_TEMPLATES: &[SanoidTemplate] = &[
    SanoidTemplate { name: "production", hourly: 48, daily: 90, weekly: 12, monthly: 24, yearly: 5, autosnap: true, autoprune: true },
    SanoidTemplate { name: "default", hourly: 24, daily: 30, weekly: 4, monthly: 12, yearly: 0, autosnap: true, autoprune: true },
    SanoidTemplate { name: "minimal", hourly: 12, daily: 7, weekly: 0, monthly: 0, yearly: 0, autosnap: true, autoprune: true },
    SanoidTemplate { name: "backup", hourly: 0, daily: 30, weekly: 8, monthly: 12, yearly: 2, autosnap: true, autoprune: true },
    SanoidTemplate { name: "vm", hourly: 24, daily: 14, weekly: 4, monthly: 6, yearly: 0, autosnap: true, autoprune: true },
];

fn is_builtin_template(name: &str) -> bool {
    DEFAULT_TEMPLATES.iter().any(|t| t.name == name)
}

/// Install and timer state reported by a node
#[derive(Debug, Clone, Serialize)]
pub struct SanoidStatus {
    pub installed: bool,
    pub version: Option<String>,
    pub timer_active: bool,
    pub last_run: Option<String>,
    pub next_run: Option<String>,
}

fn parse_timer_value(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value == "n/a" {
        None
    } else {
        Some(value.to_string())
    }
}

/// Sanoid management on remote nodes
pub struct SanoidManager {
    executor: Arc<SshExecutor>,
}

impl SanoidManager {
    pub fn new(executor: Arc<SshExecutor>) -> Self {
        Self { executor }
    }

    /// Read the current sanoid configuration from a node.
    pub async fn get_config(&self, endpoint: &SshEndpoint) -> Result<String> {
        let output = self
            .executor
            .run_checked(
                endpoint,
                &format!("cat {} 2>/dev/null || echo ''", SANOID_CONF_PATH),
                DEFAULT_COMMAND_TIMEOUT,
            )
            .await?;

        Ok(output.stdout)
    }

    /// Write a sanoid configuration, keeping a backup of the previous one.
    pub async fn set_config(&self, endpoint: &SshEndpoint, config_content: &str) -> Result<()> {
        let cmd = format!(
            "mkdir -p /etc/sanoid\ncp {path} {path}.bak 2>/dev/null || true\ncat > {path} << 'SANOID_EOF'\n{config}\nSANOID_EOF\necho \"Configuration saved\"",
            path = SANOID_CONF_PATH,
            config = config_content.trim_end_matches('\n'),
        );

        self.executor
            .run_checked(endpoint, &cmd, DEFAULT_COMMAND_TIMEOUT)
            .await?;

        info!("Sanoid configuration written to {}", endpoint.hostname);
        Ok(())
    }

    /// Install and timer state of sanoid on a node.
    pub async fn get_status(&self, endpoint: &SshEndpoint) -> SanoidStatus {
        let mut status = SanoidStatus {
            installed: false,
            version: None,
            timer_active: false,
            last_run: None,
            next_run: None,
        };

        let result = self
            .executor
            .run(endpoint, "sanoid --version 2>&1", DEFAULT_COMMAND_TIMEOUT)
            .await;

        if result.success {
            status.installed = true;
            status.version = Some(result.stdout.trim().to_string());
        }

        let result = self
            .executor
            .run(
                endpoint,
                "systemctl is-active sanoid.timer 2>/dev/null && systemctl show sanoid.timer --property=LastTriggerUSec,NextElapseUSecRealtime --value",
                DEFAULT_COMMAND_TIMEOUT,
            )
            .await;

        if result.success && result.stdout.contains("active") {
            status.timer_active = true;
            let lines: Vec<&str> = result.stdout.trim().lines().collect();
            if lines.len() >= 3 {
                status.last_run = parse_timer_value(lines[1]);
                status.next_run = parse_timer_value(lines[2]);
            }
        }

        status
    }

    /// Run sanoid manually.
    pub async fn run_sanoid(
        &self,
        endpoint: &SshEndpoint,
        cron: bool,
        prune: bool,
    ) -> Result<String> {
        let mut flags = Vec::new();
        if cron {
            flags.push("--cron");
        }
        if prune {
            flags.push("--prune-snapshots");
        }

        let cmd = format!("sanoid {}", flags.join(" "));
        let output = self
            .executor
            .run_checked(endpoint, &cmd, Duration::from_secs(600))
            .await?;

        Ok(output.stdout)
    }
}

/// Generate `sanoid.conf` content for the datasets with snapshotting
/// enabled, prefixed by the builtin template definitions.
pub fn generate_config(datasets: &[Dataset]) -> String {
    let mut lines = vec![
        "# Sanoid configuration".to_string(),
        "# Managed by zfsync".to_string(),
        "# Do not edit manually".to_string(),
        String::new(),
        "# Templates".to_string(),
    ];

    for tpl in DEFAULT_TEMPLATES {
        lines.push(format!("[template_{}]", tpl.name));
        lines.push(format!("  hourly = {}", tpl.hourly));
        lines.push(format!("  daily = {}", tpl.daily));
        lines.push(format!("  weekly = {}", tpl.weekly));
        lines.push(format!("  monthly = {}", tpl.monthly));
        lines.push(format!("  yearly = {}", tpl.yearly));
        lines.push(format!("  autosnap = {}", if tpl.autosnap { "yes" } else { "no" }));
        lines.push(format!("  autoprune = {}", if tpl.autoprune { "yes" } else { "no" }));
        lines.push(String::new());
    }

    lines.push("# Datasets".to_string());
    lines.push(String::new());

    for ds in datasets {
        if !ds.sanoid_enabled {
            continue;
        }

        lines.push(format!("[{}]", ds.name));

        match ds.sanoid_template.as_deref() {
            Some(template) if is_builtin_template(template) => {
                lines.push(format!("  use_template = {}", template));
            }
            _ => {
                lines.push(format!("  hourly = {}", ds.hourly));
                lines.push(format!("  daily = {}", ds.daily));
                lines.push(format!("  weekly = {}", ds.weekly));
                lines.push(format!("  monthly = {}", ds.monthly));
                lines.push(format!("  yearly = {}", ds.yearly));
            }
        }

        lines.push(format!("  autosnap = {}", if ds.autosnap { "yes" } else { "no" }));
        lines.push(format!("  autoprune = {}", if ds.autoprune { "yes" } else { "no" }));
        lines.push(String::new());
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn dataset(name: &str, enabled: bool, template: Option<&str>) -> Dataset {
        Dataset {
            id: 1,
            node_id: 1,
            name: name.to_string(),
            used: None,
            available: None,
            mountpoint: None,
            snapshot_count: 0,
            sanoid_enabled: enabled,
            sanoid_template: template.map(|s| s.to_string()),
            hourly: 6,
            daily: 10,
            weekly: 2,
            monthly: 1,
            yearly: 0,
            autosnap: true,
            autoprune: false,
            refreshed_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_generate_config_with_template() {
        let config = generate_config(&[dataset("rpool/data", true, Some("production"))]);

        assert!(config.contains("[template_production]"));
        assert!(config.contains("[rpool/data]"));
        assert!(config.contains("  use_template = production"));
        assert!(config.contains("  autoprune = no"));
    }

    #[test]
    fn test_generate_config_custom_policy() {
        let config = generate_config(&[dataset("rpool/data", true, None)]);

        assert!(config.contains("[rpool/data]"));
        assert!(config.contains("  hourly = 6"));
        assert!(config.contains("  daily = 10"));
        assert!(!config.contains("use_template"));
    }

    #[test]
    fn test_generate_config_unknown_template_falls_back() {
        let config = generate_config(&[dataset("rpool/data", true, Some("bespoke"))]);
        assert!(!config.contains("use_template = bespoke"));
        assert!(config.contains("  hourly = 6"));
    }

    #[test]
    fn test_generate_config_skips_disabled() {
        let config = generate_config(&[dataset("rpool/data", false, None)]);
        assert!(!config.contains("[rpool/data]"));
    }

    #[test]
    fn test_parse_timer_value() {
        assert_eq!(parse_timer_value("n/a"), None);
        assert_eq!(parse_timer_value("  "), None);
        assert_eq!(
            parse_timer_value("Fri 2026-08-01 02:00:00 UTC"),
            Some("Fri 2026-08-01 02:00:00 UTC".to_string())
        );
    }
}
