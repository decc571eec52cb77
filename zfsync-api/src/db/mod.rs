//! Database layer using SQLite
//!
//! Persistent storage for nodes, datasets, sync jobs, job logs, users,
//! notification and system configuration. Multi-row updates that cross
//! entities (job completion, auth-node selection, stale-run recovery) are
//! transactional.

pub mod migrations;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use zfsync_common::{Error, Result};

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        // Create parent directory if needed
        if let Some(path) = database_url
            .strip_prefix("sqlite://")
            .map(|p| p.split('?').next().unwrap_or(p))
        {
            if let Some(parent) = Path::new(path).parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::Database(format!("Failed to create DB directory: {}", e)))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| Error::Database(format!("Database connection failed: {}", e)))?;

        tracing::info!("Database connection established");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        migrations::run_migrations(&self.pool).await?;
        system::seed_defaults(&self.pool).await?;
        tracing::info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("Database connection closed");
    }

    /// Health check - verify database connectivity
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Database health check failed: {}", e)))?;
        Ok(())
    }
}

fn map_write_err(e: sqlx::Error, what: &str) -> Error {
    if let Some(db_err) = e.as_database_error() {
        if db_err.is_unique_violation() {
            return Error::Conflict(format!("{} already exists", what));
        }
        // Lock contention is retryable by the caller
        if db_err.message().contains("database is locked") {
            return Error::Transient(format!("Store busy while writing {}", what));
        }
    }
    Error::Database(format!("Failed to write {}: {}", what, e))
}

/// Node database operations
pub mod nodes {
    use super::*;
    use serde::Deserialize;
    use zfsync_common::Node;

    /// Editable node attributes, also the API create/update payload
    #[derive(Debug, Clone, Deserialize)]
    pub struct NodeDraft {
        pub name: String,
        pub hostname: String,
        #[serde(default = "default_ssh_port")]
        pub ssh_port: u16,
        #[serde(default = "default_ssh_user")]
        pub ssh_user: String,
        #[serde(default = "default_ssh_key_path")]
        pub ssh_key_path: String,
        #[serde(default)]
        pub api_endpoint: Option<String>,
        #[serde(default)]
        pub is_auth_node: bool,
        #[serde(default)]
        pub parallel_commands: bool,
    }

    fn default_ssh_port() -> u16 {
        22
    }

    fn default_ssh_user() -> String {
        "root".to_string()
    }

    fn default_ssh_key_path() -> String {
        "/root/.ssh/id_rsa".to_string()
    }

    pub async fn create(pool: &SqlitePool, draft: &NodeDraft) -> Result<Node> {
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        // At most one auth node at any instant
        if draft.is_auth_node {
            sqlx::query("UPDATE nodes SET is_auth_node = 0")
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Database(format!("Failed to clear auth node: {}", e)))?;
        }

        let result = sqlx::query(
            "INSERT INTO nodes (name, hostname, ssh_port, ssh_user, ssh_key_path,
             api_endpoint, is_auth_node, parallel_commands, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&draft.name)
        .bind(&draft.hostname)
        .bind(draft.ssh_port as i64)
        .bind(&draft.ssh_user)
        .bind(&draft.ssh_key_path)
        .bind(&draft.api_endpoint)
        .bind(draft.is_auth_node)
        .bind(draft.parallel_commands)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_write_err(e, &format!("Node '{}'", draft.name)))?;

        let id = result.last_insert_rowid();

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit: {}", e)))?;

        get(pool, id).await
    }

    pub async fn get(pool: &SqlitePool, id: i64) -> Result<Node> {
        let row = sqlx::query("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get node: {}", e)))?
            .ok_or_else(|| Error::NotFound(format!("Node {}", id)))?;

        Ok(row_to_node(&row))
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<Node>> {
        let rows = sqlx::query("SELECT * FROM nodes ORDER BY name")
            .fetch_all(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to list nodes: {}", e)))?;

        Ok(rows.iter().map(row_to_node).collect())
    }

    pub async fn update(pool: &SqlitePool, id: i64, draft: &NodeDraft) -> Result<Node> {
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        if draft.is_auth_node {
            sqlx::query("UPDATE nodes SET is_auth_node = 0 WHERE id != ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Database(format!("Failed to clear auth node: {}", e)))?;
        }

        let result = sqlx::query(
            "UPDATE nodes SET name = ?, hostname = ?, ssh_port = ?, ssh_user = ?,
             ssh_key_path = ?, api_endpoint = ?, is_auth_node = ?, parallel_commands = ?
             WHERE id = ?",
        )
        .bind(&draft.name)
        .bind(&draft.hostname)
        .bind(draft.ssh_port as i64)
        .bind(&draft.ssh_user)
        .bind(&draft.ssh_key_path)
        .bind(&draft.api_endpoint)
        .bind(draft.is_auth_node)
        .bind(draft.parallel_commands)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_write_err(e, &format!("Node '{}'", draft.name)))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Node {}", id)));
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit: {}", e)))?;

        get(pool, id).await
    }

    /// Delete a node. Fails loud while any sync job still references it.
    pub async fn delete(pool: &SqlitePool, id: i64) -> Result<()> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM sync_jobs
             WHERE source_node_id = ? OR dest_node_id = ?",
        )
        .bind(id)
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to check node references: {}", e)))?;

        let count: i64 = row.get("count");
        if count > 0 {
            return Err(Error::Invariant(format!(
                "Node {} is referenced by {} sync job(s); delete those jobs first",
                id, count
            )));
        }

        let result = sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to delete node: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Node {}", id)));
        }

        Ok(())
    }

    /// The node designated for API credential validation, if any.
    pub async fn get_auth_node(pool: &SqlitePool) -> Result<Option<Node>> {
        let row = sqlx::query("SELECT * FROM nodes WHERE is_auth_node = 1")
            .fetch_optional(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get auth node: {}", e)))?;

        Ok(row.as_ref().map(row_to_node))
    }

    /// Record the outcome of a connectivity / tool probe.
    pub async fn update_probe_state(
        pool: &SqlitePool,
        id: i64,
        online: bool,
        syncoid_installed: bool,
        syncoid_version: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE nodes SET online = ?, last_seen = ?, syncoid_installed = ?,
             syncoid_version = ? WHERE id = ?",
        )
        .bind(online)
        .bind(Utc::now())
        .bind(syncoid_installed)
        .bind(syncoid_version)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to update probe state: {}", e)))?;

        Ok(())
    }

    fn row_to_node(row: &SqliteRow) -> Node {
        Node {
            id: row.get("id"),
            name: row.get("name"),
            hostname: row.get("hostname"),
            ssh_port: row.get::<i64, _>("ssh_port") as u16,
            ssh_user: row.get("ssh_user"),
            ssh_key_path: row.get("ssh_key_path"),
            api_endpoint: row.get("api_endpoint"),
            is_auth_node: row.get("is_auth_node"),
            parallel_commands: row.get("parallel_commands"),
            online: row.get("online"),
            last_seen: row.get("last_seen"),
            syncoid_installed: row.get("syncoid_installed"),
            syncoid_version: row.get("syncoid_version"),
            created_at: row.get("created_at"),
        }
    }
}

/// Dataset cache and retention-policy operations
pub mod datasets {
    use super::*;
    use zfsync_common::Dataset;

    /// One row from `zfs list` used to refresh the cache.
    #[derive(Debug, Clone)]
    pub struct DatasetRow {
        pub name: String,
        pub used: Option<String>,
        pub available: Option<String>,
        pub mountpoint: Option<String>,
    }

    /// Upsert the cached view of a node's datasets, preserving any
    /// retention policy already stored. Datasets that disappeared from
    /// the node are removed.
    pub async fn refresh_for_node(
        pool: &SqlitePool,
        node_id: i64,
        listing: &[DatasetRow],
    ) -> Result<()> {
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        for ds in listing {
            sqlx::query(
                "INSERT INTO datasets (node_id, name, used, available, mountpoint, refreshed_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(node_id, name) DO UPDATE SET
                     used = excluded.used,
                     available = excluded.available,
                     mountpoint = excluded.mountpoint,
                     refreshed_at = excluded.refreshed_at",
            )
            .bind(node_id)
            .bind(&ds.name)
            .bind(&ds.used)
            .bind(&ds.available)
            .bind(&ds.mountpoint)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_write_err(e, &format!("Dataset '{}'", ds.name)))?;
        }

        // Drop rows for datasets no longer present on the node
        let names: Vec<&str> = listing.iter().map(|d| d.name.as_str()).collect();
        let placeholders = vec!["?"; names.len()].join(",");
        let sql = if names.is_empty() {
            "DELETE FROM datasets WHERE node_id = ?".to_string()
        } else {
            format!(
                "DELETE FROM datasets WHERE node_id = ? AND name NOT IN ({})",
                placeholders
            )
        };
        let mut query = sqlx::query(&sql).bind(node_id);
        for name in &names {
            query = query.bind(*name);
        }
        query
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("Failed to prune datasets: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit: {}", e)))?;

        Ok(())
    }

    pub async fn list_for_node(pool: &SqlitePool, node_id: i64) -> Result<Vec<Dataset>> {
        let rows = sqlx::query("SELECT * FROM datasets WHERE node_id = ? ORDER BY name")
            .bind(node_id)
            .fetch_all(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to list datasets: {}", e)))?;

        Ok(rows.iter().map(row_to_dataset).collect())
    }

    pub async fn get(pool: &SqlitePool, id: i64) -> Result<Dataset> {
        let row = sqlx::query("SELECT * FROM datasets WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get dataset: {}", e)))?
            .ok_or_else(|| Error::NotFound(format!("Dataset {}", id)))?;

        Ok(row_to_dataset(&row))
    }

    /// Snapshot retention policy fields
    #[derive(Debug, Clone, serde::Deserialize)]
    pub struct PolicyUpdate {
        pub sanoid_enabled: bool,
        pub sanoid_template: Option<String>,
        pub hourly: i64,
        pub daily: i64,
        pub weekly: i64,
        pub monthly: i64,
        pub yearly: i64,
        pub autosnap: bool,
        pub autoprune: bool,
    }

    pub async fn update_policy(pool: &SqlitePool, id: i64, policy: &PolicyUpdate) -> Result<Dataset> {
        let result = sqlx::query(
            "UPDATE datasets SET sanoid_enabled = ?, sanoid_template = ?, hourly = ?,
             daily = ?, weekly = ?, monthly = ?, yearly = ?, autosnap = ?, autoprune = ?
             WHERE id = ?",
        )
        .bind(policy.sanoid_enabled)
        .bind(&policy.sanoid_template)
        .bind(policy.hourly)
        .bind(policy.daily)
        .bind(policy.weekly)
        .bind(policy.monthly)
        .bind(policy.yearly)
        .bind(policy.autosnap)
        .bind(policy.autoprune)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to update dataset policy: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Dataset {}", id)));
        }

        get(pool, id).await
    }

    pub async fn update_snapshot_count(pool: &SqlitePool, id: i64, count: i64) -> Result<()> {
        sqlx::query("UPDATE datasets SET snapshot_count = ? WHERE id = ?")
            .bind(count)
            .bind(id)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to update snapshot count: {}", e)))?;

        Ok(())
    }

    fn row_to_dataset(row: &SqliteRow) -> Dataset {
        Dataset {
            id: row.get("id"),
            node_id: row.get("node_id"),
            name: row.get("name"),
            used: row.get("used"),
            available: row.get("available"),
            mountpoint: row.get("mountpoint"),
            snapshot_count: row.get("snapshot_count"),
            sanoid_enabled: row.get("sanoid_enabled"),
            sanoid_template: row.get("sanoid_template"),
            hourly: row.get("hourly"),
            daily: row.get("daily"),
            weekly: row.get("weekly"),
            monthly: row.get("monthly"),
            yearly: row.get("yearly"),
            autosnap: row.get("autosnap"),
            autoprune: row.get("autoprune"),
            refreshed_at: row.get("refreshed_at"),
        }
    }
}

/// Sync job operations
pub mod jobs {
    use super::*;
    use serde::Deserialize;
    use zfsync_common::{GuestKind, JobStatus, SyncJob};

    /// Editable job attributes, also the API create/update payload
    #[derive(Debug, Clone, Deserialize)]
    pub struct JobDraft {
        pub name: String,
        pub source_node_id: i64,
        pub source_dataset: String,
        pub dest_node_id: i64,
        pub dest_dataset: String,
        #[serde(default)]
        pub recursive: bool,
        #[serde(default = "default_compress")]
        pub compress: String,
        #[serde(default = "default_mbuffer")]
        pub mbuffer_size: String,
        #[serde(default)]
        pub no_sync_snap: bool,
        #[serde(default)]
        pub force_delete: bool,
        #[serde(default)]
        pub extra_args: String,
        #[serde(default)]
        pub schedule: String,
        #[serde(default = "default_true")]
        pub is_active: bool,
        #[serde(default)]
        pub retry_on_failure: bool,
        #[serde(default = "default_max_retries")]
        pub max_retries: i64,
        #[serde(default = "default_retry_delay")]
        pub retry_delay_minutes: i64,
        #[serde(default)]
        pub register_vm: bool,
        #[serde(default)]
        pub vm_id: Option<u32>,
        #[serde(default)]
        pub dest_vm_id: Option<u32>,
        #[serde(default)]
        pub vm_type: Option<GuestKind>,
        #[serde(default)]
        pub vm_group_id: Option<String>,
        #[serde(default)]
        pub source_storage: Option<String>,
        #[serde(default)]
        pub dest_storage: Option<String>,
    }

    fn default_compress() -> String {
        "lz4".to_string()
    }

    fn default_mbuffer() -> String {
        "128M".to_string()
    }

    fn default_true() -> bool {
        true
    }

    fn default_max_retries() -> i64 {
        3
    }

    fn default_retry_delay() -> i64 {
        15
    }

    async fn check_nodes_exist(pool: &SqlitePool, draft: &JobDraft) -> Result<()> {
        super::nodes::get(pool, draft.source_node_id).await?;
        super::nodes::get(pool, draft.dest_node_id).await?;
        Ok(())
    }

    pub async fn create(pool: &SqlitePool, draft: &JobDraft) -> Result<SyncJob> {
        check_nodes_exist(pool, draft).await?;

        let result = sqlx::query(
            "INSERT INTO sync_jobs (name, source_node_id, source_dataset, dest_node_id,
             dest_dataset, recursive, compress, mbuffer_size, no_sync_snap, force_delete,
             extra_args, schedule, is_active, retry_on_failure, max_retries,
             retry_delay_minutes, register_vm, vm_id, dest_vm_id, vm_type, vm_group_id,
             source_storage, dest_storage, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&draft.name)
        .bind(draft.source_node_id)
        .bind(&draft.source_dataset)
        .bind(draft.dest_node_id)
        .bind(&draft.dest_dataset)
        .bind(draft.recursive)
        .bind(&draft.compress)
        .bind(&draft.mbuffer_size)
        .bind(draft.no_sync_snap)
        .bind(draft.force_delete)
        .bind(&draft.extra_args)
        .bind(&draft.schedule)
        .bind(draft.is_active)
        .bind(draft.retry_on_failure)
        .bind(draft.max_retries)
        .bind(draft.retry_delay_minutes)
        .bind(draft.register_vm)
        .bind(draft.vm_id.map(|v| v as i64))
        .bind(draft.dest_vm_id.map(|v| v as i64))
        .bind(draft.vm_type.map(|t| t.as_str()))
        .bind(&draft.vm_group_id)
        .bind(&draft.source_storage)
        .bind(&draft.dest_storage)
        .bind(Utc::now())
        .execute(pool)
        .await
        .map_err(|e| map_write_err(e, &format!("Job '{}'", draft.name)))?;

        get(pool, result.last_insert_rowid()).await
    }

    pub async fn get(pool: &SqlitePool, id: i64) -> Result<SyncJob> {
        let row = sqlx::query("SELECT * FROM sync_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get job: {}", e)))?
            .ok_or_else(|| Error::NotFound(format!("Job {}", id)))?;

        Ok(row_to_job(&row))
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<SyncJob>> {
        let rows = sqlx::query("SELECT * FROM sync_jobs ORDER BY name")
            .fetch_all(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to list jobs: {}", e)))?;

        Ok(rows.iter().map(row_to_job).collect())
    }

    /// Scheduler hot path: active jobs carrying a cron expression.
    pub async fn list_scheduled(pool: &SqlitePool) -> Result<Vec<SyncJob>> {
        let rows = sqlx::query("SELECT * FROM sync_jobs WHERE is_active = 1 AND schedule != ''")
            .fetch_all(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to list scheduled jobs: {}", e)))?;

        Ok(rows.iter().map(row_to_job).collect())
    }

    pub async fn list_active(pool: &SqlitePool) -> Result<Vec<SyncJob>> {
        let rows = sqlx::query("SELECT * FROM sync_jobs WHERE is_active = 1 ORDER BY name")
            .fetch_all(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to list active jobs: {}", e)))?;

        Ok(rows.iter().map(row_to_job).collect())
    }

    pub async fn list_group(pool: &SqlitePool, vm_group_id: &str) -> Result<Vec<SyncJob>> {
        let rows = sqlx::query("SELECT * FROM sync_jobs WHERE vm_group_id = ? ORDER BY name")
            .bind(vm_group_id)
            .fetch_all(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to list job group: {}", e)))?;

        Ok(rows.iter().map(row_to_job).collect())
    }

    pub async fn update(pool: &SqlitePool, id: i64, draft: &JobDraft) -> Result<SyncJob> {
        check_nodes_exist(pool, draft).await?;

        let result = sqlx::query(
            "UPDATE sync_jobs SET name = ?, source_node_id = ?, source_dataset = ?,
             dest_node_id = ?, dest_dataset = ?, recursive = ?, compress = ?,
             mbuffer_size = ?, no_sync_snap = ?, force_delete = ?, extra_args = ?,
             schedule = ?, is_active = ?, retry_on_failure = ?, max_retries = ?,
             retry_delay_minutes = ?, register_vm = ?, vm_id = ?, dest_vm_id = ?,
             vm_type = ?, vm_group_id = ?, source_storage = ?, dest_storage = ?
             WHERE id = ?",
        )
        .bind(&draft.name)
        .bind(draft.source_node_id)
        .bind(&draft.source_dataset)
        .bind(draft.dest_node_id)
        .bind(&draft.dest_dataset)
        .bind(draft.recursive)
        .bind(&draft.compress)
        .bind(&draft.mbuffer_size)
        .bind(draft.no_sync_snap)
        .bind(draft.force_delete)
        .bind(&draft.extra_args)
        .bind(&draft.schedule)
        .bind(draft.is_active)
        .bind(draft.retry_on_failure)
        .bind(draft.max_retries)
        .bind(draft.retry_delay_minutes)
        .bind(draft.register_vm)
        .bind(draft.vm_id.map(|v| v as i64))
        .bind(draft.dest_vm_id.map(|v| v as i64))
        .bind(draft.vm_type.map(|t| t.as_str()))
        .bind(&draft.vm_group_id)
        .bind(&draft.source_storage)
        .bind(&draft.dest_storage)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| map_write_err(e, &format!("Job '{}'", draft.name)))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Job {}", id)));
        }

        get(pool, id).await
    }

    pub async fn delete(pool: &SqlitePool, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM sync_jobs WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to delete job: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Job {}", id)));
        }

        Ok(())
    }

    /// Open a run: insert the `started` log row and mark the job running,
    /// atomically. Returns the log row id.
    pub async fn start_run(
        pool: &SqlitePool,
        job: &SyncJob,
        node_label: &str,
        dataset_label: &str,
        job_type: &str,
        attempt: i64,
        triggered_by: Option<&str>,
    ) -> Result<i64> {
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        let result = sqlx::query(
            "INSERT INTO job_logs (job_id, job_type, node_name, dataset, status, message,
             attempt_number, started_at, triggered_by)
             VALUES (?, ?, ?, ?, 'started', ?, ?, ?, ?)",
        )
        .bind(job.id)
        .bind(job_type)
        .bind(node_label)
        .bind(dataset_label)
        .bind("Replication started")
        .bind(attempt)
        .bind(Utc::now())
        .bind(triggered_by)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("Failed to open job log: {}", e)))?;

        let log_id = result.last_insert_rowid();

        sqlx::query("UPDATE sync_jobs SET last_status = 'running' WHERE id = ?")
            .bind(job.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("Failed to mark job running: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit: {}", e)))?;

        Ok(log_id)
    }

    /// Outcome of one run, written atomically to the job and its open log.
    #[derive(Debug, Clone)]
    pub struct RunCompletion {
        pub success: bool,
        pub message: String,
        pub output: Option<String>,
        pub error: Option<String>,
        pub duration: i64,
        pub transferred: Option<String>,
    }

    pub async fn complete_run(
        pool: &SqlitePool,
        job_id: i64,
        log_id: i64,
        completion: &RunCompletion,
    ) -> Result<()> {
        let now = Utc::now();
        let status = if completion.success { "success" } else { "failed" };

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        sqlx::query(
            "UPDATE job_logs SET status = ?, message = ?, output = ?, error = ?,
             duration = ?, transferred = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(&completion.message)
        .bind(&completion.output)
        .bind(&completion.error)
        .bind(completion.duration)
        .bind(&completion.transferred)
        .bind(now)
        .bind(log_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("Failed to close job log: {}", e)))?;

        if completion.success {
            sqlx::query(
                "UPDATE sync_jobs SET last_run = ?, last_status = 'success',
                 last_duration = ?, last_transferred = ?, run_count = run_count + 1,
                 consecutive_failures = 0 WHERE id = ?",
            )
            .bind(now)
            .bind(completion.duration)
            .bind(&completion.transferred)
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("Failed to update job counters: {}", e)))?;
        } else {
            sqlx::query(
                "UPDATE sync_jobs SET last_run = ?, last_status = 'failed',
                 last_duration = ?, last_transferred = ?, run_count = run_count + 1,
                 error_count = error_count + 1,
                 consecutive_failures = consecutive_failures + 1 WHERE id = ?",
            )
            .bind(now)
            .bind(completion.duration)
            .bind(&completion.transferred)
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("Failed to update job counters: {}", e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit: {}", e)))?;

        Ok(())
    }

    /// Current last_status, the executor's self-concurrency gate.
    pub async fn is_running(pool: &SqlitePool, job_id: i64) -> Result<bool> {
        let job = get(pool, job_id).await?;
        Ok(job.last_status == Some(JobStatus::Running))
    }

    fn row_to_job(row: &SqliteRow) -> SyncJob {
        let vm_type: Option<String> = row.get("vm_type");
        let last_status: Option<String> = row.get("last_status");

        SyncJob {
            id: row.get("id"),
            name: row.get("name"),
            source_node_id: row.get("source_node_id"),
            source_dataset: row.get("source_dataset"),
            dest_node_id: row.get("dest_node_id"),
            dest_dataset: row.get("dest_dataset"),
            recursive: row.get("recursive"),
            compress: row.get("compress"),
            mbuffer_size: row.get("mbuffer_size"),
            no_sync_snap: row.get("no_sync_snap"),
            force_delete: row.get("force_delete"),
            extra_args: row.get("extra_args"),
            schedule: row.get("schedule"),
            is_active: row.get("is_active"),
            retry_on_failure: row.get("retry_on_failure"),
            max_retries: row.get("max_retries"),
            retry_delay_minutes: row.get("retry_delay_minutes"),
            register_vm: row.get("register_vm"),
            vm_id: row.get::<Option<i64>, _>("vm_id").map(|v| v as u32),
            dest_vm_id: row.get::<Option<i64>, _>("dest_vm_id").map(|v| v as u32),
            vm_type: vm_type.as_deref().and_then(GuestKind::parse),
            vm_group_id: row.get("vm_group_id"),
            source_storage: row.get("source_storage"),
            dest_storage: row.get("dest_storage"),
            last_run: row.get("last_run"),
            last_status: last_status.as_deref().and_then(JobStatus::parse),
            last_duration: row.get("last_duration"),
            last_transferred: row.get("last_transferred"),
            run_count: row.get("run_count"),
            error_count: row.get("error_count"),
            consecutive_failures: row.get("consecutive_failures"),
            created_at: row.get("created_at"),
        }
    }
}

/// Job log operations (append-only rows, one per attempt)
pub mod job_logs {
    use super::*;
    use zfsync_common::{JobLog, LogStatus};

    pub async fn get(pool: &SqlitePool, id: i64) -> Result<JobLog> {
        let row = sqlx::query("SELECT * FROM job_logs WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get job log: {}", e)))?
            .ok_or_else(|| Error::NotFound(format!("Job log {}", id)))?;

        Ok(row_to_log(&row))
    }

    pub async fn list(pool: &SqlitePool, job_id: Option<i64>, limit: i64) -> Result<Vec<JobLog>> {
        let rows = match job_id {
            Some(id) => {
                sqlx::query(
                    "SELECT * FROM job_logs WHERE job_id = ? ORDER BY started_at DESC LIMIT ?",
                )
                .bind(id)
                .bind(limit)
                .fetch_all(pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM job_logs ORDER BY started_at DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(pool)
                    .await
            }
        }
        .map_err(|e| Error::Database(format!("Failed to list job logs: {}", e)))?;

        Ok(rows.iter().map(row_to_log).collect())
    }

    /// Logs for one job since a point in time, newest first.
    pub async fn list_for_job_since(
        pool: &SqlitePool,
        job_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<JobLog>> {
        let rows = sqlx::query(
            "SELECT * FROM job_logs WHERE job_id = ? AND job_type = 'sync'
             AND started_at >= ? ORDER BY started_at DESC",
        )
        .bind(job_id)
        .bind(since)
        .fetch_all(pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to query job logs: {}", e)))?;

        Ok(rows.iter().map(row_to_log).collect())
    }

    /// Startup recovery: rows stuck in `started` longer than the threshold
    /// are closed as failed and the owning jobs marked failed. Returns how
    /// many rows were recovered.
    pub async fn sweep_stale(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
        let rows = sqlx::query("SELECT id, job_id FROM job_logs WHERE status = 'started' AND started_at < ?")
            .bind(cutoff)
            .fetch_all(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to find stale runs: {}", e)))?;

        if rows.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        for row in &rows {
            let log_id: i64 = row.get("id");
            let job_id: Option<i64> = row.get("job_id");

            sqlx::query(
                "UPDATE job_logs SET status = 'failed', error = 'process terminated',
                 completed_at = ? WHERE id = ?",
            )
            .bind(now)
            .bind(log_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("Failed to close stale log: {}", e)))?;

            if let Some(job_id) = job_id {
                sqlx::query(
                    "UPDATE sync_jobs SET last_status = 'failed' WHERE id = ? AND last_status = 'running'",
                )
                .bind(job_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Database(format!("Failed to reset stale job: {}", e)))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit: {}", e)))?;

        Ok(rows.len() as u64)
    }

    /// Record a standalone, already-finished operation (manual snapshot
    /// create/destroy) as one closed log row.
    pub async fn record_operation(
        pool: &SqlitePool,
        job_type: &str,
        node_name: &str,
        dataset: &str,
        success: bool,
        message: &str,
        triggered_by: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        let status = if success { "success" } else { "failed" };

        sqlx::query(
            "INSERT INTO job_logs (job_id, job_type, node_name, dataset, status, message,
             attempt_number, started_at, completed_at, triggered_by)
             VALUES (NULL, ?, ?, ?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(job_type)
        .bind(node_name)
        .bind(dataset)
        .bind(status)
        .bind(message)
        .bind(now)
        .bind(now)
        .bind(triggered_by)
        .execute(pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to record operation: {}", e)))?;

        Ok(())
    }

    /// Retention: delete rows older than the cutoff. Returns rows removed.
    pub async fn prune_older_than(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM job_logs WHERE started_at < ?")
            .bind(cutoff)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to prune job logs: {}", e)))?;

        Ok(result.rows_affected())
    }

    fn row_to_log(row: &SqliteRow) -> JobLog {
        let status: String = row.get("status");

        JobLog {
            id: row.get("id"),
            job_id: row.get("job_id"),
            job_type: row.get("job_type"),
            node_name: row.get("node_name"),
            dataset: row.get("dataset"),
            status: LogStatus::parse(&status).unwrap_or(LogStatus::Failed),
            message: row.get("message"),
            output: row.get("output"),
            error: row.get("error"),
            duration: row.get("duration"),
            transferred: row.get("transferred"),
            attempt_number: row.get("attempt_number"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            triggered_by: row.get("triggered_by"),
        }
    }
}

/// User operations
pub mod users {
    use super::*;
    use zfsync_common::User;

    pub async fn create(pool: &SqlitePool, user: &User) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (id, username, password_hash, email, role, realm, enabled, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(&user.email)
        .bind(&user.role)
        .bind(&user.realm)
        .bind(user.enabled)
        .bind(user.created_at)
        .execute(pool)
        .await
        .map_err(|e| map_write_err(e, &format!("User '{}'", user.username)))?;

        Ok(())
    }

    pub async fn get(pool: &SqlitePool, id: &str) -> Result<User> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get user: {}", e)))?
            .ok_or_else(|| Error::NotFound(format!("User {}", id)))?;

        Ok(row_to_user(&row))
    }

    /// Lookup by name regardless of the enabled flag; login paths check
    /// `enabled` themselves so disabled accounts get a distinct refusal.
    pub async fn get_by_username(pool: &SqlitePool, username: &str) -> Result<User> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get user: {}", e)))?
            .ok_or(Error::Unauthorized)?;

        Ok(row_to_user(&row))
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<User>> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY username")
            .fetch_all(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to list users: {}", e)))?;

        Ok(rows.iter().map(row_to_user).collect())
    }

    pub async fn update(pool: &SqlitePool, user: &User) -> Result<()> {
        let result = sqlx::query(
            "UPDATE users SET username = ?, password_hash = ?, email = ?, role = ?,
             realm = ?, enabled = ? WHERE id = ?",
        )
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(&user.email)
        .bind(&user.role)
        .bind(&user.realm)
        .bind(user.enabled)
        .bind(&user.id)
        .execute(pool)
        .await
        .map_err(|e| map_write_err(e, &format!("User '{}'", user.username)))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("User {}", user.id)));
        }

        Ok(())
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to delete user: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("User {}", id)));
        }

        Ok(())
    }

    pub async fn count(pool: &SqlitePool) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM users")
            .fetch_one(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to count users: {}", e)))?;

        Ok(row.get("count"))
    }

    fn row_to_user(row: &SqliteRow) -> User {
        User {
            id: row.get("id"),
            username: row.get("username"),
            password_hash: row.get("password_hash"),
            email: row.get("email"),
            role: row.get("role"),
            realm: row.get("realm"),
            enabled: row.get("enabled"),
            created_at: row.get("created_at"),
        }
    }
}

/// Notification settings (singleton row)
pub mod notifications {
    use super::*;
    use zfsync_common::NotificationSettings;

    pub async fn get(pool: &SqlitePool) -> Result<NotificationSettings> {
        let row = sqlx::query("SELECT * FROM notification_config WHERE id = 1")
            .fetch_optional(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get notification config: {}", e)))?;

        match row {
            Some(row) => Ok(row_to_settings(&row)),
            None => Ok(NotificationSettings {
                smtp_port: 587,
                smtp_subject_prefix: "[zfsync]".to_string(),
                smtp_tls: true,
                notify_on_success: true,
                notify_on_failure: true,
                notify_on_warning: true,
                ..NotificationSettings::default()
            }),
        }
    }

    pub async fn update(pool: &SqlitePool, settings: &NotificationSettings) -> Result<()> {
        sqlx::query(
            "INSERT INTO notification_config (id, smtp_enabled, smtp_host, smtp_port,
             smtp_user, smtp_password, smtp_from, smtp_to, smtp_subject_prefix, smtp_tls,
             webhook_enabled, webhook_url, webhook_secret, telegram_enabled,
             telegram_bot_token, telegram_chat_id, notify_on_success, notify_on_failure,
             notify_on_warning)
             VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 smtp_enabled = excluded.smtp_enabled,
                 smtp_host = excluded.smtp_host,
                 smtp_port = excluded.smtp_port,
                 smtp_user = excluded.smtp_user,
                 smtp_password = excluded.smtp_password,
                 smtp_from = excluded.smtp_from,
                 smtp_to = excluded.smtp_to,
                 smtp_subject_prefix = excluded.smtp_subject_prefix,
                 smtp_tls = excluded.smtp_tls,
                 webhook_enabled = excluded.webhook_enabled,
                 webhook_url = excluded.webhook_url,
                 webhook_secret = excluded.webhook_secret,
                 telegram_enabled = excluded.telegram_enabled,
                 telegram_bot_token = excluded.telegram_bot_token,
                 telegram_chat_id = excluded.telegram_chat_id,
                 notify_on_success = excluded.notify_on_success,
                 notify_on_failure = excluded.notify_on_failure,
                 notify_on_warning = excluded.notify_on_warning",
        )
        .bind(settings.smtp_enabled)
        .bind(&settings.smtp_host)
        .bind(settings.smtp_port as i64)
        .bind(&settings.smtp_user)
        .bind(&settings.smtp_password)
        .bind(&settings.smtp_from)
        .bind(&settings.smtp_to)
        .bind(&settings.smtp_subject_prefix)
        .bind(settings.smtp_tls)
        .bind(settings.webhook_enabled)
        .bind(&settings.webhook_url)
        .bind(&settings.webhook_secret)
        .bind(settings.telegram_enabled)
        .bind(&settings.telegram_bot_token)
        .bind(&settings.telegram_chat_id)
        .bind(settings.notify_on_success)
        .bind(settings.notify_on_failure)
        .bind(settings.notify_on_warning)
        .execute(pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to update notification config: {}", e)))?;

        Ok(())
    }

    fn row_to_settings(row: &SqliteRow) -> NotificationSettings {
        NotificationSettings {
            smtp_enabled: row.get("smtp_enabled"),
            smtp_host: row.get("smtp_host"),
            smtp_port: row.get::<i64, _>("smtp_port") as u16,
            smtp_user: row.get("smtp_user"),
            smtp_password: row.get("smtp_password"),
            smtp_from: row.get("smtp_from"),
            smtp_to: row.get("smtp_to"),
            smtp_subject_prefix: row.get("smtp_subject_prefix"),
            smtp_tls: row.get("smtp_tls"),
            webhook_enabled: row.get("webhook_enabled"),
            webhook_url: row.get("webhook_url"),
            webhook_secret: row.get("webhook_secret"),
            telegram_enabled: row.get("telegram_enabled"),
            telegram_bot_token: row.get("telegram_bot_token"),
            telegram_chat_id: row.get("telegram_chat_id"),
            notify_on_success: row.get("notify_on_success"),
            notify_on_failure: row.get("notify_on_failure"),
            notify_on_warning: row.get("notify_on_warning"),
        }
    }
}

/// Typed system configuration (key/value with category and secret flag)
pub mod system {
    use super::*;
    use zfsync_common::SystemConfigEntry;

    const DEFAULTS: &[(&str, &str, &str, &str)] = &[
        ("daily_summary_hour", "8", "integer", "notifications"),
        ("daily_summary_enabled", "true", "boolean", "notifications"),
        ("sync_timeout_seconds", "3600", "integer", "scheduler"),
        ("stale_run_minutes", "120", "integer", "scheduler"),
        ("log_retention_days", "30", "integer", "retention"),
        ("audit_retention_days", "90", "integer", "retention"),
        ("auth_method", "local", "string", "auth"),
    ];

    /// Insert default entries that do not exist yet.
    pub async fn seed_defaults(pool: &SqlitePool) -> Result<()> {
        for (key, value, value_type, category) in DEFAULTS {
            sqlx::query(
                "INSERT INTO system_config (key, value, value_type, category, is_secret)
                 VALUES (?, ?, ?, ?, 0) ON CONFLICT(key) DO NOTHING",
            )
            .bind(key)
            .bind(value)
            .bind(value_type)
            .bind(category)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to seed config {}: {}", key, e)))?;
        }

        Ok(())
    }

    pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM system_config WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get config: {}", e)))?;

        Ok(row.map(|r| r.get("value")))
    }

    pub async fn get_i64(pool: &SqlitePool, key: &str, default: i64) -> Result<i64> {
        Ok(get(pool, key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(default))
    }

    pub async fn get_bool(pool: &SqlitePool, key: &str, default: bool) -> Result<bool> {
        Ok(get(pool, key)
            .await?
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(default))
    }

    pub async fn set(pool: &SqlitePool, key: &str, value: &str) -> Result<()> {
        let result = sqlx::query("UPDATE system_config SET value = ? WHERE key = ?")
            .bind(value)
            .bind(key)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to set config: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Config key '{}'", key)));
        }

        Ok(())
    }

    pub async fn list(pool: &SqlitePool) -> Result<Vec<SystemConfigEntry>> {
        let rows = sqlx::query("SELECT * FROM system_config ORDER BY category, key")
            .fetch_all(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to list config: {}", e)))?;

        Ok(rows
            .iter()
            .map(|row| SystemConfigEntry {
                key: row.get("key"),
                value: row.get("value"),
                value_type: row.get("value_type"),
                category: row.get("category"),
                is_secret: row.get("is_secret"),
            })
            .collect())
    }
}

/// Audit log operations
pub mod audit {
    use super::*;

    pub async fn log(
        pool: &SqlitePool,
        user_id: Option<&str>,
        username: Option<&str>,
        action: &str,
        resource: &str,
        details: Option<&str>,
        source_ip: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_logs (timestamp, user_id, username, action, resource, details, source_ip)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Utc::now())
        .bind(user_id)
        .bind(username)
        .bind(action)
        .bind(resource)
        .bind(details)
        .bind(source_ip)
        .execute(pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to write audit log: {}", e)))?;

        Ok(())
    }

    #[derive(Debug, serde::Serialize)]
    pub struct AuditEntry {
        pub id: i64,
        pub timestamp: DateTime<Utc>,
        pub user_id: Option<String>,
        pub username: Option<String>,
        pub action: String,
        pub resource: String,
        pub details: Option<String>,
        pub source_ip: Option<String>,
    }

    pub async fn list(pool: &SqlitePool, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query("SELECT * FROM audit_logs ORDER BY timestamp DESC LIMIT ?")
            .bind(limit)
            .fetch_all(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to list audit logs: {}", e)))?;

        Ok(rows
            .iter()
            .map(|row| AuditEntry {
                id: row.get("id"),
                timestamp: row.get("timestamp"),
                user_id: row.get("user_id"),
                username: row.get("username"),
                action: row.get("action"),
                resource: row.get("resource"),
                details: row.get("details"),
                source_ip: row.get("source_ip"),
            })
            .collect())
    }

    pub async fn prune_older_than(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_logs WHERE timestamp < ?")
            .bind(cutoff)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to prune audit logs: {}", e)))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use chrono::Duration;

    pub async fn create_test_db() -> Database {
        let db = Database::new("sqlite::memory:", 1)
            .await
            .expect("Failed to create database");
        db.migrate().await.expect("Failed to run migrations");
        db
    }

    pub fn test_node_draft(name: &str, hostname: &str) -> nodes::NodeDraft {
        nodes::NodeDraft {
            name: name.to_string(),
            hostname: hostname.to_string(),
            ssh_port: 22,
            ssh_user: "root".to_string(),
            ssh_key_path: "/root/.ssh/id_rsa".to_string(),
            api_endpoint: None,
            is_auth_node: false,
            parallel_commands: false,
        }
    }

    pub fn test_job_draft(name: &str, source: i64, dest: i64) -> jobs::JobDraft {
        jobs::JobDraft {
            name: name.to_string(),
            source_node_id: source,
            source_dataset: "rpool/data/vm-100-disk-0".to_string(),
            dest_node_id: dest,
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
            vm_id: None,
            dest_vm_id: None,
            vm_type: None,
            vm_group_id: None,
            source_storage: None,
            dest_storage: None,
        }
    }

    #[tokio::test]
    async fn test_node_crud_roundtrip() {
        let db = create_test_db().await;
        let pool = db.pool();

        let node = nodes::create(pool, &test_node_draft("pve1", "192.168.1.100"))
            .await
            .unwrap();
        assert_eq!(node.name, "pve1");
        assert_eq!(node.ssh_port, 22);

        let mut draft = test_node_draft("pve1", "192.168.1.100");
        draft.ssh_port = 2222;
        let updated = nodes::update(pool, node.id, &draft).await.unwrap();
        assert_eq!(updated.ssh_port, 2222);
        assert_eq!(updated.hostname, "192.168.1.100");

        nodes::delete(pool, node.id).await.unwrap();
        assert!(matches!(
            nodes::get(pool, node.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_node_name_unique() {
        let db = create_test_db().await;
        let pool = db.pool();

        nodes::create(pool, &test_node_draft("pve1", "192.168.1.100"))
            .await
            .unwrap();
        let err = nodes::create(pool, &test_node_draft("pve1", "192.168.1.101"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_auth_node_cardinality() {
        let db = create_test_db().await;
        let pool = db.pool();

        let mut draft = test_node_draft("pve1", "192.168.1.100");
        draft.is_auth_node = true;
        let a = nodes::create(pool, &draft).await.unwrap();
        assert!(a.is_auth_node);

        let mut draft = test_node_draft("pve2", "192.168.1.101");
        draft.is_auth_node = true;
        let b = nodes::create(pool, &draft).await.unwrap();
        assert!(b.is_auth_node);

        // Selecting a new auth node must have cleared the old one
        let a = nodes::get(pool, a.id).await.unwrap();
        assert!(!a.is_auth_node);

        let auth_count = nodes::list(pool)
            .await
            .unwrap()
            .iter()
            .filter(|n| n.is_auth_node)
            .count();
        assert_eq!(auth_count, 1);
    }

    #[tokio::test]
    async fn test_get_auth_node() {
        let db = create_test_db().await;
        let pool = db.pool();

        assert!(nodes::get_auth_node(pool).await.unwrap().is_none());

        nodes::create(pool, &test_node_draft("pve1", "h1")).await.unwrap();
        let mut draft = test_node_draft("pve2", "h2");
        draft.is_auth_node = true;
        nodes::create(pool, &draft).await.unwrap();

        let auth_node = nodes::get_auth_node(pool).await.unwrap().unwrap();
        assert_eq!(auth_node.name, "pve2");
    }

    #[tokio::test]
    async fn test_get_by_username_includes_disabled() {
        let db = create_test_db().await;
        let pool = db.pool();

        let user = zfsync_common::User {
            id: "u1".to_string(),
            username: "ops".to_string(),
            password_hash: "$argon2id$x".to_string(),
            email: None,
            role: "operator".to_string(),
            realm: "local".to_string(),
            enabled: false,
            created_at: Utc::now(),
        };
        users::create(pool, &user).await.unwrap();

        // Login paths need the row back to refuse with a distinct error
        let found = users::get_by_username(pool, "ops").await.unwrap();
        assert!(!found.enabled);
    }

    #[tokio::test]
    async fn test_node_delete_refused_while_referenced() {
        let db = create_test_db().await;
        let pool = db.pool();

        let a = nodes::create(pool, &test_node_draft("pve1", "192.168.1.100"))
            .await
            .unwrap();
        let b = nodes::create(pool, &test_node_draft("pve2", "192.168.1.101"))
            .await
            .unwrap();
        let job = jobs::create(pool, &test_job_draft("j1", a.id, b.id))
            .await
            .unwrap();

        let err = nodes::delete(pool, a.id).await.unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
        let err = nodes::delete(pool, b.id).await.unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));

        jobs::delete(pool, job.id).await.unwrap();
        nodes::delete(pool, a.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_job_requires_existing_nodes() {
        let db = create_test_db().await;
        let pool = db.pool();

        let err = jobs::create(pool, &test_job_draft("j1", 99, 98))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_scheduled_filters() {
        let db = create_test_db().await;
        let pool = db.pool();

        let a = nodes::create(pool, &test_node_draft("pve1", "h1")).await.unwrap();
        let b = nodes::create(pool, &test_node_draft("pve2", "h2")).await.unwrap();

        jobs::create(pool, &test_job_draft("cron-job", a.id, b.id))
            .await
            .unwrap();

        let mut manual = test_job_draft("manual-job", a.id, b.id);
        manual.schedule = String::new();
        jobs::create(pool, &manual).await.unwrap();

        let mut inactive = test_job_draft("inactive-job", a.id, b.id);
        inactive.is_active = false;
        jobs::create(pool, &inactive).await.unwrap();

        let scheduled = jobs::list_scheduled(pool).await.unwrap();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].name, "cron-job");
    }

    #[tokio::test]
    async fn test_run_lifecycle_counters() {
        let db = create_test_db().await;
        let pool = db.pool();

        let a = nodes::create(pool, &test_node_draft("pve1", "h1")).await.unwrap();
        let b = nodes::create(pool, &test_node_draft("pve2", "h2")).await.unwrap();
        let job = jobs::create(pool, &test_job_draft("j1", a.id, b.id))
            .await
            .unwrap();

        // First run fails
        let log_id = jobs::start_run(pool, &job, "pve1 -> pve2", "a -> b", "sync", 1, None)
            .await
            .unwrap();
        assert!(jobs::is_running(pool, job.id).await.unwrap());

        jobs::complete_run(
            pool,
            job.id,
            log_id,
            &jobs::RunCompletion {
                success: false,
                message: "Replication failed".to_string(),
                output: None,
                error: Some("permission denied".to_string()),
                duration: 3,
                transferred: None,
            },
        )
        .await
        .unwrap();

        let job1 = jobs::get(pool, job.id).await.unwrap();
        assert_eq!(job1.run_count, 1);
        assert_eq!(job1.error_count, 1);
        assert_eq!(job1.consecutive_failures, 1);
        assert_eq!(job1.last_status, Some(zfsync_common::JobStatus::Failed));

        // Second run succeeds and resets the failure streak
        let log_id = jobs::start_run(pool, &job, "pve1 -> pve2", "a -> b", "sync", 2, None)
            .await
            .unwrap();
        jobs::complete_run(
            pool,
            job.id,
            log_id,
            &jobs::RunCompletion {
                success: true,
                message: "Replication completed".to_string(),
                output: Some("1.5GiB transferred".to_string()),
                error: None,
                duration: 42,
                transferred: Some("1.5GiB".to_string()),
            },
        )
        .await
        .unwrap();

        let job2 = jobs::get(pool, job.id).await.unwrap();
        assert_eq!(job2.run_count, 2);
        assert_eq!(job2.error_count, 1);
        assert_eq!(job2.consecutive_failures, 0);
        assert_eq!(job2.last_transferred, Some("1.5GiB".to_string()));

        let log = job_logs::get(pool, log_id).await.unwrap();
        assert_eq!(log.status, zfsync_common::LogStatus::Success);
        assert_eq!(log.attempt_number, 2);
        assert!(log.completed_at.unwrap() >= log.started_at);
    }

    #[tokio::test]
    async fn test_stale_run_sweep() {
        let db = create_test_db().await;
        let pool = db.pool();

        let a = nodes::create(pool, &test_node_draft("pve1", "h1")).await.unwrap();
        let b = nodes::create(pool, &test_node_draft("pve2", "h2")).await.unwrap();
        let job = jobs::create(pool, &test_job_draft("j1", a.id, b.id))
            .await
            .unwrap();

        let log_id = jobs::start_run(pool, &job, "pve1 -> pve2", "a -> b", "sync", 1, None)
            .await
            .unwrap();

        // Nothing is stale yet
        let swept = job_logs::sweep_stale(pool, Utc::now() - Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(swept, 0);

        // Everything started before "the future" is stale
        let swept = job_logs::sweep_stale(pool, Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(swept, 1);

        let log = job_logs::get(pool, log_id).await.unwrap();
        assert_eq!(log.status, zfsync_common::LogStatus::Failed);
        assert_eq!(log.error.as_deref(), Some("process terminated"));
        assert!(log.completed_at.is_some());

        let job = jobs::get(pool, job.id).await.unwrap();
        assert_eq!(job.last_status, Some(zfsync_common::JobStatus::Failed));
    }

    #[tokio::test]
    async fn test_dataset_refresh_preserves_policy() {
        let db = create_test_db().await;
        let pool = db.pool();

        let node = nodes::create(pool, &test_node_draft("pve1", "h1")).await.unwrap();

        let listing = vec![datasets::DatasetRow {
            name: "rpool/data".to_string(),
            used: Some("10G".to_string()),
            available: Some("90G".to_string()),
            mountpoint: Some("/rpool/data".to_string()),
        }];
        datasets::refresh_for_node(pool, node.id, &listing).await.unwrap();

        let ds = &datasets::list_for_node(pool, node.id).await.unwrap()[0];
        datasets::update_policy(
            pool,
            ds.id,
            &datasets::PolicyUpdate {
                sanoid_enabled: true,
                sanoid_template: Some("production".to_string()),
                hourly: 48,
                daily: 90,
                weekly: 12,
                monthly: 24,
                yearly: 5,
                autosnap: true,
                autoprune: true,
            },
        )
        .await
        .unwrap();

        // Refresh with new usage figures must keep the policy
        let listing = vec![datasets::DatasetRow {
            name: "rpool/data".to_string(),
            used: Some("12G".to_string()),
            available: Some("88G".to_string()),
            mountpoint: Some("/rpool/data".to_string()),
        }];
        datasets::refresh_for_node(pool, node.id, &listing).await.unwrap();

        let ds = &datasets::list_for_node(pool, node.id).await.unwrap()[0];
        assert_eq!(ds.used.as_deref(), Some("12G"));
        assert!(ds.sanoid_enabled);
        assert_eq!(ds.hourly, 48);

        // Datasets that vanished from the node are dropped
        datasets::refresh_for_node(pool, node.id, &[]).await.unwrap();
        assert!(datasets::list_for_node(pool, node.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_system_config_seeded() {
        let db = create_test_db().await;
        let pool = db.pool();

        assert_eq!(system::get_i64(pool, "daily_summary_hour", 0).await.unwrap(), 8);
        assert!(system::get_bool(pool, "daily_summary_enabled", false).await.unwrap());
        assert_eq!(system::get_i64(pool, "sync_timeout_seconds", 0).await.unwrap(), 3600);

        system::set(pool, "daily_summary_hour", "14").await.unwrap();
        assert_eq!(system::get_i64(pool, "daily_summary_hour", 0).await.unwrap(), 14);

        let err = system::set(pool, "no_such_key", "x").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_notification_settings_roundtrip() {
        let db = create_test_db().await;
        let pool = db.pool();

        // Defaults before any row exists
        let settings = notifications::get(pool).await.unwrap();
        assert!(!settings.smtp_enabled);
        assert!(settings.notify_on_failure);

        let mut settings = settings;
        settings.smtp_enabled = true;
        settings.smtp_host = Some("mail.example.com".to_string());
        settings.notify_on_success = false;
        notifications::update(pool, &settings).await.unwrap();

        let back = notifications::get(pool).await.unwrap();
        assert!(back.smtp_enabled);
        assert_eq!(back.smtp_host.as_deref(), Some("mail.example.com"));
        assert!(!back.notify_on_success);
    }

    #[tokio::test]
    async fn test_log_retention_prune() {
        let db = create_test_db().await;
        let pool = db.pool();

        let a = nodes::create(pool, &test_node_draft("pve1", "h1")).await.unwrap();
        let b = nodes::create(pool, &test_node_draft("pve2", "h2")).await.unwrap();
        let job = jobs::create(pool, &test_job_draft("j1", a.id, b.id))
            .await
            .unwrap();

        let log_id = jobs::start_run(pool, &job, "l", "d", "sync", 1, None).await.unwrap();
        jobs::complete_run(
            pool,
            job.id,
            log_id,
            &jobs::RunCompletion {
                success: true,
                message: "ok".to_string(),
                output: None,
                error: None,
                duration: 1,
                transferred: None,
            },
        )
        .await
        .unwrap();

        let pruned = job_logs::prune_older_than(pool, Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(pruned, 0);

        let pruned = job_logs::prune_older_than(pool, Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
    }

    #[tokio::test]
    async fn test_record_snapshot_operation() {
        let db = create_test_db().await;
        let pool = db.pool();

        job_logs::record_operation(
            pool,
            "snapshot",
            "pve1",
            "rpool/data@manual-1",
            true,
            "Snapshot rpool/data@manual-1 created",
            Some("u1"),
        )
        .await
        .unwrap();

        let logs = job_logs::list(pool, None, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].job_id, None);
        assert_eq!(logs[0].job_type, "snapshot");
        assert_eq!(logs[0].status, zfsync_common::LogStatus::Success);
        assert!(logs[0].completed_at.is_some());
        assert_eq!(logs[0].triggered_by.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_group_listing() {
        let db = create_test_db().await;
        let pool = db.pool();

        let a = nodes::create(pool, &test_node_draft("pve1", "h1")).await.unwrap();
        let b = nodes::create(pool, &test_node_draft("pve2", "h2")).await.unwrap();

        let group = "3c9e7b64".to_string();
        for disk in ["scsi0", "scsi1"] {
            let mut draft = test_job_draft(&format!("vm-100-{}", disk), a.id, b.id);
            draft.vm_group_id = Some(group.clone());
            draft.vm_id = Some(100);
            jobs::create(pool, &draft).await.unwrap();
        }

        let members = jobs::list_group(pool, &group).await.unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|j| j.vm_id == Some(100)));
    }
}
