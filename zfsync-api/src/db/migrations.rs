//! Database migrations
//!
//! Additive only; each migration runs at most once, tracked in the
//! migrations table.

use sqlx::SqlitePool;
use zfsync_common::{Error, Result};

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            executed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| Error::Database(format!("Failed to create migrations table: {}", e)))?;

    run_migration(pool, "001_create_nodes_table", MIGRATION_001_CREATE_NODES).await?;
    run_migration(pool, "002_create_datasets_table", MIGRATION_002_CREATE_DATASETS).await?;
    run_migration(pool, "003_create_sync_jobs_table", MIGRATION_003_CREATE_SYNC_JOBS).await?;
    run_migration(pool, "004_create_job_logs_table", MIGRATION_004_CREATE_JOB_LOGS).await?;
    run_migration(pool, "005_create_users_table", MIGRATION_005_CREATE_USERS).await?;
    run_migration(
        pool,
        "006_create_notification_config_table",
        MIGRATION_006_CREATE_NOTIFICATION_CONFIG,
    )
    .await?;
    run_migration(
        pool,
        "007_create_system_config_table",
        MIGRATION_007_CREATE_SYSTEM_CONFIG,
    )
    .await?;
    run_migration(pool, "008_create_audit_logs_table", MIGRATION_008_CREATE_AUDIT_LOGS).await?;

    Ok(())
}

async fn run_migration(pool: &SqlitePool, name: &str, sql: &str) -> Result<()> {
    use sqlx::Row;

    let row = sqlx::query("SELECT COUNT(*) as count FROM migrations WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await
        .map_err(|e| Error::Database(format!("Migration check failed: {}", e)))?;

    let count: i64 = row.get("count");
    if count > 0 {
        tracing::debug!("Migration {} already applied", name);
        return Ok(());
    }

    tracing::info!("Running migration: {}", name);

    sqlx::query(sql)
        .execute(pool)
        .await
        .map_err(|e| Error::Database(format!("Migration {} failed: {}", name, e)))?;

    sqlx::query("INSERT INTO migrations (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to record migration: {}", e)))?;

    tracing::info!("Migration {} completed", name);

    Ok(())
}

const MIGRATION_001_CREATE_NODES: &str = "
CREATE TABLE nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    hostname TEXT NOT NULL,
    ssh_port INTEGER NOT NULL DEFAULT 22,
    ssh_user TEXT NOT NULL DEFAULT 'root',
    ssh_key_path TEXT NOT NULL DEFAULT '/root/.ssh/id_rsa',
    api_endpoint TEXT,
    is_auth_node INTEGER NOT NULL DEFAULT 0,
    parallel_commands INTEGER NOT NULL DEFAULT 0,
    online INTEGER NOT NULL DEFAULT 0,
    last_seen TEXT,
    syncoid_installed INTEGER NOT NULL DEFAULT 0,
    syncoid_version TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX idx_nodes_name ON nodes(name);
";

const MIGRATION_002_CREATE_DATASETS: &str = "
CREATE TABLE datasets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    used TEXT,
    available TEXT,
    mountpoint TEXT,
    snapshot_count INTEGER NOT NULL DEFAULT 0,
    sanoid_enabled INTEGER NOT NULL DEFAULT 0,
    sanoid_template TEXT,
    hourly INTEGER NOT NULL DEFAULT 24,
    daily INTEGER NOT NULL DEFAULT 30,
    weekly INTEGER NOT NULL DEFAULT 4,
    monthly INTEGER NOT NULL DEFAULT 12,
    yearly INTEGER NOT NULL DEFAULT 0,
    autosnap INTEGER NOT NULL DEFAULT 1,
    autoprune INTEGER NOT NULL DEFAULT 1,
    refreshed_at TEXT,
    UNIQUE(node_id, name),
    FOREIGN KEY (node_id) REFERENCES nodes(id) ON DELETE CASCADE
);

CREATE INDEX idx_datasets_node ON datasets(node_id);
";

const MIGRATION_003_CREATE_SYNC_JOBS: &str = "
CREATE TABLE sync_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    source_node_id INTEGER NOT NULL,
    source_dataset TEXT NOT NULL,
    dest_node_id INTEGER NOT NULL,
    dest_dataset TEXT NOT NULL,
    recursive INTEGER NOT NULL DEFAULT 0,
    compress TEXT NOT NULL DEFAULT 'lz4',
    mbuffer_size TEXT NOT NULL DEFAULT '128M',
    no_sync_snap INTEGER NOT NULL DEFAULT 0,
    force_delete INTEGER NOT NULL DEFAULT 0,
    extra_args TEXT NOT NULL DEFAULT '',
    schedule TEXT NOT NULL DEFAULT '',
    is_active INTEGER NOT NULL DEFAULT 1,
    retry_on_failure INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    retry_delay_minutes INTEGER NOT NULL DEFAULT 15,
    register_vm INTEGER NOT NULL DEFAULT 0,
    vm_id INTEGER,
    dest_vm_id INTEGER,
    vm_type TEXT,
    vm_group_id TEXT,
    source_storage TEXT,
    dest_storage TEXT,
    last_run TEXT,
    last_status TEXT,
    last_duration INTEGER,
    last_transferred TEXT,
    run_count INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    FOREIGN KEY (source_node_id) REFERENCES nodes(id),
    FOREIGN KEY (dest_node_id) REFERENCES nodes(id)
);

CREATE INDEX idx_sync_jobs_active ON sync_jobs(is_active);
CREATE INDEX idx_sync_jobs_group ON sync_jobs(vm_group_id);
";

const MIGRATION_004_CREATE_JOB_LOGS: &str = "
CREATE TABLE job_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER,
    job_type TEXT NOT NULL DEFAULT 'sync',
    node_name TEXT NOT NULL DEFAULT '',
    dataset TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    output TEXT,
    error TEXT,
    duration INTEGER,
    transferred TEXT,
    attempt_number INTEGER NOT NULL DEFAULT 1,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    triggered_by TEXT
);

CREATE INDEX idx_job_logs_job ON job_logs(job_id);
CREATE INDEX idx_job_logs_status ON job_logs(status);
CREATE INDEX idx_job_logs_started ON job_logs(started_at);
";

const MIGRATION_005_CREATE_USERS: &str = "
CREATE TABLE users (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    email TEXT,
    role TEXT NOT NULL DEFAULT 'viewer',
    realm TEXT NOT NULL DEFAULT 'local',
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE INDEX idx_users_username ON users(username);
";

const MIGRATION_006_CREATE_NOTIFICATION_CONFIG: &str = "
CREATE TABLE notification_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    smtp_enabled INTEGER NOT NULL DEFAULT 0,
    smtp_host TEXT,
    smtp_port INTEGER NOT NULL DEFAULT 587,
    smtp_user TEXT,
    smtp_password TEXT,
    smtp_from TEXT,
    smtp_to TEXT,
    smtp_subject_prefix TEXT NOT NULL DEFAULT '[zfsync]',
    smtp_tls INTEGER NOT NULL DEFAULT 1,
    webhook_enabled INTEGER NOT NULL DEFAULT 0,
    webhook_url TEXT,
    webhook_secret TEXT,
    telegram_enabled INTEGER NOT NULL DEFAULT 0,
    telegram_bot_token TEXT,
    telegram_chat_id TEXT,
    notify_on_success INTEGER NOT NULL DEFAULT 1,
    notify_on_failure INTEGER NOT NULL DEFAULT 1,
    notify_on_warning INTEGER NOT NULL DEFAULT 1
);
";

const MIGRATION_007_CREATE_SYSTEM_CONFIG: &str = "
CREATE TABLE system_config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    value_type TEXT NOT NULL DEFAULT 'string',
    category TEXT NOT NULL DEFAULT 'general',
    is_secret INTEGER NOT NULL DEFAULT 0
);
";

const MIGRATION_008_CREATE_AUDIT_LOGS: &str = "
CREATE TABLE audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    user_id TEXT,
    username TEXT,
    action TEXT NOT NULL,
    resource TEXT NOT NULL DEFAULT '',
    details TEXT,
    source_ip TEXT
);

CREATE INDEX idx_audit_logs_timestamp ON audit_logs(timestamp);
";
