// Allow dead code for store and wrapper helpers exercised only by tests
#![allow(dead_code)]

mod api;
mod config;
mod db;
mod error;
mod logging;
mod notify;
mod proxmox;
mod proxmox_auth;
mod sanoid;
mod scheduler;
mod shutdown;
mod ssh;
mod syncoid;
mod zfs;

use axum::http::{header, HeaderValue, Method};
use notify::Notifier;
use proxmox::ProxmoxManager;
use proxmox_auth::ProxmoxAuthService;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sanoid::SanoidManager;
use scheduler::{executor::JobExecutor, ScheduleTable, Scheduler};
use shutdown::ShutdownCoordinator;
use ssh::SshExecutor;
use std::sync::Arc;
use syncoid::SyncoidService;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use zfs::ZfsManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::AppConfig>,
    pub database: Arc<db::Database>,
    pub ssh: Arc<SshExecutor>,
    pub zfs: Arc<ZfsManager>,
    pub proxmox: Arc<ProxmoxManager>,
    pub proxmox_auth: Arc<ProxmoxAuthService>,
    pub sanoid: Arc<SanoidManager>,
    pub syncoid: Arc<SyncoidService>,
    pub notifier: Arc<Notifier>,
    pub executor: Arc<JobExecutor>,
    pub schedule_table: Arc<ScheduleTable>,
    pub jwt_secret: Arc<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration, then wire tracing from it
    let app_config = config::AppConfig::load();
    let _log_guard = logging::init(&app_config.logging);

    if let Err(e) = app_config.validate() {
        return Err(anyhow::anyhow!("Invalid configuration: {}", e));
    }
    info!("Configuration loaded");
    let app_config = Arc::new(app_config);

    // Token signing key; an ephemeral one means tokens die with the process
    let jwt_secret = if app_config.auth.secret_key.is_empty() {
        warn!("ZFSYNC_SECRET_KEY not set; generated key will not survive a restart");
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(64)
            .map(char::from)
            .collect::<String>()
    } else {
        app_config.auth.secret_key.clone()
    };

    // Database
    let database_url = format!("sqlite://{}?mode=rwc", app_config.database.path.display());
    let database = Arc::new(
        db::Database::new(&database_url, app_config.database.max_connections).await?,
    );
    database.migrate().await?;
    info!("Database initialized");

    seed_admin_user(&database).await?;

    // Service singletons, leaves first
    let ssh_executor = Arc::new(SshExecutor::new(
        app_config.ssh.control_dir.clone(),
        app_config.ssh.control_persist_secs,
    ));
    let zfs_manager = Arc::new(ZfsManager::new(Arc::clone(&ssh_executor)));
    let proxmox_manager = Arc::new(ProxmoxManager::new(Arc::clone(&ssh_executor)));
    let proxmox_auth_service = Arc::new(ProxmoxAuthService::new());
    let sanoid_manager = Arc::new(SanoidManager::new(Arc::clone(&ssh_executor)));
    let syncoid_service = Arc::new(SyncoidService::new(Arc::clone(&ssh_executor)));
    let notifier = Arc::new(Notifier::new(Arc::clone(&database)));

    let schedule_table = Arc::new(ScheduleTable::new());
    let job_executor = Arc::new(JobExecutor::new(
        Arc::clone(&database),
        Arc::clone(&syncoid_service),
        Arc::clone(&proxmox_manager),
        Arc::clone(&notifier),
        Arc::clone(&schedule_table),
    ));

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&database),
        Arc::clone(&job_executor),
        Arc::clone(&notifier),
        Arc::clone(&schedule_table),
    ));

    // Runs left behind by a crashed process resolve to failed before the
    // first tick
    scheduler.recover_stale_runs().await?;

    let shutdown = ShutdownCoordinator::new();
    let scheduler_handle = Arc::clone(&scheduler).start(shutdown.clone());

    let state = AppState {
        config: Arc::clone(&app_config),
        database: Arc::clone(&database),
        ssh: ssh_executor,
        zfs: zfs_manager,
        proxmox: proxmox_manager,
        proxmox_auth: proxmox_auth_service,
        sanoid: sanoid_manager,
        syncoid: syncoid_service,
        notifier,
        executor: job_executor,
        schedule_table,
        jwt_secret: Arc::new(jwt_secret),
    };

    let cors = build_cors(&app_config.cors_origins());
    let app = api::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", app_config.server.host, app_config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("zfsync listening on {}", addr);

    let signal_waiter = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal_waiter.wait_for_signal().await;
        })
        .await?;

    // Bounded drain: the scheduler exits on the shutdown flag; in-flight
    // runs past the window are resolved by the next startup's stale sweep
    if tokio::time::timeout(shutdown.timeout(), scheduler_handle)
        .await
        .is_err()
    {
        warn!("Scheduler did not drain within the shutdown window");
    }

    database.close().await;
    info!("zfsync stopped");

    Ok(())
}

fn build_cors(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

/// Create the default admin account when the user table is empty.
async fn seed_admin_user(database: &Arc<db::Database>) -> anyhow::Result<()> {
    if db::users::count(database.pool()).await? > 0 {
        return Ok(());
    }

    let admin_password =
        std::env::var("ZFSYNC_ADMIN_PASSWORD").unwrap_or_else(|_| "admin".to_string());

    if admin_password == "admin" {
        warn!("Using default admin password 'admin'!");
        warn!("Set ZFSYNC_ADMIN_PASSWORD before exposing this service.");
    }

    let password_hash = api::auth::hash_password(&admin_password)
        .map_err(|e| anyhow::anyhow!("Failed to hash admin password: {}", e.detail))?;

    let admin = zfsync_common::User {
        id: uuid::Uuid::new_v4().to_string(),
        username: "admin".to_string(),
        password_hash,
        email: None,
        role: "admin".to_string(),
        realm: "local".to_string(),
        enabled: true,
        created_at: chrono::Utc::now(),
    };

    db::users::create(database.pool(), &admin).await?;
    info!("Created default admin user");

    Ok(())
}
