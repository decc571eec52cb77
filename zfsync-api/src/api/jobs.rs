//! Sync-job management endpoints
//!
//! Job mutations re-arm the scheduler; VM-group creation mints one job
//! per guest disk sharing a fresh group id.

use super::{audit, AuthUser};
use crate::db::{self, jobs::JobDraft};
use crate::error::{ApiError, ApiResult};
use crate::scheduler::executor::JobExecutor;
use crate::scheduler::parse_cron;
use crate::ssh::SshEndpoint;
use crate::AppState;
use axum::{
    extract::{Path, State},
    routing::{delete, get, post, put},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use zfsync_common::{GuestKind, SyncJob};

fn validate_schedule(schedule: &str) -> ApiResult<()> {
    if !schedule.trim().is_empty() {
        parse_cron(schedule)?;
    }
    Ok(())
}

async fn list_jobs(State(state): State<AppState>) -> ApiResult<Json<Vec<SyncJob>>> {
    Ok(Json(db::jobs::list(state.database.pool()).await?))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<SyncJob>> {
    Ok(Json(db::jobs::get(state.database.pool(), id).await?))
}

async fn create_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(draft): Json<JobDraft>,
) -> ApiResult<Json<SyncJob>> {
    auth.require_operator()?;
    validate_schedule(&draft.schedule)?;

    let job = db::jobs::create(state.database.pool(), &draft).await?;

    if job.is_active {
        state.schedule_table.update_job_schedule(job.id, &job.schedule).await?;
    }
    audit(&state, &auth, "job.create", &job.name, None).await;

    Ok(Json(job))
}

async fn update_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<i64>,
    Json(draft): Json<JobDraft>,
) -> ApiResult<Json<SyncJob>> {
    auth.require_operator()?;
    validate_schedule(&draft.schedule)?;

    let job = db::jobs::update(state.database.pool(), id, &draft).await?;

    if job.is_active {
        state.schedule_table.update_job_schedule(job.id, &job.schedule).await?;
    } else {
        state.schedule_table.remove_job(job.id).await;
    }
    audit(&state, &auth, "job.update", &job.name, None).await;

    Ok(Json(job))
}

async fn delete_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_operator()?;

    db::jobs::delete(state.database.pool(), id).await?;
    state.schedule_table.remove_job(id).await;
    audit(&state, &auth, "job.delete", &id.to_string(), None).await;

    Ok(Json(json!({"message": "Job deleted"})))
}

/// Manual run: acknowledges immediately, the outcome lands in the job log.
async fn run_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_operator()?;

    // Fail fast on unknown jobs; everything after this is asynchronous
    db::jobs::get(state.database.pool(), id).await?;

    JobExecutor::run_now(&state.executor, id, auth.user_id.clone());
    audit(&state, &auth, "job.run", &id.to_string(), None).await;

    Ok(Json(json!({"message": "Job started"})))
}

/// Newest snapshot present on both sides of a job, the incremental
/// replication base.
async fn common_snapshot(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let pool = state.database.pool();
    let job = db::jobs::get(pool, id).await?;
    let source_node = db::nodes::get(pool, job.source_node_id).await?;
    let dest_node = db::nodes::get(pool, job.dest_node_id).await?;

    let snapshot = state
        .syncoid
        .last_common_snapshot(
            &SshEndpoint::from(&source_node),
            &job.source_dataset,
            &SshEndpoint::from(&dest_node),
            &job.dest_dataset,
        )
        .await;

    Ok(Json(json!({"common_snapshot": snapshot})))
}

/// Request body for per-guest group creation: one sync job per disk.
#[derive(Debug, Deserialize)]
struct VmGroupRequest {
    source_node_id: i64,
    dest_node_id: i64,
    vm_id: u32,
    #[serde(default)]
    dest_vm_id: Option<u32>,
    vm_type: GuestKind,
    /// Destination parent dataset; each disk lands under it by name
    dest_dataset_prefix: String,
    #[serde(default)]
    schedule: String,
    #[serde(default)]
    recursive: bool,
    #[serde(default = "default_compress")]
    compress: String,
    #[serde(default = "default_mbuffer")]
    mbuffer_size: String,
    #[serde(default)]
    register_vm: bool,
    #[serde(default)]
    source_storage: Option<String>,
    #[serde(default)]
    dest_storage: Option<String>,
    #[serde(default)]
    retry_on_failure: bool,
}

fn default_compress() -> String {
    "lz4".to_string()
}

fn default_mbuffer() -> String {
    "128M".to_string()
}

/// Create one job per disk of a guest, all sharing a freshly minted
/// group id, node pair and cron.
async fn create_vm_group(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(request): Json<VmGroupRequest>,
) -> ApiResult<Json<Vec<SyncJob>>> {
    auth.require_operator()?;
    validate_schedule(&request.schedule)?;

    let pool = state.database.pool();
    let source_node = db::nodes::get(pool, request.source_node_id).await?;
    db::nodes::get(pool, request.dest_node_id).await?;

    let disks = state
        .proxmox
        .guest_disks(&SshEndpoint::from(&source_node), request.vm_id, request.vm_type)
        .await?;

    let replicable: Vec<(String, String)> = disks
        .iter()
        .filter_map(|disk| {
            disk.dataset
                .clone()
                .map(|dataset| (disk.disk_name.clone(), dataset))
        })
        .collect();

    if replicable.is_empty() {
        return Err(ApiError::bad_request(format!(
            "Guest {} has no ZFS-backed disks to replicate",
            request.vm_id
        )));
    }

    let group_id = uuid::Uuid::new_v4().to_string();
    let mut jobs = Vec::with_capacity(replicable.len());

    for (disk_name, source_dataset) in &replicable {
        let leaf = source_dataset.rsplit('/').next().unwrap_or(source_dataset);
        let dest_dataset = format!("{}/{}", request.dest_dataset_prefix.trim_end_matches('/'), leaf);

        let draft = JobDraft {
            name: format!("vm-{}-{}", request.vm_id, disk_name),
            source_node_id: request.source_node_id,
            source_dataset: source_dataset.clone(),
            dest_node_id: request.dest_node_id,
            dest_dataset,
            recursive: request.recursive,
            compress: request.compress.clone(),
            mbuffer_size: request.mbuffer_size.clone(),
            no_sync_snap: false,
            force_delete: false,
            extra_args: String::new(),
            schedule: request.schedule.clone(),
            is_active: true,
            retry_on_failure: request.retry_on_failure,
            max_retries: 3,
            retry_delay_minutes: 15,
            register_vm: request.register_vm,
            vm_id: Some(request.vm_id),
            dest_vm_id: request.dest_vm_id,
            vm_type: Some(request.vm_type),
            vm_group_id: Some(group_id.clone()),
            source_storage: request.source_storage.clone(),
            dest_storage: request.dest_storage.clone(),
        };

        let job = db::jobs::create(pool, &draft).await?;
        if job.is_active {
            state.schedule_table.update_job_schedule(job.id, &job.schedule).await?;
        }
        jobs.push(job);
    }

    audit(
        &state,
        &auth,
        "job.group_create",
        &group_id,
        Some(&format!("vm {} ({} disks)", request.vm_id, jobs.len())),
    )
    .await;

    Ok(Json(jobs))
}

async fn list_group(
    State(state): State<AppState>,
    Path(group_id): Path<String>,
) -> ApiResult<Json<Vec<SyncJob>>> {
    Ok(Json(db::jobs::list_group(state.database.pool(), &group_id).await?))
}

/// Dispatch every member of a group; per-host serialization in the
/// execution layer keeps the fan-out bounded.
async fn run_group(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(group_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_operator()?;

    let jobs = db::jobs::list_group(state.database.pool(), &group_id).await?;
    if jobs.is_empty() {
        return Err(ApiError::not_found(format!("Job group {}", group_id)));
    }

    for job in &jobs {
        JobExecutor::run_now(&state.executor, job.id, auth.user_id.clone());
    }

    audit(&state, &auth, "job.group_run", &group_id, None).await;

    Ok(Json(json!({"message": format!("{} job(s) started", jobs.len())})))
}

async fn delete_group(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(group_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_operator()?;

    let jobs = db::jobs::list_group(state.database.pool(), &group_id).await?;
    if jobs.is_empty() {
        return Err(ApiError::not_found(format!("Job group {}", group_id)));
    }

    for job in &jobs {
        db::jobs::delete(state.database.pool(), job.id).await?;
        state.schedule_table.remove_job(job.id).await;
    }

    audit(&state, &auth, "job.group_delete", &group_id, None).await;

    Ok(Json(json!({"message": format!("{} job(s) deleted", jobs.len())})))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/sync-jobs", get(list_jobs))
        .route("/api/sync-jobs", post(create_job))
        .route("/api/sync-jobs/vm-group", post(create_vm_group))
        .route("/api/sync-jobs/group/:group_id", get(list_group))
        .route("/api/sync-jobs/group/:group_id", delete(delete_group))
        .route("/api/sync-jobs/group/:group_id/run", post(run_group))
        .route("/api/sync-jobs/:id", get(get_job))
        .route("/api/sync-jobs/:id", put(update_job))
        .route("/api/sync-jobs/:id", delete(delete_job))
        .route("/api/sync-jobs/:id/run", post(run_job))
        .route("/api/sync-jobs/:id/common-snapshot", get(common_snapshot))
}
