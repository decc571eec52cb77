//! Guest enumeration and registry endpoints

use super::{audit, AuthUser};
use crate::db;
use crate::error::ApiResult;
use crate::proxmox::{Guest, GuestDisk};
use crate::ssh::SshEndpoint;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use zfsync_common::GuestKind;

#[derive(Debug, Deserialize)]
struct NodeQuery {
    node_id: i64,
}

async fn list_guests(
    State(state): State<AppState>,
    Query(query): Query<NodeQuery>,
) -> ApiResult<Json<Vec<Guest>>> {
    let node = db::nodes::get(state.database.pool(), query.node_id).await?;
    let guests = state.proxmox.list_guests(&SshEndpoint::from(&node)).await?;
    Ok(Json(guests))
}

#[derive(Debug, Deserialize)]
struct DiskQuery {
    node_id: i64,
    vm_type: GuestKind,
}

async fn list_guest_disks(
    State(state): State<AppState>,
    Path(vmid): Path<u32>,
    Query(query): Query<DiskQuery>,
) -> ApiResult<Json<Vec<GuestDisk>>> {
    let node = db::nodes::get(state.database.pool(), query.node_id).await?;
    let disks = state
        .proxmox
        .guest_disks(&SshEndpoint::from(&node), vmid, query.vm_type)
        .await?;
    Ok(Json(disks))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    source_node_id: i64,
    dest_node_id: i64,
    vmid: u32,
    #[serde(default)]
    dest_vmid: Option<u32>,
    vm_type: GuestKind,
    #[serde(default)]
    source_storage: Option<String>,
    #[serde(default)]
    dest_storage: Option<String>,
    #[serde(default)]
    dest_zfs_pool: Option<String>,
}

/// Copy a guest's registration from one node to another, with optional
/// storage-tag substitution.
async fn register_guest(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_operator()?;

    let pool = state.database.pool();
    let source_node = db::nodes::get(pool, request.source_node_id).await?;
    let dest_node = db::nodes::get(pool, request.dest_node_id).await?;

    let config = state
        .proxmox
        .guest_config_file(&SshEndpoint::from(&source_node), request.vmid, request.vm_type)
        .await?;

    let dest_vmid = request.dest_vmid.unwrap_or(request.vmid);
    let message = state
        .proxmox
        .register_guest(
            &SshEndpoint::from(&dest_node),
            dest_vmid,
            request.vm_type,
            &config,
            request.source_storage.as_deref(),
            request.dest_storage.as_deref(),
            request.dest_zfs_pool.as_deref(),
        )
        .await?;

    audit(
        &state,
        &auth,
        "vm.register",
        &dest_vmid.to_string(),
        Some(&format!("{} -> {}", source_node.name, dest_node.name)),
    )
    .await;

    Ok(Json(json!({"message": message})))
}

#[derive(Debug, Deserialize)]
struct UnregisterRequest {
    node_id: i64,
    vmid: u32,
    vm_type: GuestKind,
}

async fn unregister_guest(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(request): Json<UnregisterRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_operator()?;

    let node = db::nodes::get(state.database.pool(), request.node_id).await?;
    let message = state
        .proxmox
        .unregister_guest(&SshEndpoint::from(&node), request.vmid, request.vm_type)
        .await?;

    audit(&state, &auth, "vm.unregister", &request.vmid.to_string(), None).await;

    Ok(Json(json!({"message": message})))
}

async fn next_vmid(
    State(state): State<AppState>,
    Query(query): Query<NodeQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let node = db::nodes::get(state.database.pool(), query.node_id).await?;
    let vmid = state.proxmox.next_free_vmid(&SshEndpoint::from(&node)).await?;
    Ok(Json(json!({"vmid": vmid})))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/vms", get(list_guests))
        .route("/api/vms/next-id", get(next_vmid))
        .route("/api/vms/register", post(register_guest))
        .route("/api/vms/unregister", post(unregister_guest))
        .route("/api/vms/:vmid/disks", get(list_guest_disks))
}
