//! Snapshot listing and manual snapshot operations

use super::{audit, AuthUser};
use crate::db;
use crate::error::ApiResult;
use crate::sanoid::DEFAULT_TEMPLATES;
use crate::ssh::SshEndpoint;
use crate::zfs::ZfsSnapshot;
use crate::AppState;
use axum::{
    extract::{Query, State},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
struct SnapshotQuery {
    node_id: i64,
    dataset: Option<String>,
}

async fn list_snapshots(
    State(state): State<AppState>,
    Query(query): Query<SnapshotQuery>,
) -> ApiResult<Json<Vec<ZfsSnapshot>>> {
    let node = db::nodes::get(state.database.pool(), query.node_id).await?;
    let snapshots = state
        .zfs
        .list_snapshots(&SshEndpoint::from(&node), query.dataset.as_deref())
        .await?;

    Ok(Json(snapshots))
}

#[derive(Debug, Deserialize)]
struct CreateSnapshotRequest {
    node_id: i64,
    dataset: String,
    snapshot_name: String,
    #[serde(default)]
    recursive: bool,
}

async fn create_snapshot(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(request): Json<CreateSnapshotRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_operator()?;

    let node = db::nodes::get(state.database.pool(), request.node_id).await?;
    let full_name = format!("{}@{}", request.dataset, request.snapshot_name);

    let result = state
        .zfs
        .create_snapshot(
            &SshEndpoint::from(&node),
            &request.dataset,
            &request.snapshot_name,
            request.recursive,
        )
        .await;

    db::job_logs::record_operation(
        state.database.pool(),
        "snapshot",
        &node.name,
        &request.dataset,
        result.is_ok(),
        &match &result {
            Ok(()) => format!("Snapshot {} created", full_name),
            Err(e) => format!("Snapshot {} failed: {}", full_name, e),
        },
        Some(&auth.user_id),
    )
    .await?;
    result?;

    audit(&state, &auth, "snapshot.create", &full_name, None).await;

    Ok(Json(json!({"message": format!("Snapshot {} created", full_name)})))
}

#[derive(Debug, Deserialize)]
struct DestroySnapshotRequest {
    node_id: i64,
    full_name: String,
}

async fn destroy_snapshot(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(request): Json<DestroySnapshotRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_operator()?;

    let node = db::nodes::get(state.database.pool(), request.node_id).await?;

    let result = state
        .zfs
        .destroy_snapshot(&SshEndpoint::from(&node), &request.full_name)
        .await;

    db::job_logs::record_operation(
        state.database.pool(),
        "snapshot",
        &node.name,
        &request.full_name,
        result.is_ok(),
        &match &result {
            Ok(()) => format!("Snapshot {} destroyed", request.full_name),
            Err(e) => format!("Snapshot destroy failed: {}", e),
        },
        Some(&auth.user_id),
    )
    .await?;
    result?;

    audit(&state, &auth, "snapshot.destroy", &request.full_name, None).await;

    Ok(Json(json!({"message": format!("Snapshot {} destroyed", request.full_name)})))
}

async fn list_templates() -> Json<serde_json::Value> {
    let templates: Vec<serde_json::Value> = DEFAULT_TEMPLATES
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "hourly": t.hourly,
                "daily": t.daily,
                "weekly": t.weekly,
                "monthly": t.monthly,
                "yearly": t.yearly,
                "autosnap": t.autosnap,
                "autoprune": t.autoprune,
            })
        })
        .collect();

    Json(json!({"templates": templates}))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/snapshots", get(list_snapshots))
        .route("/api/snapshots", post(create_snapshot))
        .route("/api/snapshots/destroy", post(destroy_snapshot))
        .route("/api/sanoid-templates", get(list_templates))
}
