//! Node and dataset management endpoints

use super::{audit, AuthUser};
use crate::db::{self, datasets::PolicyUpdate, nodes::NodeDraft};
use crate::error::ApiResult;
use crate::sanoid;
use crate::ssh::SshEndpoint;
use crate::AppState;
use axum::{
    extract::{Path, State},
    routing::{delete, get, post, put},
    Extension, Json, Router,
};
use serde_json::json;
use zfsync_common::{Dataset, Node};

async fn list_nodes(State(state): State<AppState>) -> ApiResult<Json<Vec<Node>>> {
    Ok(Json(db::nodes::list(state.database.pool()).await?))
}

async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Node>> {
    Ok(Json(db::nodes::get(state.database.pool(), id).await?))
}

async fn create_node(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(draft): Json<NodeDraft>,
) -> ApiResult<Json<Node>> {
    auth.require_admin()?;

    let node = db::nodes::create(state.database.pool(), &draft).await?;
    audit(&state, &auth, "node.create", &node.name, None).await;

    Ok(Json(node))
}

async fn update_node(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<i64>,
    Json(draft): Json<NodeDraft>,
) -> ApiResult<Json<Node>> {
    auth.require_admin()?;

    let node = db::nodes::update(state.database.pool(), id, &draft).await?;
    audit(&state, &auth, "node.update", &node.name, None).await;

    Ok(Json(node))
}

async fn delete_node(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_admin()?;

    db::nodes::delete(state.database.pool(), id).await?;
    audit(&state, &auth, "node.delete", &id.to_string(), None).await;

    Ok(Json(json!({"message": "Node deleted"})))
}

/// Connectivity probe plus replication-tool check; the result is cached
/// on the node row.
async fn test_node(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_operator()?;

    let node = db::nodes::get(state.database.pool(), id).await?;
    let endpoint = SshEndpoint::from(&node);

    let (online, detail) = state.ssh.test_connection(&endpoint).await;
    let (syncoid_installed, syncoid_version) = if online {
        state.ssh.check_syncoid(&endpoint).await
    } else {
        (false, None)
    };

    db::nodes::update_probe_state(
        state.database.pool(),
        id,
        online,
        syncoid_installed,
        syncoid_version.as_deref(),
    )
    .await?;

    Ok(Json(json!({
        "online": online,
        "detail": detail,
        "syncoid_installed": syncoid_installed,
        "syncoid_version": syncoid_version,
    })))
}

async fn list_datasets(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<Dataset>>> {
    Ok(Json(db::datasets::list_for_node(state.database.pool(), id).await?))
}

/// Re-read the node's datasets over SSH and refresh the cache.
async fn refresh_datasets(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<Dataset>>> {
    auth.require_operator()?;

    let node = db::nodes::get(state.database.pool(), id).await?;
    let endpoint = SshEndpoint::from(&node);

    let listing = state.zfs.list_datasets(&endpoint).await?;
    let rows: Vec<db::datasets::DatasetRow> = listing
        .into_iter()
        .map(|ds| db::datasets::DatasetRow {
            name: ds.name,
            used: Some(ds.used),
            available: Some(ds.available),
            mountpoint: ds.mountpoint,
        })
        .collect();

    db::datasets::refresh_for_node(state.database.pool(), id, &rows).await?;

    Ok(Json(db::datasets::list_for_node(state.database.pool(), id).await?))
}

#[derive(Debug, serde::Deserialize)]
struct CreateDatasetRequest {
    name: String,
    #[serde(default)]
    parents: bool,
}

/// Create a dataset on the node, typically a replication target parent.
async fn create_dataset(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<i64>,
    Json(request): Json<CreateDatasetRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_operator()?;

    let node = db::nodes::get(state.database.pool(), id).await?;
    let endpoint = SshEndpoint::from(&node);

    if state.zfs.dataset_exists(&endpoint, &request.name).await {
        return Err(crate::error::ApiError::conflict(format!(
            "Dataset {} already exists",
            request.name
        )));
    }

    state
        .zfs
        .create_dataset(&endpoint, &request.name, request.parents)
        .await?;
    audit(&state, &auth, "dataset.create", &request.name, None).await;

    Ok(Json(json!({"message": format!("Dataset {} created", request.name)})))
}

#[derive(Debug, serde::Deserialize)]
struct RunSanoidRequest {
    #[serde(default)]
    cron: bool,
    #[serde(default)]
    prune: bool,
}

/// Trigger a manual sanoid run on the node.
async fn run_sanoid(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<i64>,
    Json(request): Json<RunSanoidRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_operator()?;

    let node = db::nodes::get(state.database.pool(), id).await?;
    let output = state
        .sanoid
        .run_sanoid(&SshEndpoint::from(&node), request.cron, request.prune)
        .await?;

    audit(&state, &auth, "sanoid.run", &node.name, None).await;

    Ok(Json(json!({"output": output})))
}

async fn update_dataset_policy(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<i64>,
    Json(policy): Json<PolicyUpdate>,
) -> ApiResult<Json<Dataset>> {
    auth.require_operator()?;

    let dataset = db::datasets::update_policy(state.database.pool(), id, &policy).await?;
    audit(&state, &auth, "dataset.policy", &dataset.name, None).await;

    Ok(Json(dataset))
}

async fn get_sanoid_status(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<crate::sanoid::SanoidStatus>> {
    let node = db::nodes::get(state.database.pool(), id).await?;
    let status = state.sanoid.get_status(&SshEndpoint::from(&node)).await;

    Ok(Json(status))
}

async fn get_sanoid_config(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let node = db::nodes::get(state.database.pool(), id).await?;
    let config = state.sanoid.get_config(&SshEndpoint::from(&node)).await?;

    Ok(Json(json!({"config": config})))
}

/// Render the stored retention policies into sanoid.conf and push it to
/// the node.
async fn apply_sanoid_config(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_operator()?;

    let node = db::nodes::get(state.database.pool(), id).await?;
    let datasets = db::datasets::list_for_node(state.database.pool(), id).await?;

    let config = sanoid::generate_config(&datasets);
    state.sanoid.set_config(&SshEndpoint::from(&node), &config).await?;

    audit(&state, &auth, "sanoid.apply", &node.name, None).await;

    Ok(Json(json!({"message": "Sanoid configuration applied"})))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes", post(create_node))
        .route("/api/nodes/:id", get(get_node))
        .route("/api/nodes/:id", put(update_node))
        .route("/api/nodes/:id", delete(delete_node))
        .route("/api/nodes/:id/test", post(test_node))
        .route("/api/nodes/:id/datasets", get(list_datasets))
        .route("/api/nodes/:id/datasets", post(create_dataset))
        .route("/api/nodes/:id/datasets/refresh", post(refresh_datasets))
        .route("/api/nodes/:id/sanoid/status", get(get_sanoid_status))
        .route("/api/nodes/:id/sanoid/config", get(get_sanoid_config))
        .route("/api/nodes/:id/sanoid/apply", post(apply_sanoid_config))
        .route("/api/nodes/:id/sanoid/run", post(run_sanoid))
        .route("/api/datasets/:id/policy", put(update_dataset_policy))
}
