//! System configuration, notification settings and SSH key material

use super::{audit, AuthUser};
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use zfsync_common::NotificationSettings;

async fn list_system_config(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_admin()?;

    let entries = db::system::list(state.database.pool()).await?;
    let masked: Vec<serde_json::Value> = entries
        .iter()
        .map(|entry| {
            json!({
                "key": entry.key,
                "value": if entry.is_secret { "********" } else { entry.value.as_str() },
                "value_type": entry.value_type,
                "category": entry.category,
                "is_secret": entry.is_secret,
            })
        })
        .collect();

    Ok(Json(json!({"config": masked})))
}

#[derive(Debug, Deserialize)]
struct ConfigValue {
    value: String,
}

async fn set_system_config(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(key): Path<String>,
    Json(body): Json<ConfigValue>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_admin()?;

    db::system::set(state.database.pool(), &key, &body.value).await?;
    audit(&state, &auth, "settings.update", &key, None).await;

    Ok(Json(json!({"message": format!("Setting '{}' updated", key)})))
}

async fn get_notification_settings(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<Json<NotificationSettings>> {
    auth.require_admin()?;
    Ok(Json(db::notifications::get(state.database.pool()).await?))
}

async fn update_notification_settings(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(settings): Json<NotificationSettings>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_admin()?;

    db::notifications::update(state.database.pool(), &settings).await?;
    audit(&state, &auth, "settings.notifications", "", None).await;

    Ok(Json(json!({"message": "Notification settings updated"})))
}

async fn test_notifications(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_admin()?;
    Ok(Json(state.notifier.send_test().await?))
}

#[derive(Debug, Deserialize)]
struct KeyQuery {
    /// Private key path; the matching .pub is read
    path: Option<String>,
}

/// Read the control-plane host's public key for distribution by the
/// operator.
async fn get_public_key(
    State(_state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<KeyQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_admin()?;

    let key_path = query.path.as_deref().unwrap_or("/root/.ssh/id_rsa");
    let pub_path = format!("{}.pub", key_path);

    let public_key = tokio::fs::read_to_string(&pub_path)
        .await
        .map_err(|_| ApiError::not_found(format!("Public key {}", pub_path)))?;

    Ok(Json(json!({
        "path": pub_path,
        "public_key": public_key.trim(),
    })))
}

#[derive(Debug, Deserialize)]
struct GenerateKeyRequest {
    path: String,
    #[serde(default)]
    comment: Option<String>,
}

/// Generate an ed25519 keypair on the control-plane host. Refuses to
/// overwrite existing key material.
async fn generate_keypair(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(request): Json<GenerateKeyRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_admin()?;

    if tokio::fs::metadata(&request.path).await.is_ok() {
        return Err(ApiError::conflict(format!(
            "Key {} already exists",
            request.path
        )));
    }

    if let Some(parent) = std::path::Path::new(&request.path).parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ApiError::internal(format!("Failed to create key directory: {}", e)))?;
    }

    let comment = request.comment.as_deref().unwrap_or("zfsync");
    let output = tokio::process::Command::new("ssh-keygen")
        .args(["-t", "ed25519", "-N", "", "-C", comment, "-f", &request.path])
        .output()
        .await
        .map_err(|e| ApiError::internal(format!("Failed to run ssh-keygen: {}", e)))?;

    if !output.status.success() {
        return Err(ApiError::internal(format!(
            "ssh-keygen failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let public_key = tokio::fs::read_to_string(format!("{}.pub", request.path))
        .await
        .map_err(|e| ApiError::internal(format!("Failed to read generated key: {}", e)))?;

    audit(&state, &auth, "ssh_key.generate", &request.path, None).await;

    Ok(Json(json!({
        "path": request.path,
        "public_key": public_key.trim(),
    })))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/settings/system", get(list_system_config))
        .route("/api/settings/system/:key", put(set_system_config))
        .route("/api/settings/notifications", get(get_notification_settings))
        .route("/api/settings/notifications", put(update_notification_settings))
        .route("/api/settings/notifications/test", post(test_notifications))
        .route("/api/settings/ssh-key", get(get_public_key))
        .route("/api/settings/ssh-key/generate", post(generate_keypair))
}
