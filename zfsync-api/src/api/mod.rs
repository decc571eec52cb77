//! HTTP facade
//!
//! Thin axum layer over the core services: guards access, mutates the
//! store, re-arms the scheduler on job changes. Bearer-token
//! authentication with three roles enforced uniformly; every error body
//! is `{"detail": ...}`.

pub mod auth;
pub mod jobs;
pub mod logs;
pub mod nodes;
pub mod settings;
pub mod snapshots;
pub mod vms;

use crate::error::{ApiError, ApiResult};
use crate::AppState;
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::{self as axum_middleware, Next},
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tracing::warn;

/// Authenticated caller, inserted into request extensions by the
/// middleware.
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
    pub role: String,
}

impl AuthUser {
    /// admin > operator > viewer
    fn rank(role: &str) -> u8 {
        match role {
            "admin" => 3,
            "operator" => 2,
            "viewer" => 1,
            _ => 0,
        }
    }

    pub fn require_admin(&self) -> ApiResult<()> {
        self.require("admin")
    }

    pub fn require_operator(&self) -> ApiResult<()> {
        self.require("operator")
    }

    fn require(&self, role: &str) -> ApiResult<()> {
        if Self::rank(&self.role) >= Self::rank(role) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!(
                "Role '{}' required",
                role
            )))
        }
    }
}

/// Bearer-token authentication middleware.
pub async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .ok_or_else(ApiError::unauthorized)?;

    let claims = auth::validate_token(&state.jwt_secret, token)
        .map_err(|_| ApiError::unauthorized())?;

    request.extensions_mut().insert(AuthUser {
        user_id: claims.sub,
        username: claims.username,
        role: claims.role,
    });

    Ok(next.run(request).await)
}

/// Record an operator action; failures only warn.
pub async fn audit(state: &AppState, user: &AuthUser, action: &str, resource: &str, details: Option<&str>) {
    if let Err(e) = crate::db::audit::log(
        state.database.pool(),
        Some(&user.user_id),
        Some(&user.username),
        action,
        resource,
        details,
        None,
    )
    .await
    {
        warn!("Failed to write audit log: {}", e);
    }
}

async fn health_check(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    state.database.health_check().await?;
    Ok(Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "auth_enabled": true,
    })))
}

async fn setup_required(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let count = crate::db::users::count(state.database.pool()).await?;
    Ok(Json(json!({ "setup_required": count == 0 })))
}

/// Assemble the full `/api` router.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .merge(auth::protected_routes())
        .merge(nodes::routes())
        .merge(snapshots::routes())
        .merge(jobs::routes())
        .merge(vms::routes())
        .merge(logs::routes())
        .merge(settings::routes())
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/setup-required", get(setup_required))
        .merge(auth::public_routes())
        .merge(protected)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(role: &str) -> AuthUser {
        AuthUser {
            user_id: "u1".to_string(),
            username: "someone".to_string(),
            role: role.to_string(),
        }
    }

    #[test]
    fn test_role_hierarchy() {
        assert!(user("admin").require_admin().is_ok());
        assert!(user("admin").require_operator().is_ok());

        assert!(user("operator").require_admin().is_err());
        assert!(user("operator").require_operator().is_ok());

        assert!(user("viewer").require_operator().is_err());
        assert!(user("viewer").require_admin().is_err());

        assert!(user("banana").require_operator().is_err());
    }
}
