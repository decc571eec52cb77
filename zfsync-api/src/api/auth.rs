//! Authentication and user management
//!
//! Local users with argon2 password hashes and stateless HS256 bearer
//! tokens. Roles: admin, operator, viewer. Non-local realms (pam, pve,
//! ldap, ad) are validated against the auth node's Proxmox API and get a
//! linked local account on first login.

use super::{audit, AuthUser};
use crate::db;
use crate::error::{ApiError, ApiResult};
use crate::AppState;
use tracing::info;
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::{
    extract::{Path, State},
    routing::{delete, get, post, put},
    Extension, Json, Router,
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use zfsync_common::User;

/// JWT claims
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub role: String,
    pub exp: usize,
    pub iat: usize,
}

pub fn hash_password(password: &str) -> ApiResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::internal(format!("Failed to hash password: {}", e)))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

pub fn issue_token(secret: &str, user: &User, expire_minutes: i64) -> ApiResult<String> {
    let now = Utc::now().timestamp() as usize;
    let claims = Claims {
        sub: user.id.clone(),
        username: user.username.clone(),
        role: user.role.clone(),
        exp: now + (expire_minutes as usize) * 60,
        iat: now,
    };

    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::internal(format!("Failed to issue token: {}", e)))
}

pub fn validate_token(secret: &str, token: &str) -> Result<Claims, String> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| format!("Token validation failed: {}", e))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
    #[serde(default)]
    realm: Option<String>,
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let realm = request.realm.as_deref().unwrap_or("local");

    let user = if realm == "local" {
        login_local(&state, &request.username, &request.password).await?
    } else {
        login_proxmox(&state, &request.username, &request.password, realm).await?
    };

    let token = issue_token(&state.jwt_secret, &user, state.config.auth.token_expire_minutes)?;

    Ok(Json(json!({
        "access_token": token,
        "token_type": "bearer",
        "user": user,
    })))
}

async fn login_local(state: &AppState, username: &str, password: &str) -> ApiResult<User> {
    let user = db::users::get_by_username(state.database.pool(), username)
        .await
        .map_err(|_| ApiError::unauthorized())?;

    if !verify_password(password, &user.password_hash) {
        return Err(ApiError::unauthorized());
    }

    if !user.enabled {
        return Err(ApiError::forbidden("Account is disabled"));
    }

    Ok(user)
}

/// Validate non-local credentials against the auth node's Proxmox API
/// and return the linked local account, creating it on first login.
async fn login_proxmox(
    state: &AppState,
    username: &str,
    password: &str,
    realm: &str,
) -> ApiResult<User> {
    let pool = state.database.pool();

    let auth_method = db::system::get(pool, "auth_method")
        .await?
        .unwrap_or_else(|| "local".to_string());
    if auth_method == "local" {
        return Err(ApiError::bad_request(
            "Proxmox realm login is disabled (auth_method = local)",
        ));
    }

    let auth_node = db::nodes::get_auth_node(pool)
        .await?
        .ok_or_else(|| ApiError::bad_request("No auth node configured"))?;

    let pve_user = state
        .proxmox_auth
        .authenticate(&auth_node, username, password, realm)
        .await?;

    match db::users::get_by_username(pool, username).await {
        Ok(user) => {
            if user.realm != realm {
                return Err(ApiError::bad_request(format!(
                    "Username '{}' belongs to realm '{}'",
                    username, user.realm
                )));
            }
            if !user.enabled {
                return Err(ApiError::forbidden("Account is disabled"));
            }
            Ok(user)
        }
        Err(_) => {
            let user = User {
                id: uuid::Uuid::new_v4().to_string(),
                username: pve_user.username.clone(),
                // No local password; this account always authenticates
                // against the hypervisor API
                password_hash: "!".to_string(),
                email: pve_user.email.clone(),
                role: if pve_user.is_admin {
                    "admin".to_string()
                } else {
                    "operator".to_string()
                },
                realm: realm.to_string(),
                enabled: true,
                created_at: Utc::now(),
            };

            db::users::create(pool, &user).await?;
            info!("Linked Proxmox user {} as role {}", pve_user.userid, user.role);
            Ok(user)
        }
    }
}

/// Authentication realms available to the login form: local accounts
/// plus whatever the auth node advertises.
async fn list_realms(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let mut realms = vec![json!({
        "realm": "local",
        "type": "local",
        "comment": "Local accounts",
        "default": true,
    })];

    if let Some(auth_node) = db::nodes::get_auth_node(state.database.pool()).await? {
        for realm in state.proxmox_auth.available_realms(&auth_node).await {
            realms.push(serde_json::to_value(&realm).unwrap_or(serde_json::Value::Null));
        }
    }

    Ok(Json(json!({"realms": realms})))
}

async fn me(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<Json<User>> {
    let user = db::users::get(state.database.pool(), &auth.user_id).await?;
    Ok(Json(user))
}

#[derive(Debug, Deserialize)]
struct UserDraft {
    username: String,
    password: Option<String>,
    email: Option<String>,
    #[serde(default = "default_role")]
    role: String,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_role() -> String {
    "viewer".to_string()
}

fn default_true() -> bool {
    true
}

fn validate_role(role: &str) -> ApiResult<()> {
    match role {
        "admin" | "operator" | "viewer" => Ok(()),
        other => Err(ApiError::bad_request(format!("Unknown role '{}'", other))),
    }
}

async fn list_users(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
) -> ApiResult<Json<Vec<User>>> {
    auth.require_admin()?;
    Ok(Json(db::users::list(state.database.pool()).await?))
}

async fn create_user(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Json(draft): Json<UserDraft>,
) -> ApiResult<Json<User>> {
    auth.require_admin()?;
    validate_role(&draft.role)?;

    let password = draft
        .password
        .as_deref()
        .ok_or_else(|| ApiError::bad_request("Password is required"))?;

    let user = User {
        id: uuid::Uuid::new_v4().to_string(),
        username: draft.username,
        password_hash: hash_password(password)?,
        email: draft.email,
        role: draft.role,
        realm: "local".to_string(),
        enabled: draft.enabled,
        created_at: Utc::now(),
    };

    db::users::create(state.database.pool(), &user).await?;
    audit(&state, &auth, "user.create", &user.username, None).await;

    Ok(Json(user))
}

async fn update_user(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
    Json(draft): Json<UserDraft>,
) -> ApiResult<Json<User>> {
    auth.require_admin()?;
    validate_role(&draft.role)?;

    let mut user = db::users::get(state.database.pool(), &id).await?;
    user.username = draft.username;
    user.email = draft.email;
    user.role = draft.role;
    user.enabled = draft.enabled;
    if let Some(password) = draft.password.as_deref() {
        user.password_hash = hash_password(password)?;
    }

    db::users::update(state.database.pool(), &user).await?;
    audit(&state, &auth, "user.update", &user.username, None).await;

    Ok(Json(user))
}

async fn delete_user(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_admin()?;

    if id == auth.user_id {
        return Err(ApiError::bad_request("Cannot delete your own account"));
    }

    db::users::delete(state.database.pool(), &id).await?;
    audit(&state, &auth, "user.delete", &id, None).await;

    Ok(Json(json!({"message": "User deleted"})))
}

pub fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/realms", get(list_realms))
}

pub fn protected_routes() -> Router<AppState> {
    Router::new()
        .route("/api/auth/me", get(me))
        .route("/api/auth/users", get(list_users))
        .route("/api/auth/users", post(create_user))
        .route("/api/auth/users/:id", put(update_user))
        .route("/api/auth/users/:id", delete(delete_user))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_roundtrip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
        assert!(!verify_password("hunter2", "not-a-hash"));
    }

    #[test]
    fn test_token_roundtrip() {
        let user = User {
            id: "u1".to_string(),
            username: "admin".to_string(),
            password_hash: String::new(),
            email: None,
            role: "admin".to_string(),
            realm: "local".to_string(),
            enabled: true,
            created_at: Utc::now(),
        };

        let token = issue_token("secret", &user, 60).unwrap();
        let claims = validate_token("secret", &token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.role, "admin");

        // Wrong key is rejected
        assert!(validate_token("other-secret", &token).is_err());
    }

    #[test]
    fn test_expired_token_rejected() {
        let user = User {
            id: "u1".to_string(),
            username: "admin".to_string(),
            password_hash: String::new(),
            email: None,
            role: "admin".to_string(),
            realm: "local".to_string(),
            enabled: true,
            created_at: Utc::now(),
        };

        let token = issue_token("secret", &user, -120).unwrap();
        assert!(validate_token("secret", &token).is_err());
    }

    #[test]
    fn test_validate_role() {
        assert!(validate_role("admin").is_ok());
        assert!(validate_role("operator").is_ok());
        assert!(validate_role("viewer").is_ok());
        assert!(validate_role("root").is_err());
    }
}
