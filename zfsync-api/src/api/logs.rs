//! Job-log and audit-log endpoints

use super::AuthUser;
use crate::db;
use crate::error::ApiResult;
use crate::AppState;
use axum::{
    extract::{Query, State},
    routing::get,
    Extension, Json, Router,
};
use serde::Deserialize;
use zfsync_common::JobLog;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

#[derive(Debug, Deserialize)]
struct LogQuery {
    job_id: Option<i64>,
    limit: Option<i64>,
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Vec<JobLog>>> {
    let logs = db::job_logs::list(
        state.database.pool(),
        query.job_id,
        clamp_limit(query.limit),
    )
    .await?;

    Ok(Json(logs))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    limit: Option<i64>,
}

async fn list_audit(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<db::audit::AuditEntry>>> {
    auth.require_admin()?;

    let entries = db::audit::list(state.database.pool(), clamp_limit(query.limit)).await?;
    Ok(Json(entries))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/logs", get(list_logs))
        .route("/api/logs/audit", get(list_audit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(50)), 50);
        assert_eq!(clamp_limit(Some(999999)), MAX_LIMIT);
    }
}
