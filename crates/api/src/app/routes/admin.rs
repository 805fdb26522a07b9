use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use stocktake_auth::Permission;

use crate::app::errors;
use crate::app::services::AppServices;
use crate::authz;
use crate::context::{PrincipalContext, TenantContext};

pub fn router() -> Router {
    Router::new().route("/projections/sessions/rebuild", post(rebuild_sessions))
}

/// Replay the tenant's session streams into the session list.
pub async fn rebuild_sessions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::SESSION_MANAGE) {
        return resp;
    }

    match services.rebuild_sessions_projection(tenant.tenant_id()) {
        Ok(replayed) => (
            StatusCode::OK,
            Json(serde_json::json!({ "events_replayed": replayed })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(tenant_id = %tenant.tenant_id(), error = %e, "session list rebuild failed");
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "rebuild_failed", e.to_string())
        }
    }
}
