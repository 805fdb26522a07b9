//! Counter-facing (blind) routes.
//!
//! Every response here is built from the counter view types, which carry no
//! theoretical quantity and no other counter's entries.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use stocktake_auth::Permission;
use stocktake_counting::Quantity;
use stocktake_infra::counting_service::UnexpectedItemRequest;

use crate::app::errors;
use crate::app::routes::common::{parse_item_id, parse_session_id};
use crate::app::services::AppServices;
use crate::authz;
use crate::context::{PrincipalContext, TenantContext};

pub fn router() -> Router {
    Router::new()
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/items/:item_id", get(get_item))
        .route("/sessions/:id/items/:item_id/count", post(submit_count))
        .route("/sessions/:id/barcode/:code", get(lookup_barcode))
        .route("/sessions/:id/unexpected-items", post(register_unexpected_item))
}

#[derive(Debug, Deserialize)]
pub struct SubmitCountRequest {
    pub quantity: Quantity,
    #[serde(default)]
    pub notes: Option<String>,
}

pub async fn get_session(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::COUNT_READ) {
        return resp;
    }
    let session_id = match parse_session_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services
        .counting()
        .counter_session(tenant.tenant_id(), session_id, principal.principal_id())
    {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn get_item(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path((id, item_id)): Path<(String, String)>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::COUNT_READ) {
        return resp;
    }
    let (session_id, item_id) = match (parse_session_id(&id), parse_item_id(&item_id)) {
        (Ok(s), Ok(i)) => (s, i),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };

    match services.counting().counter_item(
        tenant.tenant_id(),
        session_id,
        item_id,
        principal.principal_id(),
    ) {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn submit_count(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path((id, item_id)): Path<(String, String)>,
    Json(body): Json<SubmitCountRequest>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::COUNT_SUBMIT) {
        return resp;
    }
    let (session_id, item_id) = match (parse_session_id(&id), parse_item_id(&item_id)) {
        (Ok(s), Ok(i)) => (s, i),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };

    match services.counting().submit_count(
        tenant.tenant_id(),
        session_id,
        principal.principal_id(),
        item_id,
        body.quantity,
        body.notes,
    ) {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn lookup_barcode(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path((id, code)): Path<(String, String)>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::COUNT_READ) {
        return resp;
    }
    let session_id = match parse_session_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.counting().lookup_barcode(
        tenant.tenant_id(),
        session_id,
        principal.principal_id(),
        &code,
    ) {
        Ok(hit) => (StatusCode::OK, Json(hit)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn register_unexpected_item(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<UnexpectedItemRequest>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::COUNT_SUBMIT) {
        return resp;
    }
    let session_id = match parse_session_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.counting().register_unexpected_item(
        tenant.tenant_id(),
        session_id,
        principal.principal_id(),
        body,
    ) {
        Ok(view) => (StatusCode::CREATED, Json(view)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
