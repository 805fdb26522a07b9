//! Supervisor / back-office routes.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use stocktake_auth::Permission;
use stocktake_counting::views::SessionSummary;
use stocktake_counting::{CountableItemId, CountingSession, Quantity, ReportFormat};
use stocktake_infra::counting_service::{CreateSessionRequest, ServiceResult};

use crate::app::errors;
use crate::app::routes::common::{parse_item_id, parse_session_id};
use crate::app::services::AppServices;
use crate::authz;
use crate::context::{PrincipalContext, TenantContext};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_session).get(list_sessions))
        .route("/:id", get(get_session))
        .route("/:id/schedule", post(schedule_session))
        .route("/:id/activate", post(activate_session))
        .route("/:id/third-count", post(trigger_third_count))
        .route("/:id/review", post(submit_for_review))
        .route("/:id/items/:item_id/override", post(manual_override))
        .route("/:id/cancel", post(cancel_session))
        .route("/:id/finalize", post(finalize_session))
        .route("/:id/reconciliation", get(get_reconciliation))
        .route("/:id/report", get(get_report))
        .route("/:id/export", get(export_report))
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub scheduled_start: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct ThirdCountRequest {
    pub item_ids: Vec<CountableItemId>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub quantity: Quantity,
    pub notes: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    #[serde(default)]
    pub format: Option<String>,
}

fn session_response(status: StatusCode, result: ServiceResult<CountingSession>) -> axum::response::Response {
    match result {
        Ok(session) => (status, Json(SessionSummary::of(&session))).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn create_session(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<CreateSessionRequest>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::SESSION_MANAGE) {
        return resp;
    }

    session_response(
        StatusCode::CREATED,
        services
            .counting()
            .create_session(tenant.tenant_id(), principal.principal_id(), body),
    )
}

pub async fn list_sessions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::SESSION_MANAGE) {
        return resp;
    }
    (StatusCode::OK, Json(services.sessions().list(tenant.tenant_id()))).into_response()
}

/// Summary and assignment progress, without the per-item detail.
pub async fn get_session(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::SESSION_MANAGE) {
        return resp;
    }
    let session_id = match parse_session_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.counting().reconciliation(tenant.tenant_id(), session_id) {
        Ok(view) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "summary": view.summary,
                "assignments": view.assignments,
            })),
        )
            .into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn schedule_session(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<ScheduleRequest>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::SESSION_MANAGE) {
        return resp;
    }
    let session_id = match parse_session_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    session_response(
        StatusCode::OK,
        services.counting().schedule_session(
            tenant.tenant_id(),
            session_id,
            body.scheduled_start,
            body.scheduled_end,
        ),
    )
}

pub async fn activate_session(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::SESSION_MANAGE) {
        return resp;
    }
    let session_id = match parse_session_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    session_response(
        StatusCode::OK,
        services
            .counting()
            .activate_session(tenant.tenant_id(), session_id, principal.principal_id()),
    )
}

pub async fn trigger_third_count(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<ThirdCountRequest>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::SESSION_RECONCILE) {
        return resp;
    }
    let session_id = match parse_session_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    session_response(
        StatusCode::OK,
        services.counting().trigger_third_count(
            tenant.tenant_id(),
            session_id,
            body.item_ids,
            body.deadline,
            principal.principal_id(),
        ),
    )
}

pub async fn submit_for_review(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::SESSION_RECONCILE) {
        return resp;
    }
    let session_id = match parse_session_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    session_response(
        StatusCode::OK,
        services
            .counting()
            .submit_for_review(tenant.tenant_id(), session_id, principal.principal_id()),
    )
}

pub async fn manual_override(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path((id, item_id)): Path<(String, String)>,
    Json(body): Json<OverrideRequest>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::SESSION_RECONCILE) {
        return resp;
    }
    let (session_id, item_id) = match (parse_session_id(&id), parse_item_id(&item_id)) {
        (Ok(s), Ok(i)) => (s, i),
        (Err(resp), _) | (_, Err(resp)) => return resp,
    };

    session_response(
        StatusCode::OK,
        services.counting().manual_override(
            tenant.tenant_id(),
            session_id,
            item_id,
            body.quantity,
            body.notes,
            principal.principal_id(),
        ),
    )
}

pub async fn cancel_session(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Json(body): Json<CancelRequest>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::SESSION_MANAGE) {
        return resp;
    }
    let session_id = match parse_session_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    session_response(
        StatusCode::OK,
        services.counting().cancel_session(
            tenant.tenant_id(),
            session_id,
            body.reason,
            principal.principal_id(),
        ),
    )
}

pub async fn finalize_session(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::SESSION_RECONCILE) {
        return resp;
    }
    let session_id = match parse_session_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    session_response(
        StatusCode::OK,
        services
            .counting()
            .finalize_session(tenant.tenant_id(), session_id, principal.principal_id()),
    )
}

pub async fn get_reconciliation(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::SESSION_RECONCILE) {
        return resp;
    }
    let session_id = match parse_session_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.counting().reconciliation(tenant.tenant_id(), session_id) {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn get_report(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::SESSION_REPORT) {
        return resp;
    }
    let session_id = match parse_session_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.counting().discrepancy_report(tenant.tenant_id(), session_id) {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

/// `?format=json|csv`, json when omitted.
pub async fn export_report(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> axum::response::Response {
    if let Err(resp) = authz::require(&tenant, &principal, Permission::SESSION_REPORT) {
        return resp;
    }
    let session_id = match parse_session_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let format: ReportFormat = match query.format.as_deref().unwrap_or("json").parse() {
        Ok(f) => f,
        Err(e) => return errors::service_error_to_response(e.into()),
    };

    match services
        .counting()
        .export_report(tenant.tenant_id(), session_id, format)
    {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, format.content_type())],
            bytes,
        )
            .into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
