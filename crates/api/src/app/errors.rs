use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use stocktake_core::DomainError;
use stocktake_counting::{CountingError, ReportError};
use stocktake_infra::command_dispatcher::DispatchError;
use stocktake_infra::counting_service::ServiceError;

pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    match err {
        ServiceError::Dispatch(e) => dispatch_error_to_response(e),
        ServiceError::Report(ReportError::UnsupportedFormat(f)) => json_error(
            StatusCode::BAD_REQUEST,
            "unsupported_format",
            format!("unsupported report format: {f}"),
        ),
        ServiceError::Report(e) => {
            tracing::error!(error = %e, "report export failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "report_error", e.to_string())
        }
    }
}

pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    match err {
        DispatchError::Counting(e) => counting_error_to_response(e),
        DispatchError::Concurrency(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        DispatchError::TenantIsolation(msg) => {
            json_error(StatusCode::FORBIDDEN, "tenant_isolation", msg)
        }
        DispatchError::Deserialize(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "deserialize_error", msg)
        }
        DispatchError::Store(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            e.to_string(),
        ),
        DispatchError::Publish(msg) => json_error(StatusCode::BAD_GATEWAY, "publish_error", msg),
    }
}

pub fn counting_error_status(err: &CountingError) -> StatusCode {
    match err {
        CountingError::InvalidScope(_)
        | CountingError::SequentialModeRequired
        | CountingError::InvalidQuantity(_)
        | CountingError::Validation(_) => StatusCode::BAD_REQUEST,
        CountingError::Unauthorized => StatusCode::FORBIDDEN,
        CountingError::NotFound | CountingError::ItemNotInScope(_) => StatusCode::NOT_FOUND,
        CountingError::InvalidStateTransition { .. }
        | CountingError::SessionCancelled
        | CountingError::SessionFinalized
        | CountingError::EntryLocked(_) => StatusCode::CONFLICT,
        CountingError::UnresolvedItems(_) | CountingError::ManualOverrideRequiresNotes => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        CountingError::Domain(d) => match d {
            DomainError::Validation(_) | DomainError::InvalidId(_) => StatusCode::BAD_REQUEST,
            DomainError::NotFound => StatusCode::NOT_FOUND,
            DomainError::Conflict(_) => StatusCode::CONFLICT,
            DomainError::InvariantViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        },
    }
}

pub fn counting_error_to_response(err: CountingError) -> axum::response::Response {
    let status = counting_error_status(&err);
    if let CountingError::UnresolvedItems(ids) = &err {
        return (
            status,
            axum::Json(json!({
                "error": err.code(),
                "message": err.to_string(),
                "unresolved_item_ids": ids,
            })),
        )
            .into_response();
    }
    json_error(status, err.code(), err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn invalid_id(what: &str) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("invalid {what} id"))
}
