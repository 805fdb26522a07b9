//! API-side permission guard.
//!
//! Checked before a handler touches the counting service; the domain and
//! infra layers stay auth-agnostic.

use axum::http::StatusCode;
use axum::response::Response;

use stocktake_auth::{AuthzError, Permission, Principal, authorize};

use crate::app::errors;
use crate::context::{PrincipalContext, TenantContext};

/// Check one permission in the current request context.
pub fn authorize_request(
    tenant: &TenantContext,
    principal: &PrincipalContext,
    permission: &Permission,
) -> Result<(), AuthzError> {
    let principal = Principal::from_roles(
        principal.principal_id(),
        tenant.tenant_id(),
        principal.roles().to_vec(),
    );
    authorize(&principal, permission)
}

/// [`authorize_request`] mapped to the API's 403 body.
pub fn require(
    tenant: &TenantContext,
    principal: &PrincipalContext,
    permission: Permission,
) -> Result<(), Response> {
    authorize_request(tenant, principal, &permission)
        .map_err(|e| errors::json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string()))
}
