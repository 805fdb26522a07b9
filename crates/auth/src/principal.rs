use serde::{Deserialize, Serialize};

use stocktake_core::{TenantId, UserId};

use crate::{Permission, Role};

/// Identity of an authenticated principal.
///
/// Counters and supervisors act in the counting domain as plain users, so the
/// token subject is the same identifier the session records as `counted_by`.
pub type PrincipalId = UserId;

/// A principal's membership in a tenant.
///
/// States *which tenant* the principal acts within and which roles and
/// permissions are granted there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantMembership {
    pub tenant_id: TenantId,
    pub roles: Vec<Role>,
    pub permissions: Vec<Permission>,
}

impl TenantMembership {
    /// Membership whose permissions are derived from the role mapping.
    pub fn from_roles(tenant_id: TenantId, roles: Vec<Role>) -> Self {
        let permissions = crate::permissions_for_roles(&roles);
        Self {
            tenant_id,
            roles,
            permissions,
        }
    }
}
