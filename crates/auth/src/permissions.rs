use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Permission identifier.
///
/// Permissions are opaque dotted strings (e.g. `"counting.count.submit"`).
/// The wildcard `"*"` grants everything within the tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    /// Submit blind counts and register unexpected items.
    pub const COUNT_SUBMIT: Permission = Permission::from_static("counting.count.submit");
    /// Read one's own blind assignment views.
    pub const COUNT_READ: Permission = Permission::from_static("counting.count.read");
    /// Create, schedule, activate, cancel and finalize sessions.
    pub const SESSION_MANAGE: Permission = Permission::from_static("counting.session.manage");
    /// Supervisor reconciliation: views with theoretical data, third counts, overrides.
    pub const SESSION_RECONCILE: Permission =
        Permission::from_static("counting.session.reconcile");
    /// Discrepancy reports and exports.
    pub const SESSION_REPORT: Permission = Permission::from_static("counting.session.report");
    pub const WILDCARD: Permission = Permission::from_static("*");

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == "*"
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
