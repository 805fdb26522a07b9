//! Strongly-typed identifiers used across the domain.

/// Declare a `Uuid`-backed identifier newtype.
///
/// The generated type is `Copy`, ordered (so resolved sets can be kept in a
/// deterministic order), serde-transparent, and parses from its string form
/// with a `DomainError::InvalidId` on failure.
///
/// ```ignore
/// stocktake_core::uuid_newtype!(
///     /// Identifier of a stock location.
///     LocationId, "LocationId"
/// );
/// ```
#[macro_export]
macro_rules! uuid_newtype {
    ($(#[$meta:meta])* $t:ident, $name:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $t($crate::__reexport::uuid::Uuid);

        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self($crate::__reexport::uuid::Uuid::now_v7())
            }

            pub fn from_uuid(uuid: $crate::__reexport::uuid::Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &$crate::__reexport::uuid::Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<$crate::__reexport::uuid::Uuid> for $t {
            fn from(value: $crate::__reexport::uuid::Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for $crate::__reexport::uuid::Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl core::str::FromStr for $t {
            type Err = $crate::DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = <$crate::__reexport::uuid::Uuid as core::str::FromStr>::from_str(s)
                    .map_err(|e| $crate::DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

uuid_newtype!(
    /// Identifier of a tenant (multi-tenant boundary).
    TenantId,
    "TenantId"
);

uuid_newtype!(
    /// Identifier of a user (actor identity: counters, supervisors).
    UserId,
    "UserId"
);

uuid_newtype!(
    /// Identifier of an aggregate root.
    AggregateId,
    "AggregateId"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_display_form_back() {
        let id = UserId::new();
        let parsed: UserId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn invalid_id_names_the_type() {
        let err = "not-a-uuid".parse::<TenantId>().unwrap_err();
        assert!(err.to_string().contains("TenantId"));
    }
}
