//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**: two value
/// objects with the same attributes are the same value. To "modify" one,
/// build a new one.
///
/// - **Value Object**: a submitted count entry, a scope definition
/// - **Entity**: a countable item (it has an id and evolves)
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
