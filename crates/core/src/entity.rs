//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Child records of an aggregate (for example the countable items of a
/// counting session) are entities: they keep their identity while their
/// attributes change.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
