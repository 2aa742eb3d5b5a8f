//! Entity trait: records addressed by a stable identifier.

/// Anything a store keeps in a table keyed by its own id.
pub trait Entity {
    /// Strongly-typed row identifier.
    type Id: Copy + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the row identifier.
    fn id(&self) -> Self::Id;
}
