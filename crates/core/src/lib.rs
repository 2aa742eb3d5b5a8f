//! `orderflow-core`: shared building blocks for the order engine.
//!
//! Identifiers, the order-kind discriminator, fixed-point quantities and the
//! error taxonomy every other crate reports through. No storage concerns live here.

pub mod entity;
pub mod error;
pub mod id;
pub mod kind;
pub mod quantity;

pub use entity::Entity;
pub use error::{LineShortfall, OrderError, OrderResult, QuantityLimit};
pub use id::{
    AllocationId, CatalogItemId, LineItemId, OrderId, StockUnitId, TrackingEntryId, UserId,
};
pub use kind::{OrderKind, StatusCode};
pub use quantity::Quantity;
