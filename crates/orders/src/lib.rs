//! `orderflow-orders`: the pure order domain.
//!
//! Kind descriptors, the status registry, the order/line/stock/allocation
//! records with their counter invariants, audit records and reference
//! patterns. Nothing here touches storage.

pub mod kinds;
pub mod model;
pub mod reference;
pub mod registry;
pub mod status;
pub mod tracking;

pub use kinds::{
    BuildStatus, CompletionRule, DefaultAction, Edge, EdgeOrigin, KindDescriptor, LoanStatus,
    PurchaseStatus, SalesStatus, Settlement, StockFlow, descriptor,
};
pub use model::{
    Allocation, LineCounters, LineItem, MAX_REFERENCE_LEN, MAX_REFERENCE_SEQ, NewOrder, Order,
    StockStatus, StockUnit,
};
pub use reference::ReferencePattern;
pub use registry::{CustomState, ResolvedStatus, StatusRegistry};
pub use status::{Color, StateDef, StatusGroup};
pub use tracking::{Actor, TrackingCode, TrackingEntry};
