//! Error taxonomy shared by the ledger, transition controller and generator.
//!
//! Every variant carries the structured context a caller needs to render its
//! own message (order reference, requested quantity, current state). The
//! `Display` strings are for logs.

use core::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::id::{LineItemId, OrderId, StockUnitId};
use crate::kind::{OrderKind, StatusCode};
use crate::quantity::Quantity;

/// One line item that keeps an order from completing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineShortfall {
    pub line: LineItemId,
    pub required: Quantity,
    pub satisfied: Quantity,
}

/// Which bound a quantity mutation ran into.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantityLimit {
    /// Reservations plus returns may not exceed the line's required quantity.
    LineRequired,
    /// Fulfilment may not exceed what is reserved on the line.
    LineAllocated,
    /// Settlement may not exceed what has been fulfilled on the line.
    LineFulfilled,
    /// Release/fulfil may not exceed the unfulfilled part of an allocation.
    AllocationUnfulfilled,
    /// Serialized units move exactly one at a time.
    SerializedUnit,
}

impl fmt::Display for QuantityLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QuantityLimit::LineRequired => "line required quantity",
            QuantityLimit::LineAllocated => "line allocated quantity",
            QuantityLimit::LineFulfilled => "line fulfilled quantity",
            QuantityLimit::AllocationUnfulfilled => "unfulfilled allocation quantity",
            QuantityLimit::SerializedUnit => "serialized unit quantity",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by every mutating operation of the engine.
///
/// Any error leaves all touched rows in their pre-call state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    /// An allocation (or over-return) would exceed what the stock unit can cover.
    #[error("insufficient stock on unit {stock_unit}: requested {requested}, available {available}")]
    InsufficientStock {
        stock_unit: StockUnitId,
        requested: Quantity,
        available: Quantity,
    },

    /// The target status is not reachable from the order's current status.
    #[error("order {reference}: cannot move from status {current} to {target}")]
    InvalidTransition {
        order: OrderId,
        reference: String,
        current: StatusCode,
        target: StatusCode,
    },

    /// Completion was requested while some lines are unsatisfied.
    #[error("order {reference} cannot complete: {count} line(s) unsatisfied", count = .lines.len())]
    IncompleteOrder {
        order: OrderId,
        reference: String,
        lines: Vec<LineShortfall>,
    },

    /// The reference generator exhausted its retry budget.
    #[error("no unique {kind} reference after {attempts} attempt(s), last tried '{last_candidate}'")]
    ReferenceConflict {
        kind: OrderKind,
        last_candidate: String,
        attempts: u32,
    },

    /// A row lock could not be acquired within the configured wait.
    #[error("{resource} is busy, retry later")]
    Busy { resource: String },

    /// A counter mutation would break a line or allocation bound.
    #[error("requested {requested} exceeds {limit} (allowed {allowed})")]
    QuantityExceeded {
        limit: QuantityLimit,
        requested: Quantity,
        allowed: Quantity,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("storage failure: {0}")]
    Storage(String),
}

impl OrderError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn busy(resource: impl Into<String>) -> Self {
        Self::Busy {
            resource: resource.into(),
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn exceeded(limit: QuantityLimit, requested: Quantity, allowed: Quantity) -> Self {
        Self::QuantityExceeded {
            limit,
            requested,
            allowed,
        }
    }

    /// `true` for conditions a caller may simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrderError::Busy { .. })
    }
}

pub type OrderResult<T> = Result<T, OrderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_order_message_counts_lines() {
        let err = OrderError::IncompleteOrder {
            order: OrderId::new(),
            reference: "LO-0001".into(),
            lines: vec![
                LineShortfall {
                    line: LineItemId::new(),
                    required: Quantity::from(2),
                    satisfied: Quantity::ZERO,
                };
                2
            ],
        };
        assert_eq!(
            err.to_string(),
            "order LO-0001 cannot complete: 2 line(s) unsatisfied"
        );
    }

    #[test]
    fn only_busy_is_retryable() {
        assert!(OrderError::busy("order LO-0001").is_retryable());
        assert!(!OrderError::validation("nope").is_retryable());
    }
}
