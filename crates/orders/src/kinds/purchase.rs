//! Purchase orders: stock is received into inventory against line items.

use orderflow_core::OrderKind;

use super::{
    CompletionRule, DefaultAction, Edge, EdgeOrigin, KindDescriptor, Settlement, StockFlow,
};
use crate::status::status_codes;

status_codes! {
    /// Purchase order lifecycle.
    pub enum PurchaseStatus {
        Pending = 10, "Pending", Secondary;
        Placed = 20, "Placed", Primary;
        OnHold = 25, "On Hold", Warning;
        Complete = 30, "Complete", Success;
        Cancelled = 40, "Cancelled", Danger;
        Overdue = 45, "Overdue", Danger;
    }
}

use PurchaseStatus as S;

pub static DESCRIPTOR: KindDescriptor = KindDescriptor {
    kind: OrderKind::Purchase,
    event_prefix: "purchaseorder",
    states: PurchaseStatus::STATES,
    initial: S::Pending.code(),
    overdue: Some(S::Overdue.code()),
    open: &[
        S::Pending.code(),
        S::Placed.code(),
        S::OnHold.code(),
        S::Overdue.code(),
    ],
    complete: &[S::Complete.code()],
    cancelled: &[S::Cancelled.code()],
    edges: &[
        Edge {
            target: S::Pending.code(),
            sources: &[S::OnHold.code()],
            action: DefaultAction::None,
            origin: EdgeOrigin::Any,
            event: "pending",
        },
        Edge {
            target: S::Placed.code(),
            sources: &[S::Pending.code(), S::OnHold.code(), S::Overdue.code()],
            action: DefaultAction::Place,
            origin: EdgeOrigin::Any,
            event: "placed",
        },
        Edge {
            target: S::OnHold.code(),
            sources: &[S::Pending.code(), S::Placed.code()],
            action: DefaultAction::None,
            origin: EdgeOrigin::Any,
            event: "on_hold",
        },
        Edge {
            target: S::Complete.code(),
            sources: &[S::Placed.code(), S::Overdue.code()],
            action: DefaultAction::Complete,
            origin: EdgeOrigin::Any,
            event: "completed",
        },
        Edge {
            target: S::Overdue.code(),
            sources: &[S::Placed.code()],
            action: DefaultAction::None,
            origin: EdgeOrigin::System,
            event: "overdue",
        },
        Edge {
            target: S::Cancelled.code(),
            sources: &[
                S::Pending.code(),
                S::Placed.code(),
                S::OnHold.code(),
                S::Overdue.code(),
            ],
            action: DefaultAction::Cancel,
            origin: EdgeOrigin::Any,
            event: "cancelled",
        },
    ],
    stock_flow: StockFlow::Inbound,
    fulfil_states: &[S::Placed.code(), S::Overdue.code()],
    return_states: &[],
    completion: CompletionRule::Fulfilled,
    settle_on_complete: Settlement::Release,
    settle_on_cancel: Settlement::Release,
};
