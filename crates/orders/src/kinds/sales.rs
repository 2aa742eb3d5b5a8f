//! Sales orders: stock is reserved, shipped and leaves inventory on completion.

use orderflow_core::OrderKind;

use super::{
    CompletionRule, DefaultAction, Edge, EdgeOrigin, KindDescriptor, Settlement, StockFlow,
};
use crate::status::status_codes;

status_codes! {
    /// Sales order lifecycle.
    pub enum SalesStatus {
        Pending = 10, "Pending", Secondary;
        InProgress = 15, "In Progress", Primary;
        OnHold = 25, "On Hold", Warning;
        Complete = 30, "Complete", Success;
        Cancelled = 40, "Cancelled", Danger;
        Overdue = 45, "Overdue", Danger;
    }
}

use SalesStatus as S;

pub static DESCRIPTOR: KindDescriptor = KindDescriptor {
    kind: OrderKind::Sales,
    event_prefix: "salesorder",
    states: SalesStatus::STATES,
    initial: S::Pending.code(),
    overdue: Some(S::Overdue.code()),
    open: &[
        S::Pending.code(),
        S::InProgress.code(),
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
            target: S::InProgress.code(),
            sources: &[S::Pending.code(), S::OnHold.code(), S::Overdue.code()],
            action: DefaultAction::Place,
            origin: EdgeOrigin::Any,
            event: "issued",
        },
        Edge {
            target: S::OnHold.code(),
            sources: &[S::Pending.code(), S::InProgress.code()],
            action: DefaultAction::None,
            origin: EdgeOrigin::Any,
            event: "on_hold",
        },
        Edge {
            target: S::Complete.code(),
            sources: &[S::InProgress.code(), S::Overdue.code()],
            action: DefaultAction::Complete,
            origin: EdgeOrigin::Any,
            event: "completed",
        },
        Edge {
            target: S::Overdue.code(),
            sources: &[S::InProgress.code()],
            action: DefaultAction::None,
            origin: EdgeOrigin::System,
            event: "overdue",
        },
        Edge {
            target: S::Cancelled.code(),
            sources: &[
                S::Pending.code(),
                S::InProgress.code(),
                S::OnHold.code(),
                S::Overdue.code(),
            ],
            action: DefaultAction::Cancel,
            origin: EdgeOrigin::Any,
            event: "cancelled",
        },
    ],
    stock_flow: StockFlow::Outbound,
    fulfil_states: &[S::InProgress.code(), S::Overdue.code()],
    return_states: &[],
    completion: CompletionRule::Fulfilled,
    settle_on_complete: Settlement::Consume,
    settle_on_cancel: Settlement::Consume,
};
