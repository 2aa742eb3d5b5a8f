//! Build orders: component stock is reserved, installed and consumed.

use orderflow_core::OrderKind;

use super::{
    CompletionRule, DefaultAction, Edge, EdgeOrigin, KindDescriptor, Settlement, StockFlow,
};
use crate::status::status_codes;

status_codes! {
    /// Build order lifecycle.
    pub enum BuildStatus {
        Pending = 10, "Pending", Secondary;
        Production = 20, "Production", Primary;
        OnHold = 25, "On Hold", Warning;
        Cancelled = 30, "Cancelled", Danger;
        Complete = 40, "Complete", Success;
        Overdue = 45, "Overdue", Danger;
    }
}

use BuildStatus as S;

pub static DESCRIPTOR: KindDescriptor = KindDescriptor {
    kind: OrderKind::Build,
    event_prefix: "buildorder",
    states: BuildStatus::STATES,
    initial: S::Pending.code(),
    overdue: Some(S::Overdue.code()),
    open: &[
        S::Pending.code(),
        S::Production.code(),
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
            target: S::Production.code(),
            sources: &[S::Pending.code(), S::OnHold.code(), S::Overdue.code()],
            action: DefaultAction::Place,
            origin: EdgeOrigin::Any,
            event: "issued",
        },
        Edge {
            target: S::OnHold.code(),
            sources: &[S::Pending.code(), S::Production.code()],
            action: DefaultAction::None,
            origin: EdgeOrigin::Any,
            event: "on_hold",
        },
        Edge {
            target: S::Complete.code(),
            sources: &[S::Production.code(), S::Overdue.code()],
            action: DefaultAction::Complete,
            origin: EdgeOrigin::Any,
            event: "completed",
        },
        Edge {
            target: S::Overdue.code(),
            sources: &[S::Production.code()],
            action: DefaultAction::None,
            origin: EdgeOrigin::System,
            event: "overdue",
        },
        Edge {
            target: S::Cancelled.code(),
            sources: &[
                S::Pending.code(),
                S::Production.code(),
                S::OnHold.code(),
                S::Overdue.code(),
            ],
            action: DefaultAction::Cancel,
            origin: EdgeOrigin::Any,
            event: "cancelled",
        },
    ],
    stock_flow: StockFlow::Outbound,
    fulfil_states: &[S::Production.code(), S::Overdue.code()],
    return_states: &[],
    completion: CompletionRule::Fulfilled,
    settle_on_complete: Settlement::Consume,
    settle_on_cancel: Settlement::Consume,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_build_is_closed_despite_lower_code() {
        assert!(S::Cancelled.code() < S::Complete.code());
        assert!(DESCRIPTOR.is_closed(S::Cancelled.code()));
        assert!(DESCRIPTOR.is_open(S::Production.code()));
    }
}
