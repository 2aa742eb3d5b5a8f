//! Loan orders: stock goes out to a borrower and is expected back.

use orderflow_core::OrderKind;

use super::{
    CompletionRule, DefaultAction, Edge, EdgeOrigin, KindDescriptor, Settlement, StockFlow,
};
use crate::status::status_codes;

status_codes! {
    /// Loan order lifecycle.
    pub enum LoanStatus {
        Pending = 10, "Pending", Secondary;
        Approved = 15, "Approved", Info;
        Issued = 20, "Issued", Primary;
        OnHold = 25, "On Hold", Warning;
        Complete = 30, "Returned", Success;
        PartialReturn = 35, "Partially Returned", Warning;
        Overdue = 45, "Overdue", Danger;
        Cancelled = 50, "Cancelled", Danger;
        WrittenOff = 60, "Written Off", Dark;
    }
}

use LoanStatus as L;

pub static DESCRIPTOR: KindDescriptor = KindDescriptor {
    kind: OrderKind::Loan,
    event_prefix: "loanorder",
    states: LoanStatus::STATES,
    initial: L::Pending.code(),
    overdue: Some(L::Overdue.code()),
    open: &[
        L::Pending.code(),
        L::Approved.code(),
        L::Issued.code(),
        L::OnHold.code(),
        L::PartialReturn.code(),
        L::Overdue.code(),
    ],
    complete: &[L::Complete.code()],
    cancelled: &[L::Cancelled.code(), L::WrittenOff.code()],
    edges: &[
        Edge {
            target: L::Pending.code(),
            sources: &[L::OnHold.code()],
            action: DefaultAction::None,
            origin: EdgeOrigin::Any,
            event: "pending",
        },
        Edge {
            target: L::Approved.code(),
            sources: &[L::Pending.code(), L::OnHold.code()],
            action: DefaultAction::RequireLines,
            origin: EdgeOrigin::Any,
            event: "approved",
        },
        Edge {
            target: L::Issued.code(),
            sources: &[L::Approved.code(), L::PartialReturn.code(), L::Overdue.code()],
            action: DefaultAction::Issue,
            origin: EdgeOrigin::Any,
            event: "issued",
        },
        Edge {
            target: L::OnHold.code(),
            sources: &[L::Pending.code(), L::Approved.code()],
            action: DefaultAction::None,
            origin: EdgeOrigin::Any,
            event: "on_hold",
        },
        Edge {
            target: L::PartialReturn.code(),
            sources: &[L::Issued.code()],
            action: DefaultAction::None,
            origin: EdgeOrigin::Any,
            event: "partial_return",
        },
        Edge {
            target: L::Complete.code(),
            sources: &[L::Issued.code(), L::PartialReturn.code(), L::Overdue.code()],
            action: DefaultAction::Complete,
            origin: EdgeOrigin::Any,
            event: "returned",
        },
        Edge {
            target: L::Overdue.code(),
            sources: &[L::Issued.code(), L::PartialReturn.code()],
            action: DefaultAction::None,
            origin: EdgeOrigin::System,
            event: "overdue",
        },
        Edge {
            target: L::Cancelled.code(),
            sources: &[
                L::Pending.code(),
                L::Approved.code(),
                L::Issued.code(),
                L::PartialReturn.code(),
                L::OnHold.code(),
            ],
            action: DefaultAction::Cancel,
            origin: EdgeOrigin::Any,
            event: "cancelled",
        },
        Edge {
            target: L::WrittenOff.code(),
            sources: &[L::Issued.code(), L::PartialReturn.code(), L::Overdue.code()],
            action: DefaultAction::WriteOff,
            origin: EdgeOrigin::Any,
            event: "written_off",
        },
    ],
    stock_flow: StockFlow::Outbound,
    fulfil_states: &[L::Issued.code(), L::PartialReturn.code(), L::Overdue.code()],
    return_states: &[L::Issued.code(), L::PartialReturn.code(), L::Overdue.code()],
    completion: CompletionRule::Returned,
    settle_on_complete: Settlement::Release,
    settle_on_cancel: Settlement::Reject,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_is_not_reachable_from_pending_directly() {
        assert!(!DESCRIPTOR.can_transition(L::Pending.code(), L::Complete.code()));
        assert!(DESCRIPTOR.can_transition(L::Pending.code(), L::Approved.code()));
        assert!(DESCRIPTOR.can_transition(L::Approved.code(), L::Issued.code()));
    }

    #[test]
    fn partial_return_and_issued_go_both_ways() {
        assert!(DESCRIPTOR.can_transition(L::Issued.code(), L::PartialReturn.code()));
        assert!(DESCRIPTOR.can_transition(L::PartialReturn.code(), L::Issued.code()));
    }

    #[test]
    fn overdue_resolves_to_issued_or_complete() {
        assert!(DESCRIPTOR.can_transition(L::Overdue.code(), L::Issued.code()));
        assert!(DESCRIPTOR.can_transition(L::Overdue.code(), L::Complete.code()));
        assert_eq!(
            DESCRIPTOR.overdue_sources(),
            vec![L::Issued.code(), L::PartialReturn.code()]
        );
    }
}
