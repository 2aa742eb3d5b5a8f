//! Order-kind descriptors.
//!
//! The four order kinds share one engine. Everything that differs between
//! them (states, edges, default actions, settlement rules) lives in a static
//! [`KindDescriptor`].

use std::collections::{BTreeSet, VecDeque};

use orderflow_core::{OrderKind, StatusCode};

use crate::status::{StateDef, StatusGroup};

pub mod build;
pub mod loan;
pub mod purchase;
pub mod sales;

pub use build::BuildStatus;
pub use loan::LoanStatus;
pub use purchase::PurchaseStatus;
pub use sales::SalesStatus;

/// Who may request an edge.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EdgeOrigin {
    /// Any actor, including the system.
    Any,
    /// Only the system actor (overdue sweep).
    System,
}

/// Work the controller performs when no interceptor handles a transition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DefaultAction {
    /// Status change only.
    None,
    /// The order must have at least one line.
    RequireLines,
    /// Requires lines and stamps `issued_at`.
    Place,
    /// Requires lines, fulfils every outstanding reservation and stamps `issued_at`.
    Issue,
    /// Every line must satisfy the kind's completion rule; allocations are settled.
    Complete,
    /// Outstanding reservations are released; fulfilled stock is settled per kind.
    Cancel,
    /// Outstanding reservations are released; fulfilled stock is written off.
    WriteOff,
}

/// When a line counts as satisfied for completion.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompletionRule {
    /// `fulfilled == required`
    Fulfilled,
    /// `returned == required` (loans)
    Returned,
}

/// Fate of fulfilled stock when its order closes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// The allocation is dropped and the stock becomes available again.
    Release,
    /// The stock leaves inventory (shipped, installed).
    Consume,
    /// As `Consume`, and serialized units are marked lost.
    WriteOff,
    /// Closing is refused while fulfilled stock is outstanding.
    Reject,
}

/// Direction stock moves for a kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StockFlow {
    /// Existing stock is reserved and taken (sales, build, loan).
    Outbound,
    /// Stock is received into inventory (purchase).
    Inbound,
}

/// One `(sources → target)` edge of a kind's graph.
#[derive(Debug)]
pub struct Edge {
    pub target: StatusCode,
    pub sources: &'static [StatusCode],
    pub action: DefaultAction,
    pub origin: EdgeOrigin,
    /// Suffix of the notification event emitted after the transition commits.
    pub event: &'static str,
}

#[derive(Debug)]
pub struct KindDescriptor {
    pub kind: OrderKind,
    pub event_prefix: &'static str,
    pub states: &'static [StateDef],
    pub initial: StatusCode,
    pub overdue: Option<StatusCode>,
    pub open: &'static [StatusCode],
    pub complete: &'static [StatusCode],
    pub cancelled: &'static [StatusCode],
    pub edges: &'static [Edge],
    pub stock_flow: StockFlow,
    /// States in which stock may be fulfilled (or received, for inbound kinds).
    pub fulfil_states: &'static [StatusCode],
    /// States in which loaned stock may come back.
    pub return_states: &'static [StatusCode],
    pub completion: CompletionRule,
    pub settle_on_complete: Settlement,
    pub settle_on_cancel: Settlement,
}

/// Descriptor for `kind`.
pub fn descriptor(kind: OrderKind) -> &'static KindDescriptor {
    match kind {
        OrderKind::Purchase => &purchase::DESCRIPTOR,
        OrderKind::Sales => &sales::DESCRIPTOR,
        OrderKind::Build => &build::DESCRIPTOR,
        OrderKind::Loan => &loan::DESCRIPTOR,
    }
}

impl KindDescriptor {
    pub fn state(&self, code: StatusCode) -> Option<&'static StateDef> {
        self.states.iter().find(|s| s.value == code)
    }

    pub fn is_builtin(&self, code: StatusCode) -> bool {
        self.state(code).is_some()
    }

    pub fn edge_to(&self, target: StatusCode) -> Option<&'static Edge> {
        self.edges.iter().find(|e| e.target == target)
    }

    /// Source states from which `target` may be entered. Empty for unknown
    /// targets and for the initial state when nothing leads back to it.
    pub fn allowed_sources(&self, target: StatusCode) -> &'static [StatusCode] {
        self.edge_to(target).map(|e| e.sources).unwrap_or(&[])
    }

    pub fn can_transition(&self, from: StatusCode, to: StatusCode) -> bool {
        self.allowed_sources(to).contains(&from)
    }

    pub fn group(&self, group: StatusGroup) -> &'static [StatusCode] {
        match group {
            StatusGroup::Open => self.open,
            StatusGroup::Complete => self.complete,
            StatusGroup::Cancelled => self.cancelled,
        }
    }

    pub fn in_group(&self, code: StatusCode, group: StatusGroup) -> bool {
        self.group(group).contains(&code)
    }

    pub fn is_open(&self, code: StatusCode) -> bool {
        self.in_group(code, StatusGroup::Open)
    }

    /// Complete or cancelled: the order no longer accepts line edits.
    pub fn is_closed(&self, code: StatusCode) -> bool {
        self.in_group(code, StatusGroup::Complete) || self.in_group(code, StatusGroup::Cancelled)
    }

    /// Every state reachable from the initial state through the edge set.
    pub fn reachable(&self) -> BTreeSet<StatusCode> {
        let mut seen = BTreeSet::from([self.initial]);
        let mut queue = VecDeque::from([self.initial]);
        while let Some(from) = queue.pop_front() {
            for edge in self.edges.iter().filter(|e| e.sources.contains(&from)) {
                if seen.insert(edge.target) {
                    queue.push_back(edge.target);
                }
            }
        }
        seen
    }

    /// Open states the sweep may flag as overdue.
    pub fn overdue_sources(&self) -> Vec<StatusCode> {
        match self.overdue {
            Some(overdue) => self
                .allowed_sources(overdue)
                .iter()
                .copied()
                .filter(|s| *s != overdue && self.is_open(*s))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn event_name(&self, suffix: &str) -> String {
        format!("{}.{}", self.event_prefix, suffix)
    }

    pub fn label(&self, code: StatusCode) -> &'static str {
        self.state(code).map(|s| s.label).unwrap_or("Unknown")
    }
}
