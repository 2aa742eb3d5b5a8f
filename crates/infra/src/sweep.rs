//! Overdue sweep and due-soon reminders.

use std::sync::Arc;

use chrono::{DateTime, Days, Utc};
use tracing::{debug, info, instrument, warn};

use orderflow_core::{OrderError, OrderKind, OrderResult};
use orderflow_orders::{Actor, descriptor};

use crate::config::SweepConfig;
use crate::notify::{Notifier, OrderNotification};
use crate::store::{DueQuery, Store};
use crate::transition::{TransitionContext, TransitionController};

pub struct OverdueSweep<S> {
    store: Arc<S>,
    controller: Arc<TransitionController<S>>,
    notifier: Arc<dyn Notifier>,
    config: SweepConfig,
}

impl<S> std::fmt::Debug for OverdueSweep<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverdueSweep")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: Store> OverdueSweep<S> {
    pub fn new(
        store: Arc<S>,
        controller: Arc<TransitionController<S>>,
        notifier: Arc<dyn Notifier>,
        config: SweepConfig,
    ) -> Self {
        Self {
            store,
            controller,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Move every open order past its due date to the overdue state.
    /// Returns how many orders were transitioned.
    #[instrument(skip(self), fields(today = %now.date_naive()), err)]
    pub fn sweep(&self, now: DateTime<Utc>) -> OrderResult<usize> {
        let today = now.date_naive();
        let mut marked = 0;

        for kind in OrderKind::ALL {
            let d = descriptor(kind);
            let Some(overdue) = d.overdue else { continue };
            let query = DueQuery {
                kind,
                statuses: d.overdue_sources(),
                due_on_or_after: None,
                due_before: today,
            };
            let candidates = self.store.begin()?.due_orders(&query)?;

            for order in candidates {
                let context = TransitionContext::new()
                    .with_note(format!("due {}", order.due_date.map(|d| d.to_string()).unwrap_or_default()));
                match self.controller.transition(order.id, overdue, Actor::System, context) {
                    Ok(_) => marked += 1,
                    Err(OrderError::InvalidTransition { current, .. }) => {
                        debug!(reference = %order.reference, status = %current, "order moved on, skipped");
                    }
                    Err(err @ OrderError::Busy { .. }) => {
                        warn!(reference = %order.reference, error = %err, "order locked, skipped");
                    }
                    Err(err) => {
                        warn!(reference = %order.reference, error = %err, "overdue transition failed, skipped");
                    }
                }
            }
        }

        info!(marked, "overdue sweep finished");
        Ok(marked)
    }

    /// Notify owners of open orders due within `due_soon_days`. Changes no state.
    #[instrument(skip(self), fields(today = %now.date_naive()), err)]
    pub fn remind_due_soon(&self, now: DateTime<Utc>) -> OrderResult<usize> {
        let today = now.date_naive();
        let horizon = today
            .checked_add_days(Days::new(u64::from(self.config.due_soon_days) + 1))
            .ok_or_else(|| OrderError::validation("due-soon horizon is out of range"))?;
        let mut sent = 0;

        for kind in OrderKind::ALL {
            let d = descriptor(kind);
            let statuses = d
                .open
                .iter()
                .copied()
                .filter(|s| Some(*s) != d.overdue)
                .collect();
            let query = DueQuery {
                kind,
                statuses,
                due_on_or_after: Some(today),
                due_before: horizon,
            };
            for order in self.store.begin()?.due_orders(&query)? {
                debug!(reference = %order.reference, due = ?order.due_date, "due soon");
                self.notifier.notify(OrderNotification::for_order(
                    d.event_name("due_soon"),
                    &order,
                    Actor::System,
                    now,
                ));
                sent += 1;
            }
        }

        info!(sent, "due-soon reminders sent");
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrderPolicy;
    use crate::notify::RecordingNotifier;
    use crate::store::InMemoryStore;
    use crate::transition::InterceptorChain;
    use chrono::NaiveDate;
    use orderflow_core::StatusCode;
    use orderflow_orders::{LoanStatus, NewOrder, Order, SalesStatus};

    struct Setup {
        store: Arc<InMemoryStore>,
        notifier: Arc<RecordingNotifier>,
        sweep: OverdueSweep<InMemoryStore>,
    }

    fn setup() -> Setup {
        let store = Arc::new(InMemoryStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let controller = Arc::new(TransitionController::new(
            store.clone(),
            OrderPolicy::default(),
            InterceptorChain::new(),
            notifier.clone(),
        ));
        let sweep = OverdueSweep::new(
            store.clone(),
            controller,
            notifier.clone(),
            SweepConfig::default(),
        );
        Setup {
            store,
            notifier,
            sweep,
        }
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(6, 0, 0)
            .unwrap()
            .and_utc()
    }

    fn seed(
        store: &InMemoryStore,
        kind: OrderKind,
        seq: u64,
        status: StatusCode,
        due: NaiveDate,
    ) -> Order {
        let draft = NewOrder::new(kind).due(due);
        let mut order = Order::open(format!("X-{seq}"), seq, &draft, at(2026, 5, 1)).unwrap();
        order.status = status;
        let mut tx = store.begin().unwrap();
        tx.insert_order(&order).unwrap();
        tx.commit().unwrap();
        order
    }

    fn status_of(store: &InMemoryStore, order: &Order) -> StatusCode {
        store.begin().unwrap().get_order(order.id).unwrap().unwrap().status
    }

    #[test]
    fn marks_past_due_orders_once() {
        let s = setup();
        let day = |d| NaiveDate::from_ymd_opt(2026, 5, d).unwrap();
        let late = seed(&s.store, OrderKind::Loan, 1, LoanStatus::Issued.code(), day(9));
        let due_today = seed(&s.store, OrderKind::Loan, 2, LoanStatus::Issued.code(), day(10));
        let pending = seed(&s.store, OrderKind::Loan, 3, LoanStatus::Pending.code(), day(1));
        let sale = seed(&s.store, OrderKind::Sales, 4, SalesStatus::InProgress.code(), day(2));

        assert_eq!(s.sweep.sweep(at(2026, 5, 10)).unwrap(), 2);
        assert_eq!(status_of(&s.store, &late), LoanStatus::Overdue.code());
        assert_eq!(status_of(&s.store, &due_today), LoanStatus::Issued.code());
        assert_eq!(status_of(&s.store, &pending), LoanStatus::Pending.code());
        assert_eq!(status_of(&s.store, &sale), SalesStatus::Overdue.code());

        assert_eq!(s.sweep.sweep(at(2026, 5, 10)).unwrap(), 0);
        let events = s.notifier.events();
        assert_eq!(events.iter().filter(|e| *e == "loanorder.overdue").count(), 1);
        assert_eq!(events.iter().filter(|e| *e == "salesorder.overdue").count(), 1);
    }

    #[test]
    fn reminders_cover_the_window_and_change_nothing() {
        let s = setup();
        let day = |d| NaiveDate::from_ymd_opt(2026, 5, d).unwrap();
        let soon = seed(&s.store, OrderKind::Loan, 1, LoanStatus::Issued.code(), day(17));
        seed(&s.store, OrderKind::Loan, 2, LoanStatus::Issued.code(), day(18));
        seed(&s.store, OrderKind::Loan, 3, LoanStatus::Overdue.code(), day(12));
        seed(&s.store, OrderKind::Loan, 4, LoanStatus::Complete.code(), day(12));

        assert_eq!(s.sweep.remind_due_soon(at(2026, 5, 10)).unwrap(), 1);
        let sent = s.notifier.sent();
        assert_eq!(sent[0].event, "loanorder.due_soon");
        assert_eq!(sent[0].order_id, soon.id);
        assert_eq!(status_of(&s.store, &soon), LoanStatus::Issued.code());
    }
}
