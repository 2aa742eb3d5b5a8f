//! Cross-component tests over the in-memory store.
//!
//! Covers:
//! - allocation ledger scenarios and the non-over-allocation invariant under
//!   concurrent callers
//! - transition closure, rollback on failure and interceptor handling
//! - reference uniqueness under concurrent creation
//! - loan returns, overdue sweep and notification delivery

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use chrono::{Days, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    use orderflow_core::{CatalogItemId, OrderError, OrderKind, Quantity, UserId};
    use orderflow_events::{EventBus, EventEnvelope, InMemoryEventBus};
    use orderflow_orders::{
        Actor, Allocation, BuildStatus, LoanStatus, NewOrder, Order, PurchaseStatus, SalesStatus,
        StockStatus, StockUnit, TrackingCode, TrackingEntry, descriptor,
    };

    use crate::config::EngineConfig;
    use crate::notify::{BusNotifier, OrderNotification, RecordingNotifier};
    use crate::service::OrderService;
    use crate::store::{InMemoryStore, Store};
    use crate::transition::{
        Handling, InterceptorChain, TransitionContext, TransitionInterceptor, TransitionStep,
    };

    type Service = OrderService<InMemoryStore>;

    fn q(n: u32) -> Quantity {
        Quantity::from(n)
    }

    fn ctx() -> TransitionContext {
        TransitionContext::new()
    }

    fn setup_with(
        store: InMemoryStore,
        config: EngineConfig,
        interceptors: InterceptorChain,
    ) -> (Arc<Service>, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        let service = OrderService::new(Arc::new(store), config, notifier.clone(), interceptors)
            .unwrap();
        (Arc::new(service), notifier)
    }

    fn setup() -> (Arc<Service>, Arc<RecordingNotifier>) {
        setup_with(InMemoryStore::new(), EngineConfig::default(), InterceptorChain::new())
    }

    fn history_codes(service: &Service, order: &Order) -> Vec<TrackingCode> {
        service
            .history(order.id)
            .unwrap()
            .into_iter()
            .map(|e| e.code)
            .collect()
    }

    /// Loan with one line of `required` reserved from a fresh unit of `on_hand`, then issued.
    fn issued_loan(
        service: &Service,
        required: u32,
        on_hand: u32,
    ) -> (Order, StockUnit, Allocation) {
        let item = CatalogItemId::new();
        let unit = service.create_stock_unit(StockUnit::new(item, q(on_hand))).unwrap();
        let order = service.create_order(NewOrder::new(OrderKind::Loan)).unwrap();
        let line = service.add_line(order.id, item, q(required), None).unwrap();
        let allocation = service
            .allocate(line.id, unit.id, q(required), Actor::System)
            .unwrap();
        service
            .transition(order.id, LoanStatus::Approved.code(), Actor::System, ctx())
            .unwrap();
        let order = service
            .transition(order.id, LoanStatus::Issued.code(), Actor::System, ctx())
            .unwrap();
        (order, unit, allocation)
    }

    // ── Allocation ledger ───────────────────────────────────────────

    #[test]
    fn allocate_release_reallocate_scenario() {
        let (service, _) = setup();
        let item = CatalogItemId::new();
        let unit = service.create_stock_unit(StockUnit::new(item, q(10))).unwrap();
        let order = service.create_order(NewOrder::new(OrderKind::Sales)).unwrap();
        let line_a = service.add_line(order.id, item, q(10), None).unwrap();
        let line_b = service.add_line(order.id, item, q(10), None).unwrap();

        let alloc_a = service.allocate(line_a.id, unit.id, q(7), Actor::System).unwrap();
        assert_eq!(service.available(unit.id).unwrap(), q(3));

        match service.allocate(line_b.id, unit.id, q(5), Actor::System).unwrap_err() {
            OrderError::InsufficientStock {
                requested,
                available,
                ..
            } => {
                assert_eq!(requested, q(5));
                assert_eq!(available, q(3));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        service.release(alloc_a.id, q(4), Actor::System).unwrap();
        assert_eq!(service.available(unit.id).unwrap(), q(7));
        service.allocate(line_b.id, unit.id, q(5), Actor::System).unwrap();
        assert_eq!(service.available(unit.id).unwrap(), q(2));
    }

    #[test]
    fn concurrent_allocations_never_overbook() {
        let (service, _) = setup();
        let item = CatalogItemId::new();
        let unit = service.create_stock_unit(StockUnit::new(item, q(10))).unwrap();
        let order = service.create_order(NewOrder::new(OrderKind::Sales)).unwrap();
        let lines: Vec<_> = (0..8)
            .map(|_| service.add_line(order.id, item, q(2), None).unwrap())
            .collect();

        let handles: Vec<_> = lines
            .into_iter()
            .map(|line| {
                let service = service.clone();
                let unit = unit.id;
                thread::spawn(move || service.allocate(line.id, unit, q(2), Actor::System))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(succeeded, 5);
        for result in results.iter().filter(|r| r.is_err()) {
            assert!(matches!(result, Err(OrderError::InsufficientStock { .. })));
        }
        let reserved: Quantity = service
            .allocations(order.id)
            .unwrap()
            .iter()
            .map(|a| a.quantity)
            .sum();
        assert_eq!(reserved, q(10));
        assert_eq!(service.available(unit.id).unwrap(), Quantity::ZERO);
    }

    #[derive(Debug, Clone)]
    enum LedgerOp {
        Allocate { line: usize, quantity: u32 },
        Release { line: usize, quantity: u32 },
    }

    fn ledger_op() -> impl Strategy<Value = LedgerOp> {
        prop_oneof![
            (0usize..3, 1u32..7).prop_map(|(line, quantity)| LedgerOp::Allocate { line, quantity }),
            (0usize..3, 1u32..7).prop_map(|(line, quantity)| LedgerOp::Release { line, quantity }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: the ledger agrees with a plain counting model and never
        /// reserves more than the unit holds.
        #[test]
        fn allocation_ledger_matches_model(
            total in 1u32..20,
            required in prop::collection::vec(1u32..10, 3),
            ops in prop::collection::vec(ledger_op(), 1..30)
        ) {
            let (service, _) = setup();
            let item = CatalogItemId::new();
            let unit = service.create_stock_unit(StockUnit::new(item, q(total))).unwrap();
            let order = service.create_order(NewOrder::new(OrderKind::Build)).unwrap();
            let lines: Vec<_> = required
                .iter()
                .map(|r| service.add_line(order.id, item, q(*r), None).unwrap())
                .collect();

            let mut model = [0u32; 3];
            let mut allocation_ids = [None; 3];

            for op in ops {
                match op {
                    LedgerOp::Allocate { line, quantity } => {
                        let available = total - model.iter().sum::<u32>();
                        let result = service.allocate(lines[line].id, unit.id, q(quantity), Actor::System);
                        if quantity > available {
                            let insufficient = matches!(result, Err(OrderError::InsufficientStock { .. }));
                            prop_assert!(insufficient);
                        } else if model[line] + quantity > required[line] {
                            let exceeded = matches!(result, Err(OrderError::QuantityExceeded { .. }));
                            prop_assert!(exceeded);
                        } else {
                            let allocation = result.unwrap();
                            model[line] += quantity;
                            prop_assert_eq!(allocation.quantity, q(model[line]));
                            allocation_ids[line] = Some(allocation.id);
                        }
                    }
                    LedgerOp::Release { line, quantity } => {
                        let Some(id) = allocation_ids[line] else { continue };
                        let result = service.release(id, q(quantity), Actor::System);
                        if quantity > model[line] {
                            let exceeded = matches!(result, Err(OrderError::QuantityExceeded { .. }));
                            prop_assert!(exceeded);
                        } else {
                            let remaining = result.unwrap();
                            model[line] -= quantity;
                            prop_assert_eq!(remaining.is_none(), model[line] == 0);
                            if model[line] == 0 {
                                allocation_ids[line] = None;
                            }
                        }
                    }
                }

                let reserved: u32 = model.iter().sum();
                prop_assert!(reserved <= total);
                prop_assert_eq!(service.available(unit.id).unwrap(), q(total - reserved));
                for (i, line) in lines.iter().enumerate() {
                    prop_assert_eq!(service.line(line.id).unwrap().allocated(), q(model[i]));
                }
            }
        }

        /// Property: whatever targets are requested, an order only ever sits
        /// in states reachable from its initial state, and a failed
        /// transition changes nothing.
        #[test]
        fn status_stays_within_reachable_closure(
            kind in prop::sample::select(OrderKind::ALL.to_vec()),
            picks in prop::collection::vec((0usize..16, any::<bool>()), 1..25)
        ) {
            let (service, _) = setup();
            let d = descriptor(kind);
            let reachable = d.reachable();
            let order = service.create_order(NewOrder::new(kind)).unwrap();
            service.add_line(order.id, CatalogItemId::new(), q(1), None).unwrap();

            let mut current = order.status;
            for (pick, system) in picks {
                let target = d.states[pick % d.states.len()].value;
                let actor = if system { Actor::System } else { Actor::User(UserId::new()) };
                let before = service.history(order.id).unwrap().len();
                match service.transition(order.id, target, actor, ctx()) {
                    Ok(updated) => {
                        prop_assert!(d.allowed_sources(target).contains(&current));
                        prop_assert_eq!(updated.status, target);
                        prop_assert_eq!(service.history(order.id).unwrap().len(), before + 1);
                        current = target;
                    }
                    Err(_) => {
                        prop_assert_eq!(service.order(order.id).unwrap().status, current);
                        prop_assert_eq!(service.history(order.id).unwrap().len(), before);
                    }
                }
                prop_assert!(reachable.contains(&current));
            }
        }
    }

    // ── Transition controller ───────────────────────────────────────

    #[test]
    fn loan_pending_to_issued_scenario() {
        let (service, notifier) = setup();
        let order = service.create_order(NewOrder::new(OrderKind::Loan)).unwrap();
        service.add_line(order.id, CatalogItemId::new(), q(1), None).unwrap();

        match service
            .transition(order.id, LoanStatus::Complete.code(), Actor::System, ctx())
            .unwrap_err()
        {
            OrderError::InvalidTransition {
                current, target, ..
            } => {
                assert_eq!(current, LoanStatus::Pending.code());
                assert_eq!(target, LoanStatus::Complete.code());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(service.history(order.id).unwrap().is_empty());

        service
            .transition(order.id, LoanStatus::Approved.code(), Actor::System, ctx())
            .unwrap();
        let issued = service
            .transition(order.id, LoanStatus::Issued.code(), Actor::System, ctx())
            .unwrap();
        assert!(issued.issued_at.is_some());

        let history = service.history(order.id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].payload["to"], json!(LoanStatus::Approved.code()));
        assert_eq!(history[0].payload["to"], json!(LoanStatus::Issued.code()));
        assert!(history[0].sequence > history[1].sequence);
        assert_eq!(
            notifier.events(),
            vec!["loanorder.approved".to_string(), "loanorder.issued".to_string()]
        );
    }

    #[test]
    fn incomplete_completion_rolls_back() {
        let (service, notifier) = setup();
        let item = CatalogItemId::new();
        let unit = service.create_stock_unit(StockUnit::new(item, q(10))).unwrap();
        let order = service.create_order(NewOrder::new(OrderKind::Sales)).unwrap();
        let line = service.add_line(order.id, item, q(5), None).unwrap();
        service.allocate(line.id, unit.id, q(3), Actor::System).unwrap();
        service
            .transition(order.id, SalesStatus::InProgress.code(), Actor::System, ctx())
            .unwrap();

        let status_before = service.order(order.id).unwrap().status;
        let allocations_before = service.allocations(order.id).unwrap();
        let entries_before = service.history(order.id).unwrap().len();
        let sent_before = notifier.sent().len();

        match service
            .transition(order.id, SalesStatus::Complete.code(), Actor::System, ctx())
            .unwrap_err()
        {
            OrderError::IncompleteOrder { lines, .. } => {
                assert_eq!(lines.len(), 1);
                assert_eq!(lines[0].line, line.id);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert_eq!(service.order(order.id).unwrap().status, status_before);
        assert_eq!(service.allocations(order.id).unwrap(), allocations_before);
        assert_eq!(service.history(order.id).unwrap().len(), entries_before);
        assert_eq!(notifier.sent().len(), sent_before);
    }

    #[test]
    fn sales_completion_consumes_shipped_stock() {
        let (service, notifier) = setup();
        let item = CatalogItemId::new();
        let unit = service.create_stock_unit(StockUnit::new(item, q(10))).unwrap();
        let order = service.create_order(NewOrder::new(OrderKind::Sales)).unwrap();
        let line = service.add_line(order.id, item, q(4), None).unwrap();
        let allocation = service.allocate(line.id, unit.id, q(4), Actor::System).unwrap();
        service
            .transition(order.id, SalesStatus::InProgress.code(), Actor::System, ctx())
            .unwrap();
        service.fulfil(allocation.id, q(4), Actor::System).unwrap();

        let done = service
            .transition(order.id, SalesStatus::Complete.code(), Actor::System, ctx())
            .unwrap();
        assert!(done.completed_at.is_some());
        assert!(service.allocations(order.id).unwrap().is_empty());
        assert_eq!(service.stock_unit(unit.id).unwrap().total_quantity, q(6));
        assert_eq!(service.available(unit.id).unwrap(), q(6));
        assert_eq!(service.line(line.id).unwrap().settled(), q(4));
        assert!(notifier.events().contains(&"salesorder.completed".to_string()));
    }

    #[test]
    fn purchase_receipt_becomes_available_on_completion() {
        let (service, _) = setup();
        let item = CatalogItemId::new();
        let order = service.create_order(NewOrder::new(OrderKind::Purchase)).unwrap();
        let line = service.add_line(order.id, item, q(3), None).unwrap();
        service
            .transition(order.id, PurchaseStatus::Placed.code(), Actor::System, ctx())
            .unwrap();

        let received = service.receive(line.id, q(3), None, Actor::System).unwrap();
        assert_eq!(service.available(received.stock_unit).unwrap(), Quantity::ZERO);

        service
            .transition(order.id, PurchaseStatus::Complete.code(), Actor::System, ctx())
            .unwrap();
        assert_eq!(service.available(received.stock_unit).unwrap(), q(3));
        assert!(history_codes(&service, &order).contains(&TrackingCode::StockReceived));
    }

    #[test]
    fn system_only_edge_rejects_users() {
        let (service, _) = setup();
        let (order, _, _) = issued_loan(&service, 1, 1);
        let user = Actor::User(UserId::new());
        assert!(matches!(
            service.transition(order.id, LoanStatus::Overdue.code(), user, ctx()),
            Err(OrderError::InvalidTransition { .. })
        ));
        service
            .transition(order.id, LoanStatus::Overdue.code(), Actor::System, ctx())
            .unwrap();
    }

    #[test]
    fn locked_order_reports_busy() {
        let store = InMemoryStore::with_lock_wait(Duration::from_millis(50));
        let (service, _) = setup_with(store, EngineConfig::default(), InterceptorChain::new());
        let order = service.create_order(NewOrder::new(OrderKind::Sales)).unwrap();

        let mut holder = service.store().begin().unwrap();
        holder.lock_order(order.id).unwrap();

        let err = service
            .transition(order.id, SalesStatus::OnHold.code(), Actor::System, ctx())
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, OrderError::Busy { .. }));

        drop(holder);
        service
            .transition(order.id, SalesStatus::OnHold.code(), Actor::System, ctx())
            .unwrap();
    }

    // ── Interceptors ────────────────────────────────────────────────

    /// Approves loans without lines by skipping the default action.
    struct FastTrack;

    impl TransitionInterceptor for FastTrack {
        fn name(&self) -> &str {
            "fast-track"
        }

        fn try_handle(&self, step: &mut TransitionStep<'_>) -> orderflow_core::OrderResult<Handling> {
            if step.target == LoanStatus::Approved.code() && step.order().description == "fast" {
                return Ok(Handling::Handled);
            }
            Ok(Handling::Declined)
        }
    }

    /// Writes an entry through the step's transaction, then vetoes.
    struct Veto;

    impl TransitionInterceptor for Veto {
        fn name(&self) -> &str {
            "veto"
        }

        fn try_handle(&self, step: &mut TransitionStep<'_>) -> orderflow_core::OrderResult<Handling> {
            if step.order().description != "veto" {
                return Ok(Handling::Declined);
            }
            let entry = TrackingEntry::new(
                step.order().id,
                TrackingCode::StatusChanged,
                Actor::System,
                "should not survive",
                json!({}),
            );
            step.tx().append_tracking(&entry)?;
            Err(OrderError::validation("vetoed"))
        }
    }

    /// Runs the issue action itself, then edits the order.
    struct Wrapper;

    impl TransitionInterceptor for Wrapper {
        fn name(&self) -> &str {
            "wrapper"
        }

        fn try_handle(&self, step: &mut TransitionStep<'_>) -> orderflow_core::OrderResult<Handling> {
            if step.target != LoanStatus::Issued.code() || step.order().description != "wrap" {
                return Ok(Handling::Declined);
            }
            step.run_default()?;
            step.run_default()?;
            step.order_mut().description = "wrapped".into();
            Ok(Handling::Handled)
        }
    }

    fn intercepted() -> (Arc<Service>, Arc<RecordingNotifier>) {
        let chain = InterceptorChain::new()
            .register(OrderKind::Loan, Arc::new(Veto))
            .register(OrderKind::Loan, Arc::new(FastTrack))
            .register(OrderKind::Loan, Arc::new(Wrapper));
        setup_with(InMemoryStore::new(), EngineConfig::default(), chain)
    }

    #[test]
    fn handled_transition_skips_default_action() {
        let (service, _) = intercepted();
        let order = service
            .create_order(NewOrder::new(OrderKind::Loan).with_description("fast"))
            .unwrap();
        let approved = service
            .transition(order.id, LoanStatus::Approved.code(), Actor::System, ctx())
            .unwrap();
        assert_eq!(approved.status, LoanStatus::Approved.code());

        let history = service.history(order.id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].payload["handled_by"], json!("fast-track"));
    }

    #[test]
    fn declined_transition_runs_default_action() {
        let (service, _) = intercepted();
        let order = service
            .create_order(NewOrder::new(OrderKind::Loan).with_description("plain"))
            .unwrap();
        assert!(matches!(
            service.transition(order.id, LoanStatus::Approved.code(), Actor::System, ctx()),
            Err(OrderError::Validation(_))
        ));
        service.add_line(order.id, CatalogItemId::new(), q(1), None).unwrap();
        service
            .transition(order.id, LoanStatus::Approved.code(), Actor::System, ctx())
            .unwrap();
        let history = service.history(order.id).unwrap();
        assert_eq!(history[0].payload["handled_by"], json!(null));
    }

    #[test]
    fn interceptor_error_rolls_back_its_writes() {
        let (service, notifier) = intercepted();
        let order = service
            .create_order(NewOrder::new(OrderKind::Loan).with_description("veto"))
            .unwrap();
        service.add_line(order.id, CatalogItemId::new(), q(1), None).unwrap();

        match service
            .transition(order.id, LoanStatus::Approved.code(), Actor::System, ctx())
            .unwrap_err()
        {
            OrderError::Validation(msg) => assert_eq!(msg, "vetoed"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(service.order(order.id).unwrap().status, LoanStatus::Pending.code());
        assert!(service.history(order.id).unwrap().is_empty());
        assert!(notifier.sent().is_empty());
    }

    #[test]
    fn interceptor_may_run_default_once_and_edit_order() {
        let (service, _) = intercepted();
        let (order, _, _) = {
            let item = CatalogItemId::new();
            let unit = service.create_stock_unit(StockUnit::new(item, q(2))).unwrap();
            let order = service
                .create_order(NewOrder::new(OrderKind::Loan).with_description("wrap"))
                .unwrap();
            let line = service.add_line(order.id, item, q(2), None).unwrap();
            let allocation = service.allocate(line.id, unit.id, q(2), Actor::System).unwrap();
            (order, unit, allocation)
        };
        service
            .transition(order.id, LoanStatus::Approved.code(), Actor::System, ctx())
            .unwrap();
        let issued = service
            .transition(order.id, LoanStatus::Issued.code(), Actor::System, ctx())
            .unwrap();
        assert_eq!(issued.description, "wrapped");

        let lines = service.lines(order.id).unwrap();
        assert_eq!(lines[0].fulfilled(), q(2));
        let history = service.history(order.id).unwrap();
        assert_eq!(history[0].payload["handled_by"], json!("wrapper"));
        assert_eq!(history[0].payload["allocations"].as_array().map(Vec::len), Some(1));
    }

    // ── Loans ───────────────────────────────────────────────────────

    #[test]
    fn loan_returns_complete_once_every_line_is_back() {
        let (service, notifier) = setup();
        let (order, unit, allocation) = issued_loan(&service, 3, 5);
        assert_eq!(service.available(unit.id).unwrap(), q(2));

        let partial = service
            .return_stock(allocation.id, q(1), None, Actor::System)
            .unwrap();
        assert_eq!(partial.status, LoanStatus::Issued.code());
        assert_eq!(service.available(unit.id).unwrap(), q(3));

        match service
            .return_stock(allocation.id, q(3), None, Actor::System)
            .unwrap_err()
        {
            OrderError::InsufficientStock {
                requested,
                available,
                ..
            } => {
                assert_eq!(requested, q(3));
                assert_eq!(available, q(2));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let done = service
            .return_stock(allocation.id, q(2), Some(StockStatus::Damaged), Actor::System)
            .unwrap();
        assert_eq!(done.status, LoanStatus::Complete.code());
        assert!(done.completed_at.is_some());
        assert_eq!(service.stock_unit(unit.id).unwrap().status, StockStatus::Damaged);
        assert_eq!(service.available(unit.id).unwrap(), q(5));

        let line = &service.lines(order.id).unwrap()[0];
        assert_eq!(line.returned(), q(3));
        assert_eq!(line.allocated(), Quantity::ZERO);
        assert!(!notifier.events().contains(&"loanorder.partial_return".to_string()));
        assert!(notifier.events().contains(&"loanorder.returned".to_string()));
    }

    #[test]
    fn partial_return_once_one_line_is_back_and_another_is_out() {
        let (service, notifier) = setup();
        let (drill, saw) = (CatalogItemId::new(), CatalogItemId::new());
        let drills = service.create_stock_unit(StockUnit::new(drill, q(4))).unwrap();
        let saws = service.create_stock_unit(StockUnit::new(saw, q(4))).unwrap();
        let order = service.create_order(NewOrder::new(OrderKind::Loan)).unwrap();
        let drill_line = service.add_line(order.id, drill, q(2), None).unwrap();
        let saw_line = service.add_line(order.id, saw, q(1), None).unwrap();
        let drill_out = service
            .allocate(drill_line.id, drills.id, q(2), Actor::System)
            .unwrap();
        let saw_out = service.allocate(saw_line.id, saws.id, q(1), Actor::System).unwrap();
        service
            .transition(order.id, LoanStatus::Approved.code(), Actor::System, ctx())
            .unwrap();
        service
            .transition(order.id, LoanStatus::Issued.code(), Actor::System, ctx())
            .unwrap();

        let some_back = service
            .return_stock(drill_out.id, q(1), None, Actor::System)
            .unwrap();
        assert_eq!(some_back.status, LoanStatus::Issued.code());

        let one_line_back = service
            .return_stock(drill_out.id, q(1), None, Actor::System)
            .unwrap();
        assert_eq!(one_line_back.status, LoanStatus::PartialReturn.code());
        assert!(notifier.events().contains(&"loanorder.partial_return".to_string()));

        let done = service
            .return_stock(saw_out.id, q(1), None, Actor::System)
            .unwrap();
        assert_eq!(done.status, LoanStatus::Complete.code());
        assert_eq!(service.available(drills.id).unwrap(), q(4));
        assert_eq!(service.available(saws.id).unwrap(), q(4));
    }

    #[test]
    fn loan_allocated_in_one_call_then_issued() {
        let (service, _) = setup();
        let (drill, saw) = (CatalogItemId::new(), CatalogItemId::new());
        service.create_stock_unit(StockUnit::new(drill, q(1))).unwrap();
        let drills = service.create_stock_unit(StockUnit::new(drill, q(6))).unwrap();
        let saws = service
            .create_stock_unit(StockUnit::serialized(saw, "SAW-1").unwrap())
            .unwrap();
        let order = service.create_order(NewOrder::new(OrderKind::Loan)).unwrap();
        service.add_line(order.id, drill, q(2), None).unwrap();
        service.add_line(order.id, saw, q(1), None).unwrap();

        let allocations = service.allocate_all(order.id, Actor::System).unwrap();
        let units: HashSet<_> = allocations.iter().map(|a| a.stock_unit).collect();
        assert_eq!(units, HashSet::from([drills.id, saws.id]));
        assert_eq!(service.available(drills.id).unwrap(), q(4));

        service
            .transition(order.id, LoanStatus::Approved.code(), Actor::System, ctx())
            .unwrap();
        service
            .transition(order.id, LoanStatus::Issued.code(), Actor::System, ctx())
            .unwrap();
        let lines = service.lines(order.id).unwrap();
        assert!(lines.iter().all(|l| l.fulfilled() == l.required));
    }

    #[test]
    fn full_return_without_auto_complete_stays_open() {
        let mut config = EngineConfig::default();
        config.loans.auto_complete_on_return = false;
        let (service, _) = setup_with(InMemoryStore::new(), config, InterceptorChain::new());
        let (order, _, allocation) = issued_loan(&service, 2, 2);

        let after = service
            .return_stock(allocation.id, q(2), None, Actor::System)
            .unwrap();
        assert_eq!(after.status, LoanStatus::Issued.code());
        assert!(after.completed_at.is_none());
        service
            .transition(order.id, LoanStatus::Complete.code(), Actor::System, ctx())
            .unwrap();
    }

    #[test]
    fn loan_cannot_cancel_while_stock_is_out() {
        let (service, _) = setup();
        let (order, _, _) = issued_loan(&service, 1, 1);
        let before = service.allocations(order.id).unwrap();
        assert!(matches!(
            service.transition(order.id, LoanStatus::Cancelled.code(), Actor::System, ctx()),
            Err(OrderError::Validation(_))
        ));
        assert_eq!(service.allocations(order.id).unwrap(), before);
    }

    #[test]
    fn write_off_marks_serialized_units_lost() {
        let (service, _) = setup();
        let item = CatalogItemId::new();
        let unit = service
            .create_stock_unit(StockUnit::serialized(item, "SN-7").unwrap())
            .unwrap();
        let order = service.create_order(NewOrder::new(OrderKind::Loan)).unwrap();
        let line = service.add_line(order.id, item, q(1), None).unwrap();
        service.allocate(line.id, unit.id, q(1), Actor::System).unwrap();
        service
            .transition(order.id, LoanStatus::Approved.code(), Actor::System, ctx())
            .unwrap();
        service
            .transition(order.id, LoanStatus::Issued.code(), Actor::System, ctx())
            .unwrap();

        let written_off = service
            .transition(order.id, LoanStatus::WrittenOff.code(), Actor::System, ctx())
            .unwrap();
        assert!(written_off.completed_at.is_some());
        assert_eq!(service.stock_unit(unit.id).unwrap().status, StockStatus::Lost);
        assert_eq!(service.available(unit.id).unwrap(), Quantity::ZERO);
    }

    // ── References ──────────────────────────────────────────────────

    #[test]
    fn concurrent_next_reference_is_distinct_and_dense() {
        let mut config = EngineConfig::default();
        config.references.loan = "LOAN-{seq}".into();
        let (service, _) = setup_with(InMemoryStore::new(), config, InterceptorChain::new());

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let service = service.clone();
                thread::spawn(move || {
                    (0..20)
                        .map(|_| service.next_reference(OrderKind::Loan).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let issued: Vec<String> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();

        let distinct: HashSet<_> = issued.iter().cloned().collect();
        assert_eq!(distinct.len(), 1000);
        let expected: HashSet<String> = (1..=1000).map(|n| format!("LOAN-{n}")).collect();
        assert_eq!(distinct, expected);
    }

    #[test]
    fn concurrent_order_creation_yields_unique_references() {
        let (service, _) = setup();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let service = service.clone();
                thread::spawn(move || {
                    (0..25)
                        .map(|_| service.create_order(NewOrder::new(OrderKind::Purchase)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let orders: Vec<Order> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();

        let references: HashSet<_> = orders.iter().map(|o| o.reference.clone()).collect();
        assert_eq!(references.len(), 400);
        let max_seq = orders.iter().map(|o| o.reference_seq).max().unwrap();
        assert_eq!(max_seq, 400);
    }

    #[test]
    fn pattern_change_keeps_counting() {
        let (service, _) = setup();
        for _ in 0..3 {
            service.create_order(NewOrder::new(OrderKind::Loan)).unwrap();
        }
        service.references().set_pattern(OrderKind::Loan, "LO-{seq}").unwrap();
        let next = service.create_order(NewOrder::new(OrderKind::Loan)).unwrap();
        assert_eq!(next.reference, "LO-4");

        service
            .create_order(NewOrder::new(OrderKind::Loan).with_reference("LO-10"))
            .unwrap();
        let after = service.create_order(NewOrder::new(OrderKind::Loan)).unwrap();
        assert_eq!(after.reference, "LO-11");
        assert!(service.find_order(OrderKind::Loan, "LO-0001").unwrap().is_some());
    }

    #[test]
    fn generator_skips_past_a_taken_reference() {
        let (service, _) = setup();
        let draft = NewOrder::new(OrderKind::Loan);
        let legacy = Order::open("LO-0001".into(), 0, &draft, Utc::now()).unwrap();
        let mut tx = service.store().begin().unwrap();
        tx.insert_order(&legacy).unwrap();
        tx.commit().unwrap();

        let order = service.create_order(NewOrder::new(OrderKind::Loan)).unwrap();
        assert_eq!(order.reference, "LO-0002");
    }

    #[test]
    fn generator_gives_up_after_max_attempts() {
        let mut config = EngineConfig::default();
        config.references.max_attempts = 1;
        let (service, _) = setup_with(InMemoryStore::new(), config, InterceptorChain::new());
        let legacy = Order::open("LO-0001".into(), 0, &NewOrder::new(OrderKind::Loan), Utc::now())
            .unwrap();
        let mut tx = service.store().begin().unwrap();
        tx.insert_order(&legacy).unwrap();
        tx.commit().unwrap();

        match service.create_order(NewOrder::new(OrderKind::Loan)).unwrap_err() {
            OrderError::ReferenceConflict {
                kind,
                last_candidate,
                attempts,
            } => {
                assert_eq!(kind, OrderKind::Loan);
                assert_eq!(last_candidate, "LO-0001");
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    // ── Sweep and notifications ─────────────────────────────────────

    #[test]
    fn sweep_is_idempotent_and_notifies_once() {
        let (service, notifier) = setup();
        let creator = UserId::new();
        let due = Utc::now().date_naive().checked_add_days(Days::new(1)).unwrap();
        let item = CatalogItemId::new();
        let order = service
            .create_order(NewOrder::new(OrderKind::Loan).created_by(creator).due(due))
            .unwrap();
        service.add_line(order.id, item, q(1), None).unwrap();
        service
            .transition(order.id, LoanStatus::Approved.code(), Actor::System, ctx())
            .unwrap();
        service
            .transition(order.id, LoanStatus::Issued.code(), Actor::System, ctx())
            .unwrap();

        let later = Utc::now() + chrono::Duration::days(3);
        assert_eq!(service.sweep(later).unwrap(), 1);
        assert_eq!(service.sweep(later).unwrap(), 0);
        assert_eq!(service.order(order.id).unwrap().status, LoanStatus::Overdue.code());

        let overdue: Vec<OrderNotification> = notifier
            .sent()
            .into_iter()
            .filter(|n| n.event == "loanorder.overdue")
            .collect();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].targets, vec![creator]);
        assert_eq!(overdue[0].previous_status, Some(LoanStatus::Issued.code()));
        assert_eq!(overdue[0].actor, Actor::System);

        let back = service
            .transition(order.id, LoanStatus::Issued.code(), Actor::System, ctx())
            .unwrap();
        assert_eq!(back.status, LoanStatus::Issued.code());
    }

    #[test]
    fn bus_notifier_delivers_envelopes_after_commit() {
        let bus: Arc<InMemoryEventBus<EventEnvelope<OrderNotification>>> =
            Arc::new(InMemoryEventBus::new());
        let subscription = bus.subscribe();
        let service = OrderService::new(
            Arc::new(InMemoryStore::new()),
            EngineConfig::default(),
            Arc::new(BusNotifier::new(bus.clone())),
            InterceptorChain::new(),
        )
        .unwrap();

        let order = service.create_order(NewOrder::new(OrderKind::Build)).unwrap();
        service.add_line(order.id, CatalogItemId::new(), q(1), None).unwrap();
        service
            .transition(order.id, BuildStatus::Production.code(), Actor::System, ctx())
            .unwrap();

        let envelope = subscription.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(envelope.order_id(), order.id);
        assert_eq!(envelope.order_kind(), OrderKind::Build);
        assert_eq!(envelope.payload().event, "buildorder.issued");
        assert!(subscription.try_recv().is_err());
    }
}
