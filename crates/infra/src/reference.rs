//! Reference generator.
//!
//! Sequence numbers come from a per-kind counter row locked for the duration
//! of the issuing transaction, so concurrent creators serialize on it. The
//! next value is `max(counter, highest existing reference_seq) + 1`; orders
//! inserted by other means (imports, manual references) are therefore never
//! reissued. The unique `(kind, reference)` constraint is the final guard:
//! on a violation the generator retries in a fresh transaction, skipping one
//! more value each attempt. Sequence values stop at `MAX_REFERENCE_SEQ`;
//! manual references must leave at least one value above them.

use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use tracing::{debug, instrument, warn};

use orderflow_core::{OrderError, OrderKind, OrderResult};
use orderflow_orders::{MAX_REFERENCE_SEQ, NewOrder, Order, ReferencePattern};

use crate::config::{ReferenceConfig, ReferencePatterns};
use crate::store::{Store, StoreError, StoreTx};

#[derive(Debug)]
pub struct ReferenceGenerator<S> {
    store: Arc<S>,
    patterns: RwLock<ReferencePatterns>,
    max_attempts: u32,
}

/// The value after `max(counter, existing)`, plus `skip`, within the sequence range.
fn following_seq(kind: OrderKind, counter: u64, existing: u64, skip: u64) -> OrderResult<u64> {
    counter
        .max(existing)
        .checked_add(1)
        .and_then(|seq| seq.checked_add(skip))
        .filter(|seq| *seq <= MAX_REFERENCE_SEQ)
        .ok_or_else(|| {
            OrderError::validation(format!(
                "{kind} reference sequence is exhausted (limit {MAX_REFERENCE_SEQ})"
            ))
        })
}

/// Lock the counter and advance it past every existing sequence value.
fn issue_seq(tx: &mut dyn StoreTx, kind: OrderKind, skip: u64) -> OrderResult<u64> {
    let counter = tx.lock_counter(kind)?;
    let existing = tx.max_reference_seq(kind)?;
    let seq = following_seq(kind, counter, existing, skip)?;
    tx.set_counter(kind, seq)?;
    Ok(seq)
}

impl<S: Store> ReferenceGenerator<S> {
    pub fn new(store: Arc<S>, config: &ReferenceConfig) -> OrderResult<Self> {
        if config.max_attempts == 0 {
            return Err(OrderError::validation("references.max_attempts must be at least 1"));
        }
        Ok(Self {
            store,
            patterns: RwLock::new(config.patterns()?),
            max_attempts: config.max_attempts,
        })
    }

    pub fn pattern(&self, kind: OrderKind) -> ReferencePattern {
        self.patterns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .clone()
    }

    /// Switch the pattern for future references. Existing orders keep theirs.
    pub fn set_pattern(&self, kind: OrderKind, pattern: &str) -> OrderResult<()> {
        let parsed = ReferencePattern::parse(pattern)?;
        self.patterns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set(kind, parsed);
        Ok(())
    }

    /// Issue the next reference for `kind`. Each call consumes one sequence
    /// value, so concurrent callers always receive distinct references.
    #[instrument(skip(self), fields(kind = %kind), err)]
    pub fn next_reference(&self, kind: OrderKind) -> OrderResult<String> {
        let pattern = self.pattern(kind);
        let mut tx = self.store.begin()?;
        let seq = issue_seq(tx.as_mut(), kind, 0)?;
        tx.commit()?;
        Ok(pattern.format(seq, Utc::now().date_naive()))
    }

    /// The reference the next issue would produce, without consuming it.
    pub fn peek_reference(&self, kind: OrderKind) -> OrderResult<String> {
        let pattern = self.pattern(kind);
        let mut tx = self.store.begin()?;
        let counter = tx.lock_counter(kind)?;
        let existing = tx.max_reference_seq(kind)?;
        let seq = following_seq(kind, counter, existing, 0)?;
        Ok(pattern.format(seq, Utc::now().date_naive()))
    }

    /// Create an order in its kind's initial state with a unique reference.
    #[instrument(skip(self, draft), fields(kind = %draft.kind), err)]
    pub fn create_order(&self, draft: NewOrder) -> OrderResult<Order> {
        match draft.reference.clone() {
            Some(reference) => self.create_with_reference(reference, &draft),
            None => self.create_with_issued_reference(&draft),
        }
    }

    fn create_with_reference(&self, reference: String, draft: &NewOrder) -> OrderResult<Order> {
        let kind = draft.kind;
        let pattern = self.pattern(kind);
        let seq = pattern.sequence_of(&reference).ok_or_else(|| {
            OrderError::validation(format!(
                "reference '{reference}' does not match the {kind} pattern '{}'",
                pattern.as_str()
            ))
        })?;
        if seq >= MAX_REFERENCE_SEQ {
            return Err(OrderError::validation(format!(
                "reference '{reference}' leaves no {kind} sequence values after it (limit {MAX_REFERENCE_SEQ})"
            )));
        }
        let order = Order::open(reference, seq, draft, Utc::now())?;
        let conflict = || OrderError::ReferenceConflict {
            kind,
            last_candidate: order.reference.clone(),
            attempts: 1,
        };

        let mut tx = self.store.begin()?;
        match tx.insert_order(&order) {
            Err(StoreError::UniqueViolation(_)) => return Err(conflict()),
            other => other?,
        }
        match tx.commit() {
            Err(StoreError::UniqueViolation(_)) => Err(conflict()),
            other => {
                other?;
                Ok(order)
            }
        }
    }

    fn create_with_issued_reference(&self, draft: &NewOrder) -> OrderResult<Order> {
        let kind = draft.kind;
        let pattern = self.pattern(kind);
        let mut last_candidate = String::new();

        for attempt in 1..=self.max_attempts {
            let now = Utc::now();
            let mut tx = self.store.begin()?;
            let seq = issue_seq(tx.as_mut(), kind, u64::from(attempt - 1))?;
            let reference = pattern.format(seq, now.date_naive());
            last_candidate = reference.clone();
            let order = Order::open(reference, seq, draft, now)?;

            match tx.insert_order(&order) {
                Err(StoreError::UniqueViolation(msg)) => {
                    debug!(attempt, reference = %order.reference, %msg, "reference taken, retrying");
                    continue;
                }
                other => other?,
            }
            match tx.commit() {
                Err(StoreError::UniqueViolation(msg)) => {
                    debug!(attempt, reference = %order.reference, %msg, "reference taken at commit, retrying");
                    continue;
                }
                other => other?,
            }
            return Ok(order);
        }

        warn!(kind = %kind, attempts = self.max_attempts, %last_candidate, "reference generation exhausted");
        Err(OrderError::ReferenceConflict {
            kind,
            last_candidate,
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn generator() -> (Arc<InMemoryStore>, ReferenceGenerator<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let generator = ReferenceGenerator::new(store.clone(), &ReferenceConfig::default()).unwrap();
        (store, generator)
    }

    #[test]
    fn references_follow_the_pattern_and_increase() {
        let (_, generator) = generator();
        let a = generator.create_order(NewOrder::new(OrderKind::Purchase)).unwrap();
        let b = generator.create_order(NewOrder::new(OrderKind::Purchase)).unwrap();
        let c = generator.create_order(NewOrder::new(OrderKind::Sales)).unwrap();
        assert_eq!(a.reference, "PO-0001");
        assert_eq!(b.reference, "PO-0002");
        assert_eq!(b.reference_seq, 2);
        assert_eq!(c.reference, "SO-0001");
    }

    #[test]
    fn peek_does_not_consume() {
        let (_, generator) = generator();
        assert_eq!(generator.peek_reference(OrderKind::Build).unwrap(), "BO-0001");
        assert_eq!(generator.peek_reference(OrderKind::Build).unwrap(), "BO-0001");
        assert_eq!(generator.next_reference(OrderKind::Build).unwrap(), "BO-0001");
        assert_eq!(generator.peek_reference(OrderKind::Build).unwrap(), "BO-0002");
    }

    #[test]
    fn manual_reference_must_match_and_be_unique() {
        let (_, generator) = generator();
        let draft = NewOrder::new(OrderKind::Loan).with_reference("LO-0042");
        let order = generator.create_order(draft.clone()).unwrap();
        assert_eq!(order.reference_seq, 42);

        match generator.create_order(draft).unwrap_err() {
            OrderError::ReferenceConflict { attempts, last_candidate, .. } => {
                assert_eq!(attempts, 1);
                assert_eq!(last_candidate, "LO-0042");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let bad = NewOrder::new(OrderKind::Loan).with_reference("LOAN/7");
        assert!(matches!(generator.create_order(bad), Err(OrderError::Validation(_))));

        let next = generator.create_order(NewOrder::new(OrderKind::Loan)).unwrap();
        assert_eq!(next.reference, "LO-0043");
    }

    #[test]
    fn sequence_range_is_bounded() {
        let (_, generator) = generator();
        for reference in ["LO-18446744073709551615", "LO-99999999999999999999", "LO-9223372036854775807"] {
            let draft = NewOrder::new(OrderKind::Loan).with_reference(reference);
            match generator.create_order(draft).unwrap_err() {
                OrderError::Validation(_) => {}
                other => panic!("unexpected error for {reference}: {other:?}"),
            }
        }

        let last_manual = NewOrder::new(OrderKind::Loan).with_reference("LO-9223372036854775806");
        generator.create_order(last_manual).unwrap();
        assert_eq!(
            generator.peek_reference(OrderKind::Loan).unwrap(),
            "LO-9223372036854775807"
        );
        let last = generator.create_order(NewOrder::new(OrderKind::Loan)).unwrap();
        assert_eq!(last.reference_seq, MAX_REFERENCE_SEQ);

        match generator.create_order(NewOrder::new(OrderKind::Loan)).unwrap_err() {
            OrderError::Validation(msg) => assert!(msg.contains("exhausted"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(generator.peek_reference(OrderKind::Loan), Err(OrderError::Validation(_))));
        assert!(matches!(generator.next_reference(OrderKind::Loan), Err(OrderError::Validation(_))));

        let other_kind = generator.create_order(NewOrder::new(OrderKind::Sales)).unwrap();
        assert_eq!(other_kind.reference, "SO-0001");
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let (_, generator) = generator();
        assert!(generator.set_pattern(OrderKind::Sales, "SO-{seq}-{seq}").is_err());
        assert_eq!(generator.pattern(OrderKind::Sales).as_str(), "SO-{seq:04d}");
    }
}
