//! Orders, line items, stock units and allocations.

use chrono::{DateTime, NaiveDate, Utc};
use orderflow_core::{
    AllocationId, CatalogItemId, Entity, LineItemId, LineShortfall, OrderError, OrderId,
    OrderKind, OrderResult, Quantity, QuantityLimit, StatusCode, StockUnitId, UserId,
};
use serde::{Deserialize, Serialize};

use crate::kinds::{CompletionRule, descriptor};

/// Maximum length of an order reference.
pub const MAX_REFERENCE_LEN: usize = 64;

/// Largest sequence number an order reference may carry (the store column is a signed 64-bit integer).
pub const MAX_REFERENCE_SEQ: u64 = i64::MAX as u64;

/// Input for order creation. The reference is issued by the generator unless given.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub kind: OrderKind,
    pub reference: Option<String>,
    pub description: String,
    pub created_by: Option<UserId>,
    pub responsible: Option<UserId>,
    pub due_date: Option<NaiveDate>,
}

impl NewOrder {
    pub fn new(kind: OrderKind) -> Self {
        Self {
            kind,
            reference: None,
            description: String::new(),
            created_by: None,
            responsible: None,
            due_date: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn created_by(mut self, user: UserId) -> Self {
        self.created_by = Some(user);
        self
    }

    pub fn responsible(mut self, user: UserId) -> Self {
        self.responsible = Some(user);
        self
    }

    pub fn due(mut self, date: NaiveDate) -> Self {
        self.due_date = Some(date);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub kind: OrderKind,
    pub reference: String,
    /// Integer part of the reference, used for ordering and sequence issuance.
    pub reference_seq: u64,
    pub status: StatusCode,
    pub custom_status: Option<u16>,
    pub description: String,
    pub created_by: Option<UserId>,
    pub responsible: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub issued_at: Option<DateTime<Utc>>,
    pub due_date: Option<NaiveDate>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Order {
    /// A fresh order in its kind's initial state.
    pub fn open(
        reference: String,
        reference_seq: u64,
        draft: &NewOrder,
        now: DateTime<Utc>,
    ) -> OrderResult<Self> {
        let kind = draft.kind;
        if reference.trim().is_empty() {
            return Err(OrderError::validation("order reference must not be empty"));
        }
        if reference.len() > MAX_REFERENCE_LEN {
            return Err(OrderError::validation(format!(
                "order reference '{reference}' exceeds {MAX_REFERENCE_LEN} characters"
            )));
        }
        if reference_seq > MAX_REFERENCE_SEQ {
            return Err(OrderError::validation(format!(
                "order reference '{reference}' carries sequence {reference_seq}, above {MAX_REFERENCE_SEQ}"
            )));
        }
        if let Some(due) = draft.due_date {
            if due < now.date_naive() {
                return Err(OrderError::validation(format!(
                    "due date {due} is before the creation date"
                )));
            }
        }
        Ok(Self {
            id: OrderId::new(),
            kind,
            reference,
            reference_seq,
            status: descriptor(kind).initial,
            custom_status: None,
            description: draft.description.clone(),
            created_by: draft.created_by,
            responsible: draft.responsible,
            created_at: now,
            issued_at: None,
            due_date: draft.due_date,
            completed_at: None,
        })
    }

    pub fn is_open(&self) -> bool {
        descriptor(self.kind).is_open(self.status)
    }

    pub fn is_closed(&self) -> bool {
        descriptor(self.kind).is_closed(self.status)
    }

    pub fn is_overdue_at(&self, today: NaiveDate) -> bool {
        self.is_open() && self.due_date.is_some_and(|due| due < today)
    }

    /// Users who hear about this order's events.
    pub fn notification_targets(&self) -> Vec<UserId> {
        let mut targets: Vec<UserId> = self.created_by.into_iter().collect();
        if let Some(responsible) = self.responsible {
            if !targets.contains(&responsible) {
                targets.push(responsible);
            }
        }
        targets
    }
}

impl Entity for Order {
    type Id = OrderId;

    fn id(&self) -> OrderId {
        self.id
    }
}

/// Counters derived from a line's allocations.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineCounters {
    pub allocated: Quantity,
    pub fulfilled: Quantity,
    pub returned: Quantity,
    pub settled: Quantity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: LineItemId,
    pub order: OrderId,
    pub catalog_item: CatalogItemId,
    pub required: Quantity,
    pub target_date: Option<NaiveDate>,
    counters: LineCounters,
}

impl LineItem {
    pub fn new(order: OrderId, catalog_item: CatalogItemId, required: Quantity) -> OrderResult<Self> {
        if required.is_zero() {
            return Err(OrderError::validation("line quantity must be greater than zero"));
        }
        Ok(Self {
            id: LineItemId::new(),
            order,
            catalog_item,
            required,
            target_date: None,
            counters: LineCounters::default(),
        })
    }

    /// Rebuild a stored line, rejecting counters that break the line bounds.
    pub fn restore(
        id: LineItemId,
        order: OrderId,
        catalog_item: CatalogItemId,
        required: Quantity,
        target_date: Option<NaiveDate>,
        counters: LineCounters,
    ) -> OrderResult<Self> {
        let line = Self {
            id,
            order,
            catalog_item,
            required,
            target_date,
            counters,
        };
        line.check()?;
        Ok(line)
    }

    pub fn counters(&self) -> LineCounters {
        self.counters
    }

    pub fn allocated(&self) -> Quantity {
        self.counters.allocated
    }

    pub fn fulfilled(&self) -> Quantity {
        self.counters.fulfilled
    }

    pub fn returned(&self) -> Quantity {
        self.counters.returned
    }

    pub fn settled(&self) -> Quantity {
        self.counters.settled
    }

    /// Fulfilled but neither returned nor settled: physically out.
    pub fn outstanding(&self) -> Quantity {
        self.counters.fulfilled.saturating_sub(self.counters.settled)
    }

    /// Quantity still open for reservation.
    pub fn unreserved(&self) -> Quantity {
        self.required
            .saturating_sub(self.counters.allocated + self.counters.returned)
    }

    pub fn has_activity(&self) -> bool {
        self.counters != LineCounters::default()
    }

    fn check(&self) -> OrderResult<()> {
        let c = self.counters;
        if c.allocated + c.returned > self.required {
            return Err(OrderError::exceeded(
                QuantityLimit::LineRequired,
                c.allocated + c.returned,
                self.required,
            ));
        }
        if c.fulfilled > c.allocated {
            return Err(OrderError::exceeded(
                QuantityLimit::LineAllocated,
                c.fulfilled,
                c.allocated,
            ));
        }
        if c.settled > c.fulfilled {
            return Err(OrderError::exceeded(
                QuantityLimit::LineFulfilled,
                c.settled,
                c.fulfilled,
            ));
        }
        Ok(())
    }

    fn apply(&mut self, next: LineCounters) -> OrderResult<()> {
        let previous = self.counters;
        self.counters = next;
        if let Err(err) = self.check() {
            self.counters = previous;
            return Err(err);
        }
        Ok(())
    }

    pub fn reserve(&mut self, q: Quantity) -> OrderResult<()> {
        let mut next = self.counters;
        next.allocated += q;
        self.apply(next)
    }

    /// Undo a reservation that was never fulfilled.
    pub fn unreserve(&mut self, q: Quantity) -> OrderResult<()> {
        let unfulfilled = self.counters.allocated.saturating_sub(self.counters.fulfilled);
        let mut next = self.counters;
        next.allocated = self
            .counters
            .allocated
            .checked_sub(q)
            .filter(|_| q <= unfulfilled)
            .ok_or_else(|| OrderError::exceeded(QuantityLimit::LineAllocated, q, unfulfilled))?;
        self.apply(next)
    }

    pub fn fulfil(&mut self, q: Quantity) -> OrderResult<()> {
        let mut next = self.counters;
        next.fulfilled += q;
        self.apply(next)
    }

    /// Loaned stock came back.
    pub fn give_back(&mut self, q: Quantity) -> OrderResult<()> {
        let outstanding = self.outstanding();
        if q > outstanding {
            return Err(OrderError::exceeded(QuantityLimit::LineFulfilled, q, outstanding));
        }
        let mut next = self.counters;
        next.fulfilled = next.fulfilled.saturating_sub(q);
        next.allocated = next.allocated.saturating_sub(q);
        next.returned += q;
        self.apply(next)
    }

    /// Fulfilled stock reached its final fate (released or consumed).
    pub fn settle(&mut self, q: Quantity) -> OrderResult<()> {
        let mut next = self.counters;
        next.settled += q;
        self.apply(next)
    }

    pub fn is_satisfied(&self, rule: CompletionRule) -> bool {
        match rule {
            CompletionRule::Fulfilled => self.counters.fulfilled == self.required,
            CompletionRule::Returned => self.counters.returned == self.required,
        }
    }

    pub fn shortfall(&self, rule: CompletionRule) -> Option<LineShortfall> {
        if self.is_satisfied(rule) {
            return None;
        }
        let satisfied = match rule {
            CompletionRule::Fulfilled => self.counters.fulfilled,
            CompletionRule::Returned => self.counters.returned,
        };
        Some(LineShortfall {
            line: self.id,
            required: self.required,
            satisfied,
        })
    }
}

impl Entity for LineItem {
    type Id = LineItemId;

    fn id(&self) -> LineItemId {
        self.id
    }
}

/// Stock lifecycle status, independent of any order status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum StockStatus {
    Ok = 10,
    Attention = 50,
    Damaged = 55,
    Destroyed = 60,
    Rejected = 65,
    Lost = 70,
    Quarantined = 75,
    Returned = 85,
    Consumed = 90,
}

impl StockStatus {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            10 => StockStatus::Ok,
            50 => StockStatus::Attention,
            55 => StockStatus::Damaged,
            60 => StockStatus::Destroyed,
            65 => StockStatus::Rejected,
            70 => StockStatus::Lost,
            75 => StockStatus::Quarantined,
            85 => StockStatus::Returned,
            90 => StockStatus::Consumed,
            _ => return None,
        })
    }

    /// Stock in these states may be reserved.
    pub fn is_allocatable(self) -> bool {
        matches!(
            self,
            StockStatus::Ok | StockStatus::Attention | StockStatus::Damaged
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockUnit {
    pub id: StockUnitId,
    pub catalog_item: CatalogItemId,
    pub total_quantity: Quantity,
    pub serial: Option<String>,
    pub status: StockStatus,
    pub created_at: DateTime<Utc>,
}

impl StockUnit {
    pub fn new(catalog_item: CatalogItemId, quantity: Quantity) -> Self {
        Self {
            id: StockUnitId::new(),
            catalog_item,
            total_quantity: quantity,
            serial: None,
            status: StockStatus::Ok,
            created_at: Utc::now(),
        }
    }

    /// A uniquely identified unit; its quantity is always one.
    pub fn serialized(catalog_item: CatalogItemId, serial: impl Into<String>) -> OrderResult<Self> {
        let serial = serial.into();
        if serial.trim().is_empty() {
            return Err(OrderError::validation("serial number must not be empty"));
        }
        Ok(Self {
            serial: Some(serial),
            ..Self::new(catalog_item, Quantity::ONE)
        })
    }

    pub fn is_serialized(&self) -> bool {
        self.serial.is_some()
    }
}

impl Entity for StockUnit {
    type Id = StockUnitId;

    fn id(&self) -> StockUnitId {
        self.id
    }
}

/// Reservation of stock-unit quantity to one line item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub line: LineItemId,
    pub order: OrderId,
    pub stock_unit: StockUnitId,
    pub quantity: Quantity,
    /// Part of `quantity` the consumer has physically taken.
    pub fulfilled: Quantity,
    pub created_at: DateTime<Utc>,
}

impl Allocation {
    pub fn new(line: &LineItem, unit: &StockUnit, quantity: Quantity) -> Self {
        Self {
            id: AllocationId::new(),
            line: line.id,
            order: line.order,
            stock_unit: unit.id,
            quantity,
            fulfilled: Quantity::ZERO,
            created_at: Utc::now(),
        }
    }

    pub fn unfulfilled(&self) -> Quantity {
        self.quantity.saturating_sub(self.fulfilled)
    }
}

impl Entity for Allocation {
    type Id = AllocationId;

    fn id(&self) -> AllocationId {
        self.id
    }
}
