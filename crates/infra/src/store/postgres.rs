//! Postgres-backed store.
//!
//! Row locks are `SELECT ... FOR UPDATE` inside one database transaction per
//! [`StoreTx`]. Each transaction sets `lock_timeout`, so a contended row fails
//! with SQLSTATE `55P03` instead of waiting indefinitely.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `UniqueViolation` |
//! | Database (lock not available) | `55P03` | `LockTimeout` |
//! | Database (deadlock detected) | `40P01` | `LockTimeout` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / Other | N/A | `Backend` |
//!
//! The [`Store`] trait is synchronous. Calls are driven with `block_on` on the
//! runtime handle given at construction, so they must come from threads that
//! are not themselves executing async tasks (worker threads, the scheduler).

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;
use uuid::Uuid;

use orderflow_core::{
    AllocationId, CatalogItemId, LineItemId, OrderId, OrderKind, Quantity, StatusCode,
    StockUnitId, TrackingEntryId, UserId,
};
use orderflow_orders::{
    Allocation, Color, CustomState, LineCounters, LineItem, Order, StockStatus, StockUnit,
    TrackingCode, TrackingEntry,
};

use super::{DueQuery, Store, StoreError, StoreResult, StoreTx};
use crate::config::DatabaseConfig;

const SCHEMA: &str = include_str!("../../migrations/0001_orderflow.sql");

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, PgArguments>;

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    handle: Handle,
    lock_wait: Duration,
}

impl PostgresStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool,
            handle,
            lock_wait: Duration::from_secs(5),
        }
    }

    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    /// Open a pool for `config`.
    #[instrument(skip(config), fields(max_connections = config.max_connections), err)]
    pub async fn connect(config: &DatabaseConfig) -> StoreResult<PgPool> {
        PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))
    }

    /// Create missing tables and indexes. Idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Store for PostgresStore {
    fn begin(&self) -> StoreResult<Box<dyn StoreTx + '_>> {
        let mut tx = self
            .handle
            .block_on(self.pool.begin())
            .map_err(|e| map_sqlx_error("begin", e))?;
        let stmt = format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_wait.as_millis().max(1)
        );
        self.handle
            .block_on(sqlx::query(&stmt).execute(&mut *tx))
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(Box::new(PgTx {
            tx,
            handle: self.handle.clone(),
        }))
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
    handle: Handle,
}

impl PgTx {
    fn execute(&mut self, op: &str, query: PgQuery<'_>) -> StoreResult<u64> {
        let conn = &mut *self.tx;
        self.handle
            .block_on(query.execute(conn))
            .map(|done| done.rows_affected())
            .map_err(|e| map_sqlx_error(op, e))
    }

    fn fetch_optional(&mut self, op: &str, query: PgQuery<'_>) -> StoreResult<Option<PgRow>> {
        let conn = &mut *self.tx;
        self.handle
            .block_on(query.fetch_optional(conn))
            .map_err(|e| map_sqlx_error(op, e))
    }

    fn fetch_all(&mut self, op: &str, query: PgQuery<'_>) -> StoreResult<Vec<PgRow>> {
        let conn = &mut *self.tx;
        self.handle
            .block_on(query.fetch_all(conn))
            .map_err(|e| map_sqlx_error(op, e))
    }

    /// Fails with `NotFound` when `query` touched no row.
    fn execute_one(
        &mut self,
        op: &str,
        query: PgQuery<'_>,
        entity: &'static str,
        id: impl core::fmt::Display,
    ) -> StoreResult<()> {
        match self.execute(op, query)? {
            0 => Err(StoreError::not_found(entity, id)),
            _ => Ok(()),
        }
    }

    fn orders(&mut self, op: &str, query: PgQuery<'_>) -> StoreResult<Vec<Order>> {
        self.fetch_all(op, query)?.iter().map(order_from_row).collect()
    }

    fn allocations(&mut self, op: &str, query: PgQuery<'_>) -> StoreResult<Vec<Allocation>> {
        self.fetch_all(op, query)?
            .iter()
            .map(allocation_from_row)
            .collect()
    }
}

const ORDER_COLUMNS: &str = "id, kind, reference, reference_seq, status, custom_status, \
     description, created_by, responsible, created_at, issued_at, due_date, completed_at";
const LINE_COLUMNS: &str =
    "id, order_id, catalog_item, required, target_date, allocated, fulfilled, returned, settled";
const UNIT_COLUMNS: &str = "id, catalog_item, total_quantity, serial, status, created_at";
const ALLOCATION_COLUMNS: &str =
    "id, line_id, order_id, stock_unit_id, quantity, fulfilled, created_at";

impl StoreTx for PgTx {
    fn insert_order(&mut self, order: &Order) -> StoreResult<()> {
        let query = sqlx::query(
            r#"
            INSERT INTO orders (
                id, kind, reference, reference_seq, status, custom_status, description,
                created_by, responsible, created_at, issued_at, due_date, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        );
        self.execute("insert_order", bind_order(query, order)?)?;
        Ok(())
    }

    fn get_order(&mut self, id: OrderId) -> StoreResult<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        self.fetch_optional("get_order", sqlx::query(&sql).bind(*id.as_uuid()))?
            .as_ref()
            .map(order_from_row)
            .transpose()
    }

    fn lock_order(&mut self, id: OrderId) -> StoreResult<Order> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE");
        self.fetch_optional("lock_order", sqlx::query(&sql).bind(*id.as_uuid()))?
            .as_ref()
            .map(order_from_row)
            .transpose()?
            .ok_or_else(|| StoreError::not_found("order", id))
    }

    fn update_order(&mut self, order: &Order) -> StoreResult<()> {
        let query = sqlx::query(
            r#"
            UPDATE orders SET
                kind = $2, reference = $3, reference_seq = $4, status = $5, custom_status = $6,
                description = $7, created_by = $8, responsible = $9, created_at = $10,
                issued_at = $11, due_date = $12, completed_at = $13
            WHERE id = $1
            "#,
        );
        self.execute_one("update_order", bind_order(query, order)?, "order", order.id)
    }

    fn delete_order(&mut self, id: OrderId) -> StoreResult<()> {
        let query = sqlx::query("DELETE FROM orders WHERE id = $1").bind(*id.as_uuid());
        self.execute_one("delete_order", query, "order", id)
    }

    fn find_order_by_reference(
        &mut self,
        kind: OrderKind,
        reference: &str,
    ) -> StoreResult<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE kind = $1 AND reference = $2");
        let query = sqlx::query(&sql).bind(kind.as_str()).bind(reference);
        self.fetch_optional("find_order_by_reference", query)?
            .as_ref()
            .map(order_from_row)
            .transpose()
    }

    fn due_orders(&mut self, query: &DueQuery) -> StoreResult<Vec<Order>> {
        let sql = format!(
            r#"
            SELECT {ORDER_COLUMNS} FROM orders
            WHERE kind = $1
              AND status = ANY($2)
              AND due_date IS NOT NULL
              AND due_date < $3
              AND ($4::date IS NULL OR due_date >= $4)
            ORDER BY due_date ASC, reference_seq ASC
            "#
        );
        let statuses: Vec<i32> = query.statuses.iter().map(|s| i32::from(s.value())).collect();
        let q = sqlx::query(&sql)
            .bind(query.kind.as_str())
            .bind(statuses)
            .bind(query.due_before)
            .bind(query.due_on_or_after);
        self.orders("due_orders", q)
    }

    fn lock_counter(&mut self, kind: OrderKind) -> StoreResult<u64> {
        let seed = sqlx::query(
            "INSERT INTO reference_counters (kind, value) VALUES ($1, 0) ON CONFLICT (kind) DO NOTHING",
        )
        .bind(kind.as_str());
        self.execute("lock_counter", seed)?;
        let query = sqlx::query("SELECT value FROM reference_counters WHERE kind = $1 FOR UPDATE")
            .bind(kind.as_str());
        let row = self
            .fetch_optional("lock_counter", query)?
            .ok_or_else(|| StoreError::not_found("reference counter", kind))?;
        unsigned(&row, "value")
    }

    fn set_counter(&mut self, kind: OrderKind, value: u64) -> StoreResult<()> {
        let query = sqlx::query(
            r#"
            INSERT INTO reference_counters (kind, value) VALUES ($1, $2)
            ON CONFLICT (kind) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(kind.as_str())
        .bind(signed(value)?);
        self.execute("set_counter", query)?;
        Ok(())
    }

    fn max_reference_seq(&mut self, kind: OrderKind) -> StoreResult<u64> {
        let query = sqlx::query(
            "SELECT COALESCE(MAX(reference_seq), 0) AS max_seq FROM orders WHERE kind = $1",
        )
        .bind(kind.as_str());
        let row = self
            .fetch_optional("max_reference_seq", query)?
            .ok_or_else(|| StoreError::Backend("aggregate returned no row".into()))?;
        unsigned(&row, "max_seq")
    }

    fn insert_line(&mut self, line: &LineItem) -> StoreResult<()> {
        let query = sqlx::query(
            r#"
            INSERT INTO line_items (
                id, order_id, catalog_item, required, target_date,
                allocated, fulfilled, returned, settled
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        );
        self.execute("insert_line", bind_line(query, line))?;
        Ok(())
    }

    fn get_line(&mut self, id: LineItemId) -> StoreResult<Option<LineItem>> {
        let sql = format!("SELECT {LINE_COLUMNS} FROM line_items WHERE id = $1");
        self.fetch_optional("get_line", sqlx::query(&sql).bind(*id.as_uuid()))?
            .as_ref()
            .map(line_from_row)
            .transpose()
    }

    fn lock_line(&mut self, id: LineItemId) -> StoreResult<LineItem> {
        let sql = format!("SELECT {LINE_COLUMNS} FROM line_items WHERE id = $1 FOR UPDATE");
        self.fetch_optional("lock_line", sqlx::query(&sql).bind(*id.as_uuid()))?
            .as_ref()
            .map(line_from_row)
            .transpose()?
            .ok_or_else(|| StoreError::not_found("line item", id))
    }

    fn update_line(&mut self, line: &LineItem) -> StoreResult<()> {
        let query = sqlx::query(
            r#"
            UPDATE line_items SET
                order_id = $2, catalog_item = $3, required = $4, target_date = $5,
                allocated = $6, fulfilled = $7, returned = $8, settled = $9
            WHERE id = $1
            "#,
        );
        self.execute_one("update_line", bind_line(query, line), "line item", line.id)
    }

    fn delete_line(&mut self, id: LineItemId) -> StoreResult<()> {
        let query = sqlx::query("DELETE FROM line_items WHERE id = $1").bind(*id.as_uuid());
        self.execute_one("delete_line", query, "line item", id)
    }

    fn lines_for_order(&mut self, order: OrderId) -> StoreResult<Vec<LineItem>> {
        let sql = format!("SELECT {LINE_COLUMNS} FROM line_items WHERE order_id = $1 ORDER BY id");
        self.fetch_all("lines_for_order", sqlx::query(&sql).bind(*order.as_uuid()))?
            .iter()
            .map(line_from_row)
            .collect()
    }

    fn insert_stock_unit(&mut self, unit: &StockUnit) -> StoreResult<()> {
        let query = sqlx::query(
            r#"
            INSERT INTO stock_units (id, catalog_item, total_quantity, serial, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        );
        self.execute("insert_stock_unit", bind_unit(query, unit))?;
        Ok(())
    }

    fn get_stock_unit(&mut self, id: StockUnitId) -> StoreResult<Option<StockUnit>> {
        let sql = format!("SELECT {UNIT_COLUMNS} FROM stock_units WHERE id = $1");
        self.fetch_optional("get_stock_unit", sqlx::query(&sql).bind(*id.as_uuid()))?
            .as_ref()
            .map(unit_from_row)
            .transpose()
    }

    fn lock_stock_unit(&mut self, id: StockUnitId) -> StoreResult<StockUnit> {
        let sql = format!("SELECT {UNIT_COLUMNS} FROM stock_units WHERE id = $1 FOR UPDATE");
        self.fetch_optional("lock_stock_unit", sqlx::query(&sql).bind(*id.as_uuid()))?
            .as_ref()
            .map(unit_from_row)
            .transpose()?
            .ok_or_else(|| StoreError::not_found("stock unit", id))
    }

    fn update_stock_unit(&mut self, unit: &StockUnit) -> StoreResult<()> {
        let query = sqlx::query(
            r#"
            UPDATE stock_units SET
                catalog_item = $2, total_quantity = $3, serial = $4, status = $5, created_at = $6
            WHERE id = $1
            "#,
        );
        self.execute_one("update_stock_unit", bind_unit(query, unit), "stock unit", unit.id)
    }

    fn stock_units_for_item(&mut self, item: CatalogItemId) -> StoreResult<Vec<StockUnit>> {
        let sql =
            format!("SELECT {UNIT_COLUMNS} FROM stock_units WHERE catalog_item = $1 ORDER BY id");
        self.fetch_all("stock_units_for_item", sqlx::query(&sql).bind(*item.as_uuid()))?
            .iter()
            .map(unit_from_row)
            .collect()
    }

    fn insert_allocation(&mut self, allocation: &Allocation) -> StoreResult<()> {
        let query = sqlx::query(
            r#"
            INSERT INTO allocations (
                id, line_id, order_id, stock_unit_id, quantity, fulfilled, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        );
        self.execute("insert_allocation", bind_allocation(query, allocation))?;
        Ok(())
    }

    fn get_allocation(&mut self, id: AllocationId) -> StoreResult<Option<Allocation>> {
        let sql = format!("SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE id = $1");
        self.fetch_optional("get_allocation", sqlx::query(&sql).bind(*id.as_uuid()))?
            .as_ref()
            .map(allocation_from_row)
            .transpose()
    }

    fn update_allocation(&mut self, allocation: &Allocation) -> StoreResult<()> {
        let query = sqlx::query(
            r#"
            UPDATE allocations SET
                line_id = $2, order_id = $3, stock_unit_id = $4, quantity = $5,
                fulfilled = $6, created_at = $7
            WHERE id = $1
            "#,
        );
        self.execute_one(
            "update_allocation",
            bind_allocation(query, allocation),
            "allocation",
            allocation.id,
        )
    }

    fn delete_allocation(&mut self, id: AllocationId) -> StoreResult<()> {
        let query = sqlx::query("DELETE FROM allocations WHERE id = $1").bind(*id.as_uuid());
        self.execute_one("delete_allocation", query, "allocation", id)
    }

    fn allocations_for_unit(&mut self, unit: StockUnitId) -> StoreResult<Vec<Allocation>> {
        let sql = format!(
            "SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE stock_unit_id = $1 ORDER BY id"
        );
        self.allocations("allocations_for_unit", sqlx::query(&sql).bind(*unit.as_uuid()))
    }

    fn allocations_for_line(&mut self, line: LineItemId) -> StoreResult<Vec<Allocation>> {
        let sql =
            format!("SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE line_id = $1 ORDER BY id");
        self.allocations("allocations_for_line", sqlx::query(&sql).bind(*line.as_uuid()))
    }

    fn allocations_for_order(&mut self, order: OrderId) -> StoreResult<Vec<Allocation>> {
        let sql =
            format!("SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE order_id = $1 ORDER BY id");
        self.allocations("allocations_for_order", sqlx::query(&sql).bind(*order.as_uuid()))
    }

    fn append_tracking(&mut self, entry: &TrackingEntry) -> StoreResult<()> {
        let query = sqlx::query(
            r#"
            INSERT INTO tracking_entries (id, order_id, recorded_at, code, actor, note, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(*entry.id.as_uuid())
        .bind(*entry.order.as_uuid())
        .bind(entry.recorded_at)
        .bind(i32::from(entry.code.code()))
        .bind(entry.actor.map(|a| *a.as_uuid()))
        .bind(entry.note.as_str())
        .bind(&entry.payload);
        self.execute("append_tracking", query)?;
        Ok(())
    }

    fn tracking_for_order(&mut self, order: OrderId) -> StoreResult<Vec<TrackingEntry>> {
        let query = sqlx::query(
            r#"
            SELECT sequence, id, order_id, recorded_at, code, actor, note, payload
            FROM tracking_entries
            WHERE order_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(*order.as_uuid());
        self.fetch_all("tracking_for_order", query)?
            .iter()
            .map(tracking_from_row)
            .collect()
    }

    fn custom_states(&mut self) -> StoreResult<Vec<CustomState>> {
        let query = sqlx::query(
            "SELECT kind, key, logical, name, label, color FROM custom_states ORDER BY kind, key",
        );
        self.fetch_all("custom_states", query)?
            .iter()
            .map(custom_state_from_row)
            .collect()
    }

    fn insert_custom_state(&mut self, state: &CustomState) -> StoreResult<()> {
        let query = sqlx::query(
            r#"
            INSERT INTO custom_states (kind, key, logical, name, label, color)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(state.kind.as_str())
        .bind(i32::from(state.key))
        .bind(i32::from(state.logical.value()))
        .bind(state.name.as_str())
        .bind(state.label.as_str())
        .bind(state.color.as_str());
        self.execute("insert_custom_state", query)?;
        Ok(())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        let PgTx { tx, handle } = *self;
        handle
            .block_on(tx.commit())
            .map_err(|e| map_sqlx_error("commit", e))
    }
}

fn bind_order<'q>(query: PgQuery<'q>, order: &'q Order) -> StoreResult<PgQuery<'q>> {
    Ok(query
        .bind(*order.id.as_uuid())
        .bind(order.kind.as_str())
        .bind(order.reference.as_str())
        .bind(signed(order.reference_seq)?)
        .bind(i32::from(order.status.value()))
        .bind(order.custom_status.map(i32::from))
        .bind(order.description.as_str())
        .bind(order.created_by.map(|u| *u.as_uuid()))
        .bind(order.responsible.map(|u| *u.as_uuid()))
        .bind(order.created_at)
        .bind(order.issued_at)
        .bind(order.due_date)
        .bind(order.completed_at))
}

fn bind_line<'q>(query: PgQuery<'q>, line: &'q LineItem) -> PgQuery<'q> {
    let counters = line.counters();
    query
        .bind(*line.id.as_uuid())
        .bind(*line.order.as_uuid())
        .bind(*line.catalog_item.as_uuid())
        .bind(line.required.as_decimal())
        .bind(line.target_date)
        .bind(counters.allocated.as_decimal())
        .bind(counters.fulfilled.as_decimal())
        .bind(counters.returned.as_decimal())
        .bind(counters.settled.as_decimal())
}

fn bind_unit<'q>(query: PgQuery<'q>, unit: &'q StockUnit) -> PgQuery<'q> {
    query
        .bind(*unit.id.as_uuid())
        .bind(*unit.catalog_item.as_uuid())
        .bind(unit.total_quantity.as_decimal())
        .bind(unit.serial.as_deref())
        .bind(i32::from(unit.status.code()))
        .bind(unit.created_at)
}

fn bind_allocation<'q>(query: PgQuery<'q>, allocation: &'q Allocation) -> PgQuery<'q> {
    query
        .bind(*allocation.id.as_uuid())
        .bind(*allocation.line.as_uuid())
        .bind(*allocation.order.as_uuid())
        .bind(*allocation.stock_unit.as_uuid())
        .bind(allocation.quantity.as_decimal())
        .bind(allocation.fulfilled.as_decimal())
        .bind(allocation.created_at)
}

// Row decoding

fn backend(err: impl core::fmt::Display) -> StoreError {
    StoreError::Backend(format!("failed to decode row: {err}"))
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name).map_err(backend)
}

fn quantity(row: &PgRow, name: &str) -> StoreResult<Quantity> {
    Quantity::new(column::<Decimal>(row, name)?).map_err(backend)
}

fn unsigned(row: &PgRow, name: &str) -> StoreResult<u64> {
    u64::try_from(column::<i64>(row, name)?).map_err(backend)
}

fn signed(value: u64) -> StoreResult<i64> {
    i64::try_from(value).map_err(|e| StoreError::Backend(format!("value out of range: {e}")))
}

fn small(row: &PgRow, name: &str) -> StoreResult<u16> {
    u16::try_from(column::<i32>(row, name)?).map_err(backend)
}

fn kind(row: &PgRow) -> StoreResult<OrderKind> {
    OrderKind::from_str(&column::<String>(row, "kind")?).map_err(backend)
}

fn order_from_row(row: &PgRow) -> StoreResult<Order> {
    Ok(Order {
        id: OrderId::from_uuid(column(row, "id")?),
        kind: kind(row)?,
        reference: column(row, "reference")?,
        reference_seq: unsigned(row, "reference_seq")?,
        status: StatusCode(small(row, "status")?),
        custom_status: column::<Option<i32>>(row, "custom_status")?
            .map(u16::try_from)
            .transpose()
            .map_err(backend)?,
        description: column(row, "description")?,
        created_by: column::<Option<Uuid>>(row, "created_by")?.map(UserId::from_uuid),
        responsible: column::<Option<Uuid>>(row, "responsible")?.map(UserId::from_uuid),
        created_at: column::<DateTime<Utc>>(row, "created_at")?,
        issued_at: column::<Option<DateTime<Utc>>>(row, "issued_at")?,
        due_date: column::<Option<NaiveDate>>(row, "due_date")?,
        completed_at: column::<Option<DateTime<Utc>>>(row, "completed_at")?,
    })
}

fn line_from_row(row: &PgRow) -> StoreResult<LineItem> {
    let counters = LineCounters {
        allocated: quantity(row, "allocated")?,
        fulfilled: quantity(row, "fulfilled")?,
        returned: quantity(row, "returned")?,
        settled: quantity(row, "settled")?,
    };
    LineItem::restore(
        LineItemId::from_uuid(column(row, "id")?),
        OrderId::from_uuid(column(row, "order_id")?),
        CatalogItemId::from_uuid(column(row, "catalog_item")?),
        quantity(row, "required")?,
        column::<Option<NaiveDate>>(row, "target_date")?,
        counters,
    )
    .map_err(backend)
}

fn unit_from_row(row: &PgRow) -> StoreResult<StockUnit> {
    let code = small(row, "status")?;
    Ok(StockUnit {
        id: StockUnitId::from_uuid(column(row, "id")?),
        catalog_item: CatalogItemId::from_uuid(column(row, "catalog_item")?),
        total_quantity: quantity(row, "total_quantity")?,
        serial: column(row, "serial")?,
        status: StockStatus::from_code(code)
            .ok_or_else(|| backend(format!("unknown stock status {code}")))?,
        created_at: column(row, "created_at")?,
    })
}

fn allocation_from_row(row: &PgRow) -> StoreResult<Allocation> {
    Ok(Allocation {
        id: AllocationId::from_uuid(column(row, "id")?),
        line: LineItemId::from_uuid(column(row, "line_id")?),
        order: OrderId::from_uuid(column(row, "order_id")?),
        stock_unit: StockUnitId::from_uuid(column(row, "stock_unit_id")?),
        quantity: quantity(row, "quantity")?,
        fulfilled: quantity(row, "fulfilled")?,
        created_at: column(row, "created_at")?,
    })
}

fn tracking_from_row(row: &PgRow) -> StoreResult<TrackingEntry> {
    let code = small(row, "code")?;
    Ok(TrackingEntry {
        id: TrackingEntryId::from_uuid(column(row, "id")?),
        order: OrderId::from_uuid(column(row, "order_id")?),
        sequence: unsigned(row, "sequence")?,
        recorded_at: column(row, "recorded_at")?,
        code: TrackingCode::from_code(code)
            .ok_or_else(|| backend(format!("unknown tracking code {code}")))?,
        actor: column::<Option<Uuid>>(row, "actor")?.map(UserId::from_uuid),
        note: column(row, "note")?,
        payload: column(row, "payload")?,
    })
}

fn custom_state_from_row(row: &PgRow) -> StoreResult<CustomState> {
    let color: String = column(row, "color")?;
    Ok(CustomState {
        kind: kind(row)?,
        key: small(row, "key")?,
        logical: StatusCode(small(row, "logical")?),
        name: column(row, "name")?,
        label: column(row, "label")?,
        color: Color::parse(&color).ok_or_else(|| backend(format!("unknown colour '{color}'")))?,
    })
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::UniqueViolation(msg),
                Some("55P03") | Some("40P01") => StoreError::LockTimeout(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            StoreError::Backend(format!("unexpected row not found in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
