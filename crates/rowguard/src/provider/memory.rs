//! In-memory data provider
//!
//! Rows live in per-entity tables behind a `parking_lot` lock. A transaction
//! holds an async gate exclusively for its whole duration and rolls back by
//! restoring the snapshot taken when it started. Every other operation waits
//! on the gate, so no caller sees uncommitted rows and a rollback never
//! discards a write made outside the transaction. Calls made from the task
//! running the transaction pass straight through.
//!
//! Work inside a transaction must stay on the calling task; a spawned task
//! touching the same provider waits for the transaction to end.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{RwLock as AsyncRwLock, RwLockReadGuard};

use super::{DataProvider, Pagination, TransactionWork};
use crate::error::{Error, Result};
use crate::filter::{Entity, Filter};

tokio::task_local! {
    /// Address of the provider whose transaction this task is running
    static ACTIVE_TRANSACTION: usize;
}

#[derive(Debug, Clone)]
struct Table {
    primary_key: String,
    rows: Vec<Entity>,
}

impl Table {
    fn position(&self, id: &Value) -> Option<usize> {
        let by_id = Filter::eq(self.primary_key.clone(), id.clone());
        self.rows.iter().position(|row| by_id.matches(row))
    }
}

#[derive(Debug)]
pub struct InMemoryProvider {
    name: String,
    tables: RwLock<HashMap<String, Table>>,
    transaction_gate: AsyncRwLock<()>,
    next_id: AtomicU64,
    transactions: bool,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl InMemoryProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: RwLock::new(HashMap::new()),
            transaction_gate: AsyncRwLock::new(()),
            next_id: AtomicU64::new(1),
            transactions: true,
        }
    }

    /// Disable transaction support, as a plain key-value backend would
    #[must_use]
    pub const fn without_transactions(mut self) -> Self {
        self.transactions = false;
        self
    }

    #[must_use]
    pub fn with_entity(self, entity: impl Into<String>, primary_key: impl Into<String>) -> Self {
        self.tables.write().insert(
            entity.into(),
            Table {
                primary_key: primary_key.into(),
                rows: Vec::new(),
            },
        );
        self
    }

    fn address(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    fn in_transaction(&self) -> bool {
        ACTIVE_TRANSACTION
            .try_with(|owner| *owner == self.address())
            .unwrap_or(false)
    }

    /// Wait out a running transaction unless this task is the one running it
    async fn gate(&self) -> Option<RwLockReadGuard<'_, ()>> {
        if self.in_transaction() {
            None
        } else {
            Some(self.transaction_gate.read().await)
        }
    }

    /// Insert rows as-is, bypassing id assignment and the transaction gate
    pub fn seed(&self, entity: &str, rows: impl IntoIterator<Item = Entity>) -> Result<()> {
        let mut tables = self.tables.write();
        let table = table_mut(&mut tables, entity)?;
        table.rows.extend(rows);
        Ok(())
    }

    /// Copy of every row currently stored for `entity`
    #[must_use]
    pub fn rows(&self, entity: &str) -> Vec<Entity> {
        self.tables
            .read()
            .get(entity)
            .map(|table| table.rows.clone())
            .unwrap_or_default()
    }
}

fn table_mut<'a>(tables: &'a mut HashMap<String, Table>, entity: &str) -> Result<&'a mut Table> {
    tables
        .get_mut(entity)
        .ok_or_else(|| Error::Provider(format!("unknown entity: {entity}")))
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (None | Some(Value::Null), Some(_)) => Ordering::Less,
        (Some(_), None | Some(Value::Null)) => Ordering::Greater,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl DataProvider for InMemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn find(
        &self,
        entity: &str,
        filter: &Filter,
        pagination: &Pagination,
    ) -> Result<Vec<Entity>> {
        let _gate = self.gate().await;
        let tables = self.tables.read();
        let table = tables
            .get(entity)
            .ok_or_else(|| Error::Provider(format!("unknown entity: {entity}")))?;

        let mut rows: Vec<Entity> = table
            .rows
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect();

        if let Some(order) = &pagination.order_by {
            rows.sort_by(|a, b| {
                let ordering = compare_values(a.get(&order.field), b.get(&order.field));
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        Ok(rows
            .into_iter()
            .skip(pagination.offset)
            .take(pagination.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn find_one(&self, entity: &str, filter: &Filter) -> Result<Option<Entity>> {
        let _gate = self.gate().await;
        let tables = self.tables.read();
        let table = tables
            .get(entity)
            .ok_or_else(|| Error::Provider(format!("unknown entity: {entity}")))?;
        Ok(table.rows.iter().find(|row| filter.matches(row)).cloned())
    }

    async fn create_one(&self, entity: &str, mut data: Entity) -> Result<Entity> {
        let _gate = self.gate().await;
        let mut tables = self.tables.write();
        let table = table_mut(&mut tables, entity)?;

        match data.get(&table.primary_key) {
            Some(id) if !id.is_null() => {
                if table.position(id).is_some() {
                    return Err(Error::Provider(format!(
                        "{entity} with id {id} already exists"
                    )));
                }
            }
            _ => {
                let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
                data.insert(table.primary_key.clone(), Value::from(id));
            }
        }

        table.rows.push(data.clone());
        Ok(data)
    }

    async fn update_one(&self, entity: &str, id: &Value, data: Entity) -> Result<Entity> {
        let _gate = self.gate().await;
        let mut tables = self.tables.write();
        let table = table_mut(&mut tables, entity)?;

        let index = table.position(id).ok_or_else(|| Error::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        })?;

        let primary_key = table.primary_key.clone();
        let row = &mut table.rows[index];
        for (field, value) in data {
            if field != primary_key {
                row.insert(field, value);
            }
        }
        Ok(row.clone())
    }

    async fn delete_one(&self, entity: &str, filter: &Filter) -> Result<Option<Entity>> {
        let _gate = self.gate().await;
        let mut tables = self.tables.write();
        let table = table_mut(&mut tables, entity)?;

        Ok(table
            .rows
            .iter()
            .position(|row| filter.matches(row))
            .map(|index| table.rows.remove(index)))
    }

    fn supports_transactions(&self) -> bool {
        self.transactions
    }

    async fn with_transaction<'a>(&'a self, work: TransactionWork<'a>) -> Result<Vec<Entity>> {
        if !self.transactions {
            return Err(Error::Config(format!(
                "provider {} does not support transactions",
                self.name
            )));
        }

        if self.in_transaction() {
            return Err(Error::Config(format!(
                "provider {} does not support nested transactions",
                self.name
            )));
        }

        let _exclusive = self.transaction_gate.write().await;
        let snapshot = self.tables.read().clone();

        let result = ACTIVE_TRANSACTION.scope(self.address(), work).await;
        if let Err(e) = &result {
            tracing::debug!(provider = %self.name, error = %e, "Rolling back transaction");
            *self.tables.write() = snapshot;
        }
        result
    }
}
