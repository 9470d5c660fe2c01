//! Data provider contract
//!
//! Providers own storage for one or more entities. The enforcement
//! pipeline only needs lookups by filter, single-row writes and, for
//! row-level security on writes, a transaction scope.

mod memory;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

pub use memory::InMemoryProvider;

use crate::error::{Error, Result};
use crate::filter::{Entity, Filter};

/// Work executed inside [`DataProvider::with_transaction`]
pub type TransactionWork<'a> = BoxFuture<'a, Result<Vec<Entity>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pagination {
    pub offset: usize,
    pub limit: Option<usize>,
    pub order_by: Option<OrderBy>,
}

impl Pagination {
    #[must_use]
    pub const fn limit(limit: usize) -> Self {
        Self {
            offset: 0,
            limit: Some(limit),
            order_by: None,
        }
    }

    #[must_use]
    pub const fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            descending,
        });
        self
    }
}

#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Provider name used in logs
    fn name(&self) -> &str;

    async fn find(
        &self,
        entity: &str,
        filter: &Filter,
        pagination: &Pagination,
    ) -> Result<Vec<Entity>>;

    async fn find_one(&self, entity: &str, filter: &Filter) -> Result<Option<Entity>>;

    async fn create_one(&self, entity: &str, data: Entity) -> Result<Entity>;

    /// Merge `data` into the row whose primary key is `id`
    async fn update_one(&self, entity: &str, id: &Value, data: Entity) -> Result<Entity>;

    /// Remove the first row matching `filter`
    async fn delete_one(&self, entity: &str, filter: &Filter) -> Result<Option<Entity>>;

    fn supports_transactions(&self) -> bool {
        false
    }

    /// Run `work` atomically; failure undoes every write it made
    async fn with_transaction<'a>(&'a self, work: TransactionWork<'a>) -> Result<Vec<Entity>> {
        drop(work);
        Err(Error::Config(format!(
            "provider {} does not support transactions",
            self.name()
        )))
    }
}
