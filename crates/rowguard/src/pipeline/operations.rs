//! CRUD orchestration
//!
//! Every operation reads the caller from the request-scoped context, runs
//! the before-hooks, calls the provider, then runs the after-hooks. Writes
//! run inside a provider transaction whenever the provider offers one, so
//! a failing after-hook undoes the whole batch.

use std::sync::Arc;

use serde_json::Value;

use crate::context::{AuthorizationContext, authorization_context};
use crate::error::{Error, Result};
use crate::filter::{Entity, Filter};
use crate::hooks::{HookArgs, HookParams, HookStage, Selection};
use crate::metadata::EntityMetadata;
use crate::provider::{DataProvider, Pagination};
use crate::registry::AccessControlRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Create,
    Update,
}

impl WriteKind {
    const fn stages(self) -> (HookStage, HookStage) {
        match self {
            Self::Create => (HookStage::BeforeCreate, HookStage::AfterCreate),
            Self::Update => (HookStage::BeforeUpdate, HookStage::AfterUpdate),
        }
    }
}

struct Target {
    metadata: Arc<EntityMetadata>,
    provider: Arc<dyn DataProvider>,
    context: AuthorizationContext,
}

#[derive(Debug, Clone)]
pub struct EntityOperations {
    registry: Arc<AccessControlRegistry>,
}

impl EntityOperations {
    #[must_use]
    pub const fn new(registry: Arc<AccessControlRegistry>) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &AccessControlRegistry {
        &self.registry
    }

    fn target(&self, entity: &str) -> Result<Target> {
        let context = authorization_context()?;

        // Entities without an ACL have no hooks installed; deny rather than run unchecked
        if !self.registry.policies().is_protected(entity) {
            tracing::warn!(entity, user = ?context.user_id(), "No access control list registered");
            return Err(Error::Forbidden);
        }

        let metadata = self
            .registry
            .metadata()
            .entity(entity)
            .ok_or_else(|| Error::Config(format!("no metadata registered for entity {entity}")))?;
        let provider = metadata
            .provider
            .clone()
            .ok_or_else(|| Error::Config(format!("no data provider for entity {entity}")))?;

        Ok(Target {
            metadata,
            provider,
            context,
        })
    }

    pub async fn find(
        &self,
        entity: &str,
        filter: Filter,
        pagination: Pagination,
        fields: Selection,
    ) -> Result<Vec<Entity>> {
        let target = self.target(entity)?;

        let mut params = HookParams::new(entity, target.context);
        params.args = HookArgs {
            filter,
            items: Vec::new(),
            pagination,
        };
        params.fields = fields;

        let params = self
            .registry
            .hooks()
            .run(HookStage::BeforeRead, params)
            .await?;

        target
            .provider
            .find(entity, &params.args.filter, &params.args.pagination)
            .await
    }

    pub async fn find_one(
        &self,
        entity: &str,
        filter: Filter,
        fields: Selection,
    ) -> Result<Option<Entity>> {
        let rows = self
            .find(entity, filter, Pagination::limit(1), fields)
            .await?;
        Ok(rows.into_iter().next())
    }

    pub async fn create(
        &self,
        entity: &str,
        items: Vec<Entity>,
        fields: Selection,
    ) -> Result<Vec<Entity>> {
        self.write(WriteKind::Create, entity, items, fields).await
    }

    pub async fn create_one(&self, entity: &str, item: Entity, fields: Selection) -> Result<Entity> {
        let created = self.create(entity, vec![item], fields).await?;
        created
            .into_iter()
            .next()
            .ok_or_else(|| Error::Provider(format!("provider returned no {entity} row")))
    }

    /// Update rows; every item must carry its primary key
    pub async fn update(
        &self,
        entity: &str,
        items: Vec<Entity>,
        fields: Selection,
    ) -> Result<Vec<Entity>> {
        self.write(WriteKind::Update, entity, items, fields).await
    }

    pub async fn update_one(&self, entity: &str, item: Entity, fields: Selection) -> Result<Entity> {
        let updated = self.update(entity, vec![item], fields).await?;
        updated
            .into_iter()
            .next()
            .ok_or_else(|| Error::Provider(format!("provider returned no {entity} row")))
    }

    /// Delete the first row matching `filter` within the caller's reach
    pub async fn delete_one(&self, entity: &str, filter: Filter) -> Result<Option<Entity>> {
        let target = self.target(entity)?;

        let mut params = HookParams::new(entity, target.context);
        params.args.filter = filter;

        let params = self
            .registry
            .hooks()
            .run(HookStage::BeforeDelete, params)
            .await?;

        target.provider.delete_one(entity, &params.args.filter).await
    }

    async fn write(
        &self,
        kind: WriteKind,
        entity: &str,
        items: Vec<Entity>,
        fields: Selection,
    ) -> Result<Vec<Entity>> {
        let target = self.target(entity)?;
        let transactional = target.provider.supports_transactions();

        let mut params = HookParams::new(entity, target.context.clone());
        params.args.items = items;
        params.fields = fields;
        params.transactional = transactional;

        let work = self.run_write(kind, &target, params);
        if transactional {
            target.provider.with_transaction(Box::pin(work)).await
        } else {
            work.await
        }
    }

    async fn run_write(
        &self,
        kind: WriteKind,
        target: &Target,
        params: HookParams,
    ) -> Result<Vec<Entity>> {
        let hooks = self.registry.hooks();
        let (before, after) = kind.stages();
        let entity = target.metadata.name.as_str();

        let mut params = hooks.run(before, params).await?;

        let mut written = Vec::with_capacity(params.args.items.len());
        for item in &params.args.items {
            let row = match kind {
                WriteKind::Create => target.provider.create_one(entity, item.clone()).await?,
                WriteKind::Update => {
                    let id = update_id(&target.metadata, item)?;
                    target.provider.update_one(entity, &id, item.clone()).await?
                }
            };
            written.push(row);
        }
        params.entities = written;

        let params = hooks.run(after, params).await?;
        Ok(params.entities)
    }
}

fn update_id(metadata: &EntityMetadata, item: &Entity) -> Result<Value> {
    item.get(&metadata.primary_key_field)
        .filter(|id| !id.is_null())
        .cloned()
        .ok_or_else(|| {
            Error::Provider(format!(
                "update of {} is missing primary key {}",
                metadata.name, metadata.primary_key_field
            ))
        })
}
