//! Enforcement pipeline
//!
//! [`AuthorizationHooks`] is installed for every stage of every entity with
//! a registered ACL. Before-hooks reject or narrow the operation before the
//! provider runs; after-hooks re-check written rows against the caller's
//! filter so a transaction can undo writes that should not have happened.

mod operations;
mod walk;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde_json::Value;

pub use operations::EntityOperations;
pub use walk::classify;
use walk::GraphWalk;

use crate::acl::AccessType;
use crate::context::AuthorizationContext;
use crate::error::{Error, Result};
use crate::filter::{Entity, Filter};
use crate::hooks::{Hook, HookParams, HookStage};
use crate::metadata::{EntityMetadata, MetadataLookup};
use crate::provider::DataProvider;
use crate::registry::PolicyView;

pub struct AuthorizationHooks {
    policies: PolicyView,
    metadata: Arc<dyn MetadataLookup>,
}

impl std::fmt::Debug for AuthorizationHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationHooks")
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Hook for AuthorizationHooks {
    async fn apply(&self, stage: HookStage, params: HookParams) -> Result<HookParams> {
        let access = stage.access();
        match stage {
            HookStage::BeforeRead | HookStage::BeforeDelete => {
                self.before_filtered(access, params).await
            }
            HookStage::BeforeCreate | HookStage::BeforeUpdate => {
                self.before_write(access, params).await
            }
            HookStage::AfterCreate | HookStage::AfterUpdate => {
                self.after_write(access, params).await
            }
        }
    }
}

impl AuthorizationHooks {
    pub fn new(policies: PolicyView, metadata: Arc<dyn MetadataLookup>) -> Self {
        Self { policies, metadata }
    }

    fn lookup(&self, entity: &str) -> Result<Arc<EntityMetadata>> {
        self.metadata
            .entity(entity)
            .ok_or_else(|| Error::Config(format!("no metadata registered for entity {entity}")))
    }

    fn sweep(&self, metadata: &EntityMetadata, params: &HookParams) -> Result<()> {
        let roles = params.context.roles();
        let mut walk = GraphWalk::new(&self.policies, self.metadata.as_ref(), roles);

        walk.selection(metadata, &params.fields)?;
        walk.filter(metadata, params.args.filter.as_map())?;
        for item in &params.args.items {
            walk.input(metadata, item)?;
        }
        Ok(())
    }

    /// Read and delete: narrow the caller's filter to the rows they may touch
    async fn before_filtered(&self, access: AccessType, mut params: HookParams) -> Result<HookParams> {
        let metadata = self.lookup(&params.entity)?;
        let ctx = &params.context;

        let access_filter = self
            .policies
            .access_filter(&params.entity, access, ctx)
            .await?;
        self.policies
            .check_authentication(&params.entity, access, ctx)?;
        self.sweep(&metadata, &params)?;

        let caller_filter = std::mem::take(&mut params.args.filter);
        params.args.filter = caller_filter.and(access_filter);
        Ok(params)
    }

    /// Create and update: authorize the whole input graph before writing
    async fn before_write(&self, access: AccessType, params: HookParams) -> Result<HookParams> {
        let metadata = self.lookup(&params.entity)?;
        let ctx = &params.context;

        let access_filter = self
            .policies
            .access_filter(&params.entity, access, ctx)
            .await?;
        self.policies
            .check_authentication(&params.entity, access, ctx)?;
        self.sweep(&metadata, &params)?;

        if access_filter.is_empty() {
            return Ok(params);
        }

        if !params.transactional {
            return Err(Error::Config(format!(
                "row-level security on {} {} requires a transactional provider",
                params.entity, access
            )));
        }

        if access == AccessType::Update {
            let provider = provider(&metadata)?;
            try_join_all(params.args.items.iter().map(|item| {
                verify_target(provider.as_ref(), &metadata, item, &access_filter)
            }))
            .await?;
        }

        Ok(params)
    }

    /// Re-check every written row against the post-write state
    async fn after_write(&self, access: AccessType, params: HookParams) -> Result<HookParams> {
        let access_filter = self
            .policies
            .access_filter(&params.entity, access, &params.context)
            .await?;
        if access_filter.is_empty() {
            return Ok(params);
        }

        let metadata = self.lookup(&params.entity)?;
        let provider = provider(&metadata)?;

        try_join_all(params.entities.iter().map(|written| {
            recheck_written(
                provider.as_ref(),
                &metadata,
                written,
                &access_filter,
                &params.context,
            )
        }))
        .await?;

        Ok(params)
    }
}

fn provider(metadata: &EntityMetadata) -> Result<Arc<dyn DataProvider>> {
    metadata
        .provider
        .clone()
        .ok_or_else(|| Error::Config(format!("no data provider for entity {}", metadata.name)))
}

fn primary_key<'e>(metadata: &EntityMetadata, row: &'e Entity) -> Result<&'e Value> {
    row.get(&metadata.primary_key_field)
        .filter(|id| !id.is_null())
        .ok_or_else(|| {
            tracing::warn!(entity = %metadata.name, "Row without primary key");
            Error::Forbidden
        })
}

/// The row an update targets must already match the caller's filter
async fn verify_target(
    provider: &dyn DataProvider,
    metadata: &EntityMetadata,
    item: &Entity,
    access_filter: &Filter,
) -> Result<()> {
    let id = primary_key(metadata, item)?;
    let scoped = Filter::eq(metadata.primary_key_field.clone(), id.clone()).and(access_filter.clone());

    if provider.find_one(&metadata.name, &scoped).await?.is_none() {
        tracing::warn!(entity = %metadata.name, id = %id, "Update target outside caller's filter");
        return Err(Error::Forbidden);
    }
    Ok(())
}

/// A written row that no longer matches the caller's filter fails the batch
async fn recheck_written(
    provider: &dyn DataProvider,
    metadata: &EntityMetadata,
    written: &Entity,
    access_filter: &Filter,
    ctx: &AuthorizationContext,
) -> Result<()> {
    let id = primary_key(metadata, written)?;
    let by_id = Filter::eq(metadata.primary_key_field.clone(), id.clone());
    let scoped = by_id.clone().and(access_filter.clone());

    if provider.find_one(&metadata.name, &scoped).await?.is_some() {
        return Ok(());
    }

    if provider.find_one(&metadata.name, &by_id).await?.is_none() {
        tracing::warn!(
            entity = %metadata.name,
            id = %id,
            "Written row disappeared before the post-write check"
        );
        return Err(Error::NotFound {
            entity: metadata.name.clone(),
            id: id.to_string(),
        });
    }

    tracing::warn!(
        entity = %metadata.name,
        id = %id,
        user = ?ctx.user_id(),
        "Written row falls outside caller's filter"
    );
    Err(Error::Forbidden)
}
