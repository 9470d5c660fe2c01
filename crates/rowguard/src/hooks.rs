//! Hook registration point for CRUD stages

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::acl::AccessType;
use crate::context::AuthorizationContext;
use crate::error::Result;
use crate::filter::{Entity, Filter};
use crate::provider::Pagination;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    BeforeCreate,
    BeforeRead,
    BeforeUpdate,
    BeforeDelete,
    AfterCreate,
    AfterUpdate,
}

impl HookStage {
    #[must_use]
    pub const fn access(&self) -> AccessType {
        match self {
            Self::BeforeCreate | Self::AfterCreate => AccessType::Create,
            Self::BeforeRead => AccessType::Read,
            Self::BeforeUpdate | Self::AfterUpdate => AccessType::Update,
            Self::BeforeDelete => AccessType::Delete,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BeforeCreate => "before_create",
            Self::BeforeRead => "before_read",
            Self::BeforeUpdate => "before_update",
            Self::BeforeDelete => "before_delete",
            Self::AfterCreate => "after_create",
            Self::AfterUpdate => "after_update",
        }
    }
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested output fields; nested selections follow relationships
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    fields: BTreeMap<String, Self>,
}

impl Selection {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|name| (name.into(), Self::default()))
                .collect(),
        }
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), Self::default());
        self
    }

    #[must_use]
    pub fn nested(mut self, name: impl Into<String>, selection: Self) -> Self {
        self.fields.insert(name.into(), selection);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Self)> {
        self.fields.iter().map(|(name, nested)| (name.as_str(), nested))
    }
}

#[derive(Debug, Clone, Default)]
pub struct HookArgs {
    pub filter: Filter,
    /// Create/update payloads
    pub items: Vec<Entity>,
    pub pagination: Pagination,
}

/// Value threaded through every hook of one operation
#[derive(Debug, Clone)]
pub struct HookParams {
    pub entity: String,
    pub args: HookArgs,
    pub context: AuthorizationContext,
    pub fields: Selection,
    /// Rows produced by the provider call, set for after-hooks
    pub entities: Vec<Entity>,
    pub transactional: bool,
}

impl HookParams {
    pub fn new(entity: impl Into<String>, context: AuthorizationContext) -> Self {
        Self {
            entity: entity.into(),
            args: HookArgs::default(),
            context,
            fields: Selection::default(),
            entities: Vec::new(),
            transactional: false,
        }
    }
}

#[async_trait]
pub trait Hook: Send + Sync {
    async fn apply(&self, stage: HookStage, params: HookParams) -> Result<HookParams>;
}

/// entity → stage → hooks, run in registration order
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: HashMap<String, HashMap<HookStage, Vec<Arc<dyn Hook>>>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: BTreeMap<&str, usize> = self
            .hooks
            .iter()
            .map(|(entity, stages)| (entity.as_str(), stages.values().map(Vec::len).sum()))
            .collect();
        f.debug_struct("HookRegistry").field("hooks", &counts).finish()
    }
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity: impl Into<String>, stage: HookStage, hook: Arc<dyn Hook>) {
        self.hooks
            .entry(entity.into())
            .or_default()
            .entry(stage)
            .or_default()
            .push(hook);
    }

    /// Drop every hook registered for `entity`
    pub fn clear(&mut self, entity: &str) {
        self.hooks.remove(entity);
    }

    #[must_use]
    pub fn count(&self, entity: &str, stage: HookStage) -> usize {
        self.hooks
            .get(entity)
            .and_then(|stages| stages.get(&stage))
            .map_or(0, Vec::len)
    }

    /// Run the hooks for `stage` one after another, each seeing the previous output
    pub async fn run(&self, stage: HookStage, mut params: HookParams) -> Result<HookParams> {
        let Some(hooks) = self
            .hooks
            .get(&params.entity)
            .and_then(|stages| stages.get(&stage))
        else {
            return Ok(params);
        };

        for hook in hooks {
            params = hook.apply(stage, params).await?;
        }
        Ok(params)
    }
}
