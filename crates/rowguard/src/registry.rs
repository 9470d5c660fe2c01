//! Access control registry
//!
//! Built once at startup: every entity's ACL and MFA rules are registered,
//! and registration installs the authorization hooks for that entity. The
//! registry is then shared behind an `Arc`. Policy tables sit in an
//! `ArcSwap` so the installed hooks read them without locking.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::acl::{AccessControlList, AccessType};
use crate::config::AuthConfig;
use crate::consolidate::{ConsolidatedAccessControlEntry, ConsolidatedValue, consolidate};
use crate::context::AuthorizationContext;
use crate::error::{Error, Result};
use crate::evaluator::evaluate_access_filter;
use crate::filter::Filter;
use crate::hooks::{Hook, HookRegistry, HookStage};
use crate::metadata::MetadataLookup;
use crate::mfa::{MultiFactorAuthentication, check_authentication};
use crate::observability::{Decision, record_decision};
use crate::pipeline::AuthorizationHooks;

const HOOK_STAGES: [HookStage; 6] = [
    HookStage::BeforeCreate,
    HookStage::BeforeRead,
    HookStage::BeforeUpdate,
    HookStage::BeforeDelete,
    HookStage::AfterCreate,
    HookStage::AfterUpdate,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterOptions {
    pub override_if_exists: bool,
}

impl RegisterOptions {
    #[must_use]
    pub const fn overriding() -> Self {
        Self {
            override_if_exists: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PolicyTables {
    acls: HashMap<String, Arc<AccessControlList>>,
    mfa: HashMap<String, Arc<MultiFactorAuthentication>>,
}

/// Read side of the registry, shared with the installed hooks
#[derive(Debug, Clone)]
pub struct PolicyView {
    tables: Arc<ArcSwap<PolicyTables>>,
    admin_role: Arc<str>,
}

impl PolicyView {
    fn new(admin_role: &str) -> Self {
        Self {
            tables: Arc::new(ArcSwap::from_pointee(PolicyTables::default())),
            admin_role: Arc::from(admin_role),
        }
    }

    #[must_use]
    pub fn admin_role(&self) -> &str {
        &self.admin_role
    }

    #[must_use]
    pub fn acl(&self, entity: &str) -> Option<Arc<AccessControlList>> {
        self.tables.load().acls.get(entity).cloned()
    }

    #[must_use]
    pub fn mfa(&self, entity: &str) -> Option<Arc<MultiFactorAuthentication>> {
        self.tables.load().mfa.get(entity).cloned()
    }

    #[must_use]
    pub fn is_protected(&self, entity: &str) -> bool {
        self.tables.load().acls.contains_key(entity)
    }

    /// Effective permissions of a caller holding `roles` on `entity`
    #[must_use]
    pub fn consolidated_entry(
        &self,
        entity: &str,
        roles: &[String],
    ) -> ConsolidatedAccessControlEntry {
        let acl = self.acl(entity);
        consolidate(acl.as_deref(), roles, &self.admin_role)
    }

    /// Filter the caller must be confined to for `access` on `entity`
    pub async fn access_filter(
        &self,
        entity: &str,
        access: AccessType,
        ctx: &AuthorizationContext,
    ) -> Result<Filter> {
        let entry = self.consolidated_entry(entity, ctx.roles());
        let result = evaluate_access_filter(entry.get(access), ctx).await;

        match &result {
            Ok(filter) if filter.is_empty() => {
                record_decision(entity, access, Decision::Granted);
            }
            Ok(filter) => {
                tracing::debug!(entity, access = %access, filter = %filter, "Row filter applied");
                record_decision(entity, access, Decision::Filtered);
            }
            Err(_) => {
                tracing::warn!(
                    entity,
                    access = %access,
                    user = ?ctx.user_id(),
                    roles = ?ctx.roles(),
                    "Access denied"
                );
                record_decision(entity, access, Decision::Forbidden);
            }
        }

        result
    }

    /// Step-up check against the MFA rules registered for `entity`
    pub fn check_authentication(
        &self,
        entity: &str,
        access: AccessType,
        ctx: &AuthorizationContext,
    ) -> Result<()> {
        let Some(mfa) = self.mfa(entity) else {
            return Ok(());
        };

        let result = check_authentication(&mfa, access, ctx);
        if result.is_err() {
            record_decision(entity, access, Decision::Challenge);
        }
        result
    }
}

/// Process-wide policy registry
pub struct AccessControlRegistry {
    policies: PolicyView,
    hooks: HookRegistry,
    metadata: Arc<dyn MetadataLookup>,
    hooked: HashSet<String>,
}

impl std::fmt::Debug for AccessControlRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.policies.tables.load();
        f.debug_struct("AccessControlRegistry")
            .field("admin_role", &self.policies.admin_role)
            .field("entities", &tables.acls.keys().collect::<Vec<_>>())
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}

impl AccessControlRegistry {
    pub fn new(admin_role: impl AsRef<str>, metadata: Arc<dyn MetadataLookup>) -> Self {
        Self {
            policies: PolicyView::new(admin_role.as_ref()),
            hooks: HookRegistry::new(),
            metadata,
            hooked: HashSet::new(),
        }
    }

    pub fn from_config(config: &AuthConfig, metadata: Arc<dyn MetadataLookup>) -> Self {
        Self::new(config.admin_role(), metadata)
    }

    #[must_use]
    pub const fn policies(&self) -> &PolicyView {
        &self.policies
    }

    #[must_use]
    pub const fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    #[must_use]
    pub fn metadata(&self) -> &dyn MetadataLookup {
        self.metadata.as_ref()
    }

    /// Register the ACL for `entity` and install its authorization hooks
    pub fn register_access_control_list(
        &mut self,
        entity: impl Into<String>,
        acl: AccessControlList,
        options: RegisterOptions,
    ) -> Result<()> {
        let entity = entity.into();

        if self.policies.is_protected(&entity) && !options.override_if_exists {
            return Err(Error::Config(format!(
                "an access control list is already registered for {entity}"
            )));
        }

        let mut tables = PolicyTables::clone(&self.policies.tables.load());
        tables.acls.insert(entity.clone(), Arc::new(acl));
        self.policies.tables.store(Arc::new(tables));

        if self.hooked.insert(entity.clone()) {
            let hooks: Arc<dyn Hook> = Arc::new(AuthorizationHooks::new(
                self.policies.clone(),
                Arc::clone(&self.metadata),
            ));
            for stage in HOOK_STAGES {
                self.hooks.register(entity.clone(), stage, Arc::clone(&hooks));
            }
        }

        tracing::debug!(entity = %entity, "Registered access control list");
        Ok(())
    }

    /// Register step-up rules for `entity`
    pub fn register_multi_factor_authentication(
        &mut self,
        entity: impl Into<String>,
        rules: MultiFactorAuthentication,
        options: RegisterOptions,
    ) -> Result<()> {
        let entity = entity.into();

        let mut tables = PolicyTables::clone(&self.policies.tables.load());
        if tables.mfa.contains_key(&entity) && !options.override_if_exists {
            return Err(Error::Config(format!(
                "multi-factor rules are already registered for {entity}"
            )));
        }
        tables.mfa.insert(entity.clone(), Arc::new(rules));
        self.policies.tables.store(Arc::new(tables));

        tracing::debug!(entity = %entity, "Registered multi-factor authentication rules");
        Ok(())
    }

    /// Add an application hook; it runs after the authorization hooks
    pub fn register_hook(&mut self, entity: impl Into<String>, stage: HookStage, hook: Arc<dyn Hook>) {
        self.hooks.register(entity, stage, hook);
    }

    #[must_use]
    pub fn consolidated_entry(
        &self,
        entity: &str,
        roles: &[String],
    ) -> ConsolidatedAccessControlEntry {
        self.policies.consolidated_entry(entity, roles)
    }

    /// Whether the caller may perform `access` on `entity` at all.
    /// Returns `Ok(true)` or fails with [`Error::Forbidden`].
    pub async fn assert_access(
        &self,
        entity: &str,
        access: AccessType,
        ctx: &AuthorizationContext,
    ) -> Result<bool> {
        let entry = self.consolidated_entry(entity, ctx.roles());
        match entry.get(access) {
            Some(ConsolidatedValue::Unconditional) => Ok(true),
            _ => {
                self.policies.access_filter(entity, access, ctx).await?;
                Ok(true)
            }
        }
    }

    /// Filter to merge into queries for `access` on `entity`
    pub async fn get_access_filter(
        &self,
        entity: &str,
        access: AccessType,
        ctx: &AuthorizationContext,
    ) -> Result<Filter> {
        self.policies.access_filter(entity, access, ctx).await
    }
}
