//! Access control list data model

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::context::AuthorizationContext;
use crate::error::{Error, Result};
use crate::filter::Filter;

/// Role implicitly held by every caller
pub const EVERYONE_ROLE: &str = "Everyone";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessType {
    Read,
    Create,
    Update,
    Delete,
}

impl AccessType {
    pub const ALL: [Self; 4] = [Self::Read, Self::Create, Self::Update, Self::Delete];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub const fn is_mutation(&self) -> bool {
        !matches!(self, Self::Read)
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keys an entry may be declared with, including the `write` / `all` shorthands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKey {
    Read,
    Create,
    Update,
    Delete,
    Write,
    All,
}

impl AccessKey {
    #[must_use]
    pub const fn expand(&self) -> &'static [AccessType] {
        match self {
            Self::Read => &[AccessType::Read],
            Self::Create => &[AccessType::Create],
            Self::Update => &[AccessType::Update],
            Self::Delete => &[AccessType::Delete],
            Self::Write => &[AccessType::Create, AccessType::Update, AccessType::Delete],
            Self::All => &AccessType::ALL,
        }
    }
}

impl From<AccessType> for AccessKey {
    fn from(access: AccessType) -> Self {
        match access {
            AccessType::Read => Self::Read,
            AccessType::Create => Self::Create,
            AccessType::Update => Self::Update,
            AccessType::Delete => Self::Delete,
        }
    }
}

impl FromStr for AccessKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "write" => Ok(Self::Write),
            "all" => Ok(Self::All),
            other => Err(Error::Config(format!(
                "invalid ACL: unrecognized access key \"{other}\""
            ))),
        }
    }
}

/// What a row-level predicate resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    Grant(bool),
    Filter(Filter),
}

impl From<bool> for FilterOutcome {
    fn from(granted: bool) -> Self {
        Self::Grant(granted)
    }
}

impl From<Filter> for FilterOutcome {
    fn from(filter: Filter) -> Self {
        Self::Filter(filter)
    }
}

impl From<Value> for FilterOutcome {
    fn from(value: Value) -> Self {
        match value {
            Value::Bool(granted) => Self::Grant(granted),
            Value::Object(map) => Self::Filter(Filter::from(map)),
            _ => Self::Grant(false),
        }
    }
}

type FilterFn =
    dyn Fn(AuthorizationContext) -> BoxFuture<'static, anyhow::Result<FilterOutcome>> + Send + Sync;

/// Async row-level predicate evaluated against the caller's context
#[derive(Clone)]
pub struct AccessFilterFn(Arc<FilterFn>);

impl AccessFilterFn {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(AuthorizationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<FilterOutcome>> + Send + 'static,
    {
        Self(Arc::new(move |ctx| Box::pin(f(ctx))))
    }

    pub async fn evaluate(&self, ctx: AuthorizationContext) -> anyhow::Result<FilterOutcome> {
        (self.0)(ctx).await
    }
}

impl fmt::Debug for AccessFilterFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessFilterFn(..)")
    }
}

/// Value granted for one access key
#[derive(Debug, Clone)]
pub enum AccessValue {
    Allow,
    Deny,
    Conditional(AccessFilterFn),
}

impl AccessValue {
    pub fn conditional<F, Fut>(f: F) -> Self
    where
        F: Fn(AuthorizationContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<FilterOutcome>> + Send + 'static,
    {
        Self::Conditional(AccessFilterFn::new(f))
    }
}

impl From<bool> for AccessValue {
    fn from(allowed: bool) -> Self {
        if allowed { Self::Allow } else { Self::Deny }
    }
}

/// Grants for one role on one entity
#[derive(Debug, Clone, Default)]
pub struct AccessControlEntry {
    grants: Vec<(AccessKey, AccessValue)>,
    restricted_fields: BTreeSet<String>,
}

impl AccessControlEntry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn grant(mut self, key: AccessKey, value: impl Into<AccessValue>) -> Self {
        self.grants.push((key, value.into()));
        self
    }

    /// Grant using a textual key; unknown keys are a configuration error
    pub fn grant_str(self, key: &str, value: impl Into<AccessValue>) -> Result<Self> {
        let key = key.parse::<AccessKey>()?;
        Ok(self.grant(key, value))
    }

    #[must_use]
    pub fn read(self, value: impl Into<AccessValue>) -> Self {
        self.grant(AccessKey::Read, value)
    }

    #[must_use]
    pub fn create(self, value: impl Into<AccessValue>) -> Self {
        self.grant(AccessKey::Create, value)
    }

    #[must_use]
    pub fn update(self, value: impl Into<AccessValue>) -> Self {
        self.grant(AccessKey::Update, value)
    }

    #[must_use]
    pub fn delete(self, value: impl Into<AccessValue>) -> Self {
        self.grant(AccessKey::Delete, value)
    }

    #[must_use]
    pub fn write(self, value: impl Into<AccessValue>) -> Self {
        self.grant(AccessKey::Write, value)
    }

    #[must_use]
    pub fn all(self, value: impl Into<AccessValue>) -> Self {
        self.grant(AccessKey::All, value)
    }

    #[must_use]
    pub fn restrict_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.restricted_fields
            .extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn grants(&self) -> impl Iterator<Item = (AccessKey, &AccessValue)> {
        self.grants.iter().map(|(key, value)| (*key, value))
    }

    #[must_use]
    pub const fn restricted_fields(&self) -> &BTreeSet<String> {
        &self.restricted_fields
    }
}

/// Per-entity policy: role → entry
#[derive(Debug, Clone, Default)]
pub struct AccessControlList {
    entries: HashMap<String, AccessControlEntry>,
}

impl AccessControlList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn role(mut self, role: impl Into<String>, entry: AccessControlEntry) -> Self {
        self.entries.insert(role.into(), entry);
        self
    }

    #[must_use]
    pub fn entry(&self, role: &str) -> Option<&AccessControlEntry> {
        self.entries.get(role)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build an ACL from `{role: {key: bool}}` JSON, as found in config files.
    /// Conditional grants cannot be expressed this way.
    pub fn from_json(value: &Value) -> Result<Self> {
        let roles = value
            .as_object()
            .ok_or_else(|| Error::Config("invalid ACL: expected an object of roles".into()))?;

        let mut acl = Self::new();
        for (role, grants) in roles {
            let grants = grants.as_object().ok_or_else(|| {
                Error::Config(format!("invalid ACL: entry for role \"{role}\" must be an object"))
            })?;

            let mut entry = AccessControlEntry::new();
            for (key, granted) in grants {
                if key == "fieldRestrictions" {
                    let fields = granted.as_array().into_iter().flatten();
                    entry = entry.restrict_fields(fields.filter_map(Value::as_str));
                    continue;
                }

                let granted = granted.as_bool().ok_or_else(|| {
                    Error::Config(format!(
                        "invalid ACL: value for \"{key}\" on role \"{role}\" must be a boolean"
                    ))
                })?;
                entry = entry.grant_str(key, granted)?;
            }
            acl = acl.role(role.clone(), entry);
        }

        Ok(acl)
    }
}
