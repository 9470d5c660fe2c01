//! Role consolidation
//!
//! Merges every entry a caller's roles contribute into one effective value
//! per access type. An unconditional grant always wins over conditional
//! filters, regardless of the order roles are listed in.

use std::collections::{BTreeSet, HashMap};

use crate::acl::{AccessControlList, AccessFilterFn, AccessType, AccessValue, EVERYONE_ROLE};

/// Effective permission for one access type
#[derive(Debug, Clone)]
pub enum ConsolidatedValue {
    Unconditional,
    Filtered(Vec<AccessFilterFn>),
}

impl ConsolidatedValue {
    #[must_use]
    pub const fn is_unconditional(&self) -> bool {
        matches!(self, Self::Unconditional)
    }

    fn merge(current: Option<Self>, value: &AccessValue) -> Option<Self> {
        match (current, value) {
            (current, AccessValue::Deny) => current,
            (Some(Self::Unconditional), _) | (_, AccessValue::Allow) => Some(Self::Unconditional),
            (Some(Self::Filtered(mut filters)), AccessValue::Conditional(f)) => {
                filters.push(f.clone());
                Some(Self::Filtered(filters))
            }
            (None, AccessValue::Conditional(f)) => Some(Self::Filtered(vec![f.clone()])),
        }
    }
}

/// One caller's effective permissions on one entity
#[derive(Debug, Clone, Default)]
pub struct ConsolidatedAccessControlEntry {
    values: HashMap<AccessType, ConsolidatedValue>,
    restricted_fields: BTreeSet<String>,
}

impl ConsolidatedAccessControlEntry {
    #[must_use]
    pub fn administrator() -> Self {
        Self {
            values: AccessType::ALL
                .into_iter()
                .map(|access| (access, ConsolidatedValue::Unconditional))
                .collect(),
            restricted_fields: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn get(&self, access: AccessType) -> Option<&ConsolidatedValue> {
        self.values.get(&access)
    }

    #[must_use]
    pub fn grants(&self, access: AccessType) -> bool {
        self.values.contains_key(&access)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn is_field_restricted(&self, field: &str) -> bool {
        self.restricted_fields.contains(field)
    }

    #[must_use]
    pub const fn restricted_fields(&self) -> &BTreeSet<String> {
        &self.restricted_fields
    }
}

/// Consolidate `acl` for a caller holding `roles`
#[must_use]
pub fn consolidate(
    acl: Option<&AccessControlList>,
    roles: &[String],
    admin_role: &str,
) -> ConsolidatedAccessControlEntry {
    if roles.iter().any(|role| role == admin_role) {
        return ConsolidatedAccessControlEntry::administrator();
    }

    let mut consolidated = ConsolidatedAccessControlEntry::default();
    let Some(acl) = acl else {
        return consolidated;
    };

    let mut seen = BTreeSet::new();
    let caller_roles = roles
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(EVERYONE_ROLE));

    for role in caller_roles {
        if !seen.insert(role) {
            continue;
        }
        let Some(entry) = acl.entry(role) else {
            continue;
        };

        for (key, value) in entry.grants() {
            for access in key.expand() {
                let current = consolidated.values.remove(access);
                if let Some(merged) = ConsolidatedValue::merge(current, value) {
                    consolidated.values.insert(*access, merged);
                }
            }
        }

        consolidated
            .restricted_fields
            .extend(entry.restricted_fields().iter().cloned());
    }

    tracing::debug!(
        roles = ?roles,
        granted = ?consolidated.values.keys().collect::<Vec<_>>(),
        "Consolidated access control entry"
    );

    consolidated
}
