//! Permission sweep over the entity graph reachable from one operation

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::acl::AccessType;
use crate::consolidate::ConsolidatedAccessControlEntry;
use crate::error::{Error, FieldLocation, Result};
use crate::filter::{AND, Entity, NOT, OR};
use crate::hooks::Selection;
use crate::metadata::{EntityMetadata, MetadataLookup};
use crate::registry::PolicyView;

/// Access a nested input node needs, judged by which keys it carries
#[must_use]
pub fn classify(node: &Entity, primary_key: &str) -> AccessType {
    match node.get(primary_key) {
        Some(id) if !id.is_null() => {
            if node.len() == 1 {
                AccessType::Read
            } else {
                AccessType::Update
            }
        }
        _ => AccessType::Create,
    }
}

/// Visitor over selections, input trees and filters.
///
/// Checks restricted fields on every entity it reaches and requires a grant
/// for the access each related node implies. Nodes are tracked by entity and
/// address so shared or self-referencing subtrees are visited once.
pub struct GraphWalk<'a> {
    policies: &'a PolicyView,
    metadata: &'a dyn MetadataLookup,
    roles: &'a [String],
    entries: HashMap<String, ConsolidatedAccessControlEntry>,
    visited: HashSet<(String, usize)>,
}

impl<'a> GraphWalk<'a> {
    pub fn new(
        policies: &'a PolicyView,
        metadata: &'a dyn MetadataLookup,
        roles: &'a [String],
    ) -> Self {
        Self {
            policies,
            metadata,
            roles,
            entries: HashMap::new(),
            visited: HashSet::new(),
        }
    }

    fn entry(&mut self, entity: &str) -> &ConsolidatedAccessControlEntry {
        let (policies, roles) = (self.policies, self.roles);
        self.entries
            .entry(entity.to_string())
            .or_insert_with(|| policies.consolidated_entry(entity, roles))
    }

    fn lookup(&self, entity: &str) -> Result<Arc<EntityMetadata>> {
        self.metadata
            .entity(entity)
            .ok_or_else(|| Error::Config(format!("no metadata registered for entity {entity}")))
    }

    fn first_visit<T>(&mut self, entity: &str, node: &T) -> bool {
        let address = std::ptr::from_ref(node) as usize;
        self.visited.insert((entity.to_string(), address))
    }

    fn check_field(&mut self, entity: &str, field: &str, location: FieldLocation) -> Result<()> {
        if self.entry(entity).is_field_restricted(field) {
            tracing::warn!(
                entity,
                field,
                location = location.as_str(),
                roles = ?self.roles,
                "Restricted field referenced"
            );
            return Err(Error::restricted_field(location, entity, field));
        }
        Ok(())
    }

    fn require(&mut self, entity: &str, access: AccessType) -> Result<()> {
        if self.entry(entity).grants(access) {
            return Ok(());
        }
        tracing::warn!(
            entity,
            access = %access,
            roles = ?self.roles,
            "Related entity not accessible"
        );
        Err(Error::Forbidden)
    }

    /// Output selection; related entities must be readable
    pub fn selection(&mut self, entity: &EntityMetadata, selection: &Selection) -> Result<()> {
        if !self.first_visit(&entity.name, selection) {
            return Ok(());
        }

        for (field, nested) in selection.iter() {
            self.check_field(&entity.name, field, FieldLocation::Selection)?;

            if let Some(relationship) = entity.relationship(field) {
                let target = self.lookup(&relationship.target_entity)?;
                self.require(&target.name, AccessType::Read)?;
                self.selection(&target, nested)?;
            }
        }
        Ok(())
    }

    /// One create/update payload; nested nodes are classified by primary key
    pub fn input(&mut self, entity: &EntityMetadata, item: &Entity) -> Result<()> {
        if !self.first_visit(&entity.name, item) {
            return Ok(());
        }

        for (field, value) in item {
            self.check_field(&entity.name, field, FieldLocation::Input)?;

            let Some(relationship) = entity.relationship(field) else {
                continue;
            };
            let target = self.lookup(&relationship.target_entity)?;

            for node in nested_objects(value) {
                let access = classify(node, &target.primary_key_field);
                self.require(&target.name, access)?;
                self.input(&target, node)?;
            }
        }
        Ok(())
    }

    /// Filter argument; filtering through a relationship reads the related entity
    pub fn filter(&mut self, entity: &EntityMetadata, filter: &Map<String, Value>) -> Result<()> {
        if !self.first_visit(&entity.name, filter) {
            return Ok(());
        }

        for (key, value) in filter {
            match key.as_str() {
                AND | OR => {
                    for nested in nested_objects(value) {
                        self.filter(entity, nested)?;
                    }
                }
                NOT => {
                    if let Some(nested) = value.as_object() {
                        self.filter(entity, nested)?;
                    }
                }
                _ => {
                    let Some(field) = filter_field(entity, key) else {
                        tracing::warn!(
                            entity = %entity.name,
                            key = %key,
                            "Filter key names no declared field"
                        );
                        return Err(Error::restricted_field(FieldLocation::Filter, &entity.name, key));
                    };
                    self.check_field(&entity.name, field, FieldLocation::Filter)?;

                    if let Some(relationship) = entity.relationship(field)
                        && let Some(nested) = value.as_object()
                    {
                        let target = self.lookup(&relationship.target_entity)?;
                        self.require(&target.name, AccessType::Read)?;
                        self.filter(&target, nested)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Declared field a filter key refers to.
///
/// Any `_<operator>` suffix is stripped, trying the longest stem first so
/// `created_at_gt` resolves to `created_at`. Keys that resolve to nothing
/// are rejected by the caller rather than passed through unchecked.
fn filter_field<'k>(entity: &EntityMetadata, key: &'k str) -> Option<&'k str> {
    if entity.fields.contains_key(key) {
        return Some(key);
    }
    key.rmatch_indices('_')
        .map(|(at, _)| &key[..at])
        .find(|stem| !stem.is_empty() && entity.fields.contains_key(*stem))
}

fn nested_objects(value: &Value) -> Vec<&Map<String, Value>> {
    match value {
        Value::Object(node) => vec![node],
        Value::Array(nodes) => nodes.iter().filter_map(Value::as_object).collect(),
        _ => Vec::new(),
    }
}
