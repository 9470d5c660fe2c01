//! Entity metadata consumed by the enforcement pipeline

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::provider::DataProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationshipKind {
    OneToOne,
    ManyToOne,
    OneToMany,
    ManyToMany,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub target_entity: String,
    pub kind: RelationshipKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMetadata {
    pub name: String,
    pub field_type: String,
    pub relationship: Option<Relationship>,
}

impl FieldMetadata {
    pub fn scalar(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            relationship: None,
        }
    }

    pub fn related(
        name: impl Into<String>,
        target_entity: impl Into<String>,
        kind: RelationshipKind,
    ) -> Self {
        let target_entity = target_entity.into();
        Self {
            name: name.into(),
            field_type: target_entity.clone(),
            relationship: Some(Relationship {
                target_entity,
                kind,
            }),
        }
    }
}

/// Fields, primary key and backing provider of one entity
#[derive(Clone)]
pub struct EntityMetadata {
    pub name: String,
    pub primary_key_field: String,
    pub fields: BTreeMap<String, FieldMetadata>,
    pub provider: Option<Arc<dyn DataProvider>>,
}

impl fmt::Debug for EntityMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMetadata")
            .field("name", &self.name)
            .field("primary_key_field", &self.primary_key_field)
            .field("fields", &self.fields.keys().collect::<Vec<_>>())
            .field("has_provider", &self.provider.is_some())
            .finish()
    }
}

impl EntityMetadata {
    pub fn new(name: impl Into<String>, primary_key_field: impl Into<String>) -> Self {
        let primary_key_field = primary_key_field.into();
        let mut fields = BTreeMap::new();
        fields.insert(
            primary_key_field.clone(),
            FieldMetadata::scalar(primary_key_field.clone(), "ID"),
        );
        Self {
            name: name.into(),
            primary_key_field,
            fields,
            provider: None,
        }
    }

    #[must_use]
    pub fn field(mut self, field: FieldMetadata) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }

    #[must_use]
    pub fn scalar(self, name: impl Into<String>, field_type: impl Into<String>) -> Self {
        self.field(FieldMetadata::scalar(name, field_type))
    }

    #[must_use]
    pub fn related(
        self,
        name: impl Into<String>,
        target_entity: impl Into<String>,
        kind: RelationshipKind,
    ) -> Self {
        self.field(FieldMetadata::related(name, target_entity, kind))
    }

    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn DataProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn relationship(&self, field: &str) -> Option<&Relationship> {
        self.fields.get(field)?.relationship.as_ref()
    }
}

/// Entity name → metadata
pub trait MetadataLookup: Send + Sync {
    fn entity(&self, name: &str) -> Option<Arc<EntityMetadata>>;
}

/// In-memory metadata lookup
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    entities: HashMap<String, Arc<EntityMetadata>>,
}

impl MetadataRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entity(mut self, metadata: EntityMetadata) -> Self {
        self.insert(metadata);
        self
    }

    pub fn insert(&mut self, metadata: EntityMetadata) {
        self.entities
            .insert(metadata.name.clone(), Arc::new(metadata));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl MetadataLookup for MetadataRegistry {
    fn entity(&self, name: &str) -> Option<Arc<EntityMetadata>> {
        self.entities.get(name).cloned()
    }
}
