//! Entity registry.
//!
//! Built once at startup from a metadata provider and cached in memory.
//! Lookup of an unregistered entity is a hard failure, not a fallback:
//! absence of metadata is a configuration error.

use std::sync::Arc;

use anyhow::anyhow;
use dashmap::DashMap;
use tracing::info;

use super::{EntityMetadata, FieldMeta, RelationMeta};
use crate::error::{ApiError, ApiResult};

/// Source of entity metadata, supplied by whatever ORM or schema layer is
/// plugged in.
pub trait EntityMetadataProvider {
    /// Names of every exposed entity.
    fn entity_names(&self) -> Vec<String>;

    /// SQL table for an entity.
    fn table(&self, entity: &str) -> anyhow::Result<String>;

    /// Scalar fields of an entity (primary key included).
    fn fields(&self, entity: &str) -> anyhow::Result<Vec<FieldMeta>>;

    /// Primary key field of an entity.
    fn primary_key(&self, entity: &str) -> anyhow::Result<FieldMeta>;

    /// Relations declared on an entity.
    fn relations(&self, entity: &str) -> anyhow::Result<Vec<RelationMeta>>;
}

/// Registry of entity metadata.
pub struct EntityRegistry {
    by_name: DashMap<String, Arc<EntityMetadata>>,
    by_resource_type: DashMap<String, Arc<EntityMetadata>>,
}

impl EntityRegistry {
    /// Build the registry from a provider.
    ///
    /// Every relation target must itself be a registered entity; a dangling
    /// target is a startup configuration error.
    pub fn from_provider(provider: &dyn EntityMetadataProvider) -> ApiResult<Self> {
        let registry = Self {
            by_name: DashMap::new(),
            by_resource_type: DashMap::new(),
        };

        for name in provider.entity_names() {
            let meta = Arc::new(EntityMetadata::new(
                name.clone(),
                provider.table(&name)?,
                provider.primary_key(&name)?,
                provider.fields(&name)?,
                provider.relations(&name)?,
            ));
            registry
                .by_resource_type
                .insert(meta.resource_type.clone(), Arc::clone(&meta));
            registry.by_name.insert(name, meta);
        }

        // Validate relation targets now rather than at first query.
        for entry in registry.by_name.iter() {
            for relation in &entry.value().relations {
                if !registry.by_name.contains_key(&relation.target) {
                    return Err(ApiError::Internal(anyhow!(
                        "relation '{}.{}' targets unregistered entity '{}'",
                        entry.key(),
                        relation.name,
                        relation.target
                    )));
                }
            }
        }

        info!(count = registry.by_name.len(), "entity registry built");
        Ok(registry)
    }

    /// Get metadata by entity name. Unregistered entities are a hard error.
    pub fn get(&self, entity: &str) -> ApiResult<Arc<EntityMetadata>> {
        self.by_name
            .get(entity)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| ApiError::Internal(anyhow!("entity '{entity}' is not registered")))
    }

    /// Get metadata by public resource type (kebab-case).
    ///
    /// Unlike [`get`](Self::get), an unknown resource type is client input
    /// and maps to a not-found error.
    pub fn by_resource_type(&self, resource_type: &str) -> ApiResult<Arc<EntityMetadata>> {
        self.by_resource_type
            .get(resource_type)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| {
                ApiError::not_found(
                    format!("unknown resource type '{resource_type}'"),
                    "ref/type",
                )
            })
    }

    /// Metadata of a relation's target entity.
    pub fn target_of(&self, relation: &RelationMeta) -> ApiResult<Arc<EntityMetadata>> {
        self.get(&relation.target)
    }

    /// Names of every registered entity.
    pub fn entity_names(&self) -> Vec<String> {
        self.by_name.iter().map(|r| r.key().clone()).collect()
    }

    /// Number of registered entities.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::metadata::{Cardinality, FieldKind, RelationLink};

    struct FixtureProvider;

    impl EntityMetadataProvider for FixtureProvider {
        fn entity_names(&self) -> Vec<String> {
            vec!["Users".to_string(), "Roles".to_string()]
        }

        fn table(&self, entity: &str) -> anyhow::Result<String> {
            Ok(entity.to_lowercase())
        }

        fn fields(&self, _entity: &str) -> anyhow::Result<Vec<FieldMeta>> {
            Ok(vec![FieldMeta {
                name: "id".to_string(),
                kind: FieldKind::Number,
                nullable: false,
            }])
        }

        fn primary_key(&self, _entity: &str) -> anyhow::Result<FieldMeta> {
            Ok(FieldMeta {
                name: "id".to_string(),
                kind: FieldKind::Number,
                nullable: false,
            })
        }

        fn relations(&self, entity: &str) -> anyhow::Result<Vec<RelationMeta>> {
            if entity == "Users" {
                Ok(vec![RelationMeta {
                    name: "roles".to_string(),
                    cardinality: Cardinality::Many,
                    nullable: true,
                    target: "Roles".to_string(),
                    link: RelationLink::JoinTable {
                        table: "users_have_roles".to_string(),
                        source_column: "user_id".to_string(),
                        target_column: "role_id".to_string(),
                    },
                }])
            } else {
                Ok(vec![])
            }
        }
    }

    #[test]
    fn builds_and_resolves_by_both_keys() {
        let registry = EntityRegistry::from_provider(&FixtureProvider).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get("Users").is_ok());
        assert!(registry.by_resource_type("users").is_ok());
    }

    #[test]
    fn unregistered_entity_is_hard_error() {
        let registry = EntityRegistry::from_provider(&FixtureProvider).unwrap();
        let err = registry.get("Ghosts").unwrap_err();
        assert!(matches!(err, ApiError::Internal(_)));
    }

    #[test]
    fn unknown_resource_type_is_not_found() {
        let registry = EntityRegistry::from_provider(&FixtureProvider).unwrap();
        let err = registry.by_resource_type("ghosts").unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
