//! Per-entity resource operations.
//!
//! One service per entity type, built from metadata at startup. Each
//! operation runs the full pipeline: validate the query, compile filters,
//! translate the select plan, execute, load includes, transform. The
//! capability surface is explicit: the atomic executor resolves handlers
//! against [`EntityService::supports`] instead of probing at dispatch time.

use std::sync::Arc;

use tokio_stream::StreamExt;

use crate::config::EngineConfig;
use crate::error::{ApiError, ApiResult};
use crate::metadata::{Cardinality, EntityMetadata, EntityRegistry, RelationLink, RelationMeta};
use crate::query::{Page, ResourceQuery, validate_query};
use crate::relationships::{
    find_relationships, validate_relation_input_data, ResolvedIds, ResolvedRelation,
};
use crate::resource::{IdentifierDocument, ResourceDocument, ResourceTransformer};
use crate::sql::{
    build_select_plan, compile_access_rules, compile_relation_filter, compile_target_filter,
    ParamNamer, SelectPlan,
};
use crate::storage::{coerce_id, loader, EntityRecord, StorageConnection};

/// Operations a resource endpoint can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceOperation {
    GetAll,
    GetOne,
    Create,
    Update,
    Delete,
    GetRelationship,
    SetRelationship,
    AddToRelationship,
    RemoveFromRelationship,
}

/// Deferred relationship write, applied after the owning row exists.
enum PendingLink {
    ToOne {
        relation: RelationMeta,
        target: Option<String>,
    },
    ToMany {
        relation: RelationMeta,
        targets: Vec<String>,
    },
}

/// Service for one entity type.
#[derive(Clone)]
pub struct EntityService {
    registry: Arc<EntityRegistry>,
    meta: Arc<EntityMetadata>,
    config: Arc<EngineConfig>,
}

impl EntityService {
    /// Build the service for an entity name.
    pub fn new(
        registry: Arc<EntityRegistry>,
        entity: &str,
        config: Arc<EngineConfig>,
    ) -> ApiResult<Self> {
        let meta = registry.get(entity)?;
        Ok(Self {
            registry,
            meta,
            config,
        })
    }

    /// Build the service for a public resource type.
    pub fn by_resource_type(
        registry: Arc<EntityRegistry>,
        resource_type: &str,
        config: Arc<EngineConfig>,
    ) -> ApiResult<Self> {
        let meta = registry.by_resource_type(resource_type)?;
        Ok(Self {
            registry,
            meta,
            config,
        })
    }

    pub fn meta(&self) -> &EntityMetadata {
        &self.meta
    }

    /// Check that an operation is available on this entity, including the
    /// relationship-specific constraints.
    pub fn supports(
        &self,
        operation: ResourceOperation,
        relationship: Option<&str>,
    ) -> ApiResult<()> {
        let Some(name) = relationship else {
            return Ok(());
        };
        let Some(relation) = self.meta.relation(name) else {
            return Err(ApiError::not_found(
                format!("'{name}' is not a relation of '{}'", self.meta.resource_type),
                "ref/relationship",
            ));
        };
        if matches!(
            operation,
            ResourceOperation::AddToRelationship | ResourceOperation::RemoveFromRelationship
        ) && relation.cardinality != Cardinality::Many
        {
            return Err(ApiError::method_not_allowed(
                format!("relationship '{name}' is to-one and cannot be added to or removed from"),
                "ref/relationship",
            ));
        }
        Ok(())
    }

    /// List resources matching a query, with an optional access-rule tree
    /// conjoined onto the user filter.
    pub async fn get_all(
        &self,
        conn: &mut dyn StorageConnection,
        mut query: ResourceQuery,
        access_rules: Option<&serde_json::Value>,
    ) -> ApiResult<ResourceDocument> {
        validate_query(
            &self.registry,
            &self.meta,
            &mut query,
            self.config.max_page_size,
            self.config.default_page_size,
        )?;
        if query.page.is_none() {
            query.page = Some(Page {
                number: 1,
                size: self.config.default_page_size,
            });
        }

        let mut namer = ParamNamer::new();
        let mut conditions =
            compile_target_filter(&self.registry, &self.meta, &query.filter.target, &mut namer)?;
        conditions.extend(compile_relation_filter(
            &self.registry,
            &self.meta,
            &query.filter.relation,
            &mut namer,
        )?);
        let acl = match access_rules {
            Some(rules) => Some(compile_access_rules(&self.meta, rules, &mut namer)?),
            None => None,
        };

        let plan = build_select_plan(&self.registry, &self.meta, &query, conditions, acl)?;
        let total = conn.count(&self.meta, &plan).await?;
        let mut records = conn.select(&self.meta, &plan).await?;
        loader::load_includes(
            conn,
            &self.registry,
            &self.meta,
            &mut records,
            &query.include,
            &query.fields,
        )
        .await?;

        let transformer = ResourceTransformer::new(&self.registry, &self.config.public_url);
        let mut document = transformer.transform_collection(&records, &self.meta, &query)?;
        if let Some(page) = query.page {
            document.meta = Some(serde_json::json!({
                "total": total,
                "page": page.number,
                "size": page.size,
            }));
        }
        Ok(document)
    }

    /// Fetch one resource by id.
    pub async fn get_one(
        &self,
        conn: &mut dyn StorageConnection,
        id: &str,
        mut query: ResourceQuery,
    ) -> ApiResult<ResourceDocument> {
        query.page = None;
        validate_query(
            &self.registry,
            &self.meta,
            &mut query,
            self.config.max_page_size,
            self.config.default_page_size,
        )?;

        let mut record = self.load_record(conn, id, query.fields.get("target")).await?;
        loader::load_includes(
            conn,
            &self.registry,
            &self.meta,
            std::slice::from_mut(&mut record),
            &query.include,
            &query.fields,
        )
        .await?;

        let transformer = ResourceTransformer::new(&self.registry, &self.config.public_url);
        transformer.transform_one(&record, &self.meta, &query)
    }

    /// Create a resource from a `data` payload, resolving its relationship
    /// references before the row is written.
    ///
    /// Returns the new public id along with the created resource document.
    pub async fn create(
        &self,
        conn: &mut dyn StorageConnection,
        data: &serde_json::Value,
    ) -> ApiResult<(String, ResourceDocument)> {
        let object = self.payload_object(data)?;
        let mut values = match object.get("attributes") {
            Some(attributes) => self.attribute_values(attributes)?,
            None => serde_json::Map::new(),
        };
        if let Some(id) = object.get("id").and_then(|v| v.as_str()) {
            values.insert(
                self.meta.primary_key.name.clone(),
                coerce_id(&self.meta, id),
            );
        }

        let mut pending = Vec::new();
        if let Some(relationships) = object.get("relationships") {
            let Some(map) = relationships.as_object() else {
                return Err(ApiError::unprocessable(
                    "relationships must be an object",
                    "data/relationships",
                ));
            };
            // Resolve each relation as it streams in; join-column targets
            // land directly in the insert values.
            let mut resolved = Vec::new();
            {
                let stream = find_relationships(&mut *conn, &self.registry, &self.meta, map);
                tokio::pin!(stream);
                while let Some(item) = stream.next().await {
                    resolved.push(item?);
                }
            }
            for (name, relation_value) in resolved {
                let relation = self
                    .meta
                    .relation(&name)
                    .ok_or_else(|| {
                        ApiError::Internal(anyhow::anyhow!("relation '{name}' disappeared"))
                    })?
                    .clone();
                let target = self.registry.target_of(&relation)?;
                match relation_value {
                    ResolvedRelation::One(related) => {
                        let target_id = match &related {
                            Some(record) => Some(record.id_string(&target)?),
                            None => None,
                        };
                        if let RelationLink::JoinColumn { column } = &relation.link {
                            let value = match &target_id {
                                Some(id) => coerce_id(&target, id),
                                None => serde_json::Value::Null,
                            };
                            values.insert(column.clone(), value);
                        } else {
                            pending.push(PendingLink::ToOne {
                                relation,
                                target: target_id,
                            });
                        }
                    }
                    ResolvedRelation::Many(related) => {
                        let mut targets = Vec::with_capacity(related.len());
                        for record in &related {
                            targets.push(record.id_string(&target)?);
                        }
                        pending.push(PendingLink::ToMany { relation, targets });
                    }
                }
            }
        }

        let id_value = conn.insert(&self.meta, &values).await?;
        self.apply_links(conn, &id_value, pending).await?;

        let id = crate::storage::value_to_key(&id_value);
        let document = self.get_one(conn, &id, ResourceQuery::default()).await?;
        Ok((id, document))
    }

    /// Update a resource's attributes and relationships.
    pub async fn update(
        &self,
        conn: &mut dyn StorageConnection,
        id: &str,
        data: &serde_json::Value,
    ) -> ApiResult<ResourceDocument> {
        let object = self.payload_object(data)?;
        if let Some(declared) = object.get("id").and_then(|v| v.as_str()) {
            if declared != id {
                return Err(ApiError::Conflict(vec![crate::error::ErrorObject::new(
                    format!("payload id '{declared}' does not match target id '{id}'"),
                    "data/id",
                )]));
            }
        }

        // The row must exist before anything is written.
        self.load_record(conn, id, None).await?;

        let mut values = match object.get("attributes") {
            Some(attributes) => self.attribute_values(attributes)?,
            None => serde_json::Map::new(),
        };

        let mut pending = Vec::new();
        if let Some(relationships) = object.get("relationships") {
            let Some(map) = relationships.as_object() else {
                return Err(ApiError::unprocessable(
                    "relationships must be an object",
                    "data/relationships",
                ));
            };
            for (name, entry) in map {
                let pointer = format!("data/relationships/{name}/data");
                let rel_data = entry.get("data").ok_or_else(|| {
                    ApiError::unprocessable(
                        format!("relationship '{name}' is missing its data member"),
                        format!("data/relationships/{name}"),
                    )
                })?;
                let ids = validate_relation_input_data(
                    &mut *conn,
                    &self.registry,
                    &self.meta,
                    name,
                    rel_data,
                    &pointer,
                )
                .await?;
                let relation = self
                    .meta
                    .relation(name)
                    .ok_or_else(|| {
                        ApiError::Internal(anyhow::anyhow!("relation '{name}' disappeared"))
                    })?
                    .clone();
                match ids {
                    ResolvedIds::One(target_id) => {
                        if let RelationLink::JoinColumn { column } = &relation.link {
                            let target = self.registry.target_of(&relation)?;
                            let value = match &target_id {
                                Some(t) => coerce_id(&target, t),
                                None => serde_json::Value::Null,
                            };
                            values.insert(column.clone(), value);
                        } else {
                            pending.push(PendingLink::ToOne {
                                relation,
                                target: target_id,
                            });
                        }
                    }
                    ResolvedIds::Many(targets) => {
                        pending.push(PendingLink::ToMany { relation, targets });
                    }
                }
            }
        }

        let id_value = coerce_id(&self.meta, id);
        if !values.is_empty() && !conn.update(&self.meta, &id_value, &values).await? {
            return Err(ApiError::not_found(
                format!("resource '{}' with id '{id}' does not exist", self.meta.resource_type),
                "data/id",
            ));
        }
        self.apply_links(conn, &id_value, pending).await?;

        self.get_one(conn, id, ResourceQuery::default()).await
    }

    /// Delete a resource by id.
    pub async fn delete(&self, conn: &mut dyn StorageConnection, id: &str) -> ApiResult<()> {
        let id_value = coerce_id(&self.meta, id);
        if !conn.delete(&self.meta, &id_value).await? {
            return Err(ApiError::not_found(
                format!(
                    "resource '{}' with id '{id}' does not exist",
                    self.meta.resource_type
                ),
                "ref/id",
            ));
        }
        Ok(())
    }

    /// Fetch the identifier document for one relationship.
    pub async fn get_relationship(
        &self,
        conn: &mut dyn StorageConnection,
        id: &str,
        relationship: &str,
    ) -> ApiResult<IdentifierDocument> {
        let Some(relation) = self.meta.relation(relationship) else {
            return Err(ApiError::not_found(
                format!(
                    "'{relationship}' is not a relation of '{}'",
                    self.meta.resource_type
                ),
                "ref/relationship",
            ));
        };
        let relation = relation.clone();

        let mut record = self.load_record(conn, id, None).await?;
        loader::load_relation(
            conn,
            &self.registry,
            &self.meta,
            std::slice::from_mut(&mut record),
            &relation,
            None,
        )
        .await?;

        let transformer = ResourceTransformer::new(&self.registry, &self.config.public_url);
        transformer.transform_relationship(&record, &self.meta, relationship)
    }

    /// Replace a relationship's target(s).
    pub async fn set_relationship(
        &self,
        conn: &mut dyn StorageConnection,
        id: &str,
        relationship: &str,
        data: &serde_json::Value,
    ) -> ApiResult<IdentifierDocument> {
        self.supports(ResourceOperation::SetRelationship, Some(relationship))?;
        let ids = validate_relation_input_data(
            &mut *conn,
            &self.registry,
            &self.meta,
            relationship,
            data,
            "data",
        )
        .await?;
        let relation = self.relation(relationship)?;
        self.load_record(conn, id, None).await?;

        let id_value = coerce_id(&self.meta, id);
        match ids {
            ResolvedIds::One(target) => {
                conn.set_to_one(&self.meta, &id_value, &relation, target.as_deref())
                    .await?;
            }
            ResolvedIds::Many(targets) => {
                conn.replace_to_many(&self.meta, &id_value, &relation, &targets)
                    .await?;
            }
        }

        self.get_relationship(conn, id, relationship).await
    }

    /// Add members to a to-many relationship.
    pub async fn add_to_relationship(
        &self,
        conn: &mut dyn StorageConnection,
        id: &str,
        relationship: &str,
        data: &serde_json::Value,
    ) -> ApiResult<IdentifierDocument> {
        self.supports(ResourceOperation::AddToRelationship, Some(relationship))?;
        let ids = validate_relation_input_data(
            &mut *conn,
            &self.registry,
            &self.meta,
            relationship,
            data,
            "data",
        )
        .await?;
        let relation = self.relation(relationship)?;
        self.load_record(conn, id, None).await?;

        let ResolvedIds::Many(targets) = ids else {
            return Err(ApiError::unprocessable(
                format!("relationship '{relationship}' expects an array of identifiers"),
                "data",
            ));
        };
        let id_value = coerce_id(&self.meta, id);
        conn.add_to_many(&self.meta, &id_value, &relation, &targets)
            .await?;

        self.get_relationship(conn, id, relationship).await
    }

    /// Remove members from a to-many relationship.
    pub async fn remove_from_relationship(
        &self,
        conn: &mut dyn StorageConnection,
        id: &str,
        relationship: &str,
        data: &serde_json::Value,
    ) -> ApiResult<IdentifierDocument> {
        self.supports(ResourceOperation::RemoveFromRelationship, Some(relationship))?;
        let ids = validate_relation_input_data(
            &mut *conn,
            &self.registry,
            &self.meta,
            relationship,
            data,
            "data",
        )
        .await?;
        let relation = self.relation(relationship)?;
        self.load_record(conn, id, None).await?;

        let ResolvedIds::Many(targets) = ids else {
            return Err(ApiError::unprocessable(
                format!("relationship '{relationship}' expects an array of identifiers"),
                "data",
            ));
        };
        let id_value = coerce_id(&self.meta, id);
        conn.remove_from_many(&self.meta, &id_value, &relation, &targets)
            .await?;

        self.get_relationship(conn, id, relationship).await
    }

    fn relation(&self, name: &str) -> ApiResult<RelationMeta> {
        self.meta
            .relation(name)
            .cloned()
            .ok_or_else(|| {
                ApiError::not_found(
                    format!("'{name}' is not a relation of '{}'", self.meta.resource_type),
                    "ref/relationship",
                )
            })
    }

    async fn load_record(
        &self,
        conn: &mut dyn StorageConnection,
        id: &str,
        fields: Option<&[String]>,
    ) -> ApiResult<EntityRecord> {
        let plan = SelectPlan::by_ids(&self.meta, vec![coerce_id(&self.meta, id)], fields);
        let mut records = conn.select(&self.meta, &plan).await?;
        records.pop().ok_or_else(|| {
            ApiError::not_found(
                format!(
                    "resource '{}' with id '{id}' does not exist",
                    self.meta.resource_type
                ),
                "ref/id",
            )
        })
    }

    async fn apply_links(
        &self,
        conn: &mut dyn StorageConnection,
        id_value: &serde_json::Value,
        pending: Vec<PendingLink>,
    ) -> ApiResult<()> {
        for link in pending {
            match link {
                PendingLink::ToOne { relation, target } => {
                    conn.set_to_one(&self.meta, id_value, &relation, target.as_deref())
                        .await?;
                }
                PendingLink::ToMany { relation, targets } => {
                    conn.replace_to_many(&self.meta, id_value, &relation, &targets)
                        .await?;
                }
            }
        }
        Ok(())
    }

    fn payload_object<'v>(
        &self,
        data: &'v serde_json::Value,
    ) -> ApiResult<&'v serde_json::Map<String, serde_json::Value>> {
        let Some(object) = data.as_object() else {
            return Err(ApiError::unprocessable(
                "data must be a resource object",
                "data",
            ));
        };
        let declared = object.get("type").and_then(|v| v.as_str()).unwrap_or("");
        if declared != self.meta.resource_type {
            return Err(ApiError::unprocessable(
                format!(
                    "expected resource type '{}', got '{declared}'",
                    self.meta.resource_type
                ),
                "data/type",
            ));
        }
        Ok(object)
    }

    fn attribute_values(
        &self,
        attributes: &serde_json::Value,
    ) -> ApiResult<serde_json::Map<String, serde_json::Value>> {
        let Some(map) = attributes.as_object() else {
            return Err(ApiError::unprocessable(
                "attributes must be an object",
                "data/attributes",
            ));
        };

        let mut values = serde_json::Map::new();
        let mut errors = Vec::new();
        for (name, value) in map {
            if name == &self.meta.primary_key.name {
                errors.push(crate::error::ErrorObject::new(
                    "the primary key is set via data/id, not attributes",
                    format!("data/attributes/{name}"),
                ));
                continue;
            }
            if self.meta.field(name).is_none() {
                errors.push(crate::error::ErrorObject::new(
                    format!("unknown attribute '{}' on '{}'", name, self.meta.resource_type),
                    format!("data/attributes/{name}"),
                ));
                continue;
            }
            values.insert(name.clone(), value.clone());
        }
        if !errors.is_empty() {
            return Err(ApiError::Validation(errors));
        }
        Ok(values)
    }
}
