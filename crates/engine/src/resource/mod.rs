//! Resource transformation.
//!
//! Maps loaded records (with resolved relations) into JSON:API resource
//! documents: id, type, attribute subset, relationship entries, links, and
//! a flattened, deduplicated `included` array driven by the include list.

mod document;

pub use document::{
    IdentifierData, IdentifierDocument, PrimaryData, Relationship, ResourceDocument,
    ResourceIdentifier, ResourceObject, SelfLinks,
};

use std::collections::{BTreeMap, HashSet};

use crate::error::{ApiError, ApiResult};
use crate::metadata::{EntityMetadata, EntityRegistry, RelationLink, RelationMeta};
use crate::query::ResourceQuery;
use crate::storage::{value_to_key, EntityRecord, RelationValue};

/// Transforms records into resource documents.
pub struct ResourceTransformer<'a> {
    registry: &'a EntityRegistry,
    public_url: &'a str,
}

impl<'a> ResourceTransformer<'a> {
    pub fn new(registry: &'a EntityRegistry, public_url: &'a str) -> Self {
        Self {
            registry,
            public_url,
        }
    }

    /// Transform a collection into a document with `data` as an array.
    pub fn transform_collection(
        &self,
        records: &[EntityRecord],
        meta: &EntityMetadata,
        query: &ResourceQuery,
    ) -> ApiResult<ResourceDocument> {
        let mut data = Vec::with_capacity(records.len());
        for record in records {
            data.push(self.build_resource(
                record,
                meta,
                query.fields.get("target"),
                &query.include,
            )?);
        }
        Ok(ResourceDocument {
            data: PrimaryData::Many(data),
            included: self.extract_included(records, meta, query)?,
            meta: None,
        })
    }

    /// Transform a single record into a document with `data` as an object.
    pub fn transform_one(
        &self,
        record: &EntityRecord,
        meta: &EntityMetadata,
        query: &ResourceQuery,
    ) -> ApiResult<ResourceDocument> {
        let data = self.build_resource(record, meta, query.fields.get("target"), &query.include)?;
        Ok(ResourceDocument {
            data: PrimaryData::One(Some(data)),
            included: self.extract_included(std::slice::from_ref(record), meta, query)?,
            meta: None,
        })
    }

    /// The minimal identifier-only representation of one relation, used by
    /// the relationship endpoints.
    pub fn transform_relationship(
        &self,
        record: &EntityRecord,
        meta: &EntityMetadata,
        relation_name: &str,
    ) -> ApiResult<IdentifierDocument> {
        let Some(relation) = meta.relation(relation_name) else {
            return Err(ApiError::not_found(
                format!(
                    "'{relation_name}' is not a relation of '{}'",
                    meta.resource_type
                ),
                format!("relationships/{relation_name}"),
            ));
        };
        let id = record.id_string(meta)?;
        let data = self.identifier_data(record, relation)?;
        Ok(IdentifierDocument {
            data,
            links: SelfLinks {
                self_link: format!(
                    "{}/{}/{}/relationships/{}",
                    self.public_url, meta.resource_type, id, relation_name
                ),
            },
        })
    }

    /// Walk the include list and collect every distinct related resource
    /// into one flat list. Each (type, id) pair appears at most once, even
    /// when reachable through several relationship paths; sparse fieldsets
    /// apply per included type.
    pub fn extract_included(
        &self,
        records: &[EntityRecord],
        meta: &EntityMetadata,
        query: &ResourceQuery,
    ) -> ApiResult<Option<Vec<ResourceObject>>> {
        if query.include.is_empty() {
            return Ok(None);
        }

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut included = Vec::new();

        for name in &query.include {
            let Some(relation) = meta.relation(name) else {
                continue;
            };
            let target = self.registry.target_of(relation)?;
            let fields = query.fields.get(name);

            for record in records {
                let related: Vec<&EntityRecord> = match record.relations.get(name) {
                    Some(RelationValue::One(Some(r))) => vec![r.as_ref()],
                    Some(RelationValue::One(None)) | None => Vec::new(),
                    Some(RelationValue::Many(list)) => list.iter().collect(),
                };
                for related_record in related {
                    let key = (
                        target.resource_type.clone(),
                        related_record.id_string(&target)?,
                    );
                    if !seen.insert(key) {
                        continue;
                    }
                    // Included resources carry links-only relationships:
                    // nested includes are not part of the include grammar.
                    included.push(self.build_resource(related_record, &target, fields, &[])?);
                }
            }
        }

        Ok(Some(included))
    }

    fn build_resource(
        &self,
        record: &EntityRecord,
        meta: &EntityMetadata,
        fields: Option<&[String]>,
        include: &[String],
    ) -> ApiResult<ResourceObject> {
        let id = record.id_string(meta)?;

        let mut attributes = serde_json::Map::new();
        for name in meta.attribute_names() {
            if let Some(subset) = fields {
                if !subset.iter().any(|f| f == name) {
                    continue;
                }
            }
            if let Some(value) = record.get(name) {
                attributes.insert(name.to_string(), value.clone());
            }
        }

        let mut relationships = BTreeMap::new();
        for relation in &meta.relations {
            let links = SelfLinks {
                self_link: format!(
                    "{}/{}/{}/relationships/{}",
                    self.public_url, meta.resource_type, id, relation.name
                ),
            };
            let data = if include.iter().any(|i| i == &relation.name) {
                Some(self.identifier_data(record, relation)?)
            } else {
                None
            };
            relationships.insert(relation.name.clone(), Relationship { links, data });
        }

        Ok(ResourceObject {
            id: id.clone(),
            resource_type: meta.resource_type.clone(),
            attributes,
            relationships,
            links: SelfLinks {
                self_link: format!("{}/{}/{}", self.public_url, meta.resource_type, id),
            },
        })
    }

    /// Identifier data for one relation of one record.
    ///
    /// Prefers the loaded relation value; a to-one relation with a join
    /// column can be derived from the column without a load.
    fn identifier_data(
        &self,
        record: &EntityRecord,
        relation: &RelationMeta,
    ) -> ApiResult<IdentifierData> {
        let target = self.registry.target_of(relation)?;

        match record.relations.get(&relation.name) {
            Some(RelationValue::One(value)) => Ok(IdentifierData::One(match value {
                Some(related) => Some(ResourceIdentifier {
                    resource_type: target.resource_type.clone(),
                    id: related.id_string(&target)?,
                }),
                None => None,
            })),
            Some(RelationValue::Many(list)) => {
                let mut identifiers = Vec::with_capacity(list.len());
                for related in list {
                    identifiers.push(ResourceIdentifier {
                        resource_type: target.resource_type.clone(),
                        id: related.id_string(&target)?,
                    });
                }
                Ok(IdentifierData::Many(identifiers))
            }
            None => {
                if let RelationLink::JoinColumn { column } = &relation.link {
                    let identifier = record
                        .get(column)
                        .filter(|v| !v.is_null())
                        .map(|v| ResourceIdentifier {
                            resource_type: target.resource_type.clone(),
                            id: value_to_key(v),
                        });
                    return Ok(IdentifierData::One(identifier));
                }
                Err(ApiError::Internal(anyhow::anyhow!(
                    "relation '{}' was not loaded before transformation",
                    relation.name
                )))
            }
        }
    }
}
