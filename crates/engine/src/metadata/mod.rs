//! Entity metadata.
//!
//! Describes the relational shape of each exposed entity: scalar fields,
//! primary key, and relations with their SQL linkage. Metadata is built once
//! at startup from a provider and is read-only for the process lifetime.

mod registry;

pub use registry::{EntityMetadataProvider, EntityRegistry};

use heck::{ToKebabCase, ToSnakeCase};
use serde::{Deserialize, Serialize};

/// Scalar field type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Date,
    Array,
    Object,
}

/// A scalar field on an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMeta {
    /// Column name.
    pub name: String,

    /// Type tag.
    pub kind: FieldKind,

    /// Whether the column is nullable.
    pub nullable: bool,
}

/// Relation cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    One,
    Many,
}

/// SQL linkage of a relation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationLink {
    /// To-one owning side: this table carries the join column.
    JoinColumn { column: String },

    /// Has-many: the target table carries a column referencing our primary key.
    ForeignColumn { column: String },

    /// Many-to-many through a join table.
    JoinTable {
        table: String,
        /// Column in the join table referencing this entity's primary key.
        source_column: String,
        /// Column in the join table referencing the target's primary key.
        target_column: String,
    },
}

/// A relation declared on an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationMeta {
    /// Relation name as exposed in the API.
    pub name: String,

    pub cardinality: Cardinality,

    pub nullable: bool,

    /// Entity name of the relation target.
    pub target: String,

    /// How the relation maps to SQL.
    pub link: RelationLink,
}

impl RelationMeta {
    /// Whether this relation goes through a join table.
    pub fn is_many_to_many(&self) -> bool {
        matches!(self.link, RelationLink::JoinTable { .. })
    }
}

/// Immutable description of one entity type.
///
/// One instance per entity type, shared by every compiler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMetadata {
    /// Entity name (e.g. `UserProfile`).
    pub name: String,

    /// SQL table name.
    pub table: String,

    /// Public resource type: kebab-cased entity name (e.g. `user-profile`).
    pub resource_type: String,

    /// Stable query alias: snake-cased entity name.
    pub query_alias: String,

    /// Primary key field.
    pub primary_key: FieldMeta,

    /// Scalar fields, primary key included.
    pub fields: Vec<FieldMeta>,

    /// Declared relations.
    pub relations: Vec<RelationMeta>,
}

impl EntityMetadata {
    /// Build metadata, deriving the public type name and query alias.
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        primary_key: FieldMeta,
        fields: Vec<FieldMeta>,
        relations: Vec<RelationMeta>,
    ) -> Self {
        let name = name.into();
        let resource_type = name.to_kebab_case();
        let query_alias = name.to_snake_case();
        Self {
            name,
            table: table.into(),
            resource_type,
            query_alias,
            primary_key,
            fields,
            relations,
        }
    }

    /// Look up a scalar field by name (primary key included).
    pub fn field(&self, name: &str) -> Option<&FieldMeta> {
        if self.primary_key.name == name {
            return Some(&self.primary_key);
        }
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a relation by name.
    pub fn relation(&self, name: &str) -> Option<&RelationMeta> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Attribute names exposed in resource documents: scalar fields minus
    /// the primary key.
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.name != self.primary_key.name)
            .map(|f| f.name.as_str())
    }
}
