//! JSON:API document types.
//!
//! The relationship `data` member is doubly optional on purpose: an absent
//! key means "not loaded", while a present `null` or `[]` means "loaded
//! and absent/empty".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A `{type, id}` resource identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentifier {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
}

/// Relationship data: single identifier (nullable) or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum IdentifierData {
    One(Option<ResourceIdentifier>),
    Many(Vec<ResourceIdentifier>),
}

/// `links` object carrying a `self` link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelfLinks {
    #[serde(rename = "self")]
    pub self_link: String,
}

/// One relationship entry on a resource object.
#[derive(Debug, Clone, Serialize)]
pub struct Relationship {
    pub links: SelfLinks,

    /// Present only when the relation was requested via include.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<IdentifierData>,
}

/// A full resource object.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceObject {
    pub id: String,

    #[serde(rename = "type")]
    pub resource_type: String,

    pub attributes: serde_json::Map<String, serde_json::Value>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub relationships: BTreeMap<String, Relationship>,

    pub links: SelfLinks,
}

/// Primary data: single resource (nullable) or a collection.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum PrimaryData {
    One(Option<ResourceObject>),
    Many(Vec<ResourceObject>),
}

/// A complete resource document.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceDocument {
    pub data: PrimaryData,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub included: Option<Vec<ResourceObject>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Document returned by relationship endpoints: identifiers only.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifierDocument {
    pub data: IdentifierData,
    pub links: SelfLinks,
}
