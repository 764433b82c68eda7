//! Atomic operation executor.
//!
//! Runs a heterogeneous sequence of create/update/delete/relationship
//! operations inside one transaction, in input order. A `lid` declared by
//! an earlier `add` operation is substituted into later operations'
//! references before dispatch. Any failure rolls the whole batch back and
//! re-raises with the failing operation's index prefixed onto every error
//! pointer.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{ApiError, ApiResult};
use crate::metadata::EntityRegistry;
use crate::service::{EntityService, ResourceOperation};
use crate::storage::StorageConnection;

/// Operation code of one atomic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpCode {
    Add,
    Update,
    Remove,
}

/// Target reference of one operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRef {
    #[serde(rename = "type")]
    pub resource_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
}

/// One atomic operation.
#[derive(Debug, Clone, Deserialize)]
pub struct AtomicOperation {
    pub op: OpCode,

    #[serde(rename = "ref")]
    pub reference: OperationRef,

    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Request envelope: `{"atomic:operations": [...]}`.
#[derive(Debug, Clone, Deserialize)]
pub struct AtomicEnvelope {
    #[serde(rename = "atomic:operations")]
    pub operations: Vec<AtomicOperation>,
}

/// Result of one operation, in input order.
#[derive(Debug, Clone, Serialize)]
pub struct AtomicResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

/// Response envelope: `{"atomic:results": [...]}`.
#[derive(Debug, Clone, Serialize)]
pub struct AtomicResults {
    #[serde(rename = "atomic:results")]
    pub results: Vec<AtomicResult>,
}

/// Request lifecycle. The `lid` map lives exactly as long as `Executing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Resolving,
    Executing,
    Committed,
    RolledBack,
}

/// Executes atomic operation batches.
pub struct AtomicExecutor {
    registry: Arc<EntityRegistry>,
    config: Arc<EngineConfig>,
}

impl AtomicExecutor {
    pub fn new(registry: Arc<EntityRegistry>, config: Arc<EngineConfig>) -> Self {
        Self { registry, config }
    }

    /// Execute a parsed envelope inside one transaction.
    pub async fn execute(
        &self,
        conn: &mut dyn StorageConnection,
        envelope: AtomicEnvelope,
    ) -> ApiResult<AtomicResults> {
        let mut phase = Phase::Pending;
        debug!(?phase, operations = envelope.operations.len(), "atomic request received");

        // Resolving: every operation must map to a known handler before
        // anything touches storage.
        phase = Phase::Resolving;
        debug!(?phase, "resolving operation handlers");
        let mut resolved = Vec::with_capacity(envelope.operations.len());
        for (index, operation) in envelope.operations.iter().enumerate() {
            let pair = self
                .resolve_handler(operation)
                .map_err(|e| e.with_pointer_prefix(&format!("/atomic:operations/{index}")))?;
            resolved.push(pair);
        }

        // Executing: strictly in input order, one transaction, one
        // request-scoped lid map.
        phase = Phase::Executing;
        debug!(?phase, "executing operations");
        conn.begin().await?;
        let mut lids: HashMap<String, String> = HashMap::new();
        let mut results = Vec::with_capacity(envelope.operations.len());

        for (index, (operation, (service, resource_op))) in
            envelope.operations.into_iter().zip(resolved).enumerate()
        {
            let mut operation = operation;
            let outcome = self
                .run_operation(conn, &mut operation, service, resource_op, &mut lids)
                .await;
            match outcome {
                Ok(result) => results.push(result),
                Err(error) => {
                    phase = Phase::RolledBack;
                    if let Err(rollback_error) = conn.rollback().await {
                        tracing::warn!(error = %rollback_error, "rollback failed after operation error");
                    }
                    debug!(?phase, index, "atomic request rolled back");
                    return Err(
                        error.with_pointer_prefix(&format!("/atomic:operations/{index}"))
                    );
                }
            }
        }

        conn.commit().await?;
        phase = Phase::Committed;
        debug!(?phase, results = results.len(), "atomic request committed");
        Ok(AtomicResults { results })
    }

    /// Map `(type, op, relationship?)` to a handler, pre-validating that
    /// the target type exists and the operation is allowed on it.
    fn resolve_handler(
        &self,
        operation: &AtomicOperation,
    ) -> ApiResult<(EntityService, ResourceOperation)> {
        let service = EntityService::by_resource_type(
            Arc::clone(&self.registry),
            &operation.reference.resource_type,
            Arc::clone(&self.config),
        )?;

        let has_relationship = operation.reference.relationship.is_some();
        let resource_op = match (operation.op, has_relationship) {
            (OpCode::Add, false) => ResourceOperation::Create,
            (OpCode::Add, true) => ResourceOperation::AddToRelationship,
            (OpCode::Update, false) => ResourceOperation::Update,
            (OpCode::Update, true) => ResourceOperation::SetRelationship,
            (OpCode::Remove, false) => ResourceOperation::Delete,
            (OpCode::Remove, true) => ResourceOperation::RemoveFromRelationship,
        };

        service.supports(resource_op, operation.reference.relationship.as_deref())?;

        if !matches!(resource_op, ResourceOperation::Create)
            && operation.reference.id.is_none()
            && operation.reference.lid.is_none()
        {
            return Err(ApiError::validation(
                "operation requires ref/id or ref/lid",
                "ref",
            ));
        }

        Ok((service, resource_op))
    }

    async fn run_operation(
        &self,
        conn: &mut dyn StorageConnection,
        operation: &mut AtomicOperation,
        service: EntityService,
        resource_op: ResourceOperation,
        lids: &mut HashMap<String, String>,
    ) -> ApiResult<AtomicResult> {
        // Substitute earlier lids into this operation's relationship
        // references before its handler sees them.
        if let Some(data) = &mut operation.data {
            match resource_op {
                ResourceOperation::SetRelationship
                | ResourceOperation::AddToRelationship
                | ResourceOperation::RemoveFromRelationship => {
                    substitute_identifiers(data, lids)?;
                }
                _ => {
                    if let Some(relationships) =
                        data.get_mut("relationships").and_then(|v| v.as_object_mut())
                    {
                        for entry in relationships.values_mut() {
                            if let Some(rel_data) = entry.get_mut("data") {
                                substitute_identifiers(rel_data, lids)?;
                            }
                        }
                    }
                }
            }
        }

        match resource_op {
            ResourceOperation::Create => {
                let data = operation.data.as_ref().ok_or_else(|| {
                    ApiError::unprocessable("add operations require a data member", "data")
                })?;
                let (id, document) = service.create(conn, data).await?;
                if let Some(lid) = &operation.reference.lid {
                    lids.insert(lid.clone(), id);
                }
                Ok(AtomicResult {
                    data: Some(serde_json::to_value(&document.data).map_err(|e| {
                        ApiError::Internal(anyhow::Error::new(e))
                    })?),
                    meta: None,
                })
            }
            ResourceOperation::Update => {
                let id = resolve_target_id(&operation.reference, lids)?;
                let data = operation.data.as_ref().ok_or_else(|| {
                    ApiError::unprocessable("update operations require a data member", "data")
                })?;
                let document = service.update(conn, &id, data).await?;
                Ok(AtomicResult {
                    data: Some(serde_json::to_value(&document.data).map_err(|e| {
                        ApiError::Internal(anyhow::Error::new(e))
                    })?),
                    meta: None,
                })
            }
            ResourceOperation::Delete => {
                let id = resolve_target_id(&operation.reference, lids)?;
                service.delete(conn, &id).await?;
                Ok(AtomicResult {
                    data: None,
                    meta: None,
                })
            }
            ResourceOperation::SetRelationship
            | ResourceOperation::AddToRelationship
            | ResourceOperation::RemoveFromRelationship => {
                let id = resolve_target_id(&operation.reference, lids)?;
                let relationship = operation
                    .reference
                    .relationship
                    .as_deref()
                    .ok_or_else(|| {
                        ApiError::Internal(anyhow::anyhow!("relationship handler without name"))
                    })?;
                // An explicit `data: null` arrives as a missing member;
                // for a replace that means "clear".
                let data = operation
                    .data
                    .clone()
                    .unwrap_or(serde_json::Value::Null);

                let document = match resource_op {
                    ResourceOperation::SetRelationship => {
                        service.set_relationship(conn, &id, relationship, &data).await?
                    }
                    ResourceOperation::AddToRelationship => {
                        service
                            .add_to_relationship(conn, &id, relationship, &data)
                            .await?
                    }
                    _ => {
                        service
                            .remove_from_relationship(conn, &id, relationship, &data)
                            .await?
                    }
                };
                Ok(AtomicResult {
                    data: Some(serde_json::to_value(&document.data).map_err(|e| {
                        ApiError::Internal(anyhow::Error::new(e))
                    })?),
                    meta: None,
                })
            }
            ResourceOperation::GetAll
            | ResourceOperation::GetOne
            | ResourceOperation::GetRelationship => Err(ApiError::Internal(anyhow::anyhow!(
                "read operation resolved inside an atomic batch"
            ))),
        }
    }
}

/// Resolve the target id of a non-add operation, substituting lids.
fn resolve_target_id(
    reference: &OperationRef,
    lids: &HashMap<String, String>,
) -> ApiResult<String> {
    if let Some(lid) = &reference.lid {
        return lids.get(lid).cloned().ok_or_else(|| {
            ApiError::validation(
                format!("'{lid}' does not match any lid from an earlier add operation"),
                "ref/lid",
            )
        });
    }
    if let Some(id) = &reference.id {
        // An id equal to a known lid is substituted as well.
        if let Some(real) = lids.get(id) {
            return Ok(real.clone());
        }
        return Ok(id.clone());
    }
    Err(ApiError::validation(
        "operation requires ref/id or ref/lid",
        "ref",
    ))
}

/// Rewrite resource identifiers in-place, substituting known lids.
fn substitute_identifiers(
    value: &mut serde_json::Value,
    lids: &HashMap<String, String>,
) -> ApiResult<()> {
    match value {
        serde_json::Value::Array(items) => {
            for item in items {
                substitute_identifier(item, lids)?;
            }
            Ok(())
        }
        serde_json::Value::Object(_) => substitute_identifier(value, lids),
        _ => Ok(()),
    }
}

fn substitute_identifier(
    value: &mut serde_json::Value,
    lids: &HashMap<String, String>,
) -> ApiResult<()> {
    let Some(object) = value.as_object_mut() else {
        return Ok(());
    };

    if let Some(lid) = object.get("lid").and_then(|v| v.as_str()).map(str::to_string) {
        let Some(real) = lids.get(&lid) else {
            return Err(ApiError::validation(
                format!("'{lid}' does not match any lid from an earlier add operation"),
                "data/lid",
            ));
        };
        object.remove("lid");
        object.insert("id".to_string(), serde_json::Value::String(real.clone()));
        return Ok(());
    }

    if let Some(id) = object.get("id").and_then(|v| v.as_str()) {
        if let Some(real) = lids.get(id) {
            object.insert("id".to_string(), serde_json::Value::String(real.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_parses_operations_in_order() {
        let envelope: AtomicEnvelope = serde_json::from_value(json!({
            "atomic:operations": [
                { "op": "add", "ref": { "type": "users", "lid": "a" }, "data": { "type": "users" } },
                { "op": "update", "ref": { "type": "users", "lid": "a" }, "data": { "type": "users" } },
                { "op": "remove", "ref": { "type": "users", "id": "3" } }
            ]
        }))
        .unwrap();

        assert_eq!(envelope.operations.len(), 3);
        assert_eq!(envelope.operations[0].op, OpCode::Add);
        assert_eq!(envelope.operations[0].reference.lid.as_deref(), Some("a"));
        assert_eq!(envelope.operations[2].op, OpCode::Remove);
    }

    #[test]
    fn lid_substitution_rewrites_identifiers() {
        let mut lids = HashMap::new();
        lids.insert("tmp-1".to_string(), "42".to_string());

        let mut data = json!([
            { "type": "roles", "lid": "tmp-1" },
            { "type": "roles", "id": "7" }
        ]);
        substitute_identifiers(&mut data, &lids).unwrap();

        assert_eq!(
            data,
            json!([
                { "type": "roles", "id": "42" },
                { "type": "roles", "id": "7" }
            ])
        );
    }

    #[test]
    fn unknown_lid_is_a_validation_error() {
        let lids = HashMap::new();
        let mut data = json!({ "type": "roles", "lid": "ghost" });
        let err = substitute_identifiers(&mut data, &lids).unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn id_matching_a_lid_is_substituted() {
        let mut lids = HashMap::new();
        lids.insert("tmp-1".to_string(), "42".to_string());

        let reference = OperationRef {
            resource_type: "users".to_string(),
            id: Some("tmp-1".to_string()),
            lid: None,
            relationship: None,
        };
        assert_eq!(resolve_target_id(&reference, &lids).unwrap(), "42");
    }
}
