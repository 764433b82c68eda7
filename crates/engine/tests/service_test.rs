#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Entity service integration tests: query pipeline, CRUD, relationships.

mod common;

use common::MemoryStorage;
use jsonapi_engine::error::ApiError;
use jsonapi_engine::query::ResourceQuery;
use jsonapi_engine::resource::{IdentifierData, PrimaryData};
use jsonapi_engine::service::{EntityService, ResourceOperation};
use serde_json::json;

fn users_service() -> EntityService {
    EntityService::new(common::registry(), "Users", common::config()).unwrap()
}

fn seeded_storage() -> MemoryStorage {
    let mut storage = MemoryStorage::new();
    storage.seed(
        "users",
        json!({ "id": 1, "login": "bob", "created": "2024-01-01", "manager_id": null }),
    );
    storage.seed(
        "users",
        json!({ "id": 2, "login": "alice", "created": "2024-02-01", "manager_id": 1 }),
    );
    storage.seed("roles", json!({ "id": 10, "key": "admin" }));
    storage.seed("roles", json!({ "id": 11, "key": "editor" }));
    storage.seed("posts", json!({ "id": 100, "title": "hello", "author_id": 2 }));
    storage.seed_join("users_have_roles", 1, 10);
    storage.seed_join("users_have_roles", 2, 10);
    storage.seed_join("users_have_roles", 2, 11);
    storage
}

fn query(value: serde_json::Value) -> ResourceQuery {
    ResourceQuery::from_value(&value).unwrap()
}

#[tokio::test]
async fn get_all_filters_sorts_and_pages() {
    let service = users_service();
    let mut storage = seeded_storage();

    let document = service
        .get_all(
            &mut storage,
            query(json!({ "sort": "-login", "page": { "number": 1, "size": 10 } })),
            None,
        )
        .await
        .unwrap();

    let PrimaryData::Many(resources) = &document.data else {
        panic!("expected a collection");
    };
    assert_eq!(resources.len(), 2);
    assert_eq!(resources[0].attributes["login"], "bob");
    assert_eq!(resources[1].attributes["login"], "alice");

    let meta = document.meta.unwrap();
    assert_eq!(meta["total"], 2);
    assert_eq!(meta["size"], 10);
}

#[tokio::test]
async fn get_all_with_target_filter() {
    let service = users_service();
    let mut storage = seeded_storage();

    let document = service
        .get_all(
            &mut storage,
            query(json!({ "filter": { "target": { "login": { "eq": "alice" } } } })),
            None,
        )
        .await
        .unwrap();

    let PrimaryData::Many(resources) = &document.data else {
        panic!("expected a collection");
    };
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].id, "2");
}

#[tokio::test]
async fn unknown_filter_field_is_rejected() {
    let service = users_service();
    let mut storage = seeded_storage();

    let err = service
        .get_all(
            &mut storage,
            query(json!({ "filter": { "target": { "nmae": { "eq": "x" } } } })),
            None,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::Validation(_)));
}

#[tokio::test]
async fn get_one_with_include_loads_relations_and_included() {
    let service = users_service();
    let mut storage = seeded_storage();

    let document = service
        .get_one(&mut storage, "2", query(json!({ "include": "roles,manager" })))
        .await
        .unwrap();

    let PrimaryData::One(Some(resource)) = &document.data else {
        panic!("expected a single resource");
    };

    let roles = resource.relationships["roles"].data.as_ref().unwrap();
    let IdentifierData::Many(identifiers) = roles else {
        panic!("expected to-many data");
    };
    assert_eq!(identifiers.len(), 2);

    let manager = resource.relationships["manager"].data.as_ref().unwrap();
    let IdentifierData::One(Some(identifier)) = manager else {
        panic!("expected a to-one identifier");
    };
    assert_eq!(identifier.id, "1");

    // posts was not included: links only.
    assert!(resource.relationships["posts"].data.is_none());

    let included = document.included.unwrap();
    // Two roles plus the manager.
    assert_eq!(included.len(), 3);
}

#[tokio::test]
async fn get_one_missing_is_not_found() {
    let service = users_service();
    let mut storage = seeded_storage();

    let err = service
        .get_one(&mut storage, "999", ResourceQuery::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));
}

#[tokio::test]
async fn create_persists_attributes_and_links_relationships() {
    let service = users_service();
    let mut storage = seeded_storage();

    let (id, document) = service
        .create(
            &mut storage,
            &json!({
                "type": "users",
                "attributes": { "login": "carol" },
                "relationships": {
                    "manager": { "data": { "type": "users", "id": "1" } },
                    "roles": { "data": [{ "type": "roles", "id": "11" }] }
                }
            }),
        )
        .await
        .unwrap();

    let PrimaryData::One(Some(resource)) = &document.data else {
        panic!("expected a single resource");
    };
    assert_eq!(resource.id, id);
    assert_eq!(resource.attributes["login"], "carol");

    let row = storage
        .rows("users")
        .into_iter()
        .find(|r| r.get("login").and_then(|v| v.as_str()) == Some("carol"))
        .unwrap();
    assert_eq!(row.get("manager_id"), Some(&json!(1)));
    assert!(storage
        .joins("users_have_roles")
        .contains(&(id.clone(), "11".to_string())));
}

#[tokio::test]
async fn create_with_unknown_attribute_is_rejected() {
    let service = users_service();
    let mut storage = seeded_storage();

    let err = service
        .create(
            &mut storage,
            &json!({ "type": "users", "attributes": { "nmae": "x" } }),
        )
        .await
        .unwrap_err();

    let ApiError::Validation(objects) = err else {
        panic!("expected a validation error");
    };
    assert_eq!(
        objects[0].source.as_ref().unwrap().pointer,
        "data/attributes/nmae"
    );
}

#[tokio::test]
async fn create_with_wrong_type_is_unprocessable() {
    let service = users_service();
    let mut storage = seeded_storage();

    let err = service
        .create(&mut storage, &json!({ "type": "roles", "attributes": {} }))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Unprocessable(_)));
}

#[tokio::test]
async fn update_merges_attributes() {
    let service = users_service();
    let mut storage = seeded_storage();

    let document = service
        .update(
            &mut storage,
            "1",
            &json!({ "type": "users", "id": "1", "attributes": { "login": "robert" } }),
        )
        .await
        .unwrap();

    let PrimaryData::One(Some(resource)) = &document.data else {
        panic!("expected a single resource");
    };
    assert_eq!(resource.attributes["login"], "robert");
    assert_eq!(resource.attributes["created"], "2024-01-01");
}

#[tokio::test]
async fn update_with_mismatched_id_is_a_conflict() {
    let service = users_service();
    let mut storage = seeded_storage();

    let err = service
        .update(
            &mut storage,
            "1",
            &json!({ "type": "users", "id": "2", "attributes": {} }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)));
}

#[tokio::test]
async fn delete_removes_the_row() {
    let service = users_service();
    let mut storage = seeded_storage();

    service.delete(&mut storage, "1").await.unwrap();
    assert!(!storage
        .rows("users")
        .iter()
        .any(|r| r.get("id") == Some(&json!(1))));

    let err = service.delete(&mut storage, "1").await.unwrap_err();
    assert!(matches!(err, ApiError::NotFound(_)));
}

#[tokio::test]
async fn relationship_roundtrip_set_add_remove() {
    let service = users_service();
    let mut storage = seeded_storage();

    // Replace user 1's roles entirely.
    let document = service
        .set_relationship(
            &mut storage,
            "1",
            "roles",
            &json!([{ "type": "roles", "id": "11" }]),
        )
        .await
        .unwrap();
    let IdentifierData::Many(identifiers) = &document.data else {
        panic!("expected to-many data");
    };
    assert_eq!(identifiers.len(), 1);
    assert_eq!(identifiers[0].id, "11");

    // Add one back.
    let document = service
        .add_to_relationship(
            &mut storage,
            "1",
            "roles",
            &json!([{ "type": "roles", "id": "10" }]),
        )
        .await
        .unwrap();
    let IdentifierData::Many(identifiers) = &document.data else {
        panic!("expected to-many data");
    };
    assert_eq!(identifiers.len(), 2);

    // Remove it again.
    let document = service
        .remove_from_relationship(
            &mut storage,
            "1",
            "roles",
            &json!([{ "type": "roles", "id": "10" }]),
        )
        .await
        .unwrap();
    let IdentifierData::Many(identifiers) = &document.data else {
        panic!("expected to-many data");
    };
    assert_eq!(identifiers.len(), 1);
}

#[tokio::test]
async fn set_to_one_relationship_and_clear() {
    let service = users_service();
    let mut storage = seeded_storage();

    let document = service
        .set_relationship(
            &mut storage,
            "1",
            "manager",
            &json!({ "type": "users", "id": "2" }),
        )
        .await
        .unwrap();
    assert!(matches!(document.data, IdentifierData::One(Some(_))));

    let document = service
        .set_relationship(&mut storage, "1", "manager", &json!(null))
        .await
        .unwrap();
    assert!(matches!(document.data, IdentifierData::One(None)));
}

#[tokio::test]
async fn add_to_to_one_relationship_is_not_supported() {
    let service = users_service();
    let err = service
        .supports(ResourceOperation::AddToRelationship, Some("manager"))
        .unwrap_err();
    assert!(matches!(err, ApiError::MethodNotAllowed(_)));

    assert!(service
        .supports(ResourceOperation::AddToRelationship, Some("roles"))
        .is_ok());
}

#[tokio::test]
async fn get_relationship_without_include_shows_links_and_data() {
    let service = users_service();
    let mut storage = seeded_storage();

    let document = service
        .get_relationship(&mut storage, "2", "roles")
        .await
        .unwrap();
    let IdentifierData::Many(identifiers) = &document.data else {
        panic!("expected to-many data");
    };
    assert_eq!(identifiers.len(), 2);
    assert_eq!(document.links.self_link, "/api/users/2/relationships/roles");
}
