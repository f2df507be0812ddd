//! Credential issuance tests against the RPC service surface.

mod support;

use std::sync::Arc;

use aquarium_gate::crypt;
use aquarium_gate::rpc::{
    AccessError, AccessService, Caller, ErrorCode, GetResourceAccessRequest,
    GetResourceAccessResponse, Permission,
};
use aquarium_gate::store::{CredentialStore, MemoryStore};
use uuid::Uuid;

use support::{password_auth, provision_resource};

fn service(store: &Arc<MemoryStore>) -> AccessService {
    AccessService::new(
        "proxyssh",
        "fish.example.com:8001",
        "0.0.0.0:1022",
        store.clone(),
        store.clone(),
    )
}

fn request(uid: &str, is_static: bool) -> GetResourceAccessRequest {
    GetResourceAccessRequest {
        application_resource_uid: uid.to_string(),
        is_static,
    }
}

fn dummy_auth() -> aquarium_gate::model::ResourceAuthentication {
    password_auth("127.0.0.1:22".parse().unwrap(), "testuser", "testpass")
}

#[tokio::test]
async fn rejects_missing_and_malformed_uid() {
    let store = Arc::new(MemoryStore::new());
    let svc = service(&store);
    let caller = Caller::new("user1");

    let err = svc
        .get_resource_access(&caller, &request("", false))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    let err = svc
        .get_resource_access(&caller, &request("not-a-uuid", false))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
}

#[tokio::test]
async fn rejects_unknown_resource() {
    let store = Arc::new(MemoryStore::new());
    let svc = service(&store);

    let err = svc
        .get_resource_access(&Caller::new("user1"), &request(&Uuid::new_v4().to_string(), false))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn rejects_non_owner_without_blanket_permission() {
    let store = Arc::new(MemoryStore::new());
    let resource = provision_resource(&store, "owner", dummy_auth());
    let svc = service(&store);

    let err = svc
        .get_resource_access(&Caller::new("intruder"), &request(&resource.to_string(), false))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PermissionDenied);
    assert_eq!(store.credential_count(), 0);
}

#[tokio::test]
async fn blanket_permission_allows_foreign_resource() {
    let store = Arc::new(MemoryStore::new());
    let resource = provision_resource(&store, "owner", dummy_auth());
    let svc = service(&store);

    let caller = Caller::new("operator").with_permission(Permission::GetResourceAccessAll);
    let grant = svc
        .get_resource_access(&caller, &request(&resource.to_string(), false))
        .await
        .expect("blanket permission grants access");
    assert_eq!(grant.username, "operator");
}

#[tokio::test]
async fn issued_password_matches_stored_hash_and_resource() {
    let store = Arc::new(MemoryStore::new());
    let resource = provision_resource(&store, "user1", dummy_auth());
    let svc = service(&store);

    let grant = svc
        .get_resource_access(&Caller::new("user1"), &request(&resource.to_string(), false))
        .await
        .expect("owner can request access");

    assert_eq!(grant.password.len(), 64);
    assert_eq!(grant.address, "fish.example.com:1022");
    assert_eq!(grant.application_resource_uid, resource);

    // Visible to the authenticator immediately, and bound to the right
    // resource: the hash of the plaintext matches the stored record.
    let hash = crypt::password_hash(&grant.password).unwrap();
    let accessor = store
        .consume_once_password(&grant.username, &hash)
        .await
        .expect("stored record matches the returned plaintext");
    assert_eq!(accessor.application_resource_uid, resource);
}

#[tokio::test]
async fn issued_key_is_usable_and_stored_in_public_form() {
    let store = Arc::new(MemoryStore::new());
    let resource = provision_resource(&store, "user1", dummy_auth());
    let svc = service(&store);

    let grant = svc
        .get_resource_access(&Caller::new("user1"), &request(&resource.to_string(), false))
        .await
        .unwrap();

    let private = russh::keys::decode_secret_key(&grant.key, None)
        .expect("returned private key parses");
    let entry = crypt::authorized_key_entry(private.public_key());

    let accessor = store
        .consume_once_key(&grant.username, &entry)
        .await
        .expect("stored public key matches the returned private key");
    assert_eq!(accessor.application_resource_uid, resource);
}

#[tokio::test]
async fn grants_are_isolated_per_resource() {
    let store = Arc::new(MemoryStore::new());
    let resource_a = provision_resource(&store, "user1", dummy_auth());
    let resource_b = provision_resource(&store, "user1", dummy_auth());
    let svc = service(&store);

    let grant_a = svc
        .get_resource_access(&Caller::new("user1"), &request(&resource_a.to_string(), false))
        .await
        .unwrap();
    let grant_b = svc
        .get_resource_access(&Caller::new("user1"), &request(&resource_b.to_string(), false))
        .await
        .unwrap();

    let hash_a = crypt::password_hash(&grant_a.password).unwrap();
    let accessor = store
        .consume_once_password("user1", &hash_a)
        .await
        .unwrap();
    assert_eq!(accessor.application_resource_uid, resource_a);

    let hash_b = crypt::password_hash(&grant_b.password).unwrap();
    let accessor = store
        .consume_once_password("user1", &hash_b)
        .await
        .unwrap();
    assert_eq!(accessor.application_resource_uid, resource_b);
}

#[tokio::test]
async fn static_flag_issues_reusable_credential() {
    let store = Arc::new(MemoryStore::new());
    let resource = provision_resource(&store, "user1", dummy_auth());
    let svc = service(&store);

    let grant = svc
        .get_resource_access(&Caller::new("user1"), &request(&resource.to_string(), true))
        .await
        .unwrap();
    assert!(grant.is_static);

    let hash = crypt::password_hash(&grant.password).unwrap();
    for _ in 0..3 {
        assert!(store.consume_once_password("user1", &hash).await.is_some());
    }
}

#[tokio::test]
async fn address_falls_back_to_sentinels() {
    let store = Arc::new(MemoryStore::new());
    let resource = provision_resource(&store, "user1", dummy_auth());
    let svc = AccessService::new("proxyssh", "nonsense", "nonsense", store.clone(), store.clone());

    let grant = svc
        .get_resource_access(&Caller::new("user1"), &request(&resource.to_string(), false))
        .await
        .expect("unparsable addresses must not fail the call");
    assert_eq!(grant.address, "999.999.999.999:1222");
}

#[tokio::test]
async fn response_mapping_carries_status_and_data() {
    let store = Arc::new(MemoryStore::new());
    let resource = provision_resource(&store, "user1", dummy_auth());
    let svc = service(&store);

    let ok = svc
        .get_resource_access(&Caller::new("user1"), &request(&resource.to_string(), false))
        .await;
    let response = GetResourceAccessResponse::from_result(&ok);
    assert!(response.status);
    assert!(response.data.is_some());

    let err: Result<_, _> = Err(AccessError::PermissionDenied);
    let response = GetResourceAccessResponse::from_result(&err);
    assert!(!response.status);
    assert!(response.data.is_none());
    assert_eq!(response.message, "Permission denied");
}
