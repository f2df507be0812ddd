//! Collaborator interfaces consumed by the gate, plus the in-memory
//! implementation used on a single node and in tests.
//!
//! The credential store guarantees atomic consume-on-read for one-time
//! credentials: a matched record is removed from the consultable set in
//! the same step that returns it, so a concurrent second attempt with the
//! same secret observes a miss.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{AccessCredential, Application, Resource};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("username can't be empty")]
    EmptyUsername,

    #[error("credential must carry a password hash or a public key")]
    EmptySecret,

    #[error("application resource UID can't be nil")]
    NilResourceUid,
}

/// Persistence of issued access credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Persist a new credential, immediately visible to the authenticator.
    async fn create(&self, credential: AccessCredential) -> Result<(), StoreError>;

    /// Find a credential by `(username, password_hash)`. One-time records
    /// are atomically retrieved-and-invalidated; static records are
    /// matched non-destructively and stay available.
    async fn consume_once_password(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Option<AccessCredential>;

    /// Same as [`Self::consume_once_password`], matching on the
    /// authorized-keys entry of the presented public key.
    async fn consume_once_key(&self, username: &str, public_key: &str) -> Option<AccessCredential>;

    /// Non-destructive existence check used while the client is still
    /// offering keys, before it has proven possession of the private key.
    async fn contains_key(&self, username: &str, public_key: &str) -> bool;

    /// Drop every credential backing the given resource. Called when the
    /// resource is deallocated; this is what ends the life of static
    /// credentials. Returns the number of records removed.
    async fn remove_for_resource(&self, resource_uid: Uuid) -> usize;
}

/// Read-only view of the fleet scheduler's state.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn resource(&self, uid: Uuid) -> Option<Resource>;
    async fn application(&self, uid: Uuid) -> Option<Application>;
}

/// In-memory store backing both collaborator interfaces.
#[derive(Debug, Default)]
pub struct MemoryStore {
    credentials: DashMap<Uuid, AccessCredential>,
    resources: DashMap<Uuid, Resource>,
    applications: DashMap<Uuid, Application>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an allocated resource. Done by the scheduler side, not by
    /// the gate itself.
    pub fn put_resource(&self, resource: Resource) {
        self.resources.insert(resource.uid, resource);
    }

    pub fn put_application(&self, application: Application) {
        self.applications.insert(application.uid, application);
    }

    pub fn credential_count(&self) -> usize {
        self.credentials.len()
    }

    /// Find the uid of a matching credential and whether it is static.
    /// The shard guard is dropped before the caller mutates the map.
    fn find_credential<F>(&self, matches: F) -> Option<(Uuid, bool)>
    where
        F: Fn(&AccessCredential) -> bool,
    {
        self.credentials.iter().find_map(|entry| {
            let c = entry.value();
            matches(c).then(|| (c.uid, c.is_static))
        })
    }

    fn consume_once<F>(&self, matches: F) -> Option<AccessCredential>
    where
        F: Fn(&AccessCredential) -> bool,
    {
        let (uid, is_static) = self.find_credential(&matches)?;
        if is_static {
            return self.credentials.get(&uid).map(|e| e.value().clone());
        }
        // remove_if re-checks the match under the shard lock, so two
        // concurrent attempts with the same secret cannot both win.
        self.credentials
            .remove_if(&uid, |_, c| matches(c))
            .map(|(_, c)| c)
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn create(&self, credential: AccessCredential) -> Result<(), StoreError> {
        if credential.application_resource_uid.is_nil() {
            return Err(StoreError::NilResourceUid);
        }
        if credential.username.is_empty() {
            return Err(StoreError::EmptyUsername);
        }
        if credential.password_hash.is_empty() && credential.public_key.is_empty() {
            return Err(StoreError::EmptySecret);
        }

        self.credentials.insert(credential.uid, credential);
        Ok(())
    }

    async fn consume_once_password(
        &self,
        username: &str,
        password_hash: &str,
    ) -> Option<AccessCredential> {
        if password_hash.is_empty() {
            return None;
        }
        self.consume_once(|c| c.username == username && c.password_hash == password_hash)
    }

    async fn consume_once_key(&self, username: &str, public_key: &str) -> Option<AccessCredential> {
        if public_key.is_empty() {
            return None;
        }
        self.consume_once(|c| c.username == username && c.public_key == public_key)
    }

    async fn contains_key(&self, username: &str, public_key: &str) -> bool {
        !public_key.is_empty()
            && self
                .find_credential(|c| c.username == username && c.public_key == public_key)
                .is_some()
    }

    async fn remove_for_resource(&self, resource_uid: Uuid) -> usize {
        let uids: Vec<Uuid> = self
            .credentials
            .iter()
            .filter(|e| e.value().application_resource_uid == resource_uid)
            .map(|e| *e.key())
            .collect();

        uids.iter()
            .filter(|uid| self.credentials.remove(uid).is_some())
            .count()
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn resource(&self, uid: Uuid) -> Option<Resource> {
        self.resources.get(&uid).map(|e| e.value().clone())
    }

    async fn application(&self, uid: Uuid) -> Option<Application> {
        self.applications.get(&uid).map(|e| e.value().clone())
    }
}
