//! Core data types shared between the credential issuer, the stores and
//! the SSH proxy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A credential issued for one allocated resource, as persisted by the
/// credential store.
///
/// Only the password *hash* and the *public* key are ever stored; the
/// matching plaintext lives in the [`AccessGrant`] handed to the caller
/// exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessCredential {
    /// Unique id of this credential record.
    pub uid: Uuid,

    /// The allocated resource this credential grants access to.
    pub application_resource_uid: Uuid,

    /// Proxy endpoint advertised to the caller (`host:port`).
    pub address: String,

    /// Username the end user authenticates with.
    pub username: String,

    /// Lowercase hex of the Argon2id hash of the one-time password.
    pub password_hash: String,

    /// Public key in authorized-keys format (`algo base64`).
    pub public_key: String,

    /// Static credentials stay valid until the resource is deallocated;
    /// non-static ones are consumed on first successful use.
    #[serde(rename = "static")]
    pub is_static: bool,

    /// When the credential was issued.
    pub created_at: DateTime<Utc>,
}

/// One-time view of an issued credential, returned to the caller of
/// `GetResourceAccess` and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessGrant {
    pub uid: Uuid,
    pub created_at: DateTime<Utc>,
    pub application_resource_uid: Uuid,

    /// Where to connect (`host:port` of this proxy).
    pub address: String,
    pub username: String,

    /// Plaintext one-time password.
    pub password: String,

    /// Private key, OpenSSH PEM.
    pub key: String,

    #[serde(rename = "static")]
    pub is_static: bool,
}

/// How the proxy authenticates against the real resource. Written by the
/// allocator when the resource comes up; the proxy only ever reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAuthentication {
    pub ip_addr: String,
    pub port: u16,
    pub username: String,

    /// Password auth toward the resource, if set.
    #[serde(default)]
    pub password: Option<String>,

    /// Private key (PEM/OpenSSH) auth toward the resource, if set.
    #[serde(default)]
    pub key: Option<String>,
}

impl ResourceAuthentication {
    /// A record is usable when it names a user and carries at least one
    /// secret. The bridge refuses to dial otherwise.
    pub fn is_usable(&self) -> bool {
        !self.username.is_empty()
            && (self.password.as_deref().is_some_and(|p| !p.is_empty())
                || self.key.as_deref().is_some_and(|k| !k.is_empty()))
    }
}

/// Projection of an allocated resource, as seen by this gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub uid: Uuid,
    pub application_uid: Uuid,

    #[serde(default)]
    pub authentication: Option<ResourceAuthentication>,
}

/// Projection of the application owning a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub uid: Uuid,
    pub owner_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(username: &str, password: Option<&str>, key: Option<&str>) -> ResourceAuthentication {
        ResourceAuthentication {
            ip_addr: "10.0.0.1".to_string(),
            port: 22,
            username: username.to_string(),
            password: password.map(str::to_string),
            key: key.map(str::to_string),
        }
    }

    #[test]
    fn authentication_requires_user_and_secret() {
        assert!(auth("admin", Some("secret"), None).is_usable());
        assert!(auth("admin", None, Some("-----BEGIN...")).is_usable());
        assert!(!auth("admin", None, None).is_usable());
        assert!(!auth("", Some("secret"), None).is_usable());
        assert!(!auth("admin", Some(""), Some("")).is_usable());
    }
}
