//! Credential issuance service, the RPC-facing side of the gate.
//!
//! The transport and its auth interceptor live outside this crate; by the
//! time `get_resource_access` runs the caller identity has already been
//! established and arrives as a [`Caller`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::crypt;
use crate::model::{AccessCredential, AccessGrant};
use crate::store::{CredentialStore, ResourceStore};

/// Password length for issued one-time credentials.
const ACCESS_PASSWORD_LEN: usize = 64;

/// Fallbacks used when the configured addresses cannot be parsed. The
/// credential is still issued; the caller just has to know the address
/// some other way.
const FALLBACK_HOST: &str = "999.999.999.999";
const FALLBACK_PORT: &str = "1222";

/// Permissions relevant to this gate, granted by the external RBAC layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    /// Allows requesting access to any resource, not only owned ones.
    GetResourceAccessAll,
}

/// Identity of the RPC caller as established by the transport's auth
/// interceptor.
#[derive(Debug, Clone)]
pub struct Caller {
    pub username: String,
    permissions: HashSet<Permission>,
}

impl Caller {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            permissions: HashSet::new(),
        }
    }

    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.insert(permission);
        self
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Error codes crossing the RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    PermissionDenied,
    Internal,
}

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("{0}")]
    Internal(String),
}

impl AccessError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::PermissionDenied => ErrorCode::PermissionDenied,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetResourceAccessRequest {
    pub application_resource_uid: String,

    #[serde(rename = "static", default)]
    pub is_static: bool,
}

#[derive(Debug, Serialize)]
pub struct GetResourceAccessResponse {
    pub status: bool,
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<AccessGrant>,
}

impl GetResourceAccessResponse {
    /// Map a service result onto the wire response shape.
    pub fn from_result(result: &Result<AccessGrant, AccessError>) -> Self {
        match result {
            Ok(grant) => Self {
                status: true,
                message: "Access credentials created successfully".to_string(),
                data: Some(grant.clone()),
            },
            Err(err) => Self {
                status: false,
                message: err.to_string(),
                data: None,
            },
        }
    }
}

/// The credential issuer of one gate instance.
pub struct AccessService {
    gate_name: String,
    node_address: String,
    bind_address: String,
    credentials: Arc<dyn CredentialStore>,
    resources: Arc<dyn ResourceStore>,
}

impl AccessService {
    pub fn new(
        gate_name: impl Into<String>,
        node_address: impl Into<String>,
        bind_address: impl Into<String>,
        credentials: Arc<dyn CredentialStore>,
        resources: Arc<dyn ResourceStore>,
    ) -> Self {
        Self {
            gate_name: gate_name.into(),
            node_address: node_address.into(),
            bind_address: bind_address.into(),
            credentials,
            resources,
        }
    }

    /// Mint one-time (or static) credentials for a resource the caller is
    /// allowed to reach, persist the hashed record and return the
    /// plaintext view exactly once.
    pub async fn get_resource_access(
        &self,
        caller: &Caller,
        request: &GetResourceAccessRequest,
    ) -> Result<AccessGrant, AccessError> {
        if request.application_resource_uid.is_empty() {
            return Err(AccessError::InvalidArgument(
                "Application resource UID is required".to_string(),
            ));
        }
        let resource_uid = Uuid::parse_str(&request.application_resource_uid).map_err(|_| {
            AccessError::InvalidArgument("Invalid application resource UID format".to_string())
        })?;

        let resource = self.resources.resource(resource_uid).await.ok_or_else(|| {
            warn!(gate = %self.gate_name, resource = %resource_uid, "application resource not found");
            AccessError::NotFound("Application resource not found".to_string())
        })?;

        let application = self
            .resources
            .application(resource.application_uid)
            .await
            .ok_or_else(|| {
                warn!(gate = %self.gate_name, application = %resource.application_uid, "application not found");
                AccessError::NotFound("Application not found".to_string())
            })?;

        if caller.username != application.owner_name
            && !caller.has_permission(Permission::GetResourceAccessAll)
        {
            warn!(
                gate = %self.gate_name,
                user = %caller.username,
                application = %application.uid,
                "permission denied",
            );
            return Err(AccessError::PermissionDenied);
        }

        let password = crypt::rand_string(ACCESS_PASSWORD_LEN);
        let password_hash = crypt::password_hash(&password).map_err(|e| {
            warn!(gate = %self.gate_name, error = %e, "unable to hash access password");
            AccessError::Internal("Failed to create access credentials".to_string())
        })?;
        let keypair = crypt::generate_access_keypair().map_err(|e| {
            warn!(gate = %self.gate_name, error = %e, "unable to create SSH key");
            AccessError::Internal("Unable to create SSH key".to_string())
        })?;

        let credential = AccessCredential {
            uid: Uuid::new_v4(),
            application_resource_uid: resource_uid,
            address: advertised_address(&self.gate_name, &self.node_address, &self.bind_address),
            username: caller.username.clone(),
            password_hash,
            public_key: keypair.public_entry,
            is_static: request.is_static,
            created_at: Utc::now(),
        };

        self.credentials
            .create(credential.clone())
            .await
            .map_err(|e| {
                warn!(gate = %self.gate_name, error = %e, "unable to create access entry");
                AccessError::Internal("Failed to create access credentials".to_string())
            })?;

        info!(
            gate = %self.gate_name,
            user = %caller.username,
            resource = %resource_uid,
            is_static = request.is_static,
            "created access entry for user to resource",
        );

        Ok(AccessGrant {
            uid: credential.uid,
            created_at: credential.created_at,
            application_resource_uid: resource_uid,
            address: credential.address,
            username: credential.username,
            password,
            key: keypair.private_pem,
            is_static: request.is_static,
        })
    }
}

/// Build the `host:port` the caller should connect to: host from the
/// node's external address, port from the proxy's own bind address.
/// Unparsable values fall back to documented sentinels instead of failing
/// the call; the credential still works for anyone who knows the real
/// address.
fn advertised_address(gate_name: &str, node_address: &str, bind_address: &str) -> String {
    let host = match node_address.rsplit_once(':') {
        Some((host, _)) if !host.is_empty() => host,
        _ => {
            warn!(
                gate = %gate_name,
                node_address,
                "unable to parse node address host:port, using default host {FALLBACK_HOST}",
            );
            FALLBACK_HOST
        }
    };
    let port = match bind_address.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => port,
        _ => {
            warn!(
                gate = %gate_name,
                bind_address,
                "unable to parse bind address host:port, using default port {FALLBACK_PORT}",
            );
            FALLBACK_PORT
        }
    };
    format!("{host}:{port}")
}
