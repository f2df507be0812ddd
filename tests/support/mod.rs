//! Shared fixtures: a gate wired to in-memory stores, an in-process
//! backend SSH server standing in for an allocated resource, and a small
//! russh client driving the proxy like an end user would.

#![allow(dead_code)]

pub mod backend;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use russh::keys::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect, client};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use aquarium_gate::gate::{GateDriver, SshGate};
use aquarium_gate::model::{AccessGrant, Application, Resource, ResourceAuthentication};
use aquarium_gate::rpc::{Caller, GetResourceAccessRequest};
use aquarium_gate::store::MemoryStore;

/// A prepared gate listening on an ephemeral port.
pub struct GateFixture {
    pub gate: SshGate,
    pub store: Arc<MemoryStore>,
    pub addr: SocketAddr,
    _workdir: tempfile::TempDir,
}

pub async fn start_gate() -> GateFixture {
    let store = Arc::new(MemoryStore::new());
    let mut gate = SshGate::new(store.clone(), store.clone());
    let workdir = tempfile::tempdir().expect("tempdir");
    gate.prepare(
        workdir.path(),
        "bind_address = \"127.0.0.1:0\"\nnode_address = \"127.0.0.1:8001\"\n",
    )
    .await
    .expect("gate prepare");
    let addr = gate.bound_addr().expect("gate bound");

    GateFixture {
        gate,
        store,
        addr,
        _workdir: workdir,
    }
}

impl GateFixture {
    /// Issue credentials the way an RPC caller would.
    pub async fn issue(&self, owner: &str, resource_uid: Uuid, is_static: bool) -> AccessGrant {
        self.gate
            .access_service()
            .get_resource_access(
                &Caller::new(owner),
                &GetResourceAccessRequest {
                    application_resource_uid: resource_uid.to_string(),
                    is_static,
                },
            )
            .await
            .expect("issue access")
    }
}

/// Register an application + resource pair owned by `owner`; returns the
/// resource uid.
pub fn provision_resource(
    store: &MemoryStore,
    owner: &str,
    authentication: ResourceAuthentication,
) -> Uuid {
    let application = Application {
        uid: Uuid::new_v4(),
        owner_name: owner.to_string(),
    };
    let resource = Resource {
        uid: Uuid::new_v4(),
        application_uid: application.uid,
        authentication: Some(authentication),
    };
    let uid = resource.uid;
    store.put_application(application);
    store.put_resource(resource);
    uid
}

pub fn password_auth(addr: SocketAddr, username: &str, password: &str) -> ResourceAuthentication {
    ResourceAuthentication {
        ip_addr: addr.ip().to_string(),
        port: addr.port(),
        username: username.to_string(),
        password: Some(password.to_string()),
        key: None,
    }
}

pub fn key_auth(addr: SocketAddr, username: &str, key_pem: &str) -> ResourceAuthentication {
    ResourceAuthentication {
        ip_addr: addr.ip().to_string(),
        port: addr.port(),
        username: username.to_string(),
        password: None,
        key: Some(key_pem.to_string()),
    }
}

/// Output of a remote command run through the proxy.
#[derive(Debug)]
pub struct ExecOutput {
    pub exit_code: Option<u32>,
    pub stdout: String,
}

struct AcceptAll;

impl client::Handler for AcceptAll {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// End-user SSH client connected through the gate.
pub struct TestClient {
    handle: client::Handle<AcceptAll>,
}

impl TestClient {
    /// Connect with password auth. `Ok(None)` means the gate rejected the
    /// credentials.
    pub async fn connect_password(
        addr: SocketAddr,
        user: &str,
        password: &str,
    ) -> Result<Option<Self>> {
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, addr, AcceptAll).await?;
        let result = handle.authenticate_password(user, password).await?;
        if result.success() {
            Ok(Some(Self { handle }))
        } else {
            Ok(None)
        }
    }

    /// Connect with the private key from an issued grant.
    pub async fn connect_key(addr: SocketAddr, user: &str, key_pem: &str) -> Result<Option<Self>> {
        let key = russh::keys::decode_secret_key(key_pem, None)?;
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, addr, AcceptAll).await?;
        let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
        let result = handle
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
            .await?;
        if result.success() {
            Ok(Some(Self { handle }))
        } else {
            Ok(None)
        }
    }

    /// Run a command over a fresh session channel and collect its output.
    pub async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut exit_code = None;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
                Some(ChannelMsg::Close) => break,
                Some(_) => {}
                None => break,
            }
        }

        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
        })
    }

    /// Open a direct-tcpip tunnel through the proxy, send one request and
    /// read until the far end closes.
    pub async fn request_via_tunnel(&self, host: &str, port: u32, request: &[u8]) -> Result<String> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port, "127.0.0.1", 0)
            .await?;
        let mut stream = channel.into_stream();
        stream.write_all(request).await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok(String::from_utf8_lossy(&response).to_string())
    }

    pub async fn disconnect(self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}
