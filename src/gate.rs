//! Gate driver surface.
//!
//! The fleet daemon treats every proxy kind (this SSH gate, the SOCKS5
//! sibling) as a pluggable driver behind the same small interface: a
//! name, a prepare step that brings the listener up, and a shutdown.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::GateConfig;
use crate::registry::SessionRegistry;
use crate::rpc::AccessService;
use crate::ssh::{self, ServerState};
use crate::store::{CredentialStore, ResourceStore};

/// Capability interface every gate kind implements.
#[async_trait]
pub trait GateDriver: Send + Sync {
    /// Stable name of the gate kind (e.g. "proxyssh").
    fn name(&self) -> &str;

    /// Parse the gate's config section and bring the listener up. A
    /// failure here is fatal to this gate's initialization; the host
    /// process decides whether that is fatal overall.
    async fn prepare(&mut self, workdir: &Path, config: &str) -> Result<()>;

    /// Stop accepting new connections. In-flight sessions run until a
    /// transport closes, per the no-timeout session model.
    async fn shutdown(&mut self) -> Result<()>;
}

/// The SSH-flavored gate: credential issuance plus the reverse proxy.
pub struct SshGate {
    name: String,
    cfg: GateConfig,
    credentials: Arc<dyn CredentialStore>,
    resources: Arc<dyn ResourceStore>,
    registry: Arc<SessionRegistry>,
    bound_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

impl SshGate {
    pub fn new(credentials: Arc<dyn CredentialStore>, resources: Arc<dyn ResourceStore>) -> Self {
        Self {
            name: "proxyssh".to_string(),
            cfg: GateConfig::default(),
            credentials,
            resources,
            registry: Arc::new(SessionRegistry::new()),
            bound_addr: None,
            accept_task: None,
        }
    }

    /// Concrete listen address once prepared; the configured port may
    /// have been 0.
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.bound_addr
    }

    pub fn config(&self) -> &GateConfig {
        &self.cfg
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Credential issuer wired to this gate's stores and its concrete
    /// bound address.
    pub fn access_service(&self) -> AccessService {
        AccessService::new(
            self.name.clone(),
            self.cfg.node_address.clone(),
            self.cfg.bind_address.clone(),
            self.credentials.clone(),
            self.resources.clone(),
        )
    }
}

#[async_trait]
impl GateDriver for SshGate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&mut self, workdir: &Path, config: &str) -> Result<()> {
        self.cfg = GateConfig::apply(config)?;
        let key_path = self.cfg.key_path(workdir);

        let state = Arc::new(ServerState {
            gate_name: self.name.clone(),
            registry: self.registry.clone(),
            credentials: self.credentials.clone(),
            resources: self.resources.clone(),
        });

        let (addr, task) = ssh::start_server(state, &self.cfg, &key_path)
            .await
            .with_context(|| format!("unable to init {} gate", self.name))?;

        // Keep the concrete address so the issuer advertises a real port.
        self.cfg.bind_address = addr.to_string();
        self.bound_addr = Some(addr);
        self.accept_task = Some(task);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.bound_addr = None;
        info!(gate = %self.name, "gate stopped accepting connections");
        Ok(())
    }
}
