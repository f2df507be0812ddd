//! SSH proxy server built on russh.
//!
//! Handles:
//! - Password and public-key authentication against issued access credentials
//! - Session channels (shell, exec, PTY, subsystems), relayed to the backend
//! - Port forwarding (direct-tcpip, tcpip-forward) in both directions

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Disconnect, MethodKind, MethodSet, Sig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bridge::{self, BackendHandler};
use crate::config::GateConfig;
use crate::crypt;
use crate::model::AccessCredential;
use crate::registry::{PendingSession, SessionRegistry};
use crate::relay::{self, ChannelOp, CloseOnce};
use crate::store::{CredentialStore, ResourceStore};

/// Version string the proxy advertises during the SSH handshake.
pub const SERVER_ID: &str = "SSH-2.0-AquariumFishProxy";

/// Shared state for the SSH proxy server.
pub struct ServerState {
    pub gate_name: String,
    pub registry: Arc<SessionRegistry>,
    pub credentials: Arc<dyn CredentialStore>,
    pub resources: Arc<dyn ResourceStore>,
}

/// Backend leg of one connection. The mutex serializes requests that need
/// exclusive access to the handle (auth, global requests) with channel
/// opens.
type Backend = Arc<Mutex<russh::client::Handle<BackendHandler>>>;

/// Connection-scoped state shared between the handler, the relay tasks
/// and the dispatch task that drains them once the transport ends.
#[derive(Default)]
struct ConnState {
    backend: Mutex<Option<Backend>>,

    /// Completion barrier: every relay task of this session is spawned
    /// here and the dispatch task joins them all before returning.
    tasks: Arc<Mutex<JoinSet<()>>>,
}

/// Per-channel relay plumbing kept by the handler.
struct SessionChannel {
    ops: mpsc::UnboundedSender<ChannelOp>,
    close_once: Arc<CloseOnce>,
}

/// Per-connection handler state.
pub struct ConnectionHandler {
    server: Arc<ServerState>,
    peer_addr: SocketAddr,

    /// Proxy-assigned session identifier, the pending-session key.
    session_uid: Uuid,

    conn: Arc<ConnState>,
    channels: HashMap<ChannelId, SessionChannel>,
}

impl ConnectionHandler {
    fn new(server: Arc<ServerState>, peer_addr: SocketAddr, session_uid: Uuid, conn: Arc<ConnState>) -> Self {
        Self {
            server,
            peer_addr,
            session_uid,
            conn,
            channels: HashMap::new(),
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    async fn backend(&self) -> Option<Backend> {
        self.conn.backend.lock().await.clone()
    }

    /// Hand the matched credential over to the session bridge. The slot
    /// being occupied means two handshakes share a session id, which
    /// cannot legitimately happen; keep the first and make noise.
    fn register_pending(&self, accessor: AccessCredential) {
        let registered = self.server.registry.register(PendingSession {
            session_uid: self.session_uid,
            source_addr: self.peer_addr,
            accessor,
        });
        if !registered {
            warn!(
                gate = %self.server.gate_name,
                peer = %self.peer_addr,
                session = %self.session_uid,
                "pending session slot already occupied, keeping the first registration",
            );
        }
    }

    /// Queue a channel operation toward its relay pump. The queue is
    /// unbounded so the session event loop never blocks here; the
    /// client's flow-control window bounds the backlog.
    fn forward_op(&self, channel: ChannelId, op: ChannelOp) {
        if let Some(chan) = self.channels.get(&channel) {
            if chan.ops.send(op).is_err() {
                debug!(
                    gate = %self.server.gate_name,
                    peer = %self.peer_addr,
                    channel = ?channel,
                    "relay already finished, dropping channel operation",
                );
            }
        }
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        debug!(gate = %self.server.gate_name, peer = %self.peer_addr, user, "auth none attempt");
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(
                &[MethodKind::Password, MethodKind::PublicKey][..],
            )),
            partial_success: false,
        })
    }

    /// Password callback: hash the presented password the same way the
    /// issuer did and look it up. One-time records are consumed by the
    /// lookup itself, so a concurrent second attempt loses the race and
    /// fails. Every failure mode looks identical to the client.
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        debug!(gate = %self.server.gate_name, peer = %self.peer_addr, user, "login attempt");

        let hash = match crypt::password_hash(password) {
            Ok(hash) => hash,
            Err(e) => {
                error!(gate = %self.server.gate_name, peer = %self.peer_addr, error = %e, "unable to hash presented password");
                return Ok(Self::reject());
            }
        };

        match self.server.credentials.consume_once_password(user, &hash).await {
            Some(ra) if ra.username == user && ra.password_hash == hash => {
                self.register_pending(ra);
                Ok(Auth::Accept)
            }
            _ => {
                warn!(gate = %self.server.gate_name, peer = %self.peer_addr, user, "invalid access");
                Ok(Self::reject())
            }
        }
    }

    /// Key-offer phase: the client has not proven possession yet, so the
    /// lookup must not consume anything. Let the client try its other
    /// keys (or fall back to password) on a miss.
    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let entry = crypt::authorized_key_entry(public_key);
        if self.server.credentials.contains_key(user, &entry).await {
            return Ok(Auth::Accept);
        }

        debug!(gate = %self.server.gate_name, peer = %self.peer_addr, user, "offered key not known, allowing other methods");
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(
                &[MethodKind::PublicKey, MethodKind::Password][..],
            )),
            partial_success: false,
        })
    }

    /// Signature-verified public key auth; this is where one-time key
    /// credentials get consumed.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!(gate = %self.server.gate_name, peer = %self.peer_addr, user, "login attempt");

        let entry = crypt::authorized_key_entry(public_key);
        match self.server.credentials.consume_once_key(user, &entry).await {
            Some(ra) if ra.username == user && ra.public_key == entry => {
                self.register_pending(ra);
                Ok(Auth::Accept)
            }
            _ => {
                warn!(gate = %self.server.gate_name, peer = %self.peer_addr, user, "invalid access");
                Ok(Self::reject())
            }
        }
    }

    /// Session bridge: claim the pending session registered during auth,
    /// resolve the destination resource and dial it. Failing any step
    /// here closes the connection; details stay in the proxy log.
    async fn auth_succeeded(&mut self, session: &mut Session) -> Result<(), Self::Error> {
        let pending = self.server.registry.claim(self.session_uid).ok_or_else(|| {
            error!(
                gate = %self.server.gate_name,
                peer = %self.peer_addr,
                session = %self.session_uid,
                "no pending session registered for authenticated connection",
            );
            anyhow!("unable to load session record")
        })?;

        let accessor = pending.accessor;
        let resource = self
            .server
            .resources
            .resource(accessor.application_resource_uid)
            .await
            .ok_or_else(|| {
                error!(
                    gate = %self.server.gate_name,
                    peer = %self.peer_addr,
                    resource = %accessor.application_resource_uid,
                    "unable to retrieve resource",
                );
                anyhow!("unable to retrieve resource")
            })?;

        let auth = resource
            .authentication
            .filter(|a| a.is_usable())
            .ok_or_else(|| {
                error!(
                    gate = %self.server.gate_name,
                    peer = %self.peer_addr,
                    resource = %resource.uid,
                    "resource authentication not provided",
                );
                anyhow!("resource authentication not provided")
            })?;

        let dst = bridge::connect_to_destination(
            &self.server.gate_name,
            self.peer_addr,
            &auth,
            session.handle(),
            self.conn.tasks.clone(),
        )
        .await
        .map_err(|e| {
            error!(
                gate = %self.server.gate_name,
                peer = %self.peer_addr,
                resource = %resource.uid,
                error = %e,
                "unable to connect to destination",
            );
            anyhow!("unable to connect to destination")
        })?;

        *self.conn.backend.lock().await = Some(Arc::new(Mutex::new(dst)));
        info!(
            gate = %self.server.gate_name,
            peer = %self.peer_addr,
            resource = %resource.uid,
            "established proxy session",
        );
        Ok(())
    }

    /// New session channel from the client: open the like-typed channel
    /// on the backend and hand both ends to a relay pump. A backend
    /// failure rejects only this channel, not the session.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(gate = %self.server.gate_name, peer = %self.peer_addr, channel = ?channel.id(), "session channel requested");

        let Some(backend) = self.backend().await else {
            warn!(gate = %self.server.gate_name, peer = %self.peer_addr, "no destination connection for channel open");
            return Ok(false);
        };

        let dst = {
            let guard = backend.lock().await;
            guard.channel_open_session().await
        };
        let dst = match dst {
            Ok(dst) => dst,
            Err(e) => {
                error!(
                    gate = %self.server.gate_name,
                    peer = %self.peer_addr,
                    error = %e,
                    "could not open channel to destination",
                );
                return Ok(false);
            }
        };

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let close_once = Arc::new(CloseOnce::new());
        self.channels.insert(
            channel.id(),
            SessionChannel {
                ops: ops_tx,
                close_once: close_once.clone(),
            },
        );

        self.conn.tasks.lock().await.spawn(relay::run_channel_relay(
            channel.id(),
            session.handle(),
            dst,
            ops_rx,
            close_once,
        ));
        Ok(true)
    }

    /// Local port forward (`ssh -L`): a raw byte stream toward whatever
    /// the client asked the backend to reach.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(
            gate = %self.server.gate_name,
            peer = %self.peer_addr,
            target = %format!("{host_to_connect}:{port_to_connect}"),
            "direct-tcpip requested",
        );

        let Some(backend) = self.backend().await else {
            warn!(gate = %self.server.gate_name, peer = %self.peer_addr, "no destination connection for direct-tcpip");
            return Ok(false);
        };

        let dst = {
            let guard = backend.lock().await;
            guard
                .channel_open_direct_tcpip(
                    host_to_connect,
                    port_to_connect,
                    originator_address,
                    originator_port,
                )
                .await
        };
        match dst {
            Ok(dst) => {
                self.conn
                    .tasks
                    .lock()
                    .await
                    .spawn(relay::run_stream_relay(channel, dst));
                Ok(true)
            }
            Err(e) => {
                error!(
                    gate = %self.server.gate_name,
                    peer = %self.peer_addr,
                    error = %e,
                    "unable to connect to destination resource",
                );
                Ok(false)
            }
        }
    }

    /// Remote port forward: relay the global request to the backend and
    /// report its answer. Forwarded connections come back through
    /// [`BackendHandler::server_channel_open_forwarded_tcpip`].
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(backend) = self.backend().await else {
            warn!(gate = %self.server.gate_name, peer = %self.peer_addr, "no destination connection for tcpip-forward");
            return Ok(false);
        };

        let mut guard = backend.lock().await;
        match guard.tcpip_forward(address.to_string(), *port).await {
            Ok(assigned) => {
                debug!(
                    gate = %self.server.gate_name,
                    peer = %self.peer_addr,
                    address,
                    port = assigned,
                    "destination accepted tcpip-forward",
                );
                *port = assigned;
                Ok(true)
            }
            Err(e) => {
                warn!(
                    gate = %self.server.gate_name,
                    peer = %self.peer_addr,
                    address,
                    error = %e,
                    "destination rejected tcpip-forward",
                );
                Ok(false)
            }
        }
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(backend) = self.backend().await else {
            return Ok(false);
        };

        let mut guard = backend.lock().await;
        match guard.cancel_tcpip_forward(address.to_string(), port).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(
                    gate = %self.server.gate_name,
                    peer = %self.peer_addr,
                    address,
                    port,
                    error = %e,
                    "destination rejected cancel-tcpip-forward",
                );
                Ok(false)
            }
        }
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_op(channel, ChannelOp::Data(data.to_vec()));
        Ok(())
    }

    async fn extended_data(
        &mut self,
        channel: ChannelId,
        code: u32,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_op(channel, ChannelOp::ExtendedData(code, data.to_vec()));
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(russh::Pty, u32)],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            gate = %self.server.gate_name,
            peer = %self.peer_addr,
            channel = ?channel,
            term,
            cols = col_width,
            rows = row_height,
            "pty request",
        );
        self.forward_op(
            channel,
            ChannelOp::Pty {
                term: term.to_string(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes: modes.to_vec(),
            },
        );
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(gate = %self.server.gate_name, peer = %self.peer_addr, channel = ?channel, "shell request");
        self.forward_op(channel, ChannelOp::Shell);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(gate = %self.server.gate_name, peer = %self.peer_addr, channel = ?channel, "exec request");
        self.forward_op(channel, ChannelOp::Exec(data.to_vec()));
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(gate = %self.server.gate_name, peer = %self.peer_addr, channel = ?channel, name, "subsystem request");
        self.forward_op(channel, ChannelOp::Subsystem(name.to_string()));
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_op(
            channel,
            ChannelOp::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        );
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_op(
            channel,
            ChannelOp::Env(variable_name.to_string(), variable_value.to_string()),
        );
        Ok(())
    }

    async fn signal(
        &mut self,
        channel: ChannelId,
        signal: Sig,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_op(channel, ChannelOp::Signal(signal));
        Ok(())
    }

    /// Client half-closed the channel: propagate EOF to the backend so
    /// the remote process sees its stdin end.
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(gate = %self.server.gate_name, peer = %self.peer_addr, channel = ?channel, "channel eof");
        self.forward_op(channel, ChannelOp::Eof);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(gate = %self.server.gate_name, peer = %self.peer_addr, channel = ?channel, "channel closed");
        if let Some(chan) = self.channels.remove(&channel) {
            // The client already closed its leg; the pump must not close
            // it a second time. Dropping the sender winds the pump down.
            chan.close_once.begin();
        }
        Ok(())
    }
}

/// Serve one accepted TCP connection for its whole lifetime: handshake,
/// bridge, relay, then the teardown choreography. Closing the backend
/// connection at the end is the backstop that unparks any relay task
/// still waiting on the destination; the JoinSet drain is the session's
/// completion barrier.
async fn serve_connection(
    state: Arc<ServerState>,
    config: Arc<russh::server::Config>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    info!(gate = %state.gate_name, peer = %peer_addr, "starting new session");

    let session_uid = Uuid::new_v4();
    let conn = Arc::new(ConnState::default());
    let handler = ConnectionHandler::new(state.clone(), peer_addr, session_uid, conn.clone());

    match russh::server::run_stream(config, stream, handler).await {
        Ok(session) => {
            if let Err(e) = session.await {
                warn!(gate = %state.gate_name, peer = %peer_addr, error = %e, "SSH session error");
            }
        }
        Err(e) => {
            warn!(gate = %state.gate_name, peer = %peer_addr, error = %e, "failed to establish connection");
        }
    }

    // The transport is gone for good, so an unclaimed pending entry can
    // only mean the client stopped between auth and handshake completion.
    if state.registry.claim(session_uid).is_some() {
        debug!(gate = %state.gate_name, peer = %peer_addr, "discarded unclaimed pending session");
    }

    if let Some(backend) = conn.backend.lock().await.take() {
        let guard = backend.lock().await;
        let _ = guard
            .disconnect(Disconnect::ByApplication, "session ended", "")
            .await;
    }

    // Take the set out of the mutex before draining so a late spawn from
    // the backend handler cannot block against the join loop. Anything
    // spawned after this point lands in the fresh set and is aborted when
    // the connection state drops.
    let mut tasks = std::mem::take(&mut *conn.tasks.lock().await);
    while tasks.join_next().await.is_some() {}

    info!(gate = %state.gate_name, peer = %peer_addr, "session closed");
}

/// Bind the listener and start accepting connections in a background
/// task. Returns the concrete bound address (the configured port may be
/// 0) and the accept task handle.
pub async fn start_server(
    state: Arc<ServerState>,
    config: &GateConfig,
    key_path: &Path,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let key = load_or_generate_host_key(key_path).await?;

    let russh_config = Arc::new(russh::server::Config {
        server_id: russh::SshId::Standard(SERVER_ID.to_string()),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![key],
        ..Default::default()
    });

    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("unable to bind to address {:?}", config.bind_address))?;
    let addr = listener
        .local_addr()
        .context("unable to resolve bound address")?;
    info!(gate = %state.gate_name, %addr, "SSH proxy listening");

    let accept_state = state.clone();
    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let state = accept_state.clone();
                    let config = russh_config.clone();
                    tokio::spawn(serve_connection(state, config, stream, peer_addr));
                }
                Err(e) => {
                    error!(
                        gate = %accept_state.gate_name,
                        error = %e,
                        "unable to accept the incoming connection",
                    );
                }
            }
        }
    });

    Ok((addr, task))
}

/// Load the host key, or generate one on first start: write it with
/// owner-only permissions and reload from disk. The key's lifetime spans
/// the proxy's lifetime, not any single session.
async fn load_or_generate_host_key(path: &Path) -> Result<russh::keys::PrivateKey> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};

    if !path.exists() {
        info!(path = %path.display(), "could not load host key, generating");
        let key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .context("unable to generate host key")?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let key_bytes = key
            .to_openssh(LineEnding::LF)
            .context("unable to encode host key")?;
        tokio::fs::write(path, key_bytes.as_bytes()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }
    }

    russh::keys::load_secret_key(path, None)
        .with_context(|| format!("unable to load host key from {}", path.display()))
}
