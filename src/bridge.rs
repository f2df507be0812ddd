//! Backend leg of a proxied session: dials the real resource over SSH
//! using the authentication stored for it, which the end user never sees.

use std::net::SocketAddr;
use std::sync::Arc;

use russh::keys::{PrivateKeyWithHashAlg, decode_secret_key};
use russh::{Channel, client};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::model::ResourceAuthentication;
use crate::relay;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("resource authentication not provided")]
    MissingAuthentication,

    #[error("unable to parse resource private key: {0}")]
    KeyParse(#[from] russh::keys::Error),

    #[error("unable to dial destination {address}: {source}")]
    Connect {
        address: String,
        source: russh::Error,
    },

    #[error("destination rejected the stored credentials")]
    AuthRejected,

    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),
}

/// Client-side handler for the backend connection.
///
/// Host-key verification is intentionally absent: every allocation brings
/// up a resource with a brand-new host key, so there is no identity to pin
/// against. The trust boundary is the resource store, not the host key.
pub struct BackendHandler {
    /// Handle of the client-facing session, used to relay channels the
    /// backend opens toward the user (remote port forwards).
    src: russh::server::Handle,

    /// Relay tasks of the owning session.
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl client::Handler for BackendHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// The backend opened a `forwarded-tcpip` channel (remote port
    /// forward hit); mirror it toward the client and bridge the bytes.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            connected = %format!("{connected_address}:{connected_port}"),
            originator = %format!("{originator_address}:{originator_port}"),
            "destination opened forwarded-tcpip channel",
        );

        match self
            .src
            .channel_open_forwarded_tcpip(
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            )
            .await
        {
            Ok(src_channel) => {
                self.tasks
                    .lock()
                    .await
                    .spawn(relay::run_stream_relay(src_channel, channel));
            }
            Err(e) => {
                warn!(error = %e, "unable to open forwarded-tcpip channel toward the client");
            }
        }
        Ok(())
    }
}

/// Dial the destination resource and authenticate with its stored
/// credentials: password if one is set, private key if one is set, in
/// that order.
pub async fn connect_to_destination(
    gate_name: &str,
    source_addr: SocketAddr,
    auth: &ResourceAuthentication,
    src: russh::server::Handle,
    tasks: Arc<Mutex<JoinSet<()>>>,
) -> Result<client::Handle<BackendHandler>, BridgeError> {
    if !auth.is_usable() {
        return Err(BridgeError::MissingAuthentication);
    }

    let address = format!("{}:{}", auth.ip_addr, auth.port);
    let config = Arc::new(client::Config::default());
    let handler = BackendHandler { src, tasks };

    let mut dst = client::connect(config, (auth.ip_addr.as_str(), auth.port), handler)
        .await
        .map_err(|e| BridgeError::Connect {
            address: address.clone(),
            source: e,
        })?;

    if let Some(password) = auth.password.as_deref().filter(|p| !p.is_empty()) {
        let result = dst
            .authenticate_password(&auth.username, password)
            .await?;
        if result.success() {
            debug!(gate = gate_name, peer = %source_addr, %address, "destination accepted password auth");
            return Ok(dst);
        }
        debug!(gate = gate_name, peer = %source_addr, %address, "destination rejected password auth");
    }

    if let Some(pem) = auth.key.as_deref().filter(|k| !k.is_empty()) {
        let key = decode_secret_key(pem, None)?;
        let hash_alg = dst.best_supported_rsa_hash().await?.flatten();
        let result = dst
            .authenticate_publickey(
                &auth.username,
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await?;
        if result.success() {
            debug!(gate = gate_name, peer = %source_addr, %address, "destination accepted key auth");
            return Ok(dst);
        }
        debug!(gate = gate_name, peer = %source_addr, %address, "destination rejected key auth");
    }

    Err(BridgeError::AuthRejected)
}
