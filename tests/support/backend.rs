//! In-process SSH server standing in for the destination resource.
//!
//! Accepts one fixed set of credentials, answers `echo` exec requests
//! with their argument and a zero exit status, and serves direct-tcpip
//! channels by dialing the requested address locally.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use aquarium_gate::crypt::authorized_key_entry;

#[derive(Clone)]
struct BackendAuth {
    username: String,
    password: Option<String>,
    authorized_key: Option<String>,
}

/// A running backend server on an ephemeral port.
pub struct TestBackend {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Drop for TestBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn start(
    username: &str,
    password: Option<&str>,
    authorized_key: Option<String>,
) -> TestBackend {
    use russh::keys::ssh_key::Algorithm;
    use russh::keys::ssh_key::rand_core::OsRng;

    let host_key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .expect("backend host key");
    let config = Arc::new(russh::server::Config {
        auth_rejection_time: Duration::from_millis(10),
        auth_rejection_time_initial: Some(Duration::ZERO),
        keys: vec![host_key],
        ..Default::default()
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("backend bind");
    let addr = listener.local_addr().expect("backend addr");

    let auth = BackendAuth {
        username: username.to_string(),
        password: password.map(str::to_string),
        authorized_key,
    };

    let task = tokio::spawn(async move {
        loop {
            let Ok((stream, _peer)) = listener.accept().await else {
                break;
            };
            let config = config.clone();
            let handler = BackendConnection { auth: auth.clone() };
            tokio::spawn(async move {
                if let Ok(session) = russh::server::run_stream(config, stream, handler).await {
                    let _ = session.await;
                }
            });
        }
    });

    TestBackend { addr, task }
}

struct BackendConnection {
    auth: BackendAuth,
}

impl BackendConnection {
    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }
}

impl Handler for BackendConnection {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == self.auth.username && self.auth.password.as_deref() == Some(password) {
            Ok(Auth::Accept)
        } else {
            Ok(Self::reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        let entry = authorized_key_entry(public_key);
        if user == self.auth.username && self.auth.authorized_key.as_deref() == Some(entry.as_str())
        {
            Ok(Auth::Accept)
        } else {
            Ok(Self::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        let (exit_status, output) = fake_shell(&command);

        session.channel_success(channel)?;

        let handle = session.handle();
        if !output.is_empty() {
            let _ = handle
                .data(channel, CryptoVec::from_slice(output.as_bytes()))
                .await;
        }
        let _ = handle.exit_status_request(channel, exit_status).await;
        let _ = handle.eof(channel).await;
        let _ = handle.close(channel).await;
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match TcpStream::connect((host_to_connect, port_to_connect as u16)).await {
            Ok(mut tcp) => {
                tokio::spawn(async move {
                    let mut stream = channel.into_stream();
                    let _ = tokio::io::copy_bidirectional(&mut stream, &mut tcp).await;
                });
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}

/// Minimal stand-in for a shell: handles `echo`, fails everything else.
fn fake_shell(command: &str) -> (u32, String) {
    let trimmed = command.trim();
    if let Some(rest) = trimmed.strip_prefix("echo ") {
        let text = rest
            .trim()
            .trim_matches(|c| c == '\'' || c == '"')
            .to_string();
        (0, format!("{text}\n"))
    } else {
        (127, format!("{trimmed}: command not found\n"))
    }
}
