//! Channel relay between the client-facing leg and the backend leg of one
//! proxied session.
//!
//! Session channels are relayed by one pump task per channel: operations
//! from the client arrive over an mpsc queue (fed by the server handler
//! callbacks) and are applied to the backend channel; backend messages are
//! pushed back through the server handle. Raw stream channels
//! (direct-tcpip / forwarded-tcpip) bypass the pump and are bridged as
//! byte streams.

use std::sync::atomic::{AtomicBool, Ordering};

use russh::{Channel, ChannelId, ChannelMsg, Pty, Sig, client, server};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A client-side channel event or request, queued toward the backend.
///
/// Request `Type`, `WantReply` and `Payload` survive the trip: each op
/// maps onto the like-typed backend request, and want-reply requests are
/// counted so the backend's replies can be relayed back in order.
#[derive(Debug)]
pub enum ChannelOp {
    Data(Vec<u8>),
    ExtendedData(u32, Vec<u8>),
    Env(String, String),
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    Exec(Vec<u8>),
    Subsystem(String),
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Signal(Sig),
    Eof,
}

/// Guard making "the client leg of a channel is closed exactly once"
/// explicit. The pump task and the handler's channel-close path both race
/// toward it; whichever gets there first wins and everyone else observes
/// `false` and leaves the channel alone.
#[derive(Debug, Default)]
pub struct CloseOnce(AtomicBool);

impl CloseOnce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for exactly one caller.
    pub fn begin(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}

/// Relay one session channel until both sides are done.
///
/// `exit-status` from the backend is a normal wind-down signal: it is
/// forwarded and the pump keeps draining until the backend closes. A
/// closed ops queue means the client side is gone; the backend gets a
/// half-close so the remote process observes EOF promptly instead of
/// blocking on a read.
///
/// The ops queue is unbounded so the server event loop never blocks on
/// this pump; the client's flow-control window bounds how far it can run
/// ahead.
pub async fn run_channel_relay(
    src_id: ChannelId,
    src: server::Handle,
    mut dst: Channel<client::Msg>,
    mut ops: mpsc::UnboundedReceiver<ChannelOp>,
    close_once: std::sync::Arc<CloseOnce>,
) {
    debug!(channel = ?src_id, "starting channel relay");

    // Want-reply requests in flight toward the backend; SSH replies come
    // back in request order, so a FIFO count is enough to pair them.
    let mut pending_replies: usize = 0;
    let mut ops_open = true;

    loop {
        tokio::select! {
            op = ops.recv(), if ops_open => match op {
                Some(op) => {
                    if let Err(e) = apply_op(&mut dst, op, &mut pending_replies).await {
                        warn!(channel = ?src_id, error = %e, "unable to forward to destination channel");
                        break;
                    }
                }
                None => {
                    ops_open = false;
                    if let Err(e) = dst.eof().await {
                        debug!(channel = ?src_id, error = %e, "destination half-close failed");
                        break;
                    }
                }
            },
            msg = dst.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if src.data(src_id, data).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    if src.extended_data(src_id, ext, data).await.is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::Success) => {
                    if pending_replies > 0 {
                        pending_replies -= 1;
                        let _ = src.channel_success(src_id).await;
                    }
                }
                Some(ChannelMsg::Failure) => {
                    if pending_replies > 0 {
                        pending_replies -= 1;
                        let _ = src.channel_failure(src_id).await;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!(channel = ?src_id, exit_status, "destination reported exit status");
                    let _ = src.exit_status_request(src_id, exit_status).await;
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    debug!(channel = ?src_id, signal = ?signal_name, "destination reported exit signal");
                }
                Some(ChannelMsg::Eof) => {
                    let _ = src.eof(src_id).await;
                }
                Some(ChannelMsg::Close) | None => {
                    break;
                }
                Some(other) => {
                    debug!(channel = ?src_id, msg = ?other, "ignoring destination channel message");
                }
            },
        }
    }

    if close_once.begin() {
        let _ = src.close(src_id).await;
    }
    let _ = dst.close().await;
    debug!(channel = ?src_id, "channel relay completed");
}

async fn apply_op(
    dst: &mut Channel<client::Msg>,
    op: ChannelOp,
    pending_replies: &mut usize,
) -> Result<(), russh::Error> {
    match op {
        ChannelOp::Data(data) => dst.data(&data[..]).await?,
        ChannelOp::ExtendedData(ext, data) => dst.extended_data(ext, &data[..]).await?,
        ChannelOp::Env(name, value) => dst.set_env(false, name, value).await?,
        ChannelOp::Pty {
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes,
        } => {
            *pending_replies += 1;
            dst.request_pty(
                true, &term, col_width, row_height, pix_width, pix_height, &modes,
            )
            .await?
        }
        ChannelOp::Shell => {
            *pending_replies += 1;
            dst.request_shell(true).await?
        }
        ChannelOp::Exec(command) => {
            *pending_replies += 1;
            dst.exec(true, command).await?
        }
        ChannelOp::Subsystem(name) => {
            *pending_replies += 1;
            dst.request_subsystem(true, &name).await?
        }
        ChannelOp::WindowChange {
            col_width,
            row_height,
            pix_width,
            pix_height,
        } => {
            dst.window_change(col_width, row_height, pix_width, pix_height)
                .await?
        }
        ChannelOp::Signal(sig) => dst.signal(sig).await?,
        ChannelOp::Eof => dst.eof().await?,
    }
    Ok(())
}

/// Bridge a raw stream channel pair (direct-tcpip, forwarded-tcpip).
/// These carry no sub-requests, so a bidirectional byte copy is the whole
/// job; EOF in either direction is propagated as a write shutdown on the
/// other side.
pub async fn run_stream_relay(src: Channel<server::Msg>, dst: Channel<client::Msg>) {
    let mut src_stream = src.into_stream();
    let mut dst_stream = dst.into_stream();

    match tokio::io::copy_bidirectional(&mut src_stream, &mut dst_stream).await {
        Ok((to_dst, to_src)) => {
            debug!(to_dst, to_src, "stream relay completed");
        }
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            debug!("stream relay closed");
        }
        Err(e) => {
            warn!(error = %e, "stream relay closed unexpectedly");
        }
    }
}
