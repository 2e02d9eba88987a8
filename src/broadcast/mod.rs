//! Snapshot broadcast over TCP.
//!
//! Clients connect to the listener, send one newline-terminated handshake
//! token, and then only receive: observers get a length-prefixed snapshot
//! frame after every processed unit, the single display connection gets a
//! short `new event` notification instead. All sends are bounded by a
//! timeout; a client that cannot keep up is dropped, never waited on.

use std::net::SocketAddr;
use std::task::Poll;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Handshake token for a passive snapshot consumer.
pub const OBSERVER_TOKEN: &str = "observer";

/// Handshake token for the single interactive display.
pub const DISPLAY_TOKEN: &str = "display";

/// Payload of the per-unit display notification frame.
pub const NEW_EVENT_PAYLOAD: &[u8] = b"new event";

/// Upper bound on a frame payload, to keep a corrupt length prefix from
/// looking like a multi-gigabyte allocation to a reading client.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const MAX_TOKEN_LEN: usize = 64;

/// Connected client role, fixed at handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Observer,
    Display,
}

impl ClientRole {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ClientRole::Observer => "observer",
            ClientRole::Display => "display",
        }
    }
}

/// One registered client. Dropping it closes the socket.
struct ClientConnection {
    stream: TcpStream,
    peer: SocketAddr,
    role: ClientRole,
}

/// Owns the listening socket and the roster of connected clients.
pub struct BroadcastServer {
    listener: TcpListener,
    observers: Vec<ClientConnection>,
    display: Option<ClientConnection>,
    handshake_timeout: Duration,
    send_timeout: Duration,
}

impl BroadcastServer {
    /// Bind the listener. A bind failure is an initialization failure.
    pub async fn bind(
        addr: SocketAddr,
        handshake_timeout: Duration,
        send_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding broadcast listener on {addr}"))?;
        info!(addr = %listener.local_addr()?, "broadcast listener ready");

        Ok(Self {
            listener,
            observers: Vec::new(),
            display: None,
            handshake_timeout,
            send_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn has_display(&self) -> bool {
        self.display.is_some()
    }

    /// Accept every connection that is already pending, never waiting for a
    /// new one. `snapshot` carries the current frame when events have been
    /// recorded: an observer then gets it synchronously and is dropped if
    /// that send fails; with no events yet it is registered to wait for the
    /// first push. Also sweeps connections whose peer closed while idle.
    pub async fn accept_pending(&mut self, snapshot: Option<&[u8]>) -> usize {
        self.sweep_closed();

        let mut accepted = 0;
        loop {
            match poll_accept_now(&self.listener).await {
                None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "accepting broadcast connection failed");
                    break;
                }
                Some(Ok((stream, peer))) => {
                    self.register(stream, peer, snapshot).await;
                    accepted += 1;
                }
            }
        }
        accepted
    }

    async fn register(&mut self, mut stream: TcpStream, peer: SocketAddr, snapshot: Option<&[u8]>) {
        let token = match read_token(&mut stream, self.handshake_timeout).await {
            Ok(token) => token,
            Err(e) => {
                debug!(peer = %peer, error = %e, "closing connection: bad handshake");
                return;
            }
        };

        match token.as_str() {
            OBSERVER_TOKEN => {
                let mut conn = ClientConnection {
                    stream,
                    peer,
                    role: ClientRole::Observer,
                };
                if let Some(frame) = snapshot {
                    if let Err(e) =
                        write_frame(&mut conn.stream, frame, self.send_timeout).await
                    {
                        warn!(
                            peer = %peer,
                            error = %e,
                            "dropping observer: initial snapshot send failed",
                        );
                        return;
                    }
                }
                info!(peer = %peer, "observer registered");
                self.observers.push(conn);
            }
            DISPLAY_TOKEN => {
                if let Some(old) = self.display.take() {
                    info!(peer = %old.peer, "replacing display connection");
                }
                info!(peer = %peer, "display registered");
                self.display = Some(ClientConnection {
                    stream,
                    peer,
                    role: ClientRole::Display,
                });
            }
            other => {
                debug!(peer = %peer, token = other, "closing connection: unknown handshake token");
            }
        }
    }

    /// Send the same frame to every active observer. Failed connections are
    /// pruned from the roster. Returns how many observers received it.
    pub async fn push_snapshot(&mut self, frame: &[u8]) -> usize {
        let mut delivered = 0;
        let mut alive = Vec::with_capacity(self.observers.len());

        for mut conn in std::mem::take(&mut self.observers) {
            match write_frame(&mut conn.stream, frame, self.send_timeout).await {
                Ok(()) => {
                    delivered += 1;
                    alive.push(conn);
                }
                Err(e) => {
                    warn!(
                        peer = %conn.peer,
                        role = conn.role.as_str(),
                        error = %e,
                        "dropping client: snapshot send failed",
                    );
                }
            }
        }

        self.observers = alive;
        delivered
    }

    /// Best-effort per-unit notification to the display, if one is
    /// connected. A failed send drops the display.
    pub async fn notify_display(&mut self) {
        let Some(conn) = &mut self.display else {
            return;
        };
        if let Err(e) = write_frame(&mut conn.stream, NEW_EVENT_PAYLOAD, self.send_timeout).await {
            warn!(peer = %conn.peer, error = %e, "dropping display: notification failed");
            self.display = None;
        }
    }

    /// Drop clients whose peer closed while we were not sending. Clients
    /// never send after the handshake, so a readable zero-length result
    /// means the peer is gone.
    fn sweep_closed(&mut self) {
        self.observers.retain(|conn| peer_alive(conn));
        if self.display.as_ref().is_some_and(|conn| !peer_alive(conn)) {
            self.display = None;
        }
    }
}

fn peer_alive(conn: &ClientConnection) -> bool {
    let mut probe = [0u8; 8];
    match conn.stream.try_read(&mut probe) {
        Ok(0) => {
            debug!(peer = %conn.peer, role = conn.role.as_str(), "peer closed connection");
            false
        }
        // Unexpected chatter; the protocol defines none, ignore it.
        Ok(_) => true,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
        Err(e) => {
            debug!(peer = %conn.peer, error = %e, "peer connection errored");
            false
        }
    }
}

/// Resolve the accept queue without waiting: `None` when nothing is pending.
async fn poll_accept_now(
    listener: &TcpListener,
) -> Option<std::io::Result<(TcpStream, SocketAddr)>> {
    std::future::poll_fn(|cx| match listener.poll_accept(cx) {
        Poll::Ready(result) => Poll::Ready(Some(result)),
        Poll::Pending => Poll::Ready(None),
    })
    .await
}

/// Read the newline-terminated handshake token under a deadline.
async fn read_token(stream: &mut TcpStream, deadline: Duration) -> Result<String> {
    let read = async {
        let mut buf = [0u8; MAX_TOKEN_LEN];
        let mut len = 0;
        loop {
            if len == buf.len() {
                bail!("handshake token too long");
            }
            let n = stream.read(&mut buf[len..]).await?;
            if n == 0 {
                bail!("connection closed during handshake");
            }
            len += n;
            if let Some(pos) = buf[..len].iter().position(|&b| b == b'\n') {
                let token = std::str::from_utf8(&buf[..pos])
                    .context("handshake token is not valid ASCII")?;
                return Ok(token.trim().to_string());
            }
        }
    };

    match timeout(deadline, read).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("handshake timed out after {deadline:?}")),
    }
}

/// Write one length-prefixed frame (u32 LE length, then payload) under a
/// deadline.
pub async fn write_frame(stream: &mut TcpStream, payload: &[u8], deadline: Duration) -> Result<()> {
    let write = async {
        stream.write_all(&(payload.len() as u32).to_le_bytes()).await?;
        stream.write_all(payload).await?;
        Ok::<(), std::io::Error>(())
    };

    match timeout(deadline, write).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(anyhow!("send timed out after {deadline:?}")),
    }
}

/// Read one length-prefixed frame. Used by client-side consumers and tests.
pub async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        bail!("frame length {len} exceeds maximum {MAX_FRAME_LEN}");
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}
