//! WebSocket connection handle.
//!
//! A [`Connection`] is a cheap, cloneable handle; the registry keeps clones,
//! the ingress handler that created it owns its lifecycle. Outbound frames go
//! through a bounded per-connection buffer drained by a writer task, so
//! [`Connection::send`] never waits on a slow peer:
//!
//! ```text
//!  broadcast loop ──send()──► [ outbound buffer ] ──► writer task ──► socket
//!                                                        ▲
//!  close() ──────────────── closed signal ───────────────┘ (also stops ingress)
//! ```

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::protocol::RoomMessage;

type WsStream = WebSocketStream<TcpStream>;

/// Longest wait for the close handshake when no write timeout is set.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Process-unique identity of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-connection transport settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Request path that accepts the upgrade
    pub path: String,
    /// Frames buffered per connection before sends start failing
    pub outbound_buffer: usize,
    /// Upper bound on the upgrade handshake (None = unbounded)
    pub handshake_timeout: Option<Duration>,
    /// Idle deadline between inbound messages (None = unbounded)
    pub read_timeout: Option<Duration>,
    /// Deadline for writing a single frame (None = unbounded)
    pub write_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            outbound_buffer: 256,
            handshake_timeout: None,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

struct Shared {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    outbound: mpsc::Sender<Message>,
    closed: Arc<watch::Sender<bool>>,
}

/// Handle to a live transport session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Create a connection whose outbound frames land in an in-process [`Outbox`].
    ///
    /// [`upgrade`] builds every socket-backed connection this way and hands
    /// the outbox to the writer task.
    pub fn pair(buffer: usize) -> (Self, Outbox) {
        Self::with_peer(None, buffer)
    }

    fn with_peer(peer_addr: Option<SocketAddr>, buffer: usize) -> (Self, Outbox) {
        let (outbound, rx) = mpsc::channel(buffer.max(1));
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let connection = Self {
            inner: Arc::new(Shared {
                id: ConnectionId::new(),
                peer_addr,
                outbound,
                closed,
            }),
        };
        (connection, Outbox { rx })
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Queue a message for delivery.
    pub fn send(&self, msg: &RoomMessage) -> Result<()> {
        self.send_frame(msg.to_frame()?)
    }

    /// Queue a pre-encoded frame for delivery.
    ///
    /// Fails with [`RelayError::Write`] if the connection was closed, the
    /// writer has given up on the socket, or the outbound buffer is full.
    pub fn send_frame(&self, frame: Message) -> Result<()> {
        if self.is_closed() {
            return Err(RelayError::write(self.id(), "connection closed"));
        }
        self.inner.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => RelayError::write(self.id(), "outbound buffer full"),
            TrySendError::Closed(_) => RelayError::write(self.id(), "transport closed"),
        })
    }

    /// Release the transport. Safe to call any number of times.
    pub fn close(&self) {
        signal_close(&self.inner.closed, self.id());
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once [`Connection::close`] has been called on any clone.
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        wait_closed(self.inner.closed.subscribe())
    }
}

fn signal_close(closed: &watch::Sender<bool>, id: ConnectionId) {
    let was_closed = closed.send_replace(true);
    if !was_closed {
        log::debug!("Connection {id} closing");
    }
}

async fn wait_closed(mut rx: watch::Receiver<bool>) {
    loop {
        let closed = *rx.borrow_and_update();
        if closed {
            return;
        }
        // Every handle is gone; nobody is left to close it.
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Receiving end of a connection's outbound buffer.
pub struct Outbox {
    rx: mpsc::Receiver<Message>,
}

impl Outbox {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Next queued frame decoded as a room message, skipping control frames.
    pub fn try_recv_message(&mut self) -> Option<RoomMessage> {
        while let Some(frame) = self.try_recv() {
            let decoded = match &frame {
                Message::Text(text) => RoomMessage::decode(text.as_str().as_bytes()),
                Message::Binary(data) => RoomMessage::decode(data),
                _ => continue,
            };
            if let Ok(msg) = decoded {
                return Some(msg);
            }
        }
        None
    }
}

/// Inbound half of an upgraded connection, owned by its ingress handler.
pub struct Inbound {
    stream: SplitStream<WsStream>,
    connection: Connection,
    read_timeout: Option<Duration>,
}

impl Inbound {
    /// Wait for the next complete message.
    ///
    /// Any failure (peer close, transport error, malformed JSON, idle
    /// deadline) is reported as [`RelayError::Read`]; the connection is not
    /// usable afterwards.
    pub async fn receive(&mut self) -> Result<RoomMessage> {
        let id = self.connection.id();
        loop {
            let next = match self.read_timeout {
                Some(limit) => tokio::time::timeout(limit, self.stream.next())
                    .await
                    .map_err(|_| RelayError::read(id, format!("idle for {limit:?}")))?,
                None => self.stream.next().await,
            };

            let decoded = match next {
                Some(Ok(Message::Text(text))) => RoomMessage::decode(text.as_str().as_bytes()),
                Some(Ok(Message::Binary(data))) => RoomMessage::decode(&data),
                // tungstenite queues pong replies itself
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(RelayError::read(id, "closed by peer"));
                }
                Some(Err(e)) => return Err(RelayError::read(id, e.to_string())),
            };
            return decoded.map_err(|e| RelayError::read(id, e.to_string()));
        }
    }
}

/// Perform the WebSocket handshake on an accepted TCP stream.
///
/// Requests for any path other than `config.path` are answered with 404.
/// The origin header is not checked.
pub async fn upgrade(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: &ConnectionConfig,
) -> Result<(Connection, Inbound)> {
    let endpoint = config.path.clone();
    let check_path = move |request: &Request, response: Response| {
        let path = request.uri().path();
        if path == endpoint {
            Ok(response)
        } else {
            let mut rejection: ErrorResponse =
                ErrorResponse::new(Some(format!("no websocket endpoint at {path}")));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    let handshake = tokio_tungstenite::accept_hdr_async(stream, check_path);
    let accepted = match config.handshake_timeout {
        Some(limit) => tokio::time::timeout(limit, handshake)
            .await
            .map_err(|_| RelayError::Handshake(format!("timed out after {limit:?}")))?,
        None => handshake.await,
    };
    let ws_stream = accepted.map_err(|e| RelayError::Handshake(e.to_string()))?;
    let (sink, stream) = ws_stream.split();

    let (connection, outbox) = Connection::with_peer(Some(peer_addr), config.outbound_buffer);
    tokio::spawn(write_loop(
        sink,
        outbox,
        connection.inner.closed.clone(),
        config.write_timeout,
        connection.id(),
    ));

    let inbound = Inbound {
        stream,
        connection: connection.clone(),
        read_timeout: config.read_timeout,
    };
    Ok((connection, inbound))
}

/// Drain `outbox` into `sink` until the connection closes.
///
/// A failed or timed-out write closes the connection, which also stops the
/// ingress loop so it can leave its rooms.
async fn write_loop<S>(
    mut sink: S,
    mut outbox: Outbox,
    closed: Arc<watch::Sender<bool>>,
    write_timeout: Option<Duration>,
    id: ConnectionId,
) where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let shutdown = wait_closed(closed.subscribe());
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            frame = outbox.recv() => {
                let Some(frame) = frame else { break };
                let written = tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    written = with_deadline(write_timeout, sink.send(frame)) => written,
                };
                if let Err(reason) = written {
                    log::warn!("Write to connection {id} failed: {reason}");
                    signal_close(&closed, id);
                    break;
                }
            }
        }
    }

    // Dropping the outbox first makes every later send() fail fast.
    drop(outbox);
    let grace = write_timeout.unwrap_or(CLOSE_GRACE);
    if let Err(reason) = with_deadline(Some(grace), sink.close()).await {
        log::debug!("Close of connection {id} incomplete: {reason}");
    }
}

async fn with_deadline<F, T, E>(limit: Option<Duration>, fut: F) -> std::result::Result<T, String>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: fmt::Display,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("timed out after {limit:?}")),
        },
        None => fut.await.map_err(|e| e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.path, "/ws");
        assert_eq!(config.outbound_buffer, 256);
        assert!(config.handshake_timeout.is_none());
        assert!(config.read_timeout.is_none());
        assert!(config.write_timeout.is_none());
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let (a, _outbox_a) = Connection::pair(4);
        let (b, _outbox_b) = Connection::pair(4);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id(), a.clone().id());
    }

    #[test]
    fn test_send_reaches_outbox() {
        let (conn, mut outbox) = Connection::pair(4);
        conn.send(&RoomMessage::new("room1", "hello")).unwrap();
        assert_eq!(
            outbox.try_recv_message(),
            Some(RoomMessage::new("room1", "hello"))
        );
        assert!(outbox.try_recv().is_none());
    }

    #[test]
    fn test_send_after_close_fails() {
        let (conn, _outbox) = Connection::pair(4);
        conn.close();
        let err = conn.send(&RoomMessage::new("room1", "late")).unwrap_err();
        assert!(matches!(err, RelayError::Write { id, .. } if id == conn.id()));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (conn, _outbox) = Connection::pair(4);
        let other = conn.clone();
        conn.close();
        conn.close();
        other.close();
        assert!(conn.is_closed());
        assert!(other.is_closed());
    }

    #[test]
    fn test_send_to_dropped_transport_fails() {
        let (conn, outbox) = Connection::pair(4);
        drop(outbox);
        assert!(matches!(
            conn.send(&RoomMessage::new("room1", "x")),
            Err(RelayError::Write { .. })
        ));
    }

    #[test]
    fn test_full_outbound_buffer_fails() {
        let (conn, _outbox) = Connection::pair(2);
        conn.send(&RoomMessage::new("r", "1")).unwrap();
        conn.send(&RoomMessage::new("r", "2")).unwrap();
        let err = conn.send(&RoomMessage::new("r", "3")).unwrap_err();
        assert!(err.to_string().contains("outbound buffer full"));
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let (conn, _outbox) = Connection::pair(4);
        let waiter = conn.closed();

        let pending = timeout(Duration::from_millis(20), conn.closed()).await;
        assert!(pending.is_err(), "closed() must wait while open");

        conn.clone().close();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed() should resolve after close()");
        // Also resolves immediately for late subscribers.
        timeout(Duration::from_millis(50), conn.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_write_closes_connection() {
        let (conn, outbox) = Connection::pair(4);
        let broken = Box::pin(futures_util::sink::unfold((), |(), _frame: Message| async {
            Err::<(), _>("broken pipe")
        }));
        let writer = tokio::spawn(write_loop(
            broken,
            outbox,
            conn.inner.closed.clone(),
            None,
            conn.id(),
        ));

        conn.send(&RoomMessage::new("room1", "doomed")).unwrap();
        timeout(Duration::from_secs(1), conn.closed())
            .await
            .expect("a failed write should close the connection");
        timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();

        assert!(conn.is_closed());
        assert!(conn.send(&RoomMessage::new("room1", "after")).is_err());
    }

    #[tokio::test]
    async fn test_stalled_write_times_out_and_closes() {
        let (conn, outbox) = Connection::pair(4);
        let stalled = Box::pin(futures_util::sink::unfold((), |(), _frame: Message| {
            std::future::pending::<std::result::Result<(), &'static str>>()
        }));
        let writer = tokio::spawn(write_loop(
            stalled,
            outbox,
            conn.inner.closed.clone(),
            Some(Duration::from_millis(50)),
            conn.id(),
        ));

        conn.send(&RoomMessage::new("room1", "never written")).unwrap();
        timeout(Duration::from_secs(1), conn.closed())
            .await
            .expect("a write past its deadline should close the connection");
        timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_abandons_blocked_write() {
        let (conn, outbox) = Connection::pair(4);
        let stalled = Box::pin(futures_util::sink::unfold((), |(), _frame: Message| {
            std::future::pending::<std::result::Result<(), &'static str>>()
        }));
        let writer = tokio::spawn(write_loop(
            stalled,
            outbox,
            conn.inner.closed.clone(),
            None,
            conn.id(),
        ));

        conn.send(&RoomMessage::new("room1", "stuck")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.close();
        // The close handshake cannot flush either, so the writer gives up
        // after the grace period.
        timeout(CLOSE_GRACE * 3, writer)
            .await
            .expect("close should end a writer stuck mid-write")
            .unwrap();
    }

    #[tokio::test]
    async fn test_writer_stops_on_close() {
        let (conn, outbox) = Connection::pair(4);
        let sink = futures_util::sink::drain::<Message>();
        let writer = tokio::spawn(write_loop(
            sink,
            outbox,
            conn.inner.closed.clone(),
            None,
            conn.id(),
        ));

        conn.send(&RoomMessage::new("room1", "fine")).unwrap();
        conn.close();
        timeout(Duration::from_secs(1), writer).await.unwrap().unwrap();
    }
}
