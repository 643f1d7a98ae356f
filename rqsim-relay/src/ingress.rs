//! Per-connection ingress: upgrade, read, register, dispatch.
//!
//! ```text
//! Connecting ──upgrade ok──► Open ──receive ok──► Open (register + dispatch)
//!     │                        │
//!     └─handshake error        └─read error / close() ──► Closed (unregister + close)
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::connection::{self, Connection, ConnectionConfig};
use crate::dispatcher::DispatchSender;
use crate::error::Result;
use crate::protocol::Envelope;
use crate::registry::Registry;

/// How a connection's room membership follows the codes it sends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RoomPolicy {
    /// Every code a connection sends under adds a membership.
    #[default]
    Additive,
    /// A new code replaces the connection's previous memberships.
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressState {
    Connecting,
    Open,
    Closed,
}

/// Shared collaborators handed to each ingress task.
#[derive(Clone)]
pub struct IngressContext {
    pub registry: Registry,
    pub dispatcher: DispatchSender,
    pub connection_config: ConnectionConfig,
    pub room_policy: RoomPolicy,
}

/// Upgrade `stream` and relay its messages until the connection closes.
///
/// Only a handshake failure is returned; read failures end the connection
/// and are logged here.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: IngressContext,
) -> Result<()> {
    let mut state = IngressState::Connecting;
    log::debug!("{peer_addr}: {state:?}");

    let (conn, mut inbound) = connection::upgrade(stream, peer_addr, &ctx.connection_config).await?;
    state = IngressState::Open;
    log::info!("Client connected from {peer_addr} ({})", conn.id());
    log::debug!("{peer_addr}: {state:?}");

    let mut session = Session::new(conn.clone(), ctx.registry.clone(), ctx.room_policy);
    let closed = conn.closed();
    tokio::pin!(closed);

    loop {
        let msg = tokio::select! {
            biased;
            _ = &mut closed => {
                log::debug!("Connection {} closed by relay", conn.id());
                break;
            }
            received = inbound.receive() => match received {
                Ok(msg) => msg,
                Err(e) => {
                    log::info!("{e}");
                    break;
                }
            },
        };

        session.join(&msg.code).await;
        if ctx
            .dispatcher
            .dispatch(Envelope::new(msg, conn.id()))
            .await
            .is_err()
        {
            log::warn!("Dispatcher closed; dropping connection {}", conn.id());
            break;
        }
    }

    session.leave_all().await;
    conn.close();
    state = IngressState::Closed;
    log::info!("Client disconnected from {peer_addr} ({})", conn.id());
    log::debug!("{peer_addr}: {state:?}");
    Ok(())
}

/// Room bookkeeping for one open connection.
struct Session {
    conn: Connection,
    registry: Registry,
    policy: RoomPolicy,
    rooms: HashSet<String>,
}

impl Session {
    fn new(conn: Connection, registry: Registry, policy: RoomPolicy) -> Self {
        Self {
            conn,
            registry,
            policy,
            rooms: HashSet::new(),
        }
    }

    async fn join(&mut self, room: &str) {
        if self.rooms.contains(room) {
            return;
        }
        if self.policy == RoomPolicy::Exclusive {
            self.leave_all().await;
        }
        if self.registry.register(room, &self.conn).await {
            log::debug!("Connection {} joined room {room:?}", self.conn.id());
        }
        self.rooms.insert(room.to_string());
    }

    async fn leave_all(&mut self) {
        for room in self.rooms.drain() {
            if self.registry.unregister(&room, self.conn.id()).await {
                log::debug!("Connection {} left room {room:?}", self.conn.id());
            }
        }
    }
}
