//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──► ingress A ──┐                          ┌──► Client A
//!                          ├──► Dispatcher ──► Broadcast Loop ──┤
//! Client B ──► ingress B ──┘        ▲              │             └──► Client B
//!                  │                 │              │ evict on write failure
//!                  └──── register ──► Registry ◄────┘
//! ```
//!
//! One task per accepted connection, one broadcast task, one writer task
//! per connection.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;

use crate::broadcast::{BroadcastConfig, BroadcastLoop, BroadcastStats};
use crate::connection::ConnectionConfig;
use crate::dispatcher;
use crate::error::{RelayError, Result};
use crate::ingress::{self, IngressContext, RoomPolicy};
use crate::registry::Registry;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Dispatcher queue capacity (None = unbounded)
    pub dispatch_capacity: Option<usize>,
    /// Endpoint path, buffers and deadlines for each connection
    pub connection: ConnectionConfig,
    pub broadcast: BroadcastConfig,
    pub room_policy: RoomPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            dispatch_capacity: None,
            connection: ConnectionConfig::default(),
            broadcast: BroadcastConfig::default(),
            room_policy: RoomPolicy::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub handshake_failures: u64,
}

pub struct RelayServer {
    config: ServerConfig,
    registry: Registry,
    broadcaster: BroadcastLoop,
    stats: Arc<RwLock<ServerStats>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Registry::new();
        let broadcaster = BroadcastLoop::new(registry.clone(), config.broadcast.clone());
        Self {
            config,
            registry,
            broadcaster,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections accepted from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        log::info!(
            "Relay listening on ws://{local_addr}{}",
            self.config.connection.path
        );

        let (dispatch_tx, dispatch_rx) = dispatcher::channel(self.config.dispatch_capacity);
        let broadcaster = self.broadcaster.clone();
        tokio::spawn(async move { broadcaster.run(dispatch_rx).await });

        let ctx = IngressContext {
            registry: self.registry.clone(),
            dispatcher: dispatch_tx,
            connection_config: self.config.connection.clone(),
            room_policy: self.config.room_policy,
        };

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = ctx.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move { Self::track_connection(stream, addr, ctx, stats).await });
        }
    }

    async fn track_connection(
        stream: tokio::net::TcpStream,
        addr: SocketAddr,
        ctx: IngressContext,
        stats: Arc<RwLock<ServerStats>>,
    ) {
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = ingress::handle_connection(stream, addr, ctx).await;

        let mut s = stats.write().await;
        s.active_connections -= 1;
        match result {
            Ok(()) => {}
            Err(e @ RelayError::Handshake(_)) => {
                s.handshake_failures += 1;
                log::warn!("Rejected connection from {addr}: {e}");
            }
            Err(e) => log::error!("Connection error from {addr}: {e}"),
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Shared handle to the stats, usable after the server is moved into a task.
    pub fn stats_handle(&self) -> Arc<RwLock<ServerStats>> {
        self.stats.clone()
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcaster.stats()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert!(config.dispatch_capacity.is_none());
        assert_eq!(config.connection.path, "/ws");
        assert!(config.broadcast.echo_to_sender);
        assert_eq!(config.room_policy, RoomPolicy::Additive);
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:9000".to_string(),
            dispatch_capacity: Some(1024),
            connection: ConnectionConfig {
                read_timeout: Some(Duration::from_secs(60)),
                ..ConnectionConfig::default()
            },
            broadcast: BroadcastConfig {
                echo_to_sender: false,
            },
            room_policy: RoomPolicy::Exclusive,
        };
        let server = RelayServer::new(config);
        assert_eq!(server.bind_addr(), "127.0.0.1:9000");
        assert_eq!(server.config().dispatch_capacity, Some(1024));
        assert!(!server.config().broadcast.echo_to_sender);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RelayServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.handshake_failures, 0);
        assert_eq!(server.broadcast_stats(), BroadcastStats::default());
        assert_eq!(server.registry().room_count().await, 0);
    }

    #[tokio::test]
    async fn test_run_fails_on_bad_bind_addr() {
        let server = RelayServer::new(ServerConfig {
            bind_addr: "not-an-address".to_string(),
            ..ServerConfig::default()
        });
        assert!(matches!(server.run().await, Err(RelayError::Io(_))));
    }
}
