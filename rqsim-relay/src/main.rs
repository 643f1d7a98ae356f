use std::time::Duration;

use clap::Parser;
use log::info;
use rqsim_relay::broadcast::BroadcastConfig;
use rqsim_relay::connection::ConnectionConfig;
use rqsim_relay::ingress::RoomPolicy;
use rqsim_relay::{RelayServer, ServerConfig};

/// Room-based WebSocket relay for RQSimulator2D.
#[derive(Debug, Parser)]
#[command(name = "rqsim-relay", version, about)]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Interface to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// WebSocket endpoint path
    #[arg(long, default_value = "/ws")]
    path: String,

    /// Drop connections that stay silent this long
    #[arg(long)]
    read_timeout_secs: Option<u64>,

    /// Drop connections that take this long to accept a frame
    #[arg(long)]
    write_timeout_secs: Option<u64>,

    /// Abort upgrades that take longer than this
    #[arg(long)]
    handshake_timeout_secs: Option<u64>,

    /// Bound the dispatcher queue (unbounded when omitted)
    #[arg(long)]
    dispatch_capacity: Option<usize>,

    /// Frames buffered per connection before it is considered stalled
    #[arg(long, default_value_t = 256)]
    outbound_buffer: usize,

    /// A connection belongs only to the room of its latest message
    #[arg(long)]
    exclusive_rooms: bool,

    /// Do not send a message back to its sender
    #[arg(long)]
    no_echo: bool,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let secs = |s: Option<u64>| s.map(Duration::from_secs);
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            dispatch_capacity: self.dispatch_capacity,
            connection: ConnectionConfig {
                path: self.path,
                outbound_buffer: self.outbound_buffer,
                handshake_timeout: secs(self.handshake_timeout_secs),
                read_timeout: secs(self.read_timeout_secs),
                write_timeout: secs(self.write_timeout_secs),
            },
            broadcast: BroadcastConfig {
                echo_to_sender: !self.no_echo,
            },
            room_policy: if self.exclusive_rooms {
                RoomPolicy::Exclusive
            } else {
                RoomPolicy::Additive
            },
        }
    }
}

fn banner() {
    info!("========== RQSimulator2D Websockets Server ==========");
    info!("(c)2021 by Akhil Datla and Coach Chan");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let port = args.port;
    banner();

    let server = RelayServer::new(args.into_config());
    info!("http server started on port {port}");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
