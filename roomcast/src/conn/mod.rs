//! TCP server, per-connection plumbing and the UDP discovery responder.

pub mod connection;
pub mod discovery;
pub mod server;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

pub use connection::{ConnId, ConnectionHandle, Link, LinkSink, WriteOp};
pub use discovery::DiscoveryServer;
pub use server::{ServerHandle, TcpServer};

/// Events delivered from connection tasks to the engine's event loop. All
/// protocol state lives on that loop; connection tasks only read sockets and
/// report.
pub enum ConnectionEvent {
    Open {
        conn: ConnId,
        peer: SocketAddr,
        handle: ConnectionHandle,
    },
    Data {
        conn: ConnId,
        bytes: Vec<u8>,
        /// Monotonic timestamp taken immediately after the kernel delivered
        /// the bytes; feeds the ping latency math.
        received_at: Instant,
    },
    Close {
        conn: ConnId,
        error: Option<String>,
    },
}

/// Where a server delivers its connection events.
pub type EventSink = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;
