//! UDP discovery responder.
//!
//! Squeezebox firmware locates its server by broadcasting a small probe;
//! replying with an identifier packet is enough for the device to connect
//! to the SlimProto port. A trivial satellite of the core: no session
//! state, one task.

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::{PRODUCT, VERSION};

pub struct DiscoveryServer {
    port: u16,
}

pub struct DiscoveryHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DiscoveryHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

impl DiscoveryServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub fn start(self) -> DiscoveryHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.serve(shutdown_rx));
        DiscoveryHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        let socket = match UdpSocket::bind(("0.0.0.0", self.port)).await {
            Ok(socket) => socket,
            Err(e) => {
                error!("Cannot bind discovery server to port {}: {e}", self.port);
                return;
            }
        };

        info!(
            "Discovery server started (port={}, address={})",
            self.port,
            server_address()
        );

        let reply = discovery_reply();
        let mut buf = [0u8; 128];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((size, peer)) => {
                        if size > 0 && is_probe(&buf[..size]) {
                            debug!("Discovery probe from {peer}");
                            let _ = socket.send_to(&reply, peer).await;
                        }
                    }
                    Err(e) => {
                        error!("Discovery receive failed: {e}");
                        break;
                    }
                },
            }
        }

        info!("Discovery server was stopped (port={})", self.port);
    }
}

/// Probes start with 'e' (TLV discovery) or 'd' (legacy discovery).
fn is_probe(data: &[u8]) -> bool {
    matches!(data[0], b'e' | b'd')
}

/// Identifier packet: reply marker followed by the product name and version.
fn discovery_reply() -> Vec<u8> {
    let mut reply = Vec::with_capacity(32);
    reply.push(b'E');
    reply.extend_from_slice(PRODUCT.as_bytes());
    reply.push(b' ');
    reply.extend_from_slice(VERSION.as_bytes());
    reply.push(0);
    reply
}

/// First non-loopback interface address, for the startup log.
fn server_address() -> String {
    match if_addrs::get_if_addrs() {
        Ok(addrs) => addrs
            .into_iter()
            .find(|addr| !addr.is_loopback())
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string()),
        Err(_) => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_detection() {
        assert!(is_probe(b"eIPAD\0"));
        assert!(is_probe(b"d"));
        assert!(!is_probe(b"x"));
    }

    #[test]
    fn test_reply_identifies_product() {
        let reply = discovery_reply();
        assert_eq!(reply[0], b'E');
        assert!(reply.ends_with(&[0]));
        let text = String::from_utf8_lossy(&reply[1..reply.len() - 1]).to_string();
        assert!(text.starts_with(PRODUCT));
    }
}
