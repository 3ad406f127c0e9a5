//! TCP accept loop.
//!
//! The server owns its live connections and re-arms the acceptor after each
//! open until the configured connection cap is reached; at the cap the
//! listener is torn down entirely and re-created only after the next close,
//! which bounds the outstanding-SYN count.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::net::TcpListener;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::conn::connection::{ConnId, ConnectionHandle, Link};
use crate::conn::{ConnectionEvent, EventSink};

pub struct TcpServer {
    label: &'static str,
    port: u16,
    max_connections: usize,
    no_delay: bool,
    sink: EventSink,
}

pub struct ServerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting and close every live connection.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

impl TcpServer {
    pub fn new(
        label: &'static str,
        port: u16,
        max_connections: usize,
        no_delay: bool,
        sink: EventSink,
    ) -> Self {
        Self {
            label,
            port,
            max_connections,
            no_delay,
            sink,
        }
    }

    pub fn start(self) -> ServerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.accept_loop(shutdown_rx));
        ServerHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn accept_loop(self, mut shutdown: watch::Receiver<bool>) {
        let connections: Arc<Mutex<HashMap<ConnId, ConnectionHandle>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let closed_notify = Arc::new(Notify::new());

        let mut listener = match self.bind().await {
            Some(listener) => Some(listener),
            None => return,
        };

        info!(
            "TCP server started ({}, port={}, max connections={})",
            self.label, self.port, self.max_connections
        );

        loop {
            let Some(active_listener) = listener.as_ref() else {
                // Acceptor was torn down at the cap; it is re-created only
                // after the next close frees a slot.
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = closed_notify.notified() => {
                        if connections.lock().unwrap().len() < self.max_connections {
                            listener = self.bind().await;
                            if listener.is_some() {
                                info!("Acceptor was re-created ({}, port={})", self.label, self.port);
                            }
                        }
                    }
                }
                continue;
            };

            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = active_listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let (handle, ops_rx) = ConnectionHandle::accept(stream, self.no_delay);
                        let conn = handle.id();
                        let total = {
                            let mut registry = connections.lock().unwrap();
                            registry.insert(conn, handle.clone());
                            registry.len()
                        };

                        handle.start(ops_rx, peer, Arc::clone(&self.sink), {
                            let registry = Arc::clone(&connections);
                            let notify = Arc::clone(&closed_notify);
                            move |conn_id: ConnId| {
                                registry.lock().unwrap().remove(&conn_id);
                                notify.notify_one();
                            }
                        });

                        info!(
                            "New connection was added ({}, conn={}, connections={})",
                            self.label, conn, total
                        );

                        if total >= self.max_connections {
                            warn!(
                                "Limit of active connections was reached ({}, max={})",
                                self.label, self.max_connections
                            );
                            listener = None;
                        }
                    }
                    Err(e) => warn!("Accept failed ({}): {e}", self.label),
                },
            }
        }

        // Closing active connections; each removal is reported through the
        // regular close events.
        let handles: Vec<ConnectionHandle> = connections.lock().unwrap().values().cloned().collect();
        for handle in handles {
            handle.request_stop();
        }
        info!("TCP server was stopped ({}, port={})", self.label, self.port);
    }

    async fn bind(&self) -> Option<TcpListener> {
        match TcpListener::bind(("0.0.0.0", self.port)).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                error!("Cannot bind {} server to port {}: {e}", self.label, self.port);
                None
            }
        }
    }
}
