//! One accepted TCP connection: a reader task feeding events to the engine
//! and a writer task draining queued buffers. Sessions talk to the socket
//! through the [`Link`] trait, which keeps the protocol layer testable
//! without sockets.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::conn::{ConnectionEvent, EventSink};
use crate::util::writer::{OpSink, WriteDone, WriteError};

pub type ConnId = u64;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Read buffer size for the per-connection receive loop.
const READ_BUFFER_SIZE: usize = 1024;

/// Bound on consecutive would-block retries for synchronous sends; control
/// commands are tiny, so hitting this means the peer stopped reading.
const MAX_SEND_SPINS: usize = 10_000;

pub enum WriteOp {
    Write { buf: Vec<u8>, done: WriteDone },
    /// Close the socket once every previously queued write has drained.
    Shutdown,
}

/// Socket capability surface used by sessions. Production links wrap a TCP
/// connection; tests substitute an in-memory recorder.
pub trait Link: Send {
    fn id(&self) -> ConnId;

    /// Synchronous best-effort send; partial writes are completed in a loop
    /// before the call returns.
    fn send(&self, data: &[u8]) -> Result<usize, WriteError>;

    /// Queue an owned buffer on the connection's writer task.
    fn enqueue(&self, op: WriteOp);

    /// Request a close after queued writes have drained.
    fn request_stop(&self);

    fn is_open(&self) -> bool;
}

/// [`OpSink`] adapter feeding a link's writer task; buffered writers sit on
/// top of this.
pub struct LinkSink<L: Link> {
    link: L,
}

impl<L: Link> LinkSink<L> {
    pub fn new(link: L) -> Self {
        Self { link }
    }
}

impl<L: Link> OpSink for LinkSink<L> {
    fn submit(&mut self, buf: Vec<u8>, done: WriteDone) {
        self.link.enqueue(WriteOp::Write { buf, done });
    }
}

#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnId,
    stream: Arc<TcpStream>,
    ops: mpsc::UnboundedSender<WriteOp>,
    closed: Arc<AtomicBool>,
}

impl ConnectionHandle {
    /// Take ownership of an accepted socket and apply its options. No tasks
    /// run until [`start`](Self::start), so the caller can register the
    /// handle first.
    pub fn accept(stream: TcpStream, no_delay: bool) -> (Self, mpsc::UnboundedReceiver<WriteOp>) {
        let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = stream.set_nodelay(no_delay) {
            debug!("Could not set TCP_NODELAY (conn={id}): {e}");
        }
        enable_keep_alive(&stream);
        set_quick_ack(&stream);

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let handle = Self {
            id,
            stream: Arc::new(stream),
            ops: ops_tx,
            closed: Arc::new(AtomicBool::new(false)),
        };
        (handle, ops_rx)
    }

    /// Deliver the open event and spawn the reader and writer tasks. The
    /// open event goes out before the reader starts, so data can never
    /// precede it. `on_closed` runs once when the reader loop ends, before
    /// the close event is delivered.
    pub fn start(
        &self,
        ops_rx: mpsc::UnboundedReceiver<WriteOp>,
        peer: std::net::SocketAddr,
        sink: EventSink,
        on_closed: impl FnOnce(ConnId) + Send + 'static,
    ) {
        sink(ConnectionEvent::Open {
            conn: self.id,
            peer,
            handle: self.clone(),
        });

        tokio::spawn(writer_loop(Arc::clone(&self.stream), ops_rx));
        tokio::spawn(reader_loop(
            Arc::clone(&self.stream),
            self.id,
            Arc::clone(&self.closed),
            sink,
            self.ops.clone(),
            on_closed,
        ));
    }
}

impl Link for ConnectionHandle {
    fn id(&self) -> ConnId {
        self.id
    }

    fn send(&self, data: &[u8]) -> Result<usize, WriteError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WriteError::Closed);
        }

        let mut sent = 0;
        let mut spins = 0;
        while sent < data.len() {
            match self.stream.try_write(&data[sent..]) {
                Ok(0) => return Err(WriteError::Closed),
                Ok(n) => {
                    sent += n;
                    spins = 0;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    spins += 1;
                    if spins > MAX_SEND_SPINS {
                        return Err(WriteError::Io("send stalled".into()));
                    }
                    std::thread::yield_now();
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(sent)
    }

    fn enqueue(&self, op: WriteOp) {
        if let Err(mpsc::error::SendError(op)) = self.ops.send(op) {
            // Writer task is gone; complete the callback so pooled buffers
            // are not leaked into limbo.
            if let WriteOp::Write { buf, done } = op {
                done(Err(WriteError::Closed), buf);
            }
        }
    }

    fn request_stop(&self) {
        self.enqueue(WriteOp::Shutdown);
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}

async fn writer_loop(stream: Arc<TcpStream>, mut ops: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = ops.recv().await {
        match op {
            WriteOp::Write { buf, done } => {
                let result = write_all(&stream, &buf).await;
                done(result, buf);
            }
            WriteOp::Shutdown => {
                shutdown_socket(&stream);
                break;
            }
        }
    }
}

async fn write_all(stream: &TcpStream, buf: &[u8]) -> Result<usize, WriteError> {
    let mut written = 0;
    while written < buf.len() {
        stream
            .writable()
            .await
            .map_err(|e| WriteError::Io(e.to_string()))?;
        match stream.try_write(&buf[written..]) {
            Ok(0) => return Err(WriteError::Closed),
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(written)
}

async fn reader_loop(
    stream: Arc<TcpStream>,
    id: ConnId,
    closed: Arc<AtomicBool>,
    sink: EventSink,
    ops: mpsc::UnboundedSender<WriteOp>,
    on_closed: impl FnOnce(ConnId) + Send + 'static,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let error = loop {
        if let Err(e) = stream.readable().await {
            break Some(e.to_string());
        }
        match stream.try_read(&mut buf) {
            Ok(0) => break None,
            Ok(n) => {
                // Timestamp captured immediately at read completion.
                let received_at = Instant::now();
                sink(ConnectionEvent::Data {
                    conn: id,
                    bytes: buf[..n].to_vec(),
                    received_at,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => break Some(e.to_string()),
        }
    };

    closed.store(true, Ordering::Release);
    let _ = ops.send(WriteOp::Shutdown);
    on_closed(id);

    debug!("Connection was closed (conn={id}, error={error:?})");
    sink(ConnectionEvent::Close { conn: id, error });
}

#[cfg(unix)]
fn enable_keep_alive(stream: &TcpStream) {
    use std::os::unix::io::AsRawFd;
    let enable: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(unix))]
fn enable_keep_alive(_stream: &TcpStream) {}

#[cfg(target_os = "linux")]
fn set_quick_ack(stream: &TcpStream) {
    use std::os::unix::io::AsRawFd;
    let enable: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_QUICKACK,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn set_quick_ack(_stream: &TcpStream) {}

#[cfg(unix)]
fn shutdown_socket(stream: &TcpStream) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::shutdown(stream.as_raw_fd(), libc::SHUT_RDWR);
    }
}

#[cfg(not(unix))]
fn shutdown_socket(_stream: &TcpStream) {}
