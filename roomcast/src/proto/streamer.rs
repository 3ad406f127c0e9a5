//! Fan-out hub: owns every client session and routes chunks from the
//! pipeline to the data channels of all clients at the current rate.
//!
//! Ownership is strictly one-way. The streamer owns command and streaming
//! sessions; sessions refer to their counterpart connection by id and any
//! back-reference goes through the owner's maps, never through a stored
//! pointer.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::audio::chunk::Chunk;
use crate::conn::connection::{ConnId, Link};
use crate::encoder::{EncoderBuilder, Format};
use crate::pipeline::{Consumer, PipelineError};
use crate::proto::command_session::{CommandSession, SessionState, StreamDirections};
use crate::proto::streaming_session::StreamingSession;
use crate::util::writer::{WriteError, WriteNotify};

/// Stream-wide settings the streamer needs to negotiate clients.
#[derive(Debug, Clone)]
pub struct StreamerSettings {
    pub http_port: u16,
    pub format: Format,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub bits_per_value: u16,
    pub gain: Option<u8>,
}

/// Produces the completion hook wired into a data connection's writers, so
/// transfer completions come back through the engine's event loop.
pub type NotifyFactory = std::sync::Arc<dyn Fn(ConnId) -> WriteNotify + Send + Sync>;

pub struct Streamer<L: Link + Clone + 'static> {
    settings: StreamerSettings,
    builder: EncoderBuilder,
    notify_factory: NotifyFactory,
    command_sessions: HashMap<ConnId, CommandSession<L>>,
    streaming_sessions: HashMap<ConnId, StreamingSession<L>>,
    /// Data connections whose HTTP request has not arrived yet.
    pending_data: HashMap<ConnId, L>,
    running: bool,
    /// Whether a stream is in progress (first non-EOS chunk seen).
    streaming: bool,
    current_rate: u32,
    dropped_chunks: u64,
}

impl<L: Link + Clone + 'static> Streamer<L> {
    pub fn new(settings: StreamerSettings, notify_factory: NotifyFactory) -> Self {
        let builder = EncoderBuilder::for_format(settings.format);
        Self {
            settings,
            builder,
            notify_factory,
            command_sessions: HashMap::new(),
            streaming_sessions: HashMap::new(),
            pending_data: HashMap::new(),
            running: false,
            streaming: false,
            current_rate: 0,
            dropped_chunks: 0,
        }
    }

    pub fn current_rate(&self) -> u32 {
        self.current_rate
    }

    pub fn command_session_count(&self) -> usize {
        self.command_sessions.len()
    }

    pub fn streaming_session_count(&self) -> usize {
        self.streaming_sessions.len()
    }

    // --- control channel events -----------------------------------------

    pub fn on_command_open(&mut self, link: L) {
        let conn = link.id();
        let directions = StreamDirections {
            format: self.settings.format,
            bits_per_sample: self.settings.bits_per_sample,
            http_port: self.settings.http_port,
        };
        let mut session = CommandSession::new(link, directions, self.settings.gain);

        if self.streaming {
            // The start command itself goes out only after HELO.
            let _ = session.start_stream(self.current_rate);
        }

        self.command_sessions.insert(conn, session);
    }

    pub fn on_command_data(&mut self, conn: ConnId, bytes: &[u8], received_at: Instant) {
        let Some(session) = self.command_sessions.get_mut(&conn) else {
            return;
        };

        if let Err(e) = session.on_data(bytes, received_at) {
            warn!("Closing SlimProto session (conn={conn}): {e}");
            session.close();
        }
    }

    pub fn on_command_close(&mut self, conn: ConnId) {
        let Some(session) = self.command_sessions.remove(&conn) else {
            return;
        };

        // A client record dies with either of its sockets: take the data
        // channel down along with the control channel.
        if let Some(data_conn) = session.data_conn() {
            self.teardown_streaming_session(data_conn);
        }
        info!(
            "SlimProto session removed (conn={conn}, client={:?}, sessions={})",
            session.client_id(),
            self.command_sessions.len()
        );
    }

    // --- data channel events ---------------------------------------------

    pub fn on_stream_open(&mut self, link: L) {
        self.pending_data.insert(link.id(), link);
    }

    pub fn on_stream_data(&mut self, conn: ConnId, bytes: &[u8]) {
        let Some(link) = self.pending_data.remove(&conn) else {
            // Only the opening request is expected on the data socket.
            debug!("Ignoring data on an established HTTP connection (conn={conn})");
            return;
        };

        let rate = if self.current_rate != 0 {
            self.current_rate
        } else {
            warn!("Data connection arrived before any stream (conn={conn})");
            link.request_stop();
            return;
        };

        let notify = (self.notify_factory)(conn);
        let session = match StreamingSession::new(
            link.clone(),
            bytes,
            &self.builder,
            self.settings.channels,
            rate,
            self.settings.bits_per_sample,
            self.settings.bits_per_value,
            notify,
        ) {
            Ok(session) => session,
            Err(e) => {
                warn!("Rejecting HTTP request (conn={conn}): {e}");
                link.request_stop();
                return;
            }
        };

        // Bind the data connection to its client record.
        let client_id = session.client_id().to_string();
        match self.command_session_by_client(&client_id) {
            Some(command_conn) => {
                if let Some(command) = self.command_sessions.get_mut(&command_conn) {
                    command.attach_data_session(conn);
                }
            }
            None => {
                warn!("No SlimProto session for data connection (client={client_id})");
            }
        }

        self.streaming_sessions.insert(conn, session);
    }

    pub fn on_stream_close(&mut self, conn: ConnId) {
        self.pending_data.remove(&conn);
        if self.streaming_sessions.remove(&conn).is_some() {
            self.detach_by_data_conn(conn);
            debug!(
                "HTTP session removed (conn={conn}, sessions={})",
                self.streaming_sessions.len()
            );
        }
    }

    /// Transfer completion from a data connection's writer task.
    pub fn on_write_done(&mut self, conn: ConnId, result: Result<usize, WriteError>) {
        let Some(session) = self.streaming_sessions.get_mut(&conn) else {
            return;
        };
        if let Err(e) = session.on_write_done(result) {
            warn!("Error while transferring data (conn={conn}): {e}");
            self.teardown_streaming_session(conn);
        }
    }

    /// Periodic timer tick: ping every streaming client.
    pub fn on_ping_tick(&mut self) {
        let mut failed = Vec::new();
        for (conn, session) in self.command_sessions.iter_mut() {
            if session.ping().is_err() {
                failed.push(*conn);
            }
        }
        for conn in failed {
            if let Some(session) = self.command_sessions.get_mut(&conn) {
                warn!("Ping failed; closing SlimProto session (conn={conn})");
                session.close();
            }
        }
    }

    // --- internals --------------------------------------------------------

    fn command_session_by_client(&self, client_id: &str) -> Option<ConnId> {
        self.command_sessions
            .iter()
            .find(|(_, session)| session.client_id() == Some(client_id))
            .map(|(conn, _)| *conn)
    }

    fn detach_by_data_conn(&mut self, data_conn: ConnId) {
        for session in self.command_sessions.values_mut() {
            if session.data_conn() == Some(data_conn) {
                session.detach_data_session();
            }
        }
    }

    fn teardown_streaming_session(&mut self, conn: ConnId) {
        if let Some(mut session) = self.streaming_sessions.remove(&conn) {
            session.stop(Box::new(|| {}));
        }
        self.detach_by_data_conn(conn);
    }

    /// Renegotiate every client onto `rate`: `strm(stop)` then
    /// `strm(start)` on the control channel, with the old data connection
    /// dropped so the client reconnects. Chunks for that client are dropped
    /// until the new data channel links up.
    fn negotiate_rate(&mut self, rate: u32) {
        self.current_rate = rate;
        self.streaming = true;

        let mut stale_data_conns = Vec::new();
        for session in self.command_sessions.values_mut() {
            let already_current =
                session.state() == SessionState::Streaming && session.sampling_rate() == rate;
            if already_current {
                continue;
            }

            if session.state() == SessionState::Streaming {
                if let Err(e) = session.stop_stream() {
                    warn!("Could not stop stream during rate change: {e}");
                }
                if let Some(data_conn) = session.data_conn() {
                    stale_data_conns.push(data_conn);
                }
            }
            if let Err(e) = session.start_stream(rate) {
                warn!("Could not start stream at {rate} Hz: {e}");
            }
        }

        for data_conn in stale_data_conns {
            self.teardown_streaming_session(data_conn);
        }
    }

    fn end_of_stream(&mut self) {
        if !self.streaming {
            return;
        }
        info!("End of stream");

        let data_conns: Vec<ConnId> = self.streaming_sessions.keys().copied().collect();
        for conn in data_conns {
            self.teardown_streaming_session(conn);
        }
        for session in self.command_sessions.values_mut() {
            let _ = session.stop_stream();
        }

        self.streaming = false;
        self.current_rate = 0;
    }
}

impl<L: Link + Clone + 'static> Consumer for Streamer<L> {
    fn start(&mut self) {
        self.running = true;
    }

    /// Stop every session, encoder before socket per session, command
    /// channels last, then report completion.
    fn stop(&mut self, on_done: Box<dyn FnOnce() + Send>) {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::{Arc, Mutex};

        self.running = false;

        let mut sessions: Vec<StreamingSession<L>> =
            self.streaming_sessions.drain().map(|(_, s)| s).collect();
        let total = sessions.len();

        let finish = {
            let mut command_sessions = std::mem::take(&mut self.command_sessions);
            move || {
                for session in command_sessions.values_mut() {
                    let _ = session.stop_stream();
                    session.close();
                }
                on_done();
            }
        };

        if total == 0 {
            finish();
            return;
        }

        let remaining = Arc::new(AtomicUsize::new(total));
        let finish = Arc::new(Mutex::new(Some(Box::new(finish) as Box<dyn FnOnce() + Send>)));
        for session in sessions.iter_mut() {
            let remaining = Arc::clone(&remaining);
            let finish = Arc::clone(&finish);
            session.stop(Box::new(move || {
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    if let Some(callback) = finish.lock().unwrap().take() {
                        callback();
                    }
                }
            }));
        }
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn sampling_rate(&self) -> u32 {
        self.current_rate
    }

    fn consume(&mut self, chunk: &mut Chunk) -> Result<bool, PipelineError> {
        let rate = chunk.sampling_rate();

        if rate == 0 {
            self.end_of_stream();
            return Ok(true);
        }

        if !self.streaming || self.current_rate != rate {
            self.negotiate_rate(rate);
        }

        // Fan out to every linked session at this rate. Sessions apply their
        // own back-pressure; a failing encoder is fatal for its session only.
        let linked: Vec<ConnId> = self
            .command_sessions
            .values()
            .filter(|session| session.is_linked())
            .filter_map(|session| session.data_conn())
            .collect();

        let mut failed = Vec::new();
        for conn in linked {
            if let Some(session) = self.streaming_sessions.get_mut(&conn) {
                if let Err(e) = session.on_chunk(chunk) {
                    warn!("Encoder failure; stopping session (conn={conn}): {e}");
                    failed.push(conn);
                }
            } else {
                self.dropped_chunks += 1;
            }
        }
        for conn in failed {
            self.teardown_streaming_session(conn);
        }

        Ok(true)
    }
}
