//! Per-client SlimProto control channel.
//!
//! Drives the handshake state machine: a fresh session accepts nothing but
//! `HELO`; the HELO reply sequence negotiates the device, and `strm`
//! commands steer the client's data connection. Periodic `strm(time)` pings
//! correlated with STAT echoes produce one-way-delay samples.

use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::conn::connection::{ConnId, Link};
use crate::encoder::Format;
use crate::proto::wire::{self, DeviceId, Stat};
use crate::proto::ProtoError;
use crate::util::timestamp::TimestampCache;

/// Cap on accumulated, not-yet-parseable command bytes.
const MAX_COMMAND_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket open; only HELO is acceptable.
    Accepted,
    /// HELO parsed, handshake replies being emitted.
    HeloSeen,
    /// Handshake done, awaiting a stream start.
    Negotiated,
    /// Stream directed at the client; pings are flowing.
    Streaming,
    /// Socket closed; terminal.
    Closing,
}

/// Stream parameters the session needs to direct a client at the data port.
#[derive(Debug, Clone, Copy)]
pub struct StreamDirections {
    pub format: Format,
    pub bits_per_sample: u16,
    pub http_port: u16,
}

pub struct CommandSession<L: Link> {
    link: L,
    state: SessionState,
    directions: StreamDirections,
    gain: Option<u8>,
    client_id: Option<String>,
    /// Name reported by the device in its SETD reply.
    player_name: Option<String>,
    buffer: Vec<u8>,
    /// Whether a stream is in progress as far as this client is concerned.
    streaming: bool,
    sampling_rate: u32,
    data_conn: Option<ConnId>,
    connected_received: bool,
    response_received: bool,
    ping_cache: TimestampCache,
    last_ping_at: Option<Instant>,
    latency: Option<Duration>,
    last_stat: Option<Stat>,
}

impl<L: Link> CommandSession<L> {
    pub fn new(link: L, directions: StreamDirections, gain: Option<u8>) -> Self {
        debug!("SlimProto session object was created (conn={})", link.id());
        Self {
            link,
            state: SessionState::Accepted,
            directions,
            gain,
            client_id: None,
            player_name: None,
            buffer: Vec::new(),
            streaming: false,
            sampling_rate: 0,
            data_conn: None,
            connected_received: false,
            response_received: false,
            ping_cache: TimestampCache::new(),
            last_ping_at: None,
            latency: None,
            last_stat: None,
        }
    }

    pub fn conn(&self) -> ConnId {
        self.link.id()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn player_name(&self) -> Option<&str> {
        self.player_name.as_deref()
    }

    pub fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }

    pub fn data_conn(&self) -> Option<ConnId> {
        self.data_conn
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn last_stat(&self) -> Option<&Stat> {
        self.last_stat.as_ref()
    }

    /// The data channel counts as linked only once the client has both
    /// connected its data socket (STMc) and parsed our HTTP response (RESP).
    /// Until then chunks may exist but are not routed to this client.
    pub fn is_linked(&self) -> bool {
        self.data_conn.is_some() && self.connected_received && self.response_received
    }

    /// Feed received control bytes. Frames accumulate until complete; each
    /// complete frame is dispatched in arrival order. A protocol error means
    /// this session must be closed.
    pub fn on_data(&mut self, bytes: &[u8], received_at: Instant) -> Result<(), ProtoError> {
        if self.buffer.len() + bytes.len() > MAX_COMMAND_BUFFER {
            return Err(ProtoError::BufferOverflow);
        }
        self.buffer.extend_from_slice(bytes);

        loop {
            let (opcode, payload, consumed) = match wire::parse_frame(&self.buffer)? {
                Some((consumed, frame)) => (frame.opcode, frame.payload.to_vec(), consumed),
                None => break,
            };
            self.dispatch(opcode, &payload, received_at)?;
            self.buffer.drain(..consumed);
        }

        Ok(())
    }

    fn dispatch(
        &mut self,
        opcode: [u8; 4],
        payload: &[u8],
        received_at: Instant,
    ) -> Result<(), ProtoError> {
        if &opcode != b"HELO" && self.client_id.is_none() {
            return Err(ProtoError::MissingHelo);
        }

        match &opcode {
            b"HELO" => self.on_helo(payload),
            b"STAT" => self.on_stat(payload, received_at),
            b"RESP" => {
                debug!("RESP command received (client={:?})", self.client_id);
                self.response_received = true;
                Ok(())
            }
            b"DSCO" => {
                let reason = wire::parse_dsco(payload)?;
                debug!(
                    "DSCO command received (client={:?}, reason={reason:?})",
                    self.client_id
                );
                // The client lost its data connection; the linked state must
                // be re-earned once it reconnects.
                self.detach_data_session();
                Ok(())
            }
            b"SETD" => {
                let (id, value) = wire::parse_setd(payload)?;
                debug!(
                    "SETD command received (client={:?}, id={id}, value={value})",
                    self.client_id
                );
                if id == DeviceId::RequestName as u8 && !value.is_empty() {
                    self.player_name = Some(value);
                }
                Ok(())
            }
            other => {
                debug!(
                    "Unsupported SlimProto command received (header='{}')",
                    String::from_utf8_lossy(other)
                );
                Ok(())
            }
        }
    }

    fn on_helo(&mut self, payload: &[u8]) -> Result<(), ProtoError> {
        let helo = wire::parse_helo(payload)?;
        let client_id = helo.client_id();
        info!("HELO command received (client={client_id})");

        self.client_id = Some(client_id);
        self.state = SessionState::HeloSeen;

        self.send(&wire::strm_stop())?;
        self.send(&wire::setd(DeviceId::RequestName))?;
        self.send(&wire::setd(DeviceId::Squeezebox3))?;
        self.send(&wire::aude(true, true))?;
        self.send(&wire::audg(self.gain))?;

        if self.streaming {
            self.send_stream_start()?;
            self.state = SessionState::Streaming;
        } else {
            self.state = SessionState::Negotiated;
        }

        Ok(())
    }

    fn on_stat(&mut self, payload: &[u8], received_at: Instant) -> Result<(), ProtoError> {
        let stat = wire::parse_stat(payload)?;
        let event = stat.event_str();

        if event == "STMc" {
            debug!("STMc command received (client={:?})", self.client_id);
            self.connected_received = true;
        } else {
            debug!("{event} command received (client={:?})", self.client_id);
        }

        if stat.server_timestamp != 0 {
            if let Some(sent_at) = self.ping_cache.find(stat.server_timestamp) {
                // Round trip halved: a one-way-delay estimate for this client.
                self.latency = Some(received_at.saturating_duration_since(sent_at) / 2);
                self.ping_cache.erase(stat.server_timestamp);
            }
        }

        self.last_stat = Some(stat);
        Ok(())
    }

    /// Direct the client at the stream. The start command goes out right
    /// away when the handshake already happened, otherwise it is emitted by
    /// the HELO handler.
    pub fn start_stream(&mut self, sampling_rate: u32) -> Result<(), ProtoError> {
        self.streaming = true;
        self.sampling_rate = sampling_rate;

        if self.client_id.is_some() {
            self.send_stream_start()?;
            self.state = SessionState::Streaming;
        }
        Ok(())
    }

    pub fn stop_stream(&mut self) -> Result<(), ProtoError> {
        self.streaming = false;
        if self.client_id.is_some() {
            self.send(&wire::strm_stop())?;
        }
        if self.state == SessionState::Streaming {
            self.state = SessionState::Negotiated;
        }
        Ok(())
    }

    fn send_stream_start(&mut self) -> Result<(), ProtoError> {
        let client_id = self.client_id.as_deref().unwrap_or_default().to_string();
        let command = wire::strm_start(
            self.directions.format,
            self.directions.bits_per_sample,
            self.directions.http_port,
            self.sampling_rate,
            &client_id,
        );
        self.send(&command)
    }

    /// Send a `strm(time)` ping. The timestamp is committed immediately
    /// before the send, which itself completes partial writes in a loop, and
    /// is discarded when the send fails.
    pub fn ping(&mut self) -> Result<(), ProtoError> {
        if self.state != SessionState::Streaming {
            return Ok(());
        }

        let key = self.ping_cache.create(Instant::now());
        let command = wire::strm_time(key);

        let stamp = Instant::now();
        self.ping_cache.update(key, stamp);
        match self.link.send(&command) {
            Ok(_) => {
                self.last_ping_at = Some(stamp);
                Ok(())
            }
            Err(e) => {
                self.ping_cache.erase(key);
                Err(e.into())
            }
        }
    }

    pub fn attach_data_session(&mut self, conn: ConnId) {
        self.data_conn = Some(conn);
    }

    /// Forget the data connection; the linked state must be re-earned by a
    /// fresh STMc/RESP pair after the client reconnects.
    pub fn detach_data_session(&mut self) {
        self.data_conn = None;
        self.connected_received = false;
        self.response_received = false;
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closing;
        self.link.request_stop();
    }

    fn send(&self, command: &[u8]) -> Result<(), ProtoError> {
        self.link.send(command)?;
        Ok(())
    }
}

impl<L: Link> Drop for CommandSession<L> {
    fn drop(&mut self) {
        debug!("SlimProto session object was deleted (conn={})", self.link.id());
    }
}
