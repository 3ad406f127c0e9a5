//! Per-client HTTP data channel.
//!
//! A freshly opened data socket carries one GET request naming the client;
//! the session binds that client to an encoder and pushes encoded chunks
//! through a double-buffered writer, so a slow client drops chunks instead
//! of backing the pipeline up. Teardown drains the encoder strictly before
//! the socket closes.

use tracing::{debug, info, warn};

use crate::audio::chunk::Chunk;
use crate::conn::connection::{ConnId, Link, LinkSink};
use crate::encoder::{Encoder, EncoderBuilder, Format};
use crate::proto::ProtoError;
use crate::util::writer::{
    AsyncWriter, BufferedWriter, DoubleBufferedWriter, WriteError, WriteNotify,
};
use crate::{PRODUCT, VERSION};

/// Transfer buffers for self-describing streams, which emit several encoded
/// blocks per chunk.
const FLAC_TRANSFER_BUFFERS: usize = 10;

pub struct StreamingSession<L: Link + Clone + 'static> {
    link: L,
    client_id: String,
    sampling_rate: u32,
    encoder: Encoder,
}

impl<L: Link + Clone + 'static> StreamingSession<L> {
    /// Bind a data connection to a client: validates the HTTP request,
    /// replies with the stream headers and starts the encoder.
    pub fn new(
        link: L,
        request: &[u8],
        builder: &EncoderBuilder,
        channels: u16,
        sampling_rate: u32,
        bits_per_sample: u16,
        bits_per_value: u16,
        notify: WriteNotify,
    ) -> Result<Self, ProtoError> {
        let request = String::from_utf8_lossy(request);
        if !request.starts_with("GET") {
            return Err(ProtoError::WrongMethod);
        }

        let client_id = extract_client_id(&request)?;
        info!("Client ID was parsed from HTTP request (client={client_id})");

        let writer: Box<dyn AsyncWriter> = match builder.get_format()? {
            Format::Pcm => Box::new(DoubleBufferedWriter::new(
                LinkSink::new(link.clone()),
                notify,
                format!("client={client_id}"),
            )),
            Format::Flac => Box::new(BufferedWriter::new(
                LinkSink::new(link.clone()),
                FLAC_TRANSFER_BUFFERS,
                Some(notify),
            )),
        };

        let encoder = builder.build(
            channels,
            sampling_rate,
            bits_per_sample,
            bits_per_value,
            writer,
        )?;

        let response = format!(
            "HTTP/1.1 200 OK\r\nServer: {PRODUCT} ({VERSION})\r\nConnection: close\r\nContent-Type: {}\r\n\r\n",
            encoder.mime()
        );
        link.send(response.as_bytes())?;

        let mut session = Self {
            link,
            client_id,
            sampling_rate,
            encoder,
        };
        session.encoder.start()?;

        debug!(
            "HTTP session object was created (conn={}, client={})",
            session.link.id(),
            session.client_id
        );
        Ok(session)
    }

    pub fn conn(&self) -> ConnId {
        self.link.id()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }

    pub fn mime(&self) -> &'static str {
        self.encoder.mime()
    }

    /// Push one chunk at this session's rate. A chunk at any other rate is
    /// skipped: rate changes are the streamer's job to negotiate.
    pub fn on_chunk(&mut self, chunk: &Chunk) -> Result<(), ProtoError> {
        if chunk.sampling_rate() != self.sampling_rate {
            warn!(
                "Skipping chunk transmission due to different sampling rate (client={}, chunk={}, session={})",
                self.client_id,
                chunk.sampling_rate(),
                self.sampling_rate
            );
            return Ok(());
        }

        self.encoder.encode(chunk.bytes())?;
        Ok(())
    }

    /// Feed a transfer completion back into the writer's buffer rotation.
    pub fn on_write_done(&mut self, result: Result<usize, WriteError>) -> Result<(), WriteError> {
        self.encoder.writer_mut().on_write_done(&result)
    }

    /// Drain the encoder, then close the socket, then report completion.
    /// Encoder teardown strictly precedes socket teardown.
    pub fn stop(&mut self, on_done: Box<dyn FnOnce() + Send>) {
        let link = self.link.clone();
        self.encoder.stop(Box::new(move || {
            link.request_stop();
            on_done();
        }));
    }
}

impl<L: Link + Clone + 'static> Drop for StreamingSession<L> {
    fn drop(&mut self) {
        debug!("HTTP session object was deleted (conn={})", self.link.id());
    }
}

/// The client id is the first `=`-separated value in the request line,
/// taken up to the first whitespace.
fn extract_client_id(request: &str) -> Result<String, ProtoError> {
    let value = parse_client_id(request).ok_or(ProtoError::MissingClientId)?;
    let id = value.split_whitespace().next().unwrap_or_default();
    if id.is_empty() {
        return Err(ProtoError::MissingClientId);
    }
    Ok(id.to_string())
}

/// Everything after the first `=`, or nothing when no `=` is present.
pub fn parse_client_id(header: &str) -> Option<&str> {
    header.split_once('=').map(|(_, value)| value)
}
