//! SlimProto: the per-client control protocol and the HTTP data channel.

pub mod command_session;
pub mod streamer;
pub mod streaming_session;
pub mod wire;

use thiserror::Error;

use crate::encoder::EncoderError;
use crate::util::writer::WriteError;

pub use command_session::{CommandSession, SessionState};
pub use streamer::Streamer;
pub use streaming_session::StreamingSession;

#[derive(Debug, Error)]
pub enum ProtoError {
    /// The first command on a control connection must be HELO.
    #[error("did not receive HELO command")]
    MissingHelo,
    #[error("malformed {command} command: {reason}")]
    Malformed { command: String, reason: String },
    #[error("command buffer overflow")]
    BufferOverflow,
    #[error("wrong method provided")]
    WrongMethod,
    #[error("missing client ID in HTTP request")]
    MissingClientId,
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
}
