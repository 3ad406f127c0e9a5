//! PCM-to-client-stream encoders.
//!
//! The inventory is closed (WAVE/PCM and FLAC), so the encoder is a sum type
//! rather than a trait object and the hot path pays no dynamic dispatch.
//! Both variants push their output into an [`AsyncWriter`] and skip without
//! blocking when the writer reports no free buffer; the caller treats a
//! skipped chunk as back-pressure and retries on the next quantum.

pub mod builder;
pub mod flac;
pub mod wave;

use thiserror::Error;

use crate::util::writer::{AsyncWriter, WriteError};

pub use builder::{EncoderBuilder, Format};
pub use flac::FlacEncoder;
pub use wave::WaveEncoder;

#[derive(Debug, Error)]
pub enum EncoderError {
    #[error("encoder initialization failed: {0}")]
    Init(String),
    #[error("encoding failed: {0}")]
    Encode(String),
    #[error("encoder option missing: {0}")]
    Builder(&'static str),
    #[error(transparent)]
    Write(#[from] WriteError),
}

pub enum Encoder {
    Wave(WaveEncoder),
    Flac(FlacEncoder),
}

impl Encoder {
    pub fn start(&mut self) -> Result<(), EncoderError> {
        match self {
            Self::Wave(e) => e.start(),
            Self::Flac(e) => e.start(),
        }
    }

    /// Encode one chunk of interleaved PCM. Returns the number of input
    /// bytes accepted; zero means the writer had no room and the chunk was
    /// skipped.
    pub fn encode(&mut self, data: &[u8]) -> Result<usize, EncoderError> {
        match self {
            Self::Wave(e) => e.encode(data),
            Self::Flac(e) => e.encode(data),
        }
    }

    /// Flush and finish the stream, then invoke `on_done`. Stopping is
    /// asynchronous so a caller can order encoder teardown strictly before
    /// its socket teardown.
    pub fn stop(&mut self, on_done: Box<dyn FnOnce() + Send>) {
        match self {
            Self::Wave(e) => e.stop(on_done),
            Self::Flac(e) => e.stop(on_done),
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            Self::Wave(_) => "audio/x-wave",
            Self::Flac(_) => "audio/flac",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Wave(_) => "wav",
            Self::Flac(_) => "flac",
        }
    }

    /// Whether the stream needs an out-of-band header. The FLAC stream is
    /// self-describing.
    pub fn header_required(&self) -> bool {
        matches!(self, Self::Wave(_))
    }

    pub fn channels(&self) -> u16 {
        match self {
            Self::Wave(e) => e.channels(),
            Self::Flac(e) => e.channels(),
        }
    }

    pub fn sampling_rate(&self) -> u32 {
        match self {
            Self::Wave(e) => e.sampling_rate(),
            Self::Flac(e) => e.sampling_rate(),
        }
    }

    pub fn bits_per_sample(&self) -> u16 {
        match self {
            Self::Wave(e) => e.bits_per_sample(),
            Self::Flac(e) => e.bits_per_sample(),
        }
    }

    pub fn bits_per_value(&self) -> u16 {
        match self {
            Self::Wave(e) => e.bits_per_value(),
            Self::Flac(e) => e.bits_per_value(),
        }
    }

    /// Access to the underlying writer, so transfer completions can be fed
    /// back into its buffer rotation.
    pub fn writer_mut(&mut self) -> &mut dyn AsyncWriter {
        match self {
            Self::Wave(e) => e.writer_mut(),
            Self::Flac(e) => e.writer_mut(),
        }
    }
}
