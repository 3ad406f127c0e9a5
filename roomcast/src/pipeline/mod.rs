//! Chunk pipeline: producer/consumer seams, multi-source multiplexing,
//! rate-aware demultiplexing and the cooperative scheduler driving it all.

pub mod demultiplexor;
pub mod file_consumer;
pub mod multiplexor;
pub mod scheduler;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::audio::chunk::Chunk;
use crate::audio::device::DeviceError;
use crate::audio::source::PcmSource;
use crate::encoder::EncoderError;
use crate::util::writer::WriteError;

pub use demultiplexor::Demultiplexor;
pub use file_consumer::FileConsumer;
pub use multiplexor::Multiplexor;
pub use scheduler::{Scheduler, MAX_CHUNKS_PER_QUANTUM};

/// Invoked from the capture thread when the ring refuses a chunk; must be
/// real-time safe.
pub type OverflowHandler = Arc<dyn Fn() + Send + Sync>;

/// Fatal pipeline failures. Per-session troubles never surface here; these
/// mean the device or an offline encoder cannot make forward progress.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("encoder failure: {0}")]
    Encoder(String),
    #[error("io failure: {0}")]
    Io(String),
}

impl From<EncoderError> for PipelineError {
    fn from(e: EncoderError) -> Self {
        Self::Encoder(e.to_string())
    }
}

impl From<WriteError> for PipelineError {
    fn from(e: WriteError) -> Self {
        Self::Io(e.to_string())
    }
}

/// Outcome of one produce call.
pub enum Produce {
    /// A chunk was handed to the consumer.
    Chunk,
    /// Nothing was available right now.
    Empty,
    /// Nothing was available and the caller should back off for a while.
    Pause(Duration),
}

pub trait Producer {
    fn start(&mut self, on_overflow: OverflowHandler) -> Result<(), DeviceError>;

    /// Signal the producer to stop without waiting for it.
    fn request_stop(&mut self, graceful: bool);

    /// Stop and block until idle.
    fn stop(&mut self, graceful: bool);

    fn is_running(&self) -> bool;

    fn is_available(&self) -> bool;

    /// Hand at most one chunk to `consume`. The consumer returns whether it
    /// took the chunk; a deferred chunk stays with the producer.
    fn produce(&mut self, consume: &mut dyn FnMut(&mut Chunk) -> bool) -> Produce;
}

pub trait Consumer {
    fn start(&mut self);

    /// Asynchronous stop; `on_done` fires once everything downstream has
    /// been released in order.
    fn stop(&mut self, on_done: Box<dyn FnOnce() + Send>);

    fn is_running(&self) -> bool;

    /// The rate this consumer is currently operating at; 0 when idle.
    fn sampling_rate(&self) -> u32;

    /// Consume one chunk. `Ok(false)` defers the chunk (back-pressure);
    /// errors are fatal for the whole pipeline.
    fn consume(&mut self, chunk: &mut Chunk) -> Result<bool, PipelineError>;
}

impl Producer for crate::audio::source::PcmSource {
    fn start(&mut self, on_overflow: OverflowHandler) -> Result<(), DeviceError> {
        PcmSource::start(self, on_overflow)
    }

    fn request_stop(&mut self, graceful: bool) {
        PcmSource::request_stop(self, graceful)
    }

    fn stop(&mut self, graceful: bool) {
        PcmSource::stop(self, graceful)
    }

    fn is_running(&self) -> bool {
        self.is_producing()
    }

    fn is_available(&self) -> bool {
        PcmSource::is_available(self)
    }

    fn produce(&mut self, consume: &mut dyn FnMut(&mut Chunk) -> bool) -> Produce {
        if self.supply(|chunk| consume(chunk)) {
            Produce::Chunk
        } else {
            Produce::Empty
        }
    }
}
