//! Offline consumer writing one source's stream to a file through the same
//! encoder and writer abstractions the network path uses.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::audio::chunk::Chunk;
use crate::encoder::{Encoder, EncoderBuilder};
use crate::pipeline::{Consumer, PipelineError};
use crate::util::writer::FileWriter;

pub struct FileConsumer {
    encoder: Encoder,
    sampling_rate: u32,
    path: PathBuf,
    running: bool,
}

impl FileConsumer {
    /// Create `<dir>/<rate>.<extension>` and write the stream header.
    pub fn create(
        builder: &EncoderBuilder,
        dir: &Path,
        channels: u16,
        sampling_rate: u32,
        bits_per_sample: u16,
        bits_per_value: u16,
    ) -> Result<Self, PipelineError> {
        let path = dir.join(format!("{}.{}", sampling_rate, builder.get_extension()?));
        let writer = FileWriter::create(&path)?;
        let mut encoder = builder.build(
            channels,
            sampling_rate,
            bits_per_sample,
            bits_per_value,
            Box::new(writer),
        )?;
        encoder.start()?;

        info!("File output opened: {}", path.display());
        Ok(Self {
            encoder,
            sampling_rate,
            path,
            running: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Consumer for FileConsumer {
    fn start(&mut self) {
        self.running = true;
    }

    fn stop(&mut self, on_done: Box<dyn FnOnce() + Send>) {
        self.running = false;
        let path = self.path.clone();
        self.encoder.stop(Box::new(move || {
            info!("File output closed: {}", path.display());
            on_done();
        }));
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }

    fn consume(&mut self, chunk: &mut Chunk) -> Result<bool, PipelineError> {
        if chunk.is_end_of_stream() {
            return Ok(true);
        }
        if chunk.sampling_rate() != self.sampling_rate {
            warn!(
                "Skipping chunk with rate {} on a {} Hz file output",
                chunk.sampling_rate(),
                self.sampling_rate
            );
            return Ok(true);
        }

        let accepted = self.encoder.encode(chunk.bytes())?;
        // Zero accepted bytes means the writer had no room: defer the chunk.
        Ok(accepted > 0)
    }
}
