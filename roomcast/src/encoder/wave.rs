//! WAVE/PCM encoder: a 44-byte RIFF header followed by the raw interleaved
//! samples. The header's size fields are written as zero up front and
//! patched on stop when the writer supports rewinding (files do, sockets
//! don't).

use tracing::{debug, warn};

use crate::encoder::EncoderError;
use crate::util::writer::{noop_callback, AsyncWriter, WriteError};

const HEADER_SIZE: u32 = 44;
const RIFF_SIZE_OFFSET: u64 = 4;
const DATA_SIZE_OFFSET: u64 = 40;

pub struct WaveEncoder {
    writer: Box<dyn AsyncWriter>,
    channels: u16,
    sampling_rate: u32,
    bits_per_sample: u16,
    bits_per_value: u16,
    bytes_written: u64,
    started: bool,
}

impl WaveEncoder {
    pub fn new(
        channels: u16,
        sampling_rate: u32,
        bits_per_sample: u16,
        bits_per_value: u16,
        writer: Box<dyn AsyncWriter>,
    ) -> Self {
        Self {
            writer,
            channels,
            sampling_rate,
            bits_per_sample,
            bits_per_value,
            bytes_written: 0,
            started: false,
        }
    }

    /// Write the header once. Size fields are filled in by `stop`.
    pub fn start(&mut self) -> Result<(), EncoderError> {
        if self.started {
            return Ok(());
        }
        let header = wave_header(self.channels, self.sampling_rate, self.bits_per_sample);
        self.writer.write(&header)?;
        self.started = true;
        Ok(())
    }

    pub fn encode(&mut self, data: &[u8]) -> Result<usize, EncoderError> {
        if !self.writer.is_buffer_available() {
            warn!("Transfer buffer is full - skipping PCM chunk");
            return Ok(0);
        }

        self.writer.write_async(data, noop_callback());
        self.bytes_written += data.len() as u64;
        Ok(data.len())
    }

    /// Patch the RIFF and data chunk sizes, then report completion.
    pub fn stop(&mut self, on_done: Box<dyn FnOnce() + Send>) {
        if self.started {
            if let Err(e) = self.patch_header() {
                match e {
                    WriteError::RewindUnsupported => {
                        debug!("Writer does not support rewind - WAVE sizes left open")
                    }
                    other => warn!("Could not patch WAVE header: {other}"),
                }
            }
        }
        on_done();
    }

    fn patch_header(&mut self) -> Result<(), WriteError> {
        let data_size = u32::try_from(self.bytes_written).unwrap_or(u32::MAX);
        self.writer.rewind(RIFF_SIZE_OFFSET)?;
        self.writer
            .write(&(data_size + HEADER_SIZE - 8).to_le_bytes())?;
        self.writer.rewind(DATA_SIZE_OFFSET)?;
        self.writer.write(&data_size.to_le_bytes())?;
        Ok(())
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.bits_per_sample
    }

    pub fn bits_per_value(&self) -> u16 {
        self.bits_per_value
    }

    pub fn writer_mut(&mut self) -> &mut dyn AsyncWriter {
        self.writer.as_mut()
    }
}

/// Standard 44-byte PCM WAVE header with zeroed size fields.
pub fn wave_header(channels: u16, sampling_rate: u32, bits_per_sample: u16) -> [u8; 44] {
    let block_align = channels * (bits_per_sample / 8);
    let byte_rate = sampling_rate * block_align as u32;

    let mut header = [0u8; 44];
    header[0..4].copy_from_slice(b"RIFF");
    // [4..8] chunk size, patched on stop
    header[8..12].copy_from_slice(b"WAVE");
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&1u16.to_le_bytes()); // PCM
    header[22..24].copy_from_slice(&channels.to_le_bytes());
    header[24..28].copy_from_slice(&sampling_rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&bits_per_sample.to_le_bytes());
    header[36..40].copy_from_slice(b"data");
    // [40..44] data size, patched on stop
    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::writer::testing::SharedWriter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_header_layout() {
        let header = wave_header(2, 44100, 16);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[8..12], b"WAVE");
        assert_eq!(&header[12..16], b"fmt ");
        assert_eq!(u32::from_le_bytes(header[16..20].try_into().unwrap()), 16);
        assert_eq!(u16::from_le_bytes(header[20..22].try_into().unwrap()), 1);
        assert_eq!(u16::from_le_bytes(header[22..24].try_into().unwrap()), 2);
        assert_eq!(
            u32::from_le_bytes(header[24..28].try_into().unwrap()),
            44100
        );
        assert_eq!(
            u32::from_le_bytes(header[28..32].try_into().unwrap()),
            44100 * 4
        );
        assert_eq!(u16::from_le_bytes(header[32..34].try_into().unwrap()), 4);
        assert_eq!(u16::from_le_bytes(header[34..36].try_into().unwrap()), 16);
        assert_eq!(&header[36..40], b"data");
    }

    #[test]
    fn test_sizes_patched_on_stop() {
        let (writer, bytes) = SharedWriter::new();
        let mut encoder = WaveEncoder::new(2, 44100, 16, 16, Box::new(writer));

        encoder.start().unwrap();
        encoder.encode(&[0u8; 100]).unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        let done_clone = Arc::clone(&done);
        encoder.stop(Box::new(move || {
            done_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(done.load(Ordering::SeqCst), 1);

        let bytes = bytes.lock().unwrap();
        assert_eq!(bytes.len(), 144);
        let riff_size = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let data_size = u32::from_le_bytes(bytes[40..44].try_into().unwrap());
        assert_eq!(data_size, 100);
        assert_eq!(riff_size, 136);
    }

    #[test]
    fn test_header_written_once() {
        let (writer, bytes) = SharedWriter::new();
        let mut encoder = WaveEncoder::new(2, 48000, 32, 24, Box::new(writer));

        encoder.start().unwrap();
        encoder.start().unwrap();
        assert_eq!(bytes.lock().unwrap().len(), 44);
    }
}
