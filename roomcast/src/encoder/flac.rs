//! FLAC encoder over libflac-sys.
//!
//! Wraps libFLAC's streaming encoder with an in-memory write callback that
//! pushes encoded blocks straight into the session writer. FLAC supports at
//! most 24 meaningful bits per value; wider input is truncated to 24 bits,
//! which is lossy and flagged once at construction.

use libflac_sys as ffi;
use tracing::{error, warn};

use crate::encoder::EncoderError;
use crate::util::writer::{noop_callback, AsyncWriter};

const FLAC_MAX_BITS_PER_VALUE: u16 = 24;
const COMPRESSION_LEVEL: u32 = 8;

/// Heap-pinned so the raw `client_data` pointer handed to libFLAC stays
/// valid for the encoder's lifetime.
struct WriterShim {
    writer: Box<dyn AsyncWriter>,
}

pub struct FlacEncoder {
    encoder: *mut ffi::FLAC__StreamEncoder,
    shim: Box<WriterShim>,
    channels: u16,
    sampling_rate: u32,
    bits_per_sample: u16,
    bits_per_value: u16,
    downscale: bool,
    started: bool,
    finished: bool,
    samples: Vec<i32>,
}

// The raw encoder pointer is only ever used from the thread currently owning
// the FlacEncoder; libFLAC has no thread affinity of its own.
unsafe impl Send for FlacEncoder {}

extern "C" fn write_callback(
    _encoder: *const ffi::FLAC__StreamEncoder,
    buffer: *const ffi::FLAC__byte,
    bytes: usize,
    _samples: u32,
    _current_frame: u32,
    client_data: *mut libc::c_void,
) -> ffi::FLAC__StreamEncoderWriteStatus {
    let shim = unsafe { &mut *(client_data as *mut WriterShim) };
    let block = unsafe { std::slice::from_raw_parts(buffer, bytes) };

    if shim.writer.is_buffer_available() {
        shim.writer.write_async(block, noop_callback());
    } else {
        warn!("Transfer buffer is full - skipping encoded block");
    }

    ffi::FLAC__STREAM_ENCODER_WRITE_STATUS_OK
}

impl FlacEncoder {
    pub fn new(
        channels: u16,
        sampling_rate: u32,
        bits_per_sample: u16,
        bits_per_value: u16,
        writer: Box<dyn AsyncWriter>,
    ) -> Result<Self, EncoderError> {
        let encoder = unsafe { ffi::FLAC__stream_encoder_new() };
        if encoder.is_null() {
            return Err(EncoderError::Init("failed to allocate FLAC encoder".into()));
        }

        let downscale = bits_per_value > FLAC_MAX_BITS_PER_VALUE;
        if downscale {
            warn!(
                "PCM data will be truncated to {} bit values, the maximum bit depth FLAC supports",
                FLAC_MAX_BITS_PER_VALUE
            );
        }
        let encoded_bits = bits_per_value.min(FLAC_MAX_BITS_PER_VALUE);

        let ok = unsafe {
            // No verification pass: the stream is not checked against the
            // original PCM.
            ffi::FLAC__stream_encoder_set_verify(encoder, 0) != 0
                && ffi::FLAC__stream_encoder_set_compression_level(encoder, COMPRESSION_LEVEL) != 0
                && ffi::FLAC__stream_encoder_set_channels(encoder, channels as u32) != 0
                && ffi::FLAC__stream_encoder_set_sample_rate(encoder, sampling_rate) != 0
                && ffi::FLAC__stream_encoder_set_bits_per_sample(encoder, encoded_bits as u32) != 0
                // Streaming: no meaningful total, so pick a large estimate.
                && ffi::FLAC__stream_encoder_set_total_samples_estimate(encoder, 0xFFFF_FFFF) != 0
        };
        if !ok {
            unsafe { ffi::FLAC__stream_encoder_delete(encoder) };
            return Err(EncoderError::Init("failed to configure FLAC encoder".into()));
        }

        Ok(Self {
            encoder,
            shim: Box::new(WriterShim { writer }),
            channels,
            sampling_rate,
            bits_per_sample,
            bits_per_value,
            downscale,
            started: false,
            finished: false,
            samples: Vec::new(),
        })
    }

    pub fn start(&mut self) -> Result<(), EncoderError> {
        if self.started {
            return Ok(());
        }

        let shim_ptr = self.shim.as_mut() as *mut WriterShim as *mut libc::c_void;
        let status = unsafe {
            ffi::FLAC__stream_encoder_init_stream(
                self.encoder,
                Some(write_callback),
                None,
                None,
                None,
                shim_ptr,
            )
        };
        if status != ffi::FLAC__STREAM_ENCODER_INIT_STATUS_OK {
            return Err(EncoderError::Init(init_status_message(status).into()));
        }

        self.started = true;
        Ok(())
    }

    pub fn encode(&mut self, data: &[u8]) -> Result<usize, EncoderError> {
        if !self.started {
            return Err(EncoderError::Encode("encoder was not started".into()));
        }

        // Do not feed the encoder when the transfer buffer has no room; the
        // caller retries the chunk on its next cycle.
        if !self.shim.writer.is_buffer_available() {
            warn!("Transfer buffer is full - skipping PCM chunk");
            return Ok(0);
        }

        self.convert_samples(data)?;
        let frames = self.samples.len() / self.channels as usize;
        if frames == 0 {
            return Ok(data.len());
        }

        let ok = unsafe {
            ffi::FLAC__stream_encoder_process_interleaved(
                self.encoder,
                self.samples.as_ptr(),
                frames as u32,
            )
        };
        if ok == 0 {
            let state = unsafe { ffi::FLAC__stream_encoder_get_state(self.encoder) };
            return Err(EncoderError::Encode(encoder_state_message(state).into()));
        }

        Ok(data.len())
    }

    /// Finish the stream, flushing any buffered frames through the write
    /// callback, then report completion.
    pub fn stop(&mut self, on_done: Box<dyn FnOnce() + Send>) {
        if self.started && !self.finished {
            let ok = unsafe { ffi::FLAC__stream_encoder_finish(self.encoder) };
            if ok == 0 {
                error!("Error while finishing FLAC stream");
            }
            self.finished = true;
        }
        on_done();
    }

    /// Expand interleaved little-endian PCM into the i32 layout libFLAC
    /// expects, truncating to 24 bits when the input is wider.
    fn convert_samples(&mut self, data: &[u8]) -> Result<(), EncoderError> {
        self.samples.clear();

        match self.bits_per_sample {
            16 => {
                self.samples.reserve(data.len() / 2);
                for sample in data.chunks_exact(2) {
                    self.samples
                        .push(i16::from_le_bytes([sample[0], sample[1]]) as i32);
                }
            }
            32 => {
                self.samples.reserve(data.len() / 4);
                for sample in data.chunks_exact(4) {
                    let value = i32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
                    self.samples
                        .push(if self.downscale { value >> 8 } else { value });
                }
            }
            other => {
                return Err(EncoderError::Encode(format!(
                    "unsupported physical sample width: {other}"
                )))
            }
        }

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
        self.shim.writer.as_mut()
    }
}

impl Drop for FlacEncoder {
    fn drop(&mut self) {
        unsafe {
            if self.started && !self.finished {
                ffi::FLAC__stream_encoder_finish(self.encoder);
            }
            ffi::FLAC__stream_encoder_delete(self.encoder);
        }
    }
}

fn init_status_message(status: ffi::FLAC__StreamEncoderInitStatus) -> &'static str {
    match status {
        ffi::FLAC__STREAM_ENCODER_INIT_STATUS_ENCODER_ERROR => "encoder error",
        ffi::FLAC__STREAM_ENCODER_INIT_STATUS_UNSUPPORTED_CONTAINER => "unsupported container",
        ffi::FLAC__STREAM_ENCODER_INIT_STATUS_INVALID_CALLBACKS => "invalid callbacks",
        ffi::FLAC__STREAM_ENCODER_INIT_STATUS_INVALID_NUMBER_OF_CHANNELS => {
            "invalid number of channels"
        }
        ffi::FLAC__STREAM_ENCODER_INIT_STATUS_INVALID_BITS_PER_SAMPLE => "invalid bits per sample",
        ffi::FLAC__STREAM_ENCODER_INIT_STATUS_INVALID_SAMPLE_RATE => "invalid sample rate",
        ffi::FLAC__STREAM_ENCODER_INIT_STATUS_ALREADY_INITIALIZED => "already initialized",
        _ => "unknown initialization error",
    }
}

fn encoder_state_message(state: ffi::FLAC__StreamEncoderState) -> &'static str {
    match state {
        ffi::FLAC__STREAM_ENCODER_UNINITIALIZED => "uninitialized",
        ffi::FLAC__STREAM_ENCODER_VERIFY_DECODER_ERROR => "verify decoder error",
        ffi::FLAC__STREAM_ENCODER_VERIFY_MISMATCH_IN_AUDIO_DATA => "verify mismatch in audio data",
        ffi::FLAC__STREAM_ENCODER_CLIENT_ERROR => "client error",
        ffi::FLAC__STREAM_ENCODER_IO_ERROR => "io error",
        ffi::FLAC__STREAM_ENCODER_FRAMING_ERROR => "framing error",
        ffi::FLAC__STREAM_ENCODER_MEMORY_ALLOCATION_ERROR => "memory allocation error",
        _ => "unknown encoder error",
    }
}
