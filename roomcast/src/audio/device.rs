//! Capture device abstraction.
//!
//! The sound driver itself is an external collaborator: the source only
//! relies on a blocking "read N frames" call plus a stop primitive. The
//! production implementation adapts cpal's callback API through an internal
//! SPSC byte ring so the capture thread sees the blocking interface it wants.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use thiserror::Error;
use tracing::{debug, warn};

use crate::audio::source::SourceParams;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("cannot open capture device '{device}': {reason}")]
    Open { device: String, reason: String },
    #[error("capture read failed: {0}")]
    Read(String),
    #[error("unsupported sample format: {0}")]
    Format(String),
    /// Sentinel returned when a requested stop interrupts the capture loop.
    /// Not an error condition and never logged as one.
    #[error("capture device stopped")]
    Stopped,
    #[error("audio source was already started")]
    AlreadyStarted,
}

/// Physical sample layout of the capture stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S16Le,
    S32Le,
}

impl SampleFormat {
    pub fn bits_per_sample(&self) -> u16 {
        match self {
            Self::S16Le => 16,
            Self::S32Le => 32,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        (self.bits_per_sample() >> 3) as usize
    }
}

impl FromStr for SampleFormat {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s16_le" | "s16" => Ok(Self::S16Le),
            "s32_le" | "s32" => Ok(Self::S32Le),
            other => Err(DeviceError::Format(other.to_string())),
        }
    }
}

/// How a stop request treats frames still buffered by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Deliver already-captured frames before stopping.
    Drain,
    /// Discard pending frames and stop immediately.
    Drop,
}

const STATE_RUNNING: u8 = 0;
const STATE_DRAIN: u8 = 1;
const STATE_DROP: u8 = 2;

/// Cloneable stop control shared between the source and its device; usable
/// from outside the capture thread.
#[derive(Clone)]
pub struct DeviceControl {
    state: Arc<AtomicU8>,
}

impl DeviceControl {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(STATE_RUNNING)),
        }
    }

    pub fn request_stop(&self, mode: StopMode) {
        let state = match mode {
            StopMode::Drain => STATE_DRAIN,
            StopMode::Drop => STATE_DROP,
        };
        self.state.store(state, Ordering::Release);
    }

    pub fn stop_requested(&self) -> Option<StopMode> {
        match self.state.load(Ordering::Acquire) {
            STATE_DRAIN => Some(StopMode::Drain),
            STATE_DROP => Some(StopMode::Drop),
            _ => None,
        }
    }

    pub fn reset(&self) {
        self.state.store(STATE_RUNNING, Ordering::Release);
    }
}

impl Default for DeviceControl {
    fn default() -> Self {
        Self::new()
    }
}

/// The blocking capture interface the source consumes.
pub trait CaptureDevice {
    /// Block until up to `max_frames` interleaved frames are available and
    /// copy them into `buf`. Returns the number of whole frames read, or
    /// [`DeviceError::Stopped`] once a stop request has been honoured.
    fn read_frames(&mut self, buf: &mut [u8], max_frames: usize) -> Result<usize, DeviceError>;

    /// Attempt to recover from a read error. Returns true when the device was
    /// restored and capturing may continue.
    fn try_restore(&mut self, error: &DeviceError) -> bool;
}

/// Factory used by the source to open its device on the capture thread.
pub type DeviceOpener =
    Arc<dyn Fn(&SourceParams, DeviceControl) -> Result<Box<dyn CaptureDevice>, DeviceError> + Send + Sync>;

/// cpal-backed capture device.
///
/// cpal delivers samples through a callback on its own thread; the callback
/// pushes whole frames into an rtrb byte ring and `read_frames` pops them,
/// turning the push model into the blocking read the source expects. The
/// ring is sized as `frames_per_chunk * periods` frames, mirroring a period
/// ring on a raw PCM device.
pub struct CpalDevice {
    stream: cpal::Stream,
    consumer: rtrb::Consumer<u8>,
    control: DeviceControl,
    bytes_per_frame: usize,
    overruns: Arc<AtomicU64>,
}

impl CpalDevice {
    pub fn open(params: &SourceParams, control: DeviceControl) -> Result<Self, DeviceError> {
        let host = cpal::default_host();
        let device = Self::find_device(&host, &params.device_name)?;

        let config = cpal::StreamConfig {
            channels: params.total_channels,
            sample_rate: cpal::SampleRate(params.sampling_rate),
            buffer_size: cpal::BufferSize::Fixed(params.frames_per_chunk as u32),
        };

        let bytes_per_frame = params.bytes_per_frame();
        let ring_bytes = params.frames_per_chunk * params.periods * bytes_per_frame;
        let (producer, consumer) = rtrb::RingBuffer::<u8>::new(ring_bytes);
        let overruns = Arc::new(AtomicU64::new(0));

        let stream = match params.format {
            SampleFormat::S16Le => {
                Self::build_stream::<i16>(&device, &config, producer, Arc::clone(&overruns))?
            }
            SampleFormat::S32Le => {
                Self::build_stream::<i32>(&device, &config, producer, Arc::clone(&overruns))?
            }
        };

        stream.play().map_err(|e| DeviceError::Open {
            device: params.device_name.clone(),
            reason: e.to_string(),
        })?;

        debug!(
            "Capture device opened: '{}' {} ch @ {} Hz",
            params.device_name, params.total_channels, params.sampling_rate
        );

        Ok(Self {
            stream,
            consumer,
            control,
            bytes_per_frame,
            overruns,
        })
    }

    fn find_device(host: &cpal::Host, name: &str) -> Result<cpal::Device, DeviceError> {
        if name == "default" {
            return host.default_input_device().ok_or_else(|| DeviceError::Open {
                device: name.to_string(),
                reason: "no default input device".to_string(),
            });
        }

        host.input_devices()
            .map_err(|e| DeviceError::Open {
                device: name.to_string(),
                reason: e.to_string(),
            })?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| DeviceError::Open {
                device: name.to_string(),
                reason: "no such input device".to_string(),
            })
    }

    fn build_stream<S>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        mut producer: rtrb::Producer<u8>,
        overruns: Arc<AtomicU64>,
    ) -> Result<cpal::Stream, DeviceError>
    where
        S: cpal::SizedSample + LittleEndianBytes + Send + 'static,
    {
        device
            .build_input_stream(
                config,
                move |data: &[S], _: &cpal::InputCallbackInfo| {
                    // Whole callback buffers only; a torn frame would shift
                    // every later frame off its marker byte.
                    let needed = std::mem::size_of_val(data);
                    if producer.slots() < needed {
                        overruns.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    for sample in data {
                        for byte in sample.to_le_byte_array() {
                            let _ = producer.push(byte);
                        }
                    }
                },
                |err| {
                    warn!("Capture stream error: {err}");
                },
                None,
            )
            .map_err(|e| DeviceError::Open {
                device: "cpal".to_string(),
                reason: e.to_string(),
            })
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    fn frames_buffered(&self) -> usize {
        self.consumer.slots() / self.bytes_per_frame
    }

    fn pop_frames(&mut self, buf: &mut [u8], frames: usize) -> usize {
        let bytes = frames * self.bytes_per_frame;
        for slot in buf.iter_mut().take(bytes) {
            match self.consumer.pop() {
                Ok(byte) => *slot = byte,
                Err(_) => unreachable!("frame count checked before pop"),
            }
        }
        frames
    }
}

impl CaptureDevice for CpalDevice {
    fn read_frames(&mut self, buf: &mut [u8], max_frames: usize) -> Result<usize, DeviceError> {
        let max_frames = max_frames.min(buf.len() / self.bytes_per_frame);

        loop {
            let buffered = self.frames_buffered();
            match self.control.stop_requested() {
                Some(StopMode::Drop) => return Err(DeviceError::Stopped),
                Some(StopMode::Drain) => {
                    if buffered == 0 {
                        return Err(DeviceError::Stopped);
                    }
                    return Ok(self.pop_frames(buf, buffered.min(max_frames)));
                }
                None => {
                    if buffered >= max_frames.max(1) {
                        return Ok(self.pop_frames(buf, buffered.min(max_frames)));
                    }
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            }
        }
    }

    fn try_restore(&mut self, error: &DeviceError) -> bool {
        match error {
            DeviceError::Stopped => false,
            _ => {
                debug!("Attempting capture stream restore after: {error}");
                self.stream.play().is_ok()
            }
        }
    }
}

/// Byte-level access used to serialise cpal samples into the frame ring.
pub trait LittleEndianBytes {
    type Bytes: IntoIterator<Item = u8>;
    fn to_le_byte_array(&self) -> Self::Bytes;
}

impl LittleEndianBytes for i16 {
    type Bytes = [u8; 2];
    fn to_le_byte_array(&self) -> [u8; 2] {
        self.to_le_bytes()
    }
}

impl LittleEndianBytes for i32 {
    type Bytes = [u8; 4];
    fn to_le_byte_array(&self) -> [u8; 4] {
        self.to_le_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_control_roundtrip() {
        let control = DeviceControl::new();
        assert_eq!(control.stop_requested(), None);

        control.request_stop(StopMode::Drain);
        assert_eq!(control.stop_requested(), Some(StopMode::Drain));

        control.request_stop(StopMode::Drop);
        assert_eq!(control.stop_requested(), Some(StopMode::Drop));

        control.reset();
        assert_eq!(control.stop_requested(), None);
    }

    #[test]
    fn test_sample_format_parsing() {
        assert_eq!("s16_le".parse::<SampleFormat>().unwrap(), SampleFormat::S16Le);
        assert_eq!("s32".parse::<SampleFormat>().unwrap(), SampleFormat::S32Le);
        assert!("f32".parse::<SampleFormat>().is_err());
        assert_eq!(SampleFormat::S32Le.bytes_per_sample(), 4);
    }

    #[test]
    #[ignore = "requires audio hardware"]
    fn test_open_default_device() {
        let params = SourceParams {
            device_name: "default".to_string(),
            total_channels: 2,
            logical_channels: 1,
            format: SampleFormat::S16Le,
            sampling_rate: 44100,
            frames_per_chunk: 1024,
            periods: 4,
            ring_capacity: 8,
        };
        let device = CpalDevice::open(&params, DeviceControl::new());
        assert!(device.is_ok());
    }
}
