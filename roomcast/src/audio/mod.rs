//! Real-time audio capture: chunks, the SPSC handoff ring, stream markers
//! and the capture source.

pub mod chunk;
pub mod device;
pub mod marker;
pub mod ring;
pub mod source;

pub use chunk::Chunk;
pub use device::{CaptureDevice, DeviceControl, DeviceError, SampleFormat, StopMode};
pub use marker::StreamMarker;
pub use source::{PcmSource, SourceParams};
