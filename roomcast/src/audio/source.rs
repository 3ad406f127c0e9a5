//! PCM capture source.
//!
//! A source owns a dedicated OS capture thread which blocks inside the
//! device read, filters frames through the stream markers and publishes
//! chunks into the SPSC ring. Everything inside the capture loop is
//! real-time safe: the interleaved read buffer is allocated once up front
//! and ring slots are refilled in place.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{debug, error, info};

use crate::audio::chunk::Chunk;
use crate::audio::device::{
    CaptureDevice, DeviceControl, DeviceError, DeviceOpener, SampleFormat, StopMode,
};
use crate::audio::marker::StreamMarker;
use crate::audio::ring::{ring_with_capacity, RingConsumer, RingProducer};

/// Capture parameters for one source.
#[derive(Debug, Clone)]
pub struct SourceParams {
    pub device_name: String,
    /// Channels captured from the device, marker channel included.
    pub total_channels: u16,
    /// Channels forwarded downstream. The last physical channel is
    /// sacrificial and carries stream markers, so
    /// `total_channels >= logical_channels + 1` must hold.
    pub logical_channels: u16,
    pub format: SampleFormat,
    pub sampling_rate: u32,
    pub frames_per_chunk: usize,
    pub periods: usize,
    /// Chunk ring capacity; must be a power of two.
    pub ring_capacity: usize,
}

impl SourceParams {
    pub fn validate(&self) -> Result<(), DeviceError> {
        if self.total_channels < self.logical_channels + 1 {
            return Err(DeviceError::Format(format!(
                "need at least one marker channel: total={} logical={}",
                self.total_channels, self.logical_channels
            )));
        }
        if self.frames_per_chunk == 0 {
            return Err(DeviceError::Format("frames_per_chunk must be non-zero".into()));
        }
        if self.ring_capacity == 0 || !self.ring_capacity.is_power_of_two() {
            return Err(DeviceError::Format(format!(
                "ring capacity must be a power of two: {}",
                self.ring_capacity
            )));
        }
        Ok(())
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.total_channels as usize * self.format.bytes_per_sample()
    }

    pub fn logical_bytes_per_frame(&self) -> usize {
        self.logical_channels as usize * self.format.bytes_per_sample()
    }

    /// Fixed byte capacity of one ring slot.
    pub fn chunk_capacity(&self) -> usize {
        self.frames_per_chunk * self.logical_bytes_per_frame()
    }
}

pub struct PcmSource {
    params: SourceParams,
    opener: DeviceOpener,
    control: DeviceControl,
    producing: Arc<AtomicBool>,
    available: Arc<AtomicBool>,
    overflows: Arc<AtomicU64>,
    consumer: RingConsumer<Chunk>,
    // The producer end moves into the capture thread on start and is parked
    // back here when the thread exits, so the source can be restarted.
    producer_slot: Arc<Mutex<Option<RingProducer<Chunk>>>>,
    capture_thread: Option<JoinHandle<()>>,
}

impl PcmSource {
    pub fn new(params: SourceParams, opener: DeviceOpener) -> Result<Self, DeviceError> {
        params.validate()?;

        let chunk_capacity = params.chunk_capacity();
        let (producer, consumer) =
            ring_with_capacity(params.ring_capacity, || Chunk::with_capacity(chunk_capacity));

        Ok(Self {
            params,
            opener,
            control: DeviceControl::new(),
            producing: Arc::new(AtomicBool::new(false)),
            available: Arc::new(AtomicBool::new(false)),
            overflows: Arc::new(AtomicU64::new(0)),
            consumer,
            producer_slot: Arc::new(Mutex::new(Some(producer))),
            capture_thread: None,
        })
    }

    pub fn params(&self) -> &SourceParams {
        &self.params
    }

    pub fn sampling_rate(&self) -> u32 {
        self.params.sampling_rate
    }

    /// True while the capture thread is alive.
    pub fn is_producing(&self) -> bool {
        self.producing.load(Ordering::Acquire)
    }

    /// True while the ring holds at least one published chunk.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Open the device and start capturing on a dedicated thread. Device open
    /// failures surface here; the call returns once the device is live.
    pub fn start(&mut self, on_overflow: Arc<dyn Fn() + Send + Sync>) -> Result<(), DeviceError> {
        if self.is_producing() || self.capture_thread.is_some() {
            return Err(DeviceError::AlreadyStarted);
        }

        let producer = self
            .producer_slot
            .lock()
            .expect("ring producer slot poisoned")
            .take()
            .ok_or(DeviceError::AlreadyStarted)?;

        self.control.reset();

        let params = self.params.clone();
        let opener = Arc::clone(&self.opener);
        let control = self.control.clone();
        let producing = Arc::clone(&self.producing);
        let available = Arc::clone(&self.available);
        let overflows = Arc::clone(&self.overflows);
        let producer_slot = Arc::clone(&self.producer_slot);
        let (open_tx, open_rx) = mpsc::channel::<Result<(), DeviceError>>();

        let handle = std::thread::Builder::new()
            .name(format!("capture-{}", params.sampling_rate))
            .spawn(move || {
                let device = match opener(&params, control) {
                    Ok(device) => {
                        // Publish the running state before the caller can
                        // observe a successful start.
                        producing.store(true, Ordering::Release);
                        let _ = open_tx.send(Ok(()));
                        device
                    }
                    Err(err) => {
                        let _ = open_tx.send(Err(err));
                        *producer_slot.lock().expect("ring producer slot poisoned") =
                            Some(producer);
                        return;
                    }
                };

                let mut producer = producer;
                capture_loop(
                    device,
                    &params,
                    &mut producer,
                    &available,
                    &overflows,
                    on_overflow.as_ref(),
                );
                producing.store(false, Ordering::Release);

                *producer_slot.lock().expect("ring producer slot poisoned") = Some(producer);
            })
            .map_err(|e| DeviceError::Open {
                device: self.params.device_name.clone(),
                reason: e.to_string(),
            })?;

        self.capture_thread = Some(handle);

        match open_rx.recv() {
            Ok(Ok(())) => {
                info!(
                    "Audio source started: '{}' @ {} Hz",
                    self.params.device_name, self.params.sampling_rate
                );
                Ok(())
            }
            Ok(Err(err)) => {
                // The thread already parked the producer end and exited.
                self.reap_thread();
                Err(err)
            }
            Err(_) => {
                self.reap_thread();
                Err(DeviceError::Open {
                    device: self.params.device_name.clone(),
                    reason: "capture thread exited before opening the device".to_string(),
                })
            }
        }
    }

    /// Request the device to drain (graceful) or drop pending frames, then
    /// block until the capture thread exits.
    pub fn stop(&mut self, graceful: bool) {
        self.request_stop(graceful);
        self.reap_thread();
        debug!(
            "Audio source stopped: '{}' (overflows={})",
            self.params.device_name,
            self.overflows()
        );
    }

    /// Signal the capture loop to stop without waiting for it.
    pub fn request_stop(&mut self, graceful: bool) {
        let mode = if graceful { StopMode::Drain } else { StopMode::Drop };
        self.control.request_stop(mode);
    }

    /// Non-blocking dequeue of one chunk into the consumer. The consumer
    /// returns whether it took the chunk; a deferred chunk stays at the front
    /// of the ring.
    pub fn supply<F: FnOnce(&mut Chunk) -> bool>(&mut self, consumer_fn: F) -> bool {
        let available = &self.available;
        self.consumer.dequeue_if(
            |chunk| {
                let consumed = consumer_fn(chunk);
                if consumed {
                    chunk.clear();
                }
                consumed
            },
            || available.store(false, Ordering::Release),
        )
    }

    fn reap_thread(&mut self) {
        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PcmSource {
    fn drop(&mut self) {
        if self.is_producing() {
            self.stop(false);
        } else {
            self.reap_thread();
        }
    }
}

/// The real-time section. No allocation, no locking and no logging happen in
/// here; the ring slot is refilled in place and the overflow handler is the
/// only escape hatch.
fn capture_loop(
    mut device: Box<dyn CaptureDevice>,
    params: &SourceParams,
    producer: &mut RingProducer<Chunk>,
    available: &AtomicBool,
    overflows: &AtomicU64,
    on_overflow: &(dyn Fn() + Send + Sync),
) {
    let bytes_per_frame = params.bytes_per_frame();
    let logical_bytes_per_frame = params.logical_bytes_per_frame();
    let mut frame_buf = vec![0u8; params.frames_per_chunk * bytes_per_frame];
    let mut streaming = true;

    loop {
        match device.read_frames(&mut frame_buf, params.frames_per_chunk) {
            Ok(0) => continue,
            Ok(frames) => {
                let offset =
                    match first_data_offset(&frame_buf, frames, bytes_per_frame, &mut streaming) {
                        Some(offset) => offset,
                        None => continue,
                    };

                let src = &frame_buf[offset * bytes_per_frame..frames * bytes_per_frame];
                let streaming_ref = &mut streaming;
                producer.enqueue(
                    |chunk| {
                        let copied = copy_logical_frames(
                            src,
                            chunk.bytes_mut(),
                            bytes_per_frame,
                            logical_bytes_per_frame,
                            streaming_ref,
                        );
                        chunk.set_size(copied * logical_bytes_per_frame);
                        chunk.set_sampling_rate(params.sampling_rate);
                        available.store(true, Ordering::Release);
                    },
                    || {
                        overflows.fetch_add(1, Ordering::Relaxed);
                        on_overflow();
                    },
                );
            }
            Err(DeviceError::Stopped) => break,
            Err(err) => {
                if device.try_restore(&err) {
                    continue;
                }
                error!("Unrecoverable capture error: {err}");
                break;
            }
        }
    }
}

/// Scan for the first frame tagged `Data` while streaming, updating the
/// streaming state as `Begin`/`End` markers pass by.
fn first_data_offset(
    buf: &[u8],
    frames: usize,
    bytes_per_frame: usize,
    streaming: &mut bool,
) -> Option<usize> {
    for i in 0..frames {
        let marker_byte = buf[(i + 1) * bytes_per_frame - 1];
        match StreamMarker::from_byte(marker_byte) {
            Some(StreamMarker::Begin) => *streaming = true,
            Some(StreamMarker::End) => *streaming = false,
            Some(StreamMarker::Data) if *streaming => return Some(i),
            _ => {}
        }
    }
    None
}

/// Copy qualifying frames into the chunk buffer, stripping the marker
/// channel. Returns the number of frames copied.
fn copy_logical_frames(
    src: &[u8],
    dst: &mut [u8],
    bytes_per_frame: usize,
    logical_bytes_per_frame: usize,
    streaming: &mut bool,
) -> usize {
    let mut copied = 0;

    for frame in src.chunks_exact(bytes_per_frame) {
        match StreamMarker::from_byte(frame[bytes_per_frame - 1]) {
            Some(StreamMarker::Begin) => *streaming = true,
            Some(StreamMarker::End) => *streaming = false,
            Some(StreamMarker::Data) if *streaming => {
                let at = copied * logical_bytes_per_frame;
                if at + logical_bytes_per_frame > dst.len() {
                    break;
                }
                dst[at..at + logical_bytes_per_frame]
                    .copy_from_slice(&frame[..logical_bytes_per_frame]);
                copied += 1;
            }
            _ => {}
        }
    }

    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};

    fn test_params(ring_capacity: usize) -> SourceParams {
        SourceParams {
            device_name: "scripted".to_string(),
            total_channels: 3,
            logical_channels: 2,
            format: SampleFormat::S16Le,
            sampling_rate: 44100,
            frames_per_chunk: 8,
            periods: 4,
            ring_capacity,
        }
    }

    /// Replays a fixed list of reads, then reports a stop.
    struct ScriptedDevice {
        reads: VecDeque<Vec<u8>>,
    }

    impl CaptureDevice for ScriptedDevice {
        fn read_frames(&mut self, buf: &mut [u8], _max_frames: usize) -> Result<usize, DeviceError> {
            match self.reads.pop_front() {
                Some(bytes) => {
                    let bytes_per_frame = 6;
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len() / bytes_per_frame)
                }
                None => Err(DeviceError::Stopped),
            }
        }

        fn try_restore(&mut self, _error: &DeviceError) -> bool {
            false
        }
    }

    fn scripted_opener(reads: Vec<Vec<u8>>) -> DeviceOpener {
        Arc::new(move |_params, _control| {
            Ok(Box::new(ScriptedDevice {
                reads: reads.clone().into(),
            }) as Box<dyn CaptureDevice>)
        })
    }

    /// One 3-channel S16 frame: two audio channels plus the marker channel
    /// whose last byte carries the tag.
    fn frame(left: u8, right: u8, marker: u8) -> Vec<u8> {
        vec![left, 0, right, 0, 0, marker]
    }

    fn wait_for_exit(source: &PcmSource) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while source.is_producing() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(!source.is_producing(), "capture thread did not exit");
    }

    #[test]
    fn test_params_require_marker_channel() {
        let mut params = test_params(8);
        params.logical_channels = 3;
        assert!(params.validate().is_err());

        params.logical_channels = 2;
        assert!(params.validate().is_ok());

        params.ring_capacity = 6;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_marker_filter_emits_only_framed_data() {
        // Markers B, D, D, E, D, D: only the two D frames between Begin and
        // End may come through; the trailing ones are dropped.
        let read: Vec<u8> = [
            frame(0, 0, 1),
            frame(10, 11, 3),
            frame(20, 21, 3),
            frame(0, 0, 2),
            frame(30, 31, 3),
            frame(40, 41, 3),
        ]
        .concat();

        let mut source = PcmSource::new(test_params(8), scripted_opener(vec![read])).unwrap();
        source.start(Arc::new(|| {})).unwrap();
        wait_for_exit(&source);

        let mut emitted = Vec::new();
        let supplied = source.supply(|chunk| {
            emitted.extend_from_slice(chunk.bytes());
            assert_eq!(chunk.sampling_rate(), 44100);
            true
        });
        assert!(supplied);
        // Two frames of two 16-bit channels each.
        assert_eq!(emitted, vec![10, 0, 11, 0, 20, 0, 21, 0]);

        assert!(!source.supply(|_| true));
        source.stop(true);
    }

    #[test]
    fn test_end_marker_state_persists_across_reads() {
        let reads = vec![
            [frame(1, 1, 3), frame(0, 0, 2)].concat(),
            // Still stopped: no Begin yet.
            [frame(9, 9, 3)].concat(),
            [frame(0, 0, 1), frame(2, 2, 3)].concat(),
        ];

        let mut source = PcmSource::new(test_params(8), scripted_opener(reads)).unwrap();
        source.start(Arc::new(|| {})).unwrap();
        wait_for_exit(&source);

        let mut chunks = Vec::new();
        while source.supply(|chunk| {
            chunks.push(chunk.bytes().to_vec());
            true
        }) {}

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], vec![1, 0, 1, 0]);
        assert_eq!(chunks[1], vec![2, 0, 2, 0]);
        source.stop(true);
    }

    #[test]
    fn test_open_failure_surfaces_to_caller() {
        let opener: DeviceOpener = Arc::new(|params, _control| {
            Err(DeviceError::Open {
                device: params.device_name.clone(),
                reason: "busy".to_string(),
            })
        });

        let mut source = PcmSource::new(test_params(8), opener).unwrap();
        let err = source.start(Arc::new(|| {})).unwrap_err();
        assert!(matches!(err, DeviceError::Open { .. }));
        assert!(!source.is_producing());

        // The source remains startable after a failed open.
        let err = source.start(Arc::new(|| {})).unwrap_err();
        assert!(matches!(err, DeviceError::Open { .. }));
    }

    #[test]
    fn test_deferred_consumer_keeps_chunk() {
        let read = [frame(0, 0, 1), frame(5, 6, 3)].concat();
        let mut source = PcmSource::new(test_params(8), scripted_opener(vec![read])).unwrap();
        source.start(Arc::new(|| {})).unwrap();
        wait_for_exit(&source);

        assert!(!source.supply(|_| false));
        let mut seen = Vec::new();
        assert!(source.supply(|chunk| {
            seen.extend_from_slice(chunk.bytes());
            true
        }));
        assert_eq!(seen, vec![5, 0, 6, 0]);
        source.stop(true);
    }
}
