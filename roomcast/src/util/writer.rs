//! Uniform non-blocking write abstraction over sockets and files.
//!
//! Encoders hold a boxed [`AsyncWriter`] and never learn whether bytes end
//! up on a data socket or in an offline file. Socket-backed writers submit
//! owned buffers to the connection's writer task through an [`OpSink`];
//! completion hands each buffer back for reuse, so steady-state streaming
//! does not allocate per write.

use std::io::{Seek, SeekFrom, Write};
use std::sync::mpsc;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Clone)]
pub enum WriteError {
    /// All pooled buffers are outstanding; the caller should drop or retry.
    /// Back-pressure, not a failure.
    #[error("no buffer space available")]
    NoBufferSpace,
    #[error("connection closed")]
    Closed,
    #[error("rewind is not supported by this writer")]
    RewindUnsupported,
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for WriteError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Delivered once per `write_async` with the outcome.
pub type WriteCallback = Box<dyn FnOnce(Result<usize, WriteError>) + Send>;

/// Completion for an owned-buffer submission; returns the buffer for reuse.
pub type WriteDone = Box<dyn FnOnce(Result<usize, WriteError>, Vec<u8>) + Send>;

/// Notification hook invoked when a submitted buffer finishes writing; used
/// to route completions back onto the event loop.
pub type WriteNotify = Arc<dyn Fn(Result<usize, WriteError>) + Send + Sync>;

pub fn noop_callback() -> WriteCallback {
    Box::new(|_| {})
}

/// Sink accepting owned write buffers, typically the channel into a
/// connection's writer task.
pub trait OpSink: Send {
    fn submit(&mut self, buf: Vec<u8>, done: WriteDone);
}

pub trait AsyncWriter: Send {
    /// Synchronous best-effort write; returns the number of bytes taken.
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError>;

    /// Non-blocking write; `on_done` is invoked exactly once. Writers that
    /// deliver through the event loop invoke it at acceptance and report the
    /// transfer outcome via [`on_write_done`](Self::on_write_done).
    fn write_async(&mut self, data: &[u8], on_done: WriteCallback);

    /// Reposition the output; a no-op error on sockets.
    fn rewind(&mut self, _pos: u64) -> Result<(), WriteError> {
        Err(WriteError::RewindUnsupported)
    }

    /// Whether a subsequent `write_async` can be accepted without dropping.
    fn is_buffer_available(&mut self) -> bool {
        true
    }

    /// Feed a transfer completion back into the writer so it can release or
    /// rotate its buffers. Returns the error when the transfer failed.
    fn on_write_done(&mut self, _result: &Result<usize, WriteError>) -> Result<(), WriteError> {
        Ok(())
    }
}

/// Writer over a pool of `capacity` reusable output buffers. When every
/// buffer is outstanding the write is refused with `NoBufferSpace`, which
/// callers treat as back-pressure.
pub struct BufferedWriter<S: OpSink> {
    sink: S,
    free: Vec<Vec<u8>>,
    return_tx: mpsc::Sender<Vec<u8>>,
    return_rx: mpsc::Receiver<Vec<u8>>,
    notify: Option<WriteNotify>,
}

impl<S: OpSink> BufferedWriter<S> {
    pub fn new(sink: S, capacity: usize, notify: Option<WriteNotify>) -> Self {
        let (return_tx, return_rx) = mpsc::channel();
        Self {
            sink,
            free: (0..capacity.max(1)).map(|_| Vec::new()).collect(),
            return_tx,
            return_rx,
            notify,
        }
    }

    fn reclaim(&mut self) {
        while let Ok(mut buf) = self.return_rx.try_recv() {
            buf.clear();
            self.free.push(buf);
        }
    }

    fn submit(&mut self, buf: Vec<u8>) {
        let return_tx = self.return_tx.clone();
        let notify = self.notify.clone();
        self.sink.submit(
            buf,
            Box::new(move |result, buf| {
                let _ = return_tx.send(buf);
                if let Some(notify) = notify {
                    notify(result);
                }
            }),
        );
    }
}

impl<S: OpSink> AsyncWriter for BufferedWriter<S> {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        self.write_async(data, noop_callback());
        Ok(data.len())
    }

    fn write_async(&mut self, data: &[u8], on_done: WriteCallback) {
        self.reclaim();
        match self.free.pop() {
            Some(mut buf) => {
                buf.clear();
                buf.extend_from_slice(data);
                self.submit(buf);
                on_done(Ok(data.len()));
            }
            None => on_done(Err(WriteError::NoBufferSpace)),
        }
    }

    fn is_buffer_available(&mut self) -> bool {
        self.reclaim();
        !self.free.is_empty()
    }

    fn on_write_done(&mut self, result: &Result<usize, WriteError>) -> Result<(), WriteError> {
        self.reclaim();
        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(e.clone()),
        }
    }
}

/// Double-buffered writer: one buffer in flight, one pending. A chunk
/// arriving while the pending slot is occupied replaces it, dropping the
/// older undelivered chunk (slow client). At most one write is ever in
/// flight per sink.
pub struct DoubleBufferedWriter<S: OpSink> {
    sink: S,
    free: Vec<Vec<u8>>,
    pending: Option<Vec<u8>>,
    in_flight: bool,
    return_tx: mpsc::Sender<Vec<u8>>,
    return_rx: mpsc::Receiver<Vec<u8>>,
    notify: WriteNotify,
    label: String,
}

impl<S: OpSink> DoubleBufferedWriter<S> {
    pub fn new(sink: S, notify: WriteNotify, label: impl Into<String>) -> Self {
        let (return_tx, return_rx) = mpsc::channel();
        Self {
            sink,
            free: vec![Vec::new(), Vec::new()],
            pending: None,
            in_flight: false,
            return_tx,
            return_rx,
            notify,
            label: label.into(),
        }
    }

    fn reclaim(&mut self) {
        while let Ok(mut buf) = self.return_rx.try_recv() {
            buf.clear();
            self.free.push(buf);
        }
    }

    fn take_buffer(&mut self, data: &[u8]) -> Vec<u8> {
        let mut buf = self.free.pop().unwrap_or_default();
        buf.clear();
        buf.extend_from_slice(data);
        buf
    }

    fn submit(&mut self, buf: Vec<u8>) {
        self.in_flight = true;
        let return_tx = self.return_tx.clone();
        let notify = Arc::clone(&self.notify);
        self.sink.submit(
            buf,
            Box::new(move |result, buf| {
                let _ = return_tx.send(buf);
                notify(result);
            }),
        );
    }
}

impl<S: OpSink> AsyncWriter for DoubleBufferedWriter<S> {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        self.write_async(data, noop_callback());
        Ok(data.len())
    }

    fn write_async(&mut self, data: &[u8], on_done: WriteCallback) {
        self.reclaim();

        if !self.in_flight {
            let buf = self.take_buffer(data);
            self.submit(buf);
        } else {
            if let Some(old) = self.pending.take() {
                warn!(
                    "Chunk was skipped due to slow data transfer ({})",
                    self.label
                );
                self.free.push(old);
            }
            self.pending = Some(self.take_buffer(data));
        }

        on_done(Ok(data.len()));
    }

    fn on_write_done(&mut self, result: &Result<usize, WriteError>) -> Result<(), WriteError> {
        self.reclaim();
        self.in_flight = false;

        match result {
            Ok(_) => {
                if let Some(next) = self.pending.take() {
                    self.submit(next);
                }
                Ok(())
            }
            Err(e) => {
                self.pending = None;
                Err(e.clone())
            }
        }
    }
}

/// File-backed writer used for offline outputs; writes complete
/// synchronously and `rewind` is supported so headers can be patched.
pub struct FileWriter {
    file: std::fs::File,
}

impl FileWriter {
    pub fn create(path: &std::path::Path) -> Result<Self, WriteError> {
        Ok(Self {
            file: std::fs::File::create(path)?,
        })
    }
}

impl AsyncWriter for FileWriter {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        self.file.write_all(data)?;
        Ok(data.len())
    }

    fn write_async(&mut self, data: &[u8], on_done: WriteCallback) {
        let result = self.write(data);
        on_done(result);
    }

    fn rewind(&mut self, pos: u64) -> Result<(), WriteError> {
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }
}

/// In-memory writer with rewind support; backs encoder unit tests and any
/// caller that wants the encoded stream as bytes.
#[derive(Default)]
pub struct MemoryWriter {
    data: Vec<u8>,
    cursor: usize,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl AsyncWriter for MemoryWriter {
    fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        let overwrite = (self.data.len() - self.cursor).min(data.len());
        self.data[self.cursor..self.cursor + overwrite].copy_from_slice(&data[..overwrite]);
        self.data.extend_from_slice(&data[overwrite..]);
        self.cursor += data.len();
        Ok(data.len())
    }

    fn write_async(&mut self, data: &[u8], on_done: WriteCallback) {
        let result = self.write(data);
        on_done(result);
    }

    fn rewind(&mut self, pos: u64) -> Result<(), WriteError> {
        if pos as usize > self.data.len() {
            return Err(WriteError::Io("rewind past end of buffer".into()));
        }
        self.cursor = pos as usize;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::Mutex;

    fn collecting_notify() -> (WriteNotify, Arc<Mutex<Vec<Result<usize, WriteError>>>>) {
        let seen: Arc<Mutex<Vec<Result<usize, WriteError>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (
            Arc::new(move |result| sink.lock().unwrap().push(result)),
            seen,
        )
    }

    #[test]
    fn test_buffered_writer_reports_no_buffer_space_when_exhausted() {
        let sink = ManualSink::new();
        let handle = sink.handle();
        let mut writer = BufferedWriter::new(sink.handle(), 2, None);

        assert!(writer.is_buffer_available());
        writer.write_async(b"one", noop_callback());
        writer.write_async(b"two", noop_callback());
        assert!(!writer.is_buffer_available());

        let refused = Arc::new(Mutex::new(None));
        let refused_clone = Arc::clone(&refused);
        writer.write_async(
            b"three",
            Box::new(move |result| {
                *refused_clone.lock().unwrap() = Some(result);
            }),
        );
        assert!(matches!(
            refused.lock().unwrap().take(),
            Some(Err(WriteError::NoBufferSpace))
        ));

        // Completing a transfer frees a pooled buffer for reuse.
        handle.complete_one();
        assert!(writer.is_buffer_available());
    }

    #[test]
    fn test_double_buffer_keeps_one_write_in_flight() {
        let sink = ManualSink::new();
        let handle = sink.handle();
        let (notify, _seen) = collecting_notify();
        let mut writer = DoubleBufferedWriter::new(sink.handle(), notify, "test");

        writer.write_async(b"aaaa", noop_callback());
        assert_eq!(handle.inflight_count(), 1);

        // Second write waits in the pending slot.
        writer.write_async(b"bbbb", noop_callback());
        assert_eq!(handle.inflight_count(), 1);

        handle.complete_one();
        writer.on_write_done(&Ok(4)).unwrap();
        assert_eq!(handle.inflight_count(), 1);
        handle.complete_one();
        writer.on_write_done(&Ok(4)).unwrap();

        let submitted = handle.submitted.lock().unwrap();
        assert_eq!(submitted.as_slice(), &[b"aaaa".to_vec(), b"bbbb".to_vec()]);
    }

    #[test]
    fn test_double_buffer_drops_older_pending_chunk() {
        let sink = ManualSink::new();
        let handle = sink.handle();
        let (notify, _seen) = collecting_notify();
        let mut writer = DoubleBufferedWriter::new(sink.handle(), notify, "test");

        writer.write_async(b"first", noop_callback());
        writer.write_async(b"second", noop_callback());
        writer.write_async(b"third", noop_callback());

        handle.complete_one();
        writer.on_write_done(&Ok(5)).unwrap();
        handle.complete_one();
        writer.on_write_done(&Ok(5)).unwrap();

        // "second" was replaced while pending; only first and third hit the wire.
        let submitted = handle.submitted.lock().unwrap();
        assert_eq!(submitted.as_slice(), &[b"first".to_vec(), b"third".to_vec()]);
    }

    #[test]
    fn test_double_buffer_surfaces_write_errors() {
        let sink = ManualSink::new();
        let (notify, _seen) = collecting_notify();
        let mut writer = DoubleBufferedWriter::new(sink.handle(), notify, "test");

        writer.write_async(b"data", noop_callback());
        writer.write_async(b"queued", noop_callback());
        let err = writer.on_write_done(&Err(WriteError::Closed));
        assert!(matches!(err, Err(WriteError::Closed)));
        // Pending data is discarded after a failed transfer.
        assert!(writer.pending.is_none());
    }

    #[test]
    fn test_memory_writer_rewind_overwrites() {
        let mut writer = MemoryWriter::new();
        writer.write(b"0123456789").unwrap();
        writer.rewind(4).unwrap();
        writer.write(b"AB").unwrap();
        assert_eq!(writer.bytes(), b"0123AB6789");
    }

    #[test]
    fn test_recording_sink_roundtrip() {
        let mut sink = RecordingSink::new(true);
        let written = Arc::clone(&sink.written);
        sink.submit(b"xyz".to_vec(), Box::new(|_, _| {}));
        assert_eq!(written.lock().unwrap().as_slice(), b"xyz");
    }
}
