//! Sample-rate-aware composition of several consumers into one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::audio::chunk::Chunk;
use crate::pipeline::{Consumer, PipelineError};

pub struct Demultiplexor<C: Consumer> {
    consumers: Vec<C>,
    current: Option<usize>,
}

impl<C: Consumer> Demultiplexor<C> {
    pub fn new(consumers: Vec<C>) -> Self {
        Self {
            consumers,
            current: None,
        }
    }
}

impl<C: Consumer> Consumer for Demultiplexor<C> {
    fn start(&mut self) {
        for consumer in &mut self.consumers {
            consumer.start();
        }
    }

    fn stop(&mut self, on_done: Box<dyn FnOnce() + Send>) {
        let total = self.consumers.len();
        if total == 0 {
            on_done();
            return;
        }

        let remaining = Arc::new(AtomicUsize::new(total));
        let on_done = Arc::new(Mutex::new(Some(on_done)));
        for consumer in &mut self.consumers {
            let remaining = Arc::clone(&remaining);
            let on_done = Arc::clone(&on_done);
            consumer.stop(Box::new(move || {
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    if let Some(callback) = on_done.lock().unwrap().take() {
                        callback();
                    }
                }
            }));
        }
    }

    fn is_running(&self) -> bool {
        self.consumers.iter().any(|c| c.is_running())
    }

    fn sampling_rate(&self) -> u32 {
        self.current
            .map(|index| self.consumers[index].sampling_rate())
            .unwrap_or(0)
    }

    /// Dispatch the chunk to the consumer matching its rate, caching the
    /// match until the rate changes. Unmatched chunks are dropped with a
    /// warning; rate-0 end-of-stream chunks are absorbed silently.
    fn consume(&mut self, chunk: &mut Chunk) -> Result<bool, PipelineError> {
        let rate = chunk.sampling_rate();

        if let Some(index) = self.current {
            if self.consumers[index].sampling_rate() != rate {
                self.current = None;
            }
        }

        if self.current.is_none() {
            self.current = self
                .consumers
                .iter()
                .position(|consumer| consumer.sampling_rate() == rate);
        }

        match self.current {
            Some(index) => self.consumers[index].consume(chunk),
            None => {
                if rate != 0 {
                    warn!("Chunk was skipped as there is no matching consumer defined");
                }
                Ok(true)
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeConsumer;
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn chunk(rate: u32, bytes: &[u8]) -> Chunk {
        let mut chunk = Chunk::with_capacity(bytes.len().max(4));
        chunk.bytes_mut()[..bytes.len()].copy_from_slice(bytes);
        chunk.set_size(bytes.len());
        chunk.set_sampling_rate(rate);
        chunk
    }

    #[test]
    fn test_dispatch_follows_chunk_rate() {
        let mut demultiplexor =
            Demultiplexor::new(vec![FakeConsumer::new(44100), FakeConsumer::new(48000)]);

        demultiplexor.consume(&mut chunk(48000, &[1])).unwrap();
        demultiplexor.consume(&mut chunk(44100, &[2])).unwrap();
        demultiplexor.consume(&mut chunk(44100, &[3])).unwrap();

        assert_eq!(demultiplexor.consumers[0].consumed, vec![vec![2], vec![3]]);
        assert_eq!(demultiplexor.consumers[1].consumed, vec![vec![1]]);
        assert_eq!(demultiplexor.sampling_rate(), 44100);
    }

    #[test]
    fn test_unmatched_rate_is_dropped_and_eos_absorbed() {
        let mut demultiplexor = Demultiplexor::new(vec![FakeConsumer::new(44100)]);

        // No 96 kHz consumer: dropped, but still consumed.
        assert!(demultiplexor.consume(&mut chunk(96000, &[7])).unwrap());
        // End-of-stream chunks are absorbed silently.
        assert!(demultiplexor.consume(&mut chunk(0, &[])).unwrap());
        assert!(demultiplexor.consumers[0].consumed.is_empty());
    }

    #[test]
    fn test_stop_completes_after_all_consumers() {
        let mut demultiplexor =
            Demultiplexor::new(vec![FakeConsumer::new(44100), FakeConsumer::new(48000)]);
        demultiplexor.start();

        let done = Arc::new(AtomicBool::new(false));
        let done_clone = Arc::clone(&done);
        demultiplexor.stop(Box::new(move || {
            done_clone.store(true, Ordering::SeqCst);
        }));

        assert!(done.load(Ordering::SeqCst));
        assert!(!demultiplexor.is_running());
        assert_eq!(demultiplexor.consumers[0].stops, 1);
        assert_eq!(demultiplexor.consumers[1].stops, 1);
    }
}
