//! Cooperative scheduler: pulls chunks from the producer side into the
//! consumer side in bounded quanta on the event-loop task.

use std::time::Duration;

use tracing::debug;

use crate::pipeline::{Consumer, OverflowHandler, PipelineError, Produce, Producer};

/// Upper bound on chunks moved within one scheduling quantum.
pub const MAX_CHUNKS_PER_QUANTUM: usize = 5;

pub struct Scheduler<P: Producer, C: Consumer> {
    producer: P,
    consumer: C,
}

impl<P: Producer, C: Consumer> Scheduler<P, C> {
    pub fn new(producer: P, consumer: C) -> Self {
        debug!("Scheduler object was created");
        Self { producer, consumer }
    }

    pub fn consumer_mut(&mut self) -> &mut C {
        &mut self.consumer
    }

    pub fn producer_mut(&mut self) -> &mut P {
        &mut self.producer
    }

    pub fn start(&mut self, on_overflow: OverflowHandler) -> Result<(), crate::audio::device::DeviceError> {
        self.producer.start(on_overflow)?;
        self.consumer.start();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.producer.is_running() || self.consumer.is_running()
    }

    /// Process up to [`MAX_CHUNKS_PER_QUANTUM`] chunks. A producer-reported
    /// pause ends the quantum early and is returned so the caller can
    /// reschedule with that delay. A consumer failure stops the pipeline:
    /// fail-fast is correct because the cause is almost always an
    /// irrecoverable device or encoder state.
    pub fn process_quantum(&mut self) -> Result<Option<Duration>, PipelineError> {
        let mut delay = None;
        let mut failure = None;

        let producer = &mut self.producer;
        let consumer = &mut self.consumer;

        for _ in 0..MAX_CHUNKS_PER_QUANTUM {
            if delay.is_some() || failure.is_some() {
                break;
            }

            let outcome = producer.produce(&mut |chunk| match consumer.consume(chunk) {
                Ok(consumed) => consumed,
                Err(e) => {
                    failure = Some(e);
                    true
                }
            });

            if let Produce::Pause(pause) = outcome {
                delay = Some(pause);
            }
        }

        if let Some(error) = failure {
            self.stop(false, Box::new(|| {}));
            return Err(error);
        }

        Ok(delay)
    }

    /// Producer-stop strictly precedes consumer-stop; `on_done` fires once
    /// both have completed.
    pub fn stop(&mut self, graceful: bool, on_done: Box<dyn FnOnce() + Send>) {
        self.producer.stop(graceful);
        self.consumer.stop(on_done);
    }
}

impl<P: Producer, C: Consumer> Drop for Scheduler<P, C> {
    fn drop(&mut self) {
        debug!("Scheduler object was deleted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::demultiplexor::testing::FakeConsumer;
    use crate::pipeline::multiplexor::testing::FakeProducer;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn chunks(n: usize) -> Vec<(u32, Vec<u8>)> {
        (0..n).map(|i| (44100, vec![i as u8])).collect()
    }

    #[test]
    fn test_quantum_is_bounded() {
        let producer = FakeProducer::new(chunks(20));
        let consumer = FakeConsumer::new(44100);
        let mut scheduler = Scheduler::new(producer, consumer);

        let delay = scheduler.process_quantum().unwrap();
        assert!(delay.is_none());
        assert_eq!(scheduler.producer_mut().produce_calls, MAX_CHUNKS_PER_QUANTUM);
        assert_eq!(scheduler.consumer_mut().consumed.len(), MAX_CHUNKS_PER_QUANTUM);
    }

    #[test]
    fn test_pause_breaks_the_quantum() {
        // Two chunks, then the producer runs dry and the multiplexor wraps
        // it into a pause recommendation.
        let producer = crate::pipeline::Multiplexor::new(vec![FakeProducer::new(chunks(2))]);
        let consumer = FakeConsumer::new(44100);
        let mut scheduler = Scheduler::new(producer, consumer);

        let delay = scheduler.process_quantum().unwrap();
        assert!(delay.is_some());
        assert_eq!(scheduler.consumer_mut().consumed.len(), 2);
    }

    #[test]
    fn test_consumer_failure_stops_the_pipeline() {
        struct FailingConsumer;
        impl Consumer for FailingConsumer {
            fn start(&mut self) {}
            fn stop(&mut self, on_done: Box<dyn FnOnce() + Send>) {
                on_done();
            }
            fn is_running(&self) -> bool {
                false
            }
            fn sampling_rate(&self) -> u32 {
                44100
            }
            fn consume(
                &mut self,
                _chunk: &mut crate::audio::chunk::Chunk,
            ) -> Result<bool, PipelineError> {
                Err(PipelineError::Encoder("boom".into()))
            }
        }

        let producer = FakeProducer::new(chunks(5));
        let mut scheduler = Scheduler::new(producer, FailingConsumer);
        assert!(scheduler.process_quantum().is_err());
        assert!(!scheduler.is_running());
    }

    #[test]
    fn test_stop_orders_producer_before_consumer() {
        let producer = FakeProducer::new(chunks(1));
        let consumer = FakeConsumer::new(44100);
        let mut scheduler = Scheduler::new(producer, consumer);
        scheduler.start(Arc::new(|| {})).unwrap();
        assert!(scheduler.is_running());

        let done = Arc::new(AtomicBool::new(false));
        let done_clone = Arc::clone(&done);
        scheduler.stop(true, Box::new(move || done_clone.store(true, Ordering::SeqCst)));
        assert!(done.load(Ordering::SeqCst));
        assert!(!scheduler.is_running());
    }
}
