//! Round-robin composition of several producers into one.

use std::time::Duration;

use tracing::error;

use crate::audio::chunk::Chunk;
use crate::audio::device::DeviceError;
use crate::pipeline::{OverflowHandler, Produce, Producer};

/// Recommended pause once a whole lap over the producers yields nothing.
const EMPTY_LAP_PAUSE: Duration = Duration::from_millis(100);

pub struct Multiplexor<P: Producer> {
    producers: Vec<P>,
    current: usize,
    empty_switches: usize,
}

impl<P: Producer> Multiplexor<P> {
    pub fn new(producers: Vec<P>) -> Self {
        Self {
            producers,
            current: 0,
            empty_switches: 0,
        }
    }

    fn switch_to_next_producer(&mut self) {
        if !self.producers.is_empty() {
            self.current = (self.current + 1) % self.producers.len();
        }
    }
}

impl<P: Producer> Producer for Multiplexor<P> {
    fn start(&mut self, on_overflow: OverflowHandler) -> Result<(), DeviceError> {
        for index in 0..self.producers.len() {
            if let Err(e) = self.producers[index].start(on_overflow.clone()) {
                error!("Could not start producer {index}: {e}");
                // Wind back the ones already capturing.
                for started in &mut self.producers[..index] {
                    started.stop(false);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn request_stop(&mut self, graceful: bool) {
        for producer in &mut self.producers {
            producer.request_stop(graceful);
        }
    }

    /// Fan-out stop: signal every producer first, then wait until all of
    /// them are idle.
    fn stop(&mut self, graceful: bool) {
        self.request_stop(graceful);

        loop {
            // stop() also reaps each producer's capture thread.
            for producer in &mut self.producers {
                producer.stop(graceful);
            }
            if !self.producers.iter().any(|p| p.is_running()) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn is_running(&self) -> bool {
        self.producers.iter().any(|p| p.is_running())
    }

    fn is_available(&self) -> bool {
        self.producers.iter().any(|p| p.is_available())
    }

    /// Ask the current producer for a chunk; rotate on an empty answer. A
    /// full lap with no yield recommends a pause so the scheduler does not
    /// busy-spin.
    fn produce(&mut self, consume: &mut dyn FnMut(&mut Chunk) -> bool) -> Produce {
        if self.producers.is_empty() {
            return Produce::Pause(EMPTY_LAP_PAUSE);
        }

        match self.producers[self.current].produce(consume) {
            Produce::Chunk => {
                self.empty_switches = 0;
                Produce::Chunk
            }
            Produce::Pause(pause) => Produce::Pause(pause),
            Produce::Empty => {
                self.switch_to_next_producer();
                self.empty_switches += 1;
                if self.empty_switches >= self.producers.len() {
                    self.empty_switches = 0;
                    Produce::Pause(EMPTY_LAP_PAUSE)
                } else {
                    Produce::Empty
                }
            }
        }
    }
}
