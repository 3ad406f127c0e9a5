//! Bounded lock-free SPSC ring for handing audio chunks from the real-time
//! capture thread to the non-real-time consumer.
//!
//! Slots are constructed once with a caller-supplied initializer and refilled
//! in place: `enqueue` hands the producer a `&mut` to the slot, `dequeue`
//! hands the consumer the same. No element ever crosses the boundary by
//! value, which is what keeps the capture path allocation-free.
//!
//! The producer and consumer ends are distinct owned types, so the
//! single-producer/single-consumer contract is enforced at the type level.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[repr(align(64))]
struct CacheAligned(AtomicUsize);

struct RingInner<T> {
    mask: usize,
    capacity: usize,
    slots: Box<[UnsafeCell<T>]>,
    // Free-running indices; `& mask` maps them onto slots. `head` is owned by
    // the producer, `tail` by the consumer.
    head: CacheAligned,
    tail: CacheAligned,
}

// Slots are only ever accessed by the single producer (unfilled slots) or the
// single consumer (filled slots); the acquire/release pairing on head/tail
// publishes the slot contents across threads.
unsafe impl<T: Send> Send for RingInner<T> {}
unsafe impl<T: Send> Sync for RingInner<T> {}

pub struct RingProducer<T> {
    inner: Arc<RingInner<T>>,
}

pub struct RingConsumer<T> {
    inner: Arc<RingInner<T>>,
}

/// Create a ring holding `capacity` pre-initialised slots. `capacity` must be
/// a power of two.
pub fn ring_with_capacity<T, F: FnMut() -> T>(
    capacity: usize,
    mut init: F,
) -> (RingProducer<T>, RingConsumer<T>) {
    assert!(
        capacity != 0 && capacity.is_power_of_two(),
        "ring capacity must be a non-zero power of two"
    );

    let slots: Box<[UnsafeCell<T>]> = (0..capacity).map(|_| UnsafeCell::new(init())).collect();
    let inner = Arc::new(RingInner {
        mask: capacity - 1,
        capacity,
        slots,
        head: CacheAligned(AtomicUsize::new(0)),
        tail: CacheAligned(AtomicUsize::new(0)),
    });

    (
        RingProducer {
            inner: Arc::clone(&inner),
        },
        RingConsumer { inner },
    )
}

impl<T> RingProducer<T> {
    /// Fill the next free slot in place. When the ring is full the slot is
    /// left untouched and `on_overflow` is invoked exactly once. Both the
    /// writer and the overflow handler run synchronously and must be
    /// real-time safe.
    pub fn enqueue<W, O>(&mut self, write: W, on_overflow: O) -> bool
    where
        W: FnOnce(&mut T),
        O: FnOnce(),
    {
        let inner = &*self.inner;
        let head = inner.head.0.load(Ordering::Relaxed);
        let tail = inner.tail.0.load(Ordering::Acquire);

        if head.wrapping_sub(tail) < inner.capacity {
            // The slot at head is free: only this producer may touch it.
            unsafe { write(&mut *inner.slots[head & inner.mask].get()) };
            inner.head.0.store(head.wrapping_add(1), Ordering::Release);
            true
        } else {
            on_overflow();
            false
        }
    }
}

impl<T> RingConsumer<T> {
    /// Read the oldest filled slot in place and release it. On an empty ring
    /// `on_underflow` is invoked instead; underflow is the common case and is
    /// silent at this level.
    pub fn dequeue<R, U>(&mut self, read: R, on_underflow: U) -> bool
    where
        R: FnOnce(&mut T),
        U: FnOnce(),
    {
        self.dequeue_if(
            |slot| {
                read(slot);
                true
            },
            on_underflow,
        )
    }

    /// Like [`dequeue`](Self::dequeue), but the reader decides whether the
    /// slot is released: returning `false` keeps the element at the front of
    /// the ring so a deferred consumer can retry on the next cycle.
    pub fn dequeue_if<R, U>(&mut self, read: R, on_underflow: U) -> bool
    where
        R: FnOnce(&mut T) -> bool,
        U: FnOnce(),
    {
        let inner = &*self.inner;
        let tail = inner.tail.0.load(Ordering::Relaxed);
        let head = inner.head.0.load(Ordering::Acquire);

        if head.wrapping_sub(tail) > 0 {
            // The slot at tail is filled: only this consumer may touch it.
            let released = unsafe { read(&mut *inner.slots[tail & inner.mask].get()) };
            if released {
                inner.tail.0.store(tail.wrapping_add(1), Ordering::Release);
            }
            released
        } else {
            on_underflow();
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        let inner = &*self.inner;
        inner.head.0.load(Ordering::Acquire) == inner.tail.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_read_order_equals_write_order() {
        let (mut producer, mut consumer) = ring_with_capacity(8, || 0u32);

        for value in 1..=5u32 {
            assert!(producer.enqueue(|slot| *slot = value, || panic!("unexpected overflow")));
        }

        let mut seen = Vec::new();
        while consumer.dequeue(|slot| seen.push(*slot), || {}) {}
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_overflow_invokes_handler_exactly_once_and_preserves_state() {
        let (mut producer, mut consumer) = ring_with_capacity(2, || 0u32);

        assert!(producer.enqueue(|slot| *slot = 10, || {}));
        assert!(producer.enqueue(|slot| *slot = 20, || {}));

        let overflows = AtomicUsize::new(0);
        let accepted = producer.enqueue(
            |slot| *slot = 30,
            || {
                overflows.fetch_add(1, Ordering::Relaxed);
            },
        );
        assert!(!accepted);
        assert_eq!(overflows.load(Ordering::Relaxed), 1);

        // The two subsequent dequeues return the first two values in order.
        let mut seen = Vec::new();
        assert!(consumer.dequeue(|slot| seen.push(*slot), || {}));
        assert!(consumer.dequeue(|slot| seen.push(*slot), || {}));
        assert_eq!(seen, vec![10, 20]);
        assert!(!consumer.dequeue(|slot| seen.push(*slot), || {}));
    }

    #[test]
    fn test_underflow_invokes_handler() {
        let (_producer, mut consumer) = ring_with_capacity(2, || 0u32);

        let underflows = AtomicUsize::new(0);
        let got = consumer.dequeue(
            |_| panic!("nothing to read"),
            || {
                underflows.fetch_add(1, Ordering::Relaxed);
            },
        );
        assert!(!got);
        assert_eq!(underflows.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_deferred_reader_keeps_element() {
        let (mut producer, mut consumer) = ring_with_capacity(4, || 0u32);
        producer.enqueue(|slot| *slot = 7, || {});

        assert!(!consumer.dequeue_if(|_| false, || {}));
        let mut seen = Vec::new();
        assert!(consumer.dequeue(|slot| seen.push(*slot), || {}));
        assert_eq!(seen, vec![7]);
    }

    #[test]
    fn test_slots_are_reused_in_place() {
        let (mut producer, mut consumer) = ring_with_capacity(2, || Vec::<u8>::with_capacity(8));

        for round in 0..10u8 {
            producer.enqueue(
                |slot| {
                    slot.clear();
                    slot.push(round);
                },
                || panic!("unexpected overflow"),
            );
            let mut seen = None;
            consumer.dequeue(|slot| seen = Some(slot.clone()), || {});
            assert_eq!(seen.unwrap(), vec![round]);
        }
    }

    #[test]
    fn test_cross_thread_ordering() {
        let (mut producer, mut consumer) = ring_with_capacity(64, || 0u64);
        let total = 10_000u64;

        let handle = std::thread::spawn(move || {
            let mut next = 0u64;
            while next < total {
                let value = next;
                if producer.enqueue(|slot| *slot = value, || {}) {
                    next += 1;
                }
            }
        });

        let mut expected = 0u64;
        while expected < total {
            consumer.dequeue(
                |slot| {
                    assert_eq!(*slot, expected);
                    expected += 1;
                },
                std::thread::yield_now,
            );
        }
        handle.join().unwrap();
    }
}
