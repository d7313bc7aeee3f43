//! Lock-free ring buffer and the canonical audio frame
//!
//! The ring buffer is the only hand-off between real-time contexts: the
//! capture callback feeds the encode worker through one, and every remote
//! speaker has one as its jitter buffer. Writers never block; when the
//! buffer is full the oldest unread item is evicted.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::constants::{CHANNELS, FRAME_SAMPLES, SAMPLE_RATE};
use crate::error::AudioError;

/// One 60 ms block of canonical PCM (48 kHz, mono, i16)
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    /// Wrap exactly [`FRAME_SAMPLES`] samples
    pub fn new(samples: Vec<i16>) -> Result<Self, AudioError> {
        if samples.len() != FRAME_SAMPLES {
            return Err(AudioError::InvalidFrameLength {
                expected: FRAME_SAMPLES,
                actual: samples.len(),
            });
        }
        Ok(Self { samples })
    }

    /// A frame of digital silence
    pub fn silence() -> Self {
        Self {
            samples: vec![0; FRAME_SAMPLES],
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<i16> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    pub fn channels(&self) -> u16 {
        CHANNELS
    }

    /// Always [`FRAME_SAMPLES`]
    pub fn frame_count(&self) -> usize {
        self.samples.len()
    }

    /// Largest absolute sample value
    pub fn peak(&self) -> i16 {
        self.samples
            .iter()
            .map(|s| s.saturating_abs())
            .max()
            .unwrap_or(0)
    }
}

/// Fixed-capacity, lossy-on-overflow ring buffer
///
/// Intended for a single producer and a single consumer. `write` publishes
/// the item fully before it becomes visible to `read`, so a reader never
/// observes a partially written slot.
pub struct RingBuffer<T> {
    queue: ArrayQueue<T>,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl<T> RingBuffer<T> {
    /// Create a new ring buffer with the specified capacity
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Push an item, evicting the oldest unread one if full
    ///
    /// Returns the evicted item, if any.
    pub fn write(&self, item: T) -> Option<T> {
        let evicted = self.queue.force_push(item);
        if evicted.is_some() {
            self.overflow_count.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    /// Pop the oldest item, or `None` when empty (counted as an underrun)
    pub fn read(&self) -> Option<T> {
        match self.queue.pop() {
            Some(item) => Some(item),
            None => {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Pop without counting an underrun
    pub fn try_read(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Drop every unread item
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of unread items
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Items evicted because the consumer fell behind
    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    /// Reads that found the buffer empty
    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// Get fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.len() as f32 / self.capacity() as f32
    }
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer<T> = Arc<RingBuffer<T>>;

/// Create a new shared ring buffer
pub fn create_shared_buffer<T>(capacity: usize) -> SharedRingBuffer<T> {
    Arc::new(RingBuffer::new(capacity))
}
