//! Hand-off between the sensor-feed callback and the controller tick.
//!
//! Only two operations exist: `push` (callback side) and `drain` (tick side,
//! snapshot-and-clear). Both take the same lock, so a drain never observes a
//! half-finished push. Capacity is bounded so the report's one-byte sample
//! count cannot overflow; samples arriving while the queue is full are
//! dropped and counted.

use log::warn;
use std::sync::{Arc, Mutex, MutexGuard};
use crate::types::SensorSample;

#[derive(Debug)]
struct QueueState {
    samples: Vec<SensorSample>,
    capacity: usize,
    dropped: u64,
}

#[derive(Debug, Clone)]
pub struct SampleQueue {
    inner: Arc<Mutex<QueueState>>,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        SampleQueue {
            inner: Arc::new(Mutex::new(QueueState {
                samples: Vec::with_capacity(capacity),
                capacity,
                dropped: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panicking producer cannot leave a Vec half-pushed; keep going.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append one sample. Returns false if the queue was full.
    pub fn push(&self, sample: SensorSample) -> bool {
        let mut state = self.lock();
        if state.samples.len() >= state.capacity {
            state.dropped += 1;
            warn!("[Sensors] Sample queue full ({}), dropping broadcast", state.capacity);
            return false;
        }
        state.samples.push(sample);
        true
    }

    /// Take everything queued so far, leaving the queue empty.
    pub fn drain(&self) -> Vec<SensorSample> {
        let mut state = self.lock();
        let cap = state.capacity;
        std::mem::replace(&mut state.samples, Vec::with_capacity(cap))
    }

    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total samples rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}
