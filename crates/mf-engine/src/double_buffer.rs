//! Lock-free double buffer
//!
//! The audio thread fills the back buffer and publishes it by storing its
//! index into an atomic "ready index"; readers copy the front buffer out.
//! Samples are stored as atomic floats so a reader racing a very fast
//! writer sees stale values at worst, never undefined behaviour.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use portable_atomic::AtomicF32;

/// No buffer published yet
const NONE_READY: usize = usize::MAX;

struct Shared {
    buffers: [Box<[AtomicF32]>; 2],
    lens: [AtomicUsize; 2],
    ready: AtomicUsize,
    generation: AtomicU64,
}

/// Create a double buffer holding up to `capacity` samples per side
pub fn double_buffer(capacity: usize) -> (DoubleBufferWriter, DoubleBufferReader) {
    let side = || (0..capacity).map(|_| AtomicF32::new(0.0)).collect::<Box<[_]>>();
    let shared = Arc::new(Shared {
        buffers: [side(), side()],
        lens: [AtomicUsize::new(0), AtomicUsize::new(0)],
        ready: AtomicUsize::new(NONE_READY),
        generation: AtomicU64::new(0),
    });
    (
        DoubleBufferWriter {
            shared: Arc::clone(&shared),
            write_index: 0,
            fill: 0,
            capacity,
        },
        DoubleBufferReader { shared },
    )
}

/// Audio-thread side
pub struct DoubleBufferWriter {
    shared: Arc<Shared>,
    write_index: usize,
    fill: usize,
    capacity: usize,
}

impl DoubleBufferWriter {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one sample; publishes automatically when the window is full.
    /// Returns true when a window was published.
    #[inline]
    pub fn push(&mut self, sample: f32) -> bool {
        if self.capacity == 0 {
            return false;
        }
        self.shared.buffers[self.write_index][self.fill].store(sample, Ordering::Relaxed);
        self.fill += 1;
        if self.fill == self.capacity {
            self.publish();
            return true;
        }
        false
    }

    /// Replace the back buffer with `samples` (truncated to capacity) and publish it
    pub fn publish_block(&mut self, samples: &[f32]) {
        let n = samples.len().min(self.capacity);
        let back = &self.shared.buffers[self.write_index];
        for (dst, &src) in back[..n].iter().zip(&samples[..n]) {
            dst.store(src, Ordering::Relaxed);
        }
        self.fill = n;
        self.publish();
    }

    fn publish(&mut self) {
        let idx = self.write_index;
        self.shared.lens[idx].store(self.fill, Ordering::Relaxed);
        self.shared.ready.store(idx, Ordering::Release);
        self.shared.generation.fetch_add(1, Ordering::Release);
        self.write_index ^= 1;
        self.fill = 0;
    }

    /// Drop the partially filled window
    pub fn reset(&mut self) {
        self.fill = 0;
    }
}

/// Reader side, any thread
#[derive(Clone)]
pub struct DoubleBufferReader {
    shared: Arc<Shared>,
}

impl DoubleBufferReader {
    /// Number of windows published so far
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    /// Copy the latest published window into `out`. Returns its generation,
    /// or `None` when nothing was published yet.
    pub fn read(&self, out: &mut Vec<f32>) -> Option<u64> {
        let idx = self.shared.ready.load(Ordering::Acquire);
        if idx == NONE_READY {
            return None;
        }
        let generation = self.generation();
        let len = self.shared.lens[idx].load(Ordering::Relaxed);
        out.clear();
        out.extend(self.shared.buffers[idx][..len].iter().map(|s| s.load(Ordering::Relaxed)));
        Some(generation)
    }
}
