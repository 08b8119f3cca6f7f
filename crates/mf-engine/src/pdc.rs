//! Plugin Delay Compensation (PDC)
//!
//! Every track path (main and send) is delayed so that all paths reach the
//! mix with the same absolute latency:
//!
//! ```text
//!   path latency  = track latency + latency of the bus it feeds
//!   graph latency = max(all path latencies, all bus latencies)
//!   compensation  = graph latency - path latency
//! ```
//!
//! Each track owns a 4-channel ring (main L/R, send L/R). Rings only grow,
//! and growth happens off the audio thread: the audio thread publishes the
//! capacity it needs, housekeeping allocates larger rings and hands them
//! over through an SPSC queue, and the replaced rings travel back through a
//! second queue to be freed on the control thread. Until a big enough ring
//! arrives, compensation is skipped for the block.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use mf_core::Sample;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::track::Route;

// ═══════════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// Channels per track ring: main L/R, send L/R
pub const PDC_CHANNELS: usize = 4;

/// Headroom required beyond `graph latency + block size`
pub const PDC_MARGIN: usize = 64;

/// Latency of a track's two paths for one block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PathLatency {
    pub main: usize,
    /// `None` when the send path is inactive or feedback-suppressed
    pub send: Option<usize>,
}

impl PathLatency {
    /// Compute from the track's own latency and its routing
    pub fn compute(
        track_latency: usize,
        route: Route,
        send_bus: Option<usize>,
        bus_latency: impl Fn(usize) -> usize,
    ) -> Self {
        let main = track_latency + route.aux_index().map_or(0, &bus_latency);
        let send = send_bus.map(|bus| track_latency + bus_latency(bus));
        Self { main, send }
    }

    pub fn max(&self) -> usize {
        self.main.max(self.send.unwrap_or(0))
    }

    /// Compensation delays for `[main L, main R, send L, send R]`
    pub fn compensation(&self, graph_latency: usize) -> [usize; PDC_CHANNELS] {
        let main = graph_latency.saturating_sub(self.main);
        let send = graph_latency.saturating_sub(self.send.unwrap_or(self.main));
        [main, main, send, send]
    }
}

/// Capacity needed for `graph_latency` at `block_size`
#[inline]
pub fn required_capacity(graph_latency: usize, block_size: usize) -> usize {
    graph_latency + block_size + PDC_MARGIN
}

// ═══════════════════════════════════════════════════════════════════════════════
// RING
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-track 4-channel delay ring
#[derive(Debug, Clone)]
pub struct PdcRing {
    /// Channel-major, `PDC_CHANNELS * capacity`
    buffer: Vec<Sample>,
    capacity: usize,
    write_pos: usize,
}

impl PdcRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: vec![0.0; PDC_CHANNELS * capacity],
            capacity,
            write_pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `delay` can be applied to blocks of `block_size`
    #[inline]
    pub fn fits(&self, graph_latency: usize, block_size: usize) -> bool {
        self.capacity >= required_capacity(graph_latency, block_size)
    }

    pub fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
    }

    /// Delay each channel in place by its entry in `delays`.
    ///
    /// History is always written, so a later delay change reads real
    /// signal. Caller guarantees `fits(max delay, len)`.
    #[inline]
    pub fn process(&mut self, channels: [&mut [Sample]; PDC_CHANNELS], delays: [usize; PDC_CHANNELS], len: usize) {
        let cap = self.capacity;
        for (ch, (data, delay)) in channels.into_iter().zip(delays).enumerate() {
            let ring = &mut self.buffer[ch * cap..(ch + 1) * cap];
            let delay = delay.min(cap - 1);
            let mut write = self.write_pos;
            for sample in data[..len].iter_mut() {
                ring[write] = *sample;
                let read = (write + cap - delay) % cap;
                *sample = ring[read];
                write = (write + 1) % cap;
            }
        }
        self.write_pos = (self.write_pos + len) % cap;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CAPACITY HAND-OVER
// ═══════════════════════════════════════════════════════════════════════════════

/// Capacity bookkeeping shared by both sides
#[derive(Debug, Default)]
pub struct PdcShared {
    /// Largest capacity the audio thread has asked for
    required: AtomicUsize,
    /// Capacity of the rings most recently allocated
    capacity: AtomicUsize,
}

impl PdcShared {
    /// Audio thread: record the capacity this block needed
    #[inline]
    pub fn request(&self, capacity: usize) {
        self.required.fetch_max(capacity, Ordering::AcqRel);
    }

    pub fn required(&self) -> usize {
        self.required.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    pub(crate) fn reset(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Release);
        self.required.store(0, Ordering::Release);
    }
}

/// Audio-thread end of the ring hand-over
pub struct PdcExchange {
    incoming: Consumer<(usize, PdcRing)>,
    outgoing: Producer<PdcRing>,
}

impl PdcExchange {
    /// Swap in any delivered rings. `install(index, ring)` returns the replaced
    /// ring, which is sent back for freeing. Never blocks, never frees.
    pub fn receive(&mut self, mut install: impl FnMut(usize, PdcRing) -> Option<PdcRing>) -> usize {
        let mut installed = 0;
        // Only pop when the old ring has somewhere to go
        while self.outgoing.slots() > 0 {
            let Ok((index, ring)) = self.incoming.pop() else {
                break;
            };
            if let Some(old) = install(index, ring) {
                // Space checked above
                let _ = self.outgoing.push(old);
            }
            installed += 1;
        }
        installed
    }
}

/// Control-thread end: allocates grown rings
pub struct PdcCapacityService {
    shared: Arc<PdcShared>,
    to_audio: Producer<(usize, PdcRing)>,
    from_audio: Consumer<PdcRing>,
    track_slots: usize,
    growth_margin: usize,
    /// Next track index to deliver at the current target capacity
    next_index: usize,
    target: usize,
}

/// Create the hand-over pair for `track_slots` tracks
pub fn pdc_exchange(track_slots: usize, growth_margin: usize) -> (PdcExchange, PdcCapacityService, Arc<PdcShared>) {
    let slots = track_slots.max(1);
    let (to_audio, incoming) = RingBuffer::new(slots);
    let (outgoing, from_audio) = RingBuffer::new(slots);
    let shared = Arc::new(PdcShared::default());
    (
        PdcExchange { incoming, outgoing },
        PdcCapacityService {
            shared: Arc::clone(&shared),
            to_audio,
            from_audio,
            track_slots: slots,
            growth_margin,
            next_index: slots,
            target: 0,
        },
        shared,
    )
}

impl PdcCapacityService {
    /// Free returned rings and deliver larger ones if the audio thread needs them.
    /// Returns the new target capacity when a growth pass started.
    pub fn service(&mut self) -> Option<usize> {
        let mut freed = 0;
        while let Ok(ring) = self.from_audio.pop() {
            drop(ring);
            freed += 1;
        }
        if freed > 0 {
            log::debug!("[PDC] freed {freed} retired rings");
        }

        let mut started = None;
        let required = self.shared.required();
        let current = self.shared.capacity();
        if required > current && self.next_index >= self.track_slots {
            let target = (required + self.growth_margin).next_power_of_two();
            self.target = target;
            self.next_index = 0;
            started = Some(target);
            log::info!("[PDC] growing rings {current} -> {target} samples");
        }

        // Deliver as many as the queue takes; the rest go next tick
        let delivering = self.next_index < self.track_slots;
        while self.next_index < self.track_slots && self.to_audio.slots() > 0 {
            let ring = PdcRing::new(self.target);
            if self.to_audio.push((self.next_index, ring)).is_err() {
                break;
            }
            self.next_index += 1;
        }
        if delivering && self.next_index >= self.track_slots {
            self.shared.capacity.store(self.target, Ordering::Release);
        }
        started
    }

    pub fn shared(&self) -> &Arc<PdcShared> {
        &self.shared
    }

    /// Capacity after a prepare; cancels any growth in flight
    pub(crate) fn reset(&mut self, capacity: usize) {
        self.shared.reset(capacity);
        self.target = capacity;
        self.next_index = self.track_slots;
        while self.from_audio.pop().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impulse(len: usize, at: usize) -> Vec<Sample> {
        let mut v = vec![0.0; len];
        v[at] = 1.0;
        v
    }

    #[test]
    fn test_path_latency() {
        let bus = |b: usize| [100, 0][b];
        let p = PathLatency::compute(10, Route::AuxBus(0), Some(1), bus);
        assert_eq!(p.main, 110);
        assert_eq!(p.send, Some(10));
        assert_eq!(p.max(), 110);
        assert_eq!(p.compensation(200), [90, 90, 190, 190]);

        let p = PathLatency::compute(5, Route::Main, None, bus);
        assert_eq!(p.compensation(5), [0, 0, 0, 0]);
    }

    #[test]
    fn test_ring_delays_each_channel() {
        let mut ring = PdcRing::new(256);
        let mut a = impulse(64, 0);
        let mut b = impulse(64, 0);
        let mut c = impulse(64, 0);
        let mut d = impulse(64, 0);

        ring.process([&mut a, &mut b, &mut c, &mut d], [0, 5, 10, 63], 64);
        assert_eq!(a.iter().position(|&s| s == 1.0), Some(0));
        assert_eq!(b.iter().position(|&s| s == 1.0), Some(5));
        assert_eq!(c.iter().position(|&s| s == 1.0), Some(10));
        assert_eq!(d.iter().position(|&s| s == 1.0), Some(63));
    }

    #[test]
    fn test_ring_delay_across_blocks() {
        let mut ring = PdcRing::new(512);
        let mut found = None;
        for block in 0..4 {
            let mut main = if block == 0 { impulse(32, 3) } else { vec![0.0; 32] };
            let mut z1 = vec![0.0; 32];
            let mut z2 = vec![0.0; 32];
            let mut z3 = vec![0.0; 32];
            ring.process([&mut main, &mut z1, &mut z2, &mut z3], [70, 0, 0, 0], 32);
            if let Some(i) = main.iter().position(|&s| s == 1.0) {
                found = Some(block * 32 + i);
            }
        }
        assert_eq!(found, Some(73));
    }

    #[test]
    fn test_fits() {
        let ring = PdcRing::new(1024);
        assert!(ring.fits(512, 256));
        assert!(!ring.fits(1000, 256));
    }

    #[test]
    fn test_growth_handover() {
        let (mut exchange, mut service, shared) = pdc_exchange(3, 16);
        service.reset(128);
        assert_eq!(service.service(), None);

        shared.request(300);
        let target = service.service().unwrap();
        assert_eq!(target, 512);
        assert_eq!(shared.capacity(), 512);

        let mut rings = vec![PdcRing::new(128), PdcRing::new(128), PdcRing::new(128)];
        let installed = exchange.receive(|i, ring| Some(std::mem::replace(&mut rings[i], ring)));
        assert_eq!(installed, 3);
        assert!(rings.iter().all(|r| r.capacity() == 512));

        // Old rings come back and are freed; no new growth needed
        assert_eq!(service.service(), None);
    }
}
