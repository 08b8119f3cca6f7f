//! Track graph scheduler
//!
//! Every track owns a [`TrackSlot`]: dedicated main/send/source buffers, a
//! MIDI buffer and a PDC ring. A block runs in four steps:
//!
//! 1. `resolve_routing` reads each track's routing once and computes path
//!    latencies and the graph latency
//! 2. `run` executes all track jobs, across the worker pool or sequentially
//! 3. `apply_pdc` delays every path to the graph latency
//! 4. `mix` sums main outputs into the main mix or their aux bus, and sends
//!    into their aux bus
//!
//! Jobs never share a mutable buffer, so parallel dispatch needs no locks.

use std::sync::Arc;

use mf_core::Sample;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use smallvec::SmallVec;

use crate::aux_bus::AuxBus;
use crate::config::EngineConfig;
use crate::midi::MidiBuffer;
use crate::pdc::{PathLatency, PdcRing, PdcShared, required_capacity};
use crate::telemetry::Telemetry;
use crate::track::{ChannelViews, InputViews, Route, Track, TrackIo};

// ═══════════════════════════════════════════════════════════════════════════════
// TRACK SLOT
// ═══════════════════════════════════════════════════════════════════════════════

/// Pre-allocated per-track processing state
pub struct TrackSlot {
    main: [Vec<Sample>; 2],
    send: [Vec<Sample>; 2],
    source: [Vec<Sample>; 2],
    /// MIDI for the current block
    pub midi: MidiBuffer,
    pdc: PdcRing,
    latency: PathLatency,
    /// Main destination for this block
    route: Route,
    /// Send destination for this block; `None` when inactive or suppressed
    send_bus: Option<usize>,
    audible: bool,
    peak: f64,
}

impl TrackSlot {
    fn new(max_block: usize, midi_capacity: usize, pdc_capacity: usize) -> Self {
        let buffer = || [vec![0.0; max_block], vec![0.0; max_block]];
        Self {
            main: buffer(),
            send: buffer(),
            source: buffer(),
            midi: MidiBuffer::with_capacity(midi_capacity),
            pdc: PdcRing::new(pdc_capacity),
            latency: PathLatency::default(),
            route: Route::Main,
            send_bus: None,
            audible: true,
            peak: 0.0,
        }
    }

    fn block_capacity(&self) -> usize {
        self.main[0].len()
    }

    /// Rendered clip audio buffers for this block
    pub fn source_mut(&mut self) -> (&mut [Sample], &mut [Sample]) {
        let [l, r] = &mut self.source;
        (l.as_mut_slice(), r.as_mut_slice())
    }

    /// Main output of the last processed block
    pub fn main(&self, n: usize) -> (&[Sample], &[Sample]) {
        let n = n.min(self.block_capacity());
        (&self.main[0][..n], &self.main[1][..n])
    }

    /// Send output of the last processed block
    pub fn send(&self, n: usize) -> (&[Sample], &[Sample]) {
        let n = n.min(self.block_capacity());
        (&self.send[0][..n], &self.send[1][..n])
    }

    pub fn send_bus(&self) -> Option<usize> {
        self.send_bus
    }

    pub fn route(&self) -> Route {
        self.route
    }

    pub fn latency(&self) -> PathLatency {
        self.latency
    }

    pub fn pdc_capacity(&self) -> usize {
        self.pdc.capacity()
    }

    /// Clear the per-block inputs (MIDI and clip audio)
    fn begin_block(&mut self, n: usize) {
        let n = n.min(self.block_capacity());
        self.midi.clear();
        self.source[0][..n].fill(0.0);
        self.source[1][..n].fill(0.0);
    }

    /// Run one track job into this slot's buffers
    fn process(&mut self, track: &dyn Track, monitor: Option<(&[Sample], &[Sample])>, monitor_safe: bool, n: usize) {
        let n = n.min(self.block_capacity());
        let [main_l, main_r] = &mut self.main;
        let [send_l, send_r] = &mut self.send;
        main_l[..n].fill(0.0);
        main_r[..n].fill(0.0);
        send_l[..n].fill(0.0);
        send_r[..n].fill(0.0);

        let mut main: ChannelViews = SmallVec::new();
        main.push(&mut main_l[..n]);
        main.push(&mut main_r[..n]);
        let mut send: ChannelViews = SmallVec::new();
        send.push(&mut send_l[..n]);
        send.push(&mut send_r[..n]);
        let mut source: InputViews = SmallVec::new();
        source.push(&self.source[0][..n]);
        source.push(&self.source[1][..n]);

        let monitor = monitor.filter(|_| track.is_monitoring()).map(|(l, r)| {
            let mut views: InputViews = SmallVec::new();
            views.push(&l[..n.min(l.len())]);
            views.push(&r[..n.min(r.len())]);
            views
        });

        track.process_block_and_sends(TrackIo {
            main,
            send,
            midi: self.midi.events(),
            source,
            monitor,
            monitor_safe,
            num_samples: n,
        });

        self.peak = self.main[0][..n]
            .iter()
            .chain(&self.main[1][..n])
            .fold(0.0_f64, |peak, s| peak.max(s.abs()));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCHEDULER
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-track job execution and routing
pub struct TrackScheduler {
    slots: Vec<TrackSlot>,
    pool: Option<Arc<ThreadPool>>,
    min_tracks: usize,
    min_block: usize,
    max_block: usize,
    midi_capacity: usize,
    /// Tracks in the current block
    count: usize,
}

impl TrackScheduler {
    /// Slots for `config.max_tracks` tracks plus the worker pool
    pub fn new(config: &EngineConfig) -> Self {
        Self::with_pool(config, Self::build_pool(config))
    }

    /// Scheduler that never dispatches to workers (offline renders)
    pub fn sequential(config: &EngineConfig) -> Self {
        Self::with_pool(config, None)
    }

    fn with_pool(config: &EngineConfig, pool: Option<Arc<ThreadPool>>) -> Self {
        let slots = (0..config.max_tracks)
            .map(|_| TrackSlot::new(config.max_block_size, config.midi_buffer_capacity, config.pdc_initial_capacity))
            .collect();
        Self {
            slots,
            pool,
            min_tracks: config.parallel_min_tracks,
            min_block: config.parallel_min_block,
            max_block: config.max_block_size,
            midi_capacity: config.midi_buffer_capacity,
            count: 0,
        }
    }

    fn build_pool(config: &EngineConfig) -> Option<Arc<ThreadPool>> {
        let threads = config.resolved_worker_threads();
        if threads < 2 {
            return None;
        }
        match ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("mf-track-{i}"))
            .build()
        {
            Ok(pool) => {
                log::info!("Track worker pool: {threads} threads");
                Some(Arc::new(pool))
            }
            Err(e) => {
                log::warn!("Track worker pool unavailable, running sequentially: {e}");
                None
            }
        }
    }

    /// Reallocate every slot for a new block size
    pub fn prepare(&mut self, max_block: usize, pdc_capacity: usize) {
        self.max_block = max_block;
        let midi = self.midi_capacity;
        for slot in &mut self.slots {
            *slot = TrackSlot::new(max_block, midi, pdc_capacity);
        }
        self.count = 0;
    }

    pub fn has_pool(&self) -> bool {
        self.pool.is_some()
    }

    pub fn max_tracks(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Option<&TrackSlot> {
        self.slots[..self.count].get(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut TrackSlot> {
        self.slots[..self.count].get_mut(index)
    }

    /// Slots of the current block
    pub fn slots_mut(&mut self) -> &mut [TrackSlot] {
        &mut self.slots[..self.count]
    }

    /// Start a block with `tracks` tracks. Returns false when the slots or
    /// buffers are too small; the caller drops the block.
    pub fn begin_block(&mut self, tracks: usize, n: usize) -> bool {
        if tracks > self.slots.len() || n > self.max_block {
            return false;
        }
        self.count = tracks;
        for slot in &mut self.slots[..tracks] {
            slot.begin_block(n);
        }
        true
    }

    /// Resolve this block's routing and path latencies. Returns the graph
    /// latency: the largest path or bus latency.
    pub fn resolve_routing(&mut self, tracks: &[Arc<dyn Track>], aux: &[AuxBus], any_soloed: bool) -> usize {
        let bus_latency = |bus: usize| aux.get(bus).map_or(0, AuxBus::latency);
        let mut graph = aux.iter().map(AuxBus::latency).max().unwrap_or(0);

        for (slot, track) in self.slots[..self.count].iter_mut().zip(tracks) {
            // Routes to buses that do not exist fall back to the main mix
            let route = match track.output_route() {
                Route::AuxBus(bus) if bus < aux.len() => Route::AuxBus(bus),
                _ => Route::Main,
            };
            let send_bus = track.send_bus().filter(|&bus| bus < aux.len());
            // A send into the bus the track already feeds would loop back
            let send_bus = match send_bus {
                Some(bus) if route.aux_index() == Some(bus) && track.send_level() > 0.0 => None,
                other => other,
            };

            slot.route = route;
            slot.send_bus = send_bus;
            slot.audible = !track.is_muted() && (!any_soloed || track.is_soloed());
            slot.latency = PathLatency::compute(track.latency_samples(), route, send_bus, bus_latency);
            graph = graph.max(slot.latency.max());
        }
        graph
    }

    /// Whether this block should use the worker pool
    pub fn should_parallelize(&self, parallel_enabled: bool, in_recovery: bool, n: usize) -> bool {
        self.pool.is_some()
            && parallel_enabled
            && !in_recovery
            && self.count >= self.min_tracks.max(2)
            && n >= self.min_block
    }

    /// Run every track job. `monitor` is the live input handed to
    /// monitoring tracks.
    pub fn run(
        &mut self,
        tracks: &[Arc<dyn Track>],
        monitor: Option<(&[Sample], &[Sample])>,
        monitor_safe: bool,
        n: usize,
        parallel: bool,
    ) {
        let count = self.count.min(tracks.len());
        let slots = &mut self.slots[..count];
        let tracks = &tracks[..count];

        match self.pool.as_ref().filter(|_| parallel) {
            Some(pool) => pool.install(|| {
                slots
                    .par_iter_mut()
                    .zip(tracks.par_iter())
                    .for_each(|(slot, track)| slot.process(track.as_ref(), monitor, monitor_safe, n));
            }),
            None => {
                for (slot, track) in slots.iter_mut().zip(tracks) {
                    slot.process(track.as_ref(), monitor, monitor_safe, n);
                }
            }
        }
    }

    /// Delay every track path to `graph_latency`.
    ///
    /// When any ring is too small the needed capacity is requested from
    /// housekeeping and compensation is skipped for the whole block.
    /// Returns false in that case.
    pub fn apply_pdc(&mut self, graph_latency: usize, n: usize, shared: &PdcShared) -> bool {
        let slots = &mut self.slots[..self.count];
        if slots.iter().any(|s| !s.pdc.fits(graph_latency, n)) {
            shared.request(required_capacity(graph_latency, n));
            return false;
        }
        for slot in slots.iter_mut() {
            let delays = slot.latency.compensation(graph_latency);
            let [main_l, main_r] = &mut slot.main;
            let [send_l, send_r] = &mut slot.send;
            slot.pdc.process([&mut main_l[..], &mut main_r[..], &mut send_l[..], &mut send_r[..]], delays, n);
        }
        true
    }

    /// Install a ring delivered by housekeeping, returning the replaced one
    pub fn install_ring(&mut self, index: usize, ring: PdcRing) -> Option<PdcRing> {
        let slot = self.slots.get_mut(index)?;
        Some(std::mem::replace(&mut slot.pdc, ring))
    }

    /// Sum track outputs into `main` and the aux bus inputs, and publish
    /// per-track peaks.
    pub fn mix(
        &self,
        aux: &mut [AuxBus],
        main_l: &mut [Sample],
        main_r: &mut [Sample],
        n: usize,
        telemetry: &Telemetry,
    ) {
        let n = n.min(main_l.len()).min(main_r.len());
        for (index, slot) in self.slots[..self.count].iter().enumerate() {
            if !slot.audible {
                telemetry.set_track_peak(index, 0.0);
                continue;
            }
            telemetry.set_track_peak(index, slot.peak);

            let (l, r) = slot.main(n);
            match slot.route.aux_index().and_then(|bus| aux.get_mut(bus)) {
                Some(bus) => bus.add(l, r, n),
                None => {
                    for (dst, src) in main_l[..n].iter_mut().zip(l) {
                        *dst += src;
                    }
                    for (dst, src) in main_r[..n].iter_mut().zip(r) {
                        *dst += src;
                    }
                }
            }

            if let Some(bus) = slot.send_bus.and_then(|bus| aux.get_mut(bus)) {
                let (l, r) = slot.send(n);
                bus.add(l, r, n);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdc::PDC_MARGIN;
    use crate::track::BasicTrack;

    const N: usize = 64;

    fn config(max_tracks: usize) -> EngineConfig {
        EngineConfig {
            max_tracks,
            max_block_size: N,
            pdc_initial_capacity: 512,
            worker_threads: 1,
            ..Default::default()
        }
    }

    fn buses(count: usize) -> Vec<AuxBus> {
        (0..count).map(|i| AuxBus::new(i, N, 48_000.0)).collect()
    }

    fn tracks(list: Vec<BasicTrack>) -> Vec<Arc<dyn Track>> {
        list.into_iter().map(|t| Arc::new(t) as Arc<dyn Track>).collect()
    }

    fn fill_source(scheduler: &mut TrackScheduler, index: usize, value: Sample) {
        if let Some(slot) = scheduler.slot_mut(index) {
            let (l, r) = slot.source_mut();
            l[..N].fill(value);
            r[..N].fill(value);
        }
    }

    #[test]
    fn test_guard_rejects_oversized_block() {
        let mut scheduler = TrackScheduler::sequential(&config(2));
        assert!(!scheduler.begin_block(3, N));
        assert!(!scheduler.begin_block(1, N + 1));
        assert!(scheduler.begin_block(2, N));
    }

    #[test]
    fn test_sequential_mix_to_main() {
        let mut scheduler = TrackScheduler::sequential(&config(4));
        let tracks = tracks(vec![BasicTrack::new("a"), BasicTrack::new("b")]);
        let aux = buses(1);

        assert!(scheduler.begin_block(2, N));
        fill_source(&mut scheduler, 0, 0.25);
        fill_source(&mut scheduler, 1, 0.25);
        assert_eq!(scheduler.resolve_routing(&tracks, &aux, false), 0);
        scheduler.run(&tracks, None, false, N, false);

        let mut aux = aux;
        let (mut l, mut r) = (vec![0.0; N], vec![0.0; N]);
        let telemetry = Telemetry::new(4);
        scheduler.mix(&mut aux, &mut l, &mut r, N, &telemetry);

        let (gl, _) = mf_core::pan_gains(0.0);
        assert!((l[10] - 0.5 * gl).abs() < 1e-9);
        assert!(telemetry.track_peak(0) > 0.0);
    }

    #[test]
    fn test_muted_and_solo() {
        let mut scheduler = TrackScheduler::sequential(&config(4));
        let a = BasicTrack::new("a");
        let b = BasicTrack::new("b");
        let c = BasicTrack::new("c");
        a.set_muted(true);
        c.set_soloed(true);
        let tracks = tracks(vec![a, b, c]);
        let mut aux = buses(0);

        scheduler.begin_block(3, N);
        for i in 0..3 {
            fill_source(&mut scheduler, i, 0.1 * (i + 1) as f64);
        }
        scheduler.resolve_routing(&tracks, &aux, true);
        scheduler.run(&tracks, None, false, N, false);
        let (mut l, mut r) = (vec![0.0; N], vec![0.0; N]);
        scheduler.mix(&mut aux, &mut l, &mut r, N, &Telemetry::new(4));

        // Only the soloed track c
        let (gl, _) = mf_core::pan_gains(0.0);
        assert!((l[0] - 0.3 * gl).abs() < 1e-9);
    }

    #[test]
    fn test_send_into_own_output_bus_suppressed() {
        let mut scheduler = TrackScheduler::sequential(&config(2));
        let a = BasicTrack::new("a");
        a.set_output_route(Route::AuxBus(0));
        a.set_send_bus(Some(0));
        a.set_send_level(0.5);
        let tracks = tracks(vec![a]);
        let aux = buses(1);

        scheduler.begin_block(1, N);
        scheduler.resolve_routing(&tracks, &aux, false);
        assert_eq!(scheduler.slot(0).and_then(TrackSlot::send_bus), None);
        assert_eq!(scheduler.slot(0).map(TrackSlot::route), Some(Route::AuxBus(0)));
    }

    #[test]
    fn test_unknown_bus_falls_back_to_main() {
        let mut scheduler = TrackScheduler::sequential(&config(2));
        let a = BasicTrack::new("a");
        a.set_output_route(Route::AuxBus(7));
        let tracks = tracks(vec![a]);
        scheduler.begin_block(1, N);
        scheduler.resolve_routing(&tracks, &buses(1), false);
        assert_eq!(scheduler.slot(0).map(TrackSlot::route), Some(Route::Main));
    }

    #[test]
    fn test_graph_latency_is_max_path() {
        let mut scheduler = TrackScheduler::sequential(&config(4));
        let tracks = tracks(vec![BasicTrack::with_latency("a", 10), BasicTrack::with_latency("b", 37)]);
        scheduler.begin_block(2, N);
        assert_eq!(scheduler.resolve_routing(&tracks, &buses(1), false), 37);
        assert_eq!(scheduler.slot(0).map(|s| s.latency().compensation(37)[0]), Some(27));
    }

    #[test]
    fn test_pdc_skipped_when_ring_too_small() {
        let mut scheduler = TrackScheduler::sequential(&config(1));
        let shared = PdcShared::default();
        scheduler.begin_block(1, N);
        assert!(scheduler.apply_pdc(100, N, &shared));
        assert!(!scheduler.apply_pdc(1000, N, &shared));
        assert_eq!(shared.required(), 1000 + N + PDC_MARGIN);

        let old = scheduler.install_ring(0, PdcRing::new(4096));
        assert_eq!(old.map(|r| r.capacity()), Some(512));
        assert!(scheduler.apply_pdc(1000, N, &shared));
    }

    #[test]
    fn test_monitor_input_only_for_monitoring_tracks() {
        let mut scheduler = TrackScheduler::sequential(&config(2));
        let a = BasicTrack::new("a");
        a.set_monitoring(true);
        let tracks = tracks(vec![a, BasicTrack::new("b")]);
        let input = vec![0.5; N];

        scheduler.begin_block(2, N);
        scheduler.resolve_routing(&tracks, &buses(0), false);
        scheduler.run(&tracks, Some((&input, &input)), false, N, false);
        assert!(scheduler.slot(0).map_or(0.0, |s| s.main(N).0[0]) > 0.0);
        assert_eq!(scheduler.slot(1).map_or(1.0, |s| s.main(N).0[0]), 0.0);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let mut cfg = config(8);
        cfg.worker_threads = 2;
        cfg.parallel_min_tracks = 2;
        cfg.parallel_min_block = 16;
        let mut parallel = TrackScheduler::new(&cfg);
        let mut sequential = TrackScheduler::sequential(&cfg);
        let tracks = tracks((0..8).map(|i| BasicTrack::new(format!("t{i}"))).collect());

        let mut outputs = Vec::new();
        for (scheduler, use_pool) in [(&mut parallel, true), (&mut sequential, false)] {
            scheduler.begin_block(8, N);
            for i in 0..8 {
                fill_source(scheduler, i, 0.01 * i as f64);
            }
            scheduler.resolve_routing(&tracks, &buses(0), false);
            let go_parallel = use_pool && scheduler.should_parallelize(true, false, N);
            assert_eq!(go_parallel, use_pool && scheduler.has_pool());
            scheduler.run(&tracks, None, false, N, go_parallel);
            let (mut l, mut r) = (vec![0.0; N], vec![0.0; N]);
            scheduler.mix(&mut buses(0), &mut l, &mut r, N, &Telemetry::new(8));
            outputs.push(l);
        }
        assert_eq!(outputs[0], outputs[1]);
    }

    #[test]
    fn test_recovery_disables_parallel() {
        let mut cfg = config(8);
        cfg.worker_threads = 2;
        cfg.parallel_min_tracks = 2;
        let mut scheduler = TrackScheduler::new(&cfg);
        scheduler.begin_block(8, N);
        assert!(!scheduler.should_parallelize(true, true, N));
        assert!(!scheduler.should_parallelize(false, false, N));
    }
}
