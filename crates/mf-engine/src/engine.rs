//! Audio callback engine
//!
//! [`Engine::render_block`] is the single entry point for both the hardware
//! callback and offline renders. Per block, strictly in order:
//!
//! ```text
//! guard → safety mute → input capture → snapshot → transport → automation
//!       → MIDI ingestion → clip rendering → track graph → PDC
//!       → aux / master mix → metronome → release ramp → fault scrub
//!       → master chain → hardware output → telemetry
//! ```
//!
//! The audio thread never blocks, allocates or logs. Anything that would
//! need to (a contended callback lock, a block larger than the prepared
//! buffers, a PDC ring that is too small) degrades the block and is counted
//! in [`Telemetry`]; housekeeping turns counters into log lines.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mf_core::{MAX_CHANNELS, MfError, MfResult, MidiEvent, Sample, validate_sample_rate};
use mf_dsp::analysis::BlockMeter;
use parking_lot::{Mutex, MutexGuard};

use crate::automation::{AutomationWriter, apply_lanes, automation_queue, clear_latches};
use crate::aux_bus::AuxBus;
use crate::clip_render::ClipRenderer;
use crate::config::{EngineConfig, MAX_BLOCK_SIZE};
use crate::control::{ControlBlock, ControlSlot};
use crate::double_buffer::{DoubleBufferReader, DoubleBufferWriter, double_buffer};
use crate::housekeeping::Housekeeper;
use crate::input::InputTap;
use crate::master::{MasterChain, MasterSettings};
use crate::metronome::Metronome;
use crate::midi::{LiveMidiReceiver, LiveMidiSender, MidiBuffer, live_midi_queue, resolve_midi_target};
use crate::note_engine::{NoteEngine, NoteScheduler};
use crate::pdc::{PDC_MARGIN, PdcExchange, PdcRing, PdcShared, pdc_exchange, required_capacity};
use crate::recording::{RecordingManager, RecordingTap};
use crate::safety::SafetyEnvelope;
use crate::scheduler::TrackScheduler;
use crate::snapshot::{ClipKind, SnapshotPublisher};
use crate::telemetry::{Counter, Telemetry};
use crate::transport::{Transport, TransportShared};

/// Peak (relative to the ceiling) that lights the clip indicator
const CLIP_THRESHOLD: f64 = 0.999;

/// Pending generated notes per block
const NOTE_SCHEDULER_CAPACITY: usize = 1024;

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE (audio thread)
// ═══════════════════════════════════════════════════════════════════════════════

/// Real-time engine, owned by the audio thread
pub struct Engine {
    config: EngineConfig,
    publisher: Arc<SnapshotPublisher>,
    control: Arc<ControlSlot>,
    transport_shared: Arc<TransportShared>,
    telemetry: Arc<Telemetry>,
    callback_lock: Arc<Mutex<()>>,
    panic: Arc<AtomicBool>,

    transport: Transport,
    safety: SafetyEnvelope,
    input: InputTap,
    scheduler: TrackScheduler,
    clips: ClipRenderer,
    aux: Vec<AuxBus>,
    master: MasterChain,
    metronome: Metronome,
    analyzer: DoubleBufferWriter,

    automation: AutomationWriter,
    live_midi: LiveMidiReceiver,
    note_engine: Option<Box<dyn NoteEngine>>,
    note_scheduler: NoteScheduler,
    generated: MidiBuffer,

    pdc: PdcExchange,
    pdc_shared: Arc<PdcShared>,
    recording: RecordingTap,

    mix_l: Vec<Sample>,
    mix_r: Vec<Sample>,
    /// Set after a severe fault until the control block reflects it
    fault_monitor_safe: bool,
}

impl Engine {
    /// Build the engine, its control handle and the housekeeper.
    ///
    /// Takes are written under the system temp directory until
    /// [`RecordingManager::set_output_dir`] says otherwise.
    pub fn new(config: EngineConfig, publisher: Arc<SnapshotPublisher>) -> MfResult<(Self, EngineHandle, Housekeeper)> {
        config.validate()?;
        publisher.set_sample_rate(config.sample_rate);

        let control = Arc::new(ControlSlot::new(ControlBlock::with_aux_buses(config.aux_bus_count)));
        let transport_shared = Arc::new(TransportShared::new());
        let telemetry = Arc::new(Telemetry::new(config.max_tracks));
        let callback_lock = Arc::new(Mutex::new(()));
        let panic = Arc::new(AtomicBool::new(false));

        let (input, input_feed) = InputTap::new(config.input_channels, config.max_block_size);
        let (analyzer, analyzer_feed) = double_buffer(config.analyzer_window);
        let (automation, writeback) = automation_queue(config.automation_queue_capacity);
        let (midi_sender, live_midi) = live_midi_queue(config.live_midi_queue_capacity);
        let (pdc, pdc_service, pdc_shared) = pdc_exchange(config.max_tracks, config.pdc_growth_margin);
        pdc_shared.reset(config.pdc_initial_capacity);
        let (recording_manager, recording) =
            RecordingManager::new(&config, std::env::temp_dir().join("mixframe-takes")).map_err(MfError::from)?;

        let safety = SafetyEnvelope::new(&config);
        let rearm = safety.rearm_handle();
        let sample_rate = config.sample_rate;
        let max_block = config.max_block_size;

        let engine = Self {
            publisher: Arc::clone(&publisher),
            control: Arc::clone(&control),
            transport_shared: Arc::clone(&transport_shared),
            telemetry: Arc::clone(&telemetry),
            callback_lock: Arc::clone(&callback_lock),
            panic: Arc::clone(&panic),
            transport: Transport::new(),
            safety,
            input,
            scheduler: TrackScheduler::new(&config),
            clips: ClipRenderer::new(max_block),
            aux: (0..config.aux_bus_count).map(|i| AuxBus::new(i, max_block, sample_rate)).collect(),
            master: MasterChain::new(sample_rate, config.master_ceiling),
            metronome: Metronome::new(sample_rate),
            analyzer,
            automation,
            live_midi,
            note_engine: None,
            note_scheduler: NoteScheduler::with_capacity(NOTE_SCHEDULER_CAPACITY),
            generated: MidiBuffer::with_capacity(config.midi_buffer_capacity),
            pdc,
            pdc_shared,
            recording,
            mix_l: vec![0.0; max_block],
            mix_r: vec![0.0; max_block],
            fault_monitor_safe: false,
            config: config.clone(),
        };

        let handle = EngineHandle {
            config,
            publisher: Arc::clone(&publisher),
            control: Arc::clone(&control),
            transport: Arc::clone(&transport_shared),
            telemetry: Arc::clone(&telemetry),
            callback_lock,
            panic,
            live_midi: midi_sender,
            input_feed,
            analyzer_feed,
            safety_rearm: rearm,
            recording: recording_manager,
        };

        let housekeeper = Housekeeper::new(publisher, control, transport_shared, telemetry, pdc_service, writeback);

        log::info!(
            "Engine created: {} Hz, {} samples max block, {} aux buses, {} track slots, workers: {}",
            sample_rate,
            max_block,
            engine.aux.len(),
            engine.scheduler.max_tracks(),
            if engine.scheduler.has_pool() { "pool" } else { "sequential" }
        );
        Ok((engine, handle, housekeeper))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> f64 {
        self.config.sample_rate
    }

    pub fn max_block_size(&self) -> usize {
        self.config.max_block_size
    }

    /// Current transport position in beats
    pub fn position(&self) -> f64 {
        self.transport.position()
    }

    /// Install the note engine fed by live MIDI
    pub fn set_note_engine(&mut self, engine: Box<dyn NoteEngine>) {
        self.note_engine = Some(engine);
        self.note_scheduler.clear();
    }

    /// Reconfigure for a new device sample rate and block size.
    ///
    /// Reallocates every buffer, resets DSP state, prepares the tracks of
    /// the current snapshot and re-arms the startup mute. Audio must not be
    /// running.
    pub fn prepare(&mut self, sample_rate: f64, max_block_size: usize) -> MfResult<()> {
        let sample_rate = validate_sample_rate(sample_rate)?;
        if max_block_size == 0 || max_block_size > MAX_BLOCK_SIZE {
            return Err(MfError::InvalidParam(format!("block size {max_block_size} outside 1..={MAX_BLOCK_SIZE}")));
        }
        self.config.sample_rate = sample_rate;
        self.config.max_block_size = max_block_size;

        let pdc_capacity = self.config.pdc_initial_capacity.max(max_block_size + PDC_MARGIN + 1);
        self.scheduler.prepare(max_block_size, pdc_capacity);
        self.pdc_shared.reset(pdc_capacity);
        self.clips.prepare(max_block_size);
        self.input.prepare(max_block_size);
        for bus in &mut self.aux {
            bus.prepare(sample_rate, max_block_size);
        }
        self.master.set_sample_rate(sample_rate);
        self.metronome.prepare(sample_rate);
        self.mix_l = vec![0.0; max_block_size];
        self.mix_r = vec![0.0; max_block_size];
        self.generated.clear();
        self.note_scheduler.clear();
        if let Some(note_engine) = self.note_engine.as_mut() {
            note_engine.reset();
        }
        self.publisher.set_sample_rate(sample_rate);

        if let Some(snapshot) = self.publisher.load() {
            for track in &snapshot.tracks {
                track.prepare_to_play(sample_rate, max_block_size);
            }
        }

        self.safety.reconfigure(&self.config);
        self.fault_monitor_safe = false;
        log::info!("Engine prepared: {sample_rate} Hz, {max_block_size} samples");
        Ok(())
    }

    /// Release track resources and clear DSP state (device stopped)
    pub fn release(&mut self) {
        if let Some(snapshot) = self.publisher.load() {
            for track in &snapshot.tracks {
                track.release_resources();
            }
        }
        for bus in &mut self.aux {
            bus.reset();
        }
        self.master.reset();
        self.metronome.reset();
        self.input.clear();
        self.analyzer.reset();
        self.safety.arm();
        log::info!("Engine released");
    }

    /// Graph latency the current snapshot resolves to. Control side only;
    /// audio must not be running.
    pub fn resolve_graph_latency(&mut self) -> usize {
        let Some(snapshot) = self.publisher.load() else {
            return 0;
        };
        if !self.scheduler.begin_block(snapshot.tracks.len(), 0) {
            return 0;
        }
        self.scheduler
            .resolve_routing(&snapshot.tracks, &self.aux, snapshot.any_soloed())
    }

    /// Grow every PDC ring to fit `graph_latency` up front, so no block has
    /// to skip compensation while housekeeping catches up. Audio must not be
    /// running.
    pub fn reserve_pdc(&mut self, graph_latency: usize) {
        let capacity = required_capacity(graph_latency, self.config.max_block_size);
        if capacity <= self.pdc_shared.capacity() {
            return;
        }
        for index in 0..self.scheduler.max_tracks() {
            self.scheduler.install_ring(index, PdcRing::new(capacity));
        }
        self.pdc_shared.reset(capacity);
        log::debug!("[PDC] reserved {capacity} samples for {graph_latency} samples of graph latency");
    }

    /// Render one block.
    ///
    /// `input` holds interleaved input frames (may be empty), `output`
    /// receives `frames` interleaved frames of `output_channels` channels.
    pub fn render_block(&mut self, input: &[f32], output: &mut [f32], frames: usize) {
        let started = Instant::now();
        let out_channels = self.config.output_channels.clamp(1, MAX_CHANNELS);

        // ── Guard ──────────────────────────────────────────────────────────
        if frames == 0 {
            return;
        }
        if frames > self.config.max_block_size || output.len() < frames * out_channels {
            output.fill(0.0);
            self.telemetry.increment(Counter::GuardDrop);
            return;
        }
        let output = &mut output[..frames * out_channels];

        // Tracks are only mutated under this lock; never wait for it
        let lock = Arc::clone(&self.callback_lock);
        let Some(_callback) = lock.try_lock() else {
            output.fill(0.0);
            self.telemetry.increment(Counter::LockContention);
            return;
        };

        // ── Startup / fault mute ───────────────────────────────────────────
        if self.safety.begin_block() {
            output.fill(0.0);
            self.telemetry.block_done();
            return;
        }

        // ── Input capture ──────────────────────────────────────────────────
        let levels = self.input.capture(input, frames);
        self.telemetry.set_input(levels.peak, levels.rms);
        self.recording.process_commands();

        // ── Snapshot acquire ───────────────────────────────────────────────
        let Some(snapshot) = self.publisher.load() else {
            output.fill(0.0);
            self.telemetry.block_done();
            return;
        };
        let control = self.control.load();
        let sample_rate = self.config.sample_rate;

        // ── Transport ──────────────────────────────────────────────────────
        let range = self.transport.advance(
            &self.transport_shared,
            &snapshot.tempo,
            control.loop_region(),
            frames,
            sample_rate,
        );
        if range.stopped {
            clear_latches(&snapshot.automation);
        }

        // ── Automation ─────────────────────────────────────────────────────
        let master_gain = apply_lanes(
            &snapshot.automation,
            &snapshot.tracks,
            range.start_beat(),
            range.playing,
            control.master_gain,
            &mut self.automation,
        );
        self.telemetry.mirror(Counter::DroppedAutomation, self.automation.dropped());

        if !self.scheduler.begin_block(snapshot.tracks.len(), frames) {
            output.fill(0.0);
            self.telemetry.increment(Counter::GuardDrop);
            self.telemetry.block_done();
            return;
        }

        // ── MIDI ingestion ─────────────────────────────────────────────────
        let panic = self.panic.swap(false, Ordering::AcqRel);
        if panic || range.stopped {
            for slot in self.scheduler.slots_mut() {
                slot.midi.push_panic(0);
            }
        }
        if panic {
            self.note_scheduler.clear();
            if let Some(note_engine) = self.note_engine.as_mut() {
                note_engine.reset();
            }
        }

        let target = resolve_midi_target(&snapshot.tracks, snapshot.selected_track);
        while let Some(message) = self.live_midi.pop() {
            let message = if message.is_note() {
                match message.transposed(snapshot.transpose) {
                    Some(m) => m,
                    None => continue,
                }
            } else {
                message
            };
            let Some(target) = target else { continue };
            if range.playing {
                self.recording.capture_midi(target, range.start_beat(), message);
            }
            match self.note_engine.as_mut() {
                Some(note_engine) => note_engine.process_incoming(message, &mut self.note_scheduler),
                None => {
                    if let Some(slot) = self.scheduler.slot_mut(target) {
                        slot.midi.push(MidiEvent::new(0, message));
                    }
                }
            }
        }

        self.generated.clear();
        self.note_scheduler.drain_block(frames, &mut self.generated);
        if let Some(note_engine) = self.note_engine.as_mut() {
            note_engine.process(frames, sample_rate, &mut self.generated);
        }
        if let Some(slot) = target.and_then(|t| self.scheduler.slot_mut(t)) {
            for event in self.generated.events() {
                slot.midi.push(*event);
            }
        }

        // ── Clip rendering ─────────────────────────────────────────────────
        if range.playing {
            for segment in range.segments() {
                for (index, clip) in snapshot.arrangement.iter().enumerate() {
                    if !segment.overlaps(clip.start_beat, clip.end_beat()) {
                        continue;
                    }
                    let Some(slot) = self.scheduler.slot_mut(clip.track_index) else {
                        continue;
                    };
                    match clip.kind {
                        ClipKind::Midi { .. } => {
                            ClipRenderer::render_midi(
                                clip,
                                segment,
                                &snapshot.tempo,
                                snapshot.transpose,
                                sample_rate,
                                &mut slot.midi,
                            );
                        }
                        ClipKind::Audio { .. } => {
                            let Some(stream) = snapshot.stream_for(index) else {
                                continue;
                            };
                            let (left, right) = slot.source_mut();
                            self.clips
                                .render_audio(clip, stream, segment, &snapshot.tempo, sample_rate, left, right);
                        }
                    }
                }
            }
        }
        let overflowed: u64 = self.scheduler.slots_mut().iter_mut().map(|s| s.midi.take_overflowed()).sum();
        self.telemetry.add(Counter::MidiOverflow, overflowed + self.generated.take_overflowed());

        // ── Track graph ────────────────────────────────────────────────────
        let graph_latency = self
            .scheduler
            .resolve_routing(&snapshot.tracks, &self.aux, snapshot.any_soloed());
        self.telemetry.set_graph_latency(graph_latency);

        let monitor_safe = control.monitor_safe || self.fault_monitor_safe;
        if control.monitor_safe {
            self.fault_monitor_safe = false;
        }
        let in_recovery = self.safety.in_recovery();
        let parallel = self.scheduler.should_parallelize(control.parallel, in_recovery, frames);
        let monitor = (control.input_monitoring && self.input.channels() > 0).then(|| self.input.planar());
        self.scheduler
            .run(&snapshot.tracks, monitor, monitor_safe, frames, parallel);

        // ── Recording ──────────────────────────────────────────────────────
        // Takes only advance while the transport rolls and the track is armed
        if range.playing && self.recording.any_recording() {
            let (left, right) = self.input.planar();
            for (track, handle) in snapshot.tracks.iter().enumerate() {
                if handle.is_armed() {
                    self.recording.write(track, left, right, frames);
                }
            }
        }

        // ── PDC ────────────────────────────────────────────────────────────
        let scheduler = &mut self.scheduler;
        self.pdc.receive(|index, ring| scheduler.install_ring(index, ring));
        if !self.scheduler.apply_pdc(graph_latency, frames, &self.pdc_shared) {
            self.telemetry.increment(Counter::PdcSkip);
        }

        // ── Aux / master mix ───────────────────────────────────────────────
        let mix_l = &mut self.mix_l[..frames];
        let mix_r = &mut self.mix_r[..frames];
        mix_l.fill(0.0);
        mix_r.fill(0.0);
        for bus in &mut self.aux {
            bus.clear(frames);
        }
        self.scheduler.mix(&mut self.aux, mix_l, mix_r, frames, &self.telemetry);

        for bus in &mut self.aux {
            let settings = control.aux_settings(bus.index());
            bus.process(&settings, !in_recovery, control.reduced_feedback, frames);
            let (left, right) = bus.output(frames);
            for (dst, src) in mix_l.iter_mut().zip(left) {
                *dst += src;
            }
            for (dst, src) in mix_r.iter_mut().zip(right) {
                *dst += src;
            }
        }

        // ── Metronome ──────────────────────────────────────────────────────
        if control.metronome && range.playing {
            self.metronome
                .render(range.segments(), mix_l, mix_r, control.metronome_level);
        }

        // ── Final assembly ─────────────────────────────────────────────────
        self.safety.apply_ramp(mix_l, mix_r);

        let faults = self.safety.scrub(mix_l, mix_r);
        if faults > 0 {
            self.telemetry.increment(Counter::SevereFault);
            // Feedback mitigation: cut live input paths until the control
            // thread publishes monitor-safe mode
            for track in snapshot.tracks.iter().filter(|t| t.is_monitoring()) {
                track.disable_monitoring();
            }
            self.fault_monitor_safe = true;
        }

        // ── Master chain ───────────────────────────────────────────────────
        let settings = MasterSettings::from_control(&control, master_gain);
        self.master.process(mix_l, mix_r, &settings);

        // ── Hardware output ────────────────────────────────────────────────
        for (i, frame) in output.chunks_exact_mut(out_channels).enumerate() {
            let (l, r) = (mix_l[i], mix_r[i]);
            if out_channels == 1 {
                frame[0] = (0.5 * (l + r)) as f32;
                continue;
            }
            frame[0] = l as f32;
            frame[1] = r as f32;
            frame[2..].fill(0.0);
        }
        for (l, r) in mix_l.iter().zip(mix_r.iter()) {
            self.analyzer.push((0.5 * (l + r)) as f32);
        }

        // ── Telemetry ──────────────────────────────────────────────────────
        let stats = BlockMeter::measure(mix_l, mix_r);
        self.telemetry
            .set_master(&stats, self.master.ceiling() * CLIP_THRESHOLD, self.config.clip_hold_blocks);

        let budget = Duration::from_secs_f64(frames as f64 / sample_rate);
        let elapsed = started.elapsed();
        self.telemetry.set_load(elapsed.as_secs_f64() / budget.as_secs_f64());
        if elapsed > budget {
            self.telemetry.increment(Counter::Xrun);
        }
        if self.safety.check_overload(elapsed, budget) {
            self.telemetry.increment(Counter::Overload);
        }
        self.safety.end_block();
        self.telemetry.block_done();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE HANDLE (control thread)
// ═══════════════════════════════════════════════════════════════════════════════

/// Control-thread access to a running engine
pub struct EngineHandle {
    config: EngineConfig,
    publisher: Arc<SnapshotPublisher>,
    control: Arc<ControlSlot>,
    transport: Arc<TransportShared>,
    telemetry: Arc<Telemetry>,
    callback_lock: Arc<Mutex<()>>,
    panic: Arc<AtomicBool>,
    live_midi: LiveMidiSender,
    input_feed: DoubleBufferReader,
    analyzer_feed: DoubleBufferReader,
    safety_rearm: Arc<AtomicBool>,
    recording: RecordingManager,
}

impl EngineHandle {
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn publisher(&self) -> &Arc<SnapshotPublisher> {
        &self.publisher
    }

    pub fn control(&self) -> &Arc<ControlSlot> {
        &self.control
    }

    /// Publish a modified copy of the control block. Returns its version.
    pub fn update_control(&self, f: impl FnOnce(&mut ControlBlock)) -> u64 {
        self.control.update(f)
    }

    pub fn transport(&self) -> &Arc<TransportShared> {
        &self.transport
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Queue a live MIDI message for the routed track
    pub fn send_midi(&mut self, message: mf_core::MidiMessage) -> bool {
        self.live_midi.send(message)
    }

    /// Live MIDI messages lost to a full queue
    pub fn midi_dropped(&self) -> u64 {
        self.live_midi.dropped()
    }

    /// All notes off on every track at the next block
    pub fn panic(&self) {
        self.panic.store(true, Ordering::Release);
        log::info!("[MIDI] panic requested");
    }

    /// Raw interleaved input of the last block
    pub fn input_feed(&self) -> &DoubleBufferReader {
        &self.input_feed
    }

    /// Mono-summed master output windows for spectrum display
    pub fn analyzer_feed(&self) -> &DoubleBufferReader {
        &self.analyzer_feed
    }

    /// Request a fresh mute window and release ramp
    pub fn rearm_safety(&self) {
        self.safety_rearm.store(true, Ordering::Release);
    }

    /// Scoped lock for mutating tracks. The audio thread skips blocks
    /// while it is held.
    pub fn lock_callback(&self) -> MutexGuard<'_, ()> {
        self.callback_lock.lock()
    }

    /// The callback lock itself, for renders that share this engine's tracks
    pub fn callback_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.callback_lock)
    }

    pub fn recording(&self) -> &RecordingManager {
        &self.recording
    }

    pub fn recording_mut(&mut self) -> &mut RecordingManager {
        &mut self.recording
    }

    /// Directory for new takes
    pub fn set_take_dir(&mut self, dir: impl Into<PathBuf>) {
        self.recording.set_output_dir(dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{Clip, Project};
    use crate::stream::{MemoryLibrary, MemoryStream};
    use crate::track::{BasicTrack, Track};
    use mf_core::{BeatMidiEvent, MidiMessage};

    const N: usize = 256;

    fn config() -> EngineConfig {
        EngineConfig {
            max_block_size: N,
            max_tracks: 8,
            worker_threads: 1,
            startup_mute_blocks: 2,
            startup_ramp_samples: 0,
            ..Default::default()
        }
    }

    fn engine_with(project: &Project, config: EngineConfig) -> (Engine, EngineHandle, Housekeeper) {
        let publisher = Arc::new(SnapshotPublisher::new());
        publisher.rebuild(project);
        Engine::new(config, publisher).unwrap()
    }

    fn render(engine: &mut Engine, blocks: usize) -> Vec<f32> {
        let mut all = Vec::new();
        let mut out = vec![0.0f32; N * 2];
        for _ in 0..blocks {
            engine.render_block(&[], &mut out, N);
            all.extend_from_slice(&out);
        }
        all
    }

    #[test]
    fn test_startup_mute_window() {
        let mut project = Project::new();
        project.add_track(Arc::new(BasicTrack::new("a")));
        let (mut engine, handle, _hk) = engine_with(&project, config());

        let mut input = vec![0.0f32; N * 2];
        input.iter_mut().for_each(|s| *s = 0.5);
        handle.update_control(|c| c.input_monitoring = true);

        let mut out = vec![1.0f32; N * 2];
        engine.render_block(&input, &mut out, N);
        assert!(out.iter().all(|&s| s == 0.0));
        engine.render_block(&input, &mut out, N);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(handle.telemetry().blocks(), 2);
    }

    #[test]
    fn test_guard_drops_oversized_block() {
        let (mut engine, handle, _hk) = engine_with(&Project::new(), config());
        let mut out = vec![1.0f32; (N + 1) * 2];
        engine.render_block(&[], &mut out, N + 1);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(handle.telemetry().counter(Counter::GuardDrop), 1);

        let mut short = vec![1.0f32; 10];
        engine.render_block(&[], &mut short, N);
        assert_eq!(handle.telemetry().counter(Counter::GuardDrop), 2);
    }

    #[test]
    fn test_no_snapshot_renders_silence() {
        let publisher = Arc::new(SnapshotPublisher::new());
        let (mut engine, _handle, _hk) = Engine::new(config(), publisher).unwrap();
        let out = render(&mut engine, 4);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_contended_lock_skips_block() {
        let (mut engine, handle, _hk) = engine_with(&Project::new(), config());
        let guard = handle.lock_callback();
        let mut out = vec![1.0f32; N * 2];
        engine.render_block(&[], &mut out, N);
        drop(guard);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(handle.telemetry().counter(Counter::LockContention), 1);
    }

    #[test]
    fn test_monitoring_input_reaches_output() {
        let mut project = Project::new();
        let track = BasicTrack::new("mic");
        track.set_monitoring(true);
        project.add_track(Arc::new(track));
        let mut cfg = config();
        cfg.startup_mute_blocks = 0;
        let (mut engine, handle, _hk) = engine_with(&project, cfg);
        handle.update_control(|c| {
            c.soft_clip = false;
            c.limiter = false;
            c.dc_block = false;
        });

        let input = vec![0.25f32; N * 2];
        let mut out = vec![0.0f32; N * 2];
        for _ in 0..8 {
            engine.render_block(&input, &mut out, N);
        }
        assert!(out.iter().any(|&s| s.abs() > 0.1));
        assert!(handle.telemetry().snapshot().input_peak > 0.2);
    }

    #[test]
    fn test_audio_clip_plays_when_transport_runs() {
        let library = Arc::new(MemoryLibrary::new());
        library.insert("tone.wav", MemoryStream::mono(vec![0.5; 96_000], 48_000.0));
        let publisher = Arc::new(SnapshotPublisher::with_opener(library));

        let mut project = Project::new();
        project.add_track(Arc::new(BasicTrack::new("audio")));
        project.add_clip(Clip::audio(0, 0.0, 4.0, "tone.wav", 48_000.0));
        publisher.rebuild(&project);

        let mut cfg = config();
        cfg.startup_mute_blocks = 0;
        let (mut engine, handle, _hk) = Engine::new(cfg, publisher).unwrap();

        let stopped = render(&mut engine, 2);
        assert!(stopped.iter().all(|&s| s == 0.0));

        handle.transport().play();
        let playing = render(&mut engine, 4);
        assert!(playing.iter().any(|&s| s.abs() > 0.1));
        assert!(engine.position() > 0.0);
    }

    #[test]
    fn test_midi_clip_drives_instrument() {
        let mut project = Project::new();
        project.add_track(Arc::new(BasicTrack::new("synth").with_instrument()));
        project.add_clip(Clip::midi(
            0,
            0.0,
            4.0,
            vec![BeatMidiEvent::new(0.0, MidiMessage::note_on(0, 69, 127))],
        ));
        let mut cfg = config();
        cfg.startup_mute_blocks = 0;
        let (mut engine, handle, _hk) = engine_with(&project, cfg);
        handle.transport().play();
        let out = render(&mut engine, 4);
        assert!(out.iter().any(|&s| s.abs() > 0.05));
    }

    #[test]
    fn test_live_midi_routed_to_armed_track() {
        let mut project = Project::new();
        project.add_track(Arc::new(BasicTrack::new("a").with_instrument()));
        let armed = BasicTrack::new("b").with_instrument();
        armed.set_armed(true);
        project.add_track(Arc::new(armed));
        let mut cfg = config();
        cfg.startup_mute_blocks = 0;
        let (mut engine, mut handle, _hk) = engine_with(&project, cfg);

        assert!(handle.send_midi(MidiMessage::note_on(0, 60, 127)));
        render(&mut engine, 2);
        assert_eq!(handle.telemetry().track_peak(0), 0.0);
        assert!(handle.telemetry().track_peak(1) > 0.0);
    }

    #[test]
    fn test_panic_silences_instrument() {
        let mut project = Project::new();
        project.add_track(Arc::new(BasicTrack::new("a").with_instrument()));
        let mut cfg = config();
        cfg.startup_mute_blocks = 0;
        let (mut engine, mut handle, _hk) = engine_with(&project, cfg);

        handle.send_midi(MidiMessage::note_on(0, 60, 127));
        render(&mut engine, 2);
        assert!(handle.telemetry().track_peak(0) > 0.0);

        handle.panic();
        render(&mut engine, 1);
        assert_eq!(handle.telemetry().track_peak(0), 0.0);
    }

    #[test]
    fn test_severe_fault_rearms_mute_and_disables_monitoring() {
        let mut project = Project::new();
        let track = Arc::new(BasicTrack::new("hot"));
        track.set_monitoring(true);
        track.set_volume(4.0);
        project.add_track(Arc::clone(&track) as Arc<dyn Track>);
        let mut cfg = config();
        cfg.startup_mute_blocks = 1;
        cfg.startup_ramp_samples = 0;
        let (mut engine, handle, _hk) = engine_with(&project, cfg);

        // Well past the fault amplitude after volume and pan
        let input = vec![16.0f32; N * 2];
        let mut out = vec![0.0f32; N * 2];
        engine.render_block(&input, &mut out, N); // startup mute
        engine.render_block(&input, &mut out, N);

        assert_eq!(handle.telemetry().counter(Counter::SevereFault), 1);
        assert!(!track.is_monitoring());
        assert!(out.iter().all(|s| s.is_finite() && s.abs() <= 1.0));

        // Next block is muted again
        out.fill(1.0);
        engine.render_block(&input, &mut out, N);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_prepare_rejects_bad_parameters() {
        let (mut engine, _handle, _hk) = engine_with(&Project::new(), config());
        assert!(engine.prepare(0.0, 256).is_err());
        assert!(engine.prepare(48_000.0, 0).is_err());
        assert!(engine.prepare(44_100.0, 512).is_ok());
        assert_eq!(engine.max_block_size(), 512);
        assert_eq!(engine.sample_rate(), 44_100.0);
    }

    #[test]
    fn test_analyzer_feed_publishes_windows() {
        let mut cfg = config();
        cfg.startup_mute_blocks = 0;
        cfg.analyzer_window = N;
        let (mut engine, handle, _hk) = engine_with(&Project::new(), cfg);
        render(&mut engine, 2);
        let mut window = Vec::new();
        assert!(handle.analyzer_feed().read(&mut window).is_some());
        assert_eq!(window.len(), N);
    }
}
