//! Track contract and reference track
//!
//! The per-track signal chain (inserts, instruments) is outside the engine.
//! The engine drives it through [`Track`]: one `process_block_and_sends`
//! call per block with pre-allocated buffers, plus lock-free accessors the
//! audio thread reads for routing, automation and PDC.
//!
//! Tracks are shared as `Arc<dyn Track>` between the control thread (which
//! mutates them under the callback lock) and every snapshot that lists them.

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use mf_core::{MAX_CHANNELS, MidiEvent, MidiMessage, Sample, cc, pan_gains};
use parking_lot::Mutex;
use portable_atomic::AtomicF64;
use smallvec::SmallVec;

// ═══════════════════════════════════════════════════════════════════════════════
// ROUTING
// ═══════════════════════════════════════════════════════════════════════════════

/// Output destination, resolved once per block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Route {
    /// Main mix bus
    #[default]
    Main,
    /// Aux bus by index
    AuxBus(usize),
}

impl Route {
    pub fn aux_index(self) -> Option<usize> {
        match self {
            Route::Main => None,
            Route::AuxBus(idx) => Some(idx),
        }
    }

    const MAIN_BITS: usize = usize::MAX;

    fn to_bits(self) -> usize {
        match self {
            Route::Main => Self::MAIN_BITS,
            Route::AuxBus(idx) => idx,
        }
    }

    fn from_bits(bits: usize) -> Self {
        if bits == Self::MAIN_BITS {
            Route::Main
        } else {
            Route::AuxBus(bits)
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRACK I/O
// ═══════════════════════════════════════════════════════════════════════════════

/// Writable channel views, capped at `MAX_CHANNELS`
pub type ChannelViews<'a> = SmallVec<[&'a mut [Sample]; MAX_CHANNELS]>;

/// Read-only channel views, capped at `MAX_CHANNELS`
pub type InputViews<'a> = SmallVec<[&'a [Sample]; MAX_CHANNELS]>;

/// Buffers handed to a track for one block. All views hold `num_samples`.
pub struct TrackIo<'a> {
    /// Main output, cleared before the call
    pub main: ChannelViews<'a>,
    /// Send output, cleared before the call
    pub send: ChannelViews<'a>,
    /// MIDI for this block, sorted by offset
    pub midi: &'a [MidiEvent],
    /// Rendered audio clip content
    pub source: InputViews<'a>,
    /// Live input, present only while the track is monitoring
    pub monitor: Option<InputViews<'a>>,
    /// Conservative monitoring requested by the safety envelope
    pub monitor_safe: bool,
    pub num_samples: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRACK CONTRACT
// ═══════════════════════════════════════════════════════════════════════════════

/// Track processing contract
///
/// All methods take `&self`; state the audio thread writes (parameter
/// automation, DSP state) uses interior mutability.
pub trait Track: Send + Sync {
    fn name(&self) -> &str;

    /// Render one block into `io.main` (post fader) and `io.send` (send level applied)
    fn process_block_and_sends(&self, io: TrackIo<'_>);

    /// Processing latency of the track's own chain
    fn latency_samples(&self) -> usize {
        0
    }

    fn volume(&self) -> f64;
    fn set_volume(&self, volume: f64);

    fn pan(&self) -> f64;
    fn set_pan(&self, pan: f64);

    fn send_level(&self) -> f64;
    fn set_send_level(&self, level: f64);

    fn output_route(&self) -> Route {
        Route::Main
    }

    /// Aux bus fed by the send output
    fn send_bus(&self) -> Option<usize> {
        None
    }

    fn is_muted(&self) -> bool {
        false
    }

    fn is_soloed(&self) -> bool {
        false
    }

    fn is_armed(&self) -> bool {
        false
    }

    fn is_monitoring(&self) -> bool {
        false
    }

    /// Whether MIDI routed here produces sound
    fn accepts_midi(&self) -> bool {
        false
    }

    /// Disable live input monitoring (feedback mitigation)
    fn disable_monitoring(&self) {}

    fn prepare_to_play(&self, _sample_rate: f64, _max_block_size: usize) {}

    fn release_resources(&self) {}
}

// ═══════════════════════════════════════════════════════════════════════════════
// BASIC TRACK
// ═══════════════════════════════════════════════════════════════════════════════

/// Maximum simultaneous sine voices
const MAX_VOICES: usize = 16;

/// Voice release coefficient per sample
const RELEASE_COEFF: f64 = 0.995;

/// Monitor attenuation in monitor-safe mode (-12 dB)
const MONITOR_SAFE_GAIN: f64 = 0.25;

#[derive(Debug, Clone, Copy)]
struct Voice {
    note: u8,
    phase: f64,
    increment: f64,
    amplitude: f64,
    releasing: bool,
}

struct TrackState {
    sample_rate: f64,
    voices: [Option<Voice>; MAX_VOICES],
    /// Latency delay lines (L, R), length `latency`
    delay: [Vec<Sample>; 2],
    delay_pos: usize,
}

impl TrackState {
    fn new(latency: usize) -> Self {
        Self {
            sample_rate: 48_000.0,
            voices: [None; MAX_VOICES],
            delay: [vec![0.0; latency], vec![0.0; latency]],
            delay_pos: 0,
        }
    }

    fn handle_midi(&mut self, message: MidiMessage) {
        if message.is_note_on() {
            let note = message.data1;
            let increment = TAU * 440.0 * 2.0_f64.powf((note as f64 - 69.0) / 12.0) / self.sample_rate;
            let voice = Voice {
                note,
                phase: 0.0,
                increment,
                amplitude: 0.2 * message.data2 as f64 / 127.0,
                releasing: false,
            };
            // Reuse a free slot, else steal the first
            let slot = self.voices.iter().position(Option::is_none).unwrap_or(0);
            self.voices[slot] = Some(voice);
        } else if message.is_note_off() {
            for v in self.voices.iter_mut().flatten() {
                if v.note == message.data1 {
                    v.releasing = true;
                }
            }
        } else if message.kind() == mf_core::status::CONTROL_CHANGE
            && (message.data1 == cc::ALL_NOTES_OFF || message.data1 == cc::ALL_SOUND_OFF)
        {
            self.voices = [None; MAX_VOICES];
        }
    }

    #[inline]
    fn render_voices(&mut self) -> Sample {
        let mut out = 0.0;
        for slot in self.voices.iter_mut() {
            let Some(v) = slot else { continue };
            out += v.phase.sin() * v.amplitude;
            v.phase = (v.phase + v.increment) % TAU;
            if v.releasing {
                v.amplitude *= RELEASE_COEFF;
                if v.amplitude < 1e-5 {
                    *slot = None;
                }
            }
        }
        out
    }

    #[inline]
    fn delay(&mut self, l: Sample, r: Sample) -> (Sample, Sample) {
        let len = self.delay[0].len();
        if len == 0 {
            return (l, r);
        }
        let out = (self.delay[0][self.delay_pos], self.delay[1][self.delay_pos]);
        self.delay[0][self.delay_pos] = l;
        self.delay[1][self.delay_pos] = r;
        self.delay_pos = (self.delay_pos + 1) % len;
        out
    }

    fn reset(&mut self) {
        self.voices = [None; MAX_VOICES];
        self.delay.iter_mut().for_each(|d| d.fill(0.0));
        self.delay_pos = 0;
    }
}

/// Reference track: clip audio + monitor input + a sine voice per MIDI note,
/// an optional fixed processing latency, then volume/pan and a post-fader send.
pub struct BasicTrack {
    name: String,
    volume: AtomicF64,
    pan: AtomicF64,
    send_level: AtomicF64,
    route: AtomicUsize,
    send_bus: AtomicUsize,
    muted: AtomicBool,
    soloed: AtomicBool,
    armed: AtomicBool,
    monitoring: AtomicBool,
    midi: bool,
    latency: usize,
    state: Mutex<TrackState>,
}

impl BasicTrack {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_latency(name, 0)
    }

    /// Track whose chain reports and applies `latency` samples of delay
    pub fn with_latency(name: impl Into<String>, latency: usize) -> Self {
        Self {
            name: name.into(),
            volume: AtomicF64::new(1.0),
            pan: AtomicF64::new(0.0),
            send_level: AtomicF64::new(0.0),
            route: AtomicUsize::new(Route::Main.to_bits()),
            send_bus: AtomicUsize::new(usize::MAX),
            muted: AtomicBool::new(false),
            soloed: AtomicBool::new(false),
            armed: AtomicBool::new(false),
            monitoring: AtomicBool::new(false),
            midi: false,
            latency,
            state: Mutex::new(TrackState::new(latency)),
        }
    }

    /// Enable the built-in sine instrument
    pub fn with_instrument(mut self) -> Self {
        self.midi = true;
        self
    }

    pub fn set_output_route(&self, route: Route) {
        self.route.store(route.to_bits(), Ordering::Release);
    }

    pub fn set_send_bus(&self, bus: Option<usize>) {
        self.send_bus.store(bus.unwrap_or(usize::MAX), Ordering::Release);
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn set_soloed(&self, soloed: bool) {
        self.soloed.store(soloed, Ordering::Release);
    }

    pub fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::Release);
    }

    pub fn set_monitoring(&self, monitoring: bool) {
        self.monitoring.store(monitoring, Ordering::Release);
    }
}

impl Track for BasicTrack {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_block_and_sends(&self, mut io: TrackIo<'_>) {
        // Contended only while the control thread resets the track
        let Some(mut state) = self.state.try_lock() else {
            return;
        };
        if io.main.len() < 2 || io.num_samples == 0 {
            return;
        }

        let n = io.num_samples;
        let (gain_l, gain_r) = pan_gains(self.pan.load(Ordering::Relaxed));
        let volume = self.volume.load(Ordering::Relaxed);
        let send = self.send_level.load(Ordering::Relaxed);
        let monitor_gain = if io.monitor_safe { MONITOR_SAFE_GAIN } else { 1.0 };

        let usable = |s: &&[Sample]| s.len() >= n;
        let source_l = io.source.first().copied().filter(usable);
        let source_r = io.source.get(1).copied().filter(usable).or(source_l);
        let monitor_l = io.monitor.as_ref().and_then(|m| m.first().copied()).filter(usable);
        let monitor_r = io
            .monitor
            .as_ref()
            .and_then(|m| m.get(1).copied())
            .filter(usable)
            .or(monitor_l);

        let mut events = io.midi.iter().peekable();

        for i in 0..n {
            while let Some(event) = events.next_if(|e| e.offset as usize <= i) {
                if self.midi {
                    state.handle_midi(event.message);
                }
            }

            let voice = if self.midi { state.render_voices() } else { 0.0 };
            let mut l = voice + source_l.map_or(0.0, |s| s[i]);
            let mut r = voice + source_r.map_or(0.0, |s| s[i]);
            l += monitor_l.map_or(0.0, |s| s[i] * monitor_gain);
            r += monitor_r.map_or(0.0, |s| s[i] * monitor_gain);

            let (l, r) = state.delay(l, r);
            let out_l = l * volume * gain_l;
            let out_r = r * volume * gain_r;

            io.main[0][i] = out_l;
            io.main[1][i] = out_r;
            if io.send.len() >= 2 {
                io.send[0][i] = out_l * send;
                io.send[1][i] = out_r * send;
            }
        }
    }

    fn latency_samples(&self) -> usize {
        self.latency
    }

    fn volume(&self) -> f64 {
        self.volume.load(Ordering::Relaxed)
    }

    fn set_volume(&self, volume: f64) {
        if volume.is_finite() {
            self.volume.store(volume.clamp(0.0, 4.0), Ordering::Relaxed);
        }
    }

    fn pan(&self) -> f64 {
        self.pan.load(Ordering::Relaxed)
    }

    fn set_pan(&self, pan: f64) {
        if pan.is_finite() {
            self.pan.store(pan.clamp(-1.0, 1.0), Ordering::Relaxed);
        }
    }

    fn send_level(&self) -> f64 {
        self.send_level.load(Ordering::Relaxed)
    }

    fn set_send_level(&self, level: f64) {
        if level.is_finite() {
            self.send_level.store(level.clamp(0.0, 4.0), Ordering::Relaxed);
        }
    }

    fn output_route(&self) -> Route {
        Route::from_bits(self.route.load(Ordering::Acquire))
    }

    fn send_bus(&self) -> Option<usize> {
        let bus = self.send_bus.load(Ordering::Acquire);
        (bus != usize::MAX).then_some(bus)
    }

    fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    fn is_soloed(&self) -> bool {
        self.soloed.load(Ordering::Acquire)
    }

    fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::Acquire)
    }

    fn accepts_midi(&self) -> bool {
        self.midi
    }

    fn disable_monitoring(&self) {
        self.set_monitoring(false);
    }

    fn prepare_to_play(&self, sample_rate: f64, _max_block_size: usize) {
        let mut state = self.state.lock();
        state.sample_rate = sample_rate;
        state.reset();
    }

    fn release_resources(&self) {
        self.state.lock().reset();
    }
}
