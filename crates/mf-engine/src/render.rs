//! Background (offline) render
//!
//! Drives a private [`Engine`] through the same `render_block` routine the
//! hardware callback uses, over a beat range, into a 32-bit float WAV:
//! - One render at a time (busy flag; a second start is [`RenderError::Busy`])
//! - Cooperative cancel, checked once per block
//! - Progress as an atomic fraction
//! - The partial file is removed on cancel or error
//!
//! The private engine shares tracks with the live engine through the
//! snapshot publisher, so the render holds the live callback lock for its
//! whole duration. Live blocks are skipped (and counted) meanwhile.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use mf_core::MfError;
use parking_lot::Mutex;
use portable_atomic::AtomicF64;
use thiserror::Error;

use crate::config::EngineConfig;
use crate::control::ControlBlock;
use crate::engine::Engine;
use crate::snapshot::SnapshotPublisher;

/// Render output is always stereo
const RENDER_CHANNELS: usize = 2;

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("A background render is already running")]
    Busy,

    #[error("Render cancelled")]
    Cancelled,

    #[error("Invalid beat range {start}..{end}")]
    InvalidRange { start: f64, end: f64 },

    #[error("Nothing to render: no snapshot published")]
    NoSnapshot,

    #[error("Engine error: {0}")]
    Engine(#[from] MfError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

impl From<RenderError> for MfError {
    fn from(e: RenderError) -> Self {
        match e {
            RenderError::Cancelled => MfError::Cancelled,
            RenderError::Engine(inner) => inner,
            other => MfError::Render(other.to_string()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REQUEST / OUTCOME
// ═══════════════════════════════════════════════════════════════════════════════

/// What to render and where
pub struct RenderRequest {
    /// Engine configuration; startup mute and ramp are disabled for the render
    pub config: EngineConfig,
    /// Source of the project snapshot (usually the live engine's publisher)
    pub publisher: Arc<SnapshotPublisher>,
    /// Mixer settings; `None` uses the defaults
    pub control: Option<ControlBlock>,
    pub start_beat: f64,
    pub end_beat: f64,
    pub output: PathBuf,
    /// Live engine callback lock, held while rendering
    pub live_lock: Option<Arc<Mutex<()>>>,
}

impl RenderRequest {
    pub fn new(
        config: EngineConfig,
        publisher: Arc<SnapshotPublisher>,
        start_beat: f64,
        end_beat: f64,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            publisher,
            control: None,
            start_beat,
            end_beat,
            output: output.into(),
            live_lock: None,
        }
    }

    pub fn with_control(mut self, control: ControlBlock) -> Self {
        self.control = Some(control);
        self
    }

    pub fn with_live_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.live_lock = Some(lock);
        self
    }

    fn validate(&self) -> Result<(), RenderError> {
        let valid = self.start_beat.is_finite()
            && self.end_beat.is_finite()
            && self.start_beat >= 0.0
            && self.end_beat > self.start_beat;
        if valid {
            Ok(())
        } else {
            Err(RenderError::InvalidRange {
                start: self.start_beat,
                end: self.end_beat,
            })
        }
    }
}

/// A finished render
#[derive(Debug, Clone, PartialEq)]
pub struct RenderOutcome {
    pub path: PathBuf,
    pub frames: u64,
    pub sample_rate: u32,
    /// Absolute sample peak of the file
    pub peak: f32,
}

pub type RenderResult = Result<RenderOutcome, RenderError>;

// ═══════════════════════════════════════════════════════════════════════════════
// BACKGROUND RENDERER
// ═══════════════════════════════════════════════════════════════════════════════

/// State shared with the render thread
struct RenderShared {
    busy: AtomicBool,
    cancel: AtomicBool,
    progress: AtomicF64,
}

/// Clears the busy flag when the render thread exits, panicking or not
struct BusyGuard(Arc<RenderShared>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
    }
}

/// Runs at most one offline render on a background thread
pub struct BackgroundRenderer {
    shared: Arc<RenderShared>,
    results_tx: Sender<RenderResult>,
    results: Receiver<RenderResult>,
    thread: Option<JoinHandle<()>>,
}

impl BackgroundRenderer {
    pub fn new() -> Self {
        let (results_tx, results) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(RenderShared {
                busy: AtomicBool::new(false),
                cancel: AtomicBool::new(false),
                progress: AtomicF64::new(0.0),
            }),
            results_tx,
            results,
            thread: None,
        }
    }

    /// Start rendering `request` on a new thread
    pub fn start(&mut self, request: RenderRequest) -> Result<(), RenderError> {
        request.validate()?;
        if self
            .shared
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RenderError::Busy);
        }

        // The previous thread has already released the busy flag
        if let Some(previous) = self.thread.take() {
            let _ = previous.join();
        }

        self.shared.cancel.store(false, Ordering::Release);
        self.shared.progress.store(0.0, Ordering::Relaxed);

        log::info!(
            "[RENDER] beats {:.3}..{:.3} -> {}",
            request.start_beat,
            request.end_beat,
            request.output.display()
        );

        let shared = Arc::clone(&self.shared);
        let results = self.results_tx.clone();
        let spawned = std::thread::Builder::new().name("mf-render".into()).spawn(move || {
            let guard = BusyGuard(Arc::clone(&shared));
            let result = run_render(&request, &shared);
            match &result {
                Ok(outcome) => log::info!(
                    "[RENDER] done: {} frames, peak {:.3}, {}",
                    outcome.frames,
                    outcome.peak,
                    outcome.path.display()
                ),
                Err(RenderError::Cancelled) => log::info!("[RENDER] cancelled"),
                Err(e) => log::error!("[RENDER] failed: {e}"),
            }
            drop(guard);
            let _ = results.send(result);
        });

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.busy.store(false, Ordering::Release);
                Err(RenderError::Io(e))
            }
        }
    }

    /// Request cancellation of the running render
    pub fn cancel(&self) {
        if self.is_busy() {
            self.shared.cancel.store(true, Ordering::Release);
        }
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Fraction of the range rendered (0.0 - 1.0)
    pub fn progress(&self) -> f64 {
        self.shared.progress.load(Ordering::Relaxed)
    }

    /// Result of a finished render, if one is waiting
    pub fn try_result(&self) -> Option<RenderResult> {
        self.results.try_recv().ok()
    }

    /// Block until the running render finishes. `None` when nothing was started.
    pub fn wait(&mut self) -> Option<RenderResult> {
        let handle = self.thread.take()?;
        let _ = handle.join();
        self.results.try_recv().ok()
    }
}

impl Default for BackgroundRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundRenderer {
    fn drop(&mut self) {
        self.shared.cancel.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RENDER THREAD
// ═══════════════════════════════════════════════════════════════════════════════

fn run_render(request: &RenderRequest, shared: &RenderShared) -> RenderResult {
    let result = render_to_file(request, shared);
    if result.is_err() {
        remove_partial(&request.output);
    }
    result
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("[RENDER] removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("[RENDER] could not remove {}: {e}", path.display()),
    }
}

fn render_to_file(request: &RenderRequest, shared: &RenderShared) -> RenderResult {
    let mut config = request.config.offline();
    config.input_channels = 0;
    config.output_channels = RENDER_CHANNELS;

    let Some(snapshot) = request.publisher.load() else {
        return Err(RenderError::NoSnapshot);
    };
    let sample_rate = config.sample_rate;
    let first = snapshot.tempo.samples_at(request.start_beat, sample_rate).round() as u64;
    let last = snapshot.tempo.samples_at(request.end_beat, sample_rate).round() as u64;
    let total = last.saturating_sub(first);
    drop(snapshot);

    // Tracks are shared with the live engine
    let _live = request.live_lock.as_ref().map(|lock| lock.lock());

    let (mut engine, handle, _housekeeper) = Engine::new(config.clone(), Arc::clone(&request.publisher))?;
    let control = request
        .control
        .clone()
        .unwrap_or_else(|| ControlBlock::with_aux_buses(config.aux_bus_count));
    handle.update_control(|c| {
        *c = ControlBlock {
            version: c.version,
            loop_enabled: false,
            input_monitoring: false,
            metronome: false,
            ..control
        }
    });
    handle.transport().locate(request.start_beat);
    handle.transport().play();

    // Every path reaches the output `latency` samples late: pre-roll by that
    // much and drop it, so the file lines up with the timeline and keeps its tail
    let latency = engine.resolve_graph_latency();
    engine.reserve_pdc(latency);
    let preroll = latency as u64;
    if preroll > 0 {
        log::debug!("[RENDER] pre-roll of {preroll} samples for plugin latency");
    }

    if let Some(parent) = request.output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let spec = hound::WavSpec {
        channels: RENDER_CHANNELS as u16,
        sample_rate: sample_rate as u32,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer: hound::WavWriter<BufWriter<File>> = hound::WavWriter::create(&request.output, spec)?;

    let block = config.max_block_size;
    let mut buffer = vec![0.0f32; block * RENDER_CHANNELS];
    let length = total + preroll;
    let mut rendered = 0u64;
    let mut peak = 0.0f32;

    while rendered < length {
        if shared.cancel.load(Ordering::Acquire) {
            return Err(RenderError::Cancelled);
        }
        let n = (length - rendered).min(block as u64) as usize;
        let out = &mut buffer[..n * RENDER_CHANNELS];
        engine.render_block(&[], out, n);
        let skip = preroll.saturating_sub(rendered).min(n as u64) as usize;
        for &sample in &out[skip * RENDER_CHANNELS..] {
            peak = peak.max(sample.abs());
            writer.write_sample(sample)?;
        }
        rendered += n as u64;
        shared.progress.store(rendered as f64 / length as f64, Ordering::Relaxed);
    }

    writer.finalize()?;
    shared.progress.store(1.0, Ordering::Relaxed);

    Ok(RenderOutcome {
        path: request.output.clone(),
        frames: total,
        sample_rate: sample_rate as u32,
        peak,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{Clip, Project};
    use crate::stream::{MemoryLibrary, MemoryStream};
    use crate::track::BasicTrack;
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig {
            max_block_size: 512,
            max_tracks: 4,
            worker_threads: 1,
            ..Default::default()
        }
    }

    fn publisher_with_tone() -> Arc<SnapshotPublisher> {
        let library = Arc::new(MemoryLibrary::new());
        library.insert("tone.wav", MemoryStream::mono(vec![0.5; 200_000], 48_000.0));
        let publisher = Arc::new(SnapshotPublisher::with_opener(library));
        let mut project = Project::new();
        project.add_track(Arc::new(BasicTrack::new("audio")));
        project.add_clip(Clip::audio(0, 0.0, 8.0, "tone.wav", 48_000.0));
        publisher.rebuild(&project);
        publisher
    }

    #[test]
    fn test_render_writes_expected_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mix.wav");
        let mut renderer = BackgroundRenderer::new();

        // 2 beats at 120 BPM = 1 second
        renderer
            .start(RenderRequest::new(config(), publisher_with_tone(), 0.0, 2.0, &path))
            .unwrap();
        let outcome = renderer.wait().unwrap().unwrap();

        assert_eq!(outcome.frames, 48_000);
        assert!(outcome.peak > 0.1);
        assert_eq!(renderer.progress(), 1.0);
        assert!(!renderer.is_busy());

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.duration(), 48_000);
    }

    #[test]
    fn test_second_start_is_busy_and_cancel_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let long = dir.path().join("long.wav");
        let mut renderer = BackgroundRenderer::new();

        renderer
            .start(RenderRequest::new(config(), publisher_with_tone(), 0.0, 100_000.0, &long))
            .unwrap();
        let second = renderer.start(RenderRequest::new(
            config(),
            publisher_with_tone(),
            0.0,
            1.0,
            dir.path().join("other.wav"),
        ));
        assert!(matches!(second, Err(RenderError::Busy)));

        renderer.cancel();
        let result = renderer.wait().unwrap();
        assert!(matches!(result, Err(RenderError::Cancelled)));
        assert!(!long.exists());
        assert!(!renderer.is_busy());
    }

    #[test]
    fn test_invalid_range_rejected() {
        let mut renderer = BackgroundRenderer::new();
        let request = RenderRequest::new(config(), publisher_with_tone(), 4.0, 4.0, "unused.wav");
        assert!(matches!(renderer.start(request), Err(RenderError::InvalidRange { .. })));
        assert!(!renderer.is_busy());
    }

    #[test]
    fn test_no_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.wav");
        let mut renderer = BackgroundRenderer::new();
        renderer
            .start(RenderRequest::new(config(), Arc::new(SnapshotPublisher::new()), 0.0, 1.0, &path))
            .unwrap();
        assert!(matches!(renderer.wait().unwrap(), Err(RenderError::NoSnapshot)));
        assert!(!path.exists());
    }

    #[test]
    fn test_render_waits_for_live_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.wav");
        let lock = Arc::new(Mutex::new(()));
        let mut renderer = BackgroundRenderer::new();

        let guard = lock.lock();
        renderer
            .start(
                RenderRequest::new(config(), publisher_with_tone(), 0.0, 1.0, &path)
                    .with_live_lock(Arc::clone(&lock)),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(renderer.progress(), 0.0);
        assert!(renderer.is_busy());
        drop(guard);

        assert!(renderer.wait().unwrap().is_ok());
    }

    #[test]
    fn test_render_compensates_plugin_latency() {
        const LATENCY: usize = 10_000;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aligned.wav");

        let library = Arc::new(MemoryLibrary::new());
        library.insert("tone.wav", MemoryStream::mono(vec![0.5; 200_000], 48_000.0));
        let publisher = Arc::new(SnapshotPublisher::with_opener(library));
        let mut project = Project::new();
        project.add_track(Arc::new(BasicTrack::with_latency("slow", LATENCY)));
        project.add_track(Arc::new(BasicTrack::new("fast")));
        project.add_clip(Clip::audio(0, 0.0, 8.0, "tone.wav", 48_000.0));
        project.add_clip(Clip::audio(1, 0.0, 8.0, "tone.wav", 48_000.0));
        publisher.rebuild(&project);

        // Beyond the default ring capacity; no shaping on the master
        let config = config();
        assert!(config.pdc_initial_capacity < LATENCY);
        let control = ControlBlock {
            soft_clip: false,
            limiter: false,
            dc_block: false,
            dither: false,
            ..ControlBlock::with_aux_buses(config.aux_bus_count)
        };
        let mut renderer = BackgroundRenderer::new();
        renderer
            .start(RenderRequest::new(config, publisher, 0.0, 2.0, &path).with_control(control))
            .unwrap();
        let outcome = renderer.wait().unwrap().unwrap();
        assert_eq!(outcome.frames, 48_000);

        let mut reader = hound::WavReader::open(&path).unwrap();
        let left: Vec<f32> = reader
            .samples::<f32>()
            .map(|s| s.unwrap())
            .step_by(2)
            .collect();
        assert_eq!(left.len(), 48_000);

        // Both tracks are audible from the start and through the last frame
        let both = left[20_000];
        assert!(both > 0.5);
        for frame in [1_000, 5_000, 12_000, 47_999] {
            assert!((left[frame] - both).abs() < 1e-3, "frame {frame}: {}", left[frame]);
        }
    }

    #[test]
    fn test_error_conversion() {
        assert!(matches!(MfError::from(RenderError::Cancelled), MfError::Cancelled));
        assert!(matches!(MfError::from(RenderError::Busy), MfError::Render(_)));
    }
}
