//! Immutable project snapshots
//!
//! The control thread owns the mutable [`Project`]. Every edit ends with
//! [`SnapshotPublisher::rebuild`], which assembles a [`RealtimeSnapshot`]
//! (clips, track handles, tempo map, automation lanes, transpose, resolved
//! clip streams) and swaps it into a single atomic slot.
//!
//! ## Lifecycle
//! ```text
//! control:  Project ──rebuild──► Arc<Snapshot> ──swap──► [current slot]
//!                                                   │
//!                                      previous ────┴──► retirement list
//! audio:    one load per block ◄── [current slot]
//! housekeeping: drop retired snapshots whose only holder is the list
//! ```
//! The audio thread never mutates a snapshot and never drops the last
//! reference to one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use mf_core::{BeatMidiEvent, TempoMap};
use mf_dsp::fade::ClipFades;
use parking_lot::Mutex;

use crate::automation::{AutomationLane, AutomationStore};
use crate::stream::{StreamOpener, StreamingSource};
use crate::track::Track;

// ═══════════════════════════════════════════════════════════════════════════════
// RETIREMENT
// ═══════════════════════════════════════════════════════════════════════════════

/// Superseded values waiting until no reader holds them
pub struct RetirementList<T> {
    list: Mutex<Vec<Arc<T>>>,
}

impl<T> RetirementList<T> {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
        }
    }

    pub fn retire(&self, value: Arc<T>) {
        self.list.lock().push(value);
    }

    /// Drop every entry the list alone still holds. Returns how many were dropped.
    pub fn drain(&self) -> usize {
        let mut list = self.list.lock();
        let before = list.len();
        list.retain(|v| Arc::strong_count(v) > 1);
        before - list.len()
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for RetirementList<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CLIPS
// ═══════════════════════════════════════════════════════════════════════════════

/// Clip content
#[derive(Debug, Clone, PartialEq)]
pub enum ClipKind {
    /// Events with clip-relative beat positions, sorted by beat
    Midi { events: Vec<BeatMidiEvent> },
    /// Audio file rendered through a streaming source
    Audio { path: PathBuf, sample_rate: f64 },
}

/// Arrangement clip
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub kind: ClipKind,
    pub track_index: usize,
    pub start_beat: f64,
    pub length_beats: f64,
    /// Linear clip gain
    pub gain: f64,
    pub fades: ClipFades,
}

impl Clip {
    /// MIDI clip; events are sorted by beat
    pub fn midi(track_index: usize, start_beat: f64, length_beats: f64, mut events: Vec<BeatMidiEvent>) -> Self {
        events.sort_by(|a, b| a.beat.total_cmp(&b.beat));
        Self {
            kind: ClipKind::Midi { events },
            track_index,
            start_beat,
            length_beats,
            gain: 1.0,
            fades: ClipFades::default(),
        }
    }

    pub fn audio(
        track_index: usize,
        start_beat: f64,
        length_beats: f64,
        path: impl Into<PathBuf>,
        sample_rate: f64,
    ) -> Self {
        Self {
            kind: ClipKind::Audio {
                path: path.into(),
                sample_rate,
            },
            track_index,
            start_beat,
            length_beats,
            gain: 1.0,
            fades: ClipFades::default(),
        }
    }

    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    pub fn with_fades(mut self, fade_in: f64, fade_out: f64) -> Self {
        self.fades.fade_in = fade_in.max(0.0);
        self.fades.fade_out = fade_out.max(0.0);
        self
    }

    pub fn with_crossfades(mut self, crossfade_in: f64, crossfade_out: f64) -> Self {
        self.fades.crossfade_in = crossfade_in.max(0.0);
        self.fades.crossfade_out = crossfade_out.max(0.0);
        self
    }

    pub fn end_beat(&self) -> f64 {
        self.start_beat + self.length_beats
    }

    pub fn audio_path(&self) -> Option<&Path> {
        match &self.kind {
            ClipKind::Audio { path, .. } => Some(path),
            ClipKind::Midi { .. } => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROJECT (control thread)
// ═══════════════════════════════════════════════════════════════════════════════

/// Mutable project model, owned by the control thread
#[derive(Clone, Default)]
pub struct Project {
    pub tracks: Vec<Arc<dyn Track>>,
    pub arrangement: Vec<Clip>,
    pub tempo: TempoMap,
    pub automation: AutomationStore,
    pub transpose: i32,
    /// Track selected in the UI, used for MIDI routing
    pub selected_track: Option<usize>,
}

impl Project {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a track and create its automation lanes. Returns its index.
    pub fn add_track(&mut self, track: Arc<dyn Track>) -> usize {
        self.tracks.push(track);
        let index = self.tracks.len() - 1;
        self.automation.ensure_track_lanes(index);
        index
    }

    /// Remove a track, its clips, and reconcile automation lanes
    pub fn remove_track(&mut self, index: usize) -> Option<Arc<dyn Track>> {
        if index >= self.tracks.len() {
            return None;
        }
        let removed = self.tracks.remove(index);

        let mapping: Vec<Option<usize>> = (0..=self.tracks.len())
            .map(|old| match old.cmp(&index) {
                std::cmp::Ordering::Less => Some(old),
                std::cmp::Ordering::Equal => None,
                std::cmp::Ordering::Greater => Some(old - 1),
            })
            .collect();
        self.automation.reconcile(&mapping);

        self.arrangement.retain(|c| c.track_index != index);
        for clip in &mut self.arrangement {
            if clip.track_index > index {
                clip.track_index -= 1;
            }
        }
        self.selected_track = match self.selected_track {
            Some(s) if s == index => None,
            Some(s) if s > index => Some(s - 1),
            other => other,
        };
        Some(removed)
    }

    pub fn add_clip(&mut self, clip: Clip) {
        self.arrangement.push(clip);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SNAPSHOT
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything the audio thread needs for one block, immutable once published
pub struct RealtimeSnapshot {
    pub version: u64,
    pub arrangement: Vec<Clip>,
    pub tracks: Vec<Arc<dyn Track>>,
    pub tempo: TempoMap,
    pub automation: Vec<AutomationLane>,
    pub transpose: i32,
    pub selected_track: Option<usize>,
    /// Parallel to `arrangement`; `None` for MIDI clips and unresolved audio
    pub streams: Vec<Option<Arc<dyn StreamingSource>>>,
}

impl RealtimeSnapshot {
    pub fn any_soloed(&self) -> bool {
        self.tracks.iter().any(|t| t.is_soloed())
    }

    pub fn stream_for(&self, clip_index: usize) -> Option<&dyn StreamingSource> {
        self.streams.get(clip_index).and_then(|s| s.as_deref())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PUBLISHER
// ═══════════════════════════════════════════════════════════════════════════════

/// Single-slot snapshot publisher with deferred retirement
pub struct SnapshotPublisher {
    current: ArcSwapOption<RealtimeSnapshot>,
    retired: RetirementList<RealtimeSnapshot>,
    version: AtomicU64,
    opener: Option<Arc<dyn StreamOpener>>,
    /// Path-keyed cache of resolved sources
    streams: Mutex<HashMap<PathBuf, Arc<dyn StreamingSource>>>,
    sample_rate: Mutex<f64>,
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            retired: RetirementList::new(),
            version: AtomicU64::new(0),
            opener: None,
            streams: Mutex::new(HashMap::new()),
            sample_rate: Mutex::new(48_000.0),
        }
    }

    /// Publisher that resolves audio clip paths through `opener`
    pub fn with_opener(opener: Arc<dyn StreamOpener>) -> Self {
        Self {
            opener: Some(opener),
            ..Self::new()
        }
    }

    /// Sample rate passed to the stream opener
    pub fn set_sample_rate(&self, sample_rate: f64) {
        *self.sample_rate.lock() = sample_rate;
    }

    /// Build and publish a snapshot of `project`. Returns its version.
    pub fn rebuild(&self, project: &Project) -> u64 {
        let streams = self.resolve_streams(&project.arrangement);
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;

        let snapshot = RealtimeSnapshot {
            version,
            arrangement: project.arrangement.clone(),
            tracks: project.tracks.clone(),
            tempo: project.tempo.clone(),
            automation: project.automation.lanes().to_vec(),
            transpose: project.transpose,
            selected_track: project.selected_track,
            streams,
        };

        self.publish(snapshot);
        version
    }

    /// Publish an already built snapshot
    pub fn publish(&self, snapshot: RealtimeSnapshot) {
        let previous = self.current.swap(Some(Arc::new(snapshot)));
        if let Some(previous) = previous {
            self.retired.retire(previous);
        }
    }

    /// Unpublish (teardown). The audio thread then renders silence.
    pub fn clear(&self) {
        if let Some(previous) = self.current.swap(None) {
            self.retired.retire(previous);
        }
    }

    /// Current snapshot, one acquire load
    #[inline]
    pub fn load(&self) -> Option<Arc<RealtimeSnapshot>> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Drop retired snapshots no reader holds. Returns how many were dropped.
    pub fn drain_retired(&self) -> usize {
        self.retired.drain()
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// Resolve audio clip sources, reusing cached sources that are still ready
    fn resolve_streams(&self, arrangement: &[Clip]) -> Vec<Option<Arc<dyn StreamingSource>>> {
        let sample_rate = *self.sample_rate.lock();
        let mut cache = self.streams.lock();

        let resolved = arrangement
            .iter()
            .map(|clip| {
                let path = clip.audio_path()?;
                if let Some(source) = cache.get(path).filter(|s| s.is_ready()) {
                    return Some(Arc::clone(source));
                }
                let source = self.opener.as_ref()?.open(path, sample_rate)?;
                cache.insert(path.to_path_buf(), Arc::clone(&source));
                Some(source)
            })
            .collect();

        // Forget sources no clip refers to any more
        cache.retain(|path, _| arrangement.iter().any(|c| c.audio_path() == Some(path.as_path())));
        resolved
    }

    pub fn cached_streams(&self) -> usize {
        self.streams.lock().len()
    }
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}
