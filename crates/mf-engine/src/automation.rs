//! Automation Engine
//!
//! Beat-synchronized parameter automation:
//! - Lanes per track volume / pan / send and the master output
//! - Read / Touch / Latch / Write modes, evaluated once per block
//! - Lock-free write-back: the audio thread captures live values into an
//!   SPSC queue, the control thread merges them into the lane points
//!
//! Lanes in a published snapshot are immutable. Touch and latch state is
//! shared through per-lane atomics so the control thread can signal a touch
//! without rebuilding the snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use mf_core::BEAT_EPSILON;
use rtrb::{Consumer, Producer, RingBuffer};
use serde::{Deserialize, Serialize};

use crate::track::Track;

/// Lane identifier, unique within a project
pub type LaneId = u32;

/// Id of the lane that always exists for the master output
pub const MASTER_LANE_ID: LaneId = 0;

// ═══════════════════════════════════════════════════════════════════════════
// TARGETS & MODES
// ═══════════════════════════════════════════════════════════════════════════

/// Automated parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AutomationTarget {
    TrackVolume,
    TrackPan,
    TrackSend,
    MasterOutput,
}

impl AutomationTarget {
    /// Valid value range
    pub fn range(self) -> (f64, f64) {
        match self {
            Self::TrackVolume | Self::MasterOutput => (0.0, 2.0),
            Self::TrackPan => (-1.0, 1.0),
            Self::TrackSend => (0.0, 1.0),
        }
    }

    pub fn default_value(self) -> f64 {
        match self {
            Self::TrackVolume | Self::MasterOutput => 1.0,
            Self::TrackPan | Self::TrackSend => 0.0,
        }
    }

    pub fn clamp(self, value: f64) -> f64 {
        let (min, max) = self.range();
        value.clamp(min, max)
    }

    pub fn is_track_target(self) -> bool {
        self != Self::MasterOutput
    }
}

/// Lane write mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AutomationMode {
    /// Follow the lane
    #[default]
    Read,
    /// Write while the control is held
    Touch,
    /// Write from the first touch until transport stop or mode change
    Latch,
    /// Write every block while playing
    Write,
}

// ═══════════════════════════════════════════════════════════════════════════
// LANE
// ═══════════════════════════════════════════════════════════════════════════

/// Single automation point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutomationPoint {
    pub beat: f64,
    pub value: f64,
}

impl AutomationPoint {
    pub fn new(beat: f64, value: f64) -> Self {
        Self {
            beat: beat.max(0.0),
            value,
        }
    }
}

/// Touch/latch flags shared by every copy of a lane
#[derive(Debug, Default)]
pub struct LaneFlags {
    touched: AtomicBool,
    latched: AtomicBool,
}

impl LaneFlags {
    pub fn is_touched(&self) -> bool {
        self.touched.load(Ordering::Acquire)
    }

    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }

    pub fn clear_latch(&self) {
        self.latched.store(false, Ordering::Release);
    }
}

/// Automation lane for a single parameter
#[derive(Debug, Clone)]
pub struct AutomationLane {
    pub id: LaneId,
    pub target: AutomationTarget,
    /// Owning track, `None` for the master output
    pub track_index: Option<usize>,
    pub mode: AutomationMode,
    pub enabled: bool,
    /// Sorted by beat, no two points closer than `BEAT_EPSILON`
    points: Vec<AutomationPoint>,
    flags: Arc<LaneFlags>,
}

impl AutomationLane {
    pub fn new(id: LaneId, target: AutomationTarget, track_index: Option<usize>) -> Self {
        Self {
            id,
            target,
            track_index,
            mode: AutomationMode::Read,
            enabled: true,
            points: Vec::new(),
            flags: Arc::new(LaneFlags::default()),
        }
    }

    pub fn points(&self) -> &[AutomationPoint] {
        &self.points
    }

    pub fn flags(&self) -> &LaneFlags {
        &self.flags
    }

    /// Insert keeping order; a point within `BEAT_EPSILON` of an existing one replaces its value
    pub fn insert_point(&mut self, beat: f64, value: f64) {
        let point = AutomationPoint::new(beat, self.target.clamp(value));
        let idx = self.points.partition_point(|p| p.beat < point.beat);

        if let Some(near) = self.near_index(idx, point.beat) {
            self.points[near].value = point.value;
            return;
        }
        self.points.insert(idx, point);
    }

    /// Overwrite the value of the point nearest `beat` if it is within `BEAT_EPSILON`
    fn overwrite_near(&mut self, beat: f64, value: f64) -> bool {
        let idx = self.points.partition_point(|p| p.beat < beat);
        match self.near_index(idx, beat) {
            Some(near) => {
                self.points[near].value = self.target.clamp(value);
                true
            }
            None => false,
        }
    }

    /// Neighbour of insertion index `idx` lying within `BEAT_EPSILON` of `beat`
    fn near_index(&self, idx: usize, beat: f64) -> Option<usize> {
        [idx.checked_sub(1), Some(idx)]
            .into_iter()
            .flatten()
            .find(|&i| self.points.get(i).is_some_and(|p| (p.beat - beat).abs() < BEAT_EPSILON))
    }

    /// Remove points with `start <= beat < end`
    pub fn clear_range(&mut self, start: f64, end: f64) -> usize {
        let before = self.points.len();
        self.points.retain(|p| p.beat < start || p.beat >= end);
        before - self.points.len()
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Linear interpolation, clamped to the first/last point.
    /// `None` when the lane has no points.
    pub fn value_at(&self, beat: f64) -> Option<f64> {
        let first = self.points.first()?;
        let last = self.points.last()?;
        if beat <= first.beat {
            return Some(first.value);
        }
        if beat >= last.beat {
            return Some(last.value);
        }

        let idx = self.points.partition_point(|p| p.beat <= beat);
        let p1 = self.points[idx - 1];
        let p2 = self.points[idx];
        let t = (beat - p1.beat) / (p2.beat - p1.beat);
        Some(p1.value + (p2.value - p1.value) * t)
    }

    /// Whether this block should capture the live value
    #[inline]
    fn should_capture(&self, playing: bool) -> bool {
        if !playing {
            return false;
        }
        match self.mode {
            AutomationMode::Read => false,
            AutomationMode::Touch => self.flags.is_touched(),
            AutomationMode::Latch => {
                if self.flags.is_touched() {
                    self.flags.latched.store(true, Ordering::Release);
                }
                self.flags.is_latched()
            }
            AutomationMode::Write => true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LANE STORE (control thread)
// ═══════════════════════════════════════════════════════════════════════════

/// All lanes of a project; always contains the master lane
#[derive(Debug, Clone)]
pub struct AutomationStore {
    lanes: Vec<AutomationLane>,
    next_id: LaneId,
}

impl AutomationStore {
    pub fn new() -> Self {
        Self {
            lanes: vec![AutomationLane::new(MASTER_LANE_ID, AutomationTarget::MasterOutput, None)],
            next_id: MASTER_LANE_ID + 1,
        }
    }

    pub fn lanes(&self) -> &[AutomationLane] {
        &self.lanes
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    pub fn get(&self, id: LaneId) -> Option<&AutomationLane> {
        self.lanes.iter().find(|l| l.id == id)
    }

    pub fn get_mut(&mut self, id: LaneId) -> Option<&mut AutomationLane> {
        self.lanes.iter_mut().find(|l| l.id == id)
    }

    pub fn master(&self) -> &AutomationLane {
        // Invariant: the master lane is never removed
        &self.lanes[0]
    }

    pub fn find(&self, target: AutomationTarget, track_index: Option<usize>) -> Option<&AutomationLane> {
        self.lanes
            .iter()
            .find(|l| l.target == target && l.track_index == track_index)
    }

    /// Lane for `target` on `track_index`, created on first use
    pub fn ensure_lane(&mut self, target: AutomationTarget, track_index: Option<usize>) -> LaneId {
        if !target.is_track_target() {
            return MASTER_LANE_ID;
        }
        if let Some(lane) = self.find(target, track_index) {
            return lane.id;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.lanes.push(AutomationLane::new(id, target, track_index));
        log::debug!("Created automation lane {id} for {target:?} on track {track_index:?}");
        id
    }

    /// Create volume, pan and send lanes for a new track
    pub fn ensure_track_lanes(&mut self, track_index: usize) {
        for target in [
            AutomationTarget::TrackVolume,
            AutomationTarget::TrackPan,
            AutomationTarget::TrackSend,
        ] {
            self.ensure_lane(target, Some(track_index));
        }
    }

    /// Change a lane's mode; leaving Latch clears the latch
    pub fn set_mode(&mut self, id: LaneId, mode: AutomationMode) -> bool {
        let Some(lane) = self.get_mut(id) else {
            return false;
        };
        if lane.mode != mode {
            lane.flags.clear_latch();
        }
        lane.mode = mode;
        true
    }

    /// Signal that the control behind a lane is (or is no longer) being held
    pub fn set_touched(&self, id: LaneId, touched: bool) -> bool {
        let Some(lane) = self.get(id) else {
            return false;
        };
        lane.flags.touched.store(touched, Ordering::Release);
        true
    }

    /// Remap lanes after the track list was rebuilt.
    ///
    /// `mapping[old] = Some(new)` keeps the lane under its new index,
    /// `None` (or an index past the mapping) drops it. The master lane is kept.
    pub fn reconcile(&mut self, mapping: &[Option<usize>]) {
        let before = self.lanes.len();
        self.lanes.retain_mut(|lane| match lane.track_index {
            None => true,
            Some(old) => match mapping.get(old).copied().flatten() {
                Some(new) => {
                    lane.track_index = Some(new);
                    true
                }
                None => false,
            },
        });
        let dropped = before - self.lanes.len();
        if dropped > 0 {
            log::debug!("Automation reconcile dropped {dropped} lanes");
        }
    }

    /// Clear latch state on every lane
    pub fn clear_latches(&self) {
        self.lanes.iter().for_each(|l| l.flags.clear_latch());
    }
}

impl Default for AutomationStore {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// WRITE-BACK QUEUE
// ═══════════════════════════════════════════════════════════════════════════

/// One captured value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutomationWrite {
    pub lane: LaneId,
    pub beat: f64,
    pub value: f64,
}

/// Audio-thread producer
pub struct AutomationWriter {
    producer: Producer<AutomationWrite>,
    dropped: Arc<AtomicU64>,
}

impl AutomationWriter {
    /// Queue a capture; on overflow the event is dropped and counted
    #[inline]
    pub fn push(&mut self, write: AutomationWrite) -> bool {
        if self.producer.push(write).is_ok() {
            true
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Control-thread consumer and merger
pub struct AutomationWriteback {
    consumer: Consumer<AutomationWrite>,
    dropped: Arc<AtomicU64>,
    /// Beat of the last point merged per lane in the current pass
    last_beat: HashMap<LaneId, f64>,
}

/// Create the bounded write-back queue
pub fn automation_queue(capacity: usize) -> (AutomationWriter, AutomationWriteback) {
    let (producer, consumer) = RingBuffer::new(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        AutomationWriter {
            producer,
            dropped: Arc::clone(&dropped),
        },
        AutomationWriteback {
            consumer,
            dropped,
            last_beat: HashMap::new(),
        },
    )
}

impl AutomationWriteback {
    /// Merge every queued capture into `store`. Returns the number merged.
    ///
    /// A capture within `BEAT_EPSILON` of the lane's previous capture
    /// overwrites that point; anything else is inserted in order.
    pub fn merge_into(&mut self, store: &mut AutomationStore) -> usize {
        let mut merged = 0;
        while let Ok(write) = self.consumer.pop() {
            let Some(lane) = store.get_mut(write.lane) else {
                continue;
            };
            let overwritten = match self.last_beat.get(&write.lane) {
                Some(&last) if (write.beat - last).abs() < BEAT_EPSILON => {
                    lane.overwrite_near(last, write.value)
                }
                _ => false,
            };
            if !overwritten {
                lane.insert_point(write.beat, write.value);
                self.last_beat.insert(write.lane, write.beat);
            }
            merged += 1;
        }
        merged
    }

    /// Forget per-lane merge positions (new write pass)
    pub fn end_pass(&mut self) {
        self.last_beat.clear();
    }

    pub fn pending(&self) -> usize {
        self.consumer.slots()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// BLOCK EVALUATION (audio thread)
// ═══════════════════════════════════════════════════════════════════════════

/// Evaluate every lane once at `beat`.
///
/// Captures go to `writer`; read values are applied to the tracks. Returns
/// the master gain the master lane asks for, if it has points and is reading.
pub fn apply_lanes(
    lanes: &[AutomationLane],
    tracks: &[Arc<dyn Track>],
    beat: f64,
    playing: bool,
    live_master: f64,
    writer: &mut AutomationWriter,
) -> Option<f64> {
    let mut master = None;

    for lane in lanes.iter().filter(|l| l.enabled) {
        let track = match lane.track_index {
            Some(idx) => match tracks.get(idx) {
                Some(t) => Some(t.as_ref()),
                None => continue,
            },
            None => None,
        };

        let live = match (lane.target, track) {
            (AutomationTarget::TrackVolume, Some(t)) => t.volume(),
            (AutomationTarget::TrackPan, Some(t)) => t.pan(),
            (AutomationTarget::TrackSend, Some(t)) => t.send_level(),
            (AutomationTarget::MasterOutput, _) => live_master,
            _ => continue,
        };

        if lane.should_capture(playing) {
            writer.push(AutomationWrite {
                lane: lane.id,
                beat,
                value: live,
            });
            continue;
        }

        let Some(value) = lane.value_at(beat) else {
            continue;
        };
        match (lane.target, track) {
            (AutomationTarget::TrackVolume, Some(t)) => t.set_volume(value),
            (AutomationTarget::TrackPan, Some(t)) => t.set_pan(value),
            (AutomationTarget::TrackSend, Some(t)) => t.set_send_level(value),
            (AutomationTarget::MasterOutput, _) => master = Some(value),
            _ => {}
        }
    }
    master
}

/// Clear latch state on every lane (transport stop)
pub fn clear_latches(lanes: &[AutomationLane]) {
    lanes.iter().for_each(|l| l.flags.clear_latch());
}
