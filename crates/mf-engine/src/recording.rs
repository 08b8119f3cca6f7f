//! Recording path
//!
//! Integrates take capture with the callback:
//! - `RecordingManager` (control thread) opens take files, hands ring
//!   producers to the audio thread and collects finished takes
//! - `RecordingTap` (audio thread) writes armed tracks' input into their
//!   take rings while the transport plays, and captures routed live MIDI
//!   with its beat position
//! - A disk thread drains every take ring into a 32-bit float WAV
//!
//! Rings are SPSC (`rtrb`); when the disk thread falls behind, the audio
//! thread drops whole frames and counts them instead of blocking. A take
//! with dropped samples is still finalized; `stop_take` then reports
//! [`RecordingError::SamplesDropped`].

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use mf_core::{BeatMidiEvent, MfError, MidiMessage, Sample};
use rtrb::{Consumer, Producer, RingBuffer};
use thiserror::Error;

use crate::config::EngineConfig;

/// Channels per take file
pub const TAKE_CHANNELS: u16 = 2;

/// Queued start/stop commands per direction
const COMMAND_CAPACITY: usize = 64;

/// Live MIDI events buffered between housekeeping drains
const MIDI_CAPTURE_CAPACITY: usize = 4096;

/// Disk thread poll interval
const DISK_POLL: Duration = Duration::from_millis(5);

/// How long a finishing take waits for the audio thread to let go of it
const FINISH_GRACE: Duration = Duration::from_secs(2);

/// How long `stop_take` waits for the disk thread
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

type TakeFile = hound::WavWriter<BufWriter<File>>;

// ═══════════════════════════════════════════════════════════════════════════════
// ERRORS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("{dropped} samples dropped while recording {}", path.display())]
    SamplesDropped { path: PathBuf, dropped: u64 },

    #[error("Track {0} is already recording")]
    AlreadyRecording(usize),

    #[error("Track {0} is not recording")]
    NotRecording(usize),

    #[error("Track {0} has no recording slot")]
    InvalidTrack(usize),

    #[error("Audio command queue full")]
    QueueFull,

    #[error("Disk writer thread is not running")]
    WriterGone,
}

impl From<RecordingError> for MfError {
    fn from(err: RecordingError) -> Self {
        MfError::Recording(err.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TAKE RING
// ═══════════════════════════════════════════════════════════════════════════════

/// Audio-thread end of a take ring
pub struct TakeProducer {
    producer: Producer<f32>,
    dropped: Arc<AtomicU64>,
}

impl TakeProducer {
    /// Append `n` stereo frames, interleaved. Frames that do not fit are
    /// dropped and counted.
    #[inline]
    pub fn write(&mut self, left: &[Sample], right: &[Sample], n: usize) {
        let n = n.min(left.len()).min(right.len());
        let channels = TAKE_CHANNELS as usize;
        let frames = (self.producer.slots() / channels).min(n);

        if let Ok(mut chunk) = self.producer.write_chunk(frames * channels) {
            let (first, second) = chunk.as_mut_slices();
            let mut i = 0;
            for slot in first.iter_mut().chain(second.iter_mut()) {
                let frame = i / channels;
                *slot = (if i % channels == 0 { left[frame] } else { right[frame] }) as f32;
                i += 1;
            }
            chunk.commit_all();
        }

        let lost = (n - frames) * channels;
        if lost > 0 {
            self.dropped.fetch_add(lost as u64, Ordering::Relaxed);
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Disk-thread end of a take ring plus its file
struct TakeSink {
    track: usize,
    consumer: Consumer<f32>,
    file: Option<TakeFile>,
    path: PathBuf,
    dropped: Arc<AtomicU64>,
    samples: u64,
    error: Option<RecordingError>,
}

impl TakeSink {
    /// Move everything currently in the ring to the file
    fn drain(&mut self) {
        let available = self.consumer.slots();
        if available == 0 {
            return;
        }
        let Ok(chunk) = self.consumer.read_chunk(available) else {
            return;
        };
        if self.error.is_none() {
            if let Some(file) = self.file.as_mut() {
                let (first, second) = chunk.as_slices();
                for &sample in first.iter().chain(second) {
                    if let Err(e) = file.write_sample(sample) {
                        self.error = Some(e.into());
                        break;
                    }
                    self.samples += 1;
                }
            }
        }
        chunk.commit_all();
    }

    /// Flush, close the file and report the outcome
    fn finish(mut self) -> Result<Take, RecordingError> {
        self.drain();
        if let Some(file) = self.file.take() {
            file.finalize()?;
        }
        if let Some(e) = self.error {
            return Err(e);
        }
        let dropped = self.dropped.load(Ordering::Acquire);
        if dropped > 0 {
            log::warn!("[RECORD] take {} lost {dropped} samples", self.path.display());
            return Err(RecordingError::SamplesDropped {
                path: self.path,
                dropped,
            });
        }
        Ok(Take {
            track: self.track,
            path: self.path,
            frames: self.samples / TAKE_CHANNELS as u64,
            midi: Vec::new(),
        })
    }
}

/// A finished take
#[derive(Debug, Clone, PartialEq)]
pub struct Take {
    pub track: usize,
    pub path: PathBuf,
    /// Stereo frames written
    pub frames: u64,
    /// Live MIDI captured on the track during the take
    pub midi: Vec<BeatMidiEvent>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// DISK THREAD
// ═══════════════════════════════════════════════════════════════════════════════

enum DiskCommand {
    Open(TakeSink),
    Finish {
        track: usize,
        reply: Sender<Result<Take, RecordingError>>,
    },
    Shutdown,
}

struct Finishing {
    sink: TakeSink,
    since: Instant,
    reply: Sender<Result<Take, RecordingError>>,
}

fn disk_thread(commands: Receiver<DiskCommand>) {
    let mut open: Vec<TakeSink> = Vec::new();
    let mut finishing: Vec<Finishing> = Vec::new();

    loop {
        match commands.recv_timeout(DISK_POLL) {
            Ok(DiskCommand::Open(sink)) => open.push(sink),
            Ok(DiskCommand::Finish { track, reply }) => match open.iter().position(|s| s.track == track) {
                Some(pos) => finishing.push(Finishing {
                    sink: open.swap_remove(pos),
                    since: Instant::now(),
                    reply,
                }),
                None => {
                    let _ = reply.send(Err(RecordingError::NotRecording(track)));
                }
            },
            Ok(DiskCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        open.iter_mut().for_each(TakeSink::drain);

        // A take is complete once the audio thread dropped its producer
        let mut i = 0;
        while i < finishing.len() {
            let entry = &mut finishing[i];
            entry.sink.drain();
            let released = entry.sink.consumer.is_abandoned();
            if released || entry.since.elapsed() > FINISH_GRACE {
                if !released {
                    log::warn!("[RECORD] audio thread did not release track {} take", entry.sink.track);
                }
                let Finishing { sink, reply, .. } = finishing.swap_remove(i);
                let _ = reply.send(sink.finish());
            } else {
                i += 1;
            }
        }
    }

    for sink in open {
        if let Err(e) = sink.finish() {
            log::error!("[RECORD] take closed at shutdown: {e}");
        }
    }
    for Finishing { sink, reply, .. } in finishing {
        let _ = reply.send(sink.finish());
    }
    log::debug!("[RECORD] disk thread stopped");
}

// ═══════════════════════════════════════════════════════════════════════════════
// AUDIO-THREAD TAP
// ═══════════════════════════════════════════════════════════════════════════════

enum TapCommand {
    Start { track: usize, producer: TakeProducer },
    Stop { track: usize },
}

/// Audio-thread side of recording
pub struct RecordingTap {
    commands: Consumer<TapCommand>,
    active: Vec<Option<TakeProducer>>,
    midi: Producer<(usize, BeatMidiEvent)>,
    midi_dropped: Arc<AtomicU64>,
    active_count: usize,
}

impl RecordingTap {
    /// Apply queued start/stop commands. Never blocks.
    ///
    /// Stopped producers are dropped here; the disk thread still holds the
    /// other end of the ring, so this never frees memory.
    pub fn process_commands(&mut self) {
        while let Ok(command) = self.commands.pop() {
            match command {
                TapCommand::Start { track, producer } => {
                    if let Some(slot) = self.active.get_mut(track) {
                        if slot.replace(producer).is_none() {
                            self.active_count += 1;
                        }
                    }
                }
                TapCommand::Stop { track } => {
                    if let Some(slot) = self.active.get_mut(track) {
                        if slot.take().is_some() {
                            self.active_count -= 1;
                        }
                    }
                }
            }
        }
    }

    pub fn is_recording(&self, track: usize) -> bool {
        self.active.get(track).is_some_and(Option::is_some)
    }

    pub fn any_recording(&self) -> bool {
        self.active_count > 0
    }

    /// Write a block of input into the track's take, if it is recording
    #[inline]
    pub fn write(&mut self, track: usize, left: &[Sample], right: &[Sample], n: usize) {
        if let Some(Some(producer)) = self.active.get_mut(track) {
            producer.write(left, right, n);
        }
    }

    /// Capture a routed live MIDI message for a recording track
    #[inline]
    pub fn capture_midi(&mut self, track: usize, beat: f64, message: MidiMessage) {
        if !self.is_recording(track) {
            return;
        }
        if self.midi.push((track, BeatMidiEvent::new(beat, message))).is_err() {
            self.midi_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Total frames dropped by takes currently recording
    pub fn dropped_samples(&self) -> u64 {
        self.active.iter().flatten().map(TakeProducer::dropped).sum()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECORDING MANAGER
// ═══════════════════════════════════════════════════════════════════════════════

struct ActiveTake {
    path: PathBuf,
    /// Captured MIDI beats are made relative to this
    start_beat: f64,
}

/// Control-thread recording manager
pub struct RecordingManager {
    output_dir: PathBuf,
    sample_rate: u32,
    ring_samples: usize,
    max_tracks: usize,
    to_audio: Producer<TapCommand>,
    disk: Sender<DiskCommand>,
    disk_thread: Option<JoinHandle<()>>,
    midi: Consumer<(usize, BeatMidiEvent)>,
    midi_dropped: Arc<AtomicU64>,
    /// MIDI drained from the capture queue, per track
    captured: HashMap<usize, Vec<BeatMidiEvent>>,
    active: HashMap<usize, ActiveTake>,
    take_counter: u64,
}

impl RecordingManager {
    /// Create the manager, its audio-thread tap and the disk thread
    pub fn new(config: &EngineConfig, output_dir: impl Into<PathBuf>) -> Result<(Self, RecordingTap), RecordingError> {
        let (to_audio, commands) = RingBuffer::new(COMMAND_CAPACITY);
        let (midi_producer, midi) = RingBuffer::new(MIDI_CAPTURE_CAPACITY);
        let (disk, disk_commands) = crossbeam_channel::unbounded();
        let midi_dropped = Arc::new(AtomicU64::new(0));

        let handle = std::thread::Builder::new()
            .name("mf-disk-writer".into())
            .spawn(move || disk_thread(disk_commands))?;

        let tap = RecordingTap {
            commands,
            active: (0..config.max_tracks).map(|_| None).collect(),
            midi: midi_producer,
            midi_dropped: Arc::clone(&midi_dropped),
            active_count: 0,
        };

        let manager = Self {
            output_dir: output_dir.into(),
            sample_rate: config.sample_rate as u32,
            ring_samples: config.recording_ring_samples(TAKE_CHANNELS as usize),
            max_tracks: config.max_tracks,
            to_audio,
            disk,
            disk_thread: Some(handle),
            midi,
            midi_dropped,
            captured: HashMap::new(),
            active: HashMap::new(),
            take_counter: 1,
        };
        Ok((manager, tap))
    }

    /// Set output directory for new takes
    pub fn set_output_dir(&mut self, path: impl Into<PathBuf>) {
        self.output_dir = path.into();
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Ring size of new takes, in interleaved samples
    pub fn set_ring_samples(&mut self, samples: usize) {
        self.ring_samples = samples.max(TAKE_CHANNELS as usize);
    }

    pub fn is_recording(&self, track: usize) -> bool {
        self.active.contains_key(&track)
    }

    pub fn active_takes(&self) -> usize {
        self.active.len()
    }

    /// Live MIDI events lost because the capture queue was full
    pub fn midi_dropped(&self) -> u64 {
        self.midi_dropped.load(Ordering::Relaxed)
    }

    /// Start a take on `track`. Returns the file being written.
    pub fn start_take(&mut self, track: usize, name: &str, start_beat: f64) -> Result<PathBuf, RecordingError> {
        if track >= self.max_tracks {
            return Err(RecordingError::InvalidTrack(track));
        }
        if self.active.contains_key(&track) {
            return Err(RecordingError::AlreadyRecording(track));
        }
        if self.to_audio.slots() == 0 {
            return Err(RecordingError::QueueFull);
        }

        std::fs::create_dir_all(&self.output_dir)?;
        let path = self.output_dir.join(format!("{name}_take{}.wav", self.take_counter));
        let spec = hound::WavSpec {
            channels: TAKE_CHANNELS,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let file = hound::WavWriter::create(&path, spec)?;

        let (producer, consumer) = RingBuffer::new(self.ring_samples);
        let dropped = Arc::new(AtomicU64::new(0));
        let sink = TakeSink {
            track,
            consumer,
            file: Some(file),
            path: path.clone(),
            dropped: Arc::clone(&dropped),
            samples: 0,
            error: None,
        };
        self.disk.send(DiskCommand::Open(sink)).map_err(|_| RecordingError::WriterGone)?;

        let producer = TakeProducer { producer, dropped };
        if self.to_audio.push(TapCommand::Start { track, producer }).is_err() {
            return Err(RecordingError::QueueFull);
        }

        self.take_counter += 1;
        self.captured.remove(&track);
        self.active.insert(
            track,
            ActiveTake {
                path: path.clone(),
                start_beat,
            },
        );
        log::info!("Recording started on track {track}: {}", path.display());
        Ok(path)
    }

    /// Stop the take on `track`, wait for the disk thread to close it and
    /// return it with the MIDI captured meanwhile.
    pub fn stop_take(&mut self, track: usize) -> Result<Take, RecordingError> {
        let Some(active) = self.active.remove(&track) else {
            return Err(RecordingError::NotRecording(track));
        };
        if self.to_audio.push(TapCommand::Stop { track }).is_err() {
            log::warn!("[RECORD] stop command queue full; finishing track {track} after grace period");
        }

        let (reply, result) = crossbeam_channel::bounded(1);
        self.disk
            .send(DiskCommand::Finish { track, reply })
            .map_err(|_| RecordingError::WriterGone)?;
        let outcome = result.recv_timeout(STOP_TIMEOUT).map_err(|_| RecordingError::WriterGone)?;

        self.collect_midi();
        let mut midi = self.captured.remove(&track).unwrap_or_default();
        for event in &mut midi {
            event.beat -= active.start_beat;
        }

        let mut take = outcome?;
        take.midi = midi;
        log::info!(
            "Recording stopped on track {track}: {} ({} frames, {} MIDI events)",
            active.path.display(),
            take.frames,
            take.midi.len()
        );
        Ok(take)
    }

    /// Stop every active take
    pub fn stop_all(&mut self) -> Vec<Result<Take, RecordingError>> {
        let mut tracks: Vec<usize> = self.active.keys().copied().collect();
        tracks.sort_unstable();
        tracks.into_iter().map(|t| self.stop_take(t)).collect()
    }

    /// Drain the live MIDI capture queue. Called by housekeeping so the
    /// queue never fills during long takes.
    pub fn collect_midi(&mut self) -> usize {
        let mut count = 0;
        while let Ok((track, event)) = self.midi.pop() {
            self.captured.entry(track).or_default().push(event);
            count += 1;
        }
        count
    }
}

impl Drop for RecordingManager {
    fn drop(&mut self) {
        let _ = self.disk.send(DiskCommand::Shutdown);
        if let Some(handle) = self.disk_thread.take() {
            if handle.join().is_err() {
                log::error!("[RECORD] disk thread panicked");
            }
        }
    }
}
