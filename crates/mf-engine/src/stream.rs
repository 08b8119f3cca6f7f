//! Streaming sources for audio clip playback
//!
//! Disk streaming itself lives outside the engine; the engine only consumes
//! the [`StreamingSource`] contract. [`MemoryStream`] is an in-memory
//! implementation used by tests, the bounce tool and offline renders.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

/// Read-only, random access audio source
pub trait StreamingSource: Send + Sync {
    /// Whether reads will return real audio
    fn is_ready(&self) -> bool;

    fn sample_rate(&self) -> f64;

    fn num_channels(&self) -> usize;

    /// Length in frames
    fn num_samples(&self) -> u64;

    /// Read `length` frames starting at `start_sample` into planar `buffer`.
    ///
    /// Must not block or allocate. Frames past the end of the source and
    /// channels the source does not have are written as silence. Returns
    /// the number of frames that came from the source.
    fn read_samples(&self, buffer: &mut [&mut [f32]], start_sample: i64, length: usize) -> usize;
}

/// Resolves clip file paths to streaming sources (control thread)
pub trait StreamOpener: Send + Sync {
    fn open(&self, path: &Path, sample_rate: f64) -> Option<Arc<dyn StreamingSource>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// MEMORY STREAM
// ═══════════════════════════════════════════════════════════════════════════════

/// Fully loaded planar audio
#[derive(Debug, Clone)]
pub struct MemoryStream {
    channels: Vec<Vec<f32>>,
    sample_rate: f64,
}

impl MemoryStream {
    /// Build from planar channel data; channels are truncated to the shortest
    pub fn new(mut channels: Vec<Vec<f32>>, sample_rate: f64) -> Self {
        let len = channels.iter().map(Vec::len).min().unwrap_or(0);
        channels.iter_mut().for_each(|c| c.truncate(len));
        Self { channels, sample_rate }
    }

    /// Single-channel source
    pub fn mono(samples: Vec<f32>, sample_rate: f64) -> Self {
        Self::new(vec![samples], sample_rate)
    }

    /// Load a WAV file fully into memory
    pub fn from_wav(path: impl AsRef<Path>) -> Result<Self, hound::Error> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = 1.0 / (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 * scale))
                    .collect::<Result<_, _>>()?
            }
        };

        let frames = interleaved.len() / channels;
        let mut planar = vec![Vec::with_capacity(frames); channels];
        for frame in interleaved.chunks_exact(channels) {
            for (ch, &s) in frame.iter().enumerate() {
                planar[ch].push(s);
            }
        }
        Ok(Self::new(planar, spec.sample_rate as f64))
    }
}

impl StreamingSource for MemoryStream {
    fn is_ready(&self) -> bool {
        !self.channels.is_empty()
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn num_channels(&self) -> usize {
        self.channels.len()
    }

    fn num_samples(&self) -> u64 {
        self.channels.first().map_or(0, |c| c.len() as u64)
    }

    fn read_samples(&self, buffer: &mut [&mut [f32]], start_sample: i64, length: usize) -> usize {
        let total = self.num_samples() as i64;
        let mut read = 0;

        for (ch, out) in buffer.iter_mut().enumerate() {
            let n = length.min(out.len());
            let out = &mut out[..n];
            out.fill(0.0);
            let Some(src) = self.channels.get(ch) else {
                continue;
            };

            // Overlap of [start, start + len) with [0, total)
            let begin = start_sample.max(0);
            let end = (start_sample + out.len() as i64).min(total);
            if end <= begin {
                continue;
            }
            let dst_offset = (begin - start_sample) as usize;
            let count = (end - begin) as usize;
            out[dst_offset..dst_offset + count].copy_from_slice(&src[begin as usize..end as usize]);
            read = read.max(count);
        }
        read
    }
}

/// Path-keyed collection of in-memory sources
#[derive(Default)]
pub struct MemoryLibrary {
    sources: RwLock<HashMap<PathBuf, Arc<MemoryStream>>>,
}

impl MemoryLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, stream: MemoryStream) {
        self.sources.write().insert(path.into(), Arc::new(stream));
    }

    pub fn remove(&self, path: &Path) -> bool {
        self.sources.write().remove(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StreamOpener for MemoryLibrary {
    fn open(&self, path: &Path, _sample_rate: f64) -> Option<Arc<dyn StreamingSource>> {
        self.sources
            .read()
            .get(path)
            .map(|s| Arc::clone(s) as Arc<dyn StreamingSource>)
    }
}

/// Opens WAV files from disk, loading them fully into memory
#[derive(Debug, Default, Clone, Copy)]
pub struct WavFileOpener;

impl StreamOpener for WavFileOpener {
    fn open(&self, path: &Path, _sample_rate: f64) -> Option<Arc<dyn StreamingSource>> {
        match MemoryStream::from_wav(path) {
            Ok(stream) => Some(Arc::new(stream)),
            Err(e) => {
                log::warn!("Failed to open clip source {}: {e}", path.display());
                None
            }
        }
    }
}
