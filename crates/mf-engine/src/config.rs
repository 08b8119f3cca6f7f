//! Engine configuration
//!
//! Static sizing and policy knobs, fixed for the lifetime of a prepared
//! engine. Runtime mixer switches live in [`crate::ControlBlock`].

use std::path::Path;

use mf_core::{MfError, MfResult, validate_sample_rate};
use mf_dsp::limiter::DEFAULT_CEILING;
use serde::{Deserialize, Serialize};

/// Hard upper bound for a single callback block
pub const MAX_BLOCK_SIZE: usize = 8192;

/// Hard upper bound for track count
pub const MAX_TRACKS: usize = 512;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hardware sample rate
    pub sample_rate: f64,
    /// Largest block the callback will ever deliver
    pub max_block_size: usize,
    /// Interleaved hardware input channels
    pub input_channels: usize,
    /// Interleaved hardware output channels
    pub output_channels: usize,
    /// Number of aux/return buses
    pub aux_bus_count: usize,
    /// Pre-allocated track slots
    pub max_tracks: usize,
    /// Track worker threads (0 = cpu count minus one)
    pub worker_threads: usize,
    /// Minimum track count before jobs are dispatched to workers
    pub parallel_min_tracks: usize,
    /// Minimum block size before jobs are dispatched to workers
    pub parallel_min_block: usize,
    /// Blocks muted after prepare / fault
    pub startup_mute_blocks: u32,
    /// Release ramp after a mute window, in samples
    pub startup_ramp_samples: usize,
    /// Initial PDC ring capacity per channel, in samples
    pub pdc_initial_capacity: usize,
    /// Extra headroom added when PDC rings grow
    pub pdc_growth_margin: usize,
    /// Automation write-back queue slots
    pub automation_queue_capacity: usize,
    /// Live MIDI queue slots
    pub live_midi_queue_capacity: usize,
    /// MIDI events per track per block
    pub midi_buffer_capacity: usize,
    /// Recording ring length per take, in seconds
    pub recording_ring_seconds: f64,
    /// Fraction of the block time budget that counts as overload
    pub overload_fraction: f64,
    /// Blocks with parallel dispatch and aux effects disabled after overload
    pub overload_recovery_blocks: u32,
    /// Absolute amplitude treated as a severe output fault
    pub severe_fault_amplitude: f64,
    /// Master output ceiling (linear)
    pub master_ceiling: f64,
    /// Blocks the clip indicator stays lit
    pub clip_hold_blocks: u32,
    /// Analyzer feed window length (power of two)
    pub analyzer_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            max_block_size: 1024,
            input_channels: 2,
            output_channels: 2,
            aux_bus_count: 2,
            max_tracks: 64,
            worker_threads: 0,
            parallel_min_tracks: 4,
            parallel_min_block: 128,
            startup_mute_blocks: 4,
            startup_ramp_samples: 2048,
            pdc_initial_capacity: 8192,
            pdc_growth_margin: 1024,
            automation_queue_capacity: 4096,
            live_midi_queue_capacity: 1024,
            midi_buffer_capacity: 512,
            recording_ring_seconds: 4.0,
            overload_fraction: 0.85,
            overload_recovery_blocks: 64,
            severe_fault_amplitude: 24.0,
            master_ceiling: DEFAULT_CEILING,
            clip_hold_blocks: 50,
            analyzer_window: 2048,
        }
    }
}

impl EngineConfig {
    /// Small blocks, sequential scheduling, short mute window
    pub fn low_latency() -> Self {
        Self {
            max_block_size: 256,
            parallel_min_tracks: 16,
            parallel_min_block: 256,
            startup_mute_blocks: 8,
            startup_ramp_samples: 1024,
            overload_fraction: 0.7,
            analyzer_window: 1024,
            ..Self::default()
        }
    }

    /// Large blocks, eager parallel dispatch, deep rings
    pub fn high_quality() -> Self {
        Self {
            sample_rate: 96_000.0,
            max_block_size: 4096,
            parallel_min_tracks: 2,
            parallel_min_block: 64,
            startup_ramp_samples: 4096,
            pdc_initial_capacity: 32_768,
            pdc_growth_margin: 4096,
            recording_ring_seconds: 8.0,
            overload_fraction: 0.9,
            analyzer_window: 4096,
            ..Self::default()
        }
    }

    /// Configuration for offline rendering (no startup mute, no ramp)
    pub fn offline(&self) -> Self {
        Self {
            startup_mute_blocks: 0,
            startup_ramp_samples: 0,
            ..self.clone()
        }
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> MfResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| MfError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        log::info!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Serialize to pretty JSON
    pub fn to_json(&self) -> MfResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| MfError::Config(e.to_string()))
    }

    /// Resolved worker thread count
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get().saturating_sub(1).max(1)
        } else {
            self.worker_threads
        }
    }

    /// Recording ring size in interleaved samples for `channels` channels
    pub fn recording_ring_samples(&self, channels: usize) -> usize {
        ((self.recording_ring_seconds * self.sample_rate) as usize).max(self.max_block_size) * channels.max(1)
    }

    pub fn validate(&self) -> MfResult<()> {
        validate_sample_rate(self.sample_rate)?;

        let invalid = |msg: String| Err(MfError::Config(msg));

        if self.max_block_size == 0 || self.max_block_size > MAX_BLOCK_SIZE {
            return invalid(format!("max_block_size {} outside 1..={MAX_BLOCK_SIZE}", self.max_block_size));
        }
        if self.max_tracks == 0 || self.max_tracks > MAX_TRACKS {
            return invalid(format!("max_tracks {} outside 1..={MAX_TRACKS}", self.max_tracks));
        }
        if self.output_channels == 0 || self.output_channels > mf_core::MAX_CHANNELS {
            return invalid(format!("output_channels {} unsupported", self.output_channels));
        }
        if self.input_channels > mf_core::MAX_CHANNELS {
            return invalid(format!("input_channels {} unsupported", self.input_channels));
        }
        if self.pdc_initial_capacity <= self.max_block_size {
            return invalid("pdc_initial_capacity must exceed max_block_size".into());
        }
        if self.automation_queue_capacity == 0 || self.live_midi_queue_capacity == 0 || self.midi_buffer_capacity == 0 {
            return invalid("queue capacities must be non-zero".into());
        }
        if !(self.recording_ring_seconds > 0.0) {
            return invalid("recording_ring_seconds must be positive".into());
        }
        if !(self.overload_fraction > 0.0 && self.overload_fraction <= 1.0) {
            return invalid(format!("overload_fraction {} outside (0, 1]", self.overload_fraction));
        }
        if !(self.master_ceiling > 0.0 && self.master_ceiling <= 1.0) {
            return invalid(format!("master_ceiling {} outside (0, 1]", self.master_ceiling));
        }
        if !(self.severe_fault_amplitude > 1.0) {
            return invalid("severe_fault_amplitude must be above full scale".into());
        }
        if !self.analyzer_window.is_power_of_two() || self.analyzer_window < 64 {
            return invalid(format!("analyzer_window {} must be a power of two >= 64", self.analyzer_window));
        }
        Ok(())
    }
}
