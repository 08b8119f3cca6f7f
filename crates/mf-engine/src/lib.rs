//! mf-engine: Real-time mixing core for Mixframe
//!
//! Provides the block-synchronous engine with:
//! - Immutable snapshots published with one atomic swap, retired off the audio thread
//! - Transport with loop wrap and tempo-map beat/sample conversion
//! - Automation read/write with a lock-free write-back queue
//! - Live and clip MIDI, note engines, global transpose
//! - Parallel track scheduling (rayon) with plugin delay compensation
//! - Aux buses, master chain and a metronome
//! - Startup mute, release ramp, fault scrubbing and overload recovery
//! - Lock-free telemetry, live input tap, take recording
//! - Offline render through the same block routine
//!
//! ## Threads
//! - Audio: [`Engine::render_block`] only
//! - Control: [`EngineHandle`], [`Housekeeper::tick`], [`SnapshotPublisher`]
//! - Disk writer and background render threads are owned by
//!   [`RecordingManager`] and [`BackgroundRenderer`]

// Audio code uses explicit indexing over parallel channel buffers
#![allow(clippy::needless_range_loop)]
// Block routines take the full set of buffers they touch
#![allow(clippy::too_many_arguments)]

// Model
mod automation;
mod config;
mod control;
mod snapshot;
mod stream;
mod track;
mod transport;

// Audio thread
mod aux_bus;
mod clip_render;
mod engine;
mod master;
mod metronome;
mod midi;
mod note_engine;
mod pdc;
mod safety;
mod scheduler;

// Feeds and side threads
mod double_buffer;
mod housekeeping;
mod input;
mod recording;
mod render;
mod telemetry;

pub use automation::*;
pub use aux_bus::*;
pub use clip_render::*;
pub use config::*;
pub use control::*;
pub use double_buffer::*;
pub use engine::*;
pub use housekeeping::*;
pub use input::*;
pub use master::*;
pub use metronome::*;
pub use midi::*;
pub use note_engine::*;
pub use pdc::*;
pub use recording::*;
pub use render::*;
pub use safety::*;
pub use scheduler::*;
pub use snapshot::*;
pub use stream::*;
pub use telemetry::*;
pub use track::*;
pub use transport::*;
