//! mf-bounce: offline render of a demo arrangement
//!
//! Usage:
//!   mf-bounce --output mix.wav --beats 32
//!   mf-bounce --config engine.json --preset high-quality --metronome
//!
//! Builds a small project (sine instrument pattern, streamed pad, a
//! latency-reporting track feeding the reverb bus, a tempo change and a
//! master fade-out) and renders it through the background renderer.
//! `RUST_LOG` controls verbosity.

use std::f64::consts::TAU;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use mf_core::{BeatMidiEvent, MfError, MfResult, MidiMessage, TempoMap};
use mf_engine::{
    AutomationTarget, BackgroundRenderer, BasicTrack, Clip, ControlBlock, EngineConfig, MASTER_LANE_ID,
    MemoryLibrary, MemoryStream, Project, RenderRequest, Route, SnapshotPublisher, Track,
};

const PAD_PATH: &str = "demo/pad.wav";

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Preset {
    Default,
    LowLatency,
    HighQuality,
}

#[derive(Parser)]
#[command(name = "mf-bounce", about = "Render the Mixframe demo arrangement to a WAV file")]
struct Cli {
    /// Output WAV file
    #[arg(short, long, default_value = "bounce.wav")]
    output: PathBuf,

    /// First beat to render
    #[arg(long, default_value_t = 0.0)]
    start: f64,

    /// Number of beats to render
    #[arg(short, long, default_value_t = 16.0)]
    beats: f64,

    /// Engine configuration JSON (overrides --preset)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Built-in configuration preset
    #[arg(long, value_enum, default_value = "default")]
    preset: Preset,

    /// Sample rate override
    #[arg(long)]
    sample_rate: Option<f64>,

    /// Mix in the metronome click
    #[arg(long)]
    metronome: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        log::error!("mf-bounce failed: {e}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> MfResult<()> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => match cli.preset {
            Preset::Default => EngineConfig::default(),
            Preset::LowLatency => EngineConfig::low_latency(),
            Preset::HighQuality => EngineConfig::high_quality(),
        },
    };
    if let Some(rate) = cli.sample_rate {
        config.sample_rate = rate;
    }
    config.validate()?;

    let library = Arc::new(MemoryLibrary::new());
    library.insert(PAD_PATH, pad(config.sample_rate, 8.0));
    let publisher = Arc::new(SnapshotPublisher::with_opener(library));
    publisher.set_sample_rate(config.sample_rate);
    let project = demo_project(cli.start + cli.beats, config.sample_rate);
    publisher.rebuild(&project);
    log::info!(
        "Demo project: {} tracks, {} clips, {:.1} s at {} Hz",
        project.tracks.len(),
        project.arrangement.len(),
        project.tempo.seconds_at(cli.start + cli.beats) - project.tempo.seconds_at(cli.start),
        config.sample_rate
    );

    let control = ControlBlock {
        metronome: cli.metronome,
        ..ControlBlock::with_aux_buses(config.aux_bus_count)
    };
    let request = RenderRequest::new(config, publisher, cli.start, cli.start + cli.beats, &cli.output)
        .with_control(control);

    let mut renderer = BackgroundRenderer::new();
    renderer.start(request).map_err(MfError::from)?;

    let mut reported = 0;
    while renderer.is_busy() {
        std::thread::sleep(Duration::from_millis(100));
        let percent = (renderer.progress() * 100.0) as u32;
        if percent >= reported + 10 {
            reported = percent - percent % 10;
            log::info!("Rendering... {reported}%");
        }
    }

    let outcome = renderer
        .wait()
        .ok_or_else(|| MfError::Render("render thread produced no result".into()))?
        .map_err(MfError::from)?;
    log::info!(
        "Wrote {} ({} frames, {} Hz, peak {:.1} dBFS)",
        outcome.path.display(),
        outcome.frames,
        outcome.sample_rate,
        mf_core::gain_to_db(outcome.peak as f64)
    );
    Ok(())
}

/// Slow two-voice sine pad
fn pad(sample_rate: f64, seconds: f64) -> MemoryStream {
    let frames = (sample_rate * seconds) as usize;
    let voice = |freq: f64, detune: f64| {
        (0..frames)
            .map(|i| {
                let t = i as f64 / sample_rate;
                let swell = (TAU * 0.25 * t).sin() * 0.5 + 0.5;
                (0.15 * swell * (TAU * freq * t).sin() + 0.1 * (TAU * (freq * 1.5 + detune) * t).sin()) as f32
            })
            .collect::<Vec<f32>>()
    };
    MemoryStream::new(vec![voice(220.0, 0.3), voice(220.0, -0.3)], sample_rate)
}

fn demo_project(length_beats: f64, sample_rate: f64) -> Project {
    let mut project = Project::new();
    project.tempo = TempoMap::from_events([
        mf_core::TempoEvent::new(0.0, 120.0),
        mf_core::TempoEvent::new(8.0, 132.0),
    ]);

    // Instrument: one note per beat, arpeggiated
    let lead = project.add_track(Arc::new(BasicTrack::new("lead").with_instrument()));
    let notes = [60u8, 64, 67, 72];
    let events = (0..16)
        .flat_map(|beat| {
            let note = notes[beat % notes.len()];
            [
                BeatMidiEvent::new(beat as f64, MidiMessage::note_on(0, note, 100)),
                BeatMidiEvent::new(beat as f64 + 0.75, MidiMessage::note_off(0, note)),
            ]
        })
        .collect();
    project.add_clip(Clip::midi(lead, 0.0, 16.0, events));

    // Streamed pad with fades, looped every 8 beats
    let pad_track = Arc::new(BasicTrack::new("pad"));
    pad_track.set_pan(-0.3);
    let pad = project.add_track(pad_track);
    for start in [0.0, 8.0] {
        project.add_clip(
            Clip::audio(pad, start, 8.0, PAD_PATH, sample_rate)
                .with_gain(0.8)
                .with_fades(1.0, 1.0),
        );
    }

    // Latency-reporting track feeding the reverb bus
    let bells = Arc::new(BasicTrack::with_latency("bells", 256).with_instrument());
    bells.set_pan(0.4);
    bells.set_send_level(0.6);
    bells.set_send_bus(Some(0));
    bells.set_output_route(Route::Main);
    let bells_index = project.add_track(bells);
    let bell_events = (0..4)
        .map(|bar| BeatMidiEvent::new(bar as f64 * 4.0, MidiMessage::note_on(0, 84, 90)))
        .collect();
    project.add_clip(Clip::midi(bells_index, 0.0, 16.0, bell_events));

    // Master fade over the last two beats
    if let Some(master) = project.automation.get_mut(MASTER_LANE_ID) {
        let fade_start = (length_beats - 2.0).max(0.0);
        master.insert_point(fade_start, AutomationTarget::MasterOutput.default_value());
        master.insert_point(length_beats, 0.0);
    }
    project.selected_track = Some(lead);
    project
}
