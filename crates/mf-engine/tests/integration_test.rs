//! Cross-module behaviour of the engine
//!
//! - Snapshot publication under concurrent readers
//! - Plugin delay compensation alignment
//! - Automation Write-mode capture and merge
//! - Clip fade law
//! - Master chain boundedness
//! - Feedback suppression on aux routing
//! - Tempo map boundaries through the transport

use std::f64::consts::FRAC_1_SQRT_2;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use approx::assert_relative_eq;
use mf_core::{BEAT_EPSILON, BeatMidiEvent, MidiMessage, Sample, TempoEvent, TempoMap};
use mf_dsp::fade::ClipFades;
use mf_engine::{
    AutomationMode, AutomationTarget, AuxBus, BasicTrack, Clip, Engine, EngineConfig, EngineHandle,
    Housekeeper, MasterChain, MasterSettings, MemoryLibrary, MemoryStream, Project, Route, SnapshotPublisher,
    Telemetry, Track, TrackScheduler,
};

const SR: f64 = 48_000.0;

fn config(block: usize) -> EngineConfig {
    EngineConfig {
        sample_rate: SR,
        max_block_size: block,
        max_tracks: 8,
        worker_threads: 1,
        startup_mute_blocks: 0,
        startup_ramp_samples: 0,
        ..Default::default()
    }
}

/// Master stages that change the signal shape, off
fn transparent_master(handle: &EngineHandle) {
    handle.update_control(|c| {
        c.soft_clip = false;
        c.limiter = false;
        c.dc_block = false;
        c.dither = false;
    });
}

fn render(engine: &mut Engine, block: usize, blocks: usize) -> Vec<f32> {
    let mut left = Vec::with_capacity(block * blocks);
    let mut out = vec![0.0f32; block * 2];
    for _ in 0..blocks {
        engine.render_block(&[], &mut out, block);
        left.extend(out.chunks_exact(2).map(|f| f[0]));
    }
    left
}

fn argmax(samples: &[f32]) -> usize {
    samples
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
        .map(|(i, _)| i)
        .unwrap()
}

// ═══════════════════════════════════════════════════════════════════════════════
// SNAPSHOT PUBLICATION
// ═══════════════════════════════════════════════════════════════════════════════

fn project_with(tracks: usize) -> Project {
    let mut project = Project::new();
    for i in 0..tracks {
        let index = project.add_track(Arc::new(BasicTrack::new(format!("t{i}"))));
        project.add_clip(Clip::midi(index, i as f64, 1.0, Vec::new()));
    }
    project.transpose = tracks as i32;
    project
}

#[test]
fn test_snapshot_readers_never_see_partial_state() {
    let publisher = Arc::new(SnapshotPublisher::new());
    publisher.rebuild(&project_with(1));
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let publisher = Arc::clone(&publisher);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut last_version = 0;
                let mut reads = 0u64;
                while !done.load(Ordering::Acquire) {
                    let snapshot = publisher.load().unwrap();
                    assert_eq!(snapshot.tracks.len(), snapshot.arrangement.len());
                    assert_eq!(snapshot.tracks.len(), snapshot.transpose as usize);
                    assert!(snapshot.version >= last_version);
                    last_version = snapshot.version;
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    for round in 0..200 {
        publisher.rebuild(&project_with(1 + round % 7));
        if round % 16 == 0 {
            publisher.drain_retired();
        }
    }
    done.store(true, Ordering::Release);
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }

    // With every reader gone, everything retired can be freed
    publisher.drain_retired();
    assert_eq!(publisher.retired_count(), 0);
    assert_eq!(publisher.load().unwrap().tracks.len(), 1 + 199 % 7);
}

// ═══════════════════════════════════════════════════════════════════════════════
// PDC ALIGNMENT
// ═══════════════════════════════════════════════════════════════════════════════

/// Impulse clip on one of two tracks; the other track reports `latency`
fn pdc_peak(impulse_on_delayed_track: bool, latency: usize) -> usize {
    const BLOCK: usize = 256;
    let mut impulse = vec![0.0f32; 48_000];
    impulse[2_000] = 1.0;
    let library = Arc::new(MemoryLibrary::new());
    library.insert("impulse.wav", MemoryStream::mono(impulse, SR));
    let publisher = Arc::new(SnapshotPublisher::with_opener(library));

    let mut project = Project::new();
    let direct = project.add_track(Arc::new(BasicTrack::new("direct")));
    let delayed = project.add_track(Arc::new(BasicTrack::with_latency("delayed", latency)));
    let target = if impulse_on_delayed_track { delayed } else { direct };
    project.add_clip(Clip::audio(target, 0.0, 4.0, "impulse.wav", SR));
    publisher.rebuild(&project);

    let (mut engine, handle, _hk) = Engine::new(config(BLOCK), publisher).unwrap();
    transparent_master(&handle);
    handle.transport().play();
    let left = render(&mut engine, BLOCK, 20);
    assert_eq!(handle.telemetry().graph_latency(), latency);
    argmax(&left)
}

#[test]
fn test_pdc_aligns_tracks_of_different_latency() {
    let latency = 300;
    let through_direct = pdc_peak(false, latency);
    let through_delayed = pdc_peak(true, latency);
    assert_eq!(through_direct, through_delayed);
    // Without compensation the direct path would peak `latency` samples earlier
    assert!(through_direct >= 2_000 + latency);
}

// ═══════════════════════════════════════════════════════════════════════════════
// AUTOMATION WRITE
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_write_mode_collapses_to_epsilon_grid() {
    const BLOCK: usize = 64;
    let mut project = Project::new();
    let track = Arc::new(BasicTrack::new("vox"));
    track.set_volume(0.8);
    let index = project.add_track(track);
    let lane = project.automation.ensure_lane(AutomationTarget::TrackVolume, Some(index));
    project.automation.set_mode(lane, AutomationMode::Write);

    let publisher = Arc::new(SnapshotPublisher::new());
    publisher.rebuild(&project);
    let (mut engine, mut handle, mut hk): (Engine, EngineHandle, Housekeeper) =
        Engine::new(config(BLOCK), publisher).unwrap();
    handle.transport().play();

    for _ in 0..40 {
        render(&mut engine, BLOCK, 10);
        hk.tick(&mut project, handle.recording_mut());
    }
    let rendered_beats = engine.position();

    let points = project.automation.get(lane).unwrap().points();
    assert!(!points.is_empty());
    assert!(points.windows(2).all(|w| w[1].beat > w[0].beat));
    assert!(points.windows(2).all(|w| w[1].beat - w[0].beat >= BEAT_EPSILON - 1e-9));
    assert!(points.len() as f64 <= (rendered_beats / BEAT_EPSILON).ceil() + 1.0);
    for point in points {
        assert_relative_eq!(point.value, 0.8, epsilon = 1e-9);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// FADES & MASTER
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_fade_in_law() {
    let fades = ClipFades {
        fade_in: 2.0,
        ..Default::default()
    };
    let length = 8.0;
    assert_eq!(fades.gain_at(0.0, length), 0.0);
    assert_relative_eq!(fades.gain_at(2.0, length), 1.0, epsilon = 1e-12);

    let mut previous = 0.0;
    for step in 0..=200 {
        let gain = fades.gain_at(step as f64 * 0.01, length);
        assert!(gain >= previous);
        previous = gain;
    }
    // Equal power: -3 dB at the midpoint
    assert_relative_eq!(fades.gain_at(1.0, length), FRAC_1_SQRT_2, epsilon = 1e-12);
}

#[test]
fn test_master_output_bounded_for_any_finite_input() {
    let ceiling = 0.9;
    let mut seed = 0x2545_f491_u64;
    let mut next = move || {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        (seed as f64 / u64::MAX as f64) * 2.0 - 1.0
    };

    for (soft_clip, limiter, dc_block, dither) in [
        (false, false, false, false),
        (true, false, false, false),
        (false, true, true, false),
        (true, true, true, true),
    ] {
        let mut chain = MasterChain::new(SR, ceiling);
        let settings = MasterSettings {
            gain: 4.0,
            soft_clip,
            limiter,
            dc_block,
            dither,
            dither_bits: 16,
        };
        for block in 0..50 {
            let scale = 10f64.powi(block % 7);
            let mut left: Vec<Sample> = (0..256).map(|_| next() * scale).collect();
            let mut right: Vec<Sample> = (0..256).map(|_| next() * scale).collect();
            chain.process(&mut left, &mut right, &settings);
            for s in left.iter().chain(right.iter()) {
                assert!(s.is_finite());
                assert!(s.abs() <= ceiling);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ROUTING
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_send_into_own_output_bus_is_suppressed() {
    const N: usize = 128;
    let config = config(N);
    let mut scheduler = TrackScheduler::sequential(&config);
    let mut aux = vec![AuxBus::new(0, N, SR), AuxBus::new(1, N, SR)];
    let telemetry = Telemetry::new(config.max_tracks);

    let a = BasicTrack::new("a");
    a.set_output_route(Route::AuxBus(0));
    a.set_send_bus(Some(0));
    a.set_send_level(0.5);
    let b = BasicTrack::new("b");
    let tracks: Vec<Arc<dyn Track>> = vec![Arc::new(a), Arc::new(b)];

    assert!(scheduler.begin_block(tracks.len(), N));
    scheduler.slot_mut(0).unwrap().source_mut().0.fill(1.0);
    scheduler.slot_mut(0).unwrap().source_mut().1.fill(1.0);
    scheduler.slot_mut(1).unwrap().source_mut().0.fill(0.5);
    scheduler.slot_mut(1).unwrap().source_mut().1.fill(0.5);
    scheduler.resolve_routing(&tracks, &aux, false);
    scheduler.run(&tracks, None, false, N, false);

    let mut main_l = vec![0.0; N];
    let mut main_r = vec![0.0; N];
    for bus in &mut aux {
        bus.clear(N);
    }
    scheduler.mix(&mut aux, &mut main_l, &mut main_r, N, &telemetry);

    // Track A reaches bus 0 once through its main output, never via the send
    let (bus_l, _) = aux[0].output(N);
    for &s in bus_l {
        assert_relative_eq!(s, FRAC_1_SQRT_2, epsilon = 1e-9);
    }
    assert!(aux[1].output(N).0.iter().all(|&s| s == 0.0));
    for &s in &main_l {
        assert_relative_eq!(s, 0.5 * FRAC_1_SQRT_2, epsilon = 1e-9);
    }
}

#[test]
fn test_solo_silences_other_tracks() {
    const BLOCK: usize = 128;
    let library = Arc::new(MemoryLibrary::new());
    library.insert("dc.wav", MemoryStream::mono(vec![0.5; 48_000], SR));
    let publisher = Arc::new(SnapshotPublisher::with_opener(library));

    let mut project = Project::new();
    let loud = Arc::new(BasicTrack::new("loud"));
    let quiet = Arc::new(BasicTrack::new("quiet"));
    quiet.set_soloed(true);
    let loud_index = project.add_track(Arc::clone(&loud) as Arc<dyn Track>);
    let quiet_index = project.add_track(Arc::clone(&quiet) as Arc<dyn Track>);
    project.add_clip(Clip::audio(loud_index, 0.0, 4.0, "dc.wav", SR));
    project.add_clip(Clip::audio(quiet_index, 0.0, 4.0, "dc.wav", SR).with_gain(0.5));
    publisher.rebuild(&project);

    let (mut engine, handle, _hk) = Engine::new(config(BLOCK), publisher).unwrap();
    transparent_master(&handle);
    handle.transport().play();
    render(&mut engine, BLOCK, 4);

    assert_eq!(handle.telemetry().track_peak(loud_index), 0.0);
    assert!(handle.telemetry().track_peak(quiet_index) > 0.1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// TEMPO & TRANSPORT
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_tempo_change_boundary() {
    let tempo = TempoMap::from_events([TempoEvent::new(0.0, 120.0), TempoEvent::new(8.0, 140.0)]);
    assert_eq!(tempo.tempo_at(8.0), 140.0);
    assert_eq!(tempo.tempo_at(7.999), 120.0);

    let mut project = Project::new();
    project.add_track(Arc::new(BasicTrack::new("a")));
    project.tempo = tempo;
    let publisher = Arc::new(SnapshotPublisher::new());
    publisher.rebuild(&project);

    let (mut engine, handle, _hk) = Engine::new(config(480), publisher).unwrap();
    handle.transport().locate(8.0);
    handle.transport().play();
    render(&mut engine, 480, 1);

    // 480 samples = 10 ms at 140 BPM
    assert_relative_eq!(engine.position(), 8.0 + 140.0 / 60.0 * 0.01, epsilon = 1e-9);
}

#[test]
fn test_loop_region_wraps_transport() {
    let mut project = Project::new();
    project.add_track(Arc::new(BasicTrack::new("a").with_instrument()));
    project.add_clip(Clip::midi(
        0,
        0.0,
        1.0,
        vec![BeatMidiEvent::new(0.0, MidiMessage::note_on(0, 60, 100))],
    ));
    let publisher = Arc::new(SnapshotPublisher::new());
    publisher.rebuild(&project);

    let (mut engine, handle, _hk) = Engine::new(config(512), publisher).unwrap();
    handle.update_control(|c| {
        c.loop_enabled = true;
        c.loop_start = 0.0;
        c.loop_end = 1.0;
    });
    handle.transport().play();

    // One beat at 120 BPM = 24000 samples; render three beats' worth
    render(&mut engine, 512, 141);
    let position = engine.position();
    assert!((0.0..1.0).contains(&position));
}
