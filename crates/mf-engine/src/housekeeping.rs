//! Housekeeping pass
//!
//! Low-priority control-thread work, run once per UI refresh tick:
//! - Free retired snapshots and control blocks no reader holds
//! - Service PDC capacity requests (allocate, hand over, free returned rings)
//! - Merge automation write-back into the project and republish
//! - Collect captured MIDI for active takes
//! - Turn telemetry counter changes into log lines
//!
//! A new severe fault switches the engine to monitor-safe mode.

use std::sync::Arc;

use crate::automation::AutomationWriteback;
use crate::control::ControlSlot;
use crate::pdc::PdcCapacityService;
use crate::recording::RecordingManager;
use crate::snapshot::{Project, SnapshotPublisher};
use crate::telemetry::{Counter, Telemetry};
use crate::transport::TransportShared;

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HousekeepingReport {
    pub snapshots_freed: usize,
    pub controls_freed: usize,
    pub automation_merged: usize,
    /// Snapshot version published after merging automation
    pub republished: Option<u64>,
    /// New ring capacity when a PDC growth pass started
    pub pdc_growth: Option<usize>,
    pub midi_collected: usize,
    /// Monitor-safe mode switched on after a severe fault
    pub monitor_safe_engaged: bool,
}

/// Control-thread housekeeper, created alongside the engine
pub struct Housekeeper {
    publisher: Arc<SnapshotPublisher>,
    control: Arc<ControlSlot>,
    transport: Arc<TransportShared>,
    telemetry: Arc<Telemetry>,
    pdc: PdcCapacityService,
    automation: AutomationWriteback,
    last_counters: [u64; Counter::ALL.len()],
    was_playing: bool,
}

impl Housekeeper {
    pub(crate) fn new(
        publisher: Arc<SnapshotPublisher>,
        control: Arc<ControlSlot>,
        transport: Arc<TransportShared>,
        telemetry: Arc<Telemetry>,
        pdc: PdcCapacityService,
        automation: AutomationWriteback,
    ) -> Self {
        Self {
            publisher,
            control,
            transport,
            telemetry,
            pdc,
            automation,
            last_counters: [0; Counter::ALL.len()],
            was_playing: false,
        }
    }

    /// Run one pass. `project` receives merged automation; `recording`
    /// receives captured take MIDI.
    pub fn tick(&mut self, project: &mut Project, recording: &mut RecordingManager) -> HousekeepingReport {
        let mut report = HousekeepingReport {
            snapshots_freed: self.publisher.drain_retired(),
            controls_freed: self.control.drain_retired(),
            pdc_growth: self.pdc.service(),
            ..Default::default()
        };

        report.automation_merged = self.automation.merge_into(&mut project.automation);
        if report.automation_merged > 0 {
            report.republished = Some(self.publisher.rebuild(project));
            log::debug!("[AUTOMATION] merged {} captured points", report.automation_merged);
        }

        let playing = self.transport.is_playing();
        if self.was_playing && !playing {
            // Queue already flushed above; the next pass starts fresh
            self.automation.end_pass();
        }
        self.was_playing = playing;

        report.midi_collected = recording.collect_midi();
        report.monitor_safe_engaged = self.log_counters();
        report
    }

    /// Log changed counters. Returns true when monitor-safe mode was engaged.
    fn log_counters(&mut self) -> bool {
        let mut engaged = false;
        for (counter, last) in Counter::ALL.iter().zip(self.last_counters.iter_mut()) {
            let now = self.telemetry.counter(*counter);
            let delta = now.saturating_sub(*last);
            *last = now;
            if delta == 0 {
                continue;
            }
            match counter {
                Counter::SevereFault => {
                    log::error!("{} {} +{delta} (total {now}), live input cut", counter.tag(), counter.name());
                    if !self.control.load().monitor_safe {
                        self.control.update(|c| c.monitor_safe = true);
                        log::warn!("[SAFETY] monitor-safe mode engaged");
                        engaged = true;
                    }
                }
                Counter::LockContention => {
                    log::debug!("{} {} +{delta} (total {now})", counter.tag(), counter.name());
                }
                _ => log::warn!("{} {} +{delta} (total {now})", counter.tag(), counter.name()),
            }
        }
        engaged
    }

    pub fn pdc_capacity(&self) -> usize {
        self.pdc.shared().capacity()
    }

    /// Automation captures waiting to be merged
    pub fn pending_automation(&self) -> usize {
        self.automation.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::{AutomationMode, AutomationTarget};
    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::track::BasicTrack;

    const N: usize = 128;

    fn setup(project: &Project) -> (Engine, crate::engine::EngineHandle, Housekeeper) {
        let publisher = Arc::new(SnapshotPublisher::new());
        publisher.rebuild(project);
        let config = EngineConfig {
            max_block_size: N,
            max_tracks: 4,
            worker_threads: 1,
            startup_mute_blocks: 0,
            startup_ramp_samples: 0,
            pdc_initial_capacity: 512,
            ..Default::default()
        };
        Engine::new(config, publisher).unwrap()
    }

    fn run(engine: &mut Engine, blocks: usize) {
        let mut out = vec![0.0f32; N * 2];
        for _ in 0..blocks {
            engine.render_block(&[], &mut out, N);
        }
    }

    #[test]
    fn test_tick_frees_retired_snapshots() {
        let mut project = Project::new();
        project.add_track(Arc::new(BasicTrack::new("a")));
        let (mut engine, mut handle, mut hk) = setup(&project);
        run(&mut engine, 1);

        handle.publisher().rebuild(&project);
        handle.publisher().rebuild(&project);
        handle.update_control(|c| c.metronome = true);
        let report = hk.tick(&mut project, handle.recording_mut());
        assert_eq!(report.snapshots_freed, 2);
        assert_eq!(report.controls_freed, 1);
    }

    #[test]
    fn test_tick_merges_write_automation() {
        let mut project = Project::new();
        let track = project.add_track(Arc::new(BasicTrack::new("a")));
        let lane = project.automation.ensure_lane(AutomationTarget::TrackVolume, Some(track));
        project.automation.set_mode(lane, AutomationMode::Write);
        let (mut engine, mut handle, mut hk) = setup(&project);

        handle.transport().play();
        run(&mut engine, 4);
        let report = hk.tick(&mut project, handle.recording_mut());
        assert!(report.automation_merged > 0);
        assert!(report.republished.is_some());
        assert!(!project.automation.get(lane).unwrap().points().is_empty());
    }

    #[test]
    fn test_pdc_growth_serviced() {
        let mut project = Project::new();
        project.add_track(Arc::new(BasicTrack::with_latency("slow", 2000)));
        project.add_track(Arc::new(BasicTrack::new("fast")));
        let (mut engine, mut handle, mut hk) = setup(&project);

        run(&mut engine, 1);
        assert_eq!(handle.telemetry().counter(Counter::PdcSkip), 1);

        let report = hk.tick(&mut project, handle.recording_mut());
        assert!(report.pdc_growth.unwrap() > 2000);
        assert!(hk.pdc_capacity() > 2000);

        run(&mut engine, 1);
        assert_eq!(handle.telemetry().counter(Counter::PdcSkip), 1);
    }

    #[test]
    fn test_severe_fault_engages_monitor_safe() {
        let mut project = Project::new();
        project.add_track(Arc::new(BasicTrack::new("a")));
        let (_engine, mut handle, mut hk) = setup(&project);

        handle.telemetry().increment(Counter::SevereFault);
        let report = hk.tick(&mut project, handle.recording_mut());
        assert!(report.monitor_safe_engaged);
        assert!(handle.control().get().monitor_safe);

        // Already engaged: no second update
        handle.telemetry().increment(Counter::SevereFault);
        let report = hk.tick(&mut project, handle.recording_mut());
        assert!(!report.monitor_safe_engaged);
    }
}
