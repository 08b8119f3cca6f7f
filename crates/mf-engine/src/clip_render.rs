//! Clip rendering
//!
//! Runs before the track graph, once per block segment:
//! - MIDI clips: events falling inside the segment are placed into the
//!   owning track's MIDI buffer at sample-accurate offsets, transposed by
//!   the global transpose
//! - Audio clips: read from the clip's streaming source, resampled with a
//!   band-limited polyphase sinc, shaped by the equal-power clip fades and
//!   short linear micro-fades at the clip edges, and summed into the
//!   track's source buffers
//!
//! Source reads go through pre-allocated scratch buffers in chunks, so any
//! clip/engine rate ratio renders without allocating.

use mf_core::{MidiEvent, Sample, TempoMap};
use mf_dsp::fade::{MICRO_FADE_SAMPLES, micro_fade_gain};
use mf_dsp::interpolation::{PolyphaseSinc, TAPS};

use crate::midi::MidiBuffer;
use crate::snapshot::{Clip, ClipKind};
use crate::stream::StreamingSource;
use crate::transport::BlockSegment;

/// Largest clip/engine rate ratio rendered in one chunk per block frame
const SCRATCH_RATIO: usize = 4;

/// Extra frames around a read window for the interpolation kernel
const WINDOW_PAD: usize = TAPS + 2;

/// Clip renderer with pre-allocated scratch
pub struct ClipRenderer {
    interpolator: PolyphaseSinc,
    scratch: [Vec<f32>; 2],
}

impl ClipRenderer {
    pub fn new(max_block: usize) -> Self {
        let len = max_block * SCRATCH_RATIO + WINDOW_PAD;
        Self {
            interpolator: PolyphaseSinc::new(),
            scratch: [vec![0.0; len], vec![0.0; len]],
        }
    }

    pub fn prepare(&mut self, max_block: usize) {
        *self = Self::new(max_block);
    }

    /// Place `clip`'s events that fall inside `segment` into `midi`.
    /// Returns the number of events placed.
    pub fn render_midi(
        clip: &Clip,
        segment: &BlockSegment,
        tempo: &TempoMap,
        transpose: i32,
        sample_rate: f64,
        midi: &mut MidiBuffer,
    ) -> usize {
        let ClipKind::Midi { events } = &clip.kind else {
            return 0;
        };
        if segment.len == 0 || segment.beats_per_sample() <= 0.0 || !segment.overlaps(clip.start_beat, clip.end_beat()) {
            return 0;
        }

        let seg_start = tempo.samples_at(segment.start_beat, sample_rate);
        let last = segment.offset + segment.len - 1;
        let mut placed = 0;

        // Events are sorted; skip straight to the segment
        let first = events.partition_point(|e| clip.start_beat + e.beat < segment.start_beat);
        for event in &events[first..] {
            let beat = clip.start_beat + event.beat;
            if beat >= segment.end_beat {
                break;
            }
            if event.beat < 0.0 || beat >= clip.end_beat() {
                continue;
            }
            let message = if event.message.is_note() {
                match event.message.transposed(transpose) {
                    Some(m) => m,
                    None => continue,
                }
            } else {
                event.message
            };
            let delta = (tempo.samples_at(beat, sample_rate) - seg_start).round().max(0.0) as usize;
            let offset = (segment.offset + delta).min(last);
            if midi.push(MidiEvent::new(offset as u32, message)) {
                placed += 1;
            }
        }
        placed
    }

    /// Sum `clip`'s audio for `segment` into `left`/`right` (block-relative).
    /// Returns the number of frames rendered.
    pub fn render_audio(
        &mut self,
        clip: &Clip,
        source: &dyn StreamingSource,
        segment: &BlockSegment,
        tempo: &TempoMap,
        sample_rate: f64,
        left: &mut [Sample],
        right: &mut [Sample],
    ) -> usize {
        let clip_rate = match clip.kind {
            ClipKind::Audio { sample_rate: rate, .. } if source.sample_rate() <= 0.0 => rate,
            ClipKind::Audio { .. } => source.sample_rate(),
            ClipKind::Midi { .. } => return 0,
        };
        let bps = segment.beats_per_sample();
        if !source.is_ready()
            || segment.len == 0
            || bps <= 0.0
            || clip_rate <= 0.0
            || !segment.overlaps(clip.start_beat, clip.end_beat())
        {
            return 0;
        }

        let seg_start = tempo.samples_at(segment.start_beat, sample_rate);
        let clip_start = tempo.samples_at(clip.start_beat, sample_rate);
        let clip_end = tempo.samples_at(clip.end_beat(), sample_rate);
        let clip_len = (clip_end - clip_start).round().max(0.0) as usize;

        // Block-relative frame range inside the clip
        let first = (clip_start - seg_start).ceil().max(0.0) as usize;
        let end = ((clip_end - seg_start).ceil().max(0.0) as usize).min(segment.len);
        if first >= end {
            return 0;
        }

        let ratio = clip_rate / sample_rate;
        let capacity = self.scratch[0].len();
        let chunk = ((capacity - WINDOW_PAD) as f64 / ratio.max(1e-9)).floor() as usize;
        if chunk == 0 {
            return 0;
        }
        let mono = source.num_channels() == 1;
        let out_len = left.len().min(right.len());

        let mut rendered = 0;
        let mut i = first;
        while i < end {
            let stop = (i + chunk).min(end);

            // Source window covering every kernel tap of this chunk
            let pos_first = (seg_start + i as f64 - clip_start) * ratio;
            let pos_last = (seg_start + (stop - 1) as f64 - clip_start) * ratio;
            let window_start = pos_first.floor() as i64 - 3;
            let count = ((pos_last.floor() as i64 + 4 - window_start + 1).max(0) as usize).min(capacity);

            let [scratch_l, scratch_r] = &mut self.scratch;
            {
                let mut views = [&mut scratch_l[..count], &mut scratch_r[..count]];
                source.read_samples(&mut views, window_start, count);
            }
            let src_l = &scratch_l[..count];
            let src_r = if mono { &scratch_l[..count] } else { &scratch_r[..count] };
            let fetch = |buf: &[f32], k: i64| -> Sample {
                if k >= 0 && (k as usize) < buf.len() {
                    buf[k as usize] as Sample
                } else {
                    0.0
                }
            };

            for frame in i..stop {
                let out_index = segment.offset + frame;
                if out_index >= out_len {
                    break;
                }
                let from_start = seg_start + frame as f64 - clip_start;
                let local = from_start * ratio - window_start as f64;
                let beat = segment.start_beat + frame as f64 * bps;

                let from_start = from_start.max(0.0) as usize;
                let to_end = clip_len.saturating_sub(from_start + 1);
                let gain = clip.gain
                    * clip.fades.gain_at(beat - clip.start_beat, clip.length_beats)
                    * micro_fade_gain(from_start, to_end, MICRO_FADE_SAMPLES);
                if gain == 0.0 {
                    continue;
                }

                let l = self.interpolator.interpolate(local, |k| fetch(src_l, k));
                let r = self.interpolator.interpolate(local, |k| fetch(src_r, k));
                left[out_index] += l * gain;
                right[out_index] += r * gain;
                rendered += 1;
            }
            i = stop;
        }
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;
    use approx::assert_relative_eq;
    use mf_core::{BeatMidiEvent, MidiMessage};

    const SR: f64 = 48_000.0;

    /// One beat at 120 bpm = 24000 samples
    fn segment(start: f64, len: usize) -> BlockSegment {
        let tempo = TempoMap::new(120.0);
        let end = tempo.beat_at_sample(tempo.samples_at(start, SR) + len as f64, SR);
        BlockSegment {
            start_beat: start,
            end_beat: end,
            offset: 0,
            len,
        }
    }

    #[test]
    fn test_midi_event_offsets_and_transpose() {
        let clip = Clip::midi(
            0,
            1.0,
            4.0,
            vec![
                BeatMidiEvent::new(0.0, MidiMessage::note_on(0, 60, 100)),
                BeatMidiEvent::new(0.01, MidiMessage::note_off(0, 60)),
            ],
        );
        let mut midi = MidiBuffer::with_capacity(8);
        // Segment starts half a beat before the clip: event 0 at sample 12000
        let placed = ClipRenderer::render_midi(&clip, &segment(0.5, 16_384), &TempoMap::new(120.0), 2, SR, &mut midi);

        assert_eq!(placed, 2);
        assert_eq!(midi.events()[0].offset, 12_000);
        assert_eq!(midi.events()[0].message.note(), Some(62));
        assert_eq!(midi.events()[1].offset, 12_240);
    }

    #[test]
    fn test_midi_outside_segment_ignored() {
        let clip = Clip::midi(0, 8.0, 1.0, vec![BeatMidiEvent::new(0.0, MidiMessage::note_on(0, 60, 1))]);
        let mut midi = MidiBuffer::with_capacity(8);
        assert_eq!(ClipRenderer::render_midi(&clip, &segment(0.0, 512), &TempoMap::new(120.0), 0, SR, &mut midi), 0);
    }

    #[test]
    fn test_audio_unity_rate_matches_source() {
        let source = MemoryStream::mono(vec![0.5; 48_000], SR);
        let clip = Clip::audio(0, 0.0, 2.0, "dc.wav", SR);
        let mut renderer = ClipRenderer::new(1024);
        let mut l = vec![0.0; 1024];
        let mut r = vec![0.0; 1024];

        // Well inside the clip, past the micro-fade
        let seg = segment(0.5, 1024);
        let n = renderer.render_audio(&clip, &source, &seg, &TempoMap::new(120.0), SR, &mut l, &mut r);
        assert_eq!(n, 1024);
        assert_relative_eq!(l[100], 0.5, epsilon = 1e-3);
        assert_relative_eq!(r[100], 0.5, epsilon = 1e-3);
    }

    #[test]
    fn test_audio_micro_fade_at_clip_start() {
        let source = MemoryStream::mono(vec![1.0; 4096], SR);
        let clip = Clip::audio(0, 0.0, 1.0, "dc.wav", SR);
        let mut renderer = ClipRenderer::new(512);
        let mut l = vec![0.0; 512];
        let mut r = vec![0.0; 512];
        renderer.render_audio(&clip, &source, &segment(0.0, 512), &TempoMap::new(120.0), SR, &mut l, &mut r);

        assert!(l[0] < 0.05);
        assert!(l[MICRO_FADE_SAMPLES / 2] < l[MICRO_FADE_SAMPLES - 1]);
    }

    #[test]
    fn test_audio_resampled_clip_renders() {
        // 96k clip in a 48k engine: ratio 2
        let source = MemoryStream::mono(vec![0.25; 96_000], 96_000.0);
        let clip = Clip::audio(0, 0.0, 2.0, "hi.wav", 96_000.0);
        let mut renderer = ClipRenderer::new(256);
        let mut l = vec![0.0; 256];
        let mut r = vec![0.0; 256];
        let n = renderer.render_audio(&clip, &source, &segment(0.5, 256), &TempoMap::new(120.0), SR, &mut l, &mut r);
        assert_eq!(n, 256);
        assert_relative_eq!(l[128], 0.25, epsilon = 1e-3);
    }

    #[test]
    fn test_extreme_ratio_renders_in_chunks() {
        let source = MemoryStream::mono(vec![0.5; 400_000], 384_000.0);
        let clip = Clip::audio(0, 0.0, 2.0, "x.wav", 384_000.0);
        let mut renderer = ClipRenderer::new(64);
        let mut l = vec![0.0; 64];
        let mut r = vec![0.0; 64];
        let n = renderer.render_audio(&clip, &source, &segment(0.25, 64), &TempoMap::new(120.0), SR, &mut l, &mut r);
        assert_eq!(n, 64);
    }

    #[test]
    fn test_fade_in_shapes_audio() {
        let source = MemoryStream::mono(vec![1.0; 96_000], SR);
        let clip = Clip::audio(0, 0.0, 4.0, "f.wav", SR).with_fades(1.0, 0.0);
        let mut renderer = ClipRenderer::new(1024);

        let mut quarter = (vec![0.0; 1024], vec![0.0; 1024]);
        renderer.render_audio(&clip, &source, &segment(0.25, 1024), &TempoMap::new(120.0), SR, &mut quarter.0, &mut quarter.1);
        let mut three_quarter = (vec![0.0; 1024], vec![0.0; 1024]);
        renderer.render_audio(
            &clip,
            &source,
            &segment(0.75, 1024),
            &TempoMap::new(120.0),
            SR,
            &mut three_quarter.0,
            &mut three_quarter.1,
        );
        assert!(quarter.0[0] < three_quarter.0[0]);
        assert!(three_quarter.0[0] < 1.0);
    }
}
