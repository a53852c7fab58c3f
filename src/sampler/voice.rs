// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! One polyphonic voice: a playing articulation with its envelope, pitch
//! ratio and streaming state.
//!
//! A voice reads source frames from the record's preload buffer until its
//! play position crosses the preload boundary, then from its ring buffer,
//! which the disk streamer keeps filled with frames starting exactly at the
//! preload end. Rendering linearly interpolates between adjacent source
//! frames and mix-adds into the output block.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::adsr::{Adsr, AdsrParams};
use super::ring_buffer::{RingBuffer, LOW_WATERMARK_FRAMES};
use crate::audio::{MAX_SOURCE_CHANNELS, OUTPUT_CHANNELS};
use crate::library::map::ArticulationRecord;

/// Length of the click-free gain ramp applied before a voice slot is reused.
pub const QUICK_FADE_SECONDS: f32 = 0.01;

/// The half of a voice both the audio thread and the disk streamer touch.
/// Allocated once at engine construction; indices are stable for the life of
/// the engine.
pub struct VoiceShared {
    /// Whether the voice is producing audio. Written by the audio thread.
    active: AtomicBool,
    /// Raised by the voice when its ring runs below the low watermark.
    needs_data: AtomicBool,
    /// Bumped on every (re)start so the streamer can detect a re-armed slot.
    generation: AtomicU64,
    /// Index of the articulation record being played.
    record_index: AtomicUsize,
    /// Next source frame the streamer should fetch for this voice.
    next_fetch_frame: AtomicU64,
    /// Set once the whole file has been delivered (or the source ended).
    end_of_stream: AtomicBool,
    ring: RingBuffer,
}

impl VoiceShared {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            needs_data: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            record_index: AtomicUsize::new(0),
            next_fetch_frame: AtomicU64::new(0),
            end_of_stream: AtomicBool::new(false),
            ring: RingBuffer::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn needs_data(&self) -> bool {
        self.needs_data.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn record_index(&self) -> usize {
        self.record_index.load(Ordering::Acquire)
    }

    pub fn next_fetch_frame(&self) -> u64 {
        self.next_fetch_frame.load(Ordering::Acquire)
    }

    /// Called by the streamer after delivering frames.
    pub fn advance_fetch_frame(&self, to: u64) {
        self.next_fetch_frame.store(to, Ordering::Release);
    }

    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream.load(Ordering::Acquire)
    }

    /// Called by the streamer when the file is fully delivered.
    pub fn mark_end_of_stream(&self) {
        self.end_of_stream.store(true, Ordering::Release);
        self.needs_data.store(false, Ordering::Release);
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }
}

impl Default for VoiceShared {
    fn default() -> Self {
        Self::new()
    }
}

enum WindowStep {
    Advanced,
    Starved,
    SourceEnded,
}

/// The audio-thread half of a voice. All fields here are only ever touched
/// from the render callback.
pub struct Voice {
    shared: Arc<VoiceShared>,
    env: Adsr,
    record_index: usize,
    midi_note: u8,
    sounding_note: u8,
    pitch_ratio: f64,
    /// Fractional play position in source frames.
    position: f64,
    start_counter: u64,
    /// Frames to skip at the top of the next rendered block, for note-ons
    /// that arrive mid-block.
    start_offset: usize,
    quick_fade: bool,
    fade_gain: f32,
    fade_step: f32,
    /// Source frames `window_frame` and `window_frame + 1`, interleaved with
    /// a fixed stride.
    window: [f32; 2 * MAX_SOURCE_CHANNELS],
    window_frame: u64,
    channels: usize,
    total_frames: u64,
    preload_end: u64,
    host_sample_rate: f32,
    /// Whether this block already counted an underrun.
    underran: bool,
}

impl Voice {
    pub fn new(shared: Arc<VoiceShared>, host_sample_rate: f32) -> Self {
        Self {
            shared,
            env: Adsr::new(host_sample_rate),
            record_index: 0,
            midi_note: 0,
            sounding_note: 0,
            pitch_ratio: 1.0,
            position: 0.0,
            start_counter: 0,
            start_offset: 0,
            quick_fade: false,
            fade_gain: 1.0,
            fade_step: 0.0,
            window: [0.0; 2 * MAX_SOURCE_CHANNELS],
            window_frame: 0,
            channels: 1,
            total_frames: 0,
            preload_end: 0,
            host_sample_rate,
            underran: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    pub fn midi_note(&self) -> u8 {
        self.midi_note
    }

    pub fn start_counter(&self) -> u64 {
        self.start_counter
    }

    pub fn record_index(&self) -> usize {
        self.record_index
    }

    /// The pitch this voice produces, after transpose; may differ from the
    /// record's source note.
    pub fn sounding_note(&self) -> u8 {
        self.sounding_note
    }

    pub fn in_quick_fade(&self) -> bool {
        self.quick_fade
    }

    pub fn in_release(&self) -> bool {
        self.env.stage() == super::adsr::Stage::Release
    }

    /// Whether the voice has crossed the preload boundary and draws from its
    /// ring buffer.
    pub fn is_streaming(&self) -> bool {
        self.is_active() && self.position >= self.preload_end as f64
    }

    /// Arms the voice on an articulation. `sounding_note` is the pitch the
    /// voice produces; it differs from the record's source note under
    /// fallback or a sample offset, and the ratio corrects for it.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &mut self,
        record_index: usize,
        record: &ArticulationRecord,
        midi_note: u8,
        sounding_note: u8,
        start_counter: u64,
        block_offset: usize,
        params: AdsrParams,
    ) {
        let channels = record.channels() as usize;

        // Quiet the streamer's view of this slot before rewiring it.
        self.shared.active.store(false, Ordering::Release);
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        self.shared.ring.reset(channels);
        self.shared
            .record_index
            .store(record_index, Ordering::Release);
        self.shared
            .next_fetch_frame
            .store(record.preload_end_frame(), Ordering::Release);
        let fully_resident = record.preload_end_frame() >= record.total_frames();
        self.shared
            .end_of_stream
            .store(fully_resident, Ordering::Release);
        self.shared
            .needs_data
            .store(!fully_resident, Ordering::Release);

        self.record_index = record_index;
        self.midi_note = midi_note;
        self.sounding_note = sounding_note;
        self.pitch_ratio = (record.sample_rate() as f64 / self.host_sample_rate as f64)
            * ((sounding_note as i32 - record.key().note as i32) as f64 / 12.0).exp2();
        self.position = 0.0;
        self.start_counter = start_counter;
        self.start_offset = block_offset;
        self.quick_fade = false;
        self.fade_gain = 1.0;
        self.channels = channels;
        self.total_frames = record.total_frames();
        self.preload_end = record.preload_end_frame();

        self.window = [0.0; 2 * MAX_SOURCE_CHANNELS];
        self.window_frame = 0;
        let preload = record.preload();
        self.copy_window_slot(0, preload, 0);
        self.copy_window_slot(1, preload, 1.min(self.preload_end.saturating_sub(1)));

        self.env.set_params(params);
        self.env.note_on();
        self.shared.active.store(true, Ordering::Release);
    }

    /// Enters release with the configured release time.
    pub fn release(&mut self) {
        self.env.release();
    }

    /// Enters release over `seconds`, for same-note retriggers.
    pub fn release_over(&mut self, seconds: f32) {
        self.env.release_over(seconds);
    }

    /// Starts the 10 ms gain ramp to zero; the voice deactivates when the
    /// ramp lands.
    pub fn begin_quick_fade(&mut self) {
        if self.quick_fade {
            return;
        }
        self.quick_fade = true;
        self.fade_gain = 1.0;
        self.fade_step = 1.0 / (QUICK_FADE_SECONDS * self.host_sample_rate);
    }

    /// Hard stop. Last resort; use [`begin_quick_fade`](Self::begin_quick_fade)
    /// wherever a click matters.
    pub fn force_stop(&mut self) {
        self.deactivate();
    }

    /// Mix-adds this voice into an interleaved stereo block, advancing the
    /// envelope and play position. `record` must be the record the voice was
    /// started on.
    pub fn render(
        &mut self,
        record: &ArticulationRecord,
        out: &mut [f32],
        params: AdsrParams,
        underruns: &AtomicU64,
    ) {
        if !self.is_active() {
            return;
        }
        self.env.set_params(params);
        self.underran = false;

        let frames = out.len() / OUTPUT_CHANNELS;
        let first = self.start_offset.min(frames);
        self.start_offset -= first;

        let preload = record.preload();
        for frame in first..frames {
            let pos0 = self.position as u64;
            if pos0 + 1 >= self.total_frames {
                self.deactivate();
                break;
            }

            let mut starved = false;
            while self.window_frame < pos0 {
                match self.advance_window(preload) {
                    WindowStep::Advanced => {}
                    WindowStep::Starved => {
                        if !self.underran {
                            self.underran = true;
                            underruns.fetch_add(1, Ordering::Relaxed);
                        }
                        starved = true;
                        break;
                    }
                    WindowStep::SourceEnded => {
                        self.deactivate();
                        return;
                    }
                }
            }
            if starved {
                // Emit silence for the starved region; the position holds so
                // playback resumes where it left off once the ring refills.
                break;
            }

            let level = if self.quick_fade {
                self.env.level()
            } else {
                self.env.next()
            };
            if self.env.is_idle() {
                self.deactivate();
                break;
            }
            let gain = level * self.fade_gain;
            if self.quick_fade {
                self.fade_gain -= self.fade_step;
                if self.fade_gain <= 0.0 {
                    self.deactivate();
                    break;
                }
            }

            let frac = (self.position - pos0 as f64) as f32;
            for channel in 0..OUTPUT_CHANNELS {
                let source_channel = channel.min(self.channels - 1);
                let s0 = self.window[source_channel];
                let s1 = self.window[MAX_SOURCE_CHANNELS + source_channel];
                out[frame * OUTPUT_CHANNELS + channel] += (s0 + (s1 - s0) * frac) * gain;
            }

            self.position += self.pitch_ratio;
        }

        if self.is_active() {
            let needs = !self.shared.end_of_stream()
                && self.shared.ring.available_to_read() < LOW_WATERMARK_FRAMES;
            self.shared.needs_data.store(needs, Ordering::Release);
        }
    }

    /// Moves the two-frame interpolation window forward by one source frame.
    fn advance_window(&mut self, preload: &[f32]) -> WindowStep {
        let incoming = self.window_frame + 2;

        if incoming >= self.total_frames {
            // Past the end: duplicate the last frame into both slots.
            self.window.copy_within(MAX_SOURCE_CHANNELS.., 0);
            self.window_frame += 1;
            return WindowStep::Advanced;
        }

        if incoming < self.preload_end {
            self.window.copy_within(MAX_SOURCE_CHANNELS.., 0);
            self.copy_window_slot(1, preload, incoming);
            self.window_frame += 1;
            return WindowStep::Advanced;
        }

        // The incoming frame comes off the ring, which holds source frames
        // sequentially from the preload end.
        let mut frame = [0.0f32; MAX_SOURCE_CHANNELS];
        if self.shared.ring.read(&mut frame[..self.channels], 1) == 0 {
            if self.shared.end_of_stream() {
                return WindowStep::SourceEnded;
            }
            return WindowStep::Starved;
        }
        self.window.copy_within(MAX_SOURCE_CHANNELS.., 0);
        self.window[MAX_SOURCE_CHANNELS..MAX_SOURCE_CHANNELS + self.channels]
            .copy_from_slice(&frame[..self.channels]);
        self.window_frame += 1;
        WindowStep::Advanced
    }

    fn copy_window_slot(&mut self, slot: usize, preload: &[f32], frame: u64) {
        let base = frame as usize * self.channels;
        if base + self.channels > preload.len() {
            return;
        }
        self.window[slot * MAX_SOURCE_CHANNELS..slot * MAX_SOURCE_CHANNELS + self.channels]
            .copy_from_slice(&preload[base..base + self.channels]);
    }

    fn deactivate(&mut self) {
        self.quick_fade = false;
        self.shared.active.store(false, Ordering::Release);
        self.shared.needs_data.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::library::parser::ArticulationKey;

    const HOST_SR: f32 = 44100.0;

    fn fast_params() -> AdsrParams {
        AdsrParams {
            attack: 0.001,
            decay: 0.001,
            sustain: 1.0,
            release: 0.001,
        }
    }

    /// A fully resident mono record whose sample at frame `i` is `i / 32768`.
    fn resident_record(note: u8, total_frames: u64, sample_rate: u32) -> ArticulationRecord {
        let preload: Vec<f32> = (0..total_frames).map(|i| i as f32 / 32768.0).collect();
        ArticulationRecord::new(
            ArticulationKey {
                note,
                velocity: 64,
                round_robin: 1,
            },
            PathBuf::from("test.wav"),
            sample_rate,
            1,
            total_frames,
            total_frames * 2,
            preload,
            None,
        )
    }

    /// A mono ramp record with only the first `preload_frames` resident.
    fn streaming_record(total_frames: u64, preload_frames: u64) -> ArticulationRecord {
        let preload: Vec<f32> = (0..preload_frames).map(|i| i as f32 / 32768.0).collect();
        ArticulationRecord::new(
            ArticulationKey {
                note: 60,
                velocity: 64,
                round_robin: 1,
            },
            PathBuf::from("test.wav"),
            44100,
            1,
            total_frames,
            total_frames * 2,
            preload,
            None,
        )
    }

    fn make_voice() -> Voice {
        Voice::new(Arc::new(VoiceShared::new()), HOST_SR)
    }

    fn render_until_idle(
        voice: &mut Voice,
        record: &ArticulationRecord,
        block_frames: usize,
    ) -> usize {
        let underruns = AtomicU64::new(0);
        let mut out = vec![0.0f32; block_frames * OUTPUT_CHANNELS];
        let mut produced = 0;
        while voice.is_active() {
            out.fill(0.0);
            voice.render(record, &mut out, fast_params(), &underruns);
            produced += block_frames;
            assert!(produced < 10_000_000, "voice never went idle");
        }
        produced
    }

    #[test]
    fn test_unity_ratio_plays_all_frames() {
        let record = resident_record(60, 1000, 44100);
        let mut voice = make_voice();
        voice.start(0, &record, 60, 60, 1, 0, fast_params());
        assert!((voice.pitch_ratio - 1.0).abs() < 1e-9);

        let underruns = AtomicU64::new(0);
        let mut out = vec![0.0f32; 256 * OUTPUT_CHANNELS];
        let mut produced = 0usize;
        while voice.is_active() {
            out.fill(0.0);
            voice.render(&record, &mut out, fast_params(), &underruns);
            if voice.is_active() {
                produced += 256;
            }
        }
        // The voice retires when its position reaches the penultimate frame.
        assert!(produced <= 1000);
        assert!(produced >= 1000 - 256);
        assert_eq!(0, underruns.load(Ordering::Relaxed));
    }

    #[test]
    fn test_rate_conversion_ratio_and_length() {
        // 44.1k source on a 48k host: ratio 44100/48000, output stretched.
        let record = resident_record(60, 4410, 44100);
        let mut voice = Voice::new(Arc::new(VoiceShared::new()), 48000.0);
        voice.start(0, &record, 60, 60, 1, 0, fast_params());
        assert!((voice.pitch_ratio - 44100.0 / 48000.0).abs() < 1e-9);

        let underruns = AtomicU64::new(0);
        let mut out = vec![0.0f32; OUTPUT_CHANNELS];
        let mut produced = 0u64;
        while voice.is_active() {
            out.fill(0.0);
            voice.render(&record, &mut out, fast_params(), &underruns);
            if voice.is_active() {
                produced += 1;
            }
        }
        let expected = ((4410.0 - 1.0) / (44100.0 / 48000.0)) as u64;
        assert!(
            produced.abs_diff(expected) <= 1,
            "produced {produced}, expected {expected}"
        );
    }

    #[test]
    fn test_semitone_shift_ratio() {
        let record = resident_record(60, 1000, 44100);
        let mut voice = make_voice();
        // Sounding a semitone below the source pitch-shifts down.
        voice.start(0, &record, 59, 59, 1, 0, fast_params());
        assert!((voice.pitch_ratio - (-1.0f64 / 12.0).exp2()).abs() < 1e-9);

        voice.start(0, &record, 72, 72, 2, 0, fast_params());
        assert!((voice.pitch_ratio - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_interpolated_output_follows_ramp() {
        let record = resident_record(60, 2000, 44100);
        let mut voice = make_voice();
        let params = AdsrParams {
            attack: 0.001,
            decay: 0.001,
            sustain: 1.0,
            release: 0.001,
        };
        voice.start(0, &record, 60, 60, 1, 0, params);

        let underruns = AtomicU64::new(0);
        let mut out = vec![0.0f32; 256 * OUTPUT_CHANNELS];
        voice.render(&record, &mut out, params, &underruns);

        // Past the attack the output equals the ramp: sample i is i / 32768.
        let attack_frames = (0.001 * HOST_SR) as usize + 1;
        for frame in attack_frames..256 {
            let expected = frame as f32 / 32768.0;
            let got = out[frame * OUTPUT_CHANNELS];
            assert!(
                (got - expected).abs() < 1e-5,
                "frame {frame}: got {got}, expected {expected}"
            );
            // Mono sources are duplicated to both output channels.
            assert_eq!(got, out[frame * OUTPUT_CHANNELS + 1]);
        }
    }

    #[test]
    fn test_streaming_crosses_preload_boundary_seamlessly() {
        let record = streaming_record(3000, 100);
        let mut voice = make_voice();
        voice.start(0, &record, 60, 60, 1, 0, fast_params());

        // The streamer would deliver frames 100.. into the ring; emulate it.
        let shared = voice.shared.clone();
        let tail: Vec<f32> = (100..3000).map(|i| i as f32 / 32768.0).collect();
        assert_eq!(2900, shared.ring().write(&tail, 2900));
        shared.advance_fetch_frame(3000);
        shared.mark_end_of_stream();

        let underruns = AtomicU64::new(0);
        let mut out = vec![0.0f32; 512 * OUTPUT_CHANNELS];
        voice.render(&record, &mut out, fast_params(), &underruns);

        // No discontinuity at the boundary: the ramp continues.
        let attack_frames = (0.001 * HOST_SR) as usize + 1;
        for frame in attack_frames..512 {
            let expected = frame as f32 / 32768.0;
            let got = out[frame * OUTPUT_CHANNELS];
            assert!(
                (got - expected).abs() < 1e-5,
                "frame {frame}: got {got}, expected {expected}"
            );
        }
        assert_eq!(0, underruns.load(Ordering::Relaxed));
        assert!(voice.is_streaming());
    }

    #[test]
    fn test_starvation_emits_silence_and_counts_underrun() {
        let record = streaming_record(3000, 100);
        let mut voice = make_voice();
        voice.start(0, &record, 60, 60, 1, 0, fast_params());

        let underruns = AtomicU64::new(0);
        let mut out = vec![0.0f32; 512 * OUTPUT_CHANNELS];
        voice.render(&record, &mut out, fast_params(), &underruns);

        // The ring was never filled: everything past the preload is silent,
        // exactly one underrun is counted, and the voice stays active.
        assert_eq!(1, underruns.load(Ordering::Relaxed));
        assert!(voice.is_active());
        for frame in 101..512 {
            assert_eq!(0.0, out[frame * OUTPUT_CHANNELS]);
        }

        // Rendering again without data does not spin the counter per frame.
        out.fill(0.0);
        voice.render(&record, &mut out, fast_params(), &underruns);
        assert_eq!(2, underruns.load(Ordering::Relaxed));

        // Once data arrives playback resumes where it left off.
        let shared = voice.shared.clone();
        let tail: Vec<f32> = (100..3000).map(|i| i as f32 / 32768.0).collect();
        shared.ring().write(&tail, 2900);
        out.fill(0.0);
        voice.render(&record, &mut out, fast_params(), &underruns);
        let resumed = out[0];
        assert!((resumed - 100.0 / 32768.0).abs() < 2e-4, "resumed at {resumed}");
    }

    #[test]
    fn test_needs_data_tracks_low_watermark() {
        let record = streaming_record(60000, 100);
        let mut voice = make_voice();
        voice.start(0, &record, 60, 60, 1, 0, fast_params());
        assert!(voice.shared.needs_data());

        // Fill well above the watermark; the flag clears on the next render.
        let frames = vec![0.0f32; LOW_WATERMARK_FRAMES + 2000];
        voice.shared.ring().write(&frames, frames.len());
        let underruns = AtomicU64::new(0);
        let mut out = vec![0.0f32; 64 * OUTPUT_CHANNELS];
        voice.render(&record, &mut out, fast_params(), &underruns);
        assert!(!voice.shared.needs_data());

        // Drain below the watermark and it raises again.
        let mut sink = vec![0.0f32; 4096];
        while voice.shared.ring().available_to_read() >= LOW_WATERMARK_FRAMES {
            voice.shared.ring().read(&mut sink, 4096);
        }
        out.fill(0.0);
        voice.render(&record, &mut out, fast_params(), &underruns);
        assert!(voice.shared.needs_data());
    }

    #[test]
    fn test_quick_fade_deactivates_within_ten_milliseconds() {
        let record = resident_record(60, 44100, 44100);
        let mut voice = make_voice();
        voice.start(0, &record, 60, 60, 1, 0, fast_params());

        // Let the attack finish.
        let underruns = AtomicU64::new(0);
        let mut out = vec![0.0f32; 128 * OUTPUT_CHANNELS];
        voice.render(&record, &mut out, fast_params(), &underruns);

        voice.begin_quick_fade();
        let budget = (QUICK_FADE_SECONDS * HOST_SR) as usize + 128;
        let mut rendered = 0;
        while voice.is_active() {
            out.fill(0.0);
            voice.render(&record, &mut out, fast_params(), &underruns);
            rendered += 128;
            assert!(rendered <= budget, "quick fade overran its ramp");
        }
    }

    #[test]
    fn test_release_then_idle_within_release_frames() {
        let release = 0.05f32;
        let record = resident_record(60, 4 * 44100, 44100);
        let mut voice = make_voice();
        let params = AdsrParams {
            attack: 0.001,
            decay: 0.001,
            sustain: 0.8,
            release,
        };
        voice.start(0, &record, 60, 60, 1, 0, params);

        let underruns = AtomicU64::new(0);
        let mut out = vec![0.0f32; 256 * OUTPUT_CHANNELS];
        voice.render(&record, &mut out, params, &underruns);

        voice.release();
        let budget = (release * HOST_SR) as usize + 256;
        let mut rendered = 0;
        while voice.is_active() {
            out.fill(0.0);
            voice.render(&record, &mut out, params, &underruns);
            rendered += 256;
            assert!(rendered <= budget, "release overran {budget} frames");
        }
    }

    #[test]
    fn test_block_offset_delays_start() {
        let record = resident_record(60, 2000, 44100);
        let mut voice = make_voice();
        voice.start(0, &record, 60, 60, 1, 100, fast_params());

        let underruns = AtomicU64::new(0);
        let mut out = vec![0.0f32; 256 * OUTPUT_CHANNELS];
        voice.render(&record, &mut out, fast_params(), &underruns);

        for frame in 0..100 {
            assert_eq!(0.0, out[frame * OUTPUT_CHANNELS]);
        }
        assert!(out[150 * OUTPUT_CHANNELS] != 0.0);
    }

    #[test]
    fn test_stereo_channels_render_independently() {
        // Stereo record: left carries the ramp, right its negation.
        let total = 1000u64;
        let preload: Vec<f32> = (0..total)
            .flat_map(|i| {
                let v = i as f32 / 32768.0;
                [v, -v]
            })
            .collect();
        let record = ArticulationRecord::new(
            ArticulationKey {
                note: 60,
                velocity: 64,
                round_robin: 1,
            },
            PathBuf::from("test.wav"),
            44100,
            2,
            total,
            total * 4,
            preload,
            None,
        );

        let mut voice = make_voice();
        voice.start(0, &record, 60, 60, 1, 0, fast_params());
        let underruns = AtomicU64::new(0);
        let mut out = vec![0.0f32; 256 * OUTPUT_CHANNELS];
        voice.render(&record, &mut out, fast_params(), &underruns);

        let attack_frames = (0.001 * HOST_SR) as usize + 1;
        for frame in attack_frames..256 {
            let left = out[frame * OUTPUT_CHANNELS];
            let right = out[frame * OUTPUT_CHANNELS + 1];
            assert!((left + right).abs() < 1e-6, "channels should mirror");
            assert!(left > 0.0);
        }
    }

    #[test]
    fn test_render_until_idle_is_bounded() {
        let record = resident_record(60, 8192, 44100);
        let mut voice = make_voice();
        voice.start(0, &record, 60, 60, 1, 0, fast_params());
        let produced = render_until_idle(&mut voice, &record, 256);
        assert!(produced >= 8192 - 256 && produced <= 8192 + 256);
    }
}
