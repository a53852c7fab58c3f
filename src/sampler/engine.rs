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

//! The top-level sampler engine.
//!
//! [`SamplerEngine`] lives on the audio thread: it drains the MIDI event
//! queue, allocates and steals voices, and mixes every active voice into the
//! output block. [`SamplerHandle`] is the control surface for every other
//! thread: library loads, runtime knobs, persisted state and observations.
//!
//! The two halves share the instrument map behind a read-write lock the
//! audio thread only ever `try_read`s once per block, a bounded event
//! channel, and atomic scalars for every knob and counter.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use midly::live::LiveEvent;
use midly::MidiMessage;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::adsr::AdsrParams;
use super::streamer::DiskStreamer;
use super::voice::{Voice, VoiceShared};
use crate::audio::reader::open_file;
use crate::config::PersistedState;
use crate::library::loader::{load_folder, LoadError, LoadSummary};
use crate::library::map::{preload_frames, InstrumentMap};

/// Size of the voice pool.
pub const MAX_VOICES: usize = 180;

/// Maximum simultaneously sounding voices per MIDI note.
pub const PER_NOTE_VOICE_CAP: usize = 4;

/// MIDI controller number for the sustain pedal.
const SUSTAIN_CONTROLLER: u8 = 64;

const EVENT_QUEUE_CAPACITY: usize = 1024;

/// How long a swap waits for the audio thread to acknowledge a freeze before
/// proceeding anyway (the host may have stopped calling the callback).
const FREEZE_ACK_TIMEOUT: Duration = Duration::from_millis(50);

/// A raw MIDI channel message plus its offset within the current block.
#[derive(Debug, Clone, Copy)]
pub struct RawMidi {
    bytes: [u8; 3],
    len: u8,
    frame_offset: u32,
}

impl RawMidi {
    /// Wraps a raw event. Messages longer than three bytes (sysex) are not
    /// events this engine reacts to and are rejected.
    pub fn new(raw: &[u8], frame_offset: u32) -> Option<Self> {
        if raw.is_empty() || raw.len() > 3 {
            return None;
        }
        let mut bytes = [0u8; 3];
        bytes[..raw.len()].copy_from_slice(raw);
        Some(Self {
            bytes,
            len: raw.len() as u8,
            frame_offset,
        })
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

/// Atomic storage for every runtime knob. Setters clamp; the audio thread
/// snapshots once per block.
pub struct EngineParams {
    attack_bits: AtomicU32,
    decay_bits: AtomicU32,
    sustain_bits: AtomicU32,
    release_bits: AtomicU32,
    same_note_release_bits: AtomicU32,
    transpose: AtomicI32,
    sample_offset: AtomicI32,
    velocity_layer_limit: AtomicU32,
    round_robin_limit: AtomicU32,
    preload_kb: AtomicU32,
}

pub const DEFAULT_SAME_NOTE_RELEASE: f32 = 0.1;
pub const DEFAULT_PRELOAD_KB: u32 = 256;
pub const DEFAULT_VELOCITY_LAYER_LIMIT: u16 = 127;
pub const DEFAULT_ROUND_ROBIN_LIMIT: u16 = 64;

impl Default for EngineParams {
    fn default() -> Self {
        let adsr = AdsrParams::default();
        Self {
            attack_bits: AtomicU32::new(adsr.attack.to_bits()),
            decay_bits: AtomicU32::new(adsr.decay.to_bits()),
            sustain_bits: AtomicU32::new(adsr.sustain.to_bits()),
            release_bits: AtomicU32::new(adsr.release.to_bits()),
            same_note_release_bits: AtomicU32::new(DEFAULT_SAME_NOTE_RELEASE.to_bits()),
            transpose: AtomicI32::new(0),
            sample_offset: AtomicI32::new(0),
            velocity_layer_limit: AtomicU32::new(DEFAULT_VELOCITY_LAYER_LIMIT as u32),
            round_robin_limit: AtomicU32::new(DEFAULT_ROUND_ROBIN_LIMIT as u32),
            preload_kb: AtomicU32::new(DEFAULT_PRELOAD_KB),
        }
    }
}

impl EngineParams {
    pub fn adsr(&self) -> AdsrParams {
        AdsrParams {
            attack: f32::from_bits(self.attack_bits.load(Ordering::Relaxed)),
            decay: f32::from_bits(self.decay_bits.load(Ordering::Relaxed)),
            sustain: f32::from_bits(self.sustain_bits.load(Ordering::Relaxed)),
            release: f32::from_bits(self.release_bits.load(Ordering::Relaxed)),
        }
    }

    pub fn set_attack(&self, seconds: f32) {
        self.attack_bits
            .store(seconds.clamp(0.001, 30.0).to_bits(), Ordering::Relaxed);
    }

    pub fn set_decay(&self, seconds: f32) {
        self.decay_bits
            .store(seconds.clamp(0.001, 30.0).to_bits(), Ordering::Relaxed);
    }

    pub fn set_sustain(&self, level: f32) {
        self.sustain_bits
            .store(level.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn set_release(&self, seconds: f32) {
        self.release_bits
            .store(seconds.clamp(0.001, 30.0).to_bits(), Ordering::Relaxed);
    }

    pub fn same_note_release(&self) -> f32 {
        f32::from_bits(self.same_note_release_bits.load(Ordering::Relaxed))
    }

    pub fn set_same_note_release(&self, seconds: f32) {
        self.same_note_release_bits
            .store(seconds.clamp(0.01, 5.0).to_bits(), Ordering::Relaxed);
    }

    pub fn transpose(&self) -> i32 {
        self.transpose.load(Ordering::Relaxed)
    }

    pub fn set_transpose(&self, semitones: i32) {
        self.transpose
            .store(semitones.clamp(-12, 12), Ordering::Relaxed);
    }

    pub fn sample_offset(&self) -> i32 {
        self.sample_offset.load(Ordering::Relaxed)
    }

    pub fn set_sample_offset(&self, semitones: i32) {
        self.sample_offset
            .store(semitones.clamp(-12, 12), Ordering::Relaxed);
    }

    pub fn velocity_layer_limit(&self) -> u16 {
        self.velocity_layer_limit.load(Ordering::Relaxed) as u16
    }

    pub fn set_velocity_layer_limit(&self, limit: u16) {
        self.velocity_layer_limit
            .store(limit.clamp(1, 127) as u32, Ordering::Relaxed);
    }

    pub fn round_robin_limit(&self) -> u16 {
        self.round_robin_limit.load(Ordering::Relaxed) as u16
    }

    pub fn set_round_robin_limit(&self, limit: u16) {
        self.round_robin_limit
            .store(limit.clamp(1, 256) as u32, Ordering::Relaxed);
    }

    pub fn preload_kb(&self) -> u32 {
        self.preload_kb.load(Ordering::Relaxed)
    }

    pub fn set_preload_kb(&self, kb: u32) {
        self.preload_kb.store(kb.clamp(32, 1024), Ordering::Relaxed);
    }
}

/// Counters every thread may read and specific owners write. The UI polls
/// these; nothing here is load-bearing for playback.
#[derive(Default)]
pub struct EngineStats {
    underruns: AtomicU64,
    active_voices: AtomicUsize,
    streaming_voices: AtomicUsize,
    disk_bytes_per_sec: AtomicU64,
    loading: AtomicBool,
    total_file_bytes: AtomicU64,
    preload_bytes: AtomicU64,
}

impl EngineStats {
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub(crate) fn underruns_counter(&self) -> &AtomicU64 {
        &self.underruns
    }

    pub fn active_voices(&self) -> usize {
        self.active_voices.load(Ordering::Relaxed)
    }

    pub fn streaming_voices(&self) -> usize {
        self.streaming_voices.load(Ordering::Relaxed)
    }

    pub(crate) fn set_voice_counts(&self, active: usize, streaming: usize) {
        self.active_voices.store(active, Ordering::Relaxed);
        self.streaming_voices.store(streaming, Ordering::Relaxed);
    }

    pub fn disk_bytes_per_sec(&self) -> u64 {
        self.disk_bytes_per_sec.load(Ordering::Relaxed)
    }

    pub(crate) fn set_disk_bytes_per_sec(&self, bytes: u64) {
        self.disk_bytes_per_sec.store(bytes, Ordering::Relaxed);
    }

    pub fn loading(&self) -> bool {
        self.loading.load(Ordering::Relaxed)
    }
}

/// Flags coordinating the stop-swap-restart protocol between the loader and
/// the audio thread.
#[derive(Default)]
struct SwapFlags {
    /// Asks the audio thread to stop all voices and render silence.
    freeze: AtomicBool,
    /// Set by the audio thread once its voices are stopped.
    acknowledged: AtomicBool,
    /// Bumped on every map swap; the audio thread stops stale voices when it
    /// observes a change, covering hosts that stopped the callback during a
    /// swap and so never acknowledged the freeze.
    epoch: AtomicU64,
}

/// A read-only snapshot of the engine's observable state.
#[derive(Debug, Clone, Default)]
pub struct Observations {
    pub loading: bool,
    pub folder: Option<PathBuf>,
    pub total_file_bytes: u64,
    pub preload_bytes: u64,
    pub active_voices: usize,
    pub streaming_voices: usize,
    pub disk_mb_per_sec: f64,
    pub underruns: u64,
}

/// The audio-thread half of the sampler.
pub struct SamplerEngine {
    voices: Vec<Voice>,
    map: Arc<RwLock<InstrumentMap>>,
    params: Arc<EngineParams>,
    stats: Arc<EngineStats>,
    swap: Arc<SwapFlags>,
    events: Receiver<RawMidi>,
    start_counter: u64,
    current_round_robin: u16,
    sustain_pedal: bool,
    sustained_notes: [bool; 128],
    map_epoch: u64,
}

impl SamplerEngine {
    /// Creates an engine and its control handle for the given host sample
    /// rate. The voice pool and every ring buffer are allocated here, once.
    pub fn new(host_sample_rate: u32) -> (SamplerEngine, SamplerHandle) {
        let voice_shared = Arc::new(
            (0..MAX_VOICES)
                .map(|_| Arc::new(VoiceShared::new()))
                .collect::<Vec<_>>(),
        );
        let voices = voice_shared
            .iter()
            .map(|shared| Voice::new(shared.clone(), host_sample_rate as f32))
            .collect();

        let map = Arc::new(RwLock::new(InstrumentMap::empty()));
        let params = Arc::new(EngineParams::default());
        let stats = Arc::new(EngineStats::default());
        let swap = Arc::new(SwapFlags::default());
        let (event_tx, event_rx) = bounded(EVENT_QUEUE_CAPACITY);

        let streamer = DiskStreamer::spawn(voice_shared.clone(), map.clone(), stats.clone());

        let engine = SamplerEngine {
            voices,
            map: map.clone(),
            params: params.clone(),
            stats: stats.clone(),
            swap: swap.clone(),
            events: event_rx,
            start_counter: 0,
            current_round_robin: 1,
            sustain_pedal: false,
            sustained_notes: [false; 128],
            map_epoch: 0,
        };
        let handle = SamplerHandle {
            map,
            params,
            stats,
            voice_shared,
            swap,
            events: event_tx,
            folder: Arc::new(Mutex::new(None)),
            streamer: Arc::new(Mutex::new(Some(streamer))),
            loader: Arc::new(Mutex::new(None)),
            swap_serial: Arc::new(Mutex::new(())),
        };
        (engine, handle)
    }

    /// Renders one interleaved stereo block. Never blocks, allocates or
    /// touches the filesystem.
    pub fn process_block(&mut self, out: &mut [f32]) {
        out.fill(0.0);

        // A library swap is in progress: wind every voice down with the
        // quick fade and acknowledge once they have all landed. The old map
        // stays in place until the acknowledgment, so the fades render from
        // the data the voices were started on.
        let epoch = self.swap.epoch.load(Ordering::Acquire);
        if self.swap.freeze.load(Ordering::Acquire) {
            self.map_epoch = epoch;
            self.stop_all_voices();
            while self.events.try_recv().is_ok() {}

            let map_lock = self.map.clone();
            let (active, streaming) = match map_lock.try_read() {
                Some(map) => {
                    let adsr = self.params.adsr();
                    self.render_active_voices(&map, out, adsr)
                }
                None => (0, 0),
            };
            if active == 0 {
                self.swap.acknowledged.store(true, Ordering::Release);
            }
            self.stats.set_voice_counts(active, streaming);
            return;
        }
        if epoch != self.map_epoch {
            // The map was swapped without this thread seeing the freeze (the
            // host wasn't calling us). The records these voices were playing
            // are gone, so there is nothing left to fade from: hard-stop.
            self.map_epoch = epoch;
            self.kill_all_voices();
        }

        let map_lock = self.map.clone();
        let Some(map) = map_lock.try_read() else {
            // A writer holds the map; voices are quiesced around writers, so
            // a silent block is the correct output.
            self.stats.set_voice_counts(0, 0);
            return;
        };

        let adsr = self.params.adsr();
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(&map, event, adsr);
        }

        let (active, streaming) = self.render_active_voices(&map, out, adsr);
        self.stats.set_voice_counts(active, streaming);
    }

    /// Mixes every active voice into the block. Returns the active and
    /// streaming voice counts after rendering.
    fn render_active_voices(
        &mut self,
        map: &InstrumentMap,
        out: &mut [f32],
        adsr: AdsrParams,
    ) -> (usize, usize) {
        let mut active = 0;
        let mut streaming = 0;
        for voice in self.voices.iter_mut() {
            if !voice.is_active() {
                continue;
            }
            let record = map.record(voice.record_index());
            voice.render(record, out, adsr, self.stats.underruns_counter());
            if voice.is_active() {
                active += 1;
                if voice.is_streaming() {
                    streaming += 1;
                }
            }
        }
        (active, streaming)
    }

    fn handle_event(&mut self, map: &InstrumentMap, event: RawMidi, adsr: AdsrParams) {
        let parsed = match LiveEvent::parse(event.bytes()) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "Ignoring unparseable MIDI event");
                return;
            }
        };
        let LiveEvent::Midi { message, .. } = parsed else {
            return;
        };

        match message {
            MidiMessage::NoteOn { key, vel } if vel.as_int() == 0 => {
                self.note_off(key.as_int());
            }
            MidiMessage::NoteOn { key, vel } => {
                self.note_on(
                    map,
                    key.as_int(),
                    vel.as_int(),
                    event.frame_offset as usize,
                    adsr,
                );
            }
            MidiMessage::NoteOff { key, .. } => {
                self.note_off(key.as_int());
            }
            MidiMessage::Controller { controller, value }
                if controller.as_int() == SUSTAIN_CONTROLLER =>
            {
                self.sustain_pedal_change(value.as_int() >= 64);
            }
            _ => {}
        }
    }

    fn note_on(
        &mut self,
        map: &InstrumentMap,
        note: u8,
        velocity: u8,
        frame_offset: usize,
        adsr: AdsrParams,
    ) {
        // Transpose shifts the sounding pitch; the sample offset additionally
        // shifts which articulation sources it, pitch-corrected back.
        let sounding = (note as i32 + self.params.transpose()).clamp(0, 127) as u8;
        let lookup = sounding as i32 + self.params.sample_offset();
        if !(0..=127).contains(&lookup) {
            return;
        }

        let Some(record_index) = map.find(
            lookup as u8,
            velocity,
            self.current_round_robin,
            self.params.velocity_layer_limit(),
        ) else {
            debug!(note, velocity, "No articulation for note-on");
            return;
        };
        let record = map.record(record_index);
        if record.total_frames() < 2 || record.preload_end_frame() == 0 {
            return;
        }

        // Polyphonic same-note: the old vibration decays on its own shorter
        // release while the new attack begins.
        let same_note_release = self.params.same_note_release();
        for voice in self.voices.iter_mut() {
            if voice.is_active() && voice.midi_note() == note && !voice.in_quick_fade() {
                voice.release_over(same_note_release);
            }
        }

        let on_note = |voice: &Voice| voice.is_active() && voice.midi_note() == note;
        if self.voices.iter().filter(|v| on_note(v)).count() >= PER_NOTE_VOICE_CAP {
            if let Some(oldest) = self
                .voices
                .iter_mut()
                .filter(|v| on_note(v))
                .min_by_key(|v| v.start_counter())
            {
                oldest.begin_quick_fade();
            }
        }

        let slot = match self.allocate_slot() {
            Some(slot) => slot,
            None => return,
        };

        self.start_counter += 1;
        self.sustained_notes[note as usize] = false;
        self.voices[slot].start(
            record_index,
            record,
            note,
            sounding,
            self.start_counter,
            frame_offset,
            adsr,
        );

        let round_robin_limit = self.params.round_robin_limit().max(1);
        self.current_round_robin = (self.current_round_robin % round_robin_limit) + 1;
    }

    /// Picks a voice slot: any inactive one, else quick-fade the globally
    /// oldest and look again, else force-stop the oldest and take its slot.
    fn allocate_slot(&mut self) -> Option<usize> {
        if let Some(slot) = self.voices.iter().position(|v| !v.is_active()) {
            return Some(slot);
        }

        if let Some(oldest) = self
            .voices
            .iter_mut()
            .filter(|v| v.is_active())
            .min_by_key(|v| v.start_counter())
        {
            oldest.begin_quick_fade();
        }
        if let Some(slot) = self.voices.iter().position(|v| !v.is_active()) {
            return Some(slot);
        }

        let oldest = self
            .voices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_active())
            .min_by_key(|(_, v)| v.start_counter())
            .map(|(slot, _)| slot)?;
        self.voices[oldest].force_stop();
        Some(oldest)
    }

    fn note_off(&mut self, note: u8) {
        if self.sustain_pedal {
            self.sustained_notes[note as usize] = true;
            return;
        }
        for voice in self.voices.iter_mut() {
            if voice.is_active() && voice.midi_note() == note && !voice.in_quick_fade() {
                voice.release();
            }
        }
    }

    fn sustain_pedal_change(&mut self, down: bool) {
        if down == self.sustain_pedal {
            return;
        }
        self.sustain_pedal = down;
        if down {
            return;
        }
        // Pedal up: start release for every note that was released while the
        // pedal was held.
        for note in 0..self.sustained_notes.len() {
            if !self.sustained_notes[note] {
                continue;
            }
            self.sustained_notes[note] = false;
            for voice in self.voices.iter_mut() {
                if voice.is_active()
                    && voice.midi_note() == note as u8
                    && !voice.in_quick_fade()
                {
                    voice.release();
                }
            }
        }
    }

    /// Winds every sounding voice down with the click-free quick fade. Each
    /// voice deactivates on its own as its ramp lands.
    fn stop_all_voices(&mut self) {
        for voice in self.voices.iter_mut() {
            if voice.is_active() {
                voice.begin_quick_fade();
            }
        }
        self.sustain_pedal = false;
        self.sustained_notes = [false; 128];
    }

    /// Immediate hard stop of every voice. Last resort for the swap-recovery
    /// path, where the records the voices were rendering are already gone.
    fn kill_all_voices(&mut self) {
        for voice in self.voices.iter_mut() {
            if voice.is_active() {
                voice.force_stop();
            }
        }
        self.sustain_pedal = false;
        self.sustained_notes = [false; 128];
    }
}

impl std::fmt::Debug for SamplerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplerEngine")
            .field("voices", &self.voices.len())
            .field("active", &self.stats.active_voices())
            .finish()
    }
}

/// The control half of the sampler, used by the host/UI thread. All setters
/// clamp their inputs and never fail. Cloning is cheap; clones share the
/// same engine.
#[derive(Clone)]
pub struct SamplerHandle {
    map: Arc<RwLock<InstrumentMap>>,
    params: Arc<EngineParams>,
    stats: Arc<EngineStats>,
    voice_shared: Arc<Vec<Arc<VoiceShared>>>,
    swap: Arc<SwapFlags>,
    events: Sender<RawMidi>,
    folder: Arc<Mutex<Option<PathBuf>>>,
    streamer: Arc<Mutex<Option<DiskStreamer>>>,
    loader: Arc<Mutex<Option<JoinHandle<()>>>>,
    /// Serializes map swaps against preload reconciles.
    swap_serial: Arc<Mutex<()>>,
}

impl SamplerHandle {
    /// Queues a raw MIDI event for the audio thread. `frame_offset` is the
    /// event's position within the current block, zero for live input.
    pub fn send_midi(&self, raw: &[u8], frame_offset: u32) {
        let Some(event) = RawMidi::new(raw, frame_offset) else {
            return;
        };
        if self.events.try_send(event).is_err() {
            warn!("MIDI event queue full; dropping event");
        }
    }

    /// Starts a library load on a background thread. A load already in
    /// flight is joined first, so the newest request always wins.
    pub fn load_library(&self, folder: &Path) {
        let folder = folder.to_path_buf();
        let mut loader = self.loader.lock();
        if let Some(previous) = loader.take() {
            let _ = previous.join();
        }

        let handle = self.clone();
        *loader = Some(
            std::thread::Builder::new()
                .name("msampler-loader".into())
                .spawn(move || {
                    let _ = handle.run_load(&folder);
                })
                .expect("failed to spawn loader thread"),
        );
    }

    /// Loads a library on the calling thread.
    pub fn load_library_blocking(&self, folder: &Path) -> Result<LoadSummary, LoadError> {
        {
            let mut loader = self.loader.lock();
            if let Some(previous) = loader.take() {
                let _ = previous.join();
            }
        }
        self.run_load(folder)
    }

    /// Builds the new map, then runs the stop-swap-restart protocol: stop
    /// the streamer, freeze voices, swap under the write lock, restart.
    fn run_load(&self, folder: &Path) -> Result<LoadSummary, LoadError> {
        self.stats.loading.store(true, Ordering::Relaxed);
        let result = load_folder(
            folder,
            self.params.preload_kb(),
            self.params.velocity_layer_limit(),
            self.params.round_robin_limit(),
        );
        let (new_map, summary) = match result {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(folder = %folder.display(), error = %e, "Library load failed");
                self.stats.loading.store(false, Ordering::Relaxed);
                return Err(e);
            }
        };

        {
            let _serial = self.swap_serial.lock();

            // The streamer must be idle before the map changes under it.
            if let Some(mut streamer) = self.streamer.lock().take() {
                streamer.stop();
            }

            self.freeze_voices();
            {
                let mut map = self.map.write();
                *map = new_map;
            }
            self.swap.epoch.fetch_add(1, Ordering::AcqRel);
            self.swap.freeze.store(false, Ordering::Release);

            *self.streamer.lock() = Some(DiskStreamer::spawn(
                self.voice_shared.clone(),
                self.map.clone(),
                self.stats.clone(),
            ));
        }

        self.stats
            .total_file_bytes
            .store(summary.total_file_bytes, Ordering::Relaxed);
        self.stats
            .preload_bytes
            .store(summary.preload_bytes, Ordering::Relaxed);
        *self.folder.lock() = Some(folder.to_path_buf());
        self.stats.loading.store(false, Ordering::Relaxed);

        Ok(summary)
    }

    /// Raises the freeze flag and waits for the audio thread to confirm its
    /// voices have faded to silence. Hosts that stopped calling the callback
    /// never acknowledge; the epoch check in `process_block` covers them.
    fn freeze_voices(&self) {
        self.swap.acknowledged.store(false, Ordering::Release);
        self.swap.freeze.store(true, Ordering::Release);
        let deadline = Instant::now() + FREEZE_ACK_TIMEOUT;
        while !self.swap.acknowledged.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                debug!("No freeze acknowledgment from audio thread; continuing swap");
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Quick-fades every sounding voice (via a freeze round trip; the audio
    /// thread acknowledges once the fades have landed). Used on shutdown and
    /// by hosts implementing an all-notes-off panic.
    pub fn stop_all_voices(&self) {
        let _serial = self.swap_serial.lock();
        self.freeze_voices();
        self.swap.freeze.store(false, Ordering::Release);
    }

    pub fn set_attack(&self, seconds: f32) {
        self.params.set_attack(seconds);
    }

    pub fn set_decay(&self, seconds: f32) {
        self.params.set_decay(seconds);
    }

    pub fn set_sustain(&self, level: f32) {
        self.params.set_sustain(level);
    }

    pub fn set_release(&self, seconds: f32) {
        self.params.set_release(seconds);
    }

    pub fn set_same_note_release(&self, seconds: f32) {
        self.params.set_same_note_release(seconds);
    }

    pub fn set_transpose(&self, semitones: i32) {
        self.params.set_transpose(semitones);
    }

    pub fn set_sample_offset(&self, semitones: i32) {
        self.params.set_sample_offset(semitones);
    }

    /// Changes the per-sample preload size and reconciles every record.
    pub fn set_preload_kb(&self, kb: u32) {
        self.params.set_preload_kb(kb);
        self.reconcile_preload();
    }

    /// Changes the number of active velocity layers and reconciles the
    /// preload set.
    pub fn set_velocity_layer_limit(&self, limit: u16) {
        self.params.set_velocity_layer_limit(limit);
        self.reconcile_preload();
    }

    /// Changes the number of active round-robin positions and reconciles the
    /// preload set.
    pub fn set_round_robin_limit(&self, limit: u16) {
        self.params.set_round_robin_limit(limit);
        self.reconcile_preload();
    }

    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    /// Brings every record's preload in line with the current limits. The
    /// disk reads happen off the map lock; the write lock is only held to
    /// install or free buffers, so the audio thread misses at most a block.
    fn reconcile_preload(&self) {
        let _serial = self.swap_serial.lock();
        let velocity_layer_limit = self.params.velocity_layer_limit();
        let round_robin_limit = self.params.round_robin_limit();
        let preload_kb = self.params.preload_kb();

        struct PendingLoad {
            index: usize,
            reader: crate::library::map::SharedReader,
            path: PathBuf,
            channels: usize,
            frames: u64,
        }

        let mut to_load: Vec<PendingLoad> = Vec::new();
        let mut to_free: Vec<usize> = Vec::new();
        {
            let map = self.map.read();
            for (index, record) in map.records().iter().enumerate() {
                let want = record.should_preload(velocity_layer_limit, round_robin_limit);
                let frames =
                    preload_frames(preload_kb, record.channels(), record.total_frames());
                if want && (!record.preloaded() || record.preload_end_frame() != frames) {
                    to_load.push(PendingLoad {
                        index,
                        reader: record.reader(),
                        path: record.path().to_path_buf(),
                        channels: record.channels() as usize,
                        frames,
                    });
                } else if !want && record.preloaded() {
                    to_free.push(index);
                }
            }
        }

        let mut loaded: Vec<(usize, Vec<f32>)> = Vec::with_capacity(to_load.len());
        for pending in to_load {
            let mut guard = pending.reader.lock();
            if guard.is_none() {
                match open_file(&pending.path) {
                    Ok(reader) => *guard = Some(reader),
                    Err(e) => {
                        warn!(
                            file = %pending.path.display(),
                            error = %e,
                            "Failed to open sample for preload"
                        );
                        to_free.push(pending.index);
                        continue;
                    }
                }
            }
            let reader = guard.as_mut().expect("reader just ensured");
            let mut buffer = vec![0.0f32; pending.frames as usize * pending.channels];
            match reader.read_into(&mut buffer, 0, pending.frames as u32) {
                Ok(read) => {
                    buffer.truncate(read as usize * pending.channels);
                    loaded.push((pending.index, buffer));
                }
                Err(e) => {
                    warn!(
                        file = %pending.path.display(),
                        error = %e,
                        "Failed to read sample preload"
                    );
                    to_free.push(pending.index);
                }
            }
        }

        let mut map = self.map.write();
        for (index, buffer) in loaded {
            map.install_preload(index, buffer);
        }
        for index in to_free {
            map.free_preload(index);
        }
        map.finish_reconcile(velocity_layer_limit, round_robin_limit, preload_kb);
        self.stats
            .preload_bytes
            .store(map.preload_bytes(), Ordering::Relaxed);
    }

    /// A snapshot of the engine's observable state.
    pub fn observations(&self) -> Observations {
        Observations {
            loading: self.stats.loading(),
            folder: self.folder.lock().clone(),
            total_file_bytes: self.stats.total_file_bytes.load(Ordering::Relaxed),
            preload_bytes: self.stats.preload_bytes.load(Ordering::Relaxed),
            active_voices: self.stats.active_voices(),
            streaming_voices: self.stats.streaming_voices(),
            disk_mb_per_sec: self.stats.disk_bytes_per_sec() as f64 / (1024.0 * 1024.0),
            underruns: self.stats.underruns(),
        }
    }

    /// The key-value record the host persists verbatim.
    pub fn persisted_state(&self) -> PersistedState {
        let adsr = self.params.adsr();
        PersistedState {
            sample_folder: self.folder.lock().clone(),
            attack: adsr.attack,
            decay: adsr.decay,
            sustain: adsr.sustain,
            release: adsr.release,
            preload_size_kb: self.params.preload_kb(),
            transpose: self.params.transpose(),
            sample_offset: self.params.sample_offset(),
            velocity_layer_limit: self.params.velocity_layer_limit() as u32,
            round_robin_limit: self.params.round_robin_limit() as u32,
            same_note_release: self.params.same_note_release(),
        }
    }

    /// Applies a persisted record. Idempotent; a folder that no longer
    /// exists skips the auto-load.
    pub fn apply_state(&self, state: &PersistedState) {
        self.params.set_attack(state.attack);
        self.params.set_decay(state.decay);
        self.params.set_sustain(state.sustain);
        self.params.set_release(state.release);
        self.params.set_same_note_release(state.same_note_release);
        self.params.set_transpose(state.transpose);
        self.params.set_sample_offset(state.sample_offset);
        self.params.set_preload_kb(state.preload_size_kb);
        self.params
            .set_velocity_layer_limit(state.velocity_layer_limit.min(u16::MAX as u32) as u16);
        self.params
            .set_round_robin_limit(state.round_robin_limit.min(u16::MAX as u32) as u16);
        self.reconcile_preload();

        match &state.sample_folder {
            Some(folder) if folder.is_dir() => self.load_library(folder),
            Some(folder) => {
                warn!(folder = %folder.display(), "Persisted sample folder missing; skipping load")
            }
            None => {}
        }
    }

    /// Stops the background threads. Safe to call more than once.
    pub fn shutdown(&self) {
        if let Some(mut streamer) = self.streamer.lock().take() {
            streamer.stop();
        }
        if let Some(loader) = self.loader.lock().take() {
            let _ = loader.join();
        }
        info!("Sampler shut down");
    }
}

impl std::fmt::Debug for SamplerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplerHandle")
            .field("observations", &self.observations())
            .finish()
    }
}
