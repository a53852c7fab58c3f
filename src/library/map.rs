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

//! The instrument map: per-note velocity layers, pitch fallbacks and the
//! selective preload set.
//!
//! The map is immutable once published to the engine, with one exception: the
//! per-record preload buffers, which are resized by
//! [`InstrumentMap::reconcile_preload`] under the engine's write lock
//! whenever the preload size or the selective-preload limits change.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::parser::ArticulationKey;
use crate::audio::reader::{open_file, AudioFileReader};
use crate::util::filename_display;

/// Number of MIDI notes.
pub const NOTE_COUNT: usize = 128;

/// A shared handle to a record's open file reader. The loader and the disk
/// streamer keep readers open so streaming never pays the probe cost; the
/// handle is cloned out of the map so no map lock is held during disk reads.
pub type SharedReader = Arc<Mutex<Option<Box<dyn AudioFileReader>>>>;

/// One velocity tier of a note: the raw velocity value from the file name and
/// the derived inclusive range of incoming velocities it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VelocityLayer {
    /// The velocity value from the file name (1-127).
    pub velocity_value: u8,
    /// First incoming velocity this layer covers.
    pub range_start: u8,
    /// Last incoming velocity this layer covers.
    pub range_end: u8,
}

/// Per-note mapping: the sorted velocity layers a note owns, and where to
/// source audio from when it owns none.
#[derive(Debug, Clone, Default)]
pub struct NoteMap {
    /// Velocity layers sorted ascending by `velocity_value`.
    pub layers: Vec<VelocityLayer>,
    /// The nearest higher note with own layers, for notes that have none.
    pub fallback_note: Option<u8>,
}

impl NoteMap {
    /// Range-based layer lookup. Kept alongside the limit-aware remap in
    /// [`InstrumentMap::find`] for display purposes and for stating the
    /// partition invariant; playback never consults it.
    pub fn layer_for_velocity(&self, velocity: u8) -> Option<usize> {
        if self.layers.is_empty() {
            return None;
        }
        let clamped = velocity.min(self.layers.last().expect("non-empty").range_end);
        self.layers
            .iter()
            .position(|l| l.range_start <= clamped && clamped <= l.range_end)
    }
}

/// One parsed articulation file: its key, format, and preload state.
pub struct ArticulationRecord {
    key: ArticulationKey,
    /// Zero-based position of this record's layer in its note's sorted list.
    velocity_layer_index: u16,
    path: PathBuf,
    sample_rate: u32,
    channels: u16,
    total_frames: u64,
    file_size_bytes: u64,
    /// Interleaved f32 head of the file. Empty when not preloaded.
    preload: Vec<f32>,
    preloaded: bool,
    /// First frame the disk stream delivers; the preload covers [0, this).
    preload_end_frame: u64,
    reader: SharedReader,
}

impl ArticulationRecord {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: ArticulationKey,
        path: PathBuf,
        sample_rate: u32,
        channels: u16,
        total_frames: u64,
        file_size_bytes: u64,
        preload: Vec<f32>,
        reader: Option<Box<dyn AudioFileReader>>,
    ) -> Self {
        let preloaded = !preload.is_empty();
        let preload_end_frame = (preload.len() / channels.max(1) as usize) as u64;
        Self {
            key,
            velocity_layer_index: 0,
            path,
            sample_rate,
            channels,
            total_frames,
            file_size_bytes,
            preload,
            preloaded,
            preload_end_frame,
            reader: Arc::new(Mutex::new(reader)),
        }
    }

    pub fn key(&self) -> ArticulationKey {
        self.key
    }

    pub fn velocity_layer_index(&self) -> u16 {
        self.velocity_layer_index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn file_size_bytes(&self) -> u64 {
        self.file_size_bytes
    }

    /// The interleaved preload buffer.
    pub fn preload(&self) -> &[f32] {
        &self.preload
    }

    pub fn preloaded(&self) -> bool {
        self.preloaded
    }

    /// The frame at which the preload ends and disk streaming starts.
    pub fn preload_end_frame(&self) -> u64 {
        self.preload_end_frame
    }

    /// Clones the shared reader handle for use off the map lock.
    pub fn reader(&self) -> SharedReader {
        self.reader.clone()
    }

    /// Whether the record belongs to the selective preload set under the
    /// given limits.
    pub fn should_preload(&self, velocity_layer_limit: u16, round_robin_limit: u16) -> bool {
        self.velocity_layer_index < velocity_layer_limit
            && self.key.round_robin >= 1
            && self.key.round_robin <= round_robin_limit
    }

    fn preload_memory_bytes(&self) -> u64 {
        (self.preload.len() * std::mem::size_of::<f32>()) as u64
    }
}

impl std::fmt::Debug for ArticulationRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArticulationRecord")
            .field("key", &format!("{}", self.key))
            .field("layer_index", &self.velocity_layer_index)
            .field("total_frames", &self.total_frames)
            .field("preloaded", &self.preloaded)
            .finish()
    }
}

/// The immutable bundle the engine plays from: note mappings, articulation
/// records, derived maxima and the current preload accounting.
pub struct InstrumentMap {
    notes: Vec<NoteMap>,
    records: Vec<ArticulationRecord>,
    /// (note, velocity_value) -> record indices, ordered by round-robin.
    index: HashMap<(u8, u8), Vec<usize>>,
    max_round_robins: u16,
    max_velocity_layers: u16,
    velocity_layer_limit: u16,
    round_robin_limit: u16,
    preload_kb: u32,
    total_file_bytes: u64,
    preload_bytes: u64,
}

impl InstrumentMap {
    /// An empty map; the engine starts with one until a library loads.
    pub fn empty() -> Self {
        Self {
            notes: vec![NoteMap::default(); NOTE_COUNT],
            records: Vec::new(),
            index: HashMap::new(),
            max_round_robins: 0,
            max_velocity_layers: 0,
            velocity_layer_limit: 0,
            round_robin_limit: 0,
            preload_kb: 0,
            total_file_bytes: 0,
            preload_bytes: 0,
        }
    }

    /// Assembles a map from parsed records. Derives the velocity-layer
    /// lattice, layer ranges, fallbacks and per-record layer indices.
    pub(crate) fn assemble(
        mut records: Vec<ArticulationRecord>,
        preload_kb: u32,
        velocity_layer_limit: u16,
        round_robin_limit: u16,
    ) -> Self {
        let velocities = sorted_velocities_per_note(records.iter().map(|r| r.key));

        // Per-record layer indices.
        for record in records.iter_mut() {
            record.velocity_layer_index = velocities[record.key.note as usize]
                .iter()
                .position(|&v| v == record.key.velocity)
                .expect("record velocity missing from its own note") as u16;
        }

        // Note maps with contiguous velocity ranges.
        let mut notes: Vec<NoteMap> = velocities
            .iter()
            .map(|values| {
                let mut layers = Vec::with_capacity(values.len());
                let mut range_start = 1u8;
                for &velocity_value in values {
                    layers.push(VelocityLayer {
                        velocity_value,
                        range_start,
                        range_end: velocity_value,
                    });
                    range_start = velocity_value.saturating_add(1);
                }
                NoteMap {
                    layers,
                    fallback_note: None,
                }
            })
            .collect();

        // Fallbacks: the nearest higher note with own layers.
        let mut next_with_layers: Option<u8> = None;
        for note in (0..NOTE_COUNT).rev() {
            if notes[note].layers.is_empty() {
                notes[note].fallback_note = next_with_layers;
            } else {
                next_with_layers = Some(note as u8);
            }
        }

        let mut index: HashMap<(u8, u8), Vec<usize>> = HashMap::new();
        for (i, record) in records.iter().enumerate() {
            index
                .entry((record.key.note, record.key.velocity))
                .or_default()
                .push(i);
        }
        for entries in index.values_mut() {
            entries.sort_by_key(|&i| records[i].key.round_robin);
        }

        let max_round_robins = records.iter().map(|r| r.key.round_robin).max().unwrap_or(0);
        let max_velocity_layers = notes.iter().map(|n| n.layers.len()).max().unwrap_or(0) as u16;
        let total_file_bytes = records.iter().map(|r| r.file_size_bytes).sum();
        let preload_bytes = records.iter().map(|r| r.preload_memory_bytes()).sum();

        Self {
            notes,
            records,
            index,
            max_round_robins,
            max_velocity_layers,
            velocity_layer_limit,
            round_robin_limit,
            preload_kb,
            total_file_bytes,
            preload_bytes,
        }
    }

    pub fn note(&self, note: u8) -> &NoteMap {
        &self.notes[note as usize]
    }

    pub fn records(&self) -> &[ArticulationRecord] {
        &self.records
    }

    pub fn record(&self, index: usize) -> &ArticulationRecord {
        &self.records[index]
    }

    pub fn max_round_robins(&self) -> u16 {
        self.max_round_robins
    }

    pub fn max_velocity_layers(&self) -> u16 {
        self.max_velocity_layers
    }

    /// The limits the preload set was last reconciled under.
    pub fn preload_limits(&self) -> (u16, u16) {
        (self.velocity_layer_limit, self.round_robin_limit)
    }

    /// The per-sample preload size the map was last reconciled with, in KB.
    pub fn preload_kb(&self) -> u32 {
        self.preload_kb
    }

    pub fn total_file_bytes(&self) -> u64 {
        self.total_file_bytes
    }

    pub fn preload_bytes(&self) -> u64 {
        self.preload_bytes
    }

    /// Resolves a note-on to a record index.
    ///
    /// Unsampled notes fall back to the nearest higher sampled note. The
    /// velocity is remapped linearly across the active layers so that any
    /// `velocity_layer_limit` still covers the full 1-127 input range. Among
    /// matching records, a preloaded one with the requested round-robin wins,
    /// then any preloaded one.
    pub fn find(
        &self,
        note: u8,
        velocity: u8,
        round_robin: u16,
        velocity_layer_limit: u16,
    ) -> Option<usize> {
        let note_map = &self.notes[note as usize];
        let target_note = if note_map.layers.is_empty() {
            note_map.fallback_note?
        } else {
            note
        };
        let layers = &self.notes[target_note as usize].layers;
        if layers.is_empty() {
            return None;
        }

        let effective_layers = (velocity_layer_limit.max(1) as usize).min(layers.len());
        let layer_index =
            (((velocity.max(1) - 1) as usize * effective_layers) / 127).min(effective_layers - 1);
        let target_velocity = layers[layer_index].velocity_value;

        let candidates = self.index.get(&(target_note, target_velocity))?;
        let preloaded = candidates
            .iter()
            .filter(|&&i| self.records[i].preloaded)
            .copied();
        let mut first = None;
        for i in preloaded {
            if self.records[i].key.round_robin == round_robin {
                return Some(i);
            }
            first.get_or_insert(i);
        }
        first
    }

    /// Brings the preload set in line with the given limits and preload size:
    /// loads heads for records that should be resident, frees the rest, and
    /// updates the memory accounting. Runs under the engine's write lock.
    pub fn reconcile_preload(
        &mut self,
        velocity_layer_limit: u16,
        round_robin_limit: u16,
        preload_kb: u32,
    ) {
        for record in self.records.iter_mut() {
            let want = record.should_preload(velocity_layer_limit, round_robin_limit);
            let wanted_frames = preload_frames(preload_kb, record.channels, record.total_frames);

            if want && (!record.preloaded || record.preload_end_frame != wanted_frames) {
                match load_preload(record, wanted_frames) {
                    Ok(()) => debug!(
                        file = filename_display(&record.path),
                        frames = record.preload_end_frame,
                        "Preloaded sample head"
                    ),
                    Err(e) => {
                        warn!(
                            file = filename_display(&record.path),
                            error = %e,
                            "Failed to preload sample"
                        );
                        drop_preload(record);
                    }
                }
            } else if !want && record.preloaded {
                drop_preload(record);
            }
        }

        self.velocity_layer_limit = velocity_layer_limit;
        self.round_robin_limit = round_robin_limit;
        self.preload_kb = preload_kb;
        self.preload_bytes = self.records.iter().map(|r| r.preload_memory_bytes()).sum();
    }

    /// Installs a preload buffer read off the lock, marking the record
    /// resident. Part of the phased reconcile the engine handle runs so disk
    /// reads never happen under the write lock.
    pub(crate) fn install_preload(&mut self, index: usize, preload: Vec<f32>) {
        let Some(record) = self.records.get_mut(index) else {
            return;
        };
        record.preload_end_frame = (preload.len() / record.channels.max(1) as usize) as u64;
        record.preload = preload;
        record.preloaded = !record.preload.is_empty();
    }

    /// Frees a record's preload buffer and closes its reader.
    pub(crate) fn free_preload(&mut self, index: usize) {
        if let Some(record) = self.records.get_mut(index) {
            drop_preload(record);
        }
    }

    /// Records the limits a reconcile ran under and refreshes the preload
    /// memory accounting.
    pub(crate) fn finish_reconcile(
        &mut self,
        velocity_layer_limit: u16,
        round_robin_limit: u16,
        preload_kb: u32,
    ) {
        self.velocity_layer_limit = velocity_layer_limit;
        self.round_robin_limit = round_robin_limit;
        self.preload_kb = preload_kb;
        self.preload_bytes = self.records.iter().map(|r| r.preload_memory_bytes()).sum();
    }
}

impl std::fmt::Debug for InstrumentMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentMap")
            .field("records", &self.records.len())
            .field("max_velocity_layers", &self.max_velocity_layers)
            .field("max_round_robins", &self.max_round_robins)
            .field("preload_memory_kb", &(self.preload_bytes / 1024))
            .finish()
    }
}

/// How many frames of a file the preload covers for the given size budget.
pub(crate) fn preload_frames(preload_kb: u32, channels: u16, total_frames: u64) -> u64 {
    let bytes_per_frame = channels.max(1) as u64 * std::mem::size_of::<f32>() as u64;
    ((preload_kb as u64 * 1024) / bytes_per_frame).min(total_frames)
}

/// Sorted distinct velocity values per note, the backbone of the layer
/// lattice. Shared with the loader so preload decisions during the scan agree
/// with the assembled map.
pub(crate) fn sorted_velocities_per_note(
    keys: impl Iterator<Item = ArticulationKey>,
) -> Vec<Vec<u8>> {
    let mut velocities: Vec<Vec<u8>> = vec![Vec::new(); NOTE_COUNT];
    for key in keys {
        let values = &mut velocities[key.note as usize];
        if !values.contains(&key.velocity) {
            values.push(key.velocity);
        }
    }
    for values in velocities.iter_mut() {
        values.sort_unstable();
    }
    velocities
}

/// Reads the head of the record's file into its preload buffer, opening a
/// reader if the record has none.
fn load_preload(record: &mut ArticulationRecord, frames: u64) -> Result<(), crate::audio::ReaderError> {
    let mut guard = record.reader.lock();
    if guard.is_none() {
        *guard = Some(open_file(&record.path)?);
    }
    let reader = guard.as_mut().expect("reader just opened");

    let samples = frames as usize * record.channels as usize;
    let mut preload = vec![0.0f32; samples];
    let read = reader.read_into(&mut preload, 0, frames as u32)?;
    preload.truncate(read as usize * record.channels as usize);
    drop(guard);

    record.preload_end_frame = read as u64;
    record.preload = preload;
    record.preloaded = true;
    Ok(())
}

/// Frees the record's preload buffer and closes its reader.
fn drop_preload(record: &mut ArticulationRecord) {
    record.preload = Vec::new();
    record.preloaded = false;
    record.preload_end_frame = 0;
    *record.reader.lock() = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(note: u8, velocity: u8, round_robin: u16) -> ArticulationKey {
        ArticulationKey {
            note,
            velocity,
            round_robin,
        }
    }

    /// A record with synthetic preload data and no backing file.
    fn record(note: u8, velocity: u8, round_robin: u16) -> ArticulationRecord {
        ArticulationRecord::new(
            key(note, velocity, round_robin),
            PathBuf::from(format!("{}.wav", key(note, velocity, round_robin))),
            44100,
            1,
            44100,
            44100 * 2,
            vec![0.0; 1024],
            None,
        )
    }

    fn c4_map() -> InstrumentMap {
        InstrumentMap::assemble(
            vec![record(60, 40, 1), record(60, 80, 1), record(60, 127, 1)],
            256,
            127,
            64,
        )
    }

    #[test]
    fn test_layer_ranges_partition() {
        let map = InstrumentMap::assemble(
            vec![
                record(60, 30, 1),
                record(60, 90, 1),
                record(60, 127, 1),
                record(72, 64, 1),
            ],
            256,
            127,
            64,
        );

        let layers = &map.note(60).layers;
        assert_eq!(3, layers.len());
        assert_eq!((1, 30), (layers[0].range_start, layers[0].range_end));
        assert_eq!((31, 90), (layers[1].range_start, layers[1].range_end));
        assert_eq!((91, 127), (layers[2].range_start, layers[2].range_end));

        // Every velocity in 1..=127 resolves to exactly one layer.
        for velocity in 1..=127u8 {
            assert!(map.note(60).layer_for_velocity(velocity).is_some());
        }
        for (i, layer) in layers.iter().enumerate().skip(1) {
            assert_eq!(layers[i - 1].range_end + 1, layer.range_start);
        }

        // A single-layer note covers everything.
        assert_eq!(Some(0), map.note(72).layer_for_velocity(1));
        assert_eq!(Some(0), map.note(72).layer_for_velocity(127));
    }

    #[test]
    fn test_layer_indices_follow_sort_order() {
        // Deliberately unsorted input.
        let map = InstrumentMap::assemble(
            vec![record(60, 127, 1), record(60, 40, 1), record(60, 80, 1)],
            256,
            127,
            64,
        );

        for record in map.records() {
            let expected = match record.key().velocity {
                40 => 0,
                80 => 1,
                127 => 2,
                _ => unreachable!(),
            };
            assert_eq!(expected, record.velocity_layer_index());
        }
    }

    #[test]
    fn test_fallbacks_point_to_nearest_higher_note() {
        let map = InstrumentMap::assemble(vec![record(60, 64, 1), record(72, 64, 1)], 256, 127, 64);

        assert_eq!(Some(60), map.note(10).fallback_note);
        assert_eq!(Some(60), map.note(59).fallback_note);
        assert_eq!(None, map.note(60).fallback_note);
        assert_eq!(Some(72), map.note(61).fallback_note);
        assert_eq!(Some(72), map.note(71).fallback_note);
        assert_eq!(None, map.note(72).fallback_note);
        // Nothing above the highest sampled note.
        assert_eq!(None, map.note(73).fallback_note);
        assert_eq!(None, map.note(127).fallback_note);

        // Fallbacks are strictly higher and themselves have layers.
        for note in 0..128u8 {
            if let Some(fallback) = map.note(note).fallback_note {
                assert!(fallback > note);
                assert!(!map.note(fallback).layers.is_empty());
            }
        }
    }

    #[test]
    fn test_derived_maxima() {
        let map = InstrumentMap::assemble(
            vec![
                record(60, 40, 1),
                record(60, 40, 2),
                record(60, 40, 3),
                record(60, 80, 1),
                record(72, 64, 1),
            ],
            256,
            127,
            64,
        );

        assert_eq!(3, map.max_round_robins());
        assert_eq!(2, map.max_velocity_layers());
    }

    #[test]
    fn test_find_remaps_velocity_evenly() {
        let map = c4_map();

        let velocity_of = |index: Option<usize>| map.record(index.unwrap()).key().velocity;

        assert_eq!(40, velocity_of(map.find(60, 1, 1, 3)));
        assert_eq!(80, velocity_of(map.find(60, 64, 1, 3)));
        assert_eq!(127, velocity_of(map.find(60, 127, 1, 3)));
    }

    #[test]
    fn test_find_uses_fallback() {
        let map = c4_map();

        // 59 has no layers of its own; it sources from 60's lattice.
        let index = map.find(59, 100, 1, 3).unwrap();
        assert_eq!(60, map.record(index).key().note);
        // layer_index = ((100 - 1) * 3) / 127 = 2 -> the 127 layer.
        assert_eq!(127, map.record(index).key().velocity);

        // Above the highest sampled note there is no fallback.
        assert_eq!(None, map.find(61, 100, 1, 3));
    }

    #[test]
    fn test_find_with_lowered_layer_limit() {
        let map = c4_map();

        // With one active layer everything maps to the softest sample.
        let velocity_of = |index: Option<usize>| map.record(index.unwrap()).key().velocity;
        assert_eq!(40, velocity_of(map.find(60, 1, 1, 1)));
        assert_eq!(40, velocity_of(map.find(60, 127, 1, 1)));

        // With two, the range splits across the two softest.
        assert_eq!(40, velocity_of(map.find(60, 1, 1, 2)));
        assert_eq!(40, velocity_of(map.find(60, 63, 1, 2)));
        assert_eq!(80, velocity_of(map.find(60, 64, 1, 2)));
        assert_eq!(80, velocity_of(map.find(60, 127, 1, 2)));
    }

    #[test]
    fn test_find_prefers_requested_round_robin() {
        let map = InstrumentMap::assemble(
            vec![record(60, 64, 1), record(60, 64, 2), record(60, 64, 3)],
            256,
            127,
            64,
        );

        for rr in 1..=3u16 {
            let index = map.find(60, 64, rr, 127).unwrap();
            assert_eq!(rr, map.record(index).key().round_robin);
        }

        // An unavailable round-robin falls back to the first preloaded match.
        let index = map.find(60, 64, 9, 127).unwrap();
        assert_eq!(1, map.record(index).key().round_robin);
    }

    #[test]
    fn test_find_skips_unpreloaded_records() {
        let mut records = vec![record(60, 64, 1), record(60, 64, 2)];
        records[0].preload = Vec::new();
        records[0].preloaded = false;
        let map = InstrumentMap::assemble(records, 256, 127, 64);

        let index = map.find(60, 64, 1, 127).unwrap();
        assert_eq!(2, map.record(index).key().round_robin);
    }

    #[test]
    fn test_should_preload() {
        let map = c4_map();

        for record in map.records() {
            assert!(record.should_preload(3, 1));
        }

        // Lowering the layer limit drops the loudest layers.
        for record in map.records() {
            let expected = record.key().velocity == 40;
            assert_eq!(expected, record.should_preload(1, 1));
        }

        // A round-robin outside the limit is never preloaded.
        let rr2 = ArticulationRecord::new(
            key(60, 40, 2),
            PathBuf::from("C4_040_02.wav"),
            44100,
            1,
            44100,
            88200,
            vec![0.0; 512],
            None,
        );
        assert!(!rr2.should_preload(127, 1));
        assert!(rr2.should_preload(127, 2));
    }

    #[test]
    fn test_preload_frames() {
        // 256 KB at stereo f32: 32768 frames.
        assert_eq!(32768, preload_frames(256, 2, 1_000_000));
        // Mono fits twice as many.
        assert_eq!(65536, preload_frames(256, 1, 1_000_000));
        // Clamped to the file length.
        assert_eq!(1000, preload_frames(256, 2, 1000));
    }

    #[test]
    fn test_empty_map_finds_nothing() {
        let map = InstrumentMap::empty();
        for note in 0..128u8 {
            assert_eq!(None, map.find(note, 64, 1, 127));
        }
    }

    #[test]
    fn test_reconcile_preload_round_trip() {
        let tempdir = tempfile::tempdir().unwrap();
        for name in ["C4_040_01.wav", "C4_080_01.wav", "C4_127_01.wav"] {
            crate::testutil::write_ramp_wav(&tempdir.path().join(name), 4000, 1, 44100).unwrap();
        }
        let (mut map, _) = crate::library::load_folder(tempdir.path(), 64, 127, 64).unwrap();
        let full_bytes = map.preload_bytes();
        assert_eq!(3 * 4000 * 4, full_bytes);

        // Dropping to one layer frees the two loudest records.
        map.reconcile_preload(1, 1, 64);
        assert_eq!(full_bytes / 3, map.preload_bytes());
        assert_eq!((1, 1), map.preload_limits());
        assert_eq!(64, map.preload_kb());
        for record in map.records() {
            assert_eq!(record.velocity_layer_index() == 0, record.preloaded());
            assert_eq!(
                record.preloaded(),
                record.should_preload(1, 1),
                "{:?}",
                record
            );
        }

        // Raising the limit again re-reads the freed heads from disk.
        map.reconcile_preload(127, 64, 64);
        assert_eq!(full_bytes, map.preload_bytes());
        for record in map.records() {
            assert!(record.preloaded());
            assert_eq!(4000, record.preload_end_frame());
        }

        // Lookup only ever returns preloaded records.
        map.reconcile_preload(1, 1, 64);
        let index = map.find(60, 127, 1, 1).unwrap();
        assert!(map.record(index).preloaded());
        assert_eq!(40, map.record(index).key().velocity);
    }
}
