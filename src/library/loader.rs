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

//! The library load pipeline: scan a folder, parse names, open readers and
//! read preload heads in parallel, then assemble the instrument map.
//!
//! Files that fail to parse or open are skipped and counted; a load only
//! fails when the folder itself is unreadable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use tracing::{debug, info, warn};

use super::map::{preload_frames, sorted_velocities_per_note, ArticulationRecord, InstrumentMap};
use super::parser::{parse_file_name, ArticulationKey};
use crate::audio::reader::open_file;
use crate::audio::MAX_SOURCE_CHANNELS;
use crate::util::filename_display;

/// Error types for library loading.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read library folder {0}: {1}")]
    Folder(PathBuf, std::io::Error),
}

/// Counters describing a completed load.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadSummary {
    /// Articulation records in the assembled map.
    pub records: usize,
    /// Files skipped for unparseable names or reader failures.
    pub skipped: usize,
    /// Sum of all mapped files' sizes on disk.
    pub total_file_bytes: u64,
    /// Bytes of preload memory resident after the load.
    pub preload_bytes: u64,
}

/// Scans `folder` non-recursively and builds a fully preloaded instrument
/// map under the given limits.
pub fn load_folder(
    folder: &Path,
    preload_kb: u32,
    velocity_layer_limit: u16,
    round_robin_limit: u16,
) -> Result<(InstrumentMap, LoadSummary), LoadError> {
    let entries = std::fs::read_dir(folder)
        .map_err(|e| LoadError::Folder(folder.to_path_buf(), e))?;

    let mut parsed: Vec<(PathBuf, ArticulationKey)> = Vec::new();
    let mut skipped = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match parse_file_name(&path) {
            Some(key) => parsed.push((path, key)),
            None => {
                debug!(file = filename_display(&path), "Skipping unrecognized file name");
                skipped += 1;
            }
        }
    }

    // Deterministic order regardless of directory iteration, and the basis of
    // the duplicate policy below.
    parsed.sort_by(|a, b| a.0.cmp(&b.0));

    // Two files declaring the same key: last write wins.
    let mut by_key: HashMap<ArticulationKey, PathBuf> = HashMap::new();
    for (path, key) in parsed {
        if let Some(previous) = by_key.insert(key, path.clone()) {
            warn!(
                key = %key,
                replaced = filename_display(&previous),
                using = filename_display(&path),
                "Duplicate articulation; keeping the later file"
            );
            skipped += 1;
        }
    }
    let entries: Vec<(ArticulationKey, PathBuf)> = by_key.into_iter().collect();

    // Layer indices are known before any file is opened, so the scan only
    // reads preload heads that the limits actually want.
    let velocities = sorted_velocities_per_note(entries.iter().map(|(key, _)| *key));

    let pool = ThreadPoolBuilder::new()
        .num_threads(num_cpus::get().clamp(1, 8))
        .thread_name(|i| format!("msampler-load-{i}"))
        .build()
        .expect("failed to build load pool");

    let records: Vec<Option<ArticulationRecord>> = pool.install(|| {
        entries
            .par_iter()
            .map(|(key, path)| {
                let layer_index = velocities[key.note as usize]
                    .iter()
                    .position(|&v| v == key.velocity)
                    .expect("key velocity missing from lattice")
                    as u16;
                let want_preload = layer_index < velocity_layer_limit
                    && key.round_robin >= 1
                    && key.round_robin <= round_robin_limit;
                open_record(key, path, preload_kb, want_preload)
            })
            .collect()
    });

    let opened: Vec<ArticulationRecord> = records.into_iter().flatten().collect();
    skipped += entries.len() - opened.len();

    let map = InstrumentMap::assemble(opened, preload_kb, velocity_layer_limit, round_robin_limit);
    let summary = LoadSummary {
        records: map.records().len(),
        skipped,
        total_file_bytes: map.total_file_bytes(),
        preload_bytes: map.preload_bytes(),
    };

    info!(
        folder = %folder.display(),
        records = summary.records,
        skipped = summary.skipped,
        velocity_layers = map.max_velocity_layers(),
        round_robins = map.max_round_robins(),
        preload_kb = summary.preload_bytes / 1024,
        "Instrument library loaded"
    );

    Ok((map, summary))
}

/// Opens one file, reads its format metadata and, when wanted, its preload
/// head. Returns `None` (skipping the file) on any reader failure.
fn open_record(
    key: &ArticulationKey,
    path: &Path,
    preload_kb: u32,
    want_preload: bool,
) -> Option<ArticulationRecord> {
    let mut reader = match open_file(path) {
        Ok(reader) => reader,
        Err(e) => {
            warn!(file = filename_display(path), error = %e, "Skipping unreadable file");
            return None;
        }
    };

    let channels = reader.channels();
    if channels as usize > MAX_SOURCE_CHANNELS {
        warn!(
            file = filename_display(path),
            channels, "Skipping file with unsupported channel count"
        );
        return None;
    }
    let sample_rate = reader.sample_rate();
    let total_frames = reader.total_frames();
    let file_size_bytes = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

    let (preload, keep_reader) = if want_preload {
        let frames = preload_frames(preload_kb, channels, total_frames);
        let mut preload = vec![0.0f32; frames as usize * channels as usize];
        match reader.read_into(&mut preload, 0, frames as u32) {
            Ok(read) => {
                preload.truncate(read as usize * channels as usize);
                (preload, Some(reader))
            }
            Err(e) => {
                warn!(file = filename_display(path), error = %e, "Skipping undecodable file");
                return None;
            }
        }
    } else {
        (Vec::new(), None)
    };

    Some(ArticulationRecord::new(
        *key,
        path.to_path_buf(),
        sample_rate,
        channels,
        total_frames,
        file_size_bytes,
        preload,
        keep_reader,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_ramp_wav;

    fn write_library(dir: &Path) {
        for name in [
            "C4_040_01.wav",
            "C4_080_01.wav",
            "C4_127_01.wav",
            "C4_040_02.wav",
            "A4_064_01.wav",
        ] {
            write_ramp_wav(&dir.join(name), 2000, 1, 44100).unwrap();
        }
        // These should all be skipped.
        write_ramp_wav(&dir.join("notasample.wav"), 10, 1, 44100).unwrap();
        write_ramp_wav(&dir.join("C4_000_01.wav"), 10, 1, 44100).unwrap();
        std::fs::write(dir.join("readme.txt"), "not audio").unwrap();
    }

    #[test]
    fn test_load_folder() {
        let tempdir = tempfile::tempdir().unwrap();
        write_library(tempdir.path());

        let (map, summary) = load_folder(tempdir.path(), 64, 127, 64).unwrap();

        assert_eq!(5, summary.records);
        assert_eq!(3, summary.skipped);
        assert_eq!(3, map.note(60).layers.len());
        assert_eq!(1, map.note(69).layers.len());
        assert_eq!(2, map.max_round_robins());
        assert_eq!(3, map.max_velocity_layers());
        assert!(summary.total_file_bytes > 0);
        assert!(summary.preload_bytes > 0);

        // Every record is preloaded under permissive limits, and small files
        // preload in their entirety.
        for record in map.records() {
            assert!(record.preloaded());
            assert_eq!(2000, record.total_frames());
            assert_eq!(2000, record.preload_end_frame());
        }
    }

    #[test]
    fn test_load_folder_respects_limits() {
        let tempdir = tempfile::tempdir().unwrap();
        write_library(tempdir.path());

        let (map, _) = load_folder(tempdir.path(), 64, 1, 1).unwrap();

        for record in map.records() {
            let expected = record.velocity_layer_index() == 0 && record.key().round_robin == 1;
            assert_eq!(expected, record.preloaded(), "record {:?}", record);
        }
    }

    #[test]
    fn test_load_folder_preload_size() {
        let tempdir = tempfile::tempdir().unwrap();
        // 20000 mono frames is 80000 preload bytes, larger than 32 KB.
        write_ramp_wav(&tempdir.path().join("C4_064_01.wav"), 20000, 1, 44100).unwrap();

        let (map, _) = load_folder(tempdir.path(), 32, 127, 64).unwrap();

        let record = &map.records()[0];
        // 32 KB of mono f32: 8192 frames.
        assert_eq!(8192, record.preload_end_frame());
        assert_eq!(8192 * 4, map.preload_bytes());
    }

    #[test]
    fn test_load_folder_duplicate_keys() {
        let tempdir = tempfile::tempdir().unwrap();
        write_ramp_wav(&tempdir.path().join("C4_064_01_alpha.wav"), 100, 1, 44100).unwrap();
        write_ramp_wav(&tempdir.path().join("C4_064_01_beta.wav"), 200, 1, 44100).unwrap();

        let (map, summary) = load_folder(tempdir.path(), 64, 127, 64).unwrap();

        // Last write (in sorted order) wins.
        assert_eq!(1, summary.records);
        assert_eq!(1, summary.skipped);
        assert_eq!(200, map.records()[0].total_frames());
    }

    #[test]
    fn test_load_missing_folder() {
        assert!(load_folder(Path::new("/does/not/exist"), 64, 127, 64).is_err());
    }
}
