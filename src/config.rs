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

//! The persisted key-value state a host stores and restores verbatim.
//!
//! Every field has a default, unknown keys are ignored, and application is
//! clamped by the engine's setters, so stale or hand-edited records degrade
//! gracefully.

use std::error::Error;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::sampler::adsr::AdsrParams;
use crate::sampler::engine::{
    DEFAULT_PRELOAD_KB, DEFAULT_ROUND_ROBIN_LIMIT, DEFAULT_SAME_NOTE_RELEASE,
    DEFAULT_VELOCITY_LAYER_LIMIT,
};

/// A serialized snapshot of the sampler's user-facing settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedState {
    /// Folder to auto-load on restore.
    pub sample_folder: Option<PathBuf>,

    /// ADSR parameters: seconds, except sustain which is a level in 0..=1.
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,

    /// Per-sample preload size in KB (32..=1024).
    #[serde(rename = "preloadSizeKB")]
    pub preload_size_kb: u32,

    /// Semitone output shift (-12..=12).
    pub transpose: i32,

    /// Semitone source shift (-12..=12).
    pub sample_offset: i32,

    /// Number of active velocity layers (>= 1).
    pub velocity_layer_limit: u32,

    /// Number of active round-robin positions (>= 1).
    pub round_robin_limit: u32,

    /// Release seconds for same-note retriggers (0.01..=5.0).
    pub same_note_release: f32,
}

impl Default for PersistedState {
    fn default() -> Self {
        let adsr = AdsrParams::default();
        Self {
            sample_folder: None,
            attack: adsr.attack,
            decay: adsr.decay,
            sustain: adsr.sustain,
            release: adsr.release,
            preload_size_kb: DEFAULT_PRELOAD_KB,
            transpose: 0,
            sample_offset: 0,
            velocity_layer_limit: DEFAULT_VELOCITY_LAYER_LIMIT as u32,
            round_robin_limit: DEFAULT_ROUND_ROBIN_LIMIT as u32,
            same_note_release: DEFAULT_SAME_NOTE_RELEASE,
        }
    }
}

impl PersistedState {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Reads a state record from a file.
    pub fn load(path: &Path) -> Result<Self, Box<dyn Error>> {
        Ok(Self::from_json(&std::fs::read_to_string(path)?)?)
    }

    /// Writes the state record to a file.
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn Error>> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let state = PersistedState {
            sample_folder: Some(PathBuf::from("/samples/piano")),
            attack: 0.01,
            decay: 0.2,
            sustain: 0.7,
            release: 0.5,
            preload_size_kb: 512,
            transpose: -3,
            sample_offset: 5,
            velocity_layer_limit: 4,
            round_robin_limit: 2,
            same_note_release: 0.15,
        };

        let json = state.to_json().unwrap();
        assert_eq!(state, PersistedState::from_json(&json).unwrap());
    }

    #[test]
    fn test_key_names_match_the_record_format() {
        let json = PersistedState::default().to_json().unwrap();
        for key in [
            "sampleFolder",
            "attack",
            "decay",
            "sustain",
            "release",
            "preloadSizeKB",
            "transpose",
            "sampleOffset",
            "velocityLayerLimit",
            "roundRobinLimit",
            "sameNoteRelease",
        ] {
            assert!(json.contains(&format!("\"{}\"", key)), "missing key {key}");
        }
    }

    #[test]
    fn test_missing_and_unknown_keys_are_tolerated() {
        let state =
            PersistedState::from_json(r#"{"transpose": 7, "someFutureKey": true}"#).unwrap();
        assert_eq!(7, state.transpose);
        assert_eq!(PersistedState::default().attack, state.attack);
        assert_eq!(None, state.sample_folder);
    }

    #[test]
    fn test_file_round_trip() {
        let tempdir = tempfile::tempdir().unwrap();
        let path = tempdir.path().join("state.json");

        let mut state = PersistedState::default();
        state.transpose = 12;
        state.save(&path).unwrap();

        assert_eq!(state, PersistedState::load(&path).unwrap());
        assert!(PersistedState::load(&tempdir.path().join("missing.json")).is_err());
    }
}
