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

//! The playback core.
//!
//! This module provides:
//! - A lock-free SPSC ring buffer between the disk thread and each voice
//! - The ADSR envelope state machine
//! - Voices: one playing articulation each, rendered with linear
//!   interpolation from the preload head and then the disk stream
//! - The disk streamer thread that refills voice ring buffers on demand
//! - The engine: MIDI dispatch, voice allocation and stealing, mixing, and
//!   observable state

pub mod adsr;
pub mod engine;
pub mod ring_buffer;
pub mod streamer;
pub mod voice;

pub use engine::{Observations, SamplerEngine, SamplerHandle};
