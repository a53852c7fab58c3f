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

//! The disk-streaming thread.
//!
//! A single background thread services the ring buffers of every active
//! voice. Each tick it snapshots which voices want data, serves the ones
//! closest to underrun first, and reads one chunk per voice per tick. All
//! synchronization with the audio thread goes through the ring buffer
//! positions and the per-voice atomic flags; the map's write lock is never
//! held while a disk read is in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::engine::EngineStats;
use super::ring_buffer::STREAM_CHUNK_FRAMES;
use super::voice::VoiceShared;
use crate::audio::reader::open_file;
use crate::audio::thread_priority::promote_streamer_thread;
use crate::audio::MAX_SOURCE_CHANNELS;
use crate::library::map::{InstrumentMap, SharedReader};
use crate::util::filename_display;

/// Sleep between streamer ticks.
const TICK: Duration = Duration::from_millis(2);

/// Handle to the streamer thread. Stopping joins the thread; the engine
/// restarts a fresh streamer after every library swap.
pub struct DiskStreamer {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DiskStreamer {
    /// Spawns the streamer over the engine's voice handles. Voice indices
    /// are stable for the life of the engine.
    pub fn spawn(
        voices: Arc<Vec<Arc<VoiceShared>>>,
        map: Arc<RwLock<InstrumentMap>>,
        stats: Arc<EngineStats>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("msampler-streamer".into())
                .spawn(move || run(voices, map, stats, stop))
                .expect("failed to spawn streamer thread")
        };
        debug!("Disk streamer started");
        Self {
            stop,
            thread: Some(thread),
        }
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            debug!("Disk streamer stopped");
        }
    }
}

impl Drop for DiskStreamer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    voices: Arc<Vec<Arc<VoiceShared>>>,
    map: Arc<RwLock<InstrumentMap>>,
    stats: Arc<EngineStats>,
    stop: Arc<AtomicBool>,
) {
    promote_streamer_thread();

    let mut scratch = vec![0.0f32; STREAM_CHUNK_FRAMES * MAX_SOURCE_CHANNELS];
    let mut candidates: Vec<(usize, usize)> = Vec::with_capacity(voices.len());
    let mut window_start = Instant::now();
    let mut window_bytes = 0u64;

    while !stop.load(Ordering::Relaxed) {
        candidates.clear();
        for (index, voice) in voices.iter().enumerate() {
            if voice.is_active() && voice.needs_data() {
                candidates.push((voice.ring().available_to_read(), index));
            }
        }
        // Buffers closest to underrun are served first.
        candidates.sort_unstable();

        for &(_, index) in candidates.iter() {
            window_bytes += serve(&voices[index], &map, &mut scratch) as u64;
        }

        let elapsed = window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            stats.set_disk_bytes_per_sec((window_bytes as f64 / elapsed.as_secs_f64()) as u64);
            window_bytes = 0;
            window_start = Instant::now();
        }

        spin_sleep::sleep(TICK);
    }
}

/// Reads one chunk from the voice's file into its ring buffer. Returns the
/// number of bytes transferred.
fn serve(voice: &VoiceShared, map: &RwLock<InstrumentMap>, scratch: &mut [f32]) -> usize {
    let generation = voice.generation();
    let next = voice.next_fetch_frame();

    // Borrow immutable per-record data, then release the map lock before any
    // disk work.
    let (reader, path, channels, total_frames): (SharedReader, _, usize, u64) = {
        let map = map.read();
        let Some(record) = map.records().get(voice.record_index()) else {
            return 0;
        };
        (
            record.reader(),
            record.path().to_path_buf(),
            record.channels() as usize,
            record.total_frames(),
        )
    };

    if next >= total_frames {
        voice.mark_end_of_stream();
        return 0;
    }
    let want = STREAM_CHUNK_FRAMES
        .min(voice.ring().available_to_write())
        .min((total_frames - next) as usize);
    if want == 0 {
        return 0;
    }

    let mut guard = reader.lock();
    if guard.is_none() {
        // The record's reader was closed (for example by a preload
        // reconcile); reopen it for this stream.
        match open_file(&path) {
            Ok(opened) => *guard = Some(opened),
            Err(e) => {
                warn!(file = filename_display(&path), error = %e, "Failed to reopen sample for streaming");
                voice.mark_end_of_stream();
                return 0;
            }
        }
    }
    let reader = guard.as_mut().expect("reader just ensured");

    match reader.read_into(&mut scratch[..want * channels], next, want as u32) {
        Ok(0) => {
            voice.mark_end_of_stream();
            0
        }
        Ok(read) => {
            // The slot may have been re-armed for a different articulation
            // while we were on disk; if so the data belongs to a dead stream.
            if voice.generation() != generation || !voice.is_active() {
                return 0;
            }
            let written = voice
                .ring()
                .write(&scratch[..read as usize * channels], read as usize);
            voice.advance_fetch_frame(next + written as u64);
            if next + written as u64 >= total_frames {
                voice.mark_end_of_stream();
            }
            written * channels * std::mem::size_of::<f32>()
        }
        Err(e) => {
            warn!(file = filename_display(&path), error = %e, "Stream read failed");
            voice.mark_end_of_stream();
            0
        }
    }
}
