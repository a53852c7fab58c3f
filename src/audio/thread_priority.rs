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

//! Scheduling for the engine's two deadline-bound threads.
//!
//! The audio callback has a hard deadline every block, so on Unix it asks
//! for realtime SCHED_FIFO scheduling (opt out with
//! `MSAMPLER_DISABLE_RT_AUDIO=1`, tune with `MSAMPLER_THREAD_PRIORITY`).
//! The disk streamer's deadlines are soft: a streaming voice survives on its
//! ring buffer for hundreds of milliseconds, so the streamer gets an
//! elevated but non-realtime priority and must stay below the callback.

use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
use tracing::{debug, info, warn};

/// Priority for the audio callback when MSAMPLER_THREAD_PRIORITY is unset.
const AUDIO_CALLBACK_PRIORITY: u8 = 70;

/// Priority for the disk streamer: above ordinary threads, below the
/// callback.
const DISK_STREAMER_PRIORITY: u8 = 55;

/// One-shot promotion of the audio callback thread. cpal owns that thread
/// and we never see it before the first callback, so the promotion is
/// carried into the callback and applied on its first invocation.
pub struct CallbackPriority {
    priority: u8,
    rt_fifo: bool,
    applied: bool,
}

impl CallbackPriority {
    /// Reads MSAMPLER_THREAD_PRIORITY (0-99) and MSAMPLER_DISABLE_RT_AUDIO
    /// once, so the hot path never touches the environment.
    pub fn from_env() -> Self {
        let requested = std::env::var("MSAMPLER_THREAD_PRIORITY")
            .ok()
            .and_then(|v| v.parse::<u8>().ok());
        Self::new(requested, !env_flag("MSAMPLER_DISABLE_RT_AUDIO"))
    }

    fn new(requested: Option<u8>, rt_fifo: bool) -> Self {
        Self {
            priority: requested
                .filter(|n| *n < 100)
                .unwrap_or(AUDIO_CALLBACK_PRIORITY),
            rt_fifo,
            applied: false,
        }
    }

    /// Promotes the calling thread. Every callback invocation may call this;
    /// only the first does any work.
    pub fn apply(&mut self) {
        if self.applied {
            return;
        }
        self.applied = true;

        let Ok(value) = ThreadPriorityValue::try_from(self.priority) else {
            return;
        };
        let priority = ThreadPriority::Crossplatform(value);
        let _ = set_current_thread_priority(priority);

        #[cfg(unix)]
        if self.rt_fifo {
            use thread_priority::unix::{
                set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
                ThreadSchedulePolicy,
            };
            match set_thread_priority_and_policy(
                thread_native_id(),
                priority,
                ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
            ) {
                Ok(()) => {
                    info!(
                        priority = self.priority,
                        "Audio callback running with RT SCHED_FIFO"
                    );
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        "Could not get RT scheduling for the audio callback; continuing without"
                    );
                }
            }
        }
    }
}

/// Best-effort elevation for the disk streamer thread. A refusal (for
/// example from an unprivileged container) only costs refill headroom, so it
/// is logged at debug and otherwise ignored.
pub fn promote_streamer_thread() {
    let Ok(value) = ThreadPriorityValue::try_from(DISK_STREAMER_PRIORITY) else {
        return;
    };
    if set_current_thread_priority(ThreadPriority::Crossplatform(value)).is_err() {
        debug!("Could not raise disk streamer thread priority");
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| {
            v == "1"
                || v.eq_ignore_ascii_case("true")
                || v.eq_ignore_ascii_case("yes")
                || v.eq_ignore_ascii_case("on")
        })
        .unwrap_or(false)
}
