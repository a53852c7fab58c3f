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

use std::{
    error::Error,
    path::Path,
    thread,
    time::{Duration, SystemTime},
};

use hound::{SampleFormat, WavSpec, WavWriter};

/// Writes a 16-bit WAV whose every sample in frame `i` holds the value `i`,
/// so decoded f32 samples equal `i / 32768`. Frame counts must stay below
/// 32768 to remain unambiguous.
pub fn write_ramp_wav(
    path: &Path,
    frames: u32,
    channels: u16,
    sample_rate: u32,
) -> Result<(), Box<dyn Error>> {
    assert!(frames < 32768, "ramp fixture would overflow i16");
    let mut writer = WavWriter::create(
        path,
        WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        },
    )?;

    for frame in 0..frames {
        for _ in 0..channels {
            writer.write_sample(frame as i16)?;
        }
    }
    writer.finalize()?;

    Ok(())
}

/// Writes a constant-valued 16-bit WAV. Useful when a test only cares about
/// envelope or mixing behavior rather than which frame was read.
pub fn write_constant_wav(
    path: &Path,
    value: i16,
    frames: u32,
    channels: u16,
    sample_rate: u32,
) -> Result<(), Box<dyn Error>> {
    let mut writer = WavWriter::create(
        path,
        WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        },
    )?;

    for _ in 0..frames {
        for _ in 0..channels {
            writer.write_sample(value)?;
        }
    }
    writer.finalize()?;

    Ok(())
}

/// Wait for the given predicate to return true or fail.
#[inline]
pub fn eventually<F>(predicate: F, error_msg: &str)
where
    F: Fn() -> bool,
{
    let start = SystemTime::now();
    let tick = Duration::from_millis(10);
    let timeout = Duration::from_secs(5);

    loop {
        let elapsed = start.elapsed().expect("System time error");

        if elapsed > timeout {
            panic!("{}", error_msg);
        }
        if predicate() {
            return;
        }
        thread::sleep(tick);
    }
}
