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

use std::error::Error;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use msampler::audio::output;
use msampler::config::PersistedState;
use msampler::midi;
use msampler::sampler::SamplerEngine;
use msampler::util::megabytes;

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version,
    about = "A disk-streaming MIDI sampler."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available audio output devices.
    Devices {},
    /// Lists the available MIDI input devices.
    MidiDevices {},
    /// Plays an instrument folder live.
    Play {
        /// The path to the instrument folder. File names follow
        /// <Note>_<Velocity>_<RoundRobin>[_<suffix>].<ext>.
        folder: String,
        /// The audio output device name. Defaults to the system device.
        #[arg(short, long)]
        device: Option<String>,
        /// The MIDI input device name to listen to.
        #[arg(short, long)]
        midi_device: Option<String>,
        /// A persisted state file to restore before loading.
        #[arg(short, long)]
        state: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices {} => {
            let devices = output::Device::list()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::MidiDevices {} => {
            let devices = midi::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::Play {
            folder,
            device,
            midi_device,
            state,
        } => {
            let device = match device {
                Some(name) => output::Device::get(&name)?,
                None => output::Device::default_device()?,
            };
            let sample_rate = device.default_sample_rate()?;

            let (engine, handle) = SamplerEngine::new(sample_rate);

            if let Some(state_path) = state {
                let state = PersistedState::load(&PathBuf::from(state_path))?;
                handle.apply_state(&state);
            }

            let summary = handle.load_library_blocking(&PathBuf::from(&folder))?;
            info!(
                folder,
                records = summary.records,
                skipped = summary.skipped,
                library_mb = megabytes(summary.total_file_bytes),
                preload_mb = megabytes(summary.preload_bytes),
                "Instrument ready"
            );

            let _stream = device.run(engine, sample_rate)?;

            let _midi_input = match midi_device {
                Some(name) => {
                    let midi_input = midi::get_device(&name)?;
                    let events = handle.clone();
                    midi_input.watch_events(Box::new(move |raw| events.send_midi(raw, 0)))?;
                    Some(midi_input)
                }
                None => {
                    info!("No MIDI device given; listening for nothing. Use --midi-device.");
                    None
                }
            };

            loop {
                thread::sleep(Duration::from_secs(1));
                let obs = handle.observations();
                info!(
                    voices = obs.active_voices,
                    streaming = obs.streaming_voices,
                    disk_mb_per_sec = format!("{:.2}", obs.disk_mb_per_sec),
                    preload_mb = megabytes(obs.preload_bytes),
                    underruns = obs.underruns,
                    "status"
                );
            }
        }
    }

    Ok(())
}
