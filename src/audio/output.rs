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

use std::{error::Error, fmt};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{error, info};

use super::thread_priority::CallbackPriority;
use crate::sampler::SamplerEngine;

/// A small wrapper around a cpal::Device. Used for storing some extra data
/// that makes driving the sampler callback more convenient.
pub struct Device {
    /// The name of the device.
    name: String,
    /// The maximum number of channels the device supports.
    max_channels: u16,
    /// The host ID of the device.
    host_id: cpal::HostId,
    /// The underlying cpal device.
    device: cpal::Device,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (Channels={}) ({})",
            self.name,
            self.max_channels,
            self.host_id.name()
        )
    }
}

impl Device {
    /// Lists cpal output devices.
    pub fn list() -> Result<Vec<Device>, Box<dyn Error>> {
        let mut devices: Vec<Device> = Vec::new();
        for host_id in cpal::available_hosts() {
            let host_devices = cpal::host_from_id(host_id)?.devices()?;

            for device in host_devices {
                let mut max_channels = 0;
                for output_config in device.supported_output_configs()? {
                    if max_channels < output_config.channels() {
                        max_channels = output_config.channels();
                    }
                }

                if max_channels > 0 {
                    devices.push(Device {
                        name: device.name()?,
                        max_channels,
                        host_id,
                        device,
                    })
                }
            }
        }

        devices.sort_by_key(|device| device.name.to_string());
        Ok(devices)
    }

    /// Gets the given cpal device.
    pub fn get(name: &str) -> Result<Device, Box<dyn Error>> {
        match Device::list()?.into_iter().find(|device| device.name == name) {
            Some(device) => Ok(device),
            None => Err(format!("no device found with name {}", name).into()),
        }
    }

    /// Gets the host's default output device.
    pub fn default_device() -> Result<Device, Box<dyn Error>> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or("no default output device")?;
        let name = device.name()?;
        let mut max_channels = 0;
        for output_config in device.supported_output_configs()? {
            if max_channels < output_config.channels() {
                max_channels = output_config.channels();
            }
        }
        Ok(Device {
            name,
            max_channels,
            host_id: host.id(),
            device,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The device's preferred output sample rate; the engine must be built
    /// for this rate.
    pub fn default_sample_rate(&self) -> Result<u32, Box<dyn Error>> {
        Ok(self.device.default_output_config()?.sample_rate())
    }

    /// Builds and starts a stereo output stream that the engine renders
    /// into. The returned stream must be kept alive for playback to
    /// continue.
    pub fn run(
        &self,
        mut engine: SamplerEngine,
        sample_rate: u32,
    ) -> Result<cpal::Stream, Box<dyn Error>> {
        info!(
            device = self.name,
            sample_rate, "Starting audio output stream"
        );

        let mut priority = CallbackPriority::from_env();

        let stream = self.device.build_output_stream(
            &cpal::StreamConfig {
                channels: crate::audio::OUTPUT_CHANNELS as u16,
                sample_rate,
                buffer_size: cpal::BufferSize::Default,
            },
            move |data: &mut [f32], _| {
                priority.apply();
                engine.process_block(data);
            },
            |err: cpal::StreamError| {
                error!(err = err.to_string(), "Error during stream.");
            },
            None,
        )?;
        stream.play()?;

        Ok(stream)
    }
}
