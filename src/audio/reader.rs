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

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};

/// Error types for opening and reading sample files.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("unsupported audio file: {0}")]
    Unsupported(String),

    #[error("decode error: {0}")]
    Decode(#[from] SymphoniaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Random access over the frames of one sample file.
///
/// Implementations report the file's native format and deliver interleaved
/// f32 frames starting at any frame position. The engine only ever calls
/// [`read_into`](AudioFileReader::read_into) from the disk-streaming thread
/// or the loader; the audio thread never touches a reader.
pub trait AudioFileReader: Send {
    /// The file's native sample rate.
    fn sample_rate(&self) -> u32;

    /// Number of channels in the file.
    fn channels(&self) -> u16;

    /// Total number of frames in the file.
    fn total_frames(&self) -> u64;

    /// Reads up to `frames` frames starting at `start_frame` into `dst` as
    /// interleaved f32 samples. Returns the number of frames actually read,
    /// which is short only at the end of the file.
    fn read_into(
        &mut self,
        dst: &mut [f32],
        start_frame: u64,
        frames: u32,
    ) -> Result<u32, ReaderError>;
}

/// Opens a sample file with the default symphonia-backed reader.
pub fn open_file(path: &Path) -> Result<Box<dyn AudioFileReader>, ReaderError> {
    Ok(Box::new(SymphoniaReader::open(path)?))
}

/// An [`AudioFileReader`] backed by symphonia's probe/decode pipeline.
/// Supports every format symphonia does (WAV, AIFF, FLAC, MP3, ...).
pub struct SymphoniaReader {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
    total_frames: u64,
    /// Source frame index the next decoded sample corresponds to.
    next_frame: u64,
    /// Decoded interleaved samples not yet handed out.
    pending: Vec<f32>,
    pending_offset: usize,
    sample_buf: Option<SampleBuffer<f32>>,
}

impl SymphoniaReader {
    /// Opens the file at the given path and probes its format.
    pub fn open(path: &Path) -> Result<Self, ReaderError> {
        let file = File::open(path).map_err(|e| {
            ReaderError::Io(std::io::Error::new(
                e.kind(),
                format!("{}: {}", path.display(), e),
            ))
        })?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(extension);
        }

        let probed = get_probe().format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| ReaderError::Unsupported(format!("{}: no audio track", path.display())))?;
        let track_id = track.id;
        let params = &track.codec_params;

        let sample_rate = params
            .sample_rate
            .ok_or_else(|| ReaderError::Unsupported(format!("{}: unknown sample rate", path.display())))?;
        let channels = params
            .channels
            .map(|c| c.count() as u16)
            .filter(|&c| c > 0)
            .ok_or_else(|| ReaderError::Unsupported(format!("{}: unknown channel count", path.display())))?;
        let total_frames = params
            .n_frames
            .ok_or_else(|| ReaderError::Unsupported(format!("{}: unknown length", path.display())))?;

        let decoder = get_codecs().make(params, &DecoderOptions::default())?;

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
            total_frames,
            next_frame: 0,
            pending: Vec::new(),
            pending_offset: 0,
            sample_buf: None,
        })
    }

    /// Decodes the next packet of our track into `pending`. Returns false at
    /// the end of the stream.
    fn decode_next_packet(&mut self) -> Result<bool, ReaderError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(false),
                Err(e) => return Err(e.into()),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let needed = decoded.capacity() * decoded.spec().channels.count();
                    if self
                        .sample_buf
                        .as_ref()
                        .map_or(true, |buf| buf.capacity() < needed)
                    {
                        self.sample_buf =
                            Some(SampleBuffer::new(decoded.capacity() as u64, *decoded.spec()));
                    }
                    let buf = self.sample_buf.as_mut().expect("sample buffer just sized");
                    buf.copy_interleaved_ref(decoded);
                    self.pending.clear();
                    self.pending.extend_from_slice(buf.samples());
                    self.pending_offset = 0;
                    return Ok(true);
                }
                // Skip over malformed packets the way symphonia recommends.
                Err(SymphoniaError::DecodeError(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Seeks so that the next decoded sample is at `frame`.
    fn seek_to(&mut self, frame: u64) -> Result<(), ReaderError> {
        let seeked = self.format.seek(
            SeekMode::Accurate,
            SeekTo::TimeStamp {
                ts: frame,
                track_id: self.track_id,
            },
        )?;
        self.decoder.reset();
        self.pending.clear();
        self.pending_offset = 0;
        self.next_frame = seeked.actual_ts;

        // Accurate seeks can land on a packet boundary before the target;
        // discard up to the requested frame.
        let mut to_skip = frame.saturating_sub(seeked.actual_ts) as usize * self.channels as usize;
        while to_skip > 0 {
            if self.pending_offset >= self.pending.len() && !self.decode_next_packet()? {
                break;
            }
            let available = self.pending.len() - self.pending_offset;
            let skipped = available.min(to_skip);
            self.pending_offset += skipped;
            to_skip -= skipped;
            self.next_frame += (skipped / self.channels as usize) as u64;
        }
        Ok(())
    }
}

impl AudioFileReader for SymphoniaReader {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn total_frames(&self) -> u64 {
        self.total_frames
    }

    fn read_into(
        &mut self,
        dst: &mut [f32],
        start_frame: u64,
        frames: u32,
    ) -> Result<u32, ReaderError> {
        let channels = self.channels as usize;
        let frames = (frames as usize).min(dst.len() / channels);

        if start_frame != self.next_frame {
            self.seek_to(start_frame)?;
        }

        let mut written = 0usize;
        let wanted = frames * channels;
        while written < wanted {
            if self.pending_offset >= self.pending.len() {
                if !self.decode_next_packet()? {
                    break;
                }
            }
            let available = self.pending.len() - self.pending_offset;
            let take = available.min(wanted - written);
            dst[written..written + take]
                .copy_from_slice(&self.pending[self.pending_offset..self.pending_offset + take]);
            self.pending_offset += take;
            written += take;
        }

        let whole_frames = written / channels;
        self.next_frame += whole_frames as u64;
        Ok(whole_frames as u32)
    }
}
