//! RIFF/WAVE reader for 16-bit PCM.
//!
//! The header is parsed up front; unknown chunks before `data` are skipped. Samples are
//! then pulled one frame per call, so the source suits a step-driven consumer that asks
//! for exactly one sample per step.

use crate::{Result, SoundError};
use spikesim_core::{SignalError, SignalSource, Time};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::Path;
use tracing::{debug, info};

const PCM: u16 = 1;
const FULL_SCALE: f64 = 32767.0;

/// Format of the `fmt ` chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavSpec {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl WavSpec {
    pub fn block_align(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }
}

fn read_exact<R: Read, const N: usize>(reader: &mut R, what: &str) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => SoundError::InvalidFormat(format!("truncated {}", what)),
        _ => SoundError::Io(e),
    })?;
    Ok(buf)
}

fn read_u16<R: Read>(reader: &mut R, what: &str) -> Result<u16> {
    Ok(u16::from_le_bytes(read_exact::<R, 2>(reader, what)?))
}

fn read_u32<R: Read>(reader: &mut R, what: &str) -> Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<R, 4>(reader, what)?))
}

fn skip<R: Read>(reader: &mut R, len: u64, what: &str) -> Result<()> {
    let skipped = std::io::copy(&mut reader.by_ref().take(len), &mut std::io::sink())?;
    if skipped != len {
        return Err(SoundError::InvalidFormat(format!("truncated {}", what)));
    }
    Ok(())
}

fn read_fmt<R: Read>(reader: &mut R, len: u32) -> Result<WavSpec> {
    if len < 16 {
        return Err(SoundError::InvalidFormat(format!("fmt chunk of {} bytes", len)));
    }
    let tag = read_u16(reader, "fmt chunk")?;
    let channels = read_u16(reader, "fmt chunk")?;
    let sample_rate = read_u32(reader, "fmt chunk")?;
    let byte_rate = read_u32(reader, "fmt chunk")?;
    let block_align = read_u16(reader, "fmt chunk")?;
    let bits_per_sample = read_u16(reader, "fmt chunk")?;

    if tag != PCM {
        return Err(SoundError::Unsupported(format!("format tag {} (only PCM)", tag)));
    }
    if bits_per_sample != 16 {
        return Err(SoundError::Unsupported(format!("{} bits per sample (only 16)", bits_per_sample)));
    }
    if channels == 0 || sample_rate == 0 {
        return Err(SoundError::InvalidFormat(format!("{} channels at {} Hz", channels, sample_rate)));
    }
    let spec = WavSpec { channels, sample_rate, bits_per_sample };
    if block_align as usize != spec.block_align() || byte_rate as usize != sample_rate as usize * spec.block_align() {
        return Err(SoundError::InvalidFormat(format!(
            "inconsistent block align {} / byte rate {}",
            block_align, byte_rate
        )));
    }
    // extension bytes (cbSize and friends), then the pad byte of an odd-length chunk
    skip(reader, (len - 16) as u64 + (len as u64 & 1), "fmt extension")?;
    Ok(spec)
}

/// Sequential PCM16 source returning the first channel scaled to [-1, 1]
pub struct WavSource<R> {
    reader: R,
    spec: WavSpec,
    /// Bytes left in the data chunk
    remaining: u64,
    frame: Vec<u8>,
    samples: u64,
}

impl WavSource<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let source = Self::new(BufReader::new(File::open(path)?))?;
        info!(
            path = %path.display(),
            sample_rate = source.spec.sample_rate,
            channels = source.spec.channels,
            seconds = source.duration(),
            "opened WAV file"
        );
        Ok(source)
    }
}

impl<R: Read> WavSource<R> {
    /// Parse the header and position the reader at the first sample
    pub fn new(mut reader: R) -> Result<Self> {
        if &read_exact::<R, 4>(&mut reader, "RIFF header")? != b"RIFF" {
            return Err(SoundError::InvalidFormat("missing RIFF tag".into()));
        }
        let _riff_len = read_u32(&mut reader, "RIFF header")?;
        if &read_exact::<R, 4>(&mut reader, "RIFF header")? != b"WAVE" {
            return Err(SoundError::InvalidFormat("missing WAVE tag".into()));
        }

        let mut spec = None;
        loop {
            let name = read_exact::<R, 4>(&mut reader, "chunk header")?;
            let len = read_u32(&mut reader, "chunk header")?;
            match &name {
                b"fmt " => spec = Some(read_fmt(&mut reader, len)?),
                b"data" => {
                    let spec = spec.ok_or_else(|| SoundError::InvalidFormat("data chunk before fmt chunk".into()))?;
                    debug!(?spec, data_bytes = len, "parsed WAV header");
                    return Ok(Self {
                        reader,
                        spec,
                        remaining: len as u64,
                        frame: vec![0; spec.block_align()],
                        samples: 0,
                    });
                }
                other => {
                    debug!(chunk = %String::from_utf8_lossy(other), len, "skipping WAV chunk");
                    // chunks are padded to an even length
                    skip(&mut reader, len as u64 + (len as u64 & 1), "chunk")?;
                }
            }
        }
    }

    pub fn spec(&self) -> WavSpec {
        self.spec
    }

    /// Length of the data chunk (s)
    pub fn duration(&self) -> f64 {
        let frames = (self.remaining + self.samples * self.spec.block_align() as u64) / self.spec.block_align() as u64;
        frames as f64 / self.spec.sample_rate as f64
    }

    pub fn samples_read(&self) -> u64 {
        self.samples
    }
}

impl<R: Read> SignalSource for WavSource<R> {
    fn sample(&mut self, _t: Time) -> std::result::Result<f64, SignalError> {
        if self.remaining < self.frame.len() as u64 {
            return Err(SignalError::Exhausted { samples: self.samples });
        }
        match self.reader.read_exact(&mut self.frame) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.remaining = 0;
                return Err(SignalError::Exhausted { samples: self.samples });
            }
            Err(e) => return Err(SignalError::Read(e.to_string())),
        }
        self.remaining -= self.frame.len() as u64;
        self.samples += 1;
        let first = i16::from_le_bytes([self.frame[0], self.frame[1]]);
        Ok(first as f64 / FULL_SCALE)
    }
}

/// Write interleaved 16-bit PCM frames as a minimal WAV file
pub fn write_pcm16<W: Write>(mut writer: W, sample_rate: u32, channels: u16, samples: &[i16]) -> Result<()> {
    if channels == 0 || samples.len() % channels as usize != 0 {
        return Err(SoundError::InvalidFormat(format!(
            "{} samples do not fill {} channels",
            samples.len(),
            channels
        )));
    }
    let block_align = channels as u32 * 2;
    let data_len = samples.len() as u32 * 2;
    writer.write_all(b"RIFF")?;
    writer.write_all(&(36 + data_len).to_le_bytes())?;
    writer.write_all(b"WAVE")?;
    writer.write_all(b"fmt ")?;
    writer.write_all(&16u32.to_le_bytes())?;
    writer.write_all(&PCM.to_le_bytes())?;
    writer.write_all(&channels.to_le_bytes())?;
    writer.write_all(&sample_rate.to_le_bytes())?;
    writer.write_all(&(sample_rate * block_align).to_le_bytes())?;
    writer.write_all(&(block_align as u16).to_le_bytes())?;
    writer.write_all(&16u16.to_le_bytes())?;
    writer.write_all(b"data")?;
    writer.write_all(&data_len.to_le_bytes())?;
    for s in samples {
        writer.write_all(&s.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}
