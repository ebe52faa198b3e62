//! Bit-exact RIFF/WAVE (PCM16) writer.
//!
//! Grounded on `original_source/sink/wav_sink.c`: a 44-byte header with
//! placeholder sizes written up front, patched on close, and a hard
//! classic-WAV 4 GiB data-chunk limit enforced before any byte of an
//! over-limit write is emitted — never a silent truncation.

use crate::error::{AudynError, Result};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

const HEADER_LEN: u64 = 44;
const MAX_DATA_SIZE: u64 = 0xFFFF_FFFF;
const WRITE_CHUNK_FRAMES: usize = 4096;

pub struct WavSink {
    file: File,
    sample_rate: u32,
    channels: u16,
    bytes_written: u64,
    closed: bool,
}

fn f32_to_i16(x: f32) -> i16 {
    let clamped = x.clamp(-1.0, 1.0);
    let v = (clamped * 32767.0) as i32;
    v.clamp(-32768, 32767) as i16
}

impl WavSink {
    /// Opens `path` and writes the 44-byte placeholder header.
    pub fn open(path: &Path, sample_rate: u32, channels: u16) -> Result<Self> {
        if sample_rate == 0 || channels == 0 {
            return Err(AudynError::ConfigInvalid(
                "wav sink requires non-zero sample_rate and channels".into(),
            ));
        }

        let mut file = File::create(path).map_err(|e| AudynError::IoOpen {
            what: format!("WAV file {}", path.display()),
            source: e,
        })?;

        write_header_placeholder(&mut file, sample_rate, channels)
            .map_err(|e| AudynError::IoWrite(format!("failed to write WAV header: {e}")))?;

        Ok(Self {
            file,
            sample_rate,
            channels,
            bytes_written: 0,
            closed: false,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Writes `frames` interleaved sample-frames (each `channels` wide).
    /// Rejects (without writing any bytes) a write that would push the
    /// data chunk past the classic WAV 4 GiB limit.
    pub fn write(&mut self, interleaved: &[f32], frames: u32) -> Result<()> {
        if frames == 0 {
            return Ok(());
        }

        let samples = frames as usize * self.channels as usize;
        if interleaved.len() < samples {
            return Err(AudynError::IoWrite(
                "write buffer shorter than frames * channels".into(),
            ));
        }

        let add_bytes = samples as u64 * 2;
        if self.bytes_written + add_bytes > MAX_DATA_SIZE {
            return Err(AudynError::IoWrite(
                "WAV 4 GiB data-chunk limit exceeded".into(),
            ));
        }

        let mut tmp = [0u8; WRITE_CHUNK_FRAMES * 2];
        let mut i = 0;
        while i < samples {
            let n = (samples - i).min(WRITE_CHUNK_FRAMES);
            for j in 0..n {
                let s = f32_to_i16(interleaved[i + j]);
                let b = s.to_le_bytes();
                tmp[j * 2] = b[0];
                tmp[j * 2 + 1] = b[1];
            }
            self.file
                .write_all(&tmp[..n * 2])
                .map_err(|e| AudynError::IoWrite(format!("WAV write failed: {e}")))?;
            self.bytes_written += (n * 2) as u64;
            i += n;
        }

        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| AudynError::IoWrite(format!("WAV fsync failed: {e}")))
    }

    /// Patches the RIFF and data-chunk sizes and closes the file.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.file
            .flush()
            .map_err(|e| AudynError::IoWrite(format!("WAV flush failed: {e}")))?;

        if self.bytes_written > MAX_DATA_SIZE {
            return Err(AudynError::IoWrite("WAV size limit exceeded".into()));
        }
        let data_size = self.bytes_written as u32;
        let riff_size = 4u32 + (8 + 16) + (8 + data_size);

        self.file
            .seek(SeekFrom::Start(4))
            .map_err(|e| AudynError::IoWrite(format!("seek to RIFF size failed: {e}")))?;
        self.file
            .write_all(&riff_size.to_le_bytes())
            .map_err(|e| AudynError::IoWrite(format!("patch RIFF size failed: {e}")))?;

        self.file
            .seek(SeekFrom::Start(40))
            .map_err(|e| AudynError::IoWrite(format!("seek to data size failed: {e}")))?;
        self.file
            .write_all(&data_size.to_le_bytes())
            .map_err(|e| AudynError::IoWrite(format!("patch data size failed: {e}")))?;

        self.file
            .flush()
            .map_err(|e| AudynError::IoWrite(format!("WAV flush after patch failed: {e}")))?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for WavSink {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close_inner();
        }
    }
}

fn write_header_placeholder(file: &mut File, sample_rate: u32, channels: u16) -> std::io::Result<()> {
    file.write_all(b"RIFF")?;
    file.write_all(&0u32.to_le_bytes())?; // riff size placeholder
    file.write_all(b"WAVE")?;

    file.write_all(b"fmt ")?;
    file.write_all(&16u32.to_le_bytes())?;
    file.write_all(&1u16.to_le_bytes())?; // PCM
    file.write_all(&channels.to_le_bytes())?;
    file.write_all(&sample_rate.to_le_bytes())?;

    let bits = 16u16;
    let byte_rate = sample_rate * channels as u32 * (bits / 8) as u32;
    let block_align = channels * (bits / 8);

    file.write_all(&byte_rate.to_le_bytes())?;
    file.write_all(&block_align.to_le_bytes())?;
    file.write_all(&bits.to_le_bytes())?;

    file.write_all(b"data")?;
    file.write_all(&0u32.to_le_bytes())?; // data size placeholder

    debug_assert_eq!(file.stream_position()?, HEADER_LEN);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_data_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let mut sink = WavSink::open(&path, 48000, 2).unwrap();
        sink.write(&[0.5, -0.5, 1.0, -1.0], 2).unwrap();
        sink.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WAVE");
        let riff_size = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(riff_size as usize, bytes.len() - 8);
        let data_size = u32::from_le_bytes(bytes[40..44].try_into().unwrap());
        assert_eq!(data_size, 8);
        assert_eq!(bytes.len(), HEADER_LEN as usize + 8);
    }

    #[test]
    fn clamps_out_of_range_samples() {
        assert_eq!(f32_to_i16(2.0), 32767);
        assert_eq!(f32_to_i16(-2.0), -32768);
        assert_eq!(f32_to_i16(1.0), 32767);
    }

    #[test]
    fn size_limit_is_never_silently_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.wav");
        let mut sink = WavSink::open(&path, 48000, 1).unwrap();
        sink.bytes_written = MAX_DATA_SIZE - 2;
        let err = sink.write(&[0.0, 0.0], 2);
        assert!(err.is_err());
        assert_eq!(sink.bytes_written, MAX_DATA_SIZE - 2);
    }
}
