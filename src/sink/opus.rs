//! Ogg Opus writer for the compressed archival sink.
//!
//! Grounded on `original_source/sink/opus_sink.c`: accumulates interleaved
//! float32 PCM in a FIFO and encodes fixed 20 ms frames regardless of the
//! caller's block size, muxed into Ogg pages via `ogg::writing::PacketWriter`
//! with hand-built OpusHead/OpusTags packets (the `ogg` crate has no opinion
//! on Opus payloads, so the headers are assembled byte-for-byte here).

use crate::error::{AudynError, Result};
use audiopus::coder::Encoder;
use audiopus::{Application, Bitrate, Channels, SampleRate};
use ogg::writing::{PacketWriteEndInfo, PacketWriter};
use rand::Rng;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

pub const OPUS_BITRATE_MIN: u32 = 6_000;
pub const OPUS_BITRATE_MAX: u32 = 510_000;
const FIFO_MAX_FRAMES: u32 = 48_000 * 10;
const PRESKIP_48K: u16 = 312;
const MAX_ENCODED_PACKET: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpusApplication {
    Voip,
    Audio,
    RestrictedLowDelay,
}

impl OpusApplication {
    fn to_audiopus(self) -> Application {
        match self {
            OpusApplication::Voip => Application::Voip,
            OpusApplication::Audio => Application::Audio,
            OpusApplication::RestrictedLowDelay => Application::LowDelay,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpusConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u32,
    pub vbr: bool,
    pub complexity: u8,
    pub application: OpusApplication,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OpusStats {
    pub frames_in: u64,
    pub frames_encoded: u64,
    pub packets_encoded: u64,
    pub bytes_encoded: u64,
    pub fifo_overflows: u64,
}

fn choose_frame_size(sample_rate: u32) -> u32 {
    sample_rate / 50
}

fn frame_size_is_valid(sample_rate: u32, frame_size: u32) -> bool {
    let a = sample_rate / 400;
    let b = sample_rate / 200;
    let c = sample_rate / 100;
    let d = sample_rate / 50;
    let e = sample_rate / 25;
    let f = sample_rate * 3 / 50;
    [a, b, c, d, e, f].contains(&frame_size)
}

fn frames_to_48k(frames: u32, sample_rate: u32) -> i64 {
    (frames as u64 * 48_000 / sample_rate as u64) as i64
}

fn make_serial() -> u32 {
    let mut r: u32 = rand::thread_rng().gen();
    if r == 0 {
        r = 1;
    }
    r
}

fn sample_rate_enum(sample_rate: u32) -> Option<SampleRate> {
    match sample_rate {
        8_000 => Some(SampleRate::Hz8000),
        12_000 => Some(SampleRate::Hz12000),
        16_000 => Some(SampleRate::Hz16000),
        24_000 => Some(SampleRate::Hz24000),
        48_000 => Some(SampleRate::Hz48000),
        _ => None,
    }
}

fn opus_head_packet(channels: u16, sample_rate: u32, preskip: u16) -> Vec<u8> {
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(b"OpusHead");
    head.push(1); // version
    head.push(channels as u8);
    head.extend_from_slice(&preskip.to_le_bytes());
    head.extend_from_slice(&sample_rate.to_le_bytes());
    head.extend_from_slice(&0u16.to_le_bytes()); // output gain
    head.push(0); // channel mapping family
    head
}

extern "C" {
    fn opus_get_version_string() -> *const std::os::raw::c_char;
}

/// Vendor string for the OpusTags packet, read from libopus itself
/// (`opus_get_version_string`), falling back to the literal `"libopus"`
/// if the library ever returns a null pointer.
fn opus_vendor_string() -> String {
    // SAFETY: `opus_get_version_string` takes no arguments and returns a
    // pointer to a static, NUL-terminated string owned by libopus.
    let ptr = unsafe { opus_get_version_string() };
    if ptr.is_null() {
        return "libopus".to_string();
    }
    // SAFETY: `ptr` was just checked non-null and is NUL-terminated by
    // libopus's own contract for this function.
    unsafe { std::ffi::CStr::from_ptr(ptr) }
        .to_string_lossy()
        .into_owned()
}

fn opus_tags_packet() -> Vec<u8> {
    let vendor = opus_vendor_string();
    let vendor = vendor.as_bytes();
    let comment = b"ENCODER=Audyn";
    let mut tags = Vec::with_capacity(8 + 4 + vendor.len() + 4 + 4 + comment.len());
    tags.extend_from_slice(b"OpusTags");
    tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    tags.extend_from_slice(vendor);
    tags.extend_from_slice(&1u32.to_le_bytes()); // one user comment
    tags.extend_from_slice(&(comment.len() as u32).to_le_bytes());
    tags.extend_from_slice(comment);
    tags
}

/// Non-real-time sink that encodes interleaved float32 PCM into an Ogg Opus
/// file. Input block sizes are arbitrary; frames are internally re-chunked
/// to the fixed 20 ms size Opus requires.
pub struct OpusSink {
    cfg: OpusConfig,
    encoder: Encoder,
    writer: PacketWriter<'static, BufWriter<File>>,
    serial: u32,
    frame_size: u32,
    encode_buf: Vec<u8>,
    fifo: Vec<f32>,
    granulepos_48k: i64,
    packetno_hint: u64,
    wrote_audio: bool,
    eos_written: bool,
    closed: bool,
    stats: OpusStats,
}

impl OpusSink {
    pub fn open(path: &Path, cfg: OpusConfig) -> Result<Self> {
        if !(cfg.channels == 1 || cfg.channels == 2) {
            return Err(AudynError::ConfigInvalid(format!(
                "opus sink requires 1 or 2 channels, got {}",
                cfg.channels
            )));
        }

        let sr_enum = sample_rate_enum(cfg.sample_rate).ok_or_else(|| {
            AudynError::ConfigInvalid(format!(
                "unsupported opus sample rate {} (must be 8000/12000/16000/24000/48000)",
                cfg.sample_rate
            ))
        })?;

        let frame_size = choose_frame_size(cfg.sample_rate);
        if !frame_size_is_valid(cfg.sample_rate, frame_size) {
            return Err(AudynError::ConfigInvalid(format!(
                "invalid opus frame size {} for sample rate {}",
                frame_size, cfg.sample_rate
            )));
        }

        let complexity = cfg.complexity.min(10);
        let bitrate = if cfg.bitrate == 0 {
            if cfg.channels == 1 {
                64_000
            } else {
                96_000
            }
        } else {
            cfg.bitrate.clamp(OPUS_BITRATE_MIN, OPUS_BITRATE_MAX)
        };
        let cfg = OpusConfig {
            bitrate,
            complexity,
            ..cfg
        };

        let channels = if cfg.channels == 1 {
            Channels::Mono
        } else {
            Channels::Stereo
        };

        let mut encoder = Encoder::new(sr_enum, channels, cfg.application.to_audiopus())
            .map_err(|e| AudynError::ConfigInvalid(format!("opus encoder init failed: {e}")))?;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(cfg.bitrate as i32))
            .map_err(|e| AudynError::ConfigInvalid(format!("opus set_bitrate failed: {e}")))?;
        encoder
            .set_vbr(cfg.vbr)
            .map_err(|e| AudynError::ConfigInvalid(format!("opus set_vbr failed: {e}")))?;
        encoder
            .set_complexity(complexity)
            .map_err(|e| AudynError::ConfigInvalid(format!("opus set_complexity failed: {e}")))?;

        let file = File::create(path).map_err(|e| AudynError::IoOpen {
            what: format!("Opus file {}", path.display()),
            source: e,
        })?;
        let writer = PacketWriter::new(BufWriter::new(file));
        let serial = make_serial();

        let mut sink = Self {
            cfg,
            encoder,
            writer,
            serial,
            frame_size,
            encode_buf: vec![0u8; MAX_ENCODED_PACKET],
            fifo: Vec::with_capacity(frame_size as usize * 2 * cfg.channels as usize),
            granulepos_48k: 0,
            packetno_hint: 0,
            wrote_audio: false,
            eos_written: false,
            closed: false,
            stats: OpusStats::default(),
        };

        sink.write_headers()?;
        Ok(sink)
    }

    fn write_headers(&mut self) -> Result<()> {
        let head = opus_head_packet(self.cfg.channels, self.cfg.sample_rate, PRESKIP_48K);
        self.writer
            .write_packet(head, self.serial, PacketWriteEndInfo::EndPage, 0)
            .map_err(|e| AudynError::IoWrite(format!("failed to write OpusHead: {e}")))?;
        self.packetno_hint += 1;

        let tags = opus_tags_packet();
        self.writer
            .write_packet(tags, self.serial, PacketWriteEndInfo::EndPage, 0)
            .map_err(|e| AudynError::IoWrite(format!("failed to write OpusTags: {e}")))?;
        self.packetno_hint += 1;

        self.granulepos_48k = -(PRESKIP_48K as i64);
        Ok(())
    }

    pub fn sample_rate(&self) -> u32 {
        self.cfg.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.cfg.channels
    }

    pub fn stats(&self) -> OpusStats {
        self.stats
    }

    /// Appends `frames` interleaved sample-frames to the FIFO and encodes
    /// every full 20 ms frame that becomes available. Rejects the write
    /// outright (hard error, not a silent drop) if it would push the FIFO
    /// past its ten-second cap.
    pub fn write(&mut self, interleaved: &[f32], frames: u32) -> Result<()> {
        if self.closed {
            return Err(AudynError::IoWrite("write on closed opus sink".into()));
        }
        if frames == 0 {
            return Ok(());
        }

        let channels = self.cfg.channels as usize;
        let samples = frames as usize * channels;
        if interleaved.len() < samples {
            return Err(AudynError::IoWrite(
                "write buffer shorter than frames * channels".into(),
            ));
        }

        let current_frames = (self.fifo.len() / channels) as u32;
        let new_len = current_frames
            .checked_add(frames)
            .ok_or_else(|| AudynError::IoWrite("opus FIFO length overflow".into()))?;
        if new_len > FIFO_MAX_FRAMES {
            self.stats.fifo_overflows += 1;
            return Err(AudynError::Backpressure(format!(
                "opus FIFO size limit exceeded (requested={}, max={})",
                new_len, FIFO_MAX_FRAMES
            )));
        }

        self.fifo.extend_from_slice(&interleaved[..samples]);
        self.stats.frames_in += frames as u64;

        while (self.fifo.len() / channels) as u32 >= self.frame_size {
            let take = self.frame_size as usize * channels;
            self.encode_and_submit(0..take, false)?;
            self.fifo.drain(0..take);
        }

        Ok(())
    }

    fn encode_and_submit(&mut self, range: std::ops::Range<usize>, is_final: bool) -> Result<()> {
        let nb = self
            .encoder
            .encode_float(&self.fifo[range], &mut self.encode_buf)
            .map_err(|e| AudynError::IoWrite(format!("opus encode failed: {e}")))?;

        self.granulepos_48k += frames_to_48k(self.frame_size, self.cfg.sample_rate);
        if self.granulepos_48k < 0 {
            self.granulepos_48k = 0;
        }

        let end_info = if is_final {
            PacketWriteEndInfo::EndStream
        } else {
            PacketWriteEndInfo::NormalPacket
        };

        self.writer
            .write_packet(
                self.encode_buf[..nb].to_vec(),
                self.serial,
                end_info,
                self.granulepos_48k as u64,
            )
            .map_err(|e| AudynError::IoWrite(format!("failed to write opus packet: {e}")))?;

        self.packetno_hint += 1;
        self.wrote_audio = true;
        if is_final {
            self.eos_written = true;
        }
        self.stats.frames_encoded += self.frame_size as u64;
        self.stats.packets_encoded += 1;
        self.stats.bytes_encoded += nb as u64;
        Ok(())
    }

    fn pad_and_encode_final(&mut self) -> Result<()> {
        let channels = self.cfg.channels as usize;
        if self.fifo.is_empty() {
            return Ok(());
        }
        let want = self.frame_size as usize * channels;
        self.fifo.resize(want, 0.0);
        self.encode_and_submit(0..want, true)?;
        self.fifo.clear();
        Ok(())
    }

    fn write_eos_marker(&mut self) -> Result<()> {
        if self.eos_written {
            return Ok(());
        }
        let granulepos = self.granulepos_48k.max(0) as u64;
        self.writer
            .write_packet(
                Vec::new(),
                self.serial,
                PacketWriteEndInfo::EndStream,
                granulepos,
            )
            .map_err(|e| AudynError::IoWrite(format!("failed to write opus EOS marker: {e}")))?;
        self.packetno_hint += 1;
        self.eos_written = true;
        Ok(())
    }

    /// Flushes any partial trailing frame (padded with silence), writes the
    /// end-of-stream marker if one hasn't been emitted yet, and finalizes
    /// the Ogg stream.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let _ = self.pad_and_encode_final();
        if self.wrote_audio && !self.eos_written {
            self.write_eos_marker()?;
        }
        self.closed = true;
        Ok(())
    }
}

impl Drop for OpusSink {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close_inner();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> OpusConfig {
        OpusConfig {
            sample_rate: 48_000,
            channels: 1,
            bitrate: 0,
            vbr: true,
            complexity: 5,
            application: OpusApplication::Audio,
        }
    }

    #[test]
    fn frame_size_is_960_at_48k() {
        assert_eq!(choose_frame_size(48_000), 960);
        assert!(frame_size_is_valid(48_000, 960));
    }

    #[test]
    fn frame_size_validity_matches_the_six_opus_windows() {
        assert!(frame_size_is_valid(48_000, 120)); // 2.5ms
        assert!(frame_size_is_valid(48_000, 2880)); // 60ms
        assert!(!frame_size_is_valid(48_000, 1000));
    }

    #[test]
    fn opus_head_layout_is_19_bytes_with_expected_fields() {
        let head = opus_head_packet(2, 48_000, 312);
        assert_eq!(head.len(), 19);
        assert_eq!(&head[0..8], b"OpusHead");
        assert_eq!(head[8], 1);
        assert_eq!(head[9], 2);
        assert_eq!(u16::from_le_bytes([head[10], head[11]]), 312);
        assert_eq!(
            u32::from_le_bytes([head[12], head[13], head[14], head[15]]),
            48_000
        );
    }

    #[test]
    fn opus_tags_layout_has_one_comment() {
        let tags = opus_tags_packet();
        assert_eq!(&tags[0..8], b"OpusTags");
        let vendor_len = u32::from_le_bytes(tags[8..12].try_into().unwrap()) as usize;
        assert!(vendor_len > 0);
        let after_vendor = 12 + vendor_len;
        let comment_count =
            u32::from_le_bytes(tags[after_vendor..after_vendor + 4].try_into().unwrap());
        assert_eq!(comment_count, 1);
        let comment_len = u32::from_le_bytes(
            tags[after_vendor + 4..after_vendor + 8].try_into().unwrap(),
        ) as usize;
        let comment_start = after_vendor + 8;
        assert_eq!(&tags[comment_start..comment_start + comment_len], b"ENCODER=Audyn");
    }

    #[test]
    fn opening_with_unsupported_sample_rate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.opus");
        let mut c = cfg();
        c.sample_rate = 44_100;
        assert!(OpusSink::open(&path, c).is_err());
    }

    #[test]
    fn write_then_close_produces_an_ogg_file_with_opushead() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.opus");
        let mut sink = OpusSink::open(&path, cfg()).unwrap();
        let samples = vec![0.0f32; 960 * 3];
        sink.write(&samples, 960 * 3).unwrap();
        sink.close().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"OggS");
        assert!(bytes.windows(8).any(|w| w == b"OpusHead"));
        assert!(bytes.windows(8).any(|w| w == b"OpusTags"));
    }

    #[test]
    fn fifo_overflow_is_a_hard_error_not_a_silent_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overflow.opus");
        let mut sink = OpusSink::open(&path, cfg()).unwrap();
        let huge = vec![0.0f32; FIFO_MAX_FRAMES as usize + 1];
        let err = sink.write(&huge, FIFO_MAX_FRAMES + 1);
        assert!(err.is_err());
        assert_eq!(sink.stats().fifo_overflows, 1);
    }
}
