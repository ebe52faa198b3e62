//! Archival file formats: bit-exact WAV and compressed Ogg Opus.

mod opus;
mod wav;

pub use opus::{OpusApplication, OpusConfig, OpusSink, OpusStats, OPUS_BITRATE_MAX, OPUS_BITRATE_MIN};
pub use wav::WavSink;
