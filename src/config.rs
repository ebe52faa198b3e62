//! CLI surface and validated configuration.
//!
//! `Cli` is the thin `clap`-derived outer layer: argument parsing alone,
//! no validation. `Config::validate()` is the boundary where
//! `AudynError::ConfigInvalid` is raised for anything the core itself
//! would otherwise have to reject at construction time.

use crate::archive::{ArchiveClock, ArchiveConfig, ArchiveLayout, DEFAULT_ROTATION_PERIOD_SEC};
use crate::error::{AudynError, Result};
use crate::ptp::{PtpConfig, PtpMode};
use crate::receiver::ReceiverConfig;
use crate::sink::{OpusApplication, OpusConfig};
use crate::worker::{Format, OutputKind, WorkerConfig};
use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_POOL_FRAMES: u32 = 64;
const DEFAULT_QUEUE_CAPACITY: u32 = 64;
const DEFAULT_IDLE_SLEEP_MS: u64 = crate::worker::DEFAULT_IDLE_SLEEP.as_millis() as u64;

#[derive(Parser, Debug)]
#[command(name = "audyn", about = "Professional audio capture and archival engine")]
pub struct Cli {
    /// Input source. Only "aes67" is implemented; local capture is a
    /// separate producer outside this core's scope.
    #[arg(long, default_value = "aes67")]
    pub input: String,

    /// AES67 source multicast/unicast IPv4 address.
    #[arg(long, default_value = "239.69.1.1")]
    pub source: Ipv4Addr,

    /// UDP port.
    #[arg(long, default_value_t = 5004)]
    pub port: u16,

    /// RTP payload type to accept.
    #[arg(long, default_value_t = 96)]
    pub payload_type: u8,

    /// Samples per packet (per channel).
    #[arg(long, default_value_t = 48)]
    pub samples_per_packet: u32,

    /// Socket receive buffer size in bytes.
    #[arg(long)]
    pub recv_buffer_bytes: Option<usize>,

    /// Interface address to join the multicast group on.
    #[arg(long)]
    pub bind_interface: Option<Ipv4Addr>,

    /// First source channel to extract (0-based).
    #[arg(long, default_value_t = 0)]
    pub channel_offset: u32,

    /// Number of interleaved channels present in the RTP stream.
    #[arg(long)]
    pub stream_channels: Option<u32>,

    /// Output sample rate.
    #[arg(long, default_value_t = 48000)]
    pub sample_rate: u32,

    /// Output channel count (1 or 2).
    #[arg(long, default_value_t = 2)]
    pub channels: u16,

    /// Jitter buffer target depth in milliseconds.
    #[arg(long, default_value_t = 20)]
    pub jitter_depth_ms: u32,

    /// Use a specific PHC device (e.g. /dev/ptp0).
    #[arg(long)]
    pub ptp_device: Option<String>,

    /// Discover the PHC device for this network interface (e.g. eth0).
    #[arg(long)]
    pub ptp_interface: Option<String>,

    /// Use the system realtime clock instead of a hardware PHC.
    #[arg(long, default_value_t = false)]
    pub ptp_software: bool,

    /// Single output file. Suffix (.wav/.opus) selects the sink format.
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Root directory for rotating archive output.
    #[arg(long)]
    pub archive_root: Option<PathBuf>,

    /// Archive naming layout.
    #[arg(long, default_value = "flat")]
    pub archive_layout: String,

    /// Custom strftime-style format (only with --archive-layout custom).
    #[arg(long)]
    pub archive_format: Option<String>,

    /// Rotation period in seconds; 0 disables rotation.
    #[arg(long, default_value_t = DEFAULT_ROTATION_PERIOD_SEC)]
    pub archive_period: u32,

    /// Clock source for rotation boundaries.
    #[arg(long, default_value = "localtime")]
    pub archive_clock: String,

    /// File suffix/extension for archive output.
    #[arg(long)]
    pub archive_suffix: Option<String>,

    /// Opus bitrate in bits per second; 0 selects the mono/stereo default.
    #[arg(long, default_value_t = 0)]
    pub opus_bitrate: u32,

    /// Use variable bitrate encoding.
    #[arg(long, default_value_t = true)]
    pub opus_vbr: bool,

    /// Opus encoder complexity, 0-10.
    #[arg(long, default_value_t = 5)]
    pub opus_complexity: u8,

    /// Opus application profile: voip, audio, or lowdelay.
    #[arg(long, default_value = "audio")]
    pub opus_application: String,

    /// Frame queue capacity (usable slots = capacity - 1).
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: u32,

    /// Number of pre-allocated pool frames.
    #[arg(long, default_value_t = DEFAULT_POOL_FRAMES)]
    pub pool_frames: u32,

    /// Worker idle-sleep interval in milliseconds when the queue is empty.
    #[arg(long, default_value_t = DEFAULT_IDLE_SLEEP_MS)]
    pub idle_sleep_ms: u64,
}

/// Everything `Pipeline::new` needs, already validated.
pub struct Config {
    pub pool_frames: u32,
    pub queue_capacity: u32,
    pub channels: u32,
    pub samples_per_packet: u32,
    pub ptp: PtpConfig,
    pub receiver: ReceiverConfig,
    pub worker: WorkerConfig,
}

impl Cli {
    pub fn validate(self) -> Result<Config> {
        if self.input != "aes67" {
            return Err(AudynError::ConfigInvalid(format!(
                "unsupported input '{}': only 'aes67' is implemented by this core",
                self.input
            )));
        }

        if !(self.channels == 1 || self.channels == 2) {
            return Err(AudynError::ConfigInvalid(format!(
                "channels must be 1 or 2, got {}",
                self.channels
            )));
        }

        let ptp_selectors = [
            self.ptp_device.is_some(),
            self.ptp_interface.is_some(),
            self.ptp_software,
        ]
        .into_iter()
        .filter(|x| *x)
        .count();
        if ptp_selectors > 1 {
            return Err(AudynError::ConfigInvalid(
                "at most one of --ptp-device, --ptp-interface, --ptp-software may be given".into(),
            ));
        }

        let ptp = if let Some(device) = &self.ptp_device {
            PtpConfig {
                mode: PtpMode::Hardware,
                phc_device: Some(device.clone()),
                interface: None,
            }
        } else if let Some(interface) = &self.ptp_interface {
            PtpConfig {
                mode: PtpMode::Hardware,
                phc_device: None,
                interface: Some(interface.clone()),
            }
        } else if self.ptp_software {
            PtpConfig {
                mode: PtpMode::Software,
                phc_device: None,
                interface: None,
            }
        } else {
            PtpConfig {
                mode: PtpMode::None,
                phc_device: None,
                interface: None,
            }
        };

        if self.output.is_none() && self.archive_root.is_none() {
            return Err(AudynError::ConfigInvalid(
                "either -o FILE or --archive-root DIR must be given".into(),
            ));
        }
        if self.output.is_some() && self.archive_root.is_some() {
            return Err(AudynError::ConfigInvalid(
                "-o FILE and --archive-root DIR are mutually exclusive".into(),
            ));
        }

        let stream_channels = self.stream_channels.unwrap_or(self.channels as u32);
        if self.channel_offset + self.channels as u32 > stream_channels {
            return Err(AudynError::ConfigInvalid(format!(
                "channel window [{}, {}) exceeds stream width {}",
                self.channel_offset,
                self.channel_offset + self.channels as u32,
                stream_channels
            )));
        }

        let application = match self.opus_application.as_str() {
            "voip" => OpusApplication::Voip,
            "audio" => OpusApplication::Audio,
            "lowdelay" => OpusApplication::RestrictedLowDelay,
            other => {
                return Err(AudynError::ConfigInvalid(format!(
                    "unknown opus application '{other}' (expected voip/audio/lowdelay)"
                )))
            }
        };
        let opus_cfg = OpusConfig {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bitrate: self.opus_bitrate,
            vbr: self.opus_vbr,
            complexity: self.opus_complexity,
            application,
        };

        let (output, format) = if let Some(path) = &self.output {
            let suffix = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase());
            let format = match suffix.as_deref() {
                Some("wav") => Format::Wav,
                Some("opus") => Format::Opus(opus_cfg),
                other => {
                    return Err(AudynError::ConfigInvalid(format!(
                        "output file must end in .wav or .opus, got {:?}",
                        other
                    )))
                }
            };
            (OutputKind::SingleFile(path.clone()), format)
        } else {
            let root_dir = self.archive_root.clone().unwrap();
            let layout = ArchiveLayout::from_str_name(&self.archive_layout).ok_or_else(|| {
                AudynError::ConfigInvalid(format!(
                    "unknown archive layout '{}'",
                    self.archive_layout
                ))
            })?;
            let clock_source = ArchiveClock::from_str_name(&self.archive_clock).ok_or_else(|| {
                AudynError::ConfigInvalid(format!(
                    "unknown archive clock '{}'",
                    self.archive_clock
                ))
            })?;
            let suffix = self
                .archive_suffix
                .clone()
                .unwrap_or_else(|| if self.opus_bitrate > 0 { "opus" } else { "wav" }.to_string());
            let format = if suffix == "opus" {
                Format::Opus(opus_cfg)
            } else {
                Format::Wav
            };

            let archive_cfg = ArchiveConfig {
                root_dir,
                suffix,
                layout,
                custom_format: self.archive_format.clone(),
                rotation_period_sec: self.archive_period,
                clock_source,
                create_directories: true,
            };
            let policy = crate::archive::ArchivePolicy::new(archive_cfg)?;
            (OutputKind::Archive(policy), format)
        };

        let receiver = ReceiverConfig {
            multicast_addr: self.source,
            port: self.port,
            interface: self.bind_interface,
            payload_type: self.payload_type,
            sample_rate: self.sample_rate,
            stream_channels,
            channel_offset: self.channel_offset,
            out_channels: self.channels as u32,
            samples_per_packet: self.samples_per_packet,
            jitter_depth_ms: self.jitter_depth_ms,
            recv_buffer_bytes: self.recv_buffer_bytes,
        };

        let worker = WorkerConfig {
            sample_rate: self.sample_rate,
            channels: self.channels,
            output,
            format,
            idle_sleep: Duration::from_millis(self.idle_sleep_ms),
        };

        Ok(Config {
            pool_frames: self.pool_frames,
            queue_capacity: self.queue_capacity,
            channels: self.channels as u32,
            samples_per_packet: self.samples_per_packet,
            ptp,
            receiver,
            worker,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args(extra: &[&str]) -> Vec<String> {
        let mut v = vec!["audyn".to_string(), "-o".to_string(), "/tmp/out.wav".to_string()];
        v.extend(extra.iter().map(|s| s.to_string()));
        v
    }

    #[test]
    fn minimal_single_file_config_validates() {
        let cli = Cli::parse_from(base_args(&[]));
        let cfg = cli.validate().unwrap();
        assert_eq!(cfg.receiver.port, 5004);
    }

    #[test]
    fn mutually_exclusive_output_selectors_rejected() {
        let args = vec![
            "audyn".to_string(),
            "-o".to_string(),
            "/tmp/out.wav".to_string(),
            "--archive-root".to_string(),
            "/tmp/arc".to_string(),
        ];
        let cli = Cli::parse_from(args);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn multiple_ptp_selectors_rejected() {
        let args = vec![
            "audyn".to_string(),
            "-o".to_string(),
            "/tmp/out.wav".to_string(),
            "--ptp-software".to_string(),
            "--ptp-interface".to_string(),
            "eth0".to_string(),
        ];
        let cli = Cli::parse_from(args);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn unrecognized_output_suffix_is_rejected() {
        let cli = Cli::parse_from(vec![
            "audyn".to_string(),
            "-o".to_string(),
            "/tmp/out.mp3".to_string(),
        ]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn channel_window_exceeding_stream_width_is_rejected() {
        let cli = Cli::parse_from(vec![
            "audyn".to_string(),
            "-o".to_string(),
            "/tmp/out.wav".to_string(),
            "--channels".to_string(),
            "2".to_string(),
            "--stream-channels".to_string(),
            "1".to_string(),
        ]);
        assert!(cli.validate().is_err());
    }
}
