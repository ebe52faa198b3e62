//! AES67 RTP receiver: socket setup, multicast join, RTP parsing,
//! jitter-buffer reordering, PTP correlation and enqueue.
//!
//! Grounded on `bass-aes67/src/input/stream.rs::create_multicast_socket`
//! and `receiver_loop`, generalized from "decode into a ring buffer for
//! BASS playback" to "acquire a pool frame, decode into it, push to the
//! frame queue" — the `socket2`-based setup (reuse-addr, optional large
//! receive buffer, 100ms timeout) replaces a plain `std::net::UdpSocket`
//! to reach the hardware/software timestamping options `socket2` exposes.

use crate::error::{AudynError, Result};
use crate::jitter::{JitterBuffer, JitterConfig};
use crate::pool::FramePool;
use crate::ptp::{PtpClock, PtpMode};
use crate::queue::FrameQueue;
use crate::rtp::{self, RtpPacket};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const CHANNEL_SELECT_WARN_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Stopped,
    Running,
    Failing,
}

pub struct ReceiverConfig {
    pub multicast_addr: Ipv4Addr,
    pub port: u16,
    pub interface: Option<Ipv4Addr>,
    pub payload_type: u8,
    pub sample_rate: u32,
    pub stream_channels: u32,
    pub channel_offset: u32,
    pub out_channels: u32,
    pub samples_per_packet: u32,
    pub jitter_depth_ms: u32,
    pub recv_buffer_bytes: Option<usize>,
}

#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub frames_dropped_pool: u64,
    pub frames_dropped_queue: u64,
    pub discontinuities: u64,
}

struct Counters {
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
    frames_dropped_pool: AtomicU64,
    frames_dropped_queue: AtomicU64,
    discontinuities: AtomicU64,
    channel_select_rejects: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            packets_received: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            frames_dropped_pool: AtomicU64::new(0),
            frames_dropped_queue: AtomicU64::new(0),
            discontinuities: AtomicU64::new(0),
            channel_select_rejects: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> ReceiverStats {
        ReceiverStats {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            frames_dropped_pool: self.frames_dropped_pool.load(Ordering::Relaxed),
            frames_dropped_queue: self.frames_dropped_queue.load(Ordering::Relaxed),
            discontinuities: self.discontinuities.load(Ordering::Relaxed),
        }
    }
}

/// Drives one AES67 RTP stream: owns the receive socket and worker
/// thread, and feeds the shared `FramePool`/`FrameQueue`/`PtpClock`.
pub struct Receiver {
    cfg: ReceiverConfig,
    pool: FramePool,
    queue: Arc<FrameQueue>,
    ptp: Arc<PtpClock>,
    jitter: Arc<JitterBuffer>,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<ReceiverState>>,
    last_error: Arc<Mutex<Option<String>>>,
    counters: Arc<Counters>,
    thread: Option<JoinHandle<()>>,
}

impl Receiver {
    pub fn new(cfg: ReceiverConfig, pool: FramePool, queue: Arc<FrameQueue>, ptp: Arc<PtpClock>) -> Self {
        let jitter = Arc::new(JitterBuffer::new(&JitterConfig {
            sample_rate: cfg.sample_rate,
            samples_per_packet: cfg.samples_per_packet,
            depth_ms: cfg.jitter_depth_ms,
        }));

        Self {
            cfg,
            pool,
            queue,
            ptp,
            jitter,
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(ReceiverState::Stopped)),
            last_error: Arc::new(Mutex::new(None)),
            counters: Arc::new(Counters::new()),
            thread: None,
        }
    }

    pub fn state(&self) -> ReceiverState {
        *self.state.lock()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn stats(&self) -> ReceiverStats {
        self.counters.snapshot()
    }

    fn fail(&self, message: String) -> AudynError {
        *self.state.lock() = ReceiverState::Failing;
        *self.last_error.lock() = Some(message.clone());
        log::error!("receiver: {message}");
        AudynError::IoOpen {
            what: "AES67 receive socket".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, message),
        }
    }

    /// Opens and binds the socket, joins the multicast group, spawns
    /// the receive worker. Transitions stopped → running, or stopped →
    /// failing on the first fatal setup error.
    pub fn start(&mut self) -> Result<()> {
        let socket = match self.setup_socket() {
            Ok(s) => s,
            Err(e) => return Err(self.fail(e)),
        };

        self.running.store(true, Ordering::SeqCst);
        *self.state.lock() = ReceiverState::Running;

        let running = self.running.clone();
        let state = self.state.clone();
        let last_error = self.last_error.clone();
        let counters = self.counters.clone();
        let pool = self.pool.clone();
        let queue = self.queue.clone();
        let ptp = self.ptp.clone();
        let jitter = self.jitter.clone();
        let payload_type = self.cfg.payload_type;
        let sample_rate = self.cfg.sample_rate;
        let stream_channels = self.cfg.stream_channels;
        let channel_offset = self.cfg.channel_offset;
        let out_channels = self.cfg.out_channels;
        let spp = self.cfg.samples_per_packet;

        self.thread = Some(thread::spawn(move || {
            receive_loop(
                socket,
                running,
                state,
                last_error,
                counters,
                pool,
                queue,
                ptp,
                jitter,
                payload_type,
                sample_rate,
                stream_channels,
                channel_offset,
                out_channels,
                spp,
            );
        }));

        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        *self.state.lock() = ReceiverState::Stopped;
    }

    fn setup_socket(&self) -> std::result::Result<UdpSocket, String> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| format!("socket creation failed: {e}"))?;

        socket
            .set_reuse_address(true)
            .map_err(|e| format!("SO_REUSEADDR failed: {e}"))?;

        if let Some(bytes) = self.cfg.recv_buffer_bytes {
            let _ = socket.set_recv_buffer_size(bytes);
        }

        let bind_addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.cfg.port).into();
        socket
            .bind(&bind_addr.into())
            .map_err(|e| format!("bind to {bind_addr} failed: {e}"))?;

        if self.cfg.multicast_addr.is_multicast() {
            let interface = self.cfg.interface.unwrap_or(Ipv4Addr::UNSPECIFIED);
            socket
                .join_multicast_v4(&self.cfg.multicast_addr, &interface)
                .map_err(|e| {
                    format!(
                        "join multicast {} on {} failed: {e}",
                        self.cfg.multicast_addr, interface
                    )
                })?;
        }

        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .map_err(|e| format!("set read timeout failed: {e}"))?;

        // Hardware/software timestamping is best-effort: failing to
        // enable it degrades to `Instant`-derived arrival time, per the
        // graceful-degradation contract for this stage.
        if let Err(e) = enable_packet_timestamping(&socket, self.cfg_ptp_mode()) {
            log::debug!("receiver: packet timestamping unavailable, falling back: {e}");
        }

        Ok(socket.into())
    }

    fn cfg_ptp_mode(&self) -> PtpMode {
        self.ptp.mode()
    }

    pub fn jitter_stats(&self) -> crate::jitter::JitterStats {
        self.jitter.stats()
    }
}

#[cfg(unix)]
fn enable_packet_timestamping(socket: &Socket, mode: PtpMode) -> std::result::Result<(), String> {
    use std::os::unix::io::AsRawFd;
    let fd = socket.as_raw_fd();

    let (level, optname, value): (i32, i32, i32) = match mode {
        PtpMode::Hardware => (
            libc::SOL_SOCKET,
            libc::SO_TIMESTAMPING,
            (libc::SOF_TIMESTAMPING_RAW_HARDWARE
                | libc::SOF_TIMESTAMPING_RX_HARDWARE
                | libc::SOF_TIMESTAMPING_SYS_HARDWARE) as i32,
        ),
        PtpMode::Software | PtpMode::None => (libc::SOL_SOCKET, libc::SO_TIMESTAMPNS, 1),
    };

    // SAFETY: `fd` is a valid, open socket owned by `socket`; the
    // option value is a plain `i32` matching the option's ABI.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            &value as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };

    if rc != 0 {
        return Err(std::io::Error::last_os_error().to_string());
    }
    Ok(())
}

#[cfg(not(unix))]
fn enable_packet_timestamping(_socket: &Socket, _mode: PtpMode) -> std::result::Result<(), String> {
    Err("packet timestamping is only implemented on unix".into())
}

#[allow(clippy::too_many_arguments)]
fn receive_loop(
    socket: UdpSocket,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<ReceiverState>>,
    last_error: Arc<Mutex<Option<String>>>,
    counters: Arc<Counters>,
    pool: FramePool,
    queue: Arc<FrameQueue>,
    ptp: Arc<PtpClock>,
    jitter: Arc<JitterBuffer>,
    payload_type: u8,
    sample_rate: u32,
    stream_channels: u32,
    channel_offset: u32,
    out_channels: u32,
    spp: u32,
) {
    let mut buf = [0u8; 2048];
    let mut epoch_set = false;
    let mut expected_seq: Option<u16> = None;

    while running.load(Ordering::SeqCst) {
        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                *state.lock() = ReceiverState::Failing;
                *last_error.lock() = Some(format!("recv failed: {e}"));
                log::error!("receiver: recv failed: {e}");
                break;
            }
        };

        let arrival_ns = ptp.now_ns();

        let packet = match RtpPacket::parse(&buf[..len], payload_type) {
            Some(p) => p,
            None => {
                let err = AudynError::FormatReject(format!(
                    "malformed RTP header or unexpected payload type (wanted {payload_type}, {len} bytes received)"
                ));
                log::debug!("receiver: {err}");
                counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        let format = match rtp::infer_format(packet.payload.len(), stream_channels, spp) {
            Some(f) => f,
            None => {
                let err = AudynError::FormatReject(format!(
                    "payload length {} matches neither L16 nor L24 framing for {stream_channels}ch/{spp}spp",
                    packet.payload.len()
                ));
                log::debug!("receiver: {err}");
                counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };

        counters.packets_received.fetch_add(1, Ordering::Relaxed);

        if !epoch_set {
            ptp.set_rtp_epoch(packet.header.timestamp, arrival_ns);
            epoch_set = true;
        }

        match expected_seq {
            None => expected_seq = Some(packet.header.sequence.wrapping_add(1)),
            Some(expected) => {
                if packet.header.sequence != expected {
                    counters.discontinuities.fetch_add(1, Ordering::Relaxed);
                }
                expected_seq = Some(packet.header.sequence.wrapping_add(1));
            }
        }

        if jitter
            .insert(packet.header.sequence, packet.header.timestamp, arrival_ns, packet.payload)
            .is_err()
        {
            let err = AudynError::FormatReject(format!(
                "payload of {} bytes exceeds jitter buffer frame capacity",
                packet.payload.len()
            ));
            log::debug!("receiver: {err}");
            counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        while let Some(jpacket) = jitter.get() {
            let mut handle = match pool.acquire() {
                Some(h) => h,
                None => {
                    counters.frames_dropped_pool.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };

            let decode_result = {
                let dst = handle.samples_mut();
                let dst = &mut dst[..(spp * out_channels) as usize];
                rtp::decode_selected(
                    &jpacket.payload,
                    format,
                    stream_channels,
                    channel_offset,
                    out_channels,
                    spp,
                    dst,
                )
            };

            if decode_result.is_err() {
                let rejects = counters.channel_select_rejects.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!("receiver: channel selection out of range");
                if rejects % CHANNEL_SELECT_WARN_INTERVAL == 0 {
                    log::warn!(
                        "receiver: channel selection out of range ({rejects} occurrences so far)"
                    );
                }
                crate::pool::release(handle);
                continue;
            }

            handle.set_sample_frames(spp);

            if let Err(returned) = queue.push(handle) {
                crate::pool::release(returned);
                counters.frames_dropped_queue.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_is_stopped() {
        let pool = FramePool::new(4, 2, 48);
        let queue = Arc::new(FrameQueue::new(4));
        let ptp = Arc::new(
            PtpClock::new(crate::ptp::PtpConfig {
                mode: PtpMode::None,
                phc_device: None,
                interface: None,
            })
            .unwrap(),
        );
        let recv = Receiver::new(
            ReceiverConfig {
                multicast_addr: "239.69.1.1".parse().unwrap(),
                port: 0,
                interface: None,
                payload_type: 96,
                sample_rate: 48000,
                stream_channels: 2,
                channel_offset: 0,
                out_channels: 2,
                samples_per_packet: 48,
                jitter_depth_ms: 20,
                recv_buffer_bytes: None,
            },
            pool,
            queue,
            ptp,
        );
        assert_eq!(recv.state(), ReceiverState::Stopped);
    }
}
