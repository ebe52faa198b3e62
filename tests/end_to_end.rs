//! Integration tests driving the receiver and worker together over a
//! real loopback UDP socket, without going through `Pipeline::run`
//! (which installs a process-wide signal handler that can only be
//! installed once).

use audyn::archive::{ArchiveClock, ArchiveConfig, ArchiveLayout, ArchivePolicy};
use audyn::pool::FramePool;
use audyn::ptp::{PtpClock, PtpConfig, PtpMode};
use audyn::queue::FrameQueue;
use audyn::receiver::{Receiver, ReceiverConfig};
use audyn::worker::{Format, OutputKind, Worker, WorkerConfig};
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

fn rtp_packet(seq: u16, timestamp: u32, ssrc: u32, channels: u32, spp: u32, fill: i16) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(12 + (spp * channels * 2) as usize);
    pkt.push(0x80); // version 2, no padding/extension/csrc
    pkt.push(96); // payload type, no marker
    pkt.extend_from_slice(&seq.to_be_bytes());
    pkt.extend_from_slice(&timestamp.to_be_bytes());
    pkt.extend_from_slice(&ssrc.to_be_bytes());
    for _ in 0..(spp * channels) {
        pkt.extend_from_slice(&fill.to_be_bytes());
    }
    pkt
}

fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    socket.local_addr().unwrap().port()
}

#[test]
fn loopback_rtp_capture_produces_a_playable_wav_file() {
    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("capture.wav");
    let port = free_udp_port();

    let pool = FramePool::new(16, 2, 64);
    let queue = Arc::new(FrameQueue::new(16));
    let ptp = Arc::new(PtpClock::new(PtpConfig {
        mode: PtpMode::None,
        phc_device: None,
        interface: None,
    }).unwrap());

    let receiver_cfg = ReceiverConfig {
        multicast_addr: Ipv4Addr::LOCALHOST,
        port,
        interface: None,
        payload_type: 96,
        sample_rate: 48000,
        stream_channels: 2,
        channel_offset: 0,
        out_channels: 2,
        samples_per_packet: 48,
        jitter_depth_ms: 20,
        recv_buffer_bytes: None,
    };
    let worker_cfg = WorkerConfig {
        sample_rate: 48000,
        channels: 2,
        output: OutputKind::SingleFile(out_path.clone()),
        format: Format::Wav,
        idle_sleep: Duration::from_millis(1),
    };

    let mut receiver = Receiver::new(receiver_cfg, pool.clone(), queue.clone(), ptp);
    let mut worker = Worker::new(worker_cfg, pool, queue);

    worker.start().unwrap();
    receiver.start().unwrap();

    let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let dest = (Ipv4Addr::LOCALHOST, port);
    let ssrc = 0xC0FFEE;
    for i in 0..20u32 {
        let pkt = rtp_packet(i as u16, i * 48, ssrc, 2, 48, 1000);
        sender.send_to(&pkt, dest).unwrap();
    }

    std::thread::sleep(Duration::from_millis(300));

    receiver.stop();
    worker.stop();

    let stats = receiver.stats();
    assert!(stats.packets_received >= 15, "expected most packets to arrive, got {}", stats.packets_received);

    let bytes = std::fs::read(&out_path).unwrap();
    assert_eq!(&bytes[0..4], b"RIFF");
    let data_size = u32::from_le_bytes(bytes[40..44].try_into().unwrap());
    assert!(data_size > 0, "expected decoded audio to have been written");
}

#[test]
fn archive_rotation_closes_and_reopens_across_the_period_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let pool = FramePool::new(8, 1, 8);
    let queue = Arc::new(FrameQueue::new(8));

    let archive_cfg = ArchiveConfig {
        root_dir: dir.path().to_path_buf(),
        suffix: "wav".into(),
        layout: ArchiveLayout::Flat,
        custom_format: None,
        rotation_period_sec: 3600,
        clock_source: ArchiveClock::Utc,
        create_directories: true,
    };
    let policy = ArchivePolicy::new(archive_cfg).unwrap();

    let worker_cfg = WorkerConfig {
        sample_rate: 48000,
        channels: 1,
        output: OutputKind::Archive(policy),
        format: Format::Wav,
        idle_sleep: Duration::from_millis(1),
    };
    let mut worker = Worker::new(worker_cfg, pool.clone(), queue.clone());
    worker.start().unwrap();

    for i in 0..5u32 {
        let mut h = pool.acquire().unwrap();
        h.samples_mut()[0] = i as f32 * 0.01;
        h.set_sample_frames(1);
        queue.push(h).unwrap();
    }

    std::thread::sleep(Duration::from_millis(100));
    worker.stop();

    let stats = worker.stats();
    assert_eq!(stats.frames_written, 5);
    assert_eq!(stats.rotations, 1);

    let written: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(written.len(), 1, "expected exactly one archive file to have been opened");
}
