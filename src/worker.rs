//! Non-real-time consumer thread: pop frames, rotate, write, release.
//!
//! Shaped after `receiver.rs`'s own state/counters/thread pattern,
//! generalized from "receive and decode" to "pop, rotate-if-needed,
//! write, release".

use crate::archive::ArchivePolicy;
use crate::error::{AudynError, Result};
use crate::pool::{self, FramePool};
use crate::queue::FrameQueue;
use crate::sink::{OpusConfig, OpusSink, WavSink};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default poll interval when the frame queue is empty.
pub const DEFAULT_IDLE_SLEEP: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Running,
    Failing,
}

/// What kind of sink the worker opens on rotation.
pub enum OutputKind {
    /// A single fixed path, opened once; `should_rotate` is never consulted.
    SingleFile(PathBuf),
    /// A rotating archive governed by an `ArchivePolicy`.
    Archive(ArchivePolicy),
}

pub enum Format {
    Wav,
    Opus(OpusConfig),
}

pub struct WorkerConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub output: OutputKind,
    pub format: Format,
    pub idle_sleep: Duration,
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    pub frames_written: u64,
    pub rotations: u64,
    pub frames_released: u64,
}

struct Counters {
    frames_written: AtomicU64,
    rotations: AtomicU64,
    frames_released: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            frames_written: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
            frames_released: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            frames_written: self.frames_written.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            frames_released: self.frames_released.load(Ordering::Relaxed),
        }
    }
}

enum ActiveSink {
    None,
    Wav(WavSink),
    Opus(OpusSink),
}

/// Drains the frame queue on its own thread, driving rotation and
/// sink writes. All file I/O happens here; the RX thread never
/// touches disk.
pub struct Worker {
    cfg: Option<WorkerConfig>,
    pool: FramePool,
    queue: Arc<FrameQueue>,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<WorkerState>>,
    last_error: Arc<Mutex<Option<String>>>,
    counters: Arc<Counters>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(cfg: WorkerConfig, pool: FramePool, queue: Arc<FrameQueue>) -> Self {
        Self {
            cfg: Some(cfg),
            pool,
            queue,
            running: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(WorkerState::Stopped)),
            last_error: Arc::new(Mutex::new(None)),
            counters: Arc::new(Counters::new()),
            thread: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    pub fn start(&mut self) -> Result<()> {
        let cfg = self
            .cfg
            .take()
            .ok_or_else(|| AudynError::ConfigInvalid("worker already started".into()))?;

        self.running.store(true, Ordering::SeqCst);
        *self.state.lock() = WorkerState::Running;

        let running = self.running.clone();
        let state = self.state.clone();
        let last_error = self.last_error.clone();
        let counters = self.counters.clone();
        let pool = self.pool.clone();
        let queue = self.queue.clone();

        self.thread = Some(thread::spawn(move || {
            work_loop(cfg, running, state, last_error, counters, pool, queue);
        }));

        Ok(())
    }

    /// Signals the worker to stop and joins it, draining any frames
    /// already in the queue before the final sink close.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        *self.state.lock() = WorkerState::Stopped;
    }
}

fn open_sink(format: &Format, path: &std::path::Path, sample_rate: u32, channels: u16) -> Result<ActiveSink> {
    match format {
        Format::Wav => Ok(ActiveSink::Wav(WavSink::open(path, sample_rate, channels)?)),
        Format::Opus(opus_cfg) => {
            let mut cfg = *opus_cfg;
            cfg.sample_rate = sample_rate;
            cfg.channels = channels;
            Ok(ActiveSink::Opus(OpusSink::open(path, cfg)?))
        }
    }
}

fn close_sink(sink: ActiveSink) -> Result<()> {
    match sink {
        ActiveSink::None => Ok(()),
        ActiveSink::Wav(w) => w.close(),
        ActiveSink::Opus(o) => o.close(),
    }
}

fn write_sink(sink: &mut ActiveSink, samples: &[f32], frames: u32) -> Result<()> {
    match sink {
        ActiveSink::None => Ok(()),
        ActiveSink::Wav(w) => w.write(samples, frames),
        ActiveSink::Opus(o) => o.write(samples, frames),
    }
}

fn work_loop(
    mut cfg: WorkerConfig,
    running: Arc<AtomicBool>,
    state: Arc<Mutex<WorkerState>>,
    last_error: Arc<Mutex<Option<String>>>,
    counters: Arc<Counters>,
    pool: FramePool,
    queue: Arc<FrameQueue>,
) {
    let mut sink = ActiveSink::None;
    let mut single_file_opened = false;

    macro_rules! fail {
        ($msg:expr) => {{
            *state.lock() = WorkerState::Failing;
            *last_error.lock() = Some($msg.clone());
            log::error!("worker: {}", $msg);
            break;
        }};
    }

    'outer: while running.load(Ordering::SeqCst) || !queue.is_empty() {
        let handle = match queue.pop() {
            Some(h) => h,
            None => {
                thread::sleep(cfg.idle_sleep);
                continue;
            }
        };

        let now_ns = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;

        match &mut cfg.output {
            OutputKind::SingleFile(path) => {
                if !single_file_opened {
                    match open_sink(&cfg.format, path, cfg.sample_rate, cfg.channels) {
                        Ok(s) => {
                            sink = s;
                            single_file_opened = true;
                            counters.rotations.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            pool::release(handle);
                            fail!(format!("failed to open {}: {e}", path.display()));
                        }
                    }
                }
            }
            OutputKind::Archive(policy) => {
                if policy.should_rotate(now_ns) {
                    let path = match policy.next_path(now_ns) {
                        Ok(p) => p,
                        Err(AudynError::RotationFailure(msg)) => {
                            pool::release(handle);
                            fail!(format!("archive rotation failed: {msg}"));
                        }
                        Err(e) => {
                            pool::release(handle);
                            fail!(format!("archive path generation failed: {e}"));
                        }
                    };

                    let previous = std::mem::replace(&mut sink, ActiveSink::None);
                    if let Err(e) = close_sink(previous) {
                        log::warn!("worker: error closing previous sink: {e}");
                    }

                    match open_sink(&cfg.format, &path, cfg.sample_rate, cfg.channels) {
                        Ok(s) => {
                            sink = s;
                            policy.advance();
                            counters.rotations.fetch_add(1, Ordering::Relaxed);
                            log::info!("worker: rotated to {}", path.display());
                        }
                        Err(e) => {
                            pool::release(handle);
                            fail!(format!("failed to open {}: {e}", path.display()));
                        }
                    }
                }
            }
        }

        let frames = handle.sample_frames();
        let samples = handle.valid_samples();
        let write_result = write_sink(&mut sink, samples, frames);
        pool::release(handle);

        match write_result {
            Ok(()) => {
                counters.frames_written.fetch_add(1, Ordering::Relaxed);
                counters.frames_released.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.frames_released.fetch_add(1, Ordering::Relaxed);
                fail!(format!("sink write failed: {e}"));
            }
        }

        if !running.load(Ordering::SeqCst) && queue.is_empty() {
            break 'outer;
        }
    }

    if let Err(e) = close_sink(sink) {
        log::warn!("worker: error closing final sink: {e}");
    }

    if *state.lock() != WorkerState::Failing {
        *state.lock() = WorkerState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FramePool;

    #[test]
    fn single_file_wav_output_writes_header_and_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let pool = FramePool::new(4, 2, 64);
        let queue = Arc::new(FrameQueue::new(4));

        for i in 0..3u32 {
            let mut h = pool.acquire().unwrap();
            h.samples_mut()[0] = i as f32 * 0.1;
            h.set_sample_frames(1);
            queue.push(h).unwrap();
        }

        let mut worker = Worker::new(
            WorkerConfig {
                sample_rate: 48000,
                channels: 2,
                output: OutputKind::SingleFile(path.clone()),
                format: Format::Wav,
                idle_sleep: Duration::from_millis(1),
            },
            pool,
            queue,
        );
        worker.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        worker.stop();

        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(path.exists());
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(worker.stats().frames_written, 3);
    }
}
