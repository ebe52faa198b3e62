//! Wires the frame pool, frame queue, receiver and worker together and
//! owns the main thread's signal-driven stop flag.
//!
//! Grounded on the `ctrlc::set_handler` pattern used by
//! `bass-webrtc-ndi`/`bass-webrtc`'s dev-examples, generalized from a
//! one-off `Arc<AtomicBool>` in a binary's `main` into the pipeline's
//! own owned stop flag.

use crate::error::Result;
use crate::pool::FramePool;
use crate::ptp::PtpClock;
use crate::queue::FrameQueue;
use crate::receiver::{Receiver, ReceiverConfig, ReceiverStats};
use crate::worker::{Worker, WorkerConfig, WorkerStats};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MAIN_LOOP_POLL: Duration = Duration::from_millis(50);

/// Summary counters logged on clean stop.
pub struct PipelineStats {
    pub receiver: ReceiverStats,
    pub worker: WorkerStats,
}

/// Owns the pool/queue/receiver/worker dependency chain: PTP clock →
/// jitter buffer → frame pool → frame queue → (RTP receiver, archive
/// policy, sinks) → worker loop.
pub struct Pipeline {
    pool: FramePool,
    queue: Arc<FrameQueue>,
    ptp: Arc<PtpClock>,
    receiver: Receiver,
    worker: Worker,
    stop: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(
        pool_capacity: u32,
        queue_capacity: u32,
        channels: u32,
        frame_capacity_samples: u32,
        ptp: Arc<PtpClock>,
        receiver_cfg: ReceiverConfig,
        worker_cfg: WorkerConfig,
    ) -> Self {
        let pool = FramePool::new(pool_capacity, channels, frame_capacity_samples);
        let queue = Arc::new(FrameQueue::new(queue_capacity));

        let receiver = Receiver::new(receiver_cfg, pool.clone(), queue.clone(), ptp.clone());
        let worker = Worker::new(worker_cfg, pool.clone(), queue.clone());

        Self {
            pool,
            queue,
            ptp,
            receiver,
            worker,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    pub fn ptp(&self) -> &Arc<PtpClock> {
        &self.ptp
    }

    /// Installs the SIGINT/SIGTERM handler, starts the worker then the
    /// receiver (consumer before producer, so no pushed frame is ever
    /// orphaned), and blocks until `stop` is observed or either
    /// subsystem fails.
    ///
    /// Returns `Ok(())` for a clean stop with no worker error; callers
    /// map that to the process exit code.
    pub fn run(mut self) -> Result<PipelineStats> {
        let stop = self.stop.clone();
        ctrlc::set_handler(move || {
            log::info!("pipeline: stop signal received");
            stop.store(true, Ordering::SeqCst);
        })
        .map_err(|e| {
            crate::error::AudynError::ConfigInvalid(format!("failed to install signal handler: {e}"))
        })?;

        self.worker.start()?;
        self.receiver.start()?;

        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            if self.receiver.state() == crate::receiver::ReceiverState::Failing {
                log::error!(
                    "pipeline: receiver failed: {}",
                    self.receiver.last_error().unwrap_or_default()
                );
                break;
            }
            if self.worker.state() == crate::worker::WorkerState::Failing {
                log::error!(
                    "pipeline: worker failed: {}",
                    self.worker.last_error().unwrap_or_default()
                );
                break;
            }
            std::thread::sleep(MAIN_LOOP_POLL);
        }

        self.receiver.stop();
        self.worker.stop();

        let receiver_stats = self.receiver.stats();
        let worker_stats = self.worker.stats();

        log::info!(
            "pipeline: stopped — packets_received={} packets_dropped={} frames_dropped_pool={} frames_dropped_queue={} frames_written={} rotations={}",
            receiver_stats.packets_received,
            receiver_stats.packets_dropped,
            receiver_stats.frames_dropped_pool,
            receiver_stats.frames_dropped_queue,
            worker_stats.frames_written,
            worker_stats.rotations,
        );

        let worker_failed = self.worker.state() == crate::worker::WorkerState::Failing;
        let stats = PipelineStats {
            receiver: receiver_stats,
            worker: worker_stats,
        };

        if worker_failed {
            return Err(crate::error::AudynError::IoWrite(
                "worker stopped with a fatal error".into(),
            ));
        }

        Ok(stats)
    }
}
