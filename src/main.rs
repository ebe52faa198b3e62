//! Binary entry point: parse the CLI, build the pipeline, run it.

use audyn::config::Cli;
use audyn::ptp::PtpClock;
use audyn::Pipeline;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let cfg = match cli.validate() {
        Ok(cfg) => cfg,
        Err(e) => {
            log::error!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let ptp = match PtpClock::new(cfg.ptp) {
        Ok(ptp) => Arc::new(ptp),
        Err(e) => {
            log::error!("failed to initialize PTP clock: {e}");
            return ExitCode::FAILURE;
        }
    };

    let pipeline = Pipeline::new(
        cfg.pool_frames,
        cfg.queue_capacity,
        cfg.channels,
        cfg.samples_per_packet,
        ptp,
        cfg.receiver,
        cfg.worker,
    );

    match pipeline.run() {
        Ok(stats) => {
            log::info!(
                "audyn: clean stop, {} frames written across {} rotation(s)",
                stats.worker.frames_written,
                stats.worker.rotations
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("audyn: {e}");
            ExitCode::FAILURE
        }
    }
}
