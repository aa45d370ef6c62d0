//! Minimal entry point: install structured logging, load configuration, and run the pipeline
//! until interrupted.
//!
//! Command-line parsing and a shell/FIFO command interpreter are explicitly out of scope for
//! this crate (external collaborators); this binary only demonstrates wiring `Daq` together
//! with a `DiskDump` processor and waiting for Ctrl-C.

use std::time::Duration;

use anyhow::Result;
use apdcam10g_daq::config::Settings;
use apdcam10g_daq::daq::Daq;
use apdcam10g_daq::processor::DiskDump;
use apdcam10g_daq::scheduler::Scheduler;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let config_path = std::env::var("APDCAM_CONFIG").unwrap_or_else(|_| "settings.toml".to_string());
    let settings = Settings::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut daq = Daq::init(settings.clone())?;

    let mut scheduler = Scheduler::new(settings.process_period)?;
    let (dump, _control) = DiskDump::with_options(
        settings.diskdump_output_dir.clone(),
        settings.diskdump_filename_pattern.clone(),
        settings.diskdump_sampling,
    );
    scheduler.add_processor(Box::new(dump));

    daq.start(scheduler)?;

    ctrlc_wait();

    daq.stop(Duration::from_secs(5))?;
    Ok(())
}

/// Block until the process receives an interrupt signal. A dedicated crate for this (e.g.
/// `ctrlc`) is not part of the teacher's dependency stack, so this installs a minimal libc
/// handler directly.
fn ctrlc_wait() {
    use std::sync::atomic::{AtomicBool, Ordering};

    static INTERRUPTED: AtomicBool = AtomicBool::new(false);

    extern "C" fn handler(_sig: libc::c_int) {
        INTERRUPTED.store(true, Ordering::Release);
    }

    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }

    while !INTERRUPTED.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(200));
    }
}
