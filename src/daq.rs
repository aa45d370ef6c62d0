//! Orchestrator: owns every board's buffers and wires the network/extractor/processor threads
//! into the acyclic pipeline described in the system overview. Explicitly constructed — no
//! global singleton, unlike the reference `daq` class's process-wide instance.
//!
//! Ported from `daq.h`/`daq.C`'s thread-spawning and shutdown sequence, adapted to Rust's
//! ownership model: every buffer lives behind one `Arc<Shared>` so the network/extractor/
//! processor closures can each hold a clone without unsafe `'static` lifetime games.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::channel::{derive_layout, BoardLayout, ChannelBuffer};
use crate::config::Settings;
use crate::extractor::ChannelDataExtractor;
use crate::network::{PacketBuffer, UdpIngestSocket};
use crate::scheduler::Scheduler;
use crate::stop::StopToken;

struct Shared {
    layouts: Vec<BoardLayout>,
    packet_buffers: Vec<PacketBuffer>,
    ports: Vec<u16>,
    /// Every enabled channel's buffer across all boards, concatenated in board order; a
    /// board's own channels occupy `board_ranges[b]` and are indexed within it by
    /// `ChannelInfo::enabled_channel_number`, matching the extractor's expectations.
    all_channels: Vec<ChannelBuffer>,
    board_ranges: Vec<(usize, usize)>,
}

/// Owns the full pipeline for one run: per-board sockets, packet buffers, channel buffers, and
/// the worker threads that move data through them.
pub struct Daq {
    settings: Settings,
    shared: Arc<Shared>,
    stop: StopToken,
    threads: Vec<JoinHandle<()>>,
}

impl Daq {
    /// Validate `settings` and build every buffer the pipeline needs. Does not start any
    /// threads — call [`Daq::start`] once a [`Scheduler`] (with its processors registered) is
    /// ready.
    pub fn init(settings: Settings) -> anyhow::Result<Self> {
        settings.validate()?;
        let layouts = derive_layout(&settings.channel_masks, &settings.resolution_bits)?;
        let max_packet_size = settings.max_udp_packet_size();

        let mut all_channels = Vec::new();
        let mut board_ranges = Vec::with_capacity(layouts.len());
        for layout in &layouts {
            let start = all_channels.len();
            for &info in &layout.channels {
                all_channels.push(ChannelBuffer::new(
                    info,
                    settings.channel_buffer_size,
                    settings.channel_buffer_extra_size,
                )?);
            }
            board_ranges.push((start, all_channels.len()));
        }

        let mut packet_buffers = Vec::with_capacity(layouts.len());
        let mut ports = Vec::with_capacity(layouts.len());
        for board in 0..layouts.len() {
            packet_buffers.push(PacketBuffer::new(settings.network_buffer_size, max_packet_size)?);
            ports.push(settings.port_for_board(board));
        }

        Ok(Self {
            settings,
            shared: Arc::new(Shared {
                layouts,
                packet_buffers,
                ports,
                all_channels,
                board_ranges,
            }),
            stop: StopToken::new(),
            threads: Vec::new(),
        })
    }

    /// The validated configuration this pipeline was built from.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The flattened, stable-ordered list of every enabled channel buffer, for wiring up
    /// processors (e.g. a [`crate::processor::DiskDump`]) before calling `start`.
    pub fn all_channels(&self) -> &[ChannelBuffer] {
        &self.shared.all_channels
    }

    /// Number of configured boards.
    pub fn board_count(&self) -> usize {
        self.shared.layouts.len()
    }

    /// Spawn one network thread and one extractor thread per board, plus one processor thread
    /// running `scheduler`.
    pub fn start(&mut self, scheduler: Scheduler) -> anyhow::Result<()> {
        for board in 0..self.shared.layouts.len() {
            self.threads.push(self.spawn_network_thread(board));
            self.threads.push(self.spawn_extractor_thread(board));
        }
        self.threads.push(self.spawn_processor_thread(scheduler));
        info!(boards = self.shared.layouts.len(), "daq pipeline started");
        Ok(())
    }

    fn spawn_network_thread(&self, board: usize) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let stop = self.stop.clone();
        let port = shared.ports[board];

        thread::spawn(move || {
            let mut socket = match UdpIngestSocket::bind(port) {
                Ok(s) => s,
                Err(e) => {
                    error!(board, error = %e, "failed to bind UDP ingest socket");
                    shared.packet_buffers[board].ring().terminate();
                    return;
                }
            };

            loop {
                match shared.packet_buffers[board].receive(&mut socket, &stop) {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        error!(board, error = %e, "network thread terminating on error");
                        shared.packet_buffers[board].ring().terminate();
                        break;
                    }
                }
            }
            info!(board, summary = %shared.packet_buffers[board].summary(), "network thread finished");
        })
    }

    fn spawn_extractor_thread(&self, board: usize) -> JoinHandle<()> {
        let shared = self.shared.clone();

        thread::spawn(move || {
            let extractor = ChannelDataExtractor::new(board, shared.layouts[board].clone());
            let (start, end) = shared.board_ranges[board];
            if let Err(e) = extractor.run(&shared.packet_buffers[board], &shared.all_channels[start..end]) {
                error!(board, error = %e, "extractor thread terminating on error");
                for c in &shared.all_channels[start..end] {
                    c.ring.terminate();
                }
            }
        })
    }

    fn spawn_processor_thread(&self, mut scheduler: Scheduler) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let stop = self.stop.clone();

        thread::spawn(move || {
            let watermarks: Vec<&ChannelBuffer> = shared
                .board_ranges
                .iter()
                .map(|&(_, end)| &shared.all_channels[end - 1])
                .collect();
            if let Err(e) = scheduler.run(&watermarks, &shared.all_channels, &stop) {
                error!(error = %e, "processor thread terminating on error");
            }
        })
    }

    /// Request every worker to stop, wait up to `timeout` for them to finish on their own,
    /// then join them. The reference implementation escalates to an OS-signal-based forced
    /// termination past the timeout; this crate has no safe equivalent for a `std::thread` and
    /// instead only logs a warning and joins regardless — see `DESIGN.md`.
    pub fn stop(mut self, timeout: Duration) -> anyhow::Result<()> {
        self.stop.stop();

        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline && self.threads.iter().any(|h| !h.is_finished()) {
            thread::sleep(Duration::from_millis(20));
        }
        if self.threads.iter().any(|h| !h.is_finished()) {
            warn!("stop timeout elapsed with worker threads still running; joining anyway");
        }

        for handle in self.threads.drain(..) {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("a daq worker thread panicked"))?;
        }

        self.log_statistics();
        Ok(())
    }

    fn log_statistics(&self) {
        for (board, pb) in self.shared.packet_buffers.iter().enumerate() {
            info!(board, summary = %pb.summary(), "network buffer statistics");
        }
        for c in &self.shared.all_channels {
            let ring = &c.ring;
            let mean = ring.mean_size();
            let capacity = ring.capacity() as f64;
            let mut msg = format!(
                "channel {} mean_fill={:.1} max_fill={} capacity={}",
                c.info.absolute_channel,
                mean,
                ring.max_size(),
                ring.capacity(),
            );
            if capacity > 0.0 && mean / capacity > 0.5 {
                msg.push_str(" (mean fill above 50%, consider enlarging channel_buffer_size)");
            }
            info!("{msg}");
        }
    }
}

impl std::fmt::Debug for Daq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daq")
            .field("boards", &self.shared.layouts.len())
            .field("running_threads", &self.threads.len())
            .finish()
    }
}
