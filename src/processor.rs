//! Processor contracts: the pluggable consumers the scheduler drives once a window of shots
//! is available across every enabled channel.
//!
//! Ported from `processor.h`/`processor_diskdump.C`/`processor_diskdump.h`. A processor is a
//! capability set — `init`, `run(from, to) -> need`, `finish` — rather than a trait object
//! hierarchy rooted in a `daq` back-pointer: the channel buffers it operates on are passed in
//! by the scheduler on every call instead of being reached through a global singleton.

use std::fs::File;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;

use crate::channel::ChannelBuffer;
use crate::error::{DaqError, DaqResult};

/// Default sampling stride (every shot) used when a [`DiskDump`] is built with
/// [`DiskDump::new`] rather than an explicit override.
pub const DEFAULT_SAMPLING: u32 = 1;

/// Default output directory used when a [`DiskDump`] is built with [`DiskDump::new`].
pub fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

/// A pluggable consumer of aligned shot windows, driven by the scheduler.
///
/// `channels` is the flattened, stable-ordered list of every enabled channel buffer across all
/// boards (the scheduler's `all_enabled_channels_buffers`); `run` is called once per scheduler
/// tick with the range `[from, to)` guaranteed to be resident in every buffer in `channels`.
pub trait Processor: Send {
    /// Called once before the pipeline starts. The default does nothing.
    fn init(&mut self, channels: &[ChannelBuffer]) -> DaqResult<()> {
        let _ = channels;
        Ok(())
    }

    /// Process shots `[from, to)`. Returns the earliest counter this processor still needs;
    /// the scheduler reclaims everything before the minimum such counter across all processors.
    fn run(&mut self, channels: &[ChannelBuffer], from: usize, to: usize) -> DaqResult<usize>;

    /// Called once after every board has terminated. The default does nothing.
    fn finish(&mut self) -> DaqResult<()> {
        Ok(())
    }
}

/// Shared handles a caller uses to pause/resume a running [`DiskDump`] and change its sampling
/// stride from another thread, without touching the processor itself (which lives on the
/// scheduler thread).
#[derive(Clone)]
pub struct DiskDumpControl {
    sampling: Arc<AtomicU32>,
    pause: Arc<AtomicBool>,
}

impl DiskDumpControl {
    /// Pause output: writing stops and a blank line is emitted on the transition.
    pub fn pause(&self) {
        self.pause.store(true, Ordering::Release);
    }

    /// Resume output: a `# resume: <shot>` comment is emitted on the transition.
    pub fn resume(&self) {
        self.pause.store(false, Ordering::Release);
    }

    /// Change the sampling stride; only every `n`th shot is written from the next shot on.
    pub fn set_sampling(&self, n: u32) {
        self.sampling.store(n, Ordering::SeqCst);
    }
}

/// One append-only text file per enabled channel, named by substituting `%` in a filename
/// pattern with the channel's absolute channel number.
pub struct DiskDump {
    output_dir: PathBuf,
    filename_pattern: String,
    sampling: Arc<AtomicU32>,
    pause: Arc<AtomicBool>,
    previous_pause: bool,
    files: Vec<File>,
    next_data: usize,
}

impl DiskDump {
    /// Build a disk dump with the crate-level defaults (sample every shot, write to the
    /// current directory).
    pub fn new(filename_pattern: impl Into<String>) -> (Self, DiskDumpControl) {
        Self::with_options(default_output_dir(), filename_pattern, DEFAULT_SAMPLING)
    }

    /// Build a disk dump with an explicit output directory and sampling stride.
    pub fn with_options(
        output_dir: impl Into<PathBuf>,
        filename_pattern: impl Into<String>,
        sampling: u32,
    ) -> (Self, DiskDumpControl) {
        let sampling = Arc::new(AtomicU32::new(sampling));
        let pause = Arc::new(AtomicBool::new(false));
        let control = DiskDumpControl {
            sampling: sampling.clone(),
            pause: pause.clone(),
        };
        let dump = Self {
            output_dir: output_dir.into(),
            filename_pattern: filename_pattern.into(),
            sampling,
            pause,
            previous_pause: false,
            files: Vec::new(),
            next_data: 0,
        };
        (dump, control)
    }

    fn filename_for(&self, absolute_channel: usize) -> DaqResult<PathBuf> {
        let p = self.filename_pattern.find('%').ok_or_else(|| {
            DaqError::Configuration("disk dump filename pattern must contain '%'".to_string())
        })?;
        let (prefix, suffix) = self.filename_pattern.split_at(p);
        let name = format!("{prefix}{absolute_channel}{}", &suffix[1..]);
        Ok(self.output_dir.join(name))
    }
}

impl Processor for DiskDump {
    fn init(&mut self, channels: &[ChannelBuffer]) -> DaqResult<()> {
        self.files.clear();
        self.pause.store(false, Ordering::Release);
        self.previous_pause = false;

        let mut files = Vec::with_capacity(channels.len());
        for c in channels {
            let path = self.filename_for(c.info.absolute_channel)?;
            let file = File::create(&path).map_err(DaqError::Transport)?;
            files.push(file);
        }
        self.files = files;
        self.next_data = 0;
        Ok(())
    }

    fn run(&mut self, channels: &[ChannelBuffer], from: usize, to: usize) -> DaqResult<usize> {
        let start = from.max(self.next_data);
        for i in start..to {
            let paused = self.pause.load(Ordering::Acquire);
            if paused != self.previous_pause {
                if paused {
                    for f in &mut self.files {
                        writeln!(f).map_err(DaqError::Transport)?;
                    }
                } else {
                    for f in &mut self.files {
                        writeln!(f, "# resume: {i}").map_err(DaqError::Transport)?;
                    }
                }
                self.previous_pause = paused;
            }

            if paused {
                continue;
            }

            let stride = self.sampling.load(Ordering::SeqCst).max(1);
            if i as u32 % stride != 0 {
                continue;
            }

            for (c, f) in channels.iter().zip(self.files.iter_mut()) {
                let value = c.ring.at(i);
                writeln!(f, "{value}").map_err(DaqError::Transport)?;
            }
        }
        self.next_data = to;
        Ok(to)
    }

    fn finish(&mut self) -> DaqResult<()> {
        for f in &mut self.files {
            f.flush().map_err(DaqError::Transport)?;
        }
        Ok(())
    }
}

/// Rendezvous state shared between a [`Processor`]-side `ExternalAnalysis` and the
/// foreign-runtime-facing [`ExternalAnalysisHandle`] clones it hands out.
struct Rendezvous {
    can_run: bool,
    from: usize,
    to: usize,
    need_from: Option<usize>,
    stop: bool,
}

struct RendezvousInner {
    state: Mutex<Rendezvous>,
    cv: Condvar,
}

/// Processor-side hook that bridges the scheduler thread to a foreign runtime: publishes a
/// `(from, to)` window and blocks until the runtime reports back the earliest counter it
/// still needs.
pub struct ExternalAnalysis {
    inner: Arc<RendezvousInner>,
}

impl ExternalAnalysis {
    /// Create a fresh external-analysis hook and the handle the foreign runtime waits on.
    pub fn new() -> (Self, ExternalAnalysisHandle) {
        let inner = Arc::new(RendezvousInner {
            state: Mutex::new(Rendezvous {
                can_run: false,
                from: 0,
                to: 0,
                need_from: None,
                stop: false,
            }),
            cv: Condvar::new(),
        });
        (
            Self {
                inner: inner.clone(),
            },
            ExternalAnalysisHandle { inner },
        )
    }
}

impl Default for ExternalAnalysis {
    fn default() -> Self {
        Self::new().0
    }
}

impl Processor for ExternalAnalysis {
    fn run(&mut self, _channels: &[ChannelBuffer], from: usize, to: usize) -> DaqResult<usize> {
        let mut state = self.inner.state.lock().expect("rendezvous mutex poisoned");
        state.from = from;
        state.to = to;
        state.need_from = None;
        state.can_run = true;
        self.inner.cv.notify_all();

        while state.need_from.is_none() {
            state = self
                .inner
                .cv
                .wait(state)
                .expect("rendezvous mutex poisoned");
        }
        let need = state.need_from.take().expect("checked above");
        state.can_run = false;
        Ok(need)
    }

    fn finish(&mut self) -> DaqResult<()> {
        let mut state = self.inner.state.lock().expect("rendezvous mutex poisoned");
        state.stop = true;
        self.inner.cv.notify_all();
        debug!("external analysis hook signaled stop");
        Ok(())
    }
}

/// The foreign-runtime-facing side of an [`ExternalAnalysis`] hook. Cheaply cloneable; every
/// clone observes the same rendezvous.
#[derive(Clone)]
pub struct ExternalAnalysisHandle {
    inner: Arc<RendezvousInner>,
}

impl ExternalAnalysisHandle {
    /// Block until a window is published or the hook is stopped. Returns `None` once stopped,
    /// at which point the caller should exit its loop.
    pub fn wait_for_work(&self) -> Option<(usize, usize)> {
        let mut state = self.inner.state.lock().expect("rendezvous mutex poisoned");
        while !state.can_run && !state.stop {
            state = self
                .inner
                .cv
                .wait(state)
                .expect("rendezvous mutex poisoned");
        }
        if state.stop {
            None
        } else {
            Some((state.from, state.to))
        }
    }

    /// Report the earliest counter still needed, completing the rendezvous for this window.
    pub fn report_done(&self, need_from: usize) {
        let mut state = self.inner.state.lock().expect("rendezvous mutex poisoned");
        state.need_from = Some(need_from);
        self.inner.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelInfo;
    use std::thread;

    fn channel_buffer(absolute_channel: usize, enabled_channel_number: usize) -> ChannelBuffer {
        let info = ChannelInfo {
            board: 0,
            chip: 0,
            channel_in_board: absolute_channel,
            absolute_channel,
            enabled_channel_number,
            byte_offset: 0,
            nbytes: 1,
            shift: 0,
            nbits: 8,
        };
        ChannelBuffer::new(info, 16, 0).unwrap()
    }

    #[test]
    fn disk_dump_rejects_pattern_without_percent() {
        let (mut dump, _control) = DiskDump::new("channel_data.dat");
        let channels = vec![channel_buffer(3, 0)];
        assert!(dump.init(&channels).is_err());
    }

    #[test]
    fn disk_dump_writes_samples_and_advances_next_data() {
        let dir = tempfile::tempdir().unwrap();
        let (mut dump, _control) =
            DiskDump::with_options(dir.path(), "channel_%.dat", DEFAULT_SAMPLING);
        let channels = vec![channel_buffer(5, 0)];
        dump.init(&channels).unwrap();
        channels[0].ring.push(10);
        channels[0].ring.push(20);

        let need = dump.run(&channels, 0, 2).unwrap();
        assert_eq!(need, 2);
        dump.finish().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("channel_5.dat")).unwrap();
        assert_eq!(contents, "10\n20\n");
    }

    #[test]
    fn disk_dump_sampling_skips_shots() {
        let dir = tempfile::tempdir().unwrap();
        let (mut dump, control) =
            DiskDump::with_options(dir.path(), "channel_%.dat", DEFAULT_SAMPLING);
        let channels = vec![channel_buffer(0, 0)];
        dump.init(&channels).unwrap();
        control.set_sampling(2);
        for v in [1, 2, 3, 4] {
            channels[0].ring.push(v);
        }
        dump.run(&channels, 0, 4).unwrap();
        dump.finish().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("channel_0.dat")).unwrap();
        assert_eq!(contents, "1\n3\n");
    }

    #[test]
    fn disk_dump_pause_emits_blank_line_and_resume_marker() {
        let dir = tempfile::tempdir().unwrap();
        let (mut dump, control) =
            DiskDump::with_options(dir.path(), "channel_%.dat", DEFAULT_SAMPLING);
        let channels = vec![channel_buffer(0, 0)];
        dump.init(&channels).unwrap();
        for v in [1, 2, 3] {
            channels[0].ring.push(v);
        }

        dump.run(&channels, 0, 1).unwrap();
        control.pause();
        dump.run(&channels, 1, 2).unwrap();
        control.resume();
        dump.run(&channels, 2, 3).unwrap();
        dump.finish().unwrap();

        let contents = std::fs::read_to_string(dir.path().join("channel_0.dat")).unwrap();
        assert_eq!(contents, "1\n\n# resume: 2\n3\n");
    }

    #[test]
    fn external_analysis_rendezvous_round_trips() {
        let (mut hook, handle) = ExternalAnalysis::new();
        let worker = thread::spawn(move || {
            let (from, to) = handle.wait_for_work().expect("should get a window");
            assert_eq!((from, to), (0, 128));
            handle.report_done(64);
            assert!(handle.wait_for_work().is_none());
        });

        let channels: Vec<ChannelBuffer> = Vec::new();
        let need = hook.run(&channels, 0, 128).unwrap();
        assert_eq!(need, 64);
        hook.finish().unwrap();
        worker.join().unwrap();
    }
}
