//! Single-thread processor scheduler: waits for an aligned window of shots across every board,
//! invokes the registered processors, and reclaims buffer space.
//!
//! Ported from the scheduler loop in `daq.C` (the body of the processor thread). Each tick:
//! find the board-minimum available watermark (`common_push`) and the board-maximum already
//! reclaimed counter (`common_pop`); if the window is non-empty, run every processor over it
//! and pop every channel buffer to the smallest counter any processor still needs.

use tracing::{info, warn};

use crate::channel::ChannelBuffer;
use crate::error::{DaqError, DaqResult};
use crate::processor::Processor;
use crate::stop::StopToken;

/// Drives a list of [`Processor`]s over the shots available across every enabled channel.
pub struct Scheduler {
    process_period: usize,
    processors: Vec<Box<dyn Processor>>,
}

impl Scheduler {
    /// Create a scheduler with the given process period (must be a power of two — the nominal
    /// window size in shots between ticks).
    pub fn new(process_period: usize) -> DaqResult<Self> {
        if process_period == 0 || (process_period & (process_period - 1)) != 0 {
            return Err(DaqError::Configuration(format!(
                "process_period {process_period} must be a power of two"
            )));
        }
        Ok(Self {
            process_period,
            processors: Vec::new(),
        })
    }

    /// Register a processor; processors run in insertion order on every tick.
    pub fn add_processor(&mut self, processor: Box<dyn Processor>) {
        self.processors.push(processor);
    }

    /// Run until every board's watermark buffer reports `terminated`, or `stop` is signaled.
    ///
    /// `board_watermarks` holds, per board, the last enabled channel's buffer (the board's
    /// available-watermark, since the extractor pushes channels of one shot in order).
    /// `all_channels` is the flattened, stable-ordered list of every enabled channel buffer
    /// across all boards, handed to every processor on every call.
    ///
    /// # Errors
    /// Returns [`DaqError::ProcessorContract`] if a processor returns a `need` counter past
    /// the window it was given — a programming error in that processor, fatal to the run.
    pub fn run(
        &mut self,
        board_watermarks: &[&ChannelBuffer],
        all_channels: &[ChannelBuffer],
        stop: &StopToken,
    ) -> DaqResult<()> {
        for p in &mut self.processors {
            p.init(all_channels)?;
        }

        let mut to_counter = self.process_period;
        loop {
            let mut common_push = 0usize;
            let mut common_pop = 0usize;
            let mut non_terminated_exists = false;

            for (i, board) in board_watermarks.iter().enumerate() {
                let mut push_counter;
                loop {
                    push_counter = board.ring.push_counter();
                    if push_counter >= to_counter || board.ring.terminated() || stop.is_stopped() {
                        break;
                    }
                    std::hint::spin_loop();
                }
                if board.ring.terminated() {
                    push_counter = board.ring.push_counter();
                } else if !stop.is_stopped() {
                    non_terminated_exists = true;
                }

                if i == 0 || push_counter < common_push {
                    common_push = push_counter;
                }
                let pop_counter = board.ring.pop_counter();
                if pop_counter > common_pop {
                    common_pop = pop_counter;
                }
            }

            if common_push > common_pop {
                let mut needed = common_push;
                for p in &mut self.processors {
                    let this_needs = p.run(all_channels, common_pop, common_push)?;
                    if this_needs > common_push {
                        return Err(DaqError::ProcessorContract {
                            need: this_needs,
                            to_counter: common_push,
                        });
                    }
                    needed = needed.min(this_needs);
                }
                for c in all_channels {
                    c.ring.pop_to(needed);
                }
            }

            if !non_terminated_exists || stop.is_stopped() {
                info!("every board terminated, stopping scheduler");
                for p in &mut self.processors {
                    if let Err(e) = p.finish() {
                        warn!(error = %e, "processor finish() failed");
                    }
                }
                return Ok(());
            }

            to_counter = common_push + self.process_period;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn channel_buffer(absolute_channel: usize) -> ChannelBuffer {
        let info = ChannelInfo {
            board: 0,
            chip: 0,
            channel_in_board: absolute_channel,
            absolute_channel,
            enabled_channel_number: 0,
            byte_offset: 0,
            nbytes: 1,
            shift: 0,
            nbits: 8,
        };
        ChannelBuffer::new(info, 256, 0).unwrap()
    }

    struct RecordingProcessor {
        calls: Arc<AtomicUsize>,
        reply: usize,
    }

    impl Processor for RecordingProcessor {
        fn run(&mut self, _channels: &[ChannelBuffer], from: usize, to: usize) -> DaqResult<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = (from, to);
            Ok(self.reply)
        }
    }

    #[test]
    fn rejects_non_power_of_two_period() {
        assert!(Scheduler::new(100).is_err());
        assert!(Scheduler::new(128).is_ok());
    }

    #[test]
    fn s6_two_processors_reclaim_by_minimum_need() {
        // S6: two processors, one returns to_counter (nothing needed), the other returns
        // from_counter (everything needed); after one tick over [0,128) no reclamation occurs.
        let buffer = channel_buffer(0);
        for v in 0..128u32 {
            buffer.ring.push(v);
        }
        buffer.ring.terminate();

        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_b = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(128).unwrap();
        scheduler.add_processor(Box::new(RecordingProcessor {
            calls: calls_a.clone(),
            reply: 128,
        }));
        scheduler.add_processor(Box::new(RecordingProcessor {
            calls: calls_b.clone(),
            reply: 0,
        }));

        let channels = vec![buffer];
        let watermarks: Vec<&ChannelBuffer> = channels.iter().collect();
        let stop = StopToken::new();
        scheduler.run(&watermarks, &channels, &stop).unwrap();

        assert_eq!(calls_a.load(Ordering::SeqCst), 1);
        assert_eq!(calls_b.load(Ordering::SeqCst), 1);
        assert_eq!(channels[0].ring.pop_counter(), 0);
    }

    #[test]
    fn processor_contract_violation_is_an_error() {
        struct Greedy;
        impl Processor for Greedy {
            fn run(&mut self, _c: &[ChannelBuffer], _from: usize, to: usize) -> DaqResult<usize> {
                Ok(to + 1)
            }
        }

        let buffer = channel_buffer(0);
        for v in 0..128u32 {
            buffer.ring.push(v);
        }
        buffer.ring.terminate();

        let mut scheduler = Scheduler::new(128).unwrap();
        scheduler.add_processor(Box::new(Greedy));
        let channels = vec![buffer];
        let watermarks: Vec<&ChannelBuffer> = channels.iter().collect();
        let stop = StopToken::new();
        let err = scheduler.run(&watermarks, &channels, &stop).unwrap_err();
        assert!(matches!(err, DaqError::ProcessorContract { .. }));
    }
}
