//! Per-board channel data extractor: decodes the bit-packed shot stream out of a board's
//! packet buffer into its per-channel sample buffers.
//!
//! Ported from the reference `channel_data_extractor::run` state machine. `shot_offset` tracks
//! where the next unprocessed shot begins relative to the front packet's ADC payload, and may
//! go negative when a shot began in a packet that has already been popped.

use tracing::warn;

use crate::channel::{BoardLayout, ChannelBuffer};
use crate::error::DaqResult;
use crate::network::PacketBuffer;

/// Decodes one board's packet stream into its enabled channels' sample buffers.
pub struct ChannelDataExtractor {
    board: usize,
    layout: BoardLayout,
}

impl ChannelDataExtractor {
    /// Build an extractor for `board` using its derived channel layout.
    pub fn new(board: usize, layout: BoardLayout) -> Self {
        Self { board, layout }
    }

    /// Run the extraction loop until the board's network buffer terminates. Intended to be
    /// the entire body of the extractor's dedicated thread.
    ///
    /// # Errors
    /// Returns a decode error if a channel's sample cannot be decoded (should not happen for
    /// a correctly derived layout; surfaced rather than silently dropped).
    pub fn run(
        &self,
        network_buffer: &PacketBuffer,
        channel_buffers: &[ChannelBuffer],
    ) -> DaqResult<()> {
        let ring = network_buffer.ring();
        let board_bytes_per_shot = self.layout.board_bytes_per_shot as i64;

        loop {
            // Wait for at least one packet to be available.
            loop {
                if !ring.is_empty() {
                    break;
                }
                if ring.terminated() {
                    self.terminate_all(channel_buffers);
                    return Ok(());
                }
                std::hint::spin_loop();
            }

            let mut shot_offset: i64 = 0;

            loop {
                for (i_channel, c) in self.layout.channels.iter().enumerate() {
                    let packet_size = ring.get(0).adc_data_size() as i64;
                    let first = shot_offset + c.byte_offset as i64;
                    let last = first + c.nbytes as i64;

                    if last <= packet_size {
                        // Whole-in-packet.
                        let packet = ring.get(0);
                        let value = c.decode(&packet.adc_data()[shot_offset as usize..])?;
                        channel_buffers[c.enabled_channel_number].ring.push(value);
                    } else if first < packet_size {
                        // Straddles the packet boundary by at most 2 bytes (enforced by
                        // chip byte-alignment and nbytes <= 3): borrow the next packet's
                        // leading bytes into this packet's 2-byte slack, flattening the
                        // value, then decode.
                        loop {
                            if ring.size() >= 2 {
                                break;
                            }
                            if ring.terminated() {
                                self.terminate_all(channel_buffers);
                                return Ok(());
                            }
                            std::hint::spin_loop();
                        }
                        let next_bytes = {
                            let next = ring.get(1);
                            [next.adc_data()[0], next.adc_data()[1]]
                        };
                        let packet = ring.get_mut(0);
                        packet.slack_mut().copy_from_slice(&next_bytes);
                        let value = c.decode(&packet.adc_data()[shot_offset as usize..])?;
                        channel_buffers[c.enabled_channel_number].ring.push(value);

                        shot_offset -= packet_size;
                        ring.pop();
                    } else {
                        // Entirely in the next packet.
                        ring.pop();
                        loop {
                            if !ring.is_empty() {
                                break;
                            }
                            if ring.terminated() {
                                self.terminate_all(channel_buffers);
                                return Ok(());
                            }
                            std::hint::spin_loop();
                        }
                        // Rebind to the new front before rebasing shot_offset: its size, not
                        // the popped packet's, is what the original subtracts here, and the
                        // two can differ when packet sizes vary mid-stream (the stream's final,
                        // shorter datagram).
                        let new_packet_size = ring.get(0).adc_data_size() as i64;
                        shot_offset -= new_packet_size;
                        if i_channel == 0 {
                            shot_offset = 0;
                        }
                        let packet = ring.get(0);
                        let value = c.decode(&packet.adc_data()[shot_offset as usize..])?;
                        channel_buffers[c.enabled_channel_number].ring.push(value);
                    }
                }
                shot_offset += board_bytes_per_shot;
            }
        }
    }

    fn terminate_all(&self, channel_buffers: &[ChannelBuffer]) {
        warn!(board = self.board, "network stream ended, terminating channel buffers");
        for c in channel_buffers {
            c.ring.terminate();
        }
    }
}
