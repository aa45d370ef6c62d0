//! Per-channel bit layout and the channel sample buffers.
//!
//! A board's shot is a dense, bit-packed record: channels within one chip are packed
//! back-to-back with no byte alignment, but each chip's group is rounded up to a whole byte,
//! and the whole shot is rounded up to a multiple of 4 bytes. [`derive_layout`] computes the
//! per-channel `byte_offset`/`nbytes`/`shift` from a channel mask and per-board resolution,
//! mirroring `channel_info::get_from_shot`/`set_in_shot` in the original firmware-facing code.

use crate::error::{DaqError, DaqResult};
use crate::ring_buffer::RingBuffer;

/// Number of chips per ADC board; each chip carries up to 8 channels.
pub const CHANNELS_PER_CHIP: usize = 8;
/// Number of channels per ADC board.
pub const CHANNELS_PER_BOARD: usize = 32;

/// Static, per-run description of where one enabled channel's samples live inside a board's
/// shot record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    /// ADC board index (0..=3).
    pub board: usize,
    /// Chip index within the board (0..=3).
    pub chip: usize,
    /// Channel index within the board (0..=31).
    pub channel_in_board: usize,
    /// Global channel index, stable across the run: `board * CHANNELS_PER_BOARD + channel_in_board`.
    pub absolute_channel: usize,
    /// Index of this channel among all enabled channels of its board, in wire order. Used to
    /// address a channel's output file/column without rescanning the mask.
    pub enabled_channel_number: usize,
    /// Byte offset of the first (possibly partial) byte of this channel's value within the
    /// board's shot record.
    pub byte_offset: usize,
    /// Number of bytes this value spans (1..=3).
    pub nbytes: usize,
    /// Right-shift applied after assembling the big-endian byte span, to align the value's
    /// least-significant bit to bit 0.
    pub shift: u32,
    /// Resolution in bits.
    pub nbits: u32,
}

impl ChannelInfo {
    fn mask(&self) -> u32 {
        if self.nbits >= 32 {
            u32::MAX
        } else {
            (1u32 << self.nbits) - 1
        }
    }

    /// Decode this channel's sample from a shot-local byte slice (`shot` starts at the first
    /// byte of the board's shot record).
    pub fn decode(&self, shot: &[u8]) -> DaqResult<u32> {
        let p = &shot[self.byte_offset..];
        let raw: u32 = match self.nbytes {
            1 => p[0] as u32,
            2 => ((p[0] as u32) << 8) | (p[1] as u32),
            3 => ((p[0] as u32) << 16) | ((p[1] as u32) << 8) | (p[2] as u32),
            n => {
                return Err(DaqError::Configuration(format!(
                    "channel value spans {n} bytes, expected 1..=3"
                )))
            }
        };
        Ok((raw >> self.shift) & self.mask())
    }

    /// Encode `value` into this channel's slot within a shot-local byte slice, preserving the
    /// bits of any neighboring channel packed into the same byte.
    pub fn encode(&self, shot: &mut [u8], value: u32) -> DaqResult<()> {
        if self.nbytes == 0 || self.nbytes > 3 {
            return Err(DaqError::Configuration(format!(
                "channel value spans {} bytes, expected 1..=3",
                self.nbytes
            )));
        }
        let mut val = (value & self.mask()) << self.shift;
        let mut remaining_bits = self.nbits as i32;
        let mut actual_shift = self.shift as i32;
        for i_byte in (0..self.nbytes).rev() {
            let actual_bits = (8 - actual_shift).min(remaining_bits);
            let byte_mask = byte_mask(actual_bits as u32, actual_shift as u32);
            let idx = self.byte_offset + i_byte;
            shot[idx] = (shot[idx] & !byte_mask) | ((val as u8) & byte_mask);
            actual_shift = 0;
            remaining_bits -= actual_bits;
            val >>= 8;
        }
        Ok(())
    }
}

fn byte_mask(nbits: u32, shift: u32) -> u8 {
    let m: u32 = if nbits >= 8 { 0xFF } else { (1u32 << nbits) - 1 };
    ((m << shift) & 0xFF) as u8
}

/// The derived per-board layout: the ordered list of enabled channels and the total shot
/// length (already rounded up to a multiple of 4 bytes).
#[derive(Debug, Clone)]
pub struct BoardLayout {
    /// Enabled channels of this board, in wire order.
    pub channels: Vec<ChannelInfo>,
    /// Total number of bytes per shot for this board.
    pub board_bytes_per_shot: usize,
}

/// Compute the per-board layout from a channel-enable mask and per-board resolution.
///
/// `channel_masks[board][chip][channel_in_chip]` is `true` if that channel is enabled.
/// `resolution_bits[board]` gives the bit depth shared by every channel of that board.
///
/// # Errors
/// Returns [`DaqError::Configuration`] if a resolution is outside `8..=14`, or if
/// `channel_masks`/`resolution_bits` disagree in length.
pub fn derive_layout(
    channel_masks: &[Vec<Vec<bool>>],
    resolution_bits: &[u32],
) -> DaqResult<Vec<BoardLayout>> {
    if channel_masks.len() != resolution_bits.len() {
        return Err(DaqError::Configuration(format!(
            "channel_masks has {} boards but resolution_bits has {}",
            channel_masks.len(),
            resolution_bits.len()
        )));
    }

    let mut boards = Vec::with_capacity(channel_masks.len());
    for (board, (chips, &nbits)) in channel_masks.iter().zip(resolution_bits.iter()).enumerate() {
        if !(8..=14).contains(&nbits) {
            return Err(DaqError::Configuration(format!(
                "board {board} resolution {nbits} outside supported range 8..=14"
            )));
        }

        let mut channels = Vec::new();
        let mut chip_byte_offset = 0usize;
        let mut enabled_channel_number = 0usize;

        for (chip, channel_enabled) in chips.iter().enumerate() {
            let mut channel_bit_offset = 0u32;
            for (channel_in_chip, &enabled) in channel_enabled.iter().enumerate() {
                if !enabled {
                    continue;
                }
                let channel_in_board = chip * CHANNELS_PER_CHIP + channel_in_chip;
                let startbit = channel_bit_offset % 8;
                let byte_offset = chip_byte_offset + (channel_bit_offset / 8) as usize;
                let nbytes = ((startbit + nbits) as usize).div_ceil(8);
                let shift = (8 - ((startbit + nbits) % 8)) % 8;

                channels.push(ChannelInfo {
                    board,
                    chip,
                    channel_in_board,
                    absolute_channel: board * CHANNELS_PER_BOARD + channel_in_board,
                    enabled_channel_number,
                    byte_offset,
                    nbytes,
                    shift,
                    nbits,
                });

                enabled_channel_number += 1;
                channel_bit_offset += nbits;
            }
            // Round the chip's used bits up to a whole byte before starting the next chip.
            chip_byte_offset += (channel_bit_offset as usize).div_ceil(8);
        }

        // Round the board's total bytes up to a multiple of 4.
        let board_bytes_per_shot = chip_byte_offset.div_ceil(4) * 4;

        for c in &channels {
            if c.byte_offset + c.nbytes > board_bytes_per_shot {
                return Err(DaqError::Configuration(format!(
                    "board {board} channel {} overruns shot length ({} + {} > {})",
                    c.absolute_channel, c.byte_offset, c.nbytes, board_bytes_per_shot
                )));
            }
        }

        boards.push(BoardLayout {
            channels,
            board_bytes_per_shot,
        });
    }

    Ok(boards)
}

/// A per-channel ring buffer of decoded samples, tagged with the static [`ChannelInfo`] it
/// belongs to — the "augmented ring buffer" the scheduler and processors key off of.
#[derive(Debug)]
pub struct ChannelBuffer {
    /// Static layout info for this channel.
    pub info: ChannelInfo,
    /// The underlying sample ring.
    pub ring: RingBuffer<u32>,
}

impl ChannelBuffer {
    /// Create a channel buffer with the given capacity (must be a power of two) and
    /// `extra_size` slots of wraparound-flattening slack for [`RingBuffer::range`] reads.
    pub fn new(info: ChannelInfo, capacity: usize, extra_size: usize) -> DaqResult<Self> {
        Ok(Self {
            info,
            ring: RingBuffer::new(capacity, extra_size)?,
        })
    }
}
