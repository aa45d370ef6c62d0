//! UDP ingest with gap repair.
//!
//! Wraps a [`RingBuffer`] of fixed-size packet slots. `receive` reads one datagram from the
//! socket per call; if the stream's packet counter jumped ahead of what was expected, it
//! synthesizes zero-filled packets for every missing counter value and publishes the whole
//! batch — received packet included — in time order, exactly mirroring
//! `udp_packet_buffer::receive` in the reference implementation.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{error, info, warn};

use crate::error::{DaqError, DaqResult};
use crate::network::socket::{StreamHeader, UdpIngestSocket, STREAM_HEADER_LEN};
use crate::ring_buffer::RingBuffer;
use crate::stop::StopToken;

/// One packet's worth of backing storage plus the number of bytes actually received into it.
/// Each slot's payload reserves 2 bytes of trailing slack so the extractor can flatten a
/// value that spills at most 2 bytes into the next packet.
#[derive(Clone)]
pub struct PacketSlot {
    data: Vec<u8>,
    size: usize,
}

impl PacketSlot {
    fn new(max_packet_size: usize) -> Self {
        Self {
            data: vec![0u8; max_packet_size + 2],
            size: 0,
        }
    }

    /// The ADC payload bytes of this packet (header stripped), plus 2 bytes of readable slack
    /// immediately following — used by the extractor to flatten a straddling channel value.
    pub fn adc_data(&self) -> &[u8] {
        &self.data[STREAM_HEADER_LEN..]
    }

    /// Number of ADC payload bytes actually received (excludes the header and the slack).
    pub fn adc_data_size(&self) -> usize {
        self.size.saturating_sub(STREAM_HEADER_LEN)
    }

    /// Mutable access to the first 2 bytes of slack following this packet's usable bytes, used
    /// to stage a straddling value's tail bytes borrowed from the next packet.
    pub fn slack_mut(&mut self) -> &mut [u8] {
        let start = self.size;
        &mut self.data[start..start + 2]
    }

    /// Test-only helper: load a full datagram (header + ADC payload) into this slot as if it
    /// had just been received off the wire.
    #[cfg(test)]
    pub fn set_for_test(&mut self, datagram: &[u8]) {
        self.data[..datagram.len()].copy_from_slice(datagram);
        self.size = datagram.len();
    }
}

/// A ring buffer of received UDP packets, transparently repairing gaps caused by packet loss
/// by synthesizing zero-filled placeholder packets.
///
/// The bookkeeping counters are atomics rather than plain fields, even though only the network
/// thread ever writes them, so a `&PacketBuffer` can be shared read-only with the extractor
/// thread (which only ever reads `ring()`) without a mutex — the same single-writer discipline
/// the ring buffer itself relies on.
pub struct PacketBuffer {
    ring: RingBuffer<PacketSlot>,
    max_packet_size: usize,
    expected_counter: AtomicU64,
    received_packets: AtomicU64,
    lost_packets: AtomicU64,
}

impl PacketBuffer {
    /// Create a packet buffer with room for `capacity` packets (power of two), each sized to
    /// hold up to `max_packet_size` bytes.
    pub fn new(capacity: usize, max_packet_size: usize) -> DaqResult<Self> {
        let ring = RingBuffer::new_with(capacity, 0, || PacketSlot::new(max_packet_size))?;
        Ok(Self {
            ring,
            max_packet_size,
            expected_counter: AtomicU64::new(0),
            received_packets: AtomicU64::new(0),
            lost_packets: AtomicU64::new(0),
        })
    }

    /// The underlying ring buffer, for the extractor to read packets from and pop.
    pub fn ring(&self) -> &RingBuffer<PacketSlot> {
        &self.ring
    }

    /// Total packets actually received off the wire since creation.
    pub fn received_packets(&self) -> u64 {
        self.received_packets.load(Ordering::Relaxed)
    }

    /// Total packets synthesized to cover detected gaps.
    pub fn lost_packets(&self) -> u64 {
        self.lost_packets.load(Ordering::Relaxed)
    }

    /// Receive one datagram from `socket` and publish it (plus any synthesized gap-fill
    /// packets) into the ring. Returns `Ok(true)` if a datagram was processed, `Ok(false)` if
    /// the stream was terminated (stop requested or transport error).
    ///
    /// Takes `&self`, not `&mut self`: only the network thread that owns this buffer's socket
    /// is expected to call `receive`, but other threads (the extractor) hold a shared
    /// reference at the same time to read `ring()`.
    ///
    /// # Errors
    /// Returns [`DaqError::Protocol`] if the packet counter goes backwards.
    pub fn receive(&self, socket: &mut UdpIngestSocket, stop: &StopToken) -> DaqResult<bool> {
        // Spin-wait for a free slot, watching the stop token so we don't block forever on
        // shutdown.
        loop {
            if self.ring.size() < self.ring.capacity() {
                break;
            }
            if stop.is_stopped() {
                self.ring.terminate();
                return Ok(false);
            }
            std::hint::spin_loop();
        }

        let slot = self.ring.future_element(0);
        // SAFETY: this slot is producer-exclusive (guarded by the capacity check above) and
        // not yet visible to the consumer.
        let record = unsafe { &mut *slot.get() };

        let received_size = match socket.recv(&mut record.data[..self.max_packet_size]) {
            Ok(n) => n,
            Err(e) => {
                info!(error = %e, "UDP stream ended (timeout or socket error)");
                self.ring.terminate();
                return Ok(false);
            }
        };
        record.size = received_size;
        self.received_packets.fetch_add(1, Ordering::Relaxed);

        let header = StreamHeader::parse(&record.data[..received_size.max(STREAM_HEADER_LEN)]);
        let counter = header.packet_counter;
        let expected = self.expected_counter.load(Ordering::Relaxed);

        if counter < expected {
            error!(expected, received = counter, "packet counter decreased");
            return Err(DaqError::Protocol {
                expected,
                received: counter,
            });
        }

        if counter == expected {
            self.ring.publish(1);
        } else {
            let lost = (counter - expected) as usize;
            self.lost_packets.fetch_add(lost as u64, Ordering::Relaxed);
            warn!(lost, expected, received = counter, "packet loss detected, synthesizing fill");

            for i in 0..lost {
                loop {
                    if self.ring.size() + i + 1 < self.ring.capacity() {
                        break;
                    }
                    if stop.is_stopped() {
                        self.ring.terminate();
                        return Ok(false);
                    }
                    std::hint::spin_loop();
                }
                let empty_cell = self.ring.future_element(1 + i);
                // SAFETY: producer-exclusive, not yet published.
                let empty = unsafe { &mut *empty_cell.get() };
                empty.data.iter_mut().for_each(|b| *b = 0);
                empty.size = self.max_packet_size;
                StreamHeader::write_counter(&mut empty.data, expected + i as u64);

                if i == lost - 1 {
                    // Swap the just-received packet with the last synthesized slot so
                    // time-order is preserved on the consumer side.
                    std::mem::swap(record, empty);
                }
            }

            self.ring.publish(lost + 1);
        }

        self.expected_counter.store(counter + 1, Ordering::Relaxed);
        Ok(true)
    }

    /// Mean/max fill-level summary, surfaced on graceful stop.
    pub fn summary(&self) -> String {
        format!(
            "received={} lost={} mean_fill={:.1} max_fill={} capacity={}",
            self.received_packets(),
            self.lost_packets(),
            self.ring.mean_size(),
            self.ring.max_size(),
            self.ring.capacity(),
        )
    }
}
