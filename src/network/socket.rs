//! Blocking UDP socket wrapper and stream-header parsing.
//!
//! The camera's stream header carries no explicit end-of-stream marker; it simply stops
//! sending. The wrapper models that by only arming a receive timeout once the first datagram
//! has arrived — before that, we are willing to wait indefinitely for the run to start.

use std::net::UdpSocket;
use std::time::Duration;

use crate::error::DaqResult;

/// Number of header bytes preceding the ADC payload in every datagram.
pub const STREAM_HEADER_LEN: usize = 22;
/// Byte offset of the 48-bit big-endian packet counter within the stream header.
const PACKET_COUNTER_OFFSET: usize = 8;
/// Width in bytes of the packet counter field.
const PACKET_COUNTER_LEN: usize = 6;

/// How long to wait for a new datagram once the stream has started, before concluding the
/// camera has stopped sending.
const IDLE_TIMEOUT: Duration = Duration::from_secs(3);

/// A parsed view of one datagram's stream header.
#[derive(Debug, Clone, Copy)]
pub struct StreamHeader {
    /// The monotonically increasing packet counter.
    pub packet_counter: u64,
}

impl StreamHeader {
    /// Parse the stream header from the start of a received datagram.
    ///
    /// # Panics
    /// Panics if `data` is shorter than [`STREAM_HEADER_LEN`] — the caller is responsible for
    /// having received at least a full header's worth of bytes.
    pub fn parse(data: &[u8]) -> Self {
        let field = &data[PACKET_COUNTER_OFFSET..PACKET_COUNTER_OFFSET + PACKET_COUNTER_LEN];
        let mut counter: u64 = 0;
        for &b in field {
            counter = (counter << 8) | b as u64;
        }
        Self {
            packet_counter: counter,
        }
    }

    /// Write a synthesized header's packet counter into a zero-filled datagram buffer, used
    /// when manufacturing a replacement for a lost packet.
    pub fn write_counter(data: &mut [u8], counter: u64) {
        let field = &mut data[PACKET_COUNTER_OFFSET..PACKET_COUNTER_OFFSET + PACKET_COUNTER_LEN];
        for (i, b) in field.iter_mut().enumerate() {
            let shift = 8 * (PACKET_COUNTER_LEN - 1 - i);
            *b = ((counter >> shift) & 0xFF) as u8;
        }
    }
}

/// A thin wrapper over a bound [`UdpSocket`] that arms the idle timeout after the first
/// successful receive, per the stream's silence-as-end-of-stream convention.
pub struct UdpIngestSocket {
    socket: UdpSocket,
    timeout_armed: bool,
}

impl UdpIngestSocket {
    /// Bind a UDP socket to `port` on all interfaces, for ingesting one board's stream.
    pub fn bind(port: u16) -> DaqResult<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;
        Ok(Self {
            socket,
            timeout_armed: false,
        })
    }

    /// Receive one datagram into `buf`, returning the number of bytes written.
    ///
    /// Blocks indefinitely until the first datagram arrives; every subsequent call is bounded
    /// by [`IDLE_TIMEOUT`].
    pub fn recv(&mut self, buf: &mut [u8]) -> DaqResult<usize> {
        let n = self.socket.recv(buf)?;
        if !self.timeout_armed {
            self.socket.set_read_timeout(Some(IDLE_TIMEOUT))?;
            self.timeout_armed = true;
        }
        Ok(n)
    }

    /// The address this socket is bound to; mainly useful in tests that bind to port 0 and
    /// need to discover the OS-assigned port to send datagrams to.
    pub fn local_addr(&self) -> DaqResult<std::net::SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_packet_counter_big_endian() {
        let mut buf = vec![0u8; STREAM_HEADER_LEN];
        StreamHeader::write_counter(&mut buf, 0x0102_0304_0506);
        let header = StreamHeader::parse(&buf);
        assert_eq!(header.packet_counter, 0x0102_0304_0506);
    }

    #[test]
    fn write_then_parse_roundtrips_for_small_counters() {
        let mut buf = vec![0u8; STREAM_HEADER_LEN];
        for counter in [0u64, 1, 255, 65536, u32::MAX as u64] {
            StreamHeader::write_counter(&mut buf, counter);
            assert_eq!(StreamHeader::parse(&buf).packet_counter, counter);
        }
    }
}
