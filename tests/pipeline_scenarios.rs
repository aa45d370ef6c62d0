//! End-to-end pipeline scenarios exercised through the public API: real UDP sockets feed
//! `PacketBuffer`, a background thread runs the `ChannelDataExtractor`, and the decoded samples
//! are checked against the expected shot values.
//!
//! Scenario and invariant numbering follows `SPEC_FULL.md` §8.

use std::net::UdpSocket;
use std::thread;

use apdcam10g_daq::channel::{derive_layout, ChannelBuffer};
use apdcam10g_daq::extractor::ChannelDataExtractor;
use apdcam10g_daq::network::socket::{StreamHeader, STREAM_HEADER_LEN};
use apdcam10g_daq::network::{PacketBuffer, UdpIngestSocket};
use apdcam10g_daq::processor::{DiskDump, Processor, DEFAULT_SAMPLING};
use apdcam10g_daq::stop::StopToken;

/// Bind an ingest socket plus a loopback sender already connected to it.
fn ingest_pair() -> (UdpIngestSocket, UdpSocket) {
    let socket = UdpIngestSocket::bind(0).expect("bind ingest socket");
    let addr = socket.local_addr().expect("local addr");
    let sender = UdpSocket::bind("127.0.0.1:0").expect("bind sender");
    sender.connect(addr).expect("connect sender");
    (socket, sender)
}

fn datagram(counter: u64, adc_bytes: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; STREAM_HEADER_LEN + adc_bytes.len()];
    StreamHeader::write_counter(&mut buf, counter);
    buf[STREAM_HEADER_LEN..].copy_from_slice(adc_bytes);
    buf
}

/// S2: 14-bit resolution, two channels in one chip, arranged so the second channel's 3-byte
/// value straddles a packet boundary by exactly 2 bytes — the full slack the ring buffer
/// reserves for this purpose.
#[test]
fn s2_straddling_channel_value_decodes_across_packet_boundary() {
    let mut chip = vec![false; 8];
    chip[0] = true;
    chip[1] = true;
    let layout = derive_layout(&[vec![chip]], &[14]).unwrap().remove(0);
    assert_eq!(layout.board_bytes_per_shot, 4);

    // Four shots of (channel0, channel1) values, encoded into one 16-byte scratch buffer.
    let shots = [(100u32, 200u32), (300, 400), (500, 600), (700, 800)];
    let mut scratch = vec![0u8; layout.board_bytes_per_shot * shots.len()];
    for (i, &(v0, v1)) in shots.iter().enumerate() {
        let shot = &mut scratch[i * 4..i * 4 + 4];
        layout.channels[0].encode(shot, v0).unwrap();
        layout.channels[1].encode(shot, v1).unwrap();
    }

    // Packet 1 carries shots 0, 1, and the first 2 bytes of shot 2 (10 bytes total) — channel
    // 1 of shot 2 spans bytes 9..12 of the stream, so only its first byte (9) lands here.
    let packet1_adc = &scratch[0..10];
    // Packet 2 carries the other 2 bytes of shot 2's channel 1, then all of shot 3.
    let packet2_adc = &scratch[10..16];

    let (mut socket, sender) = ingest_pair();
    let pb = PacketBuffer::new(8, 64).unwrap();
    let stop = StopToken::new();

    let channel_buffers: Vec<ChannelBuffer> = layout
        .channels
        .iter()
        .map(|c| ChannelBuffer::new(*c, 16, 0).unwrap())
        .collect();
    let extractor = ChannelDataExtractor::new(0, layout.clone());

    thread::scope(|s| {
        let handle = s.spawn(|| extractor.run(&pb, &channel_buffers));

        sender.send(&datagram(0, packet1_adc)).unwrap();
        pb.receive(&mut socket, &stop).unwrap();
        sender.send(&datagram(1, packet2_adc)).unwrap();
        pb.receive(&mut socket, &stop).unwrap();
        pb.ring().terminate();

        handle.join().unwrap().unwrap();
    });

    let ch0 = &channel_buffers[0].ring;
    let ch1 = &channel_buffers[1].ring;
    assert_eq!(ch0.push_counter(), 4);
    assert_eq!(ch1.push_counter(), 4);
    for (i, &(v0, v1)) in shots.iter().enumerate() {
        assert_eq!(*ch0.get(i), v0, "channel 0 shot {i}");
        assert_eq!(*ch1.get(i), v1, "channel 1 shot {i}");
    }
}

/// S3: packet counters {0, 3} arrive over a real socket; counters 1 and 2 must be synthesized
/// as zero-filled packets, and the genuinely received packet must land in the last slot of the
/// batch so time order is preserved. Also exercises invariant 3 (received + lost == published).
#[test]
fn s3_gap_is_repaired_with_zero_filled_packets() {
    let (mut socket, sender) = ingest_pair();
    let pb = PacketBuffer::new(8, 64).unwrap();
    let stop = StopToken::new();

    sender.send(&datagram(0, &[0xAA; 4])).unwrap();
    assert!(pb.receive(&mut socket, &stop).unwrap());

    sender.send(&datagram(3, &[0xBB; 4])).unwrap();
    assert!(pb.receive(&mut socket, &stop).unwrap());

    assert_eq!(pb.ring().push_counter(), 4);
    assert_eq!(pb.received_packets(), 2);
    assert_eq!(pb.lost_packets(), 2);
    assert_eq!(
        pb.received_packets() + pb.lost_packets(),
        pb.ring().push_counter() as u64,
        "invariant 3: received + lost accounts for every published packet"
    );

    assert_eq!(pb.ring().get(0).adc_data()[..4], [0xAA; 4]);
    // The two synthesized fill packets are all-zero.
    assert_eq!(pb.ring().get(1).adc_data()[..4], [0; 4]);
    assert_eq!(pb.ring().get(2).adc_data()[..4], [0; 4]);
    // The genuinely received packet is swapped into the last slot of the batch.
    assert_eq!(pb.ring().get(3).adc_data()[..4], [0xBB; 4]);
}

/// Invariant 2: within one board, every enabled channel's buffer advances in lockstep, since
/// the extractor pushes every channel of a shot before moving to the next one.
#[test]
fn invariant2_board_channels_share_a_common_watermark() {
    let mut chip = vec![false; 8];
    chip[0] = true;
    chip[1] = true;
    let layout = derive_layout(&[vec![chip]], &[10]).unwrap().remove(0);

    let shots = 5;
    let mut adc = vec![0u8; layout.board_bytes_per_shot * shots];
    for i in 0..shots {
        let shot = &mut adc[i * layout.board_bytes_per_shot..(i + 1) * layout.board_bytes_per_shot];
        layout.channels[0].encode(shot, (i as u32 * 3) % 1024).unwrap();
        layout.channels[1].encode(shot, (i as u32 * 5) % 1024).unwrap();
    }

    let (mut socket, sender) = ingest_pair();
    let pb = PacketBuffer::new(8, 256).unwrap();
    let stop = StopToken::new();
    let channel_buffers: Vec<ChannelBuffer> = layout
        .channels
        .iter()
        .map(|c| ChannelBuffer::new(*c, 16, 0).unwrap())
        .collect();
    let extractor = ChannelDataExtractor::new(0, layout);

    thread::scope(|s| {
        let handle = s.spawn(|| extractor.run(&pb, &channel_buffers));
        sender.send(&datagram(0, &adc)).unwrap();
        pb.receive(&mut socket, &stop).unwrap();
        pb.ring().terminate();
        handle.join().unwrap().unwrap();
    });

    assert_eq!(
        channel_buffers[0].ring.push_counter(),
        channel_buffers[1].ring.push_counter()
    );
    assert_eq!(channel_buffers[0].ring.push_counter(), shots);
}

/// Invariant 6: for packet streams carrying exactly `k` whole shots per packet (no straddling
/// channel), the extractor's output matches decoding each shot independently, for several `k`.
#[test]
fn invariant6_whole_shots_per_packet_matches_naive_decode() {
    let mut chip = vec![false; 8];
    chip[0] = true;
    let layout = derive_layout(&[vec![chip]], &[8]).unwrap().remove(0);
    assert_eq!(layout.board_bytes_per_shot, 4);

    const TOTAL_SHOTS: usize = 9;
    let expected: Vec<u32> = (0..TOTAL_SHOTS as u32).map(|i| (i * 7 + 3) % 256).collect();

    for k in [1usize, 2, 3] {
        let (mut socket, sender) = ingest_pair();
        let pb = PacketBuffer::new(16, 256).unwrap();
        let stop = StopToken::new();
        let channel_buffers = vec![ChannelBuffer::new(layout.channels[0], 32, 0).unwrap()];
        let extractor = ChannelDataExtractor::new(0, layout.clone());

        thread::scope(|s| {
            let handle = s.spawn(|| extractor.run(&pb, &channel_buffers));

            let mut counter = 0u64;
            let mut shot = 0usize;
            while shot < TOTAL_SHOTS {
                let this_k = k.min(TOTAL_SHOTS - shot);
                let mut adc = vec![0u8; layout.board_bytes_per_shot * this_k];
                for j in 0..this_k {
                    let offset = j * layout.board_bytes_per_shot;
                    adc[offset] = expected[shot + j] as u8;
                }
                sender.send(&datagram(counter, &adc)).unwrap();
                pb.receive(&mut socket, &stop).unwrap();
                counter += 1;
                shot += this_k;
            }
            pb.ring().terminate();
            handle.join().unwrap().unwrap();
        });

        assert_eq!(channel_buffers[0].ring.push_counter(), TOTAL_SHOTS, "k={k}");
        for i in 0..TOTAL_SHOTS {
            assert_eq!(*channel_buffers[0].ring.get(i), expected[i], "k={k} shot={i}");
        }
    }
}

/// S5: pause/resume toggled mid-run must emit a blank line on the pause transition and a
/// `# resume: <shot>` marker on the resume transition, with sampling otherwise undisturbed.
#[test]
fn s5_pause_resume_markers_bracket_a_longer_run() {
    let dir = tempfile::tempdir().unwrap();
    let (mut dump, control) =
        DiskDump::with_options(dir.path(), "channel_%.dat", DEFAULT_SAMPLING);

    let info = apdcam10g_daq::channel::ChannelInfo {
        board: 0,
        chip: 0,
        channel_in_board: 0,
        absolute_channel: 0,
        enabled_channel_number: 0,
        byte_offset: 0,
        nbytes: 1,
        shift: 0,
        nbits: 8,
    };
    let channels = vec![ChannelBuffer::new(info, 128, 0).unwrap()];
    for v in 0..100u32 {
        channels[0].ring.push(v);
    }

    dump.init(&channels).unwrap();
    dump.run(&channels, 0, 30).unwrap();
    control.pause();
    dump.run(&channels, 30, 60).unwrap();
    control.resume();
    dump.run(&channels, 60, 100).unwrap();
    dump.finish().unwrap();

    let contents = std::fs::read_to_string(dir.path().join("channel_0.dat")).unwrap();

    let mut expected = String::new();
    for v in 0..30 {
        expected.push_str(&format!("{v}\n"));
    }
    expected.push('\n');
    expected.push_str("# resume: 60\n");
    for v in 60..100 {
        expected.push_str(&format!("{v}\n"));
    }

    assert_eq!(contents, expected);
}
