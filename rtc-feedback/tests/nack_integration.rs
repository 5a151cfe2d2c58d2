//! Integration tests for the NACK generator and responder.
//!
//! A receiving peer and a sending peer are each wrapped in a `MockStream`;
//! RTCP written by one is fed by hand into the other.

use std::sync::Arc;
use std::time::Duration;

use rtc_feedback::mock::{MockStream, manual_ticker};
use rtc_feedback::{
    InterceptorBuilder, NackGeneratorBuilder, NackResponderBuilder, RTCPFeedback, Registry,
    RtcpPacket, StreamInfo,
};
use rtcp::transport_feedbacks::transport_layer_nack::{NackPair, TransportLayerNack};
use tokio::sync::mpsc;

// =============================================================================
// Helper Functions
// =============================================================================

fn nack_stream_info(ssrc: u32) -> StreamInfo {
    StreamInfo {
        ssrc,
        clock_rate: 90000,
        payload_type: 96,
        rtcp_feedback: vec![RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "".to_owned(),
        }],
        ..Default::default()
    }
}

fn nack_rtx_stream_info(ssrc: u32, rtx_ssrc: u32, rtx_pt: u8) -> StreamInfo {
    StreamInfo {
        ssrc_rtx: Some(rtx_ssrc),
        payload_type_rtx: Some(rtx_pt),
        ..nack_stream_info(ssrc)
    }
}

fn create_rtp_packet(ssrc: u32, seq: u16) -> rtp::packet::Packet {
    rtp::packet::Packet {
        header: rtp::header::Header {
            version: 2,
            ssrc,
            sequence_number: seq,
            timestamp: seq as u32 * 3000,
            payload_type: 96,
            ..Default::default()
        },
        payload: vec![0xAB, seq as u8, (seq >> 8) as u8].into(),
    }
}

async fn receiver_peer(info: &StreamInfo) -> (mpsc::Sender<()>, Arc<MockStream>) {
    let (tick, ticker_gen) = manual_ticker();
    let chain = Registry::new()
        .with(Box::new(
            NackGeneratorBuilder::new()
                .with_size(64)
                .with_ticker(ticker_gen),
        ))
        .build("receiver")
        .unwrap();
    (tick, MockStream::new(info, chain).await)
}

async fn sender_peer(info: &StreamInfo) -> Arc<MockStream> {
    let icpr = NackResponderBuilder::new().with_size(64).build("sender").unwrap();
    MockStream::new(info, icpr).await
}

async fn send(s: &MockStream, ssrc: u32, seqs: impl IntoIterator<Item = u16>) {
    for seq in seqs {
        s.write_rtp(&create_rtp_packet(ssrc, seq)).await.unwrap();
        let pkt = s.written_rtp().await.unwrap();
        assert_eq!(pkt.header.sequence_number, seq);
    }
}

async fn receive(s: &MockStream, ssrc: u32, seqs: impl IntoIterator<Item = u16>) {
    for seq in seqs {
        s.receive_rtp(create_rtp_packet(ssrc, seq)).await;
        let pkt = s.read_rtp().await.unwrap().unwrap();
        assert_eq!(pkt.header.sequence_number, seq);
    }
}

fn as_nack(pkts: &[RtcpPacket]) -> &TransportLayerNack {
    pkts[0]
        .as_any()
        .downcast_ref::<TransportLayerNack>()
        .expect("expected TransportLayerNack")
}

fn make_nack(media_ssrc: u32, seqs: &[u16]) -> Vec<RtcpPacket> {
    vec![Box::new(TransportLayerNack {
        sender_ssrc: 9,
        media_ssrc,
        nacks: seqs
            .iter()
            .map(|&packet_id| NackPair {
                packet_id,
                lost_packets: 0,
            })
            .collect(),
    })]
}

/// Hands the NACK batch to the sender and lets its RTCP reader observe it.
async fn deliver(sender: &MockStream, pkts: Vec<RtcpPacket>) {
    sender.receive_rtcp(pkts).await;
    sender.read_rtcp().await.unwrap().unwrap();
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_nack_generator_and_responder_recover_loss() {
    let info = nack_stream_info(1000);
    let (tick, receiver) = receiver_peer(&info).await;
    let sender = sender_peer(&info).await;

    send(&sender, 1000, 10..15).await;
    // 12 is lost on the way
    receive(&receiver, 1000, [10, 11, 13, 14]).await;

    tick.send(()).await.unwrap();
    let pkts = receiver.written_rtcp().await.unwrap();
    let nack = as_nack(&pkts);
    assert_eq!(nack.media_ssrc, 1000);
    assert_eq!(nack.nacks.len(), 1);
    assert_eq!(nack.nacks[0].packet_id, 12);
    assert_eq!(nack.nacks[0].lost_packets, 0);

    deliver(&sender, pkts).await;
    let retransmitted = sender.written_rtp().await.unwrap();
    assert_eq!(retransmitted, create_rtp_packet(1000, 12));

    // once the retransmission arrives nothing is missing anymore
    receive(&receiver, 1000, [12]).await;
    tick.send(()).await.unwrap();
    let r = tokio::time::timeout(Duration::from_millis(50), receiver.written_rtcp()).await;
    assert!(r.is_err(), "unexpected NACK after recovery");

    receiver.close().await.unwrap();
    sender.close().await.unwrap();
}

#[tokio::test]
async fn test_nack_generator_no_nack_for_sequential_packets() {
    let info = nack_stream_info(1000);
    let (tick, receiver) = receiver_peer(&info).await;

    receive(&receiver, 1000, 0..20).await;
    tick.send(()).await.unwrap();
    tick.send(()).await.unwrap();

    assert!(receiver.last_written_rtcp().await.is_none());
    receiver.close().await.unwrap();
}

#[tokio::test]
async fn test_nack_ignores_streams_without_nack_support() {
    let info = StreamInfo {
        ssrc: 1000,
        clock_rate: 90000,
        ..Default::default()
    };
    let (tick, receiver) = receiver_peer(&info).await;
    let sender = sender_peer(&info).await;

    receive(&receiver, 1000, [1, 5]).await;
    tick.send(()).await.unwrap();
    tick.send(()).await.unwrap();
    assert!(receiver.last_written_rtcp().await.is_none());

    send(&sender, 1000, 1..5).await;
    deliver(&sender, make_nack(1000, &[2])).await;
    let r = tokio::time::timeout(Duration::from_millis(50), sender.written_rtp()).await;
    assert!(r.is_err(), "stream without nack feedback must not retransmit");

    receiver.close().await.unwrap();
    sender.close().await.unwrap();
}

#[tokio::test]
async fn test_nack_rtx_retransmission() {
    let info = nack_rtx_stream_info(2000, 2001, 97);
    let (tick, receiver) = receiver_peer(&info).await;
    let sender = sender_peer(&info).await;

    send(&sender, 2000, 100..106).await;
    receive(&receiver, 2000, [100, 101, 103, 105]).await;

    tick.send(()).await.unwrap();
    let pkts = receiver.written_rtcp().await.unwrap();
    let nack = as_nack(&pkts);
    assert_eq!(nack.nacks[0].packet_id, 102);
    // 104 is the second bit after 102
    assert_eq!(nack.nacks[0].lost_packets, 0b10);

    deliver(&sender, pkts).await;
    for (i, seq) in [102u16, 104].into_iter().enumerate() {
        let rtx = sender.written_rtp().await.unwrap();
        assert_eq!(rtx.header.ssrc, 2001);
        assert_eq!(rtx.header.payload_type, 97);
        assert_eq!(rtx.header.sequence_number, i as u16);
        assert_eq!(&rtx.payload[..2], &seq.to_be_bytes());
        assert_eq!(&rtx.payload[2..], &create_rtp_packet(2000, seq).payload[..]);
    }

    receiver.close().await.unwrap();
    sender.close().await.unwrap();
}

#[tokio::test]
async fn test_nack_responder_ignores_expired_packets() {
    let info = nack_stream_info(1000);
    let sender = sender_peer(&info).await;

    // the responder keeps 64 packets, so 0 has been overwritten by 64
    send(&sender, 1000, 0..100).await;
    deliver(&sender, make_nack(1000, &[0])).await;
    let r = tokio::time::timeout(Duration::from_millis(50), sender.written_rtp()).await;
    assert!(r.is_err(), "expired packet must not be retransmitted");

    deliver(&sender, make_nack(1000, &[99])).await;
    assert_eq!(sender.written_rtp().await.unwrap().header.sequence_number, 99);

    sender.close().await.unwrap();
}

#[tokio::test]
async fn test_nack_sequence_wraparound() {
    let info = nack_stream_info(3000);
    let (tick, receiver) = receiver_peer(&info).await;
    let sender = sender_peer(&info).await;

    send(&sender, 3000, [65533, 65534, 65535, 0, 1]).await;
    receive(&receiver, 3000, [65533, 65535, 1]).await;

    tick.send(()).await.unwrap();
    let pkts = receiver.written_rtcp().await.unwrap();
    let nack = as_nack(&pkts);
    assert_eq!(nack.nacks.len(), 1);
    assert_eq!(nack.nacks[0].packet_id, 65534);
    assert_eq!(nack.nacks[0].lost_packets, 0b10);

    deliver(&sender, pkts).await;
    let first = sender.written_rtp().await.unwrap();
    let second = sender.written_rtp().await.unwrap();
    assert_eq!(first.header.sequence_number, 65534);
    assert_eq!(second.header.sequence_number, 0);

    receiver.close().await.unwrap();
    sender.close().await.unwrap();
}

#[tokio::test]
async fn test_nack_chain_with_both_sides() {
    let (tick, ticker_gen) = manual_ticker();
    let chain = Registry::new()
        .with(Box::new(
            NackGeneratorBuilder::new()
                .with_size(64)
                .with_ticker(ticker_gen),
        ))
        .with(Box::new(NackResponderBuilder::new().with_size(64)))
        .build("both")
        .unwrap();
    let s = MockStream::new(&nack_stream_info(1), chain).await;

    send(&s, 1, 0..4).await;
    receive(&s, 1, [0, 2]).await;

    // the peer asks for 3 while this side asks for 1
    deliver(&s, make_nack(1, &[3])).await;
    assert_eq!(s.written_rtp().await.unwrap().header.sequence_number, 3);

    tick.send(()).await.unwrap();
    let pkts = s.written_rtcp().await.unwrap();
    assert_eq!(as_nack(&pkts).nacks[0].packet_id, 1);

    s.close().await.unwrap();
}
