use std::sync::Arc;

use async_trait::async_trait;
use log::trace;
use util::marshal::Marshal;

use super::ByteWriter;
use crate::attributes::Attributes;
use crate::error::Result;
use crate::{RTCPWriter, RTPWriter, RtcpPacket};

/// Muxer marshals RTP packets and RTCP batches into one datagram each.
#[derive(Clone)]
pub struct Muxer {
    writer: Arc<dyn ByteWriter + Send + Sync>,
}

impl Muxer {
    pub fn new(writer: Arc<dyn ByteWriter + Send + Sync>) -> Self {
        Muxer { writer }
    }
}

#[async_trait]
impl RTPWriter for Muxer {
    async fn write(&self, pkt: &rtp::packet::Packet, _attributes: &Attributes) -> Result<usize> {
        let raw = pkt.marshal()?;
        trace!(
            "muxer: rtp ssrc={} seq={} len={}",
            pkt.header.ssrc,
            pkt.header.sequence_number,
            raw.len()
        );
        self.writer.write(&raw).await
    }
}

#[async_trait]
impl RTCPWriter for Muxer {
    async fn write(&self, pkts: &[RtcpPacket], _attributes: &Attributes) -> Result<usize> {
        let raw = rtcp::packet::marshal(pkts)?;
        trace!("muxer: rtcp batch of {} len={}", pkts.len(), raw.len());
        self.writer.write(&raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{ByteReader, Demuxer};
    use crate::{RTCPReader, RTPReader};
    use bytes::Bytes;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<Vec<u8>>>);

    #[async_trait]
    impl ByteWriter for Capture {
        async fn write(&self, buf: &[u8]) -> Result<usize> {
            self.0.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }
    }

    #[tokio::test]
    async fn test_muxer_marshals() {
        let capture = Arc::new(Capture::default());
        let muxer = Muxer::new(capture.clone());

        let pkt = rtp::packet::Packet {
            header: rtp::header::Header {
                version: 2,
                payload_type: 96,
                sequence_number: 42,
                ssrc: 7,
                ..Default::default()
            },
            payload: Bytes::from_static(&[9, 9]),
        };
        let n = RTPWriter::write(&muxer, &pkt, &Attributes::new()).await.unwrap();
        assert_eq!(n, 14);

        let rr: RtcpPacket = Box::new(rtcp::receiver_report::ReceiverReport {
            ssrc: 7,
            ..Default::default()
        });
        let n = RTCPWriter::write(&muxer, &[rr], &Attributes::new()).await.unwrap();
        assert_eq!(n, 8);

        let written = capture.0.lock().unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(written[0][1], 96);
        assert_eq!(written[1][1], 201);
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let a = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let b = Arc::new(tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap());
        a.connect(b.local_addr().unwrap()).await.unwrap();
        b.connect(a.local_addr().unwrap()).await.unwrap();

        let muxer = Muxer::new(a.clone());
        let demuxer = Demuxer::new(b.clone() as Arc<dyn ByteReader + Send + Sync>);

        let pkt = rtp::packet::Packet {
            header: rtp::header::Header {
                version: 2,
                payload_type: 111,
                sequence_number: 1000,
                ssrc: 0xDEAD_BEEF,
                ..Default::default()
            },
            payload: Bytes::from_static(&[1, 2, 3]),
        };
        RTPWriter::write(&muxer, &pkt, &Attributes::new()).await.unwrap();
        let sr: RtcpPacket = Box::new(rtcp::sender_report::SenderReport {
            ssrc: 0xDEAD_BEEF,
            packet_count: 1,
            ..Default::default()
        });
        RTCPWriter::write(&muxer, &[sr], &Attributes::new()).await.unwrap();

        let mut buf = vec![0u8; 1500];
        let (got, _) = demuxer.rtp_reader().read(&mut buf, &Attributes::new()).await.unwrap();
        assert_eq!(got.header.sequence_number, 1000);
        assert_eq!(got.header.ssrc, 0xDEAD_BEEF);
        assert_eq!(got.payload, pkt.payload);
        let (got, _) = demuxer.rtcp_reader().read(&mut buf, &Attributes::new()).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].destination_ssrc(), vec![0xDEAD_BEEF]);

        demuxer.close().await.unwrap();
    }
}
