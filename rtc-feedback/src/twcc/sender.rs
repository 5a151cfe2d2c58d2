//! TWCC Sender Interceptor - adds transport-wide sequence numbers to outgoing packets.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use log::trace;
use rtp::extension::transport_cc_extension::TransportCcExtension;
use util::marshal::Marshal;

use super::stream_supports_twcc;
use crate::attributes::Attributes;
use crate::error::Result;
use crate::session::Session;
use crate::stream_info::StreamInfo;
use crate::{Interceptor, InterceptorBuilder, RTPWriter};

/// Builder for the TwccSenderInterceptor.
///
/// # Example
///
/// ```ignore
/// use rtc_feedback::{Registry, TwccSenderBuilder};
///
/// let registry = Registry::new().with(Box::new(TwccSenderBuilder::new()));
/// ```
#[derive(Clone, Default)]
pub struct TwccSenderBuilder {
    default_hdr_ext_id: Option<u8>,
}

impl TwccSenderBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Header extension id used for streams that did not negotiate the
    /// transport-cc extension.
    pub fn with_default_hdr_ext_id(mut self, id: u8) -> Self {
        self.default_hdr_ext_id = Some(id);
        self
    }
}

impl InterceptorBuilder for TwccSenderBuilder {
    fn build(&self, id: &str) -> Result<Arc<dyn Interceptor + Send + Sync>> {
        Ok(Arc::new(TwccSenderInterceptor {
            default_hdr_ext_id: self.default_hdr_ext_id,
            next_sequence_number: Arc::new(AtomicU32::new(0)),
            session: Session::new(id),
        }))
    }
}

/// Interceptor that adds transport-wide sequence numbers to outgoing RTP packets.
///
/// All local streams of a session draw from one counter, so the sequence
/// numbers are monotonic across streams.
pub struct TwccSenderInterceptor {
    default_hdr_ext_id: Option<u8>,
    next_sequence_number: Arc<AtomicU32>,
    session: Session,
}

#[async_trait]
impl Interceptor for TwccSenderInterceptor {
    async fn bind_local_stream(
        &self,
        info: &StreamInfo,
        writer: Arc<dyn RTPWriter + Send + Sync>,
    ) -> Arc<dyn RTPWriter + Send + Sync> {
        if self.session.is_closed() {
            return writer;
        }

        let hdr_ext_id = match stream_supports_twcc(info).or(self.default_hdr_ext_id) {
            // 0 is not a valid extension id
            Some(id) if id != 0 => id,
            _ => return writer,
        };
        trace!(
            "twcc sender {}: stamping ssrc={} with extension id {}",
            self.session.id(),
            info.ssrc,
            hdr_ext_id
        );

        Arc::new(TwccSenderRtpWriter {
            hdr_ext_id,
            next_sequence_number: Arc::clone(&self.next_sequence_number),
            next: writer,
        })
    }

    async fn close(&self) -> Result<()> {
        self.session.close().await;
        Ok(())
    }
}

struct TwccSenderRtpWriter {
    hdr_ext_id: u8,
    next_sequence_number: Arc<AtomicU32>,
    next: Arc<dyn RTPWriter + Send + Sync>,
}

#[async_trait]
impl RTPWriter for TwccSenderRtpWriter {
    async fn write(&self, pkt: &rtp::packet::Packet, attributes: &Attributes) -> Result<usize> {
        let seq = self.next_sequence_number.fetch_add(1, Ordering::SeqCst);
        let ext = TransportCcExtension {
            transport_sequence: seq as u16,
        };
        let payload = ext.marshal()?;

        let mut pkt = pkt.clone();
        pkt.header.set_extension(self.hdr_ext_id, payload)?;

        self.next.write(&pkt, attributes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockStream;
    use crate::stream_info::RTPHeaderExtension;
    use crate::twcc::TRANSPORT_CC_URI;
    use util::marshal::Unmarshal;

    fn twcc_stream(ssrc: u32, id: u16) -> StreamInfo {
        StreamInfo {
            ssrc,
            rtp_header_extensions: vec![RTPHeaderExtension {
                uri: TRANSPORT_CC_URI.to_string(),
                id,
            }],
            ..Default::default()
        }
    }

    fn rtp(ssrc: u32, seq: u16) -> rtp::packet::Packet {
        rtp::packet::Packet {
            header: rtp::header::Header {
                ssrc,
                sequence_number: seq,
                ..Default::default()
            },
            payload: vec![].into(),
        }
    }

    fn transport_sequence(pkt: &rtp::packet::Packet, id: u8) -> Option<u16> {
        let ext = pkt.header.get_extension(id)?;
        let tcc = TransportCcExtension::unmarshal(&mut ext.as_ref()).unwrap();
        Some(tcc.transport_sequence)
    }

    #[tokio::test]
    async fn test_twcc_sender_adds_extension() {
        let icpr = TwccSenderBuilder::new().build("s").unwrap();
        let s = MockStream::new(&twcc_stream(12345, 5), icpr).await;

        for expected in 0..3u16 {
            s.write_rtp(&rtp(12345, 100 + expected)).await.unwrap();
            let out = s.written_rtp().await.unwrap();
            assert_eq!(out.header.sequence_number, 100 + expected);
            assert_eq!(transport_sequence(&out, 5), Some(expected));
        }

        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_twcc_sender_without_extension_passes_through() {
        let icpr = TwccSenderBuilder::new().build("s").unwrap();
        let info = StreamInfo {
            ssrc: 12345,
            ..Default::default()
        };
        let s = MockStream::new(&info, icpr).await;

        s.write_rtp(&rtp(12345, 1)).await.unwrap();
        let out = s.written_rtp().await.unwrap();
        assert!(!out.header.extension);
        assert_eq!(transport_sequence(&out, 5), None);

        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_twcc_sender_default_hdr_ext_id() {
        let icpr = TwccSenderBuilder::new()
            .with_default_hdr_ext_id(3)
            .build("s")
            .unwrap();
        let info = StreamInfo {
            ssrc: 12345,
            ..Default::default()
        };
        let s = MockStream::new(&info, icpr).await;

        s.write_rtp(&rtp(12345, 1)).await.unwrap();
        let out = s.written_rtp().await.unwrap();
        assert_eq!(transport_sequence(&out, 3), Some(0));

        s.close().await.unwrap();

        // the negotiated id wins over the default
        let icpr = TwccSenderBuilder::new()
            .with_default_hdr_ext_id(3)
            .build("s")
            .unwrap();
        let s = MockStream::new(&twcc_stream(1, 7), icpr).await;
        s.write_rtp(&rtp(1, 1)).await.unwrap();
        let out = s.written_rtp().await.unwrap();
        assert_eq!(transport_sequence(&out, 7), Some(0));
        assert_eq!(transport_sequence(&out, 3), None);
        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_twcc_sender_streams_share_counter() {
        let icpr = TwccSenderBuilder::new().build("s").unwrap();
        let s1 = MockStream::new(&twcc_stream(1111, 5), Arc::clone(&icpr)).await;
        let s2 = MockStream::new(&twcc_stream(2222, 5), icpr).await;

        for (i, s) in [&s1, &s2, &s1, &s2].iter().enumerate() {
            s.write_rtp(&rtp(0, 1)).await.unwrap();
            let out = s.written_rtp().await.unwrap();
            assert_eq!(transport_sequence(&out, 5), Some(i as u16));
        }

        s1.close().await.unwrap();
        s2.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_twcc_sender_sequence_wraparound() {
        let icpr = TwccSenderInterceptor {
            default_hdr_ext_id: None,
            next_sequence_number: Arc::new(AtomicU32::new(65534)),
            session: Session::new("s"),
        };
        let s = MockStream::new(&twcc_stream(12345, 5), Arc::new(icpr)).await;

        for expected in [65534u16, 65535, 0, 1] {
            s.write_rtp(&rtp(12345, 1)).await.unwrap();
            let out = s.written_rtp().await.unwrap();
            assert_eq!(transport_sequence(&out, 5), Some(expected));
        }

        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_twcc_sender_invalid_id_passes_through() {
        let icpr = TwccSenderBuilder::new().build("s").unwrap();
        let s = MockStream::new(&twcc_stream(1, 0), icpr).await;

        s.write_rtp(&rtp(1, 1)).await.unwrap();
        let out = s.written_rtp().await.unwrap();
        assert!(!out.header.extension);

        s.close().await.unwrap();
    }
}
