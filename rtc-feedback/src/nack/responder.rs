//! NACK Responder Interceptor - Responds to NACK requests by retransmitting packets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use log::{debug, trace, warn};
use rtcp::transport_feedbacks::transport_layer_nack::TransportLayerNack;

use super::send_buffer::SendBuffer;
use super::stream_supports_nack;
use crate::attributes::Attributes;
use crate::error::Result;
use crate::session::Session;
use crate::stream_info::StreamInfo;
use crate::{Interceptor, InterceptorBuilder, RTCPReader, RTPWriter, RtcpPacket, lock};

/// Builder for the NackResponderInterceptor.
///
/// # Example
///
/// ```ignore
/// use rtc_feedback::{Registry, NackResponderBuilder};
///
/// let registry = Registry::new()
///     .with(Box::new(NackResponderBuilder::new().with_size(1024)));
/// ```
#[derive(Clone)]
pub struct NackResponderBuilder {
    /// Size of the send buffer (must be power of 2: 64, 128, ..., 32768).
    size: u16,
}

impl Default for NackResponderBuilder {
    fn default() -> Self {
        Self { size: 1024 }
    }
}

impl NackResponderBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the size of the send buffer.
    ///
    /// Size must be a power of 2 between 64 and 32768 (inclusive).
    /// Larger buffers can retransmit older packets but use more memory.
    pub fn with_size(mut self, size: u16) -> Self {
        self.size = size;
        self
    }
}

impl InterceptorBuilder for NackResponderBuilder {
    fn build(&self, id: &str) -> Result<Arc<dyn Interceptor + Send + Sync>> {
        SendBuffer::new(self.size)?;

        Ok(Arc::new(NackResponderInterceptor {
            internal: Arc::new(ResponderInternal {
                size: self.size,
                streams: Mutex::new(HashMap::new()),
                session: Session::new(id),
            }),
        }))
    }
}

/// Per-stream state for the responder.
struct ResponderStream {
    /// Buffer of sent packets for retransmission.
    send_buffer: RwLock<SendBuffer>,
    /// Writer the stream was bound with; retransmissions bypass the buffer.
    next_writer: Arc<dyn RTPWriter + Send + Sync>,
    /// RTX SSRC for RFC4588 retransmission (if configured).
    ssrc_rtx: Option<u32>,
    /// RTX payload type for RFC4588 retransmission (if configured).
    payload_type_rtx: Option<u8>,
    /// Sequence number counter for RTX packets.
    rtx_sequence_number: AtomicU16,
}

impl ResponderStream {
    /// Builds the packet to resend for `seq`, if it is still buffered.
    fn retransmission(&self, seq: u16) -> Option<rtp::packet::Packet> {
        let send_buffer = self.send_buffer.read().unwrap_or_else(|e| e.into_inner());
        let original = send_buffer.get(seq)?;

        let (Some(ssrc_rtx), Some(pt_rtx)) = (self.ssrc_rtx, self.payload_type_rtx) else {
            return Some(original.clone());
        };

        // RFC4588: original sequence number leads the payload
        let mut rtx_payload = Vec::with_capacity(2 + original.payload.len());
        rtx_payload.extend_from_slice(&original.header.sequence_number.to_be_bytes());
        rtx_payload.extend_from_slice(&original.payload);

        Some(rtp::packet::Packet {
            header: rtp::header::Header {
                version: original.header.version,
                ssrc: ssrc_rtx,
                payload_type: pt_rtx,
                sequence_number: self.rtx_sequence_number.fetch_add(1, Ordering::SeqCst),
                timestamp: original.header.timestamp,
                marker: original.header.marker,
                ..Default::default()
            },
            payload: rtx_payload.into(),
        })
    }
}

struct ResponderInternal {
    size: u16,
    /// Send buffers per local stream SSRC
    streams: Mutex<HashMap<u32, Arc<ResponderStream>>>,
    /// Joins in-flight retransmissions on close.
    session: Session,
}

impl ResponderInternal {
    fn handle_nack(&self, nack: &TransportLayerNack) {
        let stream = {
            let streams = lock(&self.streams);
            match streams.get(&nack.media_ssrc) {
                Some(stream) => Arc::clone(stream),
                None => return,
            }
        };

        let mut seqs = Vec::new();
        for pair in &nack.nacks {
            seqs.push(pair.packet_id);
            for i in 0..16u16 {
                if pair.lost_packets & (1 << i) != 0 {
                    seqs.push(pair.packet_id.wrapping_add(i + 1));
                }
            }
        }
        trace!("nack responder: ssrc={} requested {seqs:?}", nack.media_ssrc);

        let spawned = self.session.spawn_task(async move {
            for seq in seqs {
                let Some(pkt) = stream.retransmission(seq) else {
                    continue;
                };
                if let Err(err) = stream.next_writer.write(&pkt, &Attributes::new()).await {
                    warn!("nack responder: failed resending seq {seq}: {err}");
                }
            }
        });
        if !spawned {
            debug!(
                "nack responder {}: closed, dropping nack for ssrc={}",
                self.session.id(),
                nack.media_ssrc
            );
        }
    }
}

/// Interceptor that responds to NACK requests by retransmitting packets.
///
/// This interceptor buffers outgoing RTP packets on local streams and
/// retransmits them when RTCP TransportLayerNack packets are received.
pub struct NackResponderInterceptor {
    internal: Arc<ResponderInternal>,
}

#[async_trait]
impl Interceptor for NackResponderInterceptor {
    async fn bind_rtcp_reader(
        &self,
        reader: Arc<dyn RTCPReader + Send + Sync>,
    ) -> Arc<dyn RTCPReader + Send + Sync> {
        Arc::new(ResponderRtcpReader {
            internal: Arc::clone(&self.internal),
            parent: reader,
        })
    }

    async fn bind_local_stream(
        &self,
        info: &StreamInfo,
        writer: Arc<dyn RTPWriter + Send + Sync>,
    ) -> Arc<dyn RTPWriter + Send + Sync> {
        if !stream_supports_nack(info) {
            return writer;
        }

        let send_buffer = match SendBuffer::new(self.internal.size) {
            Ok(send_buffer) => send_buffer,
            Err(err) => {
                warn!("nack responder: {err}");
                return writer;
            }
        };
        let stream = Arc::new(ResponderStream {
            send_buffer: RwLock::new(send_buffer),
            next_writer: Arc::clone(&writer),
            ssrc_rtx: info.ssrc_rtx,
            payload_type_rtx: info.payload_type_rtx,
            rtx_sequence_number: AtomicU16::new(0),
        });
        lock(&self.internal.streams).insert(info.ssrc, Arc::clone(&stream));

        Arc::new(ResponderRtpWriter { stream })
    }

    async fn unbind_local_stream(&self, info: &StreamInfo) {
        lock(&self.internal.streams).remove(&info.ssrc);
    }

    /// Waits for in-flight retransmissions; later NACKs are ignored.
    async fn close(&self) -> Result<()> {
        self.internal.session.close().await;
        Ok(())
    }
}

struct ResponderRtpWriter {
    stream: Arc<ResponderStream>,
}

#[async_trait]
impl RTPWriter for ResponderRtpWriter {
    async fn write(&self, pkt: &rtp::packet::Packet, attributes: &Attributes) -> Result<usize> {
        self.stream
            .send_buffer
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .add(pkt);

        self.stream.next_writer.write(pkt, attributes).await
    }
}

struct ResponderRtcpReader {
    internal: Arc<ResponderInternal>,
    parent: Arc<dyn RTCPReader + Send + Sync>,
}

#[async_trait]
impl RTCPReader for ResponderRtcpReader {
    async fn read(
        &self,
        buf: &mut [u8],
        attributes: &Attributes,
    ) -> Result<(Vec<RtcpPacket>, Attributes)> {
        let (pkts, attr) = self.parent.read(buf, attributes).await?;
        for p in &pkts {
            if let Some(nack) = p.as_any().downcast_ref::<TransportLayerNack>() {
                self.internal.handle_nack(nack);
            }
        }

        Ok((pkts, attr))
    }
}
