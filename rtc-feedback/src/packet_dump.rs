//! Packet Dump Interceptor - hands copies of all traffic to a sink.
//!
//! Copies travel through a bounded channel to a background task, so a slow
//! sink never stalls the media path. When the channel is full the copy is
//! dropped and a warning logged.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::attributes::Attributes;
use crate::error::Result;
use crate::lock;
use crate::session::Session;
use crate::stream_info::StreamInfo;
use crate::{
    Interceptor, InterceptorBuilder, RTCPReader, RTCPWriter, RTPReader, RTPWriter, RtcpPacket,
};

/// Default capacity of the dump channel.
const DEFAULT_BUFFER_SIZE: usize = 100;

/// Selects the RTP packets to dump.
pub type RtpFilter = Arc<dyn Fn(&rtp::packet::Packet) -> bool + Send + Sync>;

/// Selects the RTCP batches to dump.
pub type RtcpFilter = Arc<dyn Fn(&[RtcpPacket]) -> bool + Send + Sync>;

/// Whether a packet was received or sent.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PacketDirection {
    Inbound,
    Outbound,
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Inbound => write!(f, "inbound"),
            PacketDirection::Outbound => write!(f, "outbound"),
        }
    }
}

/// Destination of dumped packets. Runs on the dump task, never on the
/// media path.
///
/// The default implementation formats every packet at `debug!` level.
pub trait PacketDumpSink: Send + Sync {
    fn dump_rtp(
        &self,
        direction: PacketDirection,
        pkt: &rtp::packet::Packet,
        _attributes: &Attributes,
    ) -> Result<()> {
        debug!(
            "{direction} rtp: {:?} payload={} bytes",
            pkt.header,
            pkt.payload.len()
        );
        Ok(())
    }

    fn dump_rtcp(
        &self,
        direction: PacketDirection,
        pkts: &[RtcpPacket],
        _attributes: &Attributes,
    ) -> Result<()> {
        for pkt in pkts {
            debug!("{direction} rtcp: {pkt}");
        }
        Ok(())
    }
}

struct LogSink;

impl PacketDumpSink for LogSink {}

/// Builder for the PacketDumpInterceptor.
///
/// # Example
///
/// ```ignore
/// use rtc_feedback::{PacketDumpBuilder, Registry};
/// use std::sync::Arc;
///
/// // only dump packets of one stream
/// let registry = Registry::new().with(Box::new(
///     PacketDumpBuilder::new()
///         .with_rtp_filter(Arc::new(|pkt: &rtp::packet::Packet| pkt.header.ssrc == 1234)),
/// ));
/// ```
#[derive(Clone)]
pub struct PacketDumpBuilder {
    rtp_filter: Option<RtpFilter>,
    rtcp_filter: Option<RtcpFilter>,
    buffer_size: usize,
    sink: Option<Arc<dyn PacketDumpSink>>,
}

impl Default for PacketDumpBuilder {
    fn default() -> Self {
        Self {
            rtp_filter: None,
            rtcp_filter: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            sink: None,
        }
    }
}

impl PacketDumpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only dump RTP packets for which `filter` returns true.
    pub fn with_rtp_filter(mut self, filter: RtpFilter) -> Self {
        self.rtp_filter = Some(filter);
        self
    }

    /// Only dump RTCP batches for which `filter` returns true.
    pub fn with_rtcp_filter(mut self, filter: RtcpFilter) -> Self {
        self.rtcp_filter = Some(filter);
        self
    }

    /// Capacity of the channel between the media path and the sink.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn PacketDumpSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

impl InterceptorBuilder for PacketDumpBuilder {
    fn build(&self, id: &str) -> Result<Arc<dyn Interceptor + Send + Sync>> {
        // mpsc::channel panics on zero capacity
        let (dump_tx, dump_rx) = mpsc::channel(self.buffer_size.max(1));
        Ok(Arc::new(PacketDumpInterceptor {
            internal: Arc::new(PacketDumpInternal {
                rtp_filter: self.rtp_filter.clone(),
                rtcp_filter: self.rtcp_filter.clone(),
                dump_tx,
                session: Session::new(id),
            }),
            dump_rx: Mutex::new(Some(dump_rx)),
            sink: self.sink.clone().unwrap_or_else(|| Arc::new(LogSink)),
        }))
    }
}

enum Dump {
    Rtp {
        direction: PacketDirection,
        pkt: rtp::packet::Packet,
        attributes: Attributes,
    },
    Rtcp {
        direction: PacketDirection,
        pkts: Vec<RtcpPacket>,
        attributes: Attributes,
    },
}

struct PacketDumpInternal {
    rtp_filter: Option<RtpFilter>,
    rtcp_filter: Option<RtcpFilter>,
    dump_tx: mpsc::Sender<Dump>,
    session: Session,
}

impl PacketDumpInternal {
    fn dump_rtp(&self, direction: PacketDirection, pkt: &rtp::packet::Packet, attr: &Attributes) {
        if self.rtp_filter.as_ref().is_some_and(|f| !f(pkt)) {
            return;
        }
        self.enqueue(Dump::Rtp {
            direction,
            pkt: pkt.clone(),
            attributes: attr.clone(),
        });
    }

    fn dump_rtcp(&self, direction: PacketDirection, pkts: &[RtcpPacket], attr: &Attributes) {
        if self.rtcp_filter.as_ref().is_some_and(|f| !f(pkts)) {
            return;
        }
        self.enqueue(Dump::Rtcp {
            direction,
            pkts: pkts.iter().map(|p| p.cloned()).collect(),
            attributes: attr.clone(),
        });
    }

    fn enqueue(&self, dump: Dump) {
        match self.dump_tx.try_send(dump) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) if !self.session.is_closed() => {
                warn!(
                    "packet dump {}: buffer full, dropping packet",
                    self.session.id()
                );
            }
            Err(_) => {}
        }
    }
}

/// Interceptor that forwards copies of every RTP packet and RTCP batch,
/// in both directions, to a [`PacketDumpSink`].
pub struct PacketDumpInterceptor {
    internal: Arc<PacketDumpInternal>,
    dump_rx: Mutex<Option<mpsc::Receiver<Dump>>>,
    sink: Arc<dyn PacketDumpSink>,
}

impl PacketDumpInterceptor {
    /// Starts the dump task on the first bind.
    fn ensure_running(&self) {
        let Some(dump_rx) = lock(&self.dump_rx).take() else {
            return;
        };
        let sink = Arc::clone(&self.sink);
        self.internal
            .session
            .spawn_loop(move |close_rx| PacketDumpInterceptor::run(sink, dump_rx, close_rx));
    }

    async fn run(
        sink: Arc<dyn PacketDumpSink>,
        mut dump_rx: mpsc::Receiver<Dump>,
        mut close_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                dump = dump_rx.recv() => match dump {
                    Some(dump) => Self::write(&sink, dump),
                    None => return,
                },
                _ = close_rx.recv() => {
                    // flush what was queued before teardown
                    while let Ok(dump) = dump_rx.try_recv() {
                        Self::write(&sink, dump);
                    }
                    return;
                }
            }
        }
    }

    fn write(sink: &Arc<dyn PacketDumpSink>, dump: Dump) {
        let result = match &dump {
            Dump::Rtp {
                direction,
                pkt,
                attributes,
            } => sink.dump_rtp(*direction, pkt, attributes),
            Dump::Rtcp {
                direction,
                pkts,
                attributes,
            } => sink.dump_rtcp(*direction, pkts, attributes),
        };
        if let Err(err) = result {
            warn!("packet dump: sink failed: {err}");
        }
    }
}

#[async_trait]
impl Interceptor for PacketDumpInterceptor {
    async fn bind_rtcp_reader(
        &self,
        reader: Arc<dyn RTCPReader + Send + Sync>,
    ) -> Arc<dyn RTCPReader + Send + Sync> {
        self.ensure_running();
        Arc::new(DumpRtcpReader {
            internal: Arc::clone(&self.internal),
            parent: reader,
        })
    }

    async fn bind_rtcp_writer(
        &self,
        writer: Arc<dyn RTCPWriter + Send + Sync>,
    ) -> Arc<dyn RTCPWriter + Send + Sync> {
        self.ensure_running();
        Arc::new(DumpRtcpWriter {
            internal: Arc::clone(&self.internal),
            next: writer,
        })
    }

    async fn bind_local_stream(
        &self,
        _info: &StreamInfo,
        writer: Arc<dyn RTPWriter + Send + Sync>,
    ) -> Arc<dyn RTPWriter + Send + Sync> {
        self.ensure_running();
        Arc::new(DumpRtpWriter {
            internal: Arc::clone(&self.internal),
            next: writer,
        })
    }

    async fn bind_remote_stream(
        &self,
        _info: &StreamInfo,
        reader: Arc<dyn RTPReader + Send + Sync>,
    ) -> Arc<dyn RTPReader + Send + Sync> {
        self.ensure_running();
        Arc::new(DumpRtpReader {
            internal: Arc::clone(&self.internal),
            parent: reader,
        })
    }

    async fn close(&self) -> Result<()> {
        self.internal.session.close().await;
        Ok(())
    }
}

struct DumpRtpWriter {
    internal: Arc<PacketDumpInternal>,
    next: Arc<dyn RTPWriter + Send + Sync>,
}

#[async_trait]
impl RTPWriter for DumpRtpWriter {
    async fn write(&self, pkt: &rtp::packet::Packet, attributes: &Attributes) -> Result<usize> {
        self.internal.dump_rtp(PacketDirection::Outbound, pkt, attributes);
        self.next.write(pkt, attributes).await
    }
}

struct DumpRtpReader {
    internal: Arc<PacketDumpInternal>,
    parent: Arc<dyn RTPReader + Send + Sync>,
}

#[async_trait]
impl RTPReader for DumpRtpReader {
    async fn read(
        &self,
        buf: &mut [u8],
        attributes: &Attributes,
    ) -> Result<(rtp::packet::Packet, Attributes)> {
        let (pkt, attr) = self.parent.read(buf, attributes).await?;
        self.internal.dump_rtp(PacketDirection::Inbound, &pkt, &attr);
        Ok((pkt, attr))
    }
}

struct DumpRtcpWriter {
    internal: Arc<PacketDumpInternal>,
    next: Arc<dyn RTCPWriter + Send + Sync>,
}

#[async_trait]
impl RTCPWriter for DumpRtcpWriter {
    async fn write(&self, pkts: &[RtcpPacket], attributes: &Attributes) -> Result<usize> {
        self.internal.dump_rtcp(PacketDirection::Outbound, pkts, attributes);
        self.next.write(pkts, attributes).await
    }
}

struct DumpRtcpReader {
    internal: Arc<PacketDumpInternal>,
    parent: Arc<dyn RTCPReader + Send + Sync>,
}

#[async_trait]
impl RTCPReader for DumpRtcpReader {
    async fn read(
        &self,
        buf: &mut [u8],
        attributes: &Attributes,
    ) -> Result<(Vec<RtcpPacket>, Attributes)> {
        let (pkts, attr) = self.parent.read(buf, attributes).await?;
        self.internal.dump_rtcp(PacketDirection::Inbound, &pkts, &attr);
        Ok((pkts, attr))
    }
}
