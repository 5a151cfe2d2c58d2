//! RTC Feedback - composable RTP/RTCP interceptors for real-time media.
//!
//! An interceptor sits between the application and the RTP/RTCP transport.
//! It wraps readers and writers, observing or rewriting packets on their way
//! through, and may run a per-session feedback loop that synthesizes RTCP.
//!
//! # Available Interceptors
//!
//! ## RTCP Reports
//!
//! | Interceptor | Description |
//! |-------------|-------------|
//! | [`SenderReportInterceptor`] | Generates RTCP Sender Reports (SR) for local streams |
//! | [`ReceiverReportInterceptor`] | Generates RTCP Receiver Reports (RR) based on incoming RTP statistics |
//!
//! ## NACK (Negative Acknowledgement)
//!
//! | Interceptor | Description |
//! |-------------|-------------|
//! | [`NackGeneratorInterceptor`] | Detects missing RTP packets and generates NACK requests (RFC 4585) |
//! | [`NackResponderInterceptor`] | Buffers sent packets and retransmits on NACK, with optional RTX support (RFC 4588) |
//!
//! ## Congestion Control Feedback
//!
//! | Interceptor | Description |
//! |-------------|-------------|
//! | [`TwccSenderInterceptor`] | Adds transport-wide sequence numbers to outgoing RTP packets |
//! | [`TwccReceiverInterceptor`] | Tracks incoming packets and generates TransportLayerCC feedback |
//! | [`CcfbReceiverInterceptor`] | Generates RFC 8888 congestion control feedback |
//!
//! ## Utility
//!
//! | Interceptor | Description |
//! |-------------|-------------|
//! | [`PacketDumpInterceptor`] | Forwards copies of all traffic to a [`PacketDumpSink`] |
//! | [`NoOp`] | Identity interceptor, returned by an empty [`Registry`] |
//! | [`Chain`] | Applies a list of interceptors in order |
//!
//! # Chain Ordering
//!
//! A chain threads every bind call through its interceptors in list order:
//! the writer returned by interceptor `i` is handed to interceptor `i + 1`.
//! For writers this means the **last** interceptor sees an outgoing packet
//! first. For readers the last interceptor's reader is the one the
//! application calls, so it pulls from the earlier ones, which in turn see
//! the packet first.
//!
//! ```text
//! write: Application → C → B → A → Transport
//! read:  Transport → A → B → C → Application
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use rtc_feedback::{
//!     Registry, SenderReportBuilder, ReceiverReportBuilder,
//!     NackGeneratorBuilder, NackResponderBuilder,
//!     TwccSenderBuilder, TwccReceiverBuilder,
//! };
//! use std::time::Duration;
//!
//! let mut registry = Registry::new();
//! registry
//!     .add(Box::new(SenderReportBuilder::new().with_interval(Duration::from_secs(1))))
//!     .add(Box::new(ReceiverReportBuilder::new().with_interval(Duration::from_secs(1))))
//!     .add(Box::new(NackGeneratorBuilder::new().with_size(512)))
//!     .add(Box::new(NackResponderBuilder::new().with_size(1024)))
//!     .add(Box::new(TwccSenderBuilder::new()))
//!     .add(Box::new(TwccReceiverBuilder::new()));
//!
//! let chain = registry.build("session-1")?;
//! let rtcp_writer = chain.bind_rtcp_writer(muxer.clone()).await;
//! let rtp_writer = chain.bind_local_stream(&stream_info, muxer.clone()).await;
//! ```

#![warn(rust_2018_idioms)]

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

pub mod attributes;
mod chain;
pub mod error;
pub mod media_description;
pub mod mock;
pub mod mux;
mod noop;
pub mod packet_dump;
mod registry;
pub mod session;
pub mod sequence;
pub mod stream_info;
pub mod time;

pub mod ccfb;
pub mod nack;
pub mod report;
pub mod twcc;

pub use attributes::{Attributes, Ecn};
pub use ccfb::interceptor::{CcfbReceiverBuilder, CcfbReceiverInterceptor};
pub use chain::Chain;
pub use error::{Error, MultiError, Result};
pub use media_description::MediaDescriptionRegistry;
pub use nack::{
    generator::{NackGeneratorBuilder, NackGeneratorInterceptor},
    responder::{NackResponderBuilder, NackResponderInterceptor},
};
pub use noop::NoOp;
pub use packet_dump::{PacketDumpBuilder, PacketDumpInterceptor, PacketDumpSink};
pub use registry::Registry;
pub use report::{
    receiver::{ReceiverReportBuilder, ReceiverReportInterceptor},
    sender::{SenderReportBuilder, SenderReportInterceptor},
};
pub use session::{FnTickerGen, FnTimeGen, SessionId, Ticker};
pub use stream_info::{AssociatedStreamInfo, RTCPFeedback, RTPHeaderExtension, StreamInfo};
pub use twcc::{
    receiver::{TwccReceiverBuilder, TwccReceiverInterceptor},
    sender::{TwccSenderBuilder, TwccSenderInterceptor},
};

/// Locks `m`, recovering the guard from a poisoned mutex.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A parsed RTCP packet of any type.
pub type RtcpPacket = Box<dyn rtcp::packet::Packet + Send + Sync>;

/// RTPWriter is used by Interceptor::bind_local_stream.
#[async_trait]
pub trait RTPWriter {
    /// write a rtp packet
    async fn write(&self, pkt: &rtp::packet::Packet, attributes: &Attributes) -> Result<usize>;
}

/// RTPReader is used by Interceptor::bind_remote_stream.
#[async_trait]
pub trait RTPReader {
    /// read a rtp packet
    async fn read(
        &self,
        buf: &mut [u8],
        attributes: &Attributes,
    ) -> Result<(rtp::packet::Packet, Attributes)>;
}

/// RTCPWriter is used by Interceptor::bind_rtcp_writer.
#[async_trait]
pub trait RTCPWriter {
    /// write a batch of rtcp packets
    async fn write(&self, pkts: &[RtcpPacket], attributes: &Attributes) -> Result<usize>;
}

/// RTCPReader is used by Interceptor::bind_rtcp_reader.
#[async_trait]
pub trait RTCPReader {
    /// read a batch of rtcp packets
    async fn read(
        &self,
        buf: &mut [u8],
        attributes: &Attributes,
    ) -> Result<(Vec<RtcpPacket>, Attributes)>;
}

/// Interceptor can be used to add functionality to you PeerConnections by
/// modifying any incoming/outgoing rtp/rtcp packets, or sending your own
/// packets as needed.
///
/// Every method defaults to identity, so implementors only override the
/// stages they take part in.
#[async_trait]
pub trait Interceptor {
    /// bind_rtcp_reader lets you modify any incoming RTCP packets. It is
    /// called once per session.
    async fn bind_rtcp_reader(
        &self,
        reader: Arc<dyn RTCPReader + Send + Sync>,
    ) -> Arc<dyn RTCPReader + Send + Sync> {
        reader
    }

    /// bind_rtcp_writer lets you modify any outgoing RTCP packets.
    /// Interceptors that emit their own feedback start their background loop
    /// on the first call; a later call moves the loop to the new writer.
    async fn bind_rtcp_writer(
        &self,
        writer: Arc<dyn RTCPWriter + Send + Sync>,
    ) -> Arc<dyn RTCPWriter + Send + Sync> {
        writer
    }

    /// bind_local_stream lets you modify any outgoing RTP packets. It is
    /// called once per local stream.
    async fn bind_local_stream(
        &self,
        _info: &StreamInfo,
        writer: Arc<dyn RTPWriter + Send + Sync>,
    ) -> Arc<dyn RTPWriter + Send + Sync> {
        writer
    }

    /// unbind_local_stream is called when the stream is removed. It can be
    /// used to clean up any data related to that stream.
    async fn unbind_local_stream(&self, _info: &StreamInfo) {}

    /// bind_remote_stream lets you modify any incoming RTP packets. It is
    /// called once per remote stream.
    async fn bind_remote_stream(
        &self,
        _info: &StreamInfo,
        reader: Arc<dyn RTPReader + Send + Sync>,
    ) -> Arc<dyn RTPReader + Send + Sync> {
        reader
    }

    /// unbind_remote_stream is called when the stream is removed. It can be
    /// used to clean up any data related to that stream.
    async fn unbind_remote_stream(&self, _info: &StreamInfo) {}

    /// close stops background loops and waits for them to exit.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// InterceptorBuilder constructs an interceptor for one session.
pub trait InterceptorBuilder {
    fn build(&self, id: &str) -> Result<Arc<dyn Interceptor + Send + Sync>>;
}

/// SharedInterceptorBuilder hands the same interceptor to every session.
///
/// The wrapped interceptor must tolerate concurrent stream binding from
/// several sessions.
pub struct SharedInterceptorBuilder {
    interceptor: Arc<dyn Interceptor + Send + Sync>,
}

impl SharedInterceptorBuilder {
    pub fn new(interceptor: Arc<dyn Interceptor + Send + Sync>) -> Self {
        SharedInterceptorBuilder { interceptor }
    }
}

impl InterceptorBuilder for SharedInterceptorBuilder {
    fn build(&self, _id: &str) -> Result<Arc<dyn Interceptor + Send + Sync>> {
        Ok(Arc::clone(&self.interceptor))
    }
}

/// RTPWriterFn is an adapter for RTPWriter interface
pub struct RTPWriterFn<F>(pub F);

#[async_trait]
impl<F> RTPWriter for RTPWriterFn<F>
where
    F: Fn(&rtp::packet::Packet, &Attributes) -> Result<usize> + Send + Sync,
{
    async fn write(&self, pkt: &rtp::packet::Packet, attributes: &Attributes) -> Result<usize> {
        (self.0)(pkt, attributes)
    }
}

/// RTCPWriterFn is an adapter for RTCPWriter interface
pub struct RTCPWriterFn<F>(pub F);

#[async_trait]
impl<F> RTCPWriter for RTCPWriterFn<F>
where
    F: Fn(&[RtcpPacket], &Attributes) -> Result<usize> + Send + Sync,
{
    async fn write(&self, pkts: &[RtcpPacket], attributes: &Attributes) -> Result<usize> {
        (self.0)(pkts, attributes)
    }
}
