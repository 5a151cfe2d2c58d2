//! CCFB Receiver Interceptor - generates RFC 8888 congestion control feedback.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc;

use super::recorder::Recorder;
use super::stream_supports_ccfb;
use crate::attributes::Attributes;
use crate::error::Result;
use crate::session::{
    FnTickerGen, FnTimeGen, Session, Ticker, WriterSlot, interval_ticker, system_now,
};
use crate::stream_info::StreamInfo;
use crate::{Interceptor, InterceptorBuilder, RTCPWriter, RTPReader, RtcpPacket, lock};

/// Default interval for sending feedback.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// Default upper bound of a marshalled report.
const DEFAULT_MAX_REPORT_SIZE: usize = 1200;

/// Builder for the CcfbReceiverInterceptor.
///
/// # Example
///
/// ```ignore
/// use rtc_feedback::{CcfbReceiverBuilder, Registry};
/// use std::time::Duration;
///
/// let registry = Registry::new().with(Box::new(
///     CcfbReceiverBuilder::new()
///         .with_interval(Duration::from_millis(50))
///         .with_max_report_size(1000),
/// ));
/// ```
#[derive(Clone)]
pub struct CcfbReceiverBuilder {
    interval: Duration,
    max_report_size: usize,
    now: Option<FnTimeGen>,
    ticker_gen: Option<FnTickerGen>,
}

impl Default for CcfbReceiverBuilder {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_report_size: DEFAULT_MAX_REPORT_SIZE,
            now: None,
            ticker_gen: None,
        }
    }
}

impl CcfbReceiverBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interval between feedback reports.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Bound the marshalled size of every report, in octets.
    pub fn with_max_report_size(mut self, max_report_size: usize) -> Self {
        self.max_report_size = max_report_size;
        self
    }

    /// Override the clock used for arrival times and report timestamps.
    pub fn with_now(mut self, now: FnTimeGen) -> Self {
        self.now = Some(now);
        self
    }

    /// Override how the feedback loop is clocked.
    pub fn with_ticker(mut self, ticker_gen: FnTickerGen) -> Self {
        self.ticker_gen = Some(ticker_gen);
        self
    }
}

impl InterceptorBuilder for CcfbReceiverBuilder {
    fn build(&self, id: &str) -> Result<Arc<dyn Interceptor + Send + Sync>> {
        Ok(Arc::new(CcfbReceiverInterceptor {
            internal: Arc::new(CcfbReceiverInternal {
                now: self.now.clone().unwrap_or_else(|| Arc::new(system_now)),
                max_report_size: self.max_report_size,
                recorder: Mutex::new(Recorder::new(rand::random::<u32>())),
            }),
            interval: self.interval,
            ticker_gen: self.ticker_gen.clone(),
            session: Session::new(id),
        }))
    }
}

struct CcfbReceiverInternal {
    now: FnTimeGen,
    max_report_size: usize,
    recorder: Mutex<Recorder>,
}

/// Interceptor that reports the arrival of every RTP packet with RFC 8888
/// congestion control feedback.
///
/// Remote streams that negotiated `ack ccfb` have each packet logged with
/// its arrival time and the ECN code point the transport stored in the
/// packet's [`Attributes`]. Each tick one report covering all streams is
/// written, unless nothing arrived since the previous one.
pub struct CcfbReceiverInterceptor {
    internal: Arc<CcfbReceiverInternal>,
    interval: Duration,
    ticker_gen: Option<FnTickerGen>,
    session: Session,
}

impl CcfbReceiverInterceptor {
    async fn run(
        internal: Arc<CcfbReceiverInternal>,
        writer: WriterSlot,
        mut ticker: Box<dyn Ticker>,
        mut close_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = (internal.now)();
                    let report =
                        lock(&internal.recorder).build_report(now, internal.max_report_size);
                    if report.metric_block_count() == 0 {
                        continue;
                    }
                    let pkts: [RtcpPacket; 1] = [Box::new(report)];
                    if let Err(err) = writer.write(&pkts, &Attributes::new()).await {
                        warn!("ccfb receiver: failed sending feedback: {err}");
                    }
                }
                _ = close_rx.recv() => return,
            }
        }
    }
}

#[async_trait]
impl Interceptor for CcfbReceiverInterceptor {
    async fn bind_rtcp_writer(
        &self,
        writer: Arc<dyn RTCPWriter + Send + Sync>,
    ) -> Arc<dyn RTCPWriter + Send + Sync> {
        let internal = Arc::clone(&self.internal);
        self.session.bind_writer(Arc::clone(&writer), |slot, close_rx| {
            let ticker = match &self.ticker_gen {
                Some(ticker_gen) => ticker_gen(self.interval),
                None => interval_ticker(self.interval),
            };
            CcfbReceiverInterceptor::run(internal, slot, ticker, close_rx)
        });

        writer
    }

    async fn bind_remote_stream(
        &self,
        info: &StreamInfo,
        reader: Arc<dyn RTPReader + Send + Sync>,
    ) -> Arc<dyn RTPReader + Send + Sync> {
        if self.session.is_closed() || !stream_supports_ccfb(info) {
            return reader;
        }
        debug!(
            "ccfb receiver {}: reporting on ssrc={}",
            self.session.id(),
            info.ssrc
        );

        Arc::new(CcfbReceiverRtpReader {
            internal: Arc::clone(&self.internal),
            parent: reader,
        })
    }

    async fn unbind_remote_stream(&self, info: &StreamInfo) {
        lock(&self.internal.recorder).remove_stream(info.ssrc);
    }

    async fn close(&self) -> Result<()> {
        self.session.close().await;
        Ok(())
    }
}

struct CcfbReceiverRtpReader {
    internal: Arc<CcfbReceiverInternal>,
    parent: Arc<dyn RTPReader + Send + Sync>,
}

#[async_trait]
impl RTPReader for CcfbReceiverRtpReader {
    async fn read(
        &self,
        buf: &mut [u8],
        attributes: &Attributes,
    ) -> Result<(rtp::packet::Packet, Attributes)> {
        let (pkt, attr) = self.parent.read(buf, attributes).await?;
        // packets without an ECN marking count as Not-ECT
        let ecn = attr.get_ecn().unwrap_or_default();
        lock(&self.internal.recorder).add_packet(
            (self.internal.now)(),
            pkt.header.ssrc,
            pkt.header.sequence_number,
            ecn,
        );
        Ok((pkt, attr))
    }
}
