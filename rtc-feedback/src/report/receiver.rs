//! Receiver Report Interceptor - Generates RTCP Receiver Reports.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc;

use super::receiver_stream::ReceiverStream;
use crate::attributes::Attributes;
use crate::error::Result;
use crate::media_description::MediaDescriptionRegistry;
use crate::session::{
    FnTickerGen, FnTimeGen, Session, Ticker, WriterSlot, interval_ticker, system_now,
};
use crate::stream_info::StreamInfo;
use crate::{
    Interceptor, InterceptorBuilder, RTCPReader, RTCPWriter, RTPReader, RtcpPacket, lock,
};

/// Builder for the ReceiverReportInterceptor.
///
/// # Example
///
/// ```ignore
/// use rtc_feedback::{Registry, ReceiverReportBuilder};
/// use std::time::Duration;
///
/// let registry = Registry::new().with(Box::new(
///     ReceiverReportBuilder::new().with_interval(Duration::from_millis(500)),
/// ));
/// ```
#[derive(Clone)]
pub struct ReceiverReportBuilder {
    /// Interval between receiver reports.
    interval: Duration,
    media_descriptions: Option<Arc<MediaDescriptionRegistry>>,
    now: Option<FnTimeGen>,
    ticker_gen: Option<FnTickerGen>,
}

impl Default for ReceiverReportBuilder {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            media_descriptions: None,
            now: None,
            ticker_gen: None,
        }
    }
}

impl ReceiverReportBuilder {
    /// Create a new builder with default settings.
    ///
    /// Default interval is 1 second.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a custom interval between receiver reports.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Look up clock rates in `registry` before falling back to
    /// [`StreamInfo::clock_rate`].
    pub fn with_media_descriptions(mut self, registry: Arc<MediaDescriptionRegistry>) -> Self {
        self.media_descriptions = Some(registry);
        self
    }

    /// Override the wall clock.
    pub fn with_now(mut self, now: FnTimeGen) -> Self {
        self.now = Some(now);
        self
    }

    /// Override how the report loop is clocked.
    pub fn with_ticker(mut self, ticker_gen: FnTickerGen) -> Self {
        self.ticker_gen = Some(ticker_gen);
        self
    }
}

impl InterceptorBuilder for ReceiverReportBuilder {
    fn build(&self, id: &str) -> Result<Arc<dyn Interceptor + Send + Sync>> {
        Ok(Arc::new(ReceiverReportInterceptor {
            internal: Arc::new(ReceiverReportInternal {
                media_descriptions: self.media_descriptions.clone(),
                now: self.now.clone().unwrap_or_else(|| Arc::new(system_now)),
                streams: Mutex::new(HashMap::new()),
            }),
            interval: self.interval,
            ticker_gen: self.ticker_gen.clone(),
            session: Session::new(id),
        }))
    }
}

struct ReceiverReportInternal {
    media_descriptions: Option<Arc<MediaDescriptionRegistry>>,
    now: FnTimeGen,
    streams: Mutex<HashMap<u32, Arc<Mutex<ReceiverStream>>>>,
}

/// Interceptor that generates RTCP Receiver Reports.
///
/// This interceptor monitors incoming RTP packets, tracks loss and jitter per
/// stream, remembers when the last SenderReport of each stream arrived and
/// periodically writes a ReceiverReport per stream.
pub struct ReceiverReportInterceptor {
    internal: Arc<ReceiverReportInternal>,
    interval: Duration,
    ticker_gen: Option<FnTickerGen>,
    session: Session,
}

impl ReceiverReportInterceptor {
    async fn run(
        internal: Arc<ReceiverReportInternal>,
        writer: WriterSlot,
        mut ticker: Box<dyn Ticker>,
        mut close_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = (internal.now)();
                    let streams: Vec<Arc<Mutex<ReceiverStream>>> =
                        lock(&internal.streams).values().cloned().collect();
                    for stream in streams {
                        let rr = lock(&stream).generate_report(now);
                        let pkts: [RtcpPacket; 1] = [Box::new(rr)];
                        if let Err(err) = writer.write(&pkts, &Attributes::new()).await {
                            warn!("receiver report: failed sending: {err}");
                        }
                    }
                }
                _ = close_rx.recv() => return,
            }
        }
    }
}

#[async_trait]
impl Interceptor for ReceiverReportInterceptor {
    async fn bind_rtcp_reader(
        &self,
        reader: Arc<dyn RTCPReader + Send + Sync>,
    ) -> Arc<dyn RTCPReader + Send + Sync> {
        Arc::new(ReceiverReportRtcpReader {
            internal: Arc::clone(&self.internal),
            parent: reader,
        })
    }

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
            ReceiverReportInterceptor::run(internal, slot, ticker, close_rx)
        });

        writer
    }

    async fn bind_remote_stream(
        &self,
        info: &StreamInfo,
        reader: Arc<dyn RTPReader + Send + Sync>,
    ) -> Arc<dyn RTPReader + Send + Sync> {
        if self.session.is_closed() {
            return reader;
        }

        let clock_rate = super::clock_rate(self.internal.media_descriptions.as_deref(), info);
        if clock_rate == 0 {
            debug!(
                "receiver report {}: no clock rate for ssrc={}, not reporting",
                self.session.id(),
                info.ssrc
            );
            return reader;
        }

        let stream = Arc::new(Mutex::new(ReceiverStream::new(info.ssrc, clock_rate)));
        lock(&self.internal.streams).insert(info.ssrc, Arc::clone(&stream));

        Arc::new(ReceiverReportRtpReader {
            stream,
            now: Arc::clone(&self.internal.now),
            parent: reader,
        })
    }

    async fn unbind_remote_stream(&self, info: &StreamInfo) {
        lock(&self.internal.streams).remove(&info.ssrc);
    }

    async fn close(&self) -> Result<()> {
        self.session.close().await;
        Ok(())
    }
}

struct ReceiverReportRtpReader {
    stream: Arc<Mutex<ReceiverStream>>,
    now: FnTimeGen,
    parent: Arc<dyn RTPReader + Send + Sync>,
}

#[async_trait]
impl RTPReader for ReceiverReportRtpReader {
    async fn read(
        &self,
        buf: &mut [u8],
        attributes: &Attributes,
    ) -> Result<(rtp::packet::Packet, Attributes)> {
        let (pkt, attr) = self.parent.read(buf, attributes).await?;
        lock(&self.stream).process_rtp((self.now)(), &pkt);
        Ok((pkt, attr))
    }
}

struct ReceiverReportRtcpReader {
    internal: Arc<ReceiverReportInternal>,
    parent: Arc<dyn RTCPReader + Send + Sync>,
}

#[async_trait]
impl RTCPReader for ReceiverReportRtcpReader {
    async fn read(
        &self,
        buf: &mut [u8],
        attributes: &Attributes,
    ) -> Result<(Vec<RtcpPacket>, Attributes)> {
        let (pkts, attr) = self.parent.read(buf, attributes).await?;

        let now = (self.internal.now)();
        for p in &pkts {
            let Some(sr) = p
                .as_any()
                .downcast_ref::<rtcp::sender_report::SenderReport>()
            else {
                continue;
            };
            let stream = lock(&self.internal.streams).get(&sr.ssrc).cloned();
            if let Some(stream) = stream {
                lock(&stream).process_sender_report(now, sr);
            }
        }

        Ok((pkts, attr))
    }
}
