//! Sender Report Interceptor - Generates RTCP Sender Reports.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc;

use super::sender_stream::SenderStream;
use crate::attributes::Attributes;
use crate::error::Result;
use crate::media_description::MediaDescriptionRegistry;
use crate::session::{
    FnTickerGen, FnTimeGen, Session, Ticker, WriterSlot, interval_ticker, system_now,
};
use crate::stream_info::StreamInfo;
use crate::{Interceptor, InterceptorBuilder, RTCPWriter, RTPWriter, RtcpPacket, lock};

/// Builder for the SenderReportInterceptor.
///
/// # Example
///
/// ```ignore
/// use rtc_feedback::{Registry, SenderReportBuilder};
/// use std::time::Duration;
///
/// // With default interval (1 second)
/// let registry = Registry::new().with(Box::new(SenderReportBuilder::new()));
///
/// // With custom interval and use_latest_packet enabled
/// let registry = Registry::new().with(Box::new(
///     SenderReportBuilder::new()
///         .with_interval(Duration::from_millis(500))
///         .with_use_latest_packet(),
/// ));
/// ```
#[derive(Clone)]
pub struct SenderReportBuilder {
    /// Interval between sender reports.
    interval: Duration,
    /// Whether to always use the latest packet, even if out-of-order.
    use_latest_packet: bool,
    media_descriptions: Option<Arc<MediaDescriptionRegistry>>,
    now: Option<FnTimeGen>,
    ticker_gen: Option<FnTickerGen>,
}

impl Default for SenderReportBuilder {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            use_latest_packet: false,
            media_descriptions: None,
            now: None,
            ticker_gen: None,
        }
    }
}

impl SenderReportBuilder {
    /// Create a new builder with default settings.
    ///
    /// Default interval is 1 second.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a custom interval between sender reports.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Enable always using the latest packet for timestamp tracking,
    /// even if it appears to be out-of-order based on sequence numbers.
    ///
    /// By default (disabled), only in-order packets update the RTP↔NTP
    /// timestamp correlation. This prevents out-of-order packets from
    /// corrupting the timestamp mapping.
    pub fn with_use_latest_packet(mut self) -> Self {
        self.use_latest_packet = true;
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

impl InterceptorBuilder for SenderReportBuilder {
    fn build(&self, id: &str) -> Result<Arc<dyn Interceptor + Send + Sync>> {
        Ok(Arc::new(SenderReportInterceptor {
            internal: Arc::new(SenderReportInternal {
                use_latest_packet: self.use_latest_packet,
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

struct SenderReportInternal {
    use_latest_packet: bool,
    media_descriptions: Option<Arc<MediaDescriptionRegistry>>,
    now: FnTimeGen,
    streams: Mutex<HashMap<u32, Arc<Mutex<SenderStream>>>>,
}

/// Interceptor that generates RTCP Sender Reports.
///
/// Every outgoing RTP packet of a local stream updates that stream's packet
/// and octet counters and its RTP to wall-clock mapping. Each tick a
/// SenderReport per stream is written to the bound RTCP writer.
///
/// Streams without a known clock rate are passed through untouched.
pub struct SenderReportInterceptor {
    internal: Arc<SenderReportInternal>,
    interval: Duration,
    ticker_gen: Option<FnTickerGen>,
    session: Session,
}

impl SenderReportInterceptor {
    async fn run(
        internal: Arc<SenderReportInternal>,
        writer: WriterSlot,
        mut ticker: Box<dyn Ticker>,
        mut close_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = (internal.now)();
                    let streams: Vec<Arc<Mutex<SenderStream>>> =
                        lock(&internal.streams).values().cloned().collect();
                    for stream in streams {
                        let sr = lock(&stream).generate_report(now);
                        let pkts: [RtcpPacket; 1] = [Box::new(sr)];
                        if let Err(err) = writer.write(&pkts, &Attributes::new()).await {
                            warn!("sender report: failed sending: {err}");
                        }
                    }
                }
                _ = close_rx.recv() => return,
            }
        }
    }
}

#[async_trait]
impl Interceptor for SenderReportInterceptor {
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
            SenderReportInterceptor::run(internal, slot, ticker, close_rx)
        });

        writer
    }

    async fn bind_local_stream(
        &self,
        info: &StreamInfo,
        writer: Arc<dyn RTPWriter + Send + Sync>,
    ) -> Arc<dyn RTPWriter + Send + Sync> {
        if self.session.is_closed() {
            return writer;
        }

        let clock_rate = super::clock_rate(self.internal.media_descriptions.as_deref(), info);
        if clock_rate == 0 {
            debug!(
                "sender report {}: no clock rate for ssrc={}, not reporting",
                self.session.id(),
                info.ssrc
            );
            return writer;
        }

        let stream = Arc::new(Mutex::new(SenderStream::new(
            info.ssrc,
            clock_rate,
            self.internal.use_latest_packet,
        )));
        lock(&self.internal.streams).insert(info.ssrc, Arc::clone(&stream));

        Arc::new(SenderReportRtpWriter {
            stream,
            now: Arc::clone(&self.internal.now),
            next: writer,
        })
    }

    async fn unbind_local_stream(&self, info: &StreamInfo) {
        lock(&self.internal.streams).remove(&info.ssrc);
    }

    async fn close(&self) -> Result<()> {
        self.session.close().await;
        Ok(())
    }
}

struct SenderReportRtpWriter {
    stream: Arc<Mutex<SenderStream>>,
    now: FnTimeGen,
    next: Arc<dyn RTPWriter + Send + Sync>,
}

#[async_trait]
impl RTPWriter for SenderReportRtpWriter {
    async fn write(&self, pkt: &rtp::packet::Packet, attributes: &Attributes) -> Result<usize> {
        lock(&self.stream).process_rtp((self.now)(), pkt);
        self.next.write(pkt, attributes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockStream, broken_rtcp_writer, manual_ticker, rtcp_writer_channel};
    use crate::time::ntp_time;
    use std::time::SystemTime;

    fn fixed_now() -> (SystemTime, FnTimeGen) {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        (now, Arc::new(move || now))
    }

    fn as_sr(pkts: &[RtcpPacket]) -> &rtcp::sender_report::SenderReport {
        pkts[0]
            .as_any()
            .downcast_ref::<rtcp::sender_report::SenderReport>()
            .expect("expected SenderReport")
    }

    fn rtp(ssrc: u32, seq: u16, timestamp: u32, payload: usize) -> rtp::packet::Packet {
        rtp::packet::Packet {
            header: rtp::header::Header {
                ssrc,
                sequence_number: seq,
                timestamp,
                payload_type: 96,
                ..Default::default()
            },
            payload: vec![0u8; payload].into(),
        }
    }

    #[test]
    fn test_sender_report_builder_defaults() {
        let b = SenderReportBuilder::default();
        assert_eq!(b.interval, Duration::from_secs(1));
        assert!(!b.use_latest_packet);

        let b = SenderReportBuilder::new()
            .with_interval(Duration::from_millis(250))
            .with_use_latest_packet();
        assert_eq!(b.interval, Duration::from_millis(250));
        assert!(b.use_latest_packet);
    }

    #[tokio::test]
    async fn test_sender_report_after_rtp() {
        let (tick, ticker_gen) = manual_ticker();
        let (now, now_gen) = fixed_now();
        let icpr = SenderReportBuilder::new()
            .with_now(now_gen)
            .with_ticker(ticker_gen)
            .build("s")
            .unwrap();
        let info = StreamInfo {
            ssrc: 123456,
            clock_rate: 90000,
            payload_type: 96,
            ..Default::default()
        };
        let s = MockStream::new(&info, icpr).await;

        for i in 0..10u16 {
            s.write_rtp(&rtp(123456, i, 3000 * i as u32, 2)).await.unwrap();
            s.written_rtp().await.unwrap();
        }
        tick.send(()).await.unwrap();

        let pkts = s.written_rtcp().await.unwrap();
        let sr = as_sr(&pkts);
        assert_eq!(sr.ssrc, 123456);
        assert_eq!(sr.packet_count, 10);
        assert_eq!(sr.octet_count, 20);
        assert_eq!(sr.rtp_time, 27000);
        assert_eq!(sr.ntp_time, ntp_time(now));

        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sender_report_clock_rate_from_media_descriptions() {
        let (tick, ticker_gen) = manual_ticker();
        let (_, now_gen) = fixed_now();
        let registry = Arc::new(MediaDescriptionRegistry::new());
        registry.insert(7, 96, 48000);

        let icpr = SenderReportBuilder::new()
            .with_media_descriptions(registry)
            .with_now(now_gen)
            .with_ticker(ticker_gen)
            .build("s")
            .unwrap();
        let info = StreamInfo {
            ssrc: 7,
            payload_type: 96,
            ..Default::default()
        };
        let s = MockStream::new(&info, icpr).await;

        s.write_rtp(&rtp(7, 1, 960, 4)).await.unwrap();
        s.written_rtp().await.unwrap();
        tick.send(()).await.unwrap();

        let pkts = s.written_rtcp().await.unwrap();
        assert_eq!(as_sr(&pkts).octet_count, 4);

        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sender_report_unknown_clock_rate_passes_through() {
        let (tick, ticker_gen) = manual_ticker();
        let icpr = SenderReportBuilder::new()
            .with_ticker(ticker_gen)
            .build("s")
            .unwrap();
        let info = StreamInfo {
            ssrc: 7,
            ..Default::default()
        };
        let s = MockStream::new(&info, icpr).await;

        s.write_rtp(&rtp(7, 1, 960, 4)).await.unwrap();
        s.written_rtp().await.unwrap();
        tick.send(()).await.unwrap();
        tick.send(()).await.unwrap();
        assert!(s.last_written_rtcp().await.is_none());

        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sender_report_rebind_rtcp_writer() {
        let (tick, ticker_gen) = manual_ticker();
        let (_, now_gen) = fixed_now();
        let icpr = SenderReportBuilder::new()
            .with_now(now_gen)
            .with_ticker(ticker_gen)
            .build("s")
            .unwrap();
        let info = StreamInfo {
            ssrc: 9,
            clock_rate: 90000,
            ..Default::default()
        };
        let s = MockStream::new(&info, Arc::clone(&icpr)).await;
        s.write_rtp(&rtp(9, 1, 0, 4)).await.unwrap();
        s.written_rtp().await.unwrap();

        let (broken, mut refused) = broken_rtcp_writer();
        icpr.bind_rtcp_writer(broken).await;
        tick.send(()).await.unwrap();
        assert_eq!(as_sr(&refused.recv().await.unwrap()).packet_count, 1);

        let (writer, mut written) = rtcp_writer_channel();
        icpr.bind_rtcp_writer(writer).await;
        s.write_rtp(&rtp(9, 2, 3000, 4)).await.unwrap();
        s.written_rtp().await.unwrap();
        tick.send(()).await.unwrap();
        let sr_pkts = written.recv().await.unwrap();
        let sr = as_sr(&sr_pkts);
        assert_eq!(sr.ssrc, 9);
        assert_eq!(sr.packet_count, 2);
        assert_eq!(sr.octet_count, 8);
        assert!(s.last_written_rtcp().await.is_none());

        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_sender_report_unbind_stops_reports() {
        let (tick, ticker_gen) = manual_ticker();
        let icpr = SenderReportBuilder::new()
            .with_ticker(ticker_gen)
            .build("s")
            .unwrap();
        let info = StreamInfo {
            ssrc: 7,
            clock_rate: 90000,
            ..Default::default()
        };
        let s = MockStream::new(&info, Arc::clone(&icpr)).await;
        s.write_rtp(&rtp(7, 1, 0, 4)).await.unwrap();
        s.written_rtp().await.unwrap();

        icpr.unbind_local_stream(&info).await;
        tick.send(()).await.unwrap();
        tick.send(()).await.unwrap();
        assert!(s.last_written_rtcp().await.is_none());

        s.close().await.unwrap();
    }
}
