//! TWCC Receiver Interceptor - tracks incoming packets and generates feedback.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use log::{trace, warn};
use rtp::extension::transport_cc_extension::TransportCcExtension;
use tokio::sync::mpsc;
use util::marshal::Unmarshal;

use super::recorder::Recorder;
use super::stream_supports_twcc;
use crate::attributes::Attributes;
use crate::error::Result;
use crate::session::{
    FnTickerGen, FnTimeGen, Session, Ticker, WriterSlot, interval_ticker, system_now,
};
use crate::stream_info::StreamInfo;
use crate::{Interceptor, InterceptorBuilder, RTCPWriter, RTPReader, RtcpPacket, lock};

/// Default interval for sending TWCC feedback.
const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

/// Builder for the TwccReceiverInterceptor.
///
/// # Example
///
/// ```ignore
/// use rtc_feedback::{Registry, TwccReceiverBuilder};
/// use std::time::Duration;
///
/// let registry = Registry::new().with(Box::new(
///     TwccReceiverBuilder::new().with_interval(Duration::from_millis(100)),
/// ));
/// ```
#[derive(Clone)]
pub struct TwccReceiverBuilder {
    /// Interval between feedback reports.
    interval: Duration,
    now: Option<FnTimeGen>,
    ticker_gen: Option<FnTickerGen>,
}

impl Default for TwccReceiverBuilder {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            now: None,
            ticker_gen: None,
        }
    }
}

impl TwccReceiverBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the interval between feedback reports.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Override the clock used to timestamp arrivals.
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

impl InterceptorBuilder for TwccReceiverBuilder {
    fn build(&self, id: &str) -> Result<Arc<dyn Interceptor + Send + Sync>> {
        Ok(Arc::new(TwccReceiverInterceptor {
            internal: Arc::new(TwccReceiverInternal {
                now: self.now.clone().unwrap_or_else(|| Arc::new(system_now)),
                state: Mutex::new(ReceiverState {
                    start_time: None,
                    recorder: Recorder::new(rand::random::<u32>()),
                }),
            }),
            interval: self.interval,
            ticker_gen: self.ticker_gen.clone(),
            session: Session::new(id),
        }))
    }
}

struct ReceiverState {
    /// Arrival times are counted from the first packet.
    start_time: Option<SystemTime>,
    recorder: Recorder,
}

struct TwccReceiverInternal {
    now: FnTimeGen,
    state: Mutex<ReceiverState>,
}

impl TwccReceiverInternal {
    fn record(&self, media_ssrc: u32, transport_sequence: u16) {
        let now = (self.now)();
        let mut state = lock(&self.state);
        let start = *state.start_time.get_or_insert(now);
        let arrival_time = now
            .duration_since(start)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        state.recorder.record(media_ssrc, transport_sequence, arrival_time);
    }

    /// Every feedback packet covering what arrived since the last call.
    fn pending_feedback(&self) -> Vec<RtcpPacket> {
        let mut state = lock(&self.state);
        let mut pkts: Vec<RtcpPacket> = Vec::new();
        while state.recorder.has_pending() {
            pkts.push(Box::new(state.recorder.build_feedback_packet()));
        }
        pkts
    }
}

/// Interceptor that tracks incoming RTP packets and generates TWCC feedback.
///
/// Remote streams that negotiated the transport-cc header extension have
/// the transport sequence number of every packet recorded with its arrival
/// time. Each tick the pending arrivals are written as TransportLayerCc
/// packets to the bound RTCP writer; ticks with nothing new write nothing.
pub struct TwccReceiverInterceptor {
    internal: Arc<TwccReceiverInternal>,
    interval: Duration,
    ticker_gen: Option<FnTickerGen>,
    session: Session,
}

impl TwccReceiverInterceptor {
    async fn run(
        internal: Arc<TwccReceiverInternal>,
        writer: WriterSlot,
        mut ticker: Box<dyn Ticker>,
        mut close_rx: mpsc::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pkts = internal.pending_feedback();
                    if pkts.is_empty() {
                        continue;
                    }
                    if let Err(err) = writer.write(&pkts, &Attributes::new()).await {
                        warn!("twcc receiver: failed sending feedback: {err}");
                    }
                }
                _ = close_rx.recv() => return,
            }
        }
    }
}

#[async_trait]
impl Interceptor for TwccReceiverInterceptor {
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
            TwccReceiverInterceptor::run(internal, slot, ticker, close_rx)
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
        let Some(hdr_ext_id) = stream_supports_twcc(info) else {
            return reader;
        };
        trace!(
            "twcc receiver {}: recording ssrc={} from extension id {}",
            self.session.id(),
            info.ssrc,
            hdr_ext_id
        );

        Arc::new(TwccReceiverRtpReader {
            hdr_ext_id,
            internal: Arc::clone(&self.internal),
            parent: reader,
        })
    }

    async fn close(&self) -> Result<()> {
        self.session.close().await;
        Ok(())
    }
}

struct TwccReceiverRtpReader {
    hdr_ext_id: u8,
    internal: Arc<TwccReceiverInternal>,
    parent: Arc<dyn RTPReader + Send + Sync>,
}

#[async_trait]
impl RTPReader for TwccReceiverRtpReader {
    async fn read(
        &self,
        buf: &mut [u8],
        attributes: &Attributes,
    ) -> Result<(rtp::packet::Packet, Attributes)> {
        let (pkt, attr) = self.parent.read(buf, attributes).await?;
        if let Some(ext) = pkt.header.get_extension(self.hdr_ext_id) {
            let tcc = TransportCcExtension::unmarshal(&mut ext.as_ref())?;
            self.internal.record(pkt.header.ssrc, tcc.transport_sequence);
        }
        Ok((pkt, attr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockStream, broken_rtcp_writer, manual_ticker, rtcp_writer_channel};
    use crate::stream_info::RTPHeaderExtension;
    use crate::twcc::TRANSPORT_CC_URI;
    use rtcp::transport_feedbacks::transport_layer_cc::{
        PacketStatusChunk, RunLengthChunk, StatusChunkTypeTcc, SymbolTypeTcc, TransportLayerCc,
    };
    use util::marshal::Marshal;

    fn twcc_stream(ssrc: u32) -> StreamInfo {
        StreamInfo {
            ssrc,
            rtp_header_extensions: vec![RTPHeaderExtension {
                uri: TRANSPORT_CC_URI.to_string(),
                id: 5,
            }],
            ..Default::default()
        }
    }

    fn rtp_with_twcc(ssrc: u32, seq: u16, transport_sequence: u16) -> rtp::packet::Packet {
        let mut pkt = rtp::packet::Packet {
            header: rtp::header::Header {
                ssrc,
                sequence_number: seq,
                ..Default::default()
            },
            payload: vec![].into(),
        };
        let ext = TransportCcExtension { transport_sequence }.marshal().unwrap();
        pkt.header.set_extension(5, ext).unwrap();
        pkt
    }

    fn manual_clock() -> (Arc<Mutex<SystemTime>>, FnTimeGen) {
        let clock = Arc::new(Mutex::new(
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        ));
        let c = Arc::clone(&clock);
        (clock, Arc::new(move || *c.lock().unwrap()))
    }

    fn as_tcc(pkt: &RtcpPacket) -> &TransportLayerCc {
        pkt.as_any()
            .downcast_ref::<TransportLayerCc>()
            .expect("expected TransportLayerCc")
    }

    #[test]
    fn test_twcc_receiver_builder_defaults() {
        let b = TwccReceiverBuilder::default();
        assert_eq!(b.interval, DEFAULT_INTERVAL);

        let b = TwccReceiverBuilder::new().with_interval(Duration::from_millis(50));
        assert_eq!(b.interval, Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_twcc_receiver_generates_feedback() {
        let (tick, ticker_gen) = manual_ticker();
        let (clock, now) = manual_clock();
        let icpr = TwccReceiverBuilder::new()
            .with_now(now)
            .with_ticker(ticker_gen)
            .build("s")
            .unwrap();
        let s = MockStream::new(&twcc_stream(1234), icpr).await;

        for i in 0..7u16 {
            s.receive_rtp(rtp_with_twcc(1234, i, i)).await;
            s.read_rtp().await.unwrap().unwrap();
            *clock.lock().unwrap() += Duration::from_micros(250);
        }
        *clock.lock().unwrap() += Duration::from_millis(100);
        s.receive_rtp(rtp_with_twcc(1234, 7, 7)).await;
        s.read_rtp().await.unwrap().unwrap();

        tick.send(()).await.unwrap();
        let pkts = s.written_rtcp().await.unwrap();
        assert_eq!(pkts.len(), 1);
        let tcc = as_tcc(&pkts[0]);
        assert_eq!(tcc.media_ssrc, 1234);
        assert_eq!(tcc.base_sequence_number, 0);
        assert_eq!(tcc.packet_status_count, 8);
        assert_eq!(
            tcc.packet_chunks,
            vec![
                PacketStatusChunk::RunLengthChunk(RunLengthChunk {
                    type_tcc: StatusChunkTypeTcc::RunLengthChunk,
                    packet_status_symbol: SymbolTypeTcc::PacketReceivedSmallDelta,
                    run_length: 7,
                }),
                PacketStatusChunk::RunLengthChunk(RunLengthChunk {
                    type_tcc: StatusChunkTypeTcc::RunLengthChunk,
                    packet_status_symbol: SymbolTypeTcc::PacketReceivedLargeDelta,
                    run_length: 1,
                }),
            ]
        );

        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_twcc_receiver_quiet_tick_writes_nothing() {
        let (tick, ticker_gen) = manual_ticker();
        let icpr = TwccReceiverBuilder::new()
            .with_ticker(ticker_gen)
            .build("s")
            .unwrap();
        let s = MockStream::new(&twcc_stream(1234), icpr).await;

        s.receive_rtp(rtp_with_twcc(1234, 1, 1)).await;
        s.read_rtp().await.unwrap().unwrap();
        tick.send(()).await.unwrap();
        let first = s.written_rtcp().await.unwrap();
        assert_eq!(as_tcc(&first[0]).packet_status_count, 1);

        tick.send(()).await.unwrap();
        tick.send(()).await.unwrap();
        assert!(s.last_written_rtcp().await.is_none());

        s.receive_rtp(rtp_with_twcc(1234, 2, 2)).await;
        s.read_rtp().await.unwrap().unwrap();
        tick.send(()).await.unwrap();
        let second = s.written_rtcp().await.unwrap();
        let tcc = as_tcc(&second[0]);
        assert_eq!(tcc.base_sequence_number, 2);
        assert_eq!(tcc.fb_pkt_count, as_tcc(&first[0]).fb_pkt_count + 1);

        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_twcc_receiver_rebind_rtcp_writer() {
        let (tick, ticker_gen) = manual_ticker();
        let icpr = TwccReceiverBuilder::new()
            .with_ticker(ticker_gen)
            .build("s")
            .unwrap();
        let s = MockStream::new(&twcc_stream(1234), Arc::clone(&icpr)).await;
        s.receive_rtp(rtp_with_twcc(1234, 1, 1)).await;
        s.read_rtp().await.unwrap().unwrap();

        let (broken, mut refused) = broken_rtcp_writer();
        icpr.bind_rtcp_writer(broken).await;
        tick.send(()).await.unwrap();
        let pkts = refused.recv().await.unwrap();
        assert_eq!(as_tcc(&pkts[0]).base_sequence_number, 1);

        let (writer, mut written) = rtcp_writer_channel();
        icpr.bind_rtcp_writer(writer).await;
        s.receive_rtp(rtp_with_twcc(1234, 2, 2)).await;
        s.read_rtp().await.unwrap().unwrap();
        tick.send(()).await.unwrap();
        let pkts = written.recv().await.unwrap();
        let tcc = as_tcc(&pkts[0]);
        assert_eq!(tcc.media_ssrc, 1234);
        assert_eq!(tcc.base_sequence_number, 2);
        assert_eq!(tcc.packet_status_count, 1);
        assert!(s.last_written_rtcp().await.is_none());

        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_twcc_receiver_ignores_streams_without_extension() {
        let (tick, ticker_gen) = manual_ticker();
        let icpr = TwccReceiverBuilder::new()
            .with_ticker(ticker_gen)
            .build("s")
            .unwrap();
        let info = StreamInfo {
            ssrc: 1234,
            ..Default::default()
        };
        let s = MockStream::new(&info, icpr).await;

        s.receive_rtp(rtp_with_twcc(1234, 1, 1)).await;
        s.read_rtp().await.unwrap().unwrap();
        tick.send(()).await.unwrap();
        tick.send(()).await.unwrap();
        assert!(s.last_written_rtcp().await.is_none());

        s.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_twcc_receiver_packet_without_extension() {
        let (tick, ticker_gen) = manual_ticker();
        let icpr = TwccReceiverBuilder::new()
            .with_ticker(ticker_gen)
            .build("s")
            .unwrap();
        let s = MockStream::new(&twcc_stream(1234), icpr).await;

        s.receive_rtp(rtp::packet::Packet::default()).await;
        s.read_rtp().await.unwrap().unwrap();
        tick.send(()).await.unwrap();
        tick.send(()).await.unwrap();
        assert!(s.last_written_rtcp().await.is_none());

        s.close().await.unwrap();
    }
}
