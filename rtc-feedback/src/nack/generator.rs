//! NACK Generator Interceptor - Generates NACK requests for missing packets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{trace, warn};
use rtcp::transport_feedbacks::transport_layer_nack::{
    TransportLayerNack, nack_pairs_from_sequence_numbers,
};
use tokio::sync::mpsc;

use super::receive_log::ReceiveLog;
use super::stream_supports_nack;
use crate::attributes::Attributes;
use crate::error::Result;
use crate::lock;
use crate::session::{
    FnTickerGen, Session, SessionState, Ticker, WriterSlot, interval_ticker,
};
use crate::stream_info::StreamInfo;
use crate::{Interceptor, InterceptorBuilder, RTCPWriter, RTPReader, RtcpPacket};

/// Predicate deciding which remote streams get NACK tracking.
pub type StreamsFilter = Arc<dyn (Fn(&StreamInfo) -> bool) + Send + Sync>;

/// Builder for the NackGeneratorInterceptor.
///
/// # Example
///
/// ```ignore
/// use rtc_feedback::{Registry, NackGeneratorBuilder};
/// use std::time::Duration;
///
/// let registry = Registry::new()
///     .with(Box::new(NackGeneratorBuilder::new()
///         .with_size(512)
///         .with_interval(Duration::from_millis(100))
///         .with_skip_last_n(2)));
/// ```
#[derive(Clone)]
pub struct NackGeneratorBuilder {
    /// Size of the receive log (must be power of 2: 64, 128, ..., 32768).
    size: u16,
    /// Interval between NACK generation cycles.
    interval: Duration,
    /// Number of most recent packets to skip when generating NACKs.
    skip_last_n: u16,
    /// Maximum number of NACKs to send per missing packet (0 = unlimited).
    max_nacks_per_packet: u16,
    streams_filter: Option<StreamsFilter>,
    ticker_gen: Option<FnTickerGen>,
}

impl Default for NackGeneratorBuilder {
    fn default() -> Self {
        Self {
            size: 512,
            interval: Duration::from_millis(100),
            skip_last_n: 0,
            max_nacks_per_packet: 0,
            streams_filter: None,
            ticker_gen: None,
        }
    }
}

impl NackGeneratorBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the size of the receive log.
    ///
    /// Size must be a power of 2 between 64 and 32768 (inclusive).
    pub fn with_size(mut self, size: u16) -> Self {
        self.size = size;
        self
    }

    /// Set the interval between NACK generation cycles.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the number of most recent packets to skip when generating NACKs.
    ///
    /// This helps avoid generating NACKs for packets that are simply delayed
    /// and haven't arrived yet.
    pub fn with_skip_last_n(mut self, skip_last_n: u16) -> Self {
        self.skip_last_n = skip_last_n;
        self
    }

    /// Set the maximum number of NACKs to send per missing packet.
    ///
    /// Set to 0 (default) for unlimited NACKs.
    pub fn with_max_nacks_per_packet(mut self, max: u16) -> Self {
        self.max_nacks_per_packet = max;
        self
    }

    /// Only track remote streams accepted by `filter`, on top of the NACK
    /// feedback negotiation check.
    pub fn with_streams_filter(mut self, filter: StreamsFilter) -> Self {
        self.streams_filter = Some(filter);
        self
    }

    /// Override how the generation loop is clocked.
    pub fn with_ticker(mut self, ticker_gen: FnTickerGen) -> Self {
        self.ticker_gen = Some(ticker_gen);
        self
    }
}

impl InterceptorBuilder for NackGeneratorBuilder {
    fn build(&self, id: &str) -> Result<Arc<dyn Interceptor + Send + Sync>> {
        // fail early on an unsupported size
        ReceiveLog::new(self.size)?;

        Ok(Arc::new(NackGeneratorInterceptor {
            internal: Arc::new(GeneratorInternal {
                size: self.size,
                skip_last_n: self.skip_last_n,
                max_nacks_per_packet: self.max_nacks_per_packet,
                sender_ssrc: rand::random::<u32>(),
                streams_filter: self.streams_filter.clone(),
                receive_logs: Mutex::new(HashMap::new()),
                nack_counts: Mutex::new(HashMap::new()),
            }),
            interval: self.interval,
            ticker_gen: self.ticker_gen.clone(),
            session: Session::new(id),
        }))
    }
}

struct GeneratorInternal {
    size: u16,
    skip_last_n: u16,
    max_nacks_per_packet: u16,
    /// Sender SSRC for NACK packets, fixed for the session.
    sender_ssrc: u32,
    streams_filter: Option<StreamsFilter>,

    receive_logs: Mutex<HashMap<u32, Arc<Mutex<ReceiveLog>>>>,
    /// NACK count per (SSRC, sequence number) for max_nacks_per_packet limiting
    nack_counts: Mutex<HashMap<u32, HashMap<u16, u16>>>,
}

/// Interceptor that generates NACK requests for missing RTP packets.
///
/// This interceptor monitors incoming RTP packets on remote streams,
/// tracks which sequence numbers have been received, and periodically
/// writes RTCP TransportLayerNack packets for missing sequences to the
/// bound RTCP writer.
pub struct NackGeneratorInterceptor {
    internal: Arc<GeneratorInternal>,
    interval: Duration,
    ticker_gen: Option<FnTickerGen>,
    session: Session,
}

impl GeneratorInternal {
    fn stream_accepted(&self, info: &StreamInfo) -> bool {
        stream_supports_nack(info) && self.streams_filter.as_ref().is_none_or(|f| f(info))
    }

    /// Builds one NACK per stream with unreported losses.
    fn generate_nacks(&self, missing: &mut Vec<u16>) -> Vec<TransportLayerNack> {
        let logs: Vec<(u32, Arc<Mutex<ReceiveLog>>)> = {
            let receive_logs = lock(&self.receive_logs);
            receive_logs
                .iter()
                .map(|(ssrc, log)| (*ssrc, Arc::clone(log)))
                .collect()
        };

        let mut nack_counts = lock(&self.nack_counts);
        let mut nacks = Vec::new();
        for (ssrc, receive_log) in logs {
            missing.clear();
            lock(&receive_log).missing_seq_numbers_into(self.skip_last_n, missing);
            if missing.is_empty() {
                nack_counts.remove(&ssrc);
                continue;
            }

            if self.max_nacks_per_packet > 0 {
                let counts = nack_counts.entry(ssrc).or_default();
                counts.retain(|seq, _| missing.contains(seq));
                missing.retain(|seq| {
                    let count = counts.entry(*seq).or_insert(0);
                    if *count < self.max_nacks_per_packet {
                        *count += 1;
                        true
                    } else {
                        false
                    }
                });
                if missing.is_empty() {
                    continue;
                }
            }

            trace!("nack generator: ssrc={ssrc} missing={missing:?}");
            nacks.push(TransportLayerNack {
                sender_ssrc: self.sender_ssrc,
                media_ssrc: ssrc,
                nacks: nack_pairs_from_sequence_numbers(missing),
            });
        }
        nacks
    }
}

impl NackGeneratorInterceptor {
    async fn run(
        internal: Arc<GeneratorInternal>,
        writer: WriterSlot,
        mut ticker: Box<dyn Ticker>,
        mut close_rx: mpsc::Receiver<()>,
    ) {
        let mut missing = Vec::with_capacity(internal.size as usize);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for nack in internal.generate_nacks(&mut missing) {
                        let pkts: [RtcpPacket; 1] = [Box::new(nack)];
                        if let Err(err) = writer.write(&pkts, &Attributes::new()).await {
                            warn!("nack generator: failed sending nack: {err}");
                        }
                    }
                }
                _ = close_rx.recv() => return,
            }
        }
    }
}

#[async_trait]
impl Interceptor for NackGeneratorInterceptor {
    /// Starts the generation loop writing to `writer`, or points the running
    /// loop at it.
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
            NackGeneratorInterceptor::run(internal, slot, ticker, close_rx)
        });

        writer
    }

    /// Tracks sequence numbers of NACK-enabled streams. Without a running
    /// generation loop the reader is returned untouched.
    async fn bind_remote_stream(
        &self,
        info: &StreamInfo,
        reader: Arc<dyn RTPReader + Send + Sync>,
    ) -> Arc<dyn RTPReader + Send + Sync> {
        if self.session.state() != SessionState::Running
            || !self.internal.stream_accepted(info)
        {
            return reader;
        }

        let receive_log = match ReceiveLog::new(self.internal.size) {
            Ok(receive_log) => Arc::new(Mutex::new(receive_log)),
            Err(err) => {
                warn!("nack generator: {err}");
                return reader;
            }
        };
        lock(&self.internal.receive_logs).insert(info.ssrc, Arc::clone(&receive_log));

        Arc::new(GeneratorStream {
            receive_log,
            parent: reader,
        })
    }

    async fn unbind_remote_stream(&self, info: &StreamInfo) {
        lock(&self.internal.receive_logs).remove(&info.ssrc);
        lock(&self.internal.nack_counts).remove(&info.ssrc);
    }

    async fn close(&self) -> Result<()> {
        self.session.close().await;
        Ok(())
    }
}

struct GeneratorStream {
    receive_log: Arc<Mutex<ReceiveLog>>,
    parent: Arc<dyn RTPReader + Send + Sync>,
}

#[async_trait]
impl RTPReader for GeneratorStream {
    async fn read(
        &self,
        buf: &mut [u8],
        attributes: &Attributes,
    ) -> Result<(rtp::packet::Packet, Attributes)> {
        let (pkt, attr) = self.parent.read(buf, attributes).await?;
        lock(&self.receive_log).add(pkt.header.sequence_number);
        Ok((pkt, attr))
    }
}
