//! Channel-backed harness for exercising an interceptor without a transport.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use util::marshal::MarshalSize;

use crate::error::{Error, Result};
use crate::session::{FnTickerGen, Ticker};
use crate::{
    Attributes, Interceptor, RTCPReader, RTCPWriter, RTPReader, RTPWriter, RtcpPacket, StreamInfo,
};

const CHANNEL_SIZE: usize = 1000;

/// MockStream binds one local and one remote stream plus both RTCP directions
/// of an interceptor to in-memory channels.
///
/// * `write_rtp`/`write_rtcp` push through the interceptor's writers, results
///   show up in `written_rtp`/`written_rtcp`.
/// * `receive_rtp`/`receive_rtcp` feed the interceptor's readers, results show
///   up in `read_rtp`/`read_rtcp`.
pub struct MockStream {
    interceptor: Arc<dyn Interceptor + Send + Sync>,
    info: StreamInfo,

    rtcp_writer: Arc<dyn RTCPWriter + Send + Sync>,
    rtp_writer: Arc<dyn RTPWriter + Send + Sync>,

    rtcp_in_tx: Mutex<Option<mpsc::Sender<Vec<RtcpPacket>>>>,
    rtp_in_tx: Mutex<Option<mpsc::Sender<rtp::packet::Packet>>>,

    rtcp_out_modified_rx: Mutex<mpsc::Receiver<Vec<RtcpPacket>>>,
    rtp_out_modified_rx: Mutex<mpsc::Receiver<rtp::packet::Packet>>,
    rtcp_in_modified_rx: Mutex<mpsc::Receiver<Result<Vec<RtcpPacket>>>>,
    rtp_in_modified_rx: Mutex<mpsc::Receiver<Result<rtp::packet::Packet>>>,
}

struct ChannelRtcpWriter(mpsc::Sender<Vec<RtcpPacket>>);

#[async_trait]
impl RTCPWriter for ChannelRtcpWriter {
    async fn write(&self, pkts: &[RtcpPacket], _attributes: &Attributes) -> Result<usize> {
        let n = pkts.iter().map(|p| p.marshal_size()).sum();
        self.0
            .send(pkts.iter().map(|p| p.cloned()).collect())
            .await
            .map_err(|_| Error::ErrClosedPipe)?;
        Ok(n)
    }
}

struct BrokenRtcpWriter(mpsc::Sender<Vec<RtcpPacket>>);

#[async_trait]
impl RTCPWriter for BrokenRtcpWriter {
    async fn write(&self, pkts: &[RtcpPacket], _attributes: &Attributes) -> Result<usize> {
        let _ = self.0.send(pkts.iter().map(|p| p.cloned()).collect()).await;
        Err(Error::ErrClosedPipe)
    }
}

/// RTCP writer forwarding every batch into the returned channel.
pub fn rtcp_writer_channel() -> (
    Arc<dyn RTCPWriter + Send + Sync>,
    mpsc::Receiver<Vec<RtcpPacket>>,
) {
    let (tx, rx) = mpsc::channel(CHANNEL_SIZE);
    (Arc::new(ChannelRtcpWriter(tx)), rx)
}

/// RTCP writer whose every write fails with `ErrClosedPipe`. Each refused
/// batch still shows up in the returned channel.
pub fn broken_rtcp_writer() -> (
    Arc<dyn RTCPWriter + Send + Sync>,
    mpsc::Receiver<Vec<RtcpPacket>>,
) {
    let (tx, rx) = mpsc::channel(CHANNEL_SIZE);
    (Arc::new(BrokenRtcpWriter(tx)), rx)
}

struct ChannelRtpWriter(mpsc::Sender<rtp::packet::Packet>);

#[async_trait]
impl RTPWriter for ChannelRtpWriter {
    async fn write(&self, pkt: &rtp::packet::Packet, _attributes: &Attributes) -> Result<usize> {
        let n = pkt.header.marshal_size() + pkt.payload.len();
        self.0
            .send(pkt.clone())
            .await
            .map_err(|_| Error::ErrClosedPipe)?;
        Ok(n)
    }
}

struct ChannelRtcpReader(Mutex<mpsc::Receiver<Vec<RtcpPacket>>>);

#[async_trait]
impl RTCPReader for ChannelRtcpReader {
    async fn read(
        &self,
        _buf: &mut [u8],
        attributes: &Attributes,
    ) -> Result<(Vec<RtcpPacket>, Attributes)> {
        let mut rx = self.0.lock().await;
        let pkts = rx.recv().await.ok_or(Error::ErrClosedPipe)?;
        Ok((pkts, attributes.clone()))
    }
}

struct ChannelRtpReader(Mutex<mpsc::Receiver<rtp::packet::Packet>>);

#[async_trait]
impl RTPReader for ChannelRtpReader {
    async fn read(
        &self,
        _buf: &mut [u8],
        attributes: &Attributes,
    ) -> Result<(rtp::packet::Packet, Attributes)> {
        let mut rx = self.0.lock().await;
        let pkt = rx.recv().await.ok_or(Error::ErrClosedPipe)?;
        Ok((pkt, attributes.clone()))
    }
}

struct ChannelTicker(mpsc::Receiver<()>);

#[async_trait]
impl Ticker for ChannelTicker {
    async fn tick(&mut self) {
        if self.0.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

/// Ticker factory whose ticks are fired by hand through the returned sender.
///
/// Only the first ticker created is wired to the sender; later ones never
/// tick. Once the sender is dropped the ticker stays pending forever.
pub fn manual_ticker() -> (mpsc::Sender<()>, FnTickerGen) {
    let (tx, rx) = mpsc::channel(1);
    let rx = std::sync::Mutex::new(Some(rx));
    let ticker_gen: FnTickerGen = Arc::new(move |_| {
        let rx = rx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let rx = rx.unwrap_or_else(|| mpsc::channel(1).1);
        Box::new(ChannelTicker(rx)) as Box<dyn Ticker>
    });
    (tx, ticker_gen)
}

impl MockStream {
    /// Binds `info` as both a local and a remote stream of `interceptor`.
    pub async fn new(
        info: &StreamInfo,
        interceptor: Arc<dyn Interceptor + Send + Sync>,
    ) -> Arc<Self> {
        let (rtcp_in_tx, rtcp_in_rx) = mpsc::channel(CHANNEL_SIZE);
        let (rtp_in_tx, rtp_in_rx) = mpsc::channel(CHANNEL_SIZE);
        let (rtcp_out_modified_tx, rtcp_out_modified_rx) = mpsc::channel(CHANNEL_SIZE);
        let (rtp_out_modified_tx, rtp_out_modified_rx) = mpsc::channel(CHANNEL_SIZE);
        let (rtcp_in_modified_tx, rtcp_in_modified_rx) = mpsc::channel(CHANNEL_SIZE);
        let (rtp_in_modified_tx, rtp_in_modified_rx) = mpsc::channel(CHANNEL_SIZE);

        let rtcp_writer = interceptor
            .bind_rtcp_writer(Arc::new(ChannelRtcpWriter(rtcp_out_modified_tx)))
            .await;
        let rtcp_reader = interceptor
            .bind_rtcp_reader(Arc::new(ChannelRtcpReader(Mutex::new(rtcp_in_rx))))
            .await;
        let rtp_writer = interceptor
            .bind_local_stream(info, Arc::new(ChannelRtpWriter(rtp_out_modified_tx)))
            .await;
        let rtp_reader = interceptor
            .bind_remote_stream(info, Arc::new(ChannelRtpReader(Mutex::new(rtp_in_rx))))
            .await;

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                let result = rtcp_reader
                    .read(&mut buf, &Attributes::new())
                    .await
                    .map(|(pkts, _)| pkts);
                let closed = matches!(result, Err(Error::ErrClosedPipe));
                if rtcp_in_modified_tx.send(result).await.is_err() || closed {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                let result = rtp_reader
                    .read(&mut buf, &Attributes::new())
                    .await
                    .map(|(pkt, _)| pkt);
                let closed = matches!(result, Err(Error::ErrClosedPipe));
                if rtp_in_modified_tx.send(result).await.is_err() || closed {
                    break;
                }
            }
        });

        Arc::new(MockStream {
            interceptor,
            info: info.clone(),
            rtcp_writer,
            rtp_writer,
            rtcp_in_tx: Mutex::new(Some(rtcp_in_tx)),
            rtp_in_tx: Mutex::new(Some(rtp_in_tx)),
            rtcp_out_modified_rx: Mutex::new(rtcp_out_modified_rx),
            rtp_out_modified_rx: Mutex::new(rtp_out_modified_rx),
            rtcp_in_modified_rx: Mutex::new(rtcp_in_modified_rx),
            rtp_in_modified_rx: Mutex::new(rtp_in_modified_rx),
        })
    }

    /// Writes a batch through the interceptor's outbound RTCP writer.
    pub async fn write_rtcp(&self, pkts: &[RtcpPacket]) -> Result<usize> {
        self.rtcp_writer.write(pkts, &Attributes::new()).await
    }

    /// Writes a packet through the interceptor's outbound RTP writer.
    pub async fn write_rtp(&self, pkt: &rtp::packet::Packet) -> Result<usize> {
        self.write_rtp_with_attributes(pkt, &Attributes::new()).await
    }

    pub async fn write_rtp_with_attributes(
        &self,
        pkt: &rtp::packet::Packet,
        attributes: &Attributes,
    ) -> Result<usize> {
        self.rtp_writer.write(pkt, attributes).await
    }

    /// Delivers an inbound RTCP batch to the interceptor's reader.
    pub async fn receive_rtcp(&self, pkts: Vec<RtcpPacket>) {
        let tx = self.rtcp_in_tx.lock().await;
        if let Some(tx) = &*tx {
            let _ = tx.send(pkts).await;
        }
    }

    /// Delivers an inbound RTP packet to the interceptor's reader.
    pub async fn receive_rtp(&self, pkt: rtp::packet::Packet) {
        let tx = self.rtp_in_tx.lock().await;
        if let Some(tx) = &*tx {
            let _ = tx.send(pkt).await;
        }
    }

    /// Next RTCP batch that left the interceptor towards the transport.
    pub async fn written_rtcp(&self) -> Option<Vec<RtcpPacket>> {
        let mut rx = self.rtcp_out_modified_rx.lock().await;
        rx.recv().await
    }

    /// Like [`MockStream::written_rtcp`] but does not wait.
    pub async fn last_written_rtcp(&self) -> Option<Vec<RtcpPacket>> {
        let mut last = None;
        let mut rx = self.rtcp_out_modified_rx.lock().await;
        while let Ok(v) = rx.try_recv() {
            last = Some(v);
        }
        last
    }

    /// Next RTP packet that left the interceptor towards the transport.
    pub async fn written_rtp(&self) -> Option<rtp::packet::Packet> {
        let mut rx = self.rtp_out_modified_rx.lock().await;
        rx.recv().await
    }

    /// Next RTCP batch the application would read.
    pub async fn read_rtcp(&self) -> Option<Result<Vec<RtcpPacket>>> {
        let mut rx = self.rtcp_in_modified_rx.lock().await;
        rx.recv().await
    }

    /// Next RTP packet the application would read.
    pub async fn read_rtp(&self) -> Option<Result<rtp::packet::Packet>> {
        let mut rx = self.rtp_in_modified_rx.lock().await;
        rx.recv().await
    }

    /// Unbinds both streams, ends the inbound readers and closes the interceptor.
    pub async fn close(&self) -> Result<()> {
        self.interceptor.unbind_local_stream(&self.info).await;
        self.interceptor.unbind_remote_stream(&self.info).await;
        self.rtcp_in_tx.lock().await.take();
        self.rtp_in_tx.lock().await.take();
        self.interceptor.close().await
    }
}
