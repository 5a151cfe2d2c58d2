use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, trace};
use tokio::sync::{Mutex, mpsc};
use util::marshal::Unmarshal;

use super::{ByteReader, RECEIVE_MTU, is_rtcp};
use crate::attributes::{ATTR_RTP_HEADER_KEY, Attributes};
use crate::error::{Error, Result};
use crate::session::Session;
use crate::{RTCPReader, RTPReader, RtcpPacket};

/// Demuxer splits one datagram stream into an RTP and an RTCP reader.
///
/// A background task reads datagrams and classifies them by the RTCP packet
/// type byte. Both channels hold a single datagram, so the pump only reads
/// ahead as fast as the application consumes. Datagrams without a valid
/// RTCP/RTP header are dropped. A read error from the transport ends the
/// pump, after which both readers fail with [`Error::ErrClosedPipe`].
pub struct Demuxer {
    session: Session,
    rtp_reader: Arc<DemuxRtpReader>,
    rtcp_reader: Arc<DemuxRtcpReader>,
}

impl Demuxer {
    pub fn new(reader: Arc<dyn ByteReader + Send + Sync>) -> Self {
        let (rtp_tx, rtp_rx) = mpsc::channel(1);
        let (rtcp_tx, rtcp_rx) = mpsc::channel(1);

        let session = Session::new("demuxer");
        session.spawn_loop(move |close_rx| Demuxer::run(reader, rtp_tx, rtcp_tx, close_rx));

        Demuxer {
            session,
            rtp_reader: Arc::new(DemuxRtpReader {
                rx: Mutex::new(rtp_rx),
            }),
            rtcp_reader: Arc::new(DemuxRtcpReader {
                rx: Mutex::new(rtcp_rx),
                backlog: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Reader of inbound RTP packets.
    pub fn rtp_reader(&self) -> Arc<DemuxRtpReader> {
        Arc::clone(&self.rtp_reader)
    }

    /// Reader of inbound RTCP batches.
    pub fn rtcp_reader(&self) -> Arc<DemuxRtcpReader> {
        Arc::clone(&self.rtcp_reader)
    }

    /// Stops the pump task. Pending and future reads fail with
    /// [`Error::ErrClosedPipe`].
    pub async fn close(&self) -> Result<()> {
        self.session.close().await;
        Ok(())
    }

    async fn run(
        reader: Arc<dyn ByteReader + Send + Sync>,
        rtp_tx: mpsc::Sender<Bytes>,
        rtcp_tx: mpsc::Sender<Bytes>,
        mut close_rx: mpsc::Receiver<()>,
    ) {
        let mut buf = vec![0u8; RECEIVE_MTU];
        loop {
            let n = tokio::select! {
                _ = close_rx.recv() => return,
                result = reader.read(&mut buf) => match result {
                    Ok(n) => n,
                    Err(err) => {
                        debug!("demuxer: transport read failed: {err}");
                        return;
                    }
                },
            };

            let datagram = Bytes::copy_from_slice(&buf[..n]);
            let tx = match is_rtcp(&datagram) {
                Ok(true) => &rtcp_tx,
                Ok(false) => &rtp_tx,
                Err(err) => {
                    trace!("demuxer: dropping {n} byte datagram: {err}");
                    continue;
                }
            };

            tokio::select! {
                _ = close_rx.recv() => return,
                result = tx.send(datagram) => {
                    if result.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn copy_into(buf: &mut [u8], raw: &[u8]) {
    let n = buf.len().min(raw.len());
    buf[..n].copy_from_slice(&raw[..n]);
}

/// RTP side of a [`Demuxer`].
pub struct DemuxRtpReader {
    rx: Mutex<mpsc::Receiver<Bytes>>,
}

#[async_trait]
impl RTPReader for DemuxRtpReader {
    /// Reads the next RTP packet. The raw datagram is copied into `buf` as
    /// far as it fits and the parsed header is memoized in the returned
    /// attributes.
    async fn read(
        &self,
        buf: &mut [u8],
        attributes: &Attributes,
    ) -> Result<(rtp::packet::Packet, Attributes)> {
        let raw = {
            let mut rx = self.rx.lock().await;
            rx.recv().await.ok_or(Error::ErrClosedPipe)?
        };
        copy_into(buf, &raw);

        let pkt = rtp::packet::Packet::unmarshal(&mut raw.clone())?;
        let mut attributes = attributes.clone();
        attributes.insert(ATTR_RTP_HEADER_KEY, pkt.header.clone());
        Ok((pkt, attributes))
    }
}

/// RTCP side of a [`Demuxer`].
///
/// Packets parsed from a compound datagram that did not fit the caller's
/// batch are kept in a backlog and handed out before the next datagram is
/// read.
pub struct DemuxRtcpReader {
    rx: Mutex<mpsc::Receiver<Bytes>>,
    backlog: Mutex<VecDeque<RtcpPacket>>,
}

impl DemuxRtcpReader {
    /// Reads at most `max` packets.
    pub async fn read_packets(&self, max: usize) -> Result<Vec<RtcpPacket>> {
        let mut backlog = self.backlog.lock().await;
        if backlog.is_empty() {
            let raw = {
                let mut rx = self.rx.lock().await;
                rx.recv().await.ok_or(Error::ErrClosedPipe)?
            };
            backlog.extend(rtcp::packet::unmarshal(&mut raw.clone())?);
        }

        let n = max.min(backlog.len());
        Ok(backlog.drain(..n).collect())
    }
}

#[async_trait]
impl RTCPReader for DemuxRtcpReader {
    async fn read(
        &self,
        _buf: &mut [u8],
        attributes: &Attributes,
    ) -> Result<(Vec<RtcpPacket>, Attributes)> {
        let pkts = self.read_packets(usize::MAX).await?;
        Ok((pkts, attributes.clone()))
    }
}
