//! RTP/RTCP multiplexing over a datagram transport.
//!
//! [`Demuxer`] pumps datagrams from a [`ByteReader`] and hands them to an RTP
//! and an RTCP reader, [`Muxer`] serializes packets into a [`ByteWriter`].

mod demuxer;
mod muxer;

pub use demuxer::{Demuxer, DemuxRtcpReader, DemuxRtpReader};
pub use muxer::Muxer;

use async_trait::async_trait;
use util::marshal::Unmarshal;

use crate::error::Result;

/// Size of the buffer each datagram is read into.
pub const RECEIVE_MTU: usize = 1460;

/// ByteReader yields one datagram per call.
#[async_trait]
pub trait ByteReader {
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;
}

/// ByteWriter sends one datagram per call.
#[async_trait]
pub trait ByteWriter {
    async fn write(&self, buf: &[u8]) -> Result<usize>;
}

/// A connected socket.
#[async_trait]
impl ByteReader for tokio::net::UdpSocket {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.recv(buf).await?)
    }
}

#[async_trait]
impl ByteWriter for tokio::net::UdpSocket {
    async fn write(&self, buf: &[u8]) -> Result<usize> {
        Ok(self.send(buf).await?)
    }
}

/// Reports whether `buf` holds an RTCP packet.
///
/// Returns an error when no RTCP header can be read from `buf`, in which case
/// the datagram is neither RTP nor RTCP.
pub(crate) fn is_rtcp(buf: &[u8]) -> Result<bool> {
    let mut reader = buf;
    rtcp::header::Header::unmarshal(&mut reader)?;
    Ok((200..=207).contains(&buf[1]))
}
