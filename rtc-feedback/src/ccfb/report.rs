//! RTCP Congestion Control Feedback packet (RFC 8888).

use std::any::Any;
use std::fmt;

use bytes::{Buf, BufMut};
use rtcp::header::{HEADER_LENGTH, Header, PacketType};
use rtcp::packet::Packet;
use util::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::attributes::Ecn;
use crate::error::Error;

/// Feedback message type of congestion control feedback.
pub const FORMAT_CCFB: u8 = 11;

/// Arrival time offset meaning "too large or not representable".
pub const ARRIVAL_TIME_OFFSET_UNAVAILABLE: u16 = 0x1FFF;

/// Largest representable arrival time offset, in 1/1024 s.
pub const ARRIVAL_TIME_OFFSET_MAX: u16 = 0x1FFE;

const SSRC_LENGTH: usize = 4;
const REPORT_BLOCK_HEADER_LENGTH: usize = 8;
const METRIC_BLOCK_LENGTH: usize = 2;
const REPORT_TIMESTAMP_LENGTH: usize = 4;

/// Per-packet metrics of one RTP packet.
///
/// ```plain
///  0                   1
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |R|ECN|  Arrival time offset    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CcFeedbackMetricBlock {
    pub received: bool,
    pub ecn: Ecn,
    /// Offset from the report timestamp in 1/1024 s.
    pub arrival_time_offset: u16,
}

impl CcFeedbackMetricBlock {
    fn to_u16(self) -> u16 {
        if !self.received {
            return 0;
        }
        0x8000 | ((self.ecn as u16) << 13) | (self.arrival_time_offset & 0x1FFF)
    }

    fn from_u16(v: u16) -> Self {
        Self {
            received: v & 0x8000 != 0,
            ecn: Ecn::from((v >> 13) as u8),
            arrival_time_offset: v & 0x1FFF,
        }
    }
}

/// Metrics of consecutive packets of one RTP stream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CcFeedbackReportBlock {
    pub media_ssrc: u32,
    pub begin_sequence: u16,
    pub metric_blocks: Vec<CcFeedbackMetricBlock>,
}

impl CcFeedbackReportBlock {
    fn len(&self) -> usize {
        let metrics = self.metric_blocks.len() * METRIC_BLOCK_LENGTH;
        // metric blocks are padded to a 32-bit boundary
        REPORT_BLOCK_HEADER_LENGTH + metrics.div_ceil(4) * 4
    }
}

/// RTCP Congestion Control Feedback report.
///
/// ```plain
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P| FMT=11  |   PT = 205    |          length               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                 SSRC of RTCP packet sender                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                   SSRC of 1st RTP Stream                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |          begin_seq            |          num_reports          |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |R|ECN|  Arrival time offset    | ...                           .
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// .                                                               .
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                 Report Timestamp (32 bits)                    |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CcFeedbackReport {
    pub sender_ssrc: u32,
    pub report_blocks: Vec<CcFeedbackReportBlock>,
    /// Middle 32 bits of the NTP time the report was generated.
    pub report_timestamp: u32,
}

impl CcFeedbackReport {
    /// Number of metric blocks over all report blocks.
    pub fn metric_block_count(&self) -> usize {
        self.report_blocks
            .iter()
            .map(|b| b.metric_blocks.len())
            .sum()
    }
}

impl fmt::Display for CcFeedbackReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CCFeedbackReport from {:x}", self.sender_ssrc)?;
        writeln!(f, "\tReport timestamp: {}", self.report_timestamp)?;
        for block in &self.report_blocks {
            writeln!(
                f,
                "\tSSRC {:x}: begin {} count {}",
                block.media_ssrc,
                block.begin_sequence,
                block.metric_blocks.len()
            )?;
            for (i, m) in block.metric_blocks.iter().enumerate() {
                let seq = block.begin_sequence.wrapping_add(i as u16);
                if m.received {
                    writeln!(
                        f,
                        "\t\t{seq}: received ecn={:?} ato={}",
                        m.ecn, m.arrival_time_offset
                    )?;
                } else {
                    writeln!(f, "\t\t{seq}: lost")?;
                }
            }
        }
        Ok(())
    }
}

impl Packet for CcFeedbackReport {
    fn header(&self) -> Header {
        Header {
            padding: false,
            count: FORMAT_CCFB,
            packet_type: PacketType::TransportSpecificFeedback,
            length: ((self.marshal_size() / 4) - 1) as u16,
        }
    }

    fn destination_ssrc(&self) -> Vec<u32> {
        self.report_blocks.iter().map(|b| b.media_ssrc).collect()
    }

    fn raw_size(&self) -> usize {
        HEADER_LENGTH
            + SSRC_LENGTH
            + self.report_blocks.iter().map(|b| b.len()).sum::<usize>()
            + REPORT_TIMESTAMP_LENGTH
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn equal(&self, other: &(dyn Packet + Send + Sync)) -> bool {
        other
            .as_any()
            .downcast_ref::<CcFeedbackReport>()
            .is_some_and(|o| self == o)
    }

    fn cloned(&self) -> Box<dyn Packet + Send + Sync> {
        Box::new(self.clone())
    }
}

impl MarshalSize for CcFeedbackReport {
    fn marshal_size(&self) -> usize {
        self.raw_size()
    }
}

impl Marshal for CcFeedbackReport {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize, util::Error> {
        let size = self.marshal_size();
        if buf.len() < size {
            return Err(Error::ErrShortBuffer.into());
        }

        let n = self.header().marshal_to(buf)?;
        let mut b = &mut buf[n..size];
        b.put_u32(self.sender_ssrc);
        for block in &self.report_blocks {
            b.put_u32(block.media_ssrc);
            b.put_u16(block.begin_sequence);
            b.put_u16(block.metric_blocks.len() as u16);
            for m in &block.metric_blocks {
                b.put_u16(m.to_u16());
            }
            if block.metric_blocks.len() % 2 == 1 {
                b.put_u16(0);
            }
        }
        b.put_u32(self.report_timestamp);

        Ok(size)
    }
}

impl Unmarshal for CcFeedbackReport {
    fn unmarshal<B>(raw_packet: &mut B) -> Result<Self, util::Error>
    where
        Self: Sized,
        B: Buf,
    {
        let header = Header::unmarshal(raw_packet)?;
        if header.packet_type != PacketType::TransportSpecificFeedback
            || header.count != FORMAT_CCFB
        {
            return Err(Error::ErrWrongType.into());
        }

        let mut remaining = header.length as usize * 4;
        if raw_packet.remaining() < remaining || remaining < SSRC_LENGTH + REPORT_TIMESTAMP_LENGTH
        {
            return Err(Error::ErrPacketTooShort.into());
        }

        let sender_ssrc = raw_packet.get_u32();
        remaining -= SSRC_LENGTH;

        let mut report_blocks = Vec::new();
        while remaining > REPORT_TIMESTAMP_LENGTH {
            if remaining < REPORT_BLOCK_HEADER_LENGTH + REPORT_TIMESTAMP_LENGTH {
                return Err(Error::ErrPacketTooShort.into());
            }
            let media_ssrc = raw_packet.get_u32();
            let begin_sequence = raw_packet.get_u16();
            let num_reports = raw_packet.get_u16() as usize;
            remaining -= REPORT_BLOCK_HEADER_LENGTH;

            let padded = (num_reports * METRIC_BLOCK_LENGTH).div_ceil(4) * 4;
            if remaining < padded + REPORT_TIMESTAMP_LENGTH {
                return Err(Error::ErrPacketTooShort.into());
            }
            let metric_blocks = (0..num_reports)
                .map(|_| CcFeedbackMetricBlock::from_u16(raw_packet.get_u16()))
                .collect();
            raw_packet.advance(padded - num_reports * METRIC_BLOCK_LENGTH);
            remaining -= padded;

            report_blocks.push(CcFeedbackReportBlock {
                media_ssrc,
                begin_sequence,
                metric_blocks,
            });
        }

        let report_timestamp = raw_packet.get_u32();

        Ok(CcFeedbackReport {
            sender_ssrc,
            report_blocks,
            report_timestamp,
        })
    }
}
