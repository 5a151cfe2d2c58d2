//! CCFB Recorder - collects arrivals of all streams into one feedback report.

use std::collections::BTreeMap;
use std::time::SystemTime;

use rtcp::header::HEADER_LENGTH;

use super::report::CcFeedbackReport;
use super::stream_log::StreamLog;
use crate::attributes::Ecn;
use crate::time::{ntp_middle32, ntp_time};

/// Sender SSRC plus report timestamp.
const FIXED_REPORT_LENGTH: usize = HEADER_LENGTH + 4 + 4;
/// Media SSRC, begin_seq and num_reports.
const REPORT_BLOCK_HEADER_LENGTH: usize = 8;

pub(crate) struct Recorder {
    sender_ssrc: u32,
    streams: BTreeMap<u32, StreamLog>,
}

impl Recorder {
    pub(crate) fn new(sender_ssrc: u32) -> Self {
        Self {
            sender_ssrc,
            streams: BTreeMap::new(),
        }
    }

    pub(crate) fn add_packet(&mut self, now: SystemTime, ssrc: u32, seq: u16, ecn: Ecn) {
        self.streams
            .entry(ssrc)
            .or_insert_with(|| StreamLog::new(ssrc))
            .add(now, seq, ecn);
    }

    pub(crate) fn remove_stream(&mut self, ssrc: u32) {
        self.streams.remove(&ssrc);
    }

    /// Builds one report with a block per stream, marshalling to at most
    /// `max_size` octets. The budget is split evenly between the streams.
    pub(crate) fn build_report(&mut self, now: SystemTime, max_size: usize) -> CcFeedbackReport {
        let n = self.streams.len();
        let per_stream = if n == 0 {
            0
        } else {
            max_size.saturating_sub(FIXED_REPORT_LENGTH + n * REPORT_BLOCK_HEADER_LENGTH) / n
        };
        // an even count never needs padding
        let max_metric_blocks = (per_stream / 4) * 2;

        CcFeedbackReport {
            sender_ssrc: self.sender_ssrc,
            report_blocks: self
                .streams
                .values_mut()
                .map(|log| log.build_report_block(now, max_metric_blocks))
                .collect(),
            report_timestamp: ntp_middle32(ntp_time(now)),
        }
    }
}
