//! Per-SSRC arrival log of the congestion control feedback receiver.

use std::collections::HashMap;
use std::time::SystemTime;

use log::trace;

use super::report::{
    ARRIVAL_TIME_OFFSET_MAX, ARRIVAL_TIME_OFFSET_UNAVAILABLE, CcFeedbackMetricBlock,
    CcFeedbackReportBlock,
};
use crate::attributes::Ecn;
use crate::sequence::SequenceUnwrapper;

#[derive(Debug, Clone, Copy)]
struct PacketArrival {
    arrival: SystemTime,
    ecn: Ecn,
}

/// Arrivals of one RTP stream that have not been reported yet.
pub(crate) struct StreamLog {
    ssrc: u32,
    sequence_unwrapper: SequenceUnwrapper,
    next_sequence_number_to_report: Option<i64>,
    last_sequence_number_received: i64,
    log: HashMap<i64, PacketArrival>,
}

impl StreamLog {
    pub(crate) fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            sequence_unwrapper: SequenceUnwrapper::new(),
            next_sequence_number_to_report: None,
            last_sequence_number_received: 0,
            log: HashMap::new(),
        }
    }

    /// Logs the arrival of `seq`. The first arrival of a sequence number wins,
    /// packets before the last report are dropped.
    pub(crate) fn add(&mut self, now: SystemTime, seq: u16, ecn: Ecn) {
        let unwrapped = self.sequence_unwrapper.unwrap(seq);
        let next = *self.next_sequence_number_to_report.get_or_insert(unwrapped);
        if unwrapped < next {
            trace!("ccfb ssrc={}: {seq} arrived after being reported", self.ssrc);
            return;
        }

        let first = self.log.is_empty();
        self.log
            .entry(unwrapped)
            .or_insert(PacketArrival { arrival: now, ecn });
        if first || unwrapped > self.last_sequence_number_received {
            self.last_sequence_number_received = unwrapped;
        }
    }

    /// Reports everything from the next unreported sequence number up to
    /// the highest one received, at most `max_metric_blocks` of the newest.
    /// Reported entries are forgotten.
    pub(crate) fn build_report_block(
        &mut self,
        now: SystemTime,
        max_metric_blocks: usize,
    ) -> CcFeedbackReportBlock {
        let Some(mut begin) = self.next_sequence_number_to_report else {
            return self.empty_block(0);
        };
        if self.log.is_empty() {
            return self.empty_block(begin);
        }

        let end = self.last_sequence_number_received + 1;
        let max = max_metric_blocks as i64;
        if end - begin > max {
            begin = end - max;
        }

        let metric_blocks = (begin..end)
            .map(|seq| match self.log.get(&seq) {
                Some(p) => CcFeedbackMetricBlock {
                    received: true,
                    ecn: p.ecn,
                    arrival_time_offset: arrival_time_offset(now, p.arrival),
                },
                None => CcFeedbackMetricBlock::default(),
            })
            .collect();

        self.log.clear();
        self.next_sequence_number_to_report = Some(end);

        CcFeedbackReportBlock {
            media_ssrc: self.ssrc,
            begin_sequence: begin as u16,
            metric_blocks,
        }
    }

    fn empty_block(&self, begin: i64) -> CcFeedbackReportBlock {
        CcFeedbackReportBlock {
            media_ssrc: self.ssrc,
            begin_sequence: begin as u16,
            metric_blocks: vec![],
        }
    }
}

/// Time from `arrival` to `report` in 1/1024 s.
///
/// Offsets beyond [`ARRIVAL_TIME_OFFSET_MAX`] and arrivals after the report
/// time are not representable.
pub(crate) fn arrival_time_offset(report: SystemTime, arrival: SystemTime) -> u16 {
    let Ok(offset) = report.duration_since(arrival) else {
        return ARRIVAL_TIME_OFFSET_UNAVAILABLE;
    };
    let units = offset.as_micros() * 1024 / 1_000_000;
    if units > ARRIVAL_TIME_OFFSET_MAX as u128 {
        ARRIVAL_TIME_OFFSET_UNAVAILABLE
    } else {
        units as u16
    }
}
