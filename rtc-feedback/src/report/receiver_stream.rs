use std::time::SystemTime;

use crate::time::{duration_to_q16, ntp_middle32};

/// Number of packets tracked per u64 entry in the bitmap.
const PACKETS_PER_ENTRY: usize = 64;

/// Number of bitmap entries, 128 * 64 = 8192 sequence numbers.
const DEFAULT_SIZE: usize = 128;

/// Seconds from `earlier` to `later`, negative when `later` comes first.
fn signed_secs(later: SystemTime, earlier: SystemTime) -> f64 {
    match later.duration_since(earlier) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

pub(crate) struct ReceiverStream {
    ssrc: u32,
    receiver_ssrc: u32,
    clock_rate: f64,

    /// Bitmap for tracking received packets. Each u64 tracks 64 packets.
    packets: Vec<u64>,
    size: usize,
    started: bool,
    seq_num_cycles: u16,
    last_seq_num: u16,
    last_report_seq_num: u16,
    last_rtp_time_rtp: u32,
    last_rtp_time_time: SystemTime,
    jitter: f64,
    last_sender_report: u32,
    last_sender_report_time: Option<SystemTime>,
    total_lost: u32,
}

impl ReceiverStream {
    pub(crate) fn new(ssrc: u32, clock_rate: u32) -> Self {
        Self {
            ssrc,
            receiver_ssrc: rand::random::<u32>(),
            clock_rate: clock_rate as f64,

            packets: vec![0u64; DEFAULT_SIZE],
            size: DEFAULT_SIZE,
            started: false,
            seq_num_cycles: 0,
            last_seq_num: 0,
            last_report_seq_num: 0,
            last_rtp_time_rtp: 0,
            last_rtp_time_time: SystemTime::UNIX_EPOCH,
            jitter: 0.0,
            last_sender_report: 0,
            last_sender_report_time: None,
            total_lost: 0,
        }
    }

    fn set_received(&mut self, seq: u16) {
        let pos = (seq as usize) % (self.size * PACKETS_PER_ENTRY);
        self.packets[pos / PACKETS_PER_ENTRY] |= 1 << (pos % PACKETS_PER_ENTRY);
    }

    fn del_received(&mut self, seq: u16) {
        let pos = (seq as usize) % (self.size * PACKETS_PER_ENTRY);
        self.packets[pos / PACKETS_PER_ENTRY] &= !(1u64 << (pos % PACKETS_PER_ENTRY));
    }

    fn get_received(&self, seq: u16) -> bool {
        let pos = (seq as usize) % (self.size * PACKETS_PER_ENTRY);
        (self.packets[pos / PACKETS_PER_ENTRY] & (1 << (pos % PACKETS_PER_ENTRY))) != 0
    }

    pub(crate) fn process_rtp(&mut self, now: SystemTime, pkt: &rtp::packet::Packet) {
        let seq = pkt.header.sequence_number;

        if !self.started {
            // first frame
            self.started = true;
            self.set_received(seq);
            self.last_seq_num = seq;
            self.last_report_seq_num = seq.wrapping_sub(1);
        } else {
            // following frames
            self.set_received(seq);

            // diff in (0, 2^15) means in-order
            let diff = seq.wrapping_sub(self.last_seq_num);
            if diff > 0 && diff < (1 << 15) {
                if seq < self.last_seq_num {
                    self.seq_num_cycles = self.seq_num_cycles.wrapping_add(1);
                }

                // set missing packets as not received
                let mut i = self.last_seq_num.wrapping_add(1);
                while i != seq {
                    self.del_received(i);
                    i = i.wrapping_add(1);
                }

                self.last_seq_num = seq;
            }

            // https://tools.ietf.org/html/rfc3550#page-39
            let d = signed_secs(now, self.last_rtp_time_time) * self.clock_rate
                - (pkt.header.timestamp as f64 - self.last_rtp_time_rtp as f64);
            self.jitter += (d.abs() - self.jitter) / 16.0;
        }

        self.last_rtp_time_rtp = pkt.header.timestamp;
        self.last_rtp_time_time = now;
    }

    pub(crate) fn process_sender_report(
        &mut self,
        now: SystemTime,
        sr: &rtcp::sender_report::SenderReport,
    ) {
        self.last_sender_report = ntp_middle32(sr.ntp_time);
        self.last_sender_report_time = Some(now);
    }

    pub(crate) fn generate_report(
        &mut self,
        now: SystemTime,
    ) -> rtcp::receiver_report::ReceiverReport {
        let total_since_report = self.last_seq_num.wrapping_sub(self.last_report_seq_num);
        let mut total_lost_since_report = {
            if self.last_seq_num == self.last_report_seq_num {
                0
            } else {
                let mut ret = 0u32;
                let mut i = self.last_report_seq_num.wrapping_add(1);
                while i != self.last_seq_num {
                    if !self.get_received(i) {
                        ret += 1;
                    }
                    i = i.wrapping_add(1);
                }
                ret
            }
        };

        self.total_lost += total_lost_since_report;

        // allow up to 24 bits
        if total_lost_since_report > 0xFFFFFF {
            total_lost_since_report = 0xFFFFFF;
        }
        if self.total_lost > 0xFFFFFF {
            self.total_lost = 0xFFFFFF
        }

        // DLSR stays 0 until a sender report arrived
        let delay = match self.last_sender_report_time {
            Some(sr_time) => duration_to_q16(now.duration_since(sr_time).unwrap_or_default()),
            None => 0,
        };

        let fraction_lost = if total_since_report > 0 {
            ((total_lost_since_report * 256) as f64 / total_since_report as f64) as u8
        } else {
            0
        };

        let r = rtcp::receiver_report::ReceiverReport {
            ssrc: self.receiver_ssrc,
            reports: vec![rtcp::reception_report::ReceptionReport {
                ssrc: self.ssrc,
                last_sequence_number: (self.seq_num_cycles as u32) << 16
                    | (self.last_seq_num as u32 & 0xFFFF),
                last_sender_report: self.last_sender_report,
                fraction_lost,
                total_lost: self.total_lost,
                delay,
                jitter: self.jitter as u32,
            }],
            ..Default::default()
        };

        self.last_report_seq_num = self.last_seq_num;

        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ntp_time;
    use std::time::Duration;

    fn t(ms: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000) + Duration::from_millis(ms)
    }

    fn pkt(seq: u16, timestamp: u32) -> rtp::packet::Packet {
        rtp::packet::Packet {
            header: rtp::header::Header {
                ssrc: 123456,
                sequence_number: seq,
                timestamp,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn report(
        stream: &mut ReceiverStream,
        now: SystemTime,
    ) -> rtcp::reception_report::ReceptionReport {
        let rr = stream.generate_report(now);
        assert_eq!(rr.reports.len(), 1);
        rr.reports[0].clone()
    }

    #[test]
    fn test_receiver_stream_no_loss() {
        let mut stream = ReceiverStream::new(123456, 90000);
        for seq in 1..=10u16 {
            stream.process_rtp(t(0), &pkt(seq, 0));
        }
        let r = report(&mut stream, t(0));
        assert_eq!(r.ssrc, 123456);
        assert_eq!(r.last_sequence_number, 10);
        assert_eq!(r.total_lost, 0);
        assert_eq!(r.fraction_lost, 0);
        assert_eq!(r.delay, 0);
        assert_eq!(r.last_sender_report, 0);
    }

    #[test]
    fn test_receiver_stream_loss() {
        let mut stream = ReceiverStream::new(123456, 90000);
        stream.process_rtp(t(0), &pkt(1, 0));
        stream.process_rtp(t(0), &pkt(3, 0));

        let r = report(&mut stream, t(0));
        assert_eq!(r.last_sequence_number, 3);
        assert_eq!(r.total_lost, 1);
        assert_eq!(r.fraction_lost, ((1u32 * 256) / 3) as u8);

        // nothing new since the last report
        let r = report(&mut stream, t(0));
        assert_eq!(r.total_lost, 1);
        assert_eq!(r.fraction_lost, 0);
    }

    #[test]
    fn test_receiver_stream_late_arrival_not_lost() {
        let mut stream = ReceiverStream::new(123456, 90000);
        stream.process_rtp(t(0), &pkt(1, 0));
        stream.process_rtp(t(0), &pkt(3, 0));
        stream.process_rtp(t(0), &pkt(2, 0));

        let r = report(&mut stream, t(0));
        assert_eq!(r.last_sequence_number, 3);
        assert_eq!(r.total_lost, 0);
    }

    #[test]
    fn test_receiver_stream_overflow() {
        let mut stream = ReceiverStream::new(123456, 90000);
        stream.process_rtp(t(0), &pkt(0xffff, 0));
        stream.process_rtp(t(0), &pkt(0x0000, 0));

        let r = report(&mut stream, t(0));
        assert_eq!(r.last_sequence_number, 0x1_0000);
        assert_eq!(r.total_lost, 0);
    }

    #[test]
    fn test_receiver_stream_overflow_with_loss() {
        let mut stream = ReceiverStream::new(123456, 90000);
        stream.process_rtp(t(0), &pkt(0xfffe, 0));
        stream.process_rtp(t(0), &pkt(0x0001, 0));

        let r = report(&mut stream, t(0));
        assert_eq!(r.last_sequence_number, 0x1_0001);
        assert_eq!(r.total_lost, 2);
    }

    #[test]
    fn test_receiver_stream_jitter() {
        let mut stream = ReceiverStream::new(123456, 90000);
        stream.process_rtp(t(0), &pkt(1, 0));
        stream.process_rtp(t(1000), &pkt(2, 60000));

        let r = report(&mut stream, t(1000));
        assert_eq!(r.jitter, 30000 / 16);
    }

    #[test]
    fn test_receiver_stream_jitter_negative_transit() {
        let mut stream = ReceiverStream::new(123456, 90000);
        stream.process_rtp(t(0), &pkt(1, 90000));
        // RTP clock ran further than the wall clock
        stream.process_rtp(t(0), &pkt(2, 90000 + 16 * 100));

        let r = report(&mut stream, t(0));
        assert_eq!(r.jitter, 100);
    }

    #[test]
    fn test_receiver_stream_sender_report_delay() {
        let mut stream = ReceiverStream::new(123456, 90000);
        stream.process_rtp(t(0), &pkt(1, 0));

        let sr_ntp = ntp_time(t(0));
        stream.process_sender_report(
            t(0),
            &rtcp::sender_report::SenderReport {
                ssrc: 123456,
                ntp_time: sr_ntp,
                ..Default::default()
            },
        );

        let r = report(&mut stream, t(1000));
        assert_eq!(r.last_sender_report, ntp_middle32(sr_ntp));
        assert_eq!(r.delay, 65536);
    }

    #[test]
    fn test_receiver_stream_bitmap_window() {
        let mut stream = ReceiverStream::new(1, 90000);
        let window = (DEFAULT_SIZE * PACKETS_PER_ENTRY) as u16;
        stream.set_received(5);
        assert!(stream.get_received(5));
        assert!(!stream.get_received(6));
        // aliases only a full window away
        assert!(stream.get_received(5 + window));
        stream.del_received(5);
        assert!(!stream.get_received(5));
    }
}
