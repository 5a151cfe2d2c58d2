use std::time::SystemTime;

use log::warn;

use crate::time::ntp_time;

pub(crate) struct SenderStream {
    ssrc: u32,
    clock_rate: f64,

    /// Whether to always use the latest packet, even if out-of-order.
    use_latest_packet: bool,

    /// Track if first packet has been processed
    started: bool,

    /// Last sequence number seen (for out-of-order detection)
    last_rtp_sn: u16,

    /// data from rtp packets
    last_rtp_time_rtp: u32,
    last_rtp_time_time: SystemTime,

    counters: Counters,
}

impl SenderStream {
    pub(crate) fn new(ssrc: u32, clock_rate: u32, use_latest_packet: bool) -> Self {
        SenderStream {
            ssrc,
            clock_rate: clock_rate as f64,

            use_latest_packet,

            started: false,
            last_rtp_sn: 0,
            last_rtp_time_rtp: 0,
            last_rtp_time_time: SystemTime::UNIX_EPOCH,

            counters: Default::default(),
        }
    }

    pub(crate) fn process_rtp(&mut self, now: SystemTime, pkt: &rtp::packet::Packet) {
        let seq = pkt.header.sequence_number;

        // diff in (0, 2^15) means in-order
        let diff = seq.wrapping_sub(self.last_rtp_sn);
        let is_in_order = !self.started || (diff > 0 && diff < (1 << 15));

        if self.use_latest_packet || is_in_order {
            self.last_rtp_sn = seq;

            // Update time only on first packet of a frame (when timestamp changes)
            // This ensures sender report is not affected by processing delay
            // of pushing a large frame which could span multiple packets
            if !self.started || pkt.header.timestamp != self.last_rtp_time_rtp {
                self.last_rtp_time_rtp = pkt.header.timestamp;
                self.last_rtp_time_time = now;
            }
            self.started = true;
        }

        // Always count packets and octets regardless of order
        self.counters.increment_packets();
        self.counters.count_octets(pkt.payload.len());
    }

    pub(crate) fn generate_report(&self, now: SystemTime) -> rtcp::sender_report::SenderReport {
        let elapsed = now
            .duration_since(self.last_rtp_time_time)
            .unwrap_or_default()
            .as_secs_f64();

        rtcp::sender_report::SenderReport {
            ssrc: self.ssrc,
            ntp_time: ntp_time(now),
            rtp_time: self
                .last_rtp_time_rtp
                .wrapping_add((elapsed * self.clock_rate).round() as u32),
            packet_count: self.counters.packet_count(),
            octet_count: self.counters.octet_count(),
            ..Default::default()
        }
    }
}

#[derive(Default)]
pub(crate) struct Counters {
    packets: u32,
    octets: u32,
}

/// Wrapping counters used for generating [`rtcp::sender_report::SenderReport`]
impl Counters {
    pub(crate) fn increment_packets(&mut self) {
        self.packets = self.packets.wrapping_add(1);
    }

    pub(crate) fn count_octets(&mut self, octets: usize) {
        // account for a payload size of at most `u32::MAX`
        // and log a message if larger
        self.octets = self
            .octets
            .wrapping_add(octets.try_into().unwrap_or_else(|_| {
                warn!("packet payload larger than 32 bits");
                u32::MAX
            }));
    }

    pub(crate) fn packet_count(&self) -> u32 {
        self.packets
    }

    pub(crate) fn octet_count(&self) -> u32 {
        self.octets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pkt(seq: u16, timestamp: u32, payload_len: usize) -> rtp::packet::Packet {
        rtp::packet::Packet {
            header: rtp::header::Header {
                ssrc: 1,
                sequence_number: seq,
                timestamp,
                ..Default::default()
            },
            payload: vec![0u8; payload_len].into(),
        }
    }

    #[test]
    fn test_sender_stream_counts() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let mut stream = SenderStream::new(123456, 90000, false);
        for i in 0..10u16 {
            stream.process_rtp(now, &pkt(i, 3000 * i as u32, 2));
        }

        let sr = stream.generate_report(now);
        assert_eq!(sr.ssrc, 123456);
        assert_eq!(sr.packet_count, 10);
        assert_eq!(sr.octet_count, 20);
        assert_eq!(sr.rtp_time, 27000);
        assert_eq!(sr.ntp_time, ntp_time(now));
    }

    #[test]
    fn test_sender_stream_rtp_time_extrapolated() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let mut stream = SenderStream::new(1, 90000, false);
        stream.process_rtp(t0, &pkt(1, 1000, 1));

        let sr = stream.generate_report(t0 + Duration::from_millis(500));
        assert_eq!(sr.rtp_time, 1000 + 45000);
    }

    #[test]
    fn test_sender_stream_same_frame_keeps_first_time() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let mut stream = SenderStream::new(1, 90000, false);
        stream.process_rtp(t0, &pkt(1, 1000, 1));
        stream.process_rtp(t0 + Duration::from_millis(100), &pkt(2, 1000, 1));

        let sr = stream.generate_report(t0 + Duration::from_millis(100));
        assert_eq!(sr.rtp_time, 1000 + 9000);
    }

    #[test]
    fn test_sender_stream_out_of_order() {
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        let t1 = t0 + Duration::from_millis(10);

        let mut stream = SenderStream::new(1, 90000, false);
        stream.process_rtp(t0, &pkt(10, 9000, 1));
        stream.process_rtp(t1, &pkt(9, 6000, 1));
        let sr = stream.generate_report(t0);
        assert_eq!(sr.rtp_time, 9000);
        assert_eq!(sr.packet_count, 2);

        let mut stream = SenderStream::new(1, 90000, true);
        stream.process_rtp(t0, &pkt(10, 9000, 1));
        stream.process_rtp(t1, &pkt(9, 6000, 1));
        let sr = stream.generate_report(t1);
        assert_eq!(sr.rtp_time, 6000);
    }

    #[test]
    fn test_counters_wrap() {
        let mut counters = Counters {
            packets: u32::MAX,
            octets: u32::MAX - 1,
        };
        counters.increment_packets();
        counters.count_octets(3);
        assert_eq!(counters.packet_count(), 0);
        assert_eq!(counters.octet_count(), 1);
    }
}
