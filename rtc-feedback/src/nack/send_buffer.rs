//! Send buffer for storing RTP packets for NACK retransmission.

use crate::error::{Error, Result};

/// Half of u16 max value, used for sequence number wraparound detection.
const UINT16_SIZE_HALF: u16 = 1 << 15;

/// Ring of sent RTP packets indexed by `sequence_number % size`.
///
/// A slot either holds a packet within `size` of the last added sequence
/// number or is empty.
pub(crate) struct SendBuffer {
    packets: Vec<Option<rtp::packet::Packet>>,
    size: u16,
    last_added: u16,
    started: bool,
}

impl SendBuffer {
    /// Size must be a power of 2 between 64 and 32768 (inclusive).
    pub(crate) fn new(size: u16) -> Result<Self> {
        if !super::is_valid_size(size) {
            return Err(Error::InvalidSize);
        }

        Ok(Self {
            packets: vec![None; size as usize],
            size,
            last_added: 0,
            started: false,
        })
    }

    pub(crate) fn add(&mut self, packet: &rtp::packet::Packet) {
        let seq = packet.header.sequence_number;

        if !self.started {
            self.packets[(seq % self.size) as usize] = Some(packet.clone());
            self.last_added = seq;
            self.started = true;
            return;
        }

        let diff = seq.wrapping_sub(self.last_added);
        if diff == 0 {
            return;
        } else if diff < UINT16_SIZE_HALF {
            // slots between the previous head and seq hold stale packets
            let stale = (diff - 1).min(self.size);
            let mut i = seq.wrapping_sub(stale);
            while i != seq {
                self.packets[(i % self.size) as usize] = None;
                i = i.wrapping_add(1);
            }
            self.last_added = seq;
        } else if self.last_added.wrapping_sub(seq) >= self.size {
            // too old to fit without evicting a newer packet
            return;
        }

        self.packets[(seq % self.size) as usize] = Some(packet.clone());
    }

    /// Returns the stored packet with sequence number `seq`, if still buffered.
    pub(crate) fn get(&self, seq: u16) -> Option<&rtp::packet::Packet> {
        if !self.started {
            return None;
        }

        let diff = self.last_added.wrapping_sub(seq);
        if diff >= UINT16_SIZE_HALF || diff >= self.size {
            return None;
        }

        let packet = self.packets[(seq % self.size) as usize].as_ref()?;
        if packet.header.sequence_number != seq {
            return None;
        }

        Some(packet)
    }
}
