//! Receive log for tracking received RTP packets and finding missing sequences.

use crate::error::{Error, Result};
use crate::sequence::SequenceUnwrapper;

/// Tracks received RTP packets using a bitmap and identifies missing sequence numbers.
///
/// Sequence numbers are unwrapped to 64 bits, so the window survives any
/// number of 16-bit wraparounds. A bit is set iff its sequence number was
/// received and lies within `size` of the highest one seen.
pub(crate) struct ReceiveLog {
    /// Bitmap for tracking received packets. Each u64 tracks 64 packets.
    packets: Vec<u64>,
    size: u16,
    unwrapper: SequenceUnwrapper,
    /// Highest extended sequence number received.
    end: i64,
    started: bool,
    /// Every sequence number in `(end - size, last_consecutive]` was received.
    last_consecutive: i64,
}

impl ReceiveLog {
    /// Size must be a power of 2 between 64 and 32768 (inclusive).
    pub(crate) fn new(size: u16) -> Result<Self> {
        if !super::is_valid_size(size) {
            return Err(Error::InvalidSize);
        }

        Ok(Self {
            packets: vec![0u64; (size / 64) as usize],
            size,
            unwrapper: SequenceUnwrapper::new(),
            end: 0,
            started: false,
            last_consecutive: 0,
        })
    }

    pub(crate) fn add(&mut self, seq: u16) {
        let seq = self.unwrapper.unwrap(seq);
        let size = self.size as i64;

        if !self.started {
            self.set_received(seq);
            self.end = seq;
            self.started = true;
            self.last_consecutive = seq;
            return;
        }

        if seq > self.end {
            // slots between the old end and seq still hold older packets
            let mut i = (self.end + 1).max(seq - size + 1);
            while i < seq {
                self.del_received(i);
                i += 1;
            }
            self.end = seq;
            self.set_received(seq);

            if self.last_consecutive + 1 == seq {
                self.last_consecutive = seq;
            } else if seq - self.last_consecutive > size {
                self.last_consecutive = seq - size;
                self.fix_last_consecutive();
            }
        } else if self.end - seq < size {
            self.set_received(seq);
            if self.last_consecutive + 1 == seq {
                self.last_consecutive = seq;
                self.fix_last_consecutive();
            }
        }
    }

    /// Check if a sequence number has been received.
    pub(crate) fn get(&self, seq: u16) -> bool {
        let seq = self.unwrapper.peek(seq);
        if !self.started || seq > self.end || self.end - seq >= self.size as i64 {
            return false;
        }
        self.get_received(seq)
    }

    /// Missing sequence numbers from `last_consecutive + 1` up to
    /// `end - skip_last_n`, oldest first.
    pub(crate) fn missing_seq_numbers(&self, skip_last_n: u16) -> Vec<u16> {
        let mut missing = Vec::new();
        self.missing_seq_numbers_into(skip_last_n, &mut missing);
        missing
    }

    /// Like [`ReceiveLog::missing_seq_numbers`] but appends to a
    /// caller-owned buffer.
    pub(crate) fn missing_seq_numbers_into(&self, skip_last_n: u16, out: &mut Vec<u16>) {
        if !self.started {
            return;
        }

        let until = self.end - skip_last_n as i64;
        let mut i = self.last_consecutive + 1;
        while i <= until {
            if !self.get_received(i) {
                out.push(i as u16);
            }
            i += 1;
        }
    }

    pub(crate) fn last_consecutive(&self) -> i64 {
        self.last_consecutive
    }

    fn position(&self, seq: i64) -> (usize, u64) {
        let pos = seq.rem_euclid(self.size as i64) as usize;
        (pos / 64, 1u64 << (pos % 64))
    }

    fn set_received(&mut self, seq: i64) {
        let (word, bit) = self.position(seq);
        self.packets[word] |= bit;
    }

    fn del_received(&mut self, seq: i64) {
        let (word, bit) = self.position(seq);
        self.packets[word] &= !bit;
    }

    fn get_received(&self, seq: i64) -> bool {
        let (word, bit) = self.position(seq);
        self.packets[word] & bit != 0
    }

    fn fix_last_consecutive(&mut self) {
        let mut i = self.last_consecutive + 1;
        while i <= self.end && self.get_received(i) {
            i += 1;
        }
        self.last_consecutive = i - 1;
    }
}
