//! Unwrapping of 16-bit RTP sequence numbers into a monotonic 64-bit space.

/// Sequence number unwrapper to handle 16-bit wraparound.
///
/// Each observed value is mapped to the extended sequence number closest to
/// the previously returned one, so forward jumps and reordering of less than
/// half the 16-bit range keep a stable mapping.
#[derive(Debug, Default, Clone)]
pub struct SequenceUnwrapper {
    last_unwrapped: Option<i64>,
}

impl SequenceUnwrapper {
    pub fn new() -> Self {
        Self {
            last_unwrapped: None,
        }
    }

    /// Unwraps `seq` and remembers the result as the new reference point.
    pub fn unwrap(&mut self, seq: u16) -> i64 {
        let unwrapped = self.peek(seq);
        self.last_unwrapped = Some(unwrapped);
        unwrapped
    }

    /// Unwraps `seq` without moving the reference point.
    pub fn peek(&self, seq: u16) -> i64 {
        match self.last_unwrapped {
            None => seq as i64,
            Some(last) => {
                let mut diff = seq as i64 - (last & 0xFFFF);
                if diff > 0x8000 {
                    diff -= 0x10000;
                } else if diff < -0x8000 {
                    diff += 0x10000;
                }
                last + diff
            }
        }
    }

    /// The last value returned by [`SequenceUnwrapper::unwrap`].
    pub fn last(&self) -> Option<i64> {
        self.last_unwrapped
    }
}
