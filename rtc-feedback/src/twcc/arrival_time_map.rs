//! Packet arrival times indexed by unwrapped transport sequence number.
//!
//! Follows the packet arrival map of the libwebrtc remote bitrate estimator:
//! <https://source.chromium.org/chromium/chromium/src/+/refs/heads/main:third_party/webrtc/modules/remote_bitrate_estimator/packet_arrival_map.h>

/// Smallest ring allocated once the first packet arrives.
const MIN_CAPACITY: usize = 128;

/// Widest window the map keeps, `end - begin` never exceeds it.
pub(crate) const MAX_NUMBER_OF_PACKETS: i64 = 1 << 15;

/// Slot value of a sequence number inside the window that was not received.
const NOT_RECEIVED: i64 = -1;

/// Ring of arrival times covering the half-open window `[begin, end)`.
///
/// Slots are addressed by `seq & (capacity - 1)`, capacity is always a power
/// of two. Arrival times are non-negative, negative slots mean "not received".
pub(crate) struct ArrivalTimeMap {
    slots: Vec<i64>,
    begin: i64,
    end: i64,
}

impl ArrivalTimeMap {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            begin: 0,
            end: 0,
        }
    }

    /// Records `arrival_time` for `seq`, growing or sliding the window.
    pub(crate) fn add_packet(&mut self, seq: i64, arrival_time: i64) {
        if self.slots.is_empty() {
            self.resize(MIN_CAPACITY);
            self.begin = seq;
            self.end = seq + 1;
            self.put(seq, arrival_time);
            return;
        }

        if (self.begin..self.end).contains(&seq) {
            self.put(seq, arrival_time);
            return;
        }

        if seq < self.begin {
            // grow downwards only while newer packets stay in the window
            let new_size = self.end - seq;
            if new_size > MAX_NUMBER_OF_PACKETS {
                return;
            }
            self.fit(new_size as usize);
            self.put(seq, arrival_time);
            self.mark_not_received(seq + 1, self.begin);
            self.begin = seq;
            return;
        }

        let new_end = seq + 1;
        if new_end >= self.end + MAX_NUMBER_OF_PACKETS {
            // nothing of the old window survives
            self.begin = seq;
            self.end = new_end;
            self.put(seq, arrival_time);
            return;
        }

        self.begin = self.begin.max(new_end - MAX_NUMBER_OF_PACKETS);
        self.fit((new_end - self.begin) as usize);

        // out of order arrivals leave holes behind
        self.mark_not_received(self.end, seq);
        self.end = new_end;
        self.put(seq, arrival_time);
    }

    /// First sequence number in the window.
    pub(crate) fn begin_sequence_number(&self) -> i64 {
        self.begin
    }

    /// One past the last sequence number in the window.
    pub(crate) fn end_sequence_number(&self) -> i64 {
        self.end
    }

    /// Arrival time of `seq`, negative when unknown.
    pub(crate) fn get(&self, seq: i64) -> i64 {
        if seq < self.begin || seq >= self.end {
            return NOT_RECEIVED;
        }
        self.slots[self.slot(seq)]
    }

    pub(crate) fn has_received(&self, seq: i64) -> bool {
        self.get(seq) >= 0
    }

    /// Clamps `seq` to `[begin, end]`.
    pub(crate) fn clamp(&self, seq: i64) -> i64 {
        seq.clamp(self.begin, self.end)
    }

    /// First received packet at or after `seq`.
    pub(crate) fn find_next_at_or_after(&self, seq: i64) -> Option<(i64, i64)> {
        (self.clamp(seq)..self.end).find_map(|s| {
            let t = self.get(s);
            (t >= 0).then_some((s, t))
        })
    }

    /// Drops everything before `seq`. Past the end the map becomes empty
    /// with `seq` as its new start.
    pub(crate) fn erase_to(&mut self, seq: i64) {
        if seq < self.begin {
            return;
        }
        if seq >= self.end {
            self.begin = seq;
            self.end = seq;
            return;
        }
        self.begin = seq;
        self.fit((self.end - self.begin) as usize);
    }

    /// Slides `begin` forward over packets before `end_seq` that arrived at
    /// or before `arrival_time_limit`.
    pub(crate) fn remove_old_packets(&mut self, end_seq: i64, arrival_time_limit: i64) {
        let check_to = end_seq.min(self.end);
        while self.begin < check_to && self.get(self.begin) <= arrival_time_limit {
            self.begin += 1;
        }
        self.fit((self.end - self.begin) as usize);
    }

    fn put(&mut self, seq: i64, arrival_time: i64) {
        let i = self.slot(seq);
        self.slots[i] = arrival_time;
    }

    fn mark_not_received(&mut self, from: i64, to_exclusive: i64) {
        for seq in from..to_exclusive {
            self.put(seq, NOT_RECEIVED);
        }
    }

    fn slot(&self, seq: i64) -> usize {
        // capacity is a power of two, `&` also maps negative numbers
        (seq & (self.slots.len() as i64 - 1)) as usize
    }

    /// Grows to hold `size` entries, or shrinks once occupancy drops to a
    /// quarter of the capacity.
    fn fit(&mut self, size: usize) {
        let capacity = self.slots.len();
        if size > capacity {
            self.resize(size.next_power_of_two());
            return;
        }
        if capacity > MIN_CAPACITY.max(size * 4) {
            let mut new_capacity = capacity;
            while new_capacity >= 2 * size.max(MIN_CAPACITY) {
                new_capacity /= 2;
            }
            self.resize(new_capacity);
        }
    }

    fn resize(&mut self, capacity: usize) {
        let mut slots = vec![NOT_RECEIVED; capacity];
        if !self.slots.is_empty() {
            for seq in self.begin..self.end {
                slots[(seq & (capacity as i64 - 1)) as usize] = self.get(seq);
            }
        }
        self.slots = slots;
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.slots.len()
    }
}
