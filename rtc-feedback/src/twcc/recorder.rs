//! TWCC Recorder - tracks packet arrival times and builds feedback packets.

use rtcp::transport_feedbacks::transport_layer_cc::{
    PacketStatusChunk, RecvDelta, RunLengthChunk, StatusChunkTypeTcc, StatusVectorChunk,
    SymbolSizeTypeTcc, SymbolTypeTcc, TransportLayerCc,
};

use super::arrival_time_map::ArrivalTimeMap;
use crate::sequence::SequenceUnwrapper;

/// Packets older than this relative to the newest arrival are culled (µs).
const PACKET_WINDOW_MICROSECONDS: i64 = 500_000;

/// Maximum number of missing sequence numbers reported ahead of the first
/// received one.
const MAX_MISSING_SEQUENCE_NUMBERS: i64 = 0x7FFE;

/// Receive delta unit (µs).
const TYPE_TCC_DELTA_SCALE_FACTOR: i64 = 250;

/// Reference time unit (µs).
const REFERENCE_TIME_UNIT: i64 = 64_000;

/// Chunk capacity limits.
const MAX_RUN_LENGTH_CAP: usize = 0x1fff; // 13 bits
const MAX_ONE_BIT_CAP: usize = 14;
const MAX_TWO_BIT_CAP: usize = 7;

/// Records transport-wide sequence numbers and arrival times (µs since an
/// arbitrary origin) and turns them into TransportLayerCc feedback.
pub(crate) struct Recorder {
    arrival_time_map: ArrivalTimeMap,
    sequence_unwrapper: SequenceUnwrapper,
    /// The first sequence number that will be included in the next feedback packet.
    start_sequence_number: Option<i64>,
    sender_ssrc: u32,
    media_ssrc: u32,
    fb_pkt_count: u8,
}

impl Recorder {
    pub(crate) fn new(sender_ssrc: u32) -> Self {
        Self {
            arrival_time_map: ArrivalTimeMap::new(),
            sequence_unwrapper: SequenceUnwrapper::new(),
            start_sequence_number: None,
            sender_ssrc,
            media_ssrc: 0,
            fb_pkt_count: 0,
        }
    }

    /// Records the arrival of transport sequence number `sequence_number`.
    pub(crate) fn record(&mut self, media_ssrc: u32, sequence_number: u16, arrival_time: i64) {
        self.media_ssrc = media_ssrc;

        let seq = self.sequence_unwrapper.unwrap(sequence_number);
        self.maybe_cull_old_packets(seq, arrival_time);

        if self.start_sequence_number.is_none_or(|start| seq < start) {
            self.start_sequence_number = Some(seq);
        }

        // only the first arrival counts
        if self.arrival_time_map.has_received(seq) {
            return;
        }
        self.arrival_time_map.add_packet(seq, arrival_time);

        let begin = self.arrival_time_map.begin_sequence_number();
        if let Some(start) = self.start_sequence_number
            && start < begin
        {
            self.start_sequence_number = Some(begin);
        }
    }

    fn maybe_cull_old_packets(&mut self, seq: i64, arrival_time: i64) {
        if let Some(start) = self.start_sequence_number
            && start >= self.arrival_time_map.end_sequence_number()
            && arrival_time >= PACKET_WINDOW_MICROSECONDS
        {
            self.arrival_time_map
                .remove_old_packets(seq, arrival_time - PACKET_WINDOW_MICROSECONDS);
        }
    }

    /// Reports whether received packets are waiting to be reported.
    pub(crate) fn has_pending(&self) -> bool {
        let end = self.arrival_time_map.end_sequence_number();
        match self.start_sequence_number {
            Some(start) if start < end => self
                .arrival_time_map
                .find_next_at_or_after(start)
                .is_some_and(|(seq, _)| seq < end),
            _ => false,
        }
    }

    /// Builds the next feedback packet.
    ///
    /// A single call reports as many pending packets as fit into one
    /// TransportLayerCc; [`Recorder::has_pending`] tells whether another call
    /// is needed. With nothing pending an empty packet is returned.
    pub(crate) fn build_feedback_packet(&mut self) -> TransportLayerCc {
        let end = self.arrival_time_map.end_sequence_number();
        if let Some(start) = self.start_sequence_number
            && let Some(fb) = self.build_range(start, end)
        {
            return fb.into_rtcp();
        }

        let mut fb = Feedback::new(self.sender_ssrc, self.media_ssrc, self.next_fb_pkt_count());
        fb.set_base(self.start_sequence_number.unwrap_or(0) as u16, 0);
        fb.into_rtcp()
    }

    fn next_fb_pkt_count(&mut self) -> u8 {
        let count = self.fb_pkt_count;
        self.fb_pkt_count = self.fb_pkt_count.wrapping_add(1);
        count
    }

    fn build_range(&mut self, begin_inclusive: i64, end_exclusive: i64) -> Option<Feedback> {
        let end = self.arrival_time_map.clamp(end_exclusive);

        let mut fb: Option<Feedback> = None;
        let mut next_sequence_number = begin_inclusive;

        let mut seq = self.arrival_time_map.clamp(begin_inclusive);
        while seq < end {
            let Some((found, arrival_time)) = self.arrival_time_map.find_next_at_or_after(seq)
            else {
                break;
            };
            seq = found;
            if seq >= end {
                break;
            }

            match fb.as_mut() {
                None => {
                    let mut new_fb =
                        Feedback::new(self.sender_ssrc, self.media_ssrc, self.next_fb_pkt_count());
                    let base = begin_inclusive.max(seq - MAX_MISSING_SEQUENCE_NUMBERS);
                    new_fb.set_base(base as u16, arrival_time);
                    if !new_fb.add_received(seq as u16, arrival_time) {
                        self.start_sequence_number = Some(seq);
                        return None;
                    }
                    fb = Some(new_fb);
                }
                Some(fb) => {
                    // delta out of range, the rest goes into the next packet
                    if !fb.add_received(seq as u16, arrival_time) {
                        break;
                    }
                }
            }

            next_sequence_number = seq + 1;
            seq += 1;
        }

        self.start_sequence_number = Some(next_sequence_number);
        fb
    }
}

/// One TransportLayerCc under construction.
struct Feedback {
    sender_ssrc: u32,
    media_ssrc: u32,
    fb_pkt_count: u8,
    base_sequence_number: u16,
    ref_timestamp_64ms: i64,
    last_timestamp_us: i64,
    next_sequence_number: u16,
    sequence_number_count: u16,
    last_chunk: Chunk,
    chunks: Vec<PacketStatusChunk>,
    deltas: Vec<RecvDelta>,
}

impl Feedback {
    fn new(sender_ssrc: u32, media_ssrc: u32, fb_pkt_count: u8) -> Self {
        Self {
            sender_ssrc,
            media_ssrc,
            fb_pkt_count,
            base_sequence_number: 0,
            ref_timestamp_64ms: 0,
            last_timestamp_us: 0,
            next_sequence_number: 0,
            sequence_number_count: 0,
            last_chunk: Chunk::new(),
            chunks: Vec::new(),
            deltas: Vec::new(),
        }
    }

    fn set_base(&mut self, sequence_number: u16, time_us: i64) {
        self.base_sequence_number = sequence_number;
        self.next_sequence_number = sequence_number;
        self.ref_timestamp_64ms = time_us / REFERENCE_TIME_UNIT;
        self.last_timestamp_us = self.ref_timestamp_64ms * REFERENCE_TIME_UNIT;
    }

    fn into_rtcp(mut self) -> TransportLayerCc {
        while !self.last_chunk.deltas.is_empty() {
            self.chunks.push(self.last_chunk.encode());
        }

        TransportLayerCc {
            sender_ssrc: self.sender_ssrc,
            media_ssrc: self.media_ssrc,
            base_sequence_number: self.base_sequence_number,
            packet_status_count: self.sequence_number_count,
            reference_time: self.ref_timestamp_64ms as u32,
            fb_pkt_count: self.fb_pkt_count,
            packet_chunks: self.chunks,
            recv_deltas: self.deltas,
        }
    }

    fn push_symbol(&mut self, symbol: SymbolTypeTcc) {
        if !self.last_chunk.can_add(symbol) {
            self.chunks.push(self.last_chunk.encode());
        }
        self.last_chunk.add(symbol);
        self.sequence_number_count += 1;
        self.next_sequence_number = self.next_sequence_number.wrapping_add(1);
    }

    /// Adds a received packet, preceded by "not received" symbols for any
    /// gap. Fails when the delta to the previous packet does not fit 16 bits.
    fn add_received(&mut self, sequence_number: u16, timestamp_us: i64) -> bool {
        let delta_us = timestamp_us - self.last_timestamp_us;
        let half = TYPE_TCC_DELTA_SCALE_FACTOR / 2;
        let delta_250us = if delta_us >= 0 {
            (delta_us + half) / TYPE_TCC_DELTA_SCALE_FACTOR
        } else {
            (delta_us - half) / TYPE_TCC_DELTA_SCALE_FACTOR
        };
        if delta_250us < i16::MIN as i64 || delta_250us > i16::MAX as i64 {
            return false;
        }
        let delta_us_rounded = delta_250us * TYPE_TCC_DELTA_SCALE_FACTOR;

        while self.next_sequence_number != sequence_number {
            self.push_symbol(SymbolTypeTcc::PacketNotReceived);
        }

        let symbol = if (0..=0xff).contains(&delta_250us) {
            SymbolTypeTcc::PacketReceivedSmallDelta
        } else {
            SymbolTypeTcc::PacketReceivedLargeDelta
        };
        self.push_symbol(symbol);
        self.deltas.push(RecvDelta {
            type_tcc_packet: symbol,
            delta: delta_us_rounded,
        });
        self.last_timestamp_us += delta_us_rounded;

        true
    }
}

/// Pending status symbols of the chunk being filled.
struct Chunk {
    has_large_delta: bool,
    has_different_types: bool,
    deltas: Vec<SymbolTypeTcc>,
}

impl Chunk {
    fn new() -> Self {
        Self {
            has_large_delta: false,
            has_different_types: false,
            deltas: Vec::with_capacity(MAX_ONE_BIT_CAP),
        }
    }

    fn can_add(&self, symbol: SymbolTypeTcc) -> bool {
        let n = self.deltas.len();
        if n < MAX_TWO_BIT_CAP {
            return true;
        }
        if n < MAX_ONE_BIT_CAP
            && !self.has_large_delta
            && symbol != SymbolTypeTcc::PacketReceivedLargeDelta
        {
            return true;
        }
        n < MAX_RUN_LENGTH_CAP && !self.has_different_types && symbol == self.deltas[0]
    }

    fn add(&mut self, symbol: SymbolTypeTcc) {
        if self.deltas.first().is_some_and(|first| *first != symbol) {
            self.has_different_types = true;
        }
        self.has_large_delta |= symbol == SymbolTypeTcc::PacketReceivedLargeDelta;
        self.deltas.push(symbol);
    }

    /// Emits the narrowest chunk for the pending symbols. A two-bit vector
    /// takes the first seven, anything left over stays pending.
    fn encode(&mut self) -> PacketStatusChunk {
        if !self.has_different_types {
            let chunk = PacketStatusChunk::RunLengthChunk(RunLengthChunk {
                type_tcc: StatusChunkTypeTcc::RunLengthChunk,
                packet_status_symbol: self.deltas[0],
                run_length: self.deltas.len() as u16,
            });
            self.reset();
            return chunk;
        }

        if self.deltas.len() == MAX_ONE_BIT_CAP {
            let chunk = PacketStatusChunk::StatusVectorChunk(StatusVectorChunk {
                type_tcc: StatusChunkTypeTcc::StatusVectorChunk,
                symbol_size: SymbolSizeTypeTcc::OneBit,
                symbol_list: std::mem::take(&mut self.deltas),
            });
            self.reset();
            return chunk;
        }

        let n = MAX_TWO_BIT_CAP.min(self.deltas.len());
        let rest = self.deltas.split_off(n);
        let chunk = PacketStatusChunk::StatusVectorChunk(StatusVectorChunk {
            type_tcc: StatusChunkTypeTcc::StatusVectorChunk,
            symbol_size: SymbolSizeTypeTcc::TwoBit,
            symbol_list: std::mem::replace(&mut self.deltas, rest),
        });

        self.has_different_types = self
            .deltas
            .first()
            .is_some_and(|first| self.deltas.iter().any(|d| d != first));
        self.has_large_delta = self
            .deltas
            .contains(&SymbolTypeTcc::PacketReceivedLargeDelta);

        chunk
    }

    fn reset(&mut self) {
        self.deltas.clear();
        self.has_large_delta = false;
        self.has_different_types = false;
    }
}
