// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::mem;
use std::time::Instant;

use rustc_hash::FxHashMap;
use smallvec::smallvec;
use smallvec::SmallVec;

use crate::frame::RetransmittableFrames;
use crate::packet::SequenceNumberLength;
use crate::packet::SerializedPacket;
use crate::packet::TransmissionType;
use crate::Error;
use crate::Result;

/// Sequence numbers a logical packet was sent as, oldest first.
pub type Transmissions = SmallVec<[u64; 4]>;

/// Who holds the frames of a logical packet.
#[derive(Debug, Default)]
pub enum RetransmittableState {
    /// Nothing in the packet needs a retransmission, or the logical packet
    /// was acked through another transmission.
    #[default]
    None,

    /// This transmission owns the frames.
    Owned(RetransmittableFrames),

    /// The frames moved to the newer transmission `by`.
    Superseded { by: u64 },
}

/// Metadata of a packet which is not acked yet.
#[derive(Debug)]
pub struct TransmissionInfo {
    pub sequence_number_length: SequenceNumberLength,

    /// The time the packet was written, if it was.
    pub sent_time: Option<Instant>,

    pub bytes_sent: u64,

    pub transmission_type: TransmissionType,

    /// Number of acks which reported the packet missing.
    pub nack_count: u64,

    /// Whether the packet counts toward bytes in flight.
    pub in_flight: bool,

    pub state: RetransmittableState,

    /// Sequence number of the first transmission of the logical packet.
    pub original: u64,
}

impl TransmissionInfo {
    fn new(
        sequence_number_length: SequenceNumberLength,
        transmission_type: TransmissionType,
        state: RetransmittableState,
        original: u64,
    ) -> Self {
        TransmissionInfo {
            sequence_number_length,
            sent_time: None,
            bytes_sent: 0,
            transmission_type,
            nack_count: 0,
            in_flight: false,
            state,
            original,
        }
    }

    pub fn retransmittable_frames(&self) -> Option<&RetransmittableFrames> {
        match &self.state {
            RetransmittableState::Owned(frames) => Some(frames),
            _ => None,
        }
    }

    pub fn has_retransmittable_frames(&self) -> bool {
        matches!(self.state, RetransmittableState::Owned(_))
    }

    pub fn has_crypto_handshake(&self) -> bool {
        self.retransmittable_frames()
            .map_or(false, |f| f.has_crypto_handshake())
    }
}

/// Packets sent and not yet acked, ordered by sequence number.
///
/// A logical packet retransmitted several times has one entry per
/// transmission. Exactly one of them owns the frames, the older ones are
/// superseded.
#[derive(Debug, Default)]
pub struct UnackedPacketMap {
    packets: BTreeMap<u64, TransmissionInfo>,

    /// Transmissions of the logical packets sent more than once, keyed by
    /// their original sequence number.
    transmissions: FxHashMap<u64, Transmissions>,

    largest_sent_packet: u64,

    largest_observed: u64,

    bytes_in_flight: u64,

    /// Number of entries owning crypto handshake frames.
    pending_crypto_packet_count: usize,
}

impl UnackedPacketMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new packet. Retransmissions are added with
    /// `on_retransmitted_packet` instead.
    pub fn add_packet(&mut self, packet: SerializedPacket) -> Result<()> {
        let seq = packet.sequence_number;
        if self.packets.contains_key(&seq) {
            return Err(Error::InternalError);
        }

        let state = match packet.retransmittable_frames {
            Some(frames) => {
                if frames.has_crypto_handshake() {
                    self.pending_crypto_packet_count += 1;
                }
                RetransmittableState::Owned(frames)
            }
            None => RetransmittableState::None,
        };
        let info = TransmissionInfo::new(
            packet.sequence_number_length,
            TransmissionType::NotRetransmission,
            state,
            seq,
        );
        self.packets.insert(seq, info);
        Ok(())
    }

    /// Move the frames of `old_seq` to its retransmission `new_seq`.
    pub fn on_retransmitted_packet(
        &mut self,
        old_seq: u64,
        new_seq: u64,
        sequence_number_length: SequenceNumberLength,
        transmission_type: TransmissionType,
    ) -> Result<()> {
        if self.packets.contains_key(&new_seq) {
            return Err(Error::InternalError);
        }
        let old = self.packets.get_mut(&old_seq).ok_or(Error::InternalError)?;
        let frames = match mem::replace(
            &mut old.state,
            RetransmittableState::Superseded { by: new_seq },
        ) {
            RetransmittableState::Owned(frames) => frames,
            state => {
                old.state = state;
                return Err(Error::InternalError);
            }
        };

        let original = old.original;
        self.transmissions
            .entry(original)
            .or_insert_with(|| smallvec![old_seq])
            .push(new_seq);

        let info = TransmissionInfo::new(
            sequence_number_length,
            transmission_type,
            RetransmittableState::Owned(frames),
            original,
        );
        self.packets.insert(new_seq, info);
        Ok(())
    }

    /// Record that the packet was written.
    pub fn set_sent(&mut self, seq: u64, sent_time: Instant, bytes: u64, in_flight: bool) {
        let info = match self.packets.get_mut(&seq) {
            Some(info) => info,
            None => return,
        };
        self.largest_sent_packet = self.largest_sent_packet.max(seq);
        info.sent_time = Some(sent_time);
        info.bytes_sent = bytes;
        if in_flight && !info.in_flight {
            self.bytes_in_flight = self.bytes_in_flight.saturating_add(bytes);
            info.in_flight = true;
        }
    }

    /// Stop counting the packet in flight. Returns the bytes removed.
    pub fn remove_from_in_flight(&mut self, seq: u64) -> u64 {
        match self.packets.get_mut(&seq) {
            Some(info) if info.in_flight => {
                info.in_flight = false;
                self.bytes_in_flight = self.bytes_in_flight.saturating_sub(info.bytes_sent);
                info.bytes_sent
            }
            _ => 0,
        }
    }

    /// Count a nack of the packet. A gap of `min_nacks` between the packet
    /// and the largest observed one counts as that many nacks.
    pub fn nack_packet(&mut self, seq: u64, min_nacks: u64) {
        if let Some(info) = self.packets.get_mut(&seq) {
            info.nack_count = min_nacks.max(info.nack_count + 1);
        }
    }

    pub fn increase_largest_observed(&mut self, largest_observed: u64) {
        self.largest_observed = self.largest_observed.max(largest_observed);
    }

    /// The transmission of the logical packet owning its frames, or the
    /// latest one if the frames are gone.
    pub fn newest_transmission(&self, seq: u64) -> u64 {
        let mut newest = seq;
        while let Some(RetransmittableState::Superseded { by }) =
            self.packets.get(&newest).map(|i| &i.state)
        {
            if !self.packets.contains_key(by) {
                break;
            }
            newest = *by;
        }
        newest
    }

    /// All transmissions of the logical packet `seq` belongs to.
    pub fn all_transmissions(&self, seq: u64) -> Transmissions {
        let original = match self.packets.get(&seq) {
            Some(info) => info.original,
            None => return Transmissions::new(),
        };
        match self.transmissions.get(&original) {
            Some(all) => all
                .iter()
                .copied()
                .filter(|s| self.packets.contains_key(s))
                .collect(),
            None => smallvec![seq],
        }
    }

    /// Drop the frames of the logical packet `seq` belongs to. Its
    /// transmissions which are not in flight are forgotten, the others stay
    /// until they are acked or lost.
    pub fn remove_retransmittability(&mut self, seq: u64) {
        let original = match self.packets.get(&seq) {
            Some(info) => info.original,
            None => return,
        };
        let all = self
            .transmissions
            .remove(&original)
            .unwrap_or_else(|| smallvec![seq]);

        for s in all {
            let remove = match self.packets.get_mut(&s) {
                Some(info) => {
                    if info.has_crypto_handshake() {
                        self.pending_crypto_packet_count -= 1;
                    }
                    info.state = RetransmittableState::None;
                    // Each remaining transmission is now a logical packet on
                    // its own.
                    info.original = s;
                    !info.in_flight
                }
                None => false,
            };
            if remove {
                self.packets.remove(&s);
            }
        }
    }

    /// Forget the packet if it is neither in flight nor retransmittable.
    pub fn remove_if_useless(&mut self, seq: u64) -> bool {
        let useless = self
            .packets
            .get(&seq)
            .map_or(false, |i| !i.in_flight && !i.has_retransmittable_frames());
        if useless {
            self.remove_packet(seq);
        }
        useless
    }

    fn remove_packet(&mut self, seq: u64) {
        let info = match self.packets.remove(&seq) {
            Some(info) => info,
            None => return,
        };
        if info.has_crypto_handshake() {
            self.pending_crypto_packet_count -= 1;
        }
        if let Some(all) = self.transmissions.get_mut(&info.original) {
            all.retain(|s| *s != seq);
            if all.len() <= 1 {
                self.transmissions.remove(&info.original);
            }
        }
    }

    /// Forget up to `num_to_clear` of the oldest packets which are neither
    /// in flight nor retransmittable, so the least unacked packet can rise.
    pub fn clear_previous_retransmissions(&mut self, mut num_to_clear: usize) -> usize {
        let mut cleared = 0;
        while num_to_clear > 0 {
            let seq = match self.packets.iter().next() {
                Some((&seq, info)) if !info.in_flight && !info.has_retransmittable_frames() => seq,
                _ => break,
            };
            self.remove_packet(seq);
            num_to_clear -= 1;
            cleared += 1;
        }
        cleared
    }

    pub fn get(&self, seq: u64) -> Option<&TransmissionInfo> {
        self.packets.get(&seq)
    }

    pub fn is_unacked(&self, seq: u64) -> bool {
        self.packets.contains_key(&seq)
    }

    pub fn has_retransmittable_frames(&self, seq: u64) -> bool {
        self.packets
            .get(&seq)
            .map_or(false, |i| i.has_retransmittable_frames())
    }

    /// Iterate over the unacked packets, oldest first.
    pub fn iter(&self) -> btree_map::Iter<'_, u64, TransmissionInfo> {
        self.packets.iter()
    }

    /// Sequence numbers up to `largest`, oldest first.
    pub fn sequence_numbers_up_to(&self, largest: u64) -> Vec<u64> {
        self.packets.range(..=largest).map(|(&s, _)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// The lowest sequence number the peer may still ack.
    pub fn least_unacked(&self) -> u64 {
        match self.packets.keys().next() {
            Some(&seq) => seq,
            None => self.largest_sent_packet + 1,
        }
    }

    pub fn largest_sent_packet(&self) -> u64 {
        self.largest_sent_packet
    }

    pub fn largest_observed(&self) -> u64 {
        self.largest_observed
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    pub fn has_in_flight_packets(&self) -> bool {
        self.packets.values().any(|i| i.in_flight)
    }

    pub fn num_in_flight_packets(&self) -> usize {
        self.packets.values().filter(|i| i.in_flight).count()
    }

    /// Whether a packet in flight has frames to retransmit.
    pub fn has_unacked_retransmittable_frames(&self) -> bool {
        self.packets
            .values()
            .any(|i| i.in_flight && i.has_retransmittable_frames())
    }

    pub fn has_pending_crypto_packets(&self) -> bool {
        self.pending_crypto_packet_count > 0
    }

    /// Send time of the oldest packet in flight.
    pub fn first_in_flight_sent_time(&self) -> Option<Instant> {
        self.packets
            .values()
            .find(|i| i.in_flight)
            .and_then(|i| i.sent_time)
    }

    /// Send time of the newest packet in flight.
    pub fn last_in_flight_sent_time(&self) -> Option<Instant> {
        self.packets
            .values()
            .rev()
            .find(|i| i.in_flight)
            .and_then(|i| i.sent_time)
    }
}
