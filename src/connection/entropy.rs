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

//! Packet entropy bookkeeping.
//!
//! Every packet carries a random entropy bit. Its hash is the bit shifted by
//! the sequence number modulo 8, and the cumulative hash of a set of packets
//! is the XOR of their hashes. An ack carries the cumulative hash of the
//! packets it acknowledges, which a peer can only know by receiving them.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// Entropy of the packets sent.
#[derive(Debug, Default)]
pub struct SentEntropyManager {
    /// Per packet hash and cumulative hash up to and including the packet.
    packets_entropy: BTreeMap<u64, (u8, u8)>,

    /// Cumulative hash of the packets before the first tracked one.
    base_hash: u8,

    /// Cumulative hash of all packets sent.
    cumulative_hash: u8,
}

impl SentEntropyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the hash of a newly sent packet. Sequence numbers must
    /// increase.
    pub fn record_packet_entropy_hash(&mut self, seq: u64, entropy_hash: u8) {
        self.cumulative_hash ^= entropy_hash;
        self.packets_entropy
            .insert(seq, (entropy_hash, self.cumulative_hash));
    }

    /// Cumulative hash of all packets up to and including `seq`.
    pub fn entropy_hash(&self, seq: u64) -> u8 {
        self.packets_entropy
            .range(..=seq)
            .next_back()
            .map_or(self.base_hash, |(_, &(_, cumulative))| cumulative)
    }

    /// Check the hash a peer claims for the packets it acked.
    pub fn is_valid_entropy(
        &self,
        largest_observed: u64,
        missing_packets: &BTreeSet<u64>,
        entropy_hash: u8,
    ) -> bool {
        let mut expected = self.entropy_hash(largest_observed);
        for seq in missing_packets.range(..=largest_observed) {
            match self.packets_entropy.get(seq) {
                Some(&(hash, _)) => expected ^= hash,
                // A missing packet we no longer track.
                None => return false,
            }
        }
        expected == entropy_hash
    }

    /// Forget the per packet hashes below `seq`.
    pub fn clear_entropy_before(&mut self, seq: u64) {
        let kept = self.packets_entropy.split_off(&seq);
        if let Some((_, &(_, cumulative))) = self.packets_entropy.iter().next_back() {
            self.base_hash = cumulative;
        }
        self.packets_entropy = kept;
    }
}

/// Entropy of the packets received.
///
/// Packets below the first gap are folded into a single cumulative hash, so
/// the tracker only grows with the number of gaps.
#[derive(Debug)]
pub struct ReceivedEntropyTracker {
    /// Hashes of the packets received at or after `first_gap`.
    packets_entropy: BTreeMap<u64, u8>,

    /// Cumulative hash of all packets before `first_gap`.
    packets_entropy_hash: u8,

    /// The lowest sequence number not received and not given up on.
    first_gap: u64,

    /// The largest sequence number received.
    largest_observed: u64,
}

impl Default for ReceivedEntropyTracker {
    fn default() -> Self {
        ReceivedEntropyTracker {
            packets_entropy: BTreeMap::new(),
            packets_entropy_hash: 0,
            first_gap: 1,
            largest_observed: 0,
        }
    }
}

impl ReceivedEntropyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_packet_entropy_hash(&mut self, seq: u64, entropy_hash: u8) {
        if seq < self.first_gap {
            // Given up on by a stop-waiting, its hash is already counted.
            return;
        }
        self.packets_entropy.insert(seq, entropy_hash);
        self.largest_observed = self.largest_observed.max(seq);
        self.advance_first_gap();
    }

    /// Cumulative hash of the packets received up to and including `seq`.
    /// `seq` must not be below the first gap.
    pub fn entropy_hash(&self, seq: u64) -> u8 {
        self.packets_entropy
            .range(..=seq)
            .fold(self.packets_entropy_hash, |hash, (_, &h)| hash ^ h)
    }

    /// The peer announced the cumulative hash of all packets below `seq`.
    pub fn set_cumulative_hash(&mut self, seq: u64, cumulative_hash: u8) {
        if seq < self.first_gap {
            return;
        }
        self.packets_entropy = self.packets_entropy.split_off(&seq);
        self.packets_entropy_hash = cumulative_hash;
        self.first_gap = seq;
        self.advance_first_gap();
    }

    pub fn first_gap(&self) -> u64 {
        self.first_gap
    }

    pub fn largest_observed(&self) -> u64 {
        self.largest_observed
    }

    fn advance_first_gap(&mut self) {
        while let Some(hash) = self.packets_entropy.remove(&self.first_gap) {
            self.packets_entropy_hash ^= hash;
            self.first_gap += 1;
        }
    }
}
