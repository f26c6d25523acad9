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

use std::collections::BTreeSet;
use std::time::Instant;

use log::*;

use super::entropy::ReceivedEntropyTracker;
use crate::congestion_control::Bandwidth;
use crate::congestion_control::CongestionControlAlgorithm;
use crate::frame::AckFrame;
use crate::frame::CongestionFeedbackFrame;
use crate::frame::StopWaitingFrame;
use crate::packet::PacketHeader;

/// The most missing packets an ack frame lists.
pub const MAX_ACK_RANGES: usize = 255;

/// A gap this close to the largest observed packet is new and worth an
/// immediate ack.
const MAX_PACKETS_AFTER_NEW_MISSING: u64 = 4;

/// What the receiver tells the sender about the path.
#[derive(Debug, Clone, Copy)]
pub enum FeedbackPolicy {
    /// No congestion feedback.
    None,

    /// Announce the receive window in bytes.
    Tcp { receive_window: u64 },

    /// Ask for a fixed bitrate.
    FixRate { bitrate: Bandwidth },
}

impl FeedbackPolicy {
    /// The feedback the peer's send algorithm expects.
    pub fn new(
        algor: CongestionControlAlgorithm,
        receive_window: u64,
        bitrate: Bandwidth,
    ) -> FeedbackPolicy {
        match algor {
            CongestionControlAlgorithm::Cubic | CongestionControlAlgorithm::Reno => {
                FeedbackPolicy::Tcp { receive_window }
            }
            CongestionControlAlgorithm::FixRate => FeedbackPolicy::FixRate { bitrate },
        }
    }
}

/// Tracks the packets received from the peer, and what the peer reported
/// about the packets it received.
#[derive(Debug)]
pub struct ReceivedPacketManager {
    entropy: ReceivedEntropyTracker,

    /// The largest sequence number received.
    largest_observed: u64,

    /// Packets below the largest observed not received yet.
    missing_packets: BTreeSet<u64>,

    /// Missing packets revived by FEC, reported until the peer stops waiting
    /// for them. They stay in `missing_packets`, their entropy is unknown to
    /// the peer's ack validation.
    revived_packets: BTreeSet<u64>,

    /// When the largest observed packet arrived.
    time_largest_observed: Option<Instant>,

    /// The lowest packet the peer may still send, from its stop-waiting
    /// frames.
    peer_least_packet_awaiting_ack: u64,

    /// The largest observed packet reported by the peer's acks.
    peer_largest_observed_packet: u64,

    /// The lowest packet the peer still waits for, from its acks.
    least_packet_awaited_by_peer: u64,

    feedback: FeedbackPolicy,

    packets_received: u64,

    bytes_received: u64,
}

impl ReceivedPacketManager {
    pub fn new(feedback: FeedbackPolicy) -> Self {
        ReceivedPacketManager {
            entropy: ReceivedEntropyTracker::new(),
            largest_observed: 0,
            missing_packets: BTreeSet::new(),
            revived_packets: BTreeSet::new(),
            time_largest_observed: None,
            peer_least_packet_awaiting_ack: 0,
            peer_largest_observed_packet: 0,
            least_packet_awaited_by_peer: 1,
            feedback,
            packets_received: 0,
            bytes_received: 0,
        }
    }

    /// Record a packet received from the peer.
    pub fn record_packet_received(&mut self, bytes: u64, header: &PacketHeader, receipt_time: Instant) {
        let seq = header.sequence_number;
        self.packets_received += 1;
        self.bytes_received += bytes;
        self.record_sequence_number(seq, receipt_time);
        self.entropy
            .record_packet_entropy_hash(seq, header.entropy_hash());
    }

    /// Record a missing packet reconstructed by FEC.
    pub fn record_packet_revived(&mut self, header: &PacketHeader) {
        let seq = header.sequence_number;
        if !self.is_awaiting_packet(seq) {
            return;
        }
        self.revived_packets.insert(seq);
    }

    fn record_sequence_number(&mut self, seq: u64, receipt_time: Instant) {
        if seq > self.largest_observed {
            // Everything in between is missing, except what the peer gave up
            // on.
            let first_missing = (self.largest_observed + 1).max(self.peer_least_packet_awaiting_ack);
            self.missing_packets.extend(first_missing..seq);
            self.largest_observed = seq;
            self.time_largest_observed = Some(receipt_time);
        } else {
            self.missing_packets.remove(&seq);
        }
    }

    /// Whether the packet is still expected, i.e. it is neither a duplicate,
    /// a revived packet, nor a packet the peer stopped waiting for.
    pub fn is_awaiting_packet(&self, seq: u64) -> bool {
        if seq < self.peer_least_packet_awaiting_ack {
            return false;
        }
        if seq > self.largest_observed {
            return true;
        }
        self.missing_packets.contains(&seq) && !self.revived_packets.contains(&seq)
    }

    /// Whether a gap opened right before the largest observed packet.
    pub fn has_new_missing_packets(&self) -> bool {
        match self.missing_packets.iter().next_back() {
            Some(&last) => self.largest_observed - last <= MAX_PACKETS_AFTER_NEW_MISSING,
            None => false,
        }
    }

    pub fn has_missing_packets(&self) -> bool {
        !self.missing_packets.is_empty()
    }

    /// Build the ack frame to send. At most `MAX_ACK_RANGES` missing
    /// packets are listed; the frame is truncated to the packets below the
    /// first one left out.
    pub fn ack_frame(&self, now: Instant) -> AckFrame {
        let mut ack = AckFrame {
            largest_observed: self.largest_observed,
            missing_packets: self.missing_packets.clone(),
            revived_packets: self.revived_packets.clone(),
            ..AckFrame::default()
        };

        if let Some(&first_unlisted) = self.missing_packets.iter().nth(MAX_ACK_RANGES) {
            ack.missing_packets = self
                .missing_packets
                .range(..first_unlisted)
                .copied()
                .collect();
            ack.largest_observed = first_unlisted - 1;
            ack.revived_packets = self
                .revived_packets
                .range(..first_unlisted)
                .copied()
                .collect();
            ack.is_truncated = true;
        } else {
            ack.delta_time_largest_observed = self
                .time_largest_observed
                .map(|t| now.saturating_duration_since(t));
        }

        ack.entropy_hash = self.entropy_hash(ack.largest_observed);
        ack
    }

    /// Cumulative hash of the packets received up to `seq`, as the peer
    /// expects it in an ack.
    pub fn entropy_hash(&self, seq: u64) -> u8 {
        self.entropy.entropy_hash(seq)
    }

    /// The congestion feedback to send along with an ack.
    pub fn congestion_feedback(&self) -> Option<CongestionFeedbackFrame> {
        match self.feedback {
            FeedbackPolicy::None => None,
            FeedbackPolicy::Tcp { receive_window } => {
                Some(CongestionFeedbackFrame::Tcp { receive_window })
            }
            FeedbackPolicy::FixRate { bitrate } => Some(CongestionFeedbackFrame::FixRate { bitrate }),
        }
    }

    /// The peer stopped waiting for acks of the packets below
    /// `least_unacked`.
    pub fn update_stop_waiting(&mut self, stop_waiting: &StopWaitingFrame) {
        let least_unacked = stop_waiting.least_unacked;
        if least_unacked <= self.peer_least_packet_awaiting_ack {
            return;
        }
        self.peer_least_packet_awaiting_ack = least_unacked;
        self.missing_packets = self.missing_packets.split_off(&least_unacked);
        self.revived_packets = self.revived_packets.split_off(&least_unacked);
        self.entropy
            .set_cumulative_hash(least_unacked, stop_waiting.entropy_hash);
        trace!(
            "peer least unacked {} missing {:?}",
            least_unacked,
            self.missing_packets
        );
    }

    /// Remember what the peer reported in an accepted ack.
    pub fn update_packet_information_received_by_peer(&mut self, ack: &AckFrame) {
        self.least_packet_awaited_by_peer = match ack.missing_packets.iter().next() {
            Some(&first) => first,
            None => ack.largest_observed + 1,
        };
        self.peer_largest_observed_packet = self
            .peer_largest_observed_packet
            .max(ack.largest_observed);
    }

    pub fn largest_observed(&self) -> u64 {
        self.largest_observed
    }

    pub fn peer_least_packet_awaiting_ack(&self) -> u64 {
        self.peer_least_packet_awaiting_ack
    }

    pub fn peer_largest_observed_packet(&self) -> u64 {
        self.peer_largest_observed_packet
    }

    pub fn least_packet_awaited_by_peer(&self) -> u64 {
        self.least_packet_awaited_by_peer
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::packet_entropy_hash;
    use std::time::Duration;

    fn header(seq: u64, entropy_flag: bool) -> PacketHeader {
        PacketHeader {
            sequence_number: seq,
            entropy_flag,
            ..PacketHeader::default()
        }
    }

    fn new_manager() -> ReceivedPacketManager {
        ReceivedPacketManager::new(FeedbackPolicy::None)
    }

    #[test]
    fn missing_packets() {
        let mut m = new_manager();
        let now = Instant::now();
        assert!(m.is_awaiting_packet(1));

        m.record_packet_received(100, &header(1, false), now);
        assert!(!m.is_awaiting_packet(1));
        assert!(!m.has_missing_packets());

        m.record_packet_received(100, &header(4, false), now);
        assert!(m.is_awaiting_packet(2));
        assert!(m.is_awaiting_packet(3));
        assert!(!m.is_awaiting_packet(4));
        assert!(m.is_awaiting_packet(5));
        assert!(m.has_new_missing_packets());

        m.record_packet_received(100, &header(3, false), now);
        assert!(!m.is_awaiting_packet(3));
        assert_eq!(m.largest_observed(), 4);

        // A gap far behind is not new any more.
        m.record_packet_received(100, &header(10, false), now);
        m.record_packet_received(100, &header(9, false), now);
        m.record_packet_received(100, &header(8, false), now);
        m.record_packet_received(100, &header(7, false), now);
        m.record_packet_received(100, &header(6, false), now);
        m.record_packet_received(100, &header(5, false), now);
        assert!(m.has_missing_packets());
        assert!(!m.has_new_missing_packets());
        assert_eq!(m.packets_received(), 9);
        assert_eq!(m.bytes_received(), 900);
    }

    #[test]
    fn ack_frame() {
        let mut m = new_manager();
        let now = Instant::now();
        m.record_packet_received(100, &header(1, true), now);
        m.record_packet_received(100, &header(3, true), now);

        let later = now + Duration::from_millis(5);
        let ack = m.ack_frame(later);
        assert_eq!(ack.largest_observed, 3);
        assert_eq!(ack.missing_packets, [2].into_iter().collect());
        assert_eq!(ack.delta_time_largest_observed, Some(Duration::from_millis(5)));
        assert!(!ack.is_truncated);
        assert_eq!(
            ack.entropy_hash,
            packet_entropy_hash(1, true) ^ packet_entropy_hash(3, true)
        );
    }

    #[test]
    fn truncated_ack_frame() {
        let mut m = new_manager();
        let now = Instant::now();
        // Every other packet, leaving 300 gaps.
        for i in 0..=300 {
            m.record_packet_received(100, &header(2 * i + 1, false), now);
        }
        let ack = m.ack_frame(now);
        assert!(ack.is_truncated);
        assert_eq!(ack.missing_packets.len(), MAX_ACK_RANGES);
        assert_eq!(ack.missing_packets.iter().next_back(), Some(&510));
        assert_eq!(ack.largest_observed, 511);
        assert_eq!(ack.delta_time_largest_observed, None);
    }

    #[test]
    fn stop_waiting() {
        let mut m = new_manager();
        let now = Instant::now();
        m.record_packet_received(100, &header(1, false), now);
        m.record_packet_received(100, &header(5, true), now);
        assert!(m.is_awaiting_packet(3));

        m.update_stop_waiting(&StopWaitingFrame {
            least_unacked: 4,
            entropy_hash: 0x08,
        });
        assert!(!m.is_awaiting_packet(2));
        assert!(!m.is_awaiting_packet(3));
        assert!(m.is_awaiting_packet(4));
        assert_eq!(m.peer_least_packet_awaiting_ack(), 4);

        let ack = m.ack_frame(now);
        assert_eq!(ack.missing_packets, [4].into_iter().collect());
        assert_eq!(ack.entropy_hash, 0x08 ^ packet_entropy_hash(5, true));

        // Stale stop-waiting frames are ignored.
        m.update_stop_waiting(&StopWaitingFrame {
            least_unacked: 2,
            entropy_hash: 0,
        });
        assert_eq!(m.peer_least_packet_awaiting_ack(), 4);

        // New gaps below the peer's least unacked are not missing.
        m.update_stop_waiting(&StopWaitingFrame {
            least_unacked: 8,
            entropy_hash: 0,
        });
        m.record_packet_received(100, &header(9, false), now);
        assert_eq!(m.ack_frame(now).missing_packets, [8].into_iter().collect());
    }

    #[test]
    fn revived_packets() {
        let mut m = new_manager();
        let now = Instant::now();
        m.record_packet_received(100, &header(1, false), now);
        m.record_packet_received(100, &header(3, true), now);

        m.record_packet_revived(&header(2, true));
        assert!(!m.is_awaiting_packet(2));
        let ack = m.ack_frame(now);
        // Still listed as missing, the peer validates the entropy without it.
        assert_eq!(ack.missing_packets, [2].into_iter().collect());
        assert_eq!(ack.revived_packets, [2].into_iter().collect());
        assert_eq!(ack.entropy_hash, packet_entropy_hash(3, true));

        // Revived twice has no effect.
        m.record_packet_revived(&header(2, false));
        assert_eq!(m.ack_frame(now).entropy_hash, ack.entropy_hash);

        m.update_stop_waiting(&StopWaitingFrame {
            least_unacked: 3,
            entropy_hash: 0x04,
        });
        assert!(m.ack_frame(now).revived_packets.is_empty());
    }

    #[test]
    fn peer_information() {
        let mut m = new_manager();
        let ack = AckFrame {
            largest_observed: 10,
            missing_packets: [4, 7].into_iter().collect(),
            ..AckFrame::default()
        };
        m.update_packet_information_received_by_peer(&ack);
        assert_eq!(m.least_packet_awaited_by_peer(), 4);
        assert_eq!(m.peer_largest_observed_packet(), 10);

        let ack = AckFrame {
            largest_observed: 12,
            ..AckFrame::default()
        };
        m.update_packet_information_received_by_peer(&ack);
        assert_eq!(m.least_packet_awaited_by_peer(), 13);
        assert_eq!(m.peer_largest_observed_packet(), 12);
    }

    #[test]
    fn congestion_feedback() {
        let m = new_manager();
        assert_eq!(m.congestion_feedback(), None);

        let policy = FeedbackPolicy::new(CongestionControlAlgorithm::Cubic, 65536, Bandwidth::ZERO);
        let m = ReceivedPacketManager::new(policy);
        assert_eq!(
            m.congestion_feedback(),
            Some(CongestionFeedbackFrame::Tcp {
                receive_window: 65536
            })
        );

        let bitrate = Bandwidth::from_kbytes_per_second(100);
        let policy = FeedbackPolicy::new(CongestionControlAlgorithm::FixRate, 65536, bitrate);
        let m = ReceivedPacketManager::new(policy);
        assert_eq!(
            m.congestion_feedback(),
            Some(CongestionFeedbackFrame::FixRate { bitrate })
        );
    }
}
