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

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::frame::RetransmittableFrames;

/// Encryption level of a packet.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum EncryptionLevel {
    /// Packets protected by nothing but the integrity check.
    #[default]
    Unencrypted,

    /// Packets protected by the initial (non forward-secure) keys.
    Initial,

    /// Packets protected by the forward-secure keys.
    ForwardSecure,
}

/// Number of bytes used to encode the sequence number on the wire.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum SequenceNumberLength {
    One = 1,
    Two = 2,
    Four = 4,
    #[default]
    Six = 6,
}

impl SequenceNumberLength {
    /// Return the shortest length able to disambiguate a sequence number that
    /// is at most `delta` away from the least unacked packet.
    pub fn for_delta(delta: u64) -> SequenceNumberLength {
        // Leave room for reordering on both sides.
        let range = delta.saturating_mul(4);
        if range < 1 << 8 {
            SequenceNumberLength::One
        } else if range < 1 << 16 {
            SequenceNumberLength::Two
        } else if range < 1 << 32 {
            SequenceNumberLength::Four
        } else {
            SequenceNumberLength::Six
        }
    }

    pub fn bytes(self) -> usize {
        self as usize
    }
}

/// Why a packet was (re)transmitted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TransmissionType {
    /// First transmission of the frames.
    #[default]
    NotRetransmission,

    /// Retransmission of crypto handshake data.
    HandshakeRetransmission,

    /// Retransmission triggered by nacks.
    NackRetransmission,

    /// Retransmission triggered by a retransmission timeout.
    RtoRetransmission,

    /// Tail loss probe.
    TlpRetransmission,

    /// Retransmission of every unacked packet, after the version changed.
    AllUnackedRetransmission,
}

impl TransmissionType {
    pub fn is_retransmission(self) -> bool {
        self != TransmissionType::NotRetransmission
    }
}

/// Public and private header of a QUIC packet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketHeader {
    pub connection_id: u64,

    /// Whether the version field is present.
    pub version_flag: bool,

    /// Whether the packet is a public reset.
    pub reset_flag: bool,

    /// Protocol version, only meaningful when `version_flag` is set.
    pub version: u32,

    pub sequence_number: u64,

    pub sequence_number_length: SequenceNumberLength,

    /// The random entropy bit of the packet.
    pub entropy_flag: bool,

    /// Whether the payload is FEC redundancy.
    pub fec_flag: bool,

    /// The FEC group protecting the packet, 0 when unprotected.
    pub fec_group: u64,
}

impl PacketHeader {
    /// The contribution of this packet to the cumulative entropy hash.
    pub fn entropy_hash(&self) -> u8 {
        packet_entropy_hash(self.sequence_number, self.entropy_flag)
    }
}

/// The entropy hash contributed by a single packet.
pub fn packet_entropy_hash(seq: u64, entropy_flag: bool) -> u8 {
    (entropy_flag as u8) << (seq % 8)
}

/// FEC redundancy carried by an FEC packet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FecData {
    /// The group the redundancy covers.
    pub fec_group: u64,

    /// XOR of the payloads of all protected packets.
    pub redundancy: Bytes,
}

/// Public reset packet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicResetPacket {
    pub connection_id: u64,
    pub nonce_proof: u64,
    pub rejected_sequence_number: u64,
}

/// A packet built by the framer, before it is handed to the sent packet
/// manager.
#[derive(Debug)]
pub struct SerializedPacket {
    pub sequence_number: u64,

    pub sequence_number_length: SequenceNumberLength,

    /// Length of the encrypted packet in bytes.
    pub length: usize,

    /// Entropy contributed by the packet.
    pub entropy_hash: u8,

    /// Frames to be retransmitted if the packet is lost.
    pub retransmittable_frames: Option<RetransmittableFrames>,

    /// Whether the packet carries FEC redundancy.
    pub is_fec_packet: bool,
}

impl SerializedPacket {
    /// Whether the packet carries anything the sent packet manager tracks.
    pub fn has_payload(&self) -> bool {
        self.is_fec_packet || self.retransmittable_frames.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_number_length() {
        assert_eq!(SequenceNumberLength::for_delta(0), SequenceNumberLength::One);
        assert_eq!(SequenceNumberLength::for_delta(63), SequenceNumberLength::One);
        assert_eq!(SequenceNumberLength::for_delta(64), SequenceNumberLength::Two);
        assert_eq!(
            SequenceNumberLength::for_delta(1 << 14),
            SequenceNumberLength::Four
        );
        assert_eq!(
            SequenceNumberLength::for_delta(1 << 30),
            SequenceNumberLength::Six
        );
        assert_eq!(SequenceNumberLength::Four.bytes(), 4);
    }

    #[test]
    fn entropy_hash() {
        let mut hdr = PacketHeader {
            sequence_number: 9,
            entropy_flag: true,
            ..PacketHeader::default()
        };
        assert_eq!(hdr.entropy_hash(), 0b10);

        hdr.entropy_flag = false;
        assert_eq!(hdr.entropy_hash(), 0);

        assert_eq!(packet_entropy_hash(7, true), 0x80);
    }

    #[test]
    fn transmission_type() {
        assert!(!TransmissionType::NotRetransmission.is_retransmission());
        assert!(TransmissionType::TlpRetransmission.is_retransmission());
        assert!(TransmissionType::RtoRetransmission.is_retransmission());
    }
}
