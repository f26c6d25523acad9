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

//! Typed QUIC frames exchanged with the framer.

use std::collections::BTreeSet;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::congestion_control::Bandwidth;
use crate::packet::EncryptionLevel;

/// Stream id reserved for the crypto handshake.
pub const CRYPTO_STREAM_ID: u64 = 1;

/// STREAM frame carries application or handshake data.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFrame {
    pub stream_id: u64,
    pub fin: bool,
    pub offset: u64,
    pub data: Bytes,
}

impl StreamFrame {
    pub fn new(stream_id: u64, fin: bool, offset: u64, data: Bytes) -> Self {
        StreamFrame {
            stream_id,
            fin,
            offset,
            data,
        }
    }
}

impl std::fmt::Debug for StreamFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "STREAM id={} off={} len={} fin={}",
            self.stream_id,
            self.offset,
            self.data.len(),
            self.fin
        )
    }
}

/// ACK frame describes what the receiver has observed so far.
///
/// Every packet up to `largest_observed` which is not in `missing_packets` is
/// acknowledged.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckFrame {
    /// The highest sequence number received.
    pub largest_observed: u64,

    /// Packets below `largest_observed` not received yet.
    pub missing_packets: BTreeSet<u64>,

    /// Cumulative entropy of all packets up to `largest_observed`, minus the
    /// missing ones.
    pub entropy_hash: u8,

    /// Whether the missing set was too large to be fully represented.
    pub is_truncated: bool,

    /// Time between the arrival of `largest_observed` and the sending of this
    /// ack. None means unknown.
    pub delta_time_largest_observed: Option<Duration>,

    /// Missing packets the receiver reconstructed by FEC.
    pub revived_packets: BTreeSet<u64>,
}

/// The receiver's view of the packets it got, as carried by an ACK frame.
pub type ReceivedPacketInfo = AckFrame;

impl AckFrame {
    /// Whether the receiver is still awaiting the given packet.
    pub fn is_awaiting_packet(&self, seq: u64) -> bool {
        seq > self.largest_observed || self.missing_packets.contains(&seq)
    }
}

/// STOP_WAITING frame tells the receiver the lowest packet it should still
/// expect.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopWaitingFrame {
    pub least_unacked: u64,

    /// Cumulative entropy of all packets below `least_unacked`.
    pub entropy_hash: u8,
}

/// RST_STREAM frame terminates a stream abruptly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RstStreamFrame {
    pub stream_id: u64,
    pub error_code: u64,
    pub bytes_written: u64,
}

/// CONNECTION_CLOSE frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCloseFrame {
    pub error_code: u64,
    pub details: String,
}

/// Congestion feedback sent by the receiver to steer the sender's send
/// algorithm.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CongestionFeedbackFrame {
    /// The receiver asks for a fixed bitrate.
    FixRate { bitrate: Bandwidth },

    /// TCP style feedback carrying the receive window in bytes.
    Tcp { receive_window: u64 },

    /// Arrival times of recently received packets, as offsets from the first
    /// one listed.
    InterArrival {
        received_packet_times: Vec<(u64, Duration)>,
    },
}

/// The QUIC frame is a unit of structured protocol information.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Padding,
    Ping,
    Stream(StreamFrame),
    Ack(AckFrame),
    CongestionFeedback(CongestionFeedbackFrame),
    StopWaiting(StopWaitingFrame),
    RstStream(RstStreamFrame),
    ConnectionClose(ConnectionCloseFrame),
}

impl Frame {
    /// Whether the frame must be retransmitted when its packet is lost.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(
            self,
            Frame::Padding | Frame::Ack(_) | Frame::CongestionFeedback(_) | Frame::StopWaiting(_)
        )
    }
}

/// Frames of a packet that must survive its loss.
///
/// The frames have exactly one owner at any time. They move from a lost
/// transmission to its retransmission and are never duplicated.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RetransmittableFrames {
    frames: Vec<Frame>,

    /// Whether a frame belongs to the crypto stream.
    has_crypto_handshake: bool,

    /// Encryption level the frames were first sent at.
    encryption_level: EncryptionLevel,
}

impl RetransmittableFrames {
    pub fn new(encryption_level: EncryptionLevel) -> Self {
        RetransmittableFrames {
            frames: Vec::new(),
            has_crypto_handshake: false,
            encryption_level,
        }
    }

    /// Append a frame. Frames which need no retransmission are ignored.
    pub fn add_frame(&mut self, frame: Frame) {
        if !frame.is_retransmittable() {
            return;
        }
        if let Frame::Stream(s) = &frame {
            if s.stream_id == CRYPTO_STREAM_ID {
                self.has_crypto_handshake = true;
            }
        }
        self.frames.push(frame);
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn has_crypto_handshake(&self) -> bool {
        self.has_crypto_handshake
    }

    pub fn encryption_level(&self) -> EncryptionLevel {
        self.encryption_level
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FromIterator<Frame> for RetransmittableFrames {
    fn from_iter<I: IntoIterator<Item = Frame>>(iter: I) -> Self {
        let mut frames = RetransmittableFrames::default();
        for frame in iter {
            frames.add_frame(frame);
        }
        frames
    }
}
