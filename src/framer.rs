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

//! Interface to the packet framer.
//!
//! The framer owns the wire format and the packet protection. It parses an
//! encrypted packet and pushes the typed pieces into a [`FramerVisitor`]
//! synchronously, and builds encrypted packets from typed frames.

use crate::frame::AckFrame;
use crate::frame::CongestionFeedbackFrame;
use crate::frame::ConnectionCloseFrame;
use crate::frame::Frame;
use crate::frame::RstStreamFrame;
use crate::frame::StopWaitingFrame;
use crate::frame::StreamFrame;
use crate::packet::EncryptionLevel;
use crate::packet::FecData;
use crate::packet::PacketHeader;
use crate::packet::PublicResetPacket;
use crate::Error;
use crate::Result;

/// Callbacks invoked by the framer while it processes a packet.
///
/// Frame callbacks return false to stop processing the rest of the packet.
pub trait FramerVisitor {
    /// A framing error was detected. Processing stops afterwards.
    fn on_error(&mut self, error: Error);

    /// The packet uses a version the framer is not set to. Return true to
    /// continue processing with the framer switched to `version`.
    fn on_protocol_version_mismatch(&mut self, version: u32) -> bool;

    /// A version negotiation packet was received.
    fn on_version_negotiation_packet(&mut self, connection_id: u64, versions: &[u32]);

    /// A public reset packet was received.
    fn on_public_reset_packet(&mut self, packet: &PublicResetPacket);

    /// A packet reconstructed by FEC is about to be processed.
    fn on_revived_packet(&mut self);

    /// The packet header was parsed and the packet decrypted. Return false to
    /// drop the packet.
    fn on_packet_header(&mut self, header: &PacketHeader) -> bool;

    /// The decrypted payload of an FEC protected packet.
    fn on_fec_protected_payload(&mut self, payload: &[u8]);

    fn on_stream_frame(&mut self, frame: &StreamFrame) -> bool;

    fn on_ack_frame(&mut self, frame: &AckFrame) -> bool;

    fn on_congestion_feedback_frame(&mut self, frame: &CongestionFeedbackFrame) -> bool;

    fn on_stop_waiting_frame(&mut self, frame: &StopWaitingFrame) -> bool;

    fn on_rst_stream_frame(&mut self, frame: &RstStreamFrame) -> bool;

    fn on_connection_close_frame(&mut self, frame: &ConnectionCloseFrame) -> bool;

    /// The payload of an FEC packet.
    fn on_fec_data(&mut self, fec: &FecData);

    /// All frames of the packet were delivered.
    fn on_packet_complete(&mut self);
}

/// Packet framer.
pub trait Framer {
    /// The version the framer currently speaks.
    fn version(&self) -> u32;

    fn set_version(&mut self, version: u32);

    fn is_supported_version(&self, version: u32) -> bool;

    /// Parse and decrypt an encrypted packet, reporting its content to the
    /// visitor.
    ///
    /// Returns `Error::DecryptionFailure` if the packet could not be
    /// decrypted with the keys installed so far.
    fn process_packet(&mut self, packet: &[u8], visitor: &mut dyn FramerVisitor) -> Result<()>;

    /// Process a packet reconstructed by FEC. `payload` is the plaintext
    /// payload of the packet.
    fn process_revived_packet(
        &mut self,
        header: &PacketHeader,
        payload: &[u8],
        visitor: &mut dyn FramerVisitor,
    ) -> Result<()>;

    /// Serialize frames into a plaintext packet payload.
    fn build_data_payload(&mut self, header: &PacketHeader, frames: &[Frame]) -> Result<Vec<u8>>;

    /// Serialize and encrypt a packet from its header and plaintext payload.
    /// FEC packets carry the redundancy as payload.
    fn encrypt_packet(
        &mut self,
        level: EncryptionLevel,
        header: &PacketHeader,
        payload: &[u8],
    ) -> Result<Vec<u8>>;

    /// Build a version negotiation packet listing `versions`.
    fn build_version_negotiation_packet(
        &mut self,
        connection_id: u64,
        versions: &[u32],
    ) -> Result<Vec<u8>>;
}
