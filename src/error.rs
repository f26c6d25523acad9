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

//! Error type for quic operations.

use strum::IntoEnumIterator;
use strum_macros::EnumIter;

/// QUIC connection error.
#[allow(clippy::enum_variant_names)]
#[derive(Clone, Debug, Default, PartialEq, Eq, EnumIter)]
pub enum Error {
    /// The connection is being closed in the absence of any error.
    #[default]
    NoError,

    /// The endpoint encountered an internal error and cannot continue with the
    /// connection.
    InternalError,

    /// Stream data was received after the stream was terminated.
    StreamDataAfterTermination,

    /// The packet header could not be processed, or its sequence number lies
    /// too far from the packets already received.
    InvalidPacketHeader,

    /// A frame could not be parsed.
    InvalidFrameData,

    /// FEC data was malformed.
    InvalidFecData,

    /// A RST_STREAM frame was malformed.
    InvalidRstStreamData,

    /// A CONNECTION_CLOSE frame was malformed.
    InvalidConnectionCloseData,

    /// An ACK frame claims something the sender never did: acking a packet
    /// which was never sent, moving the largest observed backwards, or
    /// carrying a wrong entropy hash.
    InvalidAckData,

    /// A STOP_WAITING frame carries a least unacked outside of the valid range.
    InvalidStopWaitingData,

    /// A congestion feedback frame was malformed.
    InvalidCongestionFeedbackData,

    /// A version negotiation packet was malformed.
    InvalidVersionNegotiationPacket,

    /// A public reset packet was malformed.
    InvalidPublicResetPacket,

    /// A packet could not be decrypted.
    DecryptionFailure,

    /// A packet could not be encrypted.
    EncryptionFailure,

    /// The packet exceeded the maximum packet size.
    PacketTooLarge,

    /// The peer is going away.
    PeerGoingAway,

    /// The peer opened more streams than allowed.
    TooManyOpenStreams,

    /// A stream reassembly buffer holds too many disjoint data intervals.
    TooManyDataIntervals,

    /// The peer sent a public reset.
    PublicReset,

    /// No mutually supported version could be negotiated.
    InvalidVersion,

    /// No packet was received within the idle timeout.
    ConnectionTimedOut,

    /// The connection exceeded its overall lifetime.
    ConnectionOverallTimedOut,

    /// The crypto handshake did not complete in time.
    HandshakeTimeout,

    /// Writing a packet to the socket failed.
    PacketWriteError,

    /// Reading a packet from the socket failed.
    PacketReadError,

    /* Note: Private error codes are as follows */
    /// There is no more work to do.
    Done,

    /// The provided buffer is too short.
    BufferTooShort,

    /// The operation cannot be completed because it was attempted in an
    /// invalid state.
    InvalidState(String),

    /// The configuration is invalid.
    InvalidConfig(String),

    /// I/O error.
    IoError(String),
}

/// Classification of errors by the way they are handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The peer violated the protocol. Fatal to the connection.
    ProtocolViolation,

    /// A local resource failed. The connection is closed without further
    /// sends.
    LocalResourceFailure,

    /// A timer expired. Fatal to the connection.
    Timeout,

    /// The peer terminated the connection.
    PeerInitiated,

    /// Recovered locally, never closes the connection by itself.
    Internal,
}

impl ErrorKind {
    /// Whether errors of this kind terminate the connection.
    pub fn is_fatal(&self) -> bool {
        *self != ErrorKind::Internal
    }
}

impl Error {
    /// Return the wire value of the error.
    pub(crate) fn to_wire(&self) -> u64 {
        match *self {
            Error::NoError => 0,
            Error::InternalError => 1,
            Error::StreamDataAfterTermination => 2,
            Error::InvalidPacketHeader => 3,
            Error::InvalidFrameData => 4,
            Error::InvalidFecData => 5,
            Error::InvalidRstStreamData => 6,
            Error::InvalidConnectionCloseData => 7,
            Error::InvalidAckData => 9,
            Error::InvalidVersionNegotiationPacket => 10,
            Error::InvalidPublicResetPacket => 11,
            Error::DecryptionFailure => 12,
            Error::EncryptionFailure => 13,
            Error::PacketTooLarge => 14,
            Error::PeerGoingAway => 16,
            Error::TooManyOpenStreams => 18,
            Error::PublicReset => 19,
            Error::InvalidVersion => 20,
            Error::ConnectionTimedOut => 25,
            Error::PacketWriteError => 27,
            Error::InvalidCongestionFeedbackData => 47,
            Error::PacketReadError => 51,
            Error::InvalidStopWaitingData => 60,
            Error::TooManyDataIntervals => 63,
            Error::ConnectionOverallTimedOut => 67,
            Error::HandshakeTimeout => 68,
            _ => 0,
        }
    }

    /// Map a wire value back to the error. Unknown values map to
    /// `InternalError`.
    pub(crate) fn from_wire(code: u64) -> Error {
        Error::iter()
            .take_while(|e| *e != Error::Done)
            .find(|e| e.to_wire() == code)
            .unwrap_or(Error::InternalError)
    }

    /// Return the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PacketWriteError
            | Error::PacketReadError
            | Error::EncryptionFailure
            | Error::IoError(_) => ErrorKind::LocalResourceFailure,

            Error::ConnectionTimedOut
            | Error::ConnectionOverallTimedOut
            | Error::HandshakeTimeout => ErrorKind::Timeout,

            Error::PublicReset | Error::PeerGoingAway => ErrorKind::PeerInitiated,

            Error::DecryptionFailure
            | Error::NoError
            | Error::Done
            | Error::BufferTooShort
            | Error::InvalidState(_)
            | Error::InvalidConfig(_) => ErrorKind::Internal,

            _ => ErrorKind::ProtocolViolation,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl std::convert::From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(format!("{}", err))
    }
}

/// The terminal error of a connection, as surfaced to its owner.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionError {
    /// Whether the close was initiated by the peer.
    pub from_peer: bool,

    /// Indicates the reason for closing this connection.
    pub error_code: u64,

    /// Additional diagnostic information.
    pub reason: Vec<u8>,
}

impl ConnectionError {
    /// The error corresponding to the wire error code.
    pub fn error(&self) -> Error {
        Error::from_wire(self.error_code)
    }
}

impl std::fmt::Debug for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "from_peer={:?} ", self.from_peer)?;
        write!(f, "error_code={:?} ", self.error_code)?;
        match std::str::from_utf8(&self.reason) {
            Ok(v) => write!(f, "reason={:?}", v)?,
            Err(_) => write!(f, "reason={:?}", self.reason)?,
        };

        Ok(())
    }
}
