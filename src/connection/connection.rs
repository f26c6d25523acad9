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

use std::cmp;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::mem;
use std::net::SocketAddr;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use enumflags2::bitflags;
use enumflags2::BitFlags;
use log::*;

use self::entropy::SentEntropyManager;
use self::fec::FecBuilder;
use self::fec::FecGroup;
use self::received_packet_manager::FeedbackPolicy;
use self::received_packet_manager::ReceivedPacketManager;
use self::sent_packet_manager::SentPacketManager;
use self::timer::Timer;
use self::timer::TimerTable;
use self::ConnectionFlags::*;
use crate::congestion_control::INFINITE_DELAY;
use crate::error::ConnectionError;
use crate::error::Error;
use crate::frame::AckFrame;
use crate::frame::CongestionFeedbackFrame;
use crate::frame::ConnectionCloseFrame;
use crate::frame::Frame;
use crate::frame::RetransmittableFrames;
use crate::frame::RstStreamFrame;
use crate::frame::StopWaitingFrame;
use crate::frame::StreamFrame;
use crate::frame::CRYPTO_STREAM_ID;
use crate::framer::Framer;
use crate::framer::FramerVisitor;
use crate::packet::EncryptionLevel;
use crate::packet::FecData;
use crate::packet::PacketHeader;
use crate::packet::PublicResetPacket;
use crate::packet::SequenceNumberLength;
use crate::packet::SerializedPacket;
use crate::packet::TransmissionType;
use crate::Clock;
use crate::Config;
use crate::Event;
use crate::EventQueue;
use crate::PacketWriter;
use crate::Result;
use crate::WriteStatus;

/// Packets further than this from the last packet processed are considered
/// bogus.
const MAX_PACKET_GAP: u64 = 5000;

/// FEC groups tracked at the same time by the receiver.
const MAX_FEC_GROUPS: usize = 2;

/// Handshake retransmissions in a row before giving up on the handshake.
const MAX_CRYPTO_RETRANSMISSIONS: u32 = 10;

/// Progress of the version negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionNegotiationState {
    /// No packet was exchanged with the peer yet.
    StartNegotiation,

    /// A version negotiation packet was sent (server) or received (client).
    NegotiationInProgress,

    /// Both endpoints agreed on the version.
    NegotiatedVersion,
}

/// Statistics about a connection.
#[derive(Debug, Default, Clone)]
pub struct ConnectionStats {
    /// Total number of received packets, including the ones dropped.
    pub packets_received: u64,

    /// Total number of bytes received.
    pub bytes_received: u64,

    /// Packets processed successfully.
    pub packets_processed: u64,

    /// Packets dropped: unknown connection, duplicates, undecryptable
    /// packets which could not be buffered.
    pub packets_dropped: u64,

    /// Packets reconstructed by FEC.
    pub packets_revived: u64,

    /// Total number of packets written.
    pub packets_sent: u64,

    /// Total number of bytes written.
    pub bytes_sent: u64,

    /// Retransmissions written.
    pub packets_retransmitted: u64,

    /// Bytes of the retransmissions written.
    pub bytes_retransmitted: u64,

    /// Packets declared lost.
    pub packets_lost: u64,

    /// Bytes declared lost.
    pub bytes_lost: u64,

    /// Retransmissions which turned out to be unnecessary.
    pub spurious_retransmissions: u64,

    /// Retransmission timeouts.
    pub rto_count: u64,

    /// Tail loss probes sent.
    pub tlp_count: u64,

    /// Smoothed round trip time.
    pub srtt: Duration,

    /// Minimum round trip time.
    pub min_rtt: Duration,

    /// Congestion window in bytes.
    pub cwnd: u64,
}

#[bitflags]
#[repr(u32)]
#[derive(Clone, Copy)]
enum ConnectionFlags {
    /// An ack is sent at the next write opportunity.
    AckQueued = 1 << 0,

    /// The packet being processed was reconstructed by FEC.
    LastPacketRevived = 1 << 1,

    /// A version negotiation packet is waiting to be written.
    PendingVersionNegotiationPacket = 1 << 2,

    /// The owner was told that the writer blocked.
    WriteBlockedNotified = 1 << 3,

    /// The connection is closed.
    Closed = 1 << 4,

    /// The connection was closed for inactivity.
    IdleTimeout = 1 << 5,
}

/// A packet serialized but not written yet.
struct QueuedPacket {
    sequence_number: u64,

    packet: Vec<u8>,

    transmission_type: TransmissionType,

    has_retransmittable_data: bool,
}

/// Frames of the packet being processed. They take effect once the whole
/// packet was parsed.
#[derive(Default)]
struct ReceivedFrames {
    stream_frames: Vec<StreamFrame>,

    ack_frames: Vec<AckFrame>,

    congestion_feedback_frames: Vec<CongestionFeedbackFrame>,

    stop_waiting_frames: Vec<StopWaitingFrame>,

    rst_stream_frames: Vec<RstStreamFrame>,

    connection_close_frames: Vec<ConnectionCloseFrame>,
}

impl ReceivedFrames {
    /// Whether the packet carried something the peer waits an ack for.
    fn should_instigate_ack(&self) -> bool {
        !self.stream_frames.is_empty()
            || !self.rst_stream_frames.is_empty()
            || self.ack_frames.last().map_or(false, |ack| ack.is_truncated)
    }

    fn has_crypto_stream_frame(&self) -> bool {
        self.stream_frames
            .iter()
            .any(|f| f.stream_id == CRYPTO_STREAM_ID)
    }
}

/// A QUIC connection.
///
/// The connection drives the reliability machinery: it feeds received
/// packets through the framer, validates and applies acks, schedules its
/// alarms, and writes new data, retransmissions, FEC and acks as the send
/// algorithm allows. Its owner reads the results with `poll_event()`.
pub struct Connection {
    connection_id: u64,

    is_server: bool,

    /// The version currently spoken.
    version: u32,

    supported_versions: Vec<u32>,

    version_negotiation_state: VersionNegotiationState,

    self_addr: SocketAddr,

    peer_addr: SocketAddr,

    /// Taken out while the framer calls back into the connection.
    framer: Option<Box<dyn Framer>>,

    writer: Box<dyn PacketWriter>,

    clock: Box<dyn Clock>,

    sent_packet_manager: SentPacketManager,

    received_packet_manager: ReceivedPacketManager,

    sent_entropy_manager: SentEntropyManager,

    /// Encryption level of new packets.
    encryption_level: EncryptionLevel,

    /// Sequence number of the next packet serialized.
    next_sequence_number: u64,

    max_packet_length: usize,

    /// Frames waiting to be sent.
    pending_frames: VecDeque<Frame>,

    /// Packets serialized while the writer could not take them.
    queued_packets: VecDeque<QueuedPacket>,

    /// Packets received before their keys.
    undecryptable_packets: VecDeque<Vec<u8>>,

    max_undecryptable_packets: usize,

    /// FEC groups of the packets received, by group number.
    fec_groups: BTreeMap<u64, FecGroup>,

    fec_builder: FecBuilder,

    /// Header of the packet being processed.
    last_header: PacketHeader,

    /// Size of the packet being processed.
    last_size: usize,

    last_frames: ReceivedFrames,

    largest_seen_packet_with_ack: u64,

    largest_seen_packet_with_stop_waiting: u64,

    delayed_ack_time: Duration,

    idle_timeout: Duration,

    overall_timeout: Duration,

    creation_time: Instant,

    time_of_last_received_packet: Instant,

    time_of_last_sent_new_packet: Instant,

    /// A close frame waiting for the framer to come back.
    pending_close: Option<ConnectionCloseFrame>,

    local_error: Option<ConnectionError>,

    peer_error: Option<ConnectionError>,

    timers: TimerTable,

    flags: BitFlags<ConnectionFlags>,

    stats: ConnectionStats,

    events: EventQueue,

    trace_id: String,
}

impl Connection {
    /// Create a new client connection.
    pub fn new_client(
        connection_id: u64,
        local: SocketAddr,
        remote: SocketAddr,
        conf: &Config,
        framer: Box<dyn Framer>,
        writer: Box<dyn PacketWriter>,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        Connection::new(
            connection_id,
            local,
            remote,
            false,
            conf,
            framer,
            writer,
            clock,
        )
    }

    /// Create a new server connection.
    pub fn new_server(
        connection_id: u64,
        local: SocketAddr,
        remote: SocketAddr,
        conf: &Config,
        framer: Box<dyn Framer>,
        writer: Box<dyn PacketWriter>,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        Connection::new(
            connection_id,
            local,
            remote,
            true,
            conf,
            framer,
            writer,
            clock,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        connection_id: u64,
        self_addr: SocketAddr,
        peer_addr: SocketAddr,
        is_server: bool,
        conf: &Config,
        mut framer: Box<dyn Framer>,
        writer: Box<dyn PacketWriter>,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        let version = *conf
            .supported_versions
            .first()
            .ok_or_else(|| Error::InvalidConfig("no supported version".into()))?;
        framer.set_version(version);

        let trace_id = format!(
            "{}-{:x}",
            if is_server { "SERVER" } else { "CLIENT" },
            connection_id
        );
        let mut sent_packet_manager = SentPacketManager::new(is_server, &conf.recovery);
        sent_packet_manager.set_trace_id(&trace_id);
        let feedback = FeedbackPolicy::new(
            conf.recovery.congestion_control_algorithm,
            conf.receive_window,
            conf.recovery.fix_rate_initial_bitrate,
        );
        let now = clock.now();

        let mut conn = Connection {
            connection_id,
            is_server,
            version,
            supported_versions: conf.supported_versions.clone(),
            version_negotiation_state: VersionNegotiationState::StartNegotiation,
            self_addr,
            peer_addr,
            framer: Some(framer),
            writer,
            clock,
            sent_packet_manager,
            received_packet_manager: ReceivedPacketManager::new(feedback),
            sent_entropy_manager: SentEntropyManager::new(),
            encryption_level: EncryptionLevel::Unencrypted,
            next_sequence_number: 1,
            max_packet_length: conf.recovery.max_datagram_size,
            pending_frames: VecDeque::new(),
            queued_packets: VecDeque::new(),
            undecryptable_packets: VecDeque::new(),
            max_undecryptable_packets: conf.max_undecryptable_packets,
            fec_groups: BTreeMap::new(),
            fec_builder: FecBuilder::new(conf.max_packets_per_fec_group),
            last_header: PacketHeader::default(),
            last_size: 0,
            last_frames: ReceivedFrames::default(),
            largest_seen_packet_with_ack: 0,
            largest_seen_packet_with_stop_waiting: 0,
            delayed_ack_time: conf.delayed_ack_time,
            idle_timeout: conf.idle_timeout,
            overall_timeout: conf.overall_timeout,
            creation_time: now,
            time_of_last_received_packet: now,
            time_of_last_sent_new_packet: now,
            pending_close: None,
            local_error: None,
            peer_error: None,
            timers: TimerTable::default(),
            flags: BitFlags::empty(),
            stats: ConnectionStats::default(),
            events: EventQueue::default(),
            trace_id,
        };
        conn.events.enable();
        conn.check_for_timeout();

        info!(
            "{} connection created, version {:#x} addr {} -> {}",
            conn.trace_id, conn.version, conn.self_addr, conn.peer_addr
        );
        Ok(conn)
    }

    /// Process an incoming UDP datagram from the peer.
    ///
    /// Returns `Error::Done` if the connection is already closed, and the
    /// closing error if the packet caused the connection to close.
    pub fn process_udp_packet(
        &mut self,
        self_addr: SocketAddr,
        peer_addr: SocketAddr,
        packet: &[u8],
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Done);
        }
        if self_addr != self.self_addr || peer_addr != self.peer_addr {
            // Packets are still answered on the original addresses.
            debug!(
                "{} packet from {} to {}, connection uses {} -> {}",
                self.trace_id, peer_addr, self_addr, self.self_addr, self.peer_addr
            );
        }

        self.time_of_last_received_packet = self.clock.now();
        self.stats.packets_received += 1;
        self.stats.bytes_received += packet.len() as u64;
        trace!(
            "now={:?} {} RECV bytes={}",
            self.time_of_last_received_packet,
            self.trace_id,
            packet.len()
        );

        match self.process_packet(packet) {
            Ok(()) => self.maybe_process_undecryptable_packets(),
            Err(Error::DecryptionFailure) => self.maybe_queue_undecryptable_packet(packet),
            Err(e) => debug!("{} packet not processed: {:?}", self.trace_id, e),
        }
        self.maybe_process_revived_packet();
        self.write_if_not_blocked();

        match self.close_error() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Queue stream data for sending.
    pub fn send_stream_data(
        &mut self,
        stream_id: u64,
        offset: u64,
        data: Bytes,
        fin: bool,
    ) -> Result<()> {
        self.send_stream_frames(vec![StreamFrame::new(stream_id, fin, offset, data)])
    }

    /// Queue stream frames for sending. Each frame goes in its own packet.
    pub fn send_stream_frames(&mut self, frames: Vec<StreamFrame>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Done);
        }
        self.pending_frames
            .extend(frames.into_iter().map(Frame::Stream));
        self.write_if_not_blocked();
        Ok(())
    }

    /// Abort a stream.
    pub fn send_rst_stream(
        &mut self,
        stream_id: u64,
        error_code: u64,
        bytes_written: u64,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Done);
        }
        self.pending_frames.push_back(Frame::RstStream(RstStreamFrame {
            stream_id,
            error_code,
            bytes_written,
        }));
        self.write_if_not_blocked();
        Ok(())
    }

    /// Close the connection and tell the peer why.
    ///
    /// Returns `Error::Done` if the connection is already closed.
    pub fn close(&mut self, error: Error, details: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Done);
        }
        self.send_connection_close(error, details);
        Ok(())
    }

    /// The writer can take packets again.
    pub fn on_can_write(&mut self) {
        if self.is_closed() {
            return;
        }
        self.writer.set_writable();
        self.write_pending();
    }

    /// Install the keys of a new encryption level. Buffered packets are
    /// processed again.
    pub fn set_encryption_level(&mut self, level: EncryptionLevel) {
        debug!(
            "{} encryption level {:?} -> {:?}",
            self.trace_id, self.encryption_level, level
        );
        self.encryption_level = level;
        if level == EncryptionLevel::ForwardSecure {
            // The peer has the forward-secure keys, the handshake packets
            // sent in the clear are not needed any more.
            self.sent_packet_manager.neuter_unencrypted_packets();
            self.set_retransmission_alarm();
        }
        self.maybe_process_undecryptable_packets();
        self.maybe_process_revived_packet();
        self.write_if_not_blocked();
    }

    pub fn encryption_level(&self) -> EncryptionLevel {
        self.encryption_level
    }

    /// Return the amount of time until the next timeout event.
    pub fn timeout(&self) -> Option<Duration> {
        let deadline = self.timers.next_timeout()?;
        Some(deadline.saturating_duration_since(self.clock.now()))
    }

    /// The deadline of the next timeout event.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    /// Handle the expired alarms of the connection.
    pub fn on_timeout(&mut self) {
        if self.is_closed() {
            return;
        }
        let now = self.clock.now();
        for timer in self.timers.take_expired(now) {
            if self.is_closed() {
                break;
            }
            trace!("{} timer {:?} fired", self.trace_id, timer);
            match timer {
                Timer::Ack => {
                    self.flags.insert(AckQueued);
                    self.write_if_not_blocked();
                }
                Timer::Retransmission => self.on_retransmission_timeout(now),
                Timer::Send => self.write_if_not_blocked(),
                Timer::Timeout => self.check_for_timeout(),
            }
        }
    }

    /// Return the next event for the owner of the connection.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.poll()
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// The version currently spoken.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn version_negotiation_state(&self) -> VersionNegotiationState {
        self.version_negotiation_state
    }

    /// Check whether the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.flags.contains(Closed)
    }

    /// Check whether the connection was closed for inactivity.
    pub fn is_idle_timeout(&self) -> bool {
        self.flags.contains(IdleTimeout)
    }

    /// Returns the error received from the peer, if any.
    pub fn peer_error(&self) -> Option<&ConnectionError> {
        self.peer_error.as_ref()
    }

    /// Returns the local error, if any.
    pub fn local_error(&self) -> Option<&ConnectionError> {
        self.local_error.as_ref()
    }

    /// Number of packets serialized but not written yet.
    pub fn num_queued_packets(&self) -> usize {
        self.queued_packets.len()
    }

    /// Number of packets waiting for their keys.
    pub fn num_undecryptable_packets(&self) -> usize {
        self.undecryptable_packets.len()
    }

    /// Statistics about the connection.
    pub fn stats(&self) -> ConnectionStats {
        let mut stats = self.stats.clone();
        let recovery = self.sent_packet_manager.stats();
        stats.packets_lost = recovery.packets_lost;
        stats.bytes_lost = recovery.bytes_lost;
        stats.spurious_retransmissions = recovery.spurious_retransmissions;
        stats.rto_count = recovery.rto_count;
        stats.tlp_count = recovery.tlp_count;
        stats.srtt = self.sent_packet_manager.rtt().smoothed_rtt();
        stats.min_rtt = self.sent_packet_manager.rtt().min_rtt();
        stats.cwnd = self.sent_packet_manager.congestion_window();
        stats
    }

    pub fn sent_packet_manager(&self) -> &SentPacketManager {
        &self.sent_packet_manager
    }

    pub fn received_packet_manager(&self) -> &ReceivedPacketManager {
        &self.received_packet_manager
    }

    /// Unique trace id for debug logging.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Run `f` with the framer, which is lent to the connection's visitor
    /// callbacks meanwhile.
    fn with_framer<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Framer, &mut Connection) -> Result<()>,
    {
        let mut framer = self.framer.take().ok_or(Error::InternalError)?;
        let result = f(framer.as_mut(), self);
        if framer.version() != self.version {
            framer.set_version(self.version);
        }
        self.framer = Some(framer);

        // Packets built while the framer was away.
        if let Some(frame) = self.pending_close.take() {
            self.send_connection_close_packet(frame);
        }
        if self.flags.contains(PendingVersionNegotiationPacket) && !self.is_closed() {
            self.send_version_negotiation_packet();
        }
        result
    }

    fn process_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.last_size = packet.len();
        self.flags.remove(LastPacketRevived);
        self.with_framer(|framer, conn| framer.process_packet(packet, conn))?;
        self.stats.packets_processed += 1;
        Ok(())
    }

    fn maybe_queue_undecryptable_packet(&mut self, packet: &[u8]) {
        if self.encryption_level == EncryptionLevel::ForwardSecure
            || self.undecryptable_packets.len() >= self.max_undecryptable_packets
        {
            debug!("{} undecryptable packet dropped", self.trace_id);
            self.stats.packets_dropped += 1;
            return;
        }
        trace!(
            "{} undecryptable packet buffered, {} in the buffer",
            self.trace_id,
            self.undecryptable_packets.len() + 1
        );
        self.undecryptable_packets.push_back(packet.to_vec());
    }

    fn maybe_process_undecryptable_packets(&mut self) {
        if self.undecryptable_packets.is_empty()
            || self.encryption_level == EncryptionLevel::Unencrypted
        {
            return;
        }
        while let Some(packet) = self.undecryptable_packets.pop_front() {
            if self.is_closed() {
                break;
            }
            match self.process_packet(&packet) {
                Err(Error::DecryptionFailure) => {
                    // Still too early for the rest.
                    self.undecryptable_packets.push_front(packet);
                    break;
                }
                Err(e) => debug!("{} buffered packet not processed: {:?}", self.trace_id, e),
                Ok(()) => {
                    trace!("{} buffered packet processed", self.trace_id);
                }
            }
        }
        // No higher level to wait for.
        if self.encryption_level == EncryptionLevel::ForwardSecure {
            self.stats.packets_dropped += self.undecryptable_packets.len() as u64;
            self.undecryptable_packets.clear();
        }
    }

    /// Process the packet reconstructed by the FEC group of the last packet,
    /// if any.
    fn maybe_process_revived_packet(&mut self) {
        if self.is_closed() {
            return;
        }
        let fec_group = self.last_header.fec_group;
        let revived = match self.fec_groups.get_mut(&fec_group) {
            Some(group) if group.can_revive() => group.revive(),
            _ => None,
        };
        let revived = match revived {
            Some(v) => v,
            None => return,
        };
        self.fec_groups.remove(&fec_group);

        let header = PacketHeader {
            connection_id: self.connection_id,
            version: self.version,
            sequence_number: revived.sequence_number,
            sequence_number_length: self.last_header.sequence_number_length,
            entropy_flag: revived.entropy_flag,
            ..PacketHeader::default()
        };
        debug!(
            "{} packet {} revived from FEC group {}",
            self.trace_id, revived.sequence_number, fec_group
        );
        self.last_size = revived.payload.len();
        let payload = revived.payload;
        if let Err(e) =
            self.with_framer(|framer, conn| framer.process_revived_packet(&header, &payload, conn))
        {
            debug!("{} revived packet not processed: {:?}", self.trace_id, e);
        }
    }

    /// The FEC group `fec_group`, created if needed. Only the most recent
    /// groups are kept.
    fn fec_group(&mut self, fec_group: u64) -> Option<&mut FecGroup> {
        if fec_group == 0 {
            return None;
        }
        if !self.fec_groups.contains_key(&fec_group) {
            if self.fec_groups.len() >= MAX_FEC_GROUPS {
                let oldest = *self.fec_groups.keys().next()?;
                if fec_group < oldest {
                    return None;
                }
                self.fec_groups.remove(&oldest);
            }
            self.fec_groups.insert(fec_group, FecGroup::new());
        }
        self.fec_groups.get_mut(&fec_group)
    }

    /// Drop the groups which can not help any more, except the one of the
    /// last packet.
    fn close_fec_groups_before(&mut self, seq: u64) {
        let current = self.last_header.fec_group;
        self.fec_groups
            .retain(|&n, group| n == current || !group.protecting_packets_before(seq));
    }

    fn validate_ack_frame(&self, ack: &AckFrame) -> bool {
        let largest_sent = self.next_sequence_number - 1;
        if ack.largest_observed > largest_sent {
            warn!(
                "{} peer observed unsent packet {} largest sent {}",
                self.trace_id, ack.largest_observed, largest_sent
            );
            return false;
        }

        let peer_largest_observed = self.received_packet_manager.peer_largest_observed_packet();
        if ack.largest_observed < peer_largest_observed {
            warn!(
                "{} peer largest observed decreased {} -> {}",
                self.trace_id, peer_largest_observed, ack.largest_observed
            );
            return false;
        }

        if let Some(&max_missing) = ack.missing_packets.iter().next_back() {
            if max_missing > ack.largest_observed {
                warn!(
                    "{} peer claims missing {} above largest observed {}",
                    self.trace_id, max_missing, ack.largest_observed
                );
                return false;
            }
        }

        let least_awaited = self.received_packet_manager.least_packet_awaited_by_peer();
        if let Some(&min_missing) = ack.missing_packets.iter().next() {
            if min_missing < least_awaited {
                warn!(
                    "{} peer claims missing {} below least awaited {}",
                    self.trace_id, min_missing, least_awaited
                );
                return false;
            }
        }

        if !ack.revived_packets.is_subset(&ack.missing_packets) {
            warn!(
                "{} peer revived packets {:?} not missing",
                self.trace_id, ack.revived_packets
            );
            return false;
        }

        if !self.sent_entropy_manager.is_valid_entropy(
            ack.largest_observed,
            &ack.missing_packets,
            ack.entropy_hash,
        ) {
            warn!(
                "{} peer sent invalid entropy {} for largest observed {}",
                self.trace_id, ack.entropy_hash, ack.largest_observed
            );
            return false;
        }
        true
    }

    fn validate_stop_waiting_frame(&self, stop_waiting: &StopWaitingFrame) -> bool {
        let peer_least = self.received_packet_manager.peer_least_packet_awaiting_ack();
        if stop_waiting.least_unacked < peer_least {
            warn!(
                "{} peer least unacked decreased {} -> {}",
                self.trace_id, peer_least, stop_waiting.least_unacked
            );
            return false;
        }
        if stop_waiting.least_unacked > self.last_header.sequence_number {
            warn!(
                "{} peer least unacked {} above its packet {}",
                self.trace_id, stop_waiting.least_unacked, self.last_header.sequence_number
            );
            return false;
        }
        true
    }

    fn process_ack_frame(&mut self, ack: &AckFrame) {
        self.largest_seen_packet_with_ack = self.last_header.sequence_number;
        self.received_packet_manager
            .update_packet_information_received_by_peer(ack);
        self.sent_entropy_manager
            .clear_entropy_before(self.received_packet_manager.least_packet_awaited_by_peer());

        match self
            .sent_packet_manager
            .on_incoming_ack(ack, self.time_of_last_received_packet)
        {
            Ok((lost_packets, lost_bytes)) => {
                if lost_packets > 0 {
                    debug!(
                        "{} {} packets {} bytes lost",
                        self.trace_id, lost_packets, lost_bytes
                    );
                }
            }
            Err(e) => {
                self.send_connection_close(e, "invalid ack");
                return;
            }
        }
        self.set_retransmission_alarm();
    }

    fn process_stop_waiting_frame(&mut self, stop_waiting: &StopWaitingFrame) {
        self.largest_seen_packet_with_stop_waiting = self.last_header.sequence_number;
        self.received_packet_manager.update_stop_waiting(stop_waiting);
        self.close_fec_groups_before(stop_waiting.least_unacked + 1);
    }

    /// Decide when to ack the packet just received.
    fn maybe_queue_ack(&mut self, frames: &ReceivedFrames, was_missing: bool) {
        let mut ack_queued = was_missing;
        if !ack_queued && frames.should_instigate_ack() {
            if self.timers.is_set(Timer::Ack) {
                // Every second retransmittable packet is acked at once.
                ack_queued = true;
            } else {
                let delay = if frames.has_crypto_stream_frame() {
                    Duration::ZERO
                } else {
                    self.delayed_ack_time
                };
                self.timers
                    .set(Timer::Ack, self.clock.approximate_now() + delay);
            }
        }
        if ack_queued {
            self.flags.insert(AckQueued);
            self.timers.cancel(Timer::Ack);
        }
    }

    /// Check the idle and overall timeouts, and arm the alarm for the next
    /// check.
    fn check_for_timeout(&mut self) {
        let now = self.clock.approximate_now();
        let mut next: Option<Duration> = None;

        if !self.idle_timeout.is_zero() {
            let last_activity = cmp::max(
                self.time_of_last_received_packet,
                self.time_of_last_sent_new_packet,
            );
            let idle = now.saturating_duration_since(last_activity);
            if idle >= self.idle_timeout {
                debug!("{} idle timeout after {:?}", self.trace_id, idle);
                self.flags.insert(IdleTimeout);
                self.send_connection_close(Error::ConnectionTimedOut, "no recent network activity");
                return;
            }
            next = Some(self.idle_timeout - idle);
        }

        if !self.overall_timeout.is_zero() {
            let lifetime = now.saturating_duration_since(self.creation_time);
            if lifetime >= self.overall_timeout {
                debug!("{} overall timeout after {:?}", self.trace_id, lifetime);
                self.send_connection_close(Error::ConnectionOverallTimedOut, "overall timeout");
                return;
            }
            let remaining = self.overall_timeout - lifetime;
            next = Some(next.map_or(remaining, |d| cmp::min(d, remaining)));
        }

        match next {
            Some(d) => self.timers.set(Timer::Timeout, now + d),
            None => self.timers.cancel(Timer::Timeout),
        }
    }

    fn on_retransmission_timeout(&mut self, now: Instant) {
        if !self.sent_packet_manager.has_unacked_packets() {
            self.set_retransmission_alarm();
            return;
        }
        self.sent_packet_manager.on_retransmission_timeout(now);
        if self
            .sent_packet_manager
            .consecutive_crypto_retransmission_count()
            > MAX_CRYPTO_RETRANSMISSIONS
        {
            self.send_connection_close(Error::HandshakeTimeout, "handshake timeout");
            return;
        }
        self.write_if_not_blocked();
        self.set_retransmission_alarm();
    }

    fn set_retransmission_alarm(&mut self) {
        if self.is_closed() {
            return;
        }
        match self.sent_packet_manager.retransmission_time() {
            Some(time) => self.timers.set(Timer::Retransmission, time),
            None => self.timers.cancel(Timer::Retransmission),
        }
    }

    /// Whether a packet of the given type may be written now. Arms the send
    /// alarm if the send algorithm wants to wait.
    fn can_write(
        &mut self,
        transmission_type: TransmissionType,
        has_retransmittable_data: bool,
    ) -> bool {
        if self.writer.is_write_blocked() {
            return false;
        }
        if self.timers.is_set(Timer::Send) {
            return false;
        }
        let now = self.clock.now();
        let delay = self.sent_packet_manager.time_until_send(
            now,
            transmission_type,
            has_retransmittable_data,
        );
        if delay == INFINITE_DELAY {
            self.timers.cancel(Timer::Send);
            return false;
        }
        if !delay.is_zero() {
            trace!("{} send delayed by {:?}", self.trace_id, delay);
            self.timers.set(Timer::Send, now + delay);
            return false;
        }
        true
    }

    fn write_if_not_blocked(&mut self) {
        if !self.writer.is_write_blocked() {
            self.write_pending();
        }
    }

    /// Write what can be written: queued packets first, then the version
    /// negotiation packet, retransmissions, new data and acks.
    fn write_pending(&mut self) {
        if self.is_closed() {
            return;
        }
        if !self.write_queued_packets() {
            return;
        }
        if self.flags.contains(PendingVersionNegotiationPacket) {
            self.send_version_negotiation_packet();
        }
        self.write_pending_retransmissions();
        self.write_pending_frames();
        if self.is_closed() {
            return;
        }
        if self.pending_frames.is_empty() {
            self.flush_fec_group();
        }
        if self.flags.contains(AckQueued)
            && self.can_write(TransmissionType::NotRetransmission, false)
        {
            self.send_ack_packet();
        }
        self.set_retransmission_alarm();

        if self.flags.contains(WriteBlockedNotified)
            && !self.writer.is_write_blocked()
            && self.queued_packets.is_empty()
        {
            self.flags.remove(WriteBlockedNotified);
            self.events.add(Event::CanWrite);
        }
    }

    /// Write the queued packets in order. Returns false if some are left.
    fn write_queued_packets(&mut self) -> bool {
        while let Some(packet) = self.queued_packets.pop_front() {
            if packet.has_retransmittable_data
                && !self
                    .sent_packet_manager
                    .has_retransmittable_frames(packet.sequence_number)
            {
                // Acked or neutered while it waited.
                trace!(
                    "{} queued packet {} discarded",
                    self.trace_id,
                    packet.sequence_number
                );
                continue;
            }
            if !self.can_write(packet.transmission_type, packet.has_retransmittable_data) {
                self.queued_packets.push_front(packet);
                return false;
            }
            if !self.write_packet(packet) {
                return false;
            }
        }
        true
    }

    fn write_pending_retransmissions(&mut self) {
        while !self.is_closed() {
            let (old_seq, transmission_type, frames, level) =
                match self.sent_packet_manager.next_pending_retransmission() {
                    Some(p) => (
                        p.sequence_number,
                        p.transmission_type,
                        p.retransmittable_frames.frames().to_vec(),
                        p.retransmittable_frames.encryption_level(),
                    ),
                    None => break,
                };
            if !self.can_write(transmission_type, true) {
                break;
            }

            // Retransmissions keep their encryption level and are not FEC
            // protected.
            let (header, packet) = match self.build_packet(&frames, level, false) {
                Ok(v) => v,
                Err(e) => {
                    self.send_connection_close(e, "failed to serialize retransmission");
                    break;
                }
            };
            if let Err(e) = self.sent_packet_manager.on_retransmitted_packet(
                old_seq,
                header.sequence_number,
                header.sequence_number_length,
            ) {
                error!(
                    "{} retransmission of {} not tracked: {:?}",
                    self.trace_id, old_seq, e
                );
                self.send_connection_close(e, "failed to track retransmission");
                break;
            }
            let written = self.send_or_queue(QueuedPacket {
                sequence_number: header.sequence_number,
                packet,
                transmission_type,
                has_retransmittable_data: true,
            });
            if !written {
                break;
            }
        }
    }

    fn write_pending_frames(&mut self) {
        while !self.pending_frames.is_empty() && !self.is_closed() {
            if !self.can_write(TransmissionType::NotRetransmission, true) {
                break;
            }
            let frame = match self.pending_frames.pop_front() {
                Some(f) => f,
                None => break,
            };
            if !self.send_data_packet(frame) {
                break;
            }
        }
    }

    /// Send a packet carrying `frame`, with an ack if one is due. Returns
    /// false if the packet could not be written.
    fn send_data_packet(&mut self, frame: Frame) -> bool {
        let mut frames = Vec::new();
        if self.flags.contains(AckQueued) || self.timers.is_set(Timer::Ack) {
            frames.extend(self.ack_frames());
            self.flags.remove(AckQueued);
            self.timers.cancel(Timer::Ack);
        }
        frames.push(frame);

        let level = self.encryption_level;
        let fec_protected = self.fec_builder.is_enabled();
        let (header, packet) = match self.build_packet(&frames, level, fec_protected) {
            Ok(v) => v,
            Err(e) => {
                self.send_connection_close(e, "failed to serialize packet");
                return false;
            }
        };

        let mut retransmittable_frames = RetransmittableFrames::new(level);
        for frame in frames {
            retransmittable_frames.add_frame(frame);
        }
        self.sent_packet_manager.on_serialized_packet(SerializedPacket {
            sequence_number: header.sequence_number,
            sequence_number_length: header.sequence_number_length,
            length: packet.len(),
            entropy_hash: header.entropy_hash(),
            retransmittable_frames: Some(retransmittable_frames),
            is_fec_packet: false,
        });

        let written = self.send_or_queue(QueuedPacket {
            sequence_number: header.sequence_number,
            packet,
            transmission_type: TransmissionType::NotRetransmission,
            has_retransmittable_data: true,
        });
        if self.fec_builder.should_send_fec(false) {
            self.flush_fec_group();
        }
        written
    }

    fn send_ack_packet(&mut self) {
        self.flags.remove(AckQueued);
        self.timers.cancel(Timer::Ack);
        let frames = self.ack_frames();
        let (header, packet) = match self.build_packet(&frames, self.encryption_level, false) {
            Ok(v) => v,
            Err(e) => {
                self.send_connection_close(e, "failed to serialize ack");
                return;
            }
        };
        trace!(
            "{} ACK seq={} largest_observed={}",
            self.trace_id,
            header.sequence_number,
            self.received_packet_manager.largest_observed()
        );
        self.send_or_queue(QueuedPacket {
            sequence_number: header.sequence_number,
            packet,
            transmission_type: TransmissionType::NotRetransmission,
            has_retransmittable_data: false,
        });
    }

    /// Close the open FEC group, sending its FEC packet if it protects any
    /// packet.
    fn flush_fec_group(&mut self) {
        if !self.fec_builder.should_send_fec(true) {
            // Nothing protected yet.
            if self.fec_builder.has_open_group() {
                self.fec_builder.take_fec();
            }
            return;
        }
        let (fec, entropy_flag) = match self.fec_builder.take_fec() {
            Some(v) => v,
            None => return,
        };
        let header = PacketHeader {
            entropy_flag,
            fec_flag: true,
            fec_group: fec.fec_group,
            ..self.new_packet_header()
        };
        let packet = match self.encrypt_packet(&header, &fec.redundancy) {
            Ok(v) => v,
            Err(e) => {
                self.send_connection_close(e, "failed to serialize fec packet");
                return;
            }
        };
        self.on_packet_serialized(&header);
        self.sent_packet_manager.on_serialized_packet(SerializedPacket {
            sequence_number: header.sequence_number,
            sequence_number_length: header.sequence_number_length,
            length: packet.len(),
            entropy_hash: header.entropy_hash(),
            retransmittable_frames: None,
            is_fec_packet: true,
        });
        trace!(
            "{} FEC seq={} group={}",
            self.trace_id,
            header.sequence_number,
            fec.fec_group
        );
        self.send_or_queue(QueuedPacket {
            sequence_number: header.sequence_number,
            packet,
            transmission_type: TransmissionType::NotRetransmission,
            has_retransmittable_data: false,
        });
    }

    /// The ack frame with the congestion feedback and stop-waiting frames
    /// sent along.
    fn ack_frames(&mut self) -> Vec<Frame> {
        let now = self.clock.now();
        let mut frames = vec![Frame::Ack(self.received_packet_manager.ack_frame(now))];
        if let Some(feedback) = self.received_packet_manager.congestion_feedback() {
            frames.push(Frame::CongestionFeedback(feedback));
        }
        let least_unacked = self.sent_packet_manager.least_unacked();
        frames.push(Frame::StopWaiting(StopWaitingFrame {
            least_unacked,
            entropy_hash: self
                .sent_entropy_manager
                .entropy_hash(least_unacked.saturating_sub(1)),
        }));
        frames
    }

    /// Header of the next packet.
    fn new_packet_header(&self) -> PacketHeader {
        let seq = self.next_sequence_number;
        let least_unacked = self.sent_packet_manager.least_unacked();
        PacketHeader {
            connection_id: self.connection_id,
            version_flag: !self.is_server
                && self.version_negotiation_state != VersionNegotiationState::NegotiatedVersion,
            reset_flag: false,
            version: self.version,
            sequence_number: seq,
            sequence_number_length: SequenceNumberLength::for_delta(
                seq.saturating_sub(least_unacked),
            ),
            entropy_flag: rand::random::<bool>(),
            fec_flag: false,
            fec_group: 0,
        }
    }

    /// Serialize and encrypt a data packet.
    fn build_packet(
        &mut self,
        frames: &[Frame],
        level: EncryptionLevel,
        fec_protected: bool,
    ) -> Result<(PacketHeader, Vec<u8>)> {
        if !fec_protected {
            self.flush_fec_group();
        }
        let mut header = self.new_packet_header();
        if fec_protected {
            header.fec_group = self.fec_builder.fec_group_for(header.sequence_number);
        }

        let framer = self.framer.as_mut().ok_or(Error::InternalError)?;
        let payload = framer.build_data_payload(&header, frames)?;
        let packet = framer.encrypt_packet(level, &header, &payload)?;
        if packet.len() > self.max_packet_length {
            error!(
                "{} packet {} too large: {} bytes",
                self.trace_id,
                header.sequence_number,
                packet.len()
            );
            return Err(Error::PacketTooLarge);
        }

        if fec_protected {
            self.fec_builder
                .on_protected_payload(header.entropy_flag, &payload);
        }
        self.on_packet_serialized(&header);
        Ok((header, packet))
    }

    fn encrypt_packet(&mut self, header: &PacketHeader, payload: &[u8]) -> Result<Vec<u8>> {
        let level = self.encryption_level;
        let framer = self.framer.as_mut().ok_or(Error::InternalError)?;
        framer.encrypt_packet(level, header, payload)
    }

    fn on_packet_serialized(&mut self, header: &PacketHeader) {
        self.sent_entropy_manager
            .record_packet_entropy_hash(header.sequence_number, header.entropy_hash());
        self.next_sequence_number = header.sequence_number + 1;
    }

    /// Write the packet unless older packets are waiting.
    fn send_or_queue(&mut self, packet: QueuedPacket) -> bool {
        if !self.queued_packets.is_empty() || self.writer.is_write_blocked() {
            self.queued_packets.push_back(packet);
            return false;
        }
        self.write_packet(packet)
    }

    /// Hand the packet to the writer. Returns false if it was not written.
    fn write_packet(&mut self, packet: QueuedPacket) -> bool {
        let result = self
            .writer
            .write_packet(&packet.packet, self.self_addr, self.peer_addr);
        match result.status {
            WriteStatus::Ok => {
                let now = self.clock.now();
                let bytes = packet.packet.len() as u64;
                self.sent_packet_manager.on_packet_sent(
                    packet.sequence_number,
                    now,
                    bytes,
                    packet.transmission_type,
                    packet.has_retransmittable_data,
                );
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += bytes;
                if packet.transmission_type.is_retransmission() {
                    self.stats.packets_retransmitted += 1;
                    self.stats.bytes_retransmitted += bytes;
                } else {
                    self.time_of_last_sent_new_packet = now;
                }
                trace!(
                    "now={:?} {} SENT seq={} bytes={} type={:?}",
                    now,
                    self.trace_id,
                    packet.sequence_number,
                    bytes,
                    packet.transmission_type
                );
                true
            }
            WriteStatus::Blocked => {
                trace!(
                    "{} write blocked, packet {} queued",
                    self.trace_id,
                    packet.sequence_number
                );
                self.queued_packets.push_front(packet);
                if !self.flags.contains(WriteBlockedNotified) {
                    self.flags.insert(WriteBlockedNotified);
                    self.events.add(Event::WriteBlocked);
                }
                false
            }
            WriteStatus::Error => {
                error!(
                    "{} write of packet {} failed: {}",
                    self.trace_id, packet.sequence_number, result.error_code
                );
                // The socket is gone, no close packet.
                let reason = format!("write error {}", result.error_code);
                self.close_connection(Error::PacketWriteError.to_wire(), reason.as_bytes(), false);
                false
            }
        }
    }

    fn send_version_negotiation_packet(&mut self) {
        if self.writer.is_write_blocked() {
            return;
        }
        let packet = match self.framer.as_mut() {
            Some(framer) => {
                framer.build_version_negotiation_packet(self.connection_id, &self.supported_versions)
            }
            None => return,
        };
        let packet = match packet {
            Ok(v) => v,
            Err(e) => {
                error!("{} version negotiation packet not built: {:?}", self.trace_id, e);
                self.flags.remove(PendingVersionNegotiationPacket);
                return;
            }
        };
        let result = self
            .writer
            .write_packet(&packet, self.self_addr, self.peer_addr);
        match result.status {
            WriteStatus::Ok => {
                debug!("{} version negotiation packet sent", self.trace_id);
                self.flags.remove(PendingVersionNegotiationPacket);
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += packet.len() as u64;
            }
            WriteStatus::Blocked => {
                if !self.flags.contains(WriteBlockedNotified) {
                    self.flags.insert(WriteBlockedNotified);
                    self.events.add(Event::WriteBlocked);
                }
            }
            WriteStatus::Error => {
                let reason = format!("write error {}", result.error_code);
                self.close_connection(Error::PacketWriteError.to_wire(), reason.as_bytes(), false);
            }
        }
    }

    /// Close the connection because of a local error and tell the peer.
    fn send_connection_close(&mut self, error: Error, details: &str) {
        if self.is_closed() {
            return;
        }
        let frame = ConnectionCloseFrame {
            error_code: error.to_wire(),
            details: details.to_string(),
        };
        self.close_connection(frame.error_code, details.as_bytes(), false);
        if self.framer.is_none() {
            // Sent when the framer is back.
            self.pending_close = Some(frame);
            return;
        }
        self.send_connection_close_packet(frame);
    }

    /// Write the close packet ahead of everything queued, which is dropped.
    fn send_connection_close_packet(&mut self, frame: ConnectionCloseFrame) {
        self.queued_packets.clear();
        self.fec_builder.take_fec();

        let mut frames = self.ack_frames();
        frames.push(Frame::ConnectionClose(frame));
        let (header, packet) = match self.build_packet(&frames, self.encryption_level, false) {
            Ok(v) => v,
            Err(e) => {
                warn!("{} close packet not built: {:?}", self.trace_id, e);
                return;
            }
        };
        let result = self
            .writer
            .write_packet(&packet, self.self_addr, self.peer_addr);
        if result.status == WriteStatus::Ok {
            self.stats.packets_sent += 1;
            self.stats.bytes_sent += packet.len() as u64;
        } else {
            debug!(
                "{} close packet {} not written: {:?}",
                self.trace_id, header.sequence_number, result.status
            );
        }
    }

    /// Mark the connection closed. The owner is told once.
    fn close_connection(&mut self, error_code: u64, reason: &[u8], from_peer: bool) {
        if self.is_closed() {
            return;
        }
        let err = ConnectionError {
            from_peer,
            error_code,
            reason: reason.to_vec(),
        };
        info!("{} connection closed: {:?}", self.trace_id, err);

        self.flags.insert(Closed);
        if from_peer {
            self.peer_error = Some(err.clone());
        } else {
            self.local_error = Some(err.clone());
        }
        self.events.add(Event::Closed(err));
        self.timers = TimerTable::default();
        self.pending_frames.clear();
    }

    /// The error which closed the connection, if closed.
    fn close_error(&self) -> Option<Error> {
        self.local_error
            .as_ref()
            .or(self.peer_error.as_ref())
            .map(|e| e.error())
    }
}

impl FramerVisitor for Connection {
    fn on_error(&mut self, error: Error) {
        if error == Error::DecryptionFailure {
            // Handled by the caller, the packet may be buffered.
            return;
        }
        warn!("{} framing error {:?}", self.trace_id, error);
        self.send_connection_close(error, "framing error");
    }

    fn on_protocol_version_mismatch(&mut self, version: u32) -> bool {
        if !self.is_server {
            error!(
                "{} server sent packet with version {:#x}",
                self.trace_id, version
            );
            self.send_connection_close(Error::InternalError, "protocol version mismatch");
            return false;
        }

        match self.version_negotiation_state {
            VersionNegotiationState::StartNegotiation
            | VersionNegotiationState::NegotiationInProgress => {
                if !self.supported_versions.contains(&version) {
                    debug!(
                        "{} unsupported version {:#x}, negotiating",
                        self.trace_id, version
                    );
                    self.flags.insert(PendingVersionNegotiationPacket);
                    self.version_negotiation_state = VersionNegotiationState::NegotiationInProgress;
                    return false;
                }
            }
            // Late packets of the client sent before negotiation.
            VersionNegotiationState::NegotiatedVersion => return false,
        }

        debug!("{} version {:#x} negotiated", self.trace_id, version);
        self.version = version;
        self.version_negotiation_state = VersionNegotiationState::NegotiatedVersion;
        self.events.add(Event::VersionNegotiated(version));
        true
    }

    fn on_version_negotiation_packet(&mut self, connection_id: u64, versions: &[u32]) {
        if connection_id != self.connection_id {
            self.stats.packets_dropped += 1;
            return;
        }
        if self.is_server {
            error!("{} client sent version negotiation packet", self.trace_id);
            self.send_connection_close(Error::InternalError, "version negotiation from client");
            return;
        }
        if self.version_negotiation_state != VersionNegotiationState::StartNegotiation {
            // Duplicate or late.
            return;
        }
        if versions.contains(&self.version) {
            warn!(
                "{} version negotiation lists the current version {:#x}",
                self.trace_id, self.version
            );
            self.close_connection(
                Error::InvalidVersionNegotiationPacket.to_wire(),
                b"server already supports client's version",
                false,
            );
            return;
        }

        let version = match self
            .supported_versions
            .iter()
            .find(|v| versions.contains(v))
        {
            Some(&v) => v,
            None => {
                self.send_connection_close(Error::InvalidVersion, "no common version found");
                return;
            }
        };
        debug!(
            "{} switching version {:#x} -> {:#x}",
            self.trace_id, self.version, version
        );
        self.version = version;
        self.version_negotiation_state = VersionNegotiationState::NegotiationInProgress;
        self.sent_packet_manager.retransmit_unacked_packets();
    }

    fn on_public_reset_packet(&mut self, packet: &PublicResetPacket) {
        if packet.connection_id != self.connection_id {
            self.stats.packets_dropped += 1;
            return;
        }
        debug!(
            "{} public reset, rejected packet {}",
            self.trace_id, packet.rejected_sequence_number
        );
        self.close_connection(Error::PublicReset.to_wire(), b"public reset", true);
    }

    fn on_revived_packet(&mut self) {
        self.flags.insert(LastPacketRevived);
    }

    fn on_packet_header(&mut self, header: &PacketHeader) -> bool {
        if header.connection_id != self.connection_id {
            debug!(
                "{} packet for connection {} dropped",
                self.trace_id, header.connection_id
            );
            self.stats.packets_dropped += 1;
            return false;
        }

        let seq = header.sequence_number;
        if seq.abs_diff(self.last_header.sequence_number) > MAX_PACKET_GAP {
            self.stats.packets_dropped += 1;
            self.send_connection_close(Error::InvalidPacketHeader, "packet sequence number out of bounds");
            return false;
        }

        if !self.received_packet_manager.is_awaiting_packet(seq) {
            trace!("{} duplicate packet {} dropped", self.trace_id, seq);
            self.stats.packets_dropped += 1;
            return false;
        }

        if self.version_negotiation_state != VersionNegotiationState::NegotiatedVersion {
            if self.is_server && !header.version_flag {
                self.stats.packets_dropped += 1;
                self.send_connection_close(Error::InvalidVersion, "packet without version before negotiation");
                return false;
            }
            // The first packet of the client or the first packet without
            // version of the server completes the negotiation.
            debug!("{} version {:#x} negotiated", self.trace_id, self.version);
            self.version_negotiation_state = VersionNegotiationState::NegotiatedVersion;
            self.events.add(Event::VersionNegotiated(self.version));
        }

        self.last_header = header.clone();
        self.last_frames = ReceivedFrames::default();
        true
    }

    fn on_fec_protected_payload(&mut self, payload: &[u8]) {
        let header = self.last_header.clone();
        if let Some(group) = self.fec_group(header.fec_group) {
            group.update(&header, payload);
        }
    }

    fn on_stream_frame(&mut self, frame: &StreamFrame) -> bool {
        self.last_frames.stream_frames.push(frame.clone());
        !self.is_closed()
    }

    fn on_ack_frame(&mut self, frame: &AckFrame) -> bool {
        if self.last_header.sequence_number <= self.largest_seen_packet_with_ack {
            trace!(
                "{} ack in old packet {} ignored",
                self.trace_id,
                self.last_header.sequence_number
            );
            return true;
        }
        if !self.validate_ack_frame(frame) {
            self.send_connection_close(Error::InvalidAckData, "invalid ack data");
            return false;
        }
        self.last_frames.ack_frames.push(frame.clone());
        !self.is_closed()
    }

    fn on_congestion_feedback_frame(&mut self, frame: &CongestionFeedbackFrame) -> bool {
        self.last_frames
            .congestion_feedback_frames
            .push(frame.clone());
        !self.is_closed()
    }

    fn on_stop_waiting_frame(&mut self, frame: &StopWaitingFrame) -> bool {
        if self.last_header.sequence_number <= self.largest_seen_packet_with_stop_waiting {
            return true;
        }
        if !self.validate_stop_waiting_frame(frame) {
            self.send_connection_close(Error::InvalidStopWaitingData, "invalid stop waiting data");
            return false;
        }
        self.last_frames.stop_waiting_frames.push(frame.clone());
        !self.is_closed()
    }

    fn on_rst_stream_frame(&mut self, frame: &RstStreamFrame) -> bool {
        self.last_frames.rst_stream_frames.push(frame.clone());
        !self.is_closed()
    }

    fn on_connection_close_frame(&mut self, frame: &ConnectionCloseFrame) -> bool {
        self.last_frames
            .connection_close_frames
            .push(frame.clone());
        !self.is_closed()
    }

    fn on_fec_data(&mut self, fec: &FecData) {
        let header = self.last_header.clone();
        if let Some(group) = self.fec_group(header.fec_group) {
            if !group.update_fec(&header, fec) {
                debug!(
                    "{} fec packet {} of group {} ignored",
                    self.trace_id, header.sequence_number, fec.fec_group
                );
            }
        }
    }

    fn on_packet_complete(&mut self) {
        let frames = mem::take(&mut self.last_frames);
        if self.is_closed() {
            return;
        }

        let header = self.last_header.clone();
        let was_missing = header.sequence_number < self.received_packet_manager.largest_observed();
        if self.flags.contains(LastPacketRevived) {
            self.received_packet_manager.record_packet_revived(&header);
            self.stats.packets_revived += 1;
        } else {
            self.received_packet_manager.record_packet_received(
                self.last_size as u64,
                &header,
                self.time_of_last_received_packet,
            );
        }
        self.maybe_queue_ack(&frames, was_missing);

        for frame in &frames.stream_frames {
            self.events.add(Event::StreamFrame(frame.clone()));
        }
        for frame in &frames.rst_stream_frames {
            self.events.add(Event::RstStream(frame.clone()));
        }

        for ack in &frames.ack_frames {
            self.process_ack_frame(ack);
            if self.is_closed() {
                return;
            }
        }
        for feedback in &frames.congestion_feedback_frames {
            self.sent_packet_manager
                .on_incoming_congestion_feedback(feedback, self.time_of_last_received_packet);
        }
        for stop_waiting in &frames.stop_waiting_frames {
            self.process_stop_waiting_frame(stop_waiting);
        }

        if let Some(close) = frames.connection_close_frames.first() {
            debug!(
                "{} peer closed the connection: {} {}",
                self.trace_id, close.error_code, close.details
            );
            self.close_connection(close.error_code, close.details.as_bytes(), true);
            return;
        }

        if self.received_packet_manager.has_new_missing_packets() {
            self.flags.insert(AckQueued);
            self.timers.cancel(Timer::Ack);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::packet_entropy_hash;
    use crate::SystemClock;
    use crate::WriteResult;
    use crate::QUIC_VERSION_Q018;
    use crate::QUIC_VERSION_Q019;
    use std::cell::Cell;
    use std::cell::RefCell;
    use std::collections::BTreeSet;
    use std::rc::Rc;

    const CID: u64 = 0x4242;
    const QUIC_VERSION_Q017: u32 = 0x5130_3137;

    /// A framer speaking plain text: a level byte, the header as JSON and
    /// the frames as JSON.
    struct TestFramer {
        version: u32,

        keys: Rc<Cell<EncryptionLevel>>,
    }

    fn level_byte(level: EncryptionLevel) -> u8 {
        match level {
            EncryptionLevel::Unencrypted => 0,
            EncryptionLevel::Initial => 1,
            EncryptionLevel::ForwardSecure => 2,
        }
    }

    fn level_of(b: u8) -> Option<EncryptionLevel> {
        match b {
            0 => Some(EncryptionLevel::Unencrypted),
            1 => Some(EncryptionLevel::Initial),
            2 => Some(EncryptionLevel::ForwardSecure),
            _ => None,
        }
    }

    fn encode(level: EncryptionLevel, header: &PacketHeader, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![level_byte(level)];
        out.extend(serde_json::to_vec(header).unwrap());
        out.push(b'\n');
        out.extend_from_slice(payload);
        out
    }

    fn decode(packet: &[u8]) -> Option<(EncryptionLevel, PacketHeader, Vec<u8>)> {
        let level = level_of(*packet.first()?)?;
        let split = packet.iter().position(|&b| b == b'\n')?;
        let header = serde_json::from_slice(&packet[1..split]).ok()?;
        Some((level, header, packet[split + 1..].to_vec()))
    }

    fn decode_frames(payload: &[u8]) -> Option<Vec<Frame>> {
        // Revived payloads are zero padded.
        let end = payload.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        serde_json::from_slice(&payload[..end]).ok()
    }

    impl TestFramer {
        fn process_payload(
            &mut self,
            header: &PacketHeader,
            payload: &[u8],
            visitor: &mut dyn FramerVisitor,
        ) -> Result<()> {
            if !visitor.on_packet_header(header) {
                return Ok(());
            }
            if header.fec_flag {
                visitor.on_fec_data(&FecData {
                    fec_group: header.fec_group,
                    redundancy: Bytes::copy_from_slice(payload),
                });
                visitor.on_packet_complete();
                return Ok(());
            }
            if header.fec_group != 0 {
                visitor.on_fec_protected_payload(payload);
            }
            let frames = match decode_frames(payload) {
                Some(v) => v,
                None => {
                    visitor.on_error(Error::InvalidFrameData);
                    return Err(Error::InvalidFrameData);
                }
            };
            for frame in frames {
                let more = match &frame {
                    Frame::Stream(f) => visitor.on_stream_frame(f),
                    Frame::Ack(f) => visitor.on_ack_frame(f),
                    Frame::CongestionFeedback(f) => visitor.on_congestion_feedback_frame(f),
                    Frame::StopWaiting(f) => visitor.on_stop_waiting_frame(f),
                    Frame::RstStream(f) => visitor.on_rst_stream_frame(f),
                    Frame::ConnectionClose(f) => visitor.on_connection_close_frame(f),
                    Frame::Padding | Frame::Ping => true,
                };
                if !more {
                    return Ok(());
                }
            }
            visitor.on_packet_complete();
            Ok(())
        }
    }

    impl Framer for TestFramer {
        fn version(&self) -> u32 {
            self.version
        }

        fn set_version(&mut self, version: u32) {
            self.version = version;
        }

        fn is_supported_version(&self, version: u32) -> bool {
            [QUIC_VERSION_Q018, QUIC_VERSION_Q019].contains(&version)
        }

        fn process_packet(&mut self, packet: &[u8], visitor: &mut dyn FramerVisitor) -> Result<()> {
            match packet.first() {
                Some(b'V') => {
                    let (cid, versions): (u64, Vec<u32>) =
                        serde_json::from_slice(&packet[1..]).map_err(|_| Error::InvalidFrameData)?;
                    visitor.on_version_negotiation_packet(cid, &versions);
                    return Ok(());
                }
                Some(b'R') => {
                    let reset: PublicResetPacket =
                        serde_json::from_slice(&packet[1..]).map_err(|_| Error::InvalidFrameData)?;
                    visitor.on_public_reset_packet(&reset);
                    return Ok(());
                }
                _ => (),
            }

            let (level, header, payload) = match decode(packet) {
                Some(v) => v,
                None => {
                    visitor.on_error(Error::InvalidPacketHeader);
                    return Err(Error::InvalidPacketHeader);
                }
            };
            if header.version_flag && header.version != self.version {
                if !visitor.on_protocol_version_mismatch(header.version) {
                    return Ok(());
                }
                self.version = header.version;
            }
            if level > self.keys.get() {
                return Err(Error::DecryptionFailure);
            }
            self.process_payload(&header, &payload, visitor)
        }

        fn process_revived_packet(
            &mut self,
            header: &PacketHeader,
            payload: &[u8],
            visitor: &mut dyn FramerVisitor,
        ) -> Result<()> {
            visitor.on_revived_packet();
            self.process_payload(header, payload, visitor)
        }

        fn build_data_payload(&mut self, _header: &PacketHeader, frames: &[Frame]) -> Result<Vec<u8>> {
            serde_json::to_vec(frames).map_err(|_| Error::InternalError)
        }

        fn encrypt_packet(
            &mut self,
            level: EncryptionLevel,
            header: &PacketHeader,
            payload: &[u8],
        ) -> Result<Vec<u8>> {
            Ok(encode(level, header, payload))
        }

        fn build_version_negotiation_packet(
            &mut self,
            connection_id: u64,
            versions: &[u32],
        ) -> Result<Vec<u8>> {
            let mut out = vec![b'V'];
            out.extend(serde_json::to_vec(&(connection_id, versions)).map_err(|_| Error::InternalError)?);
            Ok(out)
        }
    }

    struct TestClock(Rc<Cell<Instant>>);

    impl Clock for TestClock {
        fn now(&self) -> Instant {
            self.0.get()
        }
    }

    #[derive(Default)]
    struct WriterState {
        /// Packets written.
        packets: Vec<Vec<u8>>,

        /// The socket refuses packets.
        socket_full: bool,

        /// A write was refused and the writer was not told writable since.
        write_blocked: bool,

        /// Writes fail.
        fail: bool,
    }

    struct TestWriter(Rc<RefCell<WriterState>>);

    impl PacketWriter for TestWriter {
        fn write_packet(
            &mut self,
            buf: &[u8],
            _self_addr: SocketAddr,
            _peer_addr: SocketAddr,
        ) -> WriteResult {
            let mut state = self.0.borrow_mut();
            if state.fail {
                return WriteResult::error(32);
            }
            if state.socket_full {
                state.write_blocked = true;
                return WriteResult::blocked();
            }
            state.packets.push(buf.to_vec());
            WriteResult::ok(buf.len())
        }

        fn is_write_blocked(&self) -> bool {
            self.0.borrow().write_blocked
        }

        fn set_writable(&mut self) {
            self.0.borrow_mut().write_blocked = false;
        }
    }

    /// A connection and the peer side of its environment.
    struct TestPeer {
        conn: Connection,

        now: Rc<Cell<Instant>>,

        writer: Rc<RefCell<WriterState>>,

        keys: Rc<Cell<EncryptionLevel>>,

        /// Sequence number of the next packet sent by the peer.
        next_seq: u64,

        /// Packets written before the test started.
        mark: usize,

        /// Whether the peer packets carry a version.
        version_flag: bool,

        version: u32,
    }

    fn local_addr() -> SocketAddr {
        "127.0.0.1:443".parse().unwrap()
    }

    fn peer_addr() -> SocketAddr {
        "127.0.0.1:8443".parse().unwrap()
    }

    impl TestPeer {
        fn new(is_server: bool, conf: &Config) -> TestPeer {
            let now = Rc::new(Cell::new(Instant::now()));
            let writer = Rc::new(RefCell::new(WriterState::default()));
            let keys = Rc::new(Cell::new(EncryptionLevel::Unencrypted));
            let framer = Box::new(TestFramer {
                version: 0,
                keys: keys.clone(),
            });
            let writer_box = Box::new(TestWriter(writer.clone()));
            let clock = Box::new(TestClock(now.clone()));
            let conn = if is_server {
                Connection::new_server(CID, local_addr(), peer_addr(), conf, framer, writer_box, clock)
            } else {
                Connection::new_client(CID, local_addr(), peer_addr(), conf, framer, writer_box, clock)
            }
            .unwrap();
            TestPeer {
                conn,
                now,
                writer,
                keys,
                next_seq: 1,
                mark: 0,
                version_flag: is_server,
                version: QUIC_VERSION_Q019,
            }
        }

        fn default_config() -> Config {
            Config::new().unwrap()
        }

        /// A server connection which received the first client packet.
        fn server() -> TestPeer {
            TestPeer::server_with_config(&TestPeer::default_config())
        }

        fn server_with_config(conf: &Config) -> TestPeer {
            let mut p = TestPeer::new(true, conf);
            p.receive(&[stream_frame(5, b"hello")]).unwrap();
            assert_eq!(
                p.conn.version_negotiation_state(),
                VersionNegotiationState::NegotiatedVersion
            );
            p.version_flag = false;
            // Flush the delayed ack.
            p.advance(Duration::from_millis(25));
            p.conn.on_timeout();
            p.drain_events();
            p.mark = p.writer.borrow().packets.len();
            p
        }

        fn header(&self, seq: u64) -> PacketHeader {
            PacketHeader {
                connection_id: CID,
                version_flag: self.version_flag,
                version: self.version,
                sequence_number: seq,
                ..PacketHeader::default()
            }
        }

        fn packet(&mut self, frames: &[Frame]) -> Vec<u8> {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.packet_with_seq(seq, frames)
        }

        fn packet_with_seq(&self, seq: u64, frames: &[Frame]) -> Vec<u8> {
            let payload = serde_json::to_vec(frames).unwrap();
            encode(EncryptionLevel::Unencrypted, &self.header(seq), &payload)
        }

        fn receive(&mut self, frames: &[Frame]) -> Result<()> {
            let packet = self.packet(frames);
            self.receive_packet(&packet)
        }

        fn receive_packet(&mut self, packet: &[u8]) -> Result<()> {
            self.conn
                .process_udp_packet(local_addr(), peer_addr(), packet)
        }

        fn advance(&self, d: Duration) {
            self.now.set(self.now.get() + d);
        }

        fn drain_events(&mut self) -> Vec<Event> {
            let mut events = Vec::new();
            while let Some(e) = self.conn.poll_event() {
                events.push(e);
            }
            events
        }

        /// Data packets written since the test started.
        fn written(&self) -> Vec<(PacketHeader, Vec<u8>)> {
            self.writer.borrow().packets[self.mark..]
                .iter()
                .filter_map(|p| decode(p).map(|(_, h, payload)| (h, payload)))
                .collect()
        }

        fn written_frames(&self) -> Vec<(u64, Vec<Frame>)> {
            self.written()
                .into_iter()
                .filter(|(h, _)| !h.fec_flag)
                .map(|(h, payload)| (h.sequence_number, decode_frames(&payload).unwrap()))
                .collect()
        }

        fn last_frames(&self) -> Vec<Frame> {
            self.written_frames().pop().unwrap().1
        }

        /// An ack of the connection's packets up to `largest`, with the
        /// entropy the connection expects.
        fn ack(&self, largest: u64, missing: &[u64]) -> AckFrame {
            let missing: BTreeSet<u64> = missing.iter().copied().collect();
            let entropy_hash = self
                .writer
                .borrow()
                .packets
                .iter()
                .filter_map(|p| decode(p).map(|(_, h, _)| h))
                .filter(|h| h.sequence_number <= largest && !missing.contains(&h.sequence_number))
                .fold(0, |hash, h| hash ^ packet_entropy_hash(h.sequence_number, h.entropy_flag));
            AckFrame {
                largest_observed: largest,
                missing_packets: missing,
                entropy_hash,
                delta_time_largest_observed: Some(Duration::ZERO),
                ..AckFrame::default()
            }
        }

        fn local_error_code(&self) -> Option<u64> {
            self.conn.local_error().map(|e| e.error_code)
        }
    }

    fn stream_frame(stream_id: u64, data: &'static [u8]) -> Frame {
        Frame::Stream(StreamFrame::new(stream_id, false, 0, Bytes::from_static(data)))
    }

    fn has_ack(frames: &[Frame]) -> Option<&AckFrame> {
        frames.iter().find_map(|f| match f {
            Frame::Ack(ack) => Some(ack),
            _ => None,
        })
    }

    fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
        let mut out = vec![0; cmp::max(a.len(), b.len())];
        for (i, o) in out.iter_mut().enumerate() {
            *o = a.get(i).copied().unwrap_or(0) ^ b.get(i).copied().unwrap_or(0);
        }
        out
    }

    #[test]
    fn new_connection() {
        let conf = TestPeer::default_config();
        let p = TestPeer::new(false, &conf);
        assert!(!p.conn.is_server());
        assert!(!p.conn.is_closed());
        assert_eq!(p.conn.version(), QUIC_VERSION_Q019);
        assert_eq!(p.conn.trace_id(), format!("CLIENT-{:x}", CID));
        assert_eq!(
            p.conn.version_negotiation_state(),
            VersionNegotiationState::StartNegotiation
        );
        // Only the idle timeout is armed.
        assert_eq!(p.conn.timeout(), Some(Duration::from_secs(30)));

        let conn = Connection::new_server(
            1,
            local_addr(),
            peer_addr(),
            &conf,
            Box::new(TestFramer {
                version: 0,
                keys: Rc::new(Cell::new(EncryptionLevel::Unencrypted)),
            }),
            Box::new(TestWriter(Rc::new(RefCell::new(WriterState::default())))),
            Box::new(SystemClock),
        )
        .unwrap();
        assert!(conn.is_server());
        assert_eq!(conn.trace_id(), "SERVER-1");
    }

    #[test]
    fn client_version_negotiation() -> Result<()> {
        let conf = TestPeer::default_config();
        let mut p = TestPeer::new(false, &conf);
        p.conn
            .send_stream_data(CRYPTO_STREAM_ID, 0, Bytes::from_static(b"CHLO"), false)?;
        let written = p.written();
        assert_eq!(written.len(), 1);
        assert!(written[0].0.version_flag);
        assert_eq!(written[0].0.version, QUIC_VERSION_Q019);

        // The server only speaks Q018.
        let mut vn = vec![b'V'];
        vn.extend(serde_json::to_vec(&(CID, vec![QUIC_VERSION_Q018])).unwrap());
        p.receive_packet(&vn)?;
        assert_eq!(p.conn.version(), QUIC_VERSION_Q018);
        assert_eq!(
            p.conn.version_negotiation_state(),
            VersionNegotiationState::NegotiationInProgress
        );

        // The handshake data is sent again with the new version.
        let written = p.written();
        assert_eq!(written.len(), 2);
        assert!(written[1].0.version_flag);
        assert_eq!(written[1].0.version, QUIC_VERSION_Q018);
        assert_eq!(written[1].0.sequence_number, 2);
        assert_eq!(
            p.last_frames(),
            vec![Frame::Stream(StreamFrame::new(
                CRYPTO_STREAM_ID,
                false,
                0,
                Bytes::from_static(b"CHLO")
            ))]
        );

        // A second version negotiation packet is ignored.
        let mut vn = vec![b'V'];
        vn.extend(serde_json::to_vec(&(CID, vec![QUIC_VERSION_Q017])).unwrap());
        p.receive_packet(&vn)?;
        assert_eq!(p.conn.version(), QUIC_VERSION_Q018);

        // The first packet of the server completes the negotiation.
        p.version_flag = false;
        p.version = QUIC_VERSION_Q018;
        p.receive(&[stream_frame(CRYPTO_STREAM_ID, b"SHLO")])?;
        assert_eq!(
            p.conn.version_negotiation_state(),
            VersionNegotiationState::NegotiatedVersion
        );
        let events = p.drain_events();
        assert_eq!(events[0], Event::VersionNegotiated(QUIC_VERSION_Q018));
        assert!(matches!(events[1], Event::StreamFrame(_)));

        // New packets carry no version.
        p.conn.send_stream_data(3, 0, Bytes::from_static(b"GET"), false)?;
        let (header, _) = p.written().pop().unwrap();
        assert!(!header.version_flag);
        Ok(())
    }

    #[test]
    fn client_invalid_version_negotiation() {
        let conf = TestPeer::default_config();

        // Listing the version in use is a protocol error.
        let mut p = TestPeer::new(false, &conf);
        let mut vn = vec![b'V'];
        vn.extend(serde_json::to_vec(&(CID, vec![QUIC_VERSION_Q019])).unwrap());
        assert_eq!(
            p.receive_packet(&vn),
            Err(Error::InvalidVersionNegotiationPacket)
        );
        // No close packet.
        assert!(p.writer.borrow().packets.is_empty());

        // No common version.
        let mut p = TestPeer::new(false, &conf);
        let mut vn = vec![b'V'];
        vn.extend(serde_json::to_vec(&(CID, vec![QUIC_VERSION_Q017])).unwrap());
        assert_eq!(p.receive_packet(&vn), Err(Error::InvalidVersion));
        assert_eq!(p.local_error_code(), Some(Error::InvalidVersion.to_wire()));
        assert!(matches!(p.drain_events().pop(), Some(Event::Closed(_))));
    }

    #[test]
    fn server_version_negotiation() -> Result<()> {
        let conf = TestPeer::default_config();
        let mut p = TestPeer::new(true, &conf);
        p.version = QUIC_VERSION_Q017;
        p.receive(&[stream_frame(CRYPTO_STREAM_ID, b"CHLO")])?;
        assert_eq!(
            p.conn.version_negotiation_state(),
            VersionNegotiationState::NegotiationInProgress
        );
        assert!(p.drain_events().is_empty());

        // A version negotiation packet lists the supported versions.
        let packets = p.writer.borrow().packets.clone();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0][0], b'V');
        let (cid, versions): (u64, Vec<u32>) = serde_json::from_slice(&packets[0][1..]).unwrap();
        assert_eq!(cid, CID);
        assert_eq!(versions, vec![QUIC_VERSION_Q019, QUIC_VERSION_Q018]);

        // The client retries with a supported version.
        p.version = QUIC_VERSION_Q018;
        p.receive(&[stream_frame(CRYPTO_STREAM_ID, b"CHLO")])?;
        assert_eq!(p.conn.version(), QUIC_VERSION_Q018);
        assert_eq!(
            p.conn.version_negotiation_state(),
            VersionNegotiationState::NegotiatedVersion
        );
        let events = p.drain_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], Event::VersionNegotiated(QUIC_VERSION_Q018));
        assert!(matches!(events[1], Event::StreamFrame(_)));
        Ok(())
    }

    #[test]
    fn server_requires_version_flag() {
        let conf = TestPeer::default_config();
        let mut p = TestPeer::new(true, &conf);
        p.version_flag = false;
        assert_eq!(
            p.receive(&[stream_frame(3, b"data")]),
            Err(Error::InvalidVersion)
        );
        assert!(p.conn.is_closed());
    }

    #[test]
    fn drop_unknown_connection_id() -> Result<()> {
        let mut p = TestPeer::server();
        let mut header = p.header(2);
        header.connection_id = CID + 1;
        let packet = encode(
            EncryptionLevel::Unencrypted,
            &header,
            &serde_json::to_vec(&[stream_frame(3, b"data")]).unwrap(),
        );
        p.receive_packet(&packet)?;
        assert!(!p.conn.is_closed());
        assert!(p.drain_events().is_empty());
        assert_eq!(p.conn.stats().packets_dropped, 1);
        Ok(())
    }

    #[test]
    fn drop_duplicate_packet() -> Result<()> {
        let mut p = TestPeer::server();
        let packet = p.packet(&[stream_frame(3, b"data")]);
        p.receive_packet(&packet)?;
        p.receive_packet(&packet)?;
        let events = p.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(p.conn.stats().packets_dropped, 1);
        assert_eq!(p.conn.stats().packets_received, 3);
        Ok(())
    }

    #[test]
    fn close_on_packet_far_away() {
        let mut p = TestPeer::server();
        let packet = p.packet_with_seq(10_000, &[stream_frame(3, b"data")]);
        assert_eq!(p.receive_packet(&packet), Err(Error::InvalidPacketHeader));
        assert_eq!(
            p.local_error_code(),
            Some(Error::InvalidPacketHeader.to_wire())
        );

        // The close packet is sent.
        let frames = p.last_frames();
        assert!(frames
            .iter()
            .any(|f| matches!(f, Frame::ConnectionClose(c) if c.error_code == Error::InvalidPacketHeader.to_wire())));
        assert_eq!(
            p.receive(&[stream_frame(3, b"data")]),
            Err(Error::Done)
        );
    }

    #[test]
    fn ack_acknowledges_sent_packets() -> Result<()> {
        let mut p = TestPeer::server();
        p.conn.send_stream_data(3, 0, Bytes::from_static(b"data"), false)?;
        assert!(p.conn.sent_packet_manager().has_in_flight_packets());
        assert!(p.conn.timeout() < Some(Duration::from_secs(1)));

        let ack = p.ack(2, &[]);
        p.receive(&[Frame::Ack(ack)])?;
        assert!(!p.conn.is_closed());
        assert!(!p.conn.sent_packet_manager().has_unacked_packets());
        assert_eq!(p.conn.received_packet_manager().peer_largest_observed_packet(), 2);
        // Only the idle timeout is left.
        assert!(p.conn.timeout() > Some(Duration::from_secs(1)));
        Ok(())
    }

    #[test]
    fn invalid_ack_frames() -> Result<()> {
        let invalid_ack = |make: &dyn Fn(&TestPeer) -> Vec<AckFrame>| -> Result<()> {
            let mut p = TestPeer::server();
            p.conn.send_stream_data(3, 0, Bytes::from_static(b"one"), false)?;
            p.conn.send_stream_data(3, 3, Bytes::from_static(b"two"), false)?;
            let acks = make(&p);
            let last = acks.len() - 1;
            for (i, ack) in acks.into_iter().enumerate() {
                let result = p.receive(&[Frame::Ack(ack)]);
                if i < last {
                    assert_eq!(result, Ok(()));
                } else {
                    assert_eq!(result, Err(Error::InvalidAckData));
                }
            }
            assert_eq!(p.local_error_code(), Some(Error::InvalidAckData.to_wire()));
            Ok(())
        };

        // Acks a packet never sent. The ack packet of the handshake was
        // packet 1, the data packets are 2 and 3.
        invalid_ack(&|p: &TestPeer| vec![p.ack(4, &[])])?;

        // Wrong entropy.
        invalid_ack(&|p: &TestPeer| {
            let mut ack = p.ack(3, &[]);
            ack.entropy_hash ^= 0x01 << 3;
            vec![ack]
        })?;

        // Largest observed goes backwards.
        invalid_ack(&|p: &TestPeer| vec![p.ack(3, &[]), p.ack(2, &[])])?;

        // Missing packet above the largest observed.
        invalid_ack(&|p: &TestPeer| {
            let mut ack = p.ack(2, &[]);
            ack.missing_packets.insert(3);
            vec![ack]
        })?;

        // Missing packet the peer said it got.
        invalid_ack(&|p: &TestPeer| vec![p.ack(2, &[]), p.ack(3, &[1])])?;

        // Revived packet not missing.
        invalid_ack(&|p: &TestPeer| {
            let mut ack = p.ack(3, &[]);
            ack.revived_packets.insert(2);
            vec![ack]
        })?;
        Ok(())
    }

    #[test]
    fn old_ack_ignored() -> Result<()> {
        let mut p = TestPeer::server();
        p.conn.send_stream_data(3, 0, Bytes::from_static(b"data"), false)?;

        let late = p.packet(&[Frame::Ack(p.ack(100, &[]))]);
        p.receive(&[Frame::Ack(p.ack(2, &[]))])?;
        // Sent before the accepted ack, its bogus ack does not matter.
        p.receive_packet(&late)?;
        assert!(!p.conn.is_closed());
        Ok(())
    }

    #[test]
    fn invalid_stop_waiting_frames() -> Result<()> {
        // Above the sequence number of its own packet.
        let mut p = TestPeer::server();
        let frame = Frame::StopWaiting(StopWaitingFrame {
            least_unacked: 5,
            entropy_hash: 0,
        });
        assert_eq!(p.receive(&[frame]), Err(Error::InvalidStopWaitingData));
        assert_eq!(
            p.local_error_code(),
            Some(Error::InvalidStopWaitingData.to_wire())
        );

        // Going backwards.
        let mut p = TestPeer::server();
        p.next_seq = 3;
        let frame = |least_unacked| {
            Frame::StopWaiting(StopWaitingFrame {
                least_unacked,
                entropy_hash: 0,
            })
        };
        p.receive(&[frame(3)])?;
        assert!(!p.conn.received_packet_manager().is_awaiting_packet(2));
        assert_eq!(p.receive(&[frame(2)]), Err(Error::InvalidStopWaitingData));

        // A stop-waiting in a packet older than the last one is ignored.
        let mut p = TestPeer::server();
        let early = p.packet_with_seq(5, &[frame(1)]);
        let packet = p.packet_with_seq(6, &[frame(4)]);
        p.receive_packet(&packet)?;
        p.receive_packet(&early)?;
        assert!(!p.conn.is_closed());
        assert_eq!(
            p.conn.received_packet_manager().peer_least_packet_awaiting_ack(),
            4
        );
        Ok(())
    }

    #[test]
    fn fec_revives_lost_packet() -> Result<()> {
        let mut p = TestPeer::server();
        let fec_packet = |p: &TestPeer, seq: u64, payload: &[u8]| {
            let mut header = p.header(seq);
            header.fec_group = 2;
            header.fec_flag = true;
            encode(EncryptionLevel::Unencrypted, &header, payload)
        };
        let protected = |p: &TestPeer, seq: u64, frames: &[Frame]| {
            let payload = serde_json::to_vec(frames).unwrap();
            let mut header = p.header(seq);
            header.fec_group = 2;
            (encode(EncryptionLevel::Unencrypted, &header, &payload), payload)
        };

        let lost = [stream_frame(3, b"lost in transit")];
        let (_, payload2) = protected(&p, 2, &lost);
        let (packet3, payload3) = protected(&p, 3, &[stream_frame(5, b"ok")]);
        let packet4 = fec_packet(&p, 4, &xor(&payload2, &payload3));

        p.receive_packet(&packet3)?;
        p.drain_events();
        p.receive_packet(&packet4)?;
        assert_eq!(p.conn.stats().packets_revived, 1);
        assert_eq!(p.drain_events(), vec![Event::StreamFrame(match &lost[0] {
            Frame::Stream(f) => f.clone(),
            _ => unreachable!(),
        })]);

        // The revived packet is reported in the ack.
        let ack = has_ack(&p.last_frames()).cloned().unwrap();
        assert_eq!(ack.largest_observed, 4);
        assert!(ack.revived_packets.contains(&2));
        assert!(ack.missing_packets.contains(&2));

        // The original copy is not processed twice.
        let (packet2, _) = protected(&p, 2, &lost);
        p.receive_packet(&packet2)?;
        assert!(p.drain_events().is_empty());
        Ok(())
    }

    #[test]
    fn fec_packets_sent() -> Result<()> {
        let mut conf = TestPeer::default_config();
        conf.set_max_packets_per_fec_group(2);
        let mut p = TestPeer::server_with_config(&conf);

        p.conn.send_stream_frames(vec![
            StreamFrame::new(3, false, 0, Bytes::from_static(b"first")),
            StreamFrame::new(3, false, 5, Bytes::from_static(b"second")),
            StreamFrame::new(3, false, 11, Bytes::from_static(b"third")),
        ])?;

        let written = p.written();
        let seqs: Vec<(u64, bool, u64)> = written
            .iter()
            .map(|(h, _)| (h.sequence_number, h.fec_flag, h.fec_group))
            .collect();
        // The ack of the handshake took packet 1.
        assert_eq!(
            seqs,
            vec![
                (2, false, 2),
                (3, false, 2),
                (4, true, 2),
                (5, false, 5),
                (6, true, 5)
            ]
        );
        assert_eq!(written[2].1, xor(&written[0].1, &written[1].1));
        assert_eq!(written[4].1, written[3].1);

        // FEC packets are tracked but hold nothing to retransmit.
        assert!(p.conn.sent_packet_manager().is_unacked(4));
        assert!(!p.conn.sent_packet_manager().has_retransmittable_frames(4));
        Ok(())
    }

    #[test]
    fn delayed_ack() -> Result<()> {
        let mut p = TestPeer::server();
        p.receive(&[stream_frame(3, b"data")])?;
        assert!(p.written().is_empty());
        assert_eq!(p.conn.timeout(), Some(Duration::from_millis(25)));

        p.advance(Duration::from_millis(25));
        p.conn.on_timeout();
        let frames = p.last_frames();
        assert_eq!(has_ack(&frames).map(|a| a.largest_observed), Some(2));
        assert!(frames
            .iter()
            .any(|f| matches!(f, Frame::CongestionFeedback(CongestionFeedbackFrame::Tcp { .. }))));
        assert!(frames.iter().any(|f| matches!(f, Frame::StopWaiting(_))));
        Ok(())
    }

    #[test]
    fn crypto_data_acked_at_once() -> Result<()> {
        let mut p = TestPeer::server();
        p.receive(&[stream_frame(CRYPTO_STREAM_ID, b"CHLO")])?;
        assert_eq!(p.conn.timeout(), Some(Duration::ZERO));
        p.conn.on_timeout();
        assert_eq!(p.written().len(), 1);
        Ok(())
    }

    #[test]
    fn second_packet_acked_at_once() -> Result<()> {
        let mut p = TestPeer::server();
        let rst = Frame::RstStream(RstStreamFrame {
            stream_id: 3,
            error_code: 6,
            bytes_written: 100,
        });
        p.receive(&[rst.clone()])?;
        assert!(p.written().is_empty());
        assert!(matches!(p.drain_events()[..], [Event::RstStream(_)]));

        p.receive(&[rst])?;
        assert_eq!(has_ack(&p.last_frames()).map(|a| a.largest_observed), Some(3));
        Ok(())
    }

    #[test]
    fn missing_packet_acked_at_once() -> Result<()> {
        let mut p = TestPeer::server();
        let packet3 = p.packet_with_seq(3, &[stream_frame(3, b"three")]);
        p.receive_packet(&packet3)?;
        let ack = has_ack(&p.last_frames()).cloned().unwrap();
        assert_eq!(ack.largest_observed, 3);
        assert_eq!(ack.missing_packets, BTreeSet::from([2]));

        // Filling the gap is acked at once too.
        let packet2 = p.packet_with_seq(2, &[stream_frame(3, b"two")]);
        p.receive_packet(&packet2)?;
        let ack = has_ack(&p.last_frames()).cloned().unwrap();
        assert!(ack.missing_packets.is_empty());
        assert_eq!(p.written().len(), 2);
        Ok(())
    }

    #[test]
    fn data_bundles_pending_ack() -> Result<()> {
        let mut p = TestPeer::server();
        p.receive(&[stream_frame(3, b"request")])?;
        p.conn
            .send_stream_data(3, 0, Bytes::from_static(b"response"), false)?;
        let frames = p.last_frames();
        assert_eq!(frames.len(), 4);
        assert!(matches!(frames[0], Frame::Ack(_)));
        assert!(matches!(frames[3], Frame::Stream(_)));

        // Nothing left to ack.
        p.advance(Duration::from_millis(25));
        p.conn.on_timeout();
        assert_eq!(p.written().len(), 1);
        Ok(())
    }

    #[test]
    fn write_blocked() -> Result<()> {
        let mut p = TestPeer::server();
        p.writer.borrow_mut().socket_full = true;
        p.conn.send_stream_frames(vec![
            StreamFrame::new(3, false, 0, Bytes::from_static(b"one")),
            StreamFrame::new(3, false, 3, Bytes::from_static(b"two")),
            StreamFrame::new(3, false, 6, Bytes::from_static(b"three")),
        ])?;
        assert_eq!(p.conn.num_queued_packets(), 1);
        assert_eq!(p.drain_events(), vec![Event::WriteBlocked]);
        assert!(p.written().is_empty());

        p.writer.borrow_mut().socket_full = false;
        p.conn.on_can_write();
        let seqs: Vec<u64> = p.written().iter().map(|(h, _)| h.sequence_number).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert_eq!(p.conn.num_queued_packets(), 0);
        assert_eq!(p.drain_events(), vec![Event::CanWrite]);
        Ok(())
    }

    #[test]
    fn close_skips_queued_packets() -> Result<()> {
        let mut p = TestPeer::server();
        p.writer.borrow_mut().socket_full = true;
        p.conn.send_stream_data(3, 0, Bytes::from_static(b"data"), false)?;
        assert_eq!(p.conn.num_queued_packets(), 1);

        // Room again, the writer was not told yet.
        p.writer.borrow_mut().socket_full = false;
        p.conn.close(Error::PeerGoingAway, "bye")?;
        assert_eq!(p.conn.num_queued_packets(), 0);

        let written = p.written_frames();
        assert_eq!(written.len(), 1);
        assert!(written[0].1.iter().any(|f| matches!(
            f,
            Frame::ConnectionClose(c) if c.error_code == Error::PeerGoingAway.to_wire() && c.details == "bye"
        )));

        let events = p.drain_events();
        match events.last() {
            Some(Event::Closed(e)) => {
                assert!(!e.from_peer);
                assert_eq!(e.error(), Error::PeerGoingAway);
            }
            e => panic!("unexpected event {:?}", e),
        }
        assert_eq!(p.conn.close(Error::PeerGoingAway, "again"), Err(Error::Done));
        assert_eq!(p.conn.timeout(), None);
        Ok(())
    }

    #[test]
    fn write_error_closes() {
        let mut p = TestPeer::server();
        p.writer.borrow_mut().fail = true;
        assert_eq!(
            p.conn.send_stream_data(3, 0, Bytes::from_static(b"data"), false),
            Ok(())
        );
        assert!(p.conn.is_closed());
        assert_eq!(p.local_error_code(), Some(Error::PacketWriteError.to_wire()));
        assert!(matches!(p.drain_events()[..], [Event::Closed(_)]));
    }

    #[test]
    fn peer_close() {
        let mut p = TestPeer::server();
        let close = Frame::ConnectionClose(ConnectionCloseFrame {
            error_code: Error::PeerGoingAway.to_wire(),
            details: "shutdown".into(),
        });
        assert_eq!(p.receive(&[close]), Err(Error::PeerGoingAway));
        let err = p.conn.peer_error().unwrap();
        assert!(err.from_peer);
        assert_eq!(err.reason, b"shutdown".to_vec());
        assert!(p.conn.local_error().is_none());
        // Nothing sent back.
        assert!(p.written().is_empty());
    }

    #[test]
    fn public_reset() {
        let mut p = TestPeer::server();
        let reset = PublicResetPacket {
            connection_id: CID,
            nonce_proof: 7,
            rejected_sequence_number: 1,
        };
        let mut packet = vec![b'R'];
        packet.extend(serde_json::to_vec(&reset).unwrap());
        assert_eq!(p.receive_packet(&packet), Err(Error::PublicReset));
        assert!(p.conn.peer_error().is_some());
    }

    #[test]
    fn idle_timeout() -> Result<()> {
        let mut conf = TestPeer::default_config();
        conf.set_idle_timeout(1000);
        let mut p = TestPeer::server_with_config(&conf);
        // The alarm was armed when the connection was created.
        assert_eq!(p.conn.timeout(), Some(Duration::from_millis(975)));

        // Activity pushes the deadline.
        p.advance(Duration::from_millis(600));
        p.receive(&[Frame::Ping])?;
        p.advance(Duration::from_millis(400));
        p.conn.on_timeout();
        assert!(!p.conn.is_closed());
        assert_eq!(p.conn.timeout(), Some(Duration::from_millis(600)));

        p.advance(Duration::from_millis(600));
        p.conn.on_timeout();
        assert!(p.conn.is_closed());
        assert!(p.conn.is_idle_timeout());
        assert_eq!(
            p.local_error_code(),
            Some(Error::ConnectionTimedOut.to_wire())
        );
        assert_eq!(p.conn.timeout(), None);
        Ok(())
    }

    #[test]
    fn overall_timeout() {
        let mut conf = TestPeer::default_config();
        conf.set_overall_timeout(500);
        let mut p = TestPeer::new(false, &conf);
        assert_eq!(p.conn.timeout(), Some(Duration::from_millis(500)));
        p.advance(Duration::from_millis(500));
        p.conn.on_timeout();
        assert_eq!(
            p.local_error_code(),
            Some(Error::ConnectionOverallTimedOut.to_wire())
        );
        assert!(!p.conn.is_idle_timeout());
    }

    #[test]
    fn retransmission_alarm() -> Result<()> {
        let mut p = TestPeer::server();
        p.conn.send_stream_data(3, 0, Bytes::from_static(b"data"), false)?;
        let sent = p.last_frames();

        let delay = p.conn.timeout().unwrap();
        p.advance(delay);
        p.conn.on_timeout();

        let written = p.written_frames();
        assert_eq!(written.len(), 2);
        assert_eq!(written[1].0, 3);
        assert_eq!(written[1].1, vec![sent[0].clone()]);
        assert_eq!(p.conn.stats().packets_retransmitted, 1);
        Ok(())
    }

    #[test]
    fn undecryptable_packets_buffered() -> Result<()> {
        let mut conf = TestPeer::default_config();
        conf.set_max_undecryptable_packets(2);
        let mut p = TestPeer::server_with_config(&conf);

        let mut encrypted = Vec::new();
        for data in [&b"one"[..], b"two", b"three"] {
            let seq = p.next_seq;
            p.next_seq += 1;
            let payload = serde_json::to_vec(&[stream_frame(3, data)]).unwrap();
            encrypted.push(encode(EncryptionLevel::ForwardSecure, &p.header(seq), &payload));
        }
        for packet in &encrypted {
            p.receive_packet(packet)?;
        }
        assert_eq!(p.conn.num_undecryptable_packets(), 2);
        assert_eq!(p.conn.stats().packets_dropped, 1);
        assert!(p.drain_events().is_empty());

        p.keys.set(EncryptionLevel::ForwardSecure);
        p.conn.set_encryption_level(EncryptionLevel::ForwardSecure);
        assert_eq!(p.conn.num_undecryptable_packets(), 0);
        let events = p.drain_events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(e, Event::StreamFrame(_))));
        Ok(())
    }
}

pub mod entropy;
pub mod fec;
pub mod received_packet_manager;
pub mod rtt;
pub mod sent_packet_manager;
pub mod timer;
pub mod unacked;
