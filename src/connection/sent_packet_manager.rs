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
use std::time::Duration;
use std::time::Instant;

use log::*;

use super::rtt::RttEstimator;
use super::unacked::UnackedPacketMap;
use crate::congestion_control;
use crate::congestion_control::Bandwidth;
use crate::congestion_control::SendAlgorithm;
use crate::frame::AckFrame;
use crate::frame::CongestionFeedbackFrame;
use crate::frame::RetransmittableFrames;
use crate::packet::EncryptionLevel;
use crate::packet::SequenceNumberLength;
use crate::packet::SerializedPacket;
use crate::packet::TransmissionType;
use crate::Error;
use crate::RecoveryConfig;
use crate::Result;

/// Nacks needed before a packet is declared lost.
const NUMBER_OF_NACKS_BEFORE_RETRANSMISSION: u64 = 3;

const MIN_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(10);

const MIN_TAIL_LOSS_PROBE_TIMEOUT: Duration = Duration::from_millis(10);

/// The retransmission timeout doubles at most this many times.
const MAX_RETRANSMISSION_BACKOFFS: u32 = 10;

/// What the retransmission alarm does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetransmissionMode {
    /// Retransmit the crypto handshake packets.
    Handshake,

    /// Retransmit the oldest packet as a probe.
    TailLossProbe,

    /// Retransmit the oldest packets and abandon everything in flight.
    Rto,
}

/// A packet whose frames are waiting to be sent again.
#[derive(Debug)]
pub struct PendingRetransmission<'a> {
    pub sequence_number: u64,

    pub transmission_type: TransmissionType,

    pub retransmittable_frames: &'a RetransmittableFrames,

    /// Sequence number length of the lost transmission.
    pub sequence_number_length: SequenceNumberLength,
}

/// Loss recovery statistics.
#[derive(Debug, Default, Clone)]
pub struct RecoveryStats {
    /// Packets declared lost.
    pub packets_lost: u64,

    /// Bytes declared lost.
    pub bytes_lost: u64,

    /// Retransmissions sent.
    pub packets_retransmitted: u64,

    /// Retransmissions whose original was acked after all.
    pub spurious_retransmissions: u64,

    /// Retransmission timeouts.
    pub rto_count: u64,

    /// Tail loss probes.
    pub tlp_count: u64,

    /// Crypto handshake retransmission timeouts.
    pub crypto_retransmit_count: u64,
}

/// Bookkeeping of sent packets: acks, losses, retransmissions and the
/// retransmission alarm. It owns the send algorithm and feeds it.
#[derive(Debug)]
pub struct SentPacketManager {
    is_server: bool,

    unacked_packets: UnackedPacketMap,

    /// Packets to retransmit, oldest first.
    pending_retransmissions: BTreeMap<u64, TransmissionType>,

    rtt: RttEstimator,

    send_algorithm: Box<dyn SendAlgorithm>,

    /// Retransmission timeouts since the last ack.
    consecutive_rto_count: u32,

    /// Tail loss probes since the last ack.
    consecutive_tlp_count: usize,

    /// Handshake retransmissions since the last ack.
    consecutive_crypto_retransmission_count: u32,

    max_tail_loss_probes: usize,

    max_rto_packets: usize,

    min_rto: Duration,

    max_rto: Duration,

    /// When the retransmission alarm should fire.
    retransmission_deadline: Option<Instant>,

    stats: RecoveryStats,

    trace_id: String,
}

impl SentPacketManager {
    pub fn new(is_server: bool, conf: &RecoveryConfig) -> Self {
        Self::with_send_algorithm(
            is_server,
            conf,
            congestion_control::build_send_algorithm(conf),
        )
    }

    pub fn with_send_algorithm(
        is_server: bool,
        conf: &RecoveryConfig,
        send_algorithm: Box<dyn SendAlgorithm>,
    ) -> Self {
        SentPacketManager {
            is_server,
            unacked_packets: UnackedPacketMap::new(),
            pending_retransmissions: BTreeMap::new(),
            rtt: RttEstimator::new(conf.initial_rtt),
            send_algorithm,
            consecutive_rto_count: 0,
            consecutive_tlp_count: 0,
            consecutive_crypto_retransmission_count: 0,
            max_tail_loss_probes: conf.max_tail_loss_probes,
            max_rto_packets: conf.max_rto_packets,
            min_rto: conf.min_rto,
            max_rto: conf.max_rto,
            retransmission_deadline: None,
            stats: RecoveryStats::default(),
            trace_id: String::new(),
        }
    }

    /// Set trace id.
    pub fn set_trace_id(&mut self, trace_id: &str) {
        self.trace_id = trace_id.to_string();
    }

    /// Track a packet built by the framer. Packets with neither
    /// retransmittable frames nor FEC data are not tracked.
    pub fn on_serialized_packet(&mut self, packet: SerializedPacket) -> bool {
        if !packet.has_payload() {
            return false;
        }
        let seq = packet.sequence_number;
        if let Err(e) = self.unacked_packets.add_packet(packet) {
            error!("{} packet {} serialized twice: {:?}", self.trace_id, seq, e);
            return false;
        }
        true
    }

    /// Track `new_seq` as the retransmission of the pending `old_seq`, moving
    /// the frames over.
    pub fn on_retransmitted_packet(
        &mut self,
        old_seq: u64,
        new_seq: u64,
        sequence_number_length: SequenceNumberLength,
    ) -> Result<()> {
        let transmission_type = self
            .pending_retransmissions
            .remove(&old_seq)
            .ok_or(Error::InternalError)?;
        self.unacked_packets.on_retransmitted_packet(
            old_seq,
            new_seq,
            sequence_number_length,
            transmission_type,
        )?;
        self.stats.packets_retransmitted += 1;
        trace!(
            "{} RETRANSMIT {} as {} {:?}",
            self.trace_id,
            old_seq,
            new_seq,
            transmission_type
        );
        Ok(())
    }

    /// A packet was written. Returns whether it counts against the
    /// congestion window.
    pub fn on_packet_sent(
        &mut self,
        seq: u64,
        sent_time: Instant,
        bytes: u64,
        transmission_type: TransmissionType,
        has_retransmittable_data: bool,
    ) -> bool {
        // Packets without payload are not tracked.
        if !self.unacked_packets.is_unacked(seq) {
            return false;
        }

        let bytes_in_flight = self.unacked_packets.bytes_in_flight();
        let in_flight = self.send_algorithm.on_packet_sent(
            sent_time,
            bytes_in_flight,
            seq,
            bytes,
            has_retransmittable_data,
        );
        let first_in_flight = !self.unacked_packets.has_in_flight_packets();
        self.unacked_packets
            .set_sent(seq, sent_time, bytes, in_flight);

        trace!(
            "now={:?} {} {} ON_SENT seq={} bytes={} type={:?} inflight={} cwnd={}",
            sent_time,
            self.trace_id,
            self.send_algorithm.name(),
            seq,
            bytes,
            transmission_type,
            self.unacked_packets.bytes_in_flight(),
            self.send_algorithm.congestion_window()
        );

        // The RTO is measured from the first packet in flight, the other
        // modes restart with each packet.
        if in_flight && (first_in_flight || self.retransmission_mode() != RetransmissionMode::Rto)
        {
            self.update_retransmission_deadline(sent_time);
        }
        in_flight
    }

    /// Process an ack frame from the peer. Returns the number of packets and
    /// bytes declared lost.
    pub fn on_incoming_ack(&mut self, ack: &AckFrame, ack_receive_time: Instant) -> Result<(u64, u64)> {
        if ack.largest_observed < self.unacked_packets.largest_observed() {
            error!(
                "{} largest observed decreased from {} to {}",
                self.trace_id,
                self.unacked_packets.largest_observed(),
                ack.largest_observed
            );
            return Err(Error::InvalidAckData);
        }

        self.maybe_update_rtt(ack, ack_receive_time);
        self.unacked_packets
            .increase_largest_observed(ack.largest_observed);

        let newly_acked = self.handle_ack_for_sent_packets(ack, ack_receive_time);

        // The peer has the data of revived packets.
        for &seq in &ack.revived_packets {
            self.mark_packet_revived(seq);
        }

        let (mut lost_packets, mut lost_bytes) = self.detect_lost_packets(ack_receive_time);

        if ack.is_truncated {
            let (packets, bytes) = self.handle_truncated_ack(ack, ack_receive_time);
            lost_packets += packets;
            lost_bytes += bytes;
        }

        // Forward progress resets the backoff.
        if newly_acked > 0 {
            self.consecutive_rto_count = 0;
            self.consecutive_tlp_count = 0;
            self.consecutive_crypto_retransmission_count = 0;
        }

        self.update_retransmission_deadline(ack_receive_time);
        Ok((lost_packets, lost_bytes))
    }

    fn maybe_update_rtt(&mut self, ack: &AckFrame, ack_receive_time: Instant) -> bool {
        // Only the first ack of the largest observed packet gives a sample.
        let sent_time = match self
            .unacked_packets
            .get(ack.largest_observed)
            .and_then(|i| i.sent_time)
        {
            Some(t) => t,
            None => return false,
        };
        let send_delta = ack_receive_time.saturating_duration_since(sent_time);
        if !self.rtt.update(send_delta, ack.delta_time_largest_observed) {
            return false;
        }
        self.send_algorithm.on_rtt_updated(&self.rtt);
        trace!(
            "{} RTT_UPDATED latest={:?} srtt={:?} rttvar={:?}",
            self.trace_id,
            self.rtt.latest_rtt(),
            self.rtt.smoothed_rtt(),
            self.rtt.rttvar()
        );
        true
    }

    /// Ack the packets the peer received and count nacks of the others.
    /// Returns the number of newly acked packets.
    fn handle_ack_for_sent_packets(&mut self, ack: &AckFrame, now: Instant) -> u64 {
        let mut newly_acked = 0;
        for seq in self
            .unacked_packets
            .sequence_numbers_up_to(ack.largest_observed)
        {
            if ack.is_awaiting_packet(seq) {
                let (sent, tracked) = match self.unacked_packets.get(seq) {
                    Some(i) => (i.sent_time.is_some(), i.in_flight || i.has_retransmittable_frames()),
                    None => continue,
                };
                if !sent {
                    continue;
                }
                // Nothing depends on the packet any more.
                if !tracked {
                    self.unacked_packets.remove_if_useless(seq);
                    continue;
                }
                // A gap to the largest observed counts as several nacks, so
                // reordering is tolerated but stretch acks still work.
                self.unacked_packets
                    .nack_packet(seq, ack.largest_observed - seq);
                continue;
            }

            self.on_packet_acked(seq, now);
            newly_acked += 1;
        }
        newly_acked
    }

    fn on_packet_acked(&mut self, seq: u64, now: Instant) {
        let prior_in_flight = self.unacked_packets.bytes_in_flight();
        let (in_flight, bytes) = match self.unacked_packets.get(seq) {
            Some(i) => (i.in_flight, i.bytes_sent),
            None => return,
        };
        if in_flight {
            self.send_algorithm
                .on_packet_acked(seq, bytes, prior_in_flight, now);
            self.unacked_packets.remove_from_in_flight(seq);
        }
        trace!(
            "now={:?} {} {} ON_ACK seq={} inflight={} cwnd={}",
            now,
            self.trace_id,
            self.send_algorithm.name(),
            seq,
            self.unacked_packets.bytes_in_flight(),
            self.send_algorithm.congestion_window()
        );
        self.mark_packet_handled(seq);
    }

    /// The logical packet of `seq` was received by the peer, so none of its
    /// transmissions needs a retransmission.
    fn mark_packet_handled(&mut self, seq: u64) {
        let newest = self.unacked_packets.newest_transmission(seq);
        self.pending_retransmissions.remove(&newest);

        if newest != seq {
            self.stats.spurious_retransmissions += 1;
            debug!(
                "{} spurious retransmission {} of {}",
                self.trace_id, newest, seq
            );

            // Crypto retransmissions won't be acked now that one was.
            let crypto = self
                .unacked_packets
                .get(newest)
                .map_or(false, |i| i.has_crypto_handshake());
            if crypto {
                self.abandon(newest);
            }
        }
        self.unacked_packets.remove_retransmittability(seq);
    }

    fn mark_packet_revived(&mut self, seq: u64) {
        if !self.unacked_packets.is_unacked(seq) {
            return;
        }
        let newest = self.unacked_packets.newest_transmission(seq);
        self.pending_retransmissions.remove(&newest);
        self.unacked_packets.remove_retransmittability(seq);
        debug!("{} packet {} revived by the peer", self.trace_id, seq);
    }

    /// Declare lost the packets nacked often enough, and the nacked ones once
    /// the largest sent packet is acked. Packets an RTO took out of flight
    /// are queued again the same way if they still own frames.
    fn detect_lost_packets(&mut self, now: Instant) -> (u64, u64) {
        let largest_observed = self.unacked_packets.largest_observed();
        let largest_sent = self.unacked_packets.largest_sent_packet();

        let mut lost = Vec::new();
        for (&seq, info) in self.unacked_packets.iter() {
            if seq >= largest_observed {
                break;
            }
            if !info.in_flight
                && (!info.has_retransmittable_frames()
                    || self.pending_retransmissions.contains_key(&seq))
            {
                continue;
            }
            if info.nack_count >= NUMBER_OF_NACKS_BEFORE_RETRANSMISSION {
                lost.push(seq);
                continue;
            }

            // Early retransmit: nothing sent later can trigger more nacks.
            if largest_sent == largest_observed
                && info.nack_count > 0
                && info.has_retransmittable_frames()
            {
                lost.push(seq);
            }
        }

        let mut lost_bytes = 0;
        for &seq in &lost {
            lost_bytes += self.on_packet_lost(seq, now);
        }
        (lost.len() as u64, lost_bytes)
    }

    /// Returns the bytes the packet had in flight.
    fn on_packet_lost(&mut self, seq: u64, now: Instant) -> u64 {
        let (in_flight, bytes) = match self.unacked_packets.get(seq) {
            Some(i) => (i.in_flight, i.bytes_sent),
            None => return 0,
        };

        if in_flight {
            let prior_in_flight = self.unacked_packets.bytes_in_flight();
            self.send_algorithm.on_packet_lost(seq, prior_in_flight, now);
            self.send_algorithm.on_packet_abandoned(seq, bytes);
            self.unacked_packets.remove_from_in_flight(seq);
            self.stats.packets_lost += 1;
            self.stats.bytes_lost += bytes;
        }

        debug!(
            "now={:?} {} {} ON_LOST seq={} inflight={} cwnd={}",
            now,
            self.trace_id,
            self.send_algorithm.name(),
            seq,
            self.unacked_packets.bytes_in_flight(),
            self.send_algorithm.congestion_window()
        );

        if !self.mark_for_retransmission(seq, TransmissionType::NackRetransmission) {
            self.unacked_packets.remove_if_useless(seq);
        }
        if in_flight {
            bytes
        } else {
            0
        }
    }

    /// The peer could not list all missing packets. Forget old transmissions
    /// so the least unacked packet rises, and lose the earliest missing one.
    fn handle_truncated_ack(&mut self, ack: &AckFrame, now: Instant) -> (u64, u64) {
        let cleared = self
            .unacked_packets
            .clear_previous_retransmissions(ack.missing_packets.len() / 2);

        let least_unacked = self.unacked_packets.least_unacked();
        debug!(
            "{} truncated ack cleared {} packets least_unacked={}",
            self.trace_id, cleared, least_unacked
        );
        if !ack.missing_packets.contains(&least_unacked)
            || self.pending_retransmissions.contains_key(&least_unacked)
        {
            return (0, 0);
        }
        let tracked = self
            .unacked_packets
            .get(least_unacked)
            .map_or(false, |i| i.in_flight || i.has_retransmittable_frames());
        if !tracked {
            return (0, 0);
        }
        (1, self.on_packet_lost(least_unacked, now))
    }

    /// Stop counting the packet in flight without it being acked.
    fn abandon(&mut self, seq: u64) {
        let bytes = match self.unacked_packets.get(seq) {
            Some(i) if i.in_flight => i.bytes_sent,
            _ => return,
        };
        self.send_algorithm.on_packet_abandoned(seq, bytes);
        self.unacked_packets.remove_from_in_flight(seq);
    }

    /// Queue the frames of `seq` for retransmission. Fails if the packet has
    /// none, e.g. because it was acked or retransmitted already.
    pub fn mark_for_retransmission(&mut self, seq: u64, transmission_type: TransmissionType) -> bool {
        if !self.unacked_packets.has_retransmittable_frames(seq) {
            return false;
        }
        // Probes stay in flight.
        if transmission_type != TransmissionType::TlpRetransmission {
            self.abandon(seq);
        }
        self.pending_retransmissions
            .entry(seq)
            .or_insert(transmission_type);
        true
    }

    /// Queue every packet owning frames for retransmission, e.g. because
    /// they were sent with a version the peer does not speak.
    pub fn retransmit_unacked_packets(&mut self) {
        for seq in self
            .unacked_packets
            .sequence_numbers_up_to(u64::MAX)
        {
            if !self.mark_for_retransmission(seq, TransmissionType::AllUnackedRetransmission) {
                self.abandon(seq);
                self.unacked_packets.remove_if_useless(seq);
            }
        }
        if !self.unacked_packets.has_in_flight_packets() {
            self.retransmission_deadline = None;
        }
    }

    /// The retransmission alarm fired.
    pub fn on_retransmission_timeout(&mut self, now: Instant) {
        if !self.unacked_packets.has_in_flight_packets() {
            return;
        }

        match self.retransmission_mode() {
            RetransmissionMode::Handshake => {
                self.stats.crypto_retransmit_count += 1;
                self.retransmit_crypto_packets();
            }
            RetransmissionMode::TailLossProbe => {
                self.stats.tlp_count += 1;
                self.retransmit_oldest_packet();
            }
            RetransmissionMode::Rto => {
                self.stats.rto_count += 1;
                self.retransmit_all_packets();
            }
        }
        self.update_retransmission_deadline(now);
    }

    fn retransmit_crypto_packets(&mut self) {
        self.consecutive_crypto_retransmission_count += 1;
        let crypto: Vec<u64> = self
            .unacked_packets
            .iter()
            .filter(|(_, i)| i.in_flight && i.has_crypto_handshake())
            .map(|(&seq, _)| seq)
            .collect();

        debug!(
            "{} handshake timeout, retransmitting {:?}",
            self.trace_id, crypto
        );
        for seq in crypto {
            self.mark_for_retransmission(seq, TransmissionType::HandshakeRetransmission);
        }
    }

    fn retransmit_oldest_packet(&mut self) {
        self.consecutive_tlp_count += 1;
        let oldest = self
            .unacked_packets
            .iter()
            .find(|(_, i)| i.has_retransmittable_frames())
            .map(|(&seq, _)| seq);

        match oldest {
            Some(seq) => {
                debug!("{} tail loss probe of {}", self.trace_id, seq);
                self.mark_for_retransmission(seq, TransmissionType::TlpRetransmission);
            }
            None => warn!("{} no packet for a tail loss probe", self.trace_id),
        }
    }

    fn retransmit_all_packets(&mut self) {
        let mut retransmitted = 0;
        for seq in self
            .unacked_packets
            .sequence_numbers_up_to(u64::MAX)
        {
            if retransmitted < self.max_rto_packets
                && self.unacked_packets.has_retransmittable_frames(seq)
            {
                self.mark_for_retransmission(seq, TransmissionType::RtoRetransmission);
                retransmitted += 1;
                continue;
            }
            self.abandon(seq);
            self.unacked_packets.remove_if_useless(seq);
        }

        self.send_algorithm
            .on_retransmission_timeout(retransmitted > 0);
        if retransmitted > 0 {
            self.consecutive_rto_count += 1;
        }
        debug!(
            "{} retransmission timeout {} retransmitted={} inflight={}",
            self.trace_id,
            self.consecutive_rto_count,
            retransmitted,
            self.unacked_packets.bytes_in_flight()
        );
    }

    /// Forget the unencrypted packets once the connection is forward secure.
    pub fn neuter_unencrypted_packets(&mut self) {
        let unencrypted: Vec<u64> = self
            .unacked_packets
            .iter()
            .filter(|(_, i)| {
                i.retransmittable_frames()
                    .map_or(false, |f| f.encryption_level() == EncryptionLevel::Unencrypted)
            })
            .map(|(&seq, _)| seq)
            .collect();

        for seq in unencrypted {
            self.pending_retransmissions.remove(&seq);
            self.abandon(seq);
            self.unacked_packets.remove_retransmittability(seq);
        }
        if !self.unacked_packets.has_in_flight_packets() {
            self.retransmission_deadline = None;
        }
    }

    pub fn retransmission_mode(&self) -> RetransmissionMode {
        if self.unacked_packets.has_pending_crypto_packets() {
            return RetransmissionMode::Handshake;
        }
        if self.consecutive_tlp_count < self.max_tail_loss_probes
            && self.unacked_packets.has_unacked_retransmittable_frames()
        {
            return RetransmissionMode::TailLossProbe;
        }
        RetransmissionMode::Rto
    }

    /// Delay of the next handshake retransmission.
    pub fn crypto_retransmission_delay(&self) -> Duration {
        let delay = cmp::max(MIN_HANDSHAKE_TIMEOUT, self.rtt.smoothed_rtt().mul_f64(1.5));
        delay * (1 << self.consecutive_crypto_retransmission_count.min(MAX_RETRANSMISSION_BACKOFFS))
    }

    /// Delay of the next tail loss probe.
    pub fn tail_loss_probe_delay(&self) -> Duration {
        let srtt = self.rtt.smoothed_rtt();
        if self.unacked_packets.num_in_flight_packets() == 1 {
            // Leave room for a delayed ack of a lone packet.
            return cmp::max(2 * srtt, srtt.mul_f64(1.5) + self.min_rto / 2);
        }
        cmp::max(MIN_TAIL_LOSS_PROBE_TIMEOUT, 2 * srtt)
    }

    /// Delay of the next retransmission timeout, including the backoff.
    pub fn retransmission_delay(&self) -> Duration {
        let mut delay = self.send_algorithm.retransmission_delay();
        if delay.is_zero() {
            delay = self.rtt.rto_base();
        }
        let delay = cmp::max(delay, self.min_rto)
            * (1 << self.consecutive_rto_count.min(MAX_RETRANSMISSION_BACKOFFS));
        cmp::min(delay, self.max_rto)
    }

    fn update_retransmission_deadline(&mut self, now: Instant) {
        self.retransmission_deadline = self.compute_retransmission_time(now);
    }

    fn compute_retransmission_time(&self, now: Instant) -> Option<Instant> {
        if !self.unacked_packets.has_in_flight_packets() {
            return None;
        }

        let deadline = match self.retransmission_mode() {
            RetransmissionMode::Handshake => now + self.crypto_retransmission_delay(),
            RetransmissionMode::TailLossProbe => {
                self.unacked_packets.last_in_flight_sent_time()? + self.tail_loss_probe_delay()
            }
            RetransmissionMode::Rto => {
                self.unacked_packets.first_in_flight_sent_time()? + self.retransmission_delay()
            }
        };
        Some(cmp::max(deadline, now))
    }

    /// When the retransmission alarm should fire, if any packet is in
    /// flight.
    pub fn retransmission_time(&self) -> Option<Instant> {
        self.retransmission_deadline
    }

    /// How long to wait before sending a packet of the given type.
    pub fn time_until_send(
        &mut self,
        now: Instant,
        transmission_type: TransmissionType,
        has_retransmittable_data: bool,
    ) -> Duration {
        // Probes and handshake retransmissions are not held back.
        if matches!(
            transmission_type,
            TransmissionType::TlpRetransmission | TransmissionType::HandshakeRetransmission
        ) {
            return Duration::ZERO;
        }
        self.send_algorithm.time_until_send(
            now,
            self.unacked_packets.bytes_in_flight(),
            has_retransmittable_data,
        )
    }

    pub fn on_incoming_congestion_feedback(
        &mut self,
        feedback: &CongestionFeedbackFrame,
        feedback_receive_time: Instant,
    ) {
        self.send_algorithm
            .on_incoming_congestion_feedback(feedback, feedback_receive_time);
    }

    pub fn has_pending_retransmissions(&self) -> bool {
        !self.pending_retransmissions.is_empty()
    }

    /// The oldest pending retransmission.
    pub fn next_pending_retransmission(&self) -> Option<PendingRetransmission<'_>> {
        self.pending_retransmissions
            .iter()
            .find_map(|(&seq, &transmission_type)| {
                let info = self.unacked_packets.get(seq)?;
                Some(PendingRetransmission {
                    sequence_number: seq,
                    transmission_type,
                    retransmittable_frames: info.retransmittable_frames()?,
                    sequence_number_length: info.sequence_number_length,
                })
            })
    }

    pub fn has_unacked_packets(&self) -> bool {
        !self.unacked_packets.is_empty()
    }

    pub fn is_unacked(&self, seq: u64) -> bool {
        self.unacked_packets.is_unacked(seq)
    }

    pub fn has_retransmittable_frames(&self, seq: u64) -> bool {
        self.unacked_packets.has_retransmittable_frames(seq)
    }

    /// The lowest sequence number the peer may still ack, announced in
    /// stop-waiting frames.
    pub fn least_unacked(&self) -> u64 {
        self.unacked_packets.least_unacked()
    }

    pub fn largest_observed(&self) -> u64 {
        self.unacked_packets.largest_observed()
    }

    pub fn largest_sent_packet(&self) -> u64 {
        self.unacked_packets.largest_sent_packet()
    }

    pub fn bytes_in_flight(&self) -> u64 {
        self.unacked_packets.bytes_in_flight()
    }

    pub fn has_in_flight_packets(&self) -> bool {
        self.unacked_packets.has_in_flight_packets()
    }

    pub fn congestion_window(&self) -> u64 {
        self.send_algorithm.congestion_window()
    }

    pub fn bandwidth_estimate(&self) -> Bandwidth {
        self.send_algorithm.bandwidth_estimate()
    }

    pub fn send_algorithm(&self) -> &dyn SendAlgorithm {
        self.send_algorithm.as_ref()
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn consecutive_rto_count(&self) -> u32 {
        self.consecutive_rto_count
    }

    pub fn consecutive_crypto_retransmission_count(&self) -> u32 {
        self.consecutive_crypto_retransmission_count
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn stats(&self) -> &RecoveryStats {
        &self.stats
    }
}
