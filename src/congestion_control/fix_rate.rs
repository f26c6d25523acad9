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

use std::time::Duration;
use std::time::Instant;

use log::*;

use super::Bandwidth;
use super::CongestionStats;
use super::SendAlgorithm;
use super::INFINITE_DELAY;
use crate::connection::rtt::RttEstimator;
use crate::frame::CongestionFeedbackFrame;

/// Delays shorter than this are not worth pacing.
const MAX_SCHEDULING_DELAY: Duration = Duration::from_millis(2);

/// A bucket draining at a constant rate.
#[derive(Debug, Clone)]
pub struct LeakyBucket {
    /// Bytes in the bucket at `time_last_updated`.
    bytes: u64,

    time_last_updated: Option<Instant>,

    draining_rate: Bandwidth,
}

impl LeakyBucket {
    pub fn new(draining_rate: Bandwidth) -> Self {
        LeakyBucket {
            bytes: 0,
            time_last_updated: None,
            draining_rate,
        }
    }

    pub fn set_draining_rate(&mut self, now: Instant, draining_rate: Bandwidth) {
        self.bytes = self.bytes_pending(now);
        self.time_last_updated = Some(now);
        self.draining_rate = draining_rate;
    }

    /// Add data to the bucket.
    pub fn add(&mut self, now: Instant, bytes: u64) {
        self.bytes = self.bytes_pending(now).saturating_add(bytes);
        self.time_last_updated = Some(now);
    }

    /// Bytes still in the bucket at `now`.
    pub fn bytes_pending(&self, now: Instant) -> u64 {
        let elapsed = match self.time_last_updated {
            Some(t) => now.saturating_duration_since(t),
            None => return self.bytes,
        };
        let drained = self.draining_rate.to_bytes_per_period(elapsed);
        self.bytes.saturating_sub(drained)
    }

    /// Time until the bucket is empty.
    pub fn time_remaining(&self, now: Instant) -> Duration {
        self.draining_rate.transfer_time(self.bytes_pending(now))
    }
}

/// Paces packets at a given bandwidth, allowing small bursts.
#[derive(Debug, Clone)]
pub struct PacedSender {
    leaky_bucket: LeakyBucket,

    pace: Bandwidth,

    /// Bursts up to this size are never delayed.
    min_burst_size: u64,
}

impl PacedSender {
    pub fn new(bandwidth: Bandwidth, max_segment_size: u64) -> Self {
        PacedSender {
            leaky_bucket: LeakyBucket::new(bandwidth),
            pace: bandwidth,
            min_burst_size: 2 * max_segment_size,
        }
    }

    pub fn update_bandwidth_estimate(&mut self, now: Instant, bandwidth: Bandwidth) {
        self.leaky_bucket.set_draining_rate(now, bandwidth);
        self.pace = bandwidth;
    }

    pub fn on_packet_sent(&mut self, now: Instant, bytes: u64) {
        self.leaky_bucket.add(now, bytes);
    }

    /// Refine the delay computed by the congestion window.
    pub fn time_until_send(&self, now: Instant, time_until_send: Duration) -> Duration {
        if time_until_send >= MAX_SCHEDULING_DELAY {
            return time_until_send;
        }

        let pacing_window = self.pace.to_bytes_per_period(MAX_SCHEDULING_DELAY);
        let min_window_size = pacing_window.max(self.min_burst_size);
        if min_window_size > self.leaky_bucket.bytes_pending(now) {
            return time_until_send;
        }
        self.leaky_bucket.time_remaining(now)
    }
}

/// Sender transmitting at a bitrate chosen by the receiver.
///
/// Losses don't change the rate. The window is what the bitrate allows over
/// the time the unacked data has been outstanding, capped at two packets.
/// Sends beyond it report the time until the sent bytes drained.
#[derive(Debug)]
pub struct FixRate {
    bitrate: Bandwidth,

    max_segment_size: u64,

    /// Send time of the first packet since nothing was in flight.
    unacked_since: Option<Instant>,

    /// How long the unacked data had been outstanding at the latest event,
    /// `None` if nothing is unacked.
    unacked_time: Option<Duration>,

    /// Bytes sent and not yet drained at the bitrate.
    fix_rate_leaky_bucket: LeakyBucket,

    paced_sender: PacedSender,

    latest_rtt: Duration,

    stats: CongestionStats,
}

impl FixRate {
    pub fn new(initial_bitrate: Bandwidth, max_segment_size: u64) -> Self {
        trace!("fix rate sender bitrate={}", initial_bitrate);
        FixRate {
            bitrate: initial_bitrate,
            max_segment_size,
            unacked_since: None,
            unacked_time: None,
            fix_rate_leaky_bucket: LeakyBucket::new(initial_bitrate),
            paced_sender: PacedSender::new(initial_bitrate, max_segment_size),
            latest_rtt: Duration::ZERO,
            stats: Default::default(),
        }
    }

    fn max_congestion_window(&self) -> u64 {
        2 * self.max_segment_size
    }

    fn update_unacked_time(&mut self, now: Instant) {
        self.unacked_time = self
            .unacked_since
            .map(|t| now.saturating_duration_since(t));
    }

    fn on_nothing_in_flight(&mut self) {
        self.unacked_since = None;
        self.unacked_time = None;
    }
}

impl SendAlgorithm for FixRate {
    fn name(&self) -> &str {
        "FIXRATE"
    }

    fn on_incoming_congestion_feedback(
        &mut self,
        feedback: &CongestionFeedbackFrame,
        feedback_receive_time: Instant,
    ) {
        if let CongestionFeedbackFrame::FixRate { bitrate } = feedback {
            if bitrate.is_zero() {
                warn!("fix rate sender ignores zero bitrate");
                return;
            }
            self.bitrate = *bitrate;
            self.fix_rate_leaky_bucket
                .set_draining_rate(feedback_receive_time, *bitrate);
            self.paced_sender
                .update_bandwidth_estimate(feedback_receive_time, *bitrate);
            debug!("fix rate sender bitrate={}", bitrate);
        }
    }

    fn on_packet_sent(
        &mut self,
        sent_time: Instant,
        bytes_in_flight: u64,
        _seq: u64,
        bytes: u64,
        has_retransmittable_data: bool,
    ) -> bool {
        self.fix_rate_leaky_bucket.add(sent_time, bytes);
        self.paced_sender.on_packet_sent(sent_time, bytes);

        if bytes_in_flight == 0 || self.unacked_since.is_none() {
            self.unacked_since = Some(sent_time);
        }
        self.update_unacked_time(sent_time);

        self.stats.bytes_in_flight = bytes_in_flight.saturating_add(bytes);
        self.stats.bytes_sent_in_total = self.stats.bytes_sent_in_total.saturating_add(bytes);
        has_retransmittable_data
    }

    fn on_packet_acked(&mut self, _seq: u64, acked_bytes: u64, prior_in_flight: u64, now: Instant) {
        self.stats.bytes_in_flight = prior_in_flight.saturating_sub(acked_bytes);
        self.stats.bytes_acked_in_total = self.stats.bytes_acked_in_total.saturating_add(acked_bytes);

        if self.stats.bytes_in_flight == 0 {
            self.on_nothing_in_flight();
        } else {
            self.update_unacked_time(now);
        }
    }

    fn on_packet_lost(&mut self, _seq: u64, _prior_in_flight: u64, _now: Instant) {
        // Losses don't change the rate.
    }

    fn on_packet_abandoned(&mut self, _seq: u64, abandoned_bytes: u64) {
        self.stats.bytes_in_flight = self.stats.bytes_in_flight.saturating_sub(abandoned_bytes);
        self.stats.bytes_abandoned_in_total = self
            .stats
            .bytes_abandoned_in_total
            .saturating_add(abandoned_bytes);
        if self.stats.bytes_in_flight == 0 {
            self.on_nothing_in_flight();
        }
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        if packets_retransmitted {
            self.stats.rto_count += 1;
        }
    }

    fn on_rtt_updated(&mut self, rtt: &RttEstimator) {
        self.latest_rtt = rtt.latest_rtt();
    }

    fn time_until_send(
        &mut self,
        now: Instant,
        bytes_in_flight: u64,
        _has_retransmittable_data: bool,
    ) -> Duration {
        if bytes_in_flight == 0 {
            self.on_nothing_in_flight();
        }
        self.update_unacked_time(now);

        // The window bounds the bytes not yet drained at the bitrate, not the
        // bytes in flight, so acks never gate the rate.
        if self.congestion_window() > self.fix_rate_leaky_bucket.bytes_pending(now) {
            return self.paced_sender.time_until_send(now, Duration::ZERO);
        }

        // Beyond the allotment the wait is positive until the bytes drained.
        let time_remaining = self.fix_rate_leaky_bucket.time_remaining(now);
        if time_remaining.is_zero() {
            return INFINITE_DELAY;
        }
        self.paced_sender.time_until_send(now, time_remaining)
    }

    fn bandwidth_estimate(&self) -> Bandwidth {
        self.bitrate
    }

    fn pacing_rate(&self) -> Bandwidth {
        self.bitrate
    }

    fn retransmission_delay(&self) -> Duration {
        // Twice the latest RTT.
        self.latest_rtt * 2
    }

    fn congestion_window(&self) -> u64 {
        match self.unacked_time {
            Some(unacked_time) => self
                .bitrate
                .to_bytes_per_period(unacked_time)
                .min(self.max_congestion_window()),
            None => self.max_congestion_window(),
        }
    }

    fn stats(&self) -> &CongestionStats {
        &self.stats
    }
}
