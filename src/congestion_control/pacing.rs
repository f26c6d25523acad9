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
use crate::connection::rtt::RttEstimator;
use crate::frame::CongestionFeedbackFrame;

/// The upper bound of packets sent back to back when leaving quiescence.
const INITIAL_UNPACED_BURST: u64 = 10;

/// A sender which spreads the packets allowed by the wrapped sender over
/// time, at the pacing rate of the wrapped sender.
///
/// Packets are delayed only if the delay exceeds the alarm granularity.
#[derive(Debug)]
pub struct PacingSender {
    sender: Box<dyn SendAlgorithm>,

    /// Delays up to this value are not worth an alarm.
    alarm_granularity: Duration,

    max_segment_size: u64,

    /// Packets which may still be sent without pacing.
    burst_tokens: u64,

    /// When the next packet should be sent.
    ideal_next_packet_send_time: Option<Instant>,

    /// Whether the last call to `time_until_send` delayed the send.
    was_last_send_delayed: bool,

    /// Send time of the last packet sent while catching up on delays.
    last_delayed_packet_sent_time: Option<Instant>,
}

impl PacingSender {
    pub fn new(
        sender: Box<dyn SendAlgorithm>,
        alarm_granularity: Duration,
        max_segment_size: u64,
    ) -> Self {
        PacingSender {
            sender,
            alarm_granularity,
            max_segment_size: max_segment_size.max(1),
            burst_tokens: INITIAL_UNPACED_BURST,
            ideal_next_packet_send_time: None,
            was_last_send_delayed: false,
            last_delayed_packet_sent_time: None,
        }
    }

    fn clear_delay_state(&mut self) {
        self.was_last_send_delayed = false;
        self.last_delayed_packet_sent_time = None;
    }
}

impl SendAlgorithm for PacingSender {
    fn name(&self) -> &str {
        self.sender.name()
    }

    fn on_incoming_congestion_feedback(
        &mut self,
        feedback: &CongestionFeedbackFrame,
        feedback_receive_time: Instant,
    ) {
        self.sender
            .on_incoming_congestion_feedback(feedback, feedback_receive_time)
    }

    fn on_packet_sent(
        &mut self,
        sent_time: Instant,
        bytes_in_flight: u64,
        seq: u64,
        bytes: u64,
        has_retransmittable_data: bool,
    ) -> bool {
        let in_flight = self.sender.on_packet_sent(
            sent_time,
            bytes_in_flight,
            seq,
            bytes,
            has_retransmittable_data,
        );
        if !has_retransmittable_data {
            return in_flight;
        }

        // Leaving quiescence allows an unpaced burst, unless losses are
        // being recovered.
        if bytes_in_flight == 0 && !self.sender.in_recovery() {
            self.burst_tokens = INITIAL_UNPACED_BURST
                .min(self.sender.congestion_window() / self.max_segment_size);
        }
        if self.burst_tokens > 0 {
            self.burst_tokens -= 1;
            self.ideal_next_packet_send_time = None;
            self.clear_delay_state();
            return in_flight;
        }

        let delay = self.sender.pacing_rate().transfer_time(bytes);
        if self.was_last_send_delayed {
            let ideal = self.ideal_next_packet_send_time.unwrap_or(sent_time) + delay;
            self.ideal_next_packet_send_time = Some(ideal);

            // Sends slower than the pacing rate are limited by the
            // application.
            let app_limited = self
                .last_delayed_packet_sent_time
                .map_or(false, |t| sent_time > t + delay);
            let making_up_for_lost_time = ideal <= sent_time;

            // Keep treating packets as delayed while catching up.
            if making_up_for_lost_time && !app_limited {
                self.last_delayed_packet_sent_time = Some(sent_time);
            } else {
                self.clear_delay_state();
            }
        } else {
            // Sends within the alarm granularity of the ideal time are on time.
            let earliest = (sent_time + delay)
                .checked_sub(self.alarm_granularity)
                .unwrap_or(sent_time);
            let ideal = match self.ideal_next_packet_send_time {
                Some(t) => (t + delay).max(earliest),
                None => earliest,
            };
            self.ideal_next_packet_send_time = Some(ideal);
        }

        trace!(
            "{} paced packet {} next send in {:?}",
            self.sender.name(),
            seq,
            self.ideal_next_packet_send_time
                .map(|t| t.saturating_duration_since(sent_time))
        );
        in_flight
    }

    fn on_packet_acked(&mut self, seq: u64, acked_bytes: u64, prior_in_flight: u64, now: Instant) {
        self.sender
            .on_packet_acked(seq, acked_bytes, prior_in_flight, now)
    }

    fn on_packet_lost(&mut self, seq: u64, prior_in_flight: u64, now: Instant) {
        self.burst_tokens = 0;
        self.sender.on_packet_lost(seq, prior_in_flight, now)
    }

    fn on_packet_abandoned(&mut self, seq: u64, abandoned_bytes: u64) {
        self.sender.on_packet_abandoned(seq, abandoned_bytes)
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        self.sender.on_retransmission_timeout(packets_retransmitted)
    }

    fn on_rtt_updated(&mut self, rtt: &RttEstimator) {
        self.sender.on_rtt_updated(rtt)
    }

    fn time_until_send(
        &mut self,
        now: Instant,
        bytes_in_flight: u64,
        has_retransmittable_data: bool,
    ) -> Duration {
        let time_until_send =
            self.sender
                .time_until_send(now, bytes_in_flight, has_retransmittable_data);
        if self.burst_tokens > 0 || bytes_in_flight == 0 {
            return time_until_send;
        }
        if !time_until_send.is_zero() {
            return time_until_send;
        }
        if !has_retransmittable_data {
            return Duration::ZERO;
        }

        match self.ideal_next_packet_send_time {
            Some(ideal) if ideal > now + self.alarm_granularity => {
                self.was_last_send_delayed = true;
                ideal - now
            }
            _ => Duration::ZERO,
        }
    }

    fn bandwidth_estimate(&self) -> Bandwidth {
        self.sender.bandwidth_estimate()
    }

    fn pacing_rate(&self) -> Bandwidth {
        self.sender.pacing_rate()
    }

    fn retransmission_delay(&self) -> Duration {
        self.sender.retransmission_delay()
    }

    fn congestion_window(&self) -> u64 {
        self.sender.congestion_window()
    }

    fn in_slow_start(&self) -> bool {
        self.sender.in_slow_start()
    }

    fn in_recovery(&self) -> bool {
        self.sender.in_recovery()
    }

    fn stats(&self) -> &CongestionStats {
        self.sender.stats()
    }
}
