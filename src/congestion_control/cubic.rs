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

use super::prr::Prr;
use super::Bandwidth;
use super::CongestionStats;
use super::SendAlgorithm;
use super::INFINITE_DELAY;
use crate::connection::rtt::RttEstimator;
use crate::frame::CongestionFeedbackFrame;
use crate::RecoveryConfig;

/// The cubic curve is computed in fixed point: time is counted in 1/1024
/// seconds and the cube is scaled down by 2^CUBE_SCALE.
const CUBE_SCALE: u32 = 40;

/// Cubic constant C scaled by 2^10, i.e. 0.4 * 1024.
///
/// Together with CUBE_SCALE this yields `C * t^3` with t in seconds and the
/// window in packets.
const CUBE_CONGESTION_WINDOW_SCALE: i128 = 410;

/// Inverse of C in the fixed point scale, used to compute the time to origin.
const CUBE_FACTOR: u64 = (1 << CUBE_SCALE) / CUBE_CONGESTION_WINDOW_SCALE as u64;

/// Number of TCP connections the sender emulates.
const NUM_CONNECTIONS: u32 = 2;

/// Cubic constant beta, the window multiplier on a loss of one connection.
const BETA: f32 = 0.7;

/// Window multiplier on a loss for the emulated connections:
/// `(N - 1 + beta) / N`.
pub const N_CONNECTION_BETA: f32 = (NUM_CONNECTIONS as f32 - 1.0 + BETA) / NUM_CONNECTIONS as f32;

/// Additive increase factor of the TCP friendly region for the emulated
/// connections: `3 * N^2 * (1 - beta_N) / (1 + beta_N)`.
pub const N_CONNECTION_ALPHA: f32 = 3.0
    * NUM_CONNECTIONS as f32
    * NUM_CONNECTIONS as f32
    * (1.0 - N_CONNECTION_BETA)
    / (1.0 + N_CONNECTION_BETA);

/// Extra backoff applied to the remembered maximum when a loss happens before
/// the window reached it again, to let competing flows grow.
const BETA_LAST_MAX: f32 = (NUM_CONNECTIONS as f32 - 1.0 + 0.7) / NUM_CONNECTIONS as f32;

/// Within this interval the window is not recomputed for the same input
/// window.
const MAX_CUBIC_TIME_INTERVAL: Duration = Duration::from_millis(30);

/// Maximum number of segments that may be sent in one burst. A sender with
/// less room than this in its window is considered window limited.
const MAX_BURST_PACKETS: u64 = 3;

/// Default TCP receive window in bytes.
const DEFAULT_RECEIVE_WINDOW: u64 = 64 * 1024;

/// The cubic window curve, in packets.
///
/// The window follows `W(t) = C * (t - K)^3 + W_max`, where t is the time
/// since the last congestion event and K the time to reach `W_max` again. It
/// never grows slower than an emulated Reno sender.
#[derive(Debug, Default, Clone)]
pub struct CubicWindow {
    /// Number of connections emulated.
    num_connections: u32,

    /// Time when the current growth epoch started. None right after a loss.
    epoch: Option<Instant>,

    /// Time of the last window computation.
    last_update_time: Option<Instant>,

    /// The window passed to the last computation.
    last_congestion_window: u64,

    /// The window before the last loss.
    last_max_congestion_window: u64,

    /// Number of acks since the last increase of the Reno estimate.
    acked_packets_count: u64,

    /// The window of an emulated Reno sender.
    estimated_tcp_congestion_window: u64,

    /// The window at the origin of the cubic curve.
    origin_point_congestion_window: u64,

    /// Time to reach the origin, in 1/1024 seconds.
    time_to_origin_point: i64,

    /// The last window computed from the cubic curve.
    last_target_congestion_window: u64,
}

impl CubicWindow {
    pub fn new() -> Self {
        CubicWindow {
            num_connections: NUM_CONNECTIONS,
            ..CubicWindow::default()
        }
    }

    /// Set the number of emulated connections.
    pub fn set_num_connections(&mut self, num_connections: u32) {
        self.num_connections = num_connections.max(1);
    }

    fn beta(&self) -> f32 {
        let n = self.num_connections as f32;
        (n - 1.0 + BETA) / n
    }

    fn alpha(&self) -> f32 {
        let n = self.num_connections as f32;
        let beta = self.beta();
        3.0 * n * n * (1.0 - beta) / (1.0 + beta)
    }

    /// Forget all state, as after a retransmission timeout.
    pub fn reset(&mut self) {
        *self = CubicWindow {
            num_connections: self.num_connections,
            ..CubicWindow::default()
        };
    }

    /// Compute the window after a loss. Calling it twice in a row without an
    /// ack in between yields the same window.
    pub fn congestion_window_after_packet_loss(&mut self, current_congestion_window: u64) -> u64 {
        if current_congestion_window < self.last_max_congestion_window {
            // The window never reached the old maximum, so a competing flow
            // is assumed.
            self.last_max_congestion_window =
                (BETA_LAST_MAX * current_congestion_window as f32) as u64;
        } else {
            self.last_max_congestion_window = current_congestion_window;
        }
        self.epoch = None;

        (current_congestion_window as f32 * self.beta()) as u64
    }

    /// Compute the window after an ack, given the minimum RTT.
    pub fn congestion_window_after_ack(
        &mut self,
        current_congestion_window: u64,
        delay_min: Duration,
        now: Instant,
    ) -> u64 {
        self.acked_packets_count += 1;

        // The growth depends on time only, so it is not recomputed more often
        // than MAX_CUBIC_TIME_INTERVAL for an unchanged window.
        if self.last_congestion_window == current_congestion_window {
            if let Some(last_update_time) = self.last_update_time {
                if now.saturating_duration_since(last_update_time) <= MAX_CUBIC_TIME_INTERVAL {
                    return self
                        .last_target_congestion_window
                        .max(self.estimated_tcp_congestion_window);
                }
            }
        }
        self.last_congestion_window = current_congestion_window;
        self.last_update_time = Some(now);

        let epoch = match self.epoch {
            Some(epoch) => epoch,
            None => {
                // First ack after a loss event.
                trace!("cubic start of epoch cwnd={}", current_congestion_window);
                self.epoch = Some(now);
                self.acked_packets_count = 1;
                self.estimated_tcp_congestion_window = current_congestion_window;
                if self.last_max_congestion_window <= current_congestion_window {
                    self.time_to_origin_point = 0;
                    self.origin_point_congestion_window = current_congestion_window;
                } else {
                    let distance = self.last_max_congestion_window - current_congestion_window;
                    self.time_to_origin_point =
                        ((CUBE_FACTOR as f64) * distance as f64).cbrt() as i64;
                    self.origin_point_congestion_window = self.last_max_congestion_window;
                }
                now
            }
        };

        // Elapsed time in 1/1024 seconds, one minimum RTT ahead.
        let elapsed = (now + delay_min).saturating_duration_since(epoch);
        let elapsed_time = ((elapsed.as_micros() << 10) / 1_000_000) as i64;

        let offset = (self.time_to_origin_point - elapsed_time) as i128;
        let delta_congestion_window =
            ((CUBE_CONGESTION_WINDOW_SCALE * offset * offset * offset) >> CUBE_SCALE) as i64;

        let target_congestion_window =
            (self.origin_point_congestion_window as i64 - delta_congestion_window).max(0) as u64;

        // Grow the emulated Reno window by one for every cwnd / alpha acks.
        loop {
            let required_ack_count =
                ((self.estimated_tcp_congestion_window as f32 / self.alpha()) as u64).max(1);
            if self.acked_packets_count < required_ack_count {
                break;
            }
            self.acked_packets_count -= required_ack_count;
            self.estimated_tcp_congestion_window += 1;
        }

        self.last_target_congestion_window = target_congestion_window;

        target_congestion_window.max(self.estimated_tcp_congestion_window)
    }
}

/// Cubic sender configuration. Windows are counted in packets.
#[derive(Debug, Clone)]
pub struct CubicConfig {
    /// Use Reno congestion avoidance instead of the cubic curve.
    reno: bool,

    /// Minimal congestion window in packets.
    min_congestion_window: u64,

    /// Initial congestion window in packets.
    initial_congestion_window: u64,

    /// Maximal congestion window in packets.
    max_congestion_window: u64,

    /// Segment size in bytes.
    max_segment_size: u64,

    /// Initial rtt, used for the pacing rate before the first sample.
    initial_rtt: Duration,
}

impl CubicConfig {
    pub fn from(conf: &RecoveryConfig) -> Self {
        Self {
            reno: false,
            min_congestion_window: conf.min_congestion_window,
            initial_congestion_window: conf.initial_congestion_window,
            max_congestion_window: conf.max_congestion_window,
            max_segment_size: conf.max_datagram_size as u64,
            initial_rtt: conf.initial_rtt,
        }
    }

    /// Use Reno congestion avoidance.
    pub fn enable_reno(&mut self, enable: bool) -> &mut Self {
        self.reno = enable;
        self
    }
}

impl Default for CubicConfig {
    fn default() -> Self {
        CubicConfig::from(&RecoveryConfig::default())
    }
}

/// TCP style sender growing its window along the cubic curve.
///
/// Slow start grows the window by one packet per ack. After a loss the
/// window is reduced once per loss epoch, and sending during recovery is
/// governed by proportional rate reduction.
#[derive(Debug)]
pub struct Cubic {
    /// Configuration.
    config: CubicConfig,

    /// The window curve.
    cubic: CubicWindow,

    /// Proportional rate reduction state.
    prr: Prr,

    /// Congestion window in packets.
    cwnd: u64,

    /// Slow start threshold in packets.
    ssthresh: u64,

    /// Acks counted towards the next Reno increase.
    congestion_window_count: u64,

    /// Receive window announced by the peer, in bytes.
    receive_window: u64,

    /// Largest sequence number sent.
    largest_sent_seq: u64,

    /// Largest sequence number acked.
    largest_acked_seq: u64,

    /// Largest sequence number sent when the window was last reduced. Losses
    /// up to it belong to the same loss epoch.
    largest_sent_at_last_cutback: u64,

    /// Whether the last cutback happened in slow start.
    last_cutback_exited_slow_start: bool,

    /// Minimum RTT observed.
    min_rtt: Duration,

    /// Smoothed RTT, None before the first sample.
    smoothed_rtt: Option<Duration>,

    /// Number of consecutive retransmission timeouts.
    consecutive_rtos: u64,

    /// Congestion statistics.
    stats: CongestionStats,
}

impl Cubic {
    pub fn new(config: CubicConfig) -> Self {
        let cwnd = config.initial_congestion_window;
        let ssthresh = config.max_congestion_window;
        let min_rtt = config.initial_rtt;
        Self {
            config,
            cubic: CubicWindow::new(),
            prr: Prr::default(),
            cwnd,
            ssthresh,
            congestion_window_count: 0,
            receive_window: DEFAULT_RECEIVE_WINDOW,
            largest_sent_seq: 0,
            largest_acked_seq: 0,
            largest_sent_at_last_cutback: 0,
            last_cutback_exited_slow_start: false,
            min_rtt,
            smoothed_rtt: None,
            consecutive_rtos: 0,
            stats: Default::default(),
        }
    }

    /// Slow start threshold in bytes.
    pub fn slow_start_threshold(&self) -> u64 {
        self.ssthresh.saturating_mul(self.config.max_segment_size)
    }

    /// Number of consecutive retransmission timeouts without an ack.
    pub fn consecutive_rtos(&self) -> u64 {
        self.consecutive_rtos
    }

    fn send_window(&self) -> u64 {
        self.receive_window.min(self.congestion_window())
    }

    /// Whether the sender is using (almost) all of its window. The window is
    /// only increased if so.
    fn is_cwnd_limited(&self, bytes_in_flight: u64) -> bool {
        let cwnd = self.congestion_window();
        if bytes_in_flight >= cwnd {
            return true;
        }
        cwnd - bytes_in_flight <= MAX_BURST_PACKETS * self.config.max_segment_size
    }

    fn maybe_increase_cwnd(&mut self, prior_in_flight: u64, now: Instant) {
        if !self.is_cwnd_limited(prior_in_flight) {
            return;
        }

        if self.in_slow_start() {
            if self.cwnd < self.config.max_congestion_window {
                self.cwnd += 1;
            }
            return;
        }

        if self.cwnd >= self.config.max_congestion_window {
            return;
        }

        if self.config.reno {
            self.congestion_window_count += 1;
            if self.congestion_window_count >= self.cwnd {
                self.cwnd += 1;
                self.congestion_window_count = 0;
            }
        } else {
            let target = self
                .cubic
                .congestion_window_after_ack(self.cwnd, self.min_rtt, now);
            self.cwnd = target.min(self.config.max_congestion_window);
        }
    }
}

impl SendAlgorithm for Cubic {
    fn name(&self) -> &str {
        if self.config.reno {
            "RENO"
        } else {
            "CUBIC"
        }
    }

    fn on_incoming_congestion_feedback(
        &mut self,
        feedback: &CongestionFeedbackFrame,
        _feedback_receive_time: Instant,
    ) {
        if let CongestionFeedbackFrame::Tcp { receive_window } = feedback {
            self.receive_window = *receive_window;
        }
    }

    fn on_packet_sent(
        &mut self,
        _sent_time: Instant,
        bytes_in_flight: u64,
        seq: u64,
        bytes: u64,
        has_retransmittable_data: bool,
    ) -> bool {
        if !has_retransmittable_data {
            return false;
        }

        if self.in_recovery() {
            self.prr.on_packet_sent(bytes);
        }
        self.largest_sent_seq = self.largest_sent_seq.max(seq);

        // Statistics.
        self.stats.bytes_in_flight = bytes_in_flight.saturating_add(bytes);
        self.stats.bytes_sent_in_total = self.stats.bytes_sent_in_total.saturating_add(bytes);
        if self.in_slow_start() {
            self.stats.bytes_sent_in_slow_start =
                self.stats.bytes_sent_in_slow_start.saturating_add(bytes);
        }
        true
    }

    fn on_packet_acked(&mut self, seq: u64, acked_bytes: u64, prior_in_flight: u64, now: Instant) {
        self.largest_acked_seq = self.largest_acked_seq.max(seq);
        self.consecutive_rtos = 0;

        self.stats.bytes_in_flight = prior_in_flight.saturating_sub(acked_bytes);
        self.stats.bytes_acked_in_total = self.stats.bytes_acked_in_total.saturating_add(acked_bytes);

        if self.in_recovery() {
            self.prr.on_packet_acked(acked_bytes);
            return;
        }
        self.maybe_increase_cwnd(prior_in_flight, now);
    }

    fn on_packet_lost(&mut self, seq: u64, prior_in_flight: u64, _now: Instant) {
        // All losses of packets sent before the last cutback belong to the
        // same loss event.
        if seq <= self.largest_sent_at_last_cutback {
            if self.last_cutback_exited_slow_start {
                self.stats.packets_lost_in_slow_start += 1;
            }
            trace!("{} ignore loss of {} in the same epoch", self.name(), seq);
            return;
        }

        self.stats.loss_events += 1;
        self.last_cutback_exited_slow_start = self.in_slow_start();
        if self.in_slow_start() {
            self.stats.packets_lost_in_slow_start += 1;
        }

        self.prr.on_packet_lost(prior_in_flight);

        let cwnd = if self.config.reno {
            self.cwnd / 2
        } else {
            self.cubic.congestion_window_after_packet_loss(self.cwnd)
        };
        self.ssthresh = cwnd;
        self.cwnd = cwnd.max(self.config.min_congestion_window);
        self.largest_sent_at_last_cutback = self.largest_sent_seq;
        self.congestion_window_count = 0;

        debug!(
            "{} loss of {} cwnd={} ssthresh={}",
            self.name(),
            seq,
            self.cwnd,
            self.ssthresh
        );
    }

    fn on_packet_abandoned(&mut self, _seq: u64, abandoned_bytes: u64) {
        self.stats.bytes_in_flight = self.stats.bytes_in_flight.saturating_sub(abandoned_bytes);
        self.stats.bytes_abandoned_in_total = self
            .stats
            .bytes_abandoned_in_total
            .saturating_add(abandoned_bytes);
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        self.largest_sent_at_last_cutback = 0;
        if !packets_retransmitted {
            return;
        }

        self.stats.rto_count += 1;
        self.consecutive_rtos += 1;
        self.cubic.reset();
        self.ssthresh = (self.cwnd / 2).max(self.config.min_congestion_window);
        self.cwnd = self.config.min_congestion_window;
        self.congestion_window_count = 0;
    }

    fn on_rtt_updated(&mut self, rtt: &RttEstimator) {
        self.min_rtt = rtt.min_rtt();
        self.smoothed_rtt = Some(rtt.smoothed_rtt());
    }

    fn time_until_send(
        &mut self,
        _now: Instant,
        bytes_in_flight: u64,
        has_retransmittable_data: bool,
    ) -> Duration {
        // Acks can always be sent.
        if !has_retransmittable_data {
            return Duration::ZERO;
        }

        if self.in_recovery() {
            return self.prr.time_until_send(
                self.send_window(),
                bytes_in_flight,
                self.slow_start_threshold(),
                self.config.max_segment_size,
            );
        }

        if self.send_window() > bytes_in_flight {
            return Duration::ZERO;
        }
        INFINITE_DELAY
    }

    fn bandwidth_estimate(&self) -> Bandwidth {
        match self.smoothed_rtt {
            Some(srtt) => Bandwidth::new(self.congestion_window(), srtt),
            None => Bandwidth::ZERO,
        }
    }

    fn pacing_rate(&self) -> Bandwidth {
        let srtt = self.smoothed_rtt.unwrap_or(self.config.initial_rtt);
        let bandwidth = Bandwidth::new(self.congestion_window(), srtt);
        // Pace faster than the window allows to keep the window filled.
        bandwidth.scale(if self.in_slow_start() { 2.0 } else { 1.25 })
    }

    fn congestion_window(&self) -> u64 {
        self.cwnd.saturating_mul(self.config.max_segment_size)
    }

    fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    fn in_recovery(&self) -> bool {
        self.largest_acked_seq <= self.largest_sent_at_last_cutback && self.largest_acked_seq != 0
    }

    fn stats(&self) -> &CongestionStats {
        &self.stats
    }
}
