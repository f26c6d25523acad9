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

use core::str::FromStr;
use std::fmt;
use std::time::Duration;
use std::time::Instant;

use crate::connection::rtt::RttEstimator;
use crate::frame::CongestionFeedbackFrame;
use crate::Error;
use crate::RecoveryConfig;
use crate::Result;
pub use bandwidth::Bandwidth;
pub use cubic::Cubic;
pub use cubic::CubicConfig;
pub use cubic::CubicWindow;
pub use fix_rate::FixRate;
pub use pacing::PacingSender;

/// The delay returned by `time_until_send` when nothing may be sent until an
/// ack arrives.
pub const INFINITE_DELAY: Duration = Duration::MAX;

/// Available congestion control algorithm
#[repr(C)]
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub enum CongestionControlAlgorithm {
    /// CUBIC grows the window as a cubic function of the time since the last
    /// congestion event, which makes the growth independent of the RTT.
    #[default]
    Cubic,

    /// Classic Reno congestion avoidance, on the same sender as CUBIC.
    Reno,

    /// Send at a fixed bitrate chosen by the receiver, regardless of losses.
    FixRate,
}

impl FromStr for CongestionControlAlgorithm {
    type Err = Error;

    fn from_str(algor: &str) -> Result<CongestionControlAlgorithm> {
        if algor.eq_ignore_ascii_case("cubic") {
            Ok(CongestionControlAlgorithm::Cubic)
        } else if algor.eq_ignore_ascii_case("reno") {
            Ok(CongestionControlAlgorithm::Reno)
        } else if algor.eq_ignore_ascii_case("fixrate") {
            Ok(CongestionControlAlgorithm::FixRate)
        } else {
            Err(Error::InvalidConfig("unknown".into()))
        }
    }
}

/// Congestion control statistics.
#[derive(Debug, Default, Clone)]
pub struct CongestionStats {
    /// Bytes in flight.
    pub bytes_in_flight: u64,

    /// Total bytes sent in slow start.
    pub bytes_sent_in_slow_start: u64,

    /// Total bytes sent.
    pub bytes_sent_in_total: u64,

    /// Total bytes acked.
    pub bytes_acked_in_total: u64,

    /// Total bytes abandoned, i.e. no longer counted in flight without being
    /// acked.
    pub bytes_abandoned_in_total: u64,

    /// Number of distinct loss events which reduced the window.
    pub loss_events: u64,

    /// Number of packets lost in slow start.
    pub packets_lost_in_slow_start: u64,

    /// Number of retransmission timeouts.
    pub rto_count: u64,
}

/// Congestion control interfaces shared by the send algorithms.
///
/// Windows and byte counts are in bytes. A `time_until_send` of zero allows
/// sending right away and `INFINITE_DELAY` blocks until an ack arrives.
pub trait SendAlgorithm {
    /// Name of congestion control algorithm.
    fn name(&self) -> &str;

    /// Congestion feedback from the receiver.
    fn on_incoming_congestion_feedback(
        &mut self,
        feedback: &CongestionFeedbackFrame,
        feedback_receive_time: Instant,
    );

    /// A packet was written to the wire. `bytes_in_flight` excludes the
    /// packet. Returns whether the packet counts against the congestion
    /// window.
    fn on_packet_sent(
        &mut self,
        sent_time: Instant,
        bytes_in_flight: u64,
        seq: u64,
        bytes: u64,
        has_retransmittable_data: bool,
    ) -> bool;

    /// A packet in flight was acked. `prior_in_flight` still includes it.
    fn on_packet_acked(&mut self, seq: u64, acked_bytes: u64, prior_in_flight: u64, now: Instant);

    /// A packet was declared lost. `prior_in_flight` still includes it.
    fn on_packet_lost(&mut self, seq: u64, prior_in_flight: u64, now: Instant);

    /// A packet stopped counting as in flight without being acked.
    fn on_packet_abandoned(&mut self, seq: u64, abandoned_bytes: u64);

    /// The retransmission timer fired.
    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool);

    /// The RTT estimator took a new sample.
    fn on_rtt_updated(&mut self, rtt: &RttEstimator);

    /// How long to wait before sending the next packet.
    fn time_until_send(
        &mut self,
        now: Instant,
        bytes_in_flight: u64,
        has_retransmittable_data: bool,
    ) -> Duration;

    /// Current estimate of the available bandwidth.
    fn bandwidth_estimate(&self) -> Bandwidth;

    /// The rate packets should be paced at.
    fn pacing_rate(&self) -> Bandwidth;

    /// Retransmission delay the algorithm wants, zero to use the default one.
    fn retransmission_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Current congestion window.
    fn congestion_window(&self) -> u64;

    /// Check if in slow start.
    fn in_slow_start(&self) -> bool {
        false
    }

    /// Check if in recovery mode.
    fn in_recovery(&self) -> bool {
        false
    }

    /// Congestion stats.
    fn stats(&self) -> &CongestionStats;
}

impl fmt::Debug for dyn SendAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send algorithm {}", self.name())
    }
}

/// Build the send algorithm described by the configuration, wrapped by the
/// pacing sender if pacing is enabled.
pub fn build_send_algorithm(conf: &RecoveryConfig) -> Box<dyn SendAlgorithm> {
    let sender: Box<dyn SendAlgorithm> = match conf.congestion_control_algorithm {
        CongestionControlAlgorithm::Cubic => Box::new(Cubic::new(CubicConfig::from(conf))),
        CongestionControlAlgorithm::Reno => {
            let mut config = CubicConfig::from(conf);
            config.enable_reno(true);
            Box::new(Cubic::new(config))
        }
        CongestionControlAlgorithm::FixRate => Box::new(FixRate::new(
            conf.fix_rate_initial_bitrate,
            conf.max_datagram_size as u64,
        )),
    };

    if conf.enable_pacing {
        return Box::new(PacingSender::new(
            sender,
            conf.pacing_granularity,
            conf.max_datagram_size as u64,
        ));
    }
    sender
}


mod bandwidth;
mod cubic;
mod fix_rate;
mod pacing;
mod prr;
