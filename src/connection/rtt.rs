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
use std::time::Duration;

/// RTT estimation of the connection.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    /// The RTT assumed before any sample arrives.
    initial_rtt: Duration,

    /// The most recent RTT sample, with the peer's ack delay removed.
    latest_rtt: Duration,

    /// Exponentially weighted moving average of the samples.
    smoothed_rtt: Option<Duration>,

    /// Mean deviation of the samples.
    rttvar: Duration,

    /// The minimum RTT observed, ignoring ack delay.
    min_rtt: Option<Duration>,

    /// The maximum RTT observed.
    max_rtt: Duration,
}

impl RttEstimator {
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            initial_rtt,
            latest_rtt: initial_rtt,
            smoothed_rtt: None,
            rttvar: initial_rtt / 2,
            min_rtt: None,
            max_rtt: initial_rtt,
        }
    }

    /// Whether an RTT sample has been taken.
    pub fn has_sample(&self) -> bool {
        self.smoothed_rtt.is_some()
    }

    /// Return the current best RTT estimation.
    pub fn smoothed_rtt(&self) -> Duration {
        self.smoothed_rtt.unwrap_or(self.initial_rtt)
    }

    /// Return the latest rtt sample.
    pub fn latest_rtt(&self) -> Duration {
        self.latest_rtt
    }

    /// Return the minimum RTT observed so far, or the initial RTT before any
    /// sample.
    pub fn min_rtt(&self) -> Duration {
        self.min_rtt.unwrap_or(self.initial_rtt)
    }

    /// Return the variation in the RTT samples using a mean variation.
    pub fn rttvar(&self) -> Duration {
        self.rttvar
    }

    /// Return the Maximum RTT observed so far for this estimator.
    pub fn max_rtt(&self) -> Duration {
        self.max_rtt
    }

    /// Return the base retransmission timeout: srtt + 4 * rttvar.
    pub fn rto_base(&self) -> Duration {
        self.smoothed_rtt() + 4 * self.rttvar
    }

    /// Set the initial RTT, as long as no sample has been taken.
    pub fn set_initial_rtt(&mut self, initial_rtt: Duration) {
        if self.smoothed_rtt.is_some() {
            return;
        }

        self.initial_rtt = initial_rtt;
        self.latest_rtt = initial_rtt;
        self.rttvar = initial_rtt / 2;
        self.max_rtt = initial_rtt;
    }

    /// Update the estimator with the time between sending a packet and
    /// receiving its ack, and the delay the peer reported between receiving
    /// the packet and sending the ack.
    ///
    /// A peer delay at least as large as the send delta is implausible. It is
    /// then ignored and the wall clock delta is used, but only until the first
    /// real sample exists. A missing delay, as in truncated acks, is handled
    /// the same way. Returns whether the estimator was updated.
    pub fn update(&mut self, send_delta: Duration, ack_delay: Option<Duration>) -> bool {
        if send_delta.is_zero() {
            return false;
        }

        self.min_rtt = Some(cmp::min(self.min_rtt.unwrap_or(send_delta), send_delta));

        let sample = match ack_delay {
            Some(delay) if send_delta > delay => send_delta - delay,
            _ if self.smoothed_rtt.is_some() => return false,
            _ => send_delta,
        };

        self.latest_rtt = sample;
        self.max_rtt = cmp::max(self.max_rtt, sample);

        match self.smoothed_rtt {
            Some(smoothed_rtt) => {
                let var_sample = if smoothed_rtt > sample {
                    smoothed_rtt - sample
                } else {
                    sample - smoothed_rtt
                };

                self.rttvar = (3 * self.rttvar + var_sample) / 4;
                self.smoothed_rtt = Some((7 * smoothed_rtt + sample) / 8);
            }
            None => {
                self.smoothed_rtt = Some(sample);
                self.rttvar = sample / 2;
                self.max_rtt = sample;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial() {
        let initial_rtt = Duration::from_millis(100);
        let r = RttEstimator::new(initial_rtt);
        assert!(!r.has_sample());
        assert_eq!(r.latest_rtt(), initial_rtt);
        assert_eq!(r.min_rtt(), initial_rtt);
        assert_eq!(r.max_rtt(), initial_rtt);
        assert_eq!(r.rttvar(), initial_rtt / 2);
        assert_eq!(r.smoothed_rtt(), initial_rtt);
        assert_eq!(r.rto_base(), initial_rtt * 3);
    }

    #[test]
    fn update() {
        let mut r = RttEstimator::new(Duration::from_millis(200));

        r.set_initial_rtt(Duration::from_millis(100));
        assert_eq!(r.smoothed_rtt(), Duration::from_millis(100));

        // Zero samples are ignored.
        assert!(!r.update(Duration::ZERO, None));
        assert!(!r.has_sample());

        // First sample
        assert!(r.update(Duration::from_millis(400), Some(Duration::from_millis(100))));
        assert!(r.has_sample());
        assert_eq!(r.latest_rtt(), Duration::from_millis(300));
        assert_eq!(r.min_rtt(), Duration::from_millis(400));
        assert_eq!(r.smoothed_rtt(), Duration::from_millis(300));
        assert_eq!(r.rttvar(), Duration::from_millis(150));

        // The initial rtt can't be changed any more.
        r.set_initial_rtt(Duration::from_millis(50));
        assert_eq!(r.smoothed_rtt(), Duration::from_millis(300));

        // Second sample
        assert!(r.update(Duration::from_millis(700), Some(Duration::from_millis(100))));
        assert_eq!(r.latest_rtt(), Duration::from_millis(600));
        assert_eq!(r.min_rtt(), Duration::from_millis(400));
        assert_eq!(r.max_rtt(), Duration::from_millis(600));
        assert_eq!(r.rttvar(), Duration::from_micros(187_500));
        assert_eq!(r.smoothed_rtt(), Duration::from_micros(337_500));

        // Third sample
        assert!(r.update(Duration::from_millis(325), Some(Duration::from_millis(100))));
        assert_eq!(r.latest_rtt(), Duration::from_millis(225));
        assert_eq!(r.min_rtt(), Duration::from_millis(325));
        assert_eq!(r.rttvar(), Duration::from_nanos(168_750_000));
        assert_eq!(r.smoothed_rtt(), Duration::from_nanos(323_437_500));
    }

    #[test]
    fn implausible_ack_delay() {
        let mut r = RttEstimator::new(Duration::from_millis(100));

        // Without any sample, the wall clock delta is used.
        assert!(r.update(Duration::from_millis(50), Some(Duration::from_millis(80))));
        assert_eq!(r.latest_rtt(), Duration::from_millis(50));
        assert_eq!(r.smoothed_rtt(), Duration::from_millis(50));

        // Afterwards, the sample is dropped but min rtt is still tracked.
        assert!(!r.update(Duration::from_millis(40), Some(Duration::from_millis(80))));
        assert_eq!(r.latest_rtt(), Duration::from_millis(50));
        assert_eq!(r.smoothed_rtt(), Duration::from_millis(50));
        assert_eq!(r.min_rtt(), Duration::from_millis(40));
    }

    #[test]
    fn missing_ack_delay() {
        let mut r = RttEstimator::new(Duration::from_millis(100));

        // The first sample uses the wall clock delta.
        assert!(r.update(Duration::from_millis(60), None));
        assert_eq!(r.smoothed_rtt(), Duration::from_millis(60));

        assert!(r.update(Duration::from_millis(80), Some(Duration::from_millis(20))));
        assert_eq!(r.smoothed_rtt(), Duration::from_millis(60));

        // Truncated acks carry no delay, their long send deltas are not used.
        for _ in 0..10 {
            assert!(!r.update(Duration::from_millis(500), None));
        }
        assert_eq!(r.latest_rtt(), Duration::from_millis(60));
        assert_eq!(r.smoothed_rtt(), Duration::from_millis(60));
        assert_eq!(r.max_rtt(), Duration::from_millis(60));
        assert_eq!(r.min_rtt(), Duration::from_millis(60));
    }
}
