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

use super::INFINITE_DELAY;

/// Proportional Rate Reduction.
///
/// See <https://www.rfc-editor.org/rfc/rfc6937.html>.
#[derive(Debug, Default, Clone)]
pub struct Prr {
    /// Total bytes sent during recovery (prr_out).
    bytes_sent: u64,

    /// Total bytes delivered during recovery (prr_delivered).
    bytes_delivered: u64,

    /// Number of acks received during recovery.
    ack_count: u64,

    /// FlightSize at the start of recovery (RecoverFS).
    bytes_in_flight_before_loss: u64,
}

impl Prr {
    /// Enter recovery.
    pub fn on_packet_lost(&mut self, prior_in_flight: u64) {
        self.bytes_sent = 0;
        self.bytes_delivered = 0;
        self.ack_count = 0;
        self.bytes_in_flight_before_loss = prior_in_flight;
    }

    pub fn on_packet_sent(&mut self, sent_bytes: u64) {
        self.bytes_sent = self.bytes_sent.saturating_add(sent_bytes);
    }

    pub fn on_packet_acked(&mut self, acked_bytes: u64) {
        self.bytes_delivered = self.bytes_delivered.saturating_add(acked_bytes);
        self.ack_count += 1;
    }

    /// Time until the next packet may be sent while in recovery.
    pub fn time_until_send(
        &self,
        send_window: u64,
        bytes_in_flight: u64,
        slow_start_threshold: u64,
        max_segment_size: u64,
    ) -> Duration {
        // Always allow a fast retransmit upon entering recovery.
        if self.bytes_sent == 0 || bytes_in_flight < max_segment_size {
            return Duration::ZERO;
        }

        if send_window > bytes_in_flight {
            // PRR-SSRB: limit outgoing data to one extra segment per ack,
            // instead of the whole available window.
            //   limit = MAX(prr_delivered - prr_out, DeliveredData) + MSS
            if self.bytes_delivered + self.ack_count * max_segment_size <= self.bytes_sent {
                return INFINITE_DELAY;
            }
            return Duration::ZERO;
        }

        // sndcnt = CEIL(prr_delivered * ssthresh / RecoverFS) - prr_out,
        // checked without the division.
        if self.bytes_delivered as u128 * slow_start_threshold as u128
            > self.bytes_sent as u128 * self.bytes_in_flight_before_loss as u128
        {
            return Duration::ZERO;
        }
        INFINITE_DELAY
    }
}
