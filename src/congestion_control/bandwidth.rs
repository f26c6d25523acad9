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

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

const MICROS_PER_SECOND: u128 = 1_000_000;

/// A data rate, kept in bits per second.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Bandwidth {
    bits_per_second: u64,
}

impl Bandwidth {
    pub const ZERO: Bandwidth = Bandwidth { bits_per_second: 0 };

    pub const INFINITE: Bandwidth = Bandwidth {
        bits_per_second: u64::MAX,
    };

    pub const fn from_bits_per_second(bits_per_second: u64) -> Self {
        Bandwidth { bits_per_second }
    }

    pub const fn from_bytes_per_second(bytes_per_second: u64) -> Self {
        Bandwidth {
            bits_per_second: bytes_per_second.saturating_mul(8),
        }
    }

    pub const fn from_kbytes_per_second(kbytes_per_second: u64) -> Self {
        Bandwidth {
            bits_per_second: kbytes_per_second.saturating_mul(8000),
        }
    }

    /// The rate at which `bytes` are transferred in `interval`.
    pub fn new(bytes: u64, interval: Duration) -> Self {
        if interval.is_zero() {
            return Bandwidth::ZERO;
        }
        let bits = bytes as u128 * 8 * MICROS_PER_SECOND / interval.as_micros().max(1);
        Bandwidth {
            bits_per_second: bits.min(u64::MAX as u128) as u64,
        }
    }

    pub fn to_bits_per_second(self) -> u64 {
        self.bits_per_second
    }

    pub fn to_bytes_per_second(self) -> u64 {
        self.bits_per_second / 8
    }

    pub fn is_zero(self) -> bool {
        self.bits_per_second == 0
    }

    /// Bytes transferred at this rate during `period`.
    pub fn to_bytes_per_period(self, period: Duration) -> u64 {
        let bytes = self.bits_per_second as u128 * period.as_micros() / 8 / MICROS_PER_SECOND;
        bytes.min(u64::MAX as u128) as u64
    }

    /// Time needed to transfer `bytes` at this rate. Zero for a zero rate.
    pub fn transfer_time(self, bytes: u64) -> Duration {
        if self.bits_per_second == 0 {
            return Duration::ZERO;
        }
        let micros = bytes as u128 * 8 * MICROS_PER_SECOND / self.bits_per_second as u128;
        Duration::from_micros(micros.min(u64::MAX as u128) as u64)
    }

    /// Multiply the rate by `factor`.
    pub fn scale(self, factor: f32) -> Bandwidth {
        Bandwidth {
            bits_per_second: (self.bits_per_second as f64 * factor as f64) as u64,
        }
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}bps", self.bits_per_second)
    }
}
