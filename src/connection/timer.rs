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

use std::time::Instant;

use strum::EnumCount;
use strum::IntoEnumIterator;
use strum_macros::EnumCount;
use strum_macros::EnumIter;

/// Alarms of a connection, in the order they fire when due at the same time.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, EnumIter, EnumCount)]
pub enum Timer {
    /// When to send a delayed ack.
    Ack,

    /// When to retransmit handshake data, send tail loss probes, or declare
    /// a retransmission timeout.
    Retransmission,

    /// When the send algorithm allows sending again.
    Send,

    /// When to close the connection for inactivity, or because it lived too
    /// long.
    Timeout,
}

/// Deadlines of the connection alarms.
///
/// Setting an alarm replaces its previous deadline.
#[derive(Debug, Copy, Clone, Default)]
pub struct TimerTable {
    deadlines: [Option<Instant>; Timer::COUNT],
}

impl TimerTable {
    /// Arm the timer, replacing its previous deadline.
    pub fn set(&mut self, timer: Timer, time: Instant) {
        self.deadlines[timer as usize] = Some(time);
    }

    /// Arm the timer unless it is already armed at an earlier time.
    pub fn set_if_earlier(&mut self, timer: Timer, time: Instant) {
        let slot = &mut self.deadlines[timer as usize];
        if slot.map_or(true, |t| time < t) {
            *slot = Some(time);
        }
    }

    pub fn get(&self, timer: Timer) -> Option<Instant> {
        self.deadlines[timer as usize]
    }

    pub fn is_set(&self, timer: Timer) -> bool {
        self.deadlines[timer as usize].is_some()
    }

    pub fn cancel(&mut self, timer: Timer) {
        self.deadlines[timer as usize] = None;
    }

    /// The earliest deadline of all armed timers.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.deadlines.iter().filter_map(|&x| x).min()
    }

    pub fn is_expired(&self, timer: Timer, now: Instant) -> bool {
        self.deadlines[timer as usize].map_or(false, |x| x <= now)
    }

    /// Disarm and return the timers due at `now`.
    pub fn take_expired(&mut self, now: Instant) -> Vec<Timer> {
        let expired: Vec<Timer> = Timer::iter().filter(|&t| self.is_expired(t, now)).collect();
        for &timer in &expired {
            self.cancel(timer);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn timer_operation() {
        let mut timers = TimerTable::default();
        assert_eq!(timers.next_timeout(), None);

        let now = Instant::now();
        let ack_time = now + Duration::from_millis(25);
        let idle_time = now + Duration::from_secs(30);
        timers.set(Timer::Ack, ack_time);
        timers.set(Timer::Timeout, idle_time);

        assert_eq!(timers.get(Timer::Ack), Some(ack_time));
        assert_eq!(timers.get(Timer::Timeout), Some(idle_time));
        assert!(!timers.is_set(Timer::Send));
        assert_eq!(timers.get(Timer::Retransmission), None);
        assert_eq!(timers.next_timeout(), Some(ack_time));

        timers.cancel(Timer::Ack);
        assert!(!timers.is_set(Timer::Ack));
        assert_eq!(timers.next_timeout(), Some(idle_time));

        // Setting again replaces the deadline, even with a later one.
        let later = idle_time + Duration::from_secs(1);
        timers.set(Timer::Timeout, later);
        assert_eq!(timers.get(Timer::Timeout), Some(later));
    }

    #[test]
    fn timer_set_if_earlier() {
        let mut timers = TimerTable::default();
        let now = Instant::now();

        timers.set_if_earlier(Timer::Send, now + Duration::from_millis(10));
        timers.set_if_earlier(Timer::Send, now + Duration::from_millis(20));
        assert_eq!(timers.get(Timer::Send), Some(now + Duration::from_millis(10)));

        timers.set_if_earlier(Timer::Send, now + Duration::from_millis(5));
        assert_eq!(timers.get(Timer::Send), Some(now + Duration::from_millis(5)));
    }

    #[test]
    fn timer_expiration() {
        let mut timers = TimerTable::default();
        let now = Instant::now();
        let rto_time = now + Duration::from_millis(200);
        let idle_time = now + Duration::from_millis(3000);
        timers.set(Timer::Retransmission, rto_time);
        timers.set(Timer::Timeout, idle_time);
        timers.set(Timer::Ack, rto_time);

        assert!(!timers.is_expired(Timer::Retransmission, now));
        assert!(timers.take_expired(now).is_empty());

        let now = rto_time;
        assert!(timers.is_expired(Timer::Retransmission, now));
        assert!(!timers.is_expired(Timer::Timeout, now));
        assert_eq!(
            timers.take_expired(now),
            vec![Timer::Ack, Timer::Retransmission]
        );
        assert!(!timers.is_set(Timer::Retransmission));
        assert_eq!(timers.next_timeout(), Some(idle_time));

        let now = idle_time;
        assert_eq!(timers.take_expired(now), vec![Timer::Timeout]);
        assert_eq!(timers.next_timeout(), None);
    }
}
