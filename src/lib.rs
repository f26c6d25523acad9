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

//! The reliability and congestion control core of a QUIC connection.
//!
//! It turns an unreliable datagram channel into a connection with
//! acknowledged, retransmitted and congestion controlled delivery.
//!
//! ## Components
//!
//! * **SentPacketManager**: tracks the packets in flight, processes acks and
//!   decides what to retransmit and when, using nack based fast retransmit,
//!   early retransmit, tail loss probes and retransmission timeouts.
//! * **Send algorithms**: CUBIC (or Reno) and a fixed rate sender, optionally
//!   wrapped by a pacing sender which smooths bursts.
//! * **Connection**: validates incoming packets, acks and stop-waiting
//!   frames, recovers lost packets with XOR forward error correction, and
//!   drives the ack, retransmission, send and timeout alarms.
//!
//! The wire format, the crypto handshake and socket I/O are left to the
//! owner, which plugs them in through the [`framer::Framer`], [`Clock`] and
//! [`PacketWriter`] traits.

use std::cmp;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;
use std::time::Instant;

use crate::error::ConnectionError;
use crate::frame::RstStreamFrame;
use crate::frame::StreamFrame;

/// QUIC version Q018.
pub const QUIC_VERSION_Q018: u32 = 0x5130_3138;

/// QUIC version Q019.
pub const QUIC_VERSION_Q019: u32 = 0x5130_3139;

/// The current QUIC wire version.
pub const QUIC_VERSION: u32 = QUIC_VERSION_Q019;

/// Versions supported by default, most preferred first.
pub const SUPPORTED_VERSIONS: [u32; 2] = [QUIC_VERSION_Q019, QUIC_VERSION_Q018];

/// Default maximum length of an outgoing packet.
pub const DEFAULT_MAX_PACKET_LENGTH: usize = 1200;

/// The largest packet that fits in an ethernet frame over IPv6.
pub const MAX_PACKET_LENGTH: usize = 1452;

/// The smallest packet length a connection may be configured with.
const MIN_PACKET_LENGTH: usize = 256;

/// The maximum number of undecryptable packets that can be buffered.
const MAX_UNDECRYPTABLE_PACKETS: usize = 10;

/// The timer granularity.
pub const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

/// Default idle connection timeout.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default delay of an ack for non crypto data.
const DEFAULT_DELAYED_ACK_TIME: Duration = Duration::from_millis(25);

/// Default receive window advertised in TCP congestion feedback.
const DEFAULT_RECEIVE_WINDOW: u64 = 256_000;

/// The RTT used before any sample is taken.
const INITIAL_RTT: Duration = Duration::from_millis(100);

/// Lower bound of the retransmission timeout.
const MIN_RTO: Duration = Duration::from_millis(200);

/// Upper bound of the retransmission timeout.
const MAX_RTO: Duration = Duration::from_secs(60);

/// Default number of tail loss probes before a retransmission timeout.
const DEFAULT_MAX_TAIL_LOSS_PROBES: usize = 2;

/// Default number of packets retransmitted on a retransmission timeout.
const DEFAULT_MAX_RTO_PACKETS: usize = 2;

/// A specialized [`Result`] type for quic operations.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;

/// Configurations of a connection.
#[derive(Debug, Clone)]
pub struct Config {
    /// Idle timeout of the connection.
    idle_timeout: Duration,

    /// Overall lifetime of the connection. Zero means no limit.
    overall_timeout: Duration,

    /// Number of packets protected by one FEC group. Zero disables FEC.
    max_packets_per_fec_group: usize,

    /// Versions the endpoint speaks, most preferred first.
    supported_versions: Vec<u32>,

    /// Maximum delay of an ack for non crypto data.
    delayed_ack_time: Duration,

    /// Buffer size for packets which could not be decrypted yet.
    max_undecryptable_packets: usize,

    /// Receive window advertised in TCP congestion feedback.
    receive_window: u64,

    /// Configurations about loss recovery and congestion control.
    recovery: RecoveryConfig,
}

impl Config {
    /// Create default configuration.
    ///
    /// The configuration may be customized by calling related set methods.
    ///
    /// ## Examples:
    ///
    /// ```
    /// let mut conf = tquic_recovery::Config::new()?;
    /// conf.set_idle_timeout(30000);
    /// conf.set_max_packets_per_fec_group(10);
    /// # Ok::<(), tquic_recovery::error::Error>(())
    /// ```
    pub fn new() -> Result<Self> {
        Ok(Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            overall_timeout: Duration::ZERO,
            max_packets_per_fec_group: 0,
            supported_versions: SUPPORTED_VERSIONS.to_vec(),
            delayed_ack_time: DEFAULT_DELAYED_ACK_TIME,
            max_undecryptable_packets: MAX_UNDECRYPTABLE_PACKETS,
            receive_window: DEFAULT_RECEIVE_WINDOW,
            recovery: RecoveryConfig::default(),
        })
    }

    /// Set the idle connection timeout in milliseconds. Zero turns the
    /// timeout off. The default value is `30000`.
    pub fn set_idle_timeout(&mut self, v: u64) {
        self.idle_timeout = Duration::from_millis(v);
    }

    /// Set the overall connection timeout in milliseconds, measured from the
    /// creation of the connection. Zero turns the timeout off, which is the
    /// default.
    pub fn set_overall_timeout(&mut self, v: u64) {
        self.overall_timeout = Duration::from_millis(v);
    }

    /// Set the number of packets protected by one FEC group. Zero disables
    /// FEC, which is the default.
    pub fn set_max_packets_per_fec_group(&mut self, v: usize) {
        self.max_packets_per_fec_group = v;
    }

    /// Set the maximum length of outgoing packets in bytes.
    /// The default value is `1200`.
    pub fn set_max_packet_length(&mut self, v: usize) {
        self.recovery.max_datagram_size = v.clamp(MIN_PACKET_LENGTH, MAX_PACKET_LENGTH);
    }

    /// Set the versions the endpoint speaks, most preferred first.
    pub fn set_supported_versions(&mut self, versions: Vec<u32>) -> Result<()> {
        if versions.is_empty() {
            return Err(Error::InvalidConfig("no supported version".into()));
        }
        self.supported_versions = versions;
        Ok(())
    }

    /// Set the maximum delay of an ack in milliseconds. Acks of crypto
    /// stream data are never delayed. The default value is `25`.
    pub fn set_delayed_ack_time(&mut self, v: u64) {
        self.delayed_ack_time = Duration::from_millis(v);
    }

    /// Set the number of packets buffered while they cannot be decrypted.
    /// The default value is `10`.
    pub fn set_max_undecryptable_packets(&mut self, v: usize) {
        self.max_undecryptable_packets = v;
    }

    /// Set the receive window in bytes advertised in TCP congestion feedback.
    /// The default value is `256000`.
    pub fn set_receive_window(&mut self, v: u64) {
        self.receive_window = v;
    }

    /// Set congestion control algorithm that the connection would use.
    /// The default value is Cubic.
    pub fn set_congestion_control_algorithm(&mut self, cca: CongestionControlAlgorithm) {
        self.recovery.congestion_control_algorithm = cca;
    }

    /// Set the initial congestion window in packets. It is kept between the
    /// minimal and the maximal congestion window.
    /// The default value is 10.
    pub fn set_initial_congestion_window(&mut self, packets: u64) {
        self.recovery.initial_congestion_window = packets.clamp(
            self.recovery.min_congestion_window,
            self.recovery.max_congestion_window,
        );
    }

    /// Set the minimal congestion window in packets.
    /// The default value is 2.
    pub fn set_min_congestion_window(&mut self, packets: u64) {
        self.recovery.min_congestion_window = cmp::max(packets, 1);
    }

    /// Set the maximal congestion window in packets.
    /// The default value is 200.
    pub fn set_max_congestion_window(&mut self, packets: u64) {
        self.recovery.max_congestion_window =
            cmp::max(packets, self.recovery.min_congestion_window);
    }

    /// Set the initial RTT in milliseconds. The default value is 100ms.
    ///
    /// The configuration should be changed with caution. Setting a value less than the default
    /// will cause retransmission of handshake packets to be more aggressive.
    pub fn set_initial_rtt(&mut self, millis: u64) {
        self.recovery.initial_rtt = cmp::max(Duration::from_millis(millis), TIMER_GRANULARITY);
    }

    /// Set the lower bound of the retransmission timeout in milliseconds.
    /// The default value is 200ms.
    pub fn set_min_rto(&mut self, millis: u64) {
        self.recovery.min_rto = cmp::max(Duration::from_millis(millis), TIMER_GRANULARITY);
    }

    /// Set the upper bound of the retransmission timeout in milliseconds.
    /// The default value is 60000ms.
    pub fn set_max_rto(&mut self, millis: u64) {
        self.recovery.max_rto = cmp::max(Duration::from_millis(millis), self.recovery.min_rto);
    }

    /// Set the number of tail loss probes sent before a retransmission
    /// timeout. The default value is 2.
    pub fn set_max_tail_loss_probes(&mut self, v: usize) {
        self.recovery.max_tail_loss_probes = v;
    }

    /// Set the number of packets retransmitted on a retransmission timeout.
    /// The default value is 2.
    pub fn set_max_rto_packets(&mut self, v: usize) {
        self.recovery.max_rto_packets = cmp::max(v, 1);
    }

    /// Enable pacing to smooth the flow of packets sent onto the network.
    /// The default value is false.
    pub fn enable_pacing(&mut self, v: bool) {
        self.recovery.enable_pacing = v;
    }

    /// Set clock granularity used by the pacer in milliseconds.
    /// The default value is 1ms.
    pub fn set_pacing_granularity(&mut self, millis: u64) {
        self.recovery.pacing_granularity =
            cmp::max(Duration::from_millis(millis), TIMER_GRANULARITY);
    }

    /// Set the bitrate the fixed rate sender starts with, in bytes per
    /// second. The default value is `100000`.
    pub fn set_fix_rate_initial_bitrate(&mut self, bytes_per_second: u64) {
        self.recovery.fix_rate_initial_bitrate =
            Bandwidth::from_bytes_per_second(cmp::max(bytes_per_second, 1));
    }
}

/// Configurations about loss recovery and congestion control.
#[doc(hidden)]
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// The maximum size of outgoing packets.
    pub max_datagram_size: usize,

    /// The congestion control algorithm used by the connection.
    pub congestion_control_algorithm: CongestionControlAlgorithm,

    /// The minimal congestion window in packets.
    pub min_congestion_window: u64,

    /// The initial congestion window in packets.
    pub initial_congestion_window: u64,

    /// The maximal congestion window in packets.
    pub max_congestion_window: u64,

    /// The initial rtt, used before real rtt is estimated.
    pub initial_rtt: Duration,

    /// Lower bound of the retransmission timeout.
    pub min_rto: Duration,

    /// Upper bound of the retransmission timeout.
    pub max_rto: Duration,

    /// Tail loss probes sent before a retransmission timeout.
    pub max_tail_loss_probes: usize,

    /// Packets retransmitted on a retransmission timeout.
    pub max_rto_packets: usize,

    /// Enable pacing to smooth the flow of packets sent onto the network.
    pub enable_pacing: bool,

    /// Clock granularity used by the pacer.
    pub pacing_granularity: Duration,

    /// The bitrate of the fixed rate sender until the receiver asks for
    /// another one.
    pub fix_rate_initial_bitrate: Bandwidth,
}

impl Default for RecoveryConfig {
    fn default() -> RecoveryConfig {
        RecoveryConfig {
            max_datagram_size: DEFAULT_MAX_PACKET_LENGTH,
            congestion_control_algorithm: CongestionControlAlgorithm::Cubic,
            min_congestion_window: 2_u64,
            initial_congestion_window: 10_u64,
            max_congestion_window: 200_u64,
            initial_rtt: INITIAL_RTT,
            min_rto: MIN_RTO,
            max_rto: MAX_RTO,
            max_tail_loss_probes: DEFAULT_MAX_TAIL_LOSS_PROBES,
            max_rto_packets: DEFAULT_MAX_RTO_PACKETS,
            enable_pacing: false,
            pacing_granularity: Duration::from_millis(1),
            fix_rate_initial_bitrate: Bandwidth::from_kbytes_per_second(100),
        }
    }
}

/// Source of monotonic time.
pub trait Clock {
    /// The current time.
    fn now(&self) -> Instant;

    /// A cheaper and possibly stale version of `now()`.
    fn approximate_now(&self) -> Instant {
        self.now()
    }
}

/// Clock backed by `Instant::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Outcome of a packet write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Ok,

    /// The socket can not take the packet now. The writer tells the
    /// connection when it becomes writable again.
    Blocked,

    /// The socket failed.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub status: WriteStatus,

    pub bytes_written: usize,

    /// Platform error code, meaningful with `WriteStatus::Error`.
    pub error_code: i32,
}

impl WriteResult {
    pub fn ok(bytes_written: usize) -> Self {
        WriteResult {
            status: WriteStatus::Ok,
            bytes_written,
            error_code: 0,
        }
    }

    pub fn blocked() -> Self {
        WriteResult {
            status: WriteStatus::Blocked,
            bytes_written: 0,
            error_code: 0,
        }
    }

    pub fn error(error_code: i32) -> Self {
        WriteResult {
            status: WriteStatus::Error,
            bytes_written: 0,
            error_code,
        }
    }
}

/// Writes packets to the socket.
pub trait PacketWriter {
    fn write_packet(
        &mut self,
        buf: &[u8],
        self_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> WriteResult;

    /// Whether the last write was blocked and the socket is not writable yet.
    fn is_write_blocked(&self) -> bool;

    /// The socket became writable.
    fn set_writable(&mut self);
}

/// Events sent from a Connection to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A stream frame was received.
    StreamFrame(StreamFrame),

    /// A RST_STREAM frame was received.
    RstStream(RstStreamFrame),

    /// Version negotiation completed with the given version.
    VersionNegotiated(u32),

    /// The writer blocked. The owner should call `on_can_write()` once the
    /// socket is writable.
    WriteBlocked,

    /// The connection may send new data.
    CanWrite,

    /// The connection is closed. No further event follows.
    Closed(ConnectionError),
}

#[derive(Default)]
struct EventQueue(Option<VecDeque<Event>>);

impl EventQueue {
    /// Enable the event queue.
    fn enable(&mut self) {
        self.0 = Some(VecDeque::new());
    }

    /// Add an owner-facing event.
    fn add(&mut self, e: Event) -> bool {
        if let Some(events) = &mut self.0 {
            events.push_back(e);
            return true;
        }
        false
    }

    /// Return an owner-facing event.
    fn poll(&mut self) -> Option<Event> {
        if let Some(events) = &mut self.0 {
            return events.pop_front();
        }
        None
    }

    /// Check whether the event queue is empty.
    fn is_empty(&self) -> bool {
        if let Some(events) = &self.0 {
            return events.is_empty();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[ctor::ctor]
    fn init() {
        env_logger::builder()
            .filter_level(log::LevelFilter::Trace)
            .format_timestamp_millis()
            .is_test(true)
            .init();
    }

    #[test]
    fn initial_rtt() -> Result<()> {
        let mut config = Config::new()?;

        config.set_initial_rtt(0);
        assert_eq!(config.recovery.initial_rtt, TIMER_GRANULARITY);

        config.set_initial_rtt(100);
        assert_eq!(config.recovery.initial_rtt, Duration::from_millis(100));

        Ok(())
    }

    #[test]
    fn rto_bounds() -> Result<()> {
        let mut config = Config::new()?;
        assert_eq!(config.recovery.min_rto, MIN_RTO);
        assert_eq!(config.recovery.max_rto, MAX_RTO);

        config.set_min_rto(0);
        assert_eq!(config.recovery.min_rto, TIMER_GRANULARITY);

        config.set_min_rto(500);
        config.set_max_rto(100);
        assert_eq!(config.recovery.max_rto, Duration::from_millis(500));

        config.set_max_rto(300000);
        assert_eq!(config.recovery.max_rto, Duration::from_millis(300000));

        Ok(())
    }

    #[test]
    fn congestion_window() -> Result<()> {
        let mut config = Config::new()?;
        assert_eq!(config.recovery.initial_congestion_window, 10);

        config.set_initial_congestion_window(1000);
        assert_eq!(config.recovery.initial_congestion_window, 200);

        config.set_initial_congestion_window(0);
        assert_eq!(config.recovery.initial_congestion_window, 2);

        config.set_min_congestion_window(0);
        assert_eq!(config.recovery.min_congestion_window, 1);

        config.set_max_congestion_window(0);
        assert_eq!(config.recovery.max_congestion_window, 1);

        Ok(())
    }

    #[test]
    fn max_packet_length() -> Result<()> {
        let mut config = Config::new()?;
        assert_eq!(config.recovery.max_datagram_size, DEFAULT_MAX_PACKET_LENGTH);

        config.set_max_packet_length(65535);
        assert_eq!(config.recovery.max_datagram_size, MAX_PACKET_LENGTH);

        config.set_max_packet_length(10);
        assert_eq!(config.recovery.max_datagram_size, MIN_PACKET_LENGTH);

        Ok(())
    }

    #[test]
    fn supported_versions() -> Result<()> {
        let mut config = Config::new()?;
        assert_eq!(config.supported_versions, SUPPORTED_VERSIONS.to_vec());

        assert_eq!(
            config.set_supported_versions(vec![]),
            Err(Error::InvalidConfig("no supported version".into()))
        );

        config.set_supported_versions(vec![QUIC_VERSION_Q018])?;
        assert_eq!(config.supported_versions, vec![QUIC_VERSION_Q018]);

        Ok(())
    }

    #[test]
    fn timeouts() -> Result<()> {
        let mut config = Config::new()?;
        assert_eq!(config.idle_timeout, DEFAULT_IDLE_TIMEOUT);
        assert_eq!(config.overall_timeout, Duration::ZERO);

        config.set_idle_timeout(5000);
        config.set_overall_timeout(60000);
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.overall_timeout, Duration::from_secs(60));

        Ok(())
    }

    #[test]
    fn event_queue() {
        let mut queue = EventQueue::default();
        assert!(!queue.add(Event::CanWrite));
        assert!(queue.is_empty());

        queue.enable();
        assert!(queue.add(Event::WriteBlocked));
        assert!(queue.add(Event::VersionNegotiated(QUIC_VERSION)));
        assert!(!queue.is_empty());
        assert_eq!(queue.poll(), Some(Event::WriteBlocked));
        assert_eq!(queue.poll(), Some(Event::VersionNegotiated(QUIC_VERSION)));
        assert_eq!(queue.poll(), None);
    }
}

pub use crate::congestion_control::Bandwidth;
pub use crate::congestion_control::CongestionControlAlgorithm;
pub use crate::connection::Connection;
pub use crate::connection::ConnectionStats;
pub use crate::connection::VersionNegotiationState;
pub use crate::error::Error;
pub use crate::packet::PacketHeader;

#[path = "connection/connection.rs"]
pub mod connection;

#[path = "congestion_control/congestion_control.rs"]
pub mod congestion_control;

pub mod error;
pub mod frame;
pub mod framer;
pub mod packet;
