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

//! XOR forward error correction.
//!
//! A group protects consecutive packets. Its FEC packet carries the XOR of
//! their payloads, which is enough to rebuild any single missing one.

use std::collections::BTreeSet;

use bytes::Bytes;

use crate::packet::FecData;
use crate::packet::PacketHeader;

fn xor_into(parity: &mut Vec<u8>, payload: &[u8]) {
    if parity.len() < payload.len() {
        parity.resize(payload.len(), 0);
    }
    for (p, b) in parity.iter_mut().zip(payload) {
        *p ^= *b;
    }
}

/// A packet rebuilt from its group.
#[derive(Debug, PartialEq, Eq)]
pub struct RevivedPacket {
    pub sequence_number: u64,

    pub entropy_flag: bool,

    /// The plaintext payload, zero padded to the longest payload of the
    /// group.
    pub payload: Vec<u8>,
}

/// Received packets of an FEC group.
#[derive(Debug, Default)]
pub struct FecGroup {
    /// Protected packets received or revived.
    received_packets: BTreeSet<u64>,

    /// Range of the protected packets, known once the FEC packet arrived.
    protected_range: Option<(u64, u64)>,

    /// XOR of the payloads received, including the redundancy.
    payload_parity: Vec<u8>,

    /// XOR of the entropy flags received.
    entropy_parity: bool,
}

impl FecGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the payload of a protected packet. Returns false if the packet was
    /// seen already or is not protected by the group.
    pub fn update(&mut self, header: &PacketHeader, payload: &[u8]) -> bool {
        let seq = header.sequence_number;
        if self.received_packets.contains(&seq) {
            return false;
        }
        if let Some((min, max)) = self.protected_range {
            if seq < min || seq > max {
                return false;
            }
        }
        self.received_packets.insert(seq);
        self.entropy_parity ^= header.entropy_flag;
        xor_into(&mut self.payload_parity, payload);
        true
    }

    /// Add the redundancy of the group's FEC packet. The group protects the
    /// packets from `fec.fec_group` up to the FEC packet.
    pub fn update_fec(&mut self, header: &PacketHeader, fec: &FecData) -> bool {
        if self.protected_range.is_some() {
            return false;
        }
        let seq = header.sequence_number;
        if fec.fec_group == 0 || fec.fec_group >= seq {
            return false;
        }
        let (min, max) = (fec.fec_group, seq - 1);
        if self.received_packets.iter().any(|&s| s < min || s > max) {
            return false;
        }
        self.protected_range = Some((min, max));
        self.entropy_parity ^= header.entropy_flag;
        xor_into(&mut self.payload_parity, &fec.redundancy);
        true
    }

    pub fn has_received_fec_packet(&self) -> bool {
        self.protected_range.is_some()
    }

    /// Number of protected packets neither received nor revived, if the
    /// range is known.
    pub fn num_missing_packets(&self) -> Option<u64> {
        self.protected_range
            .map(|(min, max)| max - min + 1 - self.received_packets.len() as u64)
    }

    pub fn can_revive(&self) -> bool {
        self.num_missing_packets() == Some(1)
    }

    /// Every protected packet was received or revived.
    pub fn is_finished(&self) -> bool {
        self.num_missing_packets() == Some(0)
    }

    /// Rebuild the single missing packet. A group revives at most one packet.
    pub fn revive(&mut self) -> Option<RevivedPacket> {
        if !self.can_revive() {
            return None;
        }
        let (min, max) = self.protected_range?;
        let seq = (min..=max).find(|s| !self.received_packets.contains(s))?;
        self.received_packets.insert(seq);
        Some(RevivedPacket {
            sequence_number: seq,
            entropy_flag: self.entropy_parity,
            payload: self.payload_parity.clone(),
        })
    }

    /// Whether the group protects packets below `seq`.
    pub fn protecting_packets_before(&self, seq: u64) -> bool {
        match self.protected_range {
            Some((min, _)) => min < seq,
            None => self.received_packets.iter().next().map_or(false, |&s| s < seq),
        }
    }
}

/// The group being built by the sender.
#[derive(Debug)]
struct OpenFecGroup {
    /// The first protected sequence number, which names the group.
    fec_group: u64,

    num_packets: usize,

    payload_parity: Vec<u8>,

    entropy_parity: bool,
}

/// Builds the FEC packets of the sender.
#[derive(Debug)]
pub struct FecBuilder {
    max_packets_per_group: usize,

    group: Option<OpenFecGroup>,
}

impl FecBuilder {
    /// Protect groups of up to `max_packets_per_group` packets, or nothing if
    /// zero.
    pub fn new(max_packets_per_group: usize) -> Self {
        FecBuilder {
            max_packets_per_group,
            group: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_packets_per_group > 0
    }

    /// The group a new data packet `seq` joins, opening one if needed. Zero
    /// when FEC is disabled.
    pub fn fec_group_for(&mut self, seq: u64) -> u64 {
        if !self.is_enabled() {
            return 0;
        }
        self.group
            .get_or_insert_with(|| OpenFecGroup {
                fec_group: seq,
                num_packets: 0,
                payload_parity: Vec::new(),
                entropy_parity: false,
            })
            .fec_group
    }

    /// Add a protected payload to the open group.
    pub fn on_protected_payload(&mut self, entropy_flag: bool, payload: &[u8]) {
        if let Some(group) = self.group.as_mut() {
            group.num_packets += 1;
            group.entropy_parity ^= entropy_flag;
            xor_into(&mut group.payload_parity, payload);
        }
    }

    /// Whether the FEC packet of the open group should be sent. With
    /// `force`, any non empty group is closed.
    pub fn should_send_fec(&self, force: bool) -> bool {
        self.group.as_ref().map_or(false, |g| {
            g.num_packets >= self.max_packets_per_group || (force && g.num_packets > 0)
        })
    }

    pub fn has_open_group(&self) -> bool {
        self.group.is_some()
    }

    /// Close the open group. Returns its redundancy and the entropy flag the
    /// FEC packet must carry.
    pub fn take_fec(&mut self) -> Option<(FecData, bool)> {
        let group = self.group.take()?;
        Some((
            FecData {
                fec_group: group.fec_group,
                redundancy: Bytes::from(group.payload_parity),
            },
            group.entropy_parity,
        ))
    }
}
