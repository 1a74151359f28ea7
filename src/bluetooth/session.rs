// Copyright 2026 Proxitoken Team
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

//! Per-peer session state: pending prepared writes and RSSI latches.

use std::sync::Arc;
use tracing::debug;

use super::peer::Peer;
use super::rssi::{RssiLatches, RssiSampler};
use super::write_buffer::WriteReassemblyBuffer;

/// Everything the server remembers about connected peers.
pub struct SessionTable {
    writes: WriteReassemblyBuffer,
    rssi: RssiLatches,
}

impl SessionTable {
    pub fn new(sampler: Arc<dyn RssiSampler>, max_value_len: usize) -> Self {
        Self {
            writes: WriteReassemblyBuffer::with_max_value_len(max_value_len),
            rssi: RssiLatches::new(sampler),
        }
    }

    pub fn writes(&self) -> &WriteReassemblyBuffer {
        &self.writes
    }

    pub fn rssi(&self) -> &RssiLatches {
        &self.rssi
    }

    /// Start tracking a newly connected peer.
    ///
    /// Leftovers from an earlier connection are discarded first.
    pub fn open(&self, peer: Peer) {
        self.writes.drop_all(peer);
        self.rssi.start(peer);
    }

    /// Drop all state for a disconnected peer.
    pub fn close(&self, peer: Peer) {
        self.writes.drop_all(peer);
        self.rssi.cancel(peer);
        debug!("Session state cleared for {}", peer);
    }

    /// Cancel every latch and discard every pending write.
    pub fn clear(&self) {
        self.rssi.cancel_all();
        self.writes.clear();
    }

    /// Number of peers with a live RSSI latch.
    pub fn peer_count(&self) -> usize {
        self.rssi.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.rssi.is_empty()
    }
}
