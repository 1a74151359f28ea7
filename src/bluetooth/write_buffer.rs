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

//! Per-peer reassembly of prepared (queued) writes.
//!
//! A peer opens a prepared write with a fragment at offset 0 and extends it
//! with fragments whose offset equals the bytes accumulated so far. The
//! buffer is consumed by an execute, or discarded by a cancel or disconnect.

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use super::ble_constants::config;
use super::peer::Peer;

/// Result of offering a fragment to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentOutcome {
    Accepted,
    Rejected,
}

/// Prepared-write buffers for all connected peers.
pub struct WriteReassemblyBuffer {
    pending: Mutex<HashMap<Peer, Vec<u8>>>,
    max_value_len: usize,
}

impl WriteReassemblyBuffer {
    pub fn new() -> Self {
        Self::with_max_value_len(config::MAX_VALUE_LEN)
    }

    /// Create a buffer that rejects fragments growing a value past `max_value_len`.
    pub fn with_max_value_len(max_value_len: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            max_value_len,
        }
    }

    /// Append `fragment` if `offset` continues the peer's pending value.
    ///
    /// With no pending value only offset 0 is accepted. A rejected fragment
    /// leaves the buffer untouched.
    pub fn begin_or_append(&self, peer: Peer, offset: usize, fragment: &[u8]) -> FragmentOutcome {
        let mut pending = self.pending.lock();
        let current_len = pending.get(&peer).map_or(0, Vec::len);

        if offset != current_len {
            debug!(
                "Rejecting fragment from {}: offset={}, expected={}",
                peer, offset, current_len
            );
            return FragmentOutcome::Rejected;
        }

        if current_len + fragment.len() > self.max_value_len {
            debug!(
                "Rejecting fragment from {}: {} + {} bytes exceeds {}",
                peer,
                current_len,
                fragment.len(),
                self.max_value_len
            );
            return FragmentOutcome::Rejected;
        }

        pending.entry(peer).or_default().extend_from_slice(fragment);
        FragmentOutcome::Accepted
    }

    /// Remove and return the peer's accumulated value.
    pub fn execute(&self, peer: Peer) -> Option<Vec<u8>> {
        self.pending.lock().remove(&peer)
    }

    /// Discard the peer's pending value, if any.
    pub fn cancel(&self, peer: Peer) {
        self.pending.lock().remove(&peer);
    }

    /// Forget everything about a disconnected peer.
    pub fn drop_all(&self, peer: Peer) {
        self.cancel(peer);
    }

    /// Bytes accumulated so far, or `None` when no prepared write is open.
    pub fn pending_len(&self, peer: Peer) -> Option<usize> {
        self.pending.lock().get(&peer).map(Vec::len)
    }

    /// Discard every pending value.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl Default for WriteReassemblyBuffer {
    fn default() -> Self {
        Self::new()
    }
}
