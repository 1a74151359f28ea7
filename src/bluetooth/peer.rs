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

//! Identity of a connected remote device.

use std::fmt;

/// A remote connection endpoint, keyed by its 48-bit device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Peer([u8; 6]);

impl Peer {
    pub const fn new(address: [u8; 6]) -> Self {
        Self(address)
    }

    /// Address bytes, most significant first.
    pub fn address(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

impl From<bluer::Address> for Peer {
    fn from(address: bluer::Address) -> Self {
        Self(address.0)
    }
}

impl From<Peer> for bluer::Address {
    fn from(peer: Peer) -> Self {
        bluer::Address::new(peer.0)
    }
}
