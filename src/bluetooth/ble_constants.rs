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

//! UUIDs and protocol constants for the token exchange service.

use uuid::Uuid;

/// Primary service carrying the token characteristic.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x8a3c0e10_5b2f_4d57_9c1e_7f0e2b6a9d40);

/// Token characteristic (read + write).
pub const TOKEN_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x8a3c0e11_5b2f_4d57_9c1e_7f0e2b6a9d40);

/// ATT status codes sent back to peers.
///
/// Values match the Bluetooth Core ATT error codes so peers see the same
/// result regardless of host stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GattStatus {
    Success = 0x00,
    ReadNotPermitted = 0x02,
    WriteNotPermitted = 0x03,
    RequestNotSupported = 0x06,
}

impl GattStatus {
    /// Raw ATT code.
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        self == GattStatus::Success
    }
}

/// Tunables with their defaults.
pub mod config {
    /// Largest value a characteristic may hold (ATT maximum attribute length).
    pub const MAX_VALUE_LEN: usize = 512;

    /// Interval between RSSI polls while the latch is empty.
    pub const RSSI_POLL_INTERVAL_MS: u64 = 250;

    /// Number of RSSI polls before giving up on a peer.
    pub const RSSI_MAX_ATTEMPTS: u32 = 20;

    /// Interval between BlueZ connection-state polls.
    pub const CONNECTION_POLL_INTERVAL_MS: u64 = 1000;
}
