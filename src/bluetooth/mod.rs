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

//! BLE GATT peripheral for the token exchange.

pub mod ble_constants;
pub mod bluez;
pub mod callbacks;
pub mod dispatcher;
pub mod error;
pub mod peer;
pub mod rssi;
pub mod server;
pub mod service;
pub mod session;
pub mod write_buffer;

pub use ble_constants::GattStatus;
pub use bluez::{BluezHost, BluezOptions, BluezRssiSampler};
pub use callbacks::{ServerId, TokenCallbacks};
pub use dispatcher::{Dispatcher, EventSink, GattEvent, GattResponse, PeerState};
pub use error::{HostError, RegistrationError, StartError};
pub use peer::Peer;
pub use rssi::{RssiLatches, RssiSampler};
pub use server::{GattHost, HostServer, TokenServer};
pub use service::ServiceDefinition;
pub use session::SessionTable;
pub use write_buffer::{FragmentOutcome, WriteReassemblyBuffer};
