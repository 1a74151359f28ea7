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

//! GATT request handling for the token characteristic.
//!
//! The host translates its own callbacks into [`GattEvent`]s; the dispatcher
//! runs the per-peer state machine and returns the response (if any) the
//! host must send back.

use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ble_constants::{GattStatus, TOKEN_CHARACTERISTIC_UUID};
use super::callbacks::{ServerId, TokenCallbacks};
use super::peer::Peer;
use super::session::SessionTable;
use super::write_buffer::FragmentOutcome;

/// A protocol event delivered by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    Connected {
        peer: Peer,
    },
    Disconnected {
        peer: Peer,
    },
    Read {
        peer: Peer,
        characteristic: Uuid,
        offset: usize,
    },
    /// Write committed immediately.
    WriteSimple {
        peer: Peer,
        characteristic: Uuid,
        value: Vec<u8>,
        response_needed: bool,
    },
    /// Queued write fragment, committed by a later `ExecuteWrite`.
    WritePrepared {
        peer: Peer,
        characteristic: Uuid,
        offset: usize,
        value: Vec<u8>,
        response_needed: bool,
    },
    ExecuteWrite {
        peer: Peer,
        commit: bool,
    },
    DescriptorRead {
        peer: Peer,
        descriptor: Uuid,
    },
    DescriptorWrite {
        peer: Peer,
        descriptor: Uuid,
        response_needed: bool,
    },
    MtuChanged {
        peer: Peer,
        mtu: u16,
    },
    PhyUpdated {
        peer: Peer,
    },
    NotificationSent {
        peer: Peer,
    },
}

impl GattEvent {
    /// Peer that originated the event.
    pub fn peer(&self) -> Peer {
        match self {
            GattEvent::Connected { peer }
            | GattEvent::Disconnected { peer }
            | GattEvent::Read { peer, .. }
            | GattEvent::WriteSimple { peer, .. }
            | GattEvent::WritePrepared { peer, .. }
            | GattEvent::ExecuteWrite { peer, .. }
            | GattEvent::DescriptorRead { peer, .. }
            | GattEvent::DescriptorWrite { peer, .. }
            | GattEvent::MtuChanged { peer, .. }
            | GattEvent::PhyUpdated { peer }
            | GattEvent::NotificationSent { peer } => *peer,
        }
    }
}

/// Reply the host sends to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattResponse {
    pub status: GattStatus,
    pub value: Option<Vec<u8>>,
}

impl GattResponse {
    pub fn success() -> Self {
        Self {
            status: GattStatus::Success,
            value: None,
        }
    }

    pub fn success_with(value: Vec<u8>) -> Self {
        Self {
            status: GattStatus::Success,
            value: Some(value),
        }
    }

    pub fn refused(status: GattStatus) -> Self {
        Self {
            status,
            value: None,
        }
    }
}

/// Prepared-write state of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Idle,
    Accumulating,
}

/// Receives events from the host and answers them.
pub trait EventSink: Send + Sync {
    fn dispatch(&self, event: GattEvent) -> Option<GattResponse>;
}

/// Token characteristic state machine.
pub struct Dispatcher {
    sessions: SessionTable,
    callbacks: Arc<dyn TokenCallbacks>,
}

impl Dispatcher {
    pub fn new(sessions: SessionTable, callbacks: Arc<dyn TokenCallbacks>) -> Self {
        Self {
            sessions,
            callbacks,
        }
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn callbacks(&self) -> &Arc<dyn TokenCallbacks> {
        &self.callbacks
    }

    pub fn peer_state(&self, peer: Peer) -> PeerState {
        match self.sessions.writes().pending_len(peer) {
            Some(_) => PeerState::Accumulating,
            None => PeerState::Idle,
        }
    }

    /// Handle one event. Returns the response to send, if the event asks for one.
    pub fn handle(&self, server: &ServerId, event: GattEvent) -> Option<GattResponse> {
        match event {
            GattEvent::Connected { peer } => {
                info!("Peer connected: {}", peer);
                self.sessions.open(peer);
                None
            }
            GattEvent::Disconnected { peer } => {
                info!("Peer disconnected: {}", peer);
                self.sessions.close(peer);
                None
            }
            GattEvent::Read {
                peer,
                characteristic,
                offset,
            } => Some(self.handle_read(server, peer, characteristic, offset)),
            GattEvent::WriteSimple {
                peer,
                characteristic,
                value,
                response_needed,
            } => {
                let response = self.handle_simple_write(server, peer, characteristic, value);
                response_needed.then_some(response)
            }
            GattEvent::WritePrepared {
                peer,
                characteristic,
                offset,
                value,
                response_needed,
            } => {
                let response = self.handle_prepared_write(peer, characteristic, offset, value);
                response_needed.then_some(response)
            }
            GattEvent::ExecuteWrite { peer, commit } => {
                Some(self.handle_execute_write(server, peer, commit))
            }
            GattEvent::DescriptorRead { peer, descriptor } => {
                debug!("Refusing descriptor read {} from {}", descriptor, peer);
                Some(GattResponse::refused(GattStatus::ReadNotPermitted))
            }
            GattEvent::DescriptorWrite {
                peer,
                descriptor,
                response_needed,
            } => {
                debug!("Refusing descriptor write {} from {}", descriptor, peer);
                response_needed.then(|| GattResponse::refused(GattStatus::WriteNotPermitted))
            }
            GattEvent::MtuChanged { peer, mtu } => {
                debug!("MTU for {} is now {}", peer, mtu);
                None
            }
            GattEvent::PhyUpdated { peer } => {
                debug!("PHY updated for {}", peer);
                None
            }
            GattEvent::NotificationSent { peer } => {
                debug!("Notification sent to {}", peer);
                None
            }
        }
    }

    fn handle_read(
        &self,
        server: &ServerId,
        peer: Peer,
        characteristic: Uuid,
        offset: usize,
    ) -> GattResponse {
        if characteristic != TOKEN_CHARACTERISTIC_UUID {
            warn!("Read of unknown characteristic {} from {}", characteristic, peer);
            return GattResponse::refused(GattStatus::RequestNotSupported);
        }

        let served = self.callbacks.on_token_requested(server).unwrap_or_default();
        debug!(
            "📤 Read from {}: offset={}, {} bytes available",
            peer,
            offset,
            served.len()
        );

        match served.get(offset..) {
            Some(rest) if !rest.is_empty() => GattResponse::success_with(rest.to_vec()),
            _ => {
                warn!(
                    "Read from {} beyond token end: offset={}, len={}",
                    peer,
                    offset,
                    served.len()
                );
                GattResponse::refused(GattStatus::ReadNotPermitted)
            }
        }
    }

    fn handle_simple_write(
        &self,
        server: &ServerId,
        peer: Peer,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> GattResponse {
        if characteristic != TOKEN_CHARACTERISTIC_UUID {
            warn!("Write to unknown characteristic {} from {}", characteristic, peer);
            return GattResponse::refused(GattStatus::RequestNotSupported);
        }

        debug!("📥 Write from {}: {} bytes", peer, value.len());
        self.deliver(server, peer, &value);
        GattResponse::success()
    }

    fn handle_prepared_write(
        &self,
        peer: Peer,
        characteristic: Uuid,
        offset: usize,
        value: Vec<u8>,
    ) -> GattResponse {
        if characteristic != TOKEN_CHARACTERISTIC_UUID {
            warn!(
                "Prepared write to unknown characteristic {} from {}",
                characteristic, peer
            );
            return GattResponse::refused(GattStatus::RequestNotSupported);
        }

        match self.sessions.writes().begin_or_append(peer, offset, &value) {
            FragmentOutcome::Accepted => {
                debug!(
                    "📥 Prepared write from {}: offset={}, {} bytes",
                    peer,
                    offset,
                    value.len()
                );
                GattResponse::success_with(value)
            }
            FragmentOutcome::Rejected => {
                warn!(
                    "Rejected prepared write from {} at offset {} ({} bytes pending)",
                    peer,
                    offset,
                    self.sessions.writes().pending_len(peer).unwrap_or(0)
                );
                GattResponse::refused(GattStatus::WriteNotPermitted)
            }
        }
    }

    fn handle_execute_write(&self, server: &ServerId, peer: Peer, commit: bool) -> GattResponse {
        if !commit {
            debug!("Prepared write cancelled by {}", peer);
            self.sessions.writes().cancel(peer);
            return GattResponse::success();
        }

        match self.sessions.writes().execute(peer) {
            Some(value) => {
                debug!("Executing prepared write from {}: {} bytes", peer, value.len());
                self.deliver(server, peer, &value);
                GattResponse::success()
            }
            None => {
                warn!("Execute write from {} with nothing pending", peer);
                GattResponse::refused(GattStatus::WriteNotPermitted)
            }
        }
    }

    fn deliver(&self, server: &ServerId, peer: Peer, token: &[u8]) {
        let rssi = self.sessions.rssi().value(peer);
        debug!(
            "Token from {} ({:?} dBm): {}",
            peer,
            rssi,
            hex::encode(token)
        );
        self.callbacks.on_token_received(server, token, rssi);
    }
}
