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

//! Application side of the server: callbacks and the event loop behind them.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bluetooth::{ServerId, StartError, TokenCallbacks};

/// Events forwarded from the GATT server to the main loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Started {
        server: ServerId,
    },
    Failed {
        server: Option<ServerId>,
        reason: String,
    },
    TokenReceived {
        server: ServerId,
        token: Vec<u8>,
        rssi: Option<i16>,
        received_at: DateTime<Utc>,
    },
}

/// [`TokenCallbacks`] that serves a fixed token and forwards everything else
/// over a channel.
pub struct ChannelCallbacks {
    token: RwLock<Option<Vec<u8>>>,
    event_tx: mpsc::UnboundedSender<ServerEvent>,
}

impl ChannelCallbacks {
    pub fn new(token: Option<Vec<u8>>, event_tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            token: RwLock::new(token),
            event_tx,
        }
    }

    /// Replace the token served to peers.
    pub fn set_token(&self, token: Option<Vec<u8>>) {
        *self.token.write() = token;
    }

    fn send(&self, event: ServerEvent) {
        if self.event_tx.send(event).is_err() {
            warn!("Event loop gone, dropping server event");
        }
    }
}

impl TokenCallbacks for ChannelCallbacks {
    fn on_token_received(&self, server: &ServerId, token: &[u8], rssi: Option<i16>) {
        self.send(ServerEvent::TokenReceived {
            server: server.clone(),
            token: token.to_vec(),
            rssi,
            received_at: Utc::now(),
        });
    }

    fn on_token_requested(&self, _server: &ServerId) -> Option<Vec<u8>> {
        self.token.read().clone()
    }

    fn on_server_started(&self, server: &ServerId) {
        self.send(ServerEvent::Started {
            server: server.clone(),
        });
    }

    fn on_server_failed(&self, server: Option<&ServerId>, error: &StartError) {
        self.send(ServerEvent::Failed {
            server: server.cloned(),
            reason: error.to_string(),
        });
    }
}

/// A token delivered by a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedToken {
    pub token: Vec<u8>,
    pub rssi: Option<i16>,
    pub received_at: DateTime<Utc>,
}

/// Consumes [`ServerEvent`]s.
#[derive(Debug, Default)]
pub struct EventProcessor {
    running: Option<ServerId>,
    received: u64,
    received_with_rssi: u64,
    last: Option<ReceivedToken>,
}

impl EventProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a single event.
    pub fn process_event(&mut self, event: ServerEvent) -> Result<()> {
        match event {
            ServerEvent::Started { server } => {
                info!("Token server {} is up", server);
                self.running = Some(server);
            }
            ServerEvent::Failed { server, reason } => {
                error!(
                    "Token server {} failed: {}",
                    server.as_ref().map_or("<none>", ServerId::as_str),
                    reason
                );
                self.running = None;
                anyhow::bail!("token server failed to start: {}", reason);
            }
            ServerEvent::TokenReceived {
                server,
                token,
                rssi,
                received_at,
            } => {
                match rssi {
                    Some(rssi) => info!(
                        "Token received on {}: {} ({} dBm)",
                        server,
                        hex::encode(&token),
                        rssi
                    ),
                    None => info!(
                        "Token received on {}: {} (no RSSI)",
                        server,
                        hex::encode(&token)
                    ),
                }

                self.received += 1;
                if rssi.is_some() {
                    self.received_with_rssi += 1;
                }
                self.last = Some(ReceivedToken {
                    token,
                    rssi,
                    received_at,
                });
                debug!(
                    "Tokens so far: {} ({} with RSSI)",
                    self.received, self.received_with_rssi
                );
            }
        }
        Ok(())
    }

    pub fn running(&self) -> Option<&ServerId> {
        self.running.as_ref()
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn received_with_rssi(&self) -> u64 {
        self.received_with_rssi
    }

    pub fn last(&self) -> Option<&ReceivedToken> {
        self.last.as_ref()
    }
}
