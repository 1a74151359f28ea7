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

//! Hooks through which the server talks to the application.

use std::fmt;

use super::error::StartError;

/// Identifies one running instance of the GATT server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Application side of the token exchange.
///
/// Called from whatever thread delivered the triggering event. Event
/// callbacks run while the server holds its dispatch guard, so `close()`
/// waits for them to return. A callback may query the server
/// state (`is_running`, `server_id`) but must not dispatch events or block
/// on a `close()` of the same server.
pub trait TokenCallbacks: Send + Sync {
    /// A peer delivered a complete token.
    fn on_token_received(&self, server: &ServerId, token: &[u8], rssi: Option<i16>);

    /// Bytes to serve to a reading peer. `None` serves nothing.
    fn on_token_requested(&self, server: &ServerId) -> Option<Vec<u8>>;

    fn on_server_started(&self, server: &ServerId);

    /// `server` is `None` when no handle could be obtained.
    fn on_server_failed(&self, server: Option<&ServerId>, error: &StartError);
}
