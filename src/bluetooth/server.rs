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

//! Server lifecycle: start, event routing and shutdown.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::callbacks::{ServerId, TokenCallbacks};
use super::dispatcher::{Dispatcher, EventSink, GattEvent, GattResponse};
use super::error::{HostError, RegistrationError, StartError};
use super::peer::Peer;
use super::rssi::RssiSampler;
use super::service::ServiceDefinition;
use super::session::SessionTable;

/// Platform Bluetooth stack able to host a GATT server.
pub trait GattHost: Send + Sync {
    /// Acquire a server handle.
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn HostServer>, HostError>>;
}

/// A server handle obtained from a [`GattHost`].
pub trait HostServer: Send + Sync {
    fn id(&self) -> ServerId;

    /// Publish `service`, routing every incoming request into `sink`.
    fn register<'a>(
        &'a mut self,
        service: &'a ServiceDefinition,
        sink: Arc<dyn EventSink>,
    ) -> BoxFuture<'a, Result<(), RegistrationError>>;

    /// Unpublish and release the handle.
    fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

struct Inner {
    host: Arc<dyn GattHost>,
    dispatcher: Dispatcher,
    service: ServiceDefinition,
    // Set while a server is published; events are dropped when empty.
    active: RwLock<Option<ServerId>>,
    handle: Mutex<Option<Box<dyn HostServer>>>,
}

impl Inner {
    fn dispatch(&self, event: GattEvent) -> Option<GattResponse> {
        // Held for the whole event so close() waits for in-flight events.
        let active = self.active.read();
        match active.as_ref() {
            Some(server) => self.dispatcher.handle(server, event),
            None => {
                warn!("No GATT server, ignoring event from {}", event.peer());
                None
            }
        }
    }
}

/// Routes host events to the server without keeping it alive.
struct SinkRef(Weak<Inner>);

impl EventSink for SinkRef {
    fn dispatch(&self, event: GattEvent) -> Option<GattResponse> {
        match self.0.upgrade() {
            Some(inner) => inner.dispatch(event),
            None => {
                debug!("Server dropped, ignoring event from {}", event.peer());
                None
            }
        }
    }
}

/// GATT server exchanging proximity tokens with connected peers.
#[derive(Clone)]
pub struct TokenServer {
    inner: Arc<Inner>,
}

impl TokenServer {
    pub fn new(
        host: Arc<dyn GattHost>,
        callbacks: Arc<dyn TokenCallbacks>,
        sampler: Arc<dyn RssiSampler>,
        max_value_len: usize,
    ) -> Self {
        let sessions = SessionTable::new(sampler, max_value_len);
        Self {
            inner: Arc::new(Inner {
                host,
                dispatcher: Dispatcher::new(sessions, callbacks),
                service: ServiceDefinition::token_exchange(),
                active: RwLock::new(None),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Acquire the host server and publish the token service.
    ///
    /// Fires `on_server_started` once on success, `on_server_failed` once on
    /// any setup failure. A running server returns `AlreadyRunning` and fires
    /// neither.
    pub async fn start(&self) -> Result<ServerId, StartError> {
        let mut slot = self.inner.handle.lock().await;
        if slot.is_some() {
            warn!("GATT server already running");
            return Err(StartError::AlreadyRunning);
        }

        info!("Starting token GATT server...");
        let callbacks = self.inner.dispatcher.callbacks();

        let mut handle = match self.inner.host.open().await {
            Ok(handle) => handle,
            Err(e) => {
                let err = StartError::HandleUnavailable(e);
                error!("Failed to open GATT server: {}", err);
                callbacks.on_server_failed(None, &err);
                return Err(err);
            }
        };
        let id = handle.id();

        if let Err(e) = self.inner.service.validate() {
            return Err(self.fail_start(handle, &id, e.into()).await);
        }

        // Route events before registration so none are lost once published.
        *self.inner.active.write() = Some(id.clone());

        let sink: Arc<dyn EventSink> = Arc::new(SinkRef(Arc::downgrade(&self.inner)));
        if let Err(e) = handle.register(&self.inner.service, sink).await {
            *self.inner.active.write() = None;
            self.inner.dispatcher.sessions().clear();
            return Err(self.fail_start(handle, &id, e.into()).await);
        }

        *slot = Some(handle);
        info!("GATT server {} started", id);
        callbacks.on_server_started(&id);
        Ok(id)
    }

    async fn fail_start(
        &self,
        handle: Box<dyn HostServer>,
        id: &ServerId,
        err: StartError,
    ) -> StartError {
        error!("GATT server {} failed to start: {}", id, err);
        handle.close().await;
        self.inner
            .dispatcher
            .callbacks()
            .on_server_failed(Some(id), &err);
        err
    }

    /// Shut down the server. Returns whether one was running.
    pub async fn close(&self) -> bool {
        let mut slot = self.inner.handle.lock().await;
        let Some(handle) = slot.take() else {
            debug!("close: no GATT server running");
            return false;
        };

        let id = self.inner.active.write().take();
        self.inner.dispatcher.sessions().clear();
        handle.close().await;

        match id {
            Some(id) => info!("GATT server {} closed", id),
            None => info!("GATT server closed"),
        }
        true
    }

    /// Route one host event. A no-op returning `None` while no server runs.
    pub fn dispatch(&self, event: GattEvent) -> Option<GattResponse> {
        self.inner.dispatch(event)
    }

    // Recursive reads: callbacks run under the dispatch read guard and may
    // ask for these while close() is queued for the write lock.
    pub fn is_running(&self) -> bool {
        self.inner.active.read_recursive().is_some()
    }

    pub fn server_id(&self) -> Option<ServerId> {
        self.inner.active.read_recursive().clone()
    }

    /// Number of peers with live session state.
    pub fn session_count(&self) -> usize {
        self.inner.dispatcher.sessions().peer_count()
    }

    /// True when no peer has a pending write or RSSI latch.
    pub fn sessions_empty(&self) -> bool {
        self.inner.dispatcher.sessions().is_empty()
    }

    pub fn pending_write_len(&self, peer: Peer) -> Option<usize> {
        self.inner.dispatcher.sessions().writes().pending_len(peer)
    }

    pub fn rssi(&self, peer: Peer) -> Option<i16> {
        self.inner.dispatcher.sessions().rssi().value(peer)
    }
}

impl EventSink for TokenServer {
    fn dispatch(&self, event: GattEvent) -> Option<GattResponse> {
        self.inner.dispatch(event)
    }
}
