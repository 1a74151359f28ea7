//! In-memory GATT host for integration tests.
//!
//! Records every lifecycle call and keeps the event sink the server
//! registers, so tests can play the part of the Bluetooth stack.

#![allow(dead_code)]

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use proxitoken::bluetooth::{
    EventSink, GattEvent, GattHost, GattResponse, HostError, HostServer, Peer, RegistrationError,
    RssiSampler, ServerId, ServiceDefinition, StartError, TokenCallbacks, TokenServer,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ── Mock host ─────────────────────────────────────────────────

#[derive(Default)]
pub struct HostState {
    pub sink: Option<Arc<dyn EventSink>>,
    pub registered: Vec<ServiceDefinition>,
    pub fail_open: bool,
    pub fail_register: Option<RegistrationError>,
}

#[derive(Default)]
pub struct MockHost {
    pub state: Arc<Mutex<HostState>>,
    pub opened: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
}

impl MockHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver an event the way a real host would, through the registered sink.
    pub fn deliver(&self, event: GattEvent) -> Option<GattResponse> {
        let sink = self.state.lock().sink.clone();
        sink.and_then(|sink| sink.dispatch(event))
    }

    pub fn has_sink(&self) -> bool {
        self.state.lock().sink.is_some()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl GattHost for MockHost {
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn HostServer>, HostError>> {
        async move {
            if self.state.lock().fail_open {
                return Err(HostError::AdapterUnavailable("mock adapter off".to_string()));
            }
            let n = self.opened.fetch_add(1, Ordering::SeqCst);
            let server: Box<dyn HostServer> = Box::new(MockServer {
                id: ServerId::new(format!("mock-{}", n)),
                state: self.state.clone(),
                closed: self.closed.clone(),
            });
            Ok(server)
        }
        .boxed()
    }
}

struct MockServer {
    id: ServerId,
    state: Arc<Mutex<HostState>>,
    closed: Arc<AtomicUsize>,
}

impl HostServer for MockServer {
    fn id(&self) -> ServerId {
        self.id.clone()
    }

    fn register<'a>(
        &'a mut self,
        service: &'a ServiceDefinition,
        sink: Arc<dyn EventSink>,
    ) -> BoxFuture<'a, Result<(), RegistrationError>> {
        async move {
            let mut state = self.state.lock();
            if let Some(e) = state.fail_register.clone() {
                return Err(e);
            }
            state.registered.push(service.clone());
            state.sink = Some(sink);
            Ok(())
        }
        .boxed()
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
        async move {
            self.state.lock().sink = None;
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
    }
}

// ── Application callbacks ─────────────────────────────────────

#[derive(Default)]
pub struct Recorder {
    pub received: Mutex<Vec<(Vec<u8>, Option<i16>)>>,
    pub served: Mutex<Option<Vec<u8>>>,
    pub started: Mutex<Vec<ServerId>>,
    pub failed: Mutex<Vec<(Option<ServerId>, StartError)>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serving(token: &[u8]) -> Arc<Self> {
        let recorder = Self::default();
        *recorder.served.lock() = Some(token.to_vec());
        Arc::new(recorder)
    }

    pub fn tokens(&self) -> Vec<Vec<u8>> {
        self.received.lock().iter().map(|(t, _)| t.clone()).collect()
    }
}

impl TokenCallbacks for Recorder {
    fn on_token_received(&self, _server: &ServerId, token: &[u8], rssi: Option<i16>) {
        self.received.lock().push((token.to_vec(), rssi));
    }

    fn on_token_requested(&self, _server: &ServerId) -> Option<Vec<u8>> {
        self.served.lock().clone()
    }

    fn on_server_started(&self, server: &ServerId) {
        self.started.lock().push(server.clone());
    }

    fn on_server_failed(&self, server: Option<&ServerId>, error: &StartError) {
        self.failed.lock().push((server.cloned(), error.clone()));
    }
}

// ── RSSI samplers ─────────────────────────────────────────────

/// Hands out scripted readings in order; `None` never resolves.
pub struct ScriptedSampler(Mutex<VecDeque<Option<i16>>>);

impl ScriptedSampler {
    pub fn new(readings: impl IntoIterator<Item = Option<i16>>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(readings.into_iter().collect())))
    }
}

impl RssiSampler for ScriptedSampler {
    fn sample(&self, _peer: Peer) -> BoxFuture<'static, Option<i16>> {
        match self.0.lock().pop_front().flatten() {
            Some(rssi) => async move { Some(rssi) }.boxed(),
            None => futures::future::pending().boxed(),
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────

pub const MAX_VALUE_LEN: usize = 512;

pub fn server_with(
    host: &Arc<MockHost>,
    recorder: &Arc<Recorder>,
    sampler: Arc<dyn RssiSampler>,
) -> TokenServer {
    TokenServer::new(host.clone(), recorder.clone(), sampler, MAX_VALUE_LEN)
}

pub fn peer(n: u8) -> Peer {
    Peer::new([0x02, 0, 0, 0, 0, n])
}

/// Let spawned RSSI tasks run.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}
