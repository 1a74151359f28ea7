//! End-to-end behaviour of the token server against an in-memory host.

mod common;

use common::*;
use proxitoken::bluetooth::ble_constants::TOKEN_CHARACTERISTIC_UUID;
use proxitoken::bluetooth::{
    GattEvent, GattResponse, GattStatus, Peer, RegistrationError, StartError,
};
use std::sync::{Arc, Barrier};

fn prepared(peer: Peer, offset: usize, value: &[u8]) -> GattEvent {
    GattEvent::WritePrepared {
        peer,
        characteristic: TOKEN_CHARACTERISTIC_UUID,
        offset,
        value: value.to_vec(),
        response_needed: true,
    }
}

fn simple(peer: Peer, value: &[u8]) -> GattEvent {
    GattEvent::WriteSimple {
        peer,
        characteristic: TOKEN_CHARACTERISTIC_UUID,
        value: value.to_vec(),
        response_needed: true,
    }
}

fn execute(peer: Peer, commit: bool) -> GattEvent {
    GattEvent::ExecuteWrite { peer, commit }
}

fn read(peer: Peer, offset: usize) -> GattEvent {
    GattEvent::Read {
        peer,
        characteristic: TOKEN_CHARACTERISTIC_UUID,
        offset,
    }
}

fn status(response: Option<GattResponse>) -> GattStatus {
    response.expect("a response").status
}

// ── Lifecycle ─────────────────────────────────────────────────

#[tokio::test]
async fn start_registers_single_read_write_characteristic() {
    let host = MockHost::new();
    let recorder = Recorder::new();
    let server = server_with(&host, &recorder, ScriptedSampler::new([]));

    let id = server.start().await.expect("server starts");

    assert!(server.is_running());
    assert_eq!(server.server_id(), Some(id.clone()));
    assert_eq!(*recorder.started.lock(), vec![id]);
    assert!(recorder.failed.lock().is_empty());

    let registered = host.state.lock().registered.clone();
    assert_eq!(registered.len(), 1);
    assert!(registered[0].primary);
    assert_eq!(registered[0].characteristics.len(), 1);
    let properties = registered[0].characteristics[0].properties;
    assert!(properties.read && properties.write);
}

#[tokio::test]
async fn start_twice_reports_already_running() {
    let host = MockHost::new();
    let recorder = Recorder::new();
    let server = server_with(&host, &recorder, ScriptedSampler::new([]));

    server.start().await.expect("server starts");
    assert_eq!(server.start().await, Err(StartError::AlreadyRunning));

    assert_eq!(recorder.started.lock().len(), 1);
    assert!(recorder.failed.lock().is_empty());
    assert_eq!(host.opened(), 1);
}

#[tokio::test]
async fn unobtainable_handle_fails_start() {
    let host = MockHost::new();
    host.state.lock().fail_open = true;
    let recorder = Recorder::new();
    let server = server_with(&host, &recorder, ScriptedSampler::new([]));

    let result = server.start().await;

    assert!(matches!(result, Err(StartError::HandleUnavailable(_))));
    assert!(!server.is_running());
    assert!(recorder.started.lock().is_empty());
    let failed = recorder.failed.lock();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, None);
}

#[tokio::test]
async fn characteristic_registration_failure_fails_start() {
    let host = MockHost::new();
    host.state.lock().fail_register = Some(RegistrationError::Characteristic("denied".into()));
    let recorder = Recorder::new();
    let server = server_with(&host, &recorder, ScriptedSampler::new([]));

    let result = server.start().await;

    assert_eq!(
        result,
        Err(StartError::CharacteristicRegistration("denied".into()))
    );
    assert!(!server.is_running());
    assert_eq!(host.closed(), 1, "handle released after failure");
    let failed = recorder.failed.lock();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].0.is_some());
    assert!(recorder.started.lock().is_empty());
}

#[tokio::test]
async fn service_registration_failure_fails_start() {
    let host = MockHost::new();
    host.state.lock().fail_register = Some(RegistrationError::Service("busy".into()));
    let recorder = Recorder::new();
    let server = server_with(&host, &recorder, ScriptedSampler::new([]));

    assert_eq!(
        server.start().await,
        Err(StartError::ServiceRegistration("busy".into()))
    );
    assert_eq!(recorder.failed.lock().len(), 1);
}

#[tokio::test]
async fn events_before_start_are_ignored() {
    let host = MockHost::new();
    let recorder = Recorder::serving(b"mine");
    let server = server_with(&host, &recorder, ScriptedSampler::new([]));

    assert_eq!(server.dispatch(simple(peer(1), b"early")), None);
    assert_eq!(server.dispatch(read(peer(1), 0)), None);

    assert!(recorder.received.lock().is_empty());
    assert!(server.sessions_empty());
}

#[tokio::test]
async fn close_twice_then_restart() {
    let host = MockHost::new();
    let recorder = Recorder::new();
    let server = server_with(&host, &recorder, ScriptedSampler::new([Some(-40)]));

    server.start().await.expect("server starts");
    host.deliver(GattEvent::Connected { peer: peer(1) });
    host.deliver(GattEvent::Connected { peer: peer(2) });
    host.deliver(prepared(peer(1), 0, b"half"));
    settle().await;
    assert_eq!(server.session_count(), 2);

    assert!(server.close().await);
    assert!(!server.close().await);

    assert!(server.sessions_empty());
    assert_eq!(server.session_count(), 0);
    assert!(!host.has_sink());
    assert_eq!(host.closed(), 1);

    // Events racing the shutdown are no-ops.
    assert_eq!(server.dispatch(execute(peer(1), true)), None);
    assert!(recorder.received.lock().is_empty());

    server.start().await.expect("server restarts");
    assert_eq!(recorder.started.lock().len(), 2);
    assert_eq!(server.pending_write_len(peer(1)), None);
    assert_eq!(
        status(host.deliver(execute(peer(1), true))),
        GattStatus::WriteNotPermitted
    );
}

// ── Protocol ──────────────────────────────────────────────────

#[tokio::test]
async fn fragments_reassemble_into_one_token() {
    let host = MockHost::new();
    let recorder = Recorder::new();
    let server = server_with(&host, &recorder, ScriptedSampler::new([Some(-63)]));
    server.start().await.expect("server starts");

    let p = peer(1);
    host.deliver(GattEvent::Connected { peer: p });
    settle().await;

    let token: Vec<u8> = (0u8..40).collect();
    let mut offset = 0;
    for chunk in token.chunks(18) {
        let response = host.deliver(prepared(p, offset, chunk));
        assert_eq!(response, Some(GattResponse::success_with(chunk.to_vec())));
        offset += chunk.len();
    }
    assert!(recorder.received.lock().is_empty(), "nothing delivered before execute");

    assert_eq!(status(host.deliver(execute(p, true))), GattStatus::Success);

    assert_eq!(*recorder.received.lock(), vec![(token, Some(-63))]);
    assert_eq!(server.pending_write_len(p), None);
}

#[tokio::test]
async fn bad_offset_has_no_cumulative_effect() {
    let host = MockHost::new();
    let recorder = Recorder::new();
    let server = server_with(&host, &recorder, ScriptedSampler::new([]));
    server.start().await.expect("server starts");
    let p = peer(1);

    host.deliver(prepared(p, 0, b"abcd"));
    for _ in 0..5 {
        assert_eq!(
            host.deliver(prepared(p, 9, b"zz")),
            Some(GattResponse::refused(GattStatus::WriteNotPermitted))
        );
    }
    assert_eq!(server.pending_write_len(p), Some(4));

    host.deliver(prepared(p, 4, b"ef"));
    host.deliver(execute(p, true));
    assert_eq!(recorder.tokens(), vec![b"abcdef".to_vec()]);
}

#[tokio::test]
async fn cancel_discards_accepted_fragments() {
    let host = MockHost::new();
    let recorder = Recorder::new();
    let server = server_with(&host, &recorder, ScriptedSampler::new([]));
    server.start().await.expect("server starts");
    let p = peer(1);

    host.deliver(prepared(p, 0, b"abc"));
    host.deliver(prepared(p, 3, b"def"));
    assert_eq!(status(host.deliver(execute(p, false))), GattStatus::Success);

    assert_eq!(
        status(host.deliver(execute(p, true))),
        GattStatus::WriteNotPermitted
    );
    assert!(recorder.received.lock().is_empty());
}

#[tokio::test]
async fn reconnect_starts_fresh() {
    let host = MockHost::new();
    let recorder = Recorder::new();
    // First connection latches -45; the second never reports.
    let server = server_with(&host, &recorder, ScriptedSampler::new([Some(-45), None]));
    server.start().await.expect("server starts");
    let p = peer(1);

    host.deliver(GattEvent::Connected { peer: p });
    settle().await;
    assert_eq!(server.rssi(p), Some(-45));
    host.deliver(prepared(p, 0, b"stale"));

    host.deliver(GattEvent::Disconnected { peer: p });
    assert!(server.sessions_empty());

    host.deliver(GattEvent::Connected { peer: p });
    settle().await;
    assert_eq!(server.rssi(p), None);
    assert_eq!(server.pending_write_len(p), None);

    host.deliver(simple(p, b"fresh"));
    assert_eq!(*recorder.received.lock(), vec![(b"fresh".to_vec(), None)]);
}

#[tokio::test]
async fn simple_write_ignores_prepared_state() {
    let host = MockHost::new();
    let recorder = Recorder::new();
    let server = server_with(&host, &recorder, ScriptedSampler::new([]));
    server.start().await.expect("server starts");

    host.deliver(prepared(peer(1), 0, b"p1-part"));
    host.deliver(prepared(peer(2), 0, b"p2-part"));

    assert_eq!(
        host.deliver(simple(peer(1), b"direct")),
        Some(GattResponse::success())
    );
    assert_eq!(recorder.tokens(), vec![b"direct".to_vec()]);
    assert_eq!(server.pending_write_len(peer(1)), Some(7));
    assert_eq!(server.pending_write_len(peer(2)), Some(7));
}

#[tokio::test]
async fn token_delivered_before_rssi_has_none() {
    let host = MockHost::new();
    let recorder = Recorder::new();
    let server = server_with(&host, &recorder, ScriptedSampler::new([None]));
    server.start().await.expect("server starts");
    let p = peer(3);

    host.deliver(GattEvent::Connected { peer: p });
    host.deliver(simple(p, b"quick"));

    assert_eq!(*recorder.received.lock(), vec![(b"quick".to_vec(), None)]);
}

#[tokio::test]
async fn reads_slice_from_offset() {
    let host = MockHost::new();
    let recorder = Recorder::serving(b"local-token");
    let server = server_with(&host, &recorder, ScriptedSampler::new([]));
    server.start().await.expect("server starts");
    let p = peer(1);

    assert_eq!(
        host.deliver(read(p, 0)),
        Some(GattResponse::success_with(b"local-token".to_vec()))
    );
    assert_eq!(
        host.deliver(read(p, 6)),
        Some(GattResponse::success_with(b"token".to_vec()))
    );
    assert_eq!(
        host.deliver(read(p, 11)),
        Some(GattResponse::refused(GattStatus::ReadNotPermitted))
    );
    assert_eq!(
        host.deliver(read(p, 500)),
        Some(GattResponse::refused(GattStatus::ReadNotPermitted))
    );
}

#[test]
fn concurrent_peers_do_not_cross_contaminate() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("runtime");

    let host = MockHost::new();
    let recorder = Recorder::new();
    let server = server_with(&host, &recorder, ScriptedSampler::new([]));
    runtime.block_on(server.start()).expect("server starts");

    const PEERS: u8 = 4;
    const FRAGMENTS: usize = 50;
    let barrier = Arc::new(Barrier::new(PEERS as usize));

    let handles: Vec<_> = (1..=PEERS)
        .map(|n| {
            let host = host.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                let p = peer(n);
                barrier.wait();
                for i in 0..FRAGMENTS {
                    let fragment = [n, i as u8];
                    let response = host.deliver(prepared(p, i * 2, &fragment));
                    assert_eq!(status(response), GattStatus::Success);
                }
                assert_eq!(status(host.deliver(execute(p, true))), GattStatus::Success);
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("peer thread");
    }

    let mut tokens = recorder.tokens();
    tokens.sort();
    let expected: Vec<Vec<u8>> = (1..=PEERS)
        .map(|n| (0..FRAGMENTS).flat_map(|i| [n, i as u8]).collect())
        .collect();
    assert_eq!(tokens, expected);
    assert!(server.sessions_empty());
}

#[tokio::test]
async fn descriptor_and_housekeeping_events() {
    let host = MockHost::new();
    let recorder = Recorder::new();
    let server = server_with(&host, &recorder, ScriptedSampler::new([]));
    server.start().await.expect("server starts");
    let p = peer(1);
    let cccd = uuid::Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

    host.deliver(prepared(p, 0, b"keep"));

    assert_eq!(
        status(host.deliver(GattEvent::DescriptorRead { peer: p, descriptor: cccd })),
        GattStatus::ReadNotPermitted
    );
    assert_eq!(
        status(host.deliver(GattEvent::DescriptorWrite {
            peer: p,
            descriptor: cccd,
            response_needed: true,
        })),
        GattStatus::WriteNotPermitted
    );
    assert_eq!(host.deliver(GattEvent::MtuChanged { peer: p, mtu: 247 }), None);
    assert_eq!(host.deliver(GattEvent::PhyUpdated { peer: p }), None);
    assert_eq!(host.deliver(GattEvent::NotificationSent { peer: p }), None);

    assert_eq!(server.pending_write_len(p), Some(4));
}

#[test]
fn close_while_peers_are_active() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("runtime");

    let host = MockHost::new();
    let recorder = Recorder::new();
    // Latches stay pending, so close() has tasks to abort.
    let server = server_with(&host, &recorder, ScriptedSampler::new([]));
    runtime.block_on(server.start()).expect("server starts");

    const PEERS: u8 = 4;
    let stop = Arc::new(AtomicBool::new(false));
    let workers: Vec<_> = (1..=PEERS)
        .map(|n| {
            let server = server.clone();
            let stop = stop.clone();
            let runtime = runtime.handle().clone();
            std::thread::spawn(move || {
                let _guard = runtime.enter();
                let p = peer(n);
                let mut round: u8 = 0;
                while !stop.load(Ordering::SeqCst) {
                    server.dispatch(GattEvent::Connected { peer: p });
                    server.dispatch(execute(p, false));
                    server.dispatch(prepared(p, 0, &[n, round]));
                    server.dispatch(prepared(p, 2, b"tail"));
                    server.dispatch(execute(p, true));
                    server.dispatch(prepared(p, 0, b"left-open"));
                    round = round.wrapping_add(1);
                }
            })
        })
        .collect();

    let deadline = Instant::now() + Duration::from_secs(5);
    while recorder.received.lock().len() < PEERS as usize && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }

    assert!(runtime.block_on(server.close()));
    let delivered_at_close = recorder.received.lock().len();
    assert!(server.sessions_empty());

    std::thread::sleep(Duration::from_millis(20));
    stop.store(true, Ordering::SeqCst);
    for worker in workers {
        worker.join().expect("worker thread");
    }

    assert!(delivered_at_close >= PEERS as usize);
    assert_eq!(recorder.received.lock().len(), delivered_at_close);
    assert!(server.sessions_empty());
    assert!(!server.is_running());
}

/// Queries the server from inside a callback while a close is waiting.
struct QueryingCallbacks {
    server: std::sync::OnceLock<proxitoken::bluetooth::TokenServer>,
    runtime: tokio::runtime::Handle,
    observed: parking_lot::Mutex<Vec<bool>>,
    closer: parking_lot::Mutex<Option<std::thread::JoinHandle<bool>>>,
}

impl proxitoken::bluetooth::TokenCallbacks for QueryingCallbacks {
    fn on_token_received(
        &self,
        _server: &proxitoken::bluetooth::ServerId,
        _token: &[u8],
        _rssi: Option<i16>,
    ) {
        let Some(server) = self.server.get().cloned() else {
            return;
        };
        let runtime = self.runtime.clone();
        let closing = server.clone();
        *self.closer.lock() = Some(std::thread::spawn(move || {
            runtime.block_on(closing.close())
        }));
        // Give close() time to queue behind this event.
        std::thread::sleep(std::time::Duration::from_millis(50));
        self.observed
            .lock()
            .push(server.is_running() && server.server_id().is_some());
    }

    fn on_token_requested(&self, _server: &proxitoken::bluetooth::ServerId) -> Option<Vec<u8>> {
        None
    }

    fn on_server_started(&self, _server: &proxitoken::bluetooth::ServerId) {}

    fn on_server_failed(
        &self,
        _server: Option<&proxitoken::bluetooth::ServerId>,
        _error: &StartError,
    ) {
    }
}

#[test]
fn callbacks_can_query_server_during_close() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("runtime");

    let host = MockHost::new();
    let callbacks = Arc::new(QueryingCallbacks {
        server: std::sync::OnceLock::new(),
        runtime: runtime.handle().clone(),
        observed: parking_lot::Mutex::new(Vec::new()),
        closer: parking_lot::Mutex::new(None),
    });
    let server = proxitoken::bluetooth::TokenServer::new(
        host.clone(),
        callbacks.clone(),
        ScriptedSampler::new([]),
        MAX_VALUE_LEN,
    );
    assert!(callbacks.server.set(server.clone()).is_ok());
    runtime.block_on(server.start()).expect("server starts");

    server.dispatch(simple(peer(1), b"token"));

    let closer = callbacks.closer.lock().take().expect("close started");
    assert!(closer.join().expect("closer thread"));
    assert_eq!(*callbacks.observed.lock(), vec![true]);
    assert!(!server.is_running());
}
