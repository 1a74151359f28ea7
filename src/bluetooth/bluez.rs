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

//! BlueZ host for the token server, built on bluer.
//!
//! BlueZ runs the ATT prepare/execute exchange itself. With the token
//! characteristic flagged `authorize`, every Prepare Write Request reaches us
//! as a `WriteValue` call with `prepare_authorize` set. On Execute Write with
//! the commit flag BlueZ replays the queued fragments as `WriteValue` calls of
//! type `reliable`; a cancelling Execute Write is answered by BlueZ alone. The
//! translation below maps that onto [`GattEvent`]s.

use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    characteristic_control, Application, ApplicationHandle, Characteristic, CharacteristicRead,
    CharacteristicReadRequest, CharacteristicWrite, CharacteristicWriteMethod,
    CharacteristicWriteRequest, ReqError, Service,
};
use bluer::gatt::WriteOp;
use bluer::{Adapter, DeviceEvent, DeviceProperty, Session};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ble_constants::{config, GattStatus, SERVICE_UUID};
use super::callbacks::ServerId;
use super::dispatcher::{EventSink, GattEvent, GattResponse};
use super::error::{HostError, RegistrationError};
use super::peer::Peer;
use super::rssi::RssiSampler;
use super::server::{GattHost, HostServer};
use super::service::ServiceDefinition;

/// Settings for the BlueZ host.
#[derive(Debug, Clone)]
pub struct BluezOptions {
    /// Adapter name such as `hci0`; `None` picks the default adapter.
    pub adapter: Option<String>,
    /// Alias set on the adapter and used in advertisements.
    pub device_name: String,
    pub advertise: bool,
    pub connection_poll_interval: Duration,
}

impl Default for BluezOptions {
    fn default() -> Self {
        Self {
            adapter: None,
            device_name: String::new(),
            advertise: true,
            connection_poll_interval: Duration::from_millis(config::CONNECTION_POLL_INTERVAL_MS),
        }
    }
}

type AdapterSlot = Arc<RwLock<Option<Adapter>>>;

/// [`GattHost`] backed by the system BlueZ daemon.
pub struct BluezHost {
    options: BluezOptions,
    adapter: AdapterSlot,
}

impl BluezHost {
    pub fn new(options: BluezOptions) -> Self {
        Self {
            options,
            adapter: Arc::new(RwLock::new(None)),
        }
    }

    /// RSSI sampler reading the device objects of the adapter this host opens.
    pub fn rssi_sampler(&self, poll_interval: Duration, max_attempts: u32) -> BluezRssiSampler {
        BluezRssiSampler {
            adapter: self.adapter.clone(),
            poll_interval,
            max_attempts,
        }
    }

    async fn open_adapter(&self) -> Result<(Session, Adapter), HostError> {
        let session = Session::new()
            .await
            .map_err(|e| HostError::AdapterUnavailable(e.to_string()))?;
        info!("BlueZ session created");

        let adapter = match &self.options.adapter {
            Some(name) => session
                .adapter(name)
                .map_err(|e| HostError::AdapterUnavailable(format!("{}: {}", name, e)))?,
            None => session
                .default_adapter()
                .await
                .map_err(|e| HostError::AdapterUnavailable(e.to_string()))?,
        };
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            adapter.set_powered(true).await?;
        }

        if !self.options.device_name.is_empty() {
            adapter.set_alias(self.options.device_name.clone()).await?;
            info!("Bluetooth name set to: {}", self.options.device_name);
        }

        Ok((session, adapter))
    }
}

impl GattHost for BluezHost {
    fn open(&self) -> BoxFuture<'_, Result<Box<dyn HostServer>, HostError>> {
        async move {
            let (session, adapter) = self.open_adapter().await?;
            let address = adapter.address().await?;
            let id = ServerId::new(format!("{}-{}", adapter.name(), address));

            *self.adapter.write() = Some(adapter.clone());

            let server: Box<dyn HostServer> = Box::new(BluezServer {
                id,
                _session: session,
                adapter,
                adapter_slot: self.adapter.clone(),
                options: self.options.clone(),
                app_handle: None,
                adv_handle: None,
                link: None,
                monitor: None,
            });
            Ok(server)
        }
        .boxed()
    }
}

/// A published token service on one BlueZ adapter.
struct BluezServer {
    id: ServerId,
    _session: Session,
    adapter: Adapter,
    adapter_slot: AdapterSlot,
    options: BluezOptions,
    app_handle: Option<ApplicationHandle>,
    adv_handle: Option<AdvertisementHandle>,
    link: Option<Arc<PeerLink>>,
    monitor: Option<JoinHandle<()>>,
}

impl HostServer for BluezServer {
    fn id(&self) -> ServerId {
        self.id.clone()
    }

    fn register<'a>(
        &'a mut self,
        service: &'a ServiceDefinition,
        sink: Arc<dyn EventSink>,
    ) -> BoxFuture<'a, Result<(), RegistrationError>> {
        async move {
            let link = Arc::new(PeerLink::new(sink));
            let characteristic = token_characteristic(service, link.clone())?;

            let app = Application {
                services: vec![Service {
                    uuid: service.uuid,
                    primary: service.primary,
                    characteristics: vec![characteristic],
                    ..Default::default()
                }],
                ..Default::default()
            };

            let handle = self
                .adapter
                .serve_gatt_application(app)
                .await
                .map_err(|e| RegistrationError::Service(e.to_string()))?;
            self.app_handle = Some(handle);
            info!("GATT service registered");

            if self.options.advertise {
                self.start_advertising().await;
            }

            self.monitor = Some(spawn_connection_monitor(
                self.adapter.clone(),
                link.clone(),
                self.options.connection_poll_interval,
            ));
            self.link = Some(link);
            Ok(())
        }
        .boxed()
    }

    fn close(mut self: Box<Self>) -> BoxFuture<'static, ()> {
        async move {
            if let Some(monitor) = self.monitor.take() {
                monitor.abort();
            }
            if let Some(link) = self.link.take() {
                link.stop_watchers();
            }
            // Dropping the handles unregisters from BlueZ.
            self.adv_handle.take();
            self.app_handle.take();
            *self.adapter_slot.write() = None;
            info!("BlueZ GATT application released");
        }
        .boxed()
    }
}

impl BluezServer {
    async fn start_advertising(&mut self) {
        let adv = Advertisement {
            service_uuids: vec![SERVICE_UUID].into_iter().collect(),
            discoverable: Some(true),
            local_name: (!self.options.device_name.is_empty())
                .then(|| self.options.device_name.clone()),
            ..Default::default()
        };

        match self.adapter.advertise(adv).await {
            Ok(handle) => {
                self.adv_handle = Some(handle);
                info!("BLE advertising started");
            }
            Err(e) => warn!("Failed to start advertising: {}", e),
        }
    }
}

fn token_characteristic(
    service: &ServiceDefinition,
    link: Arc<PeerLink>,
) -> Result<Characteristic, RegistrationError> {
    let definition = service.token_characteristic().ok_or_else(|| {
        RegistrationError::Characteristic("token characteristic missing".to_string())
    })?;
    let uuid = definition.uuid;
    let properties = definition.properties;

    debug!("📝 Registering token characteristic: {}", uuid);
    debug!(
        "   Properties: read={} write={} write_without_response={}",
        properties.read, properties.write, properties.write_without_response
    );

    let (_control, control_handle) = characteristic_control();

    let read = properties.read.then(|| {
        let link = link.clone();
        CharacteristicRead {
            read: true,
            fun: Box::new(move |req: CharacteristicReadRequest| {
                let link = link.clone();
                Box::pin(async move {
                    let peer = Peer::from(req.device_address);
                    link.observe_mtu(peer, req.mtu);
                    let response = link.sink.dispatch(GattEvent::Read {
                        peer,
                        characteristic: uuid,
                        offset: req.offset as usize,
                    });
                    read_reply(response)
                })
            }),
            ..Default::default()
        }
    });

    let write = properties.write.then(|| CharacteristicWrite {
        write: true,
        write_without_response: properties.write_without_response,
        reliable_write: true,
        authorize: true,
        method: CharacteristicWriteMethod::Fun(Box::new(
            move |data: Vec<u8>, req: CharacteristicWriteRequest| {
                let link = link.clone();
                Box::pin(async move {
                    let write = IncomingWrite::from_request(uuid, &req);
                    link.handle_write(write, req.mtu, data)
                })
            },
        )),
        ..Default::default()
    });

    Ok(Characteristic {
        uuid,
        read,
        write,
        control_handle,
        ..Default::default()
    })
}

/// Per-peer bookkeeping the BlueZ translation needs.
struct PeerLink {
    sink: Arc<dyn EventSink>,
    // Peers with an accepted prepared fragment awaiting execute.
    preparing: Mutex<HashSet<Peer>>,
    mtu: Mutex<HashMap<Peer, u16>>,
    connected: Mutex<HashSet<Peer>>,
    // Per-device property watchers, keyed by peer.
    watchers: Mutex<HashMap<Peer, JoinHandle<()>>>,
}

impl PeerLink {
    fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            preparing: Mutex::new(HashSet::new()),
            mtu: Mutex::new(HashMap::new()),
            connected: Mutex::new(HashSet::new()),
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Record a connection state change, emitting the event on transitions.
    fn set_connected(&self, peer: Peer, connected: bool) {
        // Held across dispatch so transitions for one peer stay ordered.
        let mut peers = self.connected.lock();
        if connected {
            if peers.insert(peer) {
                self.sink.dispatch(GattEvent::Connected { peer });
            }
        } else if peers.remove(&peer) {
            self.forget(peer);
            self.sink.dispatch(GattEvent::Disconnected { peer });
        }
    }

    fn connected_peers(&self) -> HashSet<Peer> {
        self.connected.lock().clone()
    }

    fn is_watching(&self, peer: Peer) -> bool {
        self.watchers
            .lock()
            .get(&peer)
            .is_some_and(|watcher| !watcher.is_finished())
    }

    fn stop_watchers(&self) {
        for (_, watcher) in self.watchers.lock().drain() {
            watcher.abort();
        }
    }

    fn observe_mtu(&self, peer: Peer, mtu: u16) {
        let previous = self.mtu.lock().insert(peer, mtu);
        if previous != Some(mtu) {
            self.sink.dispatch(GattEvent::MtuChanged { peer, mtu });
        }
    }

    fn forget(&self, peer: Peer) {
        self.preparing.lock().remove(&peer);
        self.mtu.lock().remove(&peer);
    }

    fn handle_write(&self, write: IncomingWrite, mtu: u16, data: Vec<u8>) -> Result<(), ReqError> {
        let peer = write.peer;
        self.observe_mtu(peer, mtu);

        debug!(
            "📥 BLE WRITE RECEIVED from {}: {} bytes, offset={}, prepare={}",
            peer,
            data.len(),
            write.offset,
            write.prepare
        );

        let preparing = self.preparing.lock().contains(&peer);

        let mut reply = Ok(());
        for event in translate_write(&write, preparing, data) {
            let prepared = matches!(event, GattEvent::WritePrepared { .. });
            let executed = matches!(event, GattEvent::ExecuteWrite { .. });
            let response = self.sink.dispatch(event);

            if prepared && response.as_ref().is_some_and(|r| r.status.is_success()) {
                self.preparing.lock().insert(peer);
            }
            if executed {
                self.preparing.lock().remove(&peer);
            }
            reply = write_reply(response);
        }
        reply
    }
}

/// A `WriteValue` call as BlueZ delivers it.
#[derive(Debug, Clone, Copy)]
struct IncomingWrite {
    peer: Peer,
    characteristic: uuid::Uuid,
    offset: usize,
    prepare: bool,
    op: WriteOp,
}

impl IncomingWrite {
    fn from_request(characteristic: uuid::Uuid, req: &CharacteristicWriteRequest) -> Self {
        Self {
            peer: Peer::from(req.device_address),
            characteristic,
            offset: req.offset as usize,
            prepare: req.prepare_authorize,
            op: req.op_type,
        }
    }
}

/// Map one BlueZ write onto protocol events.
///
/// `preparing` is whether the peer has an open prepared write. An empty
/// result means the call is a replayed fragment already delivered.
///
/// BlueZ never reports a cancelling Execute Write, so a queue left open by
/// one is only discarded when the peer starts a new queue or disconnects.
fn translate_write(write: &IncomingWrite, preparing: bool, value: Vec<u8>) -> Vec<GattEvent> {
    let peer = write.peer;

    if write.prepare {
        let fragment = GattEvent::WritePrepared {
            peer,
            characteristic: write.characteristic,
            offset: write.offset,
            value,
            response_needed: true,
        };
        // A fresh queue while one is open means the old one was abandoned.
        if write.offset == 0 && preparing {
            return vec![GattEvent::ExecuteWrite { peer, commit: false }, fragment];
        }
        return vec![fragment];
    }

    match write.op {
        // The first replayed fragment stands for the whole execute.
        WriteOp::Reliable if write.offset == 0 => {
            vec![GattEvent::ExecuteWrite { peer, commit: true }]
        }
        WriteOp::Reliable => Vec::new(),
        WriteOp::Request | WriteOp::Command => vec![GattEvent::WriteSimple {
            peer,
            characteristic: write.characteristic,
            value,
            response_needed: write.op == WriteOp::Request,
        }],
    }
}

fn status_error(status: GattStatus) -> ReqError {
    debug!("Replying ATT error 0x{:02x}", status.code());
    match status {
        GattStatus::Success => ReqError::Failed,
        GattStatus::ReadNotPermitted | GattStatus::WriteNotPermitted => ReqError::NotPermitted,
        GattStatus::RequestNotSupported => ReqError::NotSupported,
    }
}

fn read_reply(response: Option<GattResponse>) -> Result<Vec<u8>, ReqError> {
    match response {
        Some(GattResponse {
            status: GattStatus::Success,
            value,
        }) => Ok(value.unwrap_or_default()),
        Some(response) => Err(status_error(response.status)),
        None => Err(ReqError::Failed),
    }
}

fn write_reply(response: Option<GattResponse>) -> Result<(), ReqError> {
    match response {
        Some(response) if !response.status.is_success() => Err(status_error(response.status)),
        _ => Ok(()),
    }
}

/// Poll BlueZ for newly connected devices and turn changes into events.
///
/// Each connected device also gets a watcher on its `Connected` property, so
/// a disconnect and reconnect between two polls is still seen as both.
fn spawn_connection_monitor(
    adapter: Adapter,
    link: Arc<PeerLink>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Starting BlueZ connection monitor...");

        loop {
            match connected_peers(&adapter).await {
                Ok(now) => {
                    let known = link.connected_peers();
                    for peer in now.difference(&known) {
                        link.set_connected(*peer, true);
                    }
                    for peer in known.difference(&now) {
                        link.set_connected(*peer, false);
                    }
                    for peer in &now {
                        watch_device(&adapter, &link, *peer).await;
                    }
                }
                Err(e) => error!("BlueZ poll: failed to query devices: {}", e),
            }

            tokio::time::sleep(interval).await;
        }
    })
}

async fn watch_device(adapter: &Adapter, link: &Arc<PeerLink>, peer: Peer) {
    if link.is_watching(peer) {
        return;
    }

    let device = match adapter.device(peer.into()) {
        Ok(device) => device,
        Err(e) => {
            debug!("BlueZ watch: no device object for {}: {}", peer, e);
            return;
        }
    };
    let events = match device.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("BlueZ watch: cannot subscribe to {}: {}", peer, e);
            return;
        }
    };

    let task_link = link.clone();
    let watcher = tokio::spawn(async move {
        let mut events = Box::pin(events);
        while let Some(event) = events.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) = event {
                debug!("BlueZ watch: {} connected={}", peer, connected);
                task_link.set_connected(peer, connected);
            }
        }
        debug!("BlueZ watch: device {} removed", peer);
        task_link.set_connected(peer, false);
    });
    link.watchers.lock().insert(peer, watcher);
}

async fn connected_peers(adapter: &Adapter) -> bluer::Result<HashSet<Peer>> {
    let mut peers = HashSet::new();
    for address in adapter.device_addresses().await? {
        let device = match adapter.device(address) {
            Ok(device) => device,
            Err(e) => {
                debug!("BlueZ poll: no device object for {}: {}", address, e);
                continue;
            }
        };
        match device.is_connected().await {
            Ok(true) => {
                peers.insert(Peer::from(address));
            }
            Ok(false) => {}
            Err(e) => debug!("BlueZ poll: connection state of {} unknown: {}", address, e),
        }
    }
    Ok(peers)
}

/// Polls the BlueZ device object until it reports an RSSI.
pub struct BluezRssiSampler {
    adapter: AdapterSlot,
    poll_interval: Duration,
    max_attempts: u32,
}

impl RssiSampler for BluezRssiSampler {
    fn sample(&self, peer: Peer) -> BoxFuture<'static, Option<i16>> {
        let slot = self.adapter.clone();
        let interval = self.poll_interval;
        let attempts = self.max_attempts;

        async move {
            for _ in 0..attempts {
                let adapter = slot.read().clone();
                if let Some(adapter) = adapter {
                    if let Ok(device) = adapter.device(peer.into()) {
                        match device.rssi().await {
                            Ok(Some(rssi)) => return Some(rssi),
                            Ok(None) => {}
                            Err(e) => debug!("RSSI query for {} failed: {}", peer, e),
                        }
                    }
                }
                tokio::time::sleep(interval).await;
            }
            None
        }
        .boxed()
    }
}
