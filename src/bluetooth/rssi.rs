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

//! One-shot RSSI capture per connected peer.
//!
//! Sampling runs on a background task and fills a single-assignment cell.
//! Readers never wait: until the sample lands, the value is simply absent.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::peer::Peer;

/// Source of signal-strength readings.
pub trait RssiSampler: Send + Sync {
    /// Resolve to one reading in dBm, or `None` if the peer never reports one.
    fn sample(&self, peer: Peer) -> BoxFuture<'static, Option<i16>>;
}

struct Latch {
    value: Arc<OnceLock<i16>>,
    task: Option<JoinHandle<()>>,
}

impl Drop for Latch {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// RSSI latches keyed by peer.
pub struct RssiLatches {
    sampler: Arc<dyn RssiSampler>,
    latches: Mutex<HashMap<Peer, Latch>>,
}

impl RssiLatches {
    pub fn new(sampler: Arc<dyn RssiSampler>) -> Self {
        Self {
            sampler,
            latches: Mutex::new(HashMap::new()),
        }
    }

    /// Begin measuring `peer`, replacing any earlier latch for it.
    ///
    /// Must be called from within a tokio runtime for the measurement to run;
    /// otherwise the latch stays empty.
    pub fn start(&self, peer: Peer) {
        let value = Arc::new(OnceLock::new());

        let task = match Handle::try_current() {
            Ok(runtime) => {
                let sample = self.sampler.sample(peer);
                let cell = value.clone();
                Some(runtime.spawn(async move {
                    match sample.await {
                        Some(rssi) => {
                            if cell.set(rssi).is_ok() {
                                debug!("RSSI latched for {}: {} dBm", peer, rssi);
                            }
                        }
                        None => debug!("No RSSI reported for {}", peer),
                    }
                }))
            }
            Err(_) => {
                warn!("No async runtime, RSSI for {} will stay unavailable", peer);
                None
            }
        };

        // Dropping a replaced latch aborts its task.
        self.latches.lock().insert(peer, Latch { value, task });
    }

    /// Latched reading, if the measurement has completed.
    pub fn value(&self, peer: Peer) -> Option<i16> {
        self.latches
            .lock()
            .get(&peer)
            .and_then(|latch| latch.value.get().copied())
    }

    /// Stop measuring `peer` and release its latch.
    pub fn cancel(&self, peer: Peer) {
        self.latches.lock().remove(&peer);
    }

    pub fn cancel_all(&self) {
        // Drain outside the lock so aborts don't run under it.
        let drained: Vec<Latch> = self.latches.lock().drain().map(|(_, l)| l).collect();
        drop(drained);
    }

    pub fn contains(&self, peer: Peer) -> bool {
        self.latches.lock().contains_key(&peer)
    }

    pub fn len(&self) -> usize {
        self.latches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.latches.lock().is_empty()
    }
}
