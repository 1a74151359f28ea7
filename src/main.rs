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

//! Proxitoken - exchanges proximity tokens with nearby devices over BLE.

use anyhow::{Context, Result};
use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use proxitoken::bluetooth::{BluezHost, TokenServer};
use proxitoken::config::Config;
use proxitoken::events::{ChannelCallbacks, EventProcessor};

/// Length of the per-run token when none is configured.
const RANDOM_TOKEN_LEN: usize = 16;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => Config::default_path()?,
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting Proxitoken v{}", env!("CARGO_PKG_VERSION"));

    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("Could not write default config: {:#}", e);
        }
    }

    let token = match config.token_bytes()? {
        Some(token) => token,
        None => {
            let mut token = vec![0u8; RANDOM_TOKEN_LEN];
            rand::thread_rng().fill_bytes(&mut token);
            info!("No token configured, serving random token {}", hex::encode(&token));
            token
        }
    };

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let callbacks = Arc::new(ChannelCallbacks::new(Some(token), event_tx));

    let host = Arc::new(BluezHost::new(config.bluez_options()));
    let sampler = Arc::new(host.rssi_sampler(config.rssi.poll_interval(), config.rssi.max_attempts));
    let server = TokenServer::new(host, callbacks, sampler, config.max_value_len);

    let mut processor = EventProcessor::new();

    if let Err(e) = server.start().await {
        // Let the processor report the failure event.
        while let Ok(event) = event_rx.try_recv() {
            if let Err(e) = processor.process_event(event) {
                error!("Event processing failed: {:#}", e);
            }
        }
        return Err(e).context("Failed to start token server");
    }

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                let Some(event) = event else {
                    warn!("Server event channel closed");
                    break;
                };
                if let Err(e) = processor.process_event(event) {
                    error!("Event processing failed: {:#}", e);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    server.close().await;
    info!(
        "Exchanged {} token(s), {} with RSSI",
        processor.received(),
        processor.received_with_rssi()
    );
    Ok(())
}
