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

//! Error types for server setup and the host boundary.

use thiserror::Error;

/// Failure talking to the platform Bluetooth stack.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("Bluetooth host error: {0}")]
    Host(String),
}

impl From<bluer::Error> for HostError {
    fn from(e: bluer::Error) -> Self {
        HostError::Host(e.to_string())
    }
}

/// Failure registering the GATT service with the host.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("characteristic registration failed: {0}")]
    Characteristic(String),
    #[error("service registration failed: {0}")]
    Service(String),
}

/// Why the server did not start.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    #[error("GATT server handle unavailable: {0}")]
    HandleUnavailable(#[source] HostError),
    #[error("token characteristic could not be registered: {0}")]
    CharacteristicRegistration(String),
    #[error("token service could not be registered: {0}")]
    ServiceRegistration(String),
    #[error("GATT server is already running")]
    AlreadyRunning,
}

impl From<RegistrationError> for StartError {
    fn from(e: RegistrationError) -> Self {
        match e {
            RegistrationError::Characteristic(reason) => StartError::CharacteristicRegistration(reason),
            RegistrationError::Service(reason) => StartError::ServiceRegistration(reason),
        }
    }
}
