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

//! Host-independent description of the GATT service we publish.

use uuid::Uuid;

use super::ble_constants::{SERVICE_UUID, TOKEN_CHARACTERISTIC_UUID};
use super::error::RegistrationError;

/// Access a characteristic grants to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDefinition {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub uuid: Uuid,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicDefinition>,
}

impl ServiceDefinition {
    /// One primary service holding the read + write token characteristic.
    pub fn token_exchange() -> Self {
        Self {
            uuid: SERVICE_UUID,
            primary: true,
            characteristics: vec![CharacteristicDefinition {
                uuid: TOKEN_CHARACTERISTIC_UUID,
                properties: CharacteristicProperties {
                    read: true,
                    write: true,
                    write_without_response: true,
                },
            }],
        }
    }

    /// The token characteristic, if declared.
    pub fn token_characteristic(&self) -> Option<&CharacteristicDefinition> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == TOKEN_CHARACTERISTIC_UUID)
    }

    /// Check the definition before handing it to a host.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if !self.primary {
            return Err(RegistrationError::Service(format!(
                "service {} must be primary",
                self.uuid
            )));
        }

        match self.characteristics.as_slice() {
            [only] if only.uuid == TOKEN_CHARACTERISTIC_UUID => {
                if only.properties.read && only.properties.write {
                    Ok(())
                } else {
                    Err(RegistrationError::Characteristic(format!(
                        "characteristic {} needs read and write",
                        only.uuid
                    )))
                }
            }
            [only] => Err(RegistrationError::Characteristic(format!(
                "unexpected characteristic {}",
                only.uuid
            ))),
            others => Err(RegistrationError::Service(format!(
                "expected exactly one characteristic, found {}",
                others.len()
            ))),
        }
    }
}
