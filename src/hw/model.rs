use strum_macros::Display;
use uuid::Uuid;

/// Platform address of a physical tag.
#[derive(Debug, Clone, Eq, PartialEq, Hash, derive_more::Display, derive_more::From)]
#[display("{_0}")]
pub struct DeviceAddress(String);

impl DeviceAddress {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns whether `candidate` names this address, ignoring case.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        self.0.eq_ignore_ascii_case(candidate)
    }
}

impl From<&str> for DeviceAddress {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// GATT characteristic capability.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display)]
pub enum CharacteristicProperty {
    #[strum(to_string = "read")]
    Read,
    #[strum(to_string = "write")]
    Write,
    #[strum(to_string = "write_without_response")]
    WriteWithoutResponse,
    #[strum(to_string = "notify")]
    Notify,
    #[strum(to_string = "indicate")]
    Indicate,
}

/// A characteristic discovered on a connected peripheral.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CharacteristicInfo {
    uuid: Uuid,
    properties: Vec<CharacteristicProperty>,
}

impl CharacteristicInfo {
    #[must_use]
    pub fn new(uuid: Uuid, properties: Vec<CharacteristicProperty>) -> Self {
        Self { uuid, properties }
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[must_use]
    pub fn properties(&self) -> &[CharacteristicProperty] {
        &self.properties
    }

    #[must_use]
    pub fn supports(&self, property: CharacteristicProperty) -> bool {
        self.properties.contains(&property)
    }
}

/// A GATT service with its discovered characteristics.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServiceInfo {
    uuid: Uuid,
    primary: bool,
    characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    #[must_use]
    pub fn new(uuid: Uuid, primary: bool, characteristics: Vec<CharacteristicInfo>) -> Self {
        Self {
            uuid,
            primary,
            characteristics,
        }
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    #[must_use]
    pub fn characteristics(&self) -> &[CharacteristicInfo] {
        &self.characteristics
    }
}

/// A value read from, notified on, or written to a characteristic.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CharacteristicUpdate {
    uuid: Uuid,
    value: Vec<u8>,
}

impl CharacteristicUpdate {
    #[must_use]
    pub fn new(uuid: Uuid, value: Vec<u8>) -> Self {
        Self { uuid, value }
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }
}
