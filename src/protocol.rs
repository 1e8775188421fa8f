use std::collections::HashMap;
use std::sync::LazyLock;

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};
use uuid::Uuid;

/// Vendor GATT service exposed by every tag.
pub const TAG_SERVICE_UUID: Uuid = Uuid::from_u128(0xd45c2000_4270_a125_a25d_ee458c085001);

/// Slow advertising interval sent in the link configuration, in milliseconds.
pub const SLOW_ADVERTISING_INTERVAL_MS: f32 = 2000.0;
/// Medium advertising interval sent in the link configuration, in milliseconds.
pub const MEDIUM_ADVERTISING_INTERVAL_MS: f32 = 1000.0;
/// Depth of the tag's outgoing notification queue.
pub const NOTIFICATION_QUEUE_DEPTH: u32 = 14;

/// GATT characteristics the connection lifecycle depends on.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, EnumIter, Display)]
pub enum TagCharacteristic {
    /// Host-to-tag command channel (fragmented).
    #[strum(to_string = "command")]
    Command,
    /// Tag-to-host command responses (fragmented).
    #[strum(to_string = "response")]
    Response,
    /// Tag-to-host asynchronous notifications (fragmented).
    #[strum(to_string = "notify")]
    Notify,
    /// Raw sensor data, not fragmented.
    #[strum(to_string = "raw")]
    Raw,
    /// Bluetooth SIG battery level.
    #[strum(to_string = "battery_level")]
    BatteryLevel,
    /// Bluetooth SIG device name.
    #[strum(to_string = "device_name")]
    DeviceName,
}

impl TagCharacteristic {
    /// Returns the characteristic UUID.
    #[must_use]
    pub fn uuid(self) -> Uuid {
        characteristic_metadata(self).uuid
    }

    /// Returns the characteristic for a UUID, if it is one of ours.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        CHARACTERISTICS_BY_UUID.get(&uuid).copied()
    }

    /// Returns whether pairing enables notifications on this characteristic.
    #[must_use]
    pub fn notifies_during_pairing(self) -> bool {
        characteristic_metadata(self).notifies
    }

    /// Returns whether pairing reads this characteristic once.
    #[must_use]
    pub fn read_during_pairing(self) -> bool {
        characteristic_metadata(self).read_on_pairing
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct CharacteristicMetadata {
    uuid: Uuid,
    notifies: bool,
    read_on_pairing: bool,
}

static CHARACTERISTICS_BY_UUID: LazyLock<HashMap<Uuid, TagCharacteristic>> =
    LazyLock::new(|| {
        TagCharacteristic::iter()
            .map(|characteristic| (characteristic.uuid(), characteristic))
            .collect()
    });

fn characteristic_metadata(characteristic: TagCharacteristic) -> CharacteristicMetadata {
    match characteristic {
        TagCharacteristic::Command => CharacteristicMetadata {
            uuid: Uuid::from_u128(0xd45c2010_4270_a125_a25d_ee458c085001),
            notifies: false,
            read_on_pairing: false,
        },
        TagCharacteristic::Raw => CharacteristicMetadata {
            uuid: Uuid::from_u128(0xd45c2020_4270_a125_a25d_ee458c085001),
            notifies: true,
            read_on_pairing: false,
        },
        TagCharacteristic::Response => CharacteristicMetadata {
            uuid: Uuid::from_u128(0xd45c2030_4270_a125_a25d_ee458c085001),
            notifies: true,
            read_on_pairing: false,
        },
        TagCharacteristic::Notify => CharacteristicMetadata {
            uuid: Uuid::from_u128(0xd45c2040_4270_a125_a25d_ee458c085001),
            notifies: true,
            read_on_pairing: false,
        },
        TagCharacteristic::BatteryLevel => CharacteristicMetadata {
            uuid: Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb),
            notifies: true,
            read_on_pairing: true,
        },
        TagCharacteristic::DeviceName => CharacteristicMetadata {
            uuid: Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb),
            notifies: false,
            read_on_pairing: true,
        },
    }
}

/// Number of acknowledgements pairing waits for: one per enabled
/// notification plus one per initial read.
#[must_use]
pub fn pairing_acknowledgements() -> usize {
    TagCharacteristic::iter()
        .map(|characteristic| {
            usize::from(characteristic.notifies_during_pairing())
                + usize::from(characteristic.read_during_pairing())
        })
        .sum()
}

/// Link configuration sent once a tag finishes protocol initialization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BleLinkConfiguration {
    slow_advertising_interval_ms: f32,
    medium_advertising_interval_ms: f32,
    notification_queue_depth: u32,
}

impl BleLinkConfiguration {
    #[must_use]
    pub fn slow_advertising_interval_ms(&self) -> f32 {
        self.slow_advertising_interval_ms
    }

    #[must_use]
    pub fn medium_advertising_interval_ms(&self) -> f32 {
        self.medium_advertising_interval_ms
    }

    #[must_use]
    pub fn notification_queue_depth(&self) -> u32 {
        self.notification_queue_depth
    }
}

impl Default for BleLinkConfiguration {
    fn default() -> Self {
        Self {
            slow_advertising_interval_ms: SLOW_ADVERTISING_INTERVAL_MS,
            medium_advertising_interval_ms: MEDIUM_ADVERTISING_INTERVAL_MS,
            notification_queue_depth: NOTIFICATION_QUEUE_DEPTH,
        }
    }
}
