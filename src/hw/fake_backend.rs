use std::cell::RefCell;
use std::rc::{Rc, Weak};

use strum::IntoEnumIterator;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;
use uuid::Uuid;

use super::adapter::{AdapterEvent, BleConnector, Peripheral, PeripheralHandle};
use super::model::{
    CharacteristicInfo, CharacteristicProperty, CharacteristicUpdate, DeviceAddress, ServiceInfo,
};
use crate::protocol::{TAG_SERVICE_UUID, TagCharacteristic};

const GENERIC_ACCESS_SERVICE_UUID: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);
const BATTERY_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Battery level reported by responding fake peripherals.
pub const FAKE_BATTERY_LEVEL: u8 = 87;
/// Device name reported by responding fake peripherals.
pub const FAKE_DEVICE_NAME: &str = "Fake Tag";

/// One GATT operation issued against a [`FakePeripheral`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PeripheralOp {
    DiscoverServices,
    Read(Uuid),
    EnableNotifications(Uuid),
    Write(Uuid, Vec<u8>),
}

/// Fake peripheral used in tests and non-hardware environments.
///
/// Records every operation. A responding peripheral also pushes the
/// completion event for each operation into an adapter-event channel.
#[derive(Debug)]
pub struct FakePeripheral {
    address: DeviceAddress,
    services: Vec<ServiceInfo>,
    operations: RefCell<Vec<PeripheralOp>>,
    events: Option<UnboundedSender<AdapterEvent>>,
    this: Weak<FakePeripheral>,
}

impl FakePeripheral {
    /// Creates a recording-only peripheral exposing the tag services.
    #[must_use]
    pub fn new(address: impl Into<DeviceAddress>) -> Rc<Self> {
        Self::build(address.into(), tag_services(), None)
    }

    /// Creates a peripheral that answers each operation on `events`.
    #[must_use]
    pub fn responding(
        address: impl Into<DeviceAddress>,
        events: UnboundedSender<AdapterEvent>,
    ) -> Rc<Self> {
        Self::build(address.into(), tag_services(), Some(events))
    }

    /// Creates a recording-only peripheral exposing custom services.
    #[must_use]
    pub fn with_services(address: impl Into<DeviceAddress>, services: Vec<ServiceInfo>) -> Rc<Self> {
        Self::build(address.into(), services, None)
    }

    fn build(
        address: DeviceAddress,
        services: Vec<ServiceInfo>,
        events: Option<UnboundedSender<AdapterEvent>>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            address,
            services,
            operations: RefCell::new(Vec::new()),
            events,
            this: this.clone(),
        })
    }

    /// Returns the services this peripheral reports on discovery.
    #[must_use]
    pub fn services(&self) -> &[ServiceInfo] {
        &self.services
    }

    /// Returns every operation issued so far.
    #[must_use]
    pub fn operations(&self) -> Vec<PeripheralOp> {
        self.operations.borrow().clone()
    }

    /// Returns every value written to one characteristic, in order.
    #[must_use]
    pub fn writes_to(&self, uuid: Uuid) -> Vec<Vec<u8>> {
        self.operations
            .borrow()
            .iter()
            .filter_map(|operation| match operation {
                PeripheralOp::Write(target, value) if *target == uuid => Some(value.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, operation: PeripheralOp) {
        trace!(address = %self.address, ?operation, "fake peripheral operation");
        self.operations.borrow_mut().push(operation);
    }

    fn respond(&self, event: impl FnOnce(PeripheralHandle) -> AdapterEvent) {
        let (Some(events), Some(this)) = (&self.events, self.this.upgrade()) else {
            return;
        };
        let _ = events.send(event(this));
    }
}

impl Peripheral for FakePeripheral {
    fn address(&self) -> &DeviceAddress {
        &self.address
    }

    fn discover_services(&self) {
        self.record(PeripheralOp::DiscoverServices);
        let services = self.services.clone();
        self.respond(|this| AdapterEvent::ServicesDiscovered(this, services));
    }

    fn read_characteristic(&self, characteristic: &CharacteristicInfo) {
        let uuid = characteristic.uuid();
        self.record(PeripheralOp::Read(uuid));
        let value = match TagCharacteristic::from_uuid(uuid) {
            Some(TagCharacteristic::BatteryLevel) => vec![FAKE_BATTERY_LEVEL],
            Some(TagCharacteristic::DeviceName) => FAKE_DEVICE_NAME.as_bytes().to_vec(),
            _ => Vec::new(),
        };
        self.respond(|_| {
            AdapterEvent::CharacteristicUpdated(CharacteristicUpdate::new(uuid, value))
        });
    }

    fn enable_notifications(&self, characteristic: &CharacteristicInfo) {
        let uuid = characteristic.uuid();
        self.record(PeripheralOp::EnableNotifications(uuid));
        self.respond(|_| AdapterEvent::ValueWritten(CharacteristicUpdate::new(uuid, vec![0x01, 0x00])));
    }

    fn write_characteristic(&self, characteristic: &CharacteristicInfo, value: &[u8]) {
        self.record(PeripheralOp::Write(characteristic.uuid(), value.to_vec()));
    }
}

/// Fake platform connect primitive.
///
/// Clones share one call log. A responding connector answers each connect
/// with [`AdapterEvent::Connected`] for a fresh responding peripheral.
#[derive(Debug, Clone, Default)]
pub struct FakeConnector {
    connects: Rc<RefCell<Vec<DeviceAddress>>>,
    peripherals: Rc<RefCell<Vec<Rc<FakePeripheral>>>>,
    events: Option<UnboundedSender<AdapterEvent>>,
}

impl FakeConnector {
    /// Creates a connector that only records calls.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a connector that answers on `events`.
    #[must_use]
    pub fn responding(events: UnboundedSender<AdapterEvent>) -> Self {
        Self {
            events: Some(events),
            ..Self::default()
        }
    }

    /// Returns how many times the connect primitive ran.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.connects.borrow().len()
    }

    /// Returns every address passed to the connect primitive.
    #[must_use]
    pub fn connected_addresses(&self) -> Vec<DeviceAddress> {
        self.connects.borrow().clone()
    }

    /// Returns the peripherals created by a responding connector.
    #[must_use]
    pub fn peripherals(&self) -> Vec<Rc<FakePeripheral>> {
        self.peripherals.borrow().clone()
    }
}

impl BleConnector for FakeConnector {
    fn connect(&self, address: &DeviceAddress) {
        self.connects.borrow_mut().push(address.clone());
        let Some(events) = &self.events else {
            return;
        };

        let peripheral = FakePeripheral::responding(address.clone(), events.clone());
        self.peripherals.borrow_mut().push(Rc::clone(&peripheral));
        let _ = events.send(AdapterEvent::Connected(peripheral));
    }
}

/// Services exposed by a tag: the vendor service plus the SIG generic-access
/// and battery services.
#[must_use]
pub fn tag_services() -> Vec<ServiceInfo> {
    let characteristic = |characteristic: TagCharacteristic| {
        let mut properties = Vec::new();
        if characteristic == TagCharacteristic::Command {
            properties.push(CharacteristicProperty::WriteWithoutResponse);
        }
        if characteristic.read_during_pairing() {
            properties.push(CharacteristicProperty::Read);
        }
        if characteristic.notifies_during_pairing() {
            properties.push(CharacteristicProperty::Notify);
        }
        CharacteristicInfo::new(characteristic.uuid(), properties)
    };

    let vendor = TagCharacteristic::iter()
        .filter(|candidate| {
            !matches!(
                candidate,
                TagCharacteristic::BatteryLevel | TagCharacteristic::DeviceName
            )
        })
        .map(&characteristic)
        .collect();

    vec![
        ServiceInfo::new(
            GENERIC_ACCESS_SERVICE_UUID,
            true,
            vec![characteristic(TagCharacteristic::DeviceName)],
        ),
        ServiceInfo::new(
            BATTERY_SERVICE_UUID,
            true,
            vec![characteristic(TagCharacteristic::BatteryLevel)],
        ),
        ServiceInfo::new(TAG_SERVICE_UUID, true, vendor),
    ]
}
