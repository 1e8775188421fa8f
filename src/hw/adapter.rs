use std::fmt;
use std::rc::Rc;

use super::model::{CharacteristicInfo, CharacteristicUpdate, DeviceAddress, ServiceInfo};
use crate::error::TagError;

/// Shared handle to a connected peripheral.
pub type PeripheralHandle = Rc<dyn Peripheral>;

/// GATT operations on a connected peripheral.
///
/// Operations are fire-and-forget: completions come back to the state
/// machines as [`AdapterEvent`]s, in the order the platform reports them.
pub trait Peripheral: fmt::Debug {
    /// Platform address of this peripheral.
    fn address(&self) -> &DeviceAddress;

    /// Starts service discovery; completes with [`AdapterEvent::ServicesDiscovered`].
    fn discover_services(&self);

    /// Reads a characteristic once; completes with
    /// [`AdapterEvent::CharacteristicUpdated`].
    fn read_characteristic(&self, characteristic: &CharacteristicInfo);

    /// Enables notifications; completes with [`AdapterEvent::ValueWritten`].
    fn enable_notifications(&self, characteristic: &CharacteristicInfo);

    /// Writes a value without waiting for a response.
    fn write_characteristic(&self, characteristic: &CharacteristicInfo, value: &[u8]);
}

/// Platform connect primitive.
pub trait BleConnector {
    /// Starts connecting; completes with [`AdapterEvent::Connected`] or
    /// [`AdapterEvent::FailedToConnect`].
    fn connect(&self, address: &DeviceAddress);
}

impl<F> BleConnector for F
where
    F: Fn(&DeviceAddress),
{
    fn connect(&self, address: &DeviceAddress) {
        self(address);
    }
}

/// Events reported by the platform BLE stack.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Connected(PeripheralHandle),
    FailedToConnect(TagError),
    ServicesDiscovered(PeripheralHandle, Vec<ServiceInfo>),
    CharacteristicUpdated(CharacteristicUpdate),
    ValueWritten(CharacteristicUpdate),
    Disconnected(TagError),
    /// Any other adapter failure.
    Error(TagError),
}
