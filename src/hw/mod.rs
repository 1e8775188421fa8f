pub(crate) mod adapter;
mod btleplug_backend;
pub(crate) mod characteristics;
pub(crate) mod fake_backend;
pub(crate) mod model;

pub use self::adapter::{AdapterEvent, BleConnector, Peripheral, PeripheralHandle};
pub use self::btleplug_backend::{BtleplugBackend, BtleplugPeripheral};
pub use self::characteristics::RequiredCharacteristics;
pub use self::model::{
    CharacteristicInfo, CharacteristicProperty, CharacteristicUpdate, DeviceAddress, ServiceInfo,
};
