mod config;
mod driver;
mod error;
pub mod fake;
mod fragmenter;
mod hw;
mod protocol;
mod stream;
mod tag;
mod telemetry;
mod transport;

pub use config::{ConnectionConfig, FirmwareVersion};
pub use driver::ConnectionDriver;
pub use error::{ConfigError, FirmwareUpdateFailure, FragmentError, TagError, TelemetryError};
pub use fragmenter::{Fragmenter, MAX_MESSAGE_LEN, decode_varint, encode_varint};
pub use hw::{
    AdapterEvent, BleConnector, BtleplugBackend, BtleplugPeripheral, CharacteristicInfo,
    CharacteristicProperty, CharacteristicUpdate, DeviceAddress, Peripheral, PeripheralHandle,
    RequiredCharacteristics, ServiceInfo,
};
pub use protocol::{
    BleLinkConfiguration, MEDIUM_ADVERTISING_INTERVAL_MS, NOTIFICATION_QUEUE_DEPTH,
    SLOW_ADVERTISING_INTERVAL_MS, TAG_SERVICE_UUID, TagCharacteristic, pairing_acknowledgements,
};
pub use stream::{MAX_EMIT_DEPTH, Signal, Subject, SubjectStream, Subscription};
pub use tag::{
    ConnectedTag, ConnectionContext, ConnectionState, ConnectionStateMachine, ConnectionStateType,
    DfuInfo, DfuManager, DfuStatus, EmptyStateMachine, InitializationState,
    InitializationStateMachine, PairingStateMachine, ProtocolInitializer, StateMachine, TagHandle,
    TagPairingState, TagPairingStateType,
};
pub use telemetry::initialise_tracing;
pub use transport::{DEFAULT_MTU, FragmentedTransport};
