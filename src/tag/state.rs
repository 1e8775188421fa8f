use strum_macros::{Display, EnumDiscriminants};

use super::collaborators::TagHandle;
use crate::config::FirmwareVersion;
use crate::error::TagError;
use crate::hw::adapter::PeripheralHandle;
use crate::hw::characteristics::RequiredCharacteristics;

/// Lifecycle of one tag, as published by
/// [`ConnectionStateMachine::state`](super::ConnectionStateMachine::state).
///
/// `Disconnected` is the only terminal state; nothing but a fresh
/// `connect()` leaves it.
#[derive(Debug, Clone, EnumDiscriminants)]
#[strum_discriminants(name(ConnectionStateType), derive(Display, Hash))]
pub enum ConnectionState {
    PreparingToConnect,
    Connecting,
    Initializing,
    Configuring,
    Connected(TagHandle),
    FirmwareUpdateInitiated,
    /// Transfer progress in percent.
    FirmwareTransferring(u8),
    FirmwareExecuting,
    FirmwareTransferComplete,
    Disconnected(TagError),
}

impl ConnectionState {
    #[must_use]
    pub fn kind(&self) -> ConnectionStateType {
        ConnectionStateType::from(self)
    }

    #[must_use]
    pub fn is_type(&self, kind: ConnectionStateType) -> bool {
        self.kind() == kind
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected(_))
    }

    /// Returns the session handle of a connected tag.
    #[must_use]
    pub fn tag(&self) -> Option<&TagHandle> {
        match self {
            Self::Connected(tag) => Some(tag),
            _ => None,
        }
    }

    /// Returns the error a disconnected state carries.
    #[must_use]
    pub fn error(&self) -> Option<&TagError> {
        match self {
            Self::Disconnected(error) => Some(error),
            _ => None,
        }
    }
}

/// Progress of one pairing attempt.
#[derive(Debug, Clone, EnumDiscriminants)]
#[strum_discriminants(name(TagPairingStateType), derive(Display, Hash))]
pub enum TagPairingState {
    PreparingToConnect,
    Disconnected,
    BluetoothConnected,
    ServicesDiscovered,
    AwaitingNotificationUpdates,
    TagPaired(PeripheralHandle, RequiredCharacteristics),
    Error(TagError),
}

impl TagPairingState {
    #[must_use]
    pub fn kind(&self) -> TagPairingStateType {
        TagPairingStateType::from(self)
    }

    #[must_use]
    pub fn is_type(&self, kind: TagPairingStateType) -> bool {
        self.kind() == kind
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TagPaired(..))
    }
}

/// States reported by a protocol-initialization state machine.
#[derive(Debug, Clone)]
pub enum InitializationState {
    Paired,
    HelloSent,
    BeginSent,
    ComponentInfoSent,
    CreatingTagInstance,
    TagInitialized(TagHandle),
    Error(TagError),
}

/// Progress reported by a [`DfuManager`](super::DfuManager) while applying
/// updates.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DfuStatus {
    Idle,
    Preparing,
    CheckForUpdates,
    /// Transfer progress in percent.
    TransferProgress(u8),
    Transferred,
    Executing,
    Completed,
    Error(TagError),
}

/// One firmware image available for a tag.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DfuInfo {
    version: FirmwareVersion,
    component: String,
}

impl DfuInfo {
    #[must_use]
    pub fn new(version: FirmwareVersion, component: impl Into<String>) -> Self {
        Self {
            version,
            component: component.into(),
        }
    }

    #[must_use]
    pub fn version(&self) -> FirmwareVersion {
        self.version
    }

    #[must_use]
    pub fn component(&self) -> &str {
        &self.component
    }
}

/// Inputs to the connection state machine's transition table.
#[derive(Debug, Clone, EnumDiscriminants)]
#[strum_discriminants(name(ConnectionEventType), derive(Display))]
pub(crate) enum ConnectionEvent {
    ConnectionError(TagError),
    ConnectionProgress,
    InitializationProgress,
    TagPaired(PeripheralHandle, RequiredCharacteristics),
    TagInitialized(TagHandle),
    TagConfigured(TagHandle),
    FirmwareUpdateInitiated(TagHandle),
    FirmwareUpdateChecked(TagHandle, Vec<DfuInfo>),
    FirmwareTransferring(u8),
    FirmwareExecuting(TagHandle),
    FirmwareTransferComplete(TagHandle),
    FirmwareUpdateError(TagError),
    TagDisconnected(TagError),
}

impl ConnectionEvent {
    pub(crate) fn kind(&self) -> ConnectionEventType {
        ConnectionEventType::from(self)
    }
}
