use thiserror::Error;

use crate::config::FirmwareVersion;
use crate::fragmenter::MAX_MESSAGE_LEN;

/// Errors that end a connection attempt.
///
/// Only the kind matters to the lifecycle: [`TagError::BluetoothOff`] is the
/// one kind that suppresses automatic reconnection.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum TagError {
    #[error("bluetooth is turned off")]
    BluetoothOff,
    #[error("service discovery failed: {reason}")]
    ServiceDiscovery { reason: String },
    #[error("bluetooth connection failed: {cause}")]
    BluetoothConnection { cause: String },
    #[error("protocol initialization failed: {reason}")]
    Initialization { reason: String },
    #[error(transparent)]
    FirmwareUpdate(#[from] FirmwareUpdateFailure),
}

impl TagError {
    /// Builds a connection error from any displayable cause.
    pub fn connection(cause: impl std::fmt::Display) -> Self {
        Self::BluetoothConnection {
            cause: cause.to_string(),
        }
    }

    /// Returns whether a disconnect carrying this error may be retried
    /// automatically.
    ///
    /// ```
    /// use taglink::TagError;
    ///
    /// assert!(TagError::connection("link loss").is_reconnect_eligible());
    /// assert!(!TagError::BluetoothOff.is_reconnect_eligible());
    /// ```
    #[must_use]
    pub fn is_reconnect_eligible(&self) -> bool {
        !matches!(self, Self::BluetoothOff)
    }
}

/// Reasons an inline firmware update could not bring the tag to a usable
/// firmware.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum FirmwareUpdateFailure {
    #[error("firmware {version} is blocked and must be updated before connecting")]
    BlockedVersion { version: FirmwareVersion },
    #[error("firmware {version} is blocked but no firmware update manager is available")]
    ManagerUnavailable { version: FirmwareVersion },
    #[error("checking for firmware updates failed: {reason}")]
    CheckFailed { reason: String },
    #[error("applying firmware updates failed: {reason}")]
    ApplyFailed { reason: String },
}

/// Errors returned by the fragment codec.
///
/// Every decode error leaves the decoder reset; the next `FIRST` fragment
/// starts a fresh message.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum FragmentError {
    #[error("message of {len} bytes exceeds the {max}-byte limit", max = MAX_MESSAGE_LEN)]
    MessageTooLarge { len: usize },
    #[error("mtu {mtu} cannot carry a fragment header, length prefix and payload")]
    MtuTooSmall { mtu: usize },
    #[error("received an empty fragment")]
    EmptyFragment,
    #[error("fragment length prefix is malformed")]
    MalformedLength,
    #[error("fragment counter {actual} does not match expected counter {expected}")]
    CounterMismatch { expected: u8, actual: u8 },
    #[error("continuation fragment {counter} arrived with no message in progress")]
    NoMessageInProgress { counter: u8 },
    #[error("reassembled {actual} bytes but the first fragment announced {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Errors returned while loading connection configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file `{path}`")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("configuration is not valid JSON")]
    Parse(#[from] serde_json::Error),
    #[error("invalid firmware version `{value}`; expected `major.minor.micro`")]
    InvalidFirmwareVersion { value: String },
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}
