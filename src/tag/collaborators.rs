use std::fmt;
use std::rc::Rc;

use super::state::{DfuInfo, DfuStatus, InitializationState};
use crate::config::FirmwareVersion;
use crate::hw::adapter::{AdapterEvent, PeripheralHandle};
use crate::hw::characteristics::RequiredCharacteristics;
use crate::protocol::BleLinkConfiguration;
use crate::stream::Subject;

/// Shared handle to an initialized tag session.
pub type TagHandle = Rc<dyn ConnectedTag>;

/// A tag that finished protocol initialization.
pub trait ConnectedTag: fmt::Debug {
    /// Stable identifier of the physical tag.
    fn identifier(&self) -> &str;

    /// Firmware the tag reported during initialization.
    fn firmware_version(&self) -> FirmwareVersion;

    /// Sends the link configuration.
    ///
    /// The returned subject emits one value once the tag accepted the
    /// configuration, or fails.
    fn configure_link(&self, configuration: BleLinkConfiguration) -> Subject<()>;

    /// Tears the session down. Idempotent.
    fn destroy(&self);
}

/// A child state machine owned by the connection state machine.
pub trait StateMachine: fmt::Debug {
    /// Handles one raw adapter event.
    fn on_state_event(&self, event: &AdapterEvent);

    /// Releases subscriptions and completes the machine's state stream.
    fn destroy(&self);
}

/// The child installed while no pairing or initialization is running.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyStateMachine;

impl StateMachine for EmptyStateMachine {
    fn on_state_event(&self, _event: &AdapterEvent) {}

    fn destroy(&self) {}
}

/// Protocol negotiation that runs after pairing and produces a [`TagHandle`].
pub trait InitializationStateMachine: StateMachine {
    /// Sticky stream of negotiation progress.
    fn state(&self) -> Subject<InitializationState>;

    fn start_negotiation(&self);
}

/// Creates one initialization state machine per paired peripheral.
pub trait ProtocolInitializer {
    fn create(
        &self,
        peripheral: PeripheralHandle,
        characteristics: RequiredCharacteristics,
    ) -> Rc<dyn InitializationStateMachine>;
}

/// Firmware update service driven inline when a tag runs blocked firmware.
pub trait DfuManager {
    /// Emits the list of updates available for `tag`, possibly empty.
    fn check_for_updates(&self, tag: &TagHandle) -> Subject<Vec<DfuInfo>>;

    /// Applies `updates` and reports progress until the tag executes the new
    /// image or the update fails.
    fn apply_updates(&self, tag: &TagHandle, updates: Vec<DfuInfo>) -> Subject<DfuStatus>;
}
