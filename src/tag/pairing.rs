use std::cell::{Cell, RefCell};
use std::fmt;

use strum::IntoEnumIterator;
use tracing::{debug, info, instrument, trace};

use super::collaborators::StateMachine;
use super::state::{TagPairingState, TagPairingStateType};
use crate::hw::adapter::{AdapterEvent, PeripheralHandle};
use crate::hw::characteristics::RequiredCharacteristics;
use crate::hw::model::{DeviceAddress, ServiceInfo};
use crate::protocol::{TagCharacteristic, pairing_acknowledgements};
use crate::stream::Subject;

struct AwaitingAcknowledgements {
    peripheral: PeripheralHandle,
    characteristics: RequiredCharacteristics,
    remaining: usize,
}

/// Drives one pairing attempt from raw adapter events.
///
/// Connect, discover services, read the battery and device name, enable
/// notifications, then wait until every read and notification has been
/// acknowledged. `TagPaired` is terminal: later events are ignored.
pub struct PairingStateMachine {
    address: DeviceAddress,
    state: Subject<TagPairingState>,
    kind: Cell<TagPairingStateType>,
    awaiting: RefCell<Option<AwaitingAcknowledgements>>,
}

impl fmt::Debug for PairingStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingStateMachine")
            .field("address", &self.address)
            .field("state", &self.kind.get())
            .finish_non_exhaustive()
    }
}

impl PairingStateMachine {
    #[must_use]
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            state: Subject::sticky_with(TagPairingState::Disconnected),
            kind: Cell::new(TagPairingStateType::Disconnected),
            awaiting: RefCell::new(None),
        }
    }

    /// Sticky stream of pairing progress, starting at `Disconnected`.
    #[must_use]
    pub fn state(&self) -> Subject<TagPairingState> {
        self.state.clone()
    }

    #[must_use]
    pub fn current(&self) -> TagPairingStateType {
        self.kind.get()
    }

    fn transition(&self, state: TagPairingState) {
        let to = state.kind();
        let from = self.kind.replace(to);
        debug!(address = %self.address, %from, %to, "pairing state changed");
        self.state.next(state);
    }

    fn on_connected(&self, peripheral: &PeripheralHandle) {
        if self.kind.get() != TagPairingStateType::Disconnected {
            debug!(state = %self.kind.get(), "ignoring connect outside Disconnected");
            return;
        }

        self.transition(TagPairingState::BluetoothConnected);
        peripheral.discover_services();
    }

    fn on_services_discovered(&self, peripheral: &PeripheralHandle, services: &[ServiceInfo]) {
        if self.kind.get() != TagPairingStateType::BluetoothConnected {
            debug!(state = %self.kind.get(), "ignoring services outside BluetoothConnected");
            return;
        }

        let characteristics = match RequiredCharacteristics::from_services(services) {
            Ok(characteristics) => characteristics,
            Err(error) => {
                self.transition(TagPairingState::Error(error));
                return;
            }
        };

        self.transition(TagPairingState::ServicesDiscovered);
        *self.awaiting.borrow_mut() = Some(AwaitingAcknowledgements {
            peripheral: PeripheralHandle::clone(peripheral),
            characteristics: characteristics.clone(),
            remaining: pairing_acknowledgements(),
        });
        self.transition(TagPairingState::AwaitingNotificationUpdates);

        for characteristic in TagCharacteristic::iter().filter(|c| c.read_during_pairing()) {
            peripheral.read_characteristic(characteristics.get(characteristic));
        }
        for characteristic in TagCharacteristic::iter().filter(|c| c.notifies_during_pairing()) {
            peripheral.enable_notifications(characteristics.get(characteristic));
        }
    }

    fn on_acknowledgement(&self) {
        let paired = {
            let mut awaiting = self.awaiting.borrow_mut();
            let Some(pending) = awaiting.as_mut() else {
                return;
            };
            pending.remaining = pending.remaining.saturating_sub(1);
            trace!(remaining = pending.remaining, "pairing acknowledgement");
            if pending.remaining > 0 {
                return;
            }
            awaiting.take()
        };

        if let Some(paired) = paired {
            info!(address = %self.address, "tag paired");
            self.transition(TagPairingState::TagPaired(
                paired.peripheral,
                paired.characteristics,
            ));
        }
    }
}

impl StateMachine for PairingStateMachine {
    #[instrument(skip(self, event), level = "trace", fields(address = %self.address))]
    fn on_state_event(&self, event: &AdapterEvent) {
        if self.kind.get() == TagPairingStateType::TagPaired {
            trace!("pairing finished; ignoring adapter event");
            return;
        }

        match event {
            AdapterEvent::Connected(peripheral) => self.on_connected(peripheral),
            AdapterEvent::ServicesDiscovered(peripheral, services) => {
                self.on_services_discovered(peripheral, services);
            }
            AdapterEvent::CharacteristicUpdated(_) | AdapterEvent::ValueWritten(_) => {
                if self.kind.get() == TagPairingStateType::AwaitingNotificationUpdates {
                    self.on_acknowledgement();
                }
            }
            AdapterEvent::FailedToConnect(error) | AdapterEvent::Error(error) => {
                self.awaiting.borrow_mut().take();
                self.transition(TagPairingState::Error(error.clone()));
            }
            AdapterEvent::Disconnected(_) => {
                self.awaiting.borrow_mut().take();
                if self.kind.get() != TagPairingStateType::Disconnected {
                    self.transition(TagPairingState::Disconnected);
                }
            }
        }
    }

    fn destroy(&self) {
        self.awaiting.borrow_mut().take();
        self.state.complete();
    }
}
