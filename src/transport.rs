use std::cell::RefCell;
use std::fmt;

use tracing::{debug, instrument, trace};

use crate::error::FragmentError;
use crate::fragmenter::Fragmenter;
use crate::hw::adapter::{AdapterEvent, PeripheralHandle};
use crate::hw::characteristics::RequiredCharacteristics;
use crate::hw::model::CharacteristicUpdate;
use crate::protocol::TagCharacteristic;
use crate::stream::Subject;

/// ATT MTU every BLE link supports before negotiation.
pub const DEFAULT_MTU: usize = 23;

/// Message-level view of a paired tag.
///
/// Outgoing messages are fragmented onto the command characteristic.
/// Response and notify updates are reassembled independently; raw data and
/// battery updates pass through unfragmented.
pub struct FragmentedTransport {
    peripheral: PeripheralHandle,
    characteristics: RequiredCharacteristics,
    mtu: usize,
    response_decoder: RefCell<Fragmenter>,
    notify_decoder: RefCell<Fragmenter>,
    responses: Subject<Vec<u8>>,
    notifications: Subject<Vec<u8>>,
    raw: Subject<Vec<u8>>,
    battery_level: Subject<u8>,
}

impl fmt::Debug for FragmentedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentedTransport")
            .field("address", self.peripheral.address())
            .field("mtu", &self.mtu)
            .finish_non_exhaustive()
    }
}

impl FragmentedTransport {
    #[must_use]
    pub fn new(
        peripheral: PeripheralHandle,
        characteristics: RequiredCharacteristics,
        mtu: usize,
    ) -> Self {
        Self {
            peripheral,
            characteristics,
            mtu,
            response_decoder: RefCell::new(Fragmenter::new()),
            notify_decoder: RefCell::new(Fragmenter::new()),
            responses: Subject::new(),
            notifications: Subject::new(),
            raw: Subject::new(),
            battery_level: Subject::sticky(),
        }
    }

    #[must_use]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Fragments `message` and writes every fragment to the command
    /// characteristic, returning the number of fragments written.
    ///
    /// # Errors
    ///
    /// Returns an error, without writing anything, when the message cannot
    /// be fragmented at this MTU.
    #[instrument(skip(self, message), level = "debug", fields(len = message.len(), mtu = self.mtu))]
    pub fn send(&self, message: &[u8]) -> Result<usize, FragmentError> {
        let fragments = Fragmenter::fragment(message, self.mtu)?;
        for fragment in &fragments {
            trace!(payload = %hex::encode(fragment), "writing fragment");
            self.peripheral
                .write_characteristic(self.characteristics.command(), fragment);
        }
        Ok(fragments.len())
    }

    /// Routes characteristic updates carried by an adapter event.
    pub fn on_adapter_event(&self, event: &AdapterEvent) {
        if let AdapterEvent::CharacteristicUpdated(update) = event {
            self.on_characteristic_updated(update);
        }
    }

    /// Routes one characteristic update to its stream.
    pub fn on_characteristic_updated(&self, update: &CharacteristicUpdate) {
        match TagCharacteristic::from_uuid(update.uuid()) {
            Some(TagCharacteristic::Response) => {
                Self::reassemble(&self.response_decoder, &self.responses, update.value());
            }
            Some(TagCharacteristic::Notify) => {
                Self::reassemble(&self.notify_decoder, &self.notifications, update.value());
            }
            Some(TagCharacteristic::Raw) => self.raw.next(update.value().to_vec()),
            Some(TagCharacteristic::BatteryLevel) => {
                if let Some(&level) = update.value().first() {
                    self.battery_level.next(level);
                }
            }
            Some(TagCharacteristic::Command | TagCharacteristic::DeviceName) | None => {
                debug!(uuid = %update.uuid(), "ignoring update on unrouted characteristic");
            }
        }
    }

    /// Complete messages received on the response characteristic.
    #[must_use]
    pub fn responses(&self) -> Subject<Vec<u8>> {
        self.responses.clone()
    }

    /// Complete messages received on the notify characteristic.
    #[must_use]
    pub fn notifications(&self) -> Subject<Vec<u8>> {
        self.notifications.clone()
    }

    #[must_use]
    pub fn raw_data(&self) -> Subject<Vec<u8>> {
        self.raw.clone()
    }

    /// Sticky battery level in percent.
    #[must_use]
    pub fn battery_level(&self) -> Subject<u8> {
        self.battery_level.clone()
    }

    /// Drops partially reassembled messages on both channels.
    pub fn reset(&self) {
        self.response_decoder.borrow_mut().reset();
        self.notify_decoder.borrow_mut().reset();
    }

    fn reassemble(decoder: &RefCell<Fragmenter>, output: &Subject<Vec<u8>>, fragment: &[u8]) {
        let decoded = decoder.borrow_mut().decode_fragment(fragment);
        if let Ok(Some(message)) = decoded {
            output.next(message);
        }
    }
}
