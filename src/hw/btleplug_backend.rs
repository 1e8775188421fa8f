use std::cell::Cell;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, Service, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{sleep, timeout};
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::adapter::{AdapterEvent, BleConnector, Peripheral};
use super::model::{
    CharacteristicInfo, CharacteristicProperty, CharacteristicUpdate, DeviceAddress, ServiceInfo,
};
use crate::error::TagError;

const SCAN_TIMEOUT: Duration = Duration::from_secs(10);
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);
const CCCD_ENABLE_NOTIFICATIONS: [u8; 2] = [0x01, 0x00];

/// Platform BLE adapter backed by `btleplug`.
///
/// Completions are reported on the adapter-event channel. Operations run as
/// local tasks, so the backend must be driven from inside a
/// [`tokio::task::LocalSet`].
#[derive(Debug, Clone)]
pub struct BtleplugBackend {
    adapter: Adapter,
    events: UnboundedSender<AdapterEvent>,
}

impl BtleplugBackend {
    /// Opens the first platform adapter.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::BluetoothOff`] when the platform exposes no
    /// adapter, or a connection error when the BLE manager cannot start.
    #[instrument(skip(events), level = "debug")]
    pub async fn new(events: UnboundedSender<AdapterEvent>) -> Result<Self, TagError> {
        let manager = Manager::new().await.map_err(TagError::connection)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(TagError::connection)?
            .into_iter()
            .next()
            .ok_or(TagError::BluetoothOff)?;
        if let Ok(info) = adapter.adapter_info().await {
            debug!(adapter = %info, "using bluetooth adapter");
        }
        Ok(Self { adapter, events })
    }

    /// Reports platform disconnects of `address` as
    /// [`AdapterEvent::Disconnected`] until the adapter event stream ends.
    ///
    /// # Errors
    ///
    /// Returns an error when the adapter event stream cannot be opened.
    #[instrument(skip(self), level = "debug", fields(%address))]
    pub async fn watch_disconnects(&self, address: DeviceAddress) -> Result<(), TagError> {
        let mut events = self.adapter.events().await.map_err(TagError::connection)?;
        while let Some(event) = events.next().await {
            let CentralEvent::DeviceDisconnected(id) = event else {
                continue;
            };
            let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                continue;
            };
            if !identifies(&address, &peripheral) {
                continue;
            }

            info!("peripheral disconnected");
            let disconnected = AdapterEvent::Disconnected(TagError::connection("peripheral disconnected"));
            if self.events.send(disconnected).is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn find_and_connect(
        &self,
        address: &DeviceAddress,
    ) -> Result<Rc<BtleplugPeripheral>, TagError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(TagError::connection)?;

        let found = timeout(SCAN_TIMEOUT, self.find_peripheral(address)).await;
        if let Err(error) = self.adapter.stop_scan().await {
            debug!(%error, "failed to stop adapter scan cleanly");
        }
        let peripheral = match found {
            Ok(peripheral) => peripheral?,
            Err(_elapsed) => {
                return Err(TagError::connection(format!(
                    "{address} was not found within {}s",
                    SCAN_TIMEOUT.as_secs()
                )));
            }
        };

        if !peripheral.is_connected().await.map_err(TagError::connection)? {
            peripheral.connect().await.map_err(TagError::connection)?;
        }
        info!(%address, "peripheral connected");
        Ok(BtleplugPeripheral::new(
            address.clone(),
            peripheral,
            self.events.clone(),
        ))
    }

    async fn find_peripheral(&self, address: &DeviceAddress) -> Result<PlatformPeripheral, TagError> {
        loop {
            let peripherals = self.adapter.peripherals().await.map_err(TagError::connection)?;
            if let Some(peripheral) = peripherals
                .into_iter()
                .find(|peripheral| identifies(address, peripheral))
            {
                return Ok(peripheral);
            }
            sleep(SCAN_POLL_INTERVAL).await;
        }
    }
}

impl BleConnector for BtleplugBackend {
    /// # Panics
    ///
    /// Panics when called outside a [`tokio::task::LocalSet`].
    fn connect(&self, address: &DeviceAddress) {
        let backend = self.clone();
        let address = address.clone();
        tokio::task::spawn_local(async move {
            let event = match backend.find_and_connect(&address).await {
                Ok(peripheral) => AdapterEvent::Connected(peripheral),
                Err(error) => {
                    warn!(%address, %error, "failed to connect");
                    AdapterEvent::FailedToConnect(error)
                }
            };
            let _ = backend.events.send(event);
        });
    }
}

/// A connected `btleplug` peripheral.
#[derive(Debug)]
pub struct BtleplugPeripheral {
    address: DeviceAddress,
    peripheral: PlatformPeripheral,
    events: UnboundedSender<AdapterEvent>,
    pumping_notifications: Cell<bool>,
    this: Weak<BtleplugPeripheral>,
}

impl BtleplugPeripheral {
    fn new(
        address: DeviceAddress,
        peripheral: PlatformPeripheral,
        events: UnboundedSender<AdapterEvent>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|this| Self {
            address,
            peripheral,
            events,
            pumping_notifications: Cell::new(false),
            this: this.clone(),
        })
    }

    fn find_characteristic(&self, uuid: Uuid) -> Result<Characteristic, TagError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|characteristic| characteristic.uuid == uuid)
            .ok_or_else(|| TagError::connection(format!("characteristic {uuid} is not discovered")))
    }

    fn run(
        &self,
        operation: &'static str,
        task: impl Future<Output = Result<AdapterEvent, TagError>> + 'static,
    ) {
        let events = self.events.clone();
        let address = self.address.clone();
        tokio::task::spawn_local(async move {
            let event = task.await.unwrap_or_else(|error| {
                warn!(%address, operation, %error, "gatt operation failed");
                AdapterEvent::Error(error)
            });
            let _ = events.send(event);
        });
    }

    fn start_notification_pump(&self) {
        if self.pumping_notifications.replace(true) {
            return;
        }

        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        tokio::task::spawn_local(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(notifications) => notifications,
                Err(error) => {
                    warn!(%error, "failed to open notification stream");
                    return;
                }
            };
            while let Some(notification) = notifications.next().await {
                trace!(
                    uuid = %notification.uuid,
                    payload = %hex::encode(&notification.value),
                    "notification"
                );
                let update = CharacteristicUpdate::new(notification.uuid, notification.value);
                if events.send(AdapterEvent::CharacteristicUpdated(update)).is_err() {
                    break;
                }
            }
            debug!("notification stream closed");
        });
    }
}

impl Peripheral for BtleplugPeripheral {
    fn address(&self) -> &DeviceAddress {
        &self.address
    }

    #[instrument(skip(self), level = "debug", fields(address = %self.address))]
    fn discover_services(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.start_notification_pump();

        let peripheral = self.peripheral.clone();
        self.run("discover_services", async move {
            peripheral
                .discover_services()
                .await
                .map_err(|error| TagError::ServiceDiscovery {
                    reason: error.to_string(),
                })?;
            let services = peripheral.services().iter().map(service_info).collect();
            Ok(AdapterEvent::ServicesDiscovered(this, services))
        });
    }

    #[instrument(skip(self, characteristic), level = "trace", fields(uuid = %characteristic.uuid()))]
    fn read_characteristic(&self, characteristic: &CharacteristicInfo) {
        let peripheral = self.peripheral.clone();
        let target = self.find_characteristic(characteristic.uuid());
        self.run("read", async move {
            let target = target?;
            let value = peripheral.read(&target).await.map_err(TagError::connection)?;
            Ok(AdapterEvent::CharacteristicUpdated(CharacteristicUpdate::new(
                target.uuid,
                value,
            )))
        });
    }

    #[instrument(skip(self, characteristic), level = "trace", fields(uuid = %characteristic.uuid()))]
    fn enable_notifications(&self, characteristic: &CharacteristicInfo) {
        let peripheral = self.peripheral.clone();
        let target = self.find_characteristic(characteristic.uuid());
        self.run("subscribe", async move {
            let target = target?;
            peripheral.subscribe(&target).await.map_err(TagError::connection)?;
            Ok(AdapterEvent::ValueWritten(CharacteristicUpdate::new(
                target.uuid,
                CCCD_ENABLE_NOTIFICATIONS.to_vec(),
            )))
        });
    }

    #[instrument(
        skip(self, characteristic, value),
        level = "trace",
        fields(uuid = %characteristic.uuid(), payload = %hex::encode(value))
    )]
    fn write_characteristic(&self, characteristic: &CharacteristicInfo, value: &[u8]) {
        let peripheral = self.peripheral.clone();
        let target = self.find_characteristic(characteristic.uuid());
        let value = value.to_vec();
        let address = self.address.clone();
        tokio::task::spawn_local(async move {
            let result = match target {
                Ok(target) => peripheral
                    .write(&target, &value, WriteType::WithoutResponse)
                    .await
                    .map_err(TagError::connection),
                Err(error) => Err(error),
            };
            if let Err(error) = result {
                warn!(%address, %error, "write failed");
            }
        });
    }
}

fn identifies(address: &DeviceAddress, peripheral: &PlatformPeripheral) -> bool {
    address.matches(&peripheral.address().to_string()) || address.matches(&peripheral.id().to_string())
}

fn service_info(service: &Service) -> ServiceInfo {
    let characteristics = service
        .characteristics
        .iter()
        .map(|characteristic| {
            CharacteristicInfo::new(characteristic.uuid, properties(characteristic.properties))
        })
        .collect();
    ServiceInfo::new(service.uuid, service.primary, characteristics)
}

fn properties(flags: CharPropFlags) -> Vec<CharacteristicProperty> {
    [
        (CharPropFlags::READ, CharacteristicProperty::Read),
        (CharPropFlags::WRITE, CharacteristicProperty::Write),
        (
            CharPropFlags::WRITE_WITHOUT_RESPONSE,
            CharacteristicProperty::WriteWithoutResponse,
        ),
        (CharPropFlags::NOTIFY, CharacteristicProperty::Notify),
        (CharPropFlags::INDICATE, CharacteristicProperty::Indicate),
    ]
    .into_iter()
    .filter(|(flag, _)| flags.contains(*flag))
    .map(|(_, property)| property)
    .collect()
}
