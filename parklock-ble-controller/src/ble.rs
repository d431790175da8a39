//! btleplug transport for desktop platforms
//!
//! Adapter events and per-peripheral notification streams are pumped by
//! background tasks into the session's [`EventSink`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use log::{debug, warn};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::session::EventSink;
use crate::transport::{
    Advertisement, GattService, PeripheralHandle, RadioState, Transport, TransportError,
    TransportEvent,
};

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        TransportError::Backend(e.to_string())
    }
}

type PeripheralMap = Arc<Mutex<HashMap<PeripheralHandle, Peripheral>>>;

/// Get the default Bluetooth adapter
pub async fn get_adapter() -> Result<Adapter, TransportError> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(TransportError::NoAdapter)
}

/// Scan for `duration` and return every advertisement seen
pub async fn scan(duration: Duration) -> Result<Vec<Advertisement>, TransportError> {
    let adapter = get_adapter().await?;

    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    let mut found = Vec::new();
    for peripheral in adapter.peripherals().await? {
        if let Some(props) = peripheral.properties().await? {
            found.push(advertisement(&peripheral, props));
        }
    }

    adapter.stop_scan().await?;
    Ok(found)
}

/// Keyed by platform id; CoreBluetooth reports every address as zero
fn handle_of(id: &impl std::fmt::Display) -> PeripheralHandle {
    PeripheralHandle(id.to_string())
}

fn radio_state_of(state: &CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        CentralState::Unknown => RadioState::Unknown,
    }
}

/// Manufacturer blob as the lock advertises it: company id (little endian)
/// then payload. The lowest company id wins when there are several.
fn manufacturer_blob(props: &PeripheralProperties) -> Option<Vec<u8>> {
    props
        .manufacturer_data
        .iter()
        .min_by_key(|(company, _)| **company)
        .map(|(company, data)| {
            let mut blob = company.to_le_bytes().to_vec();
            blob.extend_from_slice(data);
            blob
        })
}

fn advertisement(peripheral: &Peripheral, props: PeripheralProperties) -> Advertisement {
    Advertisement {
        peripheral: handle_of(&peripheral.id()),
        manufacturer_data: manufacturer_blob(&props),
        local_name: props.local_name,
        rssi: props.rssi,
    }
}

pub struct BtleTransport {
    adapter: Adapter,
    sink: EventSink,
    peripherals: PeripheralMap,
    notifications: Mutex<HashMap<PeripheralHandle, JoinHandle<()>>>,
    events: JoinHandle<()>,
}

impl BtleTransport {
    /// Open the default adapter and start forwarding its events to `sink`
    pub async fn new(sink: EventSink) -> Result<Self, TransportError> {
        let adapter = get_adapter().await?;
        let peripherals = PeripheralMap::default();

        let stream = adapter.events().await?;
        let events = tokio::spawn(pump_adapter_events(
            adapter.clone(),
            stream,
            sink.clone(),
            peripherals.clone(),
        ));

        Ok(Self {
            adapter,
            sink,
            peripherals,
            notifications: Mutex::new(HashMap::new()),
            events,
        })
    }

    fn peripheral(&self, handle: &PeripheralHandle) -> Result<Peripheral, TransportError> {
        self.peripherals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(handle)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral(handle.clone()))
    }

    fn stop_notifications(&self, handle: &PeripheralHandle) {
        let task = self
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(handle);
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        self.events.abort();
        for (_, task) in self
            .notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
        {
            task.abort();
        }
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: u128) -> Result<Characteristic, TransportError> {
    let uuid = Uuid::from_u128(uuid);
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(TransportError::CharacteristicNotFound(uuid.as_u128()))
}

async fn pump_adapter_events(
    adapter: Adapter,
    mut stream: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    sink: EventSink,
    peripherals: PeripheralMap,
) {
    while let Some(event) = stream.next().await {
        let event = match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. } => {
                match discovered(&adapter, &id, &peripherals).await {
                    Some(advertisement) => TransportEvent::Discovered(advertisement),
                    None => continue,
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let handle = handle_of(&id);
                let known = peripherals
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .contains_key(&handle);
                if !known {
                    continue;
                }
                TransportEvent::Disconnected(handle)
            }
            CentralEvent::StateUpdate(state) => {
                TransportEvent::RadioStateChanged(radio_state_of(&state))
            }
            _ => continue,
        };

        if !sink.push(event) {
            debug!("session gone, stopping adapter events");
            return;
        }
    }
}

async fn discovered(
    adapter: &Adapter,
    id: &PeripheralId,
    peripherals: &PeripheralMap,
) -> Option<Advertisement> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let props = peripheral.properties().await.ok()??;
    let advertisement = advertisement(&peripheral, props);
    peripherals
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(advertisement.peripheral.clone(), peripheral);
    Some(advertisement)
}

#[async_trait]
impl Transport for BtleTransport {
    async fn radio_state(&self) -> RadioState {
        match self.adapter.adapter_state().await {
            Ok(state) => radio_state_of(&state),
            Err(e) => {
                warn!("failed to read adapter state: {e}");
                RadioState::Unknown
            }
        }
    }

    async fn start_scan(&self) -> Result<(), TransportError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, handle: &PeripheralHandle) -> Result<(), TransportError> {
        let peripheral = self.peripheral(handle)?;
        peripheral.connect().await?;

        let mut stream = peripheral.notifications().await?;
        let sink = self.sink.clone();
        let source = handle.clone();
        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let event = TransportEvent::Notification {
                    peripheral: source.clone(),
                    characteristic: notification.uuid.as_u128(),
                    value: notification.value,
                };
                if !sink.push(event) {
                    return;
                }
            }
        });

        self.stop_notifications(handle);
        self.notifications
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.clone(), task);
        Ok(())
    }

    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<(), TransportError> {
        self.stop_notifications(handle);
        let peripheral = self.peripheral(handle)?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn discover_services(
        &self,
        handle: &PeripheralHandle,
    ) -> Result<Vec<GattService>, TransportError> {
        let peripheral = self.peripheral(handle)?;
        peripheral.discover_services().await?;

        Ok(peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid.as_u128(),
                characteristics: service
                    .characteristics
                    .iter()
                    .map(|c| c.uuid.as_u128())
                    .collect(),
            })
            .collect())
    }

    async fn set_notify(
        &self,
        handle: &PeripheralHandle,
        characteristic: u128,
        enabled: bool,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(handle)?;
        let characteristic = find_characteristic(&peripheral, characteristic)?;
        if enabled {
            peripheral.subscribe(&characteristic).await?;
        } else if let Err(e) = peripheral.unsubscribe(&characteristic).await {
            warn!("failed to unsubscribe from {}: {e}", characteristic.uuid);
        }
        Ok(())
    }

    async fn write(
        &self,
        handle: &PeripheralHandle,
        characteristic: u128,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(handle)?;
        let characteristic = find_characteristic(&peripheral, characteristic)?;
        peripheral
            .write(&characteristic, value, WriteType::WithResponse)
            .await?;
        Ok(())
    }
}
