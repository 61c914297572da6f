// btleplug backend for the SDK transport traits
//
// Every initiator call spawns a task on the runtime and reports its completion as a
// TransportEvent, the same way a platform BLE stack calls back.

use anyhow::{Context, Result};
use bluestsdk_core::protocol::advertise::{DEVICE_NAME_TYPE, TX_POWER_TYPE, VENDOR_DATA_TYPE};
use bluestsdk_core::protocol::uuids::CLIENT_CONFIGURATION_DESCRIPTOR;
use bluestsdk_core::transport::{
    AdvertisementSink, CharacteristicInfo, CharacteristicProperties, ServiceInfo,
    TransportEventSender,
};
use bluestsdk_core::{
    Advertisement, AdvertisementScanner, BleTransport, BondState, ConnectionHandle,
    TransportError, TransportEvent,
};
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// One open link
struct Link {
    peripheral: Peripheral,
    events: TransportEventSender,
    characteristics: Arc<Mutex<HashMap<Uuid, Characteristic>>>,
    notifications: Option<JoinHandle<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(task) = self.notifications.take() {
            task.abort();
        }
    }
}

struct CentralInner {
    adapter: Adapter,
    runtime: Handle,
    peripherals: Mutex<HashMap<String, Peripheral>>,
    links: Mutex<HashMap<ConnectionHandle, Link>>,
    next_handle: AtomicU64,
    sink: Mutex<Option<AdvertisementSink>>,
}

/// Host Bluetooth adapter driving both scanning and connections
#[derive(Clone)]
pub struct BleCentral {
    inner: Arc<CentralInner>,
}

impl BleCentral {
    /// Open adapter `index` and start following its events
    pub async fn open(index: usize) -> Result<Self> {
        let manager = Manager::new()
            .await
            .context("Failed to open the Bluetooth manager")?;
        let adapter = manager
            .adapters()
            .await
            .context("Failed to list Bluetooth adapters")?
            .into_iter()
            .nth(index)
            .with_context(|| format!("No Bluetooth adapter at index {}", index))?;
        let info = adapter.adapter_info().await.unwrap_or_default();
        info!("Using adapter {}: {}", index, info);

        let events = adapter
            .events()
            .await
            .context("Failed to subscribe to adapter events")?;
        let central = Self {
            inner: Arc::new(CentralInner {
                adapter,
                runtime: Handle::current(),
                peripherals: Mutex::new(HashMap::new()),
                links: Mutex::new(HashMap::new()),
                next_handle: AtomicU64::new(0),
                sink: Mutex::new(None),
            }),
        };

        let inner = Arc::downgrade(&central.inner);
        tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.next().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.handle_central_event(event).await;
            }
            debug!("Adapter event stream closed");
        });
        Ok(central)
    }

    fn link<T>(
        &self,
        handle: ConnectionHandle,
        with: impl FnOnce(&Link) -> T,
    ) -> Result<T, TransportError> {
        self.inner
            .links
            .lock()
            .get(&handle)
            .map(with)
            .ok_or(TransportError::NotConnected)
    }

    fn characteristic(
        &self,
        handle: ConnectionHandle,
        uuid: Uuid,
    ) -> Result<(Peripheral, TransportEventSender, Characteristic), TransportError> {
        self.link(handle, |link| {
            let characteristic = link.characteristics.lock().get(&uuid).cloned();
            characteristic.map(|c| (link.peripheral.clone(), link.events.clone(), c))
        })?
        .ok_or_else(|| TransportError::Fatal(format!("unknown characteristic {}", uuid)))
    }

    fn spawn(&self, task: impl Future<Output = ()> + Send + 'static) {
        self.inner.runtime.spawn(task);
    }
}

impl CentralInner {
    async fn handle_central_event(&self, event: CentralEvent) {
        match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. } => {
                self.forward_advertisement(&id).await
            }
            CentralEvent::DeviceDisconnected(id) => {
                let links = self.links.lock();
                for (handle, link) in links.iter().filter(|(_, l)| l.peripheral.id() == id) {
                    debug!("{} dropped by the adapter", handle);
                    let _ = link
                        .events
                        .send((*handle, TransportEvent::Disconnected { error: None }));
                }
            }
            other => trace!("Ignoring adapter event {:?}", other),
        }
    }

    async fn forward_advertisement(&self, id: &PeripheralId) {
        let Some(sink) = self.sink.lock().clone() else {
            return;
        };
        let Ok(peripheral) = self.adapter.peripheral(id).await else {
            return;
        };
        let properties = match peripheral.properties().await {
            Ok(Some(properties)) => properties,
            _ => return,
        };
        let address = properties.address.to_string();
        let advertisement = Advertisement {
            address: address.clone(),
            rssi: properties.rssi.map(i32::from).unwrap_or(i32::from(i16::MIN)),
            data: advertisement_bytes(&properties),
        };
        self.peripherals.lock().insert(address, peripheral);
        let _ = sink.send(advertisement);
    }
}

/// Rebuild raw advertisement records from what the adapter decoded
pub fn advertisement_bytes(properties: &PeripheralProperties) -> Vec<u8> {
    let mut data = Vec::new();
    let mut record = |record_type: u8, payload: &[u8]| {
        if payload.len() < u8::MAX as usize {
            data.push(payload.len() as u8 + 1);
            data.push(record_type);
            data.extend_from_slice(payload);
        }
    };
    if let Some(name) = &properties.local_name {
        record(DEVICE_NAME_TYPE, name.as_bytes());
    }
    if let Some(tx_power) = properties.tx_power_level {
        record(TX_POWER_TYPE, &[tx_power as i8 as u8]);
    }
    // the adapter splits the first two vendor bytes off as a company id
    let mut vendors: Vec<_> = properties.manufacturer_data.iter().collect();
    vendors.sort_by_key(|(id, _)| **id);
    for (company, payload) in vendors {
        let mut bytes = company.to_le_bytes().to_vec();
        bytes.extend_from_slice(payload);
        record(VENDOR_DATA_TYPE, &bytes);
    }
    data
}

fn map_error(error: btleplug::Error) -> TransportError {
    match error {
        btleplug::Error::NotConnected => TransportError::NotConnected,
        btleplug::Error::TimedOut(d) => TransportError::Transient(format!("timed out after {:?}", d)),
        btleplug::Error::DeviceNotFound => TransportError::Unavailable("device not found".into()),
        btleplug::Error::PermissionDenied => TransportError::Fatal("permission denied".into()),
        other => TransportError::Fatal(other.to_string()),
    }
}

fn properties_of(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
    }
}

impl AdvertisementScanner for BleCentral {
    fn start_scan(&self, sink: AdvertisementSink) -> Result<(), TransportError> {
        *self.inner.sink.lock() = Some(sink);
        let inner = Arc::clone(&self.inner);
        self.spawn(async move {
            if let Err(e) = inner.adapter.start_scan(ScanFilter::default()).await {
                warn!("Failed to start scanning: {}", e);
                inner.sink.lock().take();
            }
        });
        Ok(())
    }

    fn stop_scan(&self) {
        self.inner.sink.lock().take();
        let inner = Arc::clone(&self.inner);
        self.spawn(async move {
            if let Err(e) = inner.adapter.stop_scan().await {
                debug!("Failed to stop scanning: {}", e);
            }
        });
    }
}

impl BleTransport for BleCentral {
    fn connect(
        &self,
        address: &str,
        events: TransportEventSender,
    ) -> Result<ConnectionHandle, TransportError> {
        let peripheral = self
            .inner
            .peripherals
            .lock()
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::Unavailable(format!("{} was never seen", address)))?;
        let handle = ConnectionHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        let characteristics = Arc::new(Mutex::new(HashMap::new()));

        let notifications = {
            let peripheral = peripheral.clone();
            let events = events.clone();
            self.inner.runtime.spawn(async move {
                if let Err(e) = peripheral.connect().await {
                    let _ = events.send((
                        handle,
                        TransportEvent::Disconnected {
                            error: Some(map_error(e)),
                        },
                    ));
                    return;
                }
                let _ = events.send((handle, TransportEvent::Connected));
                let mut stream = match peripheral.notifications().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("No notification stream on {}: {}", handle, e);
                        return;
                    }
                };
                while let Some(notification) = stream.next().await {
                    let event = TransportEvent::CharacteristicChanged {
                        characteristic: notification.uuid,
                        value: notification.value,
                    };
                    if events.send((handle, event)).is_err() {
                        break;
                    }
                }
            })
        };

        self.inner.links.lock().insert(
            handle,
            Link {
                peripheral,
                events,
                characteristics,
                notifications: Some(notifications),
            },
        );
        debug!("Connecting to {} on {}", address, handle);
        Ok(handle)
    }

    fn disconnect(&self, handle: ConnectionHandle) -> Result<(), TransportError> {
        let link = self
            .inner
            .links
            .lock()
            .remove(&handle)
            .ok_or(TransportError::NotConnected)?;
        let peripheral = link.peripheral.clone();
        let events = link.events.clone();
        drop(link);
        self.spawn(async move {
            let error = peripheral.disconnect().await.err().map(map_error);
            if let Some(e) = &error {
                debug!("Disconnect of {} reported {}", handle, e);
            }
            let _ = events.send((handle, TransportEvent::Disconnected { error: None }));
        });
        Ok(())
    }

    fn discover_services(&self, handle: ConnectionHandle) -> Result<(), TransportError> {
        let (peripheral, events, characteristics) = self.link(handle, |link| {
            (
                link.peripheral.clone(),
                link.events.clone(),
                Arc::clone(&link.characteristics),
            )
        })?;
        self.spawn(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => {
                    let services = peripheral.services();
                    let mut known = characteristics.lock();
                    known.clear();
                    let infos = services
                        .iter()
                        .map(|service| ServiceInfo {
                            uuid: service.uuid,
                            characteristics: service
                                .characteristics
                                .iter()
                                .map(|c| {
                                    known.insert(c.uuid, c.clone());
                                    CharacteristicInfo {
                                        uuid: c.uuid,
                                        properties: properties_of(c.properties),
                                    }
                                })
                                .collect(),
                        })
                        .collect();
                    Ok(infos)
                }
                Err(e) => Err(map_error(e)),
            };
            let _ = events.send((handle, TransportEvent::ServicesDiscovered(result)));
        });
        Ok(())
    }

    fn read_characteristic(
        &self,
        handle: ConnectionHandle,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let (peripheral, events, target) = self.characteristic(handle, characteristic)?;
        self.spawn(async move {
            let result = peripheral.read(&target).await.map_err(map_error);
            let _ = events.send((
                handle,
                TransportEvent::CharacteristicRead {
                    characteristic,
                    result,
                },
            ));
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        handle: ConnectionHandle,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let (peripheral, events, target) = self.characteristic(handle, characteristic)?;
        let write_type = if target.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        let data = data.to_vec();
        self.spawn(async move {
            let result = peripheral
                .write(&target, &data, write_type)
                .await
                .map_err(map_error);
            let _ = events.send((
                handle,
                TransportEvent::CharacteristicWritten {
                    characteristic,
                    result,
                },
            ));
        });
        Ok(())
    }

    /// Client configuration writes map to (un)subscribe; the adapter owns the descriptor
    fn write_descriptor(
        &self,
        handle: ConnectionHandle,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        if descriptor != CLIENT_CONFIGURATION_DESCRIPTOR {
            return Err(TransportError::Fatal(format!(
                "unsupported descriptor {}",
                descriptor
            )));
        }
        let (peripheral, events, target) = self.characteristic(handle, characteristic)?;
        let enable = value.first().is_some_and(|b| *b != 0);
        self.spawn(async move {
            let result = if enable {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };
            let _ = events.send((
                handle,
                TransportEvent::DescriptorWritten {
                    characteristic,
                    descriptor,
                    result: result.map_err(map_error),
                },
            ));
        });
        Ok(())
    }

    fn set_notify(
        &self,
        handle: ConnectionHandle,
        characteristic: Uuid,
        enabled: bool,
    ) -> Result<(), TransportError> {
        self.characteristic(handle, characteristic)?;
        trace!("{} local notify {} = {}", handle, characteristic, enabled);
        Ok(())
    }

    fn read_rssi(&self, handle: ConnectionHandle) -> Result<(), TransportError> {
        let (peripheral, events) =
            self.link(handle, |link| (link.peripheral.clone(), link.events.clone()))?;
        self.spawn(async move {
            let result = match peripheral.properties().await {
                Ok(Some(PeripheralProperties {
                    rssi: Some(rssi), ..
                })) => Ok(i32::from(rssi)),
                Ok(_) => Err(TransportError::Transient("no RSSI reported".into())),
                Err(e) => Err(map_error(e)),
            };
            let _ = events.send((handle, TransportEvent::RssiRead(result)));
        });
        Ok(())
    }

    /// The adapter pairs on its own; bonding is never observed in progress
    fn bond_state(&self, _address: &str) -> BondState {
        BondState::None
    }
}
