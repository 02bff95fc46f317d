// btleplug adapter for the credential service
//
// btleplug is async; the session collaborator traits only issue requests.
// Every request spawns a task on the runtime that awaits the btleplug call and
// reports the outcome through the session's event sink.

use anyhow::{Context, Result};
use btleplug::api::{
    CentralEvent, CharPropFlags, Characteristic, Central, Manager as _, Peripheral as _,
    ScanFilter, WriteType as BtleWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use credlink_core::transport::ble::{
    CharacteristicProperties, GattCharacteristicInfo, GattWriteRequest, CREDENTIAL_SERVICE_UUID,
};
use credlink_core::{
    GattConnection, GattDevice, GattError, GattService, GattStatus, LinkEvent, LinkEventSink,
    WriteType,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Status reported for a failed btleplug call (ATT "unlikely error")
const UNLIKELY_ERROR: u8 = 0x0e;

/// Scan for a peripheral advertising the credential service.
///
/// With `name_filter`, only peripherals whose local name contains it match.
pub async fn find_device(name_filter: Option<&str>, scan_timeout: Duration) -> Result<BtleDevice> {
    let manager = Manager::new().await.context("Failed to start Bluetooth manager")?;
    let adapter = manager
        .adapters()
        .await
        .context("Failed to list Bluetooth adapters")?
        .into_iter()
        .next()
        .context("No Bluetooth adapter found")?;

    info!("Scanning for the credential service");
    adapter
        .start_scan(ScanFilter {
            services: vec![CREDENTIAL_SERVICE_UUID],
        })
        .await
        .context("Failed to start scan")?;

    let deadline = tokio::time::Instant::now() + scan_timeout;
    while tokio::time::Instant::now() < deadline {
        for peripheral in adapter.peripherals().await.context("Failed to list peripherals")? {
            if advertises_service(&peripheral, name_filter).await? {
                stop_scan(&adapter).await;
                info!("Found peripheral {:?}", peripheral.id());
                return Ok(BtleDevice {
                    adapter,
                    peripheral,
                    runtime: Handle::current(),
                });
            }
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    stop_scan(&adapter).await;
    anyhow::bail!("No peripheral with the credential service found")
}

async fn stop_scan(adapter: &Adapter) {
    if let Err(e) = adapter.stop_scan().await {
        warn!("Failed to stop scan: {}", e);
    }
}

async fn advertises_service(peripheral: &Peripheral, name_filter: Option<&str>) -> Result<bool> {
    let Some(props) = peripheral
        .properties()
        .await
        .context("Failed to read peripheral properties")?
    else {
        return Ok(false);
    };
    if !props.services.contains(&CREDENTIAL_SERVICE_UUID) {
        return Ok(false);
    }
    Ok(match name_filter {
        Some(filter) => props
            .local_name
            .as_deref()
            .is_some_and(|name| name.contains(filter)),
        None => true,
    })
}

fn status_of<T>(what: &str, result: &btleplug::Result<T>) -> GattStatus {
    match result {
        Ok(_) => GattStatus::Success,
        Err(e) => {
            warn!("{} failed: {}", what, e);
            GattStatus::Failure(UNLIKELY_ERROR)
        }
    }
}

/// A scanned peripheral that can be connected to
pub struct BtleDevice {
    adapter: Adapter,
    peripheral: Peripheral,
    runtime: Handle,
}

impl GattDevice for BtleDevice {
    fn connect(&self, events: LinkEventSink) -> Result<Arc<dyn GattConnection>, GattError> {
        let peripheral = self.peripheral.clone();
        let sink = events.clone();
        self.runtime.spawn(async move {
            let result = peripheral.connect().await;
            let connected = status_of("Connect", &result).is_success();
            sink.emit(LinkEvent::ConnectionStateChanged { connected });
        });

        let watcher = self.runtime.spawn(watch_disconnect(
            self.adapter.clone(),
            self.peripheral.clone(),
            events.clone(),
        ));

        Ok(Arc::new(BtleConnection {
            peripheral: self.peripheral.clone(),
            events,
            runtime: self.runtime.clone(),
            watcher,
        }))
    }
}

/// Report a link loss the adapter notices on its own
async fn watch_disconnect(adapter: Adapter, peripheral: Peripheral, events: LinkEventSink) {
    let mut stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Adapter events unavailable: {}", e);
            return;
        }
    };
    while let Some(event) = stream.next().await {
        if let CentralEvent::DeviceDisconnected(id) = event {
            if id == peripheral.id() {
                debug!("Adapter reported disconnect of {:?}", id);
                events.emit(LinkEvent::ConnectionStateChanged { connected: false });
                return;
            }
        }
    }
}

struct BtleConnection {
    peripheral: Peripheral,
    events: LinkEventSink,
    runtime: Handle,
    watcher: JoinHandle<()>,
}

impl BtleConnection {
    fn characteristic(&self, service: Uuid, uuid: Uuid) -> Result<Characteristic, GattError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == uuid)
            .ok_or(GattError::CharacteristicNotFound(uuid))
    }
}

impl GattConnection for BtleConnection {
    fn discover_services(&self) -> Result<(), GattError> {
        let peripheral = self.peripheral.clone();
        let sink = self.events.clone();
        self.runtime.spawn(async move {
            let result = peripheral.discover_services().await;
            let status = status_of("Service discovery", &result);
            sink.emit(LinkEvent::ServicesDiscovered { status });
        });
        Ok(())
    }

    fn services(&self) -> Vec<GattService> {
        self.peripheral
            .services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| GattCharacteristicInfo {
                        uuid: c.uuid,
                        properties: CharacteristicProperties {
                            read: c.properties.contains(CharPropFlags::READ),
                            write: c.properties.contains(CharPropFlags::WRITE),
                            write_without_response: c
                                .properties
                                .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
                            notify: c.properties.contains(CharPropFlags::NOTIFY),
                        },
                    })
                    .collect(),
            })
            .collect()
    }

    fn request_mtu(&self, _mtu: u16) -> Result<(), GattError> {
        Err(GattError::Unsupported(
            "btleplug does not expose transfer unit negotiation".into(),
        ))
    }

    fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<(), GattError> {
        let target = self.characteristic(service, characteristic)?;
        let peripheral = self.peripheral.clone();
        let sink = self.events.clone();
        self.runtime.spawn(async move {
            let result = peripheral.read(&target).await;
            let status = status_of("Read", &result);
            sink.emit(LinkEvent::CharacteristicRead {
                characteristic: target.uuid,
                value: result.unwrap_or_default(),
                status,
            });
        });
        Ok(())
    }

    fn write_characteristic(&self, request: GattWriteRequest) -> Result<(), GattError> {
        let target = self.characteristic(request.service, request.characteristic)?;
        let write_type = match request.write_type {
            WriteType::WithResponse => BtleWriteType::WithResponse,
            WriteType::WithoutResponse => BtleWriteType::WithoutResponse,
        };
        let peripheral = self.peripheral.clone();
        let sink = self.events.clone();
        self.runtime.spawn(async move {
            let result = peripheral.write(&target, &request.value, write_type).await;
            let status = status_of("Write", &result);
            sink.emit(LinkEvent::CharacteristicWritten {
                characteristic: target.uuid,
                frame: request.frame,
                status,
            });
        });
        Ok(())
    }

    fn disconnect(&self) {
        self.watcher.abort();
        let peripheral = self.peripheral.clone();
        self.runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Disconnect failed: {}", e);
            }
        });
    }
}

impl Drop for BtleConnection {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}
