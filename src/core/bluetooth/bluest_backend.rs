//! `bluest` implementation of the radio abstraction

use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device, Service, Uuid};
use futures_util::StreamExt;
use log::{debug, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::backend::BleBackend;
use crate::core::bluetooth::types::{
    AddressType, Advertisement, CharacteristicProperties, WriteMode,
};

/// How long to wait for the adapter to report itself available
const ADAPTER_READY_PROBE: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct BluestBackend {
    adapter: Adapter,
}

impl BluestBackend {
    /// Opens the default Bluetooth adapter
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        info!("Bluetooth adapter opened.");
        Ok(Self { adapter })
    }
}

#[async_trait]
impl BleBackend for BluestBackend {
    type Device = Device;
    type Service = Service;
    type Characteristic = Characteristic;

    async fn is_powered_on(&self) -> bool {
        matches!(
            tokio::time::timeout(ADAPTER_READY_PROBE, self.adapter.wait_available()).await,
            Ok(Ok(()))
        )
    }

    async fn scan(
        &self,
        sink: mpsc::UnboundedSender<Advertisement<Device>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut scan_stream = self.adapter.scan(&[]).await?;

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    match result {
                        Some(discovered_device) => {
                            let device = discovered_device.device;
                            let adv_data = discovered_device.adv_data;
                            debug!("Found device - Device: {:?}, RSSI: {:?}", device, discovered_device.rssi);

                            let advertisement = Advertisement {
                                id: device.id().to_string(),
                                local_name: adv_data.local_name.or_else(|| device.name().ok()),
                                address: None,
                                address_type: AddressType::Unknown,
                                connectable: adv_data.is_connectable,
                                services: adv_data.services,
                                rssi: discovered_device.rssi,
                                device,
                            };
                            if sink.send(advertisement).is_err() {
                                break;
                            }
                        }
                        None => {
                            info!("Bluetooth scan stream has ended.");
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        Ok(())
    }

    async fn connect(&self, device: &Device) -> Result<()> {
        if !device.is_connected().await {
            self.adapter.connect_device(device).await?;
        }
        Ok(())
    }

    async fn disconnect(&self, device: &Device) -> Result<()> {
        self.adapter.disconnect_device(device).await?;
        Ok(())
    }

    async fn is_connected(&self, device: &Device) -> bool {
        device.is_connected().await
    }

    async fn wait_for_disconnect(&self, device: &Device) -> Result<()> {
        let mut events = self.adapter.device_connection_events(device).await?;
        while let Some(event) = events.next().await {
            if matches!(event, ConnectionEvent::Disconnected) {
                return Ok(());
            }
        }
        Err(anyhow!("connection event stream ended"))
    }

    async fn discover_services(&self, device: &Device) -> Result<Vec<Service>> {
        Ok(device.discover_services().await?)
    }

    fn service_uuid(service: &Service) -> Uuid {
        service.uuid()
    }

    async fn discover_characteristics(&self, service: &Service) -> Result<Vec<Characteristic>> {
        Ok(service.discover_characteristics().await?)
    }

    fn characteristic_uuid(characteristic: &Characteristic) -> Uuid {
        characteristic.uuid()
    }

    async fn properties(&self, characteristic: &Characteristic) -> Result<CharacteristicProperties> {
        let properties = characteristic.properties().await?;
        Ok(CharacteristicProperties {
            notify: properties.notify,
            indicate: properties.indicate,
            write: properties.write,
            write_without_response: properties.write_without_response,
        })
    }

    async fn write(&self, characteristic: &Characteristic, data: &[u8], mode: WriteMode) -> Result<()> {
        match mode {
            WriteMode::WithResponse => characteristic.write(data).await?,
            WriteMode::WithoutResponse => characteristic.write_without_response(data).await?,
        }
        Ok(())
    }

    async fn stream_notifications(
        &self,
        characteristic: &Characteristic,
        sink: mpsc::UnboundedSender<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut notification_stream = characteristic.notify().await?;
        info!("Listening for bike notifications...");

        loop {
            tokio::select! {
                result = notification_stream.next() => {
                    match result {
                        Some(Ok(value)) => {
                            if sink.send(value).is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => return Err(anyhow!("Error in notification stream: {}", e)),
                        None => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        Ok(())
    }
}
