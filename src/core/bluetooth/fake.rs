//! Scripted in-memory backend for tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::backend::BleBackend;
use crate::core::bluetooth::types::{
    AddressType, Advertisement, CharacteristicProperties, WriteMode,
};

pub const FAKE_NOTIFY_UUID: Uuid = Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);
pub const FAKE_WRITE_UUID: Uuid = Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeDevice {
    pub id: String,
}

impl FakeDevice {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[derive(Debug, Clone)]
pub struct FakeService {
    pub uuid: Uuid,
    pub characteristics: Vec<FakeCharacteristic>,
}

impl FakeService {
    pub fn new(uuid: Uuid, characteristics: Vec<FakeCharacteristic>) -> Self {
        Self {
            uuid,
            characteristics,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

impl FakeCharacteristic {
    pub fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self { uuid, properties }
    }

    pub fn notifying(uuid: Uuid) -> Self {
        Self::new(
            uuid,
            CharacteristicProperties {
                notify: true,
                ..Default::default()
            },
        )
    }

    pub fn writable(uuid: Uuid) -> Self {
        Self::new(
            uuid,
            CharacteristicProperties {
                write_without_response: true,
                ..Default::default()
            },
        )
    }
}

/// Builds a matching advertisement for `id`.
pub fn advertisement(id: &str, name: Option<&str>) -> Advertisement<FakeDevice> {
    Advertisement {
        device: FakeDevice::new(id),
        id: id.to_string(),
        local_name: name.map(str::to_string),
        address: None,
        address_type: AddressType::Random,
        connectable: true,
        services: Vec::new(),
        rssi: Some(-60),
    }
}

#[derive(Default)]
struct FakeState {
    powered_on: bool,
    advertisements: Vec<Advertisement<FakeDevice>>,
    services: Vec<FakeService>,
    connect_delay: Option<Duration>,
    connect_error: Option<String>,
    disconnect_error: Option<String>,
    subscribe_error: Option<String>,
    write_error: Option<String>,
    hang_writes: bool,
    pending_writes: usize,
    scan_ends: bool,
    writes: Vec<(Uuid, Vec<u8>)>,
    subscriptions: Vec<Uuid>,
    notification_sink: Option<mpsc::UnboundedSender<Vec<u8>>>,
    disconnect_calls: usize,
}

/// A radio that replays scripted advertisements and records every write.
#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
    link: Arc<watch::Sender<bool>>,
}

impl FakeBackend {
    /// A powered-on radio with nothing around it.
    pub fn new() -> Self {
        let (link, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(FakeState {
                powered_on: true,
                ..Default::default()
            })),
            link: Arc::new(link),
        }
    }

    /// A radio whose peripheral exposes `service_uuid` with one notify and
    /// one write characteristic.
    pub fn bike(service_uuid: Uuid) -> Self {
        Self::new().with_services(vec![FakeService::new(
            service_uuid,
            vec![
                FakeCharacteristic::notifying(FAKE_NOTIFY_UUID),
                FakeCharacteristic::writable(FAKE_WRITE_UUID),
            ],
        )])
    }

    fn update(self, f: impl FnOnce(&mut FakeState)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn powered_off(self) -> Self {
        self.update(|s| s.powered_on = false)
    }

    pub fn with_advertisement(self, advertisement: Advertisement<FakeDevice>) -> Self {
        self.update(|s| s.advertisements.push(advertisement))
    }

    pub fn with_services(self, services: Vec<FakeService>) -> Self {
        self.update(|s| s.services = services)
    }

    pub fn with_connect_delay(self, delay: Duration) -> Self {
        self.update(|s| s.connect_delay = Some(delay))
    }

    pub fn failing_connect(self, message: &str) -> Self {
        self.update(|s| s.connect_error = Some(message.to_string()))
    }

    pub fn failing_disconnect(self, message: &str) -> Self {
        self.update(|s| s.disconnect_error = Some(message.to_string()))
    }

    pub fn failing_subscribe(self, message: &str) -> Self {
        self.update(|s| s.subscribe_error = Some(message.to_string()))
    }

    pub fn failing_writes(self, message: &str) -> Self {
        self.update(|s| s.write_error = Some(message.to_string()))
    }

    /// Writes never complete.
    pub fn hanging_writes(self) -> Self {
        self.update(|s| s.hang_writes = true)
    }

    /// The platform ends the scan right after replaying the advertisements.
    pub fn ending_scan(self) -> Self {
        self.update(|s| s.scan_ends = true)
    }

    /// Waits until a write is stuck in flight.
    pub async fn wait_for_pending_write(&self) {
        while self.state.lock().unwrap().pending_writes == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    pub fn has_subscriber(&self) -> bool {
        self.state.lock().unwrap().notification_sink.is_some()
    }

    /// Delivers a notification to the active subscriber, if any.
    pub fn push_notification(&self, data: &[u8]) -> bool {
        let state = self.state.lock().unwrap();
        state
            .notification_sink
            .as_ref()
            .is_some_and(|sink| sink.send(data.to_vec()).is_ok())
    }

    /// Simulates the peripheral dropping the link on its own.
    pub fn drop_link(&self) {
        self.link.send_replace(false);
    }

    pub fn is_link_up(&self) -> bool {
        *self.link.borrow()
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn subscriptions(&self) -> Vec<Uuid> {
        self.state.lock().unwrap().subscriptions.clone()
    }

    pub fn disconnect_calls(&self) -> usize {
        self.state.lock().unwrap().disconnect_calls
    }

    /// Waits until a notification subscription is live.
    pub async fn wait_for_subscriber(&self) {
        while self.state.lock().unwrap().notification_sink.is_none() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl BleBackend for FakeBackend {
    type Device = FakeDevice;
    type Service = FakeService;
    type Characteristic = FakeCharacteristic;

    async fn is_powered_on(&self) -> bool {
        self.state.lock().unwrap().powered_on
    }

    async fn scan(
        &self,
        sink: mpsc::UnboundedSender<Advertisement<FakeDevice>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (advertisements, scan_ends) = {
            let state = self.state.lock().unwrap();
            (state.advertisements.clone(), state.scan_ends)
        };
        for advertisement in advertisements {
            if sink.send(advertisement).is_err() {
                return Ok(());
            }
        }
        if !scan_ends {
            cancel.cancelled().await;
        }
        Ok(())
    }

    async fn connect(&self, _device: &FakeDevice) -> Result<()> {
        let delay = self.state.lock().unwrap().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let error = self.state.lock().unwrap().connect_error.clone();
        if let Some(message) = error {
            return Err(anyhow!(message));
        }
        self.link.send_replace(true);
        Ok(())
    }

    async fn disconnect(&self, _device: &FakeDevice) -> Result<()> {
        let error = {
            let mut state = self.state.lock().unwrap();
            state.disconnect_calls += 1;
            state.disconnect_error.clone()
        };
        if let Some(message) = error {
            return Err(anyhow!(message));
        }
        self.link.send_replace(false);
        Ok(())
    }

    async fn is_connected(&self, _device: &FakeDevice) -> bool {
        *self.link.borrow()
    }

    async fn wait_for_disconnect(&self, _device: &FakeDevice) -> Result<()> {
        let mut link = self.link.subscribe();
        link.wait_for(|up| !*up).await?;
        Ok(())
    }

    async fn discover_services(&self, _device: &FakeDevice) -> Result<Vec<FakeService>> {
        Ok(self.state.lock().unwrap().services.clone())
    }

    fn service_uuid(service: &FakeService) -> Uuid {
        service.uuid
    }

    async fn discover_characteristics(
        &self,
        service: &FakeService,
    ) -> Result<Vec<FakeCharacteristic>> {
        Ok(service.characteristics.clone())
    }

    fn characteristic_uuid(characteristic: &FakeCharacteristic) -> Uuid {
        characteristic.uuid
    }

    async fn properties(
        &self,
        characteristic: &FakeCharacteristic,
    ) -> Result<CharacteristicProperties> {
        Ok(characteristic.properties)
    }

    async fn write(
        &self,
        characteristic: &FakeCharacteristic,
        data: &[u8],
        _mode: WriteMode,
    ) -> Result<()> {
        let hang = {
            let mut state = self.state.lock().unwrap();
            if let Some(message) = &state.write_error {
                return Err(anyhow!(message.clone()));
            }
            if state.hang_writes {
                state.pending_writes += 1;
            } else {
                state.writes.push((characteristic.uuid, data.to_vec()));
            }
            state.hang_writes
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn stream_notifications(
        &self,
        characteristic: &FakeCharacteristic,
        sink: mpsc::UnboundedSender<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(message) = &state.subscribe_error {
                return Err(anyhow!(message.clone()));
            }
            state.subscriptions.push(characteristic.uuid);
            state.notification_sink = Some(sink);
        }
        cancel.cancelled().await;
        self.state.lock().unwrap().notification_sink = None;
        Ok(())
    }
}
