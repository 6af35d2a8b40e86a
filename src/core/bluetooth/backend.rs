//! Radio abstraction
//! Everything the connectivity layer needs from a BLE stack: advertisements,
//! connect/disconnect, GATT discovery and notify/write primitives.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::types::{Advertisement, CharacteristicProperties, WriteMode};

/// A BLE stack the manager can drive.
///
/// Handles are cheap clones owned by the backend; the manager never inspects
/// them beyond the accessors below.
#[async_trait]
pub trait BleBackend: Clone + Send + Sync + 'static {
    type Device: Clone + Send + Sync + 'static;
    type Service: Clone + Send + Sync + 'static;
    type Characteristic: Clone + Send + Sync + 'static;

    /// True once the adapter reports a powered-on radio.
    async fn is_powered_on(&self) -> bool;

    /// Streams advertisements into `sink` until `cancel` fires or the
    /// platform ends the scan.
    async fn scan(
        &self,
        sink: mpsc::UnboundedSender<Advertisement<Self::Device>>,
        cancel: CancellationToken,
    ) -> Result<()>;

    async fn connect(&self, device: &Self::Device) -> Result<()>;

    async fn disconnect(&self, device: &Self::Device) -> Result<()>;

    async fn is_connected(&self, device: &Self::Device) -> bool;

    /// Resolves once the peripheral drops the link.
    async fn wait_for_disconnect(&self, device: &Self::Device) -> Result<()>;

    /// Discovers every service, no UUID filter.
    async fn discover_services(&self, device: &Self::Device) -> Result<Vec<Self::Service>>;

    fn service_uuid(service: &Self::Service) -> Uuid;

    /// Discovers every characteristic of a service, no UUID filter.
    async fn discover_characteristics(
        &self,
        service: &Self::Service,
    ) -> Result<Vec<Self::Characteristic>>;

    fn characteristic_uuid(characteristic: &Self::Characteristic) -> Uuid;

    async fn properties(
        &self,
        characteristic: &Self::Characteristic,
    ) -> Result<CharacteristicProperties>;

    async fn write(
        &self,
        characteristic: &Self::Characteristic,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<()>;

    /// Subscribes and forwards every notification into `sink` until `cancel`
    /// fires or the stream ends. Dropping the subscription unsubscribes.
    ///
    /// Returns early with an error when the subscription itself fails.
    async fn stream_notifications(
        &self,
        characteristic: &Self::Characteristic,
        sink: mpsc::UnboundedSender<Vec<u8>>,
        cancel: CancellationToken,
    ) -> Result<()>;
}
