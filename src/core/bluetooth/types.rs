//! Defines shared data structures for the Bluetooth module.

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::core::frame::TelemetryReading;

/// How the peripheral's address was assigned, when the platform reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AddressType {
    Public,
    Random,
    Unknown,
}

/// A raw advertisement as reported by a backend, before filtering
#[derive(Debug, Clone)]
pub struct Advertisement<D> {
    /// The backend's handle for the advertising peripheral
    pub device: D,
    /// Platform-specific unique identifier
    pub id: String,
    pub local_name: Option<String>,
    /// MAC address if the platform exposes one separately from the id
    pub address: Option<String>,
    pub address_type: AddressType,
    pub connectable: bool,
    pub services: Vec<Uuid>,
    pub rssi: Option<i16>,
}

/// Represents a discovered exercise bike
///
/// Emitted once per peripheral per scan session and never updated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredDevice {
    /// Platform-specific unique identifier for the device (especially important on macOS)
    pub id: String,
    /// The advertised local name
    pub name: String,
    /// The address of the device (MAC address on most platforms, the id where none is exposed)
    pub address: String,
    pub address_type: AddressType,
    pub connectable: bool,
    pub services: Vec<Uuid>,
    /// The signal strength (RSSI) at discovery time, in dBm
    pub rssi: i16,
}

/// The subset of GATT characteristic properties used for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties {
    pub notify: bool,
    pub indicate: bool,
    pub write: bool,
    pub write_without_response: bool,
}

impl CharacteristicProperties {
    pub fn can_notify(&self) -> bool {
        self.notify || self.indicate
    }

    /// Preferred write mode, acknowledged writes first
    pub fn write_mode(&self) -> Option<WriteMode> {
        if self.write {
            Some(WriteMode::WithResponse)
        } else if self.write_without_response {
            Some(WriteMode::WithoutResponse)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Lifecycle state of the connectivity manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "deviceId", rename_all = "camelCase")]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting(String),
    Connected(String),
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Scanning => write!(f, "scanning"),
            Self::Connecting(id) => write!(f, "connecting to {id}"),
            Self::Connected(id) => write!(f, "connected to {id}"),
            Self::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// Answer to a connection status query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DiscoveredDevice>,
}

/// Events pushed to whoever composes the manager, in emission order
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum ConnectivityEvent {
    DeviceDiscovered(DiscoveredDevice),
    DeviceConnected,
    Disconnected,
    DataReceived(TelemetryReading),
    RawDataReceived(Vec<u8>),
    Error(String),
}
