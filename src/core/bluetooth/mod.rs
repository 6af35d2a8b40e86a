//! Bluetooth functionality for the bike bridge
//! This module handles all bluetooth operations including scanning,
//! connecting, and receiving telemetry from the exercise bike.

mod backend;
#[cfg(feature = "bluest")]
mod bluest_backend;
mod commands;
mod connection;
mod constants;
#[cfg(test)]
mod fake;
mod manager;
mod notification;
mod scanner;
mod types;

// Re-export types that should be publicly accessible
pub use backend::BleBackend;
#[cfg(feature = "bluest")]
pub use bluest_backend::BluestBackend;
pub use commands::{CommandWriter, Poller};
pub use connection::{
    ChannelClassification, GattSession, NotifyChannel, WriteChannel, classify_characteristics,
    select_service,
};
pub use constants::*; // Re-export all constants
pub use manager::{BluetoothHandle, BluetoothManager, EventReceiver, Signal};
pub use notification::NotificationHandler;
pub use scanner::{BluetoothScanner, matches_name};
pub use types::{
    AddressType, Advertisement, CharacteristicProperties, ConnectionState, ConnectionStatus,
    ConnectivityEvent, DiscoveredDevice, WriteMode,
};
