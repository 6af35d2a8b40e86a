//! Core functionality for the bike bridge
//! This module contains the telemetry codec and the BLE connectivity layer

pub mod bluetooth;
pub mod frame;

// Re-export commonly used types
pub use bluetooth::{BluetoothHandle, BluetoothManager, ConnectivityEvent};
pub use frame::{ControlCommand, DecodeOutcome, FrameKind, ServiceProfile, TelemetryReading};
