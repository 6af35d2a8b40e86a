//! Bike bridge library
//! Connectivity and telemetry decoding for BLE exercise bikes.

// Module declarations
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod utils;

pub use config::ConnectivityConfig;
pub use error::{ConnectivityError, Result};
