//! Constants used throughout the application
//! This module contains all the constant values used in the application,
//! such as UUIDs, timeouts, and other configuration values.

use uuid::Uuid;

/// Fitness Machine Service (0x1826)
pub const UUID_FTMS_SERVICE: Uuid = Uuid::from_u128(0x00001826_0000_1000_8000_00805f9b34fb);

/// Proprietary iConsole service (0xfff0), used when the bike does not expose FTMS
pub const UUID_VENDOR_SERVICE: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);

/// Case-sensitive substrings an advertised local name must contain
pub const DEFAULT_NAME_PATTERNS: [&str; 4] = ["iConsole", "bike", "Console", "fitness"];

/// Keep-alive poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

/// Timeout for connect plus GATT discovery in milliseconds
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// How long a scan may run without a matching device, in milliseconds
pub const DEFAULT_SCAN_TIMEOUT_MS: u64 = 30_000;

/// Upper bound on the transport disconnect during session teardown
pub const DISCONNECT_TIMEOUT_MS: u64 = 5_000;

/// Capacity of the request queue in front of the manager task
pub const REQUEST_QUEUE_CAPACITY: usize = 32;
