use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use bike_bridge::config::{CONFIG_FILE_NAME, ConnectivityConfig};
use bike_bridge::core::bluetooth::{BluestBackend, BluetoothHandle, BluetoothManager};
use bike_bridge::core::ConnectivityEvent;
use bike_bridge::logging;
use log::{error, info, warn};

const APP_DIR_NAME: &str = "bike-bridge";

fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().ok_or_else(|| anyhow!("Failed to get config directory"))?;
    Ok(config_dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Optional first argument: resistance level to apply once connected.
fn resistance_argument() -> Result<Option<i32>> {
    std::env::args()
        .nth(1)
        .map(|arg| {
            arg.parse::<i32>()
                .with_context(|| format!("Invalid resistance level: {}", arg))
        })
        .transpose()
}

fn print_event(event: &ConnectivityEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => error!("Failed to serialize event: {}", e),
    }
}

async fn on_event(
    handle: &BluetoothHandle,
    event: &ConnectivityEvent,
    connecting: &mut bool,
    resistance: Option<i32>,
) -> bool {
    match event {
        ConnectivityEvent::DeviceDiscovered(device) if !*connecting => {
            *connecting = true;
            info!("Connecting to {} ({})", device.name, device.id);
            if let Err(e) = handle.connect(device.id.clone()).await {
                error!("Failed to connect to {}: {}", device.id, e);
                return false;
            }
        }
        ConnectivityEvent::DeviceConnected => {
            if let Some(level) = resistance {
                match handle.set_resistance_level(level).await {
                    Ok(applied) => info!("Resistance set to {}", applied),
                    Err(e) => error!("Failed to set resistance: {}", e),
                }
            }
        }
        // Scan timed out or failed before anything was found
        ConnectivityEvent::Error(_) if !*connecting => return false,
        ConnectivityEvent::Disconnected => {
            warn!("Bike disconnected");
            return false;
        }
        _ => {}
    }
    true
}

#[tokio::main]
async fn main() -> Result<()> {
    let resistance = resistance_argument()?;
    let path = config_path()?;
    let config = ConnectivityConfig::load_config(&path).await?;
    logging::init(&config.log_level)?;
    info!("Using config {:?}", path);

    let backend = BluestBackend::new().await?;
    let (handle, mut events, task) = BluetoothManager::spawn(backend, config);
    handle.start_scanning().await?;

    let mut connecting = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
                if !on_event(&handle, &event, &mut connecting, resistance).await {
                    break;
                }
            }
        }
    }

    handle.disconnect().await?;
    handle.shutdown().await?;
    if let Err(e) = task.await {
        error!("Bluetooth manager task failed: {}", e);
    }
    Ok(())
}
