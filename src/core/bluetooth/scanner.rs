use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::backend::BleBackend;
use crate::core::bluetooth::manager::Signal;
use crate::core::bluetooth::types::{Advertisement, DiscoveredDevice};
use crate::error::{ConnectivityError, Result};

type DeviceMap<D> = Arc<Mutex<HashMap<String, (DiscoveredDevice, D)>>>;

pub struct BluetoothScanner<B: BleBackend> {
    backend: B,
    name_patterns: Arc<Vec<String>>,
    first_result_timeout: Duration,
    devices: DeviceMap<B::Device>,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl<B: BleBackend> BluetoothScanner<B> {
    pub fn new(backend: B, name_patterns: Vec<String>, first_result_timeout: Duration) -> Self {
        Self {
            backend,
            name_patterns: Arc::new(name_patterns),
            first_result_timeout,
            devices: Arc::new(Mutex::new(HashMap::new())),
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
            generation: 0,
        }
    }

    /// Starts a new scan session.
    ///
    /// Clears the devices seen by the previous session. Discoveries are
    /// reported on `signals` tagged with the returned generation.
    pub async fn start_scan(&mut self, signals: mpsc::UnboundedSender<Signal>) -> Result<u64> {
        if !self.backend.is_powered_on().await {
            warn!("Bluetooth adapter is not powered on, refusing to scan");
            return Err(ConnectivityError::AdapterNotReady);
        }
        if self.scan_task_handle.is_some() {
            self.stop_scan().await;
        }

        lock(&self.devices).clear();
        self.generation += 1;
        self.cancel_token = CancellationToken::new();

        let handle = tokio::spawn(Self::internal_scan_task(
            self.backend.clone(),
            self.name_patterns.clone(),
            self.devices.clone(),
            signals,
            self.cancel_token.clone(),
            self.generation,
            self.first_result_timeout,
        ));
        self.scan_task_handle = Some(handle);

        info!("Device scan task started.");
        Ok(self.generation)
    }

    async fn internal_scan_task(
        backend: B,
        name_patterns: Arc<Vec<String>>,
        devices: DeviceMap<B::Device>,
        signals: mpsc::UnboundedSender<Signal>,
        cancel_token: CancellationToken,
        scan: u64,
        first_result_timeout: Duration,
    ) {
        info!("Starting bluetooth scan");
        let (adv_tx, mut adv_rx) = mpsc::unbounded_channel();
        let scan_stream = backend.scan(adv_tx, cancel_token.child_token());
        tokio::pin!(scan_stream);
        let first_result_deadline = tokio::time::sleep(first_result_timeout);
        tokio::pin!(first_result_deadline);
        let mut found_any = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                Some(advertisement) = adv_rx.recv() => {
                    match Self::forward(&name_patterns, &devices, &signals, scan, advertisement) {
                        Some(true) => found_any = true,
                        Some(false) => break,
                        None => {}
                    }
                }
                result = &mut scan_stream => {
                    let message = match result {
                        Ok(()) => {
                            info!("Bluetooth scan stream has ended.");
                            "scan stream ended".to_string()
                        }
                        Err(e) => {
                            error!("Bluetooth scan failed: {}", e);
                            e.to_string()
                        }
                    };
                    // Advertisements queued before the stream ended still count.
                    while let Ok(advertisement) = adv_rx.try_recv() {
                        Self::forward(&name_patterns, &devices, &signals, scan, advertisement);
                    }
                    let _ = signals.send(Signal::ScanFailed { scan, message });
                    break;
                }
                _ = &mut first_result_deadline, if !found_any => {
                    warn!("No matching device found within {:?}", first_result_timeout);
                    let _ = signals.send(Signal::ScanTimedOut { scan });
                    break;
                }
            }
        }
    }

    /// Reports an accepted advertisement. `None` when it was filtered out,
    /// `Some(false)` when nobody is listening anymore.
    fn forward(
        name_patterns: &[String],
        devices: &DeviceMap<B::Device>,
        signals: &mpsc::UnboundedSender<Signal>,
        scan: u64,
        advertisement: Advertisement<B::Device>,
    ) -> Option<bool> {
        let device = Self::accept(name_patterns, devices, advertisement)?;
        info!("Found bike: ID: {}, Name: {:?}, RSSI: {}", device.id, device.name, device.rssi);
        Some(signals.send(Signal::DeviceFound { scan, device }).is_ok())
    }

    /// Applies the name filter and first-seen-wins dedup.
    fn accept(
        name_patterns: &[String],
        devices: &DeviceMap<B::Device>,
        advertisement: Advertisement<B::Device>,
    ) -> Option<DiscoveredDevice> {
        let name = advertisement.local_name.as_deref()?;
        if !matches_name(name, name_patterns) {
            debug!("Ignoring device {} ({:?})", advertisement.id, name);
            return None;
        }

        let mut devices = lock(devices);
        if devices.contains_key(&advertisement.id) {
            return None;
        }

        let address = advertisement
            .address
            .clone()
            .or_else(|| extract_mac_address(&advertisement.id))
            .unwrap_or_else(|| advertisement.id.clone());
        let discovered = DiscoveredDevice {
            id: advertisement.id.clone(),
            name: name.to_string(),
            address,
            address_type: advertisement.address_type,
            connectable: advertisement.connectable,
            services: advertisement.services.clone(),
            rssi: advertisement.rssi.unwrap_or(0),
        };
        devices.insert(
            advertisement.id.clone(),
            (discovered.clone(), advertisement.device),
        );
        Some(discovered)
    }

    pub async fn stop_scan(&mut self) {
        info!("Stopping Bluetooth scan.");
        self.cancel_token.cancel();

        if let Some(handle) = self.scan_task_handle.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Scan task finished with an unexpected join error: {:?}", e);
                }
            }
        } else {
            debug!("No active scan task handle found to wait for.");
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_task_handle.is_some()
    }

    /// Generation of the current (or last) scan session
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Looks up a device discovered in the current scan session
    pub fn device(&self, id: &str) -> Option<(DiscoveredDevice, B::Device)> {
        lock(&self.devices).get(id).cloned()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A name matches when it is non-empty and contains one of the patterns
pub fn matches_name(name: &str, patterns: &[String]) -> bool {
    !name.is_empty() && patterns.iter().any(|pattern| name.contains(pattern.as_str()))
}

fn extract_mac_address(device_id: &str) -> Option<String> {
    let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok()?;
    re.find_iter(device_id)
        .last()
        .map(|m| m.as_str().to_uppercase())
}
