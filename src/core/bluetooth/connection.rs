//! Bluetooth connection handling for the exercise bike
//! This module owns one peripheral connection: service discovery,
//! characteristic classification, subscription and teardown.

use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::bluetooth::backend::BleBackend;
use crate::core::bluetooth::commands::{CommandWriter, Poller};
use crate::core::bluetooth::constants::{
    DISCONNECT_TIMEOUT_MS, UUID_FTMS_SERVICE, UUID_VENDOR_SERVICE,
};
use crate::core::bluetooth::manager::Signal;
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::types::{CharacteristicProperties, WriteMode};
use crate::core::frame::{ControlCommand, ServiceProfile};
use crate::error::{ConnectivityError, Result};

/// The characteristic telemetry arrives on
#[derive(Debug, Clone)]
pub struct NotifyChannel<C>(C);

/// The characteristic control writes go to
#[derive(Debug, Clone)]
pub struct WriteChannel<C> {
    pub(crate) characteristic: C,
    pub(crate) mode: WriteMode,
}

/// Result of sorting a service's characteristics into the two roles
#[derive(Debug)]
pub struct ChannelClassification<C> {
    pub notify: Option<NotifyChannel<C>>,
    pub write: Option<WriteChannel<C>>,
    pub notify_candidates: usize,
    pub write_candidates: usize,
}

/// Picks the service to talk to: FTMS first, then the vendor service, then
/// whatever the peripheral listed first.
pub fn select_service<S>(
    services: Vec<S>,
    uuid_of: impl Fn(&S) -> Uuid,
) -> Option<(S, ServiceProfile)> {
    let index = services
        .iter()
        .position(|s| uuid_of(s) == UUID_FTMS_SERVICE)
        .or_else(|| services.iter().position(|s| uuid_of(s) == UUID_VENDOR_SERVICE))
        .or((!services.is_empty()).then_some(0))?;

    let service = services.into_iter().nth(index)?;
    let profile = if uuid_of(&service) == UUID_FTMS_SERVICE {
        ServiceProfile::Ftms
    } else {
        ServiceProfile::Vendor
    };
    Some((service, profile))
}

/// Sorts characteristics into notify and write roles.
///
/// When several characteristics qualify for a role the last one in discovery
/// order is kept; the candidate counts let callers report the ambiguity.
pub fn classify_characteristics<C: Clone>(
    candidates: impl IntoIterator<Item = (C, CharacteristicProperties)>,
) -> ChannelClassification<C> {
    let mut classification = ChannelClassification {
        notify: None,
        write: None,
        notify_candidates: 0,
        write_candidates: 0,
    };

    for (characteristic, properties) in candidates {
        if properties.can_notify() {
            classification.notify_candidates += 1;
            classification.notify = Some(NotifyChannel(characteristic.clone()));
        }
        if let Some(mode) = properties.write_mode() {
            classification.write_candidates += 1;
            classification.write = Some(WriteChannel {
                characteristic,
                mode,
            });
        }
    }

    classification
}

/// One open connection to a bike
pub struct GattSession<B: BleBackend> {
    backend: B,
    device: B::Device,
    device_id: String,
    generation: u64,
    profile: ServiceProfile,
    notify_channel: Option<NotifyChannel<B::Characteristic>>,
    write_channel: Option<WriteChannel<B::Characteristic>>,
    notifications: Option<NotificationHandler>,
    poller: Option<Poller>,
    link_watch: Option<JoinHandle<()>>,
}

impl<B: BleBackend> GattSession<B> {
    /// Connects, discovers and subscribes.
    ///
    /// Frames and link loss are reported on `signals` tagged with `generation`.
    pub async fn open(
        backend: B,
        device: B::Device,
        device_id: String,
        generation: u64,
        signals: mpsc::UnboundedSender<Signal>,
    ) -> Result<Self> {
        info!("Initiating connection to {}...", device_id);
        backend
            .connect(&device)
            .await
            .map_err(|e| ConnectivityError::Connect(e.to_string()))?;

        let (profile, classification) = match Self::discover(&backend, &device).await {
            Ok(discovered) => discovered,
            Err(e) => {
                warn!("Discovery on {} failed: {}", device_id, e);
                if let Err(disconnect_err) = backend.disconnect(&device).await {
                    debug!("Disconnect after failed discovery also failed: {}", disconnect_err);
                }
                return Err(e);
            }
        };

        if classification.notify_candidates > 1 {
            warn!(
                "{} notify characteristics found, using the last one",
                classification.notify_candidates
            );
        }
        if classification.write_candidates > 1 {
            warn!(
                "{} writable characteristics found, using the last one",
                classification.write_candidates
            );
        }

        let mut session = Self {
            backend,
            device,
            device_id,
            generation,
            profile,
            notify_channel: classification.notify,
            write_channel: classification.write,
            notifications: None,
            poller: None,
            link_watch: None,
        };

        match &session.notify_channel {
            Some(NotifyChannel(characteristic)) => {
                info!(
                    "Found notification characteristic: {}",
                    B::characteristic_uuid(characteristic)
                );
                session.notifications = Some(NotificationHandler::setup_notifications(
                    session.backend.clone(),
                    characteristic.clone(),
                    generation,
                    signals.clone(),
                ));
            }
            None => warn!("No notify characteristic on {}, telemetry will not flow", session.device_id),
        }
        match &session.write_channel {
            Some(channel) => info!(
                "Found write characteristic: {} ({:?})",
                B::characteristic_uuid(&channel.characteristic),
                channel.mode
            ),
            None => info!("No writable characteristic on {}, device is notify-only", session.device_id),
        }

        session.link_watch = Some(Self::watch_link(
            session.backend.clone(),
            session.device.clone(),
            generation,
            signals,
        ));

        info!("Connection and setup process completed successfully");
        Ok(session)
    }

    async fn discover(
        backend: &B,
        device: &B::Device,
    ) -> Result<(ServiceProfile, ChannelClassification<B::Characteristic>)> {
        info!("Connection successful, discovering services...");
        let services = backend.discover_services(device).await?;
        for service in &services {
            debug!("Available service: {}", B::service_uuid(service));
        }

        let (service, profile) =
            select_service(services, B::service_uuid).ok_or(ConnectivityError::NoServicesFound)?;
        info!(
            "Using service {} with {:?} framing",
            B::service_uuid(&service),
            profile
        );

        let characteristics = backend.discover_characteristics(&service).await?;
        if characteristics.is_empty() {
            return Err(ConnectivityError::NoCharacteristicsFound);
        }

        let mut candidates = Vec::with_capacity(characteristics.len());
        for characteristic in characteristics {
            match backend.properties(&characteristic).await {
                Ok(properties) => candidates.push((characteristic, properties)),
                Err(e) => warn!(
                    "Skipping characteristic {}: {}",
                    B::characteristic_uuid(&characteristic),
                    e
                ),
            }
        }

        Ok((profile, classify_characteristics(candidates)))
    }

    fn watch_link(
        backend: B,
        device: B::Device,
        generation: u64,
        signals: mpsc::UnboundedSender<Signal>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            match backend.wait_for_disconnect(&device).await {
                Ok(()) => {
                    let _ = signals.send(Signal::LinkLost {
                        session: generation,
                    });
                }
                Err(e) => debug!("Connection events unavailable, relying on the poller: {}", e),
            }
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn profile(&self) -> ServiceProfile {
        self.profile
    }

    pub fn has_notify_channel(&self) -> bool {
        self.notify_channel.is_some()
    }

    pub fn has_write_channel(&self) -> bool {
        self.write_channel.is_some()
    }

    fn command_writer(&self) -> CommandWriter<B> {
        CommandWriter::new(
            self.backend.clone(),
            self.write_channel.clone(),
            self.profile,
        )
    }

    /// Starts the keep-alive poller. A detected link loss is reported as
    /// [`Signal::LinkLost`].
    pub fn start_keepalive(&mut self, interval: Duration, signals: mpsc::UnboundedSender<Signal>) {
        let generation = self.generation;
        self.poller = Some(Poller::start(
            self.command_writer(),
            self.device.clone(),
            interval,
            move || {
                let _ = signals.send(Signal::LinkLost {
                    session: generation,
                });
            },
        ));
    }

    pub async fn send_command(&self, command: ControlCommand) -> Result<()> {
        self.command_writer().send_command(command).await
    }

    /// Unsubscribes and disconnects.
    ///
    /// The poller is stopped and both channels are released even when the
    /// disconnect itself fails.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(poller) = self.poller.take() {
            poller.stop().await;
        }
        if let Some(link_watch) = self.link_watch.take() {
            link_watch.abort();
        }
        if let Some(notifications) = self.notifications.take() {
            notifications.stop_notifications().await;
        }
        self.notify_channel = None;
        self.write_channel = None;

        if !self.backend.is_connected(&self.device).await {
            info!("Device {} not connected", self.device_id);
            return Ok(());
        }

        info!("Disconnecting from device {}", self.device_id);
        let disconnect = self.backend.disconnect(&self.device);
        match tokio::time::timeout(Duration::from_millis(DISCONNECT_TIMEOUT_MS), disconnect).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ConnectivityError::Timeout {
                    operation: "disconnect",
                    after_ms: DISCONNECT_TIMEOUT_MS,
                });
            }
        }
        info!("Successfully disconnected");
        Ok(())
    }
}

impl<B: BleBackend> Drop for GattSession<B> {
    // Sessions dropped without `close` must not leave their tasks running.
    fn drop(&mut self) {
        if let Some(poller) = &self.poller {
            poller.abort();
        }
        if let Some(link_watch) = &self.link_watch {
            link_watch.abort();
        }
        if let Some(notifications) = &self.notifications {
            notifications.cancel();
        }
    }
}
