//! Bike control commands
//! This module writes encoded control commands to the bike and runs the
//! keep-alive poller while a session is open.

use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::backend::BleBackend;
use crate::core::bluetooth::connection::WriteChannel;
use crate::core::frame::{ControlCommand, ServiceProfile, encode_control};
use crate::error::{ConnectivityError, Result};

/// Writes commands to the session's write channel using the session's framing
#[derive(Clone)]
pub struct CommandWriter<B: BleBackend> {
    backend: B,
    channel: Option<WriteChannel<B::Characteristic>>,
    profile: ServiceProfile,
}

impl<B: BleBackend> CommandWriter<B> {
    pub fn new(
        backend: B,
        channel: Option<WriteChannel<B::Characteristic>>,
        profile: ServiceProfile,
    ) -> Self {
        Self {
            backend,
            channel,
            profile,
        }
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    pub async fn send_command(&self, command: ControlCommand) -> Result<()> {
        let channel = self
            .channel
            .as_ref()
            .ok_or(ConnectivityError::WriteUnavailable)?;
        let data = encode_control(command, self.profile);

        debug!("Sending command to bike: {:?} as {:02X?}", command, data);
        self.backend
            .write(&channel.characteristic, &data, channel.mode)
            .await?;
        Ok(())
    }
}

/// Periodic keep-alive writer
///
/// Write failures are logged and the poller carries on; it only stops on
/// cancellation or when the peripheral is seen disconnected at tick time.
pub struct Poller {
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl Poller {
    /// Start the keepalive timer
    pub fn start<B, F>(
        writer: CommandWriter<B>,
        device: B::Device,
        interval: Duration,
        on_link_lost: F,
    ) -> Self
    where
        B: BleBackend,
        F: FnOnce() + Send + 'static,
    {
        let cancel_token = CancellationToken::new();
        let cancel_for_task = cancel_token.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel_for_task.cancelled() => {
                        debug!("Keepalive poller cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        // The tick body can block on the radio; keep it cancellable.
                        let link_up = tokio::select! {
                            biased;
                            _ = cancel_for_task.cancelled() => break,
                            link_up = Self::tick(&writer, &device) => link_up,
                        };
                        if !link_up {
                            info!("Device no longer connected, stopping keepalive poller");
                            on_link_lost();
                            break;
                        }
                    }
                }
            }
        });

        info!("Keepalive timer started with interval of {:?}", interval);
        Self { cancel_token, task }
    }

    /// One keep-alive round. Returns false when the link is down.
    async fn tick<B: BleBackend>(writer: &CommandWriter<B>, device: &B::Device) -> bool {
        if !writer.backend.is_connected(device).await {
            return false;
        }
        if writer.has_channel() {
            if let Err(e) = writer.send_command(ControlCommand::Poll).await {
                warn!("Failed to send keepalive: {}", e);
            }
        }
        true
    }

    /// Stops the poller without waiting for it.
    pub fn abort(&self) {
        self.cancel_token.cancel();
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn stop(self) {
        self.cancel_token.cancel();
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!("Keepalive task finished with an unexpected join error: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::core::bluetooth::backend::BleBackend;
    use crate::core::bluetooth::fake::{FAKE_WRITE_UUID, FakeBackend, FakeCharacteristic, FakeDevice};
    use crate::core::bluetooth::types::WriteMode;
    use crate::core::frame::VENDOR_POLL_FRAME;

    fn write_channel() -> Option<WriteChannel<FakeCharacteristic>> {
        Some(WriteChannel {
            characteristic: FakeCharacteristic::writable(FAKE_WRITE_UUID),
            mode: WriteMode::WithoutResponse,
        })
    }

    async fn connected(backend: &FakeBackend) -> FakeDevice {
        let device = FakeDevice::new("bike-1");
        backend.connect(&device).await.unwrap();
        device
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_writes_on_every_tick() {
        let backend = FakeBackend::new();
        let device = connected(&backend).await;
        let writer = CommandWriter::new(backend.clone(), write_channel(), ServiceProfile::Vendor);

        let poller = Poller::start(writer, device, Duration::from_secs(1), || {});
        tokio::time::sleep(Duration::from_millis(3500)).await;

        let writes = backend.writes();
        assert!((3..=4).contains(&writes.len()), "got {} writes", writes.len());
        assert!(
            writes
                .iter()
                .all(|(uuid, data)| *uuid == FAKE_WRITE_UUID && data == &VENDOR_POLL_FRAME)
        );
        assert!(!poller.is_finished());
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_stops_itself_when_link_is_down() {
        let backend = FakeBackend::new();
        let device = FakeDevice::new("bike-1");
        let writer = CommandWriter::new(backend.clone(), write_channel(), ServiceProfile::Vendor);
        let link_lost = Arc::new(AtomicBool::new(false));
        let flag = link_lost.clone();

        let poller = Poller::start(writer, device, Duration::from_secs(1), move || {
            flag.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(backend.writes().is_empty());
        assert!(poller.is_finished());
        assert!(link_lost.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_without_write_channel_is_noop() {
        let backend = FakeBackend::new();
        let device = connected(&backend).await;
        let writer = CommandWriter::new(backend.clone(), None, ServiceProfile::Ftms);

        let poller = Poller::start(writer, device, Duration::from_secs(1), || {});
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(backend.writes().is_empty());
        assert!(!poller.is_finished());
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_errors_do_not_stop_poller() {
        let backend = FakeBackend::new().failing_writes("gatt busy");
        let device = connected(&backend).await;
        let writer = CommandWriter::new(backend.clone(), write_channel(), ServiceProfile::Vendor);

        let poller = Poller::start(writer, device, Duration::from_secs(1), || {});
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(!poller.is_finished());
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_a_stuck_write() {
        let backend = FakeBackend::new().hanging_writes();
        let device = connected(&backend).await;
        let writer = CommandWriter::new(backend.clone(), write_channel(), ServiceProfile::Vendor);

        let poller = Poller::start(writer, device, Duration::from_secs(1), || {});
        backend.wait_for_pending_write().await;

        tokio::time::timeout(Duration::from_secs(1), poller.stop())
            .await
            .expect("poller did not stop while a write was in flight");
    }

    #[tokio::test]
    async fn test_send_without_channel_is_rejected() {
        let writer = CommandWriter::new(FakeBackend::new(), None, ServiceProfile::Vendor);
        assert!(matches!(
            writer.send_command(ControlCommand::Poll).await,
            Err(ConnectivityError::WriteUnavailable)
        ));
    }
}
