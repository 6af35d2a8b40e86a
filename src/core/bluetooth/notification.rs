//! Notification handling for the exercise bike
//! This module subscribes to the notify characteristic and forwards every
//! frame, in arrival order, to the manager.

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::backend::BleBackend;
use crate::core::bluetooth::manager::Signal;

/// A running subscription on the notify characteristic
pub struct NotificationHandler {
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl NotificationHandler {
    /// Set up notifications for the bike
    pub fn setup_notifications<B: BleBackend>(
        backend: B,
        notify_char: B::Characteristic,
        session: u64,
        signals: mpsc::UnboundedSender<Signal>,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let cancel_for_task = cancel_token.clone();

        let task = tokio::spawn(async move {
            Self::process_notifications(backend, notify_char, session, signals, cancel_for_task)
                .await;
        });

        Self { cancel_token, task }
    }

    async fn process_notifications<B: BleBackend>(
        backend: B,
        notify_char: B::Characteristic,
        session: u64,
        signals: mpsc::UnboundedSender<Signal>,
        cancel_token: CancellationToken,
    ) {
        info!(
            "Subscribing to notifications on {}...",
            B::characteristic_uuid(&notify_char)
        );

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let subscription = backend.stream_notifications(&notify_char, frame_tx, cancel_token);
        tokio::pin!(subscription);
        let mut subscription_done = false;

        loop {
            tokio::select! {
                biased;
                frame = frame_rx.recv() => match frame {
                    Some(data) => {
                        debug!("Received bike data: {:02X?}", data);
                        if signals.send(Signal::Frame { session, data }).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                result = &mut subscription, if !subscription_done => {
                    subscription_done = true;
                    if let Err(e) = result {
                        warn!("Failed to subscribe to notifications: {}", e);
                    }
                }
            }
        }

        info!("Notification stream ended");
    }

    /// Cancels the subscription without waiting for the task to wind down
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Cancels the subscription and waits for the forwarding task to finish
    pub async fn stop_notifications(self) {
        self.cancel_token.cancel();
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!("Notification task finished with an unexpected join error: {:?}", e);
            }
        }
    }
}
