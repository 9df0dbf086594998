//! ListAndWatch session.
//!
//! A session sends the full device list on open and again on every
//! health wake-up. Snapshots are always read from the registry, never
//! rebuilt from event payloads, so coalesced or dropped events cannot make
//! a snapshot wrong. The session ends cleanly on shutdown and with
//! [`PluginError::WatchClosed`] when the peer goes away.
//!
//! ```text
//!   open ──send snapshot──▶ Streaming ──shutdown──────▶ Terminated (Ok)
//!                            │    ▲
//!                 health ────┘    └──── send snapshot
//!                            │
//!                            └──send failed──────────▶ Terminated (Err)
//! ```

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tonic::Status;
use tracing::{debug, info, warn};

use crate::error::{PluginError, PluginResult};
use crate::health::HealthEvent;
use crate::proto::ListAndWatchResponse;
use crate::registry::DeviceRegistry;
use crate::shutdown_requested;

/// Outbound half of a ListAndWatch stream.
pub type WatchSink = mpsc::Sender<Result<ListAndWatchResponse, Status>>;

/// Buffered responses per session before a send has to wait on the peer.
pub const WATCH_BUFFER: usize = 4;

/// States of a watch session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Streaming,
    Terminated,
}

/// One long-lived ListAndWatch stream.
pub struct WatchSession {
    registry: Arc<DeviceRegistry>,
    events: broadcast::Receiver<HealthEvent>,
    shutdown: watch::Receiver<bool>,
    sent: u64,
}

impl WatchSession {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        events: broadcast::Receiver<HealthEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            events,
            shutdown,
            sent: 0,
        }
    }

    /// Drive the session until shutdown or peer disconnect.
    pub async fn run(mut self, sink: WatchSink) -> PluginResult<()> {
        let mut state = self.send_snapshot(&sink).await?;
        if state == WatchState::Streaming {
            info!(devices = self.registry.len(), "initial device list sent");
        }

        let mut events_open = true;
        while state == WatchState::Streaming {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => {
                    state = WatchState::Terminated;
                    continue;
                }
                recv = self.events.recv(), if events_open => match recv {
                    Ok(event) => {
                        debug!(id = %event.id, health = %event.health, "device health update received");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "health updates coalesced");
                    }
                    Err(RecvError::Closed) => {
                        debug!("health event source closed, waiting for shutdown");
                        events_open = false;
                        continue;
                    }
                },
            }

            state = self.send_snapshot(&sink).await?;
        }

        info!(snapshots = self.sent, "ListAndWatch stopped");
        Ok(())
    }

    /// Send the current registry contents. Shutdown wins over a send that
    /// is waiting for buffer space.
    async fn send_snapshot(&mut self, sink: &WatchSink) -> PluginResult<WatchState> {
        let response = ListAndWatchResponse {
            devices: self.registry.to_proto(),
        };
        let devices = response.devices.len();

        tokio::select! {
            biased;
            _ = shutdown_requested(&mut self.shutdown) => Ok(WatchState::Terminated),
            sent = sink.send(Ok(response)) => match sent {
                Ok(()) => {
                    self.sent += 1;
                    debug!(devices, "device list sent");
                    Ok(WatchState::Streaming)
                }
                Err(_) => {
                    warn!("failed to send device list, peer disconnected");
                    Err(PluginError::WatchClosed)
                }
            },
        }
    }
}
