//! Health monitor: periodic re-evaluation of every registry entry.
//!
//! On each tick the monitor asks its [`HealthProbe`] for the observed
//! health of every instance, commits changes to the registry and emits a
//! [`HealthEvent`] per change. Events are wake-up signals only: emission
//! never blocks, and an event that finds no listener is dropped. The
//! registry stays the source of truth, so a dropped event only delays a
//! snapshot until the next wake-up or reconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::registry::{DeviceRegistry, Health, Instance};
use crate::shutdown_requested;

/// Capacity of the health event channel.
pub const HEALTH_EVENT_CAPACITY: usize = 8;

/// A single committed health transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub id: String,
    pub health: Health,
}

/// Create the channel health events travel on.
pub fn event_channel() -> broadcast::Sender<HealthEvent> {
    broadcast::channel(HEALTH_EVENT_CAPACITY).0
}

/// Source of observed device health.
pub trait HealthProbe: Send + Sync + 'static {
    fn probe(&self, instance: &Instance) -> Health;
}

/// Probe for simulated devices: every device recovers on the next check.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfHealingProbe;

impl HealthProbe for SelfHealingProbe {
    fn probe(&self, _instance: &Instance) -> Health {
        Health::Healthy
    }
}

/// Periodically probes all devices and publishes health changes.
pub struct HealthMonitor {
    registry: Arc<DeviceRegistry>,
    probe: Arc<dyn HealthProbe>,
    events: broadcast::Sender<HealthEvent>,
    interval: Duration,
}

impl HealthMonitor {
    /// Create a monitor using [`SelfHealingProbe`].
    pub fn new(
        registry: Arc<DeviceRegistry>,
        events: broadcast::Sender<HealthEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            probe: Arc::new(SelfHealingProbe),
            events,
            interval,
        }
    }

    /// Replace the probe.
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Run one health pass. Returns the number of transitions committed.
    pub fn check_once(&self) -> usize {
        let mut changed = 0;

        for instance in self.registry.snapshot() {
            let observed = self.probe.probe(&instance);
            if observed == instance.health {
                continue;
            }

            debug!(
                id = %instance.id,
                from = %instance.health,
                to = %observed,
                "device health changed"
            );
            if !self.registry.set_health(&instance.id, observed) {
                continue;
            }
            changed += 1;

            let event = HealthEvent {
                id: instance.id,
                health: observed,
            };
            match self.events.send(event) {
                Ok(receivers) => debug!(receivers, "health update sent"),
                Err(broadcast::error::SendError(event)) => {
                    debug!(id = %event.id, "no watch session listening, health update dropped")
                }
            }
        }

        changed
    }

    /// Tick until shutdown is raised. The first check happens one full
    /// interval after start.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?self.interval, "health monitor started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => {
                    info!("health monitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    debug!("performing periodic health check");
                    let changed = self.check_once();
                    if changed > 0 {
                        info!(changed, "device health updated");
                    }
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceNaming;

    fn registry(count: i64) -> Arc<DeviceRegistry> {
        let naming = ResourceNaming::parse("alibabacloud.com/ppu").unwrap();
        Arc::new(DeviceRegistry::initialize(&naming, count).unwrap())
    }

    /// Reports a fixed set of ids as unhealthy.
    struct FailingProbe(Vec<&'static str>);

    impl HealthProbe for FailingProbe {
        fn probe(&self, instance: &Instance) -> Health {
            if self.0.contains(&instance.id.as_str()) {
                Health::Unhealthy
            } else {
                Health::Healthy
            }
        }
    }

    #[test]
    fn check_once_heals_unhealthy_devices() {
        let registry = registry(4);
        registry.set_health("ppu-1", Health::Unhealthy);
        registry.set_health("ppu-3", Health::Unhealthy);

        let events = event_channel();
        let mut rx = events.subscribe();
        let monitor = HealthMonitor::new(registry.clone(), events, Duration::from_secs(30));

        assert_eq!(monitor.check_once(), 2);
        assert!(registry.snapshot().iter().all(|i| i.health == Health::Healthy));

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first, HealthEvent { id: "ppu-1".into(), health: Health::Healthy });
        assert_eq!(second, HealthEvent { id: "ppu-3".into(), health: Health::Healthy });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn check_once_is_quiet_when_all_healthy() {
        let events = event_channel();
        let mut rx = events.subscribe();
        let monitor = HealthMonitor::new(registry(4), events, Duration::from_secs(30));

        assert_eq!(monitor.check_once(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn registry_updates_survive_without_listeners() {
        let registry = registry(2);
        registry.set_health("ppu-0", Health::Unhealthy);

        let monitor = HealthMonitor::new(registry.clone(), event_channel(), Duration::from_secs(30));
        assert_eq!(monitor.check_once(), 1);
        assert_eq!(registry.get("ppu-0").unwrap().health, Health::Healthy);
    }

    #[test]
    fn custom_probe_marks_devices_unhealthy() {
        let registry = registry(3);
        let events = event_channel();
        let mut rx = events.subscribe();
        let monitor = HealthMonitor::new(registry.clone(), events, Duration::from_secs(30))
            .with_probe(Arc::new(FailingProbe(vec!["ppu-2"])));

        assert_eq!(monitor.check_once(), 1);
        assert_eq!(registry.get("ppu-2").unwrap().health, Health::Unhealthy);
        assert_eq!(rx.try_recv().unwrap().health, Health::Unhealthy);

        // Stable state: nothing more to report.
        assert_eq!(monitor.check_once(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_heals_within_one_interval() {
        let registry = registry(4);
        registry.set_health("ppu-2", Health::Unhealthy);

        let events = event_channel();
        let mut rx = events.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = HealthMonitor::new(registry.clone(), events, Duration::from_secs(30))
            .spawn(shutdown_rx);

        let event = tokio::time::timeout(Duration::from_secs(31), rx.recv())
            .await
            .expect("no health event within one interval")
            .unwrap();
        assert_eq!(event, HealthEvent { id: "ppu-2".into(), health: Health::Healthy });
        assert_eq!(registry.get("ppu-2").unwrap().health, Health::Healthy);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_stops_promptly_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = HealthMonitor::new(registry(1), event_channel(), Duration::from_secs(3600))
            .spawn(shutdown_rx);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor ignored shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn monitor_exits_if_shutdown_already_raised() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();

        let handle = HealthMonitor::new(registry(1), event_channel(), Duration::from_secs(3600))
            .spawn(shutdown_rx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor ignored shutdown")
            .unwrap();
    }
}
