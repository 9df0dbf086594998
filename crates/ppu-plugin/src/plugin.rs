//! Plugin session controller: startup and shutdown of the whole plugin.
//!
//! Startup runs five phases in order; the first failure aborts the rest:
//! 1. Initialize the device registry
//! 2. Bind the plugin socket (replacing a stale one)
//! 3. Serve the DevicePlugin gRPC service in the background
//! 4. Register with kubelet
//! 5. Start the health monitor
//!
//! Shutdown raises the shared signal (ending watch sessions and the
//! monitor), stops the server and removes the socket file. It is safe to
//! call after a partial startup and a second call does nothing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tracing::{debug, error, info, warn};

use crate::config::{PLUGIN_SOCKET, PluginConfig, ResourceNaming};
use crate::error::{PluginError, PluginResult, StartupError, StartupPhase};
use crate::health::{self, HealthEvent, HealthMonitor, HealthProbe, SelfHealingProbe};
use crate::registration;
use crate::registry::DeviceRegistry;
use crate::service::DevicePluginService;
use crate::shutdown_requested;
use crate::transport;

/// How long shutdown waits for background tasks before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Owns the plugin's lifecycle and every background task it spawns.
pub struct PluginController {
    config: PluginConfig,
    naming: ResourceNaming,
    probe: Arc<dyn HealthProbe>,
    events: broadcast::Sender<HealthEvent>,
    shutdown: watch::Sender<bool>,
    registry: Option<Arc<DeviceRegistry>>,
    server: Option<JoinHandle<()>>,
    monitor: Option<JoinHandle<()>>,
    started: bool,
    stopped: bool,
}

impl PluginController {
    /// Create a controller. Fails only on a malformed resource name.
    pub fn new(config: PluginConfig) -> PluginResult<Self> {
        let naming = config.naming()?;
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            naming,
            probe: Arc::new(SelfHealingProbe),
            events: health::event_channel(),
            shutdown,
            registry: None,
            server: None,
            monitor: None,
            started: false,
            stopped: false,
        })
    }

    /// Use a different health probe for the monitor.
    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// The registry, once phase 1 has completed.
    pub fn registry(&self) -> Option<Arc<DeviceRegistry>> {
        self.registry.clone()
    }

    /// Path of the socket the plugin serves on.
    pub fn socket_path(&self) -> PathBuf {
        self.config.plugin_socket()
    }

    /// Whether the health monitor is running, i.e. every startup phase
    /// completed and shutdown has not begun.
    pub fn is_running(&self) -> bool {
        self.monitor.is_some() && !self.stopped
    }

    /// Run the startup sequence.
    pub async fn start(&mut self) -> Result<(), StartupError> {
        if self.started {
            return Err(StartupError::new(StartupPhase::Begin, PluginError::AlreadyStarted));
        }
        self.started = true;
        info!(resource = %self.naming.resource_name(), "starting device plugin");

        // ── 1. Registry ──────────────────────────────────────────────
        let registry = DeviceRegistry::initialize(&self.naming, self.config.device_count)
            .map_err(|e| StartupError::new(StartupPhase::InitRegistry, e))?;
        let registry = Arc::new(registry);
        self.registry = Some(Arc::clone(&registry));

        // ── 2. Listener ──────────────────────────────────────────────
        let socket = self.config.plugin_socket();
        let listener = transport::bind(&socket)
            .map_err(|e| StartupError::new(StartupPhase::OpenListener, e))?;

        // ── 3. gRPC server ───────────────────────────────────────────
        let service = DevicePluginService::new(
            Arc::clone(&registry),
            self.naming.clone(),
            self.events.clone(),
            self.shutdown.subscribe(),
        );
        self.server = Some(spawn_server(listener, service, self.shutdown.subscribe()));

        // Wait until the server answers on its own socket.
        transport::dial(&socket, self.config.register_timeout)
            .await
            .map_err(|e| StartupError::new(StartupPhase::Serve, e))?;
        info!(path = ?socket, "gRPC server started");

        // ── 4. Registration ──────────────────────────────────────────
        registration::register(
            &self.config.kubelet_socket(),
            PLUGIN_SOCKET,
            self.naming.resource_name(),
            self.config.register_timeout,
        )
        .await
        .map_err(|e| StartupError::new(StartupPhase::Register, e))?;

        // ── 5. Health monitor ────────────────────────────────────────
        let monitor = HealthMonitor::new(
            Arc::clone(&registry),
            self.events.clone(),
            self.config.health_interval,
        )
        .with_probe(Arc::clone(&self.probe));
        self.monitor = Some(monitor.spawn(self.shutdown.subscribe()));

        info!(devices = registry.len(), "device plugin started");
        Ok(())
    }

    /// Run the shutdown sequence. Only the first call has any effect.
    pub async fn stop(&mut self) {
        if self.stopped {
            debug!("device plugin already stopped");
            return;
        }
        self.stopped = true;
        info!("stopping device plugin");

        self.shutdown.send_replace(true);

        let tasks = [
            ("gRPC server", self.server.take()),
            ("health monitor", self.monitor.take()),
        ];
        for (name, handle) in tasks {
            let Some(mut handle) = handle else { continue };
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!(task = name, "task did not stop in time, aborting");
                handle.abort();
            }
        }

        transport::remove_socket(&self.config.plugin_socket());
        info!("device plugin stopped");
    }
}

/// Serve the DevicePlugin service on `listener` until shutdown is raised.
fn spawn_server(
    listener: UnixListener,
    service: DevicePluginService,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let incoming = UnixListenerStream::new(listener);
        let result = tonic::transport::Server::builder()
            .add_service(service.into_service())
            .serve_with_incoming_shutdown(incoming, async move {
                shutdown_requested(&mut shutdown).await;
            })
            .await;

        match result {
            Ok(()) => debug!("gRPC server stopped"),
            Err(e) => error!(error = %e, "gRPC server error"),
        }
    })
}
