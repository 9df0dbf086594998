//! ppu-plugin: kubelet device plugin for simulated PPU accelerators.
//!
//! Advertises a fixed set of PPU instances to kubelet, keeps their health
//! current and decides which instances a container gets.
//!
//! # Architecture
//!
//! ```text
//! PluginController
//!   ├── DeviceRegistry        id → health, fixed size
//!   ├── HealthMonitor         periodic probe, emits HealthEvent
//!   ├── DevicePluginService   gRPC on <socket dir>/ppu.sock
//!   │   ├── GetDevicePluginOptions
//!   │   ├── ListAndWatch → WatchSession per client
//!   │   ├── Allocate / GetPreferredAllocation → allocator
//!   │   └── PreStartContainer (no-op)
//!   └── registration          one-shot Register on <socket dir>/kubelet.sock
//! ```
//!
//! All blocking waits observe one shutdown signal, a `watch::channel(bool)`
//! that flips to `true` exactly once.

pub mod allocator;
pub mod config;
pub mod error;
pub mod health;
pub mod plugin;
pub mod registration;
pub mod registry;
pub mod service;
pub mod transport;
pub mod watch;

/// Generated protobuf types and gRPC service stubs for the kubelet
/// device plugin API.
pub mod proto {
    include!("generated/v1beta1.rs");
}

pub use config::{PluginConfig, ResourceNaming};
pub use error::{PluginError, PluginResult, StartupError, StartupPhase};
pub use health::{HealthEvent, HealthMonitor, HealthProbe, SelfHealingProbe};
pub use plugin::PluginController;
pub use registry::{DeviceRegistry, Health, Instance};
pub use service::DevicePluginService;
pub use watch::WatchSession;

/// Resolve once shutdown has been raised, including when it was raised
/// before the call. A dropped sender counts as shutdown.
pub(crate) async fn shutdown_requested(shutdown: &mut tokio::sync::watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
