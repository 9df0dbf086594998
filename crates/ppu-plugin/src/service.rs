//! DevicePlugin gRPC service, kubelet-facing side.
//!
//! Implements the `v1beta1.DevicePlugin` interface on top of the registry,
//! the allocator and per-client watch sessions.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::allocator::{self, Allocation};
use crate::config::ResourceNaming;
use crate::error::PluginError;
use crate::health::HealthEvent;
use crate::proto;
use crate::proto::device_plugin_server::DevicePlugin;
use crate::registry::DeviceRegistry;
use crate::watch::{WATCH_BUFFER, WatchSession};

/// Options advertised to kubelet, both in GetDevicePluginOptions and in
/// the registration request.
pub fn plugin_options() -> proto::DevicePluginOptions {
    proto::DevicePluginOptions {
        pre_start_required: false,
        get_preferred_allocation_available: true,
    }
}

/// gRPC implementation of the device plugin service.
pub struct DevicePluginService {
    registry: Arc<DeviceRegistry>,
    naming: ResourceNaming,
    events: broadcast::Sender<HealthEvent>,
    shutdown: watch::Receiver<bool>,
}

impl DevicePluginService {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        naming: ResourceNaming,
        events: broadcast::Sender<HealthEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            naming,
            events,
            shutdown,
        }
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> proto::device_plugin_server::DevicePluginServer<Self> {
        proto::device_plugin_server::DevicePluginServer::new(self)
    }
}

impl From<Allocation> for proto::ContainerAllocateResponse {
    fn from(alloc: Allocation) -> Self {
        proto::ContainerAllocateResponse {
            envs: alloc.envs,
            mounts: Vec::new(),
            devices: alloc
                .devices
                .into_iter()
                .map(|binding| proto::DeviceSpec {
                    container_path: binding.container_path,
                    host_path: binding.host_path,
                    permissions: binding.permissions,
                })
                .collect(),
            annotations: alloc.annotations,
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::DevicePluginOptions>, Status> {
        debug!("GetDevicePluginOptions called");
        Ok(Response::new(plugin_options()))
    }

    type ListAndWatchStream = ReceiverStream<Result<proto::ListAndWatchResponse, Status>>;

    async fn list_and_watch(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        info!("ListAndWatch called, starting device stream");

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let session = WatchSession::new(
            Arc::clone(&self.registry),
            self.events.subscribe(),
            self.shutdown.clone(),
        );

        tokio::spawn(async move {
            match session.run(tx).await {
                Ok(()) => debug!("watch session finished"),
                Err(PluginError::WatchClosed) => {
                    info!("kubelet closed ListAndWatch stream, awaiting reconnect")
                }
                Err(e) => warn!(error = %e, "watch session failed"),
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<proto::PreferredAllocationRequest>,
    ) -> Result<Response<proto::PreferredAllocationResponse>, Status> {
        let req = request.into_inner();
        debug!(containers = req.container_requests.len(), "GetPreferredAllocation called");

        let container_responses = req
            .container_requests
            .iter()
            .enumerate()
            .map(|(i, container)| {
                let device_i_ds = allocator::preferred_allocation(
                    &container.available_device_i_ds,
                    &container.must_include_device_i_ds,
                    i64::from(container.allocation_size),
                );
                debug!(
                    container = i,
                    size = container.allocation_size,
                    available = container.available_device_i_ds.len(),
                    selected = ?device_i_ds,
                    "preferred allocation computed"
                );
                proto::ContainerPreferredAllocationResponse { device_i_ds }
            })
            .collect();

        Ok(Response::new(proto::PreferredAllocationResponse {
            container_responses,
        }))
    }

    async fn allocate(
        &self,
        request: Request<proto::AllocateRequest>,
    ) -> Result<Response<proto::AllocateResponse>, Status> {
        let req = request.into_inner();
        info!(containers = req.container_requests.len(), "Allocate called");

        let container_responses: Vec<proto::ContainerAllocateResponse> = req
            .container_requests
            .iter()
            .enumerate()
            .map(|(i, container)| {
                let alloc = allocator::allocate(&self.registry, &self.naming, &container.devices_ids);
                info!(
                    container = i,
                    requested = container.devices_ids.len(),
                    allocated = alloc.device_ids.len(),
                    "container request processed"
                );
                alloc.into()
            })
            .collect();

        Ok(Response::new(proto::AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        request: Request<proto::PreStartContainerRequest>,
    ) -> Result<Response<proto::PreStartContainerResponse>, Status> {
        let req = request.into_inner();
        debug!(devices = ?req.devices_ids, "PreStartContainer called");
        Ok(Response::new(proto::PreStartContainerResponse {}))
    }
}
