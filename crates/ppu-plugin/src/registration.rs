//! Outbound registration with kubelet.
//!
//! Registration is a single unary call telling kubelet which socket to dial
//! back and which resource this plugin serves. There is no retry: if
//! kubelet is unreachable the plugin exits and its supervisor restarts it.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{PluginError, PluginResult};
use crate::proto;
use crate::proto::registration_client::RegistrationClient;
use crate::service::plugin_options;
use crate::transport;

/// Device plugin API version sent in the registration request.
pub const API_VERSION: &str = "v1beta1";

/// Build the request announcing `endpoint` (a socket file name relative to
/// kubelet's plugin directory) for `resource_name`.
pub fn register_request(endpoint: &str, resource_name: &str) -> proto::RegisterRequest {
    proto::RegisterRequest {
        version: API_VERSION.to_string(),
        endpoint: endpoint.to_string(),
        resource_name: resource_name.to_string(),
        options: Some(plugin_options()),
    }
}

/// Register with the kubelet listening on `kubelet_socket`. Both the dial
/// and the call are bounded by `timeout`.
pub async fn register(
    kubelet_socket: &Path,
    endpoint: &str,
    resource_name: &str,
    timeout: Duration,
) -> PluginResult<()> {
    info!(socket = ?kubelet_socket, resource = %resource_name, "registering with kubelet");

    let channel = transport::dial(kubelet_socket, timeout).await?;
    let mut client = RegistrationClient::new(channel);

    let request = register_request(endpoint, resource_name);
    debug!(?request, "sending registration request");

    match tokio::time::timeout(timeout, client.register(request)).await {
        Ok(result) => {
            result?;
        }
        Err(_) => {
            return Err(PluginError::Timeout {
                path: kubelet_socket.to_path_buf(),
                after: timeout,
            });
        }
    }

    info!(resource = %resource_name, %endpoint, "registered with kubelet");
    Ok(())
}
