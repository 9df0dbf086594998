//! Unix socket plumbing for the kubelet device plugin API.

use std::io;
use std::path::Path;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::net::{UnixListener, UnixStream};
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, warn};

use crate::error::{PluginError, PluginResult};

/// Bind a listener at `socket`, creating its directory and replacing a
/// socket file left behind by a previous run.
pub fn bind(socket: &Path) -> PluginResult<UnixListener> {
    if let Some(dir) = socket.parent() {
        std::fs::create_dir_all(dir).map_err(|source| PluginError::SocketDir {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    match std::fs::remove_file(socket) {
        Ok(()) => debug!(path = ?socket, "removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(PluginError::StaleSocket {
                path: socket.to_path_buf(),
                source,
            });
        }
    }

    let listener = UnixListener::bind(socket).map_err(|source| PluginError::Listen {
        path: socket.to_path_buf(),
        source,
    })?;
    debug!(path = ?socket, "listening on unix socket");
    Ok(listener)
}

/// Remove the socket file. Absence is not an error; other failures are
/// logged and ignored.
pub fn remove_socket(socket: &Path) {
    match std::fs::remove_file(socket) {
        Ok(()) => debug!(path = ?socket, "socket removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?socket, error = %e, "failed to remove socket file"),
    }
}

/// Open a gRPC channel over the unix socket at `socket`, giving up after
/// `timeout`.
pub async fn dial(socket: &Path, timeout: Duration) -> PluginResult<Channel> {
    let path = socket.to_path_buf();

    // The URI only has to parse; the connector ignores it.
    let endpoint = Endpoint::from_static("http://[::]:50051").connect_timeout(timeout);
    let connector_path = path.clone();
    let connect = endpoint.connect_with_connector(service_fn(move |_: Uri| {
        let path = connector_path.clone();
        async move { Ok::<_, io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
    }));

    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(channel)) => {
            debug!(path = ?path, "connected");
            Ok(channel)
        }
        Ok(Err(source)) => Err(PluginError::Connect { path, source }),
        Err(_) => Err(PluginError::Timeout {
            path,
            after: timeout,
        }),
    }
}
