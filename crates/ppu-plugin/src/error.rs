//! Error types for the device plugin.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for device plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// Errors that can occur while running the device plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("invalid device count {0}: must not be negative")]
    InvalidDeviceCount(i64),

    #[error("invalid resource name {0:?}: expected <vendor-domain>/<name>")]
    InvalidResourceName(String),

    #[error("failed to read config file {path:?}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to prepare socket directory {path:?}: {source}")]
    SocketDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to remove stale socket {path:?}: {source}")]
    StaleSocket {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to listen on {path:?}: {source}")]
    Listen {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to connect to {path:?}: {source}")]
    Connect {
        path: PathBuf,
        source: tonic::transport::Error,
    },

    #[error("timed out after {after:?} waiting for {path:?}")]
    Timeout { path: PathBuf, after: Duration },

    #[error("registration rejected: {0}")]
    Register(#[from] tonic::Status),

    #[error("watch stream closed by peer")]
    WatchClosed,

    #[error("plugin already started")]
    AlreadyStarted,
}

/// Phases of the startup sequence. A failure in one phase aborts the
/// phases after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPhase {
    /// Guard against starting a controller twice.
    Begin,
    InitRegistry,
    OpenListener,
    Serve,
    Register,
}

impl fmt::Display for StartupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StartupPhase::Begin => "begin startup",
            StartupPhase::InitRegistry => "initialize device registry",
            StartupPhase::OpenListener => "open plugin socket",
            StartupPhase::Serve => "start gRPC server",
            StartupPhase::Register => "register with kubelet",
        };
        f.write_str(name)
    }
}

/// A fatal startup failure tagged with the phase that produced it.
#[derive(Debug, Error)]
#[error("{phase} failed: {source}")]
pub struct StartupError {
    pub phase: StartupPhase,
    #[source]
    pub source: PluginError,
}

impl StartupError {
    pub fn new(phase: StartupPhase, source: PluginError) -> Self {
        Self { phase, source }
    }
}
