//! Plugin configuration and resource naming.
//!
//! Settings come from three layers: built-in defaults, an optional TOML
//! file, and command-line overrides applied by the daemon binary.
//!
//! ```toml
//! resource_name = "alibabacloud.com/ppu"
//! device_count = 16
//! log_level = "info"
//! socket_path = "/var/lib/kubelet/device-plugins/"
//! health_interval = "30s"
//! register_timeout = "5s"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{PluginError, PluginResult};

pub const DEFAULT_RESOURCE_NAME: &str = "alibabacloud.com/ppu";
pub const DEFAULT_DEVICE_COUNT: i64 = 16;
pub const DEFAULT_SOCKET_DIR: &str = "/var/lib/kubelet/device-plugins/";
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Socket file name this plugin serves on, relative to the socket directory.
pub const PLUGIN_SOCKET: &str = "ppu.sock";
/// Kubelet registration socket, relative to the socket directory.
pub const KUBELET_SOCKET: &str = "kubelet.sock";

/// Host path bound behind every simulated device file.
pub const PLACEHOLDER_HOST_PATH: &str = "/dev/null";

// ── Log settings ───────────────────────────────────────────────────

/// Log verbosity accepted by `--log-level` and `log_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!(
                "invalid log level {other:?} (expected trace, debug, info, warn or error)"
            )),
        }
    }
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("invalid log format {other:?} (expected text or json)")),
        }
    }
}

// ── Resource naming ────────────────────────────────────────────────

/// Names derived from the extended resource name, e.g.
/// `alibabacloud.com/ppu` → ids `ppu-N`, env `PPU_DEVICE_COUNT`,
/// annotation `ppu.alibabacloud.com/allocated-devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNaming {
    resource_name: String,
    vendor: String,
    short: String,
}

impl ResourceNaming {
    pub fn parse(resource_name: &str) -> PluginResult<Self> {
        let invalid = || PluginError::InvalidResourceName(resource_name.to_string());

        let (vendor, short) = resource_name.split_once('/').ok_or_else(invalid)?;
        if vendor.is_empty() || short.is_empty() || short.contains('/') {
            return Err(invalid());
        }

        Ok(Self {
            resource_name: resource_name.to_string(),
            vendor: vendor.to_string(),
            short: short.to_string(),
        })
    }

    /// The full resource name advertised to kubelet.
    pub fn resource_name(&self) -> &str {
        &self.resource_name
    }

    pub fn device_id(&self, index: usize) -> String {
        format!("{}-{index}", self.short)
    }

    fn env_prefix(&self) -> String {
        self.short
            .chars()
            .map(|c| match c {
                '-' | '.' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect()
    }

    /// Env var carrying the number of allocated devices.
    pub fn count_env(&self) -> String {
        format!("{}_DEVICE_COUNT", self.env_prefix())
    }

    /// Env var carrying the comma-joined allocated ids.
    pub fn devices_env(&self) -> String {
        format!("{}_ALLOCATED_DEVICES", self.env_prefix())
    }

    pub fn annotation_key(&self) -> String {
        format!("{}.{}/allocated-devices", self.short, self.vendor)
    }

    /// Path of the device file inside the container.
    pub fn container_path(&self, device_id: &str) -> String {
        format!("/dev/{device_id}")
    }
}

// ── Plugin configuration ───────────────────────────────────────────

/// Resolved plugin configuration.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub resource_name: String,
    /// Number of simulated devices. Negative values are rejected at
    /// registry initialization.
    pub device_count: i64,
    pub log_level: LogLevel,
    pub log_format: LogFormat,
    /// Directory holding both the plugin socket and kubelet's socket.
    pub socket_path: PathBuf,
    pub health_interval: Duration,
    pub register_timeout: Duration,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            resource_name: DEFAULT_RESOURCE_NAME.to_string(),
            device_count: DEFAULT_DEVICE_COUNT,
            log_level: LogLevel::default(),
            log_format: LogFormat::default(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_DIR),
            health_interval: DEFAULT_HEALTH_INTERVAL,
            register_timeout: DEFAULT_REGISTER_TIMEOUT,
        }
    }
}

/// On-disk form of the configuration. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub resource_name: Option<String>,
    pub device_count: Option<i64>,
    pub log_level: Option<LogLevel>,
    pub log_format: Option<LogFormat>,
    pub socket_path: Option<PathBuf>,
    pub health_interval: Option<String>,
    pub register_timeout: Option<String>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> PluginResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| PluginError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| PluginError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl PluginConfig {
    /// Apply the keys present in a config file on top of `self`.
    pub fn merge_file(mut self, file: FileConfig) -> Self {
        if let Some(name) = file.resource_name {
            self.resource_name = name;
        }
        if let Some(count) = file.device_count {
            self.device_count = count;
        }
        if let Some(level) = file.log_level {
            self.log_level = level;
        }
        if let Some(format) = file.log_format {
            self.log_format = format;
        }
        if let Some(dir) = file.socket_path {
            self.socket_path = dir;
        }
        if let Some(raw) = file.health_interval {
            self.health_interval = parse_duration(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "invalid health_interval, keeping default");
                self.health_interval
            });
        }
        if let Some(raw) = file.register_timeout {
            self.register_timeout = parse_duration(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "invalid register_timeout, keeping default");
                self.register_timeout
            });
        }
        self
    }

    pub fn naming(&self) -> PluginResult<ResourceNaming> {
        ResourceNaming::parse(&self.resource_name)
    }

    /// Full path of the socket this plugin listens on.
    pub fn plugin_socket(&self) -> PathBuf {
        self.socket_path.join(PLUGIN_SOCKET)
    }

    /// Full path of kubelet's registration socket.
    pub fn kubelet_socket(&self) -> PathBuf {
        self.socket_path.join(KUBELET_SOCKET)
    }
}

/// Parse `"30s"`, `"500ms"` or `"2m"`. Zero durations are rejected since
/// they cannot drive a timer.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let duration = if let Some(ms) = s.strip_suffix("ms") {
        Duration::from_millis(ms.trim().parse().ok()?)
    } else if let Some(secs) = s.strip_suffix('s') {
        Duration::from_secs(secs.trim().parse().ok()?)
    } else if let Some(mins) = s.strip_suffix('m') {
        Duration::from_secs(mins.trim().parse::<u64>().ok()?.checked_mul(60)?)
    } else {
        return None;
    };
    (!duration.is_zero()).then_some(duration)
}
