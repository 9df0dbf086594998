//! ppu-device-plugin: kubelet device plugin daemon for simulated PPUs.
//!
//! Loads configuration, starts the plugin session and runs until SIGINT
//! or SIGTERM.
//!
//! # Usage
//!
//! ```text
//! ppu-device-plugin --device-count 8 --log-level debug
//! ppu-device-plugin --config /etc/ppu/plugin.toml --log-format json
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use ppu_plugin::PluginController;
use ppu_plugin::config::{FileConfig, LogFormat, LogLevel, PluginConfig, parse_duration};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "ppu-device-plugin",
    version,
    about = "Kubelet device plugin advertising simulated PPU devices"
)]
struct Cli {
    /// Extended resource name [default: alibabacloud.com/ppu].
    #[arg(long)]
    resource_name: Option<String>,

    /// Number of simulated PPU devices [default: 16].
    #[arg(long, allow_negative_numbers = true)]
    device_count: Option<i64>,

    /// trace, debug, info, warn or error [default: info]. RUST_LOG wins.
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// text or json [default: text].
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Directory holding the plugin and kubelet sockets
    /// [default: /var/lib/kubelet/device-plugins/].
    #[arg(long)]
    socket_path: Option<PathBuf>,

    /// Health check interval, e.g. 30s, 500ms, 2m [default: 30s].
    #[arg(long, value_parser = duration_arg)]
    health_interval: Option<Duration>,

    /// Bound on dialing and registering with kubelet [default: 5s].
    #[arg(long, value_parser = duration_arg)]
    register_timeout: Option<Duration>,

    /// TOML config file; command-line flags override its keys.
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    /// Overlay the flags that were given on `config`.
    fn apply(self, mut config: PluginConfig) -> PluginConfig {
        if let Some(name) = self.resource_name {
            config.resource_name = name;
        }
        if let Some(count) = self.device_count {
            config.device_count = count;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Some(dir) = self.socket_path {
            config.socket_path = dir;
        }
        if let Some(interval) = self.health_interval {
            config.health_interval = interval;
        }
        if let Some(timeout) = self.register_timeout {
            config.register_timeout = timeout;
        }
        config
    }
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).ok_or_else(|| format!("invalid duration {s:?} (expected e.g. 30s, 500ms, 2m)"))
}

fn load_file(path: Option<&Path>) -> anyhow::Result<FileConfig> {
    match path {
        Some(path) => FileConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(FileConfig::default()),
    }
}

fn init_tracing(level: LogLevel, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},h2=warn,hyper=warn,tower=warn")));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let file = match load_file(cli.config.as_deref()) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("ppu-device-plugin: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    // The subscriber must exist before the file is merged so that merge
    // warnings are not lost.
    init_tracing(
        cli.log_level.or(file.log_level).unwrap_or_default(),
        cli.log_format.or(file.log_format).unwrap_or_default(),
    );

    let config = cli.apply(PluginConfig::default().merge_file(file));
    run(config).await
}

async fn run(config: PluginConfig) -> ExitCode {
    info!("PPU device plugin starting");
    info!(resource = %config.resource_name, "resource name");
    info!(count = config.device_count, "device count");
    info!(level = %config.log_level, "log level");
    info!(dir = ?config.socket_path, "socket directory");

    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(int), Ok(term)) => (int, term),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    let mut controller = match PluginController::new(config) {
        Ok(controller) => controller,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = controller.start().await {
        error!(phase = %e.phase, error = %e.source, "startup failed");
        controller.stop().await;
        return ExitCode::FAILURE;
    }

    info!("device plugin running, waiting for SIGINT or SIGTERM");
    let received = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };
    info!(signal = received, "shutdown signal received");

    controller.stop().await;
    info!("PPU device plugin exited");
    ExitCode::SUCCESS
}
