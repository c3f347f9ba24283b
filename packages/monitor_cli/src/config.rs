use anyhow::{Context, Result};
use monitor_manager::{MonitorConfig, TransportKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

// =============================================================================
// Unified config (figment-deserialized from defaults / monitor.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   monitor.toml:    [bridge]
//                    url = "http://127.0.0.1:50051"
//
//   env var:         MONITOR_BRIDGE__URL=http://127.0.0.1:50051   (double underscore = nesting)
//
//   (single underscore stays within field names: MONITOR_MONITOR__PRESENCE_GRACE_MS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    #[serde(default)]
    pub bridge: BridgeFileConfig,
    #[serde(default)]
    pub monitor: MonitorFileConfig,
}

/// Where the bridge lives (under `[bridge]` in monitor.toml).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BridgeFileConfig {
    #[serde(default = "default_bridge_url")]
    pub url: String,
    #[serde(default)]
    pub transport: TransportKind,
    /// How often detected ports are polled.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for BridgeFileConfig {
    fn default() -> Self {
        Self {
            url: default_bridge_url(),
            transport: TransportKind::default(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Session tunables (under `[monitor]` in monitor.toml).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MonitorFileConfig {
    #[serde(default = "default_presence_grace_ms")]
    pub presence_grace_ms: u64,
    /// Baudrate used for serial ports when none is chosen. 0 means wait for one.
    #[serde(default = "default_baudrate")]
    pub default_baudrate: Option<u32>,
    #[serde(default = "default_auto_play")]
    pub auto_play: bool,
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

impl Default for MonitorFileConfig {
    fn default() -> Self {
        Self {
            presence_grace_ms: default_presence_grace_ms(),
            default_baudrate: default_baudrate(),
            auto_play: default_auto_play(),
            notification_capacity: default_notification_capacity(),
        }
    }
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:50051".to_string()
}
fn default_poll_interval_ms() -> u64 {
    1000
}
fn default_presence_grace_ms() -> u64 {
    1000
}
fn default_baudrate() -> Option<u32> {
    Some(9600)
}
fn default_auto_play() -> bool {
    true
}
fn default_notification_capacity() -> usize {
    256
}

impl FileConfig {
    /// Runtime view handed to the monitor service.
    pub fn to_monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            bridge_url: self.bridge.url.clone(),
            transport: self.bridge.transport,
            poll_interval: Duration::from_millis(self.bridge.poll_interval_ms),
            presence_grace: Duration::from_millis(self.monitor.presence_grace_ms),
            default_baudrate: self.monitor.default_baudrate.filter(|b| *b > 0),
            auto_play: self.monitor.auto_play,
            notification_capacity: self.monitor.notification_capacity.max(1),
        }
    }
}

/// Build a figment that layers: defaults → monitor.toml → MONITOR_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `MONITOR_BRIDGE__TRANSPORT=websocket`  →  `bridge.transport = "websocket"`
///   `MONITOR_MONITOR__AUTO_PLAY=false`  →  `monitor.auto_play = false`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("monitor.toml")))
        .merge(Env::prefixed("MONITOR_").split("__"))
}

/// Resolved locations plus the loaded configuration.
#[derive(Clone, Debug)]
pub struct CliConfig {
    pub config_dir: PathBuf,
    pub file: FileConfig,
}

impl CliConfig {
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = custom_dir.unwrap_or_else(|| {
            dirs::config_dir()
                .or_else(dirs::home_dir)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("serial-monitor")
        });

        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {:?}", config_dir))?;

        let file: FileConfig = load_config(&config_dir)
            .extract()
            .context("Failed to load monitor configuration")?;

        info!("Config directory: {}", config_dir.display());

        Ok(Self { config_dir, file })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.config_dir.join("monitor.toml")
    }

    /// The effective configuration rendered back as TOML.
    pub fn render(&self) -> Result<String> {
        toml::to_string_pretty(&self.file).context("Failed to render configuration")
    }
}
