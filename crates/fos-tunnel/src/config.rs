//! Tunnel Configuration
//!
//! Settings the actor re-reads on every connection attempt: device state,
//! interface addresses, DNS, relay constraints, obfuscation and timings.
//!
//! ```toml
//! schema_version = 1
//!
//! [device]
//! state = "logged_in"
//! private_key = "..."
//!
//! [interface]
//! addresses = ["10.64.0.2"]
//! dns = ["10.64.0.1"]
//!
//! [tunnel]
//! multihop = false
//! post_quantum = true
//!
//! [tunnel.obfuscation]
//! state = "automatic"
//! ```

use crate::constraint::RelayConstraints;
use crate::keys::PrivateKey;
use crate::location::CustomList;
use crate::obfuscation::{IpVersion, ObfuscationSettings};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Settings schema this build understands
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Account/device status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeviceState {
    LoggedIn { private_key: PrivateKey },
    LoggedOut,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Tunnel interface addresses assigned to the device
    #[serde(default = "default_addresses")]
    pub addresses: Vec<IpAddr>,
    /// DNS servers inside the tunnel (empty: use the relay gateway)
    #[serde(default)]
    pub dns: Vec<IpAddr>,
}

fn default_addresses() -> Vec<IpAddr> {
    vec![IpAddr::V4(Ipv4Addr::new(10, 64, 0, 2))]
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            addresses: default_addresses(),
            dns: Vec::new(),
        }
    }
}

/// Everything relay selection and the connection depend on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Exit constraints (the only hop in singlehop mode)
    #[serde(default)]
    pub relay_constraints: RelayConstraints,
    /// Entry constraints, used with multihop
    #[serde(default)]
    pub entry_constraints: RelayConstraints,
    #[serde(default)]
    pub multihop: bool,
    #[serde(default)]
    pub obfuscation: ObfuscationSettings,
    #[serde(default)]
    pub ip_version: IpVersion,
    #[serde(default)]
    pub post_quantum: bool,
    #[serde(default)]
    pub daita: bool,
    #[serde(default)]
    pub custom_lists: Vec<CustomList>,
}

impl TunnelSettings {
    /// Whether an ephemeral peer has to be negotiated before use
    pub fn needs_ephemeral_peer(&self) -> bool {
        self.post_quantum || self.daita
    }
}

/// Actor timer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorTimings {
    /// How long the prior key stays in use after a rotation (seconds)
    #[serde(default = "default_key_grace_secs")]
    pub key_grace_period_secs: u64,
    /// Interval between recovery attempts from a blocked state (seconds)
    #[serde(default = "default_recovery_secs")]
    pub recovery_interval_secs: u64,
}

fn default_key_grace_secs() -> u64 {
    120
}

fn default_recovery_secs() -> u64 {
    10
}

impl ActorTimings {
    pub fn key_grace_period(&self) -> Duration {
        Duration::from_secs(self.key_grace_period_secs)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs)
    }
}

impl Default for ActorTimings {
    fn default() -> Self {
        Self {
            key_grace_period_secs: default_key_grace_secs(),
            recovery_interval_secs: default_recovery_secs(),
        }
    }
}

fn default_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

/// Settings file contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub device: DeviceState,
    #[serde(default)]
    pub interface: InterfaceConfig,
    #[serde(default)]
    pub tunnel: TunnelSettings,
    #[serde(default)]
    pub timings: ActorTimings,
}

impl TunnelConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, SettingsError> {
        let content = read_settings_file(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        toml::from_str(content).map_err(|e| SettingsError::ParseError(e.to_string()))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, SettingsError> {
        let content = read_settings_file(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, SettingsError> {
        serde_json::from_str(content).map_err(|e| SettingsError::ParseError(e.to_string()))
    }

    /// Load by file extension (`toml` or `json`)
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config = match ext {
            "toml" => Self::from_toml_file(path)?,
            "json" => Self::from_json_file(path)?,
            _ => return Err(SettingsError::UnsupportedFormat),
        };

        debug!("Loaded tunnel settings from {}", path.display());
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, SettingsError> {
        toml::to_string_pretty(self).map_err(|e| SettingsError::ParseError(e.to_string()))
    }

    /// Validate and flatten into the settings a connection attempt uses
    pub fn into_settings(self) -> Result<Settings, SettingsError> {
        if self.schema_version < CURRENT_SCHEMA_VERSION {
            return Err(SettingsError::OutdatedSchema(self.schema_version));
        }

        let private_key = match self.device {
            DeviceState::LoggedIn { private_key } => private_key,
            DeviceState::LoggedOut => return Err(SettingsError::LoggedOut),
            DeviceState::Revoked => return Err(SettingsError::Revoked),
        };

        Ok(Settings {
            private_key,
            interface_addresses: self.interface.addresses,
            dns_servers: self.interface.dns,
            tunnel: self.tunnel,
        })
    }
}

fn read_settings_file(path: &Path) -> Result<String, SettingsError> {
    std::fs::read_to_string(path).map_err(|e| match e.kind() {
        // Data-protected files are unreadable until first unlock
        io::ErrorKind::PermissionDenied => SettingsError::DeviceLocked,
        _ => SettingsError::IoError(e.to_string()),
    })
}

/// Validated settings for one connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub private_key: PrivateKey,
    pub interface_addresses: Vec<IpAddr>,
    pub dns_servers: Vec<IpAddr>,
    pub tunnel: TunnelSettings,
}

/// Source of settings, consulted before every connection attempt
pub trait SettingsReader: Send + Sync {
    fn read(&self) -> Result<Settings, SettingsError>;
}

/// Reads settings from a TOML or JSON file
#[derive(Debug, Clone)]
pub struct FileSettingsReader {
    path: PathBuf,
}

impl FileSettingsReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsReader for FileSettingsReader {
    fn read(&self) -> Result<Settings, SettingsError> {
        TunnelConfig::load(&self.path)?.into_settings()
    }
}

/// Fixed settings, handy for embedding and tests
#[derive(Debug, Clone)]
pub struct StaticSettingsReader(pub Settings);

impl SettingsReader for StaticSettingsReader {
    fn read(&self) -> Result<Settings, SettingsError> {
        Ok(self.0.clone())
    }
}

impl Settings {
    /// Logged-in settings with a fresh key and default tunnel settings
    pub fn with_new_key(tunnel: TunnelSettings) -> Self {
        info!("Generating new device key");
        Self {
            private_key: PrivateKey::generate(),
            interface_addresses: default_addresses(),
            dns_servers: Vec::new(),
            tunnel,
        }
    }
}

/// Settings errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Unsupported settings format")]
    UnsupportedFormat,

    #[error("Outdated settings schema (version {0})")]
    OutdatedSchema(u32),

    #[error("Device is locked")]
    DeviceLocked,

    #[error("Device is logged out")]
    LoggedOut,

    #[error("Device has been revoked")]
    Revoked,
}
