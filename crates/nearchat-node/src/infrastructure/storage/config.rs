//! TOML-based configuration for the NearChat node.
//!
//! Reads and writes `AppConfig` to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\NearChat\config.toml`
//! - Linux:    `~/.config/nearchat/config.toml`
//! - macOS:    `~/Library/Application Support/NearChat/config.toml`
//!
//! ```toml
//! [node]
//! name = "alice-laptop"
//! log_level = "info"
//!
//! [radio]
//! listen_port = 24900
//! discovery_port = 24901
//!
//! [timeouts]
//! scan_ms = 15000
//! ```
//!
//! Every field has a `#[serde(default = ...)]`, so a missing file, a missing
//! section, or a missing key all fall back to the defaults.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nearchat_core::protocol::MAX_NAME_LEN;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::application::dispatch_message::DispatchConfig;
use crate::infrastructure::radio::lan::LanRadioConfig;
use crate::infrastructure::resolver::ResolverConfig;
use crate::infrastructure::session::SessionConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value parsed but makes no sense.
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub radio: RadioSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub limits: LimitSection,
}

/// Identity and logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSection {
    /// Display name other devices address this one by.
    #[serde(default = "default_name")]
    pub name: String,
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Service identity and sockets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RadioSection {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    /// Both ends must use the same id to see each other.
    #[serde(default = "default_service_id")]
    pub service_id: Uuid,
    /// IP address to bind all sockets to.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Where scan probes are sent.
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,
    /// TCP port for inbound messages.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// UDP port for probes and beacons.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
}

/// Bounds on every wait, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutSection {
    #[serde(default = "default_connect_ms")]
    pub connect_ms: u64,
    #[serde(default = "default_io_ms")]
    pub io_ms: u64,
    #[serde(default = "default_scan_ms")]
    pub scan_ms: u64,
    #[serde(default = "default_send_ms")]
    pub send_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitSection {
    /// Longest message read from an inbound session.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_name() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "nearchat".to_string())
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_service_name() -> String {
    "NearChat".to_string()
}
fn default_service_id() -> Uuid {
    Uuid::from_u128(0xfa87c0d0_afac_11de_8a39_0800200c9a66)
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}
fn default_listen_port() -> u16 {
    24900
}
fn default_discovery_port() -> u16 {
    24901
}
fn default_connect_ms() -> u64 {
    12_000
}
fn default_io_ms() -> u64 {
    10_000
}
fn default_scan_ms() -> u64 {
    15_000
}
fn default_send_ms() -> u64 {
    30_000
}
fn default_max_message_bytes() -> usize {
    1024
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for RadioSection {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            service_id: default_service_id(),
            bind_address: default_bind_address(),
            broadcast_address: default_broadcast_address(),
            listen_port: default_listen_port(),
            discovery_port: default_discovery_port(),
        }
    }
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_ms(),
            io_ms: default_io_ms(),
            scan_ms: default_scan_ms(),
            send_ms: default_send_ms(),
        }
    }
}

impl Default for LimitSection {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl AppConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            service_name: self.radio.service_name.clone(),
            service_id: self.radio.service_id,
            connect_timeout: Duration::from_millis(self.timeouts.connect_ms),
            io_timeout: Duration::from_millis(self.timeouts.io_ms),
            max_message_bytes: self.limits.max_message_bytes,
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            scan_timeout: Duration::from_millis(self.timeouts.scan_ms),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            send_timeout: Duration::from_millis(self.timeouts.send_ms),
        }
    }

    /// Settings for the LAN radio.  Scans stop collecting beacons a little
    /// before the resolver's own bound so the radio reports `Finished` itself.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if an address does not parse, or if
    /// the node name cannot be sent in a connection preamble.
    pub fn lan_radio_config(&self) -> Result<LanRadioConfig, ConfigError> {
        validate_node_name(&self.node.name)?;
        let parse_ip = |field: &'static str, text: &str| {
            text.parse::<IpAddr>().map_err(|e| ConfigError::Invalid {
                field,
                reason: format!("{text:?}: {e}"),
            })
        };
        let scan_ms = self.timeouts.scan_ms.saturating_sub(self.timeouts.scan_ms / 5);
        Ok(LanRadioConfig {
            name: self.node.name.clone(),
            service_id: self.radio.service_id,
            bind_address: parse_ip("radio.bind_address", &self.radio.bind_address)?,
            broadcast_address: parse_ip("radio.broadcast_address", &self.radio.broadcast_address)?,
            listen_port: self.radio.listen_port,
            discovery_port: self.radio.discovery_port,
            scan_window: Duration::from_millis(scan_ms),
        })
    }
}

/// Peers learn each other's names from the connection preamble, which only
/// carries 1..=`MAX_NAME_LEN` bytes.
fn validate_node_name(name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::Invalid {
            field: "node.name",
            reason: "must not be empty".to_string(),
        });
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ConfigError::Invalid {
            field: "node.name",
            reason: format!("{} bytes, at most {MAX_NAME_LEN} allowed", name.len()),
        });
    }
    Ok(())
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads `AppConfig` from `path`, returning the defaults if the file does not
/// exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating the directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config_to(path: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("NearChat"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("nearchat"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("NearChat")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_default_has_expected_ports() {
        // Arrange / Act
        let cfg = AppConfig::default();

        // Assert
        assert_eq!(cfg.radio.listen_port, 24900);
        assert_eq!(cfg.radio.discovery_port, 24901);
        assert_eq!(cfg.radio.service_name, "NearChat");
    }

    #[test]
    fn test_default_timeouts_are_bounded() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.session_config().connect_timeout, Duration::from_secs(12));
        assert_eq!(cfg.session_config().io_timeout, Duration::from_secs(10));
        assert_eq!(cfg.resolver_config().scan_timeout, Duration::from_secs(15));
        assert_eq!(cfg.dispatch_config().send_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_default_service_id_matches_well_known_uuid() {
        let cfg = AppConfig::default();
        assert_eq!(
            cfg.radio.service_id.to_string(),
            "fa87c0d0-afac-11de-8a39-0800200c9a66"
        );
    }

    #[test]
    fn test_deserialize_empty_toml_uses_defaults() {
        let cfg: AppConfig = toml::from_str("").expect("deserialize empty");
        assert_eq!(cfg.radio, RadioSection::default());
        assert_eq!(cfg.timeouts, TimeoutSection::default());
        assert_eq!(cfg.limits.max_message_bytes, 1024);
    }

    #[test]
    fn test_deserialize_partial_section_overrides_defaults() {
        // Arrange
        let toml_str = r#"
[node]
name = "alice"

[timeouts]
scan_ms = 5000
"#;

        // Act
        let cfg: AppConfig = toml::from_str(toml_str).expect("deserialize partial");

        // Assert
        assert_eq!(cfg.node.name, "alice");
        assert_eq!(cfg.node.log_level, "info");
        assert_eq!(cfg.timeouts.scan_ms, 5000);
        assert_eq!(cfg.timeouts.connect_ms, 12_000);
    }

    #[test]
    fn test_app_config_round_trips_through_toml() {
        // Arrange
        let mut cfg = AppConfig::default();
        cfg.node.name = "bob".to_string();
        cfg.radio.listen_port = 9000;

        // Act
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let restored: AppConfig = toml::from_str(&toml_str).expect("deserialize");

        // Assert
        assert_eq!(cfg, restored);
    }

    #[test]
    fn test_lan_radio_config_rejects_bad_address() {
        let mut cfg = AppConfig::default();
        cfg.radio.bind_address = "not-an-ip".to_string();

        let result = cfg.lan_radio_config();

        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "radio.bind_address",
                ..
            })
        ));
    }

    #[test]
    fn test_lan_radio_config_rejects_empty_node_name() {
        // Arrange
        let mut cfg = AppConfig::default();
        cfg.node.name = "  ".to_string();

        // Act
        let result = cfg.lan_radio_config();

        // Assert
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "node.name",
                ..
            })
        ));
    }

    #[test]
    fn test_lan_radio_config_rejects_node_name_longer_than_preamble() {
        // Arrange – 300 bytes cannot be written as a preamble
        let mut cfg = AppConfig::default();
        cfg.node.name = "n".repeat(300);

        // Act
        let result = cfg.lan_radio_config();

        // Assert
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "node.name",
                ..
            })
        ));
    }

    #[test]
    fn test_lan_radio_config_accepts_name_at_preamble_limit() {
        let mut cfg = AppConfig::default();
        cfg.node.name = "n".repeat(MAX_NAME_LEN);

        let lan = cfg.lan_radio_config().unwrap();

        assert_eq!(lan.name.len(), MAX_NAME_LEN);
    }

    #[test]
    fn test_lan_scan_window_ends_before_resolver_bound() {
        let cfg = AppConfig::default();
        let lan = cfg.lan_radio_config().unwrap();
        assert!(lan.scan_window < cfg.resolver_config().scan_timeout);
        assert_eq!(lan.name, cfg.node.name);
    }

    #[test]
    fn test_load_config_from_missing_file_returns_default() {
        let path = std::env::temp_dir()
            .join(format!("nearchat_missing_{}", Uuid::new_v4()))
            .join("config.toml");

        let cfg = load_config_from(&path).unwrap();

        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn test_save_then_load_round_trip_via_temp_dir() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("nearchat_test_{}", Uuid::new_v4()));
        let path = dir.join("nested").join("config.toml");
        let mut cfg = AppConfig::default();
        cfg.timeouts.send_ms = 1234;

        // Act
        save_config_to(&path, &cfg).unwrap();
        let loaded = load_config_from(&path).unwrap();

        // Assert
        assert_eq!(loaded, cfg);

        // Cleanup
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_malformed_file_is_parse_error() {
        let dir = std::env::temp_dir().join(format!("nearchat_bad_{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[[[ not valid toml").unwrap();

        let result = load_config_from(&path);

        assert!(matches!(result, Err(ConfigError::Parse(_))));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_config_file_path_ends_with_config_toml() {
        if let Ok(path) = config_file_path() {
            assert!(path.ends_with("config.toml"), "got {path:?}");
        }
    }
}
