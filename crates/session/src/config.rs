//! Session manager configuration
//!
//! Everything device-specific lives here: the target VID/PID, the
//! configuration and interface to claim, endpoint addresses, the polling
//! packet size and timeout, ring buffer sizing and the optional one-byte
//! activate/deactivate handshake.
//!
//! # Example Configuration
//! ```toml
//! log_level = "info"
//!
//! [device]
//! vendor_id = 0x1733
//! product_id = 0xAABB
//!
//! [transfer]
//! in_endpoint = 0x81
//! poll_timeout_ms = 100
//! kind = "interrupt"
//!
//! [buffer]
//! capacity = 4096
//! overflow = "drop_newest"
//! ```

use crate::ring_buffer::OverflowPolicy;
use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const CONFIG_DIR_NAME: &str = "usb-session";
const CONFIG_FILE_NAME: &str = "session.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Default log level for hosts that use `common::setup_logging`
    #[serde(default = "SessionConfig::default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub buffer: BufferSettings,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub handshake: HandshakeSettings,
}

/// Which peripheral to match and how to bind it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Integer or `"0x1733"`-style hex string
    #[serde(deserialize_with = "deserialize_usb_id")]
    pub vendor_id: u16,
    #[serde(deserialize_with = "deserialize_usb_id")]
    pub product_id: u16,
    /// Configuration value selected after open
    pub configuration: u8,
    /// Interface claimed for the lifetime of a session
    pub interface: u8,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vendor_id: 0x1733,
            product_id: 0xAABB,
            configuration: Self::default_configuration(),
            interface: 0,
        }
    }
}

impl DeviceSettings {
    fn default_configuration() -> u8 {
        1
    }
}

fn deserialize_usb_id<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum UsbId {
        Number(u16),
        Text(String),
    }

    match UsbId::deserialize(deserializer)? {
        UsbId::Number(id) => Ok(id),
        UsbId::Text(text) => parse_hex_id(&text).map_err(serde::de::Error::custom),
    }
}

/// Parse a `0x`-prefixed 1-4 digit hex VID/PID
fn parse_hex_id(id: &str) -> Result<u16> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| anyhow!("Invalid USB id '{}', must start with '0x' (e.g., '0x1234')", id))?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid USB id '{}', hex part must be 1-4 digits",
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid USB id '{}', not a valid hex number", id))
}

/// Transfer kind used by the background reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    #[default]
    Interrupt,
    Bulk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Inbound endpoint polled by the reader (bit 7 set)
    #[serde(default = "TransferSettings::default_in_endpoint")]
    pub in_endpoint: u8,
    /// Outbound endpoint used for the handshake (bit 7 clear)
    #[serde(default = "TransferSettings::default_out_endpoint")]
    pub out_endpoint: u8,
    /// Size of each inbound poll
    #[serde(default = "TransferSettings::default_packet_size")]
    pub packet_size: usize,
    /// Per-poll timeout; also bounds how long a stop request can go unnoticed
    #[serde(default = "TransferSettings::default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default)]
    pub kind: TransferKind,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            in_endpoint: Self::default_in_endpoint(),
            out_endpoint: Self::default_out_endpoint(),
            packet_size: Self::default_packet_size(),
            poll_timeout_ms: Self::default_poll_timeout_ms(),
            kind: TransferKind::default(),
        }
    }
}

impl TransferSettings {
    fn default_in_endpoint() -> u8 {
        0x81
    }

    fn default_out_endpoint() -> u8 {
        0x01
    }

    fn default_packet_size() -> usize {
        64
    }

    fn default_poll_timeout_ms() -> u64 {
        100
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSettings {
    /// Ring buffer capacity in bytes, per session
    #[serde(default = "BufferSettings::default_capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

impl BufferSettings {
    fn default_capacity() -> usize {
        4096
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Start the reader as soon as a session opens
    #[serde(default = "SessionSettings::default_auto_start_reader")]
    pub auto_start_reader: bool,
    /// Upper bound on simultaneously open sessions (None = unbounded)
    #[serde(default)]
    pub max_sessions: Option<usize>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            auto_start_reader: Self::default_auto_start_reader(),
            max_sessions: None,
        }
    }
}

impl SessionSettings {
    fn default_auto_start_reader() -> bool {
        true
    }
}

/// One-byte activate/deactivate commands written to the OUT endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeSettings {
    #[serde(default = "HandshakeSettings::default_enabled")]
    pub enabled: bool,
    #[serde(default = "HandshakeSettings::default_open_command")]
    pub open_command: u8,
    #[serde(default)]
    pub close_command: u8,
    #[serde(default = "HandshakeSettings::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            open_command: Self::default_open_command(),
            close_command: 0x00,
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

impl HandshakeSettings {
    fn default_enabled() -> bool {
        true
    }

    fn default_open_command() -> u8 {
        0x01
    }

    fn default_timeout_ms() -> u64 {
        1000
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            device: DeviceSettings::default(),
            transfer: TransferSettings::default(),
            buffer: BufferSettings::default(),
            session: SessionSettings::default(),
            handshake: HandshakeSettings::default(),
        }
    }
}

impl SessionConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Poll timeout of the background reader
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer.poll_timeout_ms)
    }

    /// Timeout for the activate/deactivate bulk writes
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake.timeout_ms)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SessionConfig =
            toml::from_str(content).context("Failed to parse session configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Locations searched when no explicit path is given, most specific first
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(2);
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME));
        }
        paths.push(Path::new("/etc").join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME));
        paths
    }

    fn find_file() -> Option<PathBuf> {
        Self::search_paths().into_iter().find(|p| p.is_file())
    }

    /// Read and validate one configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;

        debug!("Session configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load `path`, or the first file found on the search path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path.or_else(Self::find_file).ok_or_else(|| {
            let searched: Vec<String> = Self::search_paths()
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            anyhow!("No {} found in {}", CONFIG_FILE_NAME, searched.join(", "))
        })?;

        Self::from_file(&path)
    }

    /// Built-in defaults unless a file on the search path overrides them
    ///
    /// A file that exists but does not parse or validate is reported and
    /// ignored.
    pub fn load_or_default() -> Self {
        let Some(path) = Self::find_file() else {
            debug!("No session configuration file, using defaults");
            return Self::default();
        };

        Self::from_file(&path).unwrap_or_else(|e| {
            warn!("Ignoring session configuration: {:#}", e);
            Self::default()
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.transfer.in_endpoint & 0x80 == 0 {
            return Err(anyhow!(
                "Invalid in_endpoint {:#04x}, IN endpoints have bit 7 set (e.g. 0x81)",
                self.transfer.in_endpoint
            ));
        }

        if self.transfer.out_endpoint & 0x80 != 0 {
            return Err(anyhow!(
                "Invalid out_endpoint {:#04x}, OUT endpoints have bit 7 clear (e.g. 0x01)",
                self.transfer.out_endpoint
            ));
        }

        if self.transfer.packet_size == 0 || self.transfer.packet_size > 64 * 1024 {
            return Err(anyhow!(
                "Invalid packet_size {}, must be 1-65536 bytes",
                self.transfer.packet_size
            ));
        }

        if self.transfer.poll_timeout_ms == 0 {
            return Err(anyhow!(
                "poll_timeout_ms must be greater than 0 (0 would block the reader forever)"
            ));
        }

        if self.buffer.capacity == 0 {
            return Err(anyhow!("Buffer capacity must be greater than 0"));
        }

        if self.session.max_sessions == Some(0) {
            return Err(anyhow!("max_sessions must be greater than 0 when set"));
        }

        Ok(())
    }
}

/// Load a configuration file, expanding a leading `~`
pub fn load_config(path: &str) -> Result<SessionConfig> {
    let expanded = shellexpand::tilde(path);
    SessionConfig::from_file(Path::new(expanded.as_ref()))
}
