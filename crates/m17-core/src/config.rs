//! Configuration for the M17 engine.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $M17_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/m17/config.toml
//!   3. ~/.config/m17/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::frame_type::Version;
use crate::gnss::{GnssFix, SourceType, StationType};
use crate::wire;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct M17Config {
    pub station: StationConfig,
    pub audio: AudioConfig,
    pub gnss: GnssConfig,
    pub network: NetworkConfig,
    pub ipc: IpcConfig,
    pub routes: RoutesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Own callsign, without module.
    pub callsign: String,
    /// Local module letter, appended in the ninth position on links.
    pub module: char,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture device name. Empty = backend default.
    pub input: String,
    /// Playback device name. Empty = backend default.
    pub output: String,
    /// Device sample rate in Hz. Anything other than 8000 is resampled.
    pub sample_rate: u32,
    /// Codec2 3200 voice-only when true, 1600 voice+data when false.
    pub voice_only: bool,
    pub frame_type_version: FrameTypeVersion,
    /// Text sent in the META field of outgoing streams. Empty = none.
    pub text_message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameTypeVersion {
    Legacy,
    V3,
}

impl From<FrameTypeVersion> for Version {
    fn from(v: FrameTypeVersion) -> Self {
        match v {
            FrameTypeVersion::Legacy => Version::Legacy,
            FrameTypeVersion::V3 => Version::V3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GnssConfig {
    /// Send the position in frame 6 of every outgoing stream.
    pub enabled: bool,
    pub latitude: f64,
    pub longitude: f64,
    /// Metres. None = not sent.
    pub altitude: Option<f64>,
    pub source: SourceType,
    pub station: StationType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub net_type: NetType,
    /// Default destination host. Empty = none until set at runtime.
    pub destination: String,
    pub destination_port: u16,
    /// UDP port the gateway binds. 0 = OS-assigned.
    pub listen_port: u16,
    pub timers: TimerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetType {
    V4,
    V6,
    Both,
}

impl NetType {
    pub fn ipv4(self) -> bool {
        matches!(self, NetType::V4 | NetType::Both)
    }

    pub fn ipv6(self) -> bool {
        matches!(self, NetType::V6 | NetType::Both)
    }
}

impl std::str::FromStr for NetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "v4" | "ipv4" => Ok(NetType::V4),
            "v6" | "ipv6" => Ok(NetType::V6),
            "both" | "dual" => Ok(NetType::Both),
            other => Err(format!("unknown net type {other:?}")),
        }
    }
}

/// Gateway and audio timers, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub link_timeout_ms: u64,
    pub ping_watchdog_ms: u64,
    pub stream_timeout_ms: u64,
    pub gateway_poll_ms: u64,
    pub audio_frame_ms: u64,
}

impl TimerConfig {
    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.link_timeout_ms)
    }

    pub fn ping_watchdog(&self) -> Duration {
        Duration::from_millis(self.ping_watchdog_ms)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }

    pub fn gateway_poll(&self) -> Duration {
        Duration::from_millis(self.gateway_poll_ms)
    }

    pub fn audio_frame(&self) -> Duration {
        Duration::from_millis(self.audio_frame_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Start the Unix-datagram bridges.
    pub enabled: bool,
    /// Directory holding the am2m17, m172am and log_input sockets.
    pub bridge_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
    /// callsign=address lines.
    pub file: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            callsign: String::from("N0CALL"),
            module: 'D',
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input: String::new(),
            output: String::new(),
            sample_rate: wire::SAMPLE_RATE,
            voice_only: true,
            frame_type_version: FrameTypeVersion::Legacy,
            text_message: String::new(),
        }
    }
}

impl Default for GnssConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            latitude: 0.0,
            longitude: 0.0,
            altitude: None,
            source: SourceType::Client,
            station: StationType::Fixed,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            net_type: NetType::V4,
            destination: String::new(),
            destination_port: wire::DEFAULT_PORT,
            listen_port: 0,
            timers: TimerConfig::default(),
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            link_timeout_ms: wire::LINK_TIMEOUT.as_millis() as u64,
            ping_watchdog_ms: wire::PING_WATCHDOG.as_millis() as u64,
            stream_timeout_ms: wire::STREAM_TIMEOUT.as_millis() as u64,
            gateway_poll_ms: wire::GATEWAY_POLL.as_millis() as u64,
            audio_frame_ms: wire::AUDIO_FRAME.as_millis() as u64,
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bridge_dir: runtime_dir(),
        }
    }
}

impl Default for RoutesConfig {
    fn default() -> Self {
        Self {
            file: config_dir().join("routes.cfg"),
        }
    }
}

impl GnssConfig {
    /// The configured position, or None when disabled or at 0,0.
    pub fn fix(&self) -> Option<GnssFix> {
        if !self.enabled || (self.latitude == 0.0 && self.longitude == 0.0) {
            return None;
        }
        let mut fix = GnssFix::new(self.latitude, self.longitude);
        fix.altitude = self.altitude;
        Some(fix)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("m17")
}

fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir())
        .join("m17")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl M17Config {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, then apply env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            M17Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("M17_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&M17Config::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply M17_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("M17_STATION__CALLSIGN") {
            self.station.callsign = v.to_ascii_uppercase();
        }
        if let Some(v) = var("M17_STATION__MODULE") {
            if let Some(c) = v.chars().next().filter(char::is_ascii_alphabetic) {
                self.station.module = c.to_ascii_uppercase();
            }
        }
        if let Some(v) = var("M17_NETWORK__NET_TYPE") {
            if let Ok(t) = v.parse() {
                self.network.net_type = t;
            }
        }
        if let Some(v) = var("M17_NETWORK__DESTINATION") {
            self.network.destination = v;
        }
        if let Some(v) = var("M17_AUDIO__VOICE_ONLY") {
            self.audio.voice_only = v == "true" || v == "1";
        }
        if let Some(v) = var("M17_IPC__BRIDGE_DIR") {
            self.ipc.bridge_dir = PathBuf::from(v);
        }
    }
}
