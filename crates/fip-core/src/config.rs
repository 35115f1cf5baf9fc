//! Configuration system for the FIP controller.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FIPD_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/fipd/config.toml
//!   3. ~/.config/fipd/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FipConfig {
    pub controller: ControllerConfig,
    pub fabric: FabricConfig,
    pub vn2vn: Vn2VnConfig,
    pub network: NetworkConfig,
}

/// Operating mode chosen at init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FipMode {
    /// Use FIP if any FIP frame is seen, otherwise fall back to non-FIP.
    Auto,
    /// Fabric-attached, FIP only.
    Fabric,
    /// Pre-FIP FCoE: no discovery, FC-MAP addressing.
    NonFip,
    /// Peer-to-peer address claim without a Forwarder.
    Vn2Vn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub mode: FipMode,
    /// Port name. 0 = take it from the FC port.
    pub wwpn: u64,
    /// Node name. 0 = take it from the FC port.
    pub wwnn: u64,
    /// Max FCoE frame size announced in solicitations and claims.
    pub max_frame_size: u16,
    /// 802.1Q priority for FIP frames. None = untagged.
    pub priority_tag: Option<u8>,
    /// Offer server-provided MAC addressing besides FPMA.
    pub spma: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Max Forwarders tracked at once.
    pub fcf_limit: usize,
    /// Wait after the first usable FCF before selecting.
    pub start_delay_ms: u64,
    /// Minimum interval between multicast solicitations.
    pub solicit_tov_ms: u64,
    /// Keep-alive period assumed until an FCF advertises one.
    pub default_fka_ms: u64,
    /// Advertised periods below this are ignored.
    pub min_fka_ms: u64,
    /// Per-virtual-port keep-alive period.
    pub vn_ka_period_ms: u64,
    /// FLOGIs dropped in Auto mode before going non-FIP.
    pub flogi_fallback: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Vn2VnConfig {
    /// Upper bound of the random wait before probing, and probe spacing.
    pub probe_wait_ms: u64,
    /// Announcement window after claiming.
    pub announce_wait_ms: u64,
    pub beacon_interval_ms: u64,
    /// Random jitter added to each beacon interval.
    pub beacon_fuzz_ms: u64,
    /// Restart delay once `rate_limit_count` restarts have happened.
    pub rate_limit_interval_ms: u64,
    pub rate_limit_count: u32,
    /// Remote-port login failures tolerated before logging the peer off.
    pub login_limit: u32,
    /// Max peers tracked at once.
    pub peer_limit: usize,
    /// Use the all-P2P group instead of all-VN2VN.
    pub point_to_point: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Network interface name. Empty = first CLI argument.
    pub interface: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode: FipMode::Auto,
            wwpn: 0,
            wwnn: 0,
            max_frame_size: 2158,
            priority_tag: Some(3),
            spma: false,
        }
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            fcf_limit: 20,
            start_delay_ms: 2000,
            solicit_tov_ms: 2000,
            default_fka_ms: 8000,
            min_fka_ms: 500,
            vn_ka_period_ms: 90_000,
            flogi_fallback: 3,
        }
    }
}

impl Default for Vn2VnConfig {
    fn default() -> Self {
        Self {
            probe_wait_ms: 100,
            announce_wait_ms: 400,
            beacon_interval_ms: 8000,
            beacon_fuzz_ms: 100,
            rate_limit_interval_ms: 10_000,
            rate_limit_count: 10,
            login_limit: 3,
            peer_limit: 256,
            point_to_point: false,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
        }
    }
}

// ── Durations ─────────────────────────────────────────────────────────────────

impl FabricConfig {
    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    pub fn solicit_tov(&self) -> Duration {
        Duration::from_millis(self.solicit_tov_ms)
    }

    pub fn default_fka(&self) -> Duration {
        Duration::from_millis(self.default_fka_ms)
    }

    pub fn vn_ka_period(&self) -> Duration {
        Duration::from_millis(self.vn_ka_period_ms)
    }
}

impl Vn2VnConfig {
    pub fn announce_wait(&self) -> Duration {
        Duration::from_millis(self.announce_wait_ms)
    }

    pub fn probe_wait(&self) -> Duration {
        Duration::from_millis(self.probe_wait_ms)
    }

    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.beacon_interval_ms)
    }

    /// Peers silent for longer than this are logged off (2.5 beacons).
    pub fn peer_deadline(&self) -> Duration {
        Duration::from_millis(self.beacon_interval_ms * 5 / 2)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("fipd")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// Parse a WWN given as hex, with or without colons or a 0x prefix.
pub fn parse_wwn(s: &str) -> Option<u64> {
    let cleaned: String = s
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| *c != ':')
        .collect();
    let bytes = hex::decode(&cleaned).ok()?;
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
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

impl FipConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            FipConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FIPD_CONFIG")
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
            let text = toml::to_string_pretty(&FipConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply FIPD_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("FIPD_NETWORK__INTERFACE") {
            self.network.interface = v;
        }
        if let Ok(v) = std::env::var("FIPD_CONTROLLER__MODE") {
            match v.as_str() {
                "auto" => self.controller.mode = FipMode::Auto,
                "fabric" => self.controller.mode = FipMode::Fabric,
                "nonfip" => self.controller.mode = FipMode::NonFip,
                "vn2vn" => self.controller.mode = FipMode::Vn2Vn,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("FIPD_CONTROLLER__WWPN") {
            if let Some(w) = parse_wwn(&v) {
                self.controller.wwpn = w;
            }
        }
        if let Ok(v) = std::env::var("FIPD_CONTROLLER__WWNN") {
            if let Some(w) = parse_wwn(&v) {
                self.controller.wwnn = w;
            }
        }
        if let Ok(v) = std::env::var("FIPD_VN2VN__POINT_TO_POINT") {
            self.vn2vn.point_to_point = v == "true" || v == "1";
        }
    }
}
