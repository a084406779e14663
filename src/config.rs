//! Bridge configuration.
//!
//! All fields have defaults, so an empty TOML document is a valid config.
//!
//! ```toml
//! [channel]
//! mode = "auto"            # "auto" | "shared-memory" | "message-passing"
//! segment_size = 65536
//! wait = "futex"           # "futex" | "backoff"
//!
//! [pacer]
//! target_fps = 60
//! max_delta = 0.1
//!
//! [script]
//! max_operations = 1000000
//! ```
//!
//! Priority (high → low): `FRAMEPORT_TRANSPORT` environment variable, config file, defaults.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::channel::segment::{DEFAULT_SEGMENT_SIZE, MIN_SEGMENT_SIZE};
use crate::error::ConfigError;

/// Environment variable overriding `channel.mode`.
pub const TRANSPORT_ENV: &str = "FRAMEPORT_TRANSPORT";

// =============================================================================
// Enums
// =============================================================================

/// Which transport the channel factory should build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    /// Shared memory when the host grants it, message passing otherwise.
    #[default]
    Auto,
    SharedMemory,
    MessagePassing,
}

impl FromStr for TransportMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "auto" => Ok(TransportMode::Auto),
            "shared-memory" => Ok(TransportMode::SharedMemory),
            "message-passing" => Ok(TransportMode::MessagePassing),
            other => Err(ConfigError::Invalid(format!("unknown transport mode `{other}`"))),
        }
    }
}

/// How the shared-memory transport blocks in `await_turn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitStrategy {
    /// Native wait-on-address (futex, WaitOnAddress, ulock).
    #[default]
    Futex,
    /// Spin, then yield, then short sleeps. For hosts without a native wait primitive.
    Backoff,
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub mode: TransportMode,
    /// Shared segment size in bytes.
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,
    #[serde(default)]
    pub wait: WaitStrategy,
}

fn default_segment_size() -> usize {
    DEFAULT_SEGMENT_SIZE
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Auto,
            segment_size: DEFAULT_SEGMENT_SIZE,
            wait: WaitStrategy::Futex,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacerConfig {
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
    /// Ceiling for a single frame's delta, in seconds.
    #[serde(default = "default_max_delta")]
    pub max_delta: f64,
}

fn default_target_fps() -> u32 {
    60
}

fn default_max_delta() -> f64 {
    0.1
}

impl PacerConfig {
    /// Nominal seconds between frames.
    pub fn frame_interval(&self) -> f64 {
        1.0 / self.target_fps.max(1) as f64
    }
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            target_fps: default_target_fps(),
            max_delta: default_max_delta(),
        }
    }
}

/// Sandbox limits for the script engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptLimits {
    /// Operations allowed per call into the script (stops runaway loops).
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
    #[serde(default = "default_max_call_levels")]
    pub max_call_levels: usize,
    #[serde(default = "default_max_expr_depth")]
    pub max_expr_depth: usize,
}

fn default_max_operations() -> u64 {
    1_000_000
}

fn default_max_call_levels() -> usize {
    64
}

fn default_max_expr_depth() -> usize {
    64
}

impl Default for ScriptLimits {
    fn default() -> Self {
        Self {
            max_operations: default_max_operations(),
            max_call_levels: default_max_call_levels(),
            max_expr_depth: default_max_expr_depth(),
        }
    }
}

// =============================================================================
// BridgeConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub pacer: PacerConfig,
    #[serde(default)]
    pub script: ScriptLimits,
}

impl BridgeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `FRAMEPORT_TRANSPORT` if set.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var(TRANSPORT_ENV) {
            self.channel.mode = value.parse()?;
            tracing::debug!(mode = ?self.channel.mode, "transport mode overridden from environment");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let size = self.channel.segment_size;
        if size % 4 != 0 || size < MIN_SEGMENT_SIZE {
            return Err(ConfigError::Invalid(format!(
                "channel.segment_size must be a multiple of 4 and at least {MIN_SEGMENT_SIZE}, got {size}"
            )));
        }
        if self.pacer.target_fps == 0 {
            return Err(ConfigError::Invalid("pacer.target_fps must be positive".into()));
        }
        if !(self.pacer.max_delta.is_finite() && self.pacer.max_delta > 0.0) {
            return Err(ConfigError::Invalid("pacer.max_delta must be a positive number".into()));
        }
        Ok(())
    }
}
