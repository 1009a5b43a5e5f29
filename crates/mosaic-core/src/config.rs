//! Configuration resolution for Mosaic.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`$XDG_CONFIG_HOME/mosaic/config.toml`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! The resolved [`Config`] is immutable once handed to the engine; a new
//! configuration means a new engine instance.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete Mosaic configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub placement: PlacementConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub patterns: PatternsConfig,
    #[serde(default)]
    pub voting: VotingConfig,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

/// Daemon-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    pub addr: SocketAddr,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 7420)),
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Placement policy knobs shared by the allocator and session manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlacementConfig {
    pub strategy: StrategyKind,
    /// Devices whose post-placement utilization would exceed this percentage
    /// are not considered. `None` disables the check.
    pub vram_threshold_percent: Option<f64>,
    /// When `false`, a device hosting any model is never chosen for another.
    pub allow_colocation: bool,
    /// Evict idle placements when nothing fits.
    pub auto_unload: bool,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Auto,
            vram_threshold_percent: None,
            allow_colocation: true,
            auto_unload: true,
        }
    }
}

/// Placement strategy name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Largest free capacity first.
    #[default]
    Auto,
    /// Rotate through sufficient devices.
    RoundRobin,
    /// Fill the lowest-indexed device first.
    Pack,
    /// Lowest utilization first.
    Spread,
    /// Pinned device only.
    Manual,
}

impl StrategyKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::RoundRobin => "round_robin",
            Self::Pack => "pack",
            Self::Spread => "spread",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(Self::Auto),
            "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "pack" => Ok(Self::Pack),
            "spread" => Ok(Self::Spread),
            "manual" => Ok(Self::Manual),
            other => Err(Error::Config(format!("unknown placement strategy: {other}"))),
        }
    }
}

/// Multi-model execution topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Sequential,
    Ensemble,
    Voting,
}

impl PatternKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Ensemble => "ensemble",
            Self::Voting => "voting",
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One physical device as configured (or discovered).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    pub id: String,
    /// Total capacity in MiB.
    pub total_capacity: u64,
    /// Capacity held back from placement (driver, display, headroom).
    #[serde(default)]
    pub reserved_capacity: u64,
}

/// Per-pattern timeouts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PatternTimeouts {
    /// Deadline for a single backend call. `None` means unbounded.
    pub branch_timeout_ms: Option<u64>,
    /// Deadline for the whole request. `None` means unbounded.
    pub request_timeout_ms: Option<u64>,
}

impl Default for PatternTimeouts {
    fn default() -> Self {
        Self {
            branch_timeout_ms: Some(60_000),
            request_timeout_ms: None,
        }
    }
}

impl PatternTimeouts {
    pub fn branch_timeout(&self) -> Option<Duration> {
        self.branch_timeout_ms.map(Duration::from_millis)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

/// Timeouts for each pattern.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct PatternsConfig {
    pub sequential: PatternTimeouts,
    pub ensemble: PatternTimeouts,
    pub voting: PatternTimeouts,
}

impl PatternsConfig {
    pub const fn timeouts(&self, kind: PatternKind) -> PatternTimeouts {
        match kind {
            PatternKind::Sequential => self.sequential,
            PatternKind::Ensemble => self.ensemble,
            PatternKind::Voting => self.voting,
        }
    }
}

/// How a voting branch's output is reduced to a comparable answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ExtractionRule {
    /// Byte-for-byte comparison.
    Exact,
    /// Leading/trailing whitespace removed.
    Trimmed,
    /// Trimmed, inner whitespace collapsed, lowercased.
    #[default]
    Normalized,
    /// First non-empty line, then normalized.
    FirstLine,
    /// Capture group of a regex, then normalized. No match means no vote.
    Regex {
        pattern: String,
        #[serde(default = "default_regex_group")]
        group: usize,
    },
}

const fn default_regex_group() -> usize {
    1
}

/// Voting configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct VotingConfig {
    pub extraction: ExtractionRule,
}

/// A model known to the catalogue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelConfig {
    pub id: String,
    /// Estimated capacity requirement in MiB.
    pub capacity: u64,
    #[serde(default)]
    pub pinned_device: Option<String>,
    /// Name of the registered backend serving this model.
    #[serde(default = "default_backend")]
    pub backend: String,
}

fn default_backend() -> String {
    "echo".to_string()
}

impl Config {
    /// Reject configurations the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if let Some(pct) = self.placement.vram_threshold_percent
            && !(pct > 0.0 && pct <= 100.0)
        {
            return Err(Error::Config(format!(
                "vram_threshold_percent must be in (0, 100], got {pct}"
            )));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.is_empty() {
                return Err(Error::Config("device id must not be empty".to_string()));
            }
            if !seen.insert(device.id.as_str()) {
                return Err(Error::Config(format!("duplicate device id: {}", device.id)));
            }
            if device.reserved_capacity > device.total_capacity {
                return Err(Error::Config(format!(
                    "device {}: reserved_capacity {} exceeds total_capacity {}",
                    device.id, device.reserved_capacity, device.total_capacity
                )));
            }
        }

        let mut models = HashSet::new();
        for model in &self.models {
            if !models.insert(model.id.as_str()) {
                return Err(Error::Config(format!("duplicate model id: {}", model.id)));
            }
            if model.capacity == 0 {
                return Err(Error::Config(format!(
                    "model {}: capacity must be positive",
                    model.id
                )));
            }
            if let Some(pin) = &model.pinned_device
                && !seen.contains(pin.as_str())
            {
                return Err(Error::Config(format!(
                    "model {} pinned to unknown device {pin}",
                    model.id
                )));
            }
        }

        if let ExtractionRule::Regex { pattern, .. } = &self.voting.extraction
            && pattern.is_empty()
        {
            return Err(Error::Config("voting regex must not be empty".to_string()));
        }

        Ok(())
    }

    /// Look up a catalogue entry.
    pub fn model(&self, id: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.id == id)
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(path) = explicit {
        let overlay = load_config_file(path)?;
        merge_config(&mut config, overlay);
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("mosaic").join("config.toml"))
}

/// Parse a config file; `.json` files are read as JSON, everything else as TOML.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    if is_json {
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(toml::from_str(&content)?)
    }
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.daemon = overlay.daemon;
    base.placement = overlay.placement;
    base.patterns = overlay.patterns;
    base.voting = overlay.voting;

    // Device and model tables are replaced wholesale, never interleaved.
    if !overlay.devices.is_empty() {
        base.devices = overlay.devices;
    }
    if !overlay.models.is_empty() {
        base.models = overlay.models;
    }
}

/// Apply `MOSAIC_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("MOSAIC_STRATEGY") {
        config.placement.strategy = val.parse()?;
    }
    if let Some(val) = lookup("MOSAIC_VRAM_THRESHOLD") {
        let pct = val
            .parse()
            .map_err(|_| Error::Config(format!("MOSAIC_VRAM_THRESHOLD: not a number: {val}")))?;
        config.placement.vram_threshold_percent = Some(pct);
    }
    if let Some(val) = lookup("MOSAIC_ALLOW_COLOCATION") {
        config.placement.allow_colocation = parse_flag("MOSAIC_ALLOW_COLOCATION", &val)?;
    }
    if let Some(val) = lookup("MOSAIC_AUTO_UNLOAD") {
        config.placement.auto_unload = parse_flag("MOSAIC_AUTO_UNLOAD", &val)?;
    }
    if let Some(val) = lookup("MOSAIC_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    Ok(())
}

fn parse_flag(name: &str, val: &str) -> Result<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{name}: expected a boolean, got {val}"))),
    }
}
