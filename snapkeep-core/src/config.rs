//! Configuration module for the snapshot root, download lifetime and
//! automatic pruning.
//!
//! Values come from serde-compatible sources or from `SNAPKEEP_*`
//! environment variables. Durations use the compact `1h30m` notation.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{Result, SnapkeepError};

pub const ENV_SNAPSHOT_DIR: &str = "SNAPKEEP_SNAPSHOT_DIR";
pub const ENV_DOWNLOAD_LIFETIME: &str = "SNAPKEEP_DOWNLOAD_LIFETIME";
pub const ENV_AUTOPRUNE_ENABLE: &str = "SNAPKEEP_AUTOPRUNE_ENABLE";
pub const ENV_AUTOPRUNE_INTERVAL: &str = "SNAPKEEP_AUTOPRUNE_INTERVAL";
pub const ENV_AUTOPRUNE_KEEP_WITHIN: &str = "SNAPKEEP_AUTOPRUNE_KEEP_WITHIN";

/// Settings for periodic pruning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutopruneConfig {
    /// Remove snapshots in regular intervals
    pub enabled: bool,
    /// How often to prune; randomized by a small amount
    #[serde(with = "duration_text")]
    pub interval: Duration,
    /// Keep snapshots younger than this
    #[serde(with = "duration_text")]
    pub keep_within: Duration,
}

impl Default for AutopruneConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::minutes(15),
            keep_within: Duration::hours(1),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapkeepConfig {
    /// Base directory holding one directory per snapshot
    pub snapshot_dir: PathBuf,
    /// How long a download session stays queryable after it started
    #[serde(with = "duration_text")]
    pub download_lifetime: Duration,
    #[serde(default)]
    pub autoprune: AutopruneConfig,
}

impl SnapkeepConfig {
    /// Create a configuration with defaults for everything but the snapshot root
    pub fn new<P: Into<PathBuf>>(snapshot_dir: P) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            download_lifetime: Duration::minutes(15),
            autoprune: AutopruneConfig::default(),
        }
    }

    /// Read the configuration from `SNAPKEEP_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    ///
    /// Unset and empty variables fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let mut config = Self::new(get(ENV_SNAPSHOT_DIR).unwrap_or_default());

        if let Some(raw) = get(ENV_DOWNLOAD_LIFETIME) {
            config.download_lifetime = parse_env_duration(ENV_DOWNLOAD_LIFETIME, &raw)?;
        }
        if let Some(raw) = get(ENV_AUTOPRUNE_ENABLE) {
            config.autoprune.enabled = parse_bool(&raw).ok_or_else(|| {
                SnapkeepError::validation(format!(
                    "parsing {ENV_AUTOPRUNE_ENABLE} environment variable: invalid boolean {raw:?}"
                ))
            })?;
        }
        if let Some(raw) = get(ENV_AUTOPRUNE_INTERVAL) {
            config.autoprune.interval = parse_env_duration(ENV_AUTOPRUNE_INTERVAL, &raw)?;
        }
        if let Some(raw) = get(ENV_AUTOPRUNE_KEEP_WITHIN) {
            config.autoprune.keep_within = parse_env_duration(ENV_AUTOPRUNE_KEEP_WITHIN, &raw)?;
        }

        Ok(config)
    }

    /// Download lifetime as a timer duration
    pub fn download_lifetime_std(&self) -> Result<std::time::Duration> {
        to_std(self.download_lifetime, "download_lifetime")
    }

    /// Autoprune interval as a timer duration
    pub fn autoprune_interval_std(&self) -> Result<std::time::Duration> {
        to_std(self.autoprune.interval, "autoprune interval")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.snapshot_dir.as_os_str().is_empty() {
            return Err(SnapkeepError::validation("snapshot_dir is required"));
        }
        if self.download_lifetime <= Duration::zero() {
            return Err(SnapkeepError::validation(
                "download_lifetime must be larger than zero",
            ));
        }
        if self.autoprune.interval <= Duration::zero() {
            return Err(SnapkeepError::validation(
                "autoprune interval must be larger than zero",
            ));
        }
        if self.autoprune.keep_within < Duration::zero() {
            return Err(SnapkeepError::validation(
                "autoprune keep_within must be larger than or equal to zero",
            ));
        }
        Ok(())
    }
}

fn to_std(d: Duration, what: &str) -> Result<std::time::Duration> {
    d.to_std()
        .map_err(|_| SnapkeepError::validation(format!("{what} must not be negative")))
}

fn parse_env_duration(key: &str, raw: &str) -> Result<Duration> {
    parse_duration(raw).map_err(|e| {
        SnapkeepError::validation(format!("parsing {key} environment variable: {e}"))
    })
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" | "on" => Some(true),
        "0" | "f" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a duration such as `90s`, `1h30m`, `1d12h` or `-5m`.
///
/// Units: `d`, `h`, `m`, `s`, `ms`. A bare `0` is accepted.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let invalid = || SnapkeepError::validation(format!("invalid duration: {s:?}"));

    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };

    if body == "0" {
        return Ok(Duration::zero());
    }
    if body.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::zero();
    let mut rest = body;

    while !rest.is_empty() {
        let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            return Err(invalid());
        }
        let value: i64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.bytes().take_while(|b| b.is_ascii_alphabetic()).count();
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let part = match unit {
            "d" => Duration::try_days(value),
            "h" => Duration::try_hours(value),
            "m" => Duration::try_minutes(value),
            "s" => Duration::try_seconds(value),
            "ms" => Duration::try_milliseconds(value),
            "" => {
                return Err(SnapkeepError::validation(format!(
                    "missing unit in duration {s:?}"
                )))
            }
            other => {
                return Err(SnapkeepError::validation(format!(
                    "unknown unit {other:?} in duration {s:?}"
                )))
            }
        };

        total = part
            .and_then(|p| total.checked_add(&p))
            .ok_or_else(invalid)?;
    }

    Ok(if negative { -total } else { total })
}

/// Render a duration in the notation accepted by [`parse_duration`].
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }

    let mut out = String::new();
    if d < Duration::zero() {
        out.push('-');
    }

    let mut ms = d.num_milliseconds().unsigned_abs();
    for (unit, size) in [("d", 86_400_000u64), ("h", 3_600_000), ("m", 60_000), ("s", 1_000), ("ms", 1)] {
        if ms >= size {
            out.push_str(&format!("{}{unit}", ms / size));
            ms %= size;
        }
    }
    out
}

mod duration_text {
    use super::{format_duration, parse_duration};
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
