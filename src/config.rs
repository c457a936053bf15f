//! Store configuration

use crate::container::WriteMode;
use crate::error::{Result, VdfError};
use crate::store::ContainerFormat;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Runtime settings of a dataset handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Region cache size in MB
    pub cache_mb: usize,
    /// Share of the cache a single region may use
    pub cache_fraction: f64,
    /// Fall back to a coarser level when the requested one is absent
    pub allow_coarser: bool,
    /// Write coalescing buffer capacity in bytes
    pub coalesce_buffer_bytes: usize,
    pub write_mode: WriteMode,
    pub format: ContainerFormat,
    /// Log a warning the first time a (variable, level, timestep) is missing
    pub warn_if_missing: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_mb: 512,
            cache_fraction: 0.75,
            allow_coarser: true,
            coalesce_buffer_bytes: 4 * 1024 * 1024,
            write_mode: WriteMode::Independent,
            format: ContainerFormat::Bricked,
            warn_if_missing: true,
        }
    }
}

impl StoreConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            VdfError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: StoreConfig = serde_json::from_str(&text)
            .map_err(|e| VdfError::Configuration(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `VDF_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for the `VDF_*` keys
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = lookup("VDF_CACHE_MB") {
            config.cache_mb = parse("VDF_CACHE_MB", &v)?;
        }
        if let Some(v) = lookup("VDF_CACHE_FRACTION") {
            config.cache_fraction = parse("VDF_CACHE_FRACTION", &v)?;
        }
        if let Some(v) = lookup("VDF_ALLOW_COARSER") {
            config.allow_coarser = parse_bool("VDF_ALLOW_COARSER", &v)?;
        }
        if let Some(v) = lookup("VDF_COALESCE_BYTES") {
            config.coalesce_buffer_bytes = parse("VDF_COALESCE_BYTES", &v)?;
        }
        if let Some(v) = lookup("VDF_COLLECTIVE") {
            config.write_mode = if parse_bool("VDF_COLLECTIVE", &v)? {
                WriteMode::Collective
            } else {
                WriteMode::Independent
            };
        }
        if let Some(v) = lookup("VDF_FORMAT") {
            config.format = v.parse().map_err(VdfError::Configuration)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_mb == 0 {
            return Err(VdfError::Configuration("cache_mb must be positive".into()));
        }
        if !(self.cache_fraction > 0.0 && self.cache_fraction <= 1.0) {
            return Err(VdfError::Configuration(format!(
                "cache_fraction must be in (0, 1], got {}",
                self.cache_fraction
            )));
        }
        if self.coalesce_buffer_bytes < 8 {
            return Err(VdfError::Configuration(format!(
                "coalesce buffer of {} bytes cannot hold a sample",
                self.coalesce_buffer_bytes
            )));
        }
        Ok(())
    }

    /// Largest region a single request may occupy, in MB
    pub fn region_budget_mb(&self) -> f64 {
        self.cache_mb as f64 * self.cache_fraction
    }

    pub fn cache_bytes(&self) -> usize {
        self.cache_mb * 1024 * 1024
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| VdfError::Configuration(format!("{}={}: {}", key, value, e)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(VdfError::Configuration(format!(
            "{}={}: expected a boolean",
            key, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let c = StoreConfig::default();
        c.validate().unwrap();
        assert_eq!(c.region_budget_mb(), 384.0);
        assert_eq!(c.format, ContainerFormat::Bricked);
    }

    #[test]
    fn test_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("VDF_CACHE_MB", "64"),
            ("VDF_COLLECTIVE", "yes"),
            ("VDF_FORMAT", "slab"),
            ("VDF_ALLOW_COARSER", "0"),
        ]
        .into_iter()
        .collect();
        let c = StoreConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(c.cache_mb, 64);
        assert_eq!(c.write_mode, WriteMode::Collective);
        assert_eq!(c.format, ContainerFormat::Slab);
        assert!(!c.allow_coarser);

        let bad = StoreConfig::from_lookup(|k| (k == "VDF_CACHE_FRACTION").then(|| "1.5".into()));
        assert!(matches!(bad, Err(VdfError::Configuration(_))));
        let bad = StoreConfig::from_lookup(|k| (k == "VDF_CACHE_MB").then(|| "lots".into()));
        assert!(bad.is_err());
    }

    #[test]
    fn test_json_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vdf.json");
        std::fs::write(&path, r#"{ "cache_mb": 128, "format": "Slab" }"#).unwrap();
        let c = StoreConfig::from_json_file(&path).unwrap();
        assert_eq!(c.cache_mb, 128);
        assert_eq!(c.format, ContainerFormat::Slab);
        assert_eq!(c.cache_fraction, 0.75);
        assert!(StoreConfig::from_json_file(dir.path().join("absent.json")).is_err());
    }
}
