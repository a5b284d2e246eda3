use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::spatial::DEFAULT_CELL_SIZE;

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "StoreConfig::default_flush_interval_ticks")]
    pub flush_interval_ticks: u64,
    #[serde(default = "StoreConfig::default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComponentsConfig {
    #[serde(default = "ComponentsConfig::default_reconcile_interval_ticks")]
    pub reconcile_interval_ticks: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpatialConfig {
    #[serde(default = "SpatialConfig::default_cell_size")]
    pub cell_size: f64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ScriptsConfig {
    #[serde(default)]
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AddonConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub components: ComponentsConfig,
    #[serde(default)]
    pub spatial: SpatialConfig,
    #[serde(default)]
    pub scripts: ScriptsConfig,
}

impl StoreConfig {
    const fn default_flush_interval_ticks() -> u64 {
        20
    }

    fn default_data_dir() -> PathBuf {
        PathBuf::from("addon_data")
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { flush_interval_ticks: Self::default_flush_interval_ticks(), data_dir: Self::default_data_dir() }
    }
}

impl ComponentsConfig {
    const fn default_reconcile_interval_ticks() -> u64 {
        20
    }
}

impl Default for ComponentsConfig {
    fn default() -> Self {
        Self { reconcile_interval_ticks: Self::default_reconcile_interval_ticks() }
    }
}

impl SpatialConfig {
    const fn default_cell_size() -> f64 {
        DEFAULT_CELL_SIZE
    }
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self { cell_size: Self::default_cell_size() }
    }
}

impl AddonConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = Self::from_json(&bytes).with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let cfg: Self = serde_json::from_slice(bytes)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                log::warn!("[config] load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    /// Rejects values the runtime cannot schedule or index with.
    pub fn validate(&self) -> Result<()> {
        if self.store.flush_interval_ticks == 0 {
            anyhow::bail!("store.flush_interval_ticks must be at least 1");
        }
        if self.components.reconcile_interval_ticks == 0 {
            anyhow::bail!("components.reconcile_interval_ticks must be at least 1");
        }
        if !self.spatial.cell_size.is_finite() || self.spatial.cell_size <= 0.0 {
            anyhow::bail!("spatial.cell_size must be positive and finite, got {}", self.spatial.cell_size);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg = AddonConfig::from_json(br#"{ "store": { "data_dir": "saves" } }"#).expect("parse");
        assert_eq!(cfg.store.data_dir, PathBuf::from("saves"));
        assert_eq!(cfg.store.flush_interval_ticks, 20);
        assert_eq!(cfg.components.reconcile_interval_ticks, 20);
        assert_eq!(cfg.spatial.cell_size, DEFAULT_CELL_SIZE);
        assert!(cfg.scripts.paths.is_empty());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let err = AddonConfig::from_json(br#"{ "store": { "flush_interval_ticks": 0 } }"#).unwrap_err();
        assert!(err.to_string().contains("flush_interval_ticks"));
        assert!(AddonConfig::from_json(br#"{ "spatial": { "cell_size": -1.0 } }"#).is_err());
    }

    #[test]
    fn load_reads_file_and_load_or_default_recovers() {
        let mut file = NamedTempFile::new().expect("temp config");
        write!(file, r#"{{ "scripts": {{ "paths": ["a.rhai", "b.rhai"] }}, "spatial": {{ "cell_size": 4.0 }} }}"#)
            .expect("write config");
        let cfg = AddonConfig::load(file.path()).expect("load");
        assert_eq!(cfg.scripts.paths.len(), 2);
        assert_eq!(cfg.spatial.cell_size, 4.0);

        let fallback = AddonConfig::load_or_default(file.path().with_extension("missing"));
        assert_eq!(fallback.store.flush_interval_ticks, 20);
    }
}
