use crate::core::cluster::{DEFAULT_EPS, DEFAULT_MIN_SAMPLES};
use crate::core::duplicate::{UnknownHashPolicy, DEFAULT_PERCEPTUAL_THRESHOLD};
use crate::core::split::SplitRatios;
use crate::error::{MergeError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Every numeric knob the engine reads. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergerConfig {
    pub perceptual_threshold: u32,
    pub unknown_hash_policy: UnknownHashPolicy,
    pub cluster_eps: f64,
    pub cluster_min_samples: usize,
    pub ratios: SplitRatios,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            perceptual_threshold: DEFAULT_PERCEPTUAL_THRESHOLD,
            unknown_hash_policy: UnknownHashPolicy::default(),
            cluster_eps: DEFAULT_EPS,
            cluster_min_samples: DEFAULT_MIN_SAMPLES,
            ratios: SplitRatios::default(),
        }
    }
}

// Config files may nest everything under a `merger_config` key.
#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigFile {
    Wrapped { merger_config: MergerConfig },
    Bare(MergerConfig),
}

impl MergerConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config = match serde_json::from_str::<ConfigFile>(json)? {
            ConfigFile::Wrapped { merger_config } => merger_config,
            ConfigFile::Bare(config) => config,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config = Self::from_json(&contents)?;
        log::info!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    /// Split ratios are deliberately not checked here; the splitter copes
    /// with any values. Only the clustering radius must be a real number.
    pub fn validate(&self) -> Result<()> {
        if !self.cluster_eps.is_finite() {
            return Err(MergeError::Config {
                message: format!("cluster_eps must be finite, got {}", self.cluster_eps),
            });
        }
        Ok(())
    }
}
