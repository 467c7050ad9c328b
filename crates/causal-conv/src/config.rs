use std::{fs, path::Path};

use layers::{ChunkedNorm, MemoryLimit, NormLayer};
use serde::Deserialize;

use crate::{
    errors::{ConvError, Result},
    layer::InflatedCausalConv3d,
    types::MemoryDevice,
};

/// Where a layer keeps its boundary cache between calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTier {
    #[default]
    Same,
    Cpu,
    None,
}

impl MemoryTier {
    pub fn device(self) -> Option<MemoryDevice> {
        match self {
            Self::Same => Some(MemoryDevice::Same),
            Self::Cpu => Some(MemoryDevice::Cpu),
            Self::None => None,
        }
    }
}

/// Memory settings the surrounding model pushes into its causal layers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    /// Per-layer convolution ceiling; absent means unlimited.
    #[serde(default)]
    pub memory_limit_gib: Option<f64>,
    #[serde(default)]
    pub memory_device: MemoryTier,
    /// Ceiling above which group norm is chunked.
    #[serde(default)]
    pub norm_limit_gib: Option<f64>,
    #[serde(default)]
    pub norm_chunks: Option<usize>,
}

impl RuntimeConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: RuntimeConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|err| ConvError::ConfigFormat(err.to_string()))?,
            Some("toml") | Some("tml") | None => {
                toml::from_str(&contents).map_err(|err| ConvError::ConfigFormat(err.to_string()))?
            }
            Some(other) => {
                return Err(ConvError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Some(limit) = self.memory_limit_gib {
            if limit <= 0.0 {
                errors.push("memory_limit_gib must be greater than 0".to_string());
            }
        }
        if let Some(limit) = self.norm_limit_gib {
            if limit <= 0.0 {
                errors.push("norm_limit_gib must be greater than 0".to_string());
            }
        }
        if self.norm_chunks == Some(0) {
            errors.push("norm_chunks must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConvError::Validation(errors))
        }
    }

    pub fn memory_limit(&self) -> MemoryLimit {
        self.memory_limit_gib
            .map_or_else(MemoryLimit::unlimited, MemoryLimit::from_gib)
    }

    pub fn norm_limit(&self) -> MemoryLimit {
        self.norm_limit_gib
            .map_or_else(MemoryLimit::unlimited, MemoryLimit::from_gib)
    }

    pub fn apply(&self, layer: &mut InflatedCausalConv3d) {
        layer.set_memory_limit(self.memory_limit());
        layer.set_memory_device(self.memory_device.device());
    }

    pub fn chunked_norm(&self, norm: impl Into<NormLayer>) -> ChunkedNorm {
        let chunked = ChunkedNorm::new(norm).with_limit(self.norm_limit());
        match self.norm_chunks {
            Some(num_chunks) => chunked.with_num_chunks(num_chunks),
            None => chunked,
        }
    }
}
