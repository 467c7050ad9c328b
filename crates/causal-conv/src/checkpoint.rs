//! Checkpoint parameter store and state-dict loading for the causal layer.

use std::{collections::HashMap, path::Path};

use candle_core::{safetensors, Device, Tensor};
use log::{debug, info};

use crate::{
    errors::{ConvError, Result},
    inflation::modify_state_dict,
    layer::InflatedCausalConv3d,
    types::InflationMode,
};

/// Layer-qualified parameter name to tensor.
pub type ParameterStore = HashMap<String, Tensor>;

pub fn load_parameter_store(path: impl AsRef<Path>, device: &Device) -> Result<ParameterStore> {
    let path = path.as_ref();
    let store = safetensors::load(path, device)?;
    info!("loaded {} tensors from {}", store.len(), path.display());
    Ok(store)
}

pub fn save_parameter_store(store: &ParameterStore, path: impl AsRef<Path>) -> Result<()> {
    safetensors::save(store, path)?;
    Ok(())
}

/// Keys a non-strict load skipped over.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub missing_keys: Vec<String>,
    pub unexpected_keys: Vec<String>,
}

impl LoadReport {
    pub fn is_clean(&self) -> bool {
        self.missing_keys.is_empty() && self.unexpected_keys.is_empty()
    }
}

impl InflatedCausalConv3d {
    /// Loads `{prefix}weight` and `{prefix}bias` from `store`.
    ///
    /// Image checkpoints are inflated first unless the inflation mode is
    /// `none`. A shape mismatch is always fatal. `strict` turns missing or
    /// unexpected keys into errors, and only applies when no inflation is
    /// configured.
    pub fn load_state_dict(
        &mut self,
        store: &mut ParameterStore,
        prefix: &str,
        strict: bool,
    ) -> Result<LoadReport> {
        let dtype = self.weight().dtype();
        let device = self.weight().device().clone();
        let weight_shape = self.weight().dims().to_vec();
        let bias_shape = self.bias().map(|b| b.dims().to_vec());
        let mode = self.inflation_mode();

        if mode != InflationMode::None {
            modify_state_dict(
                store,
                prefix,
                &weight_shape,
                bias_shape.as_deref(),
                dtype,
                &device,
                mode,
            )?;
        }

        let weight_name = format!("{prefix}weight");
        let bias_name = format!("{prefix}bias");
        let mut report = LoadReport::default();

        let weight = store.get(&weight_name);
        if let Some(weight) = weight {
            check_shape(&weight_name, &weight_shape, weight)?;
        } else {
            report.missing_keys.push(weight_name.clone());
        }
        let bias = match &bias_shape {
            Some(bias_shape) => {
                let bias = store.get(&bias_name);
                if let Some(bias) = bias {
                    check_shape(&bias_name, bias_shape, bias)?;
                } else {
                    report.missing_keys.push(bias_name.clone());
                }
                bias
            }
            None => None,
        };

        if let Some(weight) = weight {
            let weight = weight.to_device(&device)?.to_dtype(dtype)?;
            self.conv_mut().set_weight(weight);
        }
        if let Some(bias) = bias {
            let bias = bias.to_device(&device)?.to_dtype(dtype)?;
            self.conv_mut().set_bias(Some(bias));
        }

        let own = |key: &str| key == weight_name || (bias_shape.is_some() && key == bias_name);
        let mut unexpected = store
            .keys()
            .filter(|key| key.starts_with(prefix) && !own(key.as_str()))
            .filter(|key| !key[prefix.len()..].contains('.'))
            .cloned()
            .collect::<Vec<_>>();
        unexpected.sort();
        report.unexpected_keys = unexpected;

        debug!("load_state_dict({prefix}): {report:?}");
        if strict && mode == InflationMode::None {
            if !report.missing_keys.is_empty() {
                return Err(ConvError::MissingKeys(report.missing_keys));
            }
            if !report.unexpected_keys.is_empty() {
                return Err(ConvError::UnexpectedKeys(report.unexpected_keys));
            }
        }
        Ok(report)
    }
}

fn check_shape(name: &str, expected: &[usize], tensor: &Tensor) -> Result<()> {
    if tensor.dims() != expected {
        return Err(ConvError::ShapeMismatch {
            name: name.to_string(),
            expected: expected.to_vec(),
            actual: tensor.dims().to_vec(),
        });
    }
    Ok(())
}
