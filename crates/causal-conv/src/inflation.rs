//! Conversion of 2D (image) convolution parameters into 3D (video) ones at
//! checkpoint load time.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use log::debug;

use crate::{
    descriptor::TIME_DIM,
    errors::{ConvError, Result},
    types::InflationMode,
};

/// Builds a 3D kernel of `target_shape` from a 4D `(out, in, h, w)` kernel.
///
/// `Tail` places the 2D kernel in the last temporal slice and zeroes the
/// rest, so a causal layer fed a static clip reproduces the 2D layer.
/// `Replicate` tiles it over every slice, divided by the temporal depth.
pub fn inflate_weight(
    weight_2d: &Tensor,
    target_shape: &[usize],
    dtype: DType,
    device: &Device,
    mode: InflationMode,
) -> Result<Tensor> {
    let (out_c, in_c, kh, kw) = weight_2d.dims4()?;
    let [t_out, t_in, depth, t_kh, t_kw] = match target_shape {
        &[a, b, c, d, e] => [a, b, c, d, e],
        _ => {
            return Err(ConvError::unsupported(format!(
                "inflation target must be a 5D kernel, got {target_shape:?}"
            )))
        }
    };
    if (out_c, in_c, kh, kw) != (t_out, t_in, t_kh, t_kw) {
        return Err(ConvError::ShapeMismatch {
            name: "inflated weight".into(),
            expected: vec![t_out, t_in, t_kh, t_kw],
            actual: weight_2d.dims().to_vec(),
        });
    }
    let weight_2d = weight_2d.to_device(device)?.to_dtype(dtype)?.unsqueeze(TIME_DIM)?;

    match mode {
        InflationMode::Replicate => {
            let tiled = weight_2d.repeat((1, 1, depth, 1, 1))?;
            Ok((tiled / depth as f64)?)
        }
        InflationMode::Tail => {
            if depth == 1 {
                return Ok(weight_2d);
            }
            let zeros = Tensor::zeros((out_c, in_c, depth - 1, kh, kw), dtype, device)?;
            Ok(Tensor::cat(&[&zeros, &weight_2d], TIME_DIM)?)
        }
        InflationMode::None => Err(ConvError::unsupported(
            "weight inflation requested with inflation mode `none`",
        )),
    }
}

/// Biases are shared between the 2D and 3D layer; copied after a shape check.
pub fn inflate_bias(bias_2d: &Tensor, target_shape: &[usize], dtype: DType, device: &Device) -> Result<Tensor> {
    if bias_2d.dims() != target_shape {
        return Err(ConvError::ShapeMismatch {
            name: "inflated bias".into(),
            expected: target_shape.to_vec(),
            actual: bias_2d.dims().to_vec(),
        });
    }
    Ok(bias_2d.to_device(device)?.to_dtype(dtype)?)
}

/// Rewrites `{prefix}weight` and `{prefix}bias` in `store` in place when the
/// stored weight comes from a 2D convolution.
///
/// A weight that is already 5D marks a native checkpoint and leaves both
/// entries untouched. Missing entries are left for the loader to report.
pub fn modify_state_dict(
    store: &mut HashMap<String, Tensor>,
    prefix: &str,
    weight_shape: &[usize],
    bias_shape: Option<&[usize]>,
    dtype: DType,
    device: &Device,
    mode: InflationMode,
) -> Result<()> {
    let weight_name = format!("{prefix}weight");
    let bias_name = format!("{prefix}bias");

    if let Some(weight_2d) = store.get(&weight_name) {
        if weight_2d.rank() != 4 {
            return Ok(());
        }
        let weight_3d = inflate_weight(weight_2d, weight_shape, dtype, device, mode)?;
        debug!("inflated {weight_name} {:?} -> {:?} ({mode:?})", weight_2d.dims(), weight_3d.dims());
        store.insert(weight_name, weight_3d);
    }

    if let (Some(bias_2d), Some(bias_shape)) = (store.get(&bias_name), bias_shape) {
        if bias_2d.rank() == 1 {
            let bias_3d = inflate_bias(bias_2d, bias_shape, dtype, device)?;
            store.insert(bias_name, bias_3d);
        }
    }
    Ok(())
}
