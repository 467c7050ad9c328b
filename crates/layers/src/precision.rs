//! Precision policy used by the normalisation layers.
//!
//! Activations may arrive in `f16`/`bf16` to halve the footprint of large video
//! tensors, but statistics (mean, variance) are always reduced in at least
//! `f32`. [`PrecisionPolicy`] captures both dtypes so every normalisation path
//! promotes and demotes the same way.

use candle_core::{DType, Result, Tensor};

/// Describes the storage dtype of a tensor and the dtype used for reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Builds a policy for activations stored in `storage`.
    pub fn for_activation(storage: DType) -> Self {
        let reduction = match storage {
            DType::F64 => DType::F64,
            _ => DType::F32,
        };
        Self { storage, reduction }
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Casts a tensor to the reduction dtype for statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }

    /// Comparison tolerance for results stored in the storage dtype.
    pub fn tolerance(&self) -> f32 {
        match self.storage {
            DType::BF16 => 2e-2,
            DType::F16 => 5e-3,
            DType::F32 => 1e-5,
            DType::F64 => 1e-7,
            _ => 0.0,
        }
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
