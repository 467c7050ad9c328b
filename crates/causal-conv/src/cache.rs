//! Per-layer storage for the trailing temporal slice of the last input.
//!
//! One slot per layer instance. The slot is overwritten by every forward call
//! that records causal memory and read by the call that follows it.

use candle_core::{Device, Tensor};

use crate::{
    descriptor::TIME_DIM,
    errors::{ConvError, Result},
    types::MemoryDevice,
};

#[derive(Debug, Clone, Default)]
pub struct BoundaryCache {
    slot: Option<Tensor>,
}

impl BoundaryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<&Tensor> {
        self.slot.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.is_none()
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }

    /// Stores `memory`, moving it to host memory when the tier says so.
    pub fn store(&mut self, memory: Option<Tensor>, device: MemoryDevice) -> Result<()> {
        self.slot = match (memory, device) {
            (Some(memory), MemoryDevice::Cpu) => Some(memory.to_device(&Device::Cpu)?),
            (memory, _) => memory,
        };
        Ok(())
    }
}

/// Prepends causal context along time.
///
/// With `memory`, it is moved to the input's device and dtype and
/// concatenated in front. Without it, the first frame is duplicated `times`
/// times so the earliest outputs see a deterministic boundary.
pub fn extend_head(tensor: &Tensor, times: usize, memory: Option<&Tensor>) -> Result<Tensor> {
    if let Some(memory) = memory {
        let memory = memory
            .to_device(tensor.device())?
            .to_dtype(tensor.dtype())?;
        return Ok(Tensor::cat(&[&memory, tensor], TIME_DIM)?);
    }
    if times == 0 {
        return Ok(tensor.clone());
    }
    let head = repeat_first_frame(tensor, times)?;
    Ok(Tensor::cat(&[&head, tensor], TIME_DIM)?)
}

/// Removes the frames that [`extend_head`]-style duplication introduced once
/// they have been upsampled: keeps the first frame and drops the next `times`.
/// Only rank 0 holds the head of the sequence; other ranks pass through.
pub fn remove_head(tensor: &Tensor, times: usize, rank: usize) -> Result<Tensor> {
    if times == 0 || rank > 0 {
        return Ok(tensor.clone());
    }
    let frames = tensor.dim(TIME_DIM)?;
    if frames < times + 1 {
        return Err(ConvError::precondition(format!(
            "cannot remove {times} head frames from {frames}"
        )));
    }
    let first = tensor.narrow(TIME_DIM, 0, 1)?;
    let rest = tensor.narrow(TIME_DIM, times + 1, frames - times - 1)?;
    Ok(Tensor::cat(&[&first, &rest], TIME_DIM)?)
}

/// The first frame tiled `times` times along time.
pub(crate) fn repeat_first_frame(tensor: &Tensor, times: usize) -> Result<Tensor> {
    let mut repeats = vec![1usize; tensor.rank()];
    repeats[TIME_DIM] = times;
    Ok(tensor.narrow(TIME_DIM, 0, 1)?.repeat(repeats.as_slice())?)
}

/// Trailing `len` frames along time.
pub(crate) fn tail_frames(tensor: &Tensor, len: usize) -> Result<Tensor> {
    let frames = tensor.dim(TIME_DIM)?;
    if len > frames {
        return Err(ConvError::precondition(format!(
            "boundary cache of {len} frames exceeds the {frames} available"
        )));
    }
    Ok(tensor.narrow(TIME_DIM, frames - len, len)?.contiguous()?)
}
