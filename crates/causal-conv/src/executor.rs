//! Memory-bounded execution of a causal 3D convolution.
//!
//! The executor estimates the footprint of the fully materialised (cache
//! prepended, padded) input. When it exceeds the ceiling, the input is cut
//! into contiguous chunks along the current split axis and each chunk recurses
//! into the next axis. A chunk hands its trailing slice to the following chunk
//! so every window of the unsplit convolution is still computed exactly once;
//! only the first chunk gets left padding and only the last gets right
//! padding. Outputs are concatenated back along the split axis.
//!
//! The temporal axis is split by the caller (see
//! [`InflatedCausalConv3d`](crate::layer::InflatedCausalConv3d)), so recursion
//! starts at height and the incoming `prev_cache` is a temporal slice.

use candle_core::Tensor;
use layers::memory::{footprint_bytes, footprint_gib, MemoryLimit};
use log::debug;

use crate::{
    descriptor::{Padding, HEIGHT_DIM, TIME_DIM},
    errors::{ConvError, Result},
    primitive::Conv3d,
};

pub struct MemoryBoundedConvExecutor<'a> {
    conv: &'a mut Conv3d,
    limit: MemoryLimit,
}

impl<'a> MemoryBoundedConvExecutor<'a> {
    pub fn new(conv: &'a mut Conv3d, limit: MemoryLimit) -> Self {
        Self { conv, limit }
    }

    /// Convolves `prev_cache ++ input` (along time) with explicit `padding`.
    pub fn execute(
        &mut self,
        input: &Tensor,
        padding: Padding,
        prev_cache: Option<&Tensor>,
    ) -> Result<Tensor> {
        if input.rank() != 5 {
            return Err(ConvError::unsupported(format!(
                "causal conv expects (batch, channel, time, height, width), got {:?}",
                input.dims()
            )));
        }
        self.split_conv(input.clone(), HEIGHT_DIM, padding, prev_cache.cloned())
    }

    /// `prev_cache` is a slice along `split_dim - 1` and is concatenated in
    /// front of `x` on that axis before convolving.
    fn split_conv(
        &mut self,
        x: Tensor,
        split_dim: usize,
        padding: Padding,
        prev_cache: Option<Tensor>,
    ) -> Result<Tensor> {
        let cat_dim = split_dim - 1;
        let mut shape = x.dims().to_vec();
        if let Some(cache) = &prev_cache {
            shape[cat_dim] += cache.dim(cat_dim)?;
        }
        for (axis, [left, right]) in padding.iter().enumerate() {
            shape[TIME_DIM + axis] += left + right;
        }
        let footprint = footprint_bytes(&shape, x.dtype());
        debug!(
            "x:{:?} {:?} {:.3}GiB prev_cache:{:?}",
            shape,
            x.dtype(),
            footprint_gib(&shape, x.dtype()),
            prev_cache.as_ref().map(|c| c.dims().to_vec())
        );

        if self.limit.admits(footprint) || split_dim == x.rank() {
            let x = match prev_cache {
                Some(cache) => Tensor::cat(&[&cache, &x], cat_dim)?,
                None => x,
            };
            return self.direct(&x, padding);
        }

        let len = x.dim(split_dim)?;
        let num_splits = self.limit.num_splits(footprint).min(len);
        let sizes = split_sizes(len, num_splits);
        debug!(
            "exceed memory limit {:.3}GiB > {:.3}GiB, split dim {} into {:?}",
            footprint_gib(&shape, x.dtype()),
            self.limit.gib(),
            split_dim,
            sizes
        );

        let axis = split_dim - TIME_DIM;
        let last = sizes.len() - 1;
        let mut outputs = Vec::with_capacity(sizes.len());
        let mut carried: Option<Tensor> = None;
        let mut offset = 0;
        for (idx, &size) in sizes.iter().enumerate() {
            let mut chunk = x.narrow(split_dim, offset, size)?;
            if let Some(cache) = &prev_cache {
                let piece = cache.narrow(split_dim, offset, size)?;
                chunk = Tensor::cat(&[&piece, &chunk], cat_dim)?;
            }
            offset += size;

            let mut chunk_padding = padding;
            chunk_padding[axis] = [
                if idx == 0 { padding[axis][0] } else { 0 },
                if idx == last { padding[axis][1] } else { 0 },
            ];

            let mut next_cache = None;
            if idx < last {
                let carried_len = match &carried {
                    Some(c) => c.dim(split_dim)?,
                    None => 0,
                };
                let pad_len = chunk_padding[axis][0] + chunk_padding[axis][1];
                let need = self.conv.descriptor().cache_len(
                    axis,
                    chunk.dim(split_dim)? + carried_len,
                    pad_len,
                )?;
                if need != 0 {
                    if need > chunk.dim(split_dim)? {
                        if let Some(c) = carried.take() {
                            chunk = Tensor::cat(&[&c, &chunk], split_dim)?;
                        }
                    }
                    let chunk_len = chunk.dim(split_dim)?;
                    if need > chunk_len {
                        return Err(ConvError::precondition(format!(
                            "dim {split_dim}: next chunk needs {need} elements of overlap but chunk {idx} holds {chunk_len}; memory limit {:.3e}GiB is too small",
                            self.limit.gib()
                        )));
                    }
                    next_cache = Some(chunk.narrow(split_dim, chunk_len - need, need)?);
                }
            }

            outputs.push(self.split_conv(chunk, split_dim + 1, chunk_padding, carried.take())?);
            carried = next_cache;
        }

        debug!(
            "conv outputs, concat(dim={}): {:?}",
            split_dim,
            outputs.iter().map(|o| o.dims().to_vec()).collect::<Vec<_>>()
        );
        Ok(Tensor::cat(&outputs, split_dim)?)
    }

    fn direct(&mut self, x: &Tensor, padding: Padding) -> Result<Tensor> {
        let mut padded = x.clone();
        for (axis, [left, right]) in padding.iter().enumerate() {
            if left + right > 0 {
                padded = padded.pad_with_zeros(TIME_DIM + axis, *left, *right)?;
            }
        }
        let conv = self.conv.ignore_padding();
        conv.forward(&padded)
    }
}

/// Near-equal contiguous sizes; the last one absorbs the remainder.
pub(crate) fn split_sizes(len: usize, num_splits: usize) -> Vec<usize> {
    let num_splits = num_splits.clamp(1, len.max(1));
    let per_split = len / num_splits;
    let mut sizes = vec![per_split; num_splits - 1];
    sizes.push(len - per_split * (num_splits - 1));
    sizes
}
