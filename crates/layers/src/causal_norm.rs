//! Memory-bounded normalisation for `(batch, channel, time, height, width)` tensors.
//!
//! Channel-last families (LayerNorm, RmsNorm) move the channel axis to the end,
//! normalise every position independently, and move it back. Group
//! normalisation folds time into the batch axis so each frame is normalised on
//! its own; when the folded tensor is larger than the configured ceiling the
//! channel groups are processed in chunks, each with its own slice of the
//! affine parameters. Both strategies are exact.

use candle_core::{DType, Tensor};
use log::debug;

use crate::{
    memory::{footprint_bytes, footprint_gib, MemoryLimit},
    norm::{GroupNorm, LayerNorm, RmsNorm},
    LayerError, Result,
};

/// Closed set of normalisation families, chosen at construction time.
#[derive(Debug, Clone)]
pub enum NormLayer {
    Layer(LayerNorm),
    Rms(RmsNorm),
    Group(GroupNorm),
}

impl From<LayerNorm> for NormLayer {
    fn from(norm: LayerNorm) -> Self {
        Self::Layer(norm)
    }
}

impl From<RmsNorm> for NormLayer {
    fn from(norm: RmsNorm) -> Self {
        Self::Rms(norm)
    }
}

impl From<GroupNorm> for NormLayer {
    fn from(norm: GroupNorm) -> Self {
        Self::Group(norm)
    }
}

/// Normalisation wrapper that bounds the footprint of each group-norm call.
#[derive(Debug, Clone)]
pub struct ChunkedNorm {
    norm: NormLayer,
    limit: MemoryLimit,
    num_chunks: Option<usize>,
}

impl ChunkedNorm {
    pub fn new(norm: impl Into<NormLayer>) -> Self {
        Self {
            norm: norm.into(),
            limit: MemoryLimit::unlimited(),
            num_chunks: None,
        }
    }

    /// Folded tensors above `limit` are normalised chunk by chunk.
    pub fn with_limit(mut self, limit: MemoryLimit) -> Self {
        self.limit = limit;
        self
    }

    /// Overrides the dtype-derived chunk count.
    pub fn with_num_chunks(mut self, num_chunks: usize) -> Self {
        self.num_chunks = Some(num_chunks);
        self
    }

    pub fn norm(&self) -> &NormLayer {
        &self.norm
    }

    pub fn limit(&self) -> MemoryLimit {
        self.limit
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let input_dtype = x.dtype();
        let output = match &self.norm {
            NormLayer::Layer(norm) => channel_last(x, |t| norm.forward(t))?,
            NormLayer::Rms(norm) => channel_last(x, |t| norm.forward(t))?,
            NormLayer::Group(norm) => self.grouped(norm, x)?,
        };
        Ok(output.to_dtype(input_dtype)?)
    }

    fn grouped(&self, norm: &GroupNorm, x: &Tensor) -> Result<Tensor> {
        match x.rank() {
            rank if rank <= 4 => Ok(norm.forward(x)?),
            5 => {
                let (b, c, t, h, w) = x.dims5()?;
                let folded = x
                    .permute((0, 2, 1, 3, 4))?
                    .contiguous()?
                    .reshape((b * t, c, h, w))?;
                let footprint = footprint_bytes(folded.dims(), folded.dtype());
                let normalized = if self.limit.is_exceeded_by(footprint) {
                    self.chunked(norm, &folded)?
                } else {
                    norm.forward(&folded)?
                };
                Ok(normalized
                    .reshape((b, t, c, h, w))?
                    .permute((0, 2, 1, 3, 4))?
                    .contiguous()?)
            }
            rank => Err(LayerError::Unsupported {
                op: "group_norm",
                rank,
            }),
        }
    }

    fn chunked(&self, norm: &GroupNorm, folded: &Tensor) -> Result<Tensor> {
        let num_groups = norm.num_groups();
        let num_chunks = self
            .num_chunks
            .unwrap_or_else(|| default_num_chunks(folded.dtype()).min(num_groups));
        if num_chunks == 0 || num_groups % num_chunks != 0 {
            return Err(LayerError::Precondition(format!(
                "{num_groups} groups cannot be split into {num_chunks} chunks"
            )));
        }
        debug!(
            "large tensor {:?} ({:.3}GiB), norm in {} chunks",
            folded.dims(),
            footprint_gib(folded.dims(), folded.dtype()),
            num_chunks
        );

        let groups_per_chunk = num_groups / num_chunks;
        let channels_per_chunk = norm.channels() / num_chunks;
        let mut outputs = Vec::with_capacity(num_chunks);
        for idx in 0..num_chunks {
            let start = idx * channels_per_chunk;
            let part = GroupNorm::new(
                norm.weight().narrow(0, start, channels_per_chunk)?,
                norm.bias().narrow(0, start, channels_per_chunk)?,
                groups_per_chunk,
                norm.epsilon(),
            )?;
            let chunk = folded.narrow(1, start, channels_per_chunk)?;
            outputs.push(part.forward(&chunk)?.to_dtype(folded.dtype())?);
        }
        Ok(Tensor::cat(&outputs, 1)?)
    }
}

fn default_num_chunks(dtype: DType) -> usize {
    if dtype.size_in_bytes() == 2 {
        4
    } else {
        2
    }
}

fn channel_last<F>(x: &Tensor, f: F) -> Result<Tensor>
where
    F: Fn(&Tensor) -> candle_core::Result<Tensor>,
{
    match x.rank() {
        4 => {
            let moved = x.permute((0, 2, 3, 1))?.contiguous()?;
            Ok(f(&moved)?.permute((0, 3, 1, 2))?.contiguous()?)
        }
        5 => {
            let moved = x.permute((0, 2, 3, 4, 1))?.contiguous()?;
            Ok(f(&moved)?.permute((0, 4, 1, 2, 3))?.contiguous()?)
        }
        rank => Err(LayerError::Unsupported {
            op: "channel_last_norm",
            rank,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::norm::{NormConfig, NormKind};
    use candle_core::Device;

    fn video(device: &Device, dims: (usize, usize, usize, usize, usize)) -> Result<Tensor> {
        let (b, c, t, h, w) = dims;
        let total = b * c * t * h * w;
        let data = (0..total)
            .map(|i| ((i * 13 % 31) as f32) * 0.1 - 1.2)
            .collect::<Vec<_>>();
        Ok(Tensor::from_vec(data, (b, c, t, h, w), device)?)
    }

    fn group_norm(device: &Device, channels: usize, groups: usize) -> Result<GroupNorm> {
        let weight = Tensor::from_vec(
            (0..channels).map(|i| 0.5 + i as f32 * 0.05).collect::<Vec<_>>(),
            (channels,),
            device,
        )?;
        let bias = Tensor::from_vec(
            (0..channels).map(|i| i as f32 * 0.01).collect::<Vec<_>>(),
            (channels,),
            device,
        )?;
        Ok(GroupNorm::new(weight, bias, groups, 1e-6)?)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        Ok(a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_vec0::<f32>()?)
    }

    #[test]
    fn chunked_group_norm_matches_unchunked() -> Result<()> {
        let device = Device::Cpu;
        let x = video(&device, (2, 16, 3, 4, 4))?;
        let norm = group_norm(&device, 16, 8)?;

        let reference = ChunkedNorm::new(norm.clone()).forward(&x)?;
        let chunked = ChunkedNorm::new(norm)
            .with_limit(MemoryLimit::from_bytes(64))
            .with_num_chunks(4)
            .forward(&x)?;

        assert_eq!(chunked.dims(), x.dims());
        assert!(max_diff(&chunked, &reference)? < 1e-5);
        Ok(())
    }

    #[test]
    fn chunked_group_norm_in_half_precision_uses_four_chunks() -> Result<()> {
        let device = Device::Cpu;
        let x = video(&device, (1, 16, 2, 3, 3))?.to_dtype(DType::F16)?;
        let norm = group_norm(&device, 16, 8)?;

        let reference = ChunkedNorm::new(norm.clone()).forward(&x)?;
        let chunked = ChunkedNorm::new(norm)
            .with_limit(MemoryLimit::from_bytes(1))
            .forward(&x)?;

        assert_eq!(chunked.dtype(), DType::F16);
        assert!(max_diff(&chunked, &reference)? < 5e-3);
        Ok(())
    }

    #[test]
    fn folded_group_norm_normalises_each_frame_independently() -> Result<()> {
        let device = Device::Cpu;
        let x = video(&device, (1, 8, 3, 2, 2))?;
        let norm = group_norm(&device, 8, 4)?;
        let output = ChunkedNorm::new(norm.clone()).forward(&x)?;

        for t in 0..3 {
            let frame = x.narrow(2, t, 1)?.squeeze(2)?;
            let expected = norm.forward(&frame)?;
            let actual = output.narrow(2, t, 1)?.squeeze(2)?;
            assert!(max_diff(&actual, &expected)? < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn non_divisible_chunk_count_is_rejected() -> Result<()> {
        let device = Device::Cpu;
        let x = video(&device, (1, 12, 2, 2, 2))?;
        let norm = group_norm(&device, 12, 6)?;
        let result = ChunkedNorm::new(norm)
            .with_limit(MemoryLimit::from_bytes(1))
            .with_num_chunks(4)
            .forward(&x);
        assert!(matches!(result, Err(LayerError::Precondition(_))));
        Ok(())
    }

    #[test]
    fn layer_norm_is_applied_over_channels() -> Result<()> {
        let device = Device::Cpu;
        let x = video(&device, (1, 4, 2, 3, 3))?;
        let norm = LayerNorm::without_affine(NormConfig::new(4, NormKind::LayerNorm))?;
        let output = ChunkedNorm::new(norm).forward(&x)?;
        assert_eq!(output.dims(), x.dims());

        let mean = output.mean_keepdim(1)?.abs()?.flatten_all()?.max(0)?;
        assert!(mean.to_vec0::<f32>()? < 1e-5);
        Ok(())
    }

    #[test]
    fn unsupported_ranks_fail_explicitly() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::zeros((2, 4, 3), DType::F32, &device)?;
        let norm = RmsNorm::without_scale(NormConfig::new(4, NormKind::RmsNorm))?;
        let result = ChunkedNorm::new(norm).forward(&x);
        assert!(matches!(
            result,
            Err(LayerError::Unsupported { rank: 3, .. })
        ));

        let six = Tensor::zeros((1, 8, 1, 1, 1, 1), DType::F32, &device)?;
        let result = ChunkedNorm::new(group_norm(&device, 8, 4)?).forward(&six);
        assert!(matches!(
            result,
            Err(LayerError::Unsupported { rank: 6, .. })
        ));
        Ok(())
    }
}
