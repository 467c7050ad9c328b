//! Dense 3D convolution built from Candle's `conv2d`.
//!
//! For every temporal tap `k` the frames `k*d, k*d + s, k*d + 2s, ...` are
//! gathered, folded into the batch axis, and convolved with the matching 2D
//! slice of the kernel; the per-tap results are summed. This is the exact 3D
//! convolution, not an approximation.

use std::ops::Deref;

use candle_core::Tensor;
use layers::checks;

use crate::{
    descriptor::{ConvDescriptor, HEIGHT_DIM, TIME_DIM, WIDTH_DIM},
    errors::{ConvError, Result},
};

#[derive(Debug, Clone)]
pub struct Conv3d {
    weight: Tensor,
    bias: Option<Tensor>,
    descriptor: ConvDescriptor,
    padding: [usize; 3],
}

impl Conv3d {
    pub fn new(weight: Tensor, bias: Option<Tensor>, descriptor: ConvDescriptor) -> Result<Self> {
        descriptor.validate()?;
        checks::expect_dtype_in("conv3d.weight", &weight, &checks::FLOAT_DTYPES)?;
        let [kt, kh, kw] = descriptor.kernel;
        let expected = [
            descriptor.out_channels,
            descriptor.in_channels / descriptor.groups,
            kt,
            kh,
            kw,
        ];
        if weight.dims() != expected {
            return Err(ConvError::ShapeMismatch {
                name: "weight".into(),
                expected: expected.to_vec(),
                actual: weight.dims().to_vec(),
            });
        }
        if let Some(bias) = &bias {
            if bias.dims() != [descriptor.out_channels] {
                return Err(ConvError::ShapeMismatch {
                    name: "bias".into(),
                    expected: vec![descriptor.out_channels],
                    actual: bias.dims().to_vec(),
                });
            }
        }
        Ok(Self {
            weight,
            bias,
            padding: descriptor.padding,
            descriptor,
        })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn descriptor(&self) -> &ConvDescriptor {
        &self.descriptor
    }

    /// Zero padding the primitive applies on its own before convolving.
    pub fn padding(&self) -> [usize; 3] {
        self.padding
    }

    pub fn set_padding(&mut self, padding: [usize; 3]) {
        self.padding = padding;
    }

    pub(crate) fn set_weight(&mut self, weight: Tensor) {
        self.weight = weight;
    }

    pub(crate) fn set_bias(&mut self, bias: Option<Tensor>) {
        self.bias = bias;
    }

    /// Suppresses built-in padding until the returned guard is dropped.
    pub fn ignore_padding(&mut self) -> PaddingOverride<'_> {
        let saved = self.padding;
        self.padding = [0; 3];
        PaddingOverride { conv: self, saved }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        checks::expect_rank("conv3d.input", x, 5)?;
        let [pt, ph, pw] = self.padding;
        let x = x
            .pad_with_zeros(TIME_DIM, pt, pt)?
            .pad_with_zeros(HEIGHT_DIM, ph, ph)?
            .pad_with_zeros(WIDTH_DIM, pw, pw)?
            .contiguous()?;
        let (b, c, t, h, w) = x.dims5()?;
        if c != self.descriptor.in_channels {
            return Err(ConvError::ShapeMismatch {
                name: "input channels".into(),
                expected: vec![self.descriptor.in_channels],
                actual: vec![c],
            });
        }

        let out_t = self.descriptor.output_len(0, t).ok_or_else(|| {
            ConvError::precondition(format!(
                "{t} frames are shorter than the temporal kernel span {}",
                self.descriptor.span(0)
            ))
        })?;
        let [st, sh, _] = self.descriptor.stride;
        let [dt, dh, _] = self.descriptor.dilation;

        let mut acc: Option<Tensor> = None;
        for tap in 0..self.descriptor.kernel[0] {
            let ids = (0..out_t)
                .map(|i| (i * st + tap * dt) as u32)
                .collect::<Vec<_>>();
            let ids = Tensor::new(ids.as_slice(), x.device())?;
            let frames = x
                .index_select(&ids, TIME_DIM)?
                .permute((0, 2, 1, 3, 4))?
                .contiguous()?
                .reshape((b * out_t, c, h, w))?;
            let kernel = self.weight.narrow(TIME_DIM, tap, 1)?.squeeze(TIME_DIM)?.contiguous()?;
            let y = frames.conv2d(&kernel, 0, sh, dh, self.descriptor.groups)?;
            acc = Some(match acc {
                Some(prev) => (prev + y)?,
                None => y,
            });
        }
        let y = acc.ok_or_else(|| ConvError::precondition("temporal kernel must be non-empty"))?;

        let (_, o, ho, wo) = y.dims4()?;
        let mut y = y
            .reshape((b, out_t, o, ho, wo))?
            .permute((0, 2, 1, 3, 4))?
            .contiguous()?;
        if let Some(bias) = &self.bias {
            y = y.broadcast_add(&bias.reshape((1, o, 1, 1, 1))?)?;
        }
        Ok(y)
    }
}

/// Scoped override of [`Conv3d`]'s built-in padding; restores it on drop.
pub struct PaddingOverride<'a> {
    conv: &'a mut Conv3d,
    saved: [usize; 3],
}

impl Deref for PaddingOverride<'_> {
    type Target = Conv3d;

    fn deref(&self) -> &Conv3d {
        self.conv
    }
}

impl Drop for PaddingOverride<'_> {
    fn drop(&mut self) {
        self.conv.padding = self.saved;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn ramp(dims: &[usize], scale: f32) -> Result<Tensor> {
        let total = dims.iter().product::<usize>();
        let data = (0..total)
            .map(|i| ((i * 17 % 29) as f32 - 14.0) * scale)
            .collect::<Vec<_>>();
        Ok(Tensor::from_vec(data, dims, &Device::Cpu)?)
    }

    #[test]
    fn single_tap_kernel_reduces_to_conv2d() -> Result<()> {
        let desc = ConvDescriptor::new(2, 3, [1, 3, 3]).with_padding([0, 1, 1]);
        let weight = ramp(&[3, 2, 1, 3, 3], 0.05)?;
        let conv = Conv3d::new(weight.clone(), None, desc)?;
        let x = ramp(&[1, 2, 4, 5, 5], 0.1)?;

        let y = conv.forward(&x)?;
        assert_eq!(y.dims(), &[1, 3, 4, 5, 5]);

        let kernel = weight.squeeze(2)?;
        for t in 0..4 {
            let frame = x.narrow(2, t, 1)?.squeeze(2)?;
            let expected = frame.conv2d(&kernel, 1, 1, 1, 1)?;
            let actual = y.narrow(2, t, 1)?.squeeze(2)?;
            let diff = (actual - expected)?.abs()?.flatten_all()?.max(0)?;
            assert!(diff.to_vec0::<f32>()? < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn temporal_taps_are_summed() -> Result<()> {
        // out[t] = x[t] + x[t + 1] + bias
        let desc = ConvDescriptor::new(1, 1, [2, 1, 1]);
        let weight = Tensor::ones((1, 1, 2, 1, 1), DType::F32, &Device::Cpu)?;
        let bias = Tensor::new(&[0.5f32], &Device::Cpu)?;
        let conv = Conv3d::new(weight, Some(bias), desc)?;
        let x = Tensor::new(&[1.0f32, 2.0, 4.0, 8.0], &Device::Cpu)?.reshape((1, 1, 4, 1, 1))?;

        let y = conv.forward(&x)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(y, vec![3.5, 6.5, 12.5]);
        Ok(())
    }

    #[test]
    fn ignore_padding_restores_on_drop() -> Result<()> {
        let desc = ConvDescriptor::new(1, 1, [1, 3, 3]).with_padding([0, 1, 1]);
        let weight = Tensor::ones((1, 1, 1, 3, 3), DType::F32, &Device::Cpu)?;
        let mut conv = Conv3d::new(weight, None, desc)?;
        let x = Tensor::ones((1, 1, 1, 4, 4), DType::F32, &Device::Cpu)?;
        {
            let unpadded = conv.ignore_padding();
            assert_eq!(unpadded.padding(), [0, 0, 0]);
            assert_eq!(unpadded.forward(&x)?.dims(), &[1, 1, 1, 2, 2]);
        }
        assert_eq!(conv.padding(), [0, 1, 1]);
        assert_eq!(conv.forward(&x)?.dims(), &[1, 1, 1, 4, 4]);
        Ok(())
    }

    #[test]
    fn narrowed_multi_channel_input_matches_contiguous_copy() -> Result<()> {
        let desc = ConvDescriptor::new(3, 2, [2, 3, 3]).with_padding([1, 1, 1]);
        let conv = Conv3d::new(ramp(&[2, 3, 2, 3, 3], 0.05)?, Some(ramp(&[2], 0.3)?), desc)?;
        let clip = ramp(&[1, 3, 7, 5, 5], 0.1)?;

        let narrowed = clip.narrow(2, 2, 4)?;
        assert!(!narrowed.is_contiguous());
        let head = narrowed.narrow(2, 0, 1)?.repeat((1, 1, 2, 1, 1))?;
        let extended = Tensor::cat(&[&head, &narrowed], 2)?;

        for input in [narrowed.clone(), extended] {
            let expected = conv.forward(&input.contiguous()?)?;
            let actual = conv.forward(&input)?;
            assert_eq!(actual.dims(), expected.dims());
            let diff = (actual - expected)?.abs()?.flatten_all()?.max(0)?;
            assert_eq!(diff.to_vec0::<f32>()?, 0.0);
        }
        Ok(())
    }

    #[test]
    fn too_few_frames_fail_fast() -> Result<()> {
        let desc = ConvDescriptor::new(1, 1, [3, 1, 1]);
        let weight = Tensor::ones((1, 1, 3, 1, 1), DType::F32, &Device::Cpu)?;
        let conv = Conv3d::new(weight, None, desc)?;
        let x = Tensor::ones((1, 1, 2, 1, 1), DType::F32, &Device::Cpu)?;
        assert!(matches!(conv.forward(&x), Err(ConvError::Precondition(_))));
        Ok(())
    }
}
