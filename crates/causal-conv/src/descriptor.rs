//! Convolution geometry: kernel, stride, dilation and padding per axis.
//!
//! Axis indices used here are relative to the temporal axis: `0` is time,
//! `1` is height, `2` is width. Tensor dimensions follow the
//! `(batch, channel, time, height, width)` layout, see [`TIME_DIM`].

use crate::errors::{ConvError, Result};

pub const TIME_DIM: usize = 2;
pub const HEIGHT_DIM: usize = 3;
pub const WIDTH_DIM: usize = 4;

/// Explicit `[left, right]` zero padding for time, height and width.
pub type Padding = [[usize; 2]; 3];

/// Builds symmetric padding from a per-axis amount.
pub fn symmetric(padding: [usize; 3]) -> Padding {
    padding.map(|p| [p, p])
}

/// Static description of a 3D convolution, fixed at layer construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvDescriptor {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: [usize; 3],
    pub stride: [usize; 3],
    pub padding: [usize; 3],
    pub dilation: [usize; 3],
    pub groups: usize,
}

impl ConvDescriptor {
    pub fn new(in_channels: usize, out_channels: usize, kernel: [usize; 3]) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel,
            stride: [1; 3],
            padding: [0; 3],
            dilation: [1; 3],
            groups: 1,
        }
    }

    pub fn with_stride(mut self, stride: [usize; 3]) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: [usize; 3]) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_dilation(mut self, dilation: [usize; 3]) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(ConvError::precondition("channel counts must be non-zero"));
        }
        if self.kernel.contains(&0) || self.stride.contains(&0) || self.dilation.contains(&0) {
            return Err(ConvError::precondition(format!(
                "kernel {:?}, stride {:?} and dilation {:?} must be non-zero",
                self.kernel, self.stride, self.dilation
            )));
        }
        if self.groups == 0
            || self.in_channels % self.groups != 0
            || self.out_channels % self.groups != 0
        {
            return Err(ConvError::precondition(format!(
                "groups {} must divide in_channels {} and out_channels {}",
                self.groups, self.in_channels, self.out_channels
            )));
        }
        if self.stride[1] != self.stride[2] || self.dilation[1] != self.dilation[2] {
            return Err(ConvError::unsupported(format!(
                "spatial stride {:?} and dilation {:?} must match on height and width",
                &self.stride[1..],
                &self.dilation[1..]
            )));
        }
        Ok(())
    }

    /// Kernel extent along `axis` once dilation is applied.
    pub fn span(&self, axis: usize) -> usize {
        self.dilation[axis] * (self.kernel[axis] - 1) + 1
    }

    /// Output length along `axis` for an already padded input length.
    pub fn output_len(&self, axis: usize, padded_len: usize) -> Option<usize> {
        let span = self.span(axis);
        (padded_len >= span).then(|| (padded_len - span) / self.stride[axis] + 1)
    }

    /// Expected output dims for a padded `(batch, channel, time, height, width)` input.
    pub fn output_dims(&self, padded: &[usize]) -> Option<[usize; 5]> {
        Some([
            *padded.first()?,
            self.out_channels,
            self.output_len(0, *padded.get(TIME_DIM)?)?,
            self.output_len(1, *padded.get(HEIGHT_DIM)?)?,
            self.output_len(2, *padded.get(WIDTH_DIM)?)?,
        ])
    }

    /// Trailing slice length the next chunk needs along `axis`.
    ///
    /// This is the kernel overlap (`span - stride`) plus whatever tail of the
    /// current chunk was not consumed by a full stride, so the next chunk's
    /// first window lands exactly where the unsplit computation would put it.
    pub fn cache_len(&self, axis: usize, input_len: usize, pad_len: usize) -> Result<usize> {
        let span = self.span(axis);
        let stride = self.stride[axis];
        let total = input_len + pad_len;
        let output_len = self.output_len(axis, total).ok_or_else(|| {
            ConvError::precondition(format!(
                "axis {axis}: {input_len} elements plus {pad_len} padding are shorter than kernel span {span}"
            ))
        })?;
        let remain = total - ((output_len - 1) * stride + span);
        let cache_len = (span + remain).checked_sub(stride).ok_or_else(|| {
            ConvError::unsupported(format!(
                "axis {axis}: stride {stride} skips past the remaining {remain} elements"
            ))
        })?;
        log::debug!(
            "cache_len axis={axis} input={input_len} pad={pad_len} output={output_len} remain={remain} cache={cache_len}"
        );
        Ok(cache_len)
    }
}
