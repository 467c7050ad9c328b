//! Normalisation primitives with unified shape and dtype handling.
//!
//! [`LayerNorm`] and [`RmsNorm`] normalise along the trailing (channel-last)
//! axis of a tensor of any rank. [`GroupNorm`] follows the channel-first
//! `(batch, channel, ...)` convention and normalises over each contiguous group
//! of channels together with every trailing axis. All variants promote
//! statistics to [`PrecisionPolicy::reduction`] and cast the output back to the
//! input dtype.

use candle_core::{Error, Result, Tensor, D};

use crate::{checks, precision::PrecisionPolicy};

/// Available channel-last normalisation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum NormKind {
    /// Standard LayerNorm with learnable affine parameters.
    LayerNorm,
    /// RMSNorm variant without mean subtraction.
    RmsNorm,
}

/// Configuration shared by the channel-last normalisation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the channel axis being normalised.
    pub channels: usize,
    /// Numeric stabiliser applied to variance or RMS computations.
    pub epsilon: f64,
    /// Desired variant of the normalisation routine.
    pub kind: NormKind,
    /// Whether post-normalisation affine parameters are applied.
    pub elementwise_affine: bool,
}

impl NormConfig {
    pub fn new(channels: usize, kind: NormKind) -> Self {
        Self {
            channels,
            epsilon: 1e-5,
            kind,
            elementwise_affine: true,
        }
    }
}

fn check_parameter(name: &str, tensor: &Tensor, channels: usize) -> Result<()> {
    checks::expect_shape(name, tensor, &[channels])?;
    checks::expect_dtype_in(name, tensor, &checks::FLOAT_DTYPES)
}

#[derive(Debug, Clone)]
struct NormImpl {
    config: NormConfig,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
}

impl NormImpl {
    fn new(config: NormConfig, weight: Option<Tensor>, bias: Option<Tensor>) -> Result<Self> {
        if matches!(config.kind, NormKind::RmsNorm) && bias.is_some() {
            return Err(Error::Msg("RMSNorm does not support bias parameters".into()));
        }
        if config.elementwise_affine {
            if weight.is_none() {
                return Err(Error::Msg(
                    "elementwise affine norms must supply a scale parameter".into(),
                ));
            }
        } else if weight.is_some() || bias.is_some() {
            return Err(Error::Msg(
                "non-affine norms must not include scale or bias parameters".into(),
            ));
        }
        if let Some(weight) = &weight {
            check_parameter("norm.weight", weight, config.channels)?;
        }
        if let Some(bias) = &bias {
            check_parameter("norm.bias", bias, config.channels)?;
        }
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        match hidden.dims().last() {
            Some(&last) if last == self.config.channels => {}
            _ => {
                return Err(Error::Msg(format!(
                    "norm.input: expected trailing axis {}, got {:?}",
                    self.config.channels,
                    hidden.dims()
                )))
            }
        }

        let policy = PrecisionPolicy::for_activation(hidden.dtype());
        let channels = self.config.channels as f64;
        let mut compute = policy.cast_for_reduction(hidden)?;

        if matches!(self.config.kind, NormKind::LayerNorm) {
            let mean = (compute.sum_keepdim(D::Minus1)? / channels)?;
            compute = compute.broadcast_sub(&mean)?;
        }

        let variance = (compute.sqr()?.sum_keepdim(D::Minus1)? / channels)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let mut normalized = compute.broadcast_div(&denom)?;

        if let Some(weight) = &self.weight {
            normalized = normalized.broadcast_mul(&weight.to_dtype(normalized.dtype())?)?;
        }
        if let Some(bias) = &self.bias {
            normalized = normalized.broadcast_add(&bias.to_dtype(normalized.dtype())?)?;
        }

        policy.cast_to_storage(&normalized)
    }
}

/// Standard LayerNorm implementation with optional affine parameters.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    inner: NormImpl,
}

impl LayerNorm {
    /// Constructs a LayerNorm with learnable scale and bias parameters.
    pub fn new(weight: Tensor, bias: Tensor, mut config: NormConfig) -> Result<Self> {
        config.kind = NormKind::LayerNorm;
        config.elementwise_affine = true;
        Ok(Self {
            inner: NormImpl::new(config, Some(weight), Some(bias))?,
        })
    }

    /// Constructs a LayerNorm without affine parameters (scale = 1, bias = 0).
    pub fn without_affine(mut config: NormConfig) -> Result<Self> {
        config.kind = NormKind::LayerNorm;
        config.elementwise_affine = false;
        Ok(Self {
            inner: NormImpl::new(config, None, None)?,
        })
    }

    pub fn config(&self) -> &NormConfig {
        &self.inner.config
    }

    /// Normalises along the trailing axis.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        self.inner.forward(hidden)
    }
}

/// Root mean square norm.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    inner: NormImpl,
}

impl RmsNorm {
    pub fn new(weight: Tensor, mut config: NormConfig) -> Result<Self> {
        config.kind = NormKind::RmsNorm;
        config.elementwise_affine = true;
        Ok(Self {
            inner: NormImpl::new(config, Some(weight), None)?,
        })
    }

    pub fn without_scale(mut config: NormConfig) -> Result<Self> {
        config.kind = NormKind::RmsNorm;
        config.elementwise_affine = false;
        Ok(Self {
            inner: NormImpl::new(config, None, None)?,
        })
    }

    pub fn config(&self) -> &NormConfig {
        &self.inner.config
    }

    /// Normalises along the trailing axis.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        self.inner.forward(hidden)
    }
}

/// Group normalisation over `(batch, channel, ...)` tensors.
#[derive(Debug, Clone)]
pub struct GroupNorm {
    weight: Tensor,
    bias: Tensor,
    num_groups: usize,
    epsilon: f64,
}

impl GroupNorm {
    pub fn new(weight: Tensor, bias: Tensor, num_groups: usize, epsilon: f64) -> Result<Self> {
        let channels = weight.elem_count();
        if num_groups == 0 || channels % num_groups != 0 {
            return Err(Error::Msg(format!(
                "group_norm: {channels} channels cannot be split into {num_groups} groups"
            )));
        }
        check_parameter("group_norm.weight", &weight, channels)?;
        check_parameter("group_norm.bias", &bias, channels)?;
        Ok(Self {
            weight,
            bias,
            num_groups,
            epsilon,
        })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    pub fn channels(&self) -> usize {
        self.weight.elem_count()
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let channels = self.channels();
        checks::expect_channels("group_norm.input", hidden, channels)?;
        if hidden.rank() < 3 {
            return Err(Error::Msg(format!(
                "group_norm.input: expected at least one spatial axis, got {:?}",
                hidden.dims()
            )));
        }

        let policy = PrecisionPolicy::for_activation(hidden.dtype());
        let dims = hidden.dims().to_vec();
        let batch = dims[0];
        let group_len = hidden.elem_count() / (batch * self.num_groups);

        let compute = policy
            .cast_for_reduction(hidden)?
            .reshape((batch, self.num_groups, group_len))?;
        let mean = (compute.sum_keepdim(2)? / group_len as f64)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(2)? / group_len as f64)?;
        let denom = (variance + self.epsilon)?.sqrt()?;
        let normalized = centered.broadcast_div(&denom)?.reshape(dims.as_slice())?;

        let mut affine_shape = vec![1usize; dims.len()];
        affine_shape[1] = channels;
        let weight = self
            .weight
            .to_dtype(normalized.dtype())?
            .reshape(affine_shape.as_slice())?;
        let bias = self
            .bias
            .to_dtype(normalized.dtype())?
            .reshape(affine_shape.as_slice())?;
        let output = normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?;

        policy.cast_to_storage(&output)
    }
}
