//! Causal 3D convolution layer with streaming memory.
//!
//! Temporal zero padding is removed at construction. Instead, the first chunk
//! of a sequence is prefixed with copies of its first frame and later chunks
//! are prefixed with the trailing frames remembered from the previous call
//! (or received from the previous sequence-parallel rank), so processing a
//! video chunk by chunk gives the same result as processing it whole.

use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use layers::memory::MemoryLimit;
use log::{debug, info};

use crate::{
    cache::{extend_head, tail_frames, BoundaryCache},
    descriptor::{symmetric, ConvDescriptor, TIME_DIM},
    distributed::{exchange_boundary, pass_stream_memory, SequenceParallelGroup},
    errors::{ConvError, Result},
    executor::MemoryBoundedConvExecutor,
    primitive::Conv3d,
    types::{InflationMode, MemoryDevice, MemoryState},
};

/// A whole clip, or a clip pre-split along time into sequential chunks.
#[derive(Debug, Clone)]
pub enum ConvInput {
    Single(Tensor),
    Chunks(Vec<Tensor>),
}

impl ConvInput {
    pub fn into_single(self) -> Result<Tensor> {
        match self {
            Self::Single(tensor) => Ok(tensor),
            Self::Chunks(chunks) => Err(ConvError::unsupported(format!(
                "expected a single tensor, got {} chunks",
                chunks.len()
            ))),
        }
    }

    pub fn into_chunks(self) -> Vec<Tensor> {
        match self {
            Self::Single(tensor) => vec![tensor],
            Self::Chunks(chunks) => chunks,
        }
    }

    pub fn elem_count(&self) -> usize {
        match self {
            Self::Single(tensor) => tensor.elem_count(),
            Self::Chunks(chunks) => chunks.iter().map(Tensor::elem_count).sum(),
        }
    }
}

impl From<Tensor> for ConvInput {
    fn from(tensor: Tensor) -> Self {
        Self::Single(tensor)
    }
}

impl From<Vec<Tensor>> for ConvInput {
    fn from(chunks: Vec<Tensor>) -> Self {
        Self::Chunks(chunks)
    }
}

pub struct InflatedCausalConv3d {
    conv: Conv3d,
    temporal_padding: usize,
    inflation_mode: InflationMode,
    memory: BoundaryCache,
    memory_device: Option<MemoryDevice>,
    memory_limit: MemoryLimit,
    group: Option<Arc<dyn SequenceParallelGroup>>,
    training: bool,
}

impl InflatedCausalConv3d {
    pub fn new(
        weight: Tensor,
        bias: Option<Tensor>,
        descriptor: ConvDescriptor,
        inflation_mode: InflationMode,
    ) -> Result<Self> {
        let mut conv = Conv3d::new(weight, bias, descriptor)?;
        let [temporal_padding, ph, pw] = descriptor.padding;
        conv.set_padding([0, ph, pw]);
        info!(
            "causal conv3d {}->{} kernel={:?} stride={:?} padding={:?} inflation={:?}",
            descriptor.in_channels,
            descriptor.out_channels,
            descriptor.kernel,
            descriptor.stride,
            descriptor.padding,
            inflation_mode
        );
        Ok(Self {
            conv,
            temporal_padding,
            inflation_mode,
            memory: BoundaryCache::new(),
            memory_device: Some(MemoryDevice::Same),
            memory_limit: MemoryLimit::unlimited(),
            group: None,
            training: false,
        })
    }

    /// Zero-initialised layer, ready to receive a checkpoint.
    pub fn zeros(
        descriptor: ConvDescriptor,
        inflation_mode: InflationMode,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let [kt, kh, kw] = descriptor.kernel;
        let weight = Tensor::zeros(
            (
                descriptor.out_channels,
                descriptor.in_channels / descriptor.groups.max(1),
                kt,
                kh,
                kw,
            ),
            dtype,
            device,
        )?;
        let bias = Tensor::zeros(descriptor.out_channels, dtype, device)?;
        Self::new(weight, Some(bias), descriptor, inflation_mode)
    }

    pub fn set_memory_limit(&mut self, limit: MemoryLimit) {
        self.memory_limit = limit;
    }

    /// `None` stops the layer from keeping any boundary cache.
    pub fn set_memory_device(&mut self, device: Option<MemoryDevice>) {
        self.memory_device = device;
    }

    pub fn set_group(&mut self, group: Option<Arc<dyn SequenceParallelGroup>>) {
        self.group = group;
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn memory_limit(&self) -> MemoryLimit {
        self.memory_limit
    }

    pub fn memory_device(&self) -> Option<MemoryDevice> {
        self.memory_device
    }

    /// The boundary cache recorded by the last streaming call, if any.
    pub fn memory(&self) -> Option<&Tensor> {
        self.memory.get()
    }

    pub fn descriptor(&self) -> &ConvDescriptor {
        self.conv.descriptor()
    }

    pub fn inflation_mode(&self) -> InflationMode {
        self.inflation_mode
    }

    pub fn temporal_padding(&self) -> usize {
        self.temporal_padding
    }

    pub fn weight(&self) -> &Tensor {
        self.conv.weight()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.conv.bias()
    }

    pub(crate) fn conv_mut(&mut self) -> &mut Conv3d {
        &mut self.conv
    }

    /// Frames of causal context carried between calls.
    fn cache_size(&self) -> usize {
        let descriptor = self.conv.descriptor();
        descriptor.kernel[0].saturating_sub(descriptor.stride[0])
    }

    pub fn forward(&mut self, input: impl Into<ConvInput>, state: MemoryState) -> Result<ConvInput> {
        if state == MemoryState::Unset {
            return Err(ConvError::precondition(
                "forward requires an explicit memory state",
            ));
        }
        if state != MemoryState::Active {
            self.memory.clear();
        }
        match input.into() {
            ConvInput::Single(input) if self.memory_limit.is_unlimited() && self.group.is_none() => {
                Ok(ConvInput::Single(self.basic_forward(&input, state)?))
            }
            ConvInput::Single(input) => {
                let output = self
                    .slicing_forward(vec![input], state)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| ConvError::precondition("slicing produced no output"))?;
                Ok(ConvInput::Single(output))
            }
            ConvInput::Chunks(chunks) => Ok(ConvInput::Chunks(self.slicing_forward(chunks, state)?)),
        }
    }

    fn basic_forward(&mut self, input: &Tensor, state: MemoryState) -> Result<Tensor> {
        let cache_size = self.cache_size();
        let input = match self.memory.get() {
            Some(memory) if state == MemoryState::Active => extend_head(input, 0, Some(memory))?,
            _ => extend_head(input, self.temporal_padding * 2, None)?,
        };
        let memory = if cache_size != 0 && state != MemoryState::Disabled {
            Some(tail_frames(&input, cache_size)?)
        } else {
            None
        };
        let output = self.conv.forward(&input)?;
        if state != MemoryState::Disabled && !self.training {
            if let Some(device) = self.memory_device {
                self.memory.store(memory, device)?;
            }
        }
        Ok(output)
    }

    fn slicing_forward(&mut self, mut inputs: Vec<Tensor>, state: MemoryState) -> Result<Vec<Tensor>> {
        if inputs.is_empty() {
            return Err(ConvError::precondition("no input chunks supplied"));
        }
        let cache_size = self.cache_size();
        let group = self.group.clone();
        let group = group.as_deref();
        let is_first = group.map_or(true, |g| g.is_first());
        let is_last = group.map_or(true, |g| g.is_last());

        let mut cache = exchange_boundary(
            group,
            &inputs,
            cache_size,
            self.memory.get(),
            self.temporal_padding * 2,
        )?;

        // For 2 ranks, 2 chunks per call and 17 frames, with extend `0 0`,
        // exchanged cache {..} and stream memory (..):
        //   chunk 0: [`0 0` 0 1 2 {3 4}]   [{3 4} 5 6 (7 8)]
        //   chunk 1: [(7 8) 9 10 {11 12}]  [{11 12} 13 14 15 16]
        let mut stream_memory = None;
        if let Some(device) = self.memory_device {
            if state.uses_memory() && !self.training && (is_first || is_last) && cache_size != 0 {
                let last_len = inputs[inputs.len() - 1].dim(TIME_DIM)?;
                if cache_size > last_len && inputs.len() == 1 {
                    if let Some(context) = cache.take() {
                        inputs[0] = Tensor::cat(&[&context, &inputs[0]], TIME_DIM)?;
                    }
                }
                if let Some(memory) = pass_stream_memory(group, &inputs[inputs.len() - 1], cache_size)? {
                    stream_memory = Some((memory, device));
                }
            }
        }

        let padding = symmetric(self.conv.padding());
        let limit = self.memory_limit;
        let num_chunks = inputs.len();
        let mut outputs = Vec::with_capacity(num_chunks);
        for (idx, mut input) in inputs.into_iter().enumerate() {
            let mut next_cache = None;
            if idx + 1 < num_chunks {
                let cache_len = match &cache {
                    Some(c) => c.dim(TIME_DIM)?,
                    None => 0,
                };
                let need = self
                    .conv
                    .descriptor()
                    .cache_len(0, input.dim(TIME_DIM)? + cache_len, 0)?;
                if need != 0 {
                    if need > input.dim(TIME_DIM)? {
                        if let Some(context) = cache.take() {
                            input = Tensor::cat(&[&context, &input], TIME_DIM)?;
                        }
                    }
                    next_cache = Some(tail_frames(&input, need)?);
                }
            }
            debug!(
                "chunk {idx}/{num_chunks}: input {:?} context {:?}",
                input.dims(),
                cache.as_ref().map(|c| c.dims().to_vec())
            );

            let output = MemoryBoundedConvExecutor::new(&mut self.conv, limit).execute(
                &input,
                padding,
                cache.as_ref(),
            )?;
            outputs.push(output);
            cache = next_cache;
        }
        if let Some((memory, device)) = stream_memory {
            self.memory.store(Some(memory), device)?;
        }
        Ok(outputs)
    }

    /// Tera floating point operations spent producing `output`.
    pub fn tflops(&self, output: &ConvInput) -> f64 {
        let descriptor = self.conv.descriptor();
        let taps = descriptor.kernel.iter().product::<usize>() as f64;
        let numel = output.elem_count() as f64;
        2.0 * taps * descriptor.in_channels as f64 * (numel / 1e6) / 1e6
    }
}
