//! Memory-bounded, causally streamable 3D convolution for video tensors.
//!
//! [`InflatedCausalConv3d`] is the entry point. It consumes a clip (or a list
//! of temporal chunks) laid out as `(batch, channel, time, height, width)`
//! together with a [`MemoryState`] and:
//!
//! * prefixes causal context from its [`BoundaryCache`], from the previous
//!   sequence-parallel rank, or from duplicated first frames;
//! * hands the work to [`MemoryBoundedConvExecutor`], which splits it along
//!   height and width whenever the materialised input would exceed the
//!   configured [`MemoryLimit`](layers::MemoryLimit);
//! * records the trailing frames for the next streamed call.
//!
//! Image checkpoints are turned into video checkpoints on load through
//! [`inflation`].

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod descriptor;
pub mod distributed;
pub mod errors;
pub mod executor;
pub mod inflation;
pub mod layer;
pub mod primitive;
pub mod types;

pub use cache::{extend_head, remove_head, BoundaryCache};
pub use checkpoint::{load_parameter_store, save_parameter_store, LoadReport, ParameterStore};
pub use config::{MemoryTier, RuntimeConfig};
pub use descriptor::ConvDescriptor;
pub use distributed::{channel_group, ChannelRank, SequenceParallelGroup};
pub use errors::{ConvError, Result};
pub use executor::MemoryBoundedConvExecutor;
pub use inflation::{inflate_bias, inflate_weight, modify_state_dict};
pub use layer::{ConvInput, InflatedCausalConv3d};
pub use primitive::Conv3d;
pub use types::{InflationMode, MemoryDevice, MemoryState};
