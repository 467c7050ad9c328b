//! Normalisation building blocks for video tensors.
//!
//! This crate hosts the shape/dtype checks, precision policy, and memory
//! accounting shared by the causal convolution stack, together with the
//! normalisation primitives and their memory-bounded wrapper for
//! `(batch, channel, time, height, width)` inputs.

pub mod causal_norm;
pub mod checks;
pub mod memory;
pub mod norm;
pub mod precision;

use thiserror::Error;

pub use causal_norm::{ChunkedNorm, NormLayer};
pub use memory::MemoryLimit;

/// Errors raised by layer construction or forward passes.
#[derive(Debug, Error)]
pub enum LayerError {
    /// The layer does not handle the supplied tensor layout.
    #[error("unsupported operation: {op} on rank-{rank} tensor")]
    Unsupported { op: &'static str, rank: usize },
    /// A configuration or call-site invariant was violated.
    #[error("precondition violated: {0}")]
    Precondition(String),
    /// Failure bubbled up from the tensor backend.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, LayerError>;
