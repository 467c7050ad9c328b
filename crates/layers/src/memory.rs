//! Peak-memory accounting for memory-bounded layers.
//!
//! Footprints are estimated as `product(shape) * element_size`; no allocator
//! overhead or intermediate buffers are modelled.

use candle_core::DType;

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Memory ceiling applied to a single layer invocation. Unlimited by default.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryLimit {
    bytes: f64,
}

impl MemoryLimit {
    pub const UNLIMITED: Self = Self {
        bytes: f64::INFINITY,
    };

    pub fn unlimited() -> Self {
        Self::UNLIMITED
    }

    pub fn from_bytes(bytes: u64) -> Self {
        Self {
            bytes: bytes as f64,
        }
    }

    pub fn from_gib(gib: f64) -> Self {
        Self {
            bytes: gib * BYTES_PER_GIB,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes.is_infinite()
    }

    pub fn bytes(&self) -> f64 {
        self.bytes
    }

    pub fn gib(&self) -> f64 {
        self.bytes / BYTES_PER_GIB
    }

    /// True when a computation of `footprint` bytes can run in one piece.
    pub fn admits(&self, footprint: usize) -> bool {
        (footprint as f64) < self.bytes
    }

    /// True when `footprint` bytes strictly exceed the ceiling.
    pub fn is_exceeded_by(&self, footprint: usize) -> bool {
        (footprint as f64) > self.bytes
    }

    /// Number of pieces needed so that each stays near the ceiling.
    pub fn num_splits(&self, footprint: usize) -> usize {
        if self.is_unlimited() || self.bytes <= 0.0 {
            return if self.is_unlimited() { 1 } else { footprint.max(1) };
        }
        ((footprint as f64) / self.bytes).ceil().max(1.0) as usize
    }
}

impl Default for MemoryLimit {
    fn default() -> Self {
        Self::UNLIMITED
    }
}

/// Estimated size in bytes of a dense tensor with the given dims and dtype.
pub fn footprint_bytes(dims: &[usize], dtype: DType) -> usize {
    dims.iter().product::<usize>() * dtype.size_in_bytes()
}

/// Same estimate expressed in GiB, for log lines.
pub fn footprint_gib(dims: &[usize], dtype: DType) -> f64 {
    footprint_bytes(dims, dtype) as f64 / BYTES_PER_GIB
}
