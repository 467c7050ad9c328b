//! Small tags shared by the layer, the executor, and configuration.

use serde::Deserialize;

/// Causal-memory mode supplied by the caller on every forward call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryState {
    /// Not a valid forward argument; exists so forgetting to pick one fails fast.
    #[default]
    Unset,
    /// First chunk of a stream: drop any stored cache, then record a new one.
    Initializing,
    /// Continuation chunk: consume the stored cache, then record a new one.
    Active,
    /// One-shot call: never read or write the cache.
    Disabled,
}

impl MemoryState {
    /// INITIALIZING and ACTIVE both keep causal memory.
    pub fn uses_memory(self) -> bool {
        matches!(self, Self::Initializing | Self::Active)
    }
}

/// How a stored 2D kernel is expanded into the layer's 3D kernel on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InflationMode {
    /// Load the checkpoint as-is; shapes must match exactly.
    #[default]
    None,
    /// Zero kernel with the 2D taps copied into the last temporal slice.
    Tail,
    /// 2D taps tiled over every temporal slice and divided by the depth.
    Replicate,
}

/// Placement tier for the boundary cache between calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryDevice {
    /// Keep the cache wherever the input lives.
    #[default]
    Same,
    /// Offload the cache to host memory.
    Cpu,
}
