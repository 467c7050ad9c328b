//! Error types emitted by the causal convolution stack.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConvError>;

#[derive(Debug, Error)]
pub enum ConvError {
    /// A caller or configuration bug: impossible memory ceiling, unset memory
    /// state, overlap larger than the available data.
    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Point-to-point exchange with a peer rank failed.
    #[error("sequence-parallel communication failed: {0}")]
    Communication(String),

    #[error("shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("missing keys in state dict: {0:?}")]
    MissingKeys(Vec<String>),

    #[error("unexpected keys in state dict: {0:?}")]
    UnexpectedKeys(Vec<String>),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Layer(#[from] layers::LayerError),

    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl ConvError {
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    pub fn communication(message: impl Into<String>) -> Self {
        Self::Communication(message.into())
    }
}
