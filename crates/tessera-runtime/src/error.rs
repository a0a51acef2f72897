//! Error types for the runtime crate.

use thiserror::Error;

/// Runtime errors: build, weight loading, and execution.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Graph or configuration error from the core crate.
    #[error(transparent)]
    Core(#[from] tessera_core::Error),

    /// A trained parameter does not fit the target layer.
    #[error(
        "Cannot copy param {index} weights from layer '{layer}'; shape mismatch. \
         Source param shape is {source_shape}; target param shape is {target_shape}. \
         To learn this layer's parameters from scratch rather than copying from a \
         saved net, rename the layer."
    )]
    ShapeMismatch {
        layer: String,
        index: usize,
        source_shape: String,
        target_shape: String,
    },

    /// Source and target layers carry a different number of parameter blobs.
    #[error("Incompatible number of blobs for layer '{layer}': source has {source_count}, target has {target_count}")]
    BlobCountMismatch {
        layer: String,
        source_count: usize,
        target_count: usize,
    },

    /// Tensor not found.
    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    /// Invalid tensor.
    #[error("Invalid tensor: {0}")]
    TensorError(String),

    /// Dimension error.
    #[error("Dimension error: {0}")]
    DimensionError(String),

    /// Every capability tier failed to build a native layout.
    #[error("No capability tier could build a layout for '{layer}': {reasons}")]
    CapabilityExhausted { layer: String, reasons: String },

    /// Execution failed.
    #[error("Execution failed: {0}")]
    ExecutionError(String),

    /// Invalid input/output.
    #[error("Invalid input or output: {0}")]
    InvalidInputOutput(String),
}

/// Specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
