//! Core graph model, layer configuration, and pass traits for tessera.
//!
//! This crate provides the foundational abstractions the other tessera crates
//! depend on:
//! - Ordered operator graph (`GraphModel`, `GraphNode`, `WeightBlob`)
//! - Typed layer configuration (`LayerConfig` and friends)
//! - Consumer lookup used by every rewrite rule (`GraphModel::consumers`)
//! - Validated, indexed graphs (`CompiledGraph`)
//! - The `Pass` trait and fixed rewrite order (`RewriteStage`)

pub mod builder;
pub mod compiled;
pub mod config;
pub mod graph;
pub mod pass;

// Re-export commonly used types
pub use builder::GraphBuilder;
pub use compiled::{CompiledGraph, EdgeLocation};
pub use config::{
    BatchNormConfig, ConcatConfig, ConvolutionConfig, EltwiseConfig, EltwiseOp, FusionType,
    InnerProductConfig, LayerConfig, PoolMethod, PoolingConfig, ReluConfig, ScaleConfig,
};
pub use graph::{CompileState, Consumer, GraphModel, GraphNode, WeightBlob, shape_string};
pub use pass::{Pass, RewriteStage};

/// Result type using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for graph construction and rewriting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Static configuration problem: unresolved edge, duplicate producer,
    /// malformed operator, unknown engine.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Attribute error: {0}")]
    Attribute(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Shape error: {0}")]
    Shape(String),

    /// A capability tier could not build its layout. Recoverable by trying
    /// the next tier.
    #[error("Capability probe failed: {0}")]
    CapabilityProbe(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}
