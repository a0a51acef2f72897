//! Layout negotiation, conversion caching, and execution for tessera graphs.
//!
//! This crate binds a compiled graph to tensor storages and runs it on the
//! host.
//!
//! # Architecture
//!
//! 1. **Storage** - every edge owns a canonical `f32` buffer and, when some
//!    operator prefers another layout, a native buffer kept coherent by a
//!    small state machine ([`TensorArena`])
//! 2. **Negotiation** - each operator reads and writes through
//!    [`LayoutDescriptor`]s whose conversions are built once and reused
//!    while the layouts they were built for stay the same
//! 3. **Execution** - [`Net`] drives setup, reshape, and forward over the
//!    layers, submitting work to the [`ExecutionContext`]'s current stream
//!
//! # Example
//!
//! ```ignore
//! use tessera_runtime::{ExecutionContext, Net, NetConfig, Tensor};
//!
//! let mut ctx = ExecutionContext::new();
//! let mut net = Net::from_graph(&graph, &registry, NetConfig::default(), &mut ctx)?;
//! net.set_input("data", &Tensor::filled(&[1, 3, 8, 8], 1.0), &mut ctx)?;
//! net.forward(&mut ctx, true)?;
//! let prob = net.output("prob", &mut ctx)?;
//! ```

pub mod buffer;
pub mod capability;
pub mod config;
pub mod conversion;
pub mod descriptor;
mod error;
pub mod layout;
pub mod negotiator;
pub mod net;
pub mod operator;
pub mod registry;
pub mod storage;
pub mod stream;
mod tensor;

// Public exports
pub use buffer::TensorBuffer;
pub use capability::{CapabilityTier, Engine, EngineSpec, negotiate, unavailable};
pub use config::NetConfig;
pub use conversion::{ConversionKey, ConversionPrimitive, ConversionSlot, ConversionStats};
pub use descriptor::LayoutDescriptor;
pub use error::{Result, RuntimeError};
pub use layout::{CHANNEL_BLOCK, DataType, Layout, LayoutKey, MemoryFormat};
pub use negotiator::{LayoutNegotiator, current_layout, output_layout, preferred_layout};
pub use net::Net;
pub use operator::{Layer, LayerCtx, Operator};
pub use registry::OperatorRegistry;
pub use storage::{SyncState, TensorArena, TensorId, TensorStorage};
pub use stream::{ExecutionContext, ExecutionStream, StreamId};
pub use tensor::Tensor;
