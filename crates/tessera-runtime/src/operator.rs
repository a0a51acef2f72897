//! Operator and layer traits.
//!
//! An [`Operator`] is a stateless factory registered under a layer type
//! name. For every graph node of that type the net asks it for a [`Layer`],
//! the stateful instance that owns weights and a layout negotiator and runs
//! the setup / reshape / forward lifecycle.

use crate::capability::EngineSpec;
use crate::error::{Result, RuntimeError};
use crate::storage::{TensorArena, TensorId};
use crate::stream::ExecutionContext;
use tessera_core::{GraphNode, WeightBlob};

/// Build-time context passed to [`Operator::create_layer`].
pub struct LayerCtx<'a> {
    /// The node being instantiated.
    pub node: &'a GraphNode,
    /// Engine the layer runs on, after node-level overrides.
    pub engine: EngineSpec,
}

impl<'a> LayerCtx<'a> {
    pub fn new(node: &'a GraphNode, engine: EngineSpec) -> Self {
        Self { node, engine }
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Fail unless the node has exactly `inputs` inputs and `outputs` outputs.
    pub fn expect_arity(&self, inputs: usize, outputs: usize) -> Result<()> {
        if self.node.inputs.len() != inputs || self.node.outputs.len() != outputs {
            return Err(RuntimeError::InvalidInputOutput(format!(
                "{} layer '{}' takes {} inputs and {} outputs, got {} and {}",
                self.node.op_type(),
                self.node.name,
                inputs,
                outputs,
                self.node.inputs.len(),
                self.node.outputs.len()
            )));
        }
        Ok(())
    }
}

/// Factory for layers of one type.
pub trait Operator: Send + Sync {
    /// Layer type name, e.g. `"Convolution"`.
    fn name(&self) -> &str;

    /// Instantiate a layer for `ctx.node`.
    fn create_layer(&self, ctx: &LayerCtx) -> Result<Box<dyn Layer>>;
}

/// A layer instance bound into a net.
///
/// `bottoms` and `tops` are arena ids of the node's inputs and outputs in
/// order. A top that reuses a bottom's edge name has the same id.
pub trait Layer: Send {
    fn op_type(&self) -> &str;

    /// One-time setup at build, after every bottom has its shape.
    fn layer_setup(
        &mut self,
        _bottoms: &[TensorId],
        _tops: &[TensorId],
        _arena: &mut TensorArena,
    ) -> Result<()> {
        Ok(())
    }

    /// Recompute top shapes and layouts from the bottoms. No compute runs.
    fn reshape(
        &mut self,
        bottoms: &[TensorId],
        tops: &[TensorId],
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
    ) -> Result<()>;

    fn forward(
        &mut self,
        bottoms: &[TensorId],
        tops: &[TensorId],
        arena: &mut TensorArena,
        ctx: &mut ExecutionContext,
    ) -> Result<()>;

    /// Learned parameters, in the order weight files list them.
    fn weights(&self) -> &[WeightBlob] {
        &[]
    }

    fn weights_mut(&mut self) -> &mut [WeightBlob] {
        &mut []
    }
}
