//! Binding a compiled graph to storages and layers, and running it.

use crate::config::NetConfig;
use crate::error::{Result, RuntimeError};
use crate::layout::Layout;
use crate::negotiator::current_layout;
use crate::operator::{Layer, LayerCtx};
use crate::registry::OperatorRegistry;
use crate::storage::{TensorArena, TensorId};
use crate::stream::ExecutionContext;
use crate::tensor::Tensor;
use std::collections::HashMap;
use tessera_compiler::{compile, insert_splits};
use tessera_core::{CompiledGraph, Error, GraphModel, LayerConfig};

/// An executable network.
///
/// Holds one layer per node of the compiled graph (with split layers
/// inserted for every fanned-out edge) and one storage per distinct edge.
/// A node that computes in place shares its input's storage.
pub struct Net {
    name: String,
    graph: GraphModel,
    config: NetConfig,
    layers: Vec<Box<dyn Layer>>,
    layer_names: Vec<String>,
    bottom_ids: Vec<Vec<TensorId>>,
    top_ids: Vec<Vec<TensorId>>,
    arena: TensorArena,
    blob_ids: HashMap<String, TensorId>,
    input_blobs: Vec<(String, TensorId)>,
    output_blobs: Vec<(String, TensorId)>,
    /// Index of the last layer reading each blob.
    lifetimes: HashMap<TensorId, usize>,
    needs_reshape: bool,
}

impl Net {
    /// Compile `graph` with `config.compile` and build a net from the result.
    pub fn from_graph(
        graph: &GraphModel,
        registry: &OperatorRegistry,
        config: NetConfig,
        ctx: &mut ExecutionContext,
    ) -> Result<Self> {
        let compiled = compile(graph, &config.compile)?;
        Self::build(&compiled, registry, config, ctx)
    }

    /// Instantiate layers and storages for `compiled` and run the initial
    /// setup and reshape of every layer in order.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the first layer is not an Input
    /// layer, a layer type is not registered, a bottom is never produced, or
    /// a top is produced twice without being computed in place.
    #[tracing::instrument(skip_all, fields(net = %compiled.graph().name))]
    pub fn build(
        compiled: &CompiledGraph,
        registry: &OperatorRegistry,
        config: NetConfig,
        ctx: &mut ExecutionContext,
    ) -> Result<Self> {
        let graph = insert_splits(compiled.graph());
        match graph.nodes().first() {
            Some(node) if matches!(node.config, LayerConfig::Input { .. }) => {}
            Some(node) => {
                return Err(Error::Configuration(format!(
                    "first layer '{}' must be an Input layer, found {}",
                    node.name,
                    node.op_type()
                ))
                .into());
            }
            None => {
                return Err(Error::Configuration(format!("net '{}' has no layers", graph.name)).into());
            }
        }

        let mut net = Net {
            name: graph.name.clone(),
            graph: GraphModel::new(graph.name.clone()),
            config,
            layers: Vec::with_capacity(graph.len()),
            layer_names: Vec::with_capacity(graph.len()),
            bottom_ids: Vec::with_capacity(graph.len()),
            top_ids: Vec::with_capacity(graph.len()),
            arena: TensorArena::new(),
            blob_ids: HashMap::new(),
            input_blobs: Vec::new(),
            output_blobs: Vec::new(),
            lifetimes: HashMap::new(),
            needs_reshape: false,
        };

        for (index, node) in graph.nodes().iter().enumerate() {
            tracing::debug!(layer = %node.name, op_type = node.op_type(), "creating layer");
            let engine = net.config.engine_for(node)?;
            let operator = registry.get(node.op_type()).ok_or_else(|| {
                Error::Configuration(format!(
                    "no operator registered for layer type '{}' (layer '{}')",
                    node.op_type(),
                    node.name
                ))
            })?;
            let mut layer = operator.create_layer(&LayerCtx::new(node, engine))?;

            let mut bottoms = Vec::with_capacity(node.inputs.len());
            for (slot, name) in node.inputs.iter().enumerate() {
                let id = *net.blob_ids.get(name).ok_or_else(|| {
                    Error::Configuration(format!(
                        "Unknown bottom blob '{}' (layer '{}', bottom index {})",
                        name, node.name, slot
                    ))
                })?;
                net.lifetimes.insert(id, index);
                bottoms.push(id);
            }

            let declared_shapes = match &node.config {
                LayerConfig::Input { shapes } => Some(shapes),
                _ => None,
            };
            let mut tops = Vec::with_capacity(node.outputs.len());
            for (slot, name) in node.outputs.iter().enumerate() {
                if node.is_in_place(slot) {
                    tops.push(bottoms[slot]);
                    continue;
                }
                if net.blob_ids.contains_key(name) {
                    return Err(Error::Configuration(format!(
                        "Top blob '{}' produced by multiple sources.",
                        name
                    ))
                    .into());
                }
                let shape = match declared_shapes {
                    Some(shapes) => shapes.get(slot).cloned().ok_or_else(|| {
                        Error::Configuration(format!(
                            "input layer '{}' declares no shape for '{}'",
                            node.name, name
                        ))
                    })?,
                    None => Vec::new(),
                };
                let id = net.arena.create(name, &shape);
                net.blob_ids.insert(name.clone(), id);
                if declared_shapes.is_some() {
                    net.input_blobs.push((name.clone(), id));
                }
                tops.push(id);
            }

            layer.layer_setup(&bottoms, &tops, &mut net.arena)?;
            layer.reshape(&bottoms, &tops, &mut net.arena, ctx)?;
            for (name, &id) in node.outputs.iter().zip(&tops) {
                tracing::debug!(
                    layer = %node.name,
                    top = %name,
                    shape = ?net.arena.shape(id)?,
                    "top shape"
                );
            }

            net.layers.push(layer);
            net.layer_names.push(node.name.clone());
            net.bottom_ids.push(bottoms);
            net.top_ids.push(tops);
            net.graph.push(node.clone());
        }
        net.graph.compile_state = graph.compile_state.clone();

        let end = net.layers.len();
        for name in graph.output_edges() {
            if let Some(&id) = net.blob_ids.get(&name) {
                net.output_blobs.push((name, id));
                net.lifetimes.insert(id, end);
            }
        }
        for (_, id) in &net.input_blobs {
            net.lifetimes.insert(*id, end);
        }

        tracing::info!(
            layers = net.layers.len(),
            blobs = net.arena.len(),
            "net '{}' built",
            net.name
        );
        Ok(net)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The graph the net was built from, splits included.
    pub fn graph(&self) -> &GraphModel {
        &self.graph
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn arena(&self) -> &TensorArena {
        &self.arena
    }

    pub fn layer_names(&self) -> &[String] {
        &self.layer_names
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.input_blobs.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.output_blobs.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Run every layer in order, then wait on the current stream.
    ///
    /// If an input changed shape since the last reshape, the net is
    /// reshaped first when `reshape_if_needed` is set and an error is
    /// returned otherwise.
    pub fn forward(&mut self, ctx: &mut ExecutionContext, reshape_if_needed: bool) -> Result<()> {
        if self.needs_reshape {
            if !reshape_if_needed {
                return Err(RuntimeError::ExecutionError(format!(
                    "net '{}' has a reshaped input; reshape before forward",
                    self.name
                )));
            }
            self.reshape(ctx)?;
        }
        for (i, layer) in self.layers.iter_mut().enumerate() {
            let _span = tracing::debug_span!("forward", layer = %self.layer_names[i]).entered();
            layer.forward(&self.bottom_ids[i], &self.top_ids[i], &mut self.arena, ctx)?;
        }
        ctx.wait_current();
        Ok(())
    }

    /// Propagate input shapes through every layer without computing.
    pub fn reshape(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.reshape(&self.bottom_ids[i], &self.top_ids[i], &mut self.arena, ctx)?;
        }
        self.needs_reshape = false;
        Ok(())
    }

    /// Copy `tensor` into input blob `name`. A new shape takes effect at
    /// the next reshape.
    pub fn set_input(&mut self, name: &str, tensor: &Tensor, ctx: &mut ExecutionContext) -> Result<()> {
        let id = self
            .input_blobs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
            .ok_or_else(|| RuntimeError::InvalidInputOutput(format!("no input blob '{}'", name)))?;
        if self.arena.shape(id)? != tensor.shape() {
            self.arena.reshape(id, tensor.shape())?;
            self.needs_reshape = true;
        }
        self.arena.write_canonical(id, tensor.as_slice())?;
        ctx.submit(format!("set_input {}", name));
        Ok(())
    }

    /// Canonical contents of blob `name`.
    pub fn output(&mut self, name: &str, ctx: &mut ExecutionContext) -> Result<Tensor> {
        let id = self
            .blob_by_name(name)
            .ok_or_else(|| RuntimeError::TensorNotFound(name.to_string()))?;
        let shape = self.arena.shape(id)?.to_vec();
        let values = self.arena.canonical(id, ctx)?.to_vec();
        Tensor::from_vec(values, &shape)
    }

    /// Declare extra blobs as outputs, keeping them alive to the end.
    pub fn mark_outputs(&mut self, names: &[&str]) -> Result<()> {
        let end = self.layers.len();
        for name in names {
            let id = self
                .blob_by_name(name)
                .ok_or_else(|| RuntimeError::TensorNotFound(name.to_string()))?;
            if !self.output_blobs.iter().any(|(n, _)| n == name) {
                self.output_blobs.push((name.to_string(), id));
            }
            self.lifetimes.insert(id, end);
        }
        Ok(())
    }

    pub fn has_blob(&self, name: &str) -> bool {
        self.blob_ids.contains_key(name)
    }

    pub fn blob_by_name(&self, name: &str) -> Option<TensorId> {
        self.blob_ids.get(name).copied()
    }

    pub fn has_layer(&self, name: &str) -> bool {
        self.layer_index(name).is_some()
    }

    pub fn layer_by_name(&self, name: &str) -> Option<&dyn Layer> {
        self.layer_index(name).map(|i| self.layers[i].as_ref())
    }

    fn layer_index(&self, name: &str) -> Option<usize> {
        self.layer_names.iter().position(|n| n == name)
    }

    /// Index of the last layer that reads blob `name`. Inputs and outputs
    /// live to one past the last layer.
    pub fn blob_lifetime(&self, name: &str) -> Option<usize> {
        self.blob_by_name(name)
            .and_then(|id| self.lifetimes.get(&id).copied())
    }

    pub fn blob_shape(&self, name: &str) -> Result<Vec<usize>> {
        let id = self
            .blob_by_name(name)
            .ok_or_else(|| RuntimeError::TensorNotFound(name.to_string()))?;
        Ok(self.arena.shape(id)?.to_vec())
    }

    /// Layout blob `name` was last produced in.
    pub fn blob_layout(&self, name: &str) -> Result<Layout> {
        let id = self
            .blob_by_name(name)
            .ok_or_else(|| RuntimeError::TensorNotFound(name.to_string()))?;
        current_layout(&self.arena, id)
    }

    /// Copy learned parameters from `source`, matching layers by name.
    ///
    /// The source is compiled with the same options as this net so that
    /// merged layers carry merged parameter lists. Source layers with no
    /// counterpart are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::BlobCountMismatch` or
    /// `RuntimeError::ShapeMismatch` if a matched layer's parameters do not
    /// fit. Every matched layer is checked before any parameter is written,
    /// so on error this net is unchanged.
    #[tracing::instrument(skip_all, fields(net = %self.name, source = %source.name))]
    pub fn copy_trained_layers_from(&mut self, source: &GraphModel) -> Result<()> {
        let compiled = compile(source, &self.config.compile)?;
        let mut matched = Vec::new();
        for node in compiled.graph().nodes() {
            let Some(index) = self.layer_index(&node.name) else {
                tracing::warn!("Ignoring source layer {}", node.name);
                continue;
            };
            let target = self.layers[index].weights();
            if target.len() != node.weights.len() {
                return Err(RuntimeError::BlobCountMismatch {
                    layer: node.name.clone(),
                    source_count: node.weights.len(),
                    target_count: target.len(),
                });
            }
            for (j, (dst, src)) in target.iter().zip(&node.weights).enumerate() {
                if dst.shape != src.shape {
                    return Err(RuntimeError::ShapeMismatch {
                        layer: node.name.clone(),
                        index: j,
                        source_shape: src.shape_string(),
                        target_shape: dst.shape_string(),
                    });
                }
            }
            matched.push((index, node));
        }

        for (index, node) in matched {
            tracing::debug!(layer = %node.name, "copying from source layer");
            for (dst, src) in self.layers[index].weights_mut().iter_mut().zip(&node.weights) {
                dst.data.copy_from_slice(&src.data);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Net")
            .field("name", &self.name)
            .field("layers", &self.layer_names)
            .field("inputs", &self.input_names())
            .field("outputs", &self.output_names())
            .finish()
    }
}
