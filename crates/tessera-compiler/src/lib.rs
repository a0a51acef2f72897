//! Static graph rewriter for tessera.
//!
//! This crate takes a declared operator graph and rewrites it into a smaller,
//! semantically equivalent one. The rewrite rules run in a fixed order
//! (see [`RewriteStage`]):
//! 1. **ConvNormFolding** - fold normalization weights into a convolution (opt-in)
//! 2. **NormAffineFusion** - merge an affine node into the normalization before it
//! 3. **ConvActivationFusion** - fuse a rectifier into its convolution
//! 4. **NormActivationFusion** - fuse a rectifier into its normalization
//! 5. **NormInplaceRename** - give in-place normalization outputs their own name
//! 6. **StrideRedistribution** - move sibling 1x1 strides onto a shared ancestor
//! 7. **ConvSumFusion** - fold an elementwise add into a convolution
//!
//! Every rule is a pure `GraphModel -> GraphModel` function, and each can be
//! disabled through [`CompileOptions`].
//!
//! # Example
//!
//! ```
//! use tessera_compiler::{CompileOptions, compile};
//! use tessera_core::{BatchNormConfig, GraphBuilder, ScaleConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let graph = GraphBuilder::new("net")
//!     .input("data", &[1, 2, 4, 4])
//!     .batch_norm("bn", "data", "x", BatchNormConfig::default())
//!     .scale("scale", "x", "y", ScaleConfig::default())
//!     .build();
//!
//! let compiled = compile(&graph, &CompileOptions::default())?;
//! assert_eq!(compiled.graph().len(), 2);
//! # Ok(())
//! # }
//! ```

pub mod passes;
pub mod splits;

pub use passes::{
    ActivationFusionPass, ActivationProducer, ConvNormFoldingPass, ConvSumFusionPass,
    NormAffineFusionPass, NormInplaceRenamePass, StrideRedistributionPass,
};
pub use splits::insert_splits;

// Re-export commonly used types from tessera-core
pub use tessera_core::{CompiledGraph, GraphModel, Pass, RewriteStage};

use std::collections::BTreeSet;
use tessera_core::Result;

/// Which rewrite stages run.
///
/// The default enables every stage except [`RewriteStage::ConvNormFolding`],
/// which rewrites trained weights and must be asked for explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    enabled: BTreeSet<RewriteStage>,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self::all().disable(RewriteStage::ConvNormFolding)
    }
}

impl CompileOptions {
    /// Every stage enabled.
    pub fn all() -> Self {
        Self {
            enabled: RewriteStage::ALL.into_iter().collect(),
        }
    }

    /// No stage enabled; compiling only validates the graph.
    pub fn none() -> Self {
        Self {
            enabled: BTreeSet::new(),
        }
    }

    pub fn enable(mut self, stage: RewriteStage) -> Self {
        self.enabled.insert(stage);
        self
    }

    pub fn disable(mut self, stage: RewriteStage) -> Self {
        self.enabled.remove(&stage);
        self
    }

    pub fn is_enabled(&self, stage: RewriteStage) -> bool {
        self.enabled.contains(&stage)
    }

    /// Enabled stages in pipeline order.
    pub fn stages(&self) -> impl Iterator<Item = RewriteStage> + '_ {
        self.enabled.iter().copied()
    }
}

/// Compiler pipeline with pluggable passes.
///
/// Built-in passes are registered at construction. Custom passes can be
/// added via `add_pass()`; they run in the slot named by their
/// [`Pass::stage`], after the built-in pass of the same stage.
pub struct CompilerPipeline {
    /// All passes to run, ordered by (stage, registration order).
    passes: Vec<Box<dyn Pass>>,

    options: CompileOptions,
}

impl CompilerPipeline {
    /// Create a pipeline with every built-in pass registered.
    pub fn new(options: CompileOptions) -> Self {
        Self {
            passes: passes::builtin_passes(),
            options,
        }
    }

    /// Add a custom pass to the pipeline.
    ///
    /// # Returns
    ///
    /// Returns a mutable reference to self for method chaining.
    pub fn add_pass(&mut self, pass: impl Pass + 'static) -> &mut Self {
        self.passes.push(Box::new(pass));
        self
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Names of the passes that would run, in order.
    pub fn pass_names(&mut self) -> Vec<String> {
        self.passes.sort_by_key(|p| p.stage());
        self.passes
            .iter()
            .filter(|p| self.options.is_enabled(p.stage()))
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Run every enabled pass over `graph` and validate the result.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the input graph reads an edge before it is produced
    /// - an edge has two producers without being computed in place
    /// - any pass fails
    #[tracing::instrument(skip_all, fields(graph = %graph.name, num_nodes = graph.len()))]
    pub fn compile(&mut self, graph: &GraphModel) -> Result<CompiledGraph> {
        // Unresolved references are reported against the declared graph, not
        // a rewritten one.
        tessera_core::compiled::index_producers(graph)?;

        // Stable: passes of one stage keep registration order
        self.passes.sort_by_key(|p| p.stage());

        let mut current = graph.clone();
        for pass in &self.passes {
            if !self.options.is_enabled(pass.stage()) {
                tracing::debug!(name = pass.name(), stage = ?pass.stage(), "pass disabled");
                continue;
            }
            let _span =
                tracing::debug_span!("pass", name = pass.name(), stage = ?pass.stage()).entered();
            let before = current.len();
            current = pass.run(&current)?;
            tracing::debug!(before, after = current.len(), "pass complete");
        }

        CompiledGraph::new(current)
    }
}

/// Compile `graph` with the built-in passes enabled by `options`.
///
/// Deterministic: the same graph and options always produce the same result.
pub fn compile(graph: &GraphModel, options: &CompileOptions) -> Result<CompiledGraph> {
    CompilerPipeline::new(options.clone()).compile(graph)
}
