//! Net construction options.

use crate::capability::EngineSpec;
use tessera_compiler::CompileOptions;
use tessera_core::GraphNode;

/// Options for building a [`Net`](crate::net::Net).
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Rewrite rules applied before binding.
    pub compile: CompileOptions,
    /// Default engine string; a node's own engine tag takes precedence.
    pub engine: String,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            compile: CompileOptions::default(),
            engine: "NATIVE".to_string(),
        }
    }
}

impl NetConfig {
    pub fn with_compile(mut self, compile: CompileOptions) -> Self {
        self.compile = compile;
        self
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    /// Parsed engine for `node`.
    pub fn engine_for(&self, node: &GraphNode) -> tessera_core::Result<EngineSpec> {
        EngineSpec::parse(node.engine.as_deref().unwrap_or(&self.engine))
    }
}
