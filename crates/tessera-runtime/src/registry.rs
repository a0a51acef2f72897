//! Layer type registry.

use crate::operator::Operator;
use std::collections::HashMap;

/// Maps layer type names (e.g. `"Convolution"`) to the [`Operator`] that
/// instantiates them.
///
/// # Example
///
/// ```ignore
/// let mut registry = OperatorRegistry::new();
/// registry
///     .register("Convolution", ConvolutionOp)
///     .register("ReLU", ReluOp);
/// assert!(registry.contains("ReLU"));
/// ```
pub struct OperatorRegistry {
    operators: HashMap<String, Box<dyn Operator>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self {
            operators: HashMap::new(),
        }
    }

    /// Register an operator, replacing any previous one of the same name.
    ///
    /// Returns `self` for method chaining.
    pub fn register<O>(&mut self, name: &str, operator: O) -> &mut Self
    where
        O: Operator + 'static,
    {
        self.operators.insert(name.to_string(), Box::new(operator));
        self
    }

    /// Look up an operator by name.
    pub fn get(&self, name: &str) -> Option<&dyn Operator> {
        self.operators.get(name).map(|op| op.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operators.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Registered names, sorted.
    pub fn operator_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operators.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
