//! Named hyperparameters of the GP kernels.
//!
//! Kernels are stateless: the live values are kept in a [`Hyperparameters`] map owned
//! by the [`GaussianProcess`](crate::GaussianProcess) and passed by reference to every kernel evaluation.

use crate::errors::{GpError, Result};
use linfa::Float;
use std::collections::BTreeMap;
use std::fmt;

/// Multiplicative scale of the kernel: `k(x, x') = weight^2 * f(x, x')`
pub const WEIGHT: &str = "weight";
/// Length scale of the squared exponential kernels
pub const SCALE: &str = "scale";

/// An ordered mapping from hyperparameter name to value
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Hyperparameters<F: Float>(BTreeMap<String, F>);

impl<F: Float> Hyperparameters<F> {
    /// Empty set of hyperparameters
    pub fn new() -> Self {
        Hyperparameters(BTreeMap::new())
    }

    /// Build hyperparameters from matching `names` and `values`
    pub fn from_values(names: &[&str], values: &[F]) -> Result<Self> {
        if names.len() != values.len() {
            return Err(GpError::ShapeError(format!(
                "{} hyperparameter values given for {} names",
                values.len(),
                names.len()
            )));
        }
        Ok(names
            .iter()
            .zip(values.iter())
            .map(|(n, v)| (n.to_string(), *v))
            .collect())
    }

    /// Builder-like insertion
    pub fn with(mut self, name: &str, value: F) -> Self {
        self.insert(name, value);
        self
    }

    /// Set `name` to `value`, returning the previous value if any
    pub fn insert(&mut self, name: &str, value: F) -> Option<F> {
        self.0.insert(name.to_string(), value)
    }

    /// Value of `name` if present
    pub fn get(&self, name: &str) -> Option<F> {
        self.0.get(name).copied()
    }

    /// Value of `name`, an error if not present
    pub fn value(&self, name: &str) -> Result<F> {
        self.get(name)
            .ok_or_else(|| GpError::UnknownHyperparameter(format!("`{name}` is not set")))
    }

    /// Kernel weight
    pub fn weight(&self) -> Result<F> {
        self.value(WEIGHT)
    }

    /// Whether `name` is present
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Values of the given `names` in the same order
    pub fn select(&self, names: &[&str]) -> Result<Vec<F>> {
        names.iter().map(|n| self.value(n)).collect()
    }

    /// Overwrite or add every entry of `other`
    pub fn merge(&mut self, other: &Hyperparameters<F>) {
        for (name, value) in other.iter() {
            self.insert(name, value);
        }
    }

    /// Hyperparameter names in lexicographic order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(|k| k.as_str())
    }

    /// (name, value) pairs in lexicographic order of names
    pub fn iter(&self) -> impl Iterator<Item = (&str, F)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Number of hyperparameters
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there is no hyperparameter
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<F: Float, S: Into<String>> FromIterator<(S, F)> for Hyperparameters<F> {
    fn from_iter<I: IntoIterator<Item = (S, F)>>(iter: I) -> Self {
        Hyperparameters(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl<F: Float> fmt::Display for Hyperparameters<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let entries = self
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>();
        write!(f, "{{{}}}", entries.join(", "))
    }
}
