//! Call arguments.

use std::collections::BTreeMap;

/// Positional and keyword arguments of a module call.
///
/// Generic over the value type so the same shape carries source values into
/// a deployable module and backend values into a backend class.
#[derive(Debug, Clone, PartialEq)]
pub struct CallArgs<V> {
    /// Positional arguments, in order.
    pub positional: Vec<V>,
    /// Keyword arguments.
    pub keyword: BTreeMap<String, V>,
}

impl<V> Default for CallArgs<V> {
    fn default() -> Self {
        Self {
            positional: Vec::new(),
            keyword: BTreeMap::new(),
        }
    }
}

impl<V> CallArgs<V> {
    /// Creates empty arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates arguments from positional values only.
    pub fn positional(values: impl IntoIterator<Item = V>) -> Self {
        Self {
            positional: values.into_iter().collect(),
            keyword: BTreeMap::new(),
        }
    }

    /// Appends a positional argument.
    #[must_use]
    pub fn arg(mut self, value: impl Into<V>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Sets a keyword argument.
    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<V>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    /// Returns positional argument `index`, or the keyword `name`.
    pub fn get(&self, index: usize, name: &str) -> Option<&V> {
        self.positional.get(index).or_else(|| self.keyword.get(name))
    }

    /// Total number of arguments.
    pub fn len(&self) -> usize {
        self.positional.len() + self.keyword.len()
    }

    /// Returns `true` if there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    /// Maps every argument through a fallible conversion, keeping keyword
    /// names.
    pub fn try_map<U, E>(&self, mut f: impl FnMut(&V) -> Result<U, E>) -> Result<CallArgs<U>, E> {
        let positional = self.positional.iter().map(&mut f).collect::<Result<_, _>>()?;
        let mut keyword = BTreeMap::new();
        for (name, value) in &self.keyword {
            keyword.insert(name.clone(), f(value)?);
        }
        Ok(CallArgs {
            positional,
            keyword,
        })
    }
}
