//! Source-framework module instances.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use crate::{EntityId, ObjectKey, TRACING_TARGET, Tensor, Value};

/// A live source module: a class identifier plus its attribute table.
///
/// Attributes and items are interior-mutable so that shared and cyclic
/// graphs can be assembled after the modules themselves exist, and so a
/// caller can swap a parameter in place (for example after fusing new
/// weights) without rebuilding the model.
#[derive(Debug)]
pub struct Module {
    class: EntityId,
    attributes: RwLock<BTreeMap<String, Value>>,
    items: RwLock<Option<Vec<Value>>>,
}

impl Module {
    /// Creates an empty module of the given class.
    pub fn new(class: impl Into<EntityId>) -> Self {
        Self {
            class: class.into(),
            attributes: RwLock::new(BTreeMap::new()),
            items: RwLock::new(None),
        }
    }

    /// Creates an iterable container module (list or sequential) holding
    /// `items` in order.
    pub fn container(class: impl Into<EntityId>, items: Vec<Value>) -> Self {
        Self {
            class: class.into(),
            attributes: RwLock::new(BTreeMap::new()),
            items: RwLock::new(Some(items)),
        }
    }

    /// Adds an attribute while building.
    #[must_use]
    pub fn with(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Wraps the module for sharing inside an object graph.
    #[must_use]
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Class identifier.
    #[inline]
    pub fn class_id(&self) -> &EntityId {
        &self.class
    }

    /// Returns a clone of the attribute `name`.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.attributes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Returns `true` if the attribute exists.
    pub fn has(&self, name: &str) -> bool {
        self.attributes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Sets (or replaces) the attribute `name`.
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let previous = self
            .attributes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), value.into());
        if previous.is_some() {
            tracing::trace!(
                target: TRACING_TARGET,
                class = %self.class,
                attribute = %name,
                "replaced module attribute"
            );
        }
    }

    /// Removes the attribute `name`, returning its previous value.
    pub fn remove(&self, name: &str) -> Option<Value> {
        self.attributes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Attribute names in sorted order.
    pub fn attribute_names(&self) -> Vec<String> {
        self.attributes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Returns `true` if the module holds an ordered item list.
    pub fn is_iterable(&self) -> bool {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Number of items (zero for non-iterable modules).
    pub fn len(&self) -> usize {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, Vec::len)
    }

    /// Returns `true` if the module holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a clone of item `index`.
    pub fn item(&self, index: usize) -> Option<Value> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(|items| items.get(index).cloned())
    }

    /// Appends an item, turning the module into an iterable container.
    pub fn push(&self, value: impl Into<Value>) {
        self.items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert_with(Vec::new)
            .push(value.into());
    }

    /// Every tensor reachable through attributes and items, keyed by its
    /// dotted path (`down.0.weight`). Shared tensors are reported once,
    /// under the first path they are reached by; cycles are not followed.
    pub fn named_tensors(self: &Arc<Self>) -> Vec<(String, Arc<Tensor>)> {
        let mut seen = HashSet::new();
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        collect_tensors(self, "", &mut visited, &mut seen, &mut out);
        out
    }
}

fn collect_tensors(
    module: &Arc<Module>,
    prefix: &str,
    visited: &mut HashSet<ObjectKey>,
    seen: &mut HashSet<ObjectKey>,
    out: &mut Vec<(String, Arc<Tensor>)>,
) {
    if !visited.insert(ObjectKey::of(module)) {
        return;
    }

    let join = |name: &str| {
        if prefix.is_empty() {
            name.to_owned()
        } else {
            format!("{prefix}.{name}")
        }
    };

    let mut entries: Vec<(String, Value)> = module
        .attribute_names()
        .into_iter()
        .filter_map(|name| module.get(&name).map(|value| (join(&name), value)))
        .collect();
    for index in 0..module.len() {
        if let Some(value) = module.item(index) {
            entries.push((join(&index.to_string()), value));
        }
    }

    for (path, value) in entries {
        match value {
            Value::Tensor(tensor) => {
                if seen.insert(ObjectKey::of(&tensor)) {
                    out.push((path, tensor));
                }
            }
            Value::Module(child) => collect_tensors(&child, &path, visited, seen, out),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear(weight: &Arc<Tensor>) -> Arc<Module> {
        Module::new("torch.nn.Linear")
            .with("weight", Arc::clone(weight))
            .with("bias", Value::None)
            .shared()
    }

    #[test]
    fn test_attributes() {
        let module = Module::new("torch.nn.Dropout").with("p", 0.1);
        assert!(module.has("p"));
        assert!(matches!(module.get("p"), Some(Value::Float(p)) if p == 0.1));
        assert_eq!(module.attribute_names(), vec!["p".to_string()]);
        assert!(module.remove("p").is_some());
        assert!(!module.has("p"));
    }

    #[test]
    fn test_container_items() {
        let list = Module::container("torch.nn.ModuleList", vec![Value::Int(1)]);
        assert!(list.is_iterable());
        list.push(Value::Int(2));
        assert_eq!(list.len(), 2);
        assert!(matches!(list.item(1), Some(Value::Int(2))));
        assert!(list.item(2).is_none());
        assert!(!Module::new("torch.nn.ReLU").is_iterable());
    }

    #[test]
    fn test_named_tensors_dedups_shared_weights() {
        let weight = Tensor::from_f32(vec![1, 1], &[2.0]).unwrap().shared();
        let root = Module::container(
            "torch.nn.Sequential",
            vec![
                Value::Module(linear(&weight)),
                Value::Module(linear(&weight)),
            ],
        )
        .shared();

        let named = root.named_tensors();
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].0, "0.weight");
    }

    #[test]
    fn test_named_tensors_terminates_on_cycles() {
        let weight = Tensor::from_f32(vec![1], &[1.0]).unwrap().shared();
        let parent = Module::new("my.Parent").with("w", Arc::clone(&weight)).shared();
        let child = Module::new("my.Child").shared();
        child.set("parent", Arc::clone(&parent));
        parent.set("child", Arc::clone(&child));

        let named = parent.named_tensors();
        assert_eq!(named.len(), 1);
        assert_eq!(named[0].0, "w");
    }
}
