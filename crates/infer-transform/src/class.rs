//! Backend class and function abstractions.

use std::fmt;
use std::sync::Arc;

use infer_core::{CallArgs, EntityId, Error, Result};

use crate::BackendValue;
use crate::proxy::ModuleProxy;

/// Methods a proxy dispatches to its backend class regardless of the
/// source class.
pub const FORWARD_METHODS: &[&str] = &["forward", "_conv_forward"];

/// A backend replacement for a source module class.
///
/// Implementations are stateless: all per-instance state (parameters,
/// children, configuration attributes) is read through the receiver proxy.
pub trait BackendClass: Send + Sync {
    /// Identifier of the class in the backend namespace.
    fn entity(&self) -> &EntityId;

    /// Runs the module on `args` with `this` as receiver.
    fn forward(&self, this: &dyn ModuleProxy, args: CallArgs<BackendValue>) -> Result<BackendValue>;

    /// Dispatches a named method. The default only knows the forward
    /// aliases.
    fn call_method(
        &self,
        name: &str,
        this: &dyn ModuleProxy,
        args: CallArgs<BackendValue>,
    ) -> Result<BackendValue> {
        if FORWARD_METHODS.contains(&name) {
            return self.forward(this, args);
        }
        Err(Error::AttributeNotFound {
            class: self.entity().clone(),
            attribute: name.to_owned(),
        })
    }
}

impl fmt::Debug for dyn BackendClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BackendClass").field(self.entity()).finish()
    }
}

/// A backend free function.
pub type BackendFunction =
    Arc<dyn Fn(CallArgs<BackendValue>) -> Result<BackendValue> + Send + Sync>;

/// Wraps a closure as a [`BackendFunction`].
pub fn backend_function<F>(f: F) -> BackendFunction
where
    F: Fn(CallArgs<BackendValue>) -> Result<BackendValue> + Send + Sync + 'static,
{
    Arc::new(f)
}
