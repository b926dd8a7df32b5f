//! Lazily-realizing stand-ins for source submodules.

mod synthetic;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use infer_core::{CallArgs, EntityId, Error, Module, ObjectKey, Result, Tensor, Value};

use crate::class::FORWARD_METHODS;
use crate::convert::Origin;
use crate::{
    BackendClass, BackendTensor, BackendValue, ConversionSession, TRACING_TARGET_PROXY,
    TransformManager,
};

/// Joins a dotted attribute path.
pub fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_owned()
    } else {
        format!("{prefix}.{name}")
    }
}

/// What backend classes can do with the module they run on.
pub trait ModuleProxy: Send + Sync {
    /// Source class of the wrapped module.
    fn class_id(&self) -> &EntityId;

    /// Dotted attribute path of the module inside the model (empty for the
    /// root).
    fn path(&self) -> &str;

    /// Returns the backend view of the tensor attribute `name`.
    fn get_parameter(&self, name: &str) -> Result<Arc<BackendTensor>>;

    /// Returns the converted submodule (or container of submodules) `name`.
    fn get_child(&self, name: &str) -> Result<BackendValue>;

    /// Returns any attribute, converted.
    fn attribute(&self, name: &str) -> Result<BackendValue>;

    /// Returns `true` if [`ModuleProxy::attribute`] would find `name`.
    fn has_attribute(&self, name: &str) -> bool;

    /// Number of items of an iterable module.
    fn len(&self) -> usize;

    /// Returns `true` if the module holds no items.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns item `index`, converted. Negative indices count from the end.
    fn index(&self, index: isize) -> Result<BackendValue>;

    /// Runs the backend replacement's forward pass.
    fn invoke(&self, args: CallArgs<BackendValue>) -> Result<BackendValue>;

    /// Dispatches a named method of the backend replacement.
    fn call_method(&self, name: &str, args: CallArgs<BackendValue>) -> Result<BackendValue>;
}

/// Proxy over one source module inside one conversion session.
///
/// Parameters and children are converted on first access and memoized.
/// The proxy never outlives its purpose: it only holds a weak reference to
/// the session that created it.
pub struct ProxySubmodule {
    source: Arc<Module>,
    path: String,
    session: Weak<ConversionSession>,
    class: OnceLock<Arc<dyn BackendClass>>,
    parameters: Mutex<HashMap<String, (Arc<Tensor>, Arc<BackendTensor>)>>,
    children: Mutex<HashMap<String, (Value, BackendValue)>>,
    items: Mutex<HashMap<usize, (Value, BackendValue)>>,
}

impl ProxySubmodule {
    pub(crate) fn new(source: Arc<Module>, path: String, session: Weak<ConversionSession>) -> Self {
        Self {
            source,
            path,
            session,
            class: OnceLock::new(),
            parameters: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
            items: Mutex::new(HashMap::new()),
        }
    }

    /// The wrapped source module.
    pub fn source(&self) -> &Arc<Module> {
        &self.source
    }

    /// The session that created this proxy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionReleased`] once the session is dropped.
    pub fn session(&self) -> Result<Arc<ConversionSession>> {
        self.session.upgrade().ok_or(Error::SessionReleased)
    }

    /// Resolves (once) the backend replacement class.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoBackendEquivalent`] when the class does not
    /// resolve.
    pub fn backend_class(&self) -> Result<Arc<dyn BackendClass>> {
        if let Some(class) = self.class.get() {
            return Ok(Arc::clone(class));
        }
        let session = self.session()?;
        self.backend_class_with(session.manager())
    }

    pub(crate) fn backend_class_with(&self, manager: &TransformManager) -> Result<Arc<dyn BackendClass>> {
        if let Some(class) = self.class.get() {
            return Ok(Arc::clone(class));
        }
        let class = manager
            .transform_class(self.source.class_id())
            .map_err(|err| match err {
                Error::UnresolvedEntity(_) => Error::NoBackendEquivalent(self.source.class_id().clone()),
                other => other,
            })?;
        Ok(Arc::clone(self.class.get_or_init(|| class)))
    }

    /// Pre-binds the backend class, e.g. from a loaded graph plan.
    ///
    /// Returns `false` if a different class was already bound.
    pub fn install_class(&self, class: Arc<dyn BackendClass>) -> bool {
        let entity = class.entity().clone();
        let bound = self.class.get_or_init(|| class);
        bound.entity() == &entity
    }

    /// The bound backend class, if resolution already happened.
    pub fn resolved_class(&self) -> Option<Arc<dyn BackendClass>> {
        self.class.get().cloned()
    }

    /// Walks a dotted path (`down.0.conv`) from this proxy. Numeric
    /// segments index iterable modules and list or tuple attributes.
    ///
    /// # Errors
    ///
    /// Fails if a segment is missing or does not lead to a module.
    pub fn descendant(self: &Arc<Self>, path: &str) -> Result<Arc<ProxySubmodule>> {
        let mut current = BackendValue::Module(Arc::clone(self));
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            current = match current {
                BackendValue::Module(proxy) => match segment.parse::<isize>() {
                    Ok(index) if proxy.source.is_iterable() => proxy.index(index)?,
                    _ => proxy.get_child(segment)?,
                },
                BackendValue::List(items) | BackendValue::Tuple(items) => {
                    let len = items.len();
                    segment
                        .parse::<usize>()
                        .ok()
                        .and_then(|index| items.into_iter().nth(index))
                        .ok_or_else(|| {
                            Error::InvalidArgument(format!(
                                "'{segment}' in path '{path}' does not index a sequence of {len}"
                            ))
                        })?
                }
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "'{segment}' in path '{path}' follows a {}, not a module",
                        other.kind_name()
                    )));
                }
            };
        }
        match current {
            BackendValue::Module(proxy) => Ok(proxy),
            other => Err(Error::InvalidArgument(format!(
                "path '{path}' leads to a {}, not a module",
                other.kind_name()
            ))),
        }
    }

    /// Realizes every submodule reachable from this proxy and returns the
    /// proxies in depth-first order, this one first.
    ///
    /// # Errors
    ///
    /// Propagates conversion failures of any reached attribute.
    pub fn realize_tree(self: &Arc<Self>) -> Result<Vec<Arc<ProxySubmodule>>> {
        let mut visited = HashSet::new();
        let mut out = Vec::new();
        realize(self, &mut visited, &mut out)?;
        Ok(out)
    }

    fn origin<'a>(&'a self, attribute: &'a str) -> Origin<'a> {
        Origin {
            attribute,
            owner: self.source.class_id(),
        }
    }

    fn not_found(&self, name: &str) -> Error {
        Error::AttributeNotFound {
            class: self.source.class_id().clone(),
            attribute: name.to_owned(),
        }
    }
}

fn realize(
    proxy: &Arc<ProxySubmodule>,
    visited: &mut HashSet<ObjectKey>,
    out: &mut Vec<Arc<ProxySubmodule>>,
) -> Result<()> {
    if !visited.insert(ObjectKey::of(proxy)) {
        return Ok(());
    }
    out.push(Arc::clone(proxy));

    let mut reached = Vec::new();
    for name in proxy.source.attribute_names() {
        if let Some(Value::Module(_) | Value::List(_) | Value::Tuple(_)) = proxy.source.get(&name) {
            collect_modules(proxy.get_child(&name)?, &mut reached);
        }
    }
    for index in 0..proxy.len() {
        collect_modules(proxy.index(index as isize)?, &mut reached);
    }
    for child in &reached {
        realize(child, visited, out)?;
    }
    Ok(())
}

fn collect_modules(value: BackendValue, out: &mut Vec<Arc<ProxySubmodule>>) {
    match value {
        BackendValue::Module(proxy) => out.push(proxy),
        BackendValue::List(items) | BackendValue::Tuple(items) => {
            for item in items {
                collect_modules(item, out);
            }
        }
        _ => {}
    }
}

impl ModuleProxy for ProxySubmodule {
    fn class_id(&self) -> &EntityId {
        self.source.class_id()
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn get_parameter(&self, name: &str) -> Result<Arc<BackendTensor>> {
        let tensor = match self.source.get(name) {
            Some(Value::Tensor(tensor)) => tensor,
            Some(other) => {
                return Err(Error::InvalidArgument(format!(
                    "'{}.{name}' is a {}, not a tensor",
                    self.source.class_id(),
                    other.class_id()
                )));
            }
            None => return Err(self.not_found(name)),
        };

        let memo = self
            .parameters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        if let Some((source, converted)) = &memo {
            if Arc::ptr_eq(source, &tensor) {
                return Ok(Arc::clone(converted));
            }
            tracing::debug!(
                target: TRACING_TARGET_PROXY,
                path = %join_path(&self.path, name),
                "parameter replaced, reconverting"
            );
        }

        let converted = self.session()?.convert_tensor(&tensor)?;
        self.parameters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), (tensor, Arc::clone(&converted)));
        Ok(converted)
    }

    fn get_child(&self, name: &str) -> Result<BackendValue> {
        let value = self.source.get(name).ok_or_else(|| self.not_found(name))?;
        if let Some((source, converted)) = self
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            && source.same_as(&value)
        {
            return Ok(converted.clone());
        }

        let converted = self.session()?.convert_at(
            &value,
            &join_path(&self.path, name),
            Some(self.origin(name)),
        )?;
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), (value, converted.clone()));
        Ok(converted)
    }

    fn attribute(&self, name: &str) -> Result<BackendValue> {
        let session = self.session()?;
        if let Some(value) = synthetic::lookup(self, &session, name) {
            return value;
        }
        match self.source.get(name) {
            Some(Value::Tensor(_)) => self.get_parameter(name).map(BackendValue::Tensor),
            Some(Value::Module(_) | Value::List(_) | Value::Tuple(_)) => self.get_child(name),
            Some(value) => {
                session.convert_at(&value, &join_path(&self.path, name), Some(self.origin(name)))
            }
            None => Err(self.not_found(name)),
        }
    }

    fn has_attribute(&self, name: &str) -> bool {
        synthetic::has(self.source.class_id(), name) || self.source.has(name)
    }

    fn len(&self) -> usize {
        self.source.len()
    }

    fn index(&self, index: isize) -> Result<BackendValue> {
        if !self.source.is_iterable() {
            return Err(Error::NotIndexable(self.source.class_id().clone()));
        }
        let len = self.source.len();
        let resolved = if index < 0 { index + len as isize } else { index };
        let item = usize::try_from(resolved)
            .ok()
            .and_then(|i| self.source.item(i).map(|item| (i, item)));
        let Some((position, value)) = item else {
            return Err(Error::IndexOutOfRange {
                class: self.source.class_id().clone(),
                index,
                len,
            });
        };

        if let Some((source, converted)) = self
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&position)
            && source.same_as(&value)
        {
            return Ok(converted.clone());
        }

        let name = position.to_string();
        let converted = self.session()?.convert_at(
            &value,
            &join_path(&self.path, &name),
            Some(self.origin(&name)),
        )?;
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(position, (value, converted.clone()));
        Ok(converted)
    }

    fn invoke(&self, args: CallArgs<BackendValue>) -> Result<BackendValue> {
        self.backend_class()?.forward(self, args)
    }

    fn call_method(&self, name: &str, args: CallArgs<BackendValue>) -> Result<BackendValue> {
        let class_id = self.source.class_id();
        if !FORWARD_METHODS.contains(&name) && !synthetic::extra_methods(class_id).contains(&name) {
            return Err(self.not_found(name));
        }
        self.backend_class()?.call_method(name, self, args)
    }
}

impl fmt::Debug for ProxySubmodule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxySubmodule")
            .field("class", self.source.class_id())
            .field("path", &self.path)
            .field("resolved", &self.class.get().map(|c| c.entity().clone()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::nn::Identity;
    use crate::{MemoryFormat, Settings};

    struct Attention {
        entity: EntityId,
    }

    impl BackendClass for Attention {
        fn entity(&self) -> &EntityId {
            &self.entity
        }

        fn forward(&self, _: &dyn ModuleProxy, args: CallArgs<BackendValue>) -> Result<BackendValue> {
            Ok(args.positional.into_iter().next().unwrap_or_default())
        }

        fn call_method(
            &self,
            name: &str,
            this: &dyn ModuleProxy,
            args: CallArgs<BackendValue>,
        ) -> Result<BackendValue> {
            match name {
                "get_attention_scores" => Ok(BackendValue::Str(format!("scores@{}", this.path()))),
                _ => self.forward(this, args),
            }
        }
    }

    fn session_with(settings: Settings, format: MemoryFormat) -> Arc<ConversionSession> {
        ConversionSession::new(TransformManager::with_builtins(settings).shared(), format)
    }

    fn session() -> Arc<ConversionSession> {
        session_with(Settings::default(), MemoryFormat::default())
    }

    fn weight(values: &[f32]) -> Arc<Tensor> {
        Tensor::from_f32(vec![values.len()], values)
            .unwrap()
            .into_parameter()
            .shared()
    }

    #[test]
    fn test_parameters_are_memoized() {
        let session = session();
        let module = Module::new("torch.nn.Linear").with("weight", weight(&[1.0])).shared();
        let proxy = session.convert_module(&module).unwrap();
        let a = proxy.get_parameter("weight").unwrap();
        let b = proxy.get_parameter("weight").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(
            proxy.get_parameter("bias"),
            Err(Error::AttributeNotFound { .. })
        ));
    }

    #[test]
    fn test_replaced_parameters_are_reconverted() {
        let session = session();
        let module = Module::new("torch.nn.Linear").with("weight", weight(&[1.0])).shared();
        let proxy = session.convert_module(&module).unwrap();
        let before = proxy.get_parameter("weight").unwrap();
        module.set("weight", weight(&[2.0]));
        let after = proxy.get_parameter("weight").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.to_f32_vec().unwrap(), vec![2.0]);
    }

    #[test]
    fn test_shared_weights_stay_shared() {
        let session = session();
        let shared = weight(&[1.0, 2.0]);
        let a = Module::new("torch.nn.Linear").with("weight", Arc::clone(&shared));
        let b = Module::new("torch.nn.Linear").with("weight", Arc::clone(&shared));
        let root = Module::new("my.Pair").with("a", a.shared()).with("b", b.shared()).shared();
        let proxy = session.convert_module(&root).unwrap();

        let a = proxy.get_child("a").unwrap();
        let b = proxy.get_child("b").unwrap();
        let wa = a.as_module().unwrap().get_parameter("weight").unwrap();
        let wb = b.as_module().unwrap().get_parameter("weight").unwrap();
        assert!(Arc::ptr_eq(&wa, &wb));
    }

    #[test]
    fn test_indexing() {
        let session = session();
        let list = Module::container(
            "torch.nn.ModuleList",
            vec![
                Value::module(Module::new("torch.nn.ReLU")),
                Value::module(Module::new("torch.nn.SiLU")),
            ],
        )
        .shared();
        let proxy = session.convert_module(&list).unwrap();
        assert_eq!(proxy.len(), 2);

        let last = proxy.index(-1).unwrap();
        assert_eq!(last.as_module().unwrap().class_id().as_str(), "torch.nn.SiLU");
        assert_eq!(last.as_module().unwrap().path(), "1");
        assert_eq!(
            proxy.index(1).unwrap().object_key(),
            last.object_key()
        );
        assert!(matches!(
            proxy.index(2),
            Err(Error::IndexOutOfRange { index: 2, len: 2, .. })
        ));
        assert!(matches!(
            proxy.index(-3),
            Err(Error::IndexOutOfRange { index: -3, .. })
        ));

        let relu = proxy.index(0).unwrap();
        assert!(matches!(
            relu.as_module().unwrap().index(0),
            Err(Error::NotIndexable(_))
        ));
    }

    #[test]
    fn test_synthetic_attributes() {
        let session = session_with(
            Settings::default().with_fused_linear(true),
            MemoryFormat::ChannelsLast,
        );
        let with_bias = Module::new("torch.nn.Linear")
            .with("weight", weight(&[1.0]))
            .with("bias", weight(&[0.5]))
            .shared();
        let proxy = session.convert_module(&with_bias).unwrap();
        assert!(proxy.has_attribute("use_fused_matmul_bias"));
        assert!(matches!(
            proxy.attribute("use_fused_matmul_bias").unwrap(),
            BackendValue::Bool(true)
        ));

        let without_bias = Module::new("torch.nn.Linear")
            .with("weight", weight(&[1.0]))
            .with("bias", Value::None)
            .shared();
        let proxy = session.convert_module(&without_bias).unwrap();
        assert!(matches!(
            proxy.attribute("use_fused_matmul_bias").unwrap(),
            BackendValue::Bool(false)
        ));

        let conv = session
            .convert_module(&Module::new("torch.nn.Conv2d").shared())
            .unwrap();
        assert!(matches!(
            conv.attribute("channel_pos").unwrap(),
            BackendValue::Str(pos) if pos == "channels_last"
        ));

        let dropout = session
            .convert_module(&Module::new("torch.nn.Dropout").shared())
            .unwrap();
        assert!(matches!(
            dropout.attribute("generator").unwrap(),
            BackendValue::Generator(_)
        ));
    }

    #[test]
    fn test_fused_linear_toggle_off() {
        let session = session();
        let linear = Module::new("torch.nn.Linear")
            .with("bias", weight(&[0.5]))
            .shared();
        let proxy = session.convert_module(&linear).unwrap();
        assert!(matches!(
            proxy.attribute("use_fused_matmul_bias").unwrap(),
            BackendValue::Bool(false)
        ));
    }

    #[test]
    fn test_channel_pos_defaults_to_channels_first() {
        let session = session();
        let conv = session
            .convert_module(&Module::new("torch.nn.Conv2d").shared())
            .unwrap();
        assert!(matches!(
            conv.attribute("channel_pos").unwrap(),
            BackendValue::Str(pos) if pos == "channels_first"
        ));
    }

    #[test]
    fn test_plain_attributes_and_missing_ones() {
        let session = session();
        let module = Module::new("torch.nn.Dropout").with("p", 0.25).shared();
        let proxy = session.convert_module(&module).unwrap();
        assert!(matches!(proxy.attribute("p").unwrap(), BackendValue::Float(p) if p == 0.25));
        assert!(matches!(
            proxy.attribute("inplace"),
            Err(Error::AttributeNotFound { attribute, .. }) if attribute == "inplace"
        ));
        assert!(!proxy.has_attribute("inplace"));
    }

    #[test]
    fn test_unresolvable_class_fails_on_invoke() {
        let session = session();
        let proxy = session
            .convert_module(&Module::new("acme.Block").shared())
            .unwrap();
        let err = proxy.invoke(CallArgs::new()).unwrap_err();
        assert!(matches!(err, Error::NoBackendEquivalent(id) if id.as_str() == "acme.Block"));
    }

    #[test]
    fn test_extra_methods_dispatch() {
        let session = session();
        let class_id = EntityId::from("diffusers.models.attention_processor.Attention");
        session.manager().update_class_proxies(BTreeMap::from([(
            class_id.clone(),
            Arc::new(Attention {
                entity: "oneflow.Attention".into(),
            }) as Arc<dyn BackendClass>,
        )]));

        let root = Module::new("my.Block")
            .with("attn", Module::new(class_id).shared())
            .shared();
        let proxy = session.convert_module(&root).unwrap();
        let attn = proxy.descendant("attn").unwrap();
        let scores = attn.call_method("get_attention_scores", CallArgs::new()).unwrap();
        assert!(matches!(scores, BackendValue::Str(s) if s == "scores@attn"));
        assert!(matches!(
            attn.call_method("_conv_forward", CallArgs::positional([BackendValue::Int(4)]))
                .unwrap(),
            BackendValue::Int(4)
        ));
        assert!(matches!(
            attn.call_method("prepare_attention_mask", CallArgs::new()),
            Err(Error::AttributeNotFound { .. })
        ));
    }

    #[test]
    fn test_descendant_and_realize_tree() {
        let session = session();
        let inner = Module::container(
            "torch.nn.Sequential",
            vec![Value::module(Module::new("torch.nn.ReLU"))],
        );
        let root = Module::new("my.Net")
            .with("body", inner.shared())
            .with("scale", 2.0)
            .shared();
        let proxy = session.convert_module(&root).unwrap();
        let relu = proxy.descendant("body.0").unwrap();
        assert_eq!(relu.path(), "body.0");
        assert!(proxy.descendant("scale").is_err());

        let all = proxy.realize_tree().unwrap();
        let paths: Vec<_> = all.iter().map(|p| p.path().to_owned()).collect();
        assert_eq!(paths, vec!["", "body", "body.0"]);
    }

    #[test]
    fn test_released_session() {
        let proxy = {
            let session = session();
            session
                .convert_module(&Module::new("torch.nn.ReLU").shared())
                .unwrap()
        };
        assert!(matches!(proxy.session(), Err(Error::SessionReleased)));
        assert!(matches!(
            proxy.invoke(CallArgs::new()),
            Err(Error::SessionReleased)
        ));
    }

    #[test]
    fn test_install_class_binds_once() {
        let session = session();
        let proxy = session
            .convert_module(&Module::new("acme.Block").shared())
            .unwrap();
        assert!(proxy.resolved_class().is_none());
        assert!(proxy.install_class(Arc::new(Identity::with_entity("oneflow.nn.Identity"))));
        assert!(!proxy.install_class(Arc::new(Identity::with_entity("oneflow.Other"))));
        let out = proxy
            .invoke(CallArgs::positional([BackendValue::Int(1)]))
            .unwrap();
        assert!(matches!(out, BackendValue::Int(1)));
    }
}
